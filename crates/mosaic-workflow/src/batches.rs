//! Batch descriptors and their on-disk JSON representation.
//!
//! The init phase of a step writes one batch file per run job plus at most
//! one collect batch under `<workflow_root>/<step_name>/batches/`. Paths
//! inside a batch are stored relative to the workflow root and joined with
//! it again on read, so a workflow directory can be relocated between
//! submission and execution.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use mosaic_core::WorkflowError;

/// Input or output entry of a batch: a list of paths or a labeled map of
/// path lists
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IoEntry {
    Paths(Vec<String>),
    Nested(BTreeMap<String, Vec<String>>),
}

impl IoEntry {
    fn map_paths(&mut self, f: &impl Fn(&str) -> Result<String, WorkflowError>) -> Result<(), WorkflowError> {
        match self {
            Self::Paths(paths) => {
                for path in paths.iter_mut() {
                    *path = f(path)?;
                }
            }
            Self::Nested(groups) => {
                for paths in groups.values_mut() {
                    for path in paths.iter_mut() {
                        *path = f(path)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// All paths of the entry, flattened
    pub fn paths(&self) -> Vec<&str> {
        match self {
            Self::Paths(paths) => paths.iter().map(String::as_str).collect(),
            Self::Nested(groups) => groups
                .values()
                .flat_map(|paths| paths.iter().map(String::as_str))
                .collect(),
        }
    }
}

/// Labeled inputs or outputs of a batch
pub type BatchIo = BTreeMap<String, IoEntry>;

/// Description of a single run job, produced by the init phase
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunBatch {
    /// One-based identifier, unique within the run phase
    pub id: u32,

    /// Sub-phase index for steps with multiple run collections
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<u32>,

    pub inputs: BatchIo,
    pub outputs: BatchIo,

    /// Step-specific fields, passed through verbatim
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Description of the collect job, produced by the init phase
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectBatch {
    pub inputs: BatchIo,
    pub outputs: BatchIo,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Everything the init phase of a step produced
#[derive(Debug, Clone, Default)]
pub struct BatchSet {
    pub run: Vec<RunBatch>,
    pub collect: Option<CollectBatch>,
}

/// Directory layout of a single step below the workflow root
#[derive(Debug, Clone)]
pub struct StepLayout {
    workflow_root: PathBuf,
    step_name: String,
}

impl StepLayout {
    pub fn new(workflow_root: impl Into<PathBuf>, step_name: impl Into<String>) -> Self {
        Self {
            workflow_root: workflow_root.into(),
            step_name: step_name.into(),
        }
    }

    pub fn workflow_root(&self) -> &Path {
        &self.workflow_root
    }

    pub fn step_name(&self) -> &str {
        &self.step_name
    }

    /// `<workflow_root>/<step_name>`
    pub fn step_location(&self) -> PathBuf {
        self.workflow_root.join(&self.step_name)
    }

    /// `<workflow_root>/<step_name>/batches`
    pub fn batches_location(&self) -> PathBuf {
        self.step_location().join("batches")
    }

    /// `<workflow_root>/<step_name>/log`
    pub fn log_location(&self) -> PathBuf {
        self.step_location().join("log")
    }

    /// Create the step's directories if they do not exist yet
    pub fn ensure_directories(&self) -> Result<(), WorkflowError> {
        std::fs::create_dir_all(self.batches_location())?;
        std::fs::create_dir_all(self.log_location())?;
        Ok(())
    }

    /// File holding the description of one run job
    pub fn run_batch_file(&self, job_id: u32) -> PathBuf {
        self.batches_location()
            .join(format!("{}_run_{:06}.batch.json", self.step_name, job_id))
    }

    /// File holding the description of the collect job
    pub fn collect_batch_file(&self) -> PathBuf {
        self.batches_location()
            .join(format!("{}_collect.batch.json", self.step_name))
    }
}

/// Write all batch files of a step
///
/// Absolute paths under the workflow root are relativized; absolute paths
/// outside of it are rejected.
pub fn write_batch_set(layout: &StepLayout, batches: &BatchSet) -> Result<(), WorkflowError> {
    layout.ensure_directories()?;
    for batch in &batches.run {
        let mut batch = batch.clone();
        relativize(&mut batch.inputs, layout.workflow_root())?;
        relativize(&mut batch.outputs, layout.workflow_root())?;
        let file = layout.run_batch_file(batch.id);
        std::fs::write(&file, serde_json::to_vec_pretty(&batch)?)?;
    }
    if let Some(collect) = &batches.collect {
        let mut collect = collect.clone();
        relativize(&mut collect.inputs, layout.workflow_root())?;
        relativize(&mut collect.outputs, layout.workflow_root())?;
        std::fs::write(layout.collect_batch_file(), serde_json::to_vec_pretty(&collect)?)?;
    }
    Ok(())
}

/// Read all run batches of a step, sorted by job id
pub fn read_run_batches(layout: &StepLayout) -> Result<Vec<RunBatch>, WorkflowError> {
    let suffix = ".batch.json";
    let prefix = format!("{}_run_", layout.step_name());
    let directory = layout.batches_location();
    let entries = std::fs::read_dir(&directory).map_err(|_| {
        WorkflowError::job_description(format!(
            "batch directory {} does not exist; initialize the step first",
            directory.display()
        ))
    })?;
    let mut batches = Vec::new();
    for entry in entries.flatten() {
        let file_name = entry.file_name();
        let Some(name) = file_name.to_str() else {
            continue;
        };
        if name.starts_with(&prefix) && name.ends_with(suffix) {
            batches.push(read_run_batch_file(layout, &entry.path())?);
        }
    }
    batches.sort_by_key(|batch| batch.id);
    Ok(batches)
}

/// Read the run batch with the given job id
pub fn read_run_batch(layout: &StepLayout, job_id: u32) -> Result<RunBatch, WorkflowError> {
    let file = layout.run_batch_file(job_id);
    if !file.exists() {
        return Err(WorkflowError::job_description(format!(
            "batch file {} does not exist; initialize the step first",
            file.display()
        )));
    }
    read_run_batch_file(layout, &file)
}

fn read_run_batch_file(layout: &StepLayout, file: &Path) -> Result<RunBatch, WorkflowError> {
    let contents = std::fs::read(file)?;
    let mut batch: RunBatch = serde_json::from_slice(&contents)?;
    absolutize(&mut batch.inputs, layout.workflow_root());
    absolutize(&mut batch.outputs, layout.workflow_root());
    Ok(batch)
}

/// Read the collect batch of a step
pub fn read_collect_batch(layout: &StepLayout) -> Result<CollectBatch, WorkflowError> {
    let file = layout.collect_batch_file();
    if !file.exists() {
        return Err(WorkflowError::job_description(format!(
            "collect batch file {} does not exist; initialize the step first",
            file.display()
        )));
    }
    let contents = std::fs::read(&file)?;
    let mut batch: CollectBatch = serde_json::from_slice(&contents)?;
    absolutize(&mut batch.inputs, layout.workflow_root());
    absolutize(&mut batch.outputs, layout.workflow_root());
    Ok(batch)
}

/// Remove every batch file of a step
///
/// Called on behalf of `delete_previous_job_output` so re-runs start from a
/// clean phase directory.
pub fn delete_batch_files(layout: &StepLayout) -> Result<(), WorkflowError> {
    let directory = layout.batches_location();
    if !directory.exists() {
        return Ok(());
    }
    for entry in std::fs::read_dir(&directory)?.flatten() {
        let path = entry.path();
        if path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.ends_with(".batch.json"))
        {
            std::fs::remove_file(path)?;
        }
    }
    Ok(())
}

fn relativize(io: &mut BatchIo, root: &Path) -> Result<(), WorkflowError> {
    for entry in io.values_mut() {
        entry.map_paths(&|path: &str| {
            let candidate = Path::new(path);
            if candidate.is_relative() {
                return Ok(path.to_string());
            }
            match candidate.strip_prefix(root) {
                Ok(relative) => Ok(relative.to_string_lossy().into_owned()),
                Err(_) => Err(WorkflowError::job_description(format!(
                    "path {path} lies outside of the workflow root {}",
                    root.display()
                ))),
            }
        })?;
    }
    Ok(())
}

fn absolutize(io: &mut BatchIo, root: &Path) {
    for entry in io.values_mut() {
        // Stored paths are always relative, so joining cannot fail.
        let _ = entry.map_paths(&|path: &str| {
            Ok(root.join(path).to_string_lossy().into_owned())
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_batch(id: u32) -> RunBatch {
        let mut inputs = BatchIo::new();
        inputs.insert(
            "images".into(),
            IoEntry::Paths(vec!["acquisitions/site_000.png".into()]),
        );
        let mut outputs = BatchIo::new();
        outputs.insert(
            "tiles".into(),
            IoEntry::Nested(BTreeMap::from([(
                "level_0".into(),
                vec![format!("tiles/tile_{id:03}.png")],
            )])),
        );
        let mut extra = Map::new();
        extra.insert("bit_depth".into(), json!(16));
        RunBatch {
            id,
            index: None,
            inputs,
            outputs,
            extra,
        }
    }

    #[test]
    fn test_write_and_read_roundtrip_absolutizes_paths() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StepLayout::new(dir.path(), "tiling");
        let batches = BatchSet {
            run: vec![sample_batch(1), sample_batch(2)],
            collect: Some(CollectBatch {
                inputs: BatchIo::new(),
                outputs: BatchIo::new(),
                extra: Map::new(),
            }),
        };
        write_batch_set(&layout, &batches).unwrap();

        assert!(layout.run_batch_file(1).exists());
        assert!(layout.run_batch_file(2).exists());
        assert!(layout.collect_batch_file().exists());

        let loaded = read_run_batches(&layout).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].id, 1);
        let input_paths = loaded[0].inputs["images"].paths();
        assert_eq!(
            input_paths[0],
            dir.path().join("acquisitions/site_000.png").to_string_lossy()
        );
        assert_eq!(loaded[0].extra["bit_depth"], json!(16));

        read_collect_batch(&layout).unwrap();
    }

    #[test]
    fn test_absolute_paths_under_root_are_relativized() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StepLayout::new(dir.path(), "tiling");
        let mut batch = sample_batch(1);
        batch.inputs.insert(
            "images".into(),
            IoEntry::Paths(vec![dir
                .path()
                .join("acquisitions/site_001.png")
                .to_string_lossy()
                .into_owned()]),
        );
        write_batch_set(
            &layout,
            &BatchSet {
                run: vec![batch],
                collect: None,
            },
        )
        .unwrap();

        let raw = std::fs::read_to_string(layout.run_batch_file(1)).unwrap();
        assert!(raw.contains("acquisitions/site_001.png"));
        assert!(!raw.contains(&dir.path().to_string_lossy().into_owned()));
    }

    #[test]
    fn test_absolute_path_outside_root_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StepLayout::new(dir.path(), "tiling");
        let mut batch = sample_batch(1);
        batch
            .inputs
            .insert("images".into(), IoEntry::Paths(vec!["/etc/passwd".into()]));
        let result = write_batch_set(
            &layout,
            &BatchSet {
                run: vec![batch],
                collect: None,
            },
        );
        assert!(matches!(result, Err(WorkflowError::JobDescription(_))));
    }

    #[test]
    fn test_missing_batches_directory_is_a_job_description_error() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StepLayout::new(dir.path(), "tiling");
        assert!(matches!(
            read_run_batches(&layout),
            Err(WorkflowError::JobDescription(_))
        ));
        assert!(matches!(
            read_run_batch(&layout, 1),
            Err(WorkflowError::JobDescription(_))
        ));
        assert!(matches!(
            read_collect_batch(&layout),
            Err(WorkflowError::JobDescription(_))
        ));
    }

    #[test]
    fn test_delete_batch_files_clears_directory() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StepLayout::new(dir.path(), "tiling");
        write_batch_set(
            &layout,
            &BatchSet {
                run: vec![sample_batch(1)],
                collect: None,
            },
        )
        .unwrap();
        delete_batch_files(&layout).unwrap();
        assert!(read_run_batches(&layout).unwrap().is_empty());
    }

    #[test]
    fn test_collect_batch_has_no_id_field() {
        let collect = CollectBatch {
            inputs: BatchIo::new(),
            outputs: BatchIo::new(),
            extra: Map::new(),
        };
        let value = serde_json::to_value(&collect).unwrap();
        assert!(value.get("id").is_none());
    }
}
