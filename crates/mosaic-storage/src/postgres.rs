//! PostgreSQL implementation of `TaskStore`.
//!
//! Identities come from the `tasks` id sequence; a save allocates ids for
//! every unsaved node up front, then upserts the whole subtree in one
//! transaction. The upsert only touches structural columns, so accounting
//! written by the engine between ticks is never overwritten.

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use tracing::{debug, error, instrument};

use mosaic_core::{ExperimentId, SubmissionId, TaskId};
use mosaic_workflow::snapshot::TaskStatus;
use mosaic_workflow::task::{Task, TaskState};

use crate::rows::{assemble, status_tree, TaskRow};
use crate::store::{StoreError, Submission, TaskStore};

/// PostgreSQL implementation of [`TaskStore`]
#[derive(Clone)]
pub struct PostgresTaskStore {
    pool: PgPool,
}

impl PostgresTaskStore {
    /// Create a store from an existing connection pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to the database at `database_url`
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(Self { pool })
    }

    /// Apply pending schema migrations
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn allocate_ids(&self, count: usize) -> Result<Vec<TaskId>, StoreError> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(
            r#"
            SELECT nextval(pg_get_serial_sequence('tasks', 'id')) AS id
            FROM generate_series(1, $1)
            "#,
        )
        .bind(count as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(rows.iter().map(|row| row.get::<i64, _>("id")).collect())
    }

    async fn subtree_rows(&self, root_id: TaskId) -> Result<Vec<TaskRow>, StoreError> {
        let rows = sqlx::query(
            r#"
            WITH RECURSIVE subtree AS (
                SELECT * FROM tasks WHERE id = $1
                UNION ALL
                SELECT t.* FROM tasks t JOIN subtree s ON t.parent_id = s.id
            )
            SELECT id, name, "type", state, exitcode, "time", memory, cpu_time,
                   submission_id, parent_id, "position", data
            FROM subtree
            "#,
        )
        .bind(root_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("failed to load task subtree: {e}");
            StoreError::Database(e.to_string())
        })?;
        if rows.is_empty() {
            return Err(StoreError::TaskNotFound(root_id));
        }
        rows.iter()
            .map(|row| {
                let state: String = row.get("state");
                Ok(TaskRow {
                    id: row.get("id"),
                    name: row.get("name"),
                    task_type: row.get("type"),
                    state: TaskState::parse(&state)
                        .map_err(|e| StoreError::Serialization(e.to_string()))?,
                    exitcode: row.get("exitcode"),
                    time_secs: row.get("time"),
                    memory_mb: row.get("memory"),
                    cpu_time_secs: row.get("cpu_time"),
                    submission_id: row.get("submission_id"),
                    parent_id: row.get("parent_id"),
                    position: row.get("position"),
                    data: row.get("data"),
                })
            })
            .collect()
    }
}

fn assign_missing_ids(task: &mut Task, ids: &mut std::vec::IntoIter<TaskId>) {
    if task.data().persistent_id.is_none() {
        task.data_mut().persistent_id = ids.next();
    }
    if let Some(children) = task.children_mut() {
        for child in children {
            assign_missing_ids(child, ids);
        }
    }
}

fn count_unsaved(task: &Task) -> usize {
    let own = usize::from(task.data().persistent_id.is_none());
    own + task
        .children()
        .map(|children| children.iter().map(count_unsaved).sum())
        .unwrap_or(0)
}

fn flatten_rows(
    task: &Task,
    parent_id: Option<TaskId>,
    position: i32,
    out: &mut Vec<TaskRow>,
) -> Result<(), StoreError> {
    let row = TaskRow::from_task(task, parent_id, position)?;
    let id = row.id;
    out.push(row);
    if let Some(children) = task.children() {
        for (index, child) in children.iter().enumerate() {
            flatten_rows(child, Some(id), index as i32, out)?;
        }
    }
    Ok(())
}

fn collect_accounting(task: &Task, out: &mut Vec<(TaskId, TaskState, Option<i32>, Option<f64>, Option<f64>, Option<f64>)>) {
    if let Some(id) = task.data().persistent_id {
        let execution = &task.data().execution;
        out.push((
            id,
            execution.state,
            execution.exitcode,
            execution.duration_secs,
            execution.max_used_memory_mb,
            execution.used_cpu_time_secs,
        ));
    }
    if let Some(children) = task.children() {
        for child in children {
            collect_accounting(child, out);
        }
    }
}

#[async_trait]
impl TaskStore for PostgresTaskStore {
    #[instrument(skip(self, task), fields(task = task.name()))]
    async fn save(&self, task: &mut Task) -> Result<TaskId, StoreError> {
        let ids = self.allocate_ids(count_unsaved(task)).await?;
        assign_missing_ids(task, &mut ids.into_iter());

        let mut rows = Vec::new();
        flatten_rows(task, None, 0, &mut rows)?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        for row in &rows {
            sqlx::query(
                r#"
                INSERT INTO tasks
                    (id, name, "type", state, exitcode, "time", memory, cpu_time,
                     submission_id, parent_id, "position", data)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
                ON CONFLICT (id) DO UPDATE SET
                    name = EXCLUDED.name,
                    "type" = EXCLUDED."type",
                    submission_id = EXCLUDED.submission_id,
                    parent_id = EXCLUDED.parent_id,
                    "position" = EXCLUDED."position",
                    data = EXCLUDED.data
                "#,
            )
            .bind(row.id)
            .bind(&row.name)
            .bind(&row.task_type)
            .bind(row.state.to_string())
            .bind(row.exitcode)
            .bind(row.time_secs)
            .bind(row.memory_mb)
            .bind(row.cpu_time_secs)
            .bind(row.submission_id)
            .bind(row.parent_id)
            .bind(row.position)
            .bind(&row.data)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                error!("failed to save task {}: {e}", row.name);
                StoreError::Database(e.to_string())
            })?;
        }
        // Drop rows of children the driver replaced (e.g. the run
        // placeholder); the cascade removes their subtrees.
        let mut children_of: std::collections::HashMap<TaskId, Vec<TaskId>> =
            std::collections::HashMap::new();
        for row in &rows {
            if let Some(parent) = row.parent_id {
                children_of.entry(parent).or_default().push(row.id);
            }
        }
        for row in &rows {
            let kept = children_of.remove(&row.id).unwrap_or_default();
            sqlx::query(
                r#"
                DELETE FROM tasks WHERE parent_id = $1 AND id <> ALL($2)
                "#,
            )
            .bind(row.id)
            .bind(&kept)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        }
        tx.commit()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        let root_id = rows[0].id;
        debug!(root_id, n_tasks = rows.len(), "saved task tree");
        Ok(root_id)
    }

    #[instrument(skip(self))]
    async fn load(&self, task_id: TaskId) -> Result<Task, StoreError> {
        let rows = self.subtree_rows(task_id).await?;
        assemble(&rows, task_id)
    }

    #[instrument(skip(self, task), fields(task = task.name()))]
    async fn update_accounting(&self, task: &Task) -> Result<(), StoreError> {
        let mut records = Vec::new();
        collect_accounting(task, &mut records);
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        for (id, state, exitcode, time, memory, cpu_time) in records {
            sqlx::query(
                r#"
                UPDATE tasks
                SET state = $2, exitcode = $3, "time" = $4, memory = $5, cpu_time = $6
                WHERE id = $1
                "#,
            )
            .bind(id)
            .bind(state.to_string())
            .bind(exitcode)
            .bind(time)
            .bind(memory)
            .bind(cpu_time)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        }
        tx.commit()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    #[instrument(skip(self))]
    async fn task_status(&self, task_id: TaskId, depth: usize) -> Result<TaskStatus, StoreError> {
        let rows = self.subtree_rows(task_id).await?;
        status_tree(&rows, task_id, depth)
    }

    #[instrument(skip(self))]
    async fn register_submission(
        &self,
        experiment_id: ExperimentId,
        program: &str,
        user_name: &str,
    ) -> Result<SubmissionId, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO submissions (experiment_id, program, user_name)
            VALUES ($1, $2, $3)
            RETURNING id
            "#,
        )
        .bind(experiment_id)
        .bind(program)
        .bind(user_name)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            error!("failed to register submission: {e}");
            StoreError::Database(e.to_string())
        })?;
        let id: SubmissionId = row.get("id");
        debug!(submission_id = id, experiment_id, program, "registered submission");
        Ok(id)
    }

    #[instrument(skip(self))]
    async fn attach_root(
        &self,
        submission_id: SubmissionId,
        root_task_id: TaskId,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE submissions SET top_task_id = $2 WHERE id = $1
            "#,
        )
        .bind(submission_id)
        .bind(root_task_id)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::SubmissionNotFound(submission_id));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_submission(
        &self,
        submission_id: SubmissionId,
    ) -> Result<Submission, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, experiment_id, program, user_name, top_task_id, created_at
            FROM submissions
            WHERE id = $1
            "#,
        )
        .bind(submission_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?
        .ok_or(StoreError::SubmissionNotFound(submission_id))?;
        Ok(Submission {
            id: row.get("id"),
            experiment_id: row.get("experiment_id"),
            program: row.get("program"),
            user_name: row.get("user_name"),
            top_task_id: row.get("top_task_id"),
            created_at: row.get("created_at"),
        })
    }

    #[instrument(skip(self))]
    async fn most_recent_top_task(
        &self,
        experiment_id: ExperimentId,
        program: &str,
    ) -> Result<Option<TaskId>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT top_task_id
            FROM submissions
            WHERE experiment_id = $1 AND program = $2
            ORDER BY id DESC
            LIMIT 1
            "#,
        )
        .bind(experiment_id)
        .bind(program)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(row.and_then(|row| row.get::<Option<TaskId>, _>("top_task_id")))
    }

    #[instrument(skip(self))]
    async fn delete_submission(&self, submission_id: SubmissionId) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM submissions WHERE id = $1
            "#,
        )
        .bind(submission_id)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::SubmissionNotFound(submission_id));
        }
        Ok(())
    }
}
