//! Error taxonomy shared across the orchestrator.
//!
//! The kinds mirror where a failure is detected: `Description` errors are
//! raised synchronously at submit time and never create a submission;
//! `Transition` errors terminate the owning task collection; the remaining
//! kinds fail an individual leaf job and propagate through abort-on-error.

/// Error type for workflow construction and execution
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    /// Invalid user-provided workflow description
    #[error("invalid workflow description: {0}")]
    Description(String),

    /// The driver detected an impossible phase or stage transition
    #[error("invalid workflow transition: {0}")]
    Transition(String),

    /// A batch file is missing or its contents are unusable
    #[error("invalid job description: {0}")]
    JobDescription(String),

    /// Step-specific metadata preconditions violated by upstream data
    #[error("metadata error: {0}")]
    Metadata(String),

    /// Persisted data violates a step-specific integrity constraint
    #[error("data integrity error: {0}")]
    DataIntegrity(String),

    /// Underlying filesystem failure
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Batch file (de)serialization failure
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl WorkflowError {
    /// Create a description error
    pub fn description(message: impl Into<String>) -> Self {
        Self::Description(message.into())
    }

    /// Create a transition error
    pub fn transition(message: impl Into<String>) -> Self {
        Self::Transition(message.into())
    }

    /// Create a job description error
    pub fn job_description(message: impl Into<String>) -> Self {
        Self::JobDescription(message.into())
    }
}
