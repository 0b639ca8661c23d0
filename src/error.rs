use std::sync::Arc;
use thiserror::Error;

/// Result type for dataflow pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Boxed error returned by destinations and user callbacks
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A fault cause shared by every channel it travels through
pub type FaultCause = Arc<PipelineError>;

/// Errors that can occur while building or running a pipeline
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Put on a channel that has already been completed
    #[error("Channel is closed")]
    ChannelClosed,

    /// Put or take on a channel that carries a fault
    #[error("Channel faulted: {0}")]
    ChannelFaulted(FaultCause),

    /// A single record could not be written by a destination
    #[error("Node '{node}' failed to write record: {source}")]
    RecordWrite {
        node: String,
        #[source]
        source: BoxError,
    },

    /// The destination's batch operation failed as a whole
    #[error("Node '{node}' failed to write batch: {source}")]
    BatchFatal {
        node: String,
        #[source]
        source: BoxError,
    },

    /// Configuration or resource-open failure before streaming began
    #[error("Setup of node '{node}' failed: {reason}")]
    Setup { node: String, reason: String },

    /// Named field access on a record failed
    #[error("Field not found: {field}")]
    FieldNotFound { field: String },

    /// A node reached the faulted state; raised by `run()` and `RunHandle::wait()`
    #[error("Node '{node}' faulted: {cause}")]
    NodeFaulted { node: String, cause: FaultCause },

    /// The streaming phase of a node panicked
    #[error("Node '{node}' panicked: {message}")]
    NodePanicked { node: String, message: String },

    /// Pipeline was built without nodes
    #[error("Cannot run pipeline with no nodes")]
    NoNodes,

    /// Stage execution error
    #[error("Stage execution failed: {0}")]
    StageError(String),

    /// Thread spawn or join error
    #[error("Thread error: {0}")]
    ThreadError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

impl PipelineError {
    /// Convert into a shareable fault cause.
    ///
    /// Faults that arrived from upstream keep their original cause instead of
    /// being wrapped again, so every downstream channel carries the same `Arc`.
    pub fn into_fault(self) -> FaultCause {
        match self {
            PipelineError::ChannelFaulted(cause) => cause,
            PipelineError::NodeFaulted { cause, .. } => cause,
            other => Arc::new(other),
        }
    }

    /// The innermost error behind any fault wrappers.
    pub fn root_cause(&self) -> &PipelineError {
        match self {
            PipelineError::ChannelFaulted(cause) => cause.root_cause(),
            PipelineError::NodeFaulted { cause, .. } => cause.root_cause(),
            other => other,
        }
    }

    /// Whether this error is attributable to a single record.
    pub fn is_record_level(&self) -> bool {
        matches!(self.root_cause(), PipelineError::RecordWrite { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_into_fault_reuses_upstream_cause() {
        let cause: FaultCause = Arc::new(PipelineError::StageError("boom".into()));
        let err = PipelineError::ChannelFaulted(Arc::clone(&cause));
        assert!(Arc::ptr_eq(&err.into_fault(), &cause));
    }

    #[test]
    fn test_root_cause_unwraps_wrappers() {
        let cause: FaultCause = Arc::new(PipelineError::RecordWrite {
            node: "sink".into(),
            source: "bad row".into(),
        });
        let err = PipelineError::NodeFaulted {
            node: "sink".into(),
            cause: Arc::new(PipelineError::ChannelFaulted(cause)),
        };
        assert!(err.is_record_level());
        assert!(matches!(err.root_cause(), PipelineError::RecordWrite { node, .. } if node == "sink"));
    }
}
