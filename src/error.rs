//! Error types surfaced by the model controller.

use std::time::Duration;

use crate::model::descriptor::DescriptorError;
use crate::store::StoreError;

/// Errors returned by [`crate::Model`] operations.
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("unknown optics '{0}'")]
    UnknownOptics(String),
    #[error("unknown knob '{0}'")]
    UnknownKnob(String),
    #[error("knob '{knob}' cannot be scaled by {scale}")]
    InvalidKnobScale { knob: String, scale: f64 },
    #[error("unknown sequence '{0}'")]
    UnknownSequence(String),
    #[error("'{range}' is not a valid range name for sequence '{sequence}', available ranges: {available:?}")]
    UnknownRange {
        sequence: String,
        range: String,
        available: Vec<String>,
    },
    #[error(transparent)]
    Descriptor(#[from] DescriptorError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("failed to spawn worker: {0}")]
    Spawn(#[source] std::io::Error),
    /// The worker exited, crashed, sent garbage or stopped answering.
    #[error("worker unavailable: {0}")]
    WorkerUnavailable(String),
    #[error("unexpected response to {command}: got {got}")]
    UnexpectedResponse {
        command: &'static str,
        got: &'static str,
    },
    /// The worker did not exit within the teardown bound. It was not killed.
    #[error("worker did not exit within {0:?} after Terminate")]
    CleanupTimeout(Duration),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl ModelError {
    /// Lookup errors detected before the worker is contacted.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            ModelError::UnknownOptics(_)
                | ModelError::UnknownKnob(_)
                | ModelError::InvalidKnobScale { .. }
                | ModelError::UnknownSequence(_)
                | ModelError::UnknownRange { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configuration_classification() {
        assert!(ModelError::UnknownOptics("x".into()).is_configuration());
        assert!(ModelError::UnknownRange {
            sequence: "s1".into(),
            range: "r".into(),
            available: vec![],
        }
        .is_configuration());
        assert!(!ModelError::WorkerUnavailable("gone".into()).is_configuration());
        assert!(!ModelError::CleanupTimeout(Duration::from_secs(5)).is_configuration());
    }
}
