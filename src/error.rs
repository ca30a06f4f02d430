//! Errors surfaced to consumers as part of worker events.

use thiserror::Error;

use crate::types::ModelType;

/// Every failure a worker reports. Carried inside events and stored in the
/// aggregated state, hence `Clone` and string reasons instead of sources.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum DetectError {
    /// Session construction failed; the model stays uninitialized and a
    /// fresh initialize request may retry.
    #[error("failed to initialize {model} session: {reason}")]
    Init { model: ModelType, reason: String },

    /// One detection cycle failed; the worker keeps running.
    #[error("{model} inference failed: {reason}")]
    Infer { model: ModelType, reason: String },

    /// Request for a session that was never initialized or has been cleaned up.
    #[error("{model} model not initialized")]
    NotInitialized { model: ModelType },

    /// Request names a model with no known configuration.
    #[error("unknown model type: {0}")]
    UnknownModel(String),

    /// The worker thread has exited and no longer accepts requests.
    #[error("worker {worker} is no longer running")]
    WorkerGone { worker: String },

    /// The worker is alive but did not answer in time.
    #[error("worker {worker} timed out after {waited_ms}ms")]
    Timeout { worker: String, waited_ms: u128 },

    /// A frame without requested models cannot be routed when several
    /// workers could take it.
    #[error("frame names no model and {workers} workers are running; request a model")]
    NoModelRequested { workers: usize },
}

impl DetectError {
    pub fn init(model: ModelType, err: &anyhow::Error) -> Self {
        Self::Init {
            model,
            reason: format!("{err:#}"),
        }
    }

    pub fn infer(model: ModelType, err: &anyhow::Error) -> Self {
        Self::Infer {
            model,
            reason: format!("{err:#}"),
        }
    }

    pub fn model(&self) -> Option<ModelType> {
        match self {
            DetectError::Init { model, .. }
            | DetectError::Infer { model, .. }
            | DetectError::NotInitialized { model } => Some(*model),
            DetectError::UnknownModel(_)
            | DetectError::WorkerGone { .. }
            | DetectError::Timeout { .. }
            | DetectError::NoModelRequested { .. } => None,
        }
    }

    /// Transient failures only cost the current cycle; consumers keep the
    /// previous value for the model.
    pub fn is_transient(&self) -> bool {
        matches!(self, DetectError::Infer { .. })
    }
}

#[cfg(test)]
mod tests {
    use anyhow::{Context, anyhow};

    use super::*;

    #[test]
    fn init_error_keeps_context_chain() {
        let err = Err::<(), _>(anyhow!("file not found"))
            .context("failed to load face model")
            .unwrap_err();
        let err = DetectError::init(ModelType::Face, &err);
        let text = err.to_string();
        assert!(text.contains("face"));
        assert!(text.contains("failed to load face model: file not found"));
        assert_eq!(err.model(), Some(ModelType::Face));
    }

    #[test]
    fn only_inference_failures_are_transient() {
        let infer = DetectError::infer(ModelType::Pose, &anyhow!("timeout"));
        assert!(infer.is_transient());
        assert!(!DetectError::NotInitialized {
            model: ModelType::Pose
        }
        .is_transient());
        assert!(!DetectError::UnknownModel("tail".into()).is_transient());
    }

    #[test]
    fn unknown_model_names_the_request() {
        let err = DetectError::UnknownModel("tail".into());
        assert_eq!(err.to_string(), "unknown model type: tail");
        assert_eq!(err.model(), None);
    }

    #[test]
    fn routing_errors_describe_what_went_wrong() {
        let timeout = DetectError::Timeout {
            worker: "face".into(),
            waited_ms: 250,
        };
        assert_eq!(timeout.to_string(), "worker face timed out after 250ms");
        assert_eq!(timeout.model(), None);

        let ambiguous = DetectError::NoModelRequested { workers: 2 };
        assert!(ambiguous.to_string().contains("request a model"));
    }
}
