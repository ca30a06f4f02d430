//! Messages exchanged between a worker and its owner.

use std::collections::BTreeMap;

use crossbeam_channel::Sender;

use crate::{
    config::ModelConfig,
    error::DetectError,
    types::{DetectionResult, FrameBuffer, ModelType},
};

use super::{lifecycle::SessionState, orchestrator::ModelResults};

/// Inbound request. Requests take effect in arrival order: an initialize
/// that arrives behind a cleanup still waiting on in-flight work is held
/// until that cleanup has run.
#[derive(Debug)]
pub enum WorkerRequest {
    /// `model: None` initializes every model the worker serves. `config`
    /// replaces the stored options of a single model before it is built.
    Initialize {
        model: Option<ModelType>,
        config: Option<ModelConfig>,
    },
    /// Ownership of the frame moves to the worker.
    Detect { frame: FrameBuffer },
    /// `model: None` disposes every session and drains the queue.
    Cleanup { model: Option<ModelType> },
    /// Answered with a snapshot of the worker's state, in request order.
    Status { reply: Sender<WorkerStatus> },
}

/// Outbound event.
#[derive(Clone, Debug, PartialEq)]
pub enum WorkerEvent {
    Initialized {
        worker: String,
        model: ModelType,
        result: Result<(), DetectError>,
    },
    /// One entry per model that processed (or rejected) the frame.
    Detection {
        worker: String,
        timestamp_ms: f64,
        results: ModelResults,
    },
    Cleaned {
        worker: String,
        model: Option<ModelType>,
        result: Result<(), DetectError>,
    },
}

impl WorkerEvent {
    pub fn worker(&self) -> &str {
        match self {
            WorkerEvent::Initialized { worker, .. }
            | WorkerEvent::Detection { worker, .. }
            | WorkerEvent::Cleaned { worker, .. } => worker,
        }
    }

    /// Flattens a detection event into per-model results. Empty for other events.
    pub fn detection_results(&self) -> Vec<DetectionResult> {
        let WorkerEvent::Detection {
            timestamp_ms,
            results,
            ..
        } = self
        else {
            return Vec::new();
        };
        results
            .iter()
            .map(|(model, outcome)| DetectionResult {
                model: *model,
                timestamp_ms: *timestamp_ms,
                outcome: outcome.clone(),
            })
            .collect()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct WorkerStatus {
    pub worker: String,
    pub sessions: BTreeMap<ModelType, SessionState>,
    pub detecting: bool,
    /// Timestamp of the queued frame, if one is waiting.
    pub queued: Option<f64>,
    pub evicted_frames: u64,
    pub pending_cleanups: usize,
}

impl WorkerStatus {
    pub fn state(&self, model: ModelType) -> Option<SessionState> {
        self.sessions.get(&model).copied()
    }
}
