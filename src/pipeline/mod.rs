pub mod lifecycle;
pub mod orchestrator;
pub mod protocol;
pub mod queue;
pub mod runtime;
pub mod session;
pub mod throttle;
pub mod worker;

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use crossbeam_channel::{Receiver, RecvTimeoutError, unbounded};

use crate::{
    aggregator::{AggregatedState, ResultAggregator},
    config::PipelineConfig,
    error::DetectError,
    types::{FrameBuffer, ModelType},
};

// Re-exports for convenience
pub use lifecycle::SessionState;
pub use orchestrator::ModelResults;
pub use protocol::{WorkerEvent, WorkerRequest, WorkerStatus};
pub use queue::LatestFrameSlot;
pub use runtime::{WorkerHandle, spawn_worker};
pub use session::{InferenceSession, SessionFactory, SessionHandle};
pub use throttle::FrameThrottle;
pub use worker::WorkerCore;

/// Several workers plus the consumer-side fan-in of their events.
pub struct VisionPipeline {
    workers: Vec<WorkerHandle>,
    events: Receiver<WorkerEvent>,
    aggregator: ResultAggregator,
}

impl VisionPipeline {
    pub fn start(config: &PipelineConfig, factory: Arc<dyn SessionFactory>) -> Result<Self> {
        config.validate()?;
        let (event_tx, event_rx) = unbounded();
        let workers = config
            .workers
            .iter()
            .map(|worker| {
                spawn_worker(
                    worker,
                    config.worker_models(worker),
                    config.always_admit,
                    Arc::clone(&factory),
                    event_tx.clone(),
                )
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            workers,
            events: event_rx,
            aggregator: ResultAggregator::new(),
        })
    }

    pub fn workers(&self) -> &[WorkerHandle] {
        &self.workers
    }

    pub fn worker(&self, name: &str) -> Option<&WorkerHandle> {
        self.workers.iter().find(|worker| worker.name() == name)
    }

    pub fn worker_for(&self, model: ModelType) -> Option<&WorkerHandle> {
        self.workers.iter().find(|worker| worker.serves(model))
    }

    fn route(&self, model: ModelType) -> Result<&WorkerHandle, DetectError> {
        self.worker_for(model)
            .ok_or_else(|| DetectError::UnknownModel(model.to_string()))
    }

    /// `None` initializes every model of every worker.
    pub fn initialize(&self, model: Option<ModelType>) -> Result<(), DetectError> {
        match model {
            Some(model) => self.route(model)?.initialize(Some(model)),
            None => self
                .workers
                .iter()
                .try_for_each(|worker| worker.initialize(None)),
        }
    }

    pub fn cleanup(&self, model: Option<ModelType>) -> Result<(), DetectError> {
        match model {
            Some(model) => self.route(model)?.cleanup(Some(model)),
            None => self
                .workers
                .iter()
                .try_for_each(|worker| worker.cleanup(None)),
        }
    }

    /// Hands the frame to the worker serving its first requested model. A
    /// frame requesting nothing goes to the only worker, if there is one,
    /// and is refused otherwise.
    /// Requested models that worker does not serve come back as
    /// `UnknownModel` results.
    pub fn detect(&self, frame: FrameBuffer) -> Result<(), DetectError> {
        let worker = match frame.requested_models().first() {
            Some(model) => self.route(*model)?,
            None => match self.workers.as_slice() {
                [only] => only,
                workers => {
                    return Err(DetectError::NoModelRequested {
                        workers: workers.len(),
                    });
                }
            },
        };
        worker.detect(frame)
    }

    /// Hands the frame to a worker by name.
    pub fn submit(&self, worker: &str, frame: FrameBuffer) -> Result<(), DetectError> {
        self.worker(worker)
            .ok_or_else(|| DetectError::WorkerGone {
                worker: worker.to_string(),
            })?
            .detect(frame)
    }

    /// Applies every event already delivered. Returns how many there were.
    pub fn poll(&mut self) -> usize {
        let mut applied = 0;
        while let Ok(event) = self.events.try_recv() {
            self.aggregator.apply(&event);
            applied += 1;
        }
        applied
    }

    /// Waits for the next event, applies it and hands it back.
    pub fn next_event(&mut self, timeout: Duration) -> Option<WorkerEvent> {
        match self.events.recv_timeout(timeout) {
            Ok(event) => {
                self.aggregator.apply(&event);
                Some(event)
            }
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => {
                log::debug!("all workers have stopped");
                None
            }
        }
    }

    pub fn aggregator(&self) -> &ResultAggregator {
        &self.aggregator
    }

    pub fn state(&self) -> &AggregatedState {
        self.aggregator.state()
    }

    /// Cleans up and joins every worker, then applies their final events.
    pub fn shutdown(mut self) -> AggregatedState {
        for worker in self.workers.drain(..) {
            worker.shutdown();
        }
        self.poll();
        self.aggregator.snapshot()
    }
}
