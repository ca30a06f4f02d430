//! The worker state machine, free of threads and channels.
//!
//! [`WorkerCore`] consumes requests and job completions and answers with a
//! [`Step`]: events to publish and jobs to run. The runtime executes jobs on
//! its inference pool and feeds their [`Completion`] back, so the core never
//! blocks and can be driven synchronously in tests.

use std::{
    collections::{BTreeMap, BTreeSet, VecDeque},
    panic::{self, AssertUnwindSafe},
};

use crate::{
    config::ModelConfig,
    error::DetectError,
    types::{FrameBuffer, ModelType},
};

use super::{
    lifecycle::{InitStep, ModelSlot, SessionState},
    orchestrator::{DetectionJob, DetectionOutcome, ModelResults, admit_models},
    protocol::{WorkerEvent, WorkerRequest, WorkerStatus},
    queue::LatestFrameSlot,
    session::{SessionFactory, SessionHandle, panic_detail},
    throttle::FrameThrottle,
};

/// Work that may block, handed to the inference pool.
#[derive(Debug)]
pub enum Job {
    Initialize { model: ModelType, config: ModelConfig },
    Detect(DetectionJob),
}

impl Job {
    /// Always yields a completion. A panic escaping the frame's image
    /// callbacks is reported as an inference failure for every lent model,
    /// whose sessions are then lost.
    pub fn run(self, factory: &dyn SessionFactory) -> Completion {
        match self {
            Job::Initialize { model, config } => {
                log::info!("initializing {model} session");
                let outcome = SessionHandle::open(factory, model, &config);
                Completion::Initialized { model, outcome }
            }
            Job::Detect(job) => {
                let timestamp_ms = job.timestamp_ms();
                let models = job.models();
                match panic::catch_unwind(AssertUnwindSafe(|| job.run())) {
                    Ok(outcome) => Completion::Detected(outcome),
                    Err(payload) => {
                        let reason =
                            format!("detection panicked: {}", panic_detail(payload.as_ref()));
                        log::error!("frame at {timestamp_ms:.1}ms: {reason}");
                        let results = models
                            .into_iter()
                            .map(|model| {
                                let err = DetectError::Infer {
                                    model,
                                    reason: reason.clone(),
                                };
                                (model, Err(err))
                            })
                            .collect();
                        Completion::Detected(DetectionOutcome {
                            timestamp_ms,
                            results,
                            sessions: Vec::new(),
                        })
                    }
                }
            }
        }
    }
}

#[derive(Debug)]
pub enum Completion {
    Initialized {
        model: ModelType,
        outcome: Result<SessionHandle, DetectError>,
    },
    Detected(DetectionOutcome),
}

/// A request held back until the cleanups queued ahead of it have run.
#[derive(Debug)]
enum Deferred {
    Cleanup(Option<ModelType>),
    Initialize {
        model: Option<ModelType>,
        config: Option<ModelConfig>,
    },
}

#[derive(Debug, Default)]
pub struct Step {
    pub events: Vec<WorkerEvent>,
    pub jobs: Vec<Job>,
}

pub struct WorkerCore {
    name: String,
    slots: BTreeMap<ModelType, ModelSlot>,
    queue: LatestFrameSlot,
    throttle: FrameThrottle,
    detecting: bool,
    /// Always starts with a cleanup that is waiting for in-flight work.
    deferred: VecDeque<Deferred>,
}

impl WorkerCore {
    pub fn new(
        name: impl Into<String>,
        models: BTreeMap<ModelType, ModelConfig>,
        always_admit: ModelType,
    ) -> Self {
        let throttle = FrameThrottle::with_intervals(
            always_admit,
            models.iter().map(|(model, config)| (*model, config.skip_every)),
        );
        let slots = models
            .into_iter()
            .map(|(model, config)| (model, ModelSlot::new(model, config)))
            .collect();
        Self {
            name: name.into(),
            slots,
            queue: LatestFrameSlot::new(),
            throttle,
            detecting: false,
            deferred: VecDeque::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn models(&self) -> impl Iterator<Item = ModelType> + '_ {
        self.slots.keys().copied()
    }

    pub fn status(&self) -> WorkerStatus {
        WorkerStatus {
            worker: self.name.clone(),
            sessions: self
                .slots
                .iter()
                .map(|(model, slot)| (*model, slot.state()))
                .collect(),
            detecting: self.detecting,
            queued: self.queue.peek_timestamp(),
            evicted_frames: self.queue.evicted_count(),
            pending_cleanups: self
                .deferred
                .iter()
                .filter(|request| matches!(request, Deferred::Cleanup(_)))
                .count(),
        }
    }

    /// Nothing in flight and nothing waiting on an in-flight transition.
    pub fn is_idle(&self) -> bool {
        !self.detecting
            && self.deferred.is_empty()
            && !self
                .slots
                .values()
                .any(|slot| slot.state() == SessionState::Initializing)
    }

    pub fn handle(&mut self, request: WorkerRequest) -> Step {
        let mut step = Step::default();
        match request {
            WorkerRequest::Initialize { model, config } => {
                if self.deferred.is_empty() {
                    self.initialize(model, config, &mut step);
                } else {
                    log::debug!("{}: initialize queued behind pending cleanup", self.name);
                    self.deferred.push_back(Deferred::Initialize { model, config });
                }
            }
            WorkerRequest::Detect { frame } => {
                self.accept_frame(frame, &mut step);
                self.pump(&mut step);
            }
            WorkerRequest::Cleanup { model } => {
                self.deferred.push_back(Deferred::Cleanup(model));
                self.pump(&mut step);
            }
            WorkerRequest::Status { reply } => {
                if reply.send(self.status()).is_err() {
                    log::trace!("{}: status requester went away", self.name);
                }
            }
        }
        step
    }

    pub fn complete(&mut self, completion: Completion) -> Step {
        let mut step = Step::default();
        match completion {
            Completion::Initialized { model, outcome } => {
                let result = match self.slots.get_mut(&model) {
                    Some(slot) => slot.finish_initialize(outcome),
                    None => Err(DetectError::UnknownModel(model.to_string())),
                };
                match &result {
                    Ok(()) => {
                        self.throttle.reset(model);
                        log::info!("{}: {model} session ready", self.name);
                    }
                    Err(err) => log::error!("{}: {err}", self.name),
                }
                step.events.push(WorkerEvent::Initialized {
                    worker: self.name.clone(),
                    model,
                    result,
                });
            }
            Completion::Detected(outcome) => {
                self.detecting = false;
                let DetectionOutcome {
                    timestamp_ms,
                    results,
                    sessions,
                } = outcome;
                for handle in sessions {
                    match self.slots.get_mut(&handle.model()) {
                        Some(slot) => slot.restore(handle),
                        None => drop(handle),
                    }
                }
                // Only one detection runs at a time, so anything still
                // Detecting was lent to this job and never came back.
                for (model, slot) in &mut self.slots {
                    if slot.state() == SessionState::Detecting {
                        slot.abandon();
                        self.throttle.reset(*model);
                    }
                }
                step.events.push(WorkerEvent::Detection {
                    worker: self.name.clone(),
                    timestamp_ms,
                    results,
                });
            }
        }
        self.pump(&mut step);
        step
    }

    /// Convenience for owners tearing the worker down.
    pub fn shutdown(&mut self) -> Step {
        self.handle(WorkerRequest::Cleanup { model: None })
    }

    fn initialize(&mut self, model: Option<ModelType>, config: Option<ModelConfig>, step: &mut Step) {
        let targets: Vec<ModelType> = match model {
            Some(model) => vec![model],
            None => {
                if config.is_some() {
                    log::warn!("{}: options ignored for initialize-all", self.name);
                }
                self.slots.keys().copied().collect()
            }
        };
        let config = if model.is_some() { config } else { None };

        for model in targets {
            let Some(slot) = self.slots.get_mut(&model) else {
                log::warn!("{}: initialize for unserved model {model}", self.name);
                step.events.push(WorkerEvent::Initialized {
                    worker: self.name.clone(),
                    model,
                    result: Err(DetectError::UnknownModel(model.to_string())),
                });
                continue;
            };
            match slot.begin_initialize(config.clone()) {
                InitStep::Start => step.jobs.push(Job::Initialize {
                    model,
                    config: slot.config().clone(),
                }),
                InitStep::AlreadyReady => {
                    log::debug!("{}: {model} already initialized", self.name);
                    step.events.push(WorkerEvent::Initialized {
                        worker: self.name.clone(),
                        model,
                        result: Ok(()),
                    });
                }
                InitStep::InProgress => {
                    log::debug!("{}: {model} already initializing", self.name);
                }
            }
        }
    }

    fn requested(&self, frame: &FrameBuffer) -> BTreeSet<ModelType> {
        if frame.requested_models().is_empty() {
            self.slots.keys().copied().collect()
        } else {
            frame.requested_models().clone()
        }
    }

    /// Rejects what can be rejected up front, queues the rest.
    fn accept_frame(&mut self, frame: FrameBuffer, step: &mut Step) {
        let timestamp_ms = frame.timestamp_ms();
        let mut rejected = ModelResults::new();
        let mut not_ready = Vec::new();
        let mut any_live = false;

        for model in self.requested(&frame) {
            match self.slots.get(&model) {
                None => {
                    rejected.insert(model, Err(DetectError::UnknownModel(model.to_string())));
                }
                Some(slot) if slot.is_live() => any_live = true,
                Some(_) => not_ready.push(model),
            }
        }

        if any_live {
            if !not_ready.is_empty() {
                log::debug!(
                    "{}: {not_ready:?} not ready, skipped for frame at {timestamp_ms:.1}ms",
                    self.name
                );
            }
        } else {
            for model in not_ready {
                rejected.insert(model, Err(DetectError::NotInitialized { model }));
            }
        }

        if !rejected.is_empty() {
            log::warn!(
                "{}: rejecting frame at {timestamp_ms:.1}ms for {:?}",
                self.name,
                rejected.keys().collect::<Vec<_>>()
            );
            step.events.push(WorkerEvent::Detection {
                worker: self.name.clone(),
                timestamp_ms,
                results: rejected,
            });
        }

        if any_live {
            self.queue.enqueue(frame);
        } else {
            frame.release();
        }
    }

    /// Runs due cleanups and the requests queued behind them, then
    /// dispatches the queued frame if nothing is in flight. A pending
    /// cleanup holds back dispatch.
    fn pump(&mut self, step: &mut Step) {
        if self.detecting {
            return;
        }
        self.run_deferred(step);
        if !self.deferred.is_empty() {
            return;
        }

        while let Some(frame) = self.queue.dequeue_latest() {
            let requested = self.requested(&frame);
            let admitted = admit_models(&requested, &self.slots, &mut self.throttle);
            if admitted.is_empty() {
                log::trace!(
                    "{}: frame at {:.1}ms throttled for every model",
                    self.name,
                    frame.timestamp_ms()
                );
                frame.release();
                continue;
            }

            let sessions: Vec<SessionHandle> = admitted
                .iter()
                .filter_map(|model| self.slots.get_mut(model).and_then(ModelSlot::lend))
                .collect();
            log::trace!(
                "{}: dispatching frame at {:.1}ms to {admitted:?}",
                self.name,
                frame.timestamp_ms()
            );
            self.detecting = true;
            step.jobs.push(Job::Detect(DetectionJob::new(frame, sessions)));
            break;
        }
    }

    fn run_deferred(&mut self, step: &mut Step) {
        while let Some(request) = self.deferred.pop_front() {
            let target = match request {
                Deferred::Cleanup(target) => target,
                Deferred::Initialize { model, config } => {
                    self.initialize(model, config, step);
                    continue;
                }
            };
            let blocked = match target {
                Some(model) => self.slots.get(&model).is_some_and(ModelSlot::is_busy),
                None => self.slots.values().any(ModelSlot::is_busy),
            };
            if blocked {
                log::debug!("{}: cleanup waiting for in-flight work", self.name);
                self.deferred.push_front(Deferred::Cleanup(target));
                break;
            }
            let result = self.cleanup_now(target);
            if let Err(err) = &result {
                log::warn!("{}: cleanup failed: {err}", self.name);
            }
            step.events.push(WorkerEvent::Cleaned {
                worker: self.name.clone(),
                model: target,
                result,
            });
        }
    }

    fn cleanup_now(&mut self, target: Option<ModelType>) -> Result<(), DetectError> {
        match target {
            Some(model) => {
                let slot = self
                    .slots
                    .get_mut(&model)
                    .ok_or_else(|| DetectError::UnknownModel(model.to_string()))?;
                if !slot.is_live() {
                    return Err(DetectError::NotInitialized { model });
                }
                slot.terminate();
                self.throttle.reset(model);
                log::info!("{}: {model} session cleaned up", self.name);

                if !self.slots.values().any(ModelSlot::is_live) {
                    self.queue.drain();
                }
                Ok(())
            }
            None => {
                for (model, slot) in &mut self.slots {
                    slot.terminate();
                    self.throttle.reset(*model);
                }
                let drained = self.queue.drain();
                log::info!(
                    "{}: all sessions cleaned up, {drained} queued frame(s) released",
                    self.name
                );
                Ok(())
            }
        }
    }
}
