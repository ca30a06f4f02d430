//! Threaded host for a [`WorkerCore`].
//!
//! Each worker gets one actor thread that owns the core and a private rayon
//! pool for inference. The actor multiplexes the request inbox with job
//! completions, so requests keep being handled while a detection runs.

use std::{
    collections::BTreeMap,
    sync::Arc,
    thread,
    time::Duration,
};

use anyhow::{Context, Result};
use crossbeam_channel::{
    Receiver, RecvTimeoutError, Sender, bounded, never, select, unbounded,
};

use crate::{
    config::{ModelConfig, WorkerConfig},
    error::DetectError,
    types::{FrameBuffer, ModelType},
};

use super::{
    protocol::{WorkerEvent, WorkerRequest, WorkerStatus},
    session::{SessionFactory, panic_detail},
    worker::{Completion, Step, WorkerCore},
};

/// Owner's side of a running worker. Dropping it closes the inbox, which
/// cleans up every session, and joins the thread.
#[derive(Debug)]
pub struct WorkerHandle {
    name: String,
    models: Vec<ModelType>,
    requests: Option<Sender<WorkerRequest>>,
    thread: Option<thread::JoinHandle<()>>,
}

pub fn spawn_worker(
    config: &WorkerConfig,
    models: BTreeMap<ModelType, ModelConfig>,
    always_admit: ModelType,
    factory: Arc<dyn SessionFactory>,
    events: Sender<WorkerEvent>,
) -> Result<WorkerHandle> {
    let name = config.name.clone();
    let pool = {
        let thread_prefix = name.clone();
        let worker = name.clone();
        rayon::ThreadPoolBuilder::new()
            .num_threads(config.inference_threads.max(1))
            .thread_name(move |i| format!("{thread_prefix}-infer-{i}"))
            .panic_handler(move |payload| {
                log::error!(
                    "worker {worker}: inference task panicked: {}",
                    panic_detail(payload.as_ref())
                );
            })
            .build()
            .with_context(|| format!("failed to build inference pool for worker {}", config.name))?
    };

    let served: Vec<ModelType> = models.keys().copied().collect();
    let core = WorkerCore::new(name.clone(), models, always_admit);
    let (request_tx, request_rx) = unbounded();

    let thread = thread::Builder::new()
        .name(format!("{name}-worker"))
        .spawn(move || run_actor(core, pool, factory, request_rx, events))
        .with_context(|| format!("failed to spawn worker {name}"))?;

    log::info!("worker {name} started for {served:?}");
    Ok(WorkerHandle {
        name,
        models: served,
        requests: Some(request_tx),
        thread: Some(thread),
    })
}

fn run_actor(
    mut core: WorkerCore,
    pool: rayon::ThreadPool,
    factory: Arc<dyn SessionFactory>,
    requests: Receiver<WorkerRequest>,
    events: Sender<WorkerEvent>,
) {
    let (done_tx, done_rx) = unbounded::<Completion>();
    let mut inbox = requests;
    let mut closing = false;

    loop {
        let mut inbox_closed = false;
        let step = select! {
            recv(inbox) -> request => match request {
                Ok(request) => core.handle(request),
                Err(_) => {
                    inbox_closed = true;
                    core.shutdown()
                }
            },
            recv(done_rx) -> completion => match completion {
                Ok(completion) => core.complete(completion),
                Err(_) => Step::default(),
            },
        };
        if inbox_closed {
            log::debug!("worker {} inbox closed, shutting down", core.name());
            // A disconnected receiver is always ready; stop polling it.
            inbox = never();
            closing = true;
        }

        for event in step.events {
            if events.send(event).is_err() {
                log::trace!("worker {}: event consumer gone", core.name());
            }
        }
        for job in step.jobs {
            let factory = Arc::clone(&factory);
            let done_tx = done_tx.clone();
            // Job::run turns panics into completions, so `detecting` always clears.
            pool.spawn(move || {
                let _ = done_tx.send(job.run(factory.as_ref()));
            });
        }

        if closing && core.is_idle() {
            break;
        }
    }

    log::info!("worker {} stopped", core.name());
}

impl WorkerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn models(&self) -> &[ModelType] {
        &self.models
    }

    pub fn serves(&self, model: ModelType) -> bool {
        self.models.contains(&model)
    }

    /// A request that cannot be delivered is dropped, releasing any frame
    /// it carried.
    pub fn send(&self, request: WorkerRequest) -> Result<(), DetectError> {
        let gone = || DetectError::WorkerGone {
            worker: self.name.clone(),
        };
        let requests = self.requests.as_ref().ok_or_else(gone)?;
        requests.send(request).map_err(|_| gone())
    }

    pub fn initialize(&self, model: Option<ModelType>) -> Result<(), DetectError> {
        self.send(WorkerRequest::Initialize {
            model,
            config: None,
        })
    }

    pub fn initialize_with(&self, model: ModelType, config: ModelConfig) -> Result<(), DetectError> {
        self.send(WorkerRequest::Initialize {
            model: Some(model),
            config: Some(config),
        })
    }

    pub fn detect(&self, frame: FrameBuffer) -> Result<(), DetectError> {
        self.send(WorkerRequest::Detect { frame })
    }

    pub fn cleanup(&self, model: Option<ModelType>) -> Result<(), DetectError> {
        self.send(WorkerRequest::Cleanup { model })
    }

    /// Round-trips through the inbox, so every request sent before it has
    /// been handled once this returns.
    pub fn status(&self, timeout: Duration) -> Result<WorkerStatus, DetectError> {
        let (reply, status) = bounded(1);
        self.send(WorkerRequest::Status { reply })?;
        status
            .recv_timeout(timeout)
            .map_err(|err| self.reply_error(err, timeout))
    }

    /// A slow worker is still running; only a dropped reply means it exited.
    fn reply_error(&self, err: RecvTimeoutError, timeout: Duration) -> DetectError {
        match err {
            RecvTimeoutError::Timeout => DetectError::Timeout {
                worker: self.name.clone(),
                waited_ms: timeout.as_millis(),
            },
            RecvTimeoutError::Disconnected => DetectError::WorkerGone {
                worker: self.name.clone(),
            },
        }
    }

    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.requests.take();
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                log::error!("worker {} panicked", self.name);
            }
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
