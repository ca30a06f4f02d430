use std::{
    collections::BTreeMap,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use anyhow::{Result, anyhow};
use crossbeam_channel::{Receiver, Sender, unbounded};
use vision_dispatch::{
    DetectError, FrameBuffer, ModelConfig, ModelOutput, ModelType, PipelineConfig,
    VisionPipeline, WorkerConfig, WorkerEvent,
    pipeline::{InferenceSession, SessionFactory, SessionState, WorkerHandle, spawn_worker},
    types::{ImageHandle, ImageView, LandmarkSet},
};

const TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Default)]
struct Counter(Arc<AtomicUsize>);

impl Counter {
    fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    fn bump(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

struct TrackedImage {
    rgba: Vec<u8>,
    closes: Counter,
}

impl ImageHandle for TrackedImage {
    fn view(&self) -> ImageView<'_> {
        ImageView {
            rgba: &self.rgba,
            width: 2,
            height: 2,
        }
    }

    fn close(&mut self) {
        self.closes.bump();
    }
}

fn frame(ts: f64, closes: &Counter, models: &[ModelType]) -> FrameBuffer {
    let image = TrackedImage {
        rgba: vec![200; 16],
        closes: closes.clone(),
    };
    FrameBuffer::new(image, ts, models.iter().copied())
}

/// Sessions that wait for a token on `gate` before every inference and
/// fail for models listed in `failing`.
#[derive(Clone)]
struct GatedFactory {
    gate: Receiver<()>,
    failing: Vec<ModelType>,
    disposed: Counter,
}

struct GatedSession {
    model: ModelType,
    factory: GatedFactory,
}

impl InferenceSession for GatedSession {
    fn infer(&mut self, _image: ImageView<'_>, _timestamp_ms: f64) -> Result<ModelOutput> {
        self.factory
            .gate
            .recv_timeout(TIMEOUT)
            .map_err(|_| anyhow!("gate never opened"))?;
        if self.factory.failing.contains(&self.model) {
            return Err(anyhow!("{} backend crashed", self.model));
        }
        Ok(ModelOutput::Landmarks(vec![LandmarkSet {
            landmarks: Vec::new(),
            score: 0.9,
            handedness: None,
        }]))
    }

    fn dispose(&mut self) {
        self.factory.disposed.bump();
    }
}

impl SessionFactory for GatedFactory {
    fn create(&self, model: ModelType, _config: &ModelConfig) -> Result<Box<dyn InferenceSession>> {
        Ok(Box::new(GatedSession {
            model,
            factory: self.clone(),
        }))
    }
}

fn gated(failing: &[ModelType]) -> (GatedFactory, Sender<()>) {
    let (open, gate) = unbounded();
    let factory = GatedFactory {
        gate,
        failing: failing.to_vec(),
        disposed: Counter::default(),
    };
    (factory, open)
}

fn start_worker(
    factory: &GatedFactory,
    models: &[ModelType],
) -> (WorkerHandle, Receiver<WorkerEvent>) {
    let config = WorkerConfig::shared("scenario", models.iter().copied());
    let models: BTreeMap<_, _> = models
        .iter()
        .map(|&model| {
            let config = ModelConfig {
                skip_every: None,
                ..ModelConfig::for_model(model)
            };
            (model, config)
        })
        .collect();
    let (events_tx, events_rx) = unbounded();
    let worker = spawn_worker(
        &config,
        models,
        ModelType::Hand,
        Arc::new(factory.clone()),
        events_tx,
    )
    .unwrap();

    worker.initialize(None).unwrap();
    for _ in 0..config.models.len() {
        let event = events_rx.recv_timeout(TIMEOUT).unwrap();
        assert!(matches!(event, WorkerEvent::Initialized { result: Ok(()), .. }));
    }
    (worker, events_rx)
}

fn detection_timestamp(event: &WorkerEvent) -> Option<f64> {
    match event {
        WorkerEvent::Detection { timestamp_ms, .. } => Some(*timestamp_ms),
        _ => None,
    }
}

#[test]
fn only_the_newest_frame_waits_behind_a_slow_detection() {
    let (factory, open) = gated(&[]);
    let (worker, events) = start_worker(&factory, &[ModelType::Hand]);
    let closes: Vec<Counter> = (0..4).map(|_| Counter::default()).collect();

    worker.detect(frame(0.0, &closes[0], &[])).unwrap();
    for (i, ts) in [10.0, 20.0, 30.0].into_iter().enumerate() {
        worker.detect(frame(ts, &closes[i + 1], &[])).unwrap();
    }

    let status = worker.status(TIMEOUT).unwrap();
    assert!(status.detecting);
    assert_eq!(status.queued, Some(30.0));
    assert_eq!(status.evicted_frames, 2);
    assert_eq!(closes[1].get(), 1);
    assert_eq!(closes[2].get(), 1);

    open.send(()).unwrap();
    open.send(()).unwrap();
    let first = events.recv_timeout(TIMEOUT).unwrap();
    let second = events.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(detection_timestamp(&first), Some(0.0));
    assert_eq!(detection_timestamp(&second), Some(30.0));

    worker.shutdown();
    assert!(closes.iter().all(|c| c.get() == 1));
    assert_eq!(factory.disposed.get(), 1);
}

#[test]
fn cleanup_all_waits_for_the_running_detection() {
    let (factory, open) = gated(&[]);
    let (worker, events) = start_worker(&factory, &[ModelType::Hand]);
    let running = Counter::default();
    let queued = Counter::default();

    worker.detect(frame(0.0, &running, &[])).unwrap();
    worker.detect(frame(10.0, &queued, &[])).unwrap();
    worker.cleanup(None).unwrap();

    let status = worker.status(TIMEOUT).unwrap();
    assert_eq!(status.pending_cleanups, 1);
    assert_eq!(status.state(ModelType::Hand), Some(SessionState::Detecting));
    assert_eq!(factory.disposed.get(), 0);

    open.send(()).unwrap();
    let detected = events.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(detection_timestamp(&detected), Some(0.0));
    let cleaned = events.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(
        cleaned,
        WorkerEvent::Cleaned {
            worker: "scenario".into(),
            model: None,
            result: Ok(()),
        }
    );
    assert_eq!(running.get(), 1);
    assert_eq!(queued.get(), 1);
    assert_eq!(factory.disposed.get(), 1);

    let status = worker.status(TIMEOUT).unwrap();
    assert_eq!(status.state(ModelType::Hand), Some(SessionState::Terminated));

    let late = Counter::default();
    worker.detect(frame(20.0, &late, &[ModelType::Hand])).unwrap();
    let rejected = events.recv_timeout(TIMEOUT).unwrap();
    let WorkerEvent::Detection { results, .. } = &rejected else {
        panic!("expected a rejection, got {rejected:?}");
    };
    assert_eq!(
        results[&ModelType::Hand],
        Err(DetectError::NotInitialized {
            model: ModelType::Hand
        })
    );
    worker.status(TIMEOUT).unwrap();
    assert_eq!(late.get(), 1);
}

#[test]
fn one_failing_model_does_not_hide_the_other() {
    let (factory, open) = gated(&[ModelType::Face]);
    let (worker, events) = start_worker(&factory, &[ModelType::Hand, ModelType::Face]);
    let closes = Counter::default();

    worker.detect(frame(5.0, &closes, &[])).unwrap();
    open.send(()).unwrap();
    open.send(()).unwrap();

    let event = events.recv_timeout(TIMEOUT).unwrap();
    let WorkerEvent::Detection { results, .. } = &event else {
        panic!("expected detection, got {event:?}");
    };
    assert!(results[&ModelType::Hand].is_ok());
    assert!(matches!(
        results[&ModelType::Face],
        Err(DetectError::Infer {
            model: ModelType::Face,
            ..
        })
    ));
    assert_eq!(closes.get(), 1);

    let status = worker.status(TIMEOUT).unwrap();
    assert_eq!(status.state(ModelType::Face), Some(SessionState::Ready));
}

#[test]
fn pipeline_merges_results_from_every_worker() {
    let (factory, open) = gated(&[]);
    let config = PipelineConfig::from_toml_str(
        r#"
        [[workers]]
        name = "hand"
        models = ["hand"]

        [[workers]]
        name = "face"
        models = ["face"]
        capture_interval_ms = 200

        [[models]]
        model = "face"
        skip_every = 0
        "#,
    )
    .unwrap();
    let mut pipeline = VisionPipeline::start(&config, Arc::new(factory.clone())).unwrap();
    pipeline.initialize(None).unwrap();
    for _ in 0..2 {
        pipeline.next_event(TIMEOUT).unwrap();
    }

    let hand = Counter::default();
    let face = Counter::default();
    pipeline.detect(frame(80.0, &hand, &[ModelType::Hand])).unwrap();
    pipeline.detect(frame(200.0, &face, &[ModelType::Face])).unwrap();
    open.send(()).unwrap();
    open.send(()).unwrap();
    for _ in 0..2 {
        let event = pipeline.next_event(TIMEOUT).unwrap();
        assert!(matches!(event, WorkerEvent::Detection { .. }));
    }

    let state = pipeline.state();
    assert_eq!(state.len(), 2);
    assert_eq!(
        state.get(ModelType::Hand).unwrap().latest.as_ref().unwrap().timestamp_ms,
        80.0
    );
    assert!(state.output(ModelType::Face).is_some());
    assert!(pipeline.aggregator().is_ready(ModelType::Face));

    let final_state = pipeline.shutdown();
    assert_eq!(final_state.len(), 2);
    assert_eq!(hand.get(), 1);
    assert_eq!(face.get(), 1);
    assert_eq!(factory.disposed.get(), 2);
}

struct UnmappedImage {
    closes: Counter,
}

impl ImageHandle for UnmappedImage {
    fn view(&self) -> ImageView<'_> {
        panic!("buffer unmapped by the driver");
    }

    fn close(&mut self) {
        self.closes.bump();
    }
}

#[test]
fn a_panicking_frame_does_not_take_the_worker_down() {
    let (factory, _open) = gated(&[]);
    let (worker, events) = start_worker(&factory, &[ModelType::Hand]);
    let closes = Counter::default();

    let image = UnmappedImage {
        closes: closes.clone(),
    };
    worker.detect(FrameBuffer::new(image, 15.0, [])).unwrap();
    let event = events.recv_timeout(TIMEOUT).unwrap();
    let WorkerEvent::Detection { results, .. } = &event else {
        panic!("expected detection, got {event:?}");
    };
    assert!(matches!(
        results[&ModelType::Hand],
        Err(DetectError::Infer {
            model: ModelType::Hand,
            ..
        })
    ));
    assert_eq!(closes.get(), 1);

    let status = worker.status(TIMEOUT).unwrap();
    assert!(!status.detecting);
    assert_eq!(status.state(ModelType::Hand), Some(SessionState::Uninitialized));

    worker.initialize(Some(ModelType::Hand)).unwrap();
    let event = events.recv_timeout(TIMEOUT).unwrap();
    assert!(matches!(event, WorkerEvent::Initialized { result: Ok(()), .. }));
    worker.shutdown();
    assert_eq!(factory.disposed.get(), 2);
}

