//! Fakes shared by unit tests.

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicUsize, Ordering},
};

use anyhow::{Result, anyhow};

use crate::{
    config::ModelConfig,
    pipeline::{InferenceSession, SessionFactory},
    types::{ImageHandle, ImageView, LandmarkSet, ModelOutput, ModelType},
};

#[derive(Clone, Debug, Default)]
pub struct Counter(Arc<AtomicUsize>);

impl Counter {
    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    pub fn bump(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

/// Image that counts how often it is closed.
pub struct CountingImage {
    rgba: Vec<u8>,
    width: u32,
    height: u32,
    closes: Counter,
}

impl CountingImage {
    pub fn new(width: u32, height: u32) -> (Self, Counter) {
        let closes = Counter::default();
        (Self::with_counter(width, height, &closes), closes)
    }

    pub fn with_counter(width: u32, height: u32, closes: &Counter) -> Self {
        Self {
            rgba: vec![128; (width * height * 4) as usize],
            width,
            height,
            closes: closes.clone(),
        }
    }
}

impl ImageHandle for CountingImage {
    fn view(&self) -> ImageView<'_> {
        ImageView {
            rgba: &self.rgba,
            width: self.width,
            height: self.height,
        }
    }

    fn close(&mut self) {
        self.closes.bump();
    }
}

/// Records every inference as `(model, timestamp)`; models listed in
/// `failing` return an error instead of an empty landmark set.
#[derive(Clone, Default)]
pub struct ScriptedFactory {
    pub created: Counter,
    pub disposed: Counter,
    pub calls: Arc<Mutex<Vec<(ModelType, f64)>>>,
    pub failing: Arc<Mutex<Vec<ModelType>>>,
    pub broken: Arc<Mutex<Vec<ModelType>>>,
}

impl ScriptedFactory {
    pub fn calls_for(&self, model: ModelType) -> Vec<f64> {
        self.calls
            .lock()
            .map(|calls| {
                calls
                    .iter()
                    .filter(|(m, _)| *m == model)
                    .map(|(_, ts)| *ts)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn fail(&self, model: ModelType) {
        self.failing.lock().unwrap().push(model);
    }

    pub fn break_init(&self, model: ModelType) {
        self.broken.lock().unwrap().push(model);
    }
}

struct ScriptedSession {
    model: ModelType,
    factory: ScriptedFactory,
}

impl InferenceSession for ScriptedSession {
    fn infer(&mut self, _image: ImageView<'_>, timestamp_ms: f64) -> Result<ModelOutput> {
        self.factory
            .calls
            .lock()
            .unwrap()
            .push((self.model, timestamp_ms));
        if self.factory.failing.lock().unwrap().contains(&self.model) {
            return Err(anyhow!("scripted failure"));
        }
        Ok(ModelOutput::Landmarks(vec![LandmarkSet {
            landmarks: Vec::new(),
            score: 1.0,
            handedness: None,
        }]))
    }

    fn dispose(&mut self) {
        self.factory.disposed.bump();
    }
}

impl SessionFactory for ScriptedFactory {
    fn create(&self, model: ModelType, _config: &ModelConfig) -> Result<Box<dyn InferenceSession>> {
        if self.broken.lock().unwrap().contains(&model) {
            return Err(anyhow!("model asset missing"));
        }
        self.created.bump();
        Ok(Box::new(ScriptedSession {
            model,
            factory: self.clone(),
        }))
    }
}
