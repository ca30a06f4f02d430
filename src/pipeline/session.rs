use std::{
    any::Any,
    fmt,
    panic::{self, AssertUnwindSafe},
};

use crate::{
    config::ModelConfig,
    error::DetectError,
    types::{ImageView, ModelOutput, ModelType},
};

/// One running model instance, provided by a vision backend.
pub trait InferenceSession: Send + 'static {
    fn infer(&mut self, image: ImageView<'_>, timestamp_ms: f64) -> anyhow::Result<ModelOutput>;

    /// Frees backend resources. Called exactly once, before the session is dropped.
    fn dispose(&mut self) {}
}

/// Builds sessions for a model type; shared by every worker of a pipeline.
pub trait SessionFactory: Send + Sync + 'static {
    fn create(
        &self,
        model: ModelType,
        config: &ModelConfig,
    ) -> anyhow::Result<Box<dyn InferenceSession>>;
}

impl<F> SessionFactory for F
where
    F: Fn(ModelType, &ModelConfig) -> anyhow::Result<Box<dyn InferenceSession>>
        + Send
        + Sync
        + 'static,
{
    fn create(
        &self,
        model: ModelType,
        config: &ModelConfig,
    ) -> anyhow::Result<Box<dyn InferenceSession>> {
        self(model, config)
    }
}

/// Owned capability over one constructed session.
///
/// Construction either yields a ready handle or an `Init` error, never a
/// half-built session. Dropping the handle disposes the session.
pub struct SessionHandle {
    model: ModelType,
    session: Box<dyn InferenceSession>,
}

impl SessionHandle {
    pub fn open(
        factory: &dyn SessionFactory,
        model: ModelType,
        config: &ModelConfig,
    ) -> Result<Self, DetectError> {
        match panic::catch_unwind(AssertUnwindSafe(|| factory.create(model, config))) {
            Ok(Ok(session)) => Ok(Self { model, session }),
            Ok(Err(err)) => Err(DetectError::init(model, &err)),
            Err(payload) => Err(DetectError::Init {
                model,
                reason: panic_message(payload.as_ref()),
            }),
        }
    }

    pub fn model(&self) -> ModelType {
        self.model
    }

    pub fn infer(
        &mut self,
        image: ImageView<'_>,
        timestamp_ms: f64,
    ) -> Result<ModelOutput, DetectError> {
        let model = self.model;
        let session = &mut self.session;
        match panic::catch_unwind(AssertUnwindSafe(|| session.infer(image, timestamp_ms))) {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(err)) => Err(DetectError::infer(model, &err)),
            Err(payload) => Err(DetectError::Infer {
                model,
                reason: panic_message(payload.as_ref()),
            }),
        }
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        log::debug!("disposing {} session", self.model);
        let session = &mut self.session;
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| session.dispose())) {
            log::error!(
                "disposing {} session panicked: {}",
                self.model,
                panic_detail(payload.as_ref())
            );
        }
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    format!("session panicked: {}", panic_detail(payload))
}

pub(crate) fn panic_detail(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string())
}
