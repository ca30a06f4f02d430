use std::{
    path::{Path, PathBuf},
    thread,
    time::{Duration, Instant},
};

use anyhow::Result;
use vision_dispatch::{
    AggregatedState, Frame, FrameBuffer, ModelOutput, PipelineConfig, VisionPipeline,
    capture::{CaptureScheduler, Dispatch, FrameSource, ImageReplay},
    recognizer::RecognizerBackend,
};

const REPLAY_LOOPS: usize = 3;
const REPORT_INTERVAL: Duration = Duration::from_secs(1);
const MAX_IDLE_SLEEP_MS: f64 = 20.0;

fn main() -> Result<()> {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let config = match args.next() {
        Some(path) => PipelineConfig::load(Path::new(&path))?,
        None => PipelineConfig::default(),
    };
    let image_dir = args.next().map(PathBuf::from);
    let mut source = open_source(image_dir.as_deref())?;

    let backend = RecognizerBackend::default();
    let mut pipeline = VisionPipeline::start(&config, backend.factory())?;
    pipeline.initialize(None)?;

    let mut scheduler = CaptureScheduler::new(&config);
    log::info!("capturing for view {}", scheduler.view());
    let started = Instant::now();
    let mut last_report = Instant::now();

    loop {
        let now_ms = started.elapsed().as_secs_f64() * 1000.0;
        let due = scheduler.due(now_ms);
        if !due.is_empty() {
            match source.next_frame() {
                Ok(Some(frame)) => dispatch(&pipeline, frame, now_ms, due),
                Ok(None) => {
                    log::info!("capture source exhausted");
                    break;
                }
                Err(err) => log::warn!("capture failed: {err:#}"),
            }
        }

        pipeline.poll();
        if last_report.elapsed() >= REPORT_INTERVAL {
            report(pipeline.state());
            last_report = Instant::now();
        }

        let now_ms = started.elapsed().as_secs_f64() * 1000.0;
        let wait_ms = scheduler.next_due_in(now_ms).min(MAX_IDLE_SLEEP_MS);
        thread::sleep(Duration::from_secs_f64(wait_ms / 1000.0));
    }

    let state = pipeline.shutdown();
    report(&state);
    Ok(())
}

fn open_source(image_dir: Option<&Path>) -> Result<Box<dyn FrameSource>> {
    match image_dir {
        Some(dir) => Ok(Box::new(ImageReplay::open(dir, Some(REPLAY_LOOPS))?)),
        None => open_camera(),
    }
}

#[cfg(feature = "camera-nokhwa")]
fn open_camera() -> Result<Box<dyn FrameSource>> {
    Ok(Box::new(
        vision_dispatch::capture::camera::WebcamSource::open_default()?,
    ))
}

#[cfg(not(feature = "camera-nokhwa"))]
fn open_camera() -> Result<Box<dyn FrameSource>> {
    anyhow::bail!("no image directory given and camera support is not compiled in")
}

/// Each due worker gets its own copy of the capture.
fn dispatch(pipeline: &VisionPipeline, frame: Frame, timestamp_ms: f64, due: Vec<Dispatch>) {
    let count = due.len();
    let mut frame = Some(frame);
    for (i, Dispatch { worker, models }) in due.into_iter().enumerate() {
        let image = if i + 1 == count {
            frame.take()
        } else {
            frame.clone()
        };
        let Some(image) = image else {
            break;
        };
        if let Err(err) = pipeline.submit(&worker, FrameBuffer::new(image, timestamp_ms, models)) {
            log::warn!("failed to submit frame: {err}");
        }
    }
}

fn report(state: &AggregatedState) {
    if state.is_empty() {
        log::info!("no results yet");
        return;
    }
    for (model, entry) in state.models() {
        let summary = match entry.latest.as_ref().map(|timed| (&timed.output, timed.timestamp_ms)) {
            Some((ModelOutput::Landmarks(sets), ts)) => {
                format!("{} detection(s) at {ts:.0}ms", sets.len())
            }
            Some((ModelOutput::Segmentation(mask), ts)) => {
                format!("mask coverage {:.1}% at {ts:.0}ms", mask.coverage(1) * 100.0)
            }
            None => "no output".to_string(),
        };
        match &entry.error {
            Some(err) => log::info!("{model}: {summary} (last error: {err})"),
            None => log::info!("{model}: {summary}"),
        }
    }
}
