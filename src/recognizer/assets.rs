//! Makes sure a model file is on disk before a session is built from it.

use std::{
    fs,
    io::{Read, Write},
    path::Path,
    time::Duration,
};

use anyhow::{Context, Result, anyhow};
use indicatif::{ProgressBar, ProgressStyle};
use reqwest::blocking::Client;

use crate::{config::ModelConfig, types::ModelType};

#[derive(Clone, Debug, PartialEq)]
pub enum ModelDownloadEvent {
    AlreadyPresent {
        model: ModelType,
    },
    Started {
        model: ModelType,
        total: Option<u64>,
    },
    Progress {
        model: ModelType,
        downloaded: u64,
        total: Option<u64>,
    },
    Finished {
        model: ModelType,
    },
}

/// Downloads `config.model_path` from `config.model_url` when missing.
pub fn ensure_model_ready<F>(model: ModelType, config: &ModelConfig, mut on_event: F) -> Result<()>
where
    F: FnMut(ModelDownloadEvent),
{
    let model_path = config.model_path.as_path();
    if model_path.exists() {
        on_event(ModelDownloadEvent::AlreadyPresent { model });
        on_event(ModelDownloadEvent::Finished { model });
        return Ok(());
    }

    let url = config.model_url.as_deref().ok_or_else(|| {
        anyhow!(
            "{model} model missing at {} and no download url configured",
            model_path.display()
        )
    })?;

    if let Some(parent) = model_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create model directory {}", parent.display()))?;
    }

    download_to_path(model, url, model_path, &mut on_event)
        .with_context(|| format!("failed to download {model} model to {}", model_path.display()))
}

/// Same as [`ensure_model_ready`], reporting progress on the terminal.
pub fn ensure_model_ready_with_progress(model: ModelType, config: &ModelConfig) -> Result<()> {
    let mut progress: Option<ProgressBar> = None;
    ensure_model_ready(model, config, |event| match event {
        ModelDownloadEvent::Started { total, .. } => {
            progress = Some(create_progress_bar(total));
        }
        ModelDownloadEvent::Progress { downloaded, .. } => {
            if let Some(pb) = progress.as_ref() {
                pb.set_position(downloaded);
            }
        }
        ModelDownloadEvent::Finished { model } => {
            if let Some(pb) = progress.take() {
                pb.finish_with_message(format!("{model} model ready"));
            }
        }
        ModelDownloadEvent::AlreadyPresent { .. } => {}
    })
}

fn download_to_path<F>(model: ModelType, url: &str, dest: &Path, on_event: &mut F) -> Result<()>
where
    F: FnMut(ModelDownloadEvent),
{
    log::info!("downloading {model} model from {url} to {}", dest.display());

    let client = Client::new();
    let mut response = client
        .get(url)
        .send()
        .context("failed to start model download")?
        .error_for_status()
        .context("model download returned error status")?;

    let total = response.content_length();
    on_event(ModelDownloadEvent::Started { model, total });

    let tmp_path = dest.with_extension("download");
    let mut file = fs::File::create(&tmp_path)
        .with_context(|| format!("failed to create {}", tmp_path.display()))?;

    let mut downloaded: u64 = 0;
    let mut buffer = [0u8; 16 * 1024];
    loop {
        let bytes_read = response
            .read(&mut buffer)
            .context("failed while reading model bytes")?;
        if bytes_read == 0 {
            break;
        }
        file.write_all(&buffer[..bytes_read])
            .context("failed while writing model to disk")?;
        downloaded += bytes_read as u64;
        on_event(ModelDownloadEvent::Progress {
            model,
            downloaded,
            total,
        });
    }

    file.sync_all()
        .context("failed to flush downloaded model to disk")?;
    fs::rename(&tmp_path, dest).with_context(|| {
        format!(
            "failed to move {} into place at {}",
            tmp_path.display(),
            dest.display()
        )
    })?;

    on_event(ModelDownloadEvent::Finished { model });
    Ok(())
}

fn create_progress_bar(total: Option<u64>) -> ProgressBar {
    let (pb, template) = match total {
        Some(total) if total > 0 => (
            ProgressBar::new(total),
            "{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({eta})",
        ),
        _ => {
            let pb = ProgressBar::new_spinner();
            pb.enable_steady_tick(Duration::from_millis(100));
            (pb, "{spinner:.green} downloading model")
        }
    };
    match ProgressStyle::with_template(template) {
        Ok(style) => pb.set_style(style.progress_chars("=>-")),
        Err(err) => log::debug!("progress template rejected: {err}"),
    }
    pb
}
