//! Blocking HTTP fetch of model assets into the models directory.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use reqwest::blocking::Client;
use tracing::{debug, info, warn};

use crate::config::ModelDescriptor;
use crate::types::{DownloadProgress, DownloadStage};

const CHUNK_SIZE: usize = 64 * 1024;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(600);

/// Downloads every file of a [`ModelDescriptor`] from a Hugging Face style host.
///
/// Files land in a hidden staging directory next to the target and are moved
/// into place only once all of them arrived, so an interrupted download never
/// looks like an installed model.
pub struct ModelFetcher {
    base_url: String,
}

impl ModelFetcher {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn file_url(&self, descriptor: &ModelDescriptor, file: &str) -> String {
        format!("{}/{}/resolve/main/{}", self.base_url, descriptor.repo, file)
    }

    /// Must run off the async runtime: the blocking client owns its own reactor.
    pub fn fetch(
        &self,
        descriptor: &ModelDescriptor,
        target_dir: &Path,
        on_progress: &mut dyn FnMut(DownloadProgress),
    ) -> Result<()> {
        if descriptor.files.is_empty() {
            bail!("model {} lists no files to download", descriptor.slug);
        }

        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("failed to build http client")?;

        let staging = staging_dir(target_dir)?;
        if staging.exists() {
            fs::remove_dir_all(&staging)
                .with_context(|| format!("failed to clear {}", staging.display()))?;
        }
        fs::create_dir_all(&staging)
            .with_context(|| format!("failed to create {}", staging.display()))?;

        let file_count = descriptor.files.len() as f64;
        for (index, file) in descriptor.files.iter().enumerate() {
            let url = self.file_url(descriptor, file);
            let mut report = |fraction: f64| {
                on_progress(DownloadProgress {
                    stage: DownloadStage::Downloading,
                    fraction: (index as f64 + fraction) / file_count,
                })
            };
            if let Err(err) = download_file(&client, &url, &staging.join(file), &mut report) {
                if let Err(cleanup) = fs::remove_dir_all(&staging) {
                    warn!(error = %cleanup, "failed to remove partial download");
                }
                return Err(err.context(format!("failed to download {file}")));
            }
        }

        finalize(&staging, target_dir)?;
        info!(slug = %descriptor.slug, path = %target_dir.display(), "model assets installed");
        Ok(())
    }
}

fn staging_dir(target_dir: &Path) -> Result<PathBuf> {
    let name = target_dir
        .file_name()
        .ok_or_else(|| anyhow!("invalid model directory {}", target_dir.display()))?
        .to_string_lossy();
    let parent = target_dir.parent().unwrap_or_else(|| Path::new("."));
    Ok(parent.join(format!(".{name}.partial")))
}

fn download_file(
    client: &Client,
    url: &str,
    path: &Path,
    report: &mut dyn FnMut(f64),
) -> Result<()> {
    debug!(url, "fetching model file");
    let mut response = client
        .get(url)
        .send()
        .with_context(|| format!("request to {url} failed"))?
        .error_for_status()?;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let total = response.content_length().unwrap_or(0);
    let mut file =
        File::create(path).with_context(|| format!("failed to create {}", path.display()))?;

    let mut buffer = vec![0u8; CHUNK_SIZE];
    let mut downloaded = 0u64;
    loop {
        let read = response.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        file.write_all(&buffer[..read])?;
        downloaded += read as u64;
        if total > 0 {
            report((downloaded as f64 / total as f64).min(1.0));
        }
    }
    file.flush()?;
    report(1.0);

    debug!(url, bytes = downloaded, "model file fetched");
    Ok(())
}

/// Replace `target_dir` with the completed staging directory.
fn finalize(staging: &Path, target_dir: &Path) -> Result<()> {
    if target_dir.exists() {
        fs::remove_dir_all(target_dir)
            .with_context(|| format!("failed to replace {}", target_dir.display()))?;
    }
    fs::rename(staging, target_dir).with_context(|| {
        format!(
            "failed to move {} to {}",
            staging.display(),
            target_dir.display()
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::builtin_catalog;

    #[test]
    fn builds_resolve_urls() {
        let fetcher = ModelFetcher::new("https://huggingface.co/");
        let qwen = &builtin_catalog()[0];
        assert_eq!(
            fetcher.file_url(qwen, "config.txt"),
            "https://huggingface.co/Cactus-Compute/Qwen3-0.6B/resolve/main/config.txt"
        );
    }

    #[test]
    fn staging_is_a_hidden_sibling() {
        let staging = staging_dir(Path::new("/data/cactus/models/qwen3-0.6")).unwrap();
        assert_eq!(
            staging,
            PathBuf::from("/data/cactus/models/.qwen3-0.6.partial")
        );
    }

    #[test]
    fn finalize_replaces_stale_target() {
        let tmp = tempfile::tempdir().unwrap();
        let target = tmp.path().join("qwen3-0.6");
        let staging = staging_dir(&target).unwrap();

        fs::create_dir_all(&target).unwrap();
        fs::write(target.join("stale.bin"), b"old").unwrap();
        fs::create_dir_all(&staging).unwrap();
        fs::write(staging.join("model.weights"), b"new").unwrap();

        finalize(&staging, &target).unwrap();

        assert!(!staging.exists());
        assert!(!target.join("stale.bin").exists());
        assert_eq!(fs::read(target.join("model.weights")).unwrap(), b"new");
    }

    #[test]
    fn descriptor_without_files_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let mut descriptor = builtin_catalog()[0].clone();
        descriptor.files.clear();

        let err = ModelFetcher::new("http://127.0.0.1:9")
            .fetch(&descriptor, &tmp.path().join("x"), &mut |_| {})
            .unwrap_err();
        assert!(err.to_string().contains("lists no files"));
    }
}
