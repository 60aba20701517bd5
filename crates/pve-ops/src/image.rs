//! Base cloud image cache.
//!
//! The image is downloaded once into the cache directory and reused by
//! every provisioning run. A download is a single attempt; it streams into
//! a private temporary file that is only renamed into place once complete.

use std::path::{Path, PathBuf};
use std::time::Duration;

use futures::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::config::PlatformConfig;
use crate::error::{ProvisionError, Result};

/// Connect timeout for the image server.
const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Cached base image location and origin.
#[derive(Debug, Clone)]
pub struct ImageCache {
    url: String,
    path: PathBuf,
    sha256: Option<String>,
}

impl ImageCache {
    /// Cache described by the platform configuration.
    #[must_use]
    pub fn from_config(config: &PlatformConfig) -> Self {
        Self::new(
            config.image_url.clone(),
            config.image_path(),
            config.image_sha256.clone(),
        )
    }

    #[must_use]
    pub fn new(url: impl Into<String>, path: impl Into<PathBuf>, sha256: Option<String>) -> Self {
        Self {
            url: url.into(),
            path: path.into(),
            sha256: sha256.map(|s| s.to_ascii_lowercase()),
        }
    }

    /// Local path of the image.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Return the cached image, downloading it first if absent.
    ///
    /// Each download streams into its own temporary file next to the image,
    /// so concurrent runs never share a partial file; the last complete
    /// download to be renamed into place wins.
    ///
    /// # Errors
    /// Returns [`ProvisionError::Download`] or [`ProvisionError::Http`] if the
    /// download fails, and [`ProvisionError::ChecksumMismatch`] if a digest is
    /// configured and does not match.
    pub async fn ensure(&self) -> Result<PathBuf> {
        if self.path.is_file() {
            info!(path = %self.path.display(), "Using cached base image");
            return Ok(self.path.clone());
        }

        info!(url = %self.url, path = %self.path.display(), "Base image not cached, downloading");
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| ProvisionError::io(dir, e))?;

        // Removed on drop unless persisted.
        let (file, part) = tempfile::Builder::new()
            .prefix(".download-")
            .suffix(".part")
            .tempfile_in(dir)
            .map_err(|e| ProvisionError::io(dir, e))?
            .into_parts();
        let digest = self
            .download_into(tokio::fs::File::from_std(file), &part)
            .await?;

        if let Some(expected) = &self.sha256 {
            if *expected != digest {
                return Err(ProvisionError::ChecksumMismatch {
                    path: self.path.clone(),
                    expected: expected.clone(),
                    actual: digest,
                });
            }
        } else {
            warn!(sha256 = %digest, "No image checksum configured, download not verified");
        }

        part.persist(&self.path)
            .map_err(|e| ProvisionError::io(&self.path, e.error))?;
        info!(path = %self.path.display(), "Base image downloaded");
        Ok(self.path.clone())
    }

    /// Stream the image into `file` at `dest`, returning its hex SHA-256.
    async fn download_into(&self, mut file: tokio::fs::File, dest: &Path) -> Result<String> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .build()?;
        let response = client.get(&self.url).send().await?;
        if !response.status().is_success() {
            return Err(ProvisionError::Download {
                url: self.url.clone(),
                message: format!("server returned {}", response.status()),
            });
        }

        let progress = response
            .content_length()
            .map_or_else(ProgressBar::no_length, ProgressBar::new);
        if let Ok(style) = ProgressStyle::with_template(
            "{spinner} {bytes}/{total_bytes} [{bar:40}] {bytes_per_sec} eta {eta}",
        ) {
            progress.set_style(style.progress_chars("=> "));
        }

        let mut hasher = Sha256::new();
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| ProvisionError::Download {
                url: self.url.clone(),
                message: e.to_string(),
            })?;
            hasher.update(&chunk);
            file.write_all(&chunk)
                .await
                .map_err(|e| ProvisionError::io(dest, e))?;
            progress.inc(chunk.len() as u64);
        }
        file.flush().await.map_err(|e| ProvisionError::io(dest, e))?;
        progress.finish_and_clear();

        Ok(hex::encode(hasher.finalize()))
    }
}
