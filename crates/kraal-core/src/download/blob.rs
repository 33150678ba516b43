//! Single-blob HTTP downloader.
//!
//! Supports resumed downloads via `Range`, conditional requests via
//! `If-None-Match`, fixed-backoff retries, bandwidth throttling and
//! streaming SHA-256 verification. All failure modes come back as values;
//! partial files are preserved only when they pre-existed the call.

use futures::StreamExt;
use reqwest::header::{IF_NONE_MATCH, RANGE};
use reqwest::StatusCode;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::checksum::{sha256_file, Sha256Stream};
use crate::config::DownloadConfig;
use crate::download::lock::FileLock;
use crate::download::{DownloadOptions, Manifest};
use crate::error::{Error, Result};
use crate::storage::layout;

/// Downloads model blobs and manifests from a registry.
pub struct BlobDownloader {
    client: reqwest::Client,
    registry_base: String,
    models_dir: PathBuf,
    config: DownloadConfig,
}

impl BlobDownloader {
    pub fn new(
        registry_base: impl Into<String>,
        models_dir: impl Into<PathBuf>,
        config: DownloadConfig,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            registry_base: registry_base.into(),
            models_dir: models_dir.into(),
            config,
        })
    }

    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    pub fn config(&self) -> &DownloadConfig {
        &self.config
    }

    /// Fetch a model's manifest from the registry and keep a copy on disk
    /// next to the model files.
    pub async fn fetch_manifest(&self, model_id: &str) -> Result<Manifest> {
        let base = self.registry_base.trim_end_matches('/');
        if base.is_empty() {
            return Err(Error::DownloadFailed("no registry base configured".into()));
        }
        let url = format!("{}/{}/manifest.json", base, model_id);

        let mut last_err = Error::DownloadFailed(format!("manifest fetch failed: {}", url));
        for attempt in 0..=self.config.max_retries {
            match self.client.get(&url).send().await {
                Ok(resp) if resp.status().is_success() => {
                    let body = resp.bytes().await?;
                    let manifest: Manifest = serde_json::from_slice(&body)?;

                    let dir = self.models_dir.join(layout::model_name_to_dir(model_id));
                    tokio::fs::create_dir_all(&dir).await?;
                    tokio::fs::write(dir.join("manifest.json"), &body).await?;

                    return Ok(manifest);
                }
                Ok(resp) => {
                    last_err =
                        Error::DownloadFailed(format!("manifest fetch HTTP {}", resp.status()));
                }
                Err(err) => {
                    last_err = Error::DownloadFailed(format!("manifest fetch failed: {}", err));
                }
            }
            if attempt < self.config.max_retries {
                tokio::time::sleep(self.config.backoff()).await;
            }
        }
        Err(last_err)
    }

    /// Download a blob into `<models_dir>/<out_filename>`.
    ///
    /// A relative `blob_url` is resolved against the registry base. Returns
    /// the local path on success.
    pub async fn download_blob(
        &self,
        blob_url: &str,
        out_filename: &str,
        opts: &DownloadOptions,
    ) -> Result<PathBuf> {
        let out_path = self.models_dir.join(out_filename);
        if let Some(parent) = out_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Best-effort guard against concurrent writers of the same blob.
        let _lock = FileLock::acquire(&out_path);

        let url = self.resolve_url(blob_url)?;
        let original_size = std::fs::metadata(&out_path).map(|m| m.len()).ok();
        let pre_existed = original_size.is_some();

        if let Some(etag) = opts.if_none_match.clone() {
            return self
                .download_conditional(&url, &out_path, &etag, opts, original_size.unwrap_or(0))
                .await;
        }

        let resumed = original_size.unwrap_or(0) > 0;
        let first = self.download_with_retries(&url, &out_path, resumed, opts).await;

        match first {
            Ok(pass_digest) => {
                if self.digest_ok(&out_path, opts, pass_digest, resumed)? {
                    return Ok(out_path);
                }
                debug!("Checksum mismatch for {}, retrying full download", url);
                self.retry_full_after_mismatch(&url, &out_path, opts).await
            }
            Err(err) if resumed => {
                // Resume failed outright; fall back to one full pass.
                debug!("Resumed download failed ({}), retrying from scratch", err);
                match self.download_with_retries(&url, &out_path, false, opts).await {
                    Ok(pass_digest) => {
                        if self.digest_ok(&out_path, opts, pass_digest, false)? {
                            Ok(out_path)
                        } else {
                            let _ = std::fs::remove_file(&out_path);
                            Err(Error::DownloadFailed(format!("checksum mismatch: {}", url)))
                        }
                    }
                    Err(err) => {
                        if !pre_existed {
                            let _ = std::fs::remove_file(&out_path);
                        }
                        Err(err)
                    }
                }
            }
            Err(err) => {
                if !pre_existed {
                    let _ = std::fs::remove_file(&out_path);
                }
                Err(err)
            }
        }
    }

    async fn retry_full_after_mismatch(
        &self,
        url: &str,
        out_path: &Path,
        opts: &DownloadOptions,
    ) -> Result<PathBuf> {
        let _ = std::fs::remove_file(out_path);
        if let Ok(pass_digest) = self.download_with_retries(url, out_path, false, opts).await {
            if self.digest_ok(out_path, opts, pass_digest, false)? {
                return Ok(out_path.to_path_buf());
            }
        }
        let _ = std::fs::remove_file(out_path);
        Err(Error::DownloadFailed(format!("checksum mismatch: {}", url)))
    }

    /// Conditional GET carrying `If-None-Match`. A `304` with an existing
    /// local file short-circuits without touching it.
    async fn download_conditional(
        &self,
        url: &str,
        out_path: &Path,
        etag: &str,
        opts: &DownloadOptions,
        original_size: u64,
    ) -> Result<PathBuf> {
        for attempt in 0..=self.config.max_retries {
            match self
                .client
                .get(url)
                .header(IF_NONE_MATCH, etag)
                .send()
                .await
            {
                Ok(resp) if resp.status() == StatusCode::NOT_MODIFIED => {
                    if out_path.exists() {
                        if let Some(progress) = &opts.progress {
                            progress(original_size, original_size);
                        }
                        return Ok(out_path.to_path_buf());
                    }
                    // 304 without a local copy: fall through to retry; the
                    // caller should not have sent the conditional header.
                }
                Ok(resp) if resp.status().is_success() => {
                    let body = resp.bytes().await?;
                    tokio::fs::write(out_path, &body).await?;
                    if let Some(progress) = &opts.progress {
                        progress(body.len() as u64, body.len() as u64);
                    }

                    if let Some(expected) = &opts.expected_sha256 {
                        let mut stream = Sha256Stream::new();
                        stream.update(&body);
                        if stream.finalize() != *expected {
                            let _ = std::fs::remove_file(out_path);
                            return Err(Error::DownloadFailed(format!(
                                "checksum mismatch: {}",
                                url
                            )));
                        }
                    }
                    return Ok(out_path.to_path_buf());
                }
                Ok(resp) => {
                    debug!("Conditional GET {} returned HTTP {}", url, resp.status());
                }
                Err(err) => {
                    debug!("Conditional GET {} failed: {}", url, err);
                }
            }
            if attempt < self.config.max_retries {
                tokio::time::sleep(self.config.backoff()).await;
            }
        }

        if out_path.exists() {
            // Server unreachable but a cached copy exists; treat as current.
            return Ok(out_path.to_path_buf());
        }
        Err(Error::DownloadFailed(format!(
            "conditional download failed: {}",
            url
        )))
    }

    async fn download_with_retries(
        &self,
        url: &str,
        out_path: &Path,
        resume: bool,
        opts: &DownloadOptions,
    ) -> Result<Option<String>> {
        let mut last_err = Error::DownloadFailed(format!("download failed: {}", url));
        for attempt in 0..=self.config.max_retries {
            match self.stream_once(url, out_path, resume, opts).await {
                Ok(digest) => return Ok(digest),
                Err(err) => {
                    warn!("Download attempt {} for {} failed: {}", attempt + 1, url, err);
                    last_err = err;
                }
            }
            if attempt < self.config.max_retries {
                tokio::time::sleep(self.config.backoff()).await;
            }
        }
        Err(last_err)
    }

    /// One streaming pass. Returns the digest of the bytes written in this
    /// pass when verification was requested and the pass started from zero.
    async fn stream_once(
        &self,
        url: &str,
        out_path: &Path,
        resume: bool,
        opts: &DownloadOptions,
    ) -> Result<Option<String>> {
        // Re-stat on every attempt: a failed attempt may have appended bytes.
        let mut offset = if resume {
            std::fs::metadata(out_path).map(|m| m.len()).unwrap_or(0)
        } else {
            0
        };

        let mut request = self.client.get(url);
        if offset > 0 {
            request = request.header(RANGE, format!("bytes={}-", offset));
        }

        let resp = request
            .send()
            .await
            .map_err(|err| Error::DownloadFailed(format!("request failed: {}", err)))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(Error::DownloadFailed(format!("HTTP {} for {}", status, url)));
        }

        // A server that ignores Range answers 200 with the full body.
        if offset > 0 && status != StatusCode::PARTIAL_CONTENT {
            offset = 0;
        }

        let total = offset + resp.content_length().unwrap_or(0);
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(offset > 0)
            .write(true)
            .truncate(offset == 0)
            .open(out_path)
            .await?;

        let mut hasher = opts.expected_sha256.as_ref().map(|_| Sha256Stream::new());
        let rate = opts
            .max_bytes_per_sec
            .unwrap_or(self.config.max_bytes_per_sec);
        let chunk_size = opts.chunk_size.unwrap_or(self.config.chunk_size).max(1);

        let mut downloaded = offset;
        let mut received: u64 = 0;
        let started = Instant::now();
        let mut stream = resp.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk =
                chunk.map_err(|err| Error::DownloadFailed(format!("stream error: {}", err)))?;
            for part in chunk.chunks(chunk_size) {
                file.write_all(part).await?;
                if let Some(hasher) = hasher.as_mut() {
                    hasher.update(part);
                }
                downloaded += part.len() as u64;
                received += part.len() as u64;
                if let Some(progress) = &opts.progress {
                    progress(downloaded, total.max(downloaded));
                }
                throttle(rate, started, received).await;
            }
        }

        file.flush().await?;
        file.sync_all().await?;

        // The streaming digest only covers this pass; it is meaningless for
        // a resumed download, which the caller re-hashes from disk.
        Ok(if offset == 0 {
            hasher.map(Sha256Stream::finalize)
        } else {
            None
        })
    }

    fn digest_ok(
        &self,
        out_path: &Path,
        opts: &DownloadOptions,
        pass_digest: Option<String>,
        resumed: bool,
    ) -> Result<bool> {
        let Some(expected) = &opts.expected_sha256 else {
            return Ok(true);
        };
        let actual = match pass_digest {
            Some(digest) if !resumed => digest,
            _ => sha256_file(out_path)?,
        };
        Ok(actual == *expected)
    }

    fn resolve_url(&self, blob_url: &str) -> Result<String> {
        if blob_url.starts_with("http://") || blob_url.starts_with("https://") {
            return Ok(blob_url.to_string());
        }

        let base = self.registry_base.trim_end_matches('/');
        if base.is_empty() {
            return Err(Error::DownloadFailed(format!(
                "cannot resolve relative URL without registry base: {}",
                blob_url
            )));
        }

        if let Some(path) = blob_url.strip_prefix('/') {
            let mut url = reqwest::Url::parse(base)
                .map_err(|err| Error::DownloadFailed(format!("bad registry base: {}", err)))?;
            url.set_path(path);
            Ok(url.to_string())
        } else {
            Ok(format!("{}/{}", base, blob_url))
        }
    }
}

/// Sleep long enough to keep the running average at or below `rate`.
async fn throttle(rate: u64, started: Instant, received: u64) {
    if rate == 0 {
        return;
    }
    let elapsed = started.elapsed().as_secs_f64();
    let allowed = rate as f64 * elapsed;
    if (received as f64) > allowed && elapsed > 0.0 {
        let excess = received as f64 - allowed;
        let sleep_secs = excess / rate as f64;
        if sleep_secs > 0.0 {
            tokio::time::sleep(Duration::from_secs_f64(sleep_secs)).await;
        }
    }
}
