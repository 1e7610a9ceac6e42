//! Scoped run workspace + archive download utilities for the SEPA pipeline.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use reqwest::{StatusCode, Url};
use sepa_core::{ArchiveFormat, SourceDescriptor};
use sha2::{Digest, Sha256};
use tempfile::TempDir;
use thiserror::Error;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "sepa-storage";

/// Private temporary area owned by one run. Removed on `close` or drop.
#[derive(Debug)]
pub struct RunWorkspace {
    dir: TempDir,
}

impl RunWorkspace {
    pub fn create(root: &Path, run_id: Uuid) -> anyhow::Result<Self> {
        std::fs::create_dir_all(root)
            .with_context(|| format!("creating work root {}", root.display()))?;
        let dir = tempfile::Builder::new()
            .prefix(&format!("sepa-run-{run_id}-"))
            .tempdir_in(root)
            .with_context(|| format!("creating run workspace under {}", root.display()))?;
        for sub in ["downloads", "extract"] {
            std::fs::create_dir_all(dir.path().join(sub))
                .with_context(|| format!("creating {sub} directory"))?;
        }
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn downloads_dir(&self) -> PathBuf {
        self.dir.path().join("downloads")
    }

    pub fn extract_dir(&self) -> PathBuf {
        self.dir.path().join("extract")
    }

    pub fn archive_path(&self, index: usize, source: &SourceDescriptor) -> PathBuf {
        let stem = source
            .label
            .as_deref()
            .map(sanitize_file_stem)
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "source".to_string());
        self.downloads_dir().join(format!(
            "{index:02}-{stem}.{}",
            source.expected_format.extension()
        ))
    }

    pub fn close(self) -> std::io::Result<()> {
        self.dir.close()
    }
}

fn sanitize_file_stem(input: &str) -> String {
    input
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
        .collect::<String>()
        .trim_matches('-')
        .to_string()
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
    /// Extra from-scratch downloads allowed after a corrupt artifact.
    pub corrupt_retries: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(300),
            user_agent: None,
            backoff: BackoffPolicy::default(),
            corrupt_retries: 1,
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("malformed source url {0}")]
    InvalidUrl(String),
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("i/o error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("corrupt archive from {url}: {reason}")]
    Corrupt { url: String, reason: String },
}

impl FetchError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            FetchError::Request { source, .. } => classify_reqwest_error(source),
            FetchError::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::NonRetryable),
            FetchError::InvalidUrl(_) | FetchError::Io { .. } | FetchError::Corrupt { .. } => {
                RetryDisposition::NonRetryable
            }
        }
    }

    fn io(path: &Path, source: std::io::Error) -> Self {
        FetchError::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

/// A verified archive sitting inside the run workspace.
#[derive(Debug, Clone)]
pub struct FetchedArchive {
    pub source: SourceDescriptor,
    pub path: PathBuf,
    pub final_url: String,
    pub byte_size: u64,
    pub sha256: String,
    pub attempts: usize,
}

#[derive(Debug)]
struct Download {
    final_url: String,
    byte_size: u64,
    sha256: String,
    content_length: Option<u64>,
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
    corrupt_retries: usize,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            backoff: config.backoff,
            corrupt_retries: config.corrupt_retries,
        })
    }

    /// Download `source` to `dest` and verify it before handing it downstream.
    ///
    /// Transient failures are retried with backoff. A download that completes but
    /// fails verification is discarded and fetched again from scratch, up to
    /// `corrupt_retries` extra times.
    pub async fn fetch_archive(
        &self,
        run_id: Uuid,
        source: &SourceDescriptor,
        dest: &Path,
    ) -> Result<FetchedArchive, FetchError> {
        let span = info_span!("fetch_archive", %run_id, source = source.display_name());
        async move {
            let mut attempts = 0usize;
            let mut last_reason = String::new();

            for integrity_attempt in 0..=self.corrupt_retries {
                let (download, tries) = self.download_with_retry(&source.url, dest).await?;
                attempts += tries;

                match verify_download(dest, source, &download).await {
                    Ok(()) => {
                        info!(
                            bytes = download.byte_size,
                            sha256 = %download.sha256,
                            attempts,
                            "archive downloaded and verified"
                        );
                        return Ok(FetchedArchive {
                            source: source.clone(),
                            path: dest.to_path_buf(),
                            final_url: download.final_url,
                            byte_size: download.byte_size,
                            sha256: download.sha256,
                            attempts,
                        });
                    }
                    Err(reason) => {
                        warn!(integrity_attempt, %reason, "discarding corrupt download");
                        let _ = fs::remove_file(dest).await;
                        last_reason = reason;
                    }
                }
            }

            Err(FetchError::Corrupt {
                url: source.url.clone(),
                reason: last_reason,
            })
        }
        .instrument(span)
        .await
    }

    async fn download_with_retry(
        &self,
        url: &str,
        dest: &Path,
    ) -> Result<(Download, usize), FetchError> {
        let mut attempt = 0usize;
        loop {
            match self.download_once(url, dest).await {
                Ok(download) => return Ok((download, attempt + 1)),
                Err(err)
                    if err.disposition() == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries =>
                {
                    let delay = self.backoff.delay_for_attempt(attempt);
                    warn!(attempt, ?delay, error = %err, "transient fetch failure; backing off");
                    let _ = fs::remove_file(dest).await;
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    let _ = fs::remove_file(dest).await;
                    return Err(err);
                }
            }
        }
    }

    async fn download_once(&self, url: &str, dest: &Path) -> Result<Download, FetchError> {
        let parsed = Url::parse(url).map_err(|_| FetchError::InvalidUrl(url.to_string()))?;
        match parsed.scheme() {
            "file" => {
                let src = parsed
                    .to_file_path()
                    .map_err(|_| FetchError::InvalidUrl(url.to_string()))?;
                copy_local(&src, dest, url).await
            }
            "http" | "https" => self.download_http(parsed, dest).await,
            _ => Err(FetchError::InvalidUrl(url.to_string())),
        }
    }

    async fn download_http(&self, url: Url, dest: &Path) -> Result<Download, FetchError> {
        let url_text = url.to_string();
        let request_error = |source| FetchError::Request {
            url: url_text.clone(),
            source,
        };

        let mut resp = self.client.get(url.clone()).send().await.map_err(request_error)?;
        let status = resp.status();
        let final_url = resp.url().to_string();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }
        let content_length = resp.content_length();

        let mut file = fs::File::create(dest)
            .await
            .map_err(|e| FetchError::io(dest, e))?;
        let mut hasher = Sha256::new();
        let mut byte_size = 0u64;
        while let Some(chunk) = resp.chunk().await.map_err(request_error)? {
            hasher.update(&chunk);
            byte_size += chunk.len() as u64;
            file.write_all(&chunk)
                .await
                .map_err(|e| FetchError::io(dest, e))?;
        }
        file.flush().await.map_err(|e| FetchError::io(dest, e))?;

        Ok(Download {
            final_url,
            byte_size,
            sha256: hex::encode(hasher.finalize()),
            content_length,
        })
    }
}

async fn copy_local(src: &Path, dest: &Path, url: &str) -> Result<Download, FetchError> {
    let mut input = fs::File::open(src)
        .await
        .map_err(|e| FetchError::io(src, e))?;
    let mut output = fs::File::create(dest)
        .await
        .map_err(|e| FetchError::io(dest, e))?;
    let mut hasher = Sha256::new();
    let mut byte_size = 0u64;
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = input.read(&mut buf).await.map_err(|e| FetchError::io(src, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        byte_size += n as u64;
        output
            .write_all(&buf[..n])
            .await
            .map_err(|e| FetchError::io(dest, e))?;
    }
    output.flush().await.map_err(|e| FetchError::io(dest, e))?;

    Ok(Download {
        final_url: url.to_string(),
        byte_size,
        sha256: hex::encode(hasher.finalize()),
        content_length: None,
    })
}

async fn verify_download(
    path: &Path,
    source: &SourceDescriptor,
    download: &Download,
) -> Result<(), String> {
    if download.byte_size == 0 {
        return Err("empty download".to_string());
    }
    if let Some(expected) = download.content_length {
        if expected != download.byte_size {
            return Err(format!(
                "truncated download: expected {expected} bytes, got {}",
                download.byte_size
            ));
        }
    }
    if let Some(expected) = &source.sha256 {
        if !expected.eq_ignore_ascii_case(&download.sha256) {
            return Err(format!(
                "checksum mismatch: expected {expected}, got {}",
                download.sha256
            ));
        }
    }

    let path = path.to_path_buf();
    let format = source.expected_format;
    tokio::task::spawn_blocking(move || verify_container(&path, format))
        .await
        .map_err(|e| format!("verification task failed: {e}"))?
}

/// Signature + structural check of a container on disk.
pub fn verify_container(path: &Path, format: ArchiveFormat) -> Result<(), String> {
    let mut file = File::open(path).map_err(|e| format!("opening {}: {e}", path.display()))?;
    let signature = format.signature();
    let mut head = vec![0u8; signature.len()];
    file.read_exact(&mut head)
        .map_err(|_| "shorter than the container signature".to_string())?;
    if head != signature {
        return Err(format!("not a {format:?} container (bad signature)"));
    }

    match format {
        ArchiveFormat::Zip => {
            let file =
                File::open(path).map_err(|e| format!("reopening {}: {e}", path.display()))?;
            zip::ZipArchive::new(file)
                .map(|_| ())
                .map_err(|e| format!("unreadable zip central directory: {e}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sepa_core::RetailerGroup;
    use std::io::Write;
    use tempfile::tempdir;

    fn descriptor(url: String) -> SourceDescriptor {
        SourceDescriptor {
            url,
            retailer_group: RetailerGroup::sepa(),
            expected_format: ArchiveFormat::Zip,
            label: Some("sepa lunes".into()),
            sha256: None,
        }
    }

    fn write_zip(path: &Path) {
        let file = File::create(path).expect("create zip");
        let mut writer = zip::ZipWriter::new(file);
        writer
            .start_file("productos.csv", zip::write::SimpleFileOptions::default())
            .expect("start file");
        writer.write_all(b"id_producto|precio\n1|2\n").expect("write");
        writer.finish().expect("finish");
    }

    fn fast_fetcher() -> HttpFetcher {
        HttpFetcher::new(HttpClientConfig {
            backoff: BackoffPolicy {
                max_retries: 1,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
            },
            ..Default::default()
        })
        .expect("fetcher")
    }

    #[test]
    fn hashing_is_stable() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn server_errors_retry_client_errors_do_not() {
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), RetryDisposition::Retryable);
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(classify_status(StatusCode::NOT_FOUND), RetryDisposition::NonRetryable);
        let err = FetchError::HttpStatus {
            status: 404,
            url: "https://example.invalid/x.zip".into(),
        };
        assert_eq!(err.disposition(), RetryDisposition::NonRetryable);
    }

    #[test]
    fn workspace_is_removed_on_close() {
        let root = tempdir().expect("tempdir");
        let ws = RunWorkspace::create(root.path(), Uuid::new_v4()).expect("workspace");
        let inner = ws.path().to_path_buf();
        assert!(ws.downloads_dir().is_dir());
        assert!(ws.extract_dir().is_dir());
        let archive = ws.archive_path(3, &descriptor("file:///x".into()));
        assert!(archive.ends_with("downloads/03-sepa-lunes.zip"));
        ws.close().expect("close");
        assert!(!inner.exists());
    }

    #[tokio::test]
    async fn local_archive_is_copied_and_verified() {
        let dir = tempdir().expect("tempdir");
        let src = dir.path().join("src.zip");
        write_zip(&src);
        let expected_sha = sha256_hex(&std::fs::read(&src).expect("read"));
        let dest = dir.path().join("dest.zip");

        let mut source = descriptor(format!("file://{}", src.display()));
        source.sha256 = Some(expected_sha.to_uppercase());
        let fetched = fast_fetcher()
            .fetch_archive(Uuid::new_v4(), &source, &dest)
            .await
            .expect("fetch");

        assert_eq!(fetched.sha256, expected_sha);
        assert_eq!(fetched.attempts, 1);
        assert!(fetched.byte_size > 0);
        assert!(dest.exists());
    }

    #[tokio::test]
    async fn corrupt_archive_is_refetched_once_then_reported() {
        let dir = tempdir().expect("tempdir");
        let src = dir.path().join("broken.zip");
        std::fs::write(&src, b"<html>maintenance</html>").expect("write");
        let dest = dir.path().join("dest.zip");

        let err = fast_fetcher()
            .fetch_archive(
                Uuid::new_v4(),
                &descriptor(format!("file://{}", src.display())),
                &dest,
            )
            .await
            .expect_err("corrupt");

        assert!(matches!(err, FetchError::Corrupt { .. }));
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn checksum_mismatch_is_corrupt() {
        let dir = tempdir().expect("tempdir");
        let src = dir.path().join("src.zip");
        write_zip(&src);
        let mut source = descriptor(format!("file://{}", src.display()));
        source.sha256 = Some("00".repeat(32));

        let err = fast_fetcher()
            .fetch_archive(Uuid::new_v4(), &source, &dir.path().join("dest.zip"))
            .await
            .expect_err("mismatch");
        assert!(err.to_string().contains("checksum mismatch"));
    }

    #[tokio::test]
    async fn missing_local_file_and_bad_scheme_are_not_retried() {
        let dir = tempdir().expect("tempdir");
        let dest = dir.path().join("dest.zip");
        let fetcher = fast_fetcher();

        let err = fetcher
            .fetch_archive(
                Uuid::new_v4(),
                &descriptor(format!("file://{}/absent.zip", dir.path().display())),
                &dest,
            )
            .await
            .expect_err("missing");
        assert!(matches!(err, FetchError::Io { .. }));

        let err = fetcher
            .fetch_archive(Uuid::new_v4(), &descriptor("ftp://example.invalid/a.zip".into()), &dest)
            .await
            .expect_err("scheme");
        assert!(matches!(err, FetchError::InvalidUrl(_)));
    }

    #[test]
    fn container_verification_rejects_truncated_zip() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("a.zip");
        write_zip(&path);
        assert!(verify_container(&path, ArchiveFormat::Zip).is_ok());

        let bytes = std::fs::read(&path).expect("read");
        std::fs::write(&path, &bytes[..bytes.len() / 2]).expect("truncate");
        let err = verify_container(&path, ArchiveFormat::Zip).expect_err("truncated");
        assert!(err.contains("central directory"));
    }
}
