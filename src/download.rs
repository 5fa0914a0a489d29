//! Artifact download collaborator.
//!
//! The installer fetches payloads through the [`Downloader`] trait so tests
//! can substitute an in-memory implementation. [`HttpDownloader`] is the real
//! one:
//!
//! - **Resume**: partial bodies are kept in `<cache>/partial/<sha256(url)>.part`
//!   and continued with an HTTP `Range` request
//! - **Retry**: transport errors and checksum mismatches are retried a bounded
//!   number of times with exponential backoff
//! - **Verify**: the body must hash to the checksum the formula declares

use sha2::{Digest, Sha256};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);
const INITIAL_BACKOFF: Duration = Duration::from_millis(250);

#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("HTTP request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} returned status {status}")]
    Status { url: String, status: u16 },

    #[error("I/O error while downloading {url}: {source}")]
    Io {
        url: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },
}

impl DownloadError {
    fn io(url: &str, source: std::io::Error) -> Self {
        DownloadError::Io {
            url: url.to_string(),
            source,
        }
    }
}

/// Fetches artifact bytes and verifies them against an expected SHA-256
pub trait Downloader: Send + Sync + 'static {
    fn fetch(
        &self,
        url: &str,
        expected_sha256: &str,
    ) -> impl Future<Output = Result<Vec<u8>, DownloadError>> + Send;
}

/// SHA-256 of a byte slice as lowercase hex
pub fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Verify `bytes` against `expected` (case-insensitive hex)
pub fn verify_checksum(bytes: &[u8], expected: &str) -> Result<(), DownloadError> {
    let actual = sha256_hex(bytes);
    if actual.eq_ignore_ascii_case(expected) {
        Ok(())
    } else {
        Err(DownloadError::ChecksumMismatch {
            expected: expected.to_string(),
            actual,
        })
    }
}

/// HTTP downloader with resume and bounded retries
#[derive(Debug, Clone)]
pub struct HttpDownloader {
    client: reqwest::Client,
    partial_dir: PathBuf,
    retries: u32,
}

impl HttpDownloader {
    pub fn new(cache_root: &Path, retries: u32) -> Result<Self, DownloadError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .pool_idle_timeout(Duration::from_secs(90)) // HTTP keep-alive standard
            .user_agent(format!("keg/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|source| DownloadError::Http {
                url: String::new(),
                source,
            })?;

        Ok(Self {
            client,
            partial_dir: cache_root.join("partial"),
            retries,
        })
    }

    fn partial_path(&self, url: &str) -> PathBuf {
        self.partial_dir
            .join(format!("{}.part", sha256_hex(url.as_bytes())))
    }

    /// One attempt: continue the partial file, then return the full body
    async fn attempt(&self, url: &str, partial: &Path) -> Result<Vec<u8>, DownloadError> {
        let offset = match fs::metadata(partial).await {
            Ok(meta) => meta.len(),
            Err(_) => 0,
        };

        let mut request = self.client.get(url);
        if url.starts_with("https://ghcr.io/") {
            // GHCR serves public bottles to an anonymous bearer token
            request = request.bearer_auth("QQ==");
        }
        if offset > 0 {
            request = request.header(reqwest::header::RANGE, format!("bytes={}-", offset));
        }

        let mut response = request.send().await.map_err(|source| DownloadError::Http {
            url: url.to_string(),
            source,
        })?;

        let status = response.status();
        let append = match status.as_u16() {
            206 => true,
            200 => false,
            // Partial file is already complete or stale
            416 => {
                let _ = fs::remove_file(partial).await;
                return Err(DownloadError::Status {
                    url: url.to_string(),
                    status: 416,
                });
            }
            code => {
                return Err(DownloadError::Status {
                    url: url.to_string(),
                    status: code,
                });
            }
        };

        let mut file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .append(append)
            .truncate(!append)
            .open(partial)
            .await
            .map_err(|e| DownloadError::io(url, e))?;

        while let Some(chunk) = response.chunk().await.map_err(|source| DownloadError::Http {
            url: url.to_string(),
            source,
        })? {
            file.write_all(&chunk)
                .await
                .map_err(|e| DownloadError::io(url, e))?;
        }
        file.flush().await.map_err(|e| DownloadError::io(url, e))?;
        drop(file);

        fs::read(partial).await.map_err(|e| DownloadError::io(url, e))
    }
}

impl Downloader for HttpDownloader {
    async fn fetch(&self, url: &str, expected_sha256: &str) -> Result<Vec<u8>, DownloadError> {
        fs::create_dir_all(&self.partial_dir)
            .await
            .map_err(|e| DownloadError::io(url, e))?;
        let partial = self.partial_path(url);

        let mut backoff = INITIAL_BACKOFF;
        let mut attempt = 0;
        loop {
            let result = self
                .attempt(url, &partial)
                .await
                .and_then(|bytes| verify_checksum(&bytes, expected_sha256).map(|()| bytes));

            match result {
                Ok(bytes) => {
                    let _ = fs::remove_file(&partial).await;
                    return Ok(bytes);
                }
                Err(e) if attempt < self.retries => {
                    if matches!(e, DownloadError::ChecksumMismatch { .. }) {
                        // Never resume from a corrupt prefix
                        let _ = fs::remove_file(&partial).await;
                    }
                    attempt += 1;
                    tracing::warn!(
                        "Download of {} failed (attempt {}/{}): {}",
                        url,
                        attempt,
                        self.retries + 1,
                        e
                    );
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
                Err(e) => {
                    if matches!(e, DownloadError::ChecksumMismatch { .. }) {
                        let _ = fs::remove_file(&partial).await;
                    }
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verify_checksum() {
        let sum = sha256_hex(b"hello");
        assert_eq!(
            sum,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        assert!(verify_checksum(b"hello", &sum.to_uppercase()).is_ok());
        assert!(matches!(
            verify_checksum(b"hellO", &sum),
            Err(DownloadError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_partial_path_is_keyed_by_url() {
        let dir = tempfile::TempDir::new().unwrap();
        let downloader = HttpDownloader::new(dir.path(), 0).unwrap();
        let a = downloader.partial_path("https://example.com/a.tar.gz");
        let b = downloader.partial_path("https://example.com/b.tar.gz");
        assert_ne!(a, b);
        assert!(a.starts_with(dir.path().join("partial")));
        assert_eq!(a.extension().unwrap(), "part");
    }
}
