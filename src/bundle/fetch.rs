//! Payload download with streaming SHA-256.

use futures_util::StreamExt;
use sha2::{Digest, Sha256};
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use url::Url;

/// Download failures.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("request to {url} failed: {reason}")]
    Request { url: String, reason: String },

    #[error("{url} answered http={status}")]
    Status { url: String, status: u16 },

    #[error("download exceeded {0}s")]
    Timeout(u64),

    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("cannot write payload: {0}")]
    Io(#[from] std::io::Error),
}

/// Result of a completed download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedPayload {
    pub bytes: u64,
    /// Lowercase SHA-256 hex of the payload.
    pub sha256: String,
}

/// Stream `url` into `dest`, hashing as it goes.
///
/// The whole transfer (connect, headers, body) is bounded by `timeout`. A
/// partial file is removed on any failure.
///
/// # Errors
///
/// Returns a [`FetchError`] for transport failures, non-2xx answers, the
/// deadline, disk errors, or a digest that differs from `expected_sha256`.
pub async fn download(
    client: &reqwest::Client,
    url: &Url,
    dest: &Path,
    timeout: Duration,
    expected_sha256: Option<&str>,
) -> Result<FetchedPayload, FetchError> {
    let result = match tokio::time::timeout(timeout, stream_to_file(client, url, dest)).await {
        Ok(result) => result,
        Err(_) => Err(FetchError::Timeout(timeout.as_secs())),
    };

    let outcome = result.and_then(|payload| match expected_sha256 {
        Some(expected) if !payload.sha256.eq_ignore_ascii_case(expected) => {
            Err(FetchError::ChecksumMismatch {
                expected: expected.to_owned(),
                actual: payload.sha256,
            })
        }
        _ => Ok(payload),
    });

    if outcome.is_err() {
        let _ = tokio::fs::remove_file(dest).await;
    }
    outcome
}

async fn stream_to_file(
    client: &reqwest::Client,
    url: &Url,
    dest: &Path,
) -> Result<FetchedPayload, FetchError> {
    let resp = client
        .get(url.clone())
        .send()
        .await
        .map_err(|e| FetchError::Request {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
    let status = resp.status();
    if !status.is_success() {
        return Err(FetchError::Status {
            url: url.to_string(),
            status: status.as_u16(),
        });
    }

    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = tokio::fs::File::create(dest).await?;
    let mut hasher = Sha256::new();
    let mut bytes = 0u64;
    let mut stream = resp.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| FetchError::Request {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        hasher.update(&chunk);
        file.write_all(&chunk).await?;
        bytes += chunk.len() as u64;
    }
    file.flush().await?;
    file.sync_all().await?;

    Ok(FetchedPayload {
        bytes,
        sha256: format!("{:x}", hasher.finalize()),
    })
}
