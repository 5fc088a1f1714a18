// src/downloader.rs

use crate::models::PauseReason;
use futures_util::StreamExt;
use reqwest::header::{ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_RANGE, RANGE, USER_AGENT};
use reqwest::{Client, StatusCode};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tokio_util::sync::CancellationToken;

/// Progress is handed to the owner in batches of this many bytes.
const PROGRESS_BATCH_BYTES: u64 = 64 * 1024;

/// Custom errors for segment fetches.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("network error: {0}")]
    Network(String),
    #[error("link expired or unauthorized (HTTP {0})")]
    LinkExpired(StatusCode),
    #[error("server returned HTTP {0}")]
    Http(StatusCode),
    #[error("disk error: {0}")]
    Disk(#[from] std::io::Error),
    #[error("server ignored the range request")]
    RangeIgnored,
    #[error("fetch cancelled")]
    Cancelled,
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        match e.status() {
            Some(status) => classify_status(status),
            None => FetchError::Network(e.to_string()),
        }
    }
}

impl FetchError {
    /// Transient failures are retried and, if they persist, pause the task.
    pub fn is_transient(&self) -> bool {
        matches!(self, FetchError::Network(_))
    }

    /// The pause reason this failure maps to, or `None` if it is fatal.
    pub fn pause_reason(&self) -> Option<PauseReason> {
        match self {
            FetchError::Network(_) | FetchError::RangeIgnored => Some(PauseReason::NetworkError),
            FetchError::LinkExpired(_) => Some(PauseReason::LinkExpired),
            FetchError::Cancelled => Some(PauseReason::UserRequest),
            FetchError::Http(_) | FetchError::Disk(_) => None,
        }
    }
}

/// Maps a non-success HTTP status onto the failure taxonomy.
pub fn classify_status(status: StatusCode) -> FetchError {
    match status.as_u16() {
        401 | 403 => FetchError::LinkExpired(status),
        408 | 429 | 500..=599 => FetchError::Network(format!("server returned HTTP {}", status)),
        _ => FetchError::Http(status),
    }
}

/// What a probe learned about the remote file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteFile {
    pub total_bytes: Option<u64>,
    pub accepts_ranges: bool,
}

/// Finds the file size and range support, with a ranged GET fallback for
/// servers that block, drop or under-report HEAD.
pub async fn probe(
    client: &Client,
    url: &str,
    user_agent: &str,
    timeout: Duration,
) -> Result<RemoteFile, FetchError> {
    let head = client
        .head(url)
        .header(USER_AGENT, user_agent)
        .timeout(timeout)
        .send()
        .await;

    let mut head_length = None;
    match head {
        Ok(head) => {
            let head_status = head.status();
            tracing::debug!("HEAD {} -> {}", url, head_status);
            if matches!(head_status.as_u16(), 401 | 403) {
                return Err(classify_status(head_status));
            }
            if head_status.is_success() {
                head_length = header_u64(head.headers(), CONTENT_LENGTH).filter(|len| *len > 0);
                let advertises_ranges = head
                    .headers()
                    .get(ACCEPT_RANGES)
                    .and_then(|v| v.to_str().ok())
                    .map(|v| v.contains("bytes"))
                    .unwrap_or(false);
                if let (Some(len), true) = (head_length, advertises_ranges) {
                    return Ok(RemoteFile {
                        total_bytes: Some(len),
                        accepts_ranges: true,
                    });
                }
            }
        }
        Err(e) => tracing::debug!("HEAD {} failed ({}), trying a ranged GET", url, e),
    }

    let get = client
        .get(url)
        .header(USER_AGENT, user_agent)
        .header(RANGE, "bytes=0-0")
        .timeout(timeout)
        .send()
        .await?;
    let status = get.status();
    tracing::debug!("ranged GET probe {} -> {}", url, status);

    if status == StatusCode::PARTIAL_CONTENT {
        let total = get
            .headers()
            .get(CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_content_range_total);
        return Ok(RemoteFile {
            total_bytes: total.or(head_length),
            accepts_ranges: total.is_some(),
        });
    }
    if status.is_success() {
        return Ok(RemoteFile {
            total_bytes: header_u64(get.headers(), CONTENT_LENGTH)
                .filter(|len| *len > 0)
                .or(head_length),
            accepts_ranges: false,
        });
    }
    Err(classify_status(status))
}

fn header_u64(headers: &reqwest::header::HeaderMap, name: reqwest::header::HeaderName) -> Option<u64> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
}

/// `bytes 0-0/1234` -> `Some(1234)`; `bytes 0-0/*` -> `None`.
pub fn parse_content_range_total(value: &str) -> Option<u64> {
    value.rsplit('/').next()?.trim().parse().ok()
}

/// One fetch assignment: bytes `offset..=end` of `url` into `path` at `offset`.
#[derive(Debug, Clone)]
pub struct SegmentRequest {
    pub url: String,
    pub path: PathBuf,
    pub offset: u64,
    /// Inclusive end; `None` streams to EOF.
    pub end: Option<u64>,
    /// Send a `Range` header. Off for servers that do not support ranges.
    pub ranged: bool,
    pub user_agent: String,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
}

/// How many times, and how patiently, to retry transient failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn delay(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(2u32.saturating_pow(attempt.min(4)))
    }
}

/// Fetches the segment, retrying transient failures from the last written
/// offset. Returns the number of bytes written across all attempts.
pub async fn fetch_segment_with_retry<F>(
    client: &Client,
    request: &SegmentRequest,
    policy: RetryPolicy,
    cancel: &CancellationToken,
    on_progress: F,
) -> Result<u64, FetchError>
where
    F: Fn(u64) + Send + Sync,
{
    let mut attempt = 0u32;
    let mut written = 0u64;
    loop {
        let mut current = request.clone();
        if request.ranged {
            current.offset = request.offset + written;
        } else {
            written = 0;
        }
        if let Some(end) = current.end {
            if current.offset > end {
                return Ok(written);
            }
        }

        let mut attempt_bytes = 0u64;
        let result = fetch_segment(client, &current, cancel, |delta| {
            attempt_bytes += delta;
            on_progress(delta);
        })
        .await;
        written += attempt_bytes;

        match result {
            Ok(_) => return Ok(written),
            Err(e) if e.is_transient() && attempt < policy.retries && request.ranged => {
                let delay = policy.delay(attempt);
                attempt += 1;
                tracing::warn!(
                    "segment at {} failed ({}), retry {}/{} in {:?}",
                    current.offset,
                    e,
                    attempt,
                    policy.retries,
                    delay
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                }
            }
            Err(e) => return Err(e),
        }
    }
}

/// Performs one GET and writes the body at `request.offset`.
///
/// Progress is reported through `on_progress` in batches, and whatever was
/// written is always reported before returning, success or not.
pub async fn fetch_segment<F>(
    client: &Client,
    request: &SegmentRequest,
    cancel: &CancellationToken,
    mut on_progress: F,
) -> Result<u64, FetchError>
where
    F: FnMut(u64) + Send,
{
    let mut builder = client
        .get(&request.url)
        .header(USER_AGENT, &request.user_agent);
    if request.ranged {
        let range = match request.end {
            Some(end) => format!("bytes={}-{}", request.offset, end),
            None => format!("bytes={}-", request.offset),
        };
        builder = builder.header(RANGE, range);
    }

    let resp = tokio::select! {
        resp = tokio::time::timeout(request.connect_timeout, builder.send()) => match resp {
            Ok(resp) => resp?,
            Err(_) => return Err(FetchError::Network("request timed out".into())),
        },
        _ = cancel.cancelled() => return Err(FetchError::Cancelled),
    };

    let status = resp.status();
    if !status.is_success() {
        return Err(classify_status(status));
    }
    if request.ranged && status != StatusCode::PARTIAL_CONTENT && request.offset > 0 {
        return Err(FetchError::RangeIgnored);
    }

    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .open(&request.path)
        .await?;
    file.seek(SeekFrom::Start(request.offset)).await?;

    let mut remaining = request.end.map(|end| end + 1 - request.offset);
    let mut unreported = 0u64;
    let mut written = 0u64;
    let mut stream = resp.bytes_stream();

    let outcome: Result<(), FetchError> = async {
        loop {
            if remaining == Some(0) {
                return Ok(());
            }
            let next = tokio::select! {
                next = tokio::time::timeout(request.read_timeout, stream.next()) => next,
                _ = cancel.cancelled() => return Err(FetchError::Cancelled),
            };
            let chunk = match next {
                Ok(Some(chunk)) => chunk?,
                Ok(None) => break,
                Err(_) => return Err(FetchError::Network("read timed out".into())),
            };

            let take = match remaining {
                Some(left) => (chunk.len() as u64).min(left) as usize,
                None => chunk.len(),
            };
            file.write_all(&chunk[..take]).await?;
            written += take as u64;
            unreported += take as u64;
            if let Some(left) = remaining.as_mut() {
                *left -= take as u64;
            }
            if unreported >= PROGRESS_BATCH_BYTES {
                on_progress(unreported);
                unreported = 0;
            }
        }
        match remaining {
            Some(left) if left > 0 => Err(FetchError::Network(format!(
                "connection closed with {} bytes left",
                left
            ))),
            _ => Ok(()),
        }
    }
    .await;

    // Bytes that reached the file are kept even when the fetch fails.
    let flushed = file.flush().await;
    if unreported > 0 {
        on_progress(unreported);
    }
    outcome?;
    flushed?;
    Ok(written)
}
