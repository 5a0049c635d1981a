//! Snapshot persistence, JSON side files and the paced HTTP client used to
//! probe listing pages.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::{DateTime, Utc};
use reqwest::header::RETRY_AFTER;
use reqwest::StatusCode;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

mod snapshot;

pub use snapshot::{MemorySnapshotStore, SnapshotStore, SqliteSnapshotStore, StoreError};

pub const CRATE_NAME: &str = "larentals-storage";

pub fn content_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    /// The same content was already on disk under this stamp.
    pub deduplicated: bool,
}

/// Write-once JSON side files: raw batch archives and failed-merge dumps.
///
/// Layout is `<root>/<namespace>/<stamp>_<hash12>.json`.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn side_file_path(&self, stamp: DateTime<Utc>, namespace: &str, hash: &str) -> PathBuf {
        let short = &hash[..hash.len().min(12)];
        namespace_dir(namespace).join(format!("{}_{short}.json", stamp.format("%Y%m%dT%H%M%SZ")))
    }

    pub async fn store_json<T: Serialize + ?Sized>(
        &self,
        stamp: DateTime<Utc>,
        namespace: &str,
        value: &T,
    ) -> anyhow::Result<StoredArtifact> {
        let bytes = serde_json::to_vec_pretty(value).context("serializing side file")?;
        let hash = content_hash(&bytes);
        let relative_path = self.side_file_path(stamp, namespace, &hash);
        let absolute_path = self.root.join(&relative_path);

        let deduplicated = fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking {}", absolute_path.display()))?;
        if deduplicated {
            debug!(path = %absolute_path.display(), "side file already present");
        } else {
            write_atomically(&absolute_path, &bytes).await?;
        }

        Ok(StoredArtifact {
            content_hash: hash,
            relative_path,
            absolute_path,
            byte_size: bytes.len(),
            deduplicated,
        })
    }
}

/// Namespace segments as nested directories; empty and `..` parts are dropped.
fn namespace_dir(namespace: &str) -> PathBuf {
    namespace
        .split('/')
        .filter(|part| !part.is_empty() && *part != "..")
        .collect()
}

/// Readers never observe a partial file: write a sibling temp file, then rename.
async fn write_atomically(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let dir = path.parent().context("side file path has no parent directory")?;
    fs::create_dir_all(dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;

    let partial = dir.join(format!(".{}.partial", Uuid::new_v4()));
    fs::write(&partial, bytes)
        .await
        .with_context(|| format!("writing {}", partial.display()))?;
    if let Err(err) = fs::rename(&partial, path).await {
        let _ = fs::remove_file(&partial).await;
        return Err(err).with_context(|| format!("moving side file into {}", path.display()));
    }
    Ok(())
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
            max_retries: 2,
            base_delay: Duration::from_millis(750),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry `attempt` (0-based). A server `Retry-After` wins but
    /// is still capped by `max_delay`.
    pub fn delay(&self, attempt: usize, retry_after: Option<Duration>) -> Duration {
        let computed = retry_after.unwrap_or_else(|| {
            let factor = 2u32.checked_pow(attempt as u32).unwrap_or(u32::MAX);
            self.base_delay.saturating_mul(factor)
        });
        computed.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub max_in_flight: usize,
    pub per_host_in_flight: usize,
    /// Minimum spacing between request starts against one host.
    pub min_host_interval: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            user_agent: None,
            max_in_flight: 8,
            per_host_in_flight: 2,
            min_host_interval: Duration::from_millis(500),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// What a listing URL answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListingPage {
    /// Served normally; the body may still carry an off-market notice.
    Live { final_url: String, body: String },
    /// 404 or 410.
    Gone { status: u16 },
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("invalid url {url}")]
    InvalidUrl { url: String },
}

impl FetchError {
    /// True when the remote side could not be reached at all.
    pub fn is_unreachable(&self) -> bool {
        match self {
            FetchError::Request(err) => err.is_connect() || err.is_timeout(),
            _ => false,
        }
    }
}

fn retryable_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

fn retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

#[derive(Debug)]
struct HostSlot {
    permits: Arc<Semaphore>,
    next_request: Instant,
}

/// Shared client for listing pages, bounded globally and per host, with
/// per-host pacing and retry on transient failures.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    in_flight: Semaphore,
    per_host_in_flight: usize,
    min_host_interval: Duration,
    hosts: Mutex<HashMap<String, HostSlot>>,
    backoff: BackoffPolicy,
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

        Ok(Self {
            client: builder.build().context("building http client")?,
            in_flight: Semaphore::new(config.max_in_flight.max(1)),
            per_host_in_flight: config.per_host_in_flight.max(1),
            min_host_interval: config.min_host_interval,
            hosts: Mutex::new(HashMap::new()),
            backoff: config.backoff,
        })
    }

    fn new_slot(&self) -> HostSlot {
        HostSlot {
            permits: Arc::new(Semaphore::new(self.per_host_in_flight)),
            next_request: Instant::now(),
        }
    }

    async fn host_permits(&self, host: &str) -> Arc<Semaphore> {
        let mut hosts = self.hosts.lock().await;
        let slot = hosts.entry(host.to_string()).or_insert_with(|| self.new_slot());
        Arc::clone(&slot.permits)
    }

    /// Reserves the next start slot for `host` and sleeps until it arrives.
    async fn pace(&self, host: &str) {
        let wait = {
            let mut hosts = self.hosts.lock().await;
            let slot = hosts.entry(host.to_string()).or_insert_with(|| self.new_slot());
            let now = Instant::now();
            let start = slot.next_request.max(now);
            slot.next_request = start + self.min_host_interval;
            start - now
        };
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }

    pub async fn fetch_listing_page(&self, run_id: Uuid, url: &str) -> Result<ListingPage, FetchError> {
        let host = reqwest::Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(ToString::to_string))
            .ok_or_else(|| FetchError::InvalidUrl { url: url.to_string() })?;

        let span = info_span!("listing_fetch", %run_id, %host, url);
        self.fetch_paced(&host, url).instrument(span).await
    }

    async fn fetch_paced(&self, host: &str, url: &str) -> Result<ListingPage, FetchError> {
        // Semaphores are never closed.
        let _global = self.in_flight.acquire().await.ok();
        let permits = self.host_permits(host).await;
        let _host = permits.acquire().await.ok();

        let mut attempt = 0;
        loop {
            self.pace(host).await;
            let (reason, retry_after) = match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        let final_url = resp.url().to_string();
                        let body = resp.text().await?;
                        return Ok(ListingPage::Live { final_url, body });
                    }
                    if matches!(status, StatusCode::NOT_FOUND | StatusCode::GONE) {
                        return Ok(ListingPage::Gone {
                            status: status.as_u16(),
                        });
                    }
                    if !retryable_status(status) || attempt >= self.backoff.max_retries {
                        return Err(FetchError::HttpStatus {
                            status: status.as_u16(),
                            url: resp.url().to_string(),
                        });
                    }
                    let retry_after = resp
                        .headers()
                        .get(RETRY_AFTER)
                        .and_then(|v| v.to_str().ok())
                        .and_then(|v| v.trim().parse::<u64>().ok())
                        .map(Duration::from_secs);
                    (format!("status {}", status.as_u16()), retry_after)
                }
                Err(err) => {
                    if !retryable_error(&err) || attempt >= self.backoff.max_retries {
                        return Err(FetchError::Request(err));
                    }
                    (err.to_string(), None)
                }
            };

            let delay = self.backoff.delay(attempt, retry_after);
            warn!(attempt, %reason, ?delay, "retrying listing page");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn stamp() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-06-01T08:30:00Z")
            .expect("ts")
            .with_timezone(&Utc)
    }

    #[test]
    fn side_files_are_namespaced_and_hash_suffixed() {
        let store = ArtifactStore::new("/tmp/artifacts");
        let hash = content_hash(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
        assert_eq!(
            store.side_file_path(stamp(), "failed-merge/lease", &hash),
            PathBuf::from("failed-merge/lease/20250601T083000Z_b94d27b9934d.json")
        );
        assert_eq!(
            store.side_file_path(stamp(), "../raw//buy", &hash),
            PathBuf::from("raw/buy/20250601T083000Z_b94d27b9934d.json")
        );
    }

    #[tokio::test]
    async fn repeated_dumps_resolve_to_one_file() {
        let dir = tempdir().expect("tempdir");
        let store = ArtifactStore::new(dir.path());

        let first = store
            .store_json(stamp(), "failed-merge/buy", &vec!["A1", "B2"])
            .await
            .expect("first store");
        let second = store
            .store_json(stamp(), "failed-merge/buy", &vec!["A1", "B2"])
            .await
            .expect("second store");

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.relative_path, second.relative_path);
        let written = std::fs::read_to_string(&first.absolute_path).expect("read dump");
        assert!(written.contains("B2"));
        let files = std::fs::read_dir(dir.path().join("failed-merge").join("buy"))
            .expect("dump dir")
            .count();
        assert_eq!(files, 1);
    }

    #[test]
    fn backoff_doubles_and_caps_including_retry_after() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay(0, None), Duration::from_millis(100));
        assert_eq!(policy.delay(1, None), Duration::from_millis(200));
        assert_eq!(policy.delay(2, None), Duration::from_millis(350));
        assert_eq!(policy.delay(40, None), Duration::from_millis(350));
        assert_eq!(policy.delay(0, Some(Duration::from_millis(250))), Duration::from_millis(250));
        assert_eq!(policy.delay(0, Some(Duration::from_secs(60))), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn requests_to_one_host_are_spaced_out() {
        let fetcher = HttpFetcher::new(HttpClientConfig {
            min_host_interval: Duration::from_millis(60),
            ..HttpClientConfig::default()
        })
        .expect("fetcher");

        let started = Instant::now();
        fetcher.pace("listings.example").await;
        fetcher.pace("other.example").await;
        assert!(started.elapsed() < Duration::from_millis(60));
        fetcher.pace("listings.example").await;
        assert!(started.elapsed() >= Duration::from_millis(60));
    }

    #[tokio::test]
    async fn malformed_urls_are_rejected_before_any_request() {
        let fetcher = HttpFetcher::new(HttpClientConfig::default()).expect("fetcher");
        let err = fetcher
            .fetch_listing_page(Uuid::new_v4(), "not a url")
            .await
            .expect_err("invalid");
        assert!(matches!(err, FetchError::InvalidUrl { .. }));
        assert!(!err.is_unreachable());
    }
}
