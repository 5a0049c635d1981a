//! Enrichment collaborators. Network work happens up front; the merge only
//! consults the precomputed lookup tables built here.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use larentals_storage::{HttpFetcher, ListingPage};
use once_cell::sync::Lazy;
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CollaboratorError {
    /// The collaborator cannot answer for anyone; callers degrade instead of aborting.
    #[error("enrichment collaborator unavailable: {0}")]
    Unavailable(String),
    #[error("enrichment failed for {listing_id}: {reason}")]
    Record { listing_id: String, reason: String },
}

pub trait ExpiryCheck: Send + Sync {
    /// `true` means the listing page is gone and the record should be removed.
    fn is_expired(&self, listing_id: &str, url: &str) -> Result<bool, CollaboratorError>;
}

pub trait Geocoder: Send + Sync {
    /// `(latitude, longitude)` for a full street address.
    fn geocode(&self, address: &str) -> Option<(f64, f64)>;
}

pub trait AddressLookup: Send + Sync {
    fn city(&self, address: &str) -> Option<String>;
    fn zip_code(&self, address: &str) -> Option<String>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExpiryStatus {
    Expired,
    Active,
    Failed(String),
}

/// Precomputed liveness answers keyed by listing id.
#[derive(Debug, Clone, Default)]
pub struct ExpiryTable {
    statuses: HashMap<String, ExpiryStatus>,
    unavailable: Option<String>,
}

impl ExpiryTable {
    /// Table that answers "not expired" for everything.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Table for a collaborator that could not be reached at all.
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self {
            statuses: HashMap::new(),
            unavailable: Some(reason.into()),
        }
    }

    pub fn insert(&mut self, listing_id: impl Into<String>, status: ExpiryStatus) {
        self.statuses.insert(listing_id.into(), status);
    }

    pub fn with_status(mut self, listing_id: impl Into<String>, status: ExpiryStatus) -> Self {
        self.insert(listing_id, status);
        self
    }

    pub fn status(&self, listing_id: &str) -> Option<&ExpiryStatus> {
        self.statuses.get(listing_id)
    }

    pub fn expired_count(&self) -> usize {
        self.statuses
            .values()
            .filter(|s| matches!(s, ExpiryStatus::Expired))
            .count()
    }

    pub fn len(&self) -> usize {
        self.statuses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statuses.is_empty()
    }
}

impl ExpiryCheck for ExpiryTable {
    fn is_expired(&self, listing_id: &str, _url: &str) -> Result<bool, CollaboratorError> {
        if let Some(reason) = &self.unavailable {
            return Err(CollaboratorError::Unavailable(reason.clone()));
        }
        match self.statuses.get(listing_id) {
            Some(ExpiryStatus::Expired) => Ok(true),
            Some(ExpiryStatus::Active) | None => Ok(false),
            Some(ExpiryStatus::Failed(reason)) => Err(CollaboratorError::Record {
                listing_id: listing_id.to_string(),
                reason: reason.clone(),
            }),
        }
    }
}

static PAGE_DESCRIPTION: Lazy<Option<Selector>> = Lazy::new(|| Selector::parse("div.page-description").ok());

/// Listing portals render a `div.page-description` notice once a listing is off-market.
pub fn page_indicates_expired(html: &str) -> bool {
    let Some(selector) = PAGE_DESCRIPTION.as_ref() else {
        return false;
    };
    let document = Html::parse_document(html);
    let expired = document
        .select(selector)
        .any(|node| !node.text().collect::<String>().trim().is_empty());
    expired
}

/// Fans liveness checks out over the shared fetcher and collects the answers.
#[derive(Debug, Clone)]
pub struct HttpExpiryChecker {
    fetcher: Arc<HttpFetcher>,
    run_id: Uuid,
    max_in_flight: usize,
}

impl HttpExpiryChecker {
    pub fn new(fetcher: Arc<HttpFetcher>, run_id: Uuid) -> Self {
        Self {
            fetcher,
            run_id,
            max_in_flight: 16,
        }
    }

    /// Checks every `(listing_id, url)` pair. When no request at all reaches a
    /// server, the table is marked unavailable so the merge keeps everything.
    pub async fn precompute(&self, targets: Vec<(String, String)>) -> ExpiryTable {
        if targets.is_empty() {
            return ExpiryTable::empty();
        }

        let total = targets.len();
        let limit = Arc::new(Semaphore::new(self.max_in_flight));
        let mut tasks = JoinSet::new();
        for (listing_id, url) in targets {
            let fetcher = Arc::clone(&self.fetcher);
            let limit = Arc::clone(&limit);
            let run_id = self.run_id;
            tasks.spawn(async move {
                let _permit = limit.acquire_owned().await.ok();
                let result = fetcher.fetch_listing_page(run_id, &url).await;
                (listing_id, url, result)
            });
        }

        let mut table = ExpiryTable::empty();
        let mut unreachable = 0usize;
        while let Some(joined) = tasks.join_next().await {
            let (listing_id, url, result) = match joined {
                Ok(done) => done,
                Err(err) => {
                    warn!(error = %err, "expiry check task aborted");
                    continue;
                }
            };
            let status = match result {
                Ok(ListingPage::Gone { .. }) => ExpiryStatus::Expired,
                Ok(ListingPage::Live { body, .. }) if page_indicates_expired(&body) => ExpiryStatus::Expired,
                Ok(ListingPage::Live { .. }) => ExpiryStatus::Active,
                Err(err) => {
                    if err.is_unreachable() {
                        unreachable += 1;
                    }
                    warn!(%listing_id, %url, error = %err, "expiry check failed; keeping listing");
                    ExpiryStatus::Failed(err.to_string())
                }
            };
            table.insert(listing_id, status);
        }

        if unreachable == total {
            warn!(total, "listing host unreachable for every expiry check");
            return ExpiryTable::unavailable(format!("{unreachable} of {total} expiry checks could not connect"));
        }
        info!(total, expired = table.expired_count(), "expiry checks complete");
        table
    }
}

fn address_key(address: &str) -> String {
    address
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GeocodeEntry {
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub city: Option<String>,
    pub zip_code: Option<String>,
}

/// File-backed geocode results keyed by normalized address.
#[derive(Debug, Clone, Default)]
pub struct GeocodeCache {
    entries: BTreeMap<String, GeocodeEntry>,
}

impl GeocodeCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Missing file means an empty cache.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let entries: BTreeMap<String, GeocodeEntry> =
            serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
        Ok(Self {
            entries: entries
                .into_iter()
                .map(|(address, entry)| (address_key(&address), entry))
                .collect(),
        })
    }

    pub fn insert(&mut self, address: &str, entry: GeocodeEntry) {
        self.entries.insert(address_key(address), entry);
    }

    pub fn with_entry(mut self, address: &str, entry: GeocodeEntry) -> Self {
        self.insert(address, entry);
        self
    }

    fn entry(&self, address: &str) -> Option<&GeocodeEntry> {
        self.entries.get(&address_key(address))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Geocoder for GeocodeCache {
    fn geocode(&self, address: &str) -> Option<(f64, f64)> {
        let entry = self.entry(address)?;
        match (entry.latitude, entry.longitude) {
            (Some(lat), Some(lon)) if lat.is_finite() && lon.is_finite() => Some((lat, lon)),
            _ => None,
        }
    }
}

impl AddressLookup for GeocodeCache {
    fn city(&self, address: &str) -> Option<String> {
        self.entry(address)?.city.clone()
    }

    fn zip_code(&self, address: &str) -> Option<String> {
        self.entry(address)?.zip_code.clone()
    }
}
