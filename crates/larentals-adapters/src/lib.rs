//! Raw batch bundles, record normalization and enrichment collaborators.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use larentals_core::Segment;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub mod enrich;
pub mod normalize;

pub use enrich::{
    page_indicates_expired, AddressLookup, CollaboratorError, ExpiryCheck, ExpiryStatus, ExpiryTable,
    GeocodeCache, GeocodeEntry, Geocoder, HttpExpiryChecker,
};
pub use normalize::{
    categorize_laundry, coerce_numeric, extract_bed_bath, normalize, normalize_terms, to_listing, BedBath,
    CanonicalRow, CanonicalTable, ColumnAliasMap, NormalizedBatch, Normalizer, RowRejection,
};

pub const CRATE_NAME: &str = "larentals-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("batch {path} is for segment {found}, expected {expected}")]
    SegmentMismatch {
        path: String,
        expected: Segment,
        found: Segment,
    },
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// One spreadsheet export as delivered to the inbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawBatch {
    pub segment: Segment,
    pub source: String,
    pub captured_at: DateTime<Utc>,
    pub sheets: Vec<RawSheet>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawSheet {
    pub name: String,
    pub columns: Vec<String>,
    #[serde(default)]
    pub rows: Vec<Vec<JsonValue>>,
}

impl RawBatch {
    pub fn row_count(&self) -> usize {
        self.sheets.iter().map(|s| s.rows.len()).sum()
    }

    /// Keeps only the first `limit` rows across all sheets, in sheet order.
    pub fn truncated(mut self, limit: usize) -> Self {
        let mut remaining = limit;
        for sheet in &mut self.sheets {
            sheet.rows.truncate(remaining);
            remaining -= sheet.rows.len();
        }
        self.sheets.retain(|s| !s.rows.is_empty());
        self
    }
}

/// Text of one spreadsheet cell; blanks and nulls are missing.
pub fn cell_text(value: &JsonValue) -> Option<String> {
    let text = match value {
        JsonValue::Null => return None,
        JsonValue::String(s) => s.trim().to_string(),
        JsonValue::Number(n) => n.to_string(),
        JsonValue::Bool(b) => b.to_string(),
        other => other.to_string(),
    };
    if text.is_empty() || text.eq_ignore_ascii_case("nan") {
        None
    } else {
        Some(text)
    }
}

pub fn default_inbox_path(workspace_root: &Path, segment: Segment) -> PathBuf {
    workspace_root.join("inbox").join(segment.as_str()).join("batch.json")
}

pub fn load_raw_batch(path: impl AsRef<Path>, expected: Segment) -> Result<RawBatch, AdapterError> {
    let path = path.as_ref();
    let batch: RawBatch = read_json_file(path)?;
    if batch.segment != expected {
        return Err(AdapterError::SegmentMismatch {
            path: path.display().to_string(),
            expected,
            found: batch.segment,
        });
    }
    Ok(batch)
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}
