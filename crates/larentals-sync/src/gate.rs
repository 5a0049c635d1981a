//! Post-merge quality gate: interquartile-range screening plus hard caps.

use std::collections::BTreeMap;

use larentals_core::{format_number, AuditEvent, AuditRule, Listing, NUMERIC_COLUMNS};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

pub const DEFAULT_IQR_MULTIPLIER: f64 = 1.5;

fn default_iqr_multiplier() -> f64 {
    DEFAULT_IQR_MULTIPLIER
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateConfig {
    /// Columns to screen. Empty means every typed measurement column.
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default = "default_iqr_multiplier")]
    pub iqr_multiplier: f64,
    #[serde(default)]
    pub absolute_caps: BTreeMap<String, f64>,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            columns: Vec::new(),
            iqr_multiplier: DEFAULT_IQR_MULTIPLIER,
            absolute_caps: BTreeMap::new(),
        }
    }
}

impl GateConfig {
    pub fn lease_defaults() -> Self {
        Self {
            absolute_caps: BTreeMap::from([
                ("total_bathrooms".to_string(), 7.0),
                ("bedrooms".to_string(), 7.0),
                ("parking_spaces".to_string(), 5.0),
                ("sqft".to_string(), 10_000.0),
            ]),
            ..Self::default()
        }
    }

    fn screened_columns(&self) -> Vec<String> {
        let mut columns: Vec<String> = if self.columns.is_empty() {
            NUMERIC_COLUMNS
                .iter()
                .filter(|c| !matches!(**c, "latitude" | "longitude"))
                .map(|c| c.to_string())
                .collect()
        } else {
            self.columns.clone()
        };
        for capped in self.absolute_caps.keys() {
            if !columns.contains(capped) {
                columns.push(capped.clone());
            }
        }
        columns
    }
}

/// `[Q1 - k*IQR, Q3 + k*IQR]` for one column.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IqrBounds {
    pub q1: f64,
    pub q3: f64,
    pub lower: f64,
    pub upper: f64,
}

impl IqrBounds {
    pub fn from_values(values: &[f64], multiplier: f64) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        let mut sorted = values.to_vec();
        sorted.sort_by(f64::total_cmp);
        let q1 = quantile(&sorted, 0.25);
        let q3 = quantile(&sorted, 0.75);
        let iqr = q3 - q1;
        Some(Self {
            q1,
            q3,
            lower: q1 - multiplier * iqr,
            upper: q3 + multiplier * iqr,
        })
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.lower && value <= self.upper
    }
}

/// Linear interpolation between closest ranks over an ascending slice.
fn quantile(sorted: &[f64], q: f64) -> f64 {
    let pos = q * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    sorted[lo] + (sorted[hi] - sorted[lo]) * (pos - lo as f64)
}

#[derive(Debug, Clone)]
pub struct OutlierGate {
    config: GateConfig,
}

impl OutlierGate {
    pub fn new(config: GateConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    /// Splits `table` into kept rows and audited rejections.
    ///
    /// Screening repeats on the surviving rows until a pass rejects nothing, so
    /// feeding the output back in with the same configuration is a no-op.
    pub fn filter(&self, table: Vec<Listing>) -> (Vec<Listing>, Vec<AuditEvent>) {
        let columns = self.config.screened_columns();
        let mut kept = table;
        let mut rejections = Vec::new();

        loop {
            let bounds: BTreeMap<&str, IqrBounds> = columns
                .iter()
                .filter_map(|column| {
                    let values: Vec<f64> = kept.iter().filter_map(|l| l.numeric_like(column)).collect();
                    IqrBounds::from_values(&values, self.config.iqr_multiplier).map(|b| (column.as_str(), b))
                })
                .collect();

            let before = kept.len();
            let mut survivors = Vec::with_capacity(before);
            for listing in kept {
                let events = self.screen(&listing, &columns, &bounds);
                if events.is_empty() {
                    survivors.push(listing);
                } else {
                    rejections.extend(events);
                }
            }
            kept = survivors;
            if kept.len() == before {
                break;
            }
        }

        if !rejections.is_empty() {
            info!(rejected = rejections.len(), kept = kept.len(), "outlier gate finished");
        }
        (kept, rejections)
    }

    fn screen(&self, listing: &Listing, columns: &[String], bounds: &BTreeMap<&str, IqrBounds>) -> Vec<AuditEvent> {
        let mut events = Vec::new();
        for column in columns {
            let Some(value) = listing.numeric_like(column) else {
                continue;
            };
            let shown = listing.display_value(column).unwrap_or_else(|| format_number(value));

            if let Some(cap) = self.config.absolute_caps.get(column).filter(|cap| value > **cap) {
                warn!(
                    listing_id = %listing.listing_id,
                    column = %column,
                    value = %shown,
                    rule = %AuditRule::AbsoluteCap,
                    "Dropping row '{}': {} = {} exceeds absolute cap {}",
                    listing.listing_id,
                    column,
                    shown,
                    format_number(*cap)
                );
                events.push(AuditEvent {
                    listing_id: listing.listing_id.clone(),
                    rule: AuditRule::AbsoluteCap,
                    column_or_reason: column.clone(),
                    value: Some(shown),
                });
                continue;
            }

            if let Some(b) = bounds.get(column.as_str()).filter(|b| !b.contains(value)) {
                warn!(
                    listing_id = %listing.listing_id,
                    column = %column,
                    value = %shown,
                    rule = %AuditRule::IqrThreshold,
                    "Dropping row '{}': {} = {} outside IQR threshold [{}, {}]",
                    listing.listing_id,
                    column,
                    shown,
                    b.lower,
                    b.upper
                );
                events.push(AuditEvent {
                    listing_id: listing.listing_id.clone(),
                    rule: AuditRule::IqrThreshold,
                    column_or_reason: column.clone(),
                    value: Some(shown),
                });
            }
        }
        events
    }
}

/// Functional form of [`OutlierGate::filter`].
pub fn filter(
    table: Vec<Listing>,
    numeric_columns: &[String],
    iqr_multiplier: f64,
    absolute_caps: &BTreeMap<String, f64>,
) -> (Vec<Listing>, Vec<AuditEvent>) {
    OutlierGate::new(GateConfig {
        columns: numeric_columns.to_vec(),
        iqr_multiplier,
        absolute_caps: absolute_caps.clone(),
    })
    .filter(table)
}
