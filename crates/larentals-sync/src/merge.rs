//! Incremental merge of a freshly normalized batch against the prior snapshot.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use larentals_adapters::{CollaboratorError, ExpiryCheck};
use larentals_core::{AuditEvent, AuditRule, Listing, ListingReport, Point};
use serde::Serialize;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provenance {
    New,
    Prior,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MergeStats {
    pub new_rows: usize,
    pub prior_rows: usize,
    pub duplicates_collapsed: usize,
    pub expired_removed: usize,
    pub expiry_failures: usize,
    pub expiry_degraded: bool,
    pub sticky_carried: usize,
    pub addresses_backfilled: usize,
    pub merged_rows: usize,
}

#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub listings: Vec<Listing>,
    pub removals: Vec<AuditEvent>,
    pub stats: MergeStats,
}

/// What the prior snapshot knew about an id, folded over every prior row
/// carrying it and kept for whichever row survives.
#[derive(Debug, Clone, Default)]
struct PriorState {
    geometry: Option<Point>,
    date_processed: Option<DateTime<Utc>>,
    reported_as_inactive: bool,
    report: Option<ListingReport>,
}

impl PriorState {
    /// Flags accumulate; the first known geometry, date and report stick.
    fn absorb(&mut self, listing: &Listing) {
        self.reported_as_inactive |= listing.reported_as_inactive;
        if self.geometry.is_none() {
            self.geometry = listing.geometry;
        }
        if self.date_processed.is_none() {
            self.date_processed = listing.date_processed;
        }
        if self.report.is_none() {
            self.report = listing.report.clone();
        }
    }
}

struct Candidate {
    listing: Listing,
    provenance: Provenance,
}

pub struct MergeEngine<'a> {
    expiry: &'a dyn ExpiryCheck,
}

impl<'a> MergeEngine<'a> {
    pub fn new(expiry: &'a dyn ExpiryCheck) -> Self {
        Self { expiry }
    }

    /// Produces the next snapshot. Never fails: collaborator trouble degrades
    /// to keeping rows, and every removal lands in `removals`.
    pub fn merge(&self, new_batch: Vec<Listing>, prior_snapshot: Vec<Listing>) -> MergeOutcome {
        let mut stats = MergeStats {
            new_rows: new_batch.len(),
            prior_rows: prior_snapshot.len(),
            ..MergeStats::default()
        };

        let (survivors, prior_states) = deduplicate(new_batch, prior_snapshot, &mut stats);
        let mut removals = Vec::new();
        let survivors = self.reconcile_liveness(survivors, &mut removals, &mut stats);

        let mut listings = Vec::with_capacity(survivors.len());
        for candidate in survivors {
            let mut listing = candidate.listing;
            if let Some(state) = prior_states.get(&listing.listing_id) {
                carry_forward(&mut listing, state, &mut stats);
            }
            if listing.backfill_address_components() {
                stats.addresses_backfilled += 1;
            }
            listing.recompute_derived_addresses();
            listing.refresh_geometry();
            listings.push(listing);
        }

        stats.merged_rows = listings.len();
        info!(
            new_rows = stats.new_rows,
            prior_rows = stats.prior_rows,
            merged_rows = stats.merged_rows,
            expired_removed = stats.expired_removed,
            expiry_degraded = stats.expiry_degraded,
            "merge complete"
        );
        MergeOutcome {
            listings,
            removals,
            stats,
        }
    }

    fn reconcile_liveness(
        &self,
        survivors: Vec<Candidate>,
        removals: &mut Vec<AuditEvent>,
        stats: &mut MergeStats,
    ) -> Vec<Candidate> {
        let mut kept = Vec::with_capacity(survivors.len());
        for candidate in survivors {
            let url = candidate
                .listing
                .listing_url
                .as_deref()
                .map(str::trim)
                .filter(|u| !u.is_empty());
            let Some(url) = url.filter(|_| !stats.expiry_degraded) else {
                kept.push(candidate);
                continue;
            };
            let listing_id = candidate.listing.listing_id.as_str();
            match self.expiry.is_expired(listing_id, url) {
                Ok(true) => {
                    info!(%listing_id, %url, "removing expired listing");
                    removals.push(AuditEvent {
                        listing_id: listing_id.to_string(),
                        rule: AuditRule::Expired,
                        column_or_reason: "listing_url".to_string(),
                        value: Some(url.to_string()),
                    });
                    stats.expired_removed += 1;
                    continue;
                }
                Ok(false) => {}
                Err(CollaboratorError::Unavailable(reason)) => {
                    warn!(%reason, "expiry checks unavailable; keeping remaining listings");
                    stats.expiry_degraded = true;
                }
                Err(err) => {
                    warn!(%listing_id, error = %err, "expiry check failed; keeping listing");
                    stats.expiry_failures += 1;
                }
            }
            kept.push(candidate);
        }
        kept
    }
}

/// Convenience wrapper around [`MergeEngine`].
pub fn merge(new_batch: Vec<Listing>, prior_snapshot: Vec<Listing>, expiry: &dyn ExpiryCheck) -> MergeOutcome {
    MergeEngine::new(expiry).merge(new_batch, prior_snapshot)
}

/// One row per id: new beats prior, later beats earlier within an input.
/// Output order is first appearance, so new-batch ids come before prior-only ids.
fn deduplicate(
    new_batch: Vec<Listing>,
    prior_snapshot: Vec<Listing>,
    stats: &mut MergeStats,
) -> (Vec<Candidate>, HashMap<String, PriorState>) {
    let mut slots: Vec<Option<Candidate>> = Vec::with_capacity(new_batch.len() + prior_snapshot.len());
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut prior_states: HashMap<String, PriorState> = HashMap::new();

    let tagged = new_batch
        .into_iter()
        .map(|l| (l, Provenance::New))
        .chain(prior_snapshot.into_iter().map(|l| (l, Provenance::Prior)));

    for (listing, provenance) in tagged {
        if provenance == Provenance::Prior {
            prior_states
                .entry(listing.listing_id.clone())
                .or_default()
                .absorb(&listing);
        }
        match index.get(&listing.listing_id) {
            Some(&slot) => {
                stats.duplicates_collapsed += 1;
                let existing = slots[slot].as_ref().map(|c| c.provenance);
                if existing == Some(Provenance::New) && provenance == Provenance::Prior {
                    continue;
                }
                debug!(listing_id = %listing.listing_id, "duplicate id; keeping later row");
                slots[slot] = Some(Candidate { listing, provenance });
            }
            None => {
                index.insert(listing.listing_id.clone(), slots.len());
                slots.push(Some(Candidate { listing, provenance }));
            }
        }
    }

    (slots.into_iter().flatten().collect(), prior_states)
}

fn carry_forward(listing: &mut Listing, prior: &PriorState, stats: &mut MergeStats) {
    if prior.reported_as_inactive && !listing.reported_as_inactive {
        listing.reported_as_inactive = true;
        stats.sticky_carried += 1;
    }
    if listing.report.is_none() {
        listing.report = prior.report.clone();
    }
    if prior.date_processed.is_some() {
        listing.date_processed = prior.date_processed;
    }
    if listing.geometry.is_none() {
        listing.geometry = prior.geometry;
    }
}
