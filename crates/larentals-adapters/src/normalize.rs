//! Column aliasing and per-field cleaning rules for raw spreadsheet rows.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use larentals_core::{AuditEvent, AuditRule, ListedDate, Listing, Segment, DEPOSIT_COLUMNS, NUMERIC_COLUMNS};
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;
use tracing::{debug, warn};

use crate::{cell_text, RawBatch, RawSheet};

/// Rent ceiling used to derive the deposit clamp (three months of rent).
pub const DEFAULT_RENT_CEILING: f64 = 6000.0;
pub const DEPOSIT_CAP_MULTIPLIER: f64 = 3.0;

/// Longer identifiers are spreadsheet footers, not listings.
pub const MAX_IDENTIFIER_LEN: usize = 20;

const FIRST_SHEET_SUBTYPE: &str = "Single Family Residence";

static BED_BATH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*(?:(\d+(?:\.\d+)?)\s*/\s*)?(\d+(?:\.\d+)?)?\s*\(\s*(\d+)\s+(\d+)\s+(\d+)\s+(\d+)\s*\)")
        .unwrap()
});
static LEADING_DIGITS: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d+\s*").unwrap());
static STREET_NUMBER: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(\d+)").unwrap());
static TERM_SEPARATORS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[,;/|]+").unwrap());
static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());
static COMMUNITY_LAUNDRY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"Community Laundry Area|Community Laundry|Laundry Area|Community|Common").unwrap()
});

const COMMON_ALIASES: &[(&str, &str)] = &[
    ("mls", "mls_number"),
    ("mls #", "mls_number"),
    ("city", "city"),
    ("zip", "zip_code"),
    ("st #", "street_number"),
    ("br", "bedrooms"),
    ("baths(fthq)", "bathrooms"),
    ("sqft", "sqft"),
    ("lp $/sqft", "ppsqft"),
    ("lp", "list_price"),
    ("prop subtype", "subtype"),
    ("yb", "year_built"),
    ("lot sz", "lot_size"),
    ("listing url", "listing_url"),
    ("url", "listing_url"),
    ("listed date", "listed_date"),
    ("list date", "listed_date"),
    ("mls photo", "mls_photo"),
    ("photo", "mls_photo"),
    ("latitude", "latitude"),
    ("lat", "latitude"),
    ("longitude", "longitude"),
    ("lon", "longitude"),
    ("lng", "longitude"),
];

const LEASE_ALIASES: &[(&str, &str)] = &[
    ("# prking spaces", "parking_spaces"),
    ("address", "street_name"),
    ("furnished", "furnished"),
    ("key deposit", "key_deposit"),
    ("laundry", "laundry"),
    ("lease terms", "terms"),
    ("other deposit", "other_deposit"),
    ("pet deposit", "pet_deposit"),
    ("pets", "pet_policy"),
    ("security deposit", "security_deposit"),
    ("seller's agent 1 cell", "phone_number"),
];

const BUY_ALIASES: &[(&str, &str)] = &[
    ("# prking spaces", "garage_spaces"),
    ("address", "street_address"),
    ("hoa fee freq.1", "hoa_fee_frequency"),
    ("hoa fees", "hoa_fee"),
    ("hoa", "hoa_fee"),
    ("hod", "hoa_fee"),
    ("list price", "list_price"),
    ("lot size", "lot_size"),
    ("price per sqft", "ppsqft"),
    ("price per square foot", "ppsqft"),
    ("sub type", "subtype"),
    ("year built", "year_built"),
    ("yr built", "year_built"),
    ("pets allowed", "pet_policy"),
    ("senior community", "senior_community"),
    ("space rent", "space_rent"),
    ("park name", "park_name"),
];

fn alias_key(raw: &str) -> String {
    WHITESPACE.replace_all(raw.trim(), " ").to_lowercase()
}

/// Raw header (case/whitespace-insensitive) to canonical column name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnAliasMap {
    aliases: BTreeMap<String, String>,
}

impl ColumnAliasMap {
    pub fn defaults(segment: Segment) -> Self {
        let specific = match segment {
            Segment::Lease => LEASE_ALIASES,
            Segment::Buy => BUY_ALIASES,
        };
        let mut map = Self {
            aliases: BTreeMap::new(),
        };
        for (raw, canonical) in COMMON_ALIASES.iter().chain(specific) {
            map.insert(raw, canonical);
        }
        map.accept_canonical_names();
        map
    }

    fn insert(&mut self, raw: &str, canonical: &str) {
        self.aliases.insert(alias_key(raw), canonical.to_string());
    }

    // Already-canonical headers pass through unchanged.
    fn accept_canonical_names(&mut self) {
        let targets: Vec<String> = self.aliases.values().cloned().collect();
        for target in targets {
            self.aliases.entry(alias_key(&target)).or_insert(target);
        }
    }

    pub fn with_overrides(mut self, overrides: &BTreeMap<String, String>) -> Self {
        for (raw, canonical) in overrides {
            self.insert(raw, canonical);
        }
        self.accept_canonical_names();
        self
    }

    pub fn canonical_for(&self, raw: &str) -> Option<&str> {
        self.aliases.get(&alias_key(raw)).map(String::as_str)
    }

    /// Most similar known header, for diagnosing dropped columns.
    pub fn closest_alias(&self, raw: &str) -> Option<(&str, f64)> {
        let key = alias_key(raw);
        self.aliases
            .keys()
            .map(|alias| (alias.as_str(), strsim::jaro_winkler(&key, alias)))
            .filter(|(_, score)| *score >= 0.85)
            .max_by(|a, b| a.1.total_cmp(&b.1))
    }

    pub fn len(&self) -> usize {
        self.aliases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.aliases.is_empty()
    }
}

/// One row keyed by canonical column name; blank cells are absent.
pub type CanonicalRow = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalTable {
    pub name: String,
    pub columns: Vec<String>,
    pub rows: Vec<CanonicalRow>,
}

/// Renames known headers to canonical names and drops the rest.
pub fn normalize(sheet: &RawSheet, aliases: &ColumnAliasMap) -> CanonicalTable {
    let mapping: Vec<Option<String>> = sheet
        .columns
        .iter()
        .map(|raw| {
            let canonical = aliases.canonical_for(raw);
            if canonical.is_none() {
                match aliases.closest_alias(raw) {
                    Some((closest, score)) => {
                        debug!(sheet = %sheet.name, column = %raw, closest, score, "dropping unmapped column")
                    }
                    None => debug!(sheet = %sheet.name, column = %raw, "dropping unmapped column"),
                }
            }
            canonical.map(ToString::to_string)
        })
        .collect();

    let mut columns: Vec<String> = Vec::new();
    for canonical in mapping.iter().flatten() {
        if !columns.contains(canonical) {
            columns.push(canonical.clone());
        }
    }

    let mut ragged = 0usize;
    let rows = sheet
        .rows
        .iter()
        .map(|cells| {
            if cells.len() != mapping.len() {
                ragged += 1;
            }
            let mut row = CanonicalRow::new();
            for (canonical, cell) in mapping.iter().zip(cells) {
                let (Some(canonical), Some(text)) = (canonical, cell_text(cell)) else {
                    continue;
                };
                row.entry(canonical.clone()).or_insert(text);
            }
            row
        })
        .collect();

    if ragged > 0 {
        warn!(sheet = %sheet.name, ragged, columns = mapping.len(), "rows with unexpected cell counts");
    }

    CanonicalTable {
        name: sheet.name.clone(),
        columns,
        rows,
    }
}

/// Bedroom and bathroom counts from a composite `"[beds/]total (full half three_quarter extra)"` cell.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BedBath {
    pub bedrooms: Option<f64>,
    pub total: Option<f64>,
    pub full: Option<f64>,
    pub half: Option<f64>,
    pub three_quarter: Option<f64>,
    pub extra: Option<f64>,
}

pub fn extract_bed_bath(composite: &str) -> BedBath {
    let Some(caps) = BED_BATH.captures(composite) else {
        warn!(value = composite, "bed/bath field does not match the expected pattern");
        return BedBath::default();
    };
    let num = |i: usize| caps.get(i).and_then(|m| m.as_str().parse::<f64>().ok());

    let (full, half, three_quarter, extra) = (num(3), num(4), num(5), num(6));
    let parts_sum = match (full, half, three_quarter, extra) {
        (Some(a), Some(b), Some(c), Some(d)) => Some(a + b + c + d),
        _ => None,
    };
    BedBath {
        bedrooms: num(1),
        total: num(2).or(parts_sum),
        full,
        half,
        three_quarter,
        extra,
    }
}

/// Keeps digits and decimal points only; anything unparseable is missing, never zero.
pub fn coerce_numeric(text: &str) -> Option<f64> {
    let cleaned: String = text.chars().filter(|c| c.is_ascii_digit() || *c == '.').collect();
    if cleaned.is_empty() {
        return None;
    }
    cleaned.parse::<f64>().ok().filter(|v| v.is_finite())
}

const TERM_ORDER: &[&str] = &[
    "DL", "WK", "MO", "6M", "12M", "24M", "STL", "SN", "VR", "NG", "RO", "DR", "Other", "Unknown",
];

fn term_code(key: &str) -> Option<&'static str> {
    Some(match key {
        "MO" | "M2M" | "MONTH TO MONTH" | "MONTH TO MONTH LEASE" | "MONTHLY" => "MO",
        "DL" | "DAILY" | "DAY TO DAY" => "DL",
        "WK" | "WEEKLY" | "WEEK TO WEEK" => "WK",
        "6M" | "6 MONTH" | "6 MONTHS" | "SIX MONTH" | "SIX MONTHS" => "6M",
        "12M" | "12 MONTH" | "12 MONTHS" | "1 YEAR" | "ONE YEAR" | "ANNUAL" | "YEARLY" => "12M",
        "24M" | "24 MONTH" | "24 MONTHS" | "2 YEAR" | "TWO YEAR" => "24M",
        "STL" | "SHORT TERM" | "SHORT TERM LEASE" => "STL",
        "SN" | "SEASON" | "SEASONAL" => "SN",
        "VR" | "VACATION" | "VACATION RENTAL" => "VR",
        "NG" | "NEGOTIABLE" => "NG",
        "RO" | "RENEWAL OPTIONS" => "RO",
        "DR" | "DEPOSIT REQUIRED" => "DR",
        "OTHER" => "Other",
        "" | "NONE" | "N/A" | "NA" | "UNKNOWN" => "Unknown",
        _ => return None,
    })
}

fn term_key(token: &str) -> String {
    let upper = token
        .to_uppercase()
        .replace(['\u{2013}', '\u{2014}'], "-")
        .replace(['+', '-'], " ");
    WHITESPACE.replace_all(upper.trim(), " ").into_owned()
}

/// Lease terms text to canonical codes, deduplicated in canonical order.
pub fn normalize_terms(raw: Option<&str>) -> Vec<String> {
    let raw = raw.map(str::trim).unwrap_or_default();
    let mut codes: Vec<&'static str> = TERM_SEPARATORS
        .split(raw)
        .map(term_key)
        .filter(|key| !key.is_empty())
        .filter_map(|key| term_code(&key))
        .collect();
    if codes.is_empty() {
        codes.push("Unknown");
    }
    TERM_ORDER
        .iter()
        .filter(|code| codes.contains(code))
        .map(|code| code.to_string())
        .collect()
}

fn collapse_laundry(raw: &str) -> String {
    COMMUNITY_LAUNDRY.replace_all(raw.trim(), "Community Laundry").into_owned()
}

pub fn categorize_laundry(feature: Option<&str>) -> &'static str {
    let feature = match feature.map(str::trim) {
        None | Some("") | Some("Unknown") => return "Unknown",
        Some(f) => collapse_laundry(f),
    };
    let has = |keywords: &[&str]| keywords.iter().any(|k| feature.contains(k));

    if has(&["In Closet", "In Kitchen", "In Garage", "Inside", "Individual Room"]) {
        "In Unit"
    } else if has(&["Community Laundry", "Common Area", "Shared"]) {
        "Shared"
    } else if has(&["Hookup"]) {
        "Hookups"
    } else if has(&["Dryer Included", "Washer Included"]) {
        "Included Appliances"
    } else if has(&["Outside", "Upper Level", "In Carport"]) {
        "Location Specific"
    } else {
        "Other"
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RowRejection {
    #[error("row has no listing identifier")]
    MissingIdentifier,
    #[error("identifier `{0}` is longer than 20 characters")]
    GarbageIdentifier(String),
}

fn strip_float_suffix(value: &str) -> String {
    value.trim().strip_suffix(".0").unwrap_or(value.trim()).to_string()
}

fn take(fields: &mut CanonicalRow, column: &str) -> Option<String> {
    fields.remove(column).filter(|v| !v.trim().is_empty())
}

fn truthy(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "y")
}

fn leading_street_number(street: &str) -> Option<String> {
    STREET_NUMBER.captures(street.trim()).map(|c| c[1].to_string())
}

/// Builds a listing from one canonical row.
pub fn to_listing(record: &CanonicalRow, segment: Segment, deposit_cap: f64) -> Result<Listing, RowRejection> {
    let mut fields = record.clone();

    let listing_id = take(&mut fields, "mls_number")
        .map(|v| strip_float_suffix(&v))
        .filter(|v| !v.is_empty())
        .ok_or(RowRejection::MissingIdentifier)?;
    if listing_id.chars().count() > MAX_IDENTIFIER_LEN {
        return Err(RowRejection::GarbageIdentifier(listing_id));
    }
    let mut listing = Listing::new(listing_id, segment);

    listing.street_number = take(&mut fields, "street_number").map(|v| strip_float_suffix(&v));
    listing.city = take(&mut fields, "city");
    listing.zip_code = take(&mut fields, "zip_code")
        .map(|v| strip_float_suffix(&v))
        .filter(|zip| !zip.eq_ignore_ascii_case("assessor"));

    let street_name = take(&mut fields, "street_name")
        .map(|name| LEADING_DIGITS.replace(name.trim(), "").trim().to_string())
        .filter(|name| !name.is_empty());
    listing.street_address = match (take(&mut fields, "street_address"), street_name) {
        (Some(address), _) => Some(address),
        (None, Some(name)) => Some(match &listing.street_number {
            Some(number) => format!("{number} {name}"),
            None => name,
        }),
        (None, None) => None,
    };
    if listing.street_number.is_none() {
        listing.street_number = listing.street_address.as_deref().and_then(leading_street_number);
    }
    listing.short_address = take(&mut fields, "short_address");
    listing.full_street_address = take(&mut fields, "full_street_address");
    listing.backfill_address_components();
    listing.recompute_derived_addresses();

    for column in NUMERIC_COLUMNS {
        let Some(raw) = fields.remove(*column) else {
            continue;
        };
        let value = match *column {
            "latitude" | "longitude" => raw.trim().parse::<f64>().ok().filter(|v| v.is_finite()),
            _ => coerce_numeric(&raw),
        };
        listing.set_numeric(column, value);
    }
    listing.refresh_geometry();

    if let Some(composite) = take(&mut fields, "bathrooms") {
        let parsed = extract_bed_bath(&composite);
        listing.bedrooms = listing.bedrooms.or(parsed.bedrooms);
        listing.total_bathrooms = listing.total_bathrooms.or(parsed.total);
        listing.full_bathrooms = listing.full_bathrooms.or(parsed.full);
        listing.half_bathrooms = listing.half_bathrooms.or(parsed.half);
        listing.three_quarter_bathrooms = listing.three_quarter_bathrooms.or(parsed.three_quarter);
        listing.extra_bathrooms = listing.extra_bathrooms.or(parsed.extra);
    }

    for column in DEPOSIT_COLUMNS {
        if let Some(value) = listing.numeric(column).filter(|v| *v > deposit_cap) {
            debug!(listing_id = %listing.listing_id, column, value, cap = deposit_cap, "clamping deposit");
            listing.set_numeric(column, Some(deposit_cap));
        }
    }

    listing.listing_url = take(&mut fields, "listing_url");
    listing.mls_photo = take(&mut fields, "mls_photo");
    listing.subtype = take(&mut fields, "subtype");
    listing.pet_policy = take(&mut fields, "pet_policy");
    listing.furnished = take(&mut fields, "furnished");
    listing.hoa_fee_frequency = take(&mut fields, "hoa_fee_frequency");
    listing.phone_number = take(&mut fields, "phone_number");

    let laundry = take(&mut fields, "laundry");
    if laundry.is_some() || segment == Segment::Lease {
        let laundry = laundry
            .map(|raw| collapse_laundry(&raw))
            .unwrap_or_else(|| "Unknown".to_string());
        listing.laundry_category = Some(categorize_laundry(Some(&laundry)).to_string());
        listing.laundry = Some(laundry);
    }

    let terms = take(&mut fields, "terms");
    if terms.is_some() || segment == Segment::Lease {
        listing.terms = normalize_terms(terms.as_deref());
    }

    listing.listed_date = take(&mut fields, "listed_date")
        .map(|raw| ListedDate::parse(&raw))
        .unwrap_or_default();
    listing.reported_as_inactive = take(&mut fields, "reported_as_inactive").is_some_and(|v| truthy(&v));

    listing.extras = fields;
    Ok(listing)
}

#[derive(Debug, Clone, Default)]
pub struct NormalizedBatch {
    pub listings: Vec<Listing>,
    pub rejections: Vec<AuditEvent>,
}

/// Segment-aware normalizer applied to whole raw batches.
#[derive(Debug, Clone)]
pub struct Normalizer {
    segment: Segment,
    aliases: ColumnAliasMap,
    deposit_cap: f64,
}

impl Normalizer {
    pub fn new(segment: Segment) -> Self {
        Self {
            segment,
            aliases: ColumnAliasMap::defaults(segment),
            deposit_cap: DEFAULT_RENT_CEILING * DEPOSIT_CAP_MULTIPLIER,
        }
    }

    pub fn with_aliases(mut self, aliases: ColumnAliasMap) -> Self {
        self.aliases = aliases;
        self
    }

    pub fn with_rent_ceiling(mut self, rent_ceiling: f64) -> Self {
        self.deposit_cap = rent_ceiling * DEPOSIT_CAP_MULTIPLIER;
        self
    }

    pub fn deposit_cap(&self) -> f64 {
        self.deposit_cap
    }

    pub fn normalize_batch(&self, batch: &RawBatch, processed_at: DateTime<Utc>) -> NormalizedBatch {
        let mut out = NormalizedBatch::default();

        for (sheet_index, sheet) in batch.sheets.iter().enumerate() {
            let table = normalize(sheet, &self.aliases);
            for (row_index, row) in table.rows.iter().enumerate() {
                if row.is_empty() {
                    continue;
                }
                match to_listing(row, self.segment, self.deposit_cap) {
                    Ok(mut listing) => {
                        if self.segment == Segment::Buy && sheet_index == 0 && listing.subtype.is_none() {
                            listing.subtype = Some(FIRST_SHEET_SUBTYPE.to_string());
                        }
                        listing.date_processed = Some(processed_at);
                        out.listings.push(listing);
                    }
                    Err(rejection) => {
                        let label = format!("{}#{}", table.name, row_index + 1);
                        warn!(row = %label, reason = %rejection, "skipping malformed row");
                        let listing_id = match &rejection {
                            RowRejection::GarbageIdentifier(id) => id.clone(),
                            RowRejection::MissingIdentifier => label,
                        };
                        out.rejections.push(AuditEvent {
                            listing_id,
                            rule: AuditRule::MalformedRow,
                            column_or_reason: rejection.to_string(),
                            value: None,
                        });
                    }
                }
            }
        }
        out
    }
}
