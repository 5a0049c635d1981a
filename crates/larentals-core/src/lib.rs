//! Canonical listing model shared by every stage of the LA rentals pipeline.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "larentals-core";

static FULL_ADDRESS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?P<street_address>.*?), (?P<city>.*?) (?P<zip_code>\d{5})$").unwrap());
static STREET_NUMBER: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(\d+)").unwrap());

/// One of the two parallel markets handled by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Segment {
    Lease,
    Buy,
}

impl Segment {
    pub const ALL: [Segment; 2] = [Segment::Lease, Segment::Buy];

    pub fn as_str(&self) -> &'static str {
        match self {
            Segment::Lease => "lease",
            Segment::Buy => "buy",
        }
    }

    /// Snapshot table that holds the live listings for this segment.
    pub fn table_name(&self) -> &'static str {
        self.as_str()
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownSegment(pub String);

impl fmt::Display for UnknownSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown segment `{}` (expected `lease` or `buy`)", self.0)
    }
}

impl std::error::Error for UnknownSegment {}

impl FromStr for Segment {
    type Err = UnknownSegment;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "lease" => Ok(Segment::Lease),
            "buy" => Ok(Segment::Buy),
            other => Err(UnknownSegment(other.to_string())),
        }
    }
}

/// WGS84 point, longitude first like GeoJSON.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub lon: f64,
    pub lat: f64,
}

impl Point {
    pub fn from_lon_lat(lon: Option<f64>, lat: Option<f64>) -> Option<Self> {
        match (lon, lat) {
            (Some(lon), Some(lat)) if lon.is_finite() && lat.is_finite() => Some(Self { lon, lat }),
            _ => None,
        }
    }
}

/// Listing date as scraped from free text. Failed parses are kept as `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum ListedDate {
    Known(NaiveDate),
    #[default]
    Unknown,
}

const LISTED_DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%m/%d/%Y", "%m/%d/%y", "%B %d, %Y", "%b %d, %Y", "%Y/%m/%d"];
const LISTED_DATETIME_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M:%S%.f"];

impl ListedDate {
    pub fn parse(text: &str) -> Self {
        let text = text.trim();
        if text.is_empty() || text.eq_ignore_ascii_case("unknown") {
            return ListedDate::Unknown;
        }
        if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
            return ListedDate::Known(ts.date_naive());
        }
        for fmt in LISTED_DATETIME_FORMATS {
            if let Ok(ts) = NaiveDateTime::parse_from_str(text, fmt) {
                return ListedDate::Known(ts.date());
            }
        }
        for fmt in LISTED_DATE_FORMATS {
            if let Ok(date) = NaiveDate::parse_from_str(text, fmt) {
                return ListedDate::Known(date);
            }
        }
        ListedDate::Unknown
    }

    pub fn date(&self) -> Option<NaiveDate> {
        match self {
            ListedDate::Known(d) => Some(*d),
            ListedDate::Unknown => None,
        }
    }
}

impl From<ListedDate> for String {
    fn from(value: ListedDate) -> Self {
        match value {
            ListedDate::Known(d) => d.format("%Y-%m-%d").to_string(),
            ListedDate::Unknown => "Unknown".to_string(),
        }
    }
}

impl From<String> for ListedDate {
    fn from(value: String) -> Self {
        ListedDate::parse(&value)
    }
}

/// Report option that marks a listing as inactive.
pub const REPORT_INACTIVE_OPTION: &str = "Unavailable/Sold/Rented";

pub const ALLOWED_REPORT_OPTIONS: &[&str] = &[
    "Wrong Location",
    REPORT_INACTIVE_OPTION,
    "Wrong Details",
    "Incorrect Price",
    "Other",
];

/// User-submitted moderation report attached to a listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingReport {
    pub option: String,
    pub text: Option<String>,
}

impl ListingReport {
    pub fn marks_inactive(&self) -> bool {
        self.option == REPORT_INACTIVE_OPTION
    }
}

/// Canonical listing record for either segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    pub listing_id: String,
    pub context: Segment,

    pub street_number: Option<String>,
    pub street_address: Option<String>,
    pub city: Option<String>,
    pub zip_code: Option<String>,
    pub short_address: Option<String>,
    pub full_street_address: Option<String>,

    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub geometry: Option<Point>,

    pub list_price: Option<f64>,
    pub ppsqft: Option<f64>,
    pub sqft: Option<f64>,
    pub lot_size: Option<f64>,
    pub year_built: Option<f64>,
    pub bedrooms: Option<f64>,
    pub total_bathrooms: Option<f64>,
    pub full_bathrooms: Option<f64>,
    pub half_bathrooms: Option<f64>,
    pub three_quarter_bathrooms: Option<f64>,
    pub extra_bathrooms: Option<f64>,
    pub parking_spaces: Option<f64>,
    pub security_deposit: Option<f64>,
    pub pet_deposit: Option<f64>,
    pub key_deposit: Option<f64>,
    pub other_deposit: Option<f64>,
    pub hoa_fee: Option<f64>,

    pub listing_url: Option<String>,
    pub mls_photo: Option<String>,
    pub subtype: Option<String>,
    pub laundry: Option<String>,
    pub laundry_category: Option<String>,
    #[serde(default)]
    pub terms: Vec<String>,
    pub pet_policy: Option<String>,
    pub furnished: Option<String>,
    pub hoa_fee_frequency: Option<String>,
    pub phone_number: Option<String>,

    #[serde(default)]
    pub listed_date: ListedDate,
    pub date_processed: Option<DateTime<Utc>>,

    #[serde(default)]
    pub reported_as_inactive: bool,
    #[serde(default)]
    pub report: Option<ListingReport>,

    /// Canonical columns that have no typed slot.
    #[serde(default)]
    pub extras: BTreeMap<String, String>,
}

/// Numeric columns with a typed slot on [`Listing`].
pub const NUMERIC_COLUMNS: &[&str] = &[
    "list_price",
    "ppsqft",
    "sqft",
    "lot_size",
    "year_built",
    "bedrooms",
    "total_bathrooms",
    "full_bathrooms",
    "half_bathrooms",
    "three_quarter_bathrooms",
    "extra_bathrooms",
    "parking_spaces",
    "security_deposit",
    "pet_deposit",
    "key_deposit",
    "other_deposit",
    "hoa_fee",
    "latitude",
    "longitude",
];

pub const DEPOSIT_COLUMNS: &[&str] = &["security_deposit", "pet_deposit", "key_deposit", "other_deposit"];

impl Listing {
    pub fn new(listing_id: impl Into<String>, context: Segment) -> Self {
        Self {
            listing_id: listing_id.into(),
            context,
            street_number: None,
            street_address: None,
            city: None,
            zip_code: None,
            short_address: None,
            full_street_address: None,
            latitude: None,
            longitude: None,
            geometry: None,
            list_price: None,
            ppsqft: None,
            sqft: None,
            lot_size: None,
            year_built: None,
            bedrooms: None,
            total_bathrooms: None,
            full_bathrooms: None,
            half_bathrooms: None,
            three_quarter_bathrooms: None,
            extra_bathrooms: None,
            parking_spaces: None,
            security_deposit: None,
            pet_deposit: None,
            key_deposit: None,
            other_deposit: None,
            hoa_fee: None,
            listing_url: None,
            mls_photo: None,
            subtype: None,
            laundry: None,
            laundry_category: None,
            terms: Vec::new(),
            pet_policy: None,
            furnished: None,
            hoa_fee_frequency: None,
            phone_number: None,
            listed_date: ListedDate::Unknown,
            date_processed: None,
            reported_as_inactive: false,
            report: None,
            extras: BTreeMap::new(),
        }
    }

    fn numeric_slot(&mut self, column: &str) -> Option<&mut Option<f64>> {
        Some(match column {
            "list_price" => &mut self.list_price,
            "ppsqft" => &mut self.ppsqft,
            "sqft" => &mut self.sqft,
            "lot_size" => &mut self.lot_size,
            "year_built" => &mut self.year_built,
            "bedrooms" => &mut self.bedrooms,
            "total_bathrooms" => &mut self.total_bathrooms,
            "full_bathrooms" => &mut self.full_bathrooms,
            "half_bathrooms" => &mut self.half_bathrooms,
            "three_quarter_bathrooms" => &mut self.three_quarter_bathrooms,
            "extra_bathrooms" => &mut self.extra_bathrooms,
            "parking_spaces" => &mut self.parking_spaces,
            "security_deposit" => &mut self.security_deposit,
            "pet_deposit" => &mut self.pet_deposit,
            "key_deposit" => &mut self.key_deposit,
            "other_deposit" => &mut self.other_deposit,
            "hoa_fee" => &mut self.hoa_fee,
            "latitude" => &mut self.latitude,
            "longitude" => &mut self.longitude,
            _ => return None,
        })
    }

    /// Typed numeric value of a column, if the column has a typed slot.
    pub fn numeric(&self, column: &str) -> Option<f64> {
        match column {
            "list_price" => self.list_price,
            "ppsqft" => self.ppsqft,
            "sqft" => self.sqft,
            "lot_size" => self.lot_size,
            "year_built" => self.year_built,
            "bedrooms" => self.bedrooms,
            "total_bathrooms" => self.total_bathrooms,
            "full_bathrooms" => self.full_bathrooms,
            "half_bathrooms" => self.half_bathrooms,
            "three_quarter_bathrooms" => self.three_quarter_bathrooms,
            "extra_bathrooms" => self.extra_bathrooms,
            "parking_spaces" => self.parking_spaces,
            "security_deposit" => self.security_deposit,
            "pet_deposit" => self.pet_deposit,
            "key_deposit" => self.key_deposit,
            "other_deposit" => self.other_deposit,
            "hoa_fee" => self.hoa_fee,
            "latitude" => self.latitude,
            "longitude" => self.longitude,
            _ => None,
        }
    }

    /// Sets a typed numeric column. Returns `false` when the column has no typed slot.
    pub fn set_numeric(&mut self, column: &str, value: Option<f64>) -> bool {
        match self.numeric_slot(column) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    /// Numeric-like value of any column: typed slots first, then passthrough text
    /// that parses as a plain number.
    pub fn numeric_like(&self, column: &str) -> Option<f64> {
        if NUMERIC_COLUMNS.contains(&column) {
            return self.numeric(column).filter(|v| v.is_finite());
        }
        self.extras
            .get(column)
            .and_then(|raw| raw.trim().replace(',', "").parse::<f64>().ok())
            .filter(|v| v.is_finite())
    }

    /// Fills missing street, city, zip and street number from
    /// `full_street_address` (`"<street>, <city> <zip>"`). Never overwrites a
    /// component that is already present.
    pub fn backfill_address_components(&mut self) -> bool {
        let needs_fill = non_blank(self.street_address.as_deref()).is_none()
            || non_blank(self.city.as_deref()).is_none()
            || non_blank(self.zip_code.as_deref()).is_none()
            || non_blank(self.street_number.as_deref()).is_none();
        if !needs_fill {
            return false;
        }
        let mut filled = false;

        if let Some(caps) = self
            .full_street_address
            .as_deref()
            .and_then(|full| FULL_ADDRESS.captures(full.trim()))
        {
            for (slot, group) in [
                (&mut self.street_address, "street_address"),
                (&mut self.city, "city"),
                (&mut self.zip_code, "zip_code"),
            ] {
                if non_blank(slot.as_deref()).is_none() {
                    let part = caps[group].trim();
                    if !part.is_empty() {
                        *slot = Some(part.to_string());
                        filled = true;
                    }
                }
            }
        }

        if non_blank(self.street_number.as_deref()).is_none() {
            let number = self
                .street_address
                .as_deref()
                .and_then(|street| STREET_NUMBER.captures(street.trim()))
                .map(|c| c[1].to_string());
            if number.is_some() {
                self.street_number = number;
                filled = true;
            }
        }
        filled
    }

    /// Rebuilds `short_address` and `full_street_address` from the components.
    /// A missing city or zip is left out rather than kept from a stale value;
    /// without a street address both fields are left alone.
    pub fn recompute_derived_addresses(&mut self) {
        let Some(street) = non_blank(self.street_address.as_deref()) else {
            return;
        };
        let short = match non_blank(self.city.as_deref()) {
            Some(city) => format!("{street}, {city}"),
            None => street.to_string(),
        };
        let full = match non_blank(self.zip_code.as_deref()) {
            Some(zip) => format!("{short} {zip}"),
            None => short.clone(),
        };
        self.short_address = Some(short);
        self.full_street_address = Some(full);
    }

    /// Derives geometry from fresh coordinates; otherwise keeps whatever geometry is known.
    pub fn refresh_geometry(&mut self) {
        if let Some(point) = Point::from_lon_lat(self.longitude, self.latitude) {
            self.geometry = Some(point);
        }
    }

    /// Textual rendering of a column value, for audit trails.
    pub fn display_value(&self, column: &str) -> Option<String> {
        if NUMERIC_COLUMNS.contains(&column) {
            return self.numeric(column).map(format_number);
        }
        self.extras.get(column).cloned()
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

pub fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{value}")
    }
}

/// Which rule removed or rejected a listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditRule {
    IqrThreshold,
    AbsoluteCap,
    Expired,
    MalformedRow,
}

impl AuditRule {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditRule::IqrThreshold => "iqr_threshold",
            AuditRule::AbsoluteCap => "absolute_cap",
            AuditRule::Expired => "expired",
            AuditRule::MalformedRow => "malformed_row",
        }
    }
}

impl fmt::Display for AuditRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of the rejection/removal audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub listing_id: String,
    pub rule: AuditRule,
    pub column_or_reason: String,
    pub value: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listed_date_accepts_mixed_formats() {
        let expected = NaiveDate::from_ymd_opt(2024, 3, 7).unwrap();
        assert_eq!(ListedDate::parse("2024-03-07"), ListedDate::Known(expected));
        assert_eq!(ListedDate::parse("03/07/2024"), ListedDate::Known(expected));
        assert_eq!(ListedDate::parse("March 07, 2024"), ListedDate::Known(expected));
        assert_eq!(ListedDate::parse("2024-03-07T10:15:00"), ListedDate::Known(expected));
        assert_eq!(ListedDate::parse("last tuesday"), ListedDate::Unknown);
        assert_eq!(ListedDate::parse(""), ListedDate::Unknown);
    }

    #[test]
    fn listed_date_serializes_as_text() {
        let json = serde_json::to_string(&ListedDate::Unknown).unwrap();
        assert_eq!(json, "\"Unknown\"");
        let back: ListedDate = serde_json::from_str("\"2023-12-01\"").unwrap();
        assert_eq!(back.date(), NaiveDate::from_ymd_opt(2023, 12, 1));
    }

    #[test]
    fn numeric_like_reads_typed_and_passthrough_columns() {
        let mut listing = Listing::new("A1", Segment::Lease);
        assert!(listing.set_numeric("sqft", Some(850.0)));
        assert!(!listing.set_numeric("space_rent", Some(1.0)));
        listing.extras.insert("space_rent".into(), "1,200".into());
        listing.extras.insert("senior_community".into(), "Y".into());

        assert_eq!(listing.numeric_like("sqft"), Some(850.0));
        assert_eq!(listing.numeric_like("space_rent"), Some(1200.0));
        assert_eq!(listing.numeric_like("senior_community"), None);
        assert_eq!(listing.display_value("sqft").as_deref(), Some("850"));
    }

    #[test]
    fn segment_round_trips_through_text() {
        assert_eq!("Lease".parse::<Segment>().unwrap(), Segment::Lease);
        assert_eq!(Segment::Buy.table_name(), "buy");
        assert!("rent".parse::<Segment>().is_err());
    }

    #[test]
    fn derived_addresses_follow_components() {
        let mut listing = Listing::new("A1", Segment::Buy);
        listing.full_street_address = Some("stale, Nowhere 00000".into());
        listing.recompute_derived_addresses();
        assert_eq!(listing.full_street_address.as_deref(), Some("stale, Nowhere 00000"));

        listing.street_address = Some("123 Main St".into());
        listing.city = Some("Springfield".into());
        listing.zip_code = Some("90001".into());
        listing.recompute_derived_addresses();
        assert_eq!(listing.short_address.as_deref(), Some("123 Main St, Springfield"));
        assert_eq!(
            listing.full_street_address.as_deref(),
            Some("123 Main St, Springfield 90001")
        );
    }

    #[test]
    fn missing_zip_drops_the_stale_full_address() {
        let mut listing = Listing::new("A1", Segment::Lease);
        listing.street_address = Some("9 New Rd".into());
        listing.city = Some("Glendale".into());
        listing.full_street_address = Some("1 Old St, Pasadena 91101 (unit B)".into());
        listing.recompute_derived_addresses();
        assert_eq!(listing.short_address.as_deref(), Some("9 New Rd, Glendale"));
        assert_eq!(listing.full_street_address.as_deref(), Some("9 New Rd, Glendale"));

        listing.city = None;
        listing.zip_code = Some("91201".into());
        listing.recompute_derived_addresses();
        assert_eq!(listing.short_address.as_deref(), Some("9 New Rd"));
        assert_eq!(listing.full_street_address.as_deref(), Some("9 New Rd 91201"));
    }

    #[test]
    fn components_backfill_from_full_address_without_overwriting() {
        let mut listing = Listing::new("A1", Segment::Buy);
        listing.city = Some("Los Angeles".into());
        listing.full_street_address = Some("55 Elm Ave, Pasadena 91101".into());
        assert!(listing.backfill_address_components());
        assert_eq!(listing.street_address.as_deref(), Some("55 Elm Ave"));
        assert_eq!(listing.street_number.as_deref(), Some("55"));
        assert_eq!(listing.city.as_deref(), Some("Los Angeles"));
        assert_eq!(listing.zip_code.as_deref(), Some("91101"));
        assert!(!listing.backfill_address_components());
    }

    #[test]
    fn geometry_survives_missing_coordinates() {
        let mut listing = Listing::new("A1", Segment::Lease);
        listing.geometry = Some(Point { lon: -118.3, lat: 34.1 });
        listing.refresh_geometry();
        assert_eq!(listing.geometry, Some(Point { lon: -118.3, lat: 34.1 }));

        listing.latitude = Some(34.2);
        listing.longitude = Some(-118.4);
        listing.refresh_geometry();
        assert_eq!(listing.geometry, Some(Point { lon: -118.4, lat: 34.2 }));
    }

    #[test]
    fn point_requires_both_coordinates() {
        assert!(Point::from_lon_lat(Some(-118.2), None).is_none());
        assert_eq!(
            Point::from_lon_lat(Some(-118.2), Some(34.0)),
            Some(Point { lon: -118.2, lat: 34.0 })
        );
    }
}
