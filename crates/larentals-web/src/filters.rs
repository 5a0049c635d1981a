//! Dashboard filters. Every filter is a plain predicate; an unset filter
//! accepts everything.

use chrono::NaiveDate;
use larentals_core::Listing;
use serde::Deserialize;

pub type Predicate = Box<dyn Fn(&Listing) -> bool + Send + Sync>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Choice {
    Yes,
    No,
    #[default]
    Both,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListingQuery {
    pub min_price: Option<f64>,
    pub max_price: Option<f64>,
    pub min_sqft: Option<f64>,
    pub max_sqft: Option<f64>,
    pub min_ppsqft: Option<f64>,
    pub max_ppsqft: Option<f64>,
    pub min_year_built: Option<f64>,
    pub max_year_built: Option<f64>,
    pub min_bedrooms: Option<f64>,
    pub max_bedrooms: Option<f64>,
    pub min_bathrooms: Option<f64>,
    pub max_bathrooms: Option<f64>,
    /// Rows missing a filtered value are kept when set.
    #[serde(default)]
    pub include_missing: bool,
    /// Comma-separated subtypes; `Unknown` matches rows without one.
    pub subtypes: Option<String>,
    pub listed_from: Option<NaiveDate>,
    pub listed_to: Option<NaiveDate>,
    #[serde(default)]
    pub pets: Choice,
    #[serde(default)]
    pub senior_community: Choice,
    #[serde(default)]
    pub hide_inactive: bool,
    pub page: Option<usize>,
    pub per_page: Option<usize>,
}

pub fn range_filter(column: &'static str, min: Option<f64>, max: Option<f64>, include_missing: bool) -> Predicate {
    if min.is_none() && max.is_none() {
        return Box::new(|_: &Listing| true);
    }
    Box::new(move |listing: &Listing| match listing.numeric_like(column) {
        Some(value) => min.map_or(true, |m| value >= m) && max.map_or(true, |m| value <= m),
        None => include_missing,
    })
}

pub fn subtype_filter(subtypes: Option<&str>) -> Predicate {
    let wanted: Vec<String> = subtypes
        .unwrap_or_default()
        .split(',')
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .collect();
    if wanted.is_empty() {
        return Box::new(|_: &Listing| true);
    }
    Box::new(move |listing: &Listing| {
        let subtype = listing
            .subtype
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_lowercase)
            .unwrap_or_else(|| "unknown".to_string());
        wanted.contains(&subtype)
    })
}

pub fn listed_date_filter(from: Option<NaiveDate>, to: Option<NaiveDate>, include_missing: bool) -> Predicate {
    if from.is_none() && to.is_none() {
        return Box::new(|_: &Listing| true);
    }
    Box::new(move |listing: &Listing| match listing.listed_date.date() {
        Some(date) => from.map_or(true, |f| date >= f) && to.map_or(true, |t| date <= t),
        None => include_missing,
    })
}

fn yes_no(text: &str) -> Option<bool> {
    let text = text.trim().to_lowercase();
    if text.is_empty() || text == "unknown" {
        None
    } else if text == "n" || text == "no" || text == "none" || text.starts_with("no ") {
        Some(false)
    } else {
        Some(true)
    }
}

/// Shared shape of the pet-policy and senior-community filters; missing
/// values follow `include_missing` for both.
fn choice_filter(choice: Choice, include_missing: bool, read: fn(&Listing) -> Option<&str>) -> Predicate {
    let wanted = match choice {
        Choice::Both => return Box::new(|_: &Listing| true),
        Choice::Yes => true,
        Choice::No => false,
    };
    Box::new(move |listing: &Listing| match read(listing).and_then(yes_no) {
        Some(value) => value == wanted,
        None => include_missing,
    })
}

fn pet_policy(listing: &Listing) -> Option<&str> {
    listing.pet_policy.as_deref()
}

fn senior_community(listing: &Listing) -> Option<&str> {
    listing.extras.get("senior_community").map(String::as_str)
}

pub fn pet_filter(choice: Choice, include_missing: bool) -> Predicate {
    choice_filter(choice, include_missing, pet_policy)
}

pub fn senior_community_filter(choice: Choice, include_missing: bool) -> Predicate {
    choice_filter(choice, include_missing, senior_community)
}

pub fn inactive_filter(hide_inactive: bool) -> Predicate {
    if hide_inactive {
        Box::new(|listing: &Listing| !listing.reported_as_inactive)
    } else {
        Box::new(|_: &Listing| true)
    }
}

/// Conjunction of every filter in a query.
pub struct ListingFilter {
    predicates: Vec<Predicate>,
}

impl ListingFilter {
    pub fn from_query(query: &ListingQuery) -> Self {
        let missing = query.include_missing;
        Self {
            predicates: vec![
                range_filter("list_price", query.min_price, query.max_price, missing),
                range_filter("sqft", query.min_sqft, query.max_sqft, missing),
                range_filter("ppsqft", query.min_ppsqft, query.max_ppsqft, missing),
                range_filter("year_built", query.min_year_built, query.max_year_built, missing),
                range_filter("bedrooms", query.min_bedrooms, query.max_bedrooms, missing),
                range_filter("total_bathrooms", query.min_bathrooms, query.max_bathrooms, missing),
                subtype_filter(query.subtypes.as_deref()),
                listed_date_filter(query.listed_from, query.listed_to, missing),
                pet_filter(query.pets, missing),
                senior_community_filter(query.senior_community, missing),
                inactive_filter(query.hide_inactive),
            ],
        }
    }

    pub fn matches(&self, listing: &Listing) -> bool {
        self.predicates.iter().all(|p| p(listing))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use larentals_core::{ListedDate, Segment};

    fn priced(id: &str, price: Option<f64>) -> Listing {
        let mut l = Listing::new(id, Segment::Lease);
        l.list_price = price;
        l
    }

    #[test]
    fn unset_filters_accept_everything() {
        let filter = ListingFilter::from_query(&ListingQuery::default());
        assert!(filter.matches(&priced("A1", None)));
        assert!(filter.matches(&priced("A2", Some(99_999.0))));
    }

    #[test]
    fn ranges_respect_include_missing() {
        let strict = range_filter("list_price", Some(1000.0), Some(3000.0), false);
        let lenient = range_filter("list_price", Some(1000.0), Some(3000.0), true);
        assert!(strict(&priced("A1", Some(2000.0))));
        assert!(!strict(&priced("A2", Some(3500.0))));
        assert!(!strict(&priced("A3", None)));
        assert!(lenient(&priced("A3", None)));
    }

    #[test]
    fn unknown_subtype_matches_missing_values() {
        let mut condo = priced("A1", None);
        condo.subtype = Some("Condominium".into());
        let bare = priced("A2", None);

        let filter = subtype_filter(Some("condominium, Unknown"));
        assert!(filter(&condo));
        assert!(filter(&bare));
        assert!(!subtype_filter(Some("Townhouse"))(&bare));
    }

    #[test]
    fn pets_and_senior_community_treat_missing_alike() {
        let mut pets_ok = priced("A1", None);
        pets_ok.pet_policy = Some("Yes".into());
        let mut no_pets = priced("A2", None);
        no_pets.pet_policy = Some("No".into());
        let mut senior = priced("A3", None);
        senior.extras.insert("senior_community".into(), "Y".into());
        let unknown = priced("A4", None);

        assert!(pet_filter(Choice::Yes, false)(&pets_ok));
        assert!(!pet_filter(Choice::Yes, false)(&no_pets));
        assert!(pet_filter(Choice::No, false)(&no_pets));
        assert!(!pet_filter(Choice::No, false)(&unknown));
        assert!(pet_filter(Choice::No, true)(&unknown));
        assert!(senior_community_filter(Choice::Yes, false)(&senior));
        assert!(!senior_community_filter(Choice::Yes, false)(&unknown));
        assert!(senior_community_filter(Choice::Yes, true)(&unknown));
    }

    #[test]
    fn listed_date_and_inactive_filters() {
        let mut old = priced("A1", None);
        old.listed_date = ListedDate::parse("2024-01-10");
        old.reported_as_inactive = true;
        let from = NaiveDate::from_ymd_opt(2024, 2, 1);

        assert!(!listed_date_filter(from, None, true)(&old));
        assert!(listed_date_filter(from, None, true)(&priced("A2", None)));
        assert!(!inactive_filter(true)(&old));
        assert!(inactive_filter(false)(&old));
    }
}
