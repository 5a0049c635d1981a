use std::collections::{BTreeMap, HashMap, HashSet};

use larentals_adapters::ExpiryTable;
use larentals_core::{Listing, Point, Segment};
use larentals_sync::gate::{GateConfig, OutlierGate};
use larentals_sync::merge::merge;
use proptest::prelude::*;

fn listing_strategy() -> impl Strategy<Value = Listing> {
    (
        "[A-E][0-3]",
        proptest::option::of(500u32..9000),
        any::<bool>(),
        proptest::option::of((-118.9f64..-117.6, 33.7f64..34.8)),
        proptest::option::of((-118.9f64..-117.6, 33.7f64..34.8)),
        proptest::option::of(prop_oneof![Just("Pasadena"), Just("Glendale"), Just("Burbank")]),
        any::<bool>(),
    )
        .prop_map(|(id, price, flagged, coords, geometry, city, with_full)| {
            let mut l = Listing::new(id, Segment::Lease);
            l.list_price = price.map(f64::from);
            l.reported_as_inactive = flagged;
            if let Some((lon, lat)) = coords {
                l.longitude = Some(lon);
                l.latitude = Some(lat);
            }
            l.geometry = geometry.map(|(lon, lat)| Point { lon, lat });
            l.city = city.map(str::to_string);
            if with_full {
                l.full_street_address = Some("742 Evergreen Ter, Springfield 90001".into());
            }
            l
        })
}

fn batch_strategy() -> impl Strategy<Value = Vec<Listing>> {
    proptest::collection::vec(listing_strategy(), 0..12)
}

fn last_by_id(rows: &[Listing]) -> HashMap<&str, &Listing> {
    rows.iter().map(|l| (l.listing_id.as_str(), l)).collect()
}

proptest! {
    #[test]
    fn merged_ids_are_unique(new_batch in batch_strategy(), prior in batch_strategy()) {
        let out = merge(new_batch, prior, &ExpiryTable::empty());
        let mut seen = HashSet::new();
        for listing in &out.listings {
            prop_assert!(seen.insert(listing.listing_id.clone()));
        }
    }

    #[test]
    fn prior_inactive_flag_is_never_cleared(new_batch in batch_strategy(), prior in batch_strategy()) {
        let flagged: HashSet<String> = prior
            .iter()
            .filter(|l| l.reported_as_inactive)
            .map(|l| l.listing_id.clone())
            .collect();
        let out = merge(new_batch, prior.clone(), &ExpiryTable::empty());
        let merged = last_by_id(&out.listings);
        for id in &flagged {
            prop_assert!(merged[id.as_str()].reported_as_inactive);
        }
    }

    #[test]
    fn new_batch_values_win(new_batch in batch_strategy(), prior in batch_strategy()) {
        let expected: HashMap<String, Option<f64>> = new_batch
            .iter()
            .map(|l| (l.listing_id.clone(), l.list_price))
            .collect();
        let out = merge(new_batch, prior, &ExpiryTable::empty());
        for listing in &out.listings {
            if let Some(price) = expected.get(&listing.listing_id) {
                prop_assert_eq!(listing.list_price, *price);
            }
        }
    }

    #[test]
    fn backfill_never_overwrites_known_components(new_batch in batch_strategy()) {
        let cities: HashMap<String, Option<String>> = new_batch
            .iter()
            .map(|l| (l.listing_id.clone(), l.city.clone()))
            .collect();
        let out = merge(new_batch, Vec::new(), &ExpiryTable::empty());
        for listing in &out.listings {
            if let Some(Some(city)) = cities.get(&listing.listing_id) {
                prop_assert_eq!(listing.city.as_deref(), Some(city.as_str()));
            }
        }
    }

    #[test]
    fn known_geometry_is_retained(new_batch in batch_strategy(), prior in batch_strategy()) {
        let prior_geometry: HashMap<String, Point> = prior
            .iter()
            .filter_map(|l| l.geometry.map(|g| (l.listing_id.clone(), g)))
            .collect();
        let out = merge(new_batch, prior.clone(), &ExpiryTable::empty());
        for listing in &out.listings {
            if prior_geometry.contains_key(&listing.listing_id) {
                prop_assert!(listing.geometry.is_some());
            }
        }
    }

    #[test]
    fn gate_output_is_a_fixed_point(sqft in proptest::collection::vec(proptest::option::of(100u32..20_000), 0..40)) {
        let table: Vec<Listing> = sqft
            .iter()
            .enumerate()
            .map(|(i, v)| {
                let mut l = Listing::new(format!("r{i}"), Segment::Lease);
                l.sqft = v.map(f64::from);
                l
            })
            .collect();
        let gate = OutlierGate::new(GateConfig {
            columns: vec!["sqft".into()],
            absolute_caps: BTreeMap::from([("sqft".to_string(), 10_000.0)]),
            ..GateConfig::default()
        });

        let (once, _) = gate.filter(table);
        let (twice, rejected) = gate.filter(once.clone());
        prop_assert!(rejected.is_empty());
        prop_assert_eq!(once.len(), twice.len());
    }
}
