use std::sync::Arc;

use anyhow::Result;
use larentals_adapters::{AddressLookup, GeocodeCache, Geocoder};
use larentals_core::Listing;
use tracing::{debug, warn};

/// Latitude north of LA County; coordinates above it came from a bad geocode.
pub const RE_GEOCODE_LATITUDE: f64 = 35.393528;

pub trait EnrichmentHook: Send + Sync {
    fn apply(&self, listings: Vec<Listing>) -> Result<Vec<Listing>>;
}

#[derive(Debug, Default)]
pub struct NoopEnrichmentHook;

impl EnrichmentHook for NoopEnrichmentHook {
    fn apply(&self, listings: Vec<Listing>) -> Result<Vec<Listing>> {
        Ok(listings)
    }
}

/// Fills missing city, zip and coordinates from precomputed lookups.
pub struct GeocodeEnrichmentHook {
    geocoder: Arc<dyn Geocoder>,
    lookup: Arc<dyn AddressLookup>,
}

impl GeocodeEnrichmentHook {
    pub fn new(geocoder: Arc<dyn Geocoder>, lookup: Arc<dyn AddressLookup>) -> Self {
        Self { geocoder, lookup }
    }

    pub fn from_cache(cache: GeocodeCache) -> Self {
        let cache = Arc::new(cache);
        Self {
            geocoder: cache.clone(),
            lookup: cache,
        }
    }

    fn enrich(&self, listing: &mut Listing) {
        if listing.city.is_none() {
            if let (Some(street), Some(zip)) = (&listing.street_address, &listing.zip_code) {
                listing.city = self.lookup.city(&format!("{street} {zip}"));
            }
        }
        listing.recompute_derived_addresses();

        if listing.zip_code.is_none() {
            if let Some(short) = &listing.short_address {
                listing.zip_code = self.lookup.zip_code(short);
            }
            listing.recompute_derived_addresses();
        }

        let misplaced = listing.latitude.is_some_and(|lat| lat > RE_GEOCODE_LATITUDE);
        if listing.latitude.is_none() || listing.longitude.is_none() || misplaced {
            let answer = listing
                .full_street_address
                .as_deref()
                .and_then(|address| self.geocoder.geocode(address));
            match answer {
                Some((lat, lon)) => {
                    listing.latitude = Some(lat);
                    listing.longitude = Some(lon);
                }
                None if misplaced => {
                    warn!(listing_id = %listing.listing_id, "coordinates outside the county and no geocode to replace them");
                }
                None => debug!(listing_id = %listing.listing_id, "no geocode for listing"),
            }
        }
        listing.refresh_geometry();
    }
}

impl EnrichmentHook for GeocodeEnrichmentHook {
    fn apply(&self, mut listings: Vec<Listing>) -> Result<Vec<Listing>> {
        for listing in &mut listings {
            self.enrich(listing);
        }
        Ok(listings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use larentals_adapters::GeocodeEntry;
    use larentals_core::{Point, Segment};

    fn cache() -> GeocodeCache {
        GeocodeCache::new()
            .with_entry(
                "123 Main St 90001",
                GeocodeEntry {
                    city: Some("Springfield".into()),
                    ..GeocodeEntry::default()
                },
            )
            .with_entry(
                "123 Main St, Springfield 90001",
                GeocodeEntry {
                    latitude: Some(34.05),
                    longitude: Some(-118.25),
                    ..GeocodeEntry::default()
                },
            )
            .with_entry(
                "9 Oak Ln, Glendale",
                GeocodeEntry {
                    zip_code: Some("91203".into()),
                    ..GeocodeEntry::default()
                },
            )
    }

    #[test]
    fn fills_city_then_coordinates() {
        let mut l = Listing::new("A1", Segment::Lease);
        l.street_address = Some("123 Main St".into());
        l.zip_code = Some("90001".into());

        let out = GeocodeEnrichmentHook::from_cache(cache()).apply(vec![l]).expect("enrich");
        assert_eq!(out[0].city.as_deref(), Some("Springfield"));
        assert_eq!(out[0].full_street_address.as_deref(), Some("123 Main St, Springfield 90001"));
        assert_eq!(out[0].geometry, Some(Point { lon: -118.25, lat: 34.05 }));
    }

    #[test]
    fn fills_missing_zip_from_short_address() {
        let mut l = Listing::new("B2", Segment::Buy);
        l.street_address = Some("9 Oak Ln".into());
        l.city = Some("Glendale".into());

        let out = GeocodeEnrichmentHook::from_cache(cache()).apply(vec![l]).expect("enrich");
        assert_eq!(out[0].zip_code.as_deref(), Some("91203"));
        assert_eq!(out[0].full_street_address.as_deref(), Some("9 Oak Ln, Glendale 91203"));
    }

    #[test]
    fn regeocodes_coordinates_north_of_the_county() {
        let mut l = Listing::new("A1", Segment::Lease);
        l.street_address = Some("123 Main St".into());
        l.city = Some("Springfield".into());
        l.zip_code = Some("90001".into());
        l.latitude = Some(37.7);
        l.longitude = Some(-122.4);

        let out = GeocodeEnrichmentHook::from_cache(cache()).apply(vec![l]).expect("enrich");
        assert_eq!(out[0].latitude, Some(34.05));
        assert_eq!(out[0].longitude, Some(-118.25));
    }

    #[test]
    fn lookup_misses_leave_fields_missing() {
        let mut l = Listing::new("C3", Segment::Lease);
        l.street_address = Some("1 Nowhere Rd".into());

        let out = GeocodeEnrichmentHook::from_cache(GeocodeCache::new())
            .apply(vec![l])
            .expect("enrich");
        assert!(out[0].city.is_none());
        assert!(out[0].geometry.is_none());
    }
}
