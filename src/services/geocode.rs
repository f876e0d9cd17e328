//! City → coordinates resolution for the outside-temperature lookup.
//!
//! `NominatimGeocoder` talks to an OSM Nominatim search endpoint, spaced by a
//! minimum delay across all threads and retried a fixed number of times with a
//! fixed wait. `GeoCache` is the explicit, batch-scoped memo of those lookups.

use log::{debug, info, warn};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use crate::client::{ClientError, JsonClient};
use crate::config::Config;

#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug)]
pub enum GeocodeError {
    Client(ClientError),
    InvalidCoordinates { city: String, value: String },
}

impl core::fmt::Display for GeocodeError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            GeocodeError::Client(e) => write!(f, "geocoding request failed: {}", e),
            GeocodeError::InvalidCoordinates { city, value } => {
                write!(f, "geocoder returned unparseable coordinate {:?} for {}", value, city)
            }
        }
    }
}

impl std::error::Error for GeocodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            GeocodeError::Client(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ClientError> for GeocodeError {
    fn from(value: ClientError) -> Self {
        GeocodeError::Client(value)
    }
}

/// Anything that can turn a city name into coordinates.
/// `Ok(None)` means the service answered but knows no such place.
pub trait Geocode: Sync {
    fn locate(&self, city: &str) -> Result<Option<Coordinates>, GeocodeError>;
}

pub struct NominatimGeocoder {
    client: JsonClient,
    url: String,
    country: String,
    min_delay: Duration,
    max_retries: u32,
    error_wait: Duration,
    last_call: Mutex<Option<Instant>>,
}

#[derive(Debug, Deserialize)]
struct Place {
    lat: String,
    lon: String,
}

impl NominatimGeocoder {
    pub fn from_config(cfg: &Config) -> Self {
        NominatimGeocoder {
            client: JsonClient::new(cfg.http_timeout, cfg.http_user_agent.clone()),
            url: cfg.geocoder_url.clone(),
            country: cfg.geocoder_country.clone(),
            min_delay: cfg.geocoder_min_delay,
            max_retries: cfg.geocoder_max_retries,
            error_wait: cfg.geocoder_error_wait,
            last_call: Mutex::new(None),
        }
    }

    /// Block until `min_delay` has passed since the previous call from any thread.
    fn wait_for_slot(&self) {
        let mut last = self.last_call.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < self.min_delay {
                thread::sleep(self.min_delay - elapsed);
            }
        }
        *last = Some(Instant::now());
    }

    fn query(&self, city: &str) -> Result<Vec<Place>, ClientError> {
        self.wait_for_slot();
        let q = if self.country.is_empty() {
            city.to_string()
        } else {
            format!("{}, {}", city, self.country)
        };
        self.client.get_json(
            &self.url,
            &[("q", q), ("format", "json".to_string()), ("limit", "1".to_string())],
        )
    }
}

fn parse_coordinate(city: &str, value: &str) -> Result<f64, GeocodeError> {
    value
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| GeocodeError::InvalidCoordinates {
            city: city.to_string(),
            value: value.to_string(),
        })
}

impl Geocode for NominatimGeocoder {
    fn locate(&self, city: &str) -> Result<Option<Coordinates>, GeocodeError> {
        let mut attempt = 0u32;
        let places = loop {
            match self.query(city) {
                Ok(places) => break places,
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    attempt += 1;
                    warn!(
                        "Geocode: lookup for {:?} failed ({}); retry {}/{} in {}s",
                        city,
                        e,
                        attempt,
                        self.max_retries,
                        self.error_wait.as_secs()
                    );
                    thread::sleep(self.error_wait);
                }
                Err(e) => return Err(e.into()),
            }
        };

        let Some(place) = places.into_iter().next() else {
            return Ok(None);
        };
        Ok(Some(Coordinates {
            latitude: parse_coordinate(city, &place.lat)?,
            longitude: parse_coordinate(city, &place.lon)?,
        }))
    }
}

/// Lookups memoised for one batch run. Unresolvable cities are remembered as
/// `None`; failed lookups are not cached so a later caller retries them.
#[derive(Debug, Default)]
pub struct GeoCache {
    entries: Mutex<HashMap<String, Option<Coordinates>>>,
}

impl GeoCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn cached(&self, city: &str) -> Option<Option<Coordinates>> {
        let entries = self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        entries.get(city).copied()
    }

    /// Resolve through the cache; the geocoder is called without holding the lock.
    pub fn resolve(&self, geocoder: &dyn Geocode, city: &str) -> Result<Option<Coordinates>, GeocodeError> {
        if let Some(hit) = self.cached(city) {
            return Ok(hit);
        }
        let found = geocoder.locate(city)?;
        let mut entries = self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        entries.insert(city.to_string(), found);
        Ok(found)
    }

    /// Resolve every distinct city up front. Returns how many resolved.
    pub fn prefetch<'a, I>(&self, geocoder: &dyn Geocode, cities: I) -> usize
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut distinct: Vec<&str> = cities.into_iter().collect();
        distinct.sort_unstable();
        distinct.dedup();

        let mut resolved = 0usize;
        for city in distinct {
            match self.resolve(geocoder, city) {
                Ok(Some(c)) => {
                    debug!("Geocode: {} -> ({:.4}, {:.4})", city, c.latitude, c.longitude);
                    resolved += 1;
                }
                Ok(None) => warn!("Geocode: no match for city {:?}", city),
                Err(e) => warn!("Geocode: lookup for {:?} failed: {}", city, e),
            }
        }
        info!("Geocode: resolved {} city/cities before fan-out", resolved);
        resolved
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
pub mod stub {
    //! In-memory geocoder for pipeline tests.

    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Default)]
    pub struct StaticGeocoder {
        pub places: HashMap<String, Coordinates>,
        pub fail: bool,
        pub calls: AtomicUsize,
    }

    impl StaticGeocoder {
        pub fn with(cities: &[(&str, f64, f64)]) -> Self {
            StaticGeocoder {
                places: cities
                    .iter()
                    .map(|(c, lat, lon)| {
                        (
                            c.to_string(),
                            Coordinates {
                                latitude: *lat,
                                longitude: *lon,
                            },
                        )
                    })
                    .collect(),
                ..Default::default()
            }
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl Geocode for StaticGeocoder {
        fn locate(&self, city: &str) -> Result<Option<Coordinates>, GeocodeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(GeocodeError::Client(ClientError::Transport("offline".into())));
            }
            Ok(self.places.get(city).copied())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::stub::StaticGeocoder;
    use super::*;

    #[test]
    fn cache_hits_skip_the_geocoder() {
        let geocoder = StaticGeocoder::with(&[("Berlin", 52.52, 13.40)]);
        let cache = GeoCache::new();
        assert_eq!(cache.prefetch(&geocoder, ["Berlin", "Berlin", "Atlantis"]), 1);
        assert_eq!(geocoder.calls(), 2);

        let berlin = cache.resolve(&geocoder, "Berlin").unwrap().unwrap();
        assert_eq!(berlin.latitude, 52.52);
        assert_eq!(cache.resolve(&geocoder, "Atlantis").unwrap(), None);
        assert_eq!(geocoder.calls(), 2);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn failures_are_not_cached() {
        let geocoder = StaticGeocoder {
            fail: true,
            ..Default::default()
        };
        let cache = GeoCache::new();
        assert_eq!(cache.prefetch(&geocoder, ["Leipzig"]), 0);
        assert!(cache.is_empty());
        assert!(cache.resolve(&geocoder, "Leipzig").is_err());
        assert_eq!(geocoder.calls(), 2);
    }

    #[test]
    fn nominatim_payload_decodes() {
        let places: Vec<Place> =
            crate::client::decode_json(r#"[{"place_id":1,"lat":"51.0504","lon":"13.7373","display_name":"Dresden"}]"#)
                .unwrap();
        assert_eq!(parse_coordinate("Dresden", &places[0].lat).unwrap(), 51.0504);
        assert!(parse_coordinate("Dresden", "north").is_err());
    }
}
