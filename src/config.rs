//! Runtime configuration from environment variables.
//! Defaults point at the public Nominatim and Open-Meteo endpoints and a
//! `data/` → `output/` layout in the working directory.

use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::time::Duration;

use crate::models::telemetry::BuildingId;

pub const DEFAULT_DATA_DIR: &str = "data";
pub const DEFAULT_OUTPUT_DIR: &str = "output";
pub const DEFAULT_WORKER_THREADS: usize = 4;
pub const DEFAULT_GEOCODER_URL: &str = "https://nominatim.openstreetmap.org/search";
pub const DEFAULT_WEATHER_URL: &str = "https://archive-api.open-meteo.com/v1/archive";

#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub output_dir: PathBuf,
    /// Restrict the batch to these buildings; `None` means every building in the metadata.
    pub building_ids: Option<Vec<BuildingId>>,
    pub excluded_building_ids: Vec<BuildingId>,
    /// Size of the building worker pool.
    pub worker_threads: NonZeroUsize,
    pub geocoder_url: String,
    /// Appended to every city query ("<city>, <country>").
    pub geocoder_country: String,
    /// Minimum spacing between two geocoding calls.
    pub geocoder_min_delay: Duration,
    pub geocoder_max_retries: u32,
    pub geocoder_error_wait: Duration,
    pub weather_url: String,
    pub http_timeout: Duration,
    pub http_user_agent: String,
    pub qa_enabled: bool,
}

fn parse_bool(s: &str) -> bool {
    matches!(s.trim(), "1" | "true" | "TRUE" | "yes")
}

fn parse_number<T: std::str::FromStr>(name: &str, default: T) -> Result<T, String> {
    match std::env::var(name) {
        Ok(s) if !s.trim().is_empty() => s
            .trim()
            .parse::<T>()
            .map_err(|_| format!("{} must be a non-negative integer, got {:?}", name, s)),
        _ => Ok(default),
    }
}

/// Parse a comma-separated list of building ids ("13, 50,57").
pub fn parse_id_list(name: &str, raw: &str) -> Result<Vec<BuildingId>, String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<i64>()
                .map(BuildingId)
                .map_err(|_| format!("{} contains an invalid building id: {:?}", name, s))
        })
        .collect()
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        let data_dir = std::env::var("DATA_DIR").unwrap_or_else(|_| DEFAULT_DATA_DIR.to_string());
        let output_dir = std::env::var("OUTPUT_DIR").unwrap_or_else(|_| DEFAULT_OUTPUT_DIR.to_string());

        let building_ids = match std::env::var("BUILDING_IDS") {
            Ok(s) if !s.trim().is_empty() => Some(parse_id_list("BUILDING_IDS", &s)?),
            _ => None,
        };
        let excluded_building_ids = match std::env::var("EXCLUDED_BUILDING_IDS") {
            Ok(s) => parse_id_list("EXCLUDED_BUILDING_IDS", &s)?,
            Err(_) => Vec::new(),
        };

        let worker_threads = NonZeroUsize::new(parse_number("WORKER_THREADS", DEFAULT_WORKER_THREADS)?)
            .ok_or_else(|| "WORKER_THREADS must be at least 1".to_string())?;

        let geocoder_url = std::env::var("GEOCODER_URL").unwrap_or_else(|_| DEFAULT_GEOCODER_URL.to_string());
        let geocoder_country = std::env::var("GEOCODER_COUNTRY").unwrap_or_else(|_| "Germany".to_string());
        let geocoder_min_delay = Duration::from_millis(parse_number("GEOCODER_MIN_DELAY_MS", 1100u64)?);
        let geocoder_max_retries = parse_number("GEOCODER_MAX_RETRIES", 2u32)?;
        let geocoder_error_wait = Duration::from_secs(parse_number("GEOCODER_ERROR_WAIT_SECS", 5u64)?);

        let weather_url = std::env::var("WEATHER_URL").unwrap_or_else(|_| DEFAULT_WEATHER_URL.to_string());
        let http_timeout = Duration::from_secs(parse_number("HTTP_TIMEOUT_SECS", 10u64)?);
        let http_user_agent = std::env::var("HTTP_USER_AGENT")
            .unwrap_or_else(|_| format!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")));

        let qa_enabled = std::env::var("QA_ENABLED")
            .ok()
            .map(|s| parse_bool(&s))
            .unwrap_or(true);

        Ok(Config {
            data_dir: PathBuf::from(data_dir),
            output_dir: PathBuf::from(output_dir),
            building_ids,
            excluded_building_ids,
            worker_threads,
            geocoder_url,
            geocoder_country,
            geocoder_min_delay,
            geocoder_max_retries,
            geocoder_error_wait,
            weather_url,
            http_timeout,
            http_user_agent,
            qa_enabled,
        })
    }

    /// Apply `BUILDING_IDS` / `EXCLUDED_BUILDING_IDS` to the buildings known from metadata.
    pub fn select_buildings(&self, known: &[BuildingId]) -> Vec<BuildingId> {
        let mut ids: Vec<BuildingId> = match &self.building_ids {
            Some(wanted) => wanted.clone(),
            None => known.to_vec(),
        };
        ids.retain(|id| !self.excluded_building_ids.contains(id));
        ids.sort_unstable();
        ids.dedup();
        ids
    }
}
