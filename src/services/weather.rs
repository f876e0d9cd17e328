//! Hourly outside temperature for a location and date range.
//!
//! The default source is the Open-Meteo historical archive. No retries: a
//! failed fetch fails the building that asked for it.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use log::debug;
use serde::Deserialize;
use std::collections::BTreeMap;

use crate::client::{ClientError, JsonClient};
use crate::config::Config;
use crate::services::geocode::Coordinates;
use crate::utils::{finite, floor_hour};

#[derive(Debug)]
pub enum WeatherError {
    Client(ClientError),
    Malformed(String),
}

impl core::fmt::Display for WeatherError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            WeatherError::Client(e) => write!(f, "weather request failed: {}", e),
            WeatherError::Malformed(s) => write!(f, "malformed weather payload: {}", s),
        }
    }
}

impl std::error::Error for WeatherError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            WeatherError::Client(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ClientError> for WeatherError {
    fn from(value: ClientError) -> Self {
        WeatherError::Client(value)
    }
}

/// Outside temperature keyed by UTC hour.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutsideTemperatures {
    by_hour: BTreeMap<DateTime<Utc>, f64>,
}

impl OutsideTemperatures {
    /// Points are floored to the hour; a later point for the same hour wins.
    pub fn from_points<I>(points: I) -> Self
    where
        I: IntoIterator<Item = (DateTime<Utc>, Option<f64>)>,
    {
        let by_hour = points
            .into_iter()
            .filter_map(|(ts, v)| finite(v).map(|v| (floor_hour(ts), v)))
            .collect();
        OutsideTemperatures { by_hour }
    }

    pub fn at(&self, hour: DateTime<Utc>) -> Option<f64> {
        self.by_hour.get(&hour).copied()
    }

    pub fn len(&self) -> usize {
        self.by_hour.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_hour.is_empty()
    }
}

pub trait WeatherSource: Sync {
    /// Hourly series covering `start..=end` (whole days, UTC).
    fn hourly_outside_temperature(
        &self,
        at: Coordinates,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<OutsideTemperatures, WeatherError>;
}

pub struct OpenMeteoWeather {
    client: JsonClient,
    url: String,
}

#[derive(Debug, Deserialize)]
struct ArchiveResponse {
    hourly: HourlyBlock,
}

#[derive(Debug, Deserialize)]
struct HourlyBlock {
    time: Vec<String>,
    temperature_2m: Vec<Option<f64>>,
}

impl OpenMeteoWeather {
    pub fn from_config(cfg: &Config) -> Self {
        OpenMeteoWeather {
            client: JsonClient::new(cfg.http_timeout, cfg.http_user_agent.clone()),
            url: cfg.weather_url.clone(),
        }
    }
}

fn parse_archive(resp: ArchiveResponse) -> Result<OutsideTemperatures, WeatherError> {
    let HourlyBlock { time, temperature_2m } = resp.hourly;
    if time.len() != temperature_2m.len() {
        return Err(WeatherError::Malformed(format!(
            "{} timestamps but {} temperatures",
            time.len(),
            temperature_2m.len()
        )));
    }
    let mut points = Vec::with_capacity(time.len());
    for (raw, value) in time.iter().zip(temperature_2m) {
        let ts = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M")
            .map_err(|e| WeatherError::Malformed(format!("timestamp {:?}: {}", raw, e)))?
            .and_utc();
        points.push((ts, value));
    }
    Ok(OutsideTemperatures::from_points(points))
}

impl WeatherSource for OpenMeteoWeather {
    fn hourly_outside_temperature(
        &self,
        at: Coordinates,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<OutsideTemperatures, WeatherError> {
        let resp: ArchiveResponse = self.client.get_json(
            &self.url,
            &[
                ("latitude", format!("{:.4}", at.latitude)),
                ("longitude", format!("{:.4}", at.longitude)),
                ("start_date", start.format("%Y-%m-%d").to_string()),
                ("end_date", end.format("%Y-%m-%d").to_string()),
                ("hourly", "temperature_2m".to_string()),
                ("timezone", "UTC".to_string()),
            ],
        )?;
        let series = parse_archive(resp)?;
        debug!(
            "Weather: {} hourly point(s) for ({:.4}, {:.4}) {}..={}",
            series.len(),
            at.latitude,
            at.longitude,
            start,
            end
        );
        Ok(series)
    }
}

#[cfg(test)]
pub mod stub {
    //! Deterministic weather source for pipeline tests.

    use super::*;
    use crate::utils::hour_range;
    use chrono::{NaiveTime, Timelike};

    /// Returns `base - hour_of_day / 4` for every hour of the requested range.
    #[derive(Debug, Default)]
    pub struct FlatWeather {
        pub base: f64,
        pub fail: bool,
    }

    impl WeatherSource for FlatWeather {
        fn hourly_outside_temperature(
            &self,
            _at: Coordinates,
            start: NaiveDate,
            end: NaiveDate,
        ) -> Result<OutsideTemperatures, WeatherError> {
            if self.fail {
                return Err(WeatherError::Malformed("stub failure".into()));
            }
            let first = start.and_time(NaiveTime::MIN).and_utc();
            let last = end.and_hms_opt(23, 0, 0).unwrap().and_utc();
            Ok(OutsideTemperatures::from_points(
                hour_range(first, last).map(|h| (h, Some(self.base - h.hour() as f64 / 4.0))),
            ))
        }
    }
}
