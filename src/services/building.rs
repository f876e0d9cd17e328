//! One building end to end: locate the city, fetch outside temperature for
//! the observed span, resample rooms and allocators to hours, estimate heat
//! and join everything into the room-hour table.

use chrono::{DateTime, Utc};
use log::{debug, info};
use std::collections::BTreeMap;

use crate::dataset::DatasetError;
use crate::models::report::{RoomHourRecord, RoomHourTable};
use crate::models::telemetry::{BuildingId, BuildingInput, RoomId};
use crate::services::geocode::{GeoCache, Geocode, GeocodeError};
use crate::services::heat_yield::{RoomHeat, estimate_yields, rollup_by_room};
use crate::services::resample::{HourlySeries, allocator_hours, resample_allocators, resample_rooms};
use crate::services::weather::{OutsideTemperatures, WeatherError, WeatherSource};
use crate::utils::{ceil_day, floor_day, hour_range};

/// Collaborators shared by every building of one batch run.
#[derive(Clone, Copy)]
pub struct PipelineContext<'a> {
    pub geocoder: &'a dyn Geocode,
    pub weather: &'a dyn WeatherSource,
    pub cache: &'a GeoCache,
}

#[derive(Debug)]
pub enum BuildingError {
    Input(DatasetError),
    Geocode { city: String, source: GeocodeError },
    CityNotFound(String),
    Weather(WeatherError),
}

impl core::fmt::Display for BuildingError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            BuildingError::Input(e) => write!(f, "input: {}", e),
            BuildingError::Geocode { city, source } => write!(f, "geocoding {:?}: {}", city, source),
            BuildingError::CityNotFound(city) => write!(f, "city {:?} could not be located", city),
            BuildingError::Weather(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for BuildingError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BuildingError::Input(e) => Some(e),
            BuildingError::Geocode { source, .. } => Some(source),
            BuildingError::Weather(e) => Some(e),
            BuildingError::CityNotFound(_) => None,
        }
    }
}

impl From<DatasetError> for BuildingError {
    fn from(value: DatasetError) -> Self {
        BuildingError::Input(value)
    }
}

impl From<WeatherError> for BuildingError {
    fn from(value: WeatherError) -> Self {
        BuildingError::Weather(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmptyReason {
    /// Neither room nor allocator readings.
    NoReadings,
    /// Readings exist but none could be placed in a room.
    NoRoomHours,
}

impl core::fmt::Display for EmptyReason {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            EmptyReason::NoReadings => write!(f, "no room or allocator readings"),
            EmptyReason::NoRoomHours => write!(f, "no reading maps to a room"),
        }
    }
}

/// Result of one building: a table, a legitimately empty input, or a failure.
#[derive(Debug)]
pub enum BuildingOutcome {
    Completed(RoomHourTable),
    Empty(EmptyReason),
    Failed(BuildingError),
}

impl BuildingOutcome {
    /// The building's contribution to the batch; empty unless completed.
    pub fn into_table(self) -> RoomHourTable {
        match self {
            BuildingOutcome::Completed(table) => table,
            _ => RoomHourTable::new(),
        }
    }
}

pub fn process_building(input: &BuildingInput, ctx: &PipelineContext<'_>) -> BuildingOutcome {
    let Some((first, last)) = input.observed_span() else {
        return BuildingOutcome::Empty(EmptyReason::NoReadings);
    };
    match build_table(input, ctx, first, last) {
        Ok(table) if table.is_empty() => BuildingOutcome::Empty(EmptyReason::NoRoomHours),
        Ok(table) => BuildingOutcome::Completed(table),
        Err(e) => BuildingOutcome::Failed(e),
    }
}

fn build_table(
    input: &BuildingInput,
    ctx: &PipelineContext<'_>,
    first: DateTime<Utc>,
    last: DateTime<Utc>,
) -> Result<RoomHourTable, BuildingError> {
    let coordinates = ctx
        .cache
        .resolve(ctx.geocoder, &input.city)
        .map_err(|source| BuildingError::Geocode {
            city: input.city.clone(),
            source,
        })?
        .ok_or_else(|| BuildingError::CityNotFound(input.city.clone()))?;

    let start = floor_day(first).date_naive();
    let end = ceil_day(last).date_naive();
    let outside = ctx.weather.hourly_outside_temperature(coordinates, start, end)?;
    debug!(
        "Building {}: {} outside temperature point(s) for {}..={}",
        input.building_id.0,
        outside.len(),
        start,
        end
    );

    let rooms = resample_rooms(&input.rooms);
    let allocators = resample_allocators(&input.allocators);
    let samples = estimate_yields(allocator_hours(&allocators), &input.allocator_meta);
    let heat = rollup_by_room(&samples, &input.allocator_meta);

    let table = join_room_hours(input.building_id, &rooms, &heat, &outside);
    info!(
        "Building {}: {} room-hour row(s) across {} room(s)",
        input.building_id.0,
        table.len(),
        table.by_room().len()
    );
    Ok(table)
}

/// Outer join of room temperature and room heat on `(room, hour)`, filled to
/// a regular grid per room, with outside temperature looked up by hour.
pub fn join_room_hours(
    building_id: BuildingId,
    rooms: &BTreeMap<RoomId, HourlySeries<1>>,
    heat: &BTreeMap<(RoomId, DateTime<Utc>), RoomHeat>,
    outside: &OutsideTemperatures,
) -> RoomHourTable {
    let mut spans: BTreeMap<RoomId, (DateTime<Utc>, DateTime<Utc>)> = BTreeMap::new();
    let mut widen = |room: RoomId, lo: DateTime<Utc>, hi: DateTime<Utc>| {
        spans
            .entry(room)
            .and_modify(|span| *span = (span.0.min(lo), span.1.max(hi)))
            .or_insert((lo, hi));
    };
    for (room, series) in rooms {
        if !series.is_empty() {
            widen(*room, series.start(), series.end());
        }
    }
    for (room, hour) in heat.keys() {
        widen(*room, *hour, *hour);
    }

    let mut rows = Vec::new();
    for (room_id, (lo, hi)) in spans {
        let series = rooms.get(&room_id);
        for hour in hour_range(lo, hi) {
            let mut record = RoomHourRecord::empty(room_id, hour, building_id);
            record.inside_temp = series.and_then(|s| s.at(hour)).and_then(|v| v[0]);
            if let Some(h) = heat.get(&(room_id, hour)) {
                record.hca_units = h.hca_units;
                record.heater_side_hca_temp = h.heater_side_max;
                record.room_side_hca_temp = h.room_side_mean;
            }
            record.outside_temp = outside.at(hour);
            rows.push(record);
        }
    }
    RoomHourTable::from_rows(rows)
}
