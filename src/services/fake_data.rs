use crate::dataset::{
    self, ALLOCATOR_COLUMNS, ALLOCATOR_FILE, AllocatorRow, BUILDING_COLUMNS, BUILDING_METADATA_FILE, BuildingRow,
    Dataset, DatasetError, HCA_COLUMNS, HCA_METADATA_FILE, HcaRow, ROOM_COLUMNS, ROOM_TEMP_COLUMNS, ROOM_TEMP_FILE,
    ROOMS_METADATA_FILE, RoomRow, RoomTempRow, UNITS_COLUMNS, UNITS_FILE, UnitsRow,
};
use crate::models::telemetry::{AllocatorConstants, BuildingId};
use crate::services::heat_yield::heat_yield;
use chrono::{DateTime, Datelike, Days, Duration, NaiveDate, TimeZone, Timelike, Utc};
use log::info;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::f64::consts::PI;

const SEED: u64 = 0x0420_1337_DEAD_BEEFu64;
const BUILDINGS: [(i64, &str); 3] = [(1, "Dresden"), (2, "Leipzig"), (3, "Chemnitz")];
const ROOMS_PER_BUILDING: i64 = 4;

/// Synthetic dataset in the on-disk layout, before it is written.
#[derive(Debug, Clone, PartialEq)]
pub struct FakeDataset {
    pub buildings: Vec<BuildingRow>,
    pub rooms: Vec<RoomRow>,
    pub allocators: Vec<HcaRow>,
    pub telemetry: Vec<FakeBuilding>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FakeBuilding {
    pub building_id: BuildingId,
    pub room_temps: Vec<RoomTempRow>,
    pub allocator_temps: Vec<AllocatorRow>,
    pub units: Vec<UnitsRow>,
}

pub fn run(dataset: &Dataset) -> Result<(), String> {
    let start = Utc
        .with_ymd_and_hms(2023, 12, 18, 0, 0, 0)
        .single()
        .ok_or_else(|| "invalid fake data start".to_string())?;
    let end = Utc
        .with_ymd_and_hms(2024, 1, 15, 0, 0, 0)
        .single()
        .ok_or_else(|| "invalid fake data end".to_string())?;

    info!(
        "Fake data: generating {} building(s) from {} to {} into {}",
        BUILDINGS.len(),
        start,
        end,
        dataset.root().display()
    );
    let fake = generate(SEED, start, end);
    write(dataset, &fake).map_err(|e| format!("writing fake data failed: {}", e))?;

    let rows: usize = fake
        .telemetry
        .iter()
        .map(|b| b.room_temps.len() + b.allocator_temps.len() + b.units.len())
        .sum();
    info!(
        "Fake data: complete (rooms={}, allocators={}, telemetry_rows={})",
        fake.rooms.len(),
        fake.allocators.len(),
        rows
    );
    Ok(())
}

pub fn write(dataset: &Dataset, fake: &FakeDataset) -> Result<(), DatasetError> {
    let root = dataset.root();
    dataset::write_table(&root.join(BUILDING_METADATA_FILE), &BUILDING_COLUMNS, &fake.buildings)?;
    dataset::write_table(&root.join(ROOMS_METADATA_FILE), &ROOM_COLUMNS, &fake.rooms)?;
    dataset::write_table(&root.join(HCA_METADATA_FILE), &HCA_COLUMNS, &fake.allocators)?;
    for building in &fake.telemetry {
        let dir = dataset.building_dir(building.building_id);
        dataset::write_table(&dir.join(ROOM_TEMP_FILE), &ROOM_TEMP_COLUMNS, &building.room_temps)?;
        dataset::write_table(&dir.join(ALLOCATOR_FILE), &ALLOCATOR_COLUMNS, &building.allocator_temps)?;
        dataset::write_table(&dir.join(UNITS_FILE), &UNITS_COLUMNS, &building.units)?;
    }
    Ok(())
}

/// Deterministic dataset for `[start, end)`.
///
/// Building 2 has an allocator with no room on file and building 3 one
/// without calibration constants.
pub fn generate(seed: u64, start: DateTime<Utc>, end: DateTime<Utc>) -> FakeDataset {
    let mut rng = SmallRng::seed_from_u64(seed);
    let mut fake = FakeDataset {
        buildings: Vec::new(),
        rooms: Vec::new(),
        allocators: Vec::new(),
        telemetry: Vec::new(),
    };

    for (building_id, city) in BUILDINGS {
        fake.buildings.push(BuildingRow {
            building_id,
            city: city.to_string(),
        });
        let mut building = FakeBuilding {
            building_id: BuildingId(building_id),
            room_temps: Vec::new(),
            allocator_temps: Vec::new(),
            units: Vec::new(),
        };

        for room_index in 0..ROOMS_PER_BUILDING {
            let room_id = building_id * 100 + room_index;
            fake.rooms.push(RoomRow { room_id, building_id });
            let setpoint = 20.0 + room_index as f64 * 0.4;
            building
                .room_temps
                .extend(room_series(room_id, setpoint, start, end, &mut rng));

            let allocator_count = if room_index % 2 == 0 { 2 } else { 1 };
            for slot in 0..allocator_count {
                let allocator_id = building_id * 1000 + room_index * 10 + slot;
                let constants = AllocatorConstants {
                    qs: rng.random_range(400.0..1200.0),
                    kcw: rng.random_range(0.9..1.1),
                    kcl: rng.random_range(1.0..1.2),
                };
                let uncalibrated = building_id == 3 && room_index == 1;
                let unmapped = building_id == 2 && room_index == 3;
                fake.allocators.push(HcaRow {
                    heat_cost_allocator_id: allocator_id,
                    room_id: (!unmapped).then_some(room_id),
                    qs: (!uncalibrated).then_some(constants.qs),
                    kcw: (!uncalibrated).then_some(constants.kcw),
                    kcl: (!uncalibrated).then_some(constants.kcl),
                });

                let (temps, daily) = allocator_series(allocator_id, setpoint, &constants, start, end, &mut rng);
                building.allocator_temps.extend(temps);
                building.units.extend(unit_counter(allocator_id, &daily, start, end, &mut rng));
            }
        }
        fake.telemetry.push(building);
    }
    fake
}

fn ts_string(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M:%S+00:00").to_string()
}

fn day_fraction(ts: DateTime<Utc>) -> f64 {
    ts.time().num_seconds_from_midnight() as f64 / 86_400.0
}

/// Heating runs from 06:00 to 22:00.
fn heating_on(ts: DateTime<Utc>) -> bool {
    (0.25..0.92).contains(&day_fraction(ts))
}

fn outside_temp(ts: DateTime<Utc>, rng: &mut SmallRng) -> f64 {
    let diurnal = ((day_fraction(ts) - 0.3) * 2.0 * PI).sin() * 4.0;
    let seasonal = (ts.ordinal0() as f64 / 365.0 * 2.0 * PI).cos() * 2.0;
    let random_variation = rng.random_range(-1.0..=1.0);
    (1.0 + diurnal - seasonal + random_variation).clamp(-15.0, 15.0)
}

/// Sensors drop out now and then for a few hours.
fn next_sample(ts: DateTime<Utc>, min_step: i64, max_step: i64, rng: &mut SmallRng) -> DateTime<Utc> {
    if rng.random_bool(0.004) {
        ts + Duration::hours(rng.random_range(1..=16))
    } else {
        ts + Duration::minutes(rng.random_range(min_step..=max_step))
    }
}

fn room_series(
    room_id: i64,
    setpoint: f64,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    rng: &mut SmallRng,
) -> Vec<RoomTempRow> {
    let mut rows = Vec::new();
    let mut ts = start + Duration::minutes(rng.random_range(0..10));
    while ts < end {
        let night_setback = if heating_on(ts) { 0.0 } else { 1.5 };
        let temperature = setpoint - night_setback + rng.random_range(-0.4..=0.4);
        rows.push(RoomTempRow {
            room_id,
            ts: ts_string(ts),
            temperature: (!rng.random_bool(0.01)).then_some(temperature),
        });
        ts = next_sample(ts, 8, 25, rng);
    }
    rows
}

/// Allocator temperatures plus the heat they imply per day.
fn allocator_series(
    allocator_id: i64,
    setpoint: f64,
    constants: &AllocatorConstants,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    rng: &mut SmallRng,
) -> (Vec<AllocatorRow>, BTreeMap<NaiveDate, f64>) {
    let mut rows = Vec::new();
    let mut daily: BTreeMap<NaiveDate, f64> = BTreeMap::new();
    let mut previous: Option<DateTime<Utc>> = None;
    let mut ts = start + Duration::minutes(rng.random_range(0..15));

    while ts < end {
        let outside = outside_temp(ts, rng);
        let room_side = setpoint - 0.5 + rng.random_range(-0.3..=0.3);
        let heater_side = if heating_on(ts) {
            room_side + 8.0 + (18.0 - outside).max(0.0) * 1.6 + rng.random_range(-1.5..=1.5)
        } else {
            room_side + rng.random_range(0.0..=2.0)
        };
        rows.push(AllocatorRow {
            heat_cost_allocator_id: allocator_id,
            ts: ts_string(ts),
            temperature_1: Some(room_side),
            temperature_2: Some(heater_side),
        });

        let dt = previous.map(|p| (ts - p).num_seconds() as f64 / 3600.0);
        if let Some(q) = heat_yield(Some(constants), Some(heater_side), Some(room_side), dt) {
            *daily.entry(ts.date_naive()).or_insert(0.0) += q;
        }
        previous = Some(ts);
        ts = next_sample(ts, 15, 30, rng);
    }
    (rows, daily)
}

/// One cumulative reading per day at 23:50; the counter restarts on January 1st.
fn unit_counter(
    allocator_id: i64,
    daily: &BTreeMap<NaiveDate, f64>,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    rng: &mut SmallRng,
) -> Vec<UnitsRow> {
    let mut rows = Vec::new();
    let mut counter = rng.random_range(150.0..400.0);
    let mut day = start.date_naive();
    while day < end.date_naive() {
        if day.month() == 1 && day.day() == 1 {
            counter = 0.0;
        }
        counter += daily.get(&day).copied().unwrap_or(0.0) * rng.random_range(0.9..1.1);
        if let Some(ts) = day.and_hms_opt(23, 50, 0) {
            rows.push(UnitsRow {
                heat_cost_allocator_id: allocator_id,
                ts: ts_string(ts.and_utc()),
                units: Some((counter * 100.0).round() / 100.0),
            });
        }
        match day.checked_add_days(Days::new(1)) {
            Some(next) => day = next,
            None => break,
        }
    }
    rows
}
