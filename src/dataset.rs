//! CSV dataset on disk: static metadata, per-building telemetry and the two
//! result tables.
//!
//! Layout under the data root:
//!
//! ```text
//! building_metadata.csv          building_id,city
//! rooms_metadata.csv             room_id,building_id
//! hca_metadata.csv               heat_cost_allocator_id,room_id,qs,kcw,kcl
//! Building-<id>/room_temp_ts.csv room_id,ts,temperature
//! Building-<id>/allocator_ts.csv heat_cost_allocator_id,ts,temperature_1,temperature_2
//! Building-<id>/units_ts.csv     heat_cost_allocator_id,ts,units
//! ```
//!
//! `temperature_1` is the room-side sensor, `temperature_2` the heater side.
//! Header columns are validated on load. Rows whose values cannot be decoded
//! or whose timestamp does not parse are dropped and counted.

use log::{debug, warn};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::path::{Path, PathBuf};

use crate::models::report::{QaRecord, RoomHourRecord, RoomHourTable};
use crate::models::telemetry::{
    AllocatorConstants, AllocatorId, AllocatorMeta, AllocatorReading, BuildingId, BuildingInput, MeterReading,
    RoomId, RoomReading,
};
use crate::utils::{finite, parse_timestamp};

pub const BUILDING_METADATA_FILE: &str = "building_metadata.csv";
pub const ROOMS_METADATA_FILE: &str = "rooms_metadata.csv";
pub const HCA_METADATA_FILE: &str = "hca_metadata.csv";
pub const ROOM_TEMP_FILE: &str = "room_temp_ts.csv";
pub const ALLOCATOR_FILE: &str = "allocator_ts.csv";
pub const UNITS_FILE: &str = "units_ts.csv";
pub const RESAMPLED_FILE: &str = "resampled_data.csv";
pub const QA_REPORT_FILE: &str = "data_qa_report.csv";

pub const BUILDING_COLUMNS: [&str; 2] = ["building_id", "city"];
pub const ROOM_COLUMNS: [&str; 2] = ["room_id", "building_id"];
pub const HCA_COLUMNS: [&str; 5] = ["heat_cost_allocator_id", "room_id", "qs", "kcw", "kcl"];
pub const ROOM_TEMP_COLUMNS: [&str; 3] = ["room_id", "ts", "temperature"];
pub const ALLOCATOR_COLUMNS: [&str; 4] = ["heat_cost_allocator_id", "ts", "temperature_1", "temperature_2"];
pub const UNITS_COLUMNS: [&str; 3] = ["heat_cost_allocator_id", "ts", "units"];
pub const ROOM_HOUR_COLUMNS: [&str; 8] = [
    "room_id",
    "ts",
    "hca_units",
    "inside_temp",
    "heater_side_hca_temp",
    "room_side_hca_temp",
    "outside_temp",
    "building_id",
];

#[derive(Debug)]
pub enum DatasetError {
    Io { path: PathBuf, source: std::io::Error },
    Csv { path: PathBuf, source: csv::Error },
    MissingColumns { path: PathBuf, missing: Vec<String> },
    UnknownBuilding(BuildingId),
}

impl core::fmt::Display for DatasetError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            DatasetError::Io { path, source } => write!(f, "{}: {}", path.display(), source),
            DatasetError::Csv { path, source } => write!(f, "{}: csv error: {}", path.display(), source),
            DatasetError::MissingColumns { path, missing } => {
                write!(f, "{}: missing column(s) {}", path.display(), missing.join(", "))
            }
            DatasetError::UnknownBuilding(id) => write!(f, "building {} is not in the building metadata", id.0),
        }
    }
}

impl std::error::Error for DatasetError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DatasetError::Io { source, .. } => Some(source),
            DatasetError::Csv { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl DatasetError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, DatasetError::Io { source, .. } if source.kind() == std::io::ErrorKind::NotFound)
    }
}

// =====================
// Raw CSV rows
// =====================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildingRow {
    pub building_id: i64,
    pub city: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomRow {
    pub room_id: i64,
    pub building_id: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HcaRow {
    pub heat_cost_allocator_id: i64,
    #[serde(deserialize_with = "csv::invalid_option")]
    pub room_id: Option<i64>,
    #[serde(deserialize_with = "csv::invalid_option")]
    pub qs: Option<f64>,
    #[serde(deserialize_with = "csv::invalid_option")]
    pub kcw: Option<f64>,
    #[serde(deserialize_with = "csv::invalid_option")]
    pub kcl: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomTempRow {
    pub room_id: i64,
    pub ts: String,
    #[serde(deserialize_with = "csv::invalid_option")]
    pub temperature: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocatorRow {
    pub heat_cost_allocator_id: i64,
    pub ts: String,
    /// Room side.
    #[serde(deserialize_with = "csv::invalid_option")]
    pub temperature_1: Option<f64>,
    /// Heater side.
    #[serde(deserialize_with = "csv::invalid_option")]
    pub temperature_2: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitsRow {
    pub heat_cost_allocator_id: i64,
    pub ts: String,
    #[serde(deserialize_with = "csv::invalid_option")]
    pub units: Option<f64>,
}

// =====================
// Table I/O
// =====================

fn open(path: &Path) -> Result<File, DatasetError> {
    File::open(path).map_err(|source| DatasetError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Read a whole CSV table, checking that every `required` column is present.
/// Undecodable rows are skipped with a warning.
pub fn read_table<T: DeserializeOwned>(path: &Path, required: &[&str]) -> Result<Vec<T>, DatasetError> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(open(path)?);

    let headers = reader
        .headers()
        .map_err(|source| DatasetError::Csv {
            path: path.to_path_buf(),
            source,
        })?
        .clone();
    let missing: Vec<String> = required
        .iter()
        .filter(|col| !headers.iter().any(|h| h == **col))
        .map(|col| col.to_string())
        .collect();
    if !missing.is_empty() {
        return Err(DatasetError::MissingColumns {
            path: path.to_path_buf(),
            missing,
        });
    }

    let mut rows = Vec::new();
    let mut skipped = 0usize;
    for result in reader.deserialize::<T>() {
        match result {
            Ok(row) => rows.push(row),
            Err(e) => {
                skipped += 1;
                debug!("Dataset: {}: skipping row: {}", path.display(), e);
            }
        }
    }
    if skipped > 0 {
        warn!("Dataset: {}: skipped {} undecodable row(s)", path.display(), skipped);
    }
    Ok(rows)
}

/// Write rows under an explicit header; the header is written even for an empty table.
pub fn write_table<T: Serialize>(path: &Path, columns: &[&str], rows: &[T]) -> Result<(), DatasetError> {
    let csv_err = |source| DatasetError::Csv {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|source| DatasetError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    let file = File::create(path).map_err(|source| DatasetError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(file);
    writer.write_record(columns).map_err(csv_err)?;
    for row in rows {
        writer.serialize(row).map_err(csv_err)?;
    }
    writer.flush().map_err(|source| DatasetError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Convert raw rows, dropping those with an unparseable timestamp.
fn with_timestamps<R, T>(path: &Path, rows: Vec<R>, convert: impl Fn(R) -> Option<T>) -> Vec<T> {
    let total = rows.len();
    let out: Vec<T> = rows.into_iter().filter_map(convert).collect();
    if out.len() < total {
        warn!(
            "Dataset: {}: dropped {} row(s) with an unparseable timestamp",
            path.display(),
            total - out.len()
        );
    }
    out
}

// =====================
// Metadata
// =====================

/// Static mappings shared by every building of a run.
#[derive(Debug, Clone, Default)]
pub struct Metadata {
    pub cities: BTreeMap<BuildingId, String>,
    pub room_buildings: BTreeMap<RoomId, BuildingId>,
    pub allocators: BTreeMap<AllocatorId, AllocatorMeta>,
}

impl Metadata {
    pub fn building_ids(&self) -> Vec<BuildingId> {
        self.cities.keys().copied().collect()
    }

    /// Allocator → room for every allocator with a room on file.
    pub fn allocator_rooms(&self) -> BTreeMap<AllocatorId, RoomId> {
        self.allocators
            .values()
            .filter_map(|m| m.room_id.map(|room| (m.allocator_id, room)))
            .collect()
    }

    /// Drop readings of rooms that `rooms_metadata.csv` does not list under
    /// `id`, either because they belong to another building or are unknown.
    fn keep_own_rooms(&self, path: &Path, id: BuildingId, rooms: Vec<RoomReading>) -> Vec<RoomReading> {
        let mut foreign: BTreeSet<RoomId> = BTreeSet::new();
        let kept: Vec<RoomReading> = rooms
            .into_iter()
            .filter(|r| {
                let own = self.room_buildings.get(&r.room_id) == Some(&id);
                if !own {
                    foreign.insert(r.room_id);
                }
                own
            })
            .collect();
        if !foreign.is_empty() {
            warn!(
                "Dataset: {}: dropped readings of {} room(s) not listed for building {}: {:?}",
                path.display(),
                foreign.len(),
                id.0,
                foreign.iter().map(|r| r.0).collect::<Vec<_>>()
            );
        }
        kept
    }

    /// Metadata for the given allocators; unknown ids get an empty entry.
    pub fn allocator_meta_for<I>(&self, ids: I) -> BTreeMap<AllocatorId, AllocatorMeta>
    where
        I: IntoIterator<Item = AllocatorId>,
    {
        ids.into_iter()
            .map(|id| {
                let meta = self.allocators.get(&id).cloned().unwrap_or(AllocatorMeta {
                    allocator_id: id,
                    room_id: None,
                    constants: None,
                });
                (id, meta)
            })
            .collect()
    }
}

fn constants(row: &HcaRow) -> Option<AllocatorConstants> {
    Some(AllocatorConstants {
        qs: finite(row.qs)?,
        kcw: finite(row.kcw)?,
        kcl: finite(row.kcl)?,
    })
}

// =====================
// Dataset root
// =====================

#[derive(Debug, Clone)]
pub struct Dataset {
    root: PathBuf,
}

impl Dataset {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Dataset { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn building_dir(&self, id: BuildingId) -> PathBuf {
        self.root.join(format!("Building-{}", id.0))
    }

    pub fn load_metadata(&self) -> Result<Metadata, DatasetError> {
        let buildings: Vec<BuildingRow> = read_table(&self.root.join(BUILDING_METADATA_FILE), &BUILDING_COLUMNS)?;
        let rooms: Vec<RoomRow> = read_table(&self.root.join(ROOMS_METADATA_FILE), &ROOM_COLUMNS)?;
        let hcas: Vec<HcaRow> = read_table(&self.root.join(HCA_METADATA_FILE), &HCA_COLUMNS)?;

        let metadata = Metadata {
            cities: buildings
                .into_iter()
                .map(|b| (BuildingId(b.building_id), b.city))
                .collect(),
            room_buildings: rooms
                .into_iter()
                .map(|r| (RoomId(r.room_id), BuildingId(r.building_id)))
                .collect(),
            allocators: hcas
                .iter()
                .map(|h| {
                    let id = AllocatorId(h.heat_cost_allocator_id);
                    let meta = AllocatorMeta {
                        allocator_id: id,
                        room_id: h.room_id.map(RoomId),
                        constants: constants(h),
                    };
                    (id, meta)
                })
                .collect(),
        };
        debug!(
            "Dataset: metadata for {} building(s), {} room(s), {} allocator(s)",
            metadata.cities.len(),
            metadata.room_buildings.len(),
            metadata.allocators.len()
        );
        Ok(metadata)
    }

    /// Room and allocator telemetry of one building, with its city and the
    /// metadata of every allocator that reported.
    pub fn load_building(&self, metadata: &Metadata, id: BuildingId) -> Result<BuildingInput, DatasetError> {
        let city = metadata
            .cities
            .get(&id)
            .cloned()
            .ok_or(DatasetError::UnknownBuilding(id))?;
        let dir = self.building_dir(id);

        let room_path = dir.join(ROOM_TEMP_FILE);
        let raw_rooms: Vec<RoomTempRow> = read_table(&room_path, &ROOM_TEMP_COLUMNS)?;
        let rooms = with_timestamps(&room_path, raw_rooms, |r| {
            Some(RoomReading {
                room_id: RoomId(r.room_id),
                ts: parse_timestamp(&r.ts)?,
                temperature: finite(r.temperature),
            })
        });

        let rooms = metadata.keep_own_rooms(&room_path, id, rooms);

        let allocator_path = dir.join(ALLOCATOR_FILE);
        let raw_allocators: Vec<AllocatorRow> = read_table(&allocator_path, &ALLOCATOR_COLUMNS)?;
        let allocators = with_timestamps(&allocator_path, raw_allocators, |r| {
            Some(AllocatorReading {
                allocator_id: AllocatorId(r.heat_cost_allocator_id),
                ts: parse_timestamp(&r.ts)?,
                heater_side: finite(r.temperature_2),
                room_side: finite(r.temperature_1),
            })
        });

        let allocator_meta = metadata.allocator_meta_for(allocators.iter().map(|a| a.allocator_id));
        Ok(BuildingInput {
            building_id: id,
            city,
            rooms,
            allocators,
            allocator_meta,
        })
    }

    /// Cumulative unit counters of one building.
    pub fn load_units(&self, id: BuildingId) -> Result<Vec<MeterReading>, DatasetError> {
        let path = self.building_dir(id).join(UNITS_FILE);
        let raw: Vec<UnitsRow> = read_table(&path, &UNITS_COLUMNS)?;
        Ok(with_timestamps(&path, raw, |r| {
            Some(MeterReading {
                allocator_id: AllocatorId(r.heat_cost_allocator_id),
                ts: parse_timestamp(&r.ts)?,
                units: finite(r.units),
            })
        }))
    }
}

// =====================
// Result tables
// =====================

pub fn write_room_hours(path: &Path, table: &RoomHourTable) -> Result<(), DatasetError> {
    write_table(path, &ROOM_HOUR_COLUMNS, table.rows())
}

pub fn read_room_hours(path: &Path) -> Result<RoomHourTable, DatasetError> {
    let rows: Vec<RoomHourRecord> = read_table(path, &ROOM_HOUR_COLUMNS)?;
    Ok(RoomHourTable::from_rows(rows))
}

pub fn write_qa_report(path: &Path, records: &[QaRecord]) -> Result<(), DatasetError> {
    let header = QaRecord::header();
    let rows: Vec<Vec<String>> = records.iter().map(QaRecord::to_row).collect();
    let columns: Vec<&str> = header.iter().map(String::as_str).collect();
    write_table(path, &columns, &rows)
}
