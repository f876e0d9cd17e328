//! Typed records for raw telemetry and static building metadata.
//!
//! Notes
//! - Identifiers are newtype wrappers so room, allocator and building keys cannot be mixed up.
//! - Every timestamp is UTC; parsing and normalisation happen in `crate::dataset`.
//! - Numeric channels are `Option<f64>`; NaN never survives past the loader.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// =====================
// Scalar ID newtype wrappers
// =====================

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BuildingId(pub i64);

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(pub i64);

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AllocatorId(pub i64);

// =====================
// Readings
// =====================

/// Room thermostat temperature sample.
#[derive(Debug, Clone, PartialEq)]
pub struct RoomReading {
    pub room_id: RoomId,
    pub ts: DateTime<Utc>,
    pub temperature: Option<f64>,
}

/// Heat-cost-allocator sample: radiator surface and room-side sensor.
#[derive(Debug, Clone, PartialEq)]
pub struct AllocatorReading {
    pub allocator_id: AllocatorId,
    pub ts: DateTime<Utc>,
    pub heater_side: Option<f64>,
    pub room_side: Option<f64>,
}

/// Cumulative consumption counter as reported by the allocator.
/// The counter restarts near zero at the beginning of every calendar year.
#[derive(Debug, Clone, PartialEq)]
pub struct MeterReading {
    pub allocator_id: AllocatorId,
    pub ts: DateTime<Utc>,
    pub units: Option<f64>,
}

// =====================
// Static metadata
// =====================

/// Per-device calibration scalars used by the heat-yield formula.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct AllocatorConstants {
    /// Rated radiator output.
    pub qs: f64,
    /// Thermal coupling factor of the radiator.
    pub kcw: f64,
    /// Coupling factor of the room-side sensor.
    pub kcl: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AllocatorMeta {
    pub allocator_id: AllocatorId,
    /// Room the allocator is mounted in; `None` is a metadata gap.
    pub room_id: Option<RoomId>,
    /// `None` when no calibration is on file; derived yield is then missing.
    pub constants: Option<AllocatorConstants>,
}

/// Everything the resample pipeline needs for one building.
#[derive(Debug, Clone, Default)]
pub struct BuildingInput {
    pub building_id: BuildingId,
    pub city: String,
    pub rooms: Vec<RoomReading>,
    pub allocators: Vec<AllocatorReading>,
    pub allocator_meta: BTreeMap<AllocatorId, AllocatorMeta>,
}

impl BuildingInput {
    /// Earliest and latest timestamp across room and allocator readings.
    pub fn observed_span(&self) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        let stamps = self
            .rooms
            .iter()
            .map(|r| r.ts)
            .chain(self.allocators.iter().map(|a| a.ts));
        stamps.fold(None, |acc, ts| match acc {
            None => Some((ts, ts)),
            Some((lo, hi)) => Some((lo.min(ts), hi.max(ts))),
        })
    }
}
