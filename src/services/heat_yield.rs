//! Heat-consumption estimate (`q_hkv_dt`) from allocator temperature differentials.
//!
//! For every allocator sample the radiator output is approximated from the
//! differential between the heater-side and room-side sensor, scaled by the
//! device calibration and by the time elapsed since the previous sample of the
//! same allocator:
//!
//! `q = qs * (kcw * kcl * ΔT / 60)^1.3 * dt / 1000`, when `ΔT > 3`, else `0`.
//!
//! Below the threshold the radiator is considered off and the yield is exactly
//! zero; missing inputs make the yield missing instead. That includes an
//! allocator without calibration constants whose differential is below the
//! threshold: its yield is `None`, not `0`.

use chrono::{DateTime, Utc};
use log::{debug, warn};
use std::collections::{BTreeMap, BTreeSet};

use crate::models::telemetry::{AllocatorConstants, AllocatorId, AllocatorMeta, AllocatorReading, RoomId};
use crate::utils::{finite, floor_hour};

/// Differential (°C) at or below which the radiator counts as off.
pub const MIN_TEMPERATURE_DIFFERENTIAL: f64 = 3.0;
const RADIATOR_EXPONENT: f64 = 1.3;
const NOMINAL_DIFFERENTIAL: f64 = 60.0;
const OUTPUT_DIVISOR: f64 = 1000.0;

/// One allocator sample with its derived energy increment.
#[derive(Debug, Clone, PartialEq)]
pub struct YieldSample {
    pub allocator_id: AllocatorId,
    pub ts: DateTime<Utc>,
    /// Hours since the previous sample of the same allocator; `None` on the first one.
    pub dt_hours: Option<f64>,
    pub heater_side: Option<f64>,
    pub room_side: Option<f64>,
    pub yield_units: Option<f64>,
}

/// Apply the yield formula to a single sample.
///
/// Returns `None` when the calibration or a temperature is missing, or when the
/// differential is above threshold but `dt` is unknown or negative.
pub fn heat_yield(
    constants: Option<&AllocatorConstants>,
    heater_side: Option<f64>,
    room_side: Option<f64>,
    dt_hours: Option<f64>,
) -> Option<f64> {
    let constants = constants?;
    let differential = finite(heater_side)? - finite(room_side)?;
    if differential <= MIN_TEMPERATURE_DIFFERENTIAL {
        return Some(0.0);
    }
    let dt = finite(dt_hours).filter(|dt| *dt >= 0.0)?;
    let AllocatorConstants { qs, kcw, kcl } = *constants;
    let output = qs * (kcw * kcl * differential / NOMINAL_DIFFERENTIAL).powf(RADIATOR_EXPONENT) * dt / OUTPUT_DIVISOR;
    finite(Some(output))
}

/// Sort readings by `(allocator_id, ts)`, compute per-allocator `dt` and the
/// yield of every sample.
pub fn estimate_yields(
    mut readings: Vec<AllocatorReading>,
    meta: &BTreeMap<AllocatorId, AllocatorMeta>,
) -> Vec<YieldSample> {
    readings.sort_by(|a, b| (a.allocator_id, a.ts).cmp(&(b.allocator_id, b.ts)));

    let mut uncalibrated: BTreeSet<AllocatorId> = BTreeSet::new();
    let mut previous: Option<(AllocatorId, DateTime<Utc>)> = None;
    let mut samples = Vec::with_capacity(readings.len());

    for reading in readings {
        let dt_hours = match previous {
            Some((id, prev_ts)) if id == reading.allocator_id => {
                Some((reading.ts - prev_ts).num_milliseconds() as f64 / 3_600_000.0)
            }
            _ => None,
        };
        previous = Some((reading.allocator_id, reading.ts));

        let constants = meta.get(&reading.allocator_id).and_then(|m| m.constants.as_ref());
        if constants.is_none() {
            uncalibrated.insert(reading.allocator_id);
        }

        samples.push(YieldSample {
            allocator_id: reading.allocator_id,
            ts: reading.ts,
            dt_hours,
            heater_side: reading.heater_side,
            room_side: reading.room_side,
            yield_units: heat_yield(constants, reading.heater_side, reading.room_side, dt_hours),
        });
    }

    if !uncalibrated.is_empty() {
        warn!(
            "Heat yield: {} allocator(s) without calibration constants, yield left missing: {:?}",
            uncalibrated.len(),
            uncalibrated.iter().map(|a| a.0).collect::<Vec<_>>()
        );
    }

    samples
}

/// Heat and allocator temperatures of one room for one hour.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RoomHeat {
    /// Sum of the present allocator yields; `None` when none is present.
    pub hca_units: Option<f64>,
    /// Hottest heater-side reading across the room's allocators.
    pub heater_side_max: Option<f64>,
    /// Mean room-side reading across the room's allocators.
    pub room_side_mean: Option<f64>,
}

#[derive(Debug, Default)]
struct RoomHourAccumulator {
    yield_sum: f64,
    yield_terms: usize,
    heater_max: Option<f64>,
    room_sum: f64,
    room_terms: usize,
}

impl RoomHourAccumulator {
    fn push(&mut self, sample: &YieldSample) {
        if let Some(y) = finite(sample.yield_units) {
            self.yield_sum += y;
            self.yield_terms += 1;
        }
        if let Some(h) = finite(sample.heater_side) {
            self.heater_max = Some(self.heater_max.map_or(h, |m| m.max(h)));
        }
        if let Some(r) = finite(sample.room_side) {
            self.room_sum += r;
            self.room_terms += 1;
        }
    }

    fn finish(self) -> RoomHeat {
        RoomHeat {
            hca_units: (self.yield_terms > 0).then_some(self.yield_sum),
            heater_side_max: self.heater_max,
            room_side_mean: (self.room_terms > 0).then(|| self.room_sum / self.room_terms as f64),
        }
    }
}

/// Roll allocator samples up to `(room, hour)`.
///
/// Samples of allocators without a room mapping are dropped.
pub fn rollup_by_room(
    samples: &[YieldSample],
    meta: &BTreeMap<AllocatorId, AllocatorMeta>,
) -> BTreeMap<(RoomId, DateTime<Utc>), RoomHeat> {
    let mut acc: BTreeMap<(RoomId, DateTime<Utc>), RoomHourAccumulator> = BTreeMap::new();
    let mut unmapped: BTreeSet<AllocatorId> = BTreeSet::new();

    for sample in samples {
        let Some(room_id) = meta.get(&sample.allocator_id).and_then(|m| m.room_id) else {
            unmapped.insert(sample.allocator_id);
            continue;
        };
        acc.entry((room_id, floor_hour(sample.ts))).or_default().push(sample);
    }

    if !unmapped.is_empty() {
        warn!(
            "Heat yield: {} allocator(s) have no room mapping and were skipped: {:?}",
            unmapped.len(),
            unmapped.iter().map(|a| a.0).collect::<Vec<_>>()
        );
    }
    debug!("Heat yield: rolled up to {} room-hour bucket(s)", acc.len());

    acc.into_iter().map(|(key, a)| (key, a.finish())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    const UNIT: AllocatorConstants = AllocatorConstants {
        qs: 1.0,
        kcw: 1.0,
        kcl: 1.0,
    };

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 10, 0, 0, 0).unwrap()
    }

    fn meta(entries: &[(i64, Option<i64>, Option<AllocatorConstants>)]) -> BTreeMap<AllocatorId, AllocatorMeta> {
        entries
            .iter()
            .map(|(a, r, c)| {
                (
                    AllocatorId(*a),
                    AllocatorMeta {
                        allocator_id: AllocatorId(*a),
                        room_id: r.map(RoomId),
                        constants: *c,
                    },
                )
            })
            .collect()
    }

    fn reading(id: i64, minutes: i64, heater: f64, room: f64) -> AllocatorReading {
        AllocatorReading {
            allocator_id: AllocatorId(id),
            ts: t0() + Duration::minutes(minutes),
            heater_side: Some(heater),
            room_side: Some(room),
        }
    }

    #[test]
    fn formula_matches_reference_value() {
        let y = heat_yield(Some(&UNIT), Some(20.0), Some(15.0), Some(1.0)).unwrap();
        let expected = (5.0f64 / 60.0).powf(1.3) / 1000.0;
        assert!((y - expected).abs() < 1e-15);
        assert!(y > 3.9e-5 && y < 4.0e-5, "got {y}");
    }

    #[test]
    fn at_or_below_threshold_is_exactly_zero() {
        for (heater, room) in [(16.0, 15.0), (18.0, 15.0), (15.0, 15.0), (10.0, 15.0)] {
            for dt in [None, Some(-1.0), Some(0.0), Some(1.0), Some(48.0)] {
                assert_eq!(heat_yield(Some(&UNIT), Some(heater), Some(room), dt), Some(0.0));
            }
        }
    }

    #[test]
    fn missing_inputs_propagate() {
        assert_eq!(heat_yield(None, Some(40.0), Some(20.0), Some(1.0)), None);
        assert_eq!(heat_yield(None, Some(21.0), Some(20.0), Some(1.0)), None);
        assert_eq!(heat_yield(Some(&UNIT), None, Some(20.0), Some(1.0)), None);
        assert_eq!(heat_yield(Some(&UNIT), Some(40.0), Some(f64::NAN), Some(1.0)), None);
        assert_eq!(heat_yield(Some(&UNIT), Some(40.0), Some(20.0), None), None);
        assert_eq!(heat_yield(Some(&UNIT), Some(40.0), Some(20.0), Some(-0.5)), None);
    }

    #[test]
    fn dt_restarts_at_every_allocator_boundary() {
        let readings = vec![
            reading(2, 60, 40.0, 20.0),
            reading(1, 30, 40.0, 20.0),
            reading(2, 0, 40.0, 20.0),
            reading(1, 0, 40.0, 20.0),
            reading(1, 90, 40.0, 20.0),
        ];
        let m = meta(&[(1, Some(10), Some(UNIT)), (2, Some(10), Some(UNIT))]);
        let samples = estimate_yields(readings, &m);

        let order: Vec<(i64, Option<f64>)> = samples.iter().map(|s| (s.allocator_id.0, s.dt_hours)).collect();
        assert_eq!(
            order,
            vec![(1, None), (1, Some(0.5)), (1, Some(1.0)), (2, None), (2, Some(1.0))]
        );
        assert_eq!(samples[0].yield_units, None);
        assert_eq!(samples[3].yield_units, None);
        assert!(samples[1].yield_units.unwrap() > 0.0);
    }

    #[test]
    fn uncalibrated_allocator_yields_missing() {
        let readings = vec![reading(5, 0, 45.0, 20.0), reading(5, 60, 45.0, 20.0)];
        let samples = estimate_yields(readings, &meta(&[(5, Some(1), None)]));
        assert!(samples.iter().all(|s| s.yield_units.is_none()));
    }

    #[test]
    fn rollup_sums_present_yields_per_room_hour() {
        let hour = t0();
        let sample = |id: i64, heater: Option<f64>, room: Option<f64>, y: Option<f64>| YieldSample {
            allocator_id: AllocatorId(id),
            ts: hour,
            dt_hours: Some(1.0),
            heater_side: heater,
            room_side: room,
            yield_units: y,
        };
        let samples = vec![
            sample(1, Some(40.0), Some(20.0), Some(0.25)),
            sample(2, Some(50.0), Some(22.0), None),
            sample(3, Some(45.0), Some(21.0), Some(0.5)),
            sample(4, Some(90.0), Some(30.0), Some(9.0)),
        ];
        let m = meta(&[
            (1, Some(7), Some(UNIT)),
            (2, Some(7), None),
            (3, Some(7), Some(UNIT)),
            (4, None, Some(UNIT)),
        ]);
        let rolled = rollup_by_room(&samples, &m);
        assert_eq!(rolled.len(), 1);
        let heat = rolled[&(RoomId(7), hour)];
        assert_eq!(heat.hca_units, Some(0.75));
        assert_eq!(heat.heater_side_max, Some(50.0));
        assert_eq!(heat.room_side_mean, Some(21.0));
    }

    #[test]
    fn all_missing_yields_stay_missing() {
        let samples = vec![YieldSample {
            allocator_id: AllocatorId(1),
            ts: t0(),
            dt_hours: None,
            heater_side: None,
            room_side: None,
            yield_units: None,
        }];
        let rolled = rollup_by_room(&samples, &meta(&[(1, Some(3), Some(UNIT))]));
        assert_eq!(rolled[&(RoomId(3), t0())], RoomHeat::default());
    }
}
