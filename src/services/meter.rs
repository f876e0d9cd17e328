//! Ground-truth consumption from cumulative allocator counters.
//!
//! Counters restart near zero at the beginning of every calendar year. A
//! reading dated January 1st that falls to at most [`RESET_FRACTION`] of the
//! reading before it is taken as a reset: the preceding raw value joins a
//! running per-device offset that is added to every later reading of that
//! device. Smaller drops are left alone.

use chrono::{DateTime, Datelike, Days, NaiveDate, Utc};
use log::{debug, warn};
use std::collections::{BTreeMap, BTreeSet};

use crate::models::report::RoomHourRecord;
use crate::models::telemetry::{AllocatorId, MeterReading, RoomId};
use crate::utils::finite;

/// Corrected cumulative value of one device at one instant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CorrectedReading {
    pub allocator_id: AllocatorId,
    pub ts: DateTime<Utc>,
    pub raw: f64,
    pub corrected: f64,
}

/// Largest share of the previous reading a January 1st value may keep and
/// still count as a restart near zero.
pub const RESET_FRACTION: f64 = 0.25;

fn is_new_year(date: NaiveDate) -> bool {
    date.month() == 1 && date.day() == 1
}

fn is_reset(prev: f64, raw: f64, ts: DateTime<Utc>) -> bool {
    raw < prev && raw <= prev * RESET_FRACTION && is_new_year(ts.date_naive())
}

/// Undo the yearly counter resets. Readings without a value are dropped; the
/// output is sorted by `(allocator_id, ts)`.
pub fn correct_resets(readings: &[MeterReading]) -> Vec<CorrectedReading> {
    let mut by_device: BTreeMap<AllocatorId, Vec<(DateTime<Utc>, f64)>> = BTreeMap::new();
    for r in readings {
        if let Some(units) = finite(r.units) {
            by_device.entry(r.allocator_id).or_default().push((r.ts, units));
        }
    }

    let mut out = Vec::new();
    let mut resets = 0usize;
    for (allocator_id, mut series) in by_device {
        series.sort_by_key(|(ts, _)| *ts);
        let mut offset = 0.0;
        let mut previous: Option<f64> = None;
        for (ts, raw) in series {
            match previous {
                Some(prev) if is_reset(prev, raw, ts) => {
                    offset += prev;
                    resets += 1;
                }
                _ => {}
            }
            previous = Some(raw);
            out.push(CorrectedReading {
                allocator_id,
                ts,
                raw,
                corrected: raw + offset,
            });
        }
    }
    debug!("Meter: corrected {} reading(s), {} year reset(s)", out.len(), resets);
    out
}

/// Day-over-day consumption per room.
///
/// Each device contributes its last corrected value of the day; a device's
/// delta for a day exists only when it also reported the day before. Deltas of
/// all the room's devices are summed. Devices without a room are skipped.
pub fn daily_meter_deltas(
    corrected: &[CorrectedReading],
    allocator_rooms: &BTreeMap<AllocatorId, RoomId>,
) -> BTreeMap<RoomId, BTreeMap<NaiveDate, f64>> {
    let mut closing: BTreeMap<AllocatorId, BTreeMap<NaiveDate, (DateTime<Utc>, f64)>> = BTreeMap::new();
    for r in corrected {
        let day = closing.entry(r.allocator_id).or_default();
        let slot = day.entry(r.ts.date_naive()).or_insert((r.ts, r.corrected));
        if r.ts >= slot.0 {
            *slot = (r.ts, r.corrected);
        }
    }

    let mut unmapped: BTreeSet<AllocatorId> = BTreeSet::new();
    let mut out: BTreeMap<RoomId, BTreeMap<NaiveDate, f64>> = BTreeMap::new();
    for (allocator_id, days) in closing {
        let Some(room_id) = allocator_rooms.get(&allocator_id).copied() else {
            unmapped.insert(allocator_id);
            continue;
        };
        let room = out.entry(room_id).or_default();
        for (date, (_, value)) in &days {
            let Some(yesterday) = date.checked_sub_days(Days::new(1)) else {
                continue;
            };
            if let Some((_, prev)) = days.get(&yesterday) {
                *room.entry(*date).or_insert(0.0) += value - prev;
            }
        }
    }

    if !unmapped.is_empty() {
        warn!(
            "Meter: {} allocator(s) with unit readings have no room mapping: {:?}",
            unmapped.len(),
            unmapped.iter().map(|a| a.0).collect::<Vec<_>>()
        );
    }
    out
}

/// Sum of the room's present hourly `hca_units` per day. Days without any
/// present hour are absent.
pub fn daily_derived<'a, I>(rows: I) -> BTreeMap<NaiveDate, f64>
where
    I: IntoIterator<Item = &'a RoomHourRecord>,
{
    let mut out: BTreeMap<NaiveDate, f64> = BTreeMap::new();
    for row in rows {
        if let Some(units) = finite(row.hca_units) {
            *out.entry(row.ts.date_naive()).or_insert(0.0) += units;
        }
    }
    out
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ErrorMetrics {
    /// Mean absolute percentage error, in percent.
    pub mape: Option<f64>,
    pub rmse: Option<f64>,
    pub compared_days: usize,
}

/// Compare derived against metered daily consumption on the days both have.
/// Days with a metered delta of exactly zero are excluded; with nothing left
/// both metrics are undefined.
pub fn compare(derived: &BTreeMap<NaiveDate, f64>, metered: &BTreeMap<NaiveDate, f64>) -> ErrorMetrics {
    let pairs: Vec<(f64, f64)> = metered
        .iter()
        .filter(|(_, m)| **m != 0.0)
        .filter_map(|(date, m)| derived.get(date).map(|d| (*d, *m)))
        .collect();
    if pairs.is_empty() {
        return ErrorMetrics::default();
    }

    let n = pairs.len() as f64;
    let ape: f64 = pairs.iter().map(|(d, m)| (d - m).abs() / m.abs()).sum();
    let se: f64 = pairs.iter().map(|(d, m)| (d - m).powi(2)).sum();
    ErrorMetrics {
        mape: finite(Some(ape / n * 100.0)),
        rmse: finite(Some((se / n).sqrt())),
        compared_days: pairs.len(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::telemetry::BuildingId;
    use chrono::TimeZone;

    fn at(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
    }

    fn reading(id: i64, ts: DateTime<Utc>, units: Option<f64>) -> MeterReading {
        MeterReading {
            allocator_id: AllocatorId(id),
            ts,
            units,
        }
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn january_first_reset_is_carried_forward() {
        let readings = vec![
            reading(1, at(2024, 1, 2, 12), Some(8.0)),
            reading(1, at(2023, 12, 31, 12), Some(100.0)),
            reading(1, at(2024, 1, 1, 12), Some(5.0)),
        ];
        let corrected: Vec<f64> = correct_resets(&readings).iter().map(|r| r.corrected).collect();
        assert_eq!(corrected, vec![100.0, 105.0, 108.0]);
    }

    #[test]
    fn corrected_series_is_non_decreasing_across_years() {
        let mut readings = Vec::new();
        let mut value = 0.0;
        let mut ts = at(2023, 12, 20, 6);
        while ts < at(2024, 1, 10, 0) {
            if ts.date_naive() == date(2024, 1, 1) && value > 50.0 {
                value = 0.3;
            }
            value += 1.7;
            readings.push(reading(3, ts, Some(value)));
            readings.push(reading(4, ts, None));
            ts += chrono::Duration::hours(7);
        }
        let corrected = correct_resets(&readings);
        assert!(corrected.iter().all(|r| r.allocator_id == AllocatorId(3)));
        assert!(corrected.windows(2).all(|w| w[1].corrected >= w[0].corrected));
    }

    #[test]
    fn small_new_year_dip_is_not_a_reset() {
        let readings = vec![
            reading(1, at(2023, 12, 31, 23), Some(100.0)),
            reading(1, at(2024, 1, 1, 23), Some(99.9)),
            reading(1, at(2024, 1, 2, 23), Some(100.5)),
        ];
        let corrected: Vec<f64> = correct_resets(&readings).iter().map(|r| r.corrected).collect();
        assert_eq!(corrected, vec![100.0, 99.9, 100.5]);
    }

    #[test]
    fn offsets_accumulate_over_several_years_per_device() {
        let readings = vec![
            reading(1, at(2022, 12, 31, 23), Some(100.0)),
            reading(1, at(2023, 1, 1, 23), Some(5.0)),
            reading(1, at(2023, 12, 31, 23), Some(50.0)),
            reading(1, at(2024, 1, 1, 23), Some(2.0)),
            reading(1, at(2024, 1, 2, 23), Some(3.0)),
            reading(2, at(2023, 12, 31, 23), Some(40.0)),
            reading(2, at(2024, 1, 1, 23), Some(1.0)),
            reading(3, at(2023, 12, 31, 23), Some(60.0)),
            reading(3, at(2024, 1, 1, 23), Some(61.0)),
        ];
        let corrected = correct_resets(&readings);
        let series = |id: i64| -> Vec<f64> {
            corrected
                .iter()
                .filter(|r| r.allocator_id == AllocatorId(id))
                .map(|r| r.corrected)
                .collect()
        };
        assert_eq!(series(1), vec![100.0, 105.0, 150.0, 152.0, 153.0]);
        assert_eq!(series(2), vec![40.0, 41.0]);
        assert_eq!(series(3), vec![60.0, 61.0]);
    }

    #[test]
    fn reset_day_delta_is_the_post_reset_consumption() {
        let readings = vec![
            reading(1, at(2023, 12, 30, 23), Some(96.0)),
            reading(1, at(2023, 12, 31, 23), Some(100.0)),
            reading(1, at(2024, 1, 1, 23), Some(5.0)),
            reading(1, at(2024, 1, 2, 23), Some(8.0)),
            reading(2, at(2023, 12, 31, 23), Some(40.0)),
            reading(2, at(2024, 1, 1, 23), Some(1.5)),
        ];
        let rooms: BTreeMap<AllocatorId, RoomId> =
            [(AllocatorId(1), RoomId(7)), (AllocatorId(2), RoomId(7))].into_iter().collect();
        let room = &daily_meter_deltas(&correct_resets(&readings), &rooms)[&RoomId(7)];

        assert_eq!(room[&date(2023, 12, 31)], 4.0);
        assert_eq!(room[&date(2024, 1, 1)], 6.5);
        assert_eq!(room[&date(2024, 1, 2)], 3.0);
    }

    #[test]
    fn first_reading_on_new_year_is_not_a_reset() {
        let readings = vec![reading(1, at(2024, 1, 1, 0), Some(50.0)), reading(1, at(2024, 1, 1, 5), Some(51.0))];
        let corrected: Vec<f64> = correct_resets(&readings).iter().map(|r| r.corrected).collect();
        assert_eq!(corrected, vec![50.0, 51.0]);
    }

    #[test]
    fn deltas_use_closing_values_and_sum_per_room() {
        let readings = vec![
            reading(1, at(2024, 2, 1, 8), Some(10.0)),
            reading(1, at(2024, 2, 1, 20), Some(12.0)),
            reading(1, at(2024, 2, 2, 20), Some(15.0)),
            reading(1, at(2024, 2, 4, 20), Some(20.0)),
            reading(2, at(2024, 2, 1, 20), Some(1.0)),
            reading(2, at(2024, 2, 2, 20), Some(2.0)),
            reading(9, at(2024, 2, 1, 20), Some(1.0)),
            reading(9, at(2024, 2, 2, 20), Some(9.0)),
        ];
        let rooms: BTreeMap<AllocatorId, RoomId> =
            [(AllocatorId(1), RoomId(7)), (AllocatorId(2), RoomId(7))].into_iter().collect();
        let deltas = daily_meter_deltas(&correct_resets(&readings), &rooms);

        assert_eq!(deltas.len(), 1);
        let room = &deltas[&RoomId(7)];
        assert_eq!(room.len(), 1);
        assert_eq!(room[&date(2024, 2, 2)], 4.0);
    }

    #[test]
    fn derived_days_skip_missing_hours() {
        let mut rows = Vec::new();
        for h in 0..3 {
            let mut r = RoomHourRecord::empty(RoomId(1), at(2024, 2, 2, h), BuildingId(1));
            r.hca_units = if h == 1 { None } else { Some(0.5) };
            rows.push(r);
        }
        rows.push(RoomHourRecord::empty(RoomId(1), at(2024, 2, 3, 0), BuildingId(1)));
        let derived = daily_derived(&rows);
        assert_eq!(derived.len(), 1);
        assert_eq!(derived[&date(2024, 2, 2)], 1.0);
    }

    #[test]
    fn metrics_over_joined_days() {
        let derived: BTreeMap<NaiveDate, f64> =
            [(date(2024, 2, 2), 3.0), (date(2024, 2, 3), 5.0), (date(2024, 2, 4), 1.0)].into_iter().collect();
        let metered: BTreeMap<NaiveDate, f64> =
            [(date(2024, 2, 2), 4.0), (date(2024, 2, 3), 5.0), (date(2024, 2, 4), 0.0), (date(2024, 2, 9), 2.0)]
                .into_iter()
                .collect();
        let m = compare(&derived, &metered);
        assert_eq!(m.compared_days, 2);
        assert!((m.mape.unwrap() - 12.5).abs() < 1e-12);
        assert!((m.rmse.unwrap() - 0.5f64.sqrt()).abs() < 1e-12);
    }

    #[test]
    fn degenerate_comparisons_are_undefined() {
        let derived: BTreeMap<NaiveDate, f64> = [(date(2024, 2, 2), 3.0)].into_iter().collect();
        let zeros: BTreeMap<NaiveDate, f64> = [(date(2024, 2, 2), 0.0)].into_iter().collect();
        assert_eq!(compare(&derived, &zeros), ErrorMetrics::default());
        assert_eq!(compare(&derived, &BTreeMap::new()).mape, None);
        assert_eq!(compare(&BTreeMap::new(), &BTreeMap::new()).rmse, None);
    }
}
