//! Hourly resampling of irregular per-entity series.
//!
//! Readings are grouped by entity key, bucketed on fixed UTC hour boundaries
//! and averaged per channel. The output grid spans the first to the last
//! observed hour of each entity with no hour skipped; a bucket with no usable
//! value for a channel carries `None`, never zero.

use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;

use crate::models::telemetry::{AllocatorId, AllocatorReading, RoomId, RoomReading};
use crate::utils::{finite, floor_hour, hour_range};

/// Channel index of the heater-side temperature in allocator series.
pub const HEATER_SIDE: usize = 0;
/// Channel index of the room-side temperature in allocator series.
pub const ROOM_SIDE: usize = 1;

/// One entity's readings on a regular hour grid.
#[derive(Debug, Clone, PartialEq)]
pub struct HourlySeries<const N: usize> {
    start: DateTime<Utc>,
    buckets: Vec<[Option<f64>; N]>,
}

impl<const N: usize> HourlySeries<N> {
    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    /// Last hour of the grid (inclusive).
    pub fn end(&self) -> DateTime<Utc> {
        self.start + Duration::hours(self.buckets.len() as i64 - 1)
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (DateTime<Utc>, &[Option<f64>; N])> + '_ {
        self.buckets
            .iter()
            .enumerate()
            .map(move |(i, values)| (self.start + Duration::hours(i as i64), values))
    }

    pub fn at(&self, hour: DateTime<Utc>) -> Option<&[Option<f64>; N]> {
        if hour < self.start {
            return None;
        }
        let offset = (hour - self.start).num_hours();
        if self.start + Duration::hours(offset) != hour {
            return None;
        }
        usize::try_from(offset).ok().and_then(|idx| self.buckets.get(idx))
    }
}

#[derive(Debug, Clone, Copy)]
struct ChannelMean {
    sum: f64,
    count: u32,
}

impl ChannelMean {
    const EMPTY: ChannelMean = ChannelMean { sum: 0.0, count: 0 };

    fn push(&mut self, value: Option<f64>) {
        if let Some(v) = finite(value) {
            self.sum += v;
            self.count += 1;
        }
    }

    fn mean(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }
}

/// Bucket `(key, timestamp, channels)` rows into per-key hourly means.
pub fn resample_hourly<K, const N: usize, I>(rows: I) -> BTreeMap<K, HourlySeries<N>>
where
    K: Ord + Copy,
    I: IntoIterator<Item = (K, DateTime<Utc>, [Option<f64>; N])>,
{
    let mut grouped: BTreeMap<K, BTreeMap<DateTime<Utc>, [ChannelMean; N]>> = BTreeMap::new();
    for (key, ts, values) in rows {
        let bucket = grouped
            .entry(key)
            .or_default()
            .entry(floor_hour(ts))
            .or_insert([ChannelMean::EMPTY; N]);
        for (acc, value) in bucket.iter_mut().zip(values) {
            acc.push(value);
        }
    }

    grouped
        .into_iter()
        .filter_map(|(key, hours)| {
            let (&first, _) = hours.first_key_value()?;
            let (&last, _) = hours.last_key_value()?;
            let buckets = hour_range(first, last)
                .map(|hour| match hours.get(&hour) {
                    Some(accs) => std::array::from_fn(|i| accs[i].mean()),
                    None => [None; N],
                })
                .collect();
            Some((key, HourlySeries { start: first, buckets }))
        })
        .collect()
}

/// Hourly mean room temperature per room.
pub fn resample_rooms(readings: &[RoomReading]) -> BTreeMap<RoomId, HourlySeries<1>> {
    resample_hourly(readings.iter().map(|r| (r.room_id, r.ts, [r.temperature])))
}

/// Hourly mean heater-side and room-side temperature per allocator.
pub fn resample_allocators(readings: &[AllocatorReading]) -> BTreeMap<AllocatorId, HourlySeries<2>> {
    resample_hourly(readings.iter().map(|r| {
        let mut channels = [None; 2];
        channels[HEATER_SIDE] = r.heater_side;
        channels[ROOM_SIDE] = r.room_side;
        (r.allocator_id, r.ts, channels)
    }))
}

/// Flatten hourly allocator grids back into hour-stamped readings, ordered by
/// `(allocator_id, ts)`.
pub fn allocator_hours(series: &BTreeMap<AllocatorId, HourlySeries<2>>) -> Vec<AllocatorReading> {
    series
        .iter()
        .flat_map(|(id, grid)| {
            grid.iter().map(move |(ts, values)| AllocatorReading {
                allocator_id: *id,
                ts,
                heater_side: values[HEATER_SIDE],
                room_side: values[ROOM_SIDE],
            })
        })
        .collect()
}
