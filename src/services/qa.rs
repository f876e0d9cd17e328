//! Data-quality report over the room-hour table.
//!
//! Every room is first put back on a regular hourly grid between its first
//! and last row, so hours missing from the table count as gaps. Each value
//! column of the room then gets its gap and valid-run histograms plus row
//! counts, and the room's derived-vs-metered heat error is attached to every
//! one of its rows.

use chrono::{DateTime, Utc};
use log::{debug, info};
use std::collections::BTreeMap;

use crate::models::report::{QaRecord, RoomHourRecord, RoomHourTable, Variable};
use crate::models::telemetry::{AllocatorId, MeterReading, RoomId};
use crate::services::meter::{self, ErrorMetrics};
use crate::services::runs::{gap_histogram, valid_run_histogram};
use crate::utils::{finite, hour_range};

/// A room's rows on the full hourly grid; `None` where the table has no row.
fn regular_grid<'a>(rows: &[&'a RoomHourRecord]) -> Vec<Option<&'a RoomHourRecord>> {
    let by_hour: BTreeMap<DateTime<Utc>, &RoomHourRecord> = rows.iter().map(|r| (r.ts, *r)).collect();
    let (Some(first), Some(last)) = (by_hour.keys().next(), by_hour.keys().next_back()) else {
        return Vec::new();
    };
    hour_range(*first, *last).map(|h| by_hour.get(&h).copied()).collect()
}

fn column_record(room_id: RoomId, variable: Variable, grid: &[Option<&RoomHourRecord>], metrics: ErrorMetrics) -> QaRecord {
    let values: Vec<Option<f64>> = grid
        .iter()
        .map(|row| row.and_then(|r| finite(r.value(variable))))
        .collect();
    let total_rows = values.len();
    let total_non_null = values.iter().filter(|v| v.is_some()).count();

    QaRecord {
        room_id,
        variable,
        gaps: gap_histogram(&values),
        valid_runs: valid_run_histogram(&values),
        total_rows,
        total_non_null,
        total_nan_rows: total_rows - total_non_null,
        non_null_ratio: (total_rows > 0).then(|| total_non_null as f64 / total_rows as f64),
        mape_hca_units: metrics.mape,
        rmse_hca_units: metrics.rmse,
        compared_days: metrics.compared_days,
    }
}

/// One record per `(room, variable)`, ordered by room then column.
pub fn build_report(
    table: &RoomHourTable,
    units: &[MeterReading],
    allocator_rooms: &BTreeMap<AllocatorId, RoomId>,
) -> Vec<QaRecord> {
    let corrected = meter::correct_resets(units);
    let metered = meter::daily_meter_deltas(&corrected, allocator_rooms);
    let no_days = BTreeMap::new();

    let mut records = Vec::new();
    let mut rooms_with_metrics = 0usize;
    for (room_id, rows) in table.by_room() {
        let derived = meter::daily_derived(rows.iter().copied());
        let metrics = meter::compare(&derived, metered.get(&room_id).unwrap_or(&no_days));
        if metrics.mape.is_some() {
            rooms_with_metrics += 1;
        } else {
            debug!("QA: room {} has no comparable metered days", room_id.0);
        }

        let grid = regular_grid(&rows);
        records.extend(
            Variable::ALL
                .iter()
                .map(|variable| column_record(room_id, *variable, &grid, metrics)),
        );
    }

    info!(
        "QA: {} record(s) for {} room(s), {} with derived-vs-metered error",
        records.len(),
        records.len() / Variable::ALL.len(),
        rooms_with_metrics
    );
    records
}
