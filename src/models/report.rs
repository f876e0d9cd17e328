//! Output tables: the joined room-hour table and the QA report.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::models::telemetry::{BuildingId, RoomId};
use crate::services::runs::{GapHistogram, ValidRunHistogram, GAP_BUCKET_LABELS, VALID_RUN_THRESHOLDS};

/// One room for one UTC hour. Missing channels stay `None`; an hour with no
/// source data at all still has a row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomHourRecord {
    pub room_id: RoomId,
    pub ts: DateTime<Utc>,
    /// Estimated heat consumption summed over the room's allocators.
    pub hca_units: Option<f64>,
    pub inside_temp: Option<f64>,
    pub heater_side_hca_temp: Option<f64>,
    pub room_side_hca_temp: Option<f64>,
    pub outside_temp: Option<f64>,
    pub building_id: BuildingId,
}

/// Value columns of [`RoomHourRecord`], in output order.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Variable {
    HcaUnits,
    InsideTemp,
    HeaterSideHcaTemp,
    RoomSideHcaTemp,
    OutsideTemp,
}

impl Variable {
    pub const ALL: [Variable; 5] = [
        Variable::HcaUnits,
        Variable::InsideTemp,
        Variable::HeaterSideHcaTemp,
        Variable::RoomSideHcaTemp,
        Variable::OutsideTemp,
    ];

    /// Column name as written to the room-hour table.
    pub fn name(self) -> &'static str {
        match self {
            Variable::HcaUnits => "hca_units",
            Variable::InsideTemp => "inside_temp",
            Variable::HeaterSideHcaTemp => "heater_side_hca_temp",
            Variable::RoomSideHcaTemp => "room_side_hca_temp",
            Variable::OutsideTemp => "outside_temp",
        }
    }
}

impl RoomHourRecord {
    pub fn empty(room_id: RoomId, ts: DateTime<Utc>, building_id: BuildingId) -> Self {
        RoomHourRecord {
            room_id,
            ts,
            hca_units: None,
            inside_temp: None,
            heater_side_hca_temp: None,
            room_side_hca_temp: None,
            outside_temp: None,
            building_id,
        }
    }

    pub fn value(&self, variable: Variable) -> Option<f64> {
        match variable {
            Variable::HcaUnits => self.hca_units,
            Variable::InsideTemp => self.inside_temp,
            Variable::HeaterSideHcaTemp => self.heater_side_hca_temp,
            Variable::RoomSideHcaTemp => self.room_side_hca_temp,
            Variable::OutsideTemp => self.outside_temp,
        }
    }
}

/// Room-hour rows for one or many buildings, kept sorted by `(room_id, ts)`
/// within each building.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoomHourTable {
    rows: Vec<RoomHourRecord>,
}

impl RoomHourTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a table from arbitrary rows, sorting them by `(room_id, ts)`.
    pub fn from_rows(mut rows: Vec<RoomHourRecord>) -> Self {
        rows.sort_by(|a, b| (a.room_id, a.ts).cmp(&(b.room_id, b.ts)));
        RoomHourTable { rows }
    }

    pub fn rows(&self) -> &[RoomHourRecord] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Append another building's rows; no global re-ordering.
    pub fn append(&mut self, other: RoomHourTable) {
        self.rows.extend(other.rows);
    }

    /// Rows grouped per room, each group sorted by timestamp.
    pub fn by_room(&self) -> BTreeMap<RoomId, Vec<&RoomHourRecord>> {
        let mut groups: BTreeMap<RoomId, Vec<&RoomHourRecord>> = BTreeMap::new();
        for row in &self.rows {
            groups.entry(row.room_id).or_default().push(row);
        }
        for rows in groups.values_mut() {
            rows.sort_by_key(|r| r.ts);
        }
        groups
    }

    pub fn building_ids(&self) -> Vec<BuildingId> {
        let mut ids: Vec<BuildingId> = self.rows.iter().map(|r| r.building_id).collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }
}

/// Data-quality statistics for one `(room, variable)` column.
#[derive(Debug, Clone, PartialEq)]
pub struct QaRecord {
    pub room_id: RoomId,
    pub variable: Variable,
    pub gaps: GapHistogram,
    pub valid_runs: ValidRunHistogram,
    pub total_rows: usize,
    pub total_non_null: usize,
    pub total_nan_rows: usize,
    /// `None` for a column with no rows.
    pub non_null_ratio: Option<f64>,
    /// Derived-vs-metered error of the room; repeated on every variable row.
    pub mape_hca_units: Option<f64>,
    pub rmse_hca_units: Option<f64>,
    /// Days that entered the error metrics.
    pub compared_days: usize,
}

impl QaRecord {
    /// Flattened CSV header matching [`QaRecord::to_row`].
    pub fn header() -> Vec<String> {
        let mut cols = vec!["room_id".to_string(), "variable".to_string()];
        cols.extend(GAP_BUCKET_LABELS.iter().map(|l| l.to_string()));
        cols.extend(VALID_RUN_THRESHOLDS.iter().map(|(label, _)| format!("count_{label}_consec")));
        cols.extend(VALID_RUN_THRESHOLDS.iter().map(|(label, _)| format!("sum_{label}_consec")));
        cols.extend(
            [
                "total_rows",
                "total_non_null",
                "total_nan_rows",
                "non_null_ratio",
                "mape_hca_units",
                "rmse_hca_units",
                "compared_days",
            ]
            .iter()
            .map(|c| c.to_string()),
        );
        cols
    }

    pub fn to_row(&self) -> Vec<String> {
        fn opt(v: Option<f64>) -> String {
            v.map(|x| x.to_string()).unwrap_or_default()
        }

        let mut row = vec![self.room_id.0.to_string(), self.variable.name().to_string()];
        row.extend(self.gaps.counts().iter().map(|c| c.to_string()));
        row.extend(self.valid_runs.counts().iter().map(|c| c.to_string()));
        row.extend(self.valid_runs.hours().iter().map(|h| h.to_string()));
        row.push(self.total_rows.to_string());
        row.push(self.total_non_null.to_string());
        row.push(self.total_nan_rows.to_string());
        row.push(opt(self.non_null_ratio));
        row.push(opt(self.mape_hca_units));
        row.push(opt(self.rmse_hca_units));
        row.push(self.compared_days.to_string());
        row
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn row(room: i64, hour: u32) -> RoomHourRecord {
        RoomHourRecord::empty(
            RoomId(room),
            Utc.with_ymd_and_hms(2024, 1, 1, hour, 0, 0).unwrap(),
            BuildingId(1),
        )
    }

    #[test]
    fn from_rows_sorts_by_room_then_time() {
        let table = RoomHourTable::from_rows(vec![row(2, 1), row(1, 3), row(2, 0), row(1, 1)]);
        let keys: Vec<_> = table.rows().iter().map(|r| (r.room_id.0, r.ts)).collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
        assert_eq!(table.by_room().len(), 2);
        assert_eq!(table.building_ids(), vec![BuildingId(1)]);
    }

    #[test]
    fn header_and_row_have_same_width() {
        let record = QaRecord {
            room_id: RoomId(4),
            variable: Variable::InsideTemp,
            gaps: GapHistogram::default(),
            valid_runs: ValidRunHistogram::default(),
            total_rows: 0,
            total_non_null: 0,
            total_nan_rows: 0,
            non_null_ratio: None,
            mape_hca_units: None,
            rmse_hca_units: None,
            compared_days: 0,
        };
        assert_eq!(QaRecord::header().len(), record.to_row().len());
        assert_eq!(record.to_row()[1], "inside_temp");
    }
}
