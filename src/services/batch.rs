//! Fan-out of the building pipeline over a bounded thread pool.
//!
//! Every building is loaded and processed on a pool worker. A building that
//! fails is logged and contributes no rows; the batch itself only fails when
//! the pool cannot be built.

use log::{error, info, warn};
use rayon::ThreadPoolBuilder;
use rayon::prelude::*;
use std::num::NonZeroUsize;
use std::time::Instant;

use crate::models::report::RoomHourTable;
use crate::models::telemetry::{BuildingId, BuildingInput};
use crate::services::building::{BuildingError, BuildingOutcome, PipelineContext, process_building};

#[derive(Debug, Clone, PartialEq)]
pub enum BuildingStatus {
    Completed { rows: usize },
    Empty(String),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct BuildingRecord {
    pub building_id: BuildingId,
    pub status: BuildingStatus,
}

#[derive(Debug, Default)]
pub struct BatchSummary {
    /// Concatenated rows of every completed building, in building order.
    pub table: RoomHourTable,
    pub completed: usize,
    pub empty: usize,
    pub failed: usize,
    pub buildings: Vec<BuildingRecord>,
}

impl BatchSummary {
    /// Buildings that failed, in batch order.
    pub fn failed_ids(&self) -> Vec<BuildingId> {
        self.buildings
            .iter()
            .filter(|r| matches!(r.status, BuildingStatus::Failed(_)))
            .map(|r| r.building_id)
            .collect()
    }
}

fn run_one<F>(id: BuildingId, load: &F, ctx: &PipelineContext<'_>) -> BuildingOutcome
where
    F: Fn(BuildingId) -> Result<BuildingInput, BuildingError> + Sync,
{
    let started = Instant::now();
    let outcome = match load(id) {
        Ok(input) => process_building(&input, ctx),
        Err(e) => BuildingOutcome::Failed(e),
    };
    match &outcome {
        BuildingOutcome::Completed(table) => info!(
            "Batch: building {} done, {} row(s) in {:.1}s",
            id.0,
            table.len(),
            started.elapsed().as_secs_f64()
        ),
        BuildingOutcome::Empty(reason) => warn!("Batch: building {} skipped: {}", id.0, reason),
        BuildingOutcome::Failed(e) => error!("Batch: building {} failed: {}", id.0, e),
    }
    outcome
}

pub fn run_batch<F>(
    ids: &[BuildingId],
    threads: NonZeroUsize,
    load: F,
    ctx: &PipelineContext<'_>,
) -> Result<BatchSummary, String>
where
    F: Fn(BuildingId) -> Result<BuildingInput, BuildingError> + Sync,
{
    let pool = ThreadPoolBuilder::new()
        .num_threads(threads.get())
        .thread_name(|i| format!("building-{}", i))
        .build()
        .map_err(|e| format!("building worker pool: {}", e))?;

    info!("Batch: {} building(s) on {} worker(s)", ids.len(), threads);
    let outcomes: Vec<(BuildingId, BuildingOutcome)> = pool.install(|| {
        ids.par_iter()
            .map(|id| (*id, run_one(*id, &load, ctx)))
            .collect()
    });

    let mut summary = BatchSummary::default();
    for (building_id, outcome) in outcomes {
        let status = match &outcome {
            BuildingOutcome::Completed(table) => {
                summary.completed += 1;
                BuildingStatus::Completed { rows: table.len() }
            }
            BuildingOutcome::Empty(reason) => {
                summary.empty += 1;
                BuildingStatus::Empty(reason.to_string())
            }
            BuildingOutcome::Failed(e) => {
                summary.failed += 1;
                BuildingStatus::Failed(e.to_string())
            }
        };
        summary.buildings.push(BuildingRecord { building_id, status });
        summary.table.append(outcome.into_table());
    }

    info!(
        "Batch: {} completed, {} empty, {} failed, {} row(s) total",
        summary.completed,
        summary.empty,
        summary.failed,
        summary.table.len()
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::DatasetError;
    use crate::models::telemetry::{RoomId, RoomReading};
    use crate::services::geocode::GeoCache;
    use crate::services::geocode::stub::StaticGeocoder;
    use crate::services::weather::stub::FlatWeather;
    use chrono::{Duration, TimeZone, Utc};

    fn input(id: BuildingId, city: &str) -> BuildingInput {
        let t0 = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        BuildingInput {
            building_id: id,
            city: city.into(),
            rooms: (0..3)
                .map(|h| RoomReading {
                    room_id: RoomId(id.0 * 100),
                    ts: t0 + Duration::hours(h),
                    temperature: Some(20.0),
                })
                .collect(),
            ..Default::default()
        }
    }

    fn missing(id: BuildingId) -> BuildingError {
        BuildingError::Input(DatasetError::UnknownBuilding(id))
    }

    #[test]
    fn failures_are_isolated_per_building() {
        let geocoder = StaticGeocoder::with(&[("Dresden", 51.05, 13.74)]);
        let weather = FlatWeather::default();
        let cache = GeoCache::new();
        let ctx = PipelineContext {
            geocoder: &geocoder,
            weather: &weather,
            cache: &cache,
        };
        let ids: Vec<BuildingId> = (1..=5).map(BuildingId).collect();
        let load = |id: BuildingId| match id.0 {
            2 => Err(missing(id)),
            3 => Ok(input(id, "Atlantis")),
            4 => Ok(BuildingInput {
                building_id: id,
                ..Default::default()
            }),
            _ => Ok(input(id, "Dresden")),
        };

        let summary = run_batch(&ids, NonZeroUsize::new(3).unwrap(), load, &ctx).unwrap();
        assert_eq!((summary.completed, summary.empty, summary.failed), (2, 1, 2));
        assert_eq!(summary.table.len(), 6);
        assert_eq!(summary.table.building_ids(), vec![BuildingId(1), BuildingId(5)]);
        assert_eq!(summary.buildings.len(), 5);
        assert!(matches!(summary.buildings[1].status, BuildingStatus::Failed(_)));
        assert_eq!(summary.buildings[4].status, BuildingStatus::Completed { rows: 3 });
        assert_eq!(summary.failed_ids(), vec![BuildingId(2), BuildingId(3)]);
    }

    #[test]
    fn all_failing_buildings_give_an_empty_result() {
        let geocoder = StaticGeocoder::default();
        let weather = FlatWeather::default();
        let cache = GeoCache::new();
        let ctx = PipelineContext {
            geocoder: &geocoder,
            weather: &weather,
            cache: &cache,
        };
        let ids = [BuildingId(1), BuildingId(2)];
        let summary = run_batch(&ids, NonZeroUsize::new(2).unwrap(), |id| Err(missing(id)), &ctx).unwrap();
        assert!(summary.table.is_empty());
        assert_eq!(summary.failed, 2);
        assert_eq!(summary.failed_ids(), ids.to_vec());
    }
}
