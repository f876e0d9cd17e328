pub mod models {
    pub mod report;
    pub mod telemetry;
}

pub mod client;
pub mod config;
pub mod dataset;
pub mod utils;
pub mod services {
    pub mod batch;
    pub mod building;
    pub mod fake_data;
    pub mod geocode;
    pub mod heat_yield;
    pub mod meter;
    pub mod qa;
    pub mod resample;
    pub mod runs;
    pub mod weather;
}

use crate::config::Config;
use crate::dataset::{Dataset, QA_REPORT_FILE, RESAMPLED_FILE};
use crate::models::report::RoomHourTable;
use crate::services::building::{BuildingError, PipelineContext};
use crate::services::geocode::{GeoCache, NominatimGeocoder};
use crate::services::weather::OpenMeteoWeather;
use crate::services::{batch, fake_data, qa};
use log::{debug, error, info, warn};
use std::ffi::OsString;
use std::path::{Path, PathBuf};

#[derive(Debug)]
struct LoadedEnvFile {
    path: PathBuf,
    explicit: bool,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum Mode {
    /// Resample every selected building, then run QA.
    #[default]
    Pipeline,
    /// Write a synthetic dataset to `DATA_DIR` and stop.
    FakeData,
    /// Re-read the stored room-hour table and run QA only.
    QaOnly,
}

#[derive(Debug, Default, PartialEq)]
struct CliArgs {
    env_file: Option<PathBuf>,
    mode: Mode,
}

pub fn run(mode: Mode) -> Result<(), String> {
    // 1) Load config
    let cfg = Config::from_env()?;
    info!(
        "Config loaded (data_dir={}, output_dir={}, worker_threads={}, qa_enabled={}, buildings={}, excluded={})",
        cfg.data_dir.display(),
        cfg.output_dir.display(),
        cfg.worker_threads,
        cfg.qa_enabled,
        cfg.building_ids
            .as_ref()
            .map(|ids| ids.iter().map(|id| id.0.to_string()).collect::<Vec<_>>().join(","))
            .unwrap_or_else(|| "all".to_string()),
        cfg.excluded_building_ids.len()
    );
    let dataset = Dataset::new(cfg.data_dir.clone());

    if mode == Mode::FakeData {
        return fake_data::run(&dataset);
    }

    // 2) Static metadata
    let metadata = dataset
        .load_metadata()
        .map_err(|e| format!("Loading metadata failed: {}", e))?;
    info!(
        "Metadata loaded: {} building(s), {} room(s), {} allocator(s)",
        metadata.cities.len(),
        metadata.room_buildings.len(),
        metadata.allocators.len()
    );

    // 3) Room-hour table: fresh batch or the stored one
    let resampled_path = cfg.output_dir.join(RESAMPLED_FILE);
    let table = if mode == Mode::QaOnly {
        let table = dataset::read_room_hours(&resampled_path)
            .map_err(|e| format!("Reading stored room-hour table failed: {}", e))?;
        info!("Read {} room-hour row(s) from {}", table.len(), resampled_path.display());
        table
    } else {
        let table = resample_buildings(&cfg, &dataset, &metadata)?;
        dataset::write_room_hours(&resampled_path, &table)
            .map_err(|e| format!("Writing room-hour table failed: {}", e))?;
        info!("Wrote {} room-hour row(s) to {}", table.len(), resampled_path.display());
        table
    };

    // 4) Data QA
    if cfg.qa_enabled || mode == Mode::QaOnly {
        run_qa(&cfg, &dataset, &metadata, &table)?;
    } else {
        info!("Data QA disabled via QA_ENABLED={}", cfg.qa_enabled);
    }

    Ok(())
}

fn resample_buildings(
    cfg: &Config,
    dataset: &Dataset,
    metadata: &dataset::Metadata,
) -> Result<RoomHourTable, String> {
    let ids = cfg.select_buildings(&metadata.building_ids());
    if ids.is_empty() {
        warn!("No buildings selected; the room-hour table will be empty");
        return Ok(RoomHourTable::new());
    }

    let geocoder = NominatimGeocoder::from_config(cfg);
    let weather = OpenMeteoWeather::from_config(cfg);
    let cache = GeoCache::new();
    cache.prefetch(
        &geocoder,
        ids.iter().filter_map(|id| metadata.cities.get(id)).map(String::as_str),
    );
    if cache.is_empty() {
        warn!("Geocode: no lookup succeeded before fan-out; buildings will retry individually");
    }

    let ctx = PipelineContext {
        geocoder: &geocoder,
        weather: &weather,
        cache: &cache,
    };
    let load = |id| dataset.load_building(metadata, id).map_err(BuildingError::from);
    let summary = batch::run_batch(&ids, cfg.worker_threads, load, &ctx)?;
    for record in &summary.buildings {
        debug!("Batch: building {} -> {:?}", record.building_id.0, record.status);
    }
    let failed = summary.failed_ids();
    if !failed.is_empty() {
        warn!(
            "Batch: {} building(s) failed and are missing from the output: {:?}",
            failed.len(),
            failed.iter().map(|id| id.0).collect::<Vec<_>>()
        );
    }
    if summary.completed == 0 {
        warn!("No building produced rows ({} empty, {} failed)", summary.empty, summary.failed);
    }
    Ok(summary.table)
}

fn run_qa(cfg: &Config, dataset: &Dataset, metadata: &dataset::Metadata, table: &RoomHourTable) -> Result<(), String> {
    let mut units = Vec::new();
    for id in table.building_ids() {
        match dataset.load_units(id) {
            Ok(mut readings) => units.append(&mut readings),
            Err(e) if e.is_not_found() => warn!("QA: building {} has no unit readings", id.0),
            Err(e) => warn!("QA: unit readings of building {} unusable: {}", id.0, e),
        }
    }

    let records = qa::build_report(table, &units, &metadata.allocator_rooms());
    let report_path = cfg.output_dir.join(QA_REPORT_FILE);
    dataset::write_qa_report(&report_path, &records).map_err(|e| format!("Writing QA report failed: {}", e))?;
    info!("Wrote {} QA record(s) to {}", records.len(), report_path.display());
    Ok(())
}

fn set_mode(parsed: &mut CliArgs, mode: Mode, flag: &str) -> Result<(), String> {
    if parsed.mode != Mode::Pipeline {
        return Err(format!("`{}` cannot be combined with another mode flag", flag));
    }
    parsed.mode = mode;
    Ok(())
}

fn parse_args<I>(args: I) -> Result<CliArgs, String>
where
    I: IntoIterator<Item = OsString>,
{
    let mut args = args.into_iter();
    let mut parsed = CliArgs::default();

    while let Some(arg) = args.next() {
        match arg.to_str() {
            Some("--env-file") => {
                if parsed.env_file.is_some() {
                    return Err("`--env-file` provided more than once".to_string());
                }
                let value = args
                    .next()
                    .ok_or_else(|| "`--env-file` requires a path argument".to_string())?;
                parsed.env_file = Some(PathBuf::from(value));
            }
            Some(s) if s.starts_with("--env-file=") => {
                if parsed.env_file.is_some() {
                    return Err("`--env-file` provided more than once".to_string());
                }
                let path_str = &s["--env-file=".len()..];
                if path_str.is_empty() {
                    return Err("`--env-file` requires a path argument".to_string());
                }
                parsed.env_file = Some(PathBuf::from(path_str));
            }
            Some("--fake-data") => set_mode(&mut parsed, Mode::FakeData, "--fake-data")?,
            Some("--qa-only") => set_mode(&mut parsed, Mode::QaOnly, "--qa-only")?,
            Some("--") => break,
            Some(other) => return Err(format!("unrecognised argument: {}", other)),
            None => return Err("argument contains invalid UTF-8".to_string()),
        }
    }
    Ok(parsed)
}

fn configure_env_from_cli() -> Result<(Option<LoadedEnvFile>, Mode), String> {
    let mut args = std::env::args_os();
    args.next(); // skip program name
    let CliArgs { env_file, mode } = parse_args(args)?;

    if let Some(path) = env_file {
        if !path.is_file() {
            return Err(format!("env file not found: {}", path.display()));
        }
        load_env_file(&path)?;
        Ok((Some(LoadedEnvFile { path, explicit: true }), mode))
    } else {
        let cwd = std::env::current_dir().map_err(|e| format!("unable to read current directory: {}", e))?;
        let default_path = cwd.join(".env");
        if default_path.is_file() {
            load_env_file(&default_path)?;
            Ok((
                Some(LoadedEnvFile {
                    path: default_path,
                    explicit: false,
                }),
                mode,
            ))
        } else {
            Ok((None, mode))
        }
    }
}

fn load_env_file(path: &Path) -> Result<(), String> {
    // Values already present in the process environment are kept.
    dotenvy::from_path(path).map_err(|e| format!("failed to load {}: {}", path.display(), e))
}

fn main() {
    let (loaded_env, mode) = match configure_env_from_cli() {
        Ok(loaded) => loaded,
        Err(err) => {
            eprintln!("fatal: {}", err);
            std::process::exit(1);
        }
    };

    // Init logging after environment so RUST_LOG from .env is respected.
    let default_filter = env_logger::Env::default().default_filter_or("info");
    env_logger::Builder::from_env(default_filter)
        .format_timestamp_secs()
        .init();

    if let Some(info) = loaded_env.as_ref() {
        let origin = if info.explicit { "CLI-specified" } else { "default" };
        info!("Environment loaded from {} .env file: {}", origin, info.path.display());
    }

    info!(
        "heat-resample {} (git {}) starting in {:?} mode",
        env!("CARGO_PKG_VERSION"),
        env!("BUILD_TIME_GIT_HASH"),
        mode
    );
    if let Err(e) = run(mode) {
        error!("fatal: {}", e);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Result<CliArgs, String> {
        parse_args(list.iter().map(|s| OsString::from(*s)))
    }

    #[test]
    fn modes_and_env_file() {
        assert_eq!(args(&[]).unwrap(), CliArgs::default());
        let parsed = args(&["--env-file=prod.env", "--qa-only"]).unwrap();
        assert_eq!(parsed.env_file, Some(PathBuf::from("prod.env")));
        assert_eq!(parsed.mode, Mode::QaOnly);
        assert_eq!(args(&["--fake-data", "--env-file", "x.env"]).unwrap().mode, Mode::FakeData);
    }

    #[test]
    fn conflicting_or_unknown_arguments_are_rejected() {
        assert!(args(&["--fake-data", "--qa-only"]).is_err());
        assert!(args(&["--env-file"]).is_err());
        assert!(args(&["--env-file=a", "--env-file=b"]).is_err());
        assert!(args(&["--verbose"]).is_err());
        assert_eq!(args(&["--", "--verbose"]).unwrap(), CliArgs::default());
    }

    #[test]
    fn env_file_does_not_override_process_environment() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".env");
        std::fs::write(&path, "HEAT_RESAMPLE_TEST_A=from_file\nHEAT_RESAMPLE_TEST_B=\"quoted value\"\n").unwrap();
        unsafe {
            std::env::set_var("HEAT_RESAMPLE_TEST_A", "from_process");
        }
        load_env_file(&path).unwrap();
        assert_eq!(std::env::var("HEAT_RESAMPLE_TEST_A").unwrap(), "from_process");
        assert_eq!(std::env::var("HEAT_RESAMPLE_TEST_B").unwrap(), "quoted value");
    }
}
