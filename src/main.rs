use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};
use serde_json::json;

use tracker_calib::comparison::ComparisonDriver;
use tracker_calib::config::HarnessConfig;
use tracker_calib::loader::{LoadedMeasurements, MeasurementLoader};
use tracker_calib::objective::{calibrate, ObjectiveEvaluator, PoseErrorCost};
use tracker_calib::report::ComparisonReport;
use tracker_calib::runners::{FullTracker, RansacSmoothed};
use tracker_calib::tracking::{BeaconTrackingSystemFactory, TrackerParams, TrackingSystemFactory};

#[derive(Parser, Debug)]
#[command(name = "tracker_calib")]
#[command(about = "Calibrate and compare pose tracker pipelines on recorded frames", long_about = None)]
struct Args {
    /// Harness config (TOML); built-in defaults when omitted
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the full tracker and smoothed RANSAC side by side
    Compare {
        /// Measurement file (.csv or .csv.gz)
        #[arg(long)]
        data: PathBuf,

        /// Write the per-frame report as JSON
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Tune the tracker noise parameters against ground truth
    Optimize {
        /// Measurement file (.csv or .csv.gz)
        #[arg(long)]
        data: PathBuf,

        #[arg(long)]
        max_evaluations: Option<usize>,

        /// Initial trust region radius
        #[arg(long)]
        rho_begin: Option<f64>,

        /// Final trust region radius
        #[arg(long)]
        rho_end: Option<f64>,

        /// Number of interpolation points
        #[arg(long)]
        npt: Option<usize>,
    },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => HarnessConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => HarnessConfig::default(),
    };

    let summary = match args.command {
        Command::Compare { data, output } => compare(&config, &data, output.as_deref())?,
        Command::Optimize {
            data,
            max_evaluations,
            rho_begin,
            rho_end,
            npt,
        } => {
            let mut config = config;
            if let Some(n) = max_evaluations {
                config.calibration.max_evaluations = n;
            }
            if let Some(r) = rho_begin {
                config.calibration.rho_begin = r;
            }
            if let Some(r) = rho_end {
                config.calibration.rho_end = r;
            }
            if npt.is_some() {
                config.calibration.interpolation_points = npt;
            }
            optimize(&config, &data)?
        }
    };

    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn load(config: &HarnessConfig, data: &Path) -> Result<LoadedMeasurements> {
    let loaded = MeasurementLoader::new(config.loader)
        .load_path(data)
        .with_context(|| format!("loading measurements from {}", data.display()))?;
    let summary = loaded.report.summary();
    if summary.rows_rejected > 0 || summary.structural_issues > 0 || summary.truncated_blob_lists > 0 {
        warn!(
            "[main] {} rejected rows, {} structural issues, {} truncated blob lists in {}",
            summary.rows_rejected,
            summary.structural_issues,
            summary.truncated_blob_lists,
            data.display()
        );
    }
    if loaded.records.is_empty() {
        bail!("no usable frames in {}", data.display());
    }
    info!("[main] loaded {} frames from {}", loaded.records.len(), data.display());
    Ok(loaded)
}

fn compare(
    config: &HarnessConfig,
    data: &Path,
    output: Option<&Path>,
) -> Result<serde_json::Value> {
    let loaded = load(config, data)?;
    let params = TrackerParams::from_vec(&config.calibration.initial());
    let system = BeaconTrackingSystemFactory::new(config.tracker.clone())
        .build(&params)
        .context("building tracking system")?;

    let mut driver = ComparisonDriver::new(
        system,
        config.camera,
        FullTracker::new(),
        RansacSmoothed::new(&config.smoother),
    );
    let frames = driver.run(&loaded.records);
    let report = ComparisonReport::build(driver.names(), &loaded.records, &frames);

    if let Some(path) = output {
        fs::write(path, serde_json::to_string_pretty(&report)?)
            .with_context(|| format!("writing report {}", path.display()))?;
        info!("[main] per-frame report written to {}", path.display());
    }

    let mut summary = report.summary_json();
    summary["load"] = serde_json::to_value(loaded.report.summary())?;
    Ok(summary)
}

fn optimize(config: &HarnessConfig, data: &Path) -> Result<serde_json::Value> {
    let loaded = load(config, data)?;
    let factory = BeaconTrackingSystemFactory::new(config.tracker.clone());
    let initial = config.calibration.initial();

    // Fail early on a layout or starting point the tracker cannot use
    factory
        .build(&TrackerParams::from_vec(&initial))
        .context("building tracking system")?;

    let evaluator = ObjectiveEvaluator::new(
        &factory,
        &loaded.records,
        config.camera,
        PoseErrorCost::from(&config.cost),
    )
    .with_invalid_penalty(config.cost.invalid_parameter_penalty);

    let optimizer = config.calibration.optimizer();
    info!(
        "[main] optimizing from {:?}, rho {} -> {}, budget {}",
        config.calibration.initial_parameters,
        optimizer.rho_begin,
        optimizer.rho_end,
        optimizer.max_evaluations
    );
    let outcome = calibrate(&evaluator, &initial, &optimizer).context("running optimizer")?;
    info!(
        "[main] best cost {:.6e} after {} evaluations ({:?})",
        outcome.cost, outcome.evaluations, outcome.termination
    );

    Ok(json!({
        "initial_parameters": config.calibration.initial_parameters,
        "outcome": outcome,
        "load": loaded.report.summary(),
    }))
}
