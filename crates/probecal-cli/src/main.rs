use std::{fs, path::Path, path::PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use probecal_core::Real;
use probecal_pipeline::correspondence::read_records;
use probecal_pipeline::{CalibrationStatusEvent, Engine, EngineConfig, IntrinsicCalibration};
use serde::{Deserialize, Serialize};

/// Replay a correspondence log and report the fitted probe transforms.
#[derive(Debug, Parser)]
#[command(author, version, about = "Probe calibration log replay")]
struct Args {
    /// Correspondence log CSV.
    #[arg(long)]
    log: PathBuf,

    /// JSON list of camera calibrations. Required for bundle adjustment.
    #[arg(long)]
    cameras: Option<PathBuf>,

    /// Optional JSON EngineConfig. Defaults are used if omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Bundle-adjust every converged probe before reporting.
    #[arg(long)]
    bundle: bool,

    /// Write `<sn>_transform.csv` and `<sn>_points.csv` per converged probe.
    #[arg(long)]
    out_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct BundleSummary {
    cameras: Vec<String>,
    initial_mean_sq: Real,
    final_mean_sq: Real,
    rounds: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ProbeReport {
    status: CalibrationStatusEvent,
    bundle: Option<BundleSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ReplayReport {
    records: usize,
    probes: Vec<ProbeReport>,
}

fn load_json_file<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let data =
        fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

fn replay(args: &Args) -> Result<ReplayReport> {
    let config = match &args.config {
        Some(path) => load_json_file::<EngineConfig>(path)?,
        None => EngineConfig::default(),
    };
    let mut engine = Engine::new(config);
    if let Some(path) = &args.cameras {
        let calibrations: Vec<IntrinsicCalibration> = load_json_file(path)?;
        for calib in calibrations {
            engine.insert_calibration(calib);
        }
    }

    let records = read_records(&args.log)?;
    log::info!("replaying {} records from {}", records.len(), args.log.display());
    for record in &records {
        let (obs, debug) = record.to_observation();
        engine.register_observation(obs, Some(&debug))?;
    }

    let mut probes = Vec::new();
    for sn in engine.probe_serials() {
        let mut bundle = None;
        let converged = engine.transform(&sn).is_ok();
        if args.bundle && converged {
            bundle = engine.bundle_adjust(&sn)?.map(|outcome| BundleSummary {
                cameras: outcome.camera_ids,
                initial_mean_sq: outcome.result.initial_mean_sq,
                final_mean_sq: outcome.result.final_mean_sq,
                rounds: outcome.result.rounds,
            });
        }
        if let Some(dir) = &args.out_dir {
            fs::create_dir_all(dir)?;
            if converged {
                engine.export_transform(&sn, &dir.join(format!("{sn}_transform.csv")))?;
                engine.export_working_set(&sn, &dir.join(format!("{sn}_points.csv")))?;
            }
        }
        if let Some(status) = engine.status(&sn) {
            probes.push(ProbeReport { status, bundle });
        }
    }

    Ok(ReplayReport {
        records: records.len(),
        probes,
    })
}

fn main() {
    env_logger::init();
    if let Err(err) = try_main() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn try_main() -> Result<()> {
    let args = Args::parse();
    let report = replay(&args)?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
