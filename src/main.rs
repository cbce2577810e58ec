use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use spatial_mapper::io::{export_csv, read_snapshot};
use spatial_mapper::simulation::{ScenarioConfig, SensorEvent, SyntheticScenario};
use spatial_mapper::{Mapper, MapperConfig};

/// Keyframe mapping sessions with geo-anchoring.
#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a synthetic walk into a map directory and flush it.
    Simulate {
        #[arg(long)]
        dir: PathBuf,
        #[arg(long, default_value_t = 24)]
        frames: usize,
        /// Horizontal noise added to the synthetic fixes (metres).
        #[arg(long, default_value_t = 0.0)]
        fix_noise: f64,
        #[arg(long, default_value_t = 7)]
        seed: u64,
        /// JSON mapper configuration; defaults are used if omitted.
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Print the metadata of the stored map.
    Inspect {
        #[arg(long)]
        dir: PathBuf,
    },
    /// Write trajectory.csv and landmarks.csv for the stored map.
    Export {
        #[arg(long)]
        dir: PathBuf,
        #[arg(long)]
        out: PathBuf,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match Cli::parse().command {
        Command::Simulate {
            dir,
            frames,
            fix_noise,
            seed,
            config,
        } => simulate(dir, frames, fix_noise, seed, config),
        Command::Inspect { dir } => inspect(dir),
        Command::Export { dir, out } => export(dir, out),
    }
}

fn simulate(
    dir: PathBuf,
    frames: usize,
    fix_noise: f64,
    seed: u64,
    config: Option<PathBuf>,
) -> Result<()> {
    let config = match config {
        Some(path) => MapperConfig::from_json_file(&path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => MapperConfig::default(),
    };
    let mapper = Mapper::bind_with_config(&dir, config)
        .with_context(|| format!("binding {}", dir.display()))?;

    let mut scenario_config = ScenarioConfig {
        frames,
        fix_noise_m: fix_noise,
        turn_at: Some(frames / 2),
        ..ScenarioConfig::default()
    };
    scenario_config.world.seed = seed;
    let mut scenario = SyntheticScenario::new(scenario_config);

    for event in scenario.events() {
        match event {
            SensorEvent::Frame(frame) => {
                mapper.add_frame(&frame);
            }
            SensorEvent::Position(sample) => {
                mapper.add_position(sample.position, sample.timestamp_ns);
            }
            SensorEvent::Location(fix) => {
                mapper.add_location(&fix);
            }
        }
    }

    let metadata = mapper.write_metadata().context("writing map")?;
    let stats = mapper.stats();
    info!(
        generation = metadata.generation,
        keyframes = metadata.keyframe_count,
        landmarks = metadata.landmark_count,
        pending = metadata.pending_landmark_count,
        geo_anchor = metadata.has_geo_anchor,
        "simulation flushed"
    );
    println!("{}", serde_json::to_string_pretty(&stats)?);
    if let Some(anchor) = mapper.geo_anchor() {
        println!(
            "anchor: scale {:.4}, yaw {:.2} deg, rms {:.3} m over {} fixes",
            anchor.scale(),
            anchor.yaw_rad().to_degrees(),
            anchor.rms_error_m,
            anchor.correspondence_count
        );
    }
    mapper.close();
    Ok(())
}

fn inspect(dir: PathBuf) -> Result<()> {
    let Some((_, snapshot)) =
        read_snapshot(&dir).with_context(|| format!("reading {}", dir.display()))?
    else {
        bail!("{} holds no saved map", dir.display());
    };
    println!("{}", serde_json::to_string_pretty(&snapshot.metadata)?);
    if let Some(anchor) = &snapshot.geo_anchor.transform {
        let origin = anchor.frame.origin;
        println!(
            "anchor origin {:.7}, {:.7}, {:.2} m; scale {:.4}; rms {:.3} m",
            origin.latitude_deg,
            origin.longitude_deg,
            origin.altitude_m,
            anchor.scale(),
            anchor.rms_error_m
        );
    }
    Ok(())
}

fn export(dir: PathBuf, out: PathBuf) -> Result<()> {
    let Some((generation, snapshot)) =
        read_snapshot(&dir).with_context(|| format!("reading {}", dir.display()))?
    else {
        bail!("{} holds no saved map", dir.display());
    };
    let config = snapshot.config.clone();
    let restored = snapshot
        .restore(&dir, &config)
        .with_context(|| format!("restoring generation {generation}"))?;
    let summary = export_csv(
        &restored.graph,
        &restored.tracker,
        restored.resolver.transform(),
        &out,
    )?;
    println!(
        "wrote {} keyframes to {} and {} landmarks to {}",
        summary.keyframe_rows,
        summary.trajectory.display(),
        summary.landmark_rows,
        summary.landmarks.display()
    );
    Ok(())
}
