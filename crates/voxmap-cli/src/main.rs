//! `voxmap-cli` – occupancy mapping from a depth stream.
//!
//! This binary wires the mapping stack together:
//!
//! 1. Loads `~/.voxmap/config.toml` (or `--config`), writing the defaults on
//!    first run.
//! 2. Builds the occupancy grid and starts the map worker on it.
//! 3. Starts a [`MapReplica`] that rebuilds the map from the bus, the way a
//!    remote consumer would.
//! 4. Feeds the pipeline from the synthetic sensor until `--frames` frames
//!    have been sent or **Ctrl-C** is pressed.
//! 5. Shuts down, prints the pipeline counters and optionally exports the
//!    grid as JSON.

mod config;
mod sim;

use std::fs;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use clap::Parser;
use colored::Colorize;
use nalgebra::Point3;
use tracing::{info, warn};

use voxmap_middleware::EventBus;
use voxmap_perception::{GridSnapshot, MapReader, OccupancyGrid, RigidTransform};
use voxmap_runtime::{MapReplica, Pipeline, ReplicaStats, StatsSnapshot, init_tracing};

use sim::SyntheticSensor;

#[derive(Parser, Debug)]
#[command(name = "voxmap", version, about = "Depth-camera occupancy mapping")]
struct Args {
    /// Config file (default: ~/.voxmap/config.toml).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Stop after this many synthetic frames (default: run until Ctrl-C).
    #[arg(long)]
    frames: Option<u64>,

    /// Write the final grid snapshot here, overriding `export_path`.
    #[arg(long)]
    export: Option<PathBuf>,
}

fn main() -> ExitCode {
    let args = Args::parse();

    // ── Structured logging ────────────────────────────────────────────────
    // RUST_LOG filters, VOXMAP_LOG_FORMAT=json switches to JSON lines, and
    // OTEL_EXPORTER_OTLP_ENDPOINT enables span export.  Console summaries
    // below still use println! for UX consistency.
    let _telemetry = init_tracing("voxmap");

    print_banner();

    // ── Shared shutdown flag ──────────────────────────────────────────────
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = Arc::clone(&shutdown);
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – stopping the sensor feed …".yellow().bold());
        shutdown_clone.store(true, Ordering::SeqCst);
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler; use --frames to bound the run");
    }

    // ── Configuration ─────────────────────────────────────────────────────
    let config_path = args.config.clone().unwrap_or_else(config::config_path);
    let cfg = load_or_create_config(&config_path);
    let export_path = args.export.clone().or_else(|| cfg.export_path.clone());

    let pipeline_config = match cfg.pipeline_config() {
        Ok(p) => p,
        Err(e) => return fail("Invalid pipeline configuration", e),
    };
    let frame_period = match Duration::try_from_secs_f64(1.0 / cfg.frame_rate_hz) {
        Ok(p) => p,
        Err(_) => {
            return fail(
                "Invalid frame rate",
                format!("frame_rate_hz must be positive, got {}", cfg.frame_rate_hz),
            );
        }
    };

    // ── Map, bus and replica ──────────────────────────────────────────────
    let definition = cfg.map_definition();
    let (writer, reader) = match OccupancyGrid::new(definition, cfg.grid_params()) {
        Ok(grid) => grid.share(),
        Err(e) => return fail("Invalid map", e),
    };
    let replica_grid = match OccupancyGrid::new(definition, cfg.grid_params()) {
        Ok(grid) => grid,
        Err(e) => return fail("Invalid map", e),
    };
    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => return fail("Failed to start async runtime", e),
    };

    let bus = EventBus::default();
    let (replica, replica_reader) = MapReplica::new(replica_grid);
    let replica_task = {
        let _ctx = runtime.enter();
        replica.spawn(&bus)
    };

    // ── Pipeline ──────────────────────────────────────────────────────────
    let mut pipeline = match Pipeline::spawn(pipeline_config, writer, bus.clone()) {
        Ok(p) => p,
        Err(e) => return fail("Failed to start pipeline", e),
    };
    println!(
        "  Mapping {} cells, sensor {}x{} at {} Hz.",
        definition.cell_count().to_string().bold(),
        cfg.sensor_width,
        cfg.sensor_height,
        cfg.frame_rate_hz
    );
    match args.frames {
        Some(n) => println!("  Feeding {} synthetic frames.\n", n.to_string().bold()),
        None => println!("  Feeding synthetic frames until {}.\n", "Ctrl-C".bold()),
    }

    // ── Sensor loop ───────────────────────────────────────────────────────
    let sensor = SyntheticSensor::new(cfg.sensor_width, cfg.sensor_height);
    info!(
        valid_samples = sensor.valid_samples(),
        wall_distance = sensor.wall_distance(),
        "synthetic sensor ready"
    );
    let inlet = pipeline.inlet();
    let started = Instant::now();
    let mut sent = 0u64;
    let mut sim_time = 0.0;
    while !shutdown.load(Ordering::SeqCst) && args.frames.is_none_or(|n| sent < n) {
        sim_time = sent as f64 * frame_period.as_secs_f64();
        inlet.on_pose(sensor.pose(sim_time));
        inlet.on_depth_frame(sensor.depth_frame(sim_time));
        sent += 1;
        thread::sleep(frame_period);
    }

    let stats = pipeline.shutdown();
    let elapsed = started.elapsed();
    drop(pipeline);
    drop(bus);
    info!(sent, ?elapsed, "sensor feed stopped");

    let replica_stats = match runtime.block_on(replica_task) {
        Ok(s) => Some(s),
        Err(e) => {
            warn!(error = %e, "map replica task failed");
            None
        }
    };

    // ── Summary ───────────────────────────────────────────────────────────
    print_summary(sent, &stats, &reader, replica_stats, &replica_reader);
    print_probe(&reader, &sensor, sim_time);

    if let Some(path) = export_path {
        match export_snapshot(&reader.export_snapshot(), &path) {
            Ok(()) => println!(
                "  {} Map snapshot written to {}\n",
                "✓".green().bold(),
                path.display().to_string().bold()
            ),
            Err(e) => return fail("Export failed", e),
        }
    }

    ExitCode::SUCCESS
}

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

fn load_or_create_config(path: &Path) -> config::Config {
    match config::load_from(path) {
        Ok(Some(cfg)) => {
            println!("  Config loaded from {}", path.display().to_string().bold());
            cfg
        }
        Ok(None) => {
            let mut cfg = config::Config::default();
            match config::save_to(&cfg, path) {
                Ok(()) => println!(
                    "  {} Default config written to {}",
                    "✓".green().bold(),
                    path.display().to_string().bold()
                ),
                Err(e) => println!("{}: {}", "Error saving config".red(), e),
            }
            config::apply_env_overrides(&mut cfg);
            cfg
        }
        Err(e) => {
            println!("{}: {}", "Config error".red(), e);
            println!("  Using default configuration.");
            let mut cfg = config::Config::default();
            config::apply_env_overrides(&mut cfg);
            cfg
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Output
// ─────────────────────────────────────────────────────────────────────────────

fn export_snapshot(snapshot: &GridSnapshot, path: &Path) -> Result<(), String> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create {}: {}", parent.display(), e))?;
    }
    let file = fs::File::create(path)
        .map_err(|e| format!("Failed to create {}: {}", path.display(), e))?;
    serde_json::to_writer(BufWriter::new(file), snapshot)
        .map_err(|e| format!("Failed to write snapshot: {}", e))
}

fn print_summary(
    sent: u64,
    stats: &StatsSnapshot,
    reader: &MapReader,
    replica: Option<ReplicaStats>,
    replica_reader: &MapReader,
) {
    println!();
    println!("{}", "  ── Pipeline ─────────────────────────────".bold().cyan());
    println!("    frames sent           {}", sent);
    println!("    processed             {}", stats.processed.to_string().green());
    println!("    rejected              {}", highlight(stats.rejected));
    println!("    dropped without pose  {}", highlight(stats.dropped_without_pose));
    println!("    overwritten           {}", stats.overwritten.to_string().dimmed());
    println!("{}", "  ── Map ──────────────────────────────────".bold().cyan());
    println!("    occupied cells        {}", reader.occupied_cells());
    println!("    total weight          {}", reader.total_weight());
    if let Some(replica) = replica {
        println!("{}", "  ── Replica ──────────────────────────────".bold().cyan());
        println!("    updates applied       {}", replica.applied);
        println!("    updates rejected      {}", highlight(replica.rejected));
        println!("    updates lagged        {}", highlight(replica.lagged));
        println!("    occupied cells        {}", replica_reader.occupied_cells());
    }
    println!();
}

/// Query the map at the wall point straight ahead of the final pose.
fn print_probe(reader: &MapReader, sensor: &SyntheticSensor, t: f64) {
    let Ok(transform) = RigidTransform::from_pose(&sensor.pose(t)) else {
        return;
    };
    let ahead = transform.apply(&Point3::new(sensor.wall_distance(), 0.0, 0.0));
    if let Some(weight) = reader.query(&[ahead]).first() {
        println!(
            "  Occupancy ahead at ({:.2}, {:.2}, {:.2}): {}\n",
            ahead.x,
            ahead.y,
            ahead.z,
            format!("{weight:.1}").bold()
        );
    }
}

fn highlight(n: u64) -> colored::ColoredString {
    if n == 0 {
        n.to_string().normal()
    } else {
        n.to_string().yellow()
    }
}

fn fail(context: &str, error: impl std::fmt::Display) -> ExitCode {
    println!("{}: {}", context.red().bold(), error);
    ExitCode::FAILURE
}

// ─────────────────────────────────────────────────────────────────────────────
// Banner
// ─────────────────────────────────────────────────────────────────────────────

fn print_banner() {
    println!();
    println!("{}", r#"  _   ______  __ __ ____ ___  ____ _____ "#.bold().cyan());
    println!("{}", r#" | | / / __ \/ //_// __ `__ \/ __ `/ __ \"#.bold().cyan());
    println!("{}", r#" | |/ / /_/ />  < / / / / / / /_/ / /_/ /"#.bold().cyan());
    println!("{}", r#" |___/\____/_/|_|/_/ /_/ /_/\__,_/ .___/ "#.bold().cyan());
    println!("{}", r#"                                /_/      "#.bold().cyan());
    println!();
    println!(
        "  {} {}",
        "voxmap".bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  Depth-camera occupancy mapping");
    println!();
}
