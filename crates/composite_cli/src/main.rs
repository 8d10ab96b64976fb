//! Composite CLI
//!
//! Runs headless bakes of a scene description and reports what was baked
//! each frame together with the registry and device counters.

mod scene_file;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use composite_canvas::Compositor;
use composite_core::BakeSettings;
use composite_gpu::HeadlessDevice;
use scene_file::SceneFile;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

/// Headless bake runner for composite scenes
#[derive(Parser, Debug)]
#[command(name = "composite")]
#[command(about = "Headless bake runner for composite scenes")]
#[command(version)]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Build a scene and run frames against the headless device
    Bake {
        /// Scene description (TOML)
        scene: PathBuf,

        /// Number of frames to run
        #[arg(short, long, default_value = "3")]
        frames: u32,

        /// Bake settings file (TOML)
        #[arg(short, long)]
        settings: Option<PathBuf>,

        /// Print the final report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Parse and validate a scene description without baking
    Check {
        /// Scene description (TOML)
        scene: PathBuf,
    },
}

/// Final counters of a bake run
#[derive(Debug, Serialize)]
struct Report {
    frames: u32,
    baked: u64,
    per_frame: Vec<Vec<String>>,
    materials_active: usize,
    material_hit_rate: f64,
    targets_active: usize,
    target_memory_bytes: u64,
    target_hit_rate: f64,
    live_targets: usize,
    live_materials: usize,
    submissions: u64,
    draws: u64,
    blits: u64,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Bake {
            scene,
            frames,
            settings,
            json,
        } => cmd_bake(&scene, frames, settings.as_deref(), json),
        Commands::Check { scene } => cmd_check(&scene),
    }
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

fn load_settings(path: Option<&Path>) -> Result<BakeSettings> {
    let mut settings = match path {
        Some(path) => BakeSettings::load_from_file(path)
            .with_context(|| format!("Failed to load settings from {}", path.display()))?,
        None => BakeSettings::default(),
    };
    settings.apply_env_overrides();
    settings.validate().context("Invalid bake settings")?;
    Ok(settings)
}

fn cmd_bake(path: &Path, frames: u32, settings: Option<&Path>, json: bool) -> Result<()> {
    let settings = load_settings(settings)?;
    let scene = SceneFile::load(path)?;

    let device = HeadlessDevice::new(scene.screen.width, scene.screen.height);
    let mut compositor = Compositor::new(device, settings);
    let built = scene.build(&mut compositor)?;
    tracing::info!(
        scene = %path.display(),
        nodes = scene.nodes.len(),
        renderers = built.renderers.len(),
        "scene loaded"
    );

    let mut per_frame = Vec::with_capacity(frames as usize);
    for frame in 1..=frames {
        let baked: Vec<String> = compositor
            .frame()
            .iter()
            .map(|id| built.name_of(*id).to_string())
            .collect();
        if !json {
            if baked.is_empty() {
                println!("frame {frame}: nothing baked");
            } else {
                println!("frame {frame}: baked {}", baked.join(", "));
            }
        }
        per_frame.push(baked);
    }

    let materials = compositor.material_registry();
    let targets = compositor.target_registry();
    let device = compositor.device().stats();
    let report = Report {
        frames,
        baked: compositor.baked_count(),
        per_frame,
        materials_active: materials.active_count(),
        material_hit_rate: materials.stats().hit_rate(),
        targets_active: targets.active_count(),
        target_memory_bytes: targets.memory_bytes(),
        target_hit_rate: targets.stats().hit_rate(),
        live_targets: compositor.device().live_targets(),
        live_materials: compositor.device().live_materials(),
        submissions: device.submissions,
        draws: device.draws,
        blits: device.blits,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(())
}

fn print_report(report: &Report) {
    println!();
    println!("Baked {} renderer(s) over {} frame(s)", report.baked, report.frames);
    println!(
        "  materials: {} active, hit rate {:.0}%",
        report.materials_active,
        report.material_hit_rate * 100.0
    );
    println!(
        "  targets:   {} active, {} KiB, hit rate {:.0}%",
        report.targets_active,
        report.target_memory_bytes / 1024,
        report.target_hit_rate * 100.0
    );
    println!(
        "  device:    {} live targets, {} live materials",
        report.live_targets, report.live_materials
    );
    println!(
        "  submitted: {} command buffers, {} draws, {} blits",
        report.submissions, report.draws, report.blits
    );
}

fn cmd_check(path: &Path) -> Result<()> {
    let scene = SceneFile::load(path)?;
    let renderers = scene.nodes.iter().filter(|n| n.renderer.is_some()).count();
    let widgets = scene.nodes.iter().filter(|n| n.widget.is_some()).count();
    println!(
        "{}: {} nodes, {} widgets, {} renderers",
        path.display(),
        scene.nodes.len(),
        widgets,
        renderers
    );
    Ok(())
}
