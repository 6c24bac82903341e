//! layerbatch CLI - multi-material tool-change batching
//!
//! Reorders the layers of a sliced multi-material G-code file so each tool
//! prints several layers per change.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use layerbatch::{fixture, optimize_file, write_atomic, BatchSettings, Optimized};
use layerbatch_gcode::{parse, ParsedProgram, ToolChangeFlavor};
use serde::Serialize;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "layerbatch")]
#[command(about = "Batch tool changes in multi-material G-code", long_about = None)]
struct Cli {
    /// More log output (-v for debug, -vv for trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Only log errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Reorder a G-code file into tool batches
    Batch {
        /// Input G-code file
        input: PathBuf,
        /// Output G-code file
        output: PathBuf,
        #[command(flatten)]
        settings: SettingsArgs,
        /// Print statistics as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show the structure of a G-code file
    Inspect {
        /// Input G-code file
        input: PathBuf,
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Write a sample program that alternates tools every layer
    Sample {
        /// Output G-code file
        output: PathBuf,
        /// Number of layers
        #[arg(short, long, default_value_t = 20)]
        layers: usize,
    },
}

/// Settings file plus per-flag overrides.
#[derive(Args, Debug, Default)]
struct SettingsArgs {
    /// TOML settings file
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Maximum layers per batch
    #[arg(long)]
    max_batch: Option<usize>,
    /// Nozzle tip diameter (mm)
    #[arg(long)]
    nozzle_diameter: Option<f64>,
    /// Included nozzle cone angle (degrees)
    #[arg(long)]
    cone_angle: Option<f64>,
    /// Clearance added to the nozzle radius (mm)
    #[arg(long)]
    safety_margin: Option<f64>,
    /// Z hop height (mm)
    #[arg(long)]
    zhop: Option<f64>,
    /// Skip prime towers
    #[arg(long)]
    no_prime_tower: bool,
    /// Tool-change flavor (bambu, generic)
    #[arg(long)]
    flavor: Option<ToolChangeFlavor>,
}

impl SettingsArgs {
    fn load(&self) -> Result<BatchSettings> {
        let mut settings = match &self.config {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("reading {}", path.display()))?;
                toml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?
            }
            None => BatchSettings::default(),
        };

        if let Some(layers) = self.max_batch {
            settings.max_batch_layers = layers;
        }
        if let Some(diameter) = self.nozzle_diameter {
            settings.nozzle.tip_diameter = diameter;
        }
        if let Some(angle) = self.cone_angle {
            settings.nozzle.cone_angle = angle;
        }
        if let Some(margin) = self.safety_margin {
            settings.collision.safety_margin = margin;
        }
        if let Some(height) = self.zhop {
            settings.zhop.height = height;
        }
        if self.no_prime_tower {
            settings.prime_tower.enabled = false;
        }
        if let Some(flavor) = self.flavor {
            settings.tool_change.flavor = flavor;
        }

        settings.validate().context("invalid settings")?;
        Ok(settings)
    }
}

/// Structure report for `inspect`.
#[derive(Debug, Serialize)]
struct Inspection {
    detection: String,
    layers: usize,
    segments: usize,
    tools: Vec<u8>,
    objects: Vec<String>,
    tool_changes: usize,
    min_z: Option<f64>,
    max_z: Option<f64>,
    min_xy: Option<[f64; 2]>,
    max_xy: Option<[f64; 2]>,
    warnings: Vec<String>,
}

impl Inspection {
    fn of(program: &ParsedProgram) -> Self {
        let objects: BTreeSet<String> = program
            .segments()
            .filter_map(|(_, s)| s.object_id.clone())
            .collect();
        let zs = program.layers.iter().map(|l| l.z);
        let extent = program
            .layers
            .iter()
            .filter_map(|l| l.bounds())
            .reduce(|mut all, b| {
                all.include(b.min[0], b.min[1]);
                all.include(b.max[0], b.max[1]);
                all
            });
        Self {
            detection: format!("{:?}", program.detection),
            layers: program.layers.len(),
            segments: program.segments().count(),
            tools: program.tools().into_iter().collect(),
            objects: objects.into_iter().collect(),
            tool_changes: program.tool_change_count(),
            min_z: zs.clone().reduce(f64::min),
            max_z: zs.reduce(f64::max),
            min_xy: extent.map(|b| b.min),
            max_xy: extent.map(|b| b.max),
            warnings: program.warnings.iter().map(|w| w.to_string()).collect(),
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = match (cli.quiet, cli.verbose) {
        (true, _) => Level::ERROR,
        (false, 0) => Level::INFO,
        (false, 1) => Level::DEBUG,
        (false, _) => Level::TRACE,
    };
    tracing::subscriber::set_global_default(
        FmtSubscriber::builder()
            .with_max_level(level)
            .with_writer(std::io::stderr)
            .finish(),
    )?;

    match cli.command {
        Commands::Batch {
            input,
            output,
            settings,
            json,
        } => {
            let settings = settings.load()?;
            let result = batch(&input, &output, &settings)?;
            report(&result, json)?;
        }
        Commands::Inspect { input, json } => {
            inspect(&input, json)?;
        }
        Commands::Sample { output, layers } => {
            write_atomic(&output, &fixture::alternating_tools(layers))
                .with_context(|| format!("writing {}", output.display()))?;
            println!("Wrote {} layers to {}", layers, output.display());
        }
    }

    Ok(())
}

fn batch(input: &Path, output: &Path, settings: &BatchSettings) -> Result<Optimized> {
    info!(input = %input.display(), output = %output.display(), "batching");
    optimize_file(input, output, settings).with_context(|| {
        format!(
            "batching {} into {}",
            input.display(),
            output.display()
        )
    })
}

fn report(result: &Optimized, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(&result.stats)?);
        return Ok(());
    }

    for warning in &result.warnings {
        eprintln!("warning: {}", warning);
    }
    let stats = &result.stats;
    println!("Layers:       {}", stats.layers);
    println!("Segments:     {} ({} units)", stats.segments, stats.units);
    println!("Batches:      {} ({} layer visits)", stats.batches, stats.visits);
    println!(
        "Tool changes: {} -> {}",
        stats.tool_changes_before, stats.tool_changes_after
    );
    println!("Tower layers: {}", stats.tower_layers);
    println!("Z hops:       {}", stats.hops);
    Ok(())
}

fn inspect(input: &Path, json: bool) -> Result<()> {
    let text =
        std::fs::read_to_string(input).with_context(|| format!("reading {}", input.display()))?;
    let program = parse(&text);
    let inspection = Inspection::of(&program);

    if json {
        println!("{}", serde_json::to_string_pretty(&inspection)?);
        return Ok(());
    }

    println!("File: {}", input.display());
    println!("Layer detection: {}", inspection.detection);
    println!("Layers: {}", inspection.layers);
    if let (Some(min), Some(max)) = (inspection.min_z, inspection.max_z) {
        println!("Z range: {:.3} - {:.3} mm", min, max);
    }
    if let (Some(min), Some(max)) = (inspection.min_xy, inspection.max_xy) {
        println!(
            "XY extent: ({:.3}, {:.3}) - ({:.3}, {:.3}) mm",
            min[0], min[1], max[0], max[1]
        );
    }
    println!("Segments: {}", inspection.segments);
    println!("Tools: {:?}", inspection.tools);
    if !inspection.objects.is_empty() {
        println!("Objects: {}", inspection.objects.join(", "));
    }
    println!("Tool changes: {}", inspection.tool_changes);
    for warning in &inspection.warnings {
        println!("warning: {}", warning);
    }
    Ok(())
}
