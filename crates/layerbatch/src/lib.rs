#![warn(missing_docs)]

//! Tool-change batching for multi-material G-code.
//!
//! Reorders the layers of a multi-material print so that each tool prints
//! several consecutive layers before the next change, as long as the nozzle
//! can still reach every deferred layer without hitting material printed
//! above it.
//!
//! # Example
//!
//! ```
//! use layerbatch::{fixture, optimize, BatchSettings};
//!
//! let input = fixture::alternating_tools(20);
//! let result = optimize(&input, &BatchSettings::default())?;
//!
//! assert_eq!(result.stats.tool_changes_before, 20);
//! assert_eq!(result.stats.tool_changes_after, 2);
//! # Ok::<(), layerbatch::BatchError>(())
//! ```

pub mod collision;
pub mod error;
pub mod fixture;
pub mod geometry;
pub mod nozzle;
pub mod schedule;
pub mod synth;

pub use collision::{CollisionEngine, CollisionResult, CollisionSettings};
pub use error::{BatchError, Result};
pub use geometry::{Cell, GeometryIndex, SegmentGeometry};
pub use nozzle::NozzleGeometry;
pub use schedule::{units, BatchPlan, LayerBatch, Scheduler, Unit};
pub use synth::{
    synthesize, PrimeTowerConfig, SynthConfig, SynthStats, Synthesized, ToolChangeConfig,
    ZHopConfig,
};

use std::io::Write;
use std::path::Path;

use layerbatch_gcode::{count_tool_changes, parse, Emitter, ParseWarning, ParsedProgram};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Batching parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchSettings {
    /// Nozzle profile.
    pub nozzle: NozzleGeometry,
    /// Collision check parameters.
    pub collision: CollisionSettings,
    /// Maximum distinct layers per batch.
    pub max_batch_layers: usize,
    /// Travel between layer visits.
    pub zhop: ZHopConfig,
    /// Prime towers.
    pub prime_tower: PrimeTowerConfig,
    /// Tool-change blocks.
    pub tool_change: ToolChangeConfig,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            nozzle: NozzleGeometry::default(),
            collision: CollisionSettings::default(),
            max_batch_layers: 10,
            zhop: ZHopConfig::default(),
            prime_tower: PrimeTowerConfig::default(),
            tool_change: ToolChangeConfig::default(),
        }
    }
}

impl BatchSettings {
    /// Validate settings.
    pub fn validate(&self) -> Result<()> {
        if self.max_batch_layers == 0 {
            return Err(BatchError::InvalidSettings(
                "max_batch_layers must be at least 1".into(),
            ));
        }
        self.nozzle.validate()?;
        self.collision.validate()?;
        self.zhop.validate()?;
        if self.prime_tower.enabled {
            self.prime_tower.validate()?;
        }
        self.tool_change.validate()?;
        Ok(())
    }
}

/// Statistics about one batching run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanStats {
    /// Layers in the input.
    pub layers: usize,
    /// Segments in the input.
    pub segments: usize,
    /// Scheduling units.
    pub units: usize,
    /// Batches in the plan.
    pub batches: usize,
    /// Layer visits written.
    pub visits: usize,
    /// Tool changes in the input body.
    pub tool_changes_before: usize,
    /// Tool changes in the output body.
    pub tool_changes_after: usize,
    /// Prime tower layers written.
    pub tower_layers: usize,
    /// Travels wrapped in a Z hop.
    pub hops: usize,
    /// Structural warnings raised while parsing.
    pub warnings: usize,
}

/// Result of batching a program.
#[derive(Debug, Clone)]
pub struct Optimized {
    /// Output G-code.
    pub gcode: String,
    /// Plan that produced it.
    pub plan: BatchPlan,
    /// Statistics.
    pub stats: PlanStats,
    /// Structural warnings raised while parsing.
    pub warnings: Vec<ParseWarning>,
}

/// Batch a G-code program.
///
/// Parses `text`, schedules tool batches under the collision constraints in
/// `settings` and writes the reordered program.
pub fn optimize(text: &str, settings: &BatchSettings) -> Result<Optimized> {
    settings.validate()?;
    let program = parse(text);
    optimize_program(&program, settings)
}

/// Batch an already parsed program.
pub fn optimize_program(program: &ParsedProgram, settings: &BatchSettings) -> Result<Optimized> {
    settings.validate()?;
    let initial = program.preamble_state().tool;

    let engine = CollisionEngine::new(program, settings.nozzle, settings.collision);
    let plan = Scheduler::new(&engine, settings.max_batch_layers).schedule(initial);
    let synthesized = synthesize(
        program,
        &plan,
        SynthConfig {
            zhop: &settings.zhop,
            prime_tower: &settings.prime_tower,
            tool_change: &settings.tool_change,
        },
    )?;

    let mut out = Emitter::new(program.line_ending);
    out.push_all(&program.preamble);
    out.push_all(&synthesized.body);
    out.push_all(&program.postamble);
    let gcode = out.finish();

    let stats = PlanStats {
        layers: program.layers.len(),
        segments: program.segments().count(),
        units: units(program).len(),
        batches: plan.batches.len(),
        visits: synthesized.stats.visits,
        tool_changes_before: program.tool_change_count(),
        tool_changes_after: count_tool_changes(initial, &synthesized.body),
        tower_layers: synthesized.stats.tower_layers,
        hops: synthesized.stats.hops,
        warnings: program.warnings.len(),
    };
    info!(
        layers = stats.layers,
        batches = stats.batches,
        before = stats.tool_changes_before,
        after = stats.tool_changes_after,
        "batched"
    );

    Ok(Optimized {
        gcode,
        plan,
        stats,
        warnings: program.warnings.clone(),
    })
}

/// Batch `input` into `output`.
///
/// The output is written to a temporary file next to it and renamed into
/// place, so a failed run leaves no partial file.
pub fn optimize_file(input: &Path, output: &Path, settings: &BatchSettings) -> Result<Optimized> {
    let text = std::fs::read_to_string(input)?;
    let result = optimize(&text, settings)?;
    write_atomic(output, &result.gcode)?;
    Ok(result)
}

/// Write `contents` to `path` through a temporary file in the same directory.
pub fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut file = tempfile::NamedTempFile::new_in(dir)?;
    file.write_all(contents.as_bytes())?;
    file.flush()?;
    file.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alternating_tools() {
        let input = fixture::alternating_tools(20);
        let result = optimize(&input, &BatchSettings::default()).unwrap();
        assert_eq!(result.stats.layers, 20);
        assert_eq!(result.stats.batches, 2);
        assert_eq!(result.stats.tool_changes_before, 20);
        assert_eq!(result.stats.tool_changes_after, 2);
        assert!(result.gcode.ends_with("M84\n"));
    }

    #[test]
    fn test_invalid_settings() {
        let settings = BatchSettings {
            max_batch_layers: 0,
            ..Default::default()
        };
        assert!(settings.validate().is_err());

        let settings = BatchSettings {
            nozzle: NozzleGeometry::with_tip(-0.4),
            ..Default::default()
        };
        assert!(optimize("", &settings).is_err());
    }

    #[test]
    fn test_disabled_tower_is_not_validated() {
        let settings = BatchSettings {
            prime_tower: PrimeTowerConfig {
                enabled: false,
                size: 0.0,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_program_without_layers_passes_through() {
        let input = "G28\nM104 S200\n";
        let result = optimize(input, &BatchSettings::default()).unwrap();
        assert_eq!(result.gcode, input);
        assert!(result.plan.batches.is_empty());
    }

    #[test]
    fn test_crlf_preserved() {
        let input = fixture::alternating_tools(4).replace('\n', "\r\n");
        let result = optimize(&input, &BatchSettings::default()).unwrap();
        assert!(result.gcode.contains("\r\n"));
        assert!(!result.gcode.replace("\r\n", "").contains('\n'));
    }
}
