//! Per-tool prime towers.
//!
//! Each tool owns a square tower beside the print. A tool that was dormant
//! for several layers catches its tower up before its next layer visit, so a
//! tower is never more than one tool-change interval behind the print.

use std::collections::BTreeMap;
use std::f64::consts::PI;

use layerbatch_gcode::{Command, Move};
use serde::{Deserialize, Serialize};

use crate::error::{BatchError, Result};

/// Prime tower settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrimeTowerConfig {
    /// Print towers at all.
    pub enabled: bool,
    /// Edge length of one tower (mm).
    pub size: f64,
    /// Gap between neighbouring towers (mm).
    pub spacing: f64,
    /// Wall thickness; the loop count is this divided by the line width.
    pub wall_thickness: f64,
    /// X of tool 0's tower corner (mm).
    pub position_x: f64,
    /// Y of the tower row (mm).
    pub position_y: f64,
    /// Layer height used when a layer has no predecessor (mm).
    pub layer_height: f64,
    /// Line width (mm).
    pub extrusion_width: f64,
    /// Filament diameter (mm).
    pub filament_diameter: f64,
    /// Printing speed (mm/s).
    pub print_speed: f64,
}

impl Default for PrimeTowerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            size: 10.0,
            spacing: 5.0,
            wall_thickness: 0.8,
            position_x: 200.0,
            position_y: 200.0,
            layer_height: 0.2,
            extrusion_width: 0.4,
            filament_diameter: 1.75,
            print_speed: 40.0,
        }
    }
}

impl PrimeTowerConfig {
    /// Validate settings.
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("size", self.size),
            ("wall_thickness", self.wall_thickness),
            ("layer_height", self.layer_height),
            ("extrusion_width", self.extrusion_width),
            ("filament_diameter", self.filament_diameter),
            ("print_speed", self.print_speed),
        ];
        for (name, value) in positive {
            if !(value > 0.0 && value.is_finite()) {
                return Err(BatchError::InvalidSettings(format!(
                    "prime_tower {} must be positive",
                    name
                )));
            }
        }
        if !(self.spacing >= 0.0) {
            return Err(BatchError::InvalidSettings(
                "prime_tower spacing must be zero or positive".into(),
            ));
        }
        Ok(())
    }

    /// Lower-left corner of a tool's tower.
    pub fn position(&self, tool: u8) -> (f64, f64) {
        (
            self.position_x + tool as f64 * (self.size + self.spacing),
            self.position_y,
        )
    }

    /// Number of perimeter loops per layer.
    pub fn loops(&self) -> usize {
        ((self.wall_thickness / self.extrusion_width).round() as usize).max(1)
    }

    /// Filament length per mm of line at `layer_height`.
    pub fn extrusion_per_mm(&self, layer_height: f64) -> f64 {
        let area = PI * (self.filament_diameter / 2.0).powi(2);
        self.extrusion_width * layer_height / area
    }

    /// Perimeter moves for one tower layer, all extruding, relative E.
    ///
    /// The first move of the returned path is a travel to the outer loop's
    /// corner at the current Z; the caller reaches that corner first.
    pub fn layer_moves(&self, tool: u8, layer_height: f64) -> Vec<Command> {
        let (x0, y0) = self.position(tool);
        let e_per_mm = self.extrusion_per_mm(layer_height);
        let feed = self.print_speed * 60.0;
        let mut moves = Vec::new();

        for i in 0..self.loops() {
            let inset = i as f64 * self.extrusion_width;
            let side = self.size - 2.0 * inset;
            if side <= 0.0 {
                break;
            }
            let (x, y) = (x0 + inset, y0 + inset);
            moves.push(Move::new().xy(x, y).build());
            for (cx, cy) in [(x + side, y), (x + side, y + side), (x, y + side), (x, y)] {
                moves.push(
                    Move::new()
                        .xy(cx, cy)
                        .e(side * e_per_mm)
                        .f(feed)
                        .build(),
                );
            }
        }
        moves
    }
}

/// Tower progress per tool, as the last layer index printed.
#[derive(Debug, Clone, Default)]
pub struct TowerProgress {
    printed: BTreeMap<u8, usize>,
}

impl TowerProgress {
    /// Layers the tower of `tool` must print before layer `layer`, inclusive.
    ///
    /// Marks them as printed.
    pub fn catch_up(&mut self, tool: u8, layer: usize) -> std::ops::RangeInclusive<usize> {
        let start = self.printed(tool) + 1;
        if layer >= start {
            self.printed.insert(tool, layer);
        }
        start..=layer
    }

    /// Last tower layer printed for `tool`.
    pub fn printed(&self, tool: u8) -> usize {
        self.printed.get(&tool).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_tower_positions_do_not_overlap() {
        let config = PrimeTowerConfig::default();
        assert_eq!(config.position(0), (200.0, 200.0));
        assert_eq!(config.position(2), (230.0, 200.0));
    }

    #[test]
    fn test_layer_moves() {
        let config = PrimeTowerConfig::default();
        assert_eq!(config.loops(), 2);
        let moves = config.layer_moves(1, 0.2);
        assert_eq!(moves.len(), 10);
        assert!(moves[0].e.is_none());
        assert_relative_eq!(moves[0].x.unwrap(), 215.0);
        assert_relative_eq!(moves[5].x.unwrap(), 215.4);
        let e = moves[1].e.unwrap();
        assert_relative_eq!(e, 10.0 * config.extrusion_per_mm(0.2), epsilon = 1e-5);
        assert!(moves[6].e.unwrap() < e);
    }

    #[test]
    fn test_thin_wall_prints_one_loop() {
        let config = PrimeTowerConfig {
            wall_thickness: 0.1,
            ..Default::default()
        };
        assert_eq!(config.loops(), 1);
    }

    #[test]
    fn test_catch_up() {
        let mut progress = TowerProgress::default();
        assert_eq!(progress.catch_up(0, 1), 1..=1);
        assert_eq!(progress.catch_up(0, 4), 2..=4);
        assert!(progress.catch_up(0, 4).is_empty());
        assert_eq!(progress.catch_up(1, 2), 1..=2);
        assert_eq!(progress.printed(0), 4);
        assert_eq!(progress.printed(3), 0);
    }

    #[test]
    fn test_validate() {
        assert!(PrimeTowerConfig::default().validate().is_ok());
        let bad = PrimeTowerConfig {
            extrusion_width: 0.0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }
}
