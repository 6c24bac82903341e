//! Synthetic multi-material programs.
//!
//! Used by tests, benchmarks and the `sample` command.

use std::f64::consts::PI;
use std::fmt::Write;

use layerbatch_gcode::format_coord;

/// Layer height of generated programs (mm).
pub const LAYER_HEIGHT: f64 = 0.2;

const LINE_WIDTH: f64 = 0.4;
const FILAMENT_DIAMETER: f64 = 1.75;

/// One generated layer: a tool and an extruded path.
///
/// The first point is reached by travel, every following point by an
/// extruding move.
#[derive(Debug, Clone)]
pub struct FixtureLayer {
    /// Tool printing the layer.
    pub tool: u8,
    /// Path points (mm).
    pub path: Vec<(f64, f64)>,
}

impl FixtureLayer {
    /// Layer printing `path` with `tool`.
    pub fn path(tool: u8, path: Vec<(f64, f64)>) -> Self {
        Self { tool, path }
    }

    /// Closed square outline with its lower-left corner at `(x, y)`.
    pub fn square(tool: u8, x: f64, y: f64, size: f64) -> Self {
        Self::path(
            tool,
            vec![
                (x, y),
                (x + size, y),
                (x + size, y + size),
                (x, y + size),
                (x, y),
            ],
        )
    }
}

/// Render layers into a Bambu-style marked program with relative extrusion.
///
/// Layer `k` (1-based) sits at `k * LAYER_HEIGHT`. Every layer selects its
/// tool with a bare `T<n>` right after the layer marker.
pub fn program(layers: &[FixtureLayer]) -> String {
    let area = PI * (FILAMENT_DIAMETER / 2.0).powi(2);
    let e_per_mm = LINE_WIDTH * LAYER_HEIGHT / area;
    let total = layers.len();

    let mut out = String::new();
    out.push_str("; generated by layerbatch\n");
    out.push_str("G21\nG90\nM83\nM104 S220\nG92 E0\n");

    for (i, layer) in layers.iter().enumerate() {
        let z = (i + 1) as f64 * LAYER_HEIGHT;
        let _ = writeln!(out, "; layer num/total_layer_count: {}/{}", i + 1, total);
        let _ = writeln!(out, "T{}", layer.tool);
        let _ = writeln!(out, "G1 Z{} F600", format_coord(z, 3));

        let mut points = layer.path.iter();
        let Some(&(mut px, mut py)) = points.next() else {
            continue;
        };
        let _ = writeln!(
            out,
            "G1 X{} Y{} F9000",
            format_coord(px, 3),
            format_coord(py, 3)
        );
        for &(x, y) in points {
            let length = ((x - px).powi(2) + (y - py).powi(2)).sqrt();
            let _ = writeln!(
                out,
                "G1 X{} Y{} E{} F1800",
                format_coord(x, 3),
                format_coord(y, 3),
                format_coord(length * e_per_mm, 5)
            );
            px = x;
            py = y;
        }
    }

    out.push_str("; MACHINE_END_GCODE_START\n");
    out.push_str("M104 S0\nG91\nG1 Z5 F600\nG90\nM84\n");
    out
}

/// Two tools alternating every layer.
///
/// Odd layers print a 20 mm square with T0, even layers a 10 mm square
/// centred on it with T1. The preamble selects no tool, so the body
/// changes tool once per layer.
pub fn alternating_tools(layers: usize) -> String {
    let layers: Vec<FixtureLayer> = (1..=layers)
        .map(|k| {
            if k % 2 == 1 {
                FixtureLayer::square(0, 10.0, 10.0, 20.0)
            } else {
                FixtureLayer::square(1, 15.0, 15.0, 10.0)
            }
        })
        .collect();
    program(&layers)
}

/// Two objects on one plate, each printed with its own tool on every layer.
///
/// Each layer opens with a layer marker and a `Z_HEIGHT` comment and prints
/// both objects inside `start/stop printing object` markers, with an
/// `M620`/`M621` change sequence between them.
pub fn two_objects(layers: usize) -> String {
    let area = PI * (FILAMENT_DIAMETER / 2.0).powi(2);
    let e_per_mm = LINE_WIDTH * LAYER_HEIGHT / area;
    let edge = 10.0 * e_per_mm;

    let mut out = String::new();
    out.push_str("; generated by layerbatch\n");
    out.push_str("G21\nG90\nM83\nM104 S220\nT0\nG92 E0\n");

    let mut tool = 0u8;
    for k in 1..=layers {
        let z = format_coord(k as f64 * LAYER_HEIGHT, 3);
        let _ = writeln!(out, "; layer num/total_layer_count: {}/{}", k, layers);
        let _ = writeln!(out, "; Z_HEIGHT: {}", z);
        let _ = writeln!(out, "G1 Z{} F600", z);

        // keep the tool loaded at the end of the previous layer first
        let order = if tool == 0 { [0u8, 1] } else { [1, 0] };
        for next in order {
            if next != tool {
                let _ = writeln!(out, "M620 S{}A", next);
                let _ = writeln!(out, "T{}", next);
                out.push_str("G1 E2 F300\n");
                let _ = writeln!(out, "M621 S{}A", next);
                tool = next;
            }
            let x = if next == 0 { 20.0 } else { 60.0 };
            let _ = writeln!(
                out,
                "; start printing object, unique label id: {}",
                100 + next as u32
            );
            let _ = writeln!(out, "G1 X{} Y20 F9000", format_coord(x, 3));
            for (dx, dy) in [(10.0, 0.0), (10.0, 10.0), (0.0, 10.0), (0.0, 0.0)] {
                let _ = writeln!(
                    out,
                    "G1 X{} Y{} E{} F1800",
                    format_coord(x + dx, 3),
                    format_coord(20.0 + dy, 3),
                    format_coord(edge, 5)
                );
            }
            let _ = writeln!(
                out,
                "; stop printing object, unique label id: {}",
                100 + next as u32
            );
        }
    }

    out.push_str("; MACHINE_END_GCODE_START\n");
    out.push_str("M104 S0\nG91\nG1 Z5 F600\nG90\nM84\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use layerbatch_gcode::parse;

    #[test]
    fn test_alternating_tools() {
        let program = parse(&alternating_tools(6));
        assert!(program.warnings.is_empty());
        assert_eq!(program.layers.len(), 6);
        assert_eq!(program.tool_change_count(), 6);
        for (i, layer) in program.layers.iter().enumerate() {
            assert_eq!(layer.tool, Some((i % 2) as u8));
            assert_relative_eq!(layer.z, (i + 1) as f64 * LAYER_HEIGHT);
        }
        assert_eq!(program.postamble.len(), 6);
    }

    #[test]
    fn test_two_objects() {
        let program = parse(&two_objects(3));
        assert!(program.warnings.is_empty());
        assert_eq!(program.layers.len(), 3);
        // the loaded tool prints first, so each layer changes tool once
        assert_eq!(program.tool_change_count(), 3);
        let objects: Vec<Option<&str>> = program.layers[0]
            .segments
            .iter()
            .filter(|s| s.extrusions > 0)
            .map(|s| s.object_id.as_deref())
            .collect();
        assert_eq!(objects, vec![Some("100"), Some("101")]);
    }

    #[test]
    fn test_empty_path_layer() {
        let text = program(&[FixtureLayer::path(0, Vec::new())]);
        let program = parse(&text);
        assert_eq!(program.layers.len(), 1);
        assert_eq!(program.layers[0].segments.iter().map(|s| s.extrusions).sum::<usize>(), 0);
    }
}
