//! Discretized occupancy of deposited material.
//!
//! Every extruding move endpoint is bucketed into a square 2-D cell. The
//! index is built once per batching run and only read afterwards.

use std::collections::{BTreeMap, HashSet};

use layerbatch_gcode::{Bounds, Layer, ParsedProgram, Segment, SegmentId};
use rayon::prelude::*;
use tracing::debug;

/// Integer cell coordinates.
pub type Cell = (i64, i64);

/// Occupied cells of one segment.
#[derive(Debug, Clone, Default)]
pub struct SegmentGeometry {
    /// Occupied cells.
    pub cells: HashSet<Cell>,
    /// Bounding box of the extrusion endpoints.
    pub bounds: Option<Bounds>,
    /// Z height of the segment (mm).
    pub z: f64,
}

impl SegmentGeometry {
    /// Whether nothing was deposited.
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

/// Per-segment occupancy grid.
#[derive(Debug, Clone)]
pub struct GeometryIndex {
    cell_size: f64,
    segments: BTreeMap<SegmentId, SegmentGeometry>,
}

impl GeometryIndex {
    /// Build the index for every segment of `program`, one layer per task.
    pub fn build(program: &ParsedProgram, cell_size: f64) -> Self {
        let segments: BTreeMap<SegmentId, SegmentGeometry> = program
            .layers
            .par_iter()
            .flat_map_iter(|layer| {
                layer
                    .segments
                    .iter()
                    .map(move |seg| (seg.id, segment_geometry(layer, seg, cell_size)))
            })
            .collect();

        debug!(
            segments = segments.len(),
            cells = segments.values().map(|g| g.cells.len()).sum::<usize>(),
            cell_size,
            "built geometry index"
        );
        Self {
            cell_size,
            segments,
        }
    }

    /// Edge length of a cell (mm).
    pub fn cell_size(&self) -> f64 {
        self.cell_size
    }

    /// Geometry of a segment, if indexed.
    pub fn get(&self, id: SegmentId) -> Option<&SegmentGeometry> {
        self.segments.get(&id)
    }

}

fn cell_of(x: f64, y: f64, cell_size: f64) -> Cell {
    ((x / cell_size).floor() as i64, (y / cell_size).floor() as i64)
}

/// Replay a segment from its entry state and collect its extrusion endpoints.
fn segment_geometry(layer: &Layer, seg: &Segment, cell_size: f64) -> SegmentGeometry {
    let mut state = seg.entry;
    let mut geometry = SegmentGeometry {
        z: seg.z,
        ..Default::default()
    };

    for cmd in seg.commands(layer) {
        let delta = state.apply(cmd);
        if delta <= 0.0 || !cmd.is_motion() || cmd.in_tool_change {
            continue;
        }
        geometry.cells.insert(cell_of(state.x, state.y, cell_size));
        match geometry.bounds.as_mut() {
            Some(b) => b.include(state.x, state.y),
            None => geometry.bounds = Some(Bounds::point(state.x, state.y)),
        }
    }
    geometry
}
