//! Nozzle collision checks between segments.
//!
//! Batching prints a segment before other-tool segments underneath it that
//! are deferred. When a deferred segment is printed later, the nozzle cone
//! reaches up to the material already laid above it; the check asks whether
//! that material lies within the cone's radius at the vertical gap.

use layerbatch_gcode::{ParsedProgram, SegmentId};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{BatchError, Result};
use crate::geometry::{Cell, GeometryIndex, SegmentGeometry};
use crate::nozzle::NozzleGeometry;

/// Smallest accepted occupancy cell edge (mm).
pub const MIN_CELL_SIZE: f64 = 0.01;

/// Collision check parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollisionSettings {
    /// Clearance added to the nozzle radius (mm).
    pub safety_margin: f64,
    /// Edge length of occupancy cells (mm).
    pub cell_size: f64,
}

impl Default for CollisionSettings {
    fn default() -> Self {
        Self {
            safety_margin: 1.0,
            cell_size: 0.5,
        }
    }
}

impl CollisionSettings {
    /// Validate settings.
    pub fn validate(&self) -> Result<()> {
        if !(self.safety_margin >= 0.0 && self.safety_margin.is_finite()) {
            return Err(BatchError::InvalidSettings(
                "safety_margin must be zero or positive".into(),
            ));
        }
        if !(self.cell_size >= MIN_CELL_SIZE && self.cell_size.is_finite()) {
            return Err(BatchError::InvalidSettings(format!(
                "cell_size must be at least {} mm",
                MIN_CELL_SIZE
            )));
        }
        Ok(())
    }
}

/// Result of a proximity check.
#[derive(Debug, Clone, PartialEq)]
pub struct CollisionResult {
    /// Whether the segments are too close.
    pub collides: bool,
    /// Offending cells (printing, existing), if a collision was found.
    pub cells: Option<(Cell, Cell)>,
    /// Safety radius used (mm).
    pub radius: f64,
}

impl CollisionResult {
    /// No collision.
    pub fn clear(radius: f64) -> Self {
        Self {
            collides: false,
            cells: None,
            radius,
        }
    }

    /// Collision between two cells.
    pub fn collision(printing: Cell, existing: Cell, radius: f64) -> Self {
        Self {
            collides: true,
            cells: Some((printing, existing)),
            radius,
        }
    }

    /// Collision that could not be localized.
    fn unresolved(radius: f64) -> Self {
        Self {
            collides: true,
            cells: None,
            radius,
        }
    }
}

/// Collision oracle over one parsed program.
pub struct CollisionEngine<'a> {
    program: &'a ParsedProgram,
    index: GeometryIndex,
    nozzle: NozzleGeometry,
    settings: CollisionSettings,
}

impl<'a> CollisionEngine<'a> {
    /// Build the geometry index for `program`.
    pub fn new(
        program: &'a ParsedProgram,
        nozzle: NozzleGeometry,
        settings: CollisionSettings,
    ) -> Self {
        let index = GeometryIndex::build(program, settings.cell_size);
        Self {
            program,
            index,
            nozzle,
            settings,
        }
    }

    /// The program being checked.
    pub fn program(&self) -> &'a ParsedProgram {
        self.program
    }

    /// Tool of a segment.
    pub fn tool(&self, id: SegmentId) -> Option<u8> {
        self.program.segment(id).and_then(|(_, s)| s.tool)
    }

    /// Safety radius for a vertical gap of `dz`.
    pub fn safety_radius(&self, dz: f64) -> f64 {
        self.nozzle.radius_at(dz.abs()) + self.settings.safety_margin
    }

    /// Check `printing` against `existing`.
    ///
    /// A segment missing from the index has no geometry and never collides.
    /// A radius that is not finite is treated as a collision.
    pub fn check(&self, printing: SegmentId, existing: SegmentId) -> CollisionResult {
        let (Some(p), Some(e)) = (self.index.get(printing), self.index.get(existing)) else {
            return CollisionResult::clear(0.0);
        };
        let radius = self.safety_radius(p.z - e.z);
        if !radius.is_finite() {
            return CollisionResult::unresolved(radius);
        }
        if p.is_empty() || e.is_empty() {
            return CollisionResult::clear(radius);
        }
        if let (Some(pb), Some(eb)) = (p.bounds, e.bounds) {
            if !pb.expanded(radius).intersects(&eb) {
                return CollisionResult::clear(radius);
            }
        }
        self.narrow_phase(p, e, radius)
    }

    fn narrow_phase(
        &self,
        printing: &SegmentGeometry,
        existing: &SegmentGeometry,
        radius: f64,
    ) -> CollisionResult {
        let cell = self.index.cell_size();
        // saturates for huge radii
        let reach = (radius / cell).ceil() as i64;
        let within = |a: Cell, b: Cell| {
            let (dx, dy) = (a.0.abs_diff(b.0), a.1.abs_diff(b.1));
            dx <= reach.unsigned_abs()
                && dy <= reach.unsigned_abs()
                && (dx as f64).hypot(dy as f64) * cell <= radius
        };

        // cells in the square window around one printing cell
        let window = reach
            .checked_mul(2)
            .and_then(|w| w.checked_add(1))
            .and_then(|w| w.checked_mul(w));
        let scan_window = window.is_some_and(|w| (existing.cells.len() as i64) > w);

        for &p in &printing.cells {
            if scan_window {
                for dx in -reach..=reach {
                    for dy in -reach..=reach {
                        let e = (p.0.saturating_add(dx), p.1.saturating_add(dy));
                        if existing.cells.contains(&e) && within(p, e) {
                            return CollisionResult::collision(p, e, radius);
                        }
                    }
                }
            } else if let Some(&e) = existing.cells.iter().find(|&&e| within(p, e)) {
                return CollisionResult::collision(p, e, radius);
            }
        }
        CollisionResult::clear(radius)
    }

    /// Whether printing `printing` now leaves `existing` unreachable later.
    pub fn too_close(&self, printing: SegmentId, existing: SegmentId) -> bool {
        self.check(printing, existing).collides
    }

    /// Whether `b` may join a batch started at `a`.
    ///
    /// `pending` holds every unprinted segment in original order. Segments
    /// printed in the batch before `b` are the same-tool segments between
    /// `a` and `b`; every other pending segment before `b` is deferred and
    /// must stay reachable.
    pub fn can_batch(&self, a: SegmentId, b: SegmentId, pending: &[SegmentId]) -> bool {
        let tool = self.tool(a);
        for &other in pending.iter().take_while(|&&p| p < b) {
            if other == a || (other > a && self.tool(other) == tool) {
                continue;
            }
            let result = self.check(b, other);
            if result.collides {
                debug!(
                    start = %a,
                    candidate = %b,
                    blocker = %other,
                    radius = result.radius,
                    "batch blocked"
                );
                return false;
            }
        }
        true
    }

    /// Segments of a batch started at `start`, in original order.
    ///
    /// Walks forward over `pending`, skipping other tools, and adds same-tool
    /// candidates while [`can_batch`](Self::can_batch) holds. Stops at the
    /// first violation or when a candidate would exceed `cap` distinct
    /// layers.
    pub fn extend_batch(
        &self,
        start: SegmentId,
        pending: &[SegmentId],
        cap: usize,
    ) -> Vec<SegmentId> {
        let tool = self.tool(start);
        let mut members = vec![start];
        let mut layers = 1;
        let mut last_layer = start.layer;

        for &candidate in pending.iter().filter(|&&p| p > start) {
            if self.tool(candidate) != tool {
                continue;
            }
            let new_layer = candidate.layer != last_layer;
            if new_layer && layers >= cap {
                break;
            }
            if !self.can_batch(start, candidate, pending) {
                break;
            }
            members.push(candidate);
            if new_layer {
                layers += 1;
                last_layer = candidate.layer;
            }
        }
        members
    }

    /// Number of distinct layers a batch started at `start` can cover.
    pub fn max_batch_size(&self, start: SegmentId, pending: &[SegmentId], cap: usize) -> usize {
        let members = self.extend_batch(start, pending, cap);
        let mut layers: Vec<usize> = members.iter().map(|id| id.layer).collect();
        layers.dedup();
        layers.len()
    }
}
