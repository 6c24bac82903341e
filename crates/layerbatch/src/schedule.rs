//! Greedy tool batching.
//!
//! Segments that deposit nothing (layer markers, Z moves, bare change
//! sequences) are not scheduled on their own: they ride with the next
//! extruding segment of their layer, or the last one if none follows. The
//! remaining units are batched per tool across layers while the collision
//! engine allows it.
//!
//! Every batch starts at the earliest pending unit. Batch starts therefore
//! move forward through the original order, so the tools of consecutive
//! batches are a subsequence of the original tool sequence and the output
//! never changes tool more often than the input. When a batch closes at the
//! cap, the next batch belongs to whichever tool the original program
//! printed next, so tools interleave in runs of at most `cap` layers
//! wherever the input interleaves them.

use std::collections::{BTreeMap, BTreeSet};

use layerbatch_gcode::{ParsedProgram, SegmentId};
use tracing::{debug, info};

use crate::collision::CollisionEngine;

/// Segments scheduled together: one extruding anchor and the non-extruding
/// segments around it in the same layer.
#[derive(Debug, Clone, PartialEq)]
pub struct Unit {
    /// Segment whose geometry and tool stand for the unit.
    pub anchor: SegmentId,
    /// All segments of the unit, in original order.
    pub members: Vec<SegmentId>,
    /// Tool of the anchor.
    pub tool: Option<u8>,
}

/// Group the segments of `program` into scheduling units.
pub fn units(program: &ParsedProgram) -> Vec<Unit> {
    let mut units = Vec::new();
    for layer in &program.layers {
        let first = units.len();
        let mut carried: Vec<SegmentId> = Vec::new();
        for seg in &layer.segments {
            carried.push(seg.id);
            if seg.extrusions > 0 {
                units.push(Unit {
                    anchor: seg.id,
                    members: std::mem::take(&mut carried),
                    tool: seg.tool,
                });
            }
        }
        if carried.is_empty() {
            continue;
        }
        if units.len() > first {
            if let Some(last) = units.last_mut() {
                last.members.extend(carried);
            }
        } else if let Some(&anchor) = carried.first() {
            let tool = program.segment(anchor).and_then(|(_, s)| s.tool);
            units.push(Unit {
                anchor,
                members: carried,
                tool,
            });
        }
    }
    units
}

/// Segments printed consecutively with one tool.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerBatch {
    /// Tool printing the batch.
    pub tool: Option<u8>,
    /// Lowest layer index.
    pub first_layer: usize,
    /// Highest layer index.
    pub last_layer: usize,
    /// Segments in original order.
    pub members: Vec<SegmentId>,
}

impl LayerBatch {
    fn new(tool: Option<u8>, mut members: Vec<SegmentId>) -> Self {
        members.sort();
        let first_layer = members.first().map_or(0, |id| id.layer);
        let last_layer = members.last().map_or(0, |id| id.layer);
        Self {
            tool,
            first_layer,
            last_layer,
            members,
        }
    }

    /// Runs of members on the same layer, as `(layer, segments)`.
    pub fn visits(&self) -> impl Iterator<Item = (usize, &[SegmentId])> + '_ {
        self.members
            .chunk_by(|a, b| a.layer == b.layer)
            .map(|run| (run[0].layer, run))
    }

    /// Number of distinct layers.
    pub fn layer_count(&self) -> usize {
        self.visits().count()
    }
}

/// Ordered batches covering every segment once.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchPlan {
    /// Batches in print order.
    pub batches: Vec<LayerBatch>,
}

impl BatchPlan {
    /// Number of scheduled segments.
    pub fn segment_count(&self) -> usize {
        self.batches.iter().map(|b| b.members.len()).sum()
    }

    /// Number of layer visits over all batches.
    pub fn visit_count(&self) -> usize {
        self.batches.iter().map(|b| b.layer_count()).sum()
    }

    /// Number of batch boundaries that switch tool, starting from `initial`.
    pub fn tool_switches(&self, initial: Option<u8>) -> usize {
        let mut active = initial;
        let mut switches = 0;
        for batch in &self.batches {
            if batch.tool.is_some() && batch.tool != active {
                switches += 1;
                active = batch.tool;
            }
        }
        switches
    }

    /// Whether every segment of `program` appears exactly once.
    pub fn is_partition_of(&self, program: &ParsedProgram) -> bool {
        let mut seen = BTreeSet::new();
        for id in self.batches.iter().flat_map(|b| &b.members) {
            if !seen.insert(*id) {
                return false;
            }
        }
        seen.len() == program.segments().count()
            && program.segments().all(|(_, s)| seen.contains(&s.id))
    }
}

/// Greedy batch scheduler.
pub struct Scheduler<'e, 'p> {
    engine: &'e CollisionEngine<'p>,
    max_batch_layers: usize,
}

impl<'e, 'p> Scheduler<'e, 'p> {
    /// Scheduler with a cap on distinct layers per batch.
    pub fn new(engine: &'e CollisionEngine<'p>, max_batch_layers: usize) -> Self {
        Self {
            engine,
            max_batch_layers: max_batch_layers.max(1),
        }
    }

    /// Plan batches, starting with `initial` loaded.
    ///
    /// The result does not depend on thread scheduling.
    pub fn schedule(&self, initial: Option<u8>) -> BatchPlan {
        let units = units(self.engine.program());
        let by_anchor: BTreeMap<SegmentId, &Unit> = units.iter().map(|u| (u.anchor, u)).collect();
        let mut pending: Vec<SegmentId> = units.iter().map(|u| u.anchor).collect();
        let mut plan = BatchPlan::default();

        // nothing pending precedes the earliest unit, so it is always clear
        while let Some(&start) = pending.first() {
            let anchors = self
                .engine
                .extend_batch(start, &pending, self.max_batch_layers);
            let tool = by_anchor.get(&start).and_then(|u| u.tool);

            let taken: BTreeSet<SegmentId> = anchors.iter().copied().collect();
            pending.retain(|id| !taken.contains(id));

            let members: Vec<SegmentId> = anchors
                .iter()
                .filter_map(|a| by_anchor.get(a))
                .flat_map(|u| u.members.iter().copied())
                .collect();
            let batch = LayerBatch::new(tool, members);
            debug!(
                tool = ?batch.tool,
                first = batch.first_layer,
                last = batch.last_layer,
                units = anchors.len(),
                "batch"
            );
            plan.batches.push(batch);
        }

        info!(
            units = units.len(),
            batches = plan.batches.len(),
            switches = plan.tool_switches(initial),
            "scheduled"
        );
        plan
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collision::CollisionSettings;
    use crate::fixture::{self, FixtureLayer};
    use crate::nozzle::NozzleGeometry;
    use layerbatch_gcode::parse;

    fn batches_for(text: &str, cap: usize) -> (ParsedProgram, BatchPlan) {
        let program = parse(text);
        let plan = {
            let engine = CollisionEngine::new(
                &program,
                NozzleGeometry::default(),
                CollisionSettings::default(),
            );
            Scheduler::new(&engine, cap).schedule(program.preamble_state().tool)
        };
        (program, plan)
    }

    #[test]
    fn test_units_attach_markers_forward() {
        let program = parse(&fixture::alternating_tools(3));
        let units = units(&program);
        assert_eq!(units.len(), 3);
        for (i, unit) in units.iter().enumerate() {
            assert_eq!(unit.anchor.layer, i + 1);
            assert_eq!(unit.anchor.ordinal, 1);
            assert_eq!(unit.members.len(), 2);
            assert_eq!(unit.tool, Some((i % 2) as u8));
        }
    }

    #[test]
    fn test_units_attach_trailing_segments_backward() {
        let program = parse(
            "M83\n\
             ; layer num/total_layer_count: 1/1\n\
             T0\n\
             G1 Z0.2\n\
             ; start printing object, unique label id: 7\n\
             G1 X0 Y0\n\
             G1 X5 Y0 E1\n\
             ; stop printing object, unique label id: 7\n\
             G1 Z0.6\n",
        );
        assert_eq!(program.layers[0].segments.len(), 4);
        let units = units(&program);
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].anchor.ordinal, 2);
        assert_eq!(units[0].members.len(), 4);
        assert_eq!(units[0].tool, Some(0));
    }

    #[test]
    fn test_units_cover_two_objects() {
        let program = parse(&fixture::two_objects(2));
        let units = units(&program);
        assert_eq!(units.len(), 4);
        let covered: usize = units.iter().map(|u| u.members.len()).sum();
        assert_eq!(covered, program.segments().count());
        let tools: Vec<Option<u8>> = units.iter().map(|u| u.tool).collect();
        assert_eq!(tools, vec![Some(0), Some(1), Some(1), Some(0)]);
    }

    #[test]
    fn test_alternating_tools_two_batches() {
        let (program, plan) = batches_for(&fixture::alternating_tools(20), 10);
        assert_eq!(plan.batches.len(), 2);
        assert_eq!(plan.batches[0].tool, Some(0));
        assert_eq!(plan.batches[1].tool, Some(1));
        assert_eq!(plan.batches[0].layer_count(), 10);
        assert_eq!((plan.batches[1].first_layer, plan.batches[1].last_layer), (2, 20));
        assert_eq!(plan.tool_switches(None), 2);
        assert!(plan.is_partition_of(&program));
    }

    #[test]
    fn test_cap_bounds_same_tool_runs() {
        let (program, plan) = batches_for(&fixture::alternating_tools(20), 3);
        assert!(plan.is_partition_of(&program));
        let tools: Vec<Option<u8>> = plan.batches.iter().map(|b| b.tool).collect();
        assert_eq!(tools.len(), 8);
        assert!(tools.windows(2).all(|w| w[0] != w[1]));

        // consecutive layers printed by one tool without a change
        let mut run = 0;
        let mut previous = None;
        for batch in &plan.batches {
            if batch.tool != previous {
                run = 0;
                previous = batch.tool;
            }
            run += batch.layer_count();
            assert!(run <= 3, "{} layers of {:?} in a row", run, batch.tool);
        }
        assert_eq!(plan.tool_switches(None), 8);
    }

    #[test]
    fn test_never_more_switches_than_input() {
        let mut blocks: Vec<FixtureLayer> = Vec::new();
        for tool in [0, 0, 0, 0, 0, 1, 1, 1, 1, 1, 0, 1] {
            blocks.push(FixtureLayer::square(tool, 40.0 * tool as f64, 0.0, 5.0));
        }
        let inputs = [
            fixture::alternating_tools(20),
            fixture::two_objects(8),
            fixture::program(&blocks),
        ];
        for text in &inputs {
            let program = parse(text);
            for cap in [1, 2, 3, 10] {
                let (_, plan) = batches_for(text, cap);
                assert!(plan.is_partition_of(&program));
                assert!(
                    plan.tool_switches(program.preamble_state().tool)
                        <= program.tool_change_count(),
                    "cap {}",
                    cap
                );
            }
        }
    }

    #[test]
    fn test_input_runs_keep_their_order() {
        let layers: Vec<FixtureLayer> = [0, 0, 0, 0, 1, 1, 1, 1]
            .iter()
            .map(|&tool| FixtureLayer::square(tool, 40.0 * tool as f64, 0.0, 5.0))
            .collect();
        let (program, plan) = batches_for(&fixture::program(&layers), 2);
        let layers: Vec<(Option<u8>, usize, usize)> = plan
            .batches
            .iter()
            .map(|b| (b.tool, b.first_layer, b.last_layer))
            .collect();
        assert_eq!(
            layers,
            vec![(Some(0), 1, 2), (Some(0), 3, 4), (Some(1), 5, 6), (Some(1), 7, 8)]
        );
        assert!(plan.is_partition_of(&program));
    }

    #[test]
    fn test_collision_closes_batch() {
        let text = fixture::program(&[
            FixtureLayer::square(0, 10.0, 10.0, 10.0),
            FixtureLayer::square(1, 10.0, 10.0, 10.0),
            FixtureLayer::square(0, 10.0, 10.0, 10.0),
        ]);
        let (program, plan) = batches_for(&text, 10);
        let layers: Vec<(Option<u8>, usize, usize)> = plan
            .batches
            .iter()
            .map(|b| (b.tool, b.first_layer, b.last_layer))
            .collect();
        assert_eq!(layers, vec![(Some(0), 1, 1), (Some(1), 2, 2), (Some(0), 3, 3)]);
        assert!(plan.is_partition_of(&program));
    }

    #[test]
    fn test_schedule_is_deterministic() {
        let text = fixture::alternating_tools(12);
        let (_, a) = batches_for(&text, 4);
        let (_, b) = batches_for(&text, 4);
        assert_eq!(a, b);
    }

    #[test]
    fn test_single_tool_is_one_batch_per_cap() {
        let layers: Vec<FixtureLayer> = (0..5)
            .map(|_| FixtureLayer::square(0, 0.0, 0.0, 5.0))
            .collect();
        let (program, plan) = batches_for(&fixture::program(&layers), 10);
        assert_eq!(plan.batches.len(), 1);
        assert_eq!(plan.batches[0].members.len(), program.segments().count());
        assert_eq!(plan.tool_switches(Some(0)), 0);
    }

    #[test]
    fn test_empty_program() {
        let (program, plan) = batches_for("G28\n", 10);
        assert!(plan.batches.is_empty());
        assert!(plan.is_partition_of(&program));
    }
}
