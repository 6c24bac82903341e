//! Output synthesis.
//!
//! Walks a [`BatchPlan`] and writes the reordered body: a fresh layer marker
//! per visit, tool-change blocks between batches of different tools, prime
//! tower catch-up, safe travel into each visit and the original segment
//! commands with their tool-change sequences stripped.

pub mod prime_tower;
pub mod toolchange;
pub mod zhop;

pub use prime_tower::{PrimeTowerConfig, TowerProgress};
pub use toolchange::ToolChangeConfig;
pub use zhop::{plan_travel, Travel, TravelPlan, ZHopConfig};

use layerbatch_gcode::command::EXTRUSION_PRECISION;
use layerbatch_gcode::markers::{layer_marker, z_height_marker};
use layerbatch_gcode::{
    format_coord, Command, ExtrusionMode, Layer, MachineState, Marker, Move, ParsedProgram,
    Positioning, Segment, SegmentId,
};
use serde::Serialize;
use tracing::debug;

use crate::error::{BatchError, Result};
use crate::schedule::{BatchPlan, LayerBatch};

const EPSILON: f64 = 1e-6;

/// Counters collected while synthesizing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SynthStats {
    /// Layer visits written.
    pub visits: usize,
    /// Tool-change blocks written.
    pub tool_changes: usize,
    /// Prime tower layers written.
    pub tower_layers: usize,
    /// Travels wrapped in a Z hop.
    pub hops: usize,
}

/// Synthesized body.
#[derive(Debug, Clone)]
pub struct Synthesized {
    /// Commands between the preamble and the postamble.
    pub body: Vec<Command>,
    /// Counters.
    pub stats: SynthStats,
}

/// Synthesizer configuration.
#[derive(Debug, Clone, Copy)]
pub struct SynthConfig<'c> {
    /// Travel between visits.
    pub zhop: &'c ZHopConfig,
    /// Prime towers.
    pub prime_tower: &'c PrimeTowerConfig,
    /// Tool-change blocks.
    pub tool_change: &'c ToolChangeConfig,
}

/// Body writer for one program and plan.
pub struct Synthesizer<'a> {
    program: &'a ParsedProgram,
    config: SynthConfig<'a>,
    towers: bool,
    state: MachineState,
    ceiling: f64,
    last_layer: Option<usize>,
    progress: TowerProgress,
    body: Vec<Command>,
    stats: SynthStats,
}

impl<'a> Synthesizer<'a> {
    /// Synthesizer starting from the state at the end of the preamble.
    pub fn new(program: &'a ParsedProgram, config: SynthConfig<'a>) -> Self {
        // towers only make sense when more than one tool prints
        let towers = config.prime_tower.enabled && program.tools().len() > 1;
        Self {
            program,
            config,
            towers,
            state: program.preamble_state(),
            ceiling: 0.0,
            last_layer: None,
            progress: TowerProgress::default(),
            body: Vec::new(),
            stats: SynthStats::default(),
        }
    }

    /// Write the body for `plan`.
    pub fn run(mut self, plan: &BatchPlan) -> Result<Synthesized> {
        let total = plan.visit_count();
        let mut number = 0;
        for batch in &plan.batches {
            let mut change = self.pending_change(batch);
            for (layer, ids) in batch.visits() {
                number += 1;
                self.visit(number, total, layer, ids, change.take())?;
            }
        }
        self.finish();
        Ok(Synthesized {
            body: self.body,
            stats: self.stats,
        })
    }

    fn pending_change(&self, batch: &LayerBatch) -> Option<(Option<u8>, u8)> {
        let to = batch.tool?;
        (self.state.tool != Some(to)).then_some((self.state.tool, to))
    }

    fn emit(&mut self, cmd: Command) {
        let delta = self.state.apply(&cmd);
        if delta > 0.0 && cmd.is_motion() && !cmd.in_tool_change {
            self.ceiling = self.ceiling.max(self.state.z);
        }
        self.body.push(cmd);
    }

    fn emit_raw(&mut self, text: &str) {
        self.emit(Command::synthesized(text));
    }

    fn visit(
        &mut self,
        number: usize,
        total: usize,
        index: usize,
        ids: &[SegmentId],
        change: Option<(Option<u8>, u8)>,
    ) -> Result<()> {
        let program = self.program;
        let layer = program
            .layer(index)
            .ok_or(BatchError::UnknownSegment(ids[0]))?;

        self.emit(Command::comment_line(&layer_marker(number, total)));
        self.emit(Command::comment_line(&z_height_marker(layer.z)));
        self.stats.visits += 1;

        if let Some((from, to)) = change {
            debug!(layer = index, ?from, to, ceiling = self.ceiling, "tool change");
            if self.state.positioning == Positioning::Relative {
                self.emit_raw("G90");
            }
            for cmd in self.config.tool_change.block(from, to, self.ceiling) {
                self.emit(cmd);
            }
            self.stats.tool_changes += 1;
        }
        if self.towers {
            if let Some(tool) = self.state.tool {
                self.catch_up_tower(tool, index);
            }
        }

        let segments = ids
            .iter()
            .map(|&id| {
                program
                    .segment(id)
                    .map(|(_, seg)| seg)
                    .ok_or(BatchError::UnknownSegment(id))
            })
            .collect::<Result<Vec<&Segment>>>()?;
        // segments adjacent in the original layer continue without a travel
        for run in segments.chunk_by(|a, b| a.id.ordinal + 1 == b.id.ordinal) {
            self.enter(layer, run);
            for cmd in run.iter().flat_map(|seg| seg.commands(layer)) {
                if cmd.in_tool_change || matches!(Marker::classify(cmd), Some(Marker::Layer { .. }))
                {
                    continue;
                }
                self.emit(cmd.clone());
            }
        }
        self.last_layer = Some(index);
        Ok(())
    }

    /// Travel to where a run of segments starts depositing and restore the
    /// modal state of its first segment.
    ///
    /// The nozzle arrives at the run's own first point rather than where the
    /// original program left it, which may be on top of another object.
    fn enter(&mut self, layer: &Layer, run: &[&Segment]) {
        let Some(first) = run.first() else {
            return;
        };
        let entry = first.entry;
        let (x, y) = descent_point(layer, run).unwrap_or((entry.x, entry.y));
        let out_of_order = self
            .last_layer
            .is_some_and(|last| layer.index != last && layer.index != last + 1);
        self.travel(
            Travel {
                to: [x, y, entry.z.max(layer.z)],
                ceiling: self.ceiling,
                out_of_order,
            },
            layer.index,
        );
        self.restore(&entry);
    }

    fn travel(&mut self, travel: Travel, layer: usize) {
        if self.state.positioning == Positioning::Relative {
            self.emit_raw("G90");
        }
        let plan = plan_travel(self.config.zhop, &self.state, &travel);
        if plan.hopped {
            debug!(layer, ceiling = travel.ceiling, "z hop");
            self.stats.hops += 1;
        }
        for cmd in plan.commands {
            self.emit(cmd);
        }
    }

    fn restore(&mut self, entry: &MachineState) {
        if self.state.positioning != entry.positioning {
            self.emit_raw(match entry.positioning {
                Positioning::Absolute => "G90",
                Positioning::Relative => "G91",
            });
        }
        if self.state.extrusion != entry.extrusion {
            self.emit_raw(match entry.extrusion {
                ExtrusionMode::Absolute => "M82",
                ExtrusionMode::Relative => "M83",
            });
        }
        if entry.absolute_extrusion() && (self.state.e - entry.e).abs() > EPSILON {
            let text = format!("G92 E{}", format_coord(entry.e, EXTRUSION_PRECISION));
            self.emit_raw(&text);
        }
        if let Some(f) = entry.feedrate {
            if self.state.feedrate != Some(f) {
                self.emit(Move::new().f(f).build());
            }
        }
    }

    fn catch_up_tower(&mut self, tool: u8, index: usize) {
        let tower = *self.config.prime_tower;
        let layers = self.progress.catch_up(tool, index);
        if layers.is_empty() {
            return;
        }
        debug!(tool, from = layers.start(), to = layers.end(), "prime tower catch-up");

        let (x, y) = tower.position(tool);
        for j in layers {
            let Some(z) = self.program.layer(j).map(|l| l.z) else {
                continue;
            };
            let below = j
                .checked_sub(1)
                .and_then(|i| self.program.layer(i))
                .map_or(z - tower.layer_height, |l| l.z);
            let height = if z - below > EPSILON {
                z - below
            } else {
                tower.layer_height
            };

            self.travel(
                Travel {
                    to: [x, y, z],
                    ceiling: self.ceiling,
                    out_of_order: false,
                },
                j,
            );
            if self.state.extrusion != ExtrusionMode::Relative {
                self.emit_raw("M83");
            }
            self.emit(Command::comment_line(&format!("prime tower T{} layer {}", tool, j)));
            for cmd in tower.layer_moves(tool, height) {
                self.emit(cmd);
            }
            self.stats.tower_layers += 1;
        }
    }

    /// Lift clear of the print and restore the state the end sequence expects.
    fn finish(&mut self) {
        if self.state.z < self.ceiling - EPSILON {
            let lift = self.ceiling + self.config.zhop.height;
            self.emit(
                Move::new()
                    .z(lift)
                    .f(self.config.zhop.z_feedrate())
                    .build(),
            );
        }
        let exit = self.program.exit;
        self.restore(&exit);
    }
}

/// First X/Y at which `run` starts depositing.
///
/// Replays the run from its entry state, skipping stripped tool-change
/// lines. A travel ends where the following extrusion starts; a move that
/// extrudes right away starts at the position before it. Relative X/Y moves
/// only make sense from the entry position, so they yield `None`.
fn descent_point(layer: &Layer, run: &[&Segment]) -> Option<(f64, f64)> {
    let mut state = run.first()?.entry;
    for cmd in run.iter().flat_map(|seg| seg.commands(layer)) {
        if cmd.in_tool_change {
            continue;
        }
        if cmd.is_motion() && (cmd.x.is_some() || cmd.y.is_some()) {
            if state.positioning == Positioning::Relative {
                return None;
            }
            let next = state.peek(cmd);
            return Some(if next.e - state.e > EPSILON {
                (state.x, state.y)
            } else {
                (next.x, next.y)
            });
        }
        state.apply(cmd);
    }
    None
}

/// Synthesize the body of `program` for `plan`.
pub fn synthesize(
    program: &ParsedProgram,
    plan: &BatchPlan,
    config: SynthConfig<'_>,
) -> Result<Synthesized> {
    Synthesizer::new(program, config).run(plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collision::{CollisionEngine, CollisionSettings};
    use crate::fixture;
    use crate::nozzle::NozzleGeometry;
    use crate::schedule::Scheduler;
    use approx::assert_relative_eq;
    use layerbatch_gcode::{count_tool_changes, parse, ToolChangeFlavor};

    struct Configs {
        zhop: ZHopConfig,
        prime_tower: PrimeTowerConfig,
        tool_change: ToolChangeConfig,
    }

    impl Configs {
        fn generic() -> Self {
            Self {
                zhop: ZHopConfig::default(),
                prime_tower: PrimeTowerConfig::default(),
                tool_change: ToolChangeConfig {
                    flavor: ToolChangeFlavor::Generic,
                    ..Default::default()
                },
            }
        }

        fn synth(&self) -> SynthConfig<'_> {
            SynthConfig {
                zhop: &self.zhop,
                prime_tower: &self.prime_tower,
                tool_change: &self.tool_change,
            }
        }
    }

    fn planned(program: &ParsedProgram, cap: usize) -> BatchPlan {
        let engine = CollisionEngine::new(
            program,
            NozzleGeometry::default(),
            CollisionSettings::default(),
        );
        Scheduler::new(&engine, cap).schedule(program.preamble_state().tool)
    }

    #[test]
    fn test_alternating_body() {
        let program = parse(&fixture::alternating_tools(20));
        let plan = planned(&program, 10);
        let configs = Configs::generic();
        let out = synthesize(&program, &plan, configs.synth()).unwrap();

        assert_eq!(out.stats.visits, 20);
        assert_eq!(out.stats.tool_changes, 2);
        assert_eq!(count_tool_changes(None, &out.body), 2);
        // every tower layer of both tools, once
        assert_eq!(out.stats.tower_layers, 19 + 20);
    }

    #[test]
    fn test_tower_catch_up_follows_layer_heights() {
        let program = parse(&fixture::alternating_tools(6));
        let plan = planned(&program, 10);
        let configs = Configs::generic();
        let out = synthesize(&program, &plan, configs.synth()).unwrap();

        let mut state = program.preamble_state();
        let mut towers: Vec<(u8, usize, f64)> = Vec::new();
        for cmd in &out.body {
            state.apply(cmd);
            if let Some(rest) = cmd.raw.strip_prefix("; prime tower T") {
                let (tool, layer) = rest.split_once(" layer ").unwrap();
                towers.push((tool.parse().unwrap(), layer.parse().unwrap(), state.z));
            }
        }

        let layers = |tool: u8| -> Vec<usize> {
            towers
                .iter()
                .filter(|t| t.0 == tool)
                .map(|t| t.1)
                .collect()
        };
        // T0 never visits layer 6, T1 catches up from layer 1 at layer 2
        assert_eq!(layers(0), vec![1, 2, 3, 4, 5]);
        assert_eq!(layers(1), vec![1, 2, 3, 4, 5, 6]);
        for &(_, layer, z) in &towers {
            assert_relative_eq!(z, program.layer(layer).unwrap().z, epsilon = 1e-9);
        }
        assert_eq!(out.stats.tower_layers, 11);
    }

    #[test]
    fn test_descent_point_of_object() {
        let program = parse(
            "M83\n\
             ; layer num/total_layer_count: 1/1\n\
             T0\n\
             G1 Z0.2 F600\n\
             ; start printing object, unique label id: 1\n\
             G1 X0 Y0\n\
             G1 X10 Y0 E1\n\
             ; stop printing object, unique label id: 1\n\
             ; start printing object, unique label id: 2\n\
             G1 X10 Y5 E0.5\n\
             G1 X40 Y5 F9000\n\
             ; stop printing object, unique label id: 2\n\
             ; start printing object, unique label id: 3\n\
             G1 X40 Y20 F9000\n\
             G1 X50 Y20 E1\n\
             ; stop printing object, unique label id: 3\n\
             G91\n\
             ; start printing object, unique label id: 4\n\
             G1 X5 Y0\n\
             G1 X5 Y0 E1\n\
             ; stop printing object, unique label id: 4\n",
        );
        let layer = &program.layers[0];
        let object = |id: &str| {
            layer
                .segments
                .iter()
                .find(|s| s.object_id.as_deref() == Some(id))
                .unwrap()
        };
        assert_eq!(descent_point(layer, &[object("1")]), Some((0.0, 0.0)));
        // extrudes from where object 1 ended
        assert_eq!(descent_point(layer, &[object("2")]), Some((10.0, 0.0)));
        // not where object 2 left the nozzle
        assert_eq!(descent_point(layer, &[object("3")]), Some((40.0, 20.0)));
        assert_eq!(descent_point(layer, &[object("4")]), None);
    }

    #[test]
    fn test_original_tool_selects_stripped() {
        let program = parse(&fixture::alternating_tools(4));
        let plan = planned(&program, 10);
        let configs = Configs::generic();
        let out = synthesize(&program, &plan, configs.synth()).unwrap();
        let selects: Vec<&Command> = out.body.iter().filter(|c| c.tool.is_some()).collect();
        assert_eq!(selects.len(), 2);
        assert!(selects.iter().all(|c| c.line.is_none()));
    }

    #[test]
    fn test_second_batch_hops_over_first() {
        let program = parse(&fixture::alternating_tools(6));
        let plan = planned(&program, 10);
        let configs = Configs {
            prime_tower: PrimeTowerConfig {
                enabled: false,
                ..Default::default()
            },
            ..Configs::generic()
        };
        let out = synthesize(&program, &plan, configs.synth()).unwrap();

        // layer 2 is entered from layer 5's height
        let marker = out
            .body
            .iter()
            .position(|c| c.raw == "; layer num/total_layer_count: 4/6")
            .unwrap();
        let hop: Vec<f64> = out.body[marker..]
            .iter()
            .filter(|c| c.line.is_none())
            .filter_map(|c| c.z)
            .take(2)
            .collect();
        assert_relative_eq!(hop[0], 1.0 + 0.5);
        assert_relative_eq!(hop[1], 0.4);
        assert_eq!(out.stats.tower_layers, 0);
    }

    #[test]
    fn test_single_tool_has_no_towers_or_changes() {
        let layers: Vec<fixture::FixtureLayer> = (0..4)
            .map(|_| fixture::FixtureLayer::square(0, 0.0, 0.0, 5.0))
            .collect();
        let program = parse(&fixture::program(&layers));
        let plan = planned(&program, 10);
        let configs = Configs::generic();
        let out = synthesize(&program, &plan, configs.synth()).unwrap();
        assert_eq!(out.stats.tower_layers, 0);
        assert_eq!(out.stats.tool_changes, 1);
        assert_eq!(out.stats.hops, 0);
    }

    #[test]
    fn test_absolute_extrusion_restored() {
        let program = parse(
            "M82\n\
             ; layer num/total_layer_count: 1/2\n\
             T0\n\
             G1 Z0.2 F600\n\
             G1 X0 Y0\n\
             G1 X10 Y0 E1.5 F1200\n\
             ; layer num/total_layer_count: 2/2\n\
             T1\n\
             G1 Z0.4\n\
             G1 X50 Y50\n\
             G1 X60 Y50 E3.0\n",
        );
        // print layer 2 before layer 1
        let plan = BatchPlan {
            batches: vec![
                LayerBatch {
                    tool: Some(1),
                    first_layer: 2,
                    last_layer: 2,
                    members: program.layers[1].segments.iter().map(|s| s.id).collect(),
                },
                LayerBatch {
                    tool: Some(0),
                    first_layer: 1,
                    last_layer: 1,
                    members: program.layers[0].segments.iter().map(|s| s.id).collect(),
                },
            ],
        };
        let configs = Configs::generic();
        let out = synthesize(&program, &plan, configs.synth()).unwrap();
        let raw: Vec<&str> = out.body.iter().map(|c| c.raw.as_str()).collect();
        assert!(raw.contains(&"G92 E1.50000"));
        // layer 1 resumes from E=0 after layer 2 advanced the extruder
        assert!(raw.contains(&"G92 E0.00000"));
    }

    #[test]
    fn test_unknown_segment() {
        let program = parse(&fixture::alternating_tools(2));
        let plan = BatchPlan {
            batches: vec![LayerBatch {
                tool: Some(0),
                first_layer: 1,
                last_layer: 1,
                members: vec![SegmentId {
                    layer: 1,
                    ordinal: 9,
                }],
            }],
        };
        let configs = Configs::generic();
        let err = synthesize(&program, &plan, configs.synth()).unwrap_err();
        assert!(matches!(err, BatchError::UnknownSegment(_)));
    }
}
