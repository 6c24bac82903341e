//! Structural parser.
//!
//! Turns a flat G-code program into a preamble, an ordered list of
//! [`Layer`]s split into per-object/per-tool [`Segment`]s, and a postamble.
//! Parsing never fails; anomalies are collected as [`ParseWarning`]s.
//!
//! Layers are opened either by slicer layer markers or, when a program has
//! none, by a commanded Z above every Z seen so far.

use std::collections::BTreeSet;
use std::ops::Range;
use std::sync::OnceLock;

use thiserror::Error;
use tracing::{debug, warn};

use crate::command::Command;
use crate::emit::{Emitter, LineEnding};
use crate::markers::Marker;
use crate::state::MachineState;

/// How layer boundaries were detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerDetection {
    /// Slicer layer-marker comments.
    Markers,
    /// Increasing commanded Z.
    ZHeight,
}

/// Non-fatal structural problem found while parsing.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParseWarning {
    /// Object stop with no open object.
    #[error("line {line}: stop of object {id} with no open object")]
    StrayObjectStop {
        /// Source line.
        line: usize,
        /// Object label from the marker.
        id: String,
    },
    /// Tool-change close with no open sequence.
    #[error("line {line}: tool-change close with no open sequence")]
    StrayToolChangeClose {
        /// Source line.
        line: usize,
    },
    /// Tool-change open inside an open sequence.
    #[error("line {line}: tool-change open inside the sequence opened at line {opened}")]
    NestedToolChangeOpen {
        /// Source line.
        line: usize,
        /// Line of the sequence already open.
        opened: usize,
    },
    /// Tool-change sequence still open at end of input.
    #[error("tool-change sequence opened at line {line} is never closed")]
    UnterminatedToolChange {
        /// Line the sequence was opened at.
        line: usize,
    },
    /// Layer marker whose number does not increase.
    #[error("line {line}: layer marker {number} does not follow {previous}")]
    NonIncreasingLayerMarker {
        /// Source line.
        line: usize,
        /// Number on this marker.
        number: u32,
        /// Highest number seen before.
        previous: u32,
    },
    /// Object still open when a new layer starts.
    #[error("line {line}: object {id} still open at layer boundary")]
    ObjectOpenAtLayerBoundary {
        /// Line that opened the new layer.
        line: usize,
        /// Open object label.
        id: String,
    },
}

/// Axis-aligned 2-D bounding box.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
    /// Minimum corner (X, Y).
    pub min: [f64; 2],
    /// Maximum corner (X, Y).
    pub max: [f64; 2],
}

impl Bounds {
    /// Degenerate box around one point.
    pub fn point(x: f64, y: f64) -> Self {
        Self {
            min: [x, y],
            max: [x, y],
        }
    }

    /// Grow to include a point.
    pub fn include(&mut self, x: f64, y: f64) {
        self.min[0] = self.min[0].min(x);
        self.min[1] = self.min[1].min(y);
        self.max[0] = self.max[0].max(x);
        self.max[1] = self.max[1].max(y);
    }

    /// Box grown by `margin` on every side.
    pub fn expanded(&self, margin: f64) -> Self {
        Self {
            min: [self.min[0] - margin, self.min[1] - margin],
            max: [self.max[0] + margin, self.max[1] + margin],
        }
    }

    /// Whether two boxes overlap (touching counts).
    pub fn intersects(&self, other: &Bounds) -> bool {
        self.min[0] <= other.max[0]
            && other.min[0] <= self.max[0]
            && self.min[1] <= other.max[1]
            && other.min[1] <= self.max[1]
    }
}

/// Identity of a segment: layer index and position within the layer.
///
/// Ordering follows the original program order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SegmentId {
    /// 1-based layer index.
    pub layer: usize,
    /// 0-based position within the layer.
    pub ordinal: usize,
}

impl std::fmt::Display for SegmentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "L{}#{}", self.layer, self.ordinal)
    }
}

/// A contiguous run of one layer's commands sharing one tool and object.
#[derive(Debug, Clone)]
pub struct Segment {
    /// Identity.
    pub id: SegmentId,
    /// Object label, when printed inside object markers.
    pub object_id: Option<String>,
    /// Tool that prints this segment.
    pub tool: Option<u8>,
    /// Range into the owning layer's commands.
    pub range: Range<usize>,
    /// Machine state before the first command.
    pub entry: MachineState,
    /// Z height of the owning layer.
    pub z: f64,
    /// Number of extruding moves outside tool-change sequences.
    pub extrusions: usize,
}

impl Segment {
    /// This segment's commands within `layer`.
    pub fn commands<'a>(&self, layer: &'a Layer) -> &'a [Command] {
        &layer.commands[self.range.clone()]
    }
}

/// One physical layer.
#[derive(Debug, Clone)]
pub struct Layer {
    /// 1-based index, in parse order.
    pub index: usize,
    /// Z height (mm).
    pub z: f64,
    /// All commands of the layer, in order.
    pub commands: Vec<Command>,
    /// Tool that does most of the extrusion.
    pub tool: Option<u8>,
    /// Segments; their ranges tile `commands` exactly.
    pub segments: Vec<Segment>,
    /// Machine state before the first command.
    pub entry: MachineState,
    bounds: OnceLock<Option<Bounds>>,
}

impl Layer {
    /// Bounding box of every X/Y word in the layer, computed on first use.
    pub fn bounds(&self) -> Option<Bounds> {
        *self.bounds.get_or_init(|| {
            let mut bounds: Option<Bounds> = None;
            for cmd in &self.commands {
                if let (Some(x), Some(y)) = (cmd.x, cmd.y) {
                    match bounds.as_mut() {
                        Some(b) => b.include(x, y),
                        None => bounds = Some(Bounds::point(x, y)),
                    }
                }
            }
            bounds
        })
    }
}

/// A parsed program.
#[derive(Debug, Clone)]
pub struct ParsedProgram {
    /// Lines before the first layer, reproduced verbatim.
    pub preamble: Vec<Command>,
    /// Layers in original order.
    pub layers: Vec<Layer>,
    /// Machine end sequence, reproduced verbatim.
    pub postamble: Vec<Command>,
    /// Structural problems found.
    pub warnings: Vec<ParseWarning>,
    /// Line terminator of the input.
    pub line_ending: LineEnding,
    /// How layers were detected.
    pub detection: LayerDetection,
    /// Machine state after the last body command.
    pub exit: MachineState,
}

impl ParsedProgram {
    /// Layer by 1-based index.
    pub fn layer(&self, index: usize) -> Option<&Layer> {
        index.checked_sub(1).and_then(|i| self.layers.get(i))
    }

    /// Segment by id, with its layer.
    pub fn segment(&self, id: SegmentId) -> Option<(&Layer, &Segment)> {
        let layer = self.layer(id.layer)?;
        layer.segments.get(id.ordinal).map(|s| (layer, s))
    }

    /// All segments in original order.
    pub fn segments(&self) -> impl Iterator<Item = (&Layer, &Segment)> {
        self.layers
            .iter()
            .flat_map(|l| l.segments.iter().map(move |s| (l, s)))
    }

    /// Machine state at the end of the preamble.
    pub fn preamble_state(&self) -> MachineState {
        self.layers.first().map_or(self.exit, |l| l.entry)
    }

    /// Tools used by any segment.
    pub fn tools(&self) -> BTreeSet<u8> {
        self.segments().filter_map(|(_, s)| s.tool).collect()
    }

    /// Number of tool selections in the body that change the active tool.
    pub fn tool_change_count(&self) -> usize {
        count_tool_changes(
            self.preamble_state().tool,
            self.layers.iter().flat_map(|l| &l.commands),
        )
    }

    /// Re-emit the program unchanged.
    pub fn to_gcode(&self) -> String {
        let mut out = Emitter::new(self.line_ending);
        out.push_all(&self.preamble);
        for layer in &self.layers {
            out.push_all(&layer.commands);
        }
        out.push_all(&self.postamble);
        out.finish()
    }
}

/// Count tool selections in `commands` that differ from the active tool,
/// starting from `initial`.
pub fn count_tool_changes<'a>(
    initial: Option<u8>,
    commands: impl IntoIterator<Item = &'a Command>,
) -> usize {
    let mut active = initial;
    let mut count = 0;
    for tool in commands.into_iter().filter_map(|c| c.tool) {
        if active != Some(tool) {
            count += 1;
        }
        active = Some(tool);
    }
    count
}

/// Where a line splits the current segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Boundary {
    /// No split.
    None,
    /// A new segment starts at this line.
    Before,
    /// A new segment starts after this line.
    After,
}

/// Line-level parser state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParseState {
    /// Machine state.
    pub machine: MachineState,
    /// Line of the open tool-change sequence, if any.
    pub tool_change: Option<usize>,
    /// Open object label, if any.
    pub object: Option<String>,
}

/// One scanned line.
#[derive(Debug, Clone)]
pub struct Scanned {
    /// The command, tagged when it belongs to a tool-change sequence.
    pub command: Command,
    /// Marker carried by the line.
    pub marker: Option<Marker>,
    /// Machine state before the line.
    pub before: MachineState,
    /// Extrusion delta produced by the line.
    pub extrusion: f64,
    /// Whether the line opens a tool-change sequence.
    pub opens_tool_change: bool,
    /// Segment split caused by the line.
    pub boundary: Boundary,
    /// Structural problem found on the line.
    pub warning: Option<ParseWarning>,
}

impl Scanned {
    /// Extruding move outside a tool-change sequence.
    pub fn is_print_move(&self) -> bool {
        self.extrusion > 0.0 && self.command.is_motion() && !self.command.in_tool_change
    }
}

impl ParseState {
    /// Scan one line, returning the state after it.
    ///
    /// A tool-change sequence opens at `M620 S<n>A` and closes at
    /// `M621 S<n>A`. A bare tool select outside a sequence is a sequence of
    /// its own.
    pub fn scan(&self, line: usize, text: &str) -> (ParseState, Scanned) {
        let cmd = Command::parse(line, text);
        let marker = Marker::classify(&cmd);
        let mut next = self.clone();
        let mut warning = None;
        let mut member = self.tool_change.is_some();
        let mut opens = false;

        match &marker {
            Some(Marker::ToolChangeOpen(_)) => {
                match self.tool_change {
                    Some(opened) => {
                        warning = Some(ParseWarning::NestedToolChangeOpen { line, opened })
                    }
                    None => {
                        next.tool_change = Some(line);
                        opens = true;
                    }
                }
                member = true;
            }
            Some(Marker::ToolChangeClose) => {
                if self.tool_change.is_some() {
                    next.tool_change = None;
                    member = true;
                } else {
                    warning = Some(ParseWarning::StrayToolChangeClose { line });
                }
            }
            _ => {}
        }
        if cmd.tool.is_some() && self.tool_change.is_none() {
            opens = true;
            member = true;
        }

        let mut boundary = if opens { Boundary::Before } else { Boundary::None };
        match &marker {
            Some(Marker::ObjectStart(id)) => {
                next.object = Some(id.clone());
                boundary = Boundary::Before;
            }
            Some(Marker::ObjectStop(id)) => {
                if next.object.take().is_some() {
                    boundary = Boundary::After;
                } else {
                    warning = Some(ParseWarning::StrayObjectStop {
                        line,
                        id: id.clone(),
                    });
                }
            }
            _ => {}
        }

        let before = self.machine;
        let extrusion = next.machine.apply(&cmd);
        let command = if member { cmd.tool_change_member() } else { cmd };

        (
            next,
            Scanned {
                command,
                marker,
                before,
                extrusion,
                opens_tool_change: opens,
                boundary,
                warning,
            },
        )
    }
}

/// Parse a whole program.
pub fn parse(text: &str) -> ParsedProgram {
    let line_ending = LineEnding::detect(text);
    let lines: Vec<&str> = text.lines().collect();
    parse_lines(&lines, line_ending)
}

/// Parse pre-split lines.
pub fn parse_lines(lines: &[&str], line_ending: LineEnding) -> ParsedProgram {
    let detection = if Marker::has_layer_markers(lines.iter().copied()) {
        LayerDetection::Markers
    } else {
        LayerDetection::ZHeight
    };

    let mut builder = Builder::new(detection);
    for (i, text) in lines.iter().enumerate() {
        builder.push_line(i, text);
    }
    let program = builder.finish(line_ending);

    debug!(
        layers = program.layers.len(),
        segments = program.segments().count(),
        warnings = program.warnings.len(),
        detection = ?program.detection,
        "parsed program"
    );
    program
}

#[derive(Debug, Clone)]
struct SegmentDraft {
    start: usize,
    object_id: Option<String>,
    tool: Option<u8>,
    tool_fixed: bool,
    entry: MachineState,
    extrusions: usize,
}

impl SegmentDraft {
    fn new(start: usize, object_id: Option<String>, entry: MachineState) -> Self {
        Self {
            start,
            object_id,
            tool: entry.tool,
            tool_fixed: false,
            entry,
            extrusions: 0,
        }
    }
}

#[derive(Debug)]
struct LayerDraft {
    commands: Vec<Command>,
    segments: Vec<SegmentDraft>,
    entry: MachineState,
    opened_z: Option<f64>,
    z_hint: Option<f64>,
    extrusion_z: Option<f64>,
    commanded_z: Option<f64>,
    votes: Vec<(u8, usize)>,
}

impl LayerDraft {
    fn start_segment(&mut self, object_id: Option<String>, entry: MachineState) {
        let at = self.commands.len();
        match self.segments.last_mut() {
            Some(last) if last.start == at => *last = SegmentDraft::new(at, object_id, entry),
            _ => self.segments.push(SegmentDraft::new(at, object_id, entry)),
        }
    }

    fn vote(&mut self, tool: u8) {
        match self.votes.iter_mut().find(|(t, _)| *t == tool) {
            Some((_, n)) => *n += 1,
            None => self.votes.push((tool, 1)),
        }
    }

    fn into_layer(mut self, index: usize, previous_z: Option<f64>) -> Layer {
        let z = self
            .opened_z
            .or(self.z_hint)
            .or(self.extrusion_z)
            .or(self.commanded_z)
            .or(previous_z)
            .unwrap_or(self.entry.z);
        if let Some(previous) = previous_z.filter(|&previous| z < previous) {
            debug!(layer = index, z, previous, "layer below its predecessor");
        }

        let len = self.commands.len();
        if self.segments.last().is_some_and(|s| s.start == len) {
            self.segments.pop();
        }
        let mut ends: Vec<usize> = self.segments.iter().skip(1).map(|s| s.start).collect();
        ends.push(len);

        let segments: Vec<Segment> = self
            .segments
            .into_iter()
            .zip(ends)
            .enumerate()
            .map(|(ordinal, (draft, end))| Segment {
                id: SegmentId {
                    layer: index,
                    ordinal,
                },
                object_id: draft.object_id,
                tool: draft.tool,
                range: draft.start..end,
                entry: draft.entry,
                z,
                extrusions: draft.extrusions,
            })
            .collect();

        let mut best: Option<(u8, usize)> = None;
        for &(tool, n) in &self.votes {
            if best.map_or(true, |(_, m)| n > m) {
                best = Some((tool, n));
            }
        }
        let tool = best
            .map(|(t, _)| t)
            .or_else(|| segments.last().and_then(|s| s.tool))
            .or(self.entry.tool);

        Layer {
            index,
            z,
            commands: self.commands,
            tool,
            segments,
            entry: self.entry,
            bounds: OnceLock::new(),
        }
    }
}

#[derive(Debug, Clone)]
struct LeadIn {
    start: usize,
    entry: MachineState,
}

struct Builder {
    detection: LayerDetection,
    state: ParseState,
    preamble: Vec<Command>,
    layers: Vec<Layer>,
    current: Option<LayerDraft>,
    postamble: Vec<Command>,
    warnings: Vec<ParseWarning>,
    last_marker: Option<u32>,
    max_z: Option<f64>,
    pending_z_height: Option<f64>,
    lead_in: Option<LeadIn>,
    in_postamble: bool,
    body_exit: Option<MachineState>,
}

impl Builder {
    fn new(detection: LayerDetection) -> Self {
        Self {
            detection,
            state: ParseState::default(),
            preamble: Vec::new(),
            layers: Vec::new(),
            current: None,
            postamble: Vec::new(),
            warnings: Vec::new(),
            last_marker: None,
            max_z: None,
            pending_z_height: None,
            lead_in: None,
            in_postamble: false,
            body_exit: None,
        }
    }

    fn warn(&mut self, warning: ParseWarning) {
        warn!("{}", warning);
        self.warnings.push(warning);
    }

    fn push_line(&mut self, line: usize, text: &str) {
        let (next, scanned) = self.state.scan(line, text);
        if let Some(w) = scanned.warning.clone() {
            self.warn(w);
        }

        if self.in_postamble {
            self.postamble.push(scanned.command);
            self.state = next;
            return;
        }
        let started = self.current.is_some() || !self.layers.is_empty();
        if started && scanned.marker == Some(Marker::EndOfPrint) {
            self.finish_layer();
            self.in_postamble = true;
            self.body_exit = Some(self.state.machine);
            self.postamble.push(scanned.command);
            self.state = next;
            return;
        }

        match self.detection {
            LayerDetection::Markers => {
                if let Some(&Marker::Layer { number, .. }) = scanned.marker.as_ref() {
                    match self.last_marker {
                        Some(previous) if number <= previous => {
                            self.warn(ParseWarning::NonIncreasingLayerMarker {
                                line,
                                number,
                                previous,
                            });
                        }
                        _ => {
                            self.last_marker = Some(number);
                            self.open_layer(line, scanned.before, None);
                        }
                    }
                }
            }
            LayerDetection::ZHeight => {
                let cmd = &scanned.command;
                if cmd.is_motion() && cmd.z.is_some() && !cmd.in_tool_change {
                    let z = next.machine.z;
                    if self.max_z.map_or(true, |m| z > m) {
                        self.max_z = Some(z);
                        self.open_layer(line, scanned.before, Some(z));
                    }
                }
            }
        }

        self.state = next;
        self.append(scanned);
    }

    fn open_layer(&mut self, line: usize, before: MachineState, opened_z: Option<f64>) {
        if let Some(id) = self.state.object.clone() {
            self.warn(ParseWarning::ObjectOpenAtLayerBoundary { line, id });
        }
        let object = self.state.object.clone();

        let mut moved_commands = Vec::new();
        let mut moved_segments = Vec::new();
        let mut entry = before;
        if let Some(lead) = self.lead_in.take() {
            entry = lead.entry;
            match self.current.as_mut() {
                Some(draft) => {
                    moved_commands = draft.commands.split_off(lead.start);
                    let split = draft
                        .segments
                        .iter()
                        .position(|s| s.start >= lead.start)
                        .unwrap_or(draft.segments.len());
                    moved_segments = draft.segments.split_off(split);
                    for seg in &mut moved_segments {
                        seg.start -= lead.start;
                    }
                }
                None => moved_commands = self.preamble.split_off(lead.start),
            }
        }

        self.finish_layer();

        if moved_segments.first().map_or(true, |s| s.start != 0) {
            moved_segments.insert(0, SegmentDraft::new(0, object, entry));
        }
        self.current = Some(LayerDraft {
            commands: moved_commands,
            segments: moved_segments,
            entry,
            opened_z,
            z_hint: self.pending_z_height.take(),
            extrusion_z: None,
            commanded_z: None,
            votes: Vec::new(),
        });
        debug!(line, layer = self.layers.len() + 1, "layer opened");
    }

    fn finish_layer(&mut self) {
        let Some(draft) = self.current.take() else {
            return;
        };
        if draft.commands.is_empty() {
            return;
        }
        let previous_z = self.layers.last().map(|l| l.z);
        let index = self.layers.len() + 1;
        self.layers.push(draft.into_layer(index, previous_z));
    }

    fn append(&mut self, scanned: Scanned) {
        let after = self.state.machine;

        if self.detection == LayerDetection::ZHeight {
            let sink_len = match &self.current {
                Some(draft) => draft.commands.len(),
                None => self.preamble.len(),
            };
            if scanned.opens_tool_change {
                if self.lead_in.is_none() {
                    self.lead_in = Some(LeadIn {
                        start: sink_len,
                        entry: scanned.before,
                    });
                }
            } else if scanned.command.moves_axis() && !scanned.command.in_tool_change {
                self.lead_in = None;
            }
        }

        if let Some(Marker::ZHeight(z)) = scanned.marker {
            match self.current.as_mut() {
                Some(draft) if draft.extrusion_z.is_none() => draft.z_hint = Some(z),
                _ => self.pending_z_height = Some(z),
            }
        }

        let Some(draft) = self.current.as_mut() else {
            self.preamble.push(scanned.command);
            return;
        };

        if scanned.boundary == Boundary::Before {
            draft.start_segment(self.state.object.clone(), scanned.before);
        }

        let print_move = scanned.is_print_move();
        let cmd = &scanned.command;
        if cmd.is_motion() && cmd.z.is_some() && !cmd.in_tool_change && draft.commanded_z.is_none() {
            draft.commanded_z = Some(after.z);
        }
        if print_move {
            if draft.extrusion_z.is_none() {
                draft.extrusion_z = Some(after.z);
            }
            if let Some(tool) = after.tool {
                draft.vote(tool);
            }
        }

        if let Some(seg) = draft.segments.last_mut() {
            if !seg.tool_fixed {
                seg.tool = after.tool;
                seg.tool_fixed = !cmd.in_tool_change && !cmd.is_comment_or_blank();
            }
            if print_move {
                seg.extrusions += 1;
            }
        }
        draft.commands.push(scanned.command);

        if scanned.boundary == Boundary::After {
            draft.start_segment(self.state.object.clone(), after);
        }
    }

    fn finish(mut self, line_ending: LineEnding) -> ParsedProgram {
        self.finish_layer();
        if let Some(line) = self.state.tool_change {
            self.warn(ParseWarning::UnterminatedToolChange { line });
        }
        ParsedProgram {
            preamble: self.preamble,
            layers: self.layers,
            postamble: self.postamble,
            warnings: self.warnings,
            line_ending,
            detection: self.detection,
            exit: self.body_exit.unwrap_or(self.state.machine),
        }
    }
}
