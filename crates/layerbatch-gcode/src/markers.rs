//! Structural markers recognized in slicer output.
//!
//! Machine tokens (`M620`, `M621`, `T<n>`) are matched case-sensitively on
//! the code part of a line. Comment markers are matched case-insensitively.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::command::Command;

static LAYER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)layer num/total_layer_count:\s*(\d+)\s*/\s*(\d+)").expect("layer marker pattern")
});
static OBJECT_START: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)start printing object, unique label id:\s*(\S+)").expect("object start pattern")
});
static OBJECT_STOP: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)stop printing object, unique label id:\s*(\S+)").expect("object stop pattern")
});
static Z_HEIGHT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^Z_HEIGHT:\s*([-+]?[0-9]*\.?[0-9]+)").expect("z height pattern")
});
static TC_OPEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^M620 S(\d+)A").expect("tool change open pattern"));
static TC_CLOSE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^M621 S\d+A").expect("tool change close pattern"));

/// Comment that marks the start of the machine end sequence.
const END_MARKERS: [&str; 2] = ["MACHINE_END_GCODE_START", "EXECUTABLE_BLOCK_END"];

/// A structural marker carried by a line.
#[derive(Debug, Clone, PartialEq)]
pub enum Marker {
    /// `; layer num/total_layer_count: <number>/<total>`
    Layer {
        /// Layer number as written by the slicer.
        number: u32,
        /// Total layer count as written by the slicer.
        total: u32,
    },
    /// `; start printing object, unique label id: <id>`
    ObjectStart(String),
    /// `; stop printing object, unique label id: <id>`
    ObjectStop(String),
    /// `; Z_HEIGHT: <z>`
    ZHeight(f64),
    /// `M620 S<n>A`, opening a tool-change sequence.
    ToolChangeOpen(u32),
    /// `M621 S<n>A`, closing a tool-change sequence.
    ToolChangeClose,
    /// Start of the machine end sequence.
    EndOfPrint,
}

impl Marker {
    /// Classify a command, if it carries a marker.
    pub fn classify(cmd: &Command) -> Option<Marker> {
        let code = cmd.code();
        if !code.is_empty() {
            if let Some(caps) = TC_OPEN.captures(code) {
                return caps[1].parse().ok().map(Marker::ToolChangeOpen);
            }
            if TC_CLOSE.is_match(code) {
                return Some(Marker::ToolChangeClose);
            }
        }

        let comment = cmd.comment.as_deref()?;
        if let Some(caps) = LAYER.captures(comment) {
            let number = caps[1].parse().ok()?;
            let total = caps[2].parse().ok()?;
            return Some(Marker::Layer { number, total });
        }
        if let Some(caps) = OBJECT_START.captures(comment) {
            return Some(Marker::ObjectStart(caps[1].to_string()));
        }
        if let Some(caps) = OBJECT_STOP.captures(comment) {
            return Some(Marker::ObjectStop(caps[1].to_string()));
        }
        if let Some(caps) = Z_HEIGHT.captures(comment) {
            return caps[1].parse().ok().map(Marker::ZHeight);
        }
        let upper = comment.to_ascii_uppercase();
        if END_MARKERS.iter().any(|m| upper.contains(m)) {
            return Some(Marker::EndOfPrint);
        }
        None
    }

    /// Whether any line of the program carries a layer marker.
    pub fn has_layer_markers<'a>(lines: impl IntoIterator<Item = &'a str>) -> bool {
        lines
            .into_iter()
            .filter_map(|line| line.find(';').map(|idx| &line[idx + 1..]))
            .any(|comment| LAYER.is_match(comment))
    }
}

/// Layer marker comment text, without the leading `;`.
pub fn layer_marker(number: usize, total: usize) -> String {
    format!("layer num/total_layer_count: {}/{}", number, total)
}

/// Z height comment text, without the leading `;`.
pub fn z_height_marker(z: f64) -> String {
    format!("Z_HEIGHT: {}", crate::command::format_coord(z, crate::command::AXIS_PRECISION))
}
