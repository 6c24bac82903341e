#![warn(missing_docs)]

//! G-code model for layerbatch.
//!
//! This crate reads multi-material slicer output into a structured model
//! (preamble, layers, per-object/per-tool segments, postamble), tracks the
//! machine state through it, and writes command streams back to text.
//!
//! # Example
//!
//! ```
//! use layerbatch_gcode::parse;
//!
//! let program = parse("; layer num/total_layer_count: 1/1\nT0\nG1 Z0.2\nG1 X1 Y1 E0.1\n");
//! assert_eq!(program.layers.len(), 1);
//! assert_eq!(program.layers[0].tool, Some(0));
//! ```

pub mod command;
pub mod emit;
pub mod flavor;
pub mod markers;
pub mod parser;
pub mod state;

pub use command::{format_coord, Command, Move};
pub use emit::{Emitter, LineEnding};
pub use flavor::{ToolChangeFlavor, ToolChangeParams};
pub use markers::Marker;
pub use parser::{
    count_tool_changes, parse, parse_lines, Bounds, Layer, LayerDetection, ParseState,
    ParseWarning, ParsedProgram, Segment, SegmentId,
};
pub use state::{ExtrusionMode, MachineState, Positioning};
