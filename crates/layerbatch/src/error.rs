//! Error types for tool-change batching.

use layerbatch_gcode::SegmentId;
use thiserror::Error;

/// Errors that can occur while batching a program.
#[derive(Error, Debug)]
pub enum BatchError {
    /// Invalid batch settings.
    #[error("invalid settings: {0}")]
    InvalidSettings(String),

    /// A plan names a segment the program does not have.
    #[error("plan references unknown segment {0}")]
    UnknownSegment(SegmentId),

    /// Reading the input or writing the output failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for batching operations.
pub type Result<T> = std::result::Result<T, BatchError>;
