//! Error types for indras-logsink
//!
//! This module defines the error types used throughout the log sink crate.

use std::fmt;

use thiserror::Error;

/// Result alias used by the log sink
pub type Result<T, E = LogSinkError> = std::result::Result<T, E>;

/// Step of a rotation that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationPhase {
    /// Shifting retained archives up by one suffix
    Renumber,
    /// Moving the active archive into slot 1
    Demote,
    /// Removing the retired primary file
    Unlink,
    /// Opening the replacement appender
    Create,
    /// Draining and closing the retired appender
    Retire,
}

impl fmt::Display for RotationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let phase = match self {
            RotationPhase::Renumber => "renumber archives",
            RotationPhase::Demote => "demote active archive",
            RotationPhase::Unlink => "remove previous primary file",
            RotationPhase::Create => "create replacement writer",
            RotationPhase::Retire => "retire previous writer",
        };
        f.write_str(phase)
    }
}

/// Errors that can occur while writing to or rotating a log sink
#[derive(Debug, Error)]
pub enum LogSinkError {
    /// Filesystem or compression stream failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Write attempted on a writer that is closing or closed
    #[error("Writer closed")]
    Closed,

    /// Rotation aborted; the source error is annotated with the failing phase
    #[error("Rotation failed trying to {phase}: {source}")]
    Rotation {
        /// Phase in which the rotation failed
        phase: RotationPhase,
        /// Underlying failure
        #[source]
        source: Box<LogSinkError>,
    },
}

impl LogSinkError {
    /// Wrap an error as a rotation failure in the given phase
    pub fn rotation(phase: RotationPhase, source: impl Into<LogSinkError>) -> Self {
        Self::Rotation {
            phase,
            source: Box::new(source.into()),
        }
    }

    /// Create an I/O error from a message
    pub fn io(message: impl Into<String>) -> Self {
        Self::Io(std::io::Error::other(message.into()))
    }

    /// Whether this error reports a closed writer
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }

    /// The failing rotation phase, if this is a rotation error
    pub fn rotation_phase(&self) -> Option<RotationPhase> {
        match self {
            Self::Rotation { phase, .. } => Some(*phase),
            _ => None,
        }
    }
}
