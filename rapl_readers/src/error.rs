use std::{io, path::PathBuf};

use thiserror::Error;

use crate::reader::Strategy;

/// Errors of the RAPL readers.
///
/// Per-field problems (one unreadable sub-zone, one short MSR read, ...) are not
/// reported through this type: the field is left absent and a diagnostic is logged.
#[derive(Debug, Error)]
pub enum RaplError {
    /// The topology, vendor, cpu family or byte order could not be established.
    /// No reader can work without them.
    #[error("initialization failed: {0}")]
    FatalInit(String),

    /// None of the reader strategies is available on this machine.
    #[error("no RAPL reader strategy is available on this machine")]
    NoStrategyAvailable,

    /// A file or device could not be opened or read.
    #[error("failed to access {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Some data did not match the expected encoding.
    #[error("failed to decode {what}: {reason}")]
    Decode { what: String, reason: String },

    /// The strategy is recognized but cannot read measurements on this target.
    #[error("the {0} strategy cannot read measurements on this platform")]
    Unimplemented(Strategy),
}

impl RaplError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> RaplError {
        RaplError::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn decode(what: impl Into<String>, reason: impl ToString) -> RaplError {
        RaplError::Decode {
            what: what.into(),
            reason: reason.to_string(),
        }
    }

    /// `true` if the error comes from a file that does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, RaplError::Io { source, .. } if source.kind() == io::ErrorKind::NotFound)
    }
}

pub type Result<T, E = RaplError> = std::result::Result<T, E>;
