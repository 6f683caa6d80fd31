use crate::{name::NameError, transport::TransportError};

/// Errors surfaced by the PV table
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum PvError {
    #[error("Timed out connecting to {0}")]
    ConnectionTimeout(String),
    #[error("Timed out waiting for a reply from {0}")]
    ReadTimeout(String),
    #[error("Write failed for: {}", .names.join(", "))]
    WriteFailed { names: Vec<String> },
    #[error("{0} is not connected")]
    NotConnected(String),
    #[error("{0} is not being monitored")]
    NotMonitored(String),
    #[error("{name}: {reason}")]
    ShapeMismatch { name: String, reason: String },
    #[error("{name}: {reason}")]
    ProtocolIntrospection { name: String, reason: String },
    #[error("No PV at index {0}")]
    NoSuchEntry(usize),
    #[error("Nothing to write to {0}")]
    NothingToPut(String),
    #[error("{0}")]
    InvalidName(#[from] NameError),
    #[error("{name}: {source}")]
    Transport {
        name: String,
        source: TransportError,
    },
    #[error("{} errors{}", .0.len(), .0.first().map(|e| format!(", first: {e}")).unwrap_or_default())]
    Multiple(Vec<PvError>),
}

impl PvError {
    /// Turn a list of errors gathered over a batch into a single result
    pub(crate) fn from_batch(mut errors: Vec<PvError>) -> Result<(), PvError> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(PvError::Multiple(errors)),
        }
    }

    /// The individual errors, flattening [`PvError::Multiple`]
    pub fn errors(&self) -> Vec<&PvError> {
        match self {
            PvError::Multiple(errors) => errors.iter().collect(),
            other => vec![other],
        }
    }
}
