//! Error kinds shared by the collectors, the model and the daemon loop.
use thiserror::Error;

pub type Result<T> = std::result::Result<T, NcdError>;

#[derive(Debug, Error)]
pub enum NcdError {
    /// An external switch command failed or returned nothing.
    #[error("unable to run command: {0}")]
    OsCommand(String),

    /// A model object was created without its identity.
    #[error("cannot create object: {0}")]
    ObjCreate(String),

    /// The model and the observed topology disagree.
    #[error("inconsistency in collected data: {0}")]
    Inconsistency(String),

    /// The PMD or port set changed between sample windows.
    #[error("switch state changed: {0}")]
    ModelChanged(String),

    /// Textual output from the switch did not match the expected shape.
    #[error("unable to parse info: {0}")]
    Parse(String),

    /// The shutdown flag was observed mid-phase.
    #[error("shutdown requested")]
    Shutdown,
}

impl NcdError {
    /// Recoverable errors reset the current sample window and the loop goes
    /// on; everything else tears the daemon down.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, NcdError::ModelChanged(_) | NcdError::Parse(_))
    }
}
