use std::time::Duration;

use crate::config::ConfigError;
use crate::types::RequestId;

pub type EngineResult<T> = Result<T, EngineError>;

/// One line of engine output that could not be understood.
///
/// Never fatal: the reader logs it and moves on to the next line.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("Malformed engine output ({reason}): {line}")]
pub struct ParseError {
    pub line: String,
    pub reason: String,
}

impl ParseError {
    pub fn new(line: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            line: line.into(),
            reason: reason.into(),
        }
    }
}

/// A command that the target engine family cannot express.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EncodingError {
    #[error("'{command}' is not supported by {family} engines")]
    Unsupported {
        family: &'static str,
        command: &'static str,
    },
    #[error("Rules '{0}' are not supported by this engine")]
    UnsupportedRules(String),
    #[error("Invalid position: {0}")]
    InvalidPosition(String),
    #[error("Failed to serialize command: {0}")]
    Serialize(String),
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Failed to start engine '{program}': {source}")]
    ProcessStart {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Engine has not been started")]
    NotStarted,
    #[error("Engine is already running")]
    AlreadyRunning,
    #[error("Engine process is stopped")]
    Stopped,
    #[error("Engine is busy with an analysis")]
    Busy,
    #[error(transparent)]
    Encoding(#[from] EncodingError),
    #[error("Engine process died: {0}")]
    ProcessDied(String),
    #[error("Engine process was terminated")]
    Terminated,
    #[error("No result within {0:?}")]
    Timeout(Duration),
    #[error("Request was cancelled")]
    Cancelled,
    #[error("Engine rejected the request: {0}")]
    Rejected(String),
    #[error("Failed to write to engine: {0}")]
    Write(String),
    #[error("'{0}' has its own entry point and cannot be sent raw")]
    NotRaw(&'static str),
    #[error("Unknown request {0}")]
    UnknownRequest(RequestId),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_error_display_keeps_line() {
        let err = ParseError::new("info move ??", "bad coordinate");
        assert!(err.to_string().contains("info move ??"));
        assert!(err.to_string().contains("bad coordinate"));
    }
}
