//! Error types for the pressure recorder

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Recorder error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed control command
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Sensor response violates its grammar
    #[error("{sensor} decode error: {reason} (entries were {tokens:?})")]
    Decode {
        /// Which instrument produced the data
        sensor: &'static str,
        /// What was wrong with it
        reason: String,
        /// Raw whitespace-separated tokens as received
        tokens: Vec<String>,
    },

    /// End command named a different run than the active one
    #[error("Run number mismatch: active run is {expected}, End named {actual}")]
    RunNumberMismatch {
        expected: u32,
        actual: u32,
    },

    #[error("No active session")]
    NoActiveSession,

    #[error("Session already active for run {run_number}")]
    SessionAlreadyActive { run_number: u32 },

    /// Sensor read did not complete in time
    #[error("{0} read timed out")]
    Timeout(&'static str),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Output file failure
    #[error("Storage error: {0}")]
    Storage(String),
}

impl Error {
    pub fn decode(sensor: &'static str, reason: impl Into<String>, tokens: &[&str]) -> Self {
        Error::Decode {
            sensor,
            reason: reason.into(),
            tokens: tokens.iter().map(|t| t.to_string()).collect(),
        }
    }

    /// Timeouts and socket faults may clear up on their own; grammar violations won't.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Timeout(_) | Error::Io(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        let reset = Error::Io(std::io::Error::from(std::io::ErrorKind::ConnectionReset));
        assert!(reset.is_transient());
        assert!(Error::Timeout("Baratron").is_transient());
        assert!(!Error::decode("HIPPO", "bad", &["x"]).is_transient());
        assert!(!Error::NoActiveSession.is_transient());
    }

    #[test]
    fn test_decode_message_carries_tokens() {
        let err = Error::decode("Baratron", "expected second sensor to be \"Off\"", &["42.0", "On"]);
        let msg = err.to_string();
        assert!(msg.contains("Baratron"));
        assert!(msg.contains("\"42.0\""));
        assert!(msg.contains("\"On\""));
    }
}
