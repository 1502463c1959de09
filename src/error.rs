//! Error taxonomy for the live query client.
//!
//! Every failure the client can observe is expressed as a [`LiveQueryError`].
//! The enum is `Clone` because one error is routinely fanned out to several
//! listeners (a subscription's error stream and the client-wide stream).

use thiserror::Error;

/// Errors reported by the live query client.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LiveQueryError {
    /// Malformed or unrecognized inbound frame.
    #[error("decode error: {0}")]
    Decode(String),

    /// The server sent an explicit `error` operation.
    #[error("server error {code}: {message} (reconnect={reconnect})")]
    ServerReported {
        /// Numeric error code chosen by the server.
        code: i64,
        /// Human-readable message.
        message: String,
        /// Server advice on whether reconnecting may help.
        reconnect: bool,
    },

    /// Socket-level failure (connect, send, unexpected close).
    #[error("transport error: {0}")]
    Transport(String),

    /// The call is not valid in the current client state.
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// The client could not be configured (e.g. no endpoint derivable).
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The session-token provider failed.
    #[error("session token error: {0}")]
    SessionToken(String),
}

impl LiveQueryError {
    /// Shorthand for a [`LiveQueryError::Decode`].
    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode(message.into())
    }

    /// Shorthand for a [`LiveQueryError::Transport`].
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }

    /// Whether the server suggested that reconnecting may succeed.
    ///
    /// Only server-reported errors carry this advice; transport errors are
    /// considered retryable, everything else is not.
    #[must_use]
    pub fn is_reconnect_advised(&self) -> bool {
        match self {
            Self::ServerReported { reconnect, .. } => *reconnect,
            Self::Transport(_) => true,
            _ => false,
        }
    }
}

/// Result alias used throughout the crate.
pub type Result<T, E = LiveQueryError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_reported_display() {
        let err = LiveQueryError::ServerReported {
            code: 141,
            message: "boom".to_string(),
            reconnect: true,
        };
        assert_eq!(err.to_string(), "server error 141: boom (reconnect=true)");
    }

    #[test]
    fn test_reconnect_advice() {
        assert!(LiveQueryError::transport("reset").is_reconnect_advised());
        assert!(!LiveQueryError::decode("bad").is_reconnect_advised());
        assert!(!LiveQueryError::ServerReported {
            code: 1,
            message: String::new(),
            reconnect: false,
        }
        .is_reconnect_advised());
    }
}
