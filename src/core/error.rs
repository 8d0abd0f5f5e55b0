use std::path::PathBuf;

use thiserror::Error;

/// Failures surfaced by the session engine and its collaborators.
///
/// Turn-local failures (`Transport`, `FrameParse`) are recorded on the
/// in-flight assistant message and never cross into the UI as errors.
/// `Configuration` is fatal to session initialization.
#[derive(Debug, Error)]
pub enum MimicError {
    /// Missing or unusable configuration (no credential, no config file).
    #[error("{0}")]
    Configuration(String),

    /// The completion API could not be reached or rejected the request.
    ///
    /// `retryable` is set for failures that happened before the server
    /// produced an answer worth keeping: connect errors, timeouts, 429 and
    /// 5xx responses.
    #[error("{message}")]
    Transport { message: String, retryable: bool },

    /// A single stream frame could not be decoded.
    #[error("{0}")]
    FrameParse(String),

    /// A transcript snapshot could not be written.
    #[error("failed to persist conversation {conversation_id}: {reason}")]
    Persistence {
        conversation_id: String,
        reason: String,
    },

    /// A new turn was requested while another is still streaming.
    #[error("an assistant reply is still streaming")]
    TurnInFlight,

    /// Reading or writing a file under the storage base directory failed.
    #[error("{action} {}: {source}", .path.display())]
    Storage {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A stored document was not valid JSON for its type.
    #[error("invalid JSON in {}: {source}", .path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// A bot slug was rejected by validation or collided with an existing bot.
    #[error("{0}")]
    InvalidBot(String),
}

impl MimicError {
    pub(crate) fn storage(
        action: &'static str,
        path: impl Into<PathBuf>,
        source: std::io::Error,
    ) -> Self {
        MimicError::Storage {
            action,
            path: path.into(),
            source,
        }
    }

    pub(crate) fn transport(message: impl Into<String>) -> Self {
        MimicError::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    pub(crate) fn transient(message: impl Into<String>) -> Self {
        MimicError::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Whether a failed transport call is worth retrying on connection setup.
    pub fn is_retryable(&self) -> bool {
        matches!(self, MimicError::Transport { retryable: true, .. })
    }
}

pub type Result<T, E = MimicError> = std::result::Result<T, E>;
