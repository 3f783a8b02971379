//! Application-wide error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum IndexerError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Malformed {event} log: {reason}")]
    MalformedLog { event: &'static str, reason: String },

    #[error("Unmapped status code {0}")]
    UnmappedStatusCode(u8),

    #[error("{entity} {id} does not exist")]
    DanglingReference { entity: &'static str, id: String },

    #[error("Impact credit already minted for verification {0}")]
    DuplicateCredit(String),

    #[error("Verification {id} already resolved as {stored}, ignoring outcome {incoming}")]
    ConflictingOutcome {
        id: String,
        stored: String,
        incoming: String,
    },

    #[error("Log source error: {0}")]
    TransientSource(String),

    #[error("Metadata error: {0}")]
    Metadata(String),
}

impl IndexerError {
    pub(crate) fn malformed(event: &'static str, reason: impl Into<String>) -> Self {
        Self::MalformedLog {
            event,
            reason: reason.into(),
        }
    }

    /// Errors that only affect a single event and must never abort a pass.
    pub fn is_event_scoped(&self) -> bool {
        matches!(
            self,
            Self::MalformedLog { .. }
                | Self::UnmappedStatusCode(_)
                | Self::DanglingReference { .. }
                | Self::DuplicateCredit(_)
                | Self::ConflictingOutcome { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, IndexerError>;
