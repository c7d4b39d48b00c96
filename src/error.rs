use thiserror::Error;

/// Main error type for the agent
#[derive(Error, Debug)]
pub enum AccordError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    // Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Invalid state transition: from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    // Network errors
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Transport error: {0}")]
    Transport(String),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // Protocol errors
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Unknown protocol: {0}")]
    UnknownProtocol(String),

    // Policy errors
    #[error("Policy mismatch: {0}")]
    PolicyMismatch(String),

    #[error("Policy merge failed: {0}")]
    PolicyMerge(String),

    // Crypto/signing errors
    #[error("Wallet error: {0}")]
    Wallet(String),

    #[error("Signature error: {0}")]
    Signature(String),

    // Ledger errors
    #[error("Ledger error: {0}")]
    Ledger(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Result type alias for AccordError
pub type Result<T> = std::result::Result<T, AccordError>;
