//! Error types for SASL exchanges.

/// Result type alias for SASL operations.
pub type Result<T> = std::result::Result<T, Error>;

/// SASL error types.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The peer sent a response that does not follow the mechanism grammar.
    #[error("Invalid SASL response: {0}")]
    InvalidResponse(String),

    /// The server sent a challenge the mechanism did not expect.
    #[error("Unexpected server challenge")]
    UnexpectedChallenge,

    /// The server rejected the credentials with an error payload.
    #[error("Server rejected authentication: {0}")]
    Rejected(String),

    /// The credential check failed.
    #[error("Authentication failed")]
    AuthenticationFailed,

    /// The exchange continued after the mechanism finished.
    #[error("SASL exchange already completed")]
    AlreadyDone,
}
