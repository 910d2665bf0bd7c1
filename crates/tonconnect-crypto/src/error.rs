use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// The system randomness source could not be used.
    #[error("crypto primitive unavailable: {0}")]
    Unavailable(String),

    #[error("invalid {what}: expected 32 bytes, got {len}")]
    InvalidKey { what: &'static str, len: usize },

    #[error("encryption failed")]
    Seal,

    #[error("sealed data failed authentication")]
    Open,
}
