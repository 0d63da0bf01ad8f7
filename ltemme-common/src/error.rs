//! Error types for ltemme

use thiserror::Error;

/// Error types for the ltemme library.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration-related errors.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Network I/O errors.
    #[error("Network error: {0}")]
    Network(#[from] std::io::Error),

    /// Identity encoding errors (BCD digits, GUTI/TAI layouts).
    #[error("Identity encoding error: {0}")]
    IdentityEncode(String),

    /// YAML parsing errors.
    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),
}
