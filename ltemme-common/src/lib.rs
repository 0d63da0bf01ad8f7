//! ltemme common library
//!
//! Shared infrastructure for the ltemme EPC core:
//!
//! - 3GPP identity types (PLMN, TAI, GUTI, IMSI/IMEI) with bit-exact
//!   wire encodings per TS 24.008 / TS 24.301
//! - Configuration loading for the MME
//! - Logging utilities built on `tracing`
//! - `OctetString` byte-buffer helper for opaque NAS containers

pub mod config;
pub mod error;
pub mod logging;
pub mod octet_string;
pub mod types;

pub use config::MmeConfig;
pub use error::Error;
pub use octet_string::OctetString;
pub use types::{Guti, Imei, Imsi, Plmn, Tai, TaiList};

/// Result type alias using the common error.
pub type Result<T> = std::result::Result<T, Error>;
