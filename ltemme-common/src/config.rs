//! Configuration structures for the MME
//!
//! This module provides the MME configuration type, loaded from YAML.
//! Timer intervals and retransmission maxima default to the values of
//! 3GPP TS 24.301 Table 10.2.1.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::types::Plmn;

/// MME (Mobility Management Entity) configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MmeConfig {
    /// Served PLMN
    pub plmn: Plmn,
    /// MME Group Identity (assigned into GUTIs)
    pub mme_group_id: u16,
    /// MME Code (assigned into GUTIs)
    pub mme_code: u8,
    /// Tracking Area Codes served by this MME
    pub tac_list: Vec<u16>,
    /// Timer configuration
    #[serde(default)]
    pub timers: TimerConfig,
    /// Number of authentication vectors requested per HSS round trip
    #[serde(default = "default_auth_vector_batch")]
    pub auth_vector_batch: usize,
    /// Log filter string (e.g. "info,ltemme_emm=debug")
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

fn default_auth_vector_batch() -> usize {
    5
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl MmeConfig {
    /// Loads the configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }

    /// Parses the configuration from a YAML string.
    pub fn parse(text: &str) -> Result<Self, Error> {
        let config: MmeConfig = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Validates invariants the YAML schema cannot express.
    pub fn validate(&self) -> Result<(), Error> {
        if self.tac_list.is_empty() {
            return Err(Error::Config("tac_list must not be empty".to_string()));
        }
        if self.auth_vector_batch == 0 || self.auth_vector_batch > 5 {
            return Err(Error::Config(format!(
                "auth_vector_batch must be 1-5, got {}",
                self.auth_vector_batch
            )));
        }
        Ok(())
    }
}

impl Default for MmeConfig {
    fn default() -> Self {
        Self {
            plmn: Plmn::new(001, 01, false),
            mme_group_id: 1,
            mme_code: 1,
            tac_list: vec![1],
            timers: TimerConfig::default(),
            auth_vector_batch: default_auth_vector_batch(),
            log_filter: default_log_filter(),
        }
    }
}

/// EMM retransmission timer configuration (seconds).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerConfig {
    /// T3450 interval (Attach Accept / GUTI reallocation)
    #[serde(default = "default_t3450")]
    pub t3450_secs: u32,
    /// T3460 interval (Authentication Request / Security Mode Command)
    #[serde(default = "default_t3460")]
    pub t3460_secs: u32,
    /// T3470 interval (Identity Request)
    #[serde(default = "default_t3470")]
    pub t3470_secs: u32,
    /// T3422 interval (network-initiated Detach Request)
    #[serde(default = "default_t3422")]
    pub t3422_secs: u32,
}

fn default_t3450() -> u32 {
    6
}

fn default_t3460() -> u32 {
    6
}

fn default_t3470() -> u32 {
    6
}

fn default_t3422() -> u32 {
    6
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            t3450_secs: default_t3450(),
            t3460_secs: default_t3460(),
            t3470_secs: default_t3470(),
            t3422_secs: default_t3422(),
        }
    }
}

impl fmt::Display for MmeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "MME[plmn={}, group={:04x}, code={:02x}, tacs={}]",
            self.plmn,
            self.mme_group_id,
            self.mme_code,
            self.tac_list.len()
        )
    }
}
