//! EMM security context management
//!
//! Holds the per-UE EPS security material the EMM procedures operate on,
//! per 3GPP TS 24.301 and TS 33.401:
//!
//! - EPS authentication vectors (RAND/AUTN/XRES/KASME) delivered by the HSS
//! - The key set identifier (eKSI) correlating a context to an AKA run
//! - Selected NAS algorithms and the downlink NAS COUNT
//! - The security-context kind (none / partial native / full native)
//!
//! The engine only tracks where and when key material is selected and
//! validated; the AKA computation and key derivation functions themselves
//! are external collaborators.

use std::fmt;

/// Maximum number of authentication vectors stored per context.
pub const MAX_AUTH_VECTORS: usize = 5;

/// Maximum consecutive SYNCH_FAILUREs tolerated before rejecting.
pub const MAX_SYNC_FAILURES: u32 = 3;

/// KASME key size in bytes.
pub const KASME_SIZE: usize = 32;

/// EPS authentication vector as delivered by the HSS over S6a.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthVector {
    /// Random challenge
    pub rand: [u8; 16],
    /// Authentication token (carries the network's proof and sequence info)
    pub autn: [u8; 16],
    /// Expected response (4-16 bytes per TS 33.401)
    pub xres: Vec<u8>,
    /// KASME root key for this vector
    pub kasme: [u8; KASME_SIZE],
}

/// EPS integrity protection algorithm (TS 24.301 Section 9.9.3.23).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum EiaAlgorithm {
    /// EIA0 (null integrity)
    #[default]
    Eia0 = 0x00,
    /// 128-EIA1 (SNOW3G based)
    Eia1 = 0x01,
    /// 128-EIA2 (AES based)
    Eia2 = 0x02,
    /// 128-EIA3 (ZUC based)
    Eia3 = 0x03,
}

impl TryFrom<u8> for EiaAlgorithm {
    type Error = SecurityError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(EiaAlgorithm::Eia0),
            0x01 => Ok(EiaAlgorithm::Eia1),
            0x02 => Ok(EiaAlgorithm::Eia2),
            0x03 => Ok(EiaAlgorithm::Eia3),
            _ => Err(SecurityError::InvalidIntegrityAlgorithm(value)),
        }
    }
}

/// EPS ciphering algorithm (TS 24.301 Section 9.9.3.23).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum EeaAlgorithm {
    /// EEA0 (null ciphering)
    #[default]
    Eea0 = 0x00,
    /// 128-EEA1 (SNOW3G based)
    Eea1 = 0x01,
    /// 128-EEA2 (AES based)
    Eea2 = 0x02,
    /// 128-EEA3 (ZUC based)
    Eea3 = 0x03,
}

impl TryFrom<u8> for EeaAlgorithm {
    type Error = SecurityError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(EeaAlgorithm::Eea0),
            0x01 => Ok(EeaAlgorithm::Eea1),
            0x02 => Ok(EeaAlgorithm::Eea2),
            0x03 => Ok(EeaAlgorithm::Eea3),
            _ => Err(SecurityError::InvalidCipheringAlgorithm(value)),
        }
    }
}

/// Selected NAS security algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NasSecurityAlgorithms {
    /// Ciphering algorithm (EEA0-EEA3)
    pub ciphering: EeaAlgorithm,
    /// Integrity algorithm (EIA0-EIA3)
    pub integrity: EiaAlgorithm,
}

impl NasSecurityAlgorithms {
    /// Creates a new algorithm selection.
    pub fn new(ciphering: EeaAlgorithm, integrity: EiaAlgorithm) -> Self {
        Self {
            ciphering,
            integrity,
        }
    }

    /// Encodes to a single octet (ciphering in the high nibble).
    pub fn encode(&self) -> u8 {
        ((self.ciphering as u8) << 4) | (self.integrity as u8)
    }

    /// Decodes from a single octet.
    pub fn decode(value: u8) -> Result<Self, SecurityError> {
        Ok(Self {
            ciphering: EeaAlgorithm::try_from((value >> 4) & 0x0F)?,
            integrity: EiaAlgorithm::try_from(value & 0x0F)?,
        })
    }
}

/// NAS key set identifier (eKSI, TS 24.301 Section 9.9.3.21).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct KeySetIdentifier {
    /// KSI value (0-6, 7 = no key available)
    pub ksi: u8,
}

impl KeySetIdentifier {
    /// Value indicating no key is available.
    pub const NO_KEY_AVAILABLE: u8 = 0x07;

    /// Creates a new key set identifier.
    pub fn new(ksi: u8) -> Self {
        Self { ksi: ksi & 0x07 }
    }

    /// Creates a "no key available" identifier.
    pub fn no_key() -> Self {
        Self {
            ksi: Self::NO_KEY_AVAILABLE,
        }
    }

    /// Returns true if no key is available.
    pub fn is_no_key(&self) -> bool {
        self.ksi == Self::NO_KEY_AVAILABLE
    }

    /// Returns the next eKSI value, skipping the reserved value 7.
    pub fn next(&self) -> Self {
        if self.is_no_key() {
            Self::new(0)
        } else {
            Self::new((self.ksi + 1) % Self::NO_KEY_AVAILABLE)
        }
    }
}

impl fmt::Display for KeySetIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_no_key() {
            write!(f, "eKSI[none]")
        } else {
            write!(f, "eKSI[{}]", self.ksi)
        }
    }
}

/// Kind of EPS security context held for a UE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SecurityContextKind {
    /// No security context
    #[default]
    None,
    /// Partial native context (authenticated, not yet taken into use)
    PartialNative,
    /// Full native context (taken into use via security mode control)
    FullNative,
}

impl fmt::Display for SecurityContextKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SecurityContextKind::None => write!(f, "NONE"),
            SecurityContextKind::PartialNative => write!(f, "PARTIAL-NATIVE"),
            SecurityContextKind::FullNative => write!(f, "FULL-NATIVE"),
        }
    }
}

/// Downlink NAS COUNT (overflow counter + sequence number).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NasCount {
    /// Overflow counter (16-bit)
    pub overflow: u16,
    /// Sequence number (8-bit)
    pub sqn: u8,
}

impl NasCount {
    /// Increments the count, carrying the sequence number into overflow.
    pub fn increment(&mut self) {
        let (sqn, carried) = self.sqn.overflowing_add(1);
        self.sqn = sqn;
        if carried {
            self.overflow = self.overflow.wrapping_add(1);
        }
    }

    /// Returns the 24-bit combined value.
    pub fn value(&self) -> u32 {
        (u32::from(self.overflow) << 8) | u32::from(self.sqn)
    }
}

/// Snapshot of the security parameters replaced by a security mode control
/// run, kept for rollback on SECURITY MODE REJECT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SecuritySnapshot {
    /// Selected algorithms before SMC
    pub algorithms: NasSecurityAlgorithms,
    /// eKSI before SMC
    pub eksi: KeySetIdentifier,
    /// Downlink count before SMC
    pub dl_count: NasCount,
    /// Context kind before SMC
    pub kind: SecurityContextKind,
}

/// Per-UE EPS security context.
#[derive(Debug, Clone, Default)]
pub struct SecurityContext {
    /// Stored authentication vectors (at most [`MAX_AUTH_VECTORS`])
    vectors: Vec<AuthVector>,
    /// Index of the vector in use, if any
    selected: Option<usize>,
    /// Key set identifier of the current context
    pub eksi: KeySetIdentifier,
    /// Selected NAS algorithms
    pub algorithms: NasSecurityAlgorithms,
    /// Kind of context currently held
    pub kind: SecurityContextKind,
    /// Downlink NAS COUNT
    pub dl_count: NasCount,
    /// Consecutive SYNCH_FAILUREs in the current authentication run
    pub sync_failure_count: u32,
}

impl SecurityContext {
    /// Creates an empty security context.
    pub fn new() -> Self {
        Self {
            eksi: KeySetIdentifier::no_key(),
            ..Self::default()
        }
    }

    /// Replaces the stored vectors with a fresh batch, clearing selection.
    ///
    /// At most [`MAX_AUTH_VECTORS`] are retained.
    pub fn store_vectors(&mut self, mut vectors: Vec<AuthVector>) {
        vectors.truncate(MAX_AUTH_VECTORS);
        self.vectors = vectors;
        self.selected = None;
    }

    /// Discards all stored vectors and the selection.
    pub fn clear_vectors(&mut self) {
        self.vectors.clear();
        self.selected = None;
    }

    /// Returns the number of stored vectors.
    pub fn vector_count(&self) -> usize {
        self.vectors.len()
    }

    /// Selects the next unused vector, returning it.
    ///
    /// Vectors are consumed front to back; returns `None` when exhausted.
    pub fn select_next_vector(&mut self) -> Option<&AuthVector> {
        let next = match self.selected {
            None => 0,
            Some(i) => i + 1,
        };
        if next >= self.vectors.len() {
            return None;
        }
        self.selected = Some(next);
        self.vectors.get(next)
    }

    /// Returns the vector currently in use.
    pub fn selected_vector(&self) -> Option<&AuthVector> {
        self.selected.and_then(|i| self.vectors.get(i))
    }

    /// Returns true if the context is a valid full native context.
    pub fn is_full_native(&self) -> bool {
        self.kind == SecurityContextKind::FullNative && !self.eksi.is_no_key()
    }

    /// Takes a snapshot of the parameters a security mode run replaces.
    pub fn snapshot(&self) -> SecuritySnapshot {
        SecuritySnapshot {
            algorithms: self.algorithms,
            eksi: self.eksi,
            dl_count: self.dl_count,
            kind: self.kind,
        }
    }

    /// Restores a snapshot taken before a security mode run.
    pub fn restore(&mut self, snapshot: SecuritySnapshot) {
        self.algorithms = snapshot.algorithms;
        self.eksi = snapshot.eksi;
        self.dl_count = snapshot.dl_count;
        self.kind = snapshot.kind;
    }

    /// Marks the context authenticated: a partial native context exists for
    /// the given eKSI until security mode control takes it into use.
    pub fn mark_authenticated(&mut self, eksi: KeySetIdentifier) {
        self.eksi = eksi;
        self.kind = SecurityContextKind::PartialNative;
        self.sync_failure_count = 0;
    }

    /// Marks the context taken into use by a completed security mode run.
    pub fn mark_in_use(&mut self, algorithms: NasSecurityAlgorithms) {
        self.algorithms = algorithms;
        self.kind = SecurityContextKind::FullNative;
    }

    /// Wipes all security state (context teardown).
    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

/// Error type for security operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SecurityError {
    /// Unknown integrity algorithm identifier
    #[error("invalid integrity algorithm: {0:#04x}")]
    InvalidIntegrityAlgorithm(u8),
    /// Unknown ciphering algorithm identifier
    #[error("invalid ciphering algorithm: {0:#04x}")]
    InvalidCipheringAlgorithm(u8),
}
