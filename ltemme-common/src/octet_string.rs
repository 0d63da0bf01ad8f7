//! `OctetString` type for variable-length byte sequences.
//!
//! Opaque NAS containers crossing the EMM-AS boundary are carried as
//! `OctetString` values; the engine never interprets their contents.

use std::fmt;

/// A variable-length sequence of octets (bytes).
#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct OctetString {
    data: Vec<u8>,
}

impl OctetString {
    /// Creates a new empty `OctetString`.
    pub fn new() -> Self {
        Self { data: Vec::new() }
    }

    /// Creates an `OctetString` from a `Vec<u8>`.
    pub fn from_vec(data: Vec<u8>) -> Self {
        Self { data }
    }

    /// Creates an `OctetString` from a byte slice.
    pub fn from_slice(data: &[u8]) -> Self {
        Self {
            data: data.to_vec(),
        }
    }

    /// Appends a single octet.
    pub fn append_octet(&mut self, value: u8) {
        self.data.push(value);
    }

    /// Appends a 16-bit value (big-endian).
    pub fn append_u16(&mut self, value: u16) {
        self.data.extend_from_slice(&value.to_be_bytes());
    }

    /// Appends a 32-bit value (big-endian).
    pub fn append_u32(&mut self, value: u32) {
        self.data.extend_from_slice(&value.to_be_bytes());
    }

    /// Appends a byte slice.
    pub fn append_slice(&mut self, data: &[u8]) {
        self.data.extend_from_slice(data);
    }

    /// Returns the length in octets.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true if the string is empty.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Returns the underlying bytes as a slice.
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Consumes the string, returning the underlying vector.
    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }

    /// Returns the contents as a lowercase hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(&self.data)
    }
}

impl fmt::Debug for OctetString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OctetString[{}]({})", self.data.len(), self.to_hex())
    }
}

impl From<Vec<u8>> for OctetString {
    fn from(data: Vec<u8>) -> Self {
        Self { data }
    }
}

impl AsRef<[u8]> for OctetString {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}
