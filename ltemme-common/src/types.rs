//! Core EPS identity types: PLMN, TAI, TAI list, GUTI, IMSI/IMEI.
//!
//! All encodings follow the 3GPP TS 24.008 / TS 24.301 field layouts so that
//! anything the MME constructs for transmission is bit-exact on the wire.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Public Land Mobile Network identifier.
///
/// A PLMN uniquely identifies a mobile network and consists of:
/// - MCC (Mobile Country Code): 3 decimal digits (001-999)
/// - MNC (Mobile Network Code): 2 or 3 decimal digits
///
/// The `long_mnc` field indicates whether the MNC uses 3 digits (true) or 2 digits (false).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Plmn {
    /// Mobile Country Code (3 digits, range 0-999)
    pub mcc: u16,
    /// Mobile Network Code (2-3 digits, range 0-999)
    pub mnc: u16,
    /// True if MNC is 3 digits, false if 2 digits
    pub long_mnc: bool,
}

impl Plmn {
    /// Creates a new PLMN with the given MCC and MNC.
    pub const fn new(mcc: u16, mnc: u16, long_mnc: bool) -> Self {
        Self { mcc, mnc, long_mnc }
    }

    /// Returns true if this PLMN has valid values set.
    pub fn has_value(&self) -> bool {
        self.mcc > 0 || self.mnc > 0
    }

    /// Encodes the PLMN to 3GPP format (3 bytes).
    ///
    /// The encoding follows 3GPP TS 24.008:
    /// - Byte 0: MCC digit 2 (high nibble) | MCC digit 1 (low nibble)
    /// - Byte 1: MNC digit 3 or 0xF (high nibble) | MCC digit 3 (low nibble)
    /// - Byte 2: MNC digit 2 (high nibble) | MNC digit 1 (low nibble)
    pub fn encode(&self) -> [u8; 3] {
        let mcc = self.mcc;
        let mcc3 = (mcc % 10) as u8;
        let mcc2 = ((mcc % 100) / 10) as u8;
        let mcc1 = ((mcc % 1000) / 100) as u8;

        let mnc = self.mnc;
        let (mnc1, mnc2, mnc3) = if self.long_mnc {
            (
                ((mnc % 1000) / 100) as u8,
                ((mnc % 100) / 10) as u8,
                (mnc % 10) as u8,
            )
        } else {
            (((mnc % 100) / 10) as u8, (mnc % 10) as u8, 0x0F)
        };

        let octet1 = (mcc2 << 4) | mcc1;
        let octet2 = (mnc3 << 4) | mcc3;
        let octet3 = (mnc2 << 4) | mnc1;

        [octet1, octet2, octet3]
    }

    /// Decodes a PLMN from 3GPP format (3 bytes).
    pub fn decode(bytes: [u8; 3]) -> Self {
        let octet1 = bytes[0];
        let octet2 = bytes[1];
        let octet3 = bytes[2];

        let mcc1 = (octet1 & 0x0F) as u16;
        let mcc2 = ((octet1 >> 4) & 0x0F) as u16;
        let mcc3 = (octet2 & 0x0F) as u16;
        let mcc = 100 * mcc1 + 10 * mcc2 + mcc3;

        let mnc3 = (octet2 >> 4) & 0x0F;
        let mnc1 = (octet3 & 0x0F) as u16;
        let mnc2 = ((octet3 >> 4) & 0x0F) as u16;

        let (mnc, long_mnc) = if mnc3 != 0x0F {
            (10 * (10 * mnc1 + mnc2) + mnc3 as u16, true)
        } else {
            (10 * mnc1 + mnc2, false)
        };

        Self { mcc, mnc, long_mnc }
    }
}

impl fmt::Debug for Plmn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.long_mnc {
            write!(f, "Plmn({:03}-{:03})", self.mcc, self.mnc)
        } else {
            write!(f, "Plmn({:03}-{:02})", self.mcc, self.mnc)
        }
    }
}

impl fmt::Display for Plmn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.long_mnc {
            write!(f, "{:03}{:03}", self.mcc, self.mnc)
        } else {
            write!(f, "{:03}{:02}", self.mcc, self.mnc)
        }
    }
}

impl Default for Plmn {
    fn default() -> Self {
        Self {
            mcc: 0,
            mnc: 0,
            long_mnc: false,
        }
    }
}

/// Tracking Area Identity.
///
/// TAI = PLMN + 16-bit Tracking Area Code, encoded as 5 octets
/// (3GPP TS 24.301 Section 9.9.3.32).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Tai {
    /// PLMN of the tracking area
    pub plmn: Plmn,
    /// Tracking Area Code (16-bit)
    pub tac: u16,
}

impl Tai {
    /// Creates a new TAI.
    pub const fn new(plmn: Plmn, tac: u16) -> Self {
        Self { plmn, tac }
    }

    /// Encodes the TAI to 5 octets (PLMN followed by TAC, big-endian).
    pub fn encode(&self) -> [u8; 5] {
        let plmn = self.plmn.encode();
        [
            plmn[0],
            plmn[1],
            plmn[2],
            (self.tac >> 8) as u8,
            (self.tac & 0xFF) as u8,
        ]
    }

    /// Decodes a TAI from 5 octets.
    pub fn decode(bytes: [u8; 5]) -> Self {
        let plmn = Plmn::decode([bytes[0], bytes[1], bytes[2]]);
        let tac = ((bytes[3] as u16) << 8) | bytes[4] as u16;
        Self { plmn, tac }
    }
}

impl fmt::Display for Tai {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{:04x}", self.plmn, self.tac)
    }
}

/// Tracking Area Identity list.
///
/// Encoded as a type-0 partial list (one PLMN, list of non-consecutive TACs)
/// per 3GPP TS 24.301 Section 9.9.3.33. A partial list holds 1-16 TACs.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TaiList {
    /// PLMN shared by all entries
    pub plmn: Plmn,
    /// Tracking Area Codes (1-16 entries)
    pub tacs: Vec<u16>,
}

/// Maximum number of TACs in one partial TAI list.
pub const TAI_LIST_MAX_TACS: usize = 16;

impl TaiList {
    /// Creates a new TAI list for the given PLMN and TACs.
    ///
    /// Returns an error if the TAC list is empty or exceeds 16 entries.
    pub fn new(plmn: Plmn, tacs: Vec<u16>) -> Result<Self, Error> {
        if tacs.is_empty() || tacs.len() > TAI_LIST_MAX_TACS {
            return Err(Error::IdentityEncode(format!(
                "TAI list must hold 1-16 TACs, got {}",
                tacs.len()
            )));
        }
        Ok(Self { plmn, tacs })
    }

    /// Encodes the list as one type-0 partial list.
    ///
    /// Layout: header octet (type `00` in bits 6-5, number of elements minus
    /// one in bits 4-0), 3-octet PLMN, then one 2-octet TAC per entry.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + 2 * self.tacs.len());
        let n = (self.tacs.len() as u8 - 1) & 0x1F;
        out.push(n); // type bits are zero for a type-0 list
        out.extend_from_slice(&self.plmn.encode());
        for tac in &self.tacs {
            out.push((tac >> 8) as u8);
            out.push((tac & 0xFF) as u8);
        }
        out
    }

    /// Returns true if the list contains the given TAI.
    pub fn contains(&self, tai: &Tai) -> bool {
        tai.plmn == self.plmn && self.tacs.contains(&tai.tac)
    }
}

/// Globally Unique Temporary Identity for EPS.
///
/// GUTI = PLMN + MME Group ID (16-bit) + MME Code (8-bit) + M-TMSI (32-bit),
/// encoded as 10 octets per 3GPP TS 23.003 Section 2.8.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Guti {
    /// PLMN of the assigning MME
    pub plmn: Plmn,
    /// MME Group Identity
    pub mme_group_id: u16,
    /// MME Code
    pub mme_code: u8,
    /// M-TMSI assigned to the UE
    pub m_tmsi: u32,
}

impl Guti {
    /// Creates a new GUTI.
    pub const fn new(plmn: Plmn, mme_group_id: u16, mme_code: u8, m_tmsi: u32) -> Self {
        Self {
            plmn,
            mme_group_id,
            mme_code,
            m_tmsi,
        }
    }

    /// Returns true if the GUTI carries a real assignment.
    pub fn has_value(&self) -> bool {
        self.m_tmsi != 0
    }

    /// Encodes the GUTI to 10 octets (PLMN, group id, code, M-TMSI, big-endian).
    pub fn encode(&self) -> [u8; 10] {
        let plmn = self.plmn.encode();
        [
            plmn[0],
            plmn[1],
            plmn[2],
            (self.mme_group_id >> 8) as u8,
            (self.mme_group_id & 0xFF) as u8,
            self.mme_code,
            (self.m_tmsi >> 24) as u8,
            (self.m_tmsi >> 16) as u8,
            (self.m_tmsi >> 8) as u8,
            (self.m_tmsi & 0xFF) as u8,
        ]
    }

    /// Decodes a GUTI from 10 octets.
    pub fn decode(bytes: [u8; 10]) -> Self {
        Self {
            plmn: Plmn::decode([bytes[0], bytes[1], bytes[2]]),
            mme_group_id: ((bytes[3] as u16) << 8) | bytes[4] as u16,
            mme_code: bytes[5],
            m_tmsi: ((bytes[6] as u32) << 24)
                | ((bytes[7] as u32) << 16)
                | ((bytes[8] as u32) << 8)
                | bytes[9] as u32,
        }
    }
}

impl fmt::Display for Guti {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{:04x}-{:02x}-{:08x}",
            self.plmn, self.mme_group_id, self.mme_code, self.m_tmsi
        )
    }
}

/// Encodes a decimal digit string as BCD with trailing 0xF filler.
///
/// Digits are packed two per octet, low nibble first (TS 24.008 mobile
/// identity digit packing).
fn encode_bcd(digits: &str) -> Result<Vec<u8>, Error> {
    let mut out = Vec::with_capacity(digits.len().div_ceil(2));
    let mut chars = digits.chars();
    loop {
        let low = match chars.next() {
            Some(c) => c
                .to_digit(10)
                .ok_or_else(|| Error::IdentityEncode(format!("non-decimal digit '{c}'")))?
                as u8,
            None => break,
        };
        let high = match chars.next() {
            Some(c) => c
                .to_digit(10)
                .ok_or_else(|| Error::IdentityEncode(format!("non-decimal digit '{c}'")))?
                as u8,
            None => 0x0F,
        };
        out.push((high << 4) | low);
    }
    Ok(out)
}

fn decode_bcd(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let low = byte & 0x0F;
        if low == 0x0F {
            break;
        }
        out.push(char::from(b'0' + low));
        let high = byte >> 4;
        if high == 0x0F {
            break;
        }
        out.push(char::from(b'0' + high));
    }
    out
}

/// International Mobile Subscriber Identity (up to 15 decimal digits).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Imsi(String);

/// Maximum number of IMSI digits.
pub const IMSI_MAX_DIGITS: usize = 15;

impl Imsi {
    /// Creates an IMSI from a decimal digit string.
    pub fn new(digits: &str) -> Result<Self, Error> {
        if digits.is_empty() || digits.len() > IMSI_MAX_DIGITS {
            return Err(Error::IdentityEncode(format!(
                "IMSI must hold 1-15 digits, got {}",
                digits.len()
            )));
        }
        if !digits.chars().all(|c| c.is_ascii_digit()) {
            return Err(Error::IdentityEncode(format!("invalid IMSI '{digits}'")));
        }
        Ok(Self(digits.to_string()))
    }

    /// Returns the digit string.
    pub fn digits(&self) -> &str {
        &self.0
    }

    /// Encodes the IMSI as BCD digit pairs (no identity-type header).
    pub fn encode_bcd(&self) -> Vec<u8> {
        // digits were validated at construction
        encode_bcd(&self.0).unwrap_or_default()
    }

    /// Decodes an IMSI from BCD digit pairs.
    pub fn decode_bcd(bytes: &[u8]) -> Result<Self, Error> {
        Self::new(&decode_bcd(bytes))
    }
}

impl fmt::Display for Imsi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// International Mobile Equipment Identity (15 decimal digits).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Imei(String);

impl Imei {
    /// Creates an IMEI from a decimal digit string.
    pub fn new(digits: &str) -> Result<Self, Error> {
        if digits.len() != 15 || !digits.chars().all(|c| c.is_ascii_digit()) {
            return Err(Error::IdentityEncode(format!("invalid IMEI '{digits}'")));
        }
        Ok(Self(digits.to_string()))
    }

    /// Returns the digit string.
    pub fn digits(&self) -> &str {
        &self.0
    }

    /// Encodes the IMEI as BCD digit pairs.
    pub fn encode_bcd(&self) -> Vec<u8> {
        encode_bcd(&self.0).unwrap_or_default()
    }
}

impl fmt::Display for Imei {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
