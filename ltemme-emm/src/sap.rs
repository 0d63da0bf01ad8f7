//! EMM service access points
//!
//! Event and action vocabulary at the engine's boundaries:
//!
//! - [`EmmEvent`]: external stimuli serialized per UE (NAS message arrival,
//!   timer expiry, lower-layer delivery report, core-network response)
//! - [`EmmRegEvent`]: EMMREG-SAP primitives the router validates against
//!   the EMM state machine (3GPP TS 24.301 Section 5.1.3.4 vocabulary)
//! - [`EmmAction`]: outbound fire-and-forget dispatches toward the access
//!   stratum (EMM-AS) and the core network; responses re-enter later as
//!   new [`EmmEvent`]s
//!
//! Downlink NAS payloads carry a 64-bit digest computed by
//! [`message_digest`]; lower-layer delivery reports quote it so the router
//! can correlate them with the outstanding message.

use std::fmt;

use ltemme_common::{Guti, Imei, Imsi, OctetString, Plmn, Tai};

use crate::proc::CommonProcKind;
use crate::security::{AuthVector, KeySetIdentifier};
use crate::timer::TimerExpiryEvent;
use crate::UeId;

// ============================================================================
// Message digest
// ============================================================================

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Computes the 64-bit FNV-1a digest of an encoded downlink payload.
///
/// Used purely for delivery correlation, not for integrity protection.
pub fn message_digest(data: &[u8]) -> u64 {
    data.iter().fold(FNV_OFFSET_BASIS, |hash, byte| {
        (hash ^ u64::from(*byte)).wrapping_mul(FNV_PRIME)
    })
}

// ============================================================================
// NAS message vocabulary
// ============================================================================

/// EMM message types (3GPP TS 24.301 Section 9.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NasMessageType {
    /// ATTACH REQUEST
    AttachRequest = 0x41,
    /// ATTACH ACCEPT
    AttachAccept = 0x42,
    /// ATTACH COMPLETE
    AttachComplete = 0x43,
    /// ATTACH REJECT
    AttachReject = 0x44,
    /// DETACH REQUEST
    DetachRequest = 0x45,
    /// DETACH ACCEPT
    DetachAccept = 0x46,
    /// AUTHENTICATION REQUEST
    AuthenticationRequest = 0x52,
    /// AUTHENTICATION RESPONSE
    AuthenticationResponse = 0x53,
    /// AUTHENTICATION REJECT
    AuthenticationReject = 0x54,
    /// AUTHENTICATION FAILURE
    AuthenticationFailure = 0x5C,
    /// IDENTITY REQUEST
    IdentityRequest = 0x55,
    /// IDENTITY RESPONSE
    IdentityResponse = 0x56,
    /// SECURITY MODE COMMAND
    SecurityModeCommand = 0x5D,
    /// SECURITY MODE COMPLETE
    SecurityModeComplete = 0x5E,
    /// SECURITY MODE REJECT
    SecurityModeReject = 0x5F,
}

impl NasMessageType {
    /// Returns the message type octet.
    pub fn code(&self) -> u8 {
        *self as u8
    }
}

impl fmt::Display for NasMessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NasMessageType::AttachRequest => "ATTACH REQUEST",
            NasMessageType::AttachAccept => "ATTACH ACCEPT",
            NasMessageType::AttachComplete => "ATTACH COMPLETE",
            NasMessageType::AttachReject => "ATTACH REJECT",
            NasMessageType::DetachRequest => "DETACH REQUEST",
            NasMessageType::DetachAccept => "DETACH ACCEPT",
            NasMessageType::AuthenticationRequest => "AUTHENTICATION REQUEST",
            NasMessageType::AuthenticationResponse => "AUTHENTICATION RESPONSE",
            NasMessageType::AuthenticationReject => "AUTHENTICATION REJECT",
            NasMessageType::AuthenticationFailure => "AUTHENTICATION FAILURE",
            NasMessageType::IdentityRequest => "IDENTITY REQUEST",
            NasMessageType::IdentityResponse => "IDENTITY RESPONSE",
            NasMessageType::SecurityModeCommand => "SECURITY MODE COMMAND",
            NasMessageType::SecurityModeComplete => "SECURITY MODE COMPLETE",
            NasMessageType::SecurityModeReject => "SECURITY MODE REJECT",
        };
        write!(f, "{name}")
    }
}

/// EMM cause values sent in reject messages (3GPP TS 24.301 Section 9.9.3.9).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EmmCause {
    /// IMSI unknown in HSS
    ImsiUnknownInHss = 2,
    /// Illegal UE
    IllegalUe = 3,
    /// UE identity cannot be derived by the network
    UeIdentityCannotBeDerived = 9,
    /// Implicitly detached
    ImplicitlyDetached = 10,
    /// Network failure
    NetworkFailure = 17,
    /// Congestion
    Congestion = 22,
    /// Security mode rejected, unspecified
    SecurityModeRejectedUnspecified = 24,
    /// Protocol error, unspecified
    ProtocolErrorUnspecified = 111,
}

impl EmmCause {
    /// Returns the cause octet.
    pub fn code(&self) -> u8 {
        *self as u8
    }
}

/// Cause carried in AUTHENTICATION FAILURE (3GPP TS 24.301 Section 5.4.2.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailureCause {
    /// Cause #20: MAC failure
    MacFailure,
    /// Cause #21: synch failure (carries AUTS for resynchronization)
    SynchFailure,
    /// Cause #26: non-EPS authentication unacceptable
    NonEpsAuthUnacceptable,
    /// Any other cause value
    Unknown(u8),
}

impl From<u8> for AuthFailureCause {
    fn from(value: u8) -> Self {
        match value {
            20 => AuthFailureCause::MacFailure,
            21 => AuthFailureCause::SynchFailure,
            26 => AuthFailureCause::NonEpsAuthUnacceptable,
            other => AuthFailureCause::Unknown(other),
        }
    }
}

/// Identity type requested in IDENTITY REQUEST (TS 24.008 Section 10.5.3.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum IdentityType {
    /// IMSI
    Imsi = 1,
    /// IMEI
    Imei = 2,
}

/// Mobile identity presented by the UE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MobileIdentity {
    /// Permanent subscriber identity
    Imsi(Imsi),
    /// Temporary identity assigned by an MME
    Guti(Guti),
    /// Equipment identity
    Imei(Imei),
}

impl fmt::Display for MobileIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MobileIdentity::Imsi(imsi) => write!(f, "IMSI[{imsi}]"),
            MobileIdentity::Guti(guti) => write!(f, "GUTI[{guti}]"),
            MobileIdentity::Imei(imei) => write!(f, "IMEI[{imei}]"),
        }
    }
}

/// EPS attach type (3GPP TS 24.301 Section 9.9.3.11).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AttachType {
    /// EPS attach
    #[default]
    EpsAttach,
    /// Combined EPS/IMSI attach
    CombinedAttach,
    /// EPS emergency attach
    EmergencyAttach,
}

/// Information elements of an ATTACH REQUEST the engine acts on.
///
/// Equality over the whole set is what classifies a repeated ATTACH REQUEST
/// as a retransmission rather than a new attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachRequestIes {
    /// Requested attach type
    pub attach_type: AttachType,
    /// Key set identifier the UE believes is current
    pub eksi: KeySetIdentifier,
    /// Identity the UE presented (IMSI or GUTI)
    pub identity: MobileIdentity,
    /// UE network capability IE, replayed verbatim in SECURITY MODE COMMAND
    pub ue_network_capability: OctetString,
    /// Opaque ESM container (PDN CONNECTIVITY REQUEST)
    pub esm_container: OctetString,
    /// Last visited registered TAI, if the UE reported one
    pub last_visited_tai: Option<Tai>,
}

/// Decoded inbound NAS messages the engine consumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NasMessage {
    /// ATTACH REQUEST
    AttachRequest(AttachRequestIes),
    /// ATTACH COMPLETE
    AttachComplete,
    /// DETACH REQUEST (UE-initiated)
    DetachRequest {
        /// True if the UE is switching off (no DETACH ACCEPT expected)
        switch_off: bool,
    },
    /// DETACH ACCEPT (answer to a network-initiated detach)
    DetachAccept,
    /// IDENTITY RESPONSE
    IdentityResponse {
        /// Identity the UE disclosed
        identity: MobileIdentity,
    },
    /// AUTHENTICATION RESPONSE
    AuthenticationResponse {
        /// RES parameter (compared against the stored XRES)
        res: Vec<u8>,
    },
    /// AUTHENTICATION FAILURE
    AuthenticationFailure {
        /// Failure cause reported by the UE
        cause: AuthFailureCause,
        /// AUTS resynchronization token (present for synch failure)
        auts: Option<Vec<u8>>,
    },
    /// SECURITY MODE COMPLETE
    SecurityModeComplete,
    /// SECURITY MODE REJECT
    SecurityModeReject {
        /// EMM cause reported by the UE
        cause: u8,
    },
}

impl NasMessage {
    /// Returns the message type of this message.
    pub fn message_type(&self) -> NasMessageType {
        match self {
            NasMessage::AttachRequest(_) => NasMessageType::AttachRequest,
            NasMessage::AttachComplete => NasMessageType::AttachComplete,
            NasMessage::DetachRequest { .. } => NasMessageType::DetachRequest,
            NasMessage::DetachAccept => NasMessageType::DetachAccept,
            NasMessage::IdentityResponse { .. } => NasMessageType::IdentityResponse,
            NasMessage::AuthenticationResponse { .. } => NasMessageType::AuthenticationResponse,
            NasMessage::AuthenticationFailure { .. } => NasMessageType::AuthenticationFailure,
            NasMessage::SecurityModeComplete => NasMessageType::SecurityModeComplete,
            NasMessage::SecurityModeReject { .. } => NasMessageType::SecurityModeReject,
        }
    }
}

// ============================================================================
// External events
// ============================================================================

/// Lower-layer delivery reports and connection events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LowerLayerEvent {
    /// The message with the given digest was delivered
    Success {
        /// Digest of the delivered downlink payload
        digest: u64,
    },
    /// Delivery of the message with the given digest failed
    Failure {
        /// Digest of the failed downlink payload
        digest: u64,
    },
    /// The message was not delivered due to handover; retry without
    /// charging the retransmission budget
    NonDelivery {
        /// Digest of the undelivered downlink payload
        digest: u64,
    },
    /// The NAS signalling connection was released
    Release,
}

/// Answers arriving from the core network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CnResponse {
    /// Fresh authentication vectors from the HSS
    AuthVectors {
        /// Delivered vectors (at most the requested batch size)
        vectors: Vec<AuthVector>,
    },
    /// The HSS could not supply vectors
    AuthVectorsFailure {
        /// EMM cause to report toward the UE
        cause: EmmCause,
    },
    /// Default bearer established; carries the ESM accept container
    SessionEstablished {
        /// Opaque ESM container to piggyback on ATTACH ACCEPT
        esm_container: OctetString,
    },
    /// Default bearer establishment failed
    SessionFailed {
        /// EMM cause to report toward the UE
        cause: EmmCause,
    },
}

/// External stimulus for one UE, processed strictly in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmmEvent {
    /// A decoded NAS message arrived
    Nas(NasMessage),
    /// A retransmission timer expired
    TimerExpiry(TimerExpiryEvent),
    /// Lower-layer delivery report or connection event
    LowerLayer(LowerLayerEvent),
    /// Core-network answer
    Cn(CnResponse),
}

// ============================================================================
// EMMREG-SAP primitives
// ============================================================================

/// EMMREG-SAP primitives routed through the EMM state machine.
///
/// The router consumes these against the transition table; a primitive not
/// valid in the current state is logged and discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmmRegEvent {
    /// A common procedure was started
    CommonProcReq(CommonProcKind),
    /// A common procedure completed successfully
    CommonProcCnf(CommonProcKind),
    /// A common procedure was rejected
    CommonProcRej(CommonProcKind),
    /// A common procedure was aborted
    CommonProcAbort(CommonProcKind),
    /// Attach completed (ATTACH COMPLETE received)
    AttachCnf,
    /// Attach rejected
    AttachRej,
    /// Attach aborted
    AttachAbort,
    /// Network-initiated detach started
    DetachInit,
    /// UE-initiated detach requested
    DetachReq,
    /// Detach failed
    DetachFailed,
    /// Detach confirmed
    DetachCnf,
    /// Tracking area update requested
    TauReq,
    /// Tracking area update confirmed
    TauCnf,
    /// Tracking area update rejected
    TauRej,
    /// Tracking area update aborted
    TauAbort,
    /// Service request received
    ServiceReq,
    /// Service request confirmed
    ServiceCnf,
    /// Service request rejected
    ServiceRej,
    /// Downlink message delivered
    LowerLayerSuccess,
    /// Downlink message delivery failed
    LowerLayerFailure,
    /// Downlink message not delivered (handover)
    LowerLayerNonDelivery,
    /// NAS signalling connection released
    LowerLayerRelease,
}

impl fmt::Display for EmmRegEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EmmRegEvent::CommonProcReq(kind) => write!(f, "COMMON_PROC_REQ({kind})"),
            EmmRegEvent::CommonProcCnf(kind) => write!(f, "COMMON_PROC_CNF({kind})"),
            EmmRegEvent::CommonProcRej(kind) => write!(f, "COMMON_PROC_REJ({kind})"),
            EmmRegEvent::CommonProcAbort(kind) => write!(f, "COMMON_PROC_ABORT({kind})"),
            EmmRegEvent::AttachCnf => write!(f, "ATTACH_CNF"),
            EmmRegEvent::AttachRej => write!(f, "ATTACH_REJ"),
            EmmRegEvent::AttachAbort => write!(f, "ATTACH_ABORT"),
            EmmRegEvent::DetachInit => write!(f, "DETACH_INIT"),
            EmmRegEvent::DetachReq => write!(f, "DETACH_REQ"),
            EmmRegEvent::DetachFailed => write!(f, "DETACH_FAILED"),
            EmmRegEvent::DetachCnf => write!(f, "DETACH_CNF"),
            EmmRegEvent::TauReq => write!(f, "TAU_REQ"),
            EmmRegEvent::TauCnf => write!(f, "TAU_CNF"),
            EmmRegEvent::TauRej => write!(f, "TAU_REJ"),
            EmmRegEvent::TauAbort => write!(f, "TAU_ABORT"),
            EmmRegEvent::ServiceReq => write!(f, "SERVICE_REQ"),
            EmmRegEvent::ServiceCnf => write!(f, "SERVICE_CNF"),
            EmmRegEvent::ServiceRej => write!(f, "SERVICE_REJ"),
            EmmRegEvent::LowerLayerSuccess => write!(f, "LOWERLAYER_SUCCESS"),
            EmmRegEvent::LowerLayerFailure => write!(f, "LOWERLAYER_FAILURE"),
            EmmRegEvent::LowerLayerNonDelivery => write!(f, "LOWERLAYER_NON_DELIVERY"),
            EmmRegEvent::LowerLayerRelease => write!(f, "LOWERLAYER_RELEASE"),
        }
    }
}

// ============================================================================
// Outbound actions
// ============================================================================

/// Outbound side-effects produced by event processing.
///
/// Dispatch is fire-and-forget: queuing the action means "handed to the
/// boundary", not "delivered"; delivery reports and CN answers re-enter as
/// [`EmmEvent`]s.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmmAction {
    /// Send a downlink NAS message over the established connection
    SendNasMessage {
        /// Target UE
        ue_id: UeId,
        /// Message type (for logging / boundary routing)
        msg_type: NasMessageType,
        /// Encoded payload handed to the EMM-AS boundary
        payload: OctetString,
        /// Correlation digest of the payload
        digest: u64,
    },
    /// Confirm NAS connection establishment, piggybacking ATTACH ACCEPT
    EstablishCnf {
        /// Target UE
        ue_id: UeId,
        /// Encoded ATTACH ACCEPT container
        payload: OctetString,
        /// Correlation digest of the payload
        digest: u64,
    },
    /// Reject NAS connection establishment (ATTACH REJECT)
    EstablishRej {
        /// Target UE
        ue_id: UeId,
        /// Reject cause
        cause: EmmCause,
    },
    /// Release the NAS signalling connection
    ReleaseConnection {
        /// Target UE
        ue_id: UeId,
    },
    /// Ask the HSS for fresh authentication vectors
    RequestAuthVectors {
        /// Target UE
        ue_id: UeId,
        /// Subscriber identity
        imsi: Imsi,
        /// Serving PLMN
        plmn: Plmn,
        /// Number of vectors requested
        count: usize,
        /// RAND + AUTS pair for resynchronization, if recovering from a
        /// synch failure
        resync: Option<(Vec<u8>, Vec<u8>)>,
    },
    /// Announce a newly assigned GUTI to the core network
    NotifyNewGuti {
        /// Target UE
        ue_id: UeId,
        /// Assigned GUTI
        guti: Guti,
    },
    /// Hand the ESM container to the session layer for default bearer setup
    RequestSessionEstablishment {
        /// Target UE
        ue_id: UeId,
        /// Opaque ESM container from the ATTACH REQUEST
        esm_container: OctetString,
    },
    /// Tear down any session-layer state for an implicitly detached UE
    NotifySessionRelease {
        /// Target UE
        ue_id: UeId,
    },
}
