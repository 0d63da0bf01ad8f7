//! ltemme-emm - EPS Mobility Management procedure engine (MME side)
#![allow(missing_docs)]
//!
//! This crate implements the network side of the EMM protocol of
//! 3GPP TS 24.301: the procedures an MME runs against an attached or
//! attaching UE, and the state machine that arbitrates between them.
//!
//! - Common procedures: authentication (Section 5.4.2), security mode
//!   control (5.4.3), identification (5.4.4)
//! - Specific procedures: attach (5.5.1), detach (5.5.2)
//! - The EMM main states with the common-procedure sub-state and the
//!   EMMREG-SAP primitive vocabulary
//! - Generation-guarded retransmission timers owned by the procedures
//!
//! # Architecture
//!
//! All per-UE state lives in [`context::EmmContext`] aggregates owned by a
//! [`context::UeContextManager`]. The [`router::EmmRouter`] is the single
//! entry point: it receives decoded events, drives the procedure modules
//! and returns the outbound side effects as [`sap::EmmAction`] values, so
//! the engine itself performs no I/O and is testable synchronously.
//!
//! ```text
//!   NAS / lower layers / CN answers
//!                │
//!                ▼
//!          ┌───────────┐   actions    ┌──────────────────┐
//!          │ EmmRouter ├─────────────▶│ EMM-AS / S6a / S1 │
//!          └─────┬─────┘              └──────────────────┘
//!                │
//!       ┌────────┴────────┐
//!       │ UeContextManager │  per-UE: identity, security context,
//!       └─────────────────┘  state machine, procedure store, timers
//! ```
//!
//! The [`task`] module wraps the router in an async actor: a typed message
//! channel serializes events and a periodic tick drives the timers.

pub mod context;
pub mod proc;
pub mod router;
pub mod sap;
pub mod security;
pub mod state;
pub mod task;
pub mod timer;

/// Engine-local UE correlation identifier.
///
/// Assigned by the [`context::UeContextManager`]; carried in every
/// [`sap::EmmAction`] so the boundary layers can map it to their own
/// connection identifiers.
pub type UeId = u32;

pub use context::{EmmContext, UeContextManager};
pub use router::{transition, EmmRouter};
pub use sap::{EmmAction, EmmEvent, EmmRegEvent};
pub use state::{EmmState, EmmStateMachine};
pub use task::{EmmMessage, EmmTask, Task, TaskHandle, TaskMessage};
