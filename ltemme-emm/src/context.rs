//! EMM context and UE context management
//!
//! The [`EmmContext`] is the per-UE aggregate: identity fields with their
//! validity flags, the security context, the EMM state machine and the
//! procedure store. Contexts are owned by the [`UeContextManager`], which
//! indexes them by IMSI and GUTI for attach-time resolution; the engine's
//! entry points receive explicit context references, never globals.

use std::collections::HashMap;

use ltemme_common::config::TimerConfig;
use ltemme_common::{Guti, Imei, Imsi};

use crate::proc::ProcedureStore;
use crate::sap::MobileIdentity;
use crate::security::SecurityContext;
use crate::state::EmmStateMachine;
use crate::UeId;

/// Identity fields and their validity.
///
/// "Present" means the value arrived in some message; "valid" means it was
/// confirmed by a completed procedure (identification for IMSI, attach
/// completion for GUTI).
#[derive(Debug, Clone, Default)]
pub struct UeIdentity {
    /// Subscriber identity, if known
    pub imsi: Option<Imsi>,
    /// True once the IMSI was confirmed
    pub imsi_valid: bool,
    /// Equipment identity, if disclosed
    pub imei: Option<Imei>,
    /// Assigned temporary identity, if any
    pub guti: Option<Guti>,
    /// True once the UE acknowledged the GUTI (ATTACH COMPLETE)
    pub guti_valid: bool,
}

impl UeIdentity {
    /// Returns true if the subscriber identity is confirmed.
    pub fn imsi_confirmed(&self) -> bool {
        self.imsi.is_some() && self.imsi_valid
    }
}

/// Per-UE EMM state aggregate.
#[derive(Debug, Clone)]
pub struct EmmContext {
    /// Correlation id assigned by the manager
    pub ue_id: UeId,
    /// Identity fields
    pub identity: UeIdentity,
    /// EPS security material
    pub security: SecurityContext,
    /// EMM state machine
    pub fsm: EmmStateMachine,
    /// Running procedures
    pub procedures: ProcedureStore,
    /// Timer intervals this context's procedures are created with
    pub timers: TimerConfig,
}

impl EmmContext {
    /// Creates a fresh context in EMM-DEREGISTERED.
    pub fn new(ue_id: UeId, timers: TimerConfig) -> Self {
        Self {
            ue_id,
            identity: UeIdentity::default(),
            security: SecurityContext::new(),
            fsm: EmmStateMachine::new(),
            procedures: ProcedureStore::new(),
            timers,
        }
    }

    /// Returns true if this context can satisfy an attach without running
    /// the identification/authentication/SMC chain: a confirmed IMSI and a
    /// valid full native security context.
    pub fn can_bypass_security_setup(&self) -> bool {
        self.identity.imsi_confirmed() && self.security.is_full_native()
    }
}

/// Owner and index of all EMM contexts.
#[derive(Debug, Default)]
pub struct UeContextManager {
    timers: TimerConfig,
    next_ue_id: UeId,
    contexts: HashMap<UeId, EmmContext>,
    by_imsi: HashMap<Imsi, UeId>,
    by_guti: HashMap<Guti, UeId>,
}

impl UeContextManager {
    /// Creates an empty manager; new contexts inherit the given timer
    /// intervals.
    pub fn new(timers: TimerConfig) -> Self {
        Self {
            timers,
            next_ue_id: 1,
            contexts: HashMap::new(),
            by_imsi: HashMap::new(),
            by_guti: HashMap::new(),
        }
    }

    /// Returns the number of live contexts.
    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    /// Returns true if no context exists.
    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    /// Allocates a fresh context.
    pub fn create(&mut self) -> &mut EmmContext {
        let ue_id = self.next_ue_id;
        self.next_ue_id += 1;
        self.contexts
            .entry(ue_id)
            .or_insert_with(|| EmmContext::new(ue_id, self.timers))
    }

    /// Returns the context with the given id.
    pub fn get(&self, ue_id: UeId) -> Option<&EmmContext> {
        self.contexts.get(&ue_id)
    }

    /// Returns the context with the given id mutably.
    pub fn get_mut(&mut self, ue_id: UeId) -> Option<&mut EmmContext> {
        self.contexts.get_mut(&ue_id)
    }

    /// Looks up a context by confirmed or presented IMSI.
    pub fn find_by_imsi(&self, imsi: &Imsi) -> Option<UeId> {
        self.by_imsi.get(imsi).copied()
    }

    /// Looks up a context by assigned GUTI.
    pub fn find_by_guti(&self, guti: &Guti) -> Option<UeId> {
        self.by_guti.get(guti).copied()
    }

    /// Resolves a presented mobile identity to an existing context.
    ///
    /// When both an IMSI and a GUTI lookup would resolve and disagree, the
    /// IMSI mapping wins: the permanent identity is authoritative and the
    /// stale GUTI holder is left to collision resolution.
    pub fn resolve(&self, identity: &MobileIdentity) -> Option<UeId> {
        match identity {
            MobileIdentity::Imsi(imsi) => self.find_by_imsi(imsi),
            MobileIdentity::Guti(guti) => self.find_by_guti(guti),
            MobileIdentity::Imei(_) => None,
        }
    }

    /// Records an IMSI for a context and indexes it.
    ///
    /// A previous holder of the same IMSI loses its index entry; the
    /// caller is expected to implicitly detach it.
    pub fn bind_imsi(&mut self, ue_id: UeId, imsi: Imsi, valid: bool) {
        if let Some(ctx) = self.contexts.get_mut(&ue_id) {
            if let Some(old) = ctx.identity.imsi.take() {
                if self.by_imsi.get(&old) == Some(&ue_id) {
                    self.by_imsi.remove(&old);
                }
            }
            ctx.identity.imsi = Some(imsi.clone());
            ctx.identity.imsi_valid = valid;
            self.by_imsi.insert(imsi, ue_id);
        }
    }

    /// Records a GUTI for a context and indexes it.
    pub fn bind_guti(&mut self, ue_id: UeId, guti: Guti, valid: bool) {
        if let Some(ctx) = self.contexts.get_mut(&ue_id) {
            if let Some(old) = ctx.identity.guti.take() {
                if self.by_guti.get(&old) == Some(&ue_id) {
                    self.by_guti.remove(&old);
                }
            }
            ctx.identity.guti = Some(guti);
            ctx.identity.guti_valid = valid;
            self.by_guti.insert(guti, ue_id);
        }
    }

    /// Marks the stored GUTI as acknowledged by the UE.
    pub fn confirm_guti(&mut self, ue_id: UeId) {
        if let Some(ctx) = self.contexts.get_mut(&ue_id) {
            ctx.identity.guti_valid = ctx.identity.guti.is_some();
        }
    }

    /// Destroys a context: stops every owned timer, drops all procedures
    /// and removes the identity index entries.
    pub fn remove(&mut self, ue_id: UeId) -> Option<EmmContext> {
        let mut ctx = self.contexts.remove(&ue_id)?;
        ctx.procedures.delete_all();
        if let Some(imsi) = &ctx.identity.imsi {
            if self.by_imsi.get(imsi) == Some(&ue_id) {
                self.by_imsi.remove(imsi);
            }
        }
        if let Some(guti) = &ctx.identity.guti {
            if self.by_guti.get(guti) == Some(&ue_id) {
                self.by_guti.remove(guti);
            }
        }
        Some(ctx)
    }

    /// Iterates all contexts mutably (tick processing).
    pub fn contexts_mut(&mut self) -> impl Iterator<Item = &mut EmmContext> {
        self.contexts.values_mut()
    }

    /// Returns the ids of all live contexts.
    pub fn ue_ids(&self) -> Vec<UeId> {
        self.contexts.keys().copied().collect()
    }
}
