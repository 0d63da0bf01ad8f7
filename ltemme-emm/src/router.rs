//! EMM event router
//!
//! Serialization point of the engine: every external stimulus for a UE
//! (NAS message, timer expiry, delivery report, CN answer) enters through
//! [`EmmRouter::handle_event`] or [`EmmRouter::handle_attach_request`] and
//! is validated against the EMM state machine before any context mutation.
//! An event that is not valid in the current state is logged and discarded
//! with the context untouched.
//!
//! Handlers return the outbound side-effects as [`EmmAction`] values;
//! dispatch is fire-and-forget and answers re-enter as new events.

use tracing::{debug, info, warn};

use ltemme_common::config::MmeConfig;
use ltemme_common::{Error, Guti, OctetString, TaiList};

use crate::context::{EmmContext, UeContextManager};
use crate::proc::attach::{self, AttachProcedure, AttachStep};
use crate::proc::authentication::{self, AuthOutcome};
use crate::proc::common::RetransmitDecision;
use crate::proc::detach::{DetachKind, DetachProcedure};
use crate::proc::identification::{self, IdentOutcome};
use crate::proc::security_mode::{self, SmcOutcome};
use crate::proc::{
    CnProcKind, CnProcedure, CommonProcKind, SpecificProcKind, SpecificProcedure,
};
use crate::sap::{
    AttachRequestIes, CnResponse, EmmAction, EmmCause, EmmEvent, EmmRegEvent, IdentityType,
    LowerLayerEvent, MobileIdentity, NasMessage, NasMessageType,
};
use crate::security::{EeaAlgorithm, EiaAlgorithm, NasSecurityAlgorithms, SecurityContextKind};
use crate::state::EmmState;
use crate::timer::{TimerExpiryEvent, TIMER_T3422, TIMER_T3450, TIMER_T3460, TIMER_T3470};
use crate::UeId;

/// Algorithms taken into use by security mode control.
const SELECTED_ALGORITHMS: NasSecurityAlgorithms = NasSecurityAlgorithms {
    ciphering: EeaAlgorithm::Eea2,
    integrity: EiaAlgorithm::Eia2,
};

/// The EMM procedure engine's event router.
pub struct EmmRouter {
    config: MmeConfig,
    tai_list: TaiList,
}

impl EmmRouter {
    /// Creates a router serving the configured PLMN and tracking areas.
    pub fn new(config: MmeConfig) -> Result<Self, Error> {
        config.validate()?;
        let tai_list = TaiList::new(config.plmn, config.tac_list.clone())?;
        Ok(Self { config, tai_list })
    }

    /// Returns the configuration the router was built with.
    pub fn config(&self) -> &MmeConfig {
        &self.config
    }

    // ========================================================================
    // Entry points
    // ========================================================================

    /// Handles an initial ATTACH REQUEST: resolves or creates the EMM
    /// context, settles collisions, and starts the attach chain.
    ///
    /// Returns the id of the context now serving the attempt.
    pub fn handle_attach_request(
        &self,
        ues: &mut UeContextManager,
        ies: AttachRequestIes,
    ) -> (UeId, Vec<EmmAction>) {
        let mut actions = Vec::new();

        if let Some(existing) = ues.resolve(&ies.identity) {
            if let Some(ue_id) = self.attach_on_existing(ues, existing, &ies, &mut actions) {
                return (ue_id, actions);
            }
        }

        // fresh attempt on a fresh context
        let ue_id = ues.create().ue_id;
        if let MobileIdentity::Imsi(imsi) = &ies.identity {
            // presented, not yet confirmed by a procedure
            ues.bind_imsi(ue_id, imsi.clone(), false);
        }
        self.install_attach(ues, ue_id, ies, &mut actions);
        (ue_id, actions)
    }

    /// Handles an event addressed to an existing context.
    pub fn handle_event(
        &self,
        ues: &mut UeContextManager,
        ue_id: UeId,
        event: EmmEvent,
    ) -> Vec<EmmAction> {
        let mut actions = Vec::new();
        if ues.get(ue_id).is_none() {
            warn!(ue_id, "event for unknown EMM context discarded");
            return actions;
        }
        match event {
            EmmEvent::Nas(message) => self.handle_nas(ues, ue_id, message, &mut actions),
            EmmEvent::TimerExpiry(event) => {
                self.handle_timer_expiry(ues, ue_id, &event, &mut actions)
            }
            EmmEvent::LowerLayer(event) => self.handle_lower_layer(ues, ue_id, event, &mut actions),
            EmmEvent::Cn(response) => self.handle_cn_response(ues, ue_id, response, &mut actions),
        }
        actions
    }

    /// Starts a network-initiated detach for a registered UE.
    pub fn initiate_detach(&self, ues: &mut UeContextManager, ue_id: UeId) -> Vec<EmmAction> {
        let mut actions = Vec::new();
        let Some(ctx) = ues.get_mut(ue_id) else {
            return actions;
        };
        let interval = ctx.timers.t3422_secs;
        let (procedure, action) = DetachProcedure::start_network_initiated(ue_id, interval);
        match ctx
            .procedures
            .create_specific(SpecificProcedure::Detach(procedure))
        {
            Ok(_) => {
                transition(ctx, EmmRegEvent::DetachInit);
                actions.push(action);
            }
            Err(err) => warn!(ue_id, %err, "cannot start network-initiated detach"),
        }
        actions
    }

    // ========================================================================
    // Attach entry resolution
    // ========================================================================

    /// Applies an ATTACH REQUEST to an already-resolved context. Returns
    /// the serving id, or `None` if the old context was discarded and a
    /// fresh one must take over.
    fn attach_on_existing(
        &self,
        ues: &mut UeContextManager,
        ue_id: UeId,
        ies: &AttachRequestIes,
        actions: &mut Vec<EmmAction>,
    ) -> Option<UeId> {
        let ctx = ues.get_mut(ue_id)?;

        if let Some(SpecificProcedure::Attach(running)) = ctx.procedures.get_specific_mut() {
            if running.is_duplicate_request(ies) {
                // retransmitted request: resend the outstanding answer,
                // never create a second run
                if running.step() == AttachStep::AcceptSent {
                    if let Some(action) = running.retransmit_accept(ue_id) {
                        debug!(ue_id, "duplicate ATTACH REQUEST, resending ATTACH ACCEPT");
                        actions.push(action);
                    }
                } else {
                    debug!(ue_id, step = %running.step(), "duplicate ATTACH REQUEST ignored");
                }
                return Some(ue_id);
            }
            // changed IEs: the old attempt is dead, restart on this context
            info!(ue_id, "new ATTACH REQUEST supersedes the running attempt");
            ctx.procedures.delete_specific();
            transition(ctx, EmmRegEvent::AttachAbort);
            self.install_attach(ues, ue_id, ies.clone(), actions);
            return Some(ue_id);
        }

        if ctx.fsm.state() == EmmState::Deregistered && ctx.can_bypass_security_setup() {
            // valid security context: skip straight to session setup
            self.install_attach(ues, ue_id, ies.clone(), actions);
            return Some(ue_id);
        }

        // the old registration loses; implicitly detach it and let the
        // caller start over on a fresh context
        info!(ue_id, "implicit detach of colliding EMM context");
        self.implicit_detach(ues, ue_id, actions);
        None
    }

    /// Creates the attach procedure on the given context and drives the
    /// chain from its current security state.
    fn install_attach(
        &self,
        ues: &mut UeContextManager,
        ue_id: UeId,
        ies: AttachRequestIes,
        actions: &mut Vec<EmmAction>,
    ) {
        let Some(ctx) = ues.get_mut(ue_id) else {
            return;
        };
        let procedure = AttachProcedure::new(ies, ctx.timers.t3450_secs);
        if let Err(err) = ctx
            .procedures
            .create_specific(SpecificProcedure::Attach(procedure))
        {
            warn!(ue_id, %err, "attach collision left unresolved");
            return;
        }
        self.advance_attach(ues, ue_id, actions);
    }

    /// Drives the attach chain one step forward, derived from the context
    /// state: identification while the IMSI is unknown, then
    /// authentication, then security mode control, then session setup.
    fn advance_attach(
        &self,
        ues: &mut UeContextManager,
        ue_id: UeId,
        actions: &mut Vec<EmmAction>,
    ) {
        let Some(ctx) = ues.get_mut(ue_id) else {
            return;
        };
        let Some(SpecificProcedure::Attach(procedure)) = ctx.procedures.get_specific() else {
            return;
        };
        if matches!(
            procedure.step(),
            AttachStep::AwaitingCnResponse | AttachStep::AcceptSent | AttachStep::Complete
        ) {
            return;
        }
        let esm_container = procedure.ies.esm_container.clone();
        let capability = procedure.ies.ue_network_capability.clone();

        if ctx.can_bypass_security_setup() || ctx.security.kind == SecurityContextKind::FullNative {
            self.set_attach_step(ctx, AttachStep::AwaitingCnResponse);
            actions.push(EmmAction::RequestSessionEstablishment {
                ue_id,
                esm_container,
            });
        } else if ctx.identity.imsi.is_none() {
            let interval = ctx.timers.t3470_secs;
            let (child, action) = identification::start(ue_id, IdentityType::Imsi, interval);
            match ctx.procedures.create_common(child) {
                Ok(_) => {
                    ctx.procedures.link_child(CommonProcKind::Identification);
                    self.set_attach_step(ctx, AttachStep::AwaitingIdentity);
                    transition(ctx, EmmRegEvent::CommonProcReq(CommonProcKind::Identification));
                    actions.push(action);
                }
                Err(err) => warn!(ue_id, %err, "identification already running"),
            }
        } else if ctx.security.kind == SecurityContextKind::PartialNative {
            let interval = ctx.timers.t3460_secs;
            let (child, action) = security_mode::start(
                ue_id,
                &mut ctx.security,
                SELECTED_ALGORITHMS,
                capability,
                interval,
            );
            match ctx.procedures.create_common(child) {
                Ok(_) => {
                    ctx.procedures
                        .link_child(CommonProcKind::SecurityModeControl);
                    self.set_attach_step(ctx, AttachStep::AwaitingSecurityMode);
                    transition(
                        ctx,
                        EmmRegEvent::CommonProcReq(CommonProcKind::SecurityModeControl),
                    );
                    actions.push(action);
                }
                Err(err) => warn!(ue_id, %err, "security mode control already running"),
            }
        } else {
            self.begin_authentication(ctx, ue_id, None, actions);
        }
    }

    /// Starts authentication, fetching a vector batch first if none is
    /// stored.
    fn begin_authentication(
        &self,
        ctx: &mut EmmContext,
        ue_id: UeId,
        resync: Option<(Vec<u8>, Vec<u8>)>,
        actions: &mut Vec<EmmAction>,
    ) {
        self.set_attach_step(ctx, AttachStep::AwaitingAuthentication);

        let needs_vectors = resync.is_some() || ctx.security.vector_count() == 0;
        if needs_vectors {
            let Some(imsi) = ctx.identity.imsi.clone() else {
                warn!(ue_id, "authentication requested without an IMSI");
                return;
            };
            match ctx.procedures.create_cn(CnProcedure {
                kind: CnProcKind::AuthInfoRequest,
                parent: Some(SpecificProcKind::Attach),
            }) {
                Ok(_) => actions.push(EmmAction::RequestAuthVectors {
                    ue_id,
                    imsi,
                    plmn: self.config.plmn,
                    count: self.config.auth_vector_batch,
                    resync,
                }),
                Err(err) => warn!(ue_id, %err, "vector fetch already pending"),
            }
            return;
        }

        let interval = ctx.timers.t3460_secs;
        match authentication::start(ue_id, &mut ctx.security, interval) {
            Ok((child, action)) => match ctx.procedures.create_common(child) {
                Ok(_) => {
                    ctx.procedures.link_child(CommonProcKind::Authentication);
                    transition(ctx, EmmRegEvent::CommonProcReq(CommonProcKind::Authentication));
                    actions.push(action);
                }
                Err(err) => warn!(ue_id, %err, "authentication already running"),
            },
            Err(err) => warn!(ue_id, %err, "cannot start authentication"),
        }
    }

    fn set_attach_step(&self, ctx: &mut EmmContext, step: AttachStep) {
        if let Some(SpecificProcedure::Attach(procedure)) = ctx.procedures.get_specific_mut() {
            if procedure.step() != step {
                debug!(ue_id = ctx.ue_id, from = %procedure.step(), to = %step, "attach step");
                procedure.set_step(step);
            }
        }
    }

    // ========================================================================
    // NAS message handling
    // ========================================================================

    fn handle_nas(
        &self,
        ues: &mut UeContextManager,
        ue_id: UeId,
        message: NasMessage,
        actions: &mut Vec<EmmAction>,
    ) {
        debug!(ue_id, msg = %message.message_type(), "NAS message");
        match message {
            NasMessage::AttachRequest(ies) => {
                // a repeated request on a live context goes through the
                // same collision handling as an initial one
                self.attach_on_existing(ues, ue_id, &ies, actions);
            }
            NasMessage::AttachComplete => self.handle_attach_complete(ues, ue_id),
            NasMessage::IdentityResponse { identity } => {
                self.handle_identity_response(ues, ue_id, identity, actions)
            }
            NasMessage::AuthenticationResponse { res } => {
                self.handle_authentication_response(ues, ue_id, &res, actions)
            }
            NasMessage::AuthenticationFailure { cause, auts } => {
                self.handle_authentication_failure(ues, ue_id, cause, auts, actions)
            }
            NasMessage::SecurityModeComplete => {
                self.handle_security_mode_complete(ues, ue_id, actions)
            }
            NasMessage::SecurityModeReject { cause } => {
                self.handle_security_mode_reject(ues, ue_id, cause, actions)
            }
            NasMessage::DetachRequest { switch_off } => {
                self.handle_detach_request(ues, ue_id, switch_off, actions)
            }
            NasMessage::DetachAccept => self.handle_detach_accept(ues, ue_id, actions),
        }
    }

    fn handle_attach_complete(&self, ues: &mut UeContextManager, ue_id: UeId) {
        let Some(ctx) = ues.get_mut(ue_id) else {
            return;
        };
        let Some(SpecificProcedure::Attach(procedure)) = ctx.procedures.get_specific_mut() else {
            warn!(ue_id, "ATTACH COMPLETE without a running attach discarded");
            return;
        };
        if procedure.step() != AttachStep::AcceptSent {
            warn!(ue_id, step = %procedure.step(), "ATTACH COMPLETE in wrong step discarded");
            return;
        }
        if !transition(ctx, EmmRegEvent::AttachCnf) {
            return;
        }
        if let Some(SpecificProcedure::Attach(procedure)) = ctx.procedures.get_specific_mut() {
            procedure.complete();
        }
        ctx.procedures.delete_specific();
        ues.confirm_guti(ue_id);
        info!(ue_id, "attach complete, UE registered");
    }

    fn handle_identity_response(
        &self,
        ues: &mut UeContextManager,
        ue_id: UeId,
        identity: MobileIdentity,
        actions: &mut Vec<EmmAction>,
    ) {
        let outcome = {
            let Some(ctx) = ues.get_mut(ue_id) else {
                return;
            };
            let Some(mut procedure) = ctx.procedures.take_common(CommonProcKind::Identification)
            else {
                warn!(ue_id, "IDENTITY RESPONSE without a running identification discarded");
                return;
            };
            let outcome = identification::handle_response(&mut procedure, identity);
            match &outcome {
                IdentOutcome::Success(_) => {
                    transition(
                        ctx,
                        EmmRegEvent::CommonProcCnf(CommonProcKind::Identification),
                    );
                    // a MAC-failure escalation leaves a suspended
                    // authentication behind; it restarts from scratch
                    ctx.procedures.delete_common(CommonProcKind::Authentication);
                }
                IdentOutcome::Ignored => ctx.procedures.restore_common(procedure),
            }
            outcome
        };

        if let IdentOutcome::Success(identity) = outcome {
            match identity {
                MobileIdentity::Imsi(imsi) => ues.bind_imsi(ue_id, imsi, true),
                MobileIdentity::Imei(imei) => {
                    if let Some(ctx) = ues.get_mut(ue_id) {
                        ctx.identity.imei = Some(imei);
                    }
                }
                MobileIdentity::Guti(_) => {}
            }
            self.advance_attach(ues, ue_id, actions);
        }
    }

    fn handle_authentication_response(
        &self,
        ues: &mut UeContextManager,
        ue_id: UeId,
        res: &[u8],
        actions: &mut Vec<EmmAction>,
    ) {
        let outcome = {
            let Some(ctx) = ues.get_mut(ue_id) else {
                return;
            };
            let Some(mut procedure) = ctx.procedures.take_common(CommonProcKind::Authentication)
            else {
                warn!(ue_id, "AUTHENTICATION RESPONSE without a running run discarded");
                return;
            };
            let confirmed = ctx.identity.imsi_confirmed();
            let outcome =
                authentication::handle_response(&mut procedure, &mut ctx.security, confirmed, res);
            match &outcome {
                AuthOutcome::Success => {
                    transition(
                        ctx,
                        EmmRegEvent::CommonProcCnf(CommonProcKind::Authentication),
                    );
                }
                AuthOutcome::Reject(_) => {
                    transition(
                        ctx,
                        EmmRegEvent::CommonProcRej(CommonProcKind::Authentication),
                    );
                }
                AuthOutcome::NeedIdentification | AuthOutcome::ResyncVectors { .. } => {
                    ctx.procedures.restore_common(procedure);
                }
                AuthOutcome::Ignored => ctx.procedures.restore_common(procedure),
            }
            outcome
        };
        self.apply_auth_outcome(ues, ue_id, outcome, actions);
    }

    fn handle_authentication_failure(
        &self,
        ues: &mut UeContextManager,
        ue_id: UeId,
        cause: crate::sap::AuthFailureCause,
        auts: Option<Vec<u8>>,
        actions: &mut Vec<EmmAction>,
    ) {
        let outcome = {
            let Some(ctx) = ues.get_mut(ue_id) else {
                return;
            };
            let Some(mut procedure) = ctx.procedures.take_common(CommonProcKind::Authentication)
            else {
                warn!(ue_id, "AUTHENTICATION FAILURE without a running run discarded");
                return;
            };
            let confirmed = ctx.identity.imsi_confirmed();
            let outcome = authentication::handle_failure(
                &mut procedure,
                &mut ctx.security,
                confirmed,
                cause,
                auts.as_deref(),
            );
            match &outcome {
                AuthOutcome::Reject(_) => {
                    transition(
                        ctx,
                        EmmRegEvent::CommonProcRej(CommonProcKind::Authentication),
                    );
                }
                _ => ctx.procedures.restore_common(procedure),
            }
            outcome
        };
        self.apply_auth_outcome(ues, ue_id, outcome, actions);
    }

    fn apply_auth_outcome(
        &self,
        ues: &mut UeContextManager,
        ue_id: UeId,
        outcome: AuthOutcome,
        actions: &mut Vec<EmmAction>,
    ) {
        match outcome {
            AuthOutcome::Success => {
                // a passed AKA run vouches for the identity it ran under
                if let Some(ctx) = ues.get_mut(ue_id) {
                    ctx.identity.imsi_valid = ctx.identity.imsi.is_some();
                }
                self.advance_attach(ues, ue_id, actions);
            }
            AuthOutcome::Reject(cause) => {
                let payload = auth_reject_payload();
                let digest = crate::sap::message_digest(payload.as_slice());
                actions.push(EmmAction::SendNasMessage {
                    ue_id,
                    msg_type: NasMessageType::AuthenticationReject,
                    payload,
                    digest,
                });
                self.reject_attach(ues, ue_id, cause, true, actions);
            }
            AuthOutcome::NeedIdentification => {
                let Some(ctx) = ues.get_mut(ue_id) else {
                    return;
                };
                let interval = ctx.timers.t3470_secs;
                let (child, action) = identification::start(ue_id, IdentityType::Imsi, interval);
                match ctx.procedures.create_common(child) {
                    Ok(_) => {
                        ctx.procedures.link_child(CommonProcKind::Identification);
                        self.set_attach_step(ctx, AttachStep::AwaitingIdentity);
                        actions.push(action);
                    }
                    Err(err) => warn!(ue_id, %err, "identification already running"),
                }
            }
            AuthOutcome::ResyncVectors { rand, auts } => {
                let Some(ctx) = ues.get_mut(ue_id) else {
                    return;
                };
                self.begin_authentication(ctx, ue_id, Some((rand, auts)), actions);
            }
            AuthOutcome::Ignored => {
                warn!(ue_id, "authentication message did not apply, discarded");
            }
        }
    }

    fn handle_security_mode_complete(
        &self,
        ues: &mut UeContextManager,
        ue_id: UeId,
        actions: &mut Vec<EmmAction>,
    ) {
        {
            let Some(ctx) = ues.get_mut(ue_id) else {
                return;
            };
            let Some(mut procedure) = ctx
                .procedures
                .take_common(CommonProcKind::SecurityModeControl)
            else {
                warn!(ue_id, "SECURITY MODE COMPLETE without a running run discarded");
                return;
            };
            match security_mode::handle_complete(&mut procedure, &mut ctx.security) {
                SmcOutcome::Success => {
                    transition(
                        ctx,
                        EmmRegEvent::CommonProcCnf(CommonProcKind::SecurityModeControl),
                    );
                }
                SmcOutcome::Reject(_) => {
                    ctx.procedures.restore_common(procedure);
                    return;
                }
            }
        }
        self.advance_attach(ues, ue_id, actions);
    }

    fn handle_security_mode_reject(
        &self,
        ues: &mut UeContextManager,
        ue_id: UeId,
        cause: u8,
        actions: &mut Vec<EmmAction>,
    ) {
        let outcome = {
            let Some(ctx) = ues.get_mut(ue_id) else {
                return;
            };
            let Some(mut procedure) = ctx
                .procedures
                .take_common(CommonProcKind::SecurityModeControl)
            else {
                warn!(ue_id, "SECURITY MODE REJECT without a running run discarded");
                return;
            };
            let outcome = security_mode::handle_reject(&mut procedure, &mut ctx.security, cause);
            transition(
                ctx,
                EmmRegEvent::CommonProcRej(CommonProcKind::SecurityModeControl),
            );
            outcome
        };
        if let SmcOutcome::Reject(cause) = outcome {
            // the rolled-back context stays usable; only the registration
            // attempt dies
            self.reject_attach(ues, ue_id, cause, false, actions);
        }
    }

    fn handle_detach_request(
        &self,
        ues: &mut UeContextManager,
        ue_id: UeId,
        switch_off: bool,
        actions: &mut Vec<EmmAction>,
    ) {
        if let Some(ctx) = ues.get_mut(ue_id) {
            transition(ctx, EmmRegEvent::DetachReq);
        }
        if !switch_off {
            let payload = detach_accept_payload();
            let digest = crate::sap::message_digest(payload.as_slice());
            actions.push(EmmAction::SendNasMessage {
                ue_id,
                msg_type: NasMessageType::DetachAccept,
                payload,
                digest,
            });
        }
        self.implicit_detach(ues, ue_id, actions);
    }

    fn handle_detach_accept(
        &self,
        ues: &mut UeContextManager,
        ue_id: UeId,
        actions: &mut Vec<EmmAction>,
    ) {
        let accepted = {
            let Some(ctx) = ues.get_mut(ue_id) else {
                return;
            };
            match ctx.procedures.get_specific_mut() {
                Some(SpecificProcedure::Detach(procedure))
                    if procedure.kind == DetachKind::NetworkInitiated =>
                {
                    procedure.handle_accept();
                    transition(ctx, EmmRegEvent::DetachCnf);
                    true
                }
                _ => {
                    warn!(ue_id, "DETACH ACCEPT without a network-initiated detach discarded");
                    false
                }
            }
        };
        if accepted {
            self.implicit_detach(ues, ue_id, actions);
        }
    }

    // ========================================================================
    // Timer expiries
    // ========================================================================

    fn handle_timer_expiry(
        &self,
        ues: &mut UeContextManager,
        ue_id: UeId,
        event: &TimerExpiryEvent,
        actions: &mut Vec<EmmAction>,
    ) {
        let Some(ctx) = ues.get(ue_id) else {
            return;
        };
        if !ctx.procedures.accepts_expiry(event) {
            debug!(ue_id, code = event.code, "stale timer expiry discarded");
            return;
        }
        match event.code {
            TIMER_T3460 | TIMER_T3470 => self.handle_common_expiry(ues, ue_id, event, actions),
            TIMER_T3450 => self.handle_t3450_expiry(ues, ue_id, event, actions),
            TIMER_T3422 => self.handle_t3422_expiry(ues, ue_id, event, actions),
            code => warn!(ue_id, code, "expiry of unknown timer discarded"),
        }
    }

    fn handle_common_expiry(
        &self,
        ues: &mut UeContextManager,
        ue_id: UeId,
        event: &TimerExpiryEvent,
        actions: &mut Vec<EmmAction>,
    ) {
        let exhausted_kind = {
            let Some(ctx) = ues.get_mut(ue_id) else {
                return;
            };
            let Some(kind) = [
                CommonProcKind::Authentication,
                CommonProcKind::SecurityModeControl,
                CommonProcKind::Identification,
            ]
            .into_iter()
            .find(|kind| {
                ctx.procedures
                    .get_common(*kind)
                    .is_some_and(|p| p.timer.accepts(event))
            }) else {
                return;
            };
            let Some(mut procedure) = ctx.procedures.take_common(kind) else {
                return;
            };
            match procedure.handle_timer_expiry(ue_id, event) {
                RetransmitDecision::Retransmit(action) => {
                    info!(ue_id, %kind, count = event.expiry_count, "retransmitting request");
                    ctx.procedures.restore_common(procedure);
                    actions.push(action);
                    None
                }
                RetransmitDecision::Exhausted => {
                    transition(ctx, EmmRegEvent::CommonProcAbort(kind));
                    Some(kind)
                }
            }
        };

        if let Some(kind) = exhausted_kind {
            warn!(ue_id, %kind, "retransmission budget spent, aborting");
            actions.push(EmmAction::ReleaseConnection { ue_id });
            if kind == CommonProcKind::Authentication {
                // losing the AKA run invalidates the registration attempt
                self.abort_specific(ues, ue_id, actions);
            }
        }
    }

    fn handle_t3450_expiry(
        &self,
        ues: &mut UeContextManager,
        ue_id: UeId,
        event: &TimerExpiryEvent,
        actions: &mut Vec<EmmAction>,
    ) {
        let exhausted = {
            let Some(ctx) = ues.get_mut(ue_id) else {
                return;
            };
            let Some(SpecificProcedure::Attach(procedure)) = ctx.procedures.get_specific_mut()
            else {
                return;
            };
            match procedure.handle_t3450_expiry(ue_id, event) {
                RetransmitDecision::Retransmit(action) => {
                    info!(ue_id, count = event.expiry_count, "retransmitting ATTACH ACCEPT");
                    actions.push(action);
                    false
                }
                RetransmitDecision::Exhausted => true,
            }
        };
        if exhausted {
            warn!(ue_id, "T3450 exhausted, implicit detach");
            if let Some(ctx) = ues.get_mut(ue_id) {
                transition(ctx, EmmRegEvent::AttachAbort);
            }
            self.implicit_detach(ues, ue_id, actions);
        }
    }

    fn handle_t3422_expiry(
        &self,
        ues: &mut UeContextManager,
        ue_id: UeId,
        event: &TimerExpiryEvent,
        actions: &mut Vec<EmmAction>,
    ) {
        let exhausted = {
            let Some(ctx) = ues.get_mut(ue_id) else {
                return;
            };
            let Some(SpecificProcedure::Detach(procedure)) = ctx.procedures.get_specific_mut()
            else {
                return;
            };
            match procedure.handle_t3422_expiry(ue_id, event) {
                RetransmitDecision::Retransmit(action) => {
                    info!(ue_id, count = event.expiry_count, "retransmitting DETACH REQUEST");
                    actions.push(action);
                    false
                }
                RetransmitDecision::Exhausted => true,
            }
        };
        if exhausted {
            warn!(ue_id, "T3422 exhausted, implicit detach");
            if let Some(ctx) = ues.get_mut(ue_id) {
                transition(ctx, EmmRegEvent::DetachFailed);
            }
            self.implicit_detach(ues, ue_id, actions);
        }
    }

    // ========================================================================
    // Lower-layer events
    // ========================================================================

    fn handle_lower_layer(
        &self,
        ues: &mut UeContextManager,
        ue_id: UeId,
        event: LowerLayerEvent,
        actions: &mut Vec<EmmAction>,
    ) {
        match event {
            LowerLayerEvent::Success { digest } => {
                debug!(ue_id, digest, "downlink message delivered");
                if let Some(ctx) = ues.get_mut(ue_id) {
                    transition(ctx, EmmRegEvent::LowerLayerSuccess);
                }
            }
            LowerLayerEvent::Failure { digest } => {
                self.handle_delivery_failure(ues, ue_id, digest, actions)
            }
            LowerLayerEvent::NonDelivery { digest } => {
                self.handle_non_delivery(ues, ue_id, digest, actions)
            }
            LowerLayerEvent::Release => self.handle_release(ues, ue_id),
        }
    }

    fn handle_delivery_failure(
        &self,
        ues: &mut UeContextManager,
        ue_id: UeId,
        digest: u64,
        actions: &mut Vec<EmmAction>,
    ) {
        let owner = {
            let Some(ctx) = ues.get_mut(ue_id) else {
                return;
            };
            transition(ctx, EmmRegEvent::LowerLayerFailure);
            delivery_owner(ctx, digest)
        };
        match owner {
            Some(DeliveryOwner::Common(kind)) => {
                // delivery toward the radio layer is uncertain; abort
                let aborted = {
                    let Some(ctx) = ues.get_mut(ue_id) else {
                        return;
                    };
                    if ctx
                        .procedures
                        .get_common(kind)
                        .is_some_and(|p| p.notify_on_failure)
                    {
                        ctx.procedures.delete_common(kind);
                        transition(ctx, EmmRegEvent::CommonProcAbort(kind));
                        true
                    } else {
                        false
                    }
                };
                if aborted {
                    warn!(ue_id, %kind, "delivery failure, aborting procedure");
                    actions.push(EmmAction::ReleaseConnection { ue_id });
                    if kind == CommonProcKind::Authentication {
                        self.abort_specific(ues, ue_id, actions);
                    }
                }
            }
            Some(DeliveryOwner::Specific) => {
                warn!(ue_id, "delivery failure of a specific-procedure message, implicit detach");
                if let Some(ctx) = ues.get_mut(ue_id) {
                    transition(ctx, EmmRegEvent::AttachAbort);
                }
                self.implicit_detach(ues, ue_id, actions);
            }
            None => debug!(ue_id, digest, "delivery failure for unknown message discarded"),
        }
    }

    fn handle_non_delivery(
        &self,
        ues: &mut UeContextManager,
        ue_id: UeId,
        digest: u64,
        actions: &mut Vec<EmmAction>,
    ) {
        let Some(ctx) = ues.get_mut(ue_id) else {
            return;
        };
        transition(ctx, EmmRegEvent::LowerLayerNonDelivery);
        match delivery_owner(ctx, digest) {
            Some(DeliveryOwner::Common(kind)) => {
                if let Some(procedure) = ctx.procedures.get_common_mut(kind) {
                    // handover related: retry without charging the budget
                    if let Some(action) = procedure.resend_request(ue_id) {
                        debug!(ue_id, %kind, "non-delivery, resending");
                        actions.push(action);
                    }
                }
            }
            Some(DeliveryOwner::Specific) => {
                if let Some(SpecificProcedure::Attach(procedure)) =
                    ctx.procedures.get_specific_mut()
                {
                    if let Some(action) = procedure.retransmit_accept(ue_id) {
                        debug!(ue_id, "non-delivery, resending ATTACH ACCEPT");
                        actions.push(action);
                    }
                }
            }
            None => debug!(ue_id, digest, "non-delivery for unknown message discarded"),
        }
    }

    /// Lower-layer release tears down every procedure unconditionally; a
    /// context with no registration to keep is destroyed.
    fn handle_release(&self, ues: &mut UeContextManager, ue_id: UeId) {
        let registered = {
            let Some(ctx) = ues.get_mut(ue_id) else {
                return;
            };
            transition(ctx, EmmRegEvent::LowerLayerRelease);
            ctx.procedures.delete_all();
            // an interrupted common procedure falls back to its saved state
            ctx.fsm.leave_common_procedure();
            ctx.fsm.is_registered()
        };
        if registered {
            debug!(ue_id, "connection released, registered UE goes idle");
        } else {
            info!(ue_id, "connection released with nothing to resolve, dropping context");
            ues.remove(ue_id);
        }
    }

    // ========================================================================
    // Core-network answers
    // ========================================================================

    fn handle_cn_response(
        &self,
        ues: &mut UeContextManager,
        ue_id: UeId,
        response: CnResponse,
        actions: &mut Vec<EmmAction>,
    ) {
        match response {
            CnResponse::AuthVectors { vectors } => {
                let resumed = {
                    let Some(ctx) = ues.get_mut(ue_id) else {
                        return;
                    };
                    if ctx.procedures.delete_cn(CnProcKind::AuthInfoRequest).is_none() {
                        warn!(ue_id, "vector answer without a pending fetch discarded");
                        return;
                    }
                    ctx.security.store_vectors(vectors);
                    if let Some(mut procedure) =
                        ctx.procedures.take_common(CommonProcKind::Authentication)
                    {
                        // resynchronized batch for the suspended run
                        match authentication::resume_with_vectors(
                            &mut procedure,
                            &mut ctx.security,
                            ue_id,
                        ) {
                            Ok(action) => {
                                ctx.procedures.restore_common(procedure);
                                actions.push(action);
                            }
                            Err(err) => {
                                warn!(ue_id, %err, "cannot resume authentication");
                                transition(
                                    ctx,
                                    EmmRegEvent::CommonProcAbort(CommonProcKind::Authentication),
                                );
                            }
                        }
                        true
                    } else {
                        false
                    }
                };
                if !resumed {
                    self.advance_attach(ues, ue_id, actions);
                }
            }
            CnResponse::AuthVectorsFailure { cause } => {
                if let Some(ctx) = ues.get_mut(ue_id) {
                    ctx.procedures.delete_cn(CnProcKind::AuthInfoRequest);
                }
                self.reject_attach(ues, ue_id, cause, true, actions);
            }
            CnResponse::SessionEstablished { esm_container } => {
                self.handle_session_established(ues, ue_id, esm_container, actions)
            }
            CnResponse::SessionFailed { cause } => {
                self.reject_attach(ues, ue_id, cause, true, actions);
            }
        }
    }

    fn handle_session_established(
        &self,
        ues: &mut UeContextManager,
        ue_id: UeId,
        esm_container: OctetString,
        actions: &mut Vec<EmmAction>,
    ) {
        let ready = {
            let Some(ctx) = ues.get(ue_id) else {
                return;
            };
            matches!(
                ctx.procedures.get_specific(),
                Some(SpecificProcedure::Attach(p)) if p.step() == AttachStep::AwaitingCnResponse
            )
        };
        if !ready {
            warn!(ue_id, "session answer without an awaiting attach discarded");
            return;
        }

        let guti = self.allocate_guti();
        ues.bind_guti(ue_id, guti, false);
        actions.push(EmmAction::NotifyNewGuti { ue_id, guti });

        let Some(ctx) = ues.get_mut(ue_id) else {
            return;
        };
        let payload = attach::build_accept(&guti, &self.tai_list, &esm_container);
        if let Some(SpecificProcedure::Attach(procedure)) = ctx.procedures.get_specific_mut() {
            info!(ue_id, %guti, "sending ATTACH ACCEPT");
            actions.push(procedure.send_accept(ue_id, payload));
        }
    }

    // ========================================================================
    // Failure paths
    // ========================================================================

    /// Rejects the running attach. `destroy_context` distinguishes the
    /// unrecoverable rejections from those that leave a usable context
    /// behind (security mode rollback).
    fn reject_attach(
        &self,
        ues: &mut UeContextManager,
        ue_id: UeId,
        cause: EmmCause,
        destroy_context: bool,
        actions: &mut Vec<EmmAction>,
    ) {
        let Some(ctx) = ues.get_mut(ue_id) else {
            return;
        };
        if matches!(ctx.procedures.get_specific(), Some(SpecificProcedure::Attach(_))) {
            warn!(ue_id, cause = cause.code(), "rejecting attach");
            ctx.procedures.delete_specific();
            transition(ctx, EmmRegEvent::AttachRej);
            actions.push(EmmAction::EstablishRej { ue_id, cause });
        }
        if destroy_context {
            ues.remove(ue_id);
        }
    }

    /// Aborts the running specific procedure without a UE-visible reject
    /// (used when the signalling connection is already being released).
    fn abort_specific(
        &self,
        ues: &mut UeContextManager,
        ue_id: UeId,
        actions: &mut Vec<EmmAction>,
    ) {
        let Some(ctx) = ues.get_mut(ue_id) else {
            return;
        };
        if ctx.procedures.get_specific().is_some() {
            ctx.procedures.delete_specific();
            transition(ctx, EmmRegEvent::AttachAbort);
        }
        actions.push(EmmAction::NotifySessionRelease { ue_id });
        ues.remove(ue_id);
    }

    /// Implicit detach: destroys the context and tells the session layer
    /// and the access stratum.
    fn implicit_detach(
        &self,
        ues: &mut UeContextManager,
        ue_id: UeId,
        actions: &mut Vec<EmmAction>,
    ) {
        if ues.remove(ue_id).is_some() {
            actions.push(EmmAction::NotifySessionRelease { ue_id });
            actions.push(EmmAction::ReleaseConnection { ue_id });
        }
    }

    fn allocate_guti(&self) -> Guti {
        let mut m_tmsi: u32 = rand::random();
        if m_tmsi == 0 {
            m_tmsi = 1;
        }
        Guti::new(
            self.config.plmn,
            self.config.mme_group_id,
            self.config.mme_code,
            m_tmsi,
        )
    }
}

/// Applies an EMMREG primitive to the state machine.
///
/// Returns false (and mutates nothing) when the primitive is not valid in
/// the current state; the caller's event is then a protocol error.
pub fn transition(ctx: &mut EmmContext, event: EmmRegEvent) -> bool {
    let state = ctx.fsm.state();
    let applied = match event {
        EmmRegEvent::CommonProcReq(_) => ctx.fsm.enter_common_procedure().is_some(),
        EmmRegEvent::CommonProcCnf(_) | EmmRegEvent::CommonProcAbort(_) => {
            ctx.fsm.leave_common_procedure().is_some()
        }
        EmmRegEvent::CommonProcRej(_) => {
            if state == EmmState::CommonProcedureInitiated {
                ctx.fsm.enter_deregistered();
                true
            } else {
                false
            }
        }
        EmmRegEvent::AttachCnf => {
            if state == EmmState::Registered {
                false
            } else {
                ctx.fsm.enter_registered();
                true
            }
        }
        EmmRegEvent::AttachRej | EmmRegEvent::AttachAbort => {
            ctx.fsm.enter_deregistered();
            true
        }
        EmmRegEvent::DetachInit
        | EmmRegEvent::DetachReq
        | EmmRegEvent::DetachFailed
        | EmmRegEvent::DetachCnf => {
            ctx.fsm.enter_deregistered();
            true
        }
        EmmRegEvent::LowerLayerRelease => true,
        EmmRegEvent::LowerLayerSuccess
        | EmmRegEvent::LowerLayerFailure
        | EmmRegEvent::LowerLayerNonDelivery => true,
        // no TAU or service-request procedures exist in this engine
        EmmRegEvent::TauReq
        | EmmRegEvent::TauCnf
        | EmmRegEvent::TauRej
        | EmmRegEvent::TauAbort
        | EmmRegEvent::ServiceReq
        | EmmRegEvent::ServiceCnf
        | EmmRegEvent::ServiceRej => false,
    };
    if applied {
        let new_state = ctx.fsm.state();
        if new_state != state {
            info!(ue_id = ctx.ue_id, %event, from = %state, to = %new_state, "EMM transition");
        }
    } else {
        warn!(ue_id = ctx.ue_id, %event, %state, "primitive not valid in state, discarded");
    }
    applied
}

/// Who owns an outstanding downlink message.
enum DeliveryOwner {
    Common(CommonProcKind),
    Specific,
}

fn delivery_owner(ctx: &EmmContext, digest: u64) -> Option<DeliveryOwner> {
    if let Some(kind) = ctx.procedures.find_common_by_digest(digest) {
        return Some(DeliveryOwner::Common(kind));
    }
    match ctx.procedures.get_specific() {
        Some(SpecificProcedure::Attach(p)) if p.owns_digest(digest) => {
            Some(DeliveryOwner::Specific)
        }
        Some(SpecificProcedure::Detach(p)) if p.owns_digest(digest) => {
            Some(DeliveryOwner::Specific)
        }
        _ => None,
    }
}

fn auth_reject_payload() -> OctetString {
    let mut payload = OctetString::new();
    payload.append_octet(NasMessageType::AuthenticationReject.code());
    payload
}

fn detach_accept_payload() -> OctetString {
    let mut payload = OctetString::new();
    payload.append_octet(NasMessageType::DetachAccept.code());
    payload
}
