//! EMM task
//!
//! Async actor wrapping the procedure engine. The task owns the UE context
//! manager and the router; everything else talks to it through a typed
//! message channel, which serializes all events for a UE in arrival order.
//! Outbound [`EmmAction`]s are forwarded fire-and-forget to the action
//! channel, where the EMM-AS and core-network boundaries pick them up.
//!
//! A periodic tick drives the retransmission timers; expiries re-enter the
//! router as regular events so the stale-expiry guard applies to them like
//! to anything else.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::{interval, Duration};
use tracing::{debug, info, warn};

use ltemme_common::config::MmeConfig;
use ltemme_common::logging::{log_nas_message, Direction};
use ltemme_common::Error;

use crate::context::UeContextManager;
use crate::router::EmmRouter;
use crate::sap::{AttachRequestIes, CnResponse, EmmAction, EmmEvent, LowerLayerEvent, NasMessage};
use crate::UeId;

/// Timer tick period.
const TICK_INTERVAL_MS: u64 = 1000;

/// Default channel capacity for the task message queue.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

// ============================================================================
// Task message envelope
// ============================================================================

/// Task message envelope wrapping typed messages with control signals.
#[derive(Debug)]
pub enum TaskMessage<T> {
    /// Regular message payload
    Message(T),
    /// Shutdown signal; the task terminates gracefully
    Shutdown,
}

impl<T> TaskMessage<T> {
    /// Returns the message payload if present, or `None` for shutdown.
    pub fn into_message(self) -> Option<T> {
        match self {
            TaskMessage::Message(msg) => Some(msg),
            TaskMessage::Shutdown => None,
        }
    }

    /// Returns true if this is a shutdown signal.
    pub fn is_shutdown(&self) -> bool {
        matches!(self, TaskMessage::Shutdown)
    }
}

/// Handle for sending messages to a task.
#[derive(Debug)]
pub struct TaskHandle<T> {
    tx: mpsc::Sender<TaskMessage<T>>,
}

impl<T> Clone for TaskHandle<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T> TaskHandle<T> {
    /// Creates a new task handle from a sender.
    pub fn new(tx: mpsc::Sender<TaskMessage<T>>) -> Self {
        Self { tx }
    }

    /// Sends a message to the task.
    pub async fn send(&self, msg: T) -> Result<(), mpsc::error::SendError<TaskMessage<T>>> {
        self.tx.send(TaskMessage::Message(msg)).await
    }

    /// Sends a shutdown signal to the task.
    pub async fn shutdown(&self) -> Result<(), mpsc::error::SendError<TaskMessage<T>>> {
        self.tx.send(TaskMessage::Shutdown).await
    }

    /// Returns true if the task channel is closed.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// A long-running actor consuming typed messages until shutdown.
#[async_trait]
pub trait Task {
    /// Message type this task processes.
    type Message: Send;

    /// Runs the task's main loop until shutdown.
    async fn run(&mut self, rx: mpsc::Receiver<TaskMessage<Self::Message>>);
}

// ============================================================================
// EMM task messages
// ============================================================================

/// Messages the EMM task processes.
#[derive(Debug)]
pub enum EmmMessage {
    /// ATTACH REQUEST on a fresh NAS signalling connection
    InitialAttach {
        /// Decoded request IEs
        ies: AttachRequestIes,
    },
    /// Uplink NAS message on an established connection
    UplinkNas {
        /// Originating UE
        ue_id: UeId,
        /// Decoded message
        message: NasMessage,
    },
    /// Lower-layer delivery report or connection event
    LowerLayer {
        /// Affected UE
        ue_id: UeId,
        /// The event
        event: LowerLayerEvent,
    },
    /// Core-network answer
    CnAnswer {
        /// Target UE
        ue_id: UeId,
        /// The answer
        response: CnResponse,
    },
    /// Operator- or subscription-triggered detach
    InitiateDetach {
        /// UE to detach
        ue_id: UeId,
    },
}

// ============================================================================
// EMM task
// ============================================================================

/// The EMM task: owns all per-UE state and processes one event at a time.
pub struct EmmTask {
    ues: UeContextManager,
    router: EmmRouter,
    action_tx: mpsc::Sender<EmmAction>,
}

impl EmmTask {
    /// Creates the task and the handle to reach it.
    ///
    /// Actions are emitted on `action_tx`; the receiver side belongs to the
    /// boundary glue.
    pub fn new(
        config: MmeConfig,
        action_tx: mpsc::Sender<EmmAction>,
    ) -> Result<(Self, TaskHandle<EmmMessage>, mpsc::Receiver<TaskMessage<EmmMessage>>), Error>
    {
        let ues = UeContextManager::new(config.timers);
        let router = EmmRouter::new(config)?;
        let (tx, rx) = mpsc::channel(DEFAULT_CHANNEL_CAPACITY);
        Ok((
            Self {
                ues,
                router,
                action_tx,
            },
            TaskHandle::new(tx),
            rx,
        ))
    }

    async fn handle_message(&mut self, msg: EmmMessage) {
        let actions = match msg {
            EmmMessage::InitialAttach { ies } => {
                let (ue_id, actions) = self.router.handle_attach_request(&mut self.ues, ies);
                debug!(ue_id, "attach attempt accepted for processing");
                actions
            }
            EmmMessage::UplinkNas { ue_id, message } => {
                self.router
                    .handle_event(&mut self.ues, ue_id, EmmEvent::Nas(message))
            }
            EmmMessage::LowerLayer { ue_id, event } => {
                self.router
                    .handle_event(&mut self.ues, ue_id, EmmEvent::LowerLayer(event))
            }
            EmmMessage::CnAnswer { ue_id, response } => {
                self.router
                    .handle_event(&mut self.ues, ue_id, EmmEvent::Cn(response))
            }
            EmmMessage::InitiateDetach { ue_id } => {
                self.router.initiate_detach(&mut self.ues, ue_id)
            }
        };
        self.dispatch(actions).await;
    }

    /// Ticks every context's timers and routes the expiries.
    async fn handle_tick(&mut self) {
        let mut expired = Vec::new();
        for ctx in self.ues.contexts_mut() {
            for event in ctx.procedures.perform_tick() {
                expired.push((ctx.ue_id, event));
            }
        }
        for (ue_id, event) in expired {
            let actions =
                self.router
                    .handle_event(&mut self.ues, ue_id, EmmEvent::TimerExpiry(event));
            self.dispatch(actions).await;
        }
    }

    async fn dispatch(&self, actions: Vec<EmmAction>) {
        for action in actions {
            if let EmmAction::SendNasMessage { msg_type, payload, .. } = &action {
                log_nas_message(Direction::Tx, &msg_type.to_string(), payload.as_slice());
            }
            if self.action_tx.send(action).await.is_err() {
                warn!("action channel closed, dropping outbound action");
            }
        }
    }
}

#[async_trait]
impl Task for EmmTask {
    type Message = EmmMessage;

    async fn run(&mut self, mut rx: mpsc::Receiver<TaskMessage<EmmMessage>>) {
        info!(config = %self.router.config(), "EMM task started");
        let mut ticker = interval(Duration::from_millis(TICK_INTERVAL_MS));
        loop {
            tokio::select! {
                envelope = rx.recv() => {
                    match envelope {
                        Some(TaskMessage::Message(msg)) => self.handle_message(msg).await,
                        Some(TaskMessage::Shutdown) | None => {
                            info!("EMM task shutting down");
                            break;
                        }
                    }
                }
                _ = ticker.tick() => {
                    self.handle_tick().await;
                }
            }
        }
    }
}
