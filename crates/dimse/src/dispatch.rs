//! Per-association dispatch loop
//!
//! Receives DIMSE commands one at a time and hands each to the handler
//! registered for its command field. Messages are processed strictly in
//! arrival order; the next command is not read before the current handler
//! has returned.

use std::sync::Arc;

use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::command::DimseMessage;
use crate::registry::{ServiceContext, ServiceRegistry};
use crate::transport::{DimseChannel, Incoming};
use crate::types::CommandField;
use crate::{DimseError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    Ready,
    Receiving,
    Handling,
    Closing,
    Closed,
}

/// How an association ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Peer released the association normally
    Released,
    /// Peer aborted
    Aborted,
    /// Transport or protocol failure
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchReport {
    pub outcome: DispatchOutcome,
    pub commands_handled: usize,
}

pub struct DispatchLoop<C: DimseChannel> {
    registry: Arc<ServiceRegistry>,
    context: ServiceContext,
    channel: C,
    state: DispatchState,
    commands_handled: usize,
}

impl<C: DimseChannel> DispatchLoop<C> {
    pub fn new(registry: Arc<ServiceRegistry>, context: ServiceContext, channel: C) -> Self {
        Self {
            registry,
            context,
            channel,
            state: DispatchState::Ready,
            commands_handled: 0,
        }
    }

    pub fn state(&self) -> DispatchState {
        self.state
    }

    /// Serve the association until it ends; the channel is closed exactly once
    pub async fn run(mut self) -> (DispatchReport, C) {
        let association = &self.context.association;
        let span = info_span!(
            "association",
            id = %association.id(),
            peer = %association.peer_addr(),
            calling = %association.calling_ae_title(),
        );

        let outcome = self.serve().instrument(span.clone()).await;

        self.state = DispatchState::Closing;
        self.channel.close().await;
        self.state = DispatchState::Closed;

        let report = DispatchReport {
            outcome,
            commands_handled: self.commands_handled,
        };
        span.in_scope(|| match &report.outcome {
            DispatchOutcome::Failed(reason) => {
                warn!("Association closed after failure: {}", reason)
            }
            outcome => info!(
                "Association closed ({:?}, {} commands handled)",
                outcome, report.commands_handled
            ),
        });
        (report, self.channel)
    }

    async fn serve(&mut self) -> DispatchOutcome {
        loop {
            self.state = DispatchState::Receiving;
            match self.channel.receive().await {
                Ok(Incoming::Message(message)) => {
                    if let Err(e) = self.route(message).await {
                        return DispatchOutcome::Failed(e.to_string());
                    }
                }
                Ok(Incoming::ReleaseRequested) => {
                    debug!("Release requested by peer");
                    return match self.channel.acknowledge_release().await {
                        Ok(()) => DispatchOutcome::Released,
                        Err(e) => DispatchOutcome::Failed(e.to_string()),
                    };
                }
                Ok(Incoming::ReleaseReplied) => {
                    warn!("Unsolicited A-RELEASE-RP");
                    return DispatchOutcome::Released;
                }
                Ok(Incoming::Aborted) => return DispatchOutcome::Aborted,
                Err(e) => return DispatchOutcome::Failed(e.to_string()),
            }
        }
    }

    async fn route(&mut self, message: DimseMessage) -> Result<()> {
        let command = message.command_field();

        if command == CommandField::CCancelRq {
            debug!(
                "Late C-CANCEL-RQ for message {:?} dropped",
                message.command.message_id_being_responded_to
            );
            return Ok(());
        }

        if self
            .context
            .association
            .context(message.presentation_context_id)
            .is_none()
        {
            error!(
                "{} on presentation context {} which was not negotiated",
                command, message.presentation_context_id
            );
            self.abort().await;
            return Err(DimseError::UnknownPresentationContext(
                message.presentation_context_id,
            ));
        }

        let Some(handler) = self.registry.get(command).cloned() else {
            error!("No handler registered for {}", command);
            self.abort().await;
            return Err(DimseError::UnsupportedCommand(command));
        };

        self.state = DispatchState::Handling;
        debug!(
            command = %command,
            message_id = ?message.command.message_id,
            "Dispatching"
        );
        let result = handler
            .handle(&self.context, message, &mut self.channel)
            .await;
        self.commands_handled += 1;

        match result {
            Ok(()) => Ok(()),
            Err(e) if e.is_fatal_to_association() => {
                error!("{} handler failed: {}", command, e);
                if !matches!(e, DimseError::Network(_) | DimseError::Aborted) {
                    self.abort().await;
                }
                Err(e)
            }
            Err(e) => {
                warn!("{} handler reported an error: {}", command, e);
                Ok(())
            }
        }
    }

    async fn abort(&mut self) {
        if let Err(e) = self.channel.abort().await {
            debug!("Failed to send A-ABORT: {}", e);
        }
    }
}
