//! Association and presentation context model

use std::net::SocketAddr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// A presentation context as proposed by the association requestor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresentationContextProposal {
    /// Odd context identifier chosen by the requestor
    pub id: u8,
    pub abstract_syntax: String,
    pub transfer_syntaxes: Vec<String>,
    /// SCP/SCU role selection sub-item, if the requestor sent one
    pub role: Option<RoleProposal>,
}

/// Roles the requestor offers to play for one abstract syntax
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoleProposal {
    pub scu: bool,
    pub scp: bool,
}

/// Role this node plays for a negotiated context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalRole {
    /// We provide the service (default role of an acceptor)
    Scp,
    /// We invoke the service: outbound associations, C-GET sub-operations
    Scu,
    Both,
}

impl LocalRole {
    /// Role granted when honouring a requestor's role selection
    pub fn from_proposal(proposal: Option<RoleProposal>) -> Self {
        match proposal {
            Some(RoleProposal { scu: true, scp: true }) => LocalRole::Both,
            Some(RoleProposal { scu: false, scp: true }) => LocalRole::Scu,
            _ => LocalRole::Scp,
        }
    }

    /// Role selection values (requestor SCU, requestor SCP) echoed back to the peer
    pub fn requestor_roles(&self) -> (bool, bool) {
        match self {
            LocalRole::Scp => (true, false),
            LocalRole::Scu => (false, true),
            LocalRole::Both => (true, true),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextResult {
    Accepted,
    AbstractSyntaxNotSupported,
    TransferSyntaxesNotSupported,
    /// Rejected by the peer for a reason not covered above
    Rejected,
}

/// Outcome of negotiating one presentation context
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiatedContext {
    pub id: u8,
    pub abstract_syntax: String,
    /// Selected transfer syntax; for rejected contexts, the first one proposed
    pub transfer_syntax: String,
    pub result: ContextResult,
    pub role: LocalRole,
}

impl NegotiatedContext {
    pub fn accepted(
        id: u8,
        abstract_syntax: impl Into<String>,
        transfer_syntax: impl Into<String>,
        role: LocalRole,
    ) -> Self {
        Self {
            id,
            abstract_syntax: abstract_syntax.into(),
            transfer_syntax: transfer_syntax.into(),
            result: ContextResult::Accepted,
            role,
        }
    }

    pub fn rejected(proposal: &PresentationContextProposal, result: ContextResult) -> Self {
        Self {
            id: proposal.id,
            abstract_syntax: proposal.abstract_syntax.clone(),
            transfer_syntax: proposal.transfer_syntaxes.first().cloned().unwrap_or_default(),
            result,
            role: LocalRole::Scp,
        }
    }

    pub fn is_accepted(&self) -> bool {
        self.result == ContextResult::Accepted
    }
}

/// A negotiated session between two application entities.
///
/// The context list is fixed at construction; only the owning worker holds the value.
#[derive(Debug, Clone)]
pub struct Association {
    id: Uuid,
    calling_ae_title: String,
    called_ae_title: String,
    peer_addr: SocketAddr,
    contexts: Vec<NegotiatedContext>,
    max_pdu_length: u32,
    peer_max_pdu_length: u32,
    acse_timeout: Duration,
    established_at: DateTime<Utc>,
}

impl Association {
    pub fn new(
        peer_addr: SocketAddr,
        calling_ae_title: impl Into<String>,
        called_ae_title: impl Into<String>,
        contexts: Vec<NegotiatedContext>,
        max_pdu_length: u32,
        peer_max_pdu_length: u32,
        acse_timeout: Duration,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            calling_ae_title: calling_ae_title.into(),
            called_ae_title: called_ae_title.into(),
            peer_addr,
            contexts,
            max_pdu_length,
            peer_max_pdu_length,
            acse_timeout,
            established_at: Utc::now(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn calling_ae_title(&self) -> &str {
        &self.calling_ae_title
    }

    pub fn called_ae_title(&self) -> &str {
        &self.called_ae_title
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// All negotiated contexts, accepted or not
    pub fn contexts(&self) -> &[NegotiatedContext] {
        &self.contexts
    }

    /// Accepted context with the given identifier
    pub fn context(&self, id: u8) -> Option<&NegotiatedContext> {
        self.contexts
            .iter()
            .find(|pc| pc.id == id && pc.is_accepted())
    }

    /// First accepted context for an abstract syntax
    pub fn context_for(&self, abstract_syntax: &str) -> Option<&NegotiatedContext> {
        self.contexts
            .iter()
            .find(|pc| pc.abstract_syntax == abstract_syntax && pc.is_accepted())
    }

    pub fn accepted_contexts(&self) -> impl Iterator<Item = &NegotiatedContext> {
        self.contexts.iter().filter(|pc| pc.is_accepted())
    }

    /// Largest PDU we agreed to receive
    pub fn max_pdu_length(&self) -> u32 {
        self.max_pdu_length
    }

    /// Largest PDU the peer accepts; 0 means unlimited
    pub fn peer_max_pdu_length(&self) -> u32 {
        self.peer_max_pdu_length
    }

    pub fn acse_timeout(&self) -> Duration {
        self.acse_timeout
    }

    pub fn established_at(&self) -> DateTime<Utc> {
        self.established_at
    }
}
