//! DIMSE (DICOM Message Service Element) implementation
//!
//! This crate provides both Service Class Provider (SCP) and Service Class User (SCU)
//! implementations for DICOM networking using the DIMSE protocol.
//!
//! # Features
//! - Association negotiation driven by service-class flags
//! - Inbound DIMSE services (SCP): C-ECHO, C-FIND with cancellation, C-STORE
//! - Outbound DIMSE services (SCU): C-ECHO, C-FIND, C-MOVE
//! - One task per association; handlers looked up in an immutable registry
//! - Storage and query back ends supplied by the host through [`MatchProvider`]
//!   and [`RetrieveSink`]

pub mod association;
pub mod command;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod negotiator;
pub mod provider;
pub mod registry;
pub mod scp;
pub mod scu;
pub mod services;
pub mod status;
pub mod transport;
pub mod types;
pub mod uids;
pub mod wire;

// Re-export commonly used types
pub use association::{Association, NegotiatedContext, PresentationContextProposal};
pub use command::{CommandSet, DimseMessage};
pub use config::{DimseConfig, RemoteNode};
pub use dispatch::{DispatchLoop, DispatchOutcome, DispatchReport};
pub use error::{DimseError, Result};
pub use negotiator::{AssociationNegotiator, AssociationRequest, NegotiationOutcome, RejectReason};
pub use provider::{MatchProvider, MatchQuery, ProviderError, RetrieveSink, RetrievedDataset, SinkError};
pub use registry::{ServiceContext, ServiceHandler, ServiceRegistry};
pub use scp::AssociationListener;
pub use scu::{DimseScu, MoveIdentifier, RetrieveSummary, ScuBuilder};
pub use services::{EchoHandler, FindHandler, StoreHandler};
pub use transport::{ClientChannel, DimseChannel, Incoming, TcpChannel};
pub use types::{CommandField, DimseStatus, QueryLevel};

/// DIMSE protocol version
pub const DIMSE_VERSION: &str = "0.2.0";

/// Default DICOM port (non-TLS)
pub const DEFAULT_DIMSE_PORT: u16 = 11112;
