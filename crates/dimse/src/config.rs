//! Configuration types for DIMSE services

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use crate::error::DimseError;
use crate::DEFAULT_DIMSE_PORT;

const DEFAULT_AE_TITLE: &str = "DIMSE_NODE";
const DEFAULT_MAX_PDU: u32 = 16384;
const MIN_PDU: u32 = 4096;
const MAX_PDU: u32 = 131072;
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_ACSE_TIMEOUT_SECS: u64 = 30;
const DEFAULT_ACCEPT_POLL_MS: u64 = 1000;
const DEFAULT_MAX_ASSOCIATIONS: u32 = 10;

/// Settings of the local application entity, for both the listener and the SCU
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DimseConfig {
    #[serde(default = "default_ae_title")]
    pub ae_title: String,

    /// Listener bind address
    #[serde(default = "default_bind_addr")]
    pub bind_addr: IpAddr,

    /// Port for SCP listener (0 picks an ephemeral port)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Maximum PDU size in bytes we are willing to receive
    #[serde(default = "default_max_pdu")]
    pub max_pdu: u32,

    /// Connection timeout in milliseconds (SCU side)
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// ACSE timeout in seconds: association request/accept/release exchanges
    #[serde(default = "default_acse_timeout")]
    pub acse_timeout_secs: u64,

    /// How long one accept poll waits before the stop flag is checked again
    #[serde(default = "default_accept_poll")]
    pub accept_poll_ms: u64,

    /// Inbound associations served at once; further requests are rejected
    #[serde(default = "default_max_associations")]
    pub max_associations: u32,

    /// Accept C-GET contexts and storage contexts in the SCU role
    #[serde(default)]
    pub enable_get: bool,

    /// Accept Patient Root Q/R information models
    #[serde(default = "default_true")]
    pub enable_patient_root: bool,

    /// Accept Study Root Q/R information models
    #[serde(default = "default_true")]
    pub enable_study_root: bool,

    /// Accept the retired Patient/Study Only Q/R information models
    #[serde(default)]
    pub enable_patient_study_only: bool,

    /// Honour a peer proposing the private shutdown SOP class
    #[serde(default)]
    pub allow_shutdown: bool,

    /// Accept abstract syntaxes that are neither in the service table nor storage classes
    #[serde(default = "default_true")]
    pub accept_unknown_syntaxes: bool,

    /// Reject associations whose called AE title differs from ours
    #[serde(default)]
    pub check_called_ae_title: bool,
}

/// A peer this node talks to as an SCU.
///
/// `connect_timeout_ms` and `max_pdu` replace the local [`DimseConfig`]
/// values for associations opened towards this node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteNode {
    pub ae_title: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub connect_timeout_ms: Option<u64>,
    #[serde(default)]
    pub max_pdu: Option<u32>,
}

impl Default for DimseConfig {
    fn default() -> Self {
        Self {
            ae_title: default_ae_title(),
            bind_addr: default_bind_addr(),
            port: default_port(),
            max_pdu: default_max_pdu(),
            connect_timeout_ms: default_connect_timeout(),
            acse_timeout_secs: default_acse_timeout(),
            accept_poll_ms: default_accept_poll(),
            max_associations: default_max_associations(),
            enable_get: false,
            enable_patient_root: true,
            enable_study_root: true,
            enable_patient_study_only: false,
            allow_shutdown: false,
            accept_unknown_syntaxes: true,
            check_called_ae_title: false,
        }
    }
}

impl DimseConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn acse_timeout(&self) -> Duration {
        Duration::from_secs(self.acse_timeout_secs)
    }

    pub fn accept_poll_interval(&self) -> Duration {
        Duration::from_millis(self.accept_poll_ms)
    }

    pub fn validate(&self) -> crate::error::Result<()> {
        validate_ae_title(&self.ae_title)?;
        check_max_pdu(self.max_pdu)?;
        if self.acse_timeout_secs == 0 {
            return Err(DimseError::config("acse_timeout_secs must be at least 1"));
        }
        if self.accept_poll_ms == 0 {
            return Err(DimseError::config("accept_poll_ms must be at least 1"));
        }
        if self.max_associations == 0 {
            return Err(DimseError::config("max_associations must be at least 1"));
        }
        Ok(())
    }
}

impl RemoteNode {
    pub fn new(ae_title: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            ae_title: ae_title.into(),
            host: host.into(),
            port,
            connect_timeout_ms: None,
            max_pdu: None,
        }
    }

    /// `host:port` form used to open the TCP connection
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// TCP connect timeout towards this node, `local` unless overridden
    pub fn connect_timeout_or(&self, local: &DimseConfig) -> Duration {
        self.connect_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| local.connect_timeout())
    }

    /// Maximum PDU length proposed to this node, `local` unless overridden
    pub fn max_pdu_or(&self, local: &DimseConfig) -> u32 {
        self.max_pdu.unwrap_or(local.max_pdu)
    }

    pub fn validate(&self) -> crate::error::Result<()> {
        validate_ae_title(&self.ae_title)?;
        if self.host.trim().is_empty() {
            return Err(DimseError::config(format!("remote '{}' has no host", self.ae_title)));
        }
        if self.port == 0 {
            return Err(DimseError::config(format!("remote '{}' has port 0", self.ae_title)));
        }
        if let Some(max_pdu) = self.max_pdu {
            check_max_pdu(max_pdu)?;
        }
        Ok(())
    }
}

/// AE titles are 1-16 characters of the default repertoire, no backslash
pub fn validate_ae_title(ae_title: &str) -> crate::error::Result<()> {
    let trimmed = ae_title.trim();
    if trimmed.is_empty() || ae_title.len() > 16 {
        return Err(DimseError::InvalidAeTitle(format!(
            "'{}' must be 1-16 characters",
            ae_title
        )));
    }
    if ae_title.chars().any(|c| c == '\\' || c.is_control() || !c.is_ascii()) {
        return Err(DimseError::InvalidAeTitle(format!(
            "'{}' contains characters outside the default repertoire",
            ae_title
        )));
    }
    Ok(())
}

fn check_max_pdu(max_pdu: u32) -> crate::error::Result<()> {
    if !(MIN_PDU..=MAX_PDU).contains(&max_pdu) {
        return Err(DimseError::config(format!(
            "max_pdu {} outside {}..={}",
            max_pdu, MIN_PDU, MAX_PDU
        )));
    }
    Ok(())
}

fn default_ae_title() -> String {
    DEFAULT_AE_TITLE.to_string()
}

fn default_bind_addr() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_port() -> u16 {
    DEFAULT_DIMSE_PORT
}

fn default_max_pdu() -> u32 {
    DEFAULT_MAX_PDU
}

fn default_connect_timeout() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_MS
}

fn default_acse_timeout() -> u64 {
    DEFAULT_ACSE_TIMEOUT_SECS
}

fn default_accept_poll() -> u64 {
    DEFAULT_ACCEPT_POLL_MS
}

fn default_max_associations() -> u32 {
    DEFAULT_MAX_ASSOCIATIONS
}

fn default_true() -> bool {
    true
}
