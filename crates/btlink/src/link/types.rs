//! Type definitions for link-management operations
//!
//! This module contains the core data structures used by the link layer:
//! errors, link states, mode flags and controller configuration.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use bitflags::bitflags;
use thiserror::Error;

use super::constants::*;
use crate::error::HciError;

/// Error types specific to link-management operations
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("link is down")]
    LinkDown,

    #[error("link not found")]
    LinkNotFound,

    #[error("invalid state for operation")]
    InvalidState,

    #[error("payload of {0} bytes exceeds the link packet size")]
    PayloadTooLarge(usize),

    #[error("outbound queue limit reached")]
    QueueFull,

    #[error("HCI error: {0}")]
    Hci(#[from] HciError),
}

/// Result type for link-management operations
pub type LinkResult<T> = std::result::Result<T, LinkError>;

/// Lifecycle state of a link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// No connection
    Closed,
    /// Connection request sent to the controller, or inbound request pending
    WaitConnect,
    /// Authentication requested to the controller
    WaitAuth,
    /// Encryption change requested to the controller
    WaitEncrypt,
    /// Link-key change requested to the controller
    WaitSecure,
    /// Fully usable
    Open,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "Closed"),
            Self::WaitConnect => write!(f, "Waiting for connection"),
            Self::WaitAuth => write!(f, "Waiting for authentication"),
            Self::WaitEncrypt => write!(f, "Waiting for encryption change"),
            Self::WaitSecure => write!(f, "Waiting for link-key change"),
            Self::Open => write!(f, "Open"),
        }
    }
}

/// Kind of link, fixed at creation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    /// Asynchronous data connection
    Acl,
    /// Synchronous voice connection, rides on an ACL link
    Sco,
}

bitflags! {
    /// Link mode facets. Each facet exists as a requested and an achieved
    /// set on the link; the combined achieved mask is what upper layers see.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct LinkMode: u8 {
        const AUTH = 0x01;
        const ENCRYPT = 0x02;
        const SECURE = 0x04;
    }
}

/// Outcome of a `set_mode` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeProgress {
    /// A controller command was issued; call again after the completion event
    InProgress,
    /// All requested facets are already achieved
    Complete,
}

/// Opaque identifier for a link within one controller context.
///
/// Identifiers are allocated in creation order and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LinkId(pub(crate) u32);

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link#{}", self.0)
    }
}

/// Bluetooth device address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BdAddr {
    pub bytes: [u8; 6],
}

impl BdAddr {
    pub const ANY: BdAddr = BdAddr { bytes: [0; 6] };

    pub fn new(bytes: [u8; 6]) -> Self {
        Self { bytes }
    }

    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        if slice.len() >= 6 {
            let mut bytes = [0u8; 6];
            bytes.copy_from_slice(&slice[0..6]);
            Some(Self { bytes })
        } else {
            None
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }
}

impl fmt::Display for BdAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            self.bytes[5],
            self.bytes[4],
            self.bytes[3],
            self.bytes[2],
            self.bytes[1],
            self.bytes[0]
        )
    }
}

/// Parse a colon-separated address string such as `00:11:22:33:44:55`.
/// The leftmost octet in the text is the most significant byte.
impl FromStr for BdAddr {
    type Err = HciError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 6 {
            return Err(HciError::InvalidPacketFormat);
        }

        let mut bytes = [0u8; 6];
        for (i, part) in parts.iter().enumerate() {
            let octet = hex::decode(part).map_err(|_| HciError::InvalidPacketFormat)?;
            if octet.len() != 1 {
                return Err(HciError::InvalidPacketFormat);
            }
            bytes[5 - i] = octet[0];
        }

        Ok(Self { bytes })
    }
}

/// Per-controller configuration for the link manager.
///
/// `acl_data_len` and `acl_num_pkts` are starting values; they are replaced
/// once the controller's buffer-size report is delivered via
/// `LinkManager::set_packet_info`.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Address of the local controller, handed to SCO listeners
    pub local_addr: BdAddr,
    /// Idle-expiry interval for unreferenced links; zero disables auto-expiry
    pub idle_timeout: Duration,
    /// Maximum ACL fragment payload accepted by the controller
    pub acl_data_len: usize,
    /// Number of ACL packet slots in the controller
    pub acl_num_pkts: u16,
    /// Maximum SCO payload accepted by the controller
    pub sco_data_len: usize,
    /// Upper bound on queued outbound PDUs per link
    pub max_pdu_queue: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            local_addr: BdAddr::ANY,
            idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
            acl_data_len: ACL_DEFAULT_DATA_LEN,
            acl_num_pkts: ACL_DEFAULT_NUM_PKTS,
            sco_data_len: SCO_DEFAULT_DATA_LEN,
            max_pdu_queue: DEFAULT_MAX_PDU_QUEUE,
        }
    }
}
