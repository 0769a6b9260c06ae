//! HCI packet structures and parsing for the link layer
//!
//! Command encoding plus the ACL and SCO data packet codecs. All
//! multi-byte fields are little-endian per the HCI specification.

use byteorder::{ByteOrder, LittleEndian};

use super::constants::*;
use super::types::BdAddr;

/// Link-layer HCI commands issued by this core
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum HciCommand {
    CreateConnection {
        bd_addr: BdAddr,
        packet_type: u16,
        allow_role_switch: bool,
    },
    Disconnect {
        handle: u16,
        reason: u8,
    },
    AuthRequested {
        handle: u16,
    },
    SetConnectionEncryption {
        handle: u16,
        enable: bool,
    },
    ChangeConnectionLinkKey {
        handle: u16,
    },
}

impl HciCommand {
    /// Get the OGF and OCF for this command
    pub fn opcode_parts(&self) -> (u8, u16) {
        match self {
            Self::CreateConnection { .. } => (OGF_LINK_CTL, OCF_CREATE_CONNECTION),
            Self::Disconnect { .. } => (OGF_LINK_CTL, OCF_DISCONNECT),
            Self::AuthRequested { .. } => (OGF_LINK_CTL, OCF_AUTH_REQUESTED),
            Self::SetConnectionEncryption { .. } => (OGF_LINK_CTL, OCF_SET_CONNECTION_ENCRYPTION),
            Self::ChangeConnectionLinkKey { .. } => (OGF_LINK_CTL, OCF_CHANGE_CONNECTION_LINK_KEY),
        }
    }

    /// Get the combined 16-bit opcode
    pub fn opcode(&self) -> u16 {
        let (ogf, ocf) = self.opcode_parts();
        ((ogf as u16) << 10) | (ocf & 0x03FF)
    }

    /// Convert the command to its raw parameter bytes
    fn parameters(&self) -> Vec<u8> {
        match *self {
            Self::CreateConnection {
                bd_addr,
                packet_type,
                allow_role_switch,
            } => {
                let mut params = Vec::with_capacity(13);
                params.extend_from_slice(bd_addr.as_slice());
                params.extend_from_slice(&packet_type.to_le_bytes());
                params.push(0x00); // page scan repetition mode R0
                params.push(0x00); // reserved
                params.extend_from_slice(&0u16.to_le_bytes()); // clock offset unknown
                params.push(allow_role_switch as u8);
                params
            }

            Self::Disconnect { handle, reason } => {
                let mut params = Vec::with_capacity(3);
                params.extend_from_slice(&handle.to_le_bytes());
                params.push(reason);
                params
            }

            Self::AuthRequested { handle } => handle.to_le_bytes().to_vec(),

            Self::SetConnectionEncryption { handle, enable } => {
                let mut params = Vec::with_capacity(3);
                params.extend_from_slice(&handle.to_le_bytes());
                params.push(enable as u8);
                params
            }

            Self::ChangeConnectionLinkKey { handle } => handle.to_le_bytes().to_vec(),
        }
    }

    /// Convert the command to a raw HCI packet
    pub fn to_packet(&self) -> Vec<u8> {
        let params = self.parameters();

        let mut packet = vec![HCI_COMMAND_PKT];
        packet.extend_from_slice(&self.opcode().to_le_bytes());
        packet.push(params.len() as u8);
        packet.extend_from_slice(&params);
        packet
    }
}

/// Position of a fragment within its PDU
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundaryFlag {
    /// First fragment of a PDU
    FirstFragment,
    /// Continuation of a previously started PDU
    Continuation,
}

impl BoundaryFlag {
    fn to_bits(self) -> u16 {
        match self {
            Self::FirstFragment => ACL_PB_FIRST as u16,
            Self::Continuation => ACL_PB_CONTINUING as u16,
        }
    }

    fn from_bits(bits: u16) -> Option<Self> {
        match bits as u8 {
            ACL_PB_FIRST => Some(Self::FirstFragment),
            ACL_PB_CONTINUING => Some(Self::Continuation),
            _ => None,
        }
    }
}

/// One ACL data fragment as it crosses the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AclDataPacket {
    pub handle: u16,
    pub boundary: BoundaryFlag,
    pub payload: Vec<u8>,
}

impl AclDataPacket {
    pub fn new(handle: u16, boundary: BoundaryFlag, payload: Vec<u8>) -> Self {
        Self {
            handle,
            boundary,
            payload,
        }
    }

    /// Serialize to the 4-byte ACL header followed by the payload
    pub fn to_bytes(&self) -> Vec<u8> {
        let hf = (self.handle & 0x0FFF) | (self.boundary.to_bits() << 12);

        let mut bytes = Vec::with_capacity(4 + self.payload.len());
        bytes.extend_from_slice(&hf.to_le_bytes());
        bytes.extend_from_slice(&(self.payload.len() as u16).to_le_bytes());
        bytes.extend_from_slice(&self.payload);
        bytes
    }

    /// Parse an ACL data packet from raw bytes (without the packet-type byte)
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < 4 {
            return None;
        }

        let hf = LittleEndian::read_u16(&data[0..2]);
        let len = LittleEndian::read_u16(&data[2..4]) as usize;
        if data.len() < 4 + len {
            return None;
        }

        let boundary = BoundaryFlag::from_bits((hf >> 12) & 0x03)?;

        Some(Self {
            handle: hf & 0x0FFF,
            boundary,
            payload: data[4..4 + len].to_vec(),
        })
    }
}

/// One SCO data packet as it crosses the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScoDataPacket {
    pub handle: u16,
    pub payload: Vec<u8>,
}

impl ScoDataPacket {
    pub fn new(handle: u16, payload: Vec<u8>) -> Self {
        Self { handle, payload }
    }

    /// Serialize to the 3-byte SCO header followed by the payload
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(3 + self.payload.len());
        bytes.extend_from_slice(&(self.handle & 0x0FFF).to_le_bytes());
        bytes.push(self.payload.len() as u8);
        bytes.extend_from_slice(&self.payload);
        bytes
    }

    /// Parse a SCO data packet from raw bytes (without the packet-type byte)
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < 3 {
            return None;
        }

        let handle = LittleEndian::read_u16(&data[0..2]) & 0x0FFF;
        let len = data[2] as usize;
        if data.len() < 3 + len {
            return None;
        }

        Some(Self {
            handle,
            payload: data[3..3 + len].to_vec(),
        })
    }
}
