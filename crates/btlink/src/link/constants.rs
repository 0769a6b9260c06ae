//! HCI protocol constants used by the link-management core
//!
//! Opcodes, packet-boundary flags, disconnect reasons and default
//! controller buffer geometry.

// HCI packet types
pub const HCI_COMMAND_PKT: u8 = 0x01;
pub const HCI_ACL_PKT: u8 = 0x02;
pub const HCI_SCO_PKT: u8 = 0x03;
pub const HCI_EVENT_PKT: u8 = 0x04;

// Maximum size of HCI command parameters
pub const HCI_MAX_PARAM_LEN: usize = 255;

// Common OGF (Opcode Group Field) values
pub const OGF_LINK_CTL: u8 = 0x01;
pub const OGF_LINK_POLICY: u8 = 0x02;
pub const OGF_HOST_CTL: u8 = 0x03;

// Link Control Commands (OGF: 0x01)
pub const OCF_CREATE_CONNECTION: u16 = 0x0005;
pub const OCF_DISCONNECT: u16 = 0x0006;
pub const OCF_ACCEPT_CONNECTION_REQUEST: u16 = 0x0009;
pub const OCF_REJECT_CONNECTION_REQUEST: u16 = 0x000A;
pub const OCF_AUTH_REQUESTED: u16 = 0x0011;
pub const OCF_SET_CONNECTION_ENCRYPTION: u16 = 0x0013;
pub const OCF_CHANGE_CONNECTION_LINK_KEY: u16 = 0x0015;

// ACL packet boundary flags (bits 12-13 of the handle field)
pub const ACL_PB_CONTINUING: u8 = 0x01;
pub const ACL_PB_FIRST: u8 = 0x02;

// Disconnect / failure reason codes
pub const REASON_AUTH_FAILURE: u8 = 0x05;
pub const REASON_CONNECTION_TIMEOUT: u8 = 0x08;
pub const REASON_REMOTE_USER_TERMINATED: u8 = 0x13;
pub const REASON_UNACCEPTABLE_BD_ADDR: u8 = 0x0F;
pub const REASON_UNSPECIFIED_ERROR: u8 = 0x1F;

// Default packet-type mask for Create_Connection (DM1/DH1/DM3/DH3/DM5/DH5)
pub const ACL_DEFAULT_PACKET_TYPES: u16 = 0xCC18;

// Default controller buffer geometry, replaced once the controller's
// buffer-size report is known. 339 bytes is the DM5 payload maximum.
pub const ACL_DEFAULT_DATA_LEN: usize = 339;
pub const ACL_DEFAULT_NUM_PKTS: u16 = 8;
pub const SCO_DEFAULT_DATA_LEN: usize = 64;

// L2CAP basic header: 2-byte length + 2-byte channel id
pub const FRAME_HEADER_LEN: usize = 4;

// Default idle-expiry interval in seconds; zero disables auto-expiry
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 10;

// Upper bound on queued outbound PDUs per link
pub const DEFAULT_MAX_PDU_QUEUE: usize = 32;
