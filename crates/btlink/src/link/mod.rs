//! HCI link management
//!
//! This module provides the link-management core, which is responsible for:
//! - The ACL connection lifecycle (create, share, idle-expire, tear down)
//! - Fragmentation of outbound PDUs and reassembly of inbound fragments
//! - Credit-based flow control against the controller's packet buffers
//! - Link mode negotiation (authentication, encryption, link-key change)
//! - SCO connections riding on established ACL links

pub mod constants;
pub mod types;
pub mod packet;
pub mod transport;
pub mod upper;
mod link;
pub mod core;

// Re-export the public API
pub use self::types::*;
pub use self::core::LinkManager;
pub use self::packet::{AclDataPacket, BoundaryFlag, HciCommand, ScoDataPacket};
pub use self::transport::{HciTransport, TransportRef};
pub use self::upper::{
    AclChannel, AclInputCallback, ChannelRef, ScoEndpoint, ScoEndpointRef, ScoListener,
    ScoListenerRef,
};
