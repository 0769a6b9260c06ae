//! btlink - Bluetooth HCI link management
//!
//! This library provides the link-management layer of a Bluetooth host
//! stack: it owns the ACL and SCO connections of one controller, drives
//! their lifecycle state machines, fragments and reassembles data
//! against the controller's buffer geometry, and schedules transmission
//! with credit-based flow control. Upper layers (such as L2CAP channels
//! and SCO audio endpoints) attach through the traits in [`link::upper`];
//! the HCI driver attaches through [`link::transport::HciTransport`].

pub mod error;
pub mod link;

// Re-export common types for convenience
pub use error::HciError;
pub use link::{
    AclChannel, AclDataPacket, BdAddr, BoundaryFlag, ChannelRef, HciCommand, HciTransport,
    LinkConfig, LinkError, LinkId, LinkKind, LinkManager, LinkMode, LinkResult, LinkState,
    ModeProgress, ScoDataPacket, ScoEndpoint, ScoEndpointRef, ScoListener, ScoListenerRef,
    TransportRef,
};
