//! Upper-layer capability traits
//!
//! An L2CAP channel binds to an ACL link through [`AclChannel`]; SCO
//! audio endpoints are offered inbound connections through
//! [`ScoListener`] and receive data through [`ScoEndpoint`]. Handles are
//! `Arc<Mutex<dyn …>>` so one object can be held by both the caller and
//! the link core.

use std::sync::{Arc, Mutex};

use super::types::{BdAddr, LinkMode};

/// Capability set an upper-layer channel exposes to the link core.
///
/// All callbacks are invoked outside the manager's internal lock, so an
/// implementation may call back into the manager (for example `send`
/// from `ready`, or `close` from `disconnected`).
pub trait AclChannel: Send {
    /// Mode negotiation on the underlying link settled; `mode` is the
    /// combined achieved mask. The channel decides whether the achieved
    /// mode meets its requirement and proceeds or aborts accordingly.
    fn link_mode(&mut self, mode: LinkMode);

    /// `count` of the channel's queued PDUs cleared the controller.
    fn complete(&mut self, count: usize);

    /// Every fragment of the channel's current PDU was handed to the
    /// transport; the channel may queue more data.
    fn ready(&mut self);

    /// The underlying link went away; `reason` is an HCI error code.
    fn disconnected(&mut self, reason: u8);
}

/// Shared handle to an upper-layer channel
pub type ChannelRef = Arc<Mutex<dyn AclChannel>>;

/// Receiver of inbound SCO connection offers
pub trait ScoListener: Send {
    /// An inbound SCO connection arrived on `local_addr` from
    /// `remote_addr`. Return an endpoint to accept, `None` to decline.
    fn new_connection(&mut self, local_addr: BdAddr, remote_addr: BdAddr)
        -> Option<ScoEndpointRef>;
}

/// Shared handle to a SCO listener
pub type ScoListenerRef = Arc<Mutex<dyn ScoListener>>;

/// Capability set of a bound SCO endpoint
pub trait ScoEndpoint: Send {
    /// One inbound SCO payload, transport header already stripped.
    fn input(&mut self, payload: &[u8]);

    /// `count` outbound SCO packets cleared the controller.
    fn complete(&mut self, count: usize);

    /// The SCO link (or its carrying ACL link) went away.
    fn disconnected(&mut self, reason: u8);
}

/// Shared handle to a SCO endpoint
pub type ScoEndpointRef = Arc<Mutex<dyn ScoEndpoint>>;

/// Callback receiving complete inbound PDUs reassembled from ACL
/// fragments, tagged with the originating link.
pub type AclInputCallback = Arc<Mutex<dyn FnMut(super::types::LinkId, Vec<u8>) + Send>>;
