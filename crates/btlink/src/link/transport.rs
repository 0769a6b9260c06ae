//! Transport seam between the link core and the HCI driver
//!
//! The actual framing (USB, UART, raw socket) lives outside this crate;
//! the core only needs fire-and-forget submission that may fail
//! synchronously when the driver has no buffer space.

use std::sync::{Arc, Mutex};

use super::packet::{AclDataPacket, HciCommand, ScoDataPacket};
use crate::error::HciError;

/// Downstream interface to the controller.
///
/// All three methods are fire-and-forget: success means the packet was
/// accepted by the driver, not that the controller acted on it. Results
/// of commands arrive later through the `LinkManager::on_*` event entry
/// points.
pub trait HciTransport: Send {
    fn send_command(&mut self, command: &HciCommand) -> Result<(), HciError>;

    fn send_acl_data(&mut self, packet: &AclDataPacket) -> Result<(), HciError>;

    fn send_sco_data(&mut self, packet: &ScoDataPacket) -> Result<(), HciError>;
}

/// Shared handle to a transport implementation
pub type TransportRef = Arc<Mutex<dyn HciTransport>>;
