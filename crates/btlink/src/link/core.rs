//! Link manager implementation
//!
//! This module provides the per-controller link manager that handles:
//! - The ACL connection lifecycle state machine
//! - Outbound fragmentation and credit-based flow control
//! - Inbound fragment reassembly and dispatch to the upper layer
//! - SCO link setup and data forwarding
//!
//! All mutable state for one controller lives behind a single mutex.
//! Upper-layer callbacks are collected while the lock is held and
//! invoked only after it is released, so a callback may re-enter any
//! manager operation; re-entered operations append their notifications
//! to a shared queue that only the outermost call drains.

use std::cmp;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use log::{debug, info, warn};

use super::constants::*;
use super::link::Link;
use super::packet::{AclDataPacket, BoundaryFlag, HciCommand, ScoDataPacket};
use super::transport::TransportRef;
use super::types::{
    BdAddr, LinkConfig, LinkError, LinkId, LinkKind, LinkMode, LinkResult, LinkState, ModeProgress,
};
use super::upper::{AclInputCallback, ChannelRef, ScoEndpointRef, ScoListenerRef};
use crate::error::HciError;

/// Registry and shared transmit state for one controller
struct Inner {
    /// All live links, keyed by their creation-ordered identifier
    links: HashMap<LinkId, Link>,
    next_id: u32,
    /// Free ACL packet slots at the controller
    acl_credits: u16,
    /// Negotiated maximum ACL fragment payload
    acl_data_len: usize,
    /// Total ACL packet slots the controller advertises
    acl_num_pkts: u16,
    /// Round-robin order of links contending for credits
    rr: VecDeque<LinkId>,
}

/// Deferred upper-layer notification, dispatched after the registry
/// lock is released
enum Notify {
    LinkMode(ChannelRef, LinkMode),
    SendComplete(ChannelRef, usize),
    Ready(ChannelRef),
    Disconnected(ChannelRef, u8),
    AclInput(LinkId, Vec<u8>),
    ScoInput(ScoEndpointRef, Vec<u8>),
    ScoComplete(ScoEndpointRef, usize),
    ScoDisconnected(ScoEndpointRef, u8),
}

/// Notifications waiting for delivery. `active` marks a dispatch loop
/// already draining further up the call stack.
struct DispatchQueue {
    queue: VecDeque<Notify>,
    active: bool,
}

/// Per-controller link manager.
///
/// Owns the link registry, the controller's transmit credit count and
/// the round-robin schedule. Two managers are fully independent; multi-
/// controller hosts construct one per controller.
pub struct LinkManager {
    config: LinkConfig,
    transport: TransportRef,
    inner: Mutex<Inner>,
    acl_input: Mutex<Option<AclInputCallback>>,
    sco_listeners: Mutex<Vec<ScoListenerRef>>,
    pending: Mutex<DispatchQueue>,
}

impl LinkManager {
    /// Create a new link manager for one controller
    pub fn new(config: LinkConfig, transport: TransportRef) -> Self {
        let inner = Inner {
            links: HashMap::new(),
            next_id: 1,
            acl_credits: config.acl_num_pkts,
            acl_data_len: config.acl_data_len,
            acl_num_pkts: config.acl_num_pkts,
            rr: VecDeque::new(),
        };

        Self {
            config,
            transport,
            inner: Mutex::new(inner),
            acl_input: Mutex::new(None),
            sco_listeners: Mutex::new(Vec::new()),
            pending: Mutex::new(DispatchQueue {
                queue: VecDeque::new(),
                active: false,
            }),
        }
    }

    /// Register the callback receiving complete inbound PDUs
    pub fn set_acl_input_callback<F>(&self, callback: F)
    where
        F: FnMut(LinkId, Vec<u8>) + Send + 'static,
    {
        let mut input = self.acl_input.lock().unwrap();
        *input = Some(Arc::new(Mutex::new(callback)));
    }

    /// Register a listener consulted for inbound SCO connections.
    /// Listeners are asked in registration order; the first acceptor
    /// wins.
    pub fn register_sco_listener(&self, listener: ScoListenerRef) {
        self.sco_listeners.lock().unwrap().push(listener);
    }

    /// Install the controller's reported buffer geometry, replacing the
    /// configured defaults. Expected before data traffic starts; the
    /// credit count is reset to the new slot total.
    pub fn set_packet_info(&self, acl_data_len: usize, acl_num_pkts: u16) {
        let mut inner = self.inner.lock().unwrap();
        inner.acl_data_len = acl_data_len;
        inner.acl_num_pkts = acl_num_pkts;
        inner.acl_credits = acl_num_pkts;
        debug!("controller buffers: {} bytes x {} packets", acl_data_len, acl_num_pkts);
    }

    /// Find a link by remote address. For ACL the handle is irrelevant;
    /// for SCO only links without an assigned handle match, so an
    /// established SCO link is never returned by address lookup.
    pub fn find_by_address(&self, addr: BdAddr, kind: LinkKind) -> Option<LinkId> {
        let inner = self.inner.lock().unwrap();
        find_addr_locked(&inner, addr, kind)
    }

    /// Find a link by its controller-assigned connection handle
    pub fn find_by_handle(&self, handle: u16) -> Option<LinkId> {
        let inner = self.inner.lock().unwrap();
        find_handle_locked(&inner, handle)
    }

    // --- ACL lifecycle ------------------------------------------------

    /// Acquire an ACL link to `addr`, creating one and issuing a
    /// Create_Connection command if none exists. Joining an in-progress
    /// or open link never submits a second connect command. The
    /// caller's reference is counted; release it with [`close`].
    ///
    /// [`close`]: LinkManager::close
    pub fn open(&self, addr: BdAddr) -> LinkResult<LinkId> {
        let mut inner = self.inner.lock().unwrap();

        if let Some(id) = find_addr_locked(&inner, addr, LinkKind::Acl) {
            let reconnect = {
                let link = inner.links.get(&id).ok_or(LinkError::LinkNotFound)?;
                link.state == LinkState::Closed
            };

            if reconnect {
                self.send_hci(&connect_command(addr))?;
            }

            if let Some(link) = inner.links.get_mut(&id) {
                link.refcnt += 1;
                match link.state {
                    LinkState::Closed => link.state = LinkState::WaitConnect,
                    LinkState::Open => link.expiry = None,
                    _ => {}
                }
            }
            return Ok(id);
        }

        let id = alloc_link_locked(&mut inner, Link::new_acl(LinkId(0), addr));

        if let Err(err) = self.send_hci(&connect_command(addr)) {
            warn!("{}: connect command to {} rejected: {}", id, addr, err);
            inner.links.remove(&id);
            return Err(err.into());
        }

        if let Some(link) = inner.links.get_mut(&id) {
            link.state = LinkState::WaitConnect;
            link.refcnt = 1;
        }
        debug!("{}: connecting to {}", id, addr);
        Ok(id)
    }

    /// Release one reference to a link. When the last reference drops,
    /// a Closed link is destroyed immediately; otherwise the idle
    /// expiry timer is armed (ACL) or a disconnect is issued (open SCO).
    pub fn close(&self, id: LinkId) -> LinkResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let mut notifies = Vec::new();

        let (kind, state, handle) = {
            let link = inner.links.get_mut(&id).ok_or(LinkError::LinkNotFound)?;
            if link.refcnt == 0 {
                warn!("{}: close with no references held", id);
                return Ok(());
            }
            link.refcnt -= 1;
            if link.refcnt > 0 {
                return Ok(());
            }
            (link.kind, link.state, link.handle)
        };

        match kind {
            LinkKind::Acl => {
                if state == LinkState::Closed {
                    if let Some(link) = inner.links.get_mut(&id) {
                        abort_channels(link, REASON_REMOTE_USER_TERMINATED, &mut notifies);
                    }
                    self.destroy_link(&mut inner, id);
                } else if !self.config.idle_timeout.is_zero() {
                    if let Some(link) = inner.links.get_mut(&id) {
                        link.expiry = Some(Instant::now() + self.config.idle_timeout);
                    }
                }
            }
            LinkKind::Sco => match (state, handle) {
                (LinkState::Open, Some(handle)) => {
                    // teardown completes on the disconnection event
                    if let Err(err) = self.send_hci(&HciCommand::Disconnect {
                        handle,
                        reason: REASON_REMOTE_USER_TERMINATED,
                    }) {
                        warn!("{}: disconnect command rejected: {}", id, err);
                        self.fail_link(&mut inner, id, REASON_UNSPECIFIED_ERROR, &mut notifies);
                    }
                }
                _ => {
                    if let Some(link) = inner.links.get_mut(&id) {
                        link.state = LinkState::Closed;
                        abort_channels(link, REASON_REMOTE_USER_TERMINATED, &mut notifies);
                    }
                    self.destroy_link(&mut inner, id);
                }
            },
        }

        drop(inner);
        self.dispatch(notifies);
        Ok(())
    }

    /// Bind an upper-layer channel to a link. Bound channels receive
    /// `link_mode` and `disconnected` notifications.
    pub fn bind_channel(&self, id: LinkId, channel: ChannelRef) -> LinkResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let link = inner.links.get_mut(&id).ok_or(LinkError::LinkNotFound)?;
        link.channels.push(channel);
        Ok(())
    }

    /// Remove a previously bound channel
    pub fn unbind_channel(&self, id: LinkId, channel: &ChannelRef) -> LinkResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let link = inner.links.get_mut(&id).ok_or(LinkError::LinkNotFound)?;
        link.channels.retain(|ch| !Arc::ptr_eq(ch, channel));
        Ok(())
    }

    /// Drive mode negotiation on an open link. Facets are negotiated
    /// one per call in fixed priority order (authentication, then
    /// encryption, then link-key change); call again after each
    /// completion event until `Complete` is returned.
    pub fn set_mode(&self, id: LinkId, wanted: LinkMode) -> LinkResult<ModeProgress> {
        let mut inner = self.inner.lock().unwrap();
        let mut notifies = Vec::new();

        {
            let link = inner.links.get_mut(&id).ok_or(LinkError::LinkNotFound)?;
            if link.kind != LinkKind::Acl || link.state != LinkState::Open {
                return Err(LinkError::InvalidState);
            }
            link.mode_requested |= wanted;
        }

        let result = self.negotiate_mode(&mut inner, id, &mut notifies);

        drop(inner);
        self.dispatch(notifies);
        result
    }

    // --- controller events: lifecycle ---------------------------------

    /// The controller reported an inbound ACL connection from `addr`.
    /// Returns the pending link, or `None` when a link to that address
    /// already exists (the caller is responsible for rejecting the
    /// redundant attempt at the controller). The idle timer is armed
    /// immediately so an unclaimed inbound connection expires on its
    /// own.
    pub fn on_connect_request(&self, addr: BdAddr) -> Option<LinkId> {
        let mut inner = self.inner.lock().unwrap();

        if find_addr_locked(&inner, addr, LinkKind::Acl).is_some() {
            warn!("duplicate inbound connection from {}, rejecting", addr);
            return None;
        }

        let id = alloc_link_locked(&mut inner, Link::new_acl(LinkId(0), addr));
        if let Some(link) = inner.links.get_mut(&id) {
            link.state = LinkState::WaitConnect;
            if !self.config.idle_timeout.is_zero() {
                link.expiry = Some(Instant::now() + self.config.idle_timeout);
            }
        }
        debug!("{}: inbound connection from {}", id, addr);
        Some(id)
    }

    /// Connection-complete event for an outbound or inbound ACL attempt
    pub fn on_connect_complete(&self, addr: BdAddr, handle: u16, status: u8) {
        let mut inner = self.inner.lock().unwrap();
        let mut notifies = Vec::new();

        let Some(id) = find_addr_locked(&inner, addr, LinkKind::Acl) else {
            warn!("connect complete for unknown address {}", addr);
            return;
        };

        if status != 0 {
            info!("{}: connection to {} failed: 0x{:02x}", id, addr, status);
            self.fail_link(&mut inner, id, status, &mut notifies);
        } else {
            let expected = {
                let link = match inner.links.get_mut(&id) {
                    Some(link) => link,
                    None => return,
                };
                if link.state == LinkState::WaitConnect {
                    link.handle = Some(handle);
                    link.state = LinkState::Open;
                    true
                } else {
                    false
                }
            };

            if expected {
                debug!("{}: open, handle 0x{:03x}", id, handle);
                // pick up any pre-requested mode facets; when none are
                // outstanding the bound channels learn the link is usable
                match self.negotiate_mode(&mut inner, id, &mut notifies) {
                    Ok(ModeProgress::Complete) => {
                        self.mode_complete(&mut inner, id, &mut notifies)
                    }
                    Ok(ModeProgress::InProgress) | Err(_) => {}
                }
            } else {
                warn!("{}: connect complete in unexpected state", id);
            }
        }

        drop(inner);
        self.dispatch(notifies);
    }

    /// Disconnection-complete event for any link kind
    pub fn on_disconnect_complete(&self, handle: u16, reason: u8) {
        let mut inner = self.inner.lock().unwrap();
        let mut notifies = Vec::new();

        let Some(id) = find_handle_locked(&inner, handle) else {
            warn!("disconnect complete for unknown handle 0x{:03x}", handle);
            return;
        };

        debug!("{}: disconnected, reason 0x{:02x}", id, reason);
        self.fail_link(&mut inner, id, reason, &mut notifies);

        drop(inner);
        self.dispatch(notifies);
    }

    /// The idle-expiry timer for `id` fired. A link reacquired in the
    /// meantime is left alone. Closed and never-connected links are
    /// destroyed outright; anything with a live connection gets one
    /// disconnect request and is torn down when the disconnection event
    /// arrives.
    pub fn on_idle_timeout(&self, id: LinkId) {
        let mut inner = self.inner.lock().unwrap();
        let mut notifies = Vec::new();

        let action = {
            let Some(link) = inner.links.get_mut(&id) else {
                return;
            };
            link.expiry = None;
            if link.refcnt > 0 {
                None
            } else {
                match link.state {
                    LinkState::Closed | LinkState::WaitConnect => Some(None),
                    _ => Some(link.handle),
                }
            }
        };

        match action {
            None => {}
            Some(None) => {
                debug!("{}: idle with no connection, destroying", id);
                if let Some(link) = inner.links.get_mut(&id) {
                    link.state = LinkState::Closed;
                    abort_channels(link, REASON_CONNECTION_TIMEOUT, &mut notifies);
                }
                self.destroy_link(&mut inner, id);
            }
            Some(Some(handle)) => {
                debug!("{}: idle, requesting disconnect", id);
                if let Err(err) = self.send_hci(&HciCommand::Disconnect {
                    handle,
                    reason: REASON_REMOTE_USER_TERMINATED,
                }) {
                    warn!("{}: disconnect command rejected: {}", id, err);
                    self.fail_link(&mut inner, id, REASON_UNSPECIFIED_ERROR, &mut notifies);
                }
            }
        }

        drop(inner);
        self.dispatch(notifies);
    }

    /// Fire the idle-expiry handler for every link whose deadline has
    /// passed. The owner of the manager calls this from its timer
    /// machinery.
    pub fn process_timeouts(&self, now: Instant) {
        let due: Vec<LinkId> = {
            let inner = self.inner.lock().unwrap();
            inner
                .links
                .values()
                .filter(|link| link.expiry.is_some_and(|at| at <= now))
                .map(|link| link.id)
                .collect()
        };

        for id in due {
            self.on_idle_timeout(id);
        }
    }

    // --- controller events: mode negotiation --------------------------

    /// Authentication-complete event
    pub fn on_auth_complete(&self, handle: u16, status: u8) {
        self.mode_event(handle, LinkState::WaitAuth, LinkMode::AUTH, status, true);
    }

    /// Encryption-change event; `enabled` reflects the new state on the
    /// wire, which may also be a remote-initiated downgrade
    pub fn on_encryption_change(&self, handle: u16, status: u8, enabled: bool) {
        self.mode_event(handle, LinkState::WaitEncrypt, LinkMode::ENCRYPT, status, enabled);
    }

    /// Link-key-change-complete event
    pub fn on_link_key_complete(&self, handle: u16, status: u8) {
        self.mode_event(handle, LinkState::WaitSecure, LinkMode::SECURE, status, true);
    }

    fn mode_event(
        &self,
        handle: u16,
        expect: LinkState,
        facet: LinkMode,
        status: u8,
        achieved: bool,
    ) {
        let mut inner = self.inner.lock().unwrap();
        let mut notifies = Vec::new();

        let Some(id) = find_handle_locked(&inner, handle) else {
            warn!("mode event for unknown handle 0x{:03x}", handle);
            return;
        };

        if status != 0 {
            info!("{}: mode negotiation failed: 0x{:02x}", id, status);
            self.fail_link(&mut inner, id, status, &mut notifies);
        } else {
            let settled = {
                let Some(link) = inner.links.get_mut(&id) else {
                    return;
                };
                if achieved {
                    link.mode_active |= facet;
                } else {
                    link.mode_active -= facet;
                }
                link.state == expect
            };

            if settled {
                self.mode_complete(&mut inner, id, &mut notifies);
            } else {
                debug!("{}: unsolicited mode change, {:?} now {}", id, facet, achieved);
            }
        }

        drop(inner);
        self.dispatch(notifies);
    }

    // --- ACL data path ------------------------------------------------

    /// Queue one upper-layer PDU for transmission. The PDU is split
    /// into controller-sized fragments and drained against the credit
    /// count; `channel`, when given, is notified as the send progresses
    /// and completes. `None` marks link-layer control traffic that owes
    /// no completion callback.
    pub fn send(&self, id: LinkId, channel: Option<ChannelRef>, pdu: &[u8]) -> LinkResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let mut notifies = Vec::new();

        {
            let link = inner.links.get_mut(&id).ok_or(LinkError::LinkNotFound)?;
            if link.kind != LinkKind::Acl {
                return Err(LinkError::InvalidState);
            }
            if link.state == LinkState::Closed {
                return Err(LinkError::LinkDown);
            }
            if link.txq.len() >= self.config.max_pdu_queue {
                return Err(LinkError::QueueFull);
            }
            let frag_len = inner.acl_data_len;
            // reborrow: frag_len read above released the link borrow
            if let Some(link) = inner.links.get_mut(&id) {
                link.enqueue_pdu(channel, pdu, frag_len);
            }
        }

        if !inner.rr.contains(&id) {
            inner.rr.push_back(id);
        }

        let result = match self.drain_one(&mut inner, id, &mut notifies) {
            Ok(()) => Ok(()),
            Err(err) => {
                warn!("{}: transport rejected ACL fragment: {}", id, err);
                self.fail_link(&mut inner, id, REASON_UNSPECIFIED_ERROR, &mut notifies);
                Err(err.into())
            }
        };

        drop(inner);
        self.dispatch(notifies);
        result
    }

    /// Number-of-completed-packets event: `n` fragments for `handle`
    /// cleared the controller's buffers. Returns the credits and
    /// reconciles them against the per-PDU pending counts, retiring
    /// finished PDUs in order.
    pub fn on_num_completed_packets(&self, handle: u16, n: u16) {
        let mut inner = self.inner.lock().unwrap();
        let mut notifies = Vec::new();

        let Some(id) = find_handle_locked(&inner, handle) else {
            warn!("completed packets for unknown handle 0x{:03x}", handle);
            return;
        };

        let is_sco = inner.links.get(&id).map(|l| l.kind) == Some(LinkKind::Sco);
        if is_sco {
            // SCO keeps no fragment queue; forward the count
            if let Some(ep) = inner.links.get(&id).and_then(|l| l.sco_endpoint.clone()) {
                notifies.push(Notify::ScoComplete(ep, n as usize));
            }
            drop(inner);
            self.dispatch(notifies);
            return;
        }

        let total = inner.acl_credits as u32 + n as u32;
        if total > inner.acl_num_pkts as u32 {
            warn!("credit overflow: {} returned with {} free", n, inner.acl_credits);
            inner.acl_credits = inner.acl_num_pkts;
        } else {
            inner.acl_credits = total as u16;
        }

        if let Some(link) = inner.links.get_mut(&id) {
            let mut left = n;
            let mut idx = 0;
            while left > 0 {
                match link.txq.get_mut(idx) {
                    None => {
                        warn!("{}: {} spurious completions reported", id, left);
                        break;
                    }
                    Some(pdu) => {
                        let take = cmp::min(pdu.pending, left);
                        if take == 0 {
                            warn!("{}: {} completions exceed outstanding fragments", id, left);
                            break;
                        }
                        pdu.pending -= take;
                        left -= take;
                        idx += 1;
                    }
                }
            }

            // retire finished PDUs from the front, one notification each
            while link.txq.front().map_or(false, |pdu| pdu.is_retired()) {
                if let Some(pdu) = link.txq.pop_front() {
                    if let Some(ch) = pdu.channel {
                        notifies.push(Notify::SendComplete(ch, 1));
                    }
                }
            }
        }

        // returned credits go to whichever links are waiting
        self.drain_all(&mut inner, &mut notifies);

        drop(inner);
        self.dispatch(notifies);
    }

    /// One inbound ACL fragment from the transport. Complete PDUs are
    /// handed to the registered ACL input callback.
    pub fn on_acl_data(&self, packet: AclDataPacket) {
        let mut inner = self.inner.lock().unwrap();
        let mut notifies = Vec::new();

        let Some(id) = find_handle_locked(&inner, packet.handle) else {
            warn!("ACL data for unknown handle 0x{:03x}, dropped", packet.handle);
            return;
        };

        if let Some(link) = inner.links.get_mut(&id) {
            if link.kind != LinkKind::Acl {
                warn!("{}: ACL data on a SCO handle, dropped", id);
                return;
            }
            let is_start = packet.boundary == BoundaryFlag::FirstFragment;
            if let Some(pdu) = link.reassemble(&packet.payload, is_start) {
                notifies.push(Notify::AclInput(id, pdu));
            }
        }

        drop(inner);
        self.dispatch(notifies);
    }

    // --- SCO ----------------------------------------------------------

    /// The controller reported an inbound SCO connection from `addr`.
    /// SCO always rides an established ACL link; without one the
    /// request is refused. Registered listeners are consulted in order
    /// and the first acceptor is bound to the new link.
    pub fn on_sco_connect_request(&self, addr: BdAddr) -> Option<LinkId> {
        let parent = {
            let inner = self.inner.lock().unwrap();
            match find_addr_locked(&inner, addr, LinkKind::Acl) {
                Some(id) if inner.links.get(&id).map(|l| l.state) == Some(LinkState::Open) => id,
                _ => {
                    warn!("SCO request from {} with no open ACL link, rejecting", addr);
                    return None;
                }
            }
        };

        let listeners: Vec<ScoListenerRef> = self.sco_listeners.lock().unwrap().clone();
        for listener in listeners {
            let endpoint = listener
                .lock()
                .unwrap()
                .new_connection(self.config.local_addr, addr);

            if let Some(endpoint) = endpoint {
                let mut inner = self.inner.lock().unwrap();
                // the carrier may have vanished while the listener decided
                let carrier_open =
                    inner.links.get(&parent).map(|l| l.state) == Some(LinkState::Open);
                if !carrier_open {
                    warn!("ACL carrier for SCO from {} went away, rejecting", addr);
                    return None;
                }

                let id = alloc_link_locked(
                    &mut inner,
                    Link::new_sco(LinkId(0), addr, parent, endpoint),
                );
                if let Some(link) = inner.links.get_mut(&id) {
                    link.state = LinkState::WaitConnect;
                    link.refcnt = 1;
                }
                debug!("{}: inbound SCO from {} accepted", id, addr);
                return Some(id);
            }
        }

        debug!("no listener accepted SCO from {}", addr);
        None
    }

    /// Connection-complete event for a pending SCO link. Multiple
    /// handle-less SCO links may be pending for one address; the oldest
    /// is bound first.
    pub fn on_sco_connect_complete(&self, addr: BdAddr, handle: u16, status: u8) {
        let mut inner = self.inner.lock().unwrap();
        let mut notifies = Vec::new();

        let Some(id) = find_addr_locked(&inner, addr, LinkKind::Sco) else {
            warn!("SCO connect complete for unknown address {}", addr);
            return;
        };

        if status != 0 {
            info!("{}: SCO connection to {} failed: 0x{:02x}", id, addr, status);
            self.fail_link(&mut inner, id, status, &mut notifies);
        } else if let Some(link) = inner.links.get_mut(&id) {
            link.handle = Some(handle);
            link.state = LinkState::Open;
            debug!("{}: SCO open, handle 0x{:03x}", id, handle);
        }

        drop(inner);
        self.dispatch(notifies);
    }

    /// Send one SCO payload. SCO packets are fixed-format with no
    /// fragmentation and no credit bookkeeping.
    pub fn sco_send(&self, id: LinkId, payload: &[u8]) -> LinkResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let mut notifies = Vec::new();

        let handle = {
            let link = inner.links.get(&id).ok_or(LinkError::LinkNotFound)?;
            if link.kind != LinkKind::Sco {
                return Err(LinkError::InvalidState);
            }
            match (link.state, link.handle) {
                (LinkState::Open, Some(handle)) => handle,
                _ => return Err(LinkError::LinkDown),
            }
        };

        if payload.len() > self.config.sco_data_len {
            return Err(LinkError::PayloadTooLarge(payload.len()));
        }

        let packet = ScoDataPacket::new(handle, payload.to_vec());
        let result = self.transport.lock().unwrap().send_sco_data(&packet);
        let result = match result {
            Ok(()) => Ok(()),
            Err(err) => {
                warn!("{}: transport rejected SCO packet: {}", id, err);
                self.fail_link(&mut inner, id, REASON_UNSPECIFIED_ERROR, &mut notifies);
                Err(err.into())
            }
        };

        drop(inner);
        self.dispatch(notifies);
        result
    }

    /// One inbound SCO packet from the transport, forwarded to the
    /// bound endpoint with the header stripped
    pub fn on_sco_data(&self, packet: ScoDataPacket) {
        let mut notifies = Vec::new();
        {
            let inner = self.inner.lock().unwrap();
            let Some(id) = find_handle_locked(&inner, packet.handle) else {
                warn!("SCO data for unknown handle 0x{:03x}, dropped", packet.handle);
                return;
            };

            match inner.links.get(&id) {
                Some(link) if link.kind == LinkKind::Sco => {
                    if let Some(ep) = link.sco_endpoint.clone() {
                        notifies.push(Notify::ScoInput(ep, packet.payload));
                    }
                }
                _ => warn!("SCO data on a non-SCO handle 0x{:03x}, dropped", packet.handle),
            }
        }
        self.dispatch(notifies);
    }

    // --- introspection ------------------------------------------------

    /// Free ACL packet slots at the controller
    pub fn credits(&self) -> u16 {
        self.inner.lock().unwrap().acl_credits
    }

    pub fn link_state(&self, id: LinkId) -> Option<LinkState> {
        self.inner.lock().unwrap().links.get(&id).map(|l| l.state)
    }

    pub fn link_refcnt(&self, id: LinkId) -> Option<u32> {
        self.inner.lock().unwrap().links.get(&id).map(|l| l.refcnt)
    }

    pub fn link_handle(&self, id: LinkId) -> Option<u16> {
        self.inner.lock().unwrap().links.get(&id).and_then(|l| l.handle)
    }

    /// Combined achieved mode mask of a link
    pub fn link_mode(&self, id: LinkId) -> Option<LinkMode> {
        self.inner.lock().unwrap().links.get(&id).map(|l| l.mode_active)
    }

    /// Fragments handed to the transport and not yet confirmed
    pub fn pending_fragments(&self, id: LinkId) -> Option<usize> {
        self.inner
            .lock()
            .unwrap()
            .links
            .get(&id)
            .map(|l| l.pending_fragments())
    }

    /// Queued PDUs not yet fully retired
    pub fn queue_len(&self, id: LinkId) -> Option<usize> {
        self.inner.lock().unwrap().links.get(&id).map(|l| l.queue_len())
    }

    // --- internals ----------------------------------------------------

    fn send_hci(&self, command: &HciCommand) -> Result<(), HciError> {
        self.transport.lock().unwrap().send_command(command)
    }

    /// Issue the next outstanding mode facet command, in fixed
    /// priority order. Returns `Complete` when nothing is outstanding.
    fn negotiate_mode(
        &self,
        inner: &mut Inner,
        id: LinkId,
        notifies: &mut Vec<Notify>,
    ) -> LinkResult<ModeProgress> {
        let (handle, needed) = {
            let link = inner.links.get(&id).ok_or(LinkError::LinkNotFound)?;
            let Some(handle) = link.handle else {
                return Err(LinkError::InvalidState);
            };
            (handle, link.mode_requested - link.mode_active)
        };

        let (command, next) = if needed.contains(LinkMode::AUTH) {
            (HciCommand::AuthRequested { handle }, LinkState::WaitAuth)
        } else if needed.contains(LinkMode::ENCRYPT) {
            (
                HciCommand::SetConnectionEncryption { handle, enable: true },
                LinkState::WaitEncrypt,
            )
        } else if needed.contains(LinkMode::SECURE) {
            (HciCommand::ChangeConnectionLinkKey { handle }, LinkState::WaitSecure)
        } else {
            return Ok(ModeProgress::Complete);
        };

        if let Err(err) = self.send_hci(&command) {
            warn!("{}: mode command rejected: {}", id, err);
            self.fail_link(inner, id, REASON_UNSPECIFIED_ERROR, notifies);
            return Err(err.into());
        }

        if let Some(link) = inner.links.get_mut(&id) {
            debug!("{}: negotiating, entering {}", id, next);
            link.state = next;
        }
        Ok(ModeProgress::InProgress)
    }

    /// A mode facet settled: return to Open, fan the combined mode out
    /// to every bound channel and resume transmission
    fn mode_complete(&self, inner: &mut Inner, id: LinkId, notifies: &mut Vec<Notify>) {
        let (mode, channels) = {
            let Some(link) = inner.links.get_mut(&id) else {
                return;
            };
            link.state = LinkState::Open;
            (link.mode_active, link.channels.clone())
        };

        debug!("{}: mode settled: {:?}", id, mode);
        for ch in channels {
            notifies.push(Notify::LinkMode(ch, mode));
        }

        if let Err(err) = self.drain_one(inner, id, notifies) {
            warn!("{}: transport rejected ACL fragment: {}", id, err);
            self.fail_link(inner, id, REASON_UNSPECIFIED_ERROR, notifies);
        }
    }

    /// Hand queued fragments for one link to the transport, bounded by
    /// the controller's credit count. Fragments of one PDU always go
    /// out in order; when a PDU's fragment list empties, its channel is
    /// queued a ready notification. Afterwards the link is rotated to
    /// the back of the round-robin order (or dropped from it when it
    /// has nothing left to send).
    fn drain_one(
        &self,
        inner: &mut Inner,
        id: LinkId,
        notifies: &mut Vec<Notify>,
    ) -> Result<(), HciError> {
        let Inner {
            links,
            acl_credits,
            rr,
            ..
        } = inner;

        let mut result = Ok(());
        let keep = match links.get_mut(&id) {
            Some(link) if link.kind == LinkKind::Acl && link.state == LinkState::Open => {
                if let Some(handle) = link.handle {
                    let mut transport = self.transport.lock().unwrap();

                    'queue: for pdu in link.txq.iter_mut() {
                        let mut sent_any = false;
                        while *acl_credits > 0 {
                            let Some(frag) = pdu.fragments.pop_front() else {
                                break;
                            };
                            let packet = AclDataPacket::new(handle, frag.boundary, frag.data);
                            if let Err(err) = transport.send_acl_data(&packet) {
                                result = Err(err);
                                break 'queue;
                            }
                            *acl_credits -= 1;
                            pdu.pending += 1;
                            sent_any = true;
                        }
                        if sent_any && pdu.fragments.is_empty() {
                            if let Some(ch) = &pdu.channel {
                                notifies.push(Notify::Ready(ch.clone()));
                            }
                        }
                        if *acl_credits == 0 {
                            break;
                        }
                    }

                    link.txq.iter().any(|pdu| !pdu.fragments.is_empty())
                } else {
                    // no handle yet; keep its place until the link opens
                    true
                }
            }
            Some(_) => true,
            None => false,
        };

        if let Some(pos) = rr.iter().position(|x| *x == id) {
            rr.remove(pos);
        }
        if keep && result.is_ok() {
            rr.push_back(id);
        }

        result
    }

    /// Distribute available credits over all waiting links in
    /// round-robin order
    fn drain_all(&self, inner: &mut Inner, notifies: &mut Vec<Notify>) {
        let mut rounds = inner.rr.len();
        while rounds > 0 && inner.acl_credits > 0 {
            let Some(&id) = inner.rr.front() else {
                break;
            };
            if let Err(err) = self.drain_one(inner, id, notifies) {
                warn!("{}: transport rejected ACL fragment: {}", id, err);
                self.fail_link(inner, id, REASON_UNSPECIFIED_ERROR, notifies);
            }
            rounds -= 1;
        }
    }

    /// Fatal teardown: the connection is gone or unrecoverable. Moves
    /// the link to Closed, frees queued data, notifies every bound
    /// channel (and SCO links riding this carrier), and destroys the
    /// link once no references remain. Holders notified through
    /// `disconnected` release their reference with `close`, which
    /// performs the final destroy.
    fn fail_link(&self, inner: &mut Inner, id: LinkId, reason: u8, notifies: &mut Vec<Notify>) {
        // dependent SCO links go down with their carrier
        let children: Vec<LinkId> = inner
            .links
            .values()
            .filter(|link| link.acl_parent == Some(id))
            .map(|link| link.id)
            .collect();
        for child in children {
            self.fail_link(inner, child, reason, notifies);
        }

        let Some(link) = inner.links.get_mut(&id) else {
            return;
        };

        link.state = LinkState::Closed;
        link.handle = None;
        link.expiry = None;
        link.mode_requested = LinkMode::empty();
        link.mode_active = LinkMode::empty();
        abort_channels(link, reason, notifies);

        if let Some(ep) = link.sco_endpoint.clone() {
            notifies.push(Notify::ScoDisconnected(ep, reason));
        }

        if link.refcnt == 0 {
            self.destroy_link(inner, id);
        }
    }

    /// Remove a link from the registry. Refuses (with a log message)
    /// when the teardown invariant does not hold.
    fn destroy_link(&self, inner: &mut Inner, id: LinkId) {
        match inner.links.get(&id) {
            Some(link) if !link.can_destroy() => {
                warn!(
                    "{}: destroy refused: refcnt={} state={}",
                    id,
                    link.refcnt,
                    link.state
                );
                return;
            }
            None => return,
            _ => {}
        }

        inner.links.remove(&id);
        if let Some(pos) = inner.rr.iter().position(|x| *x == id) {
            inner.rr.remove(pos);
        }
        debug!("{}: destroyed", id);
    }

    /// Queue deferred upper-layer notifications and drain the shared
    /// queue. Callers must have released the registry lock. Only the
    /// outermost call drains; a manager operation re-entered from inside
    /// a callback appends to the queue and returns, so a callback's own
    /// mutex is never locked a second time beneath it.
    fn dispatch(&self, notifies: Vec<Notify>) {
        {
            let mut pending = self.pending.lock().unwrap();
            pending.queue.extend(notifies);
            if pending.active {
                return;
            }
            pending.active = true;
        }

        loop {
            let notify = {
                let mut pending = self.pending.lock().unwrap();
                match pending.queue.pop_front() {
                    Some(notify) => notify,
                    None => {
                        pending.active = false;
                        break;
                    }
                }
            };
            self.deliver(notify);
        }
    }

    fn deliver(&self, notify: Notify) {
        match notify {
            Notify::LinkMode(ch, mode) => ch.lock().unwrap().link_mode(mode),
            Notify::SendComplete(ch, count) => ch.lock().unwrap().complete(count),
            Notify::Ready(ch) => ch.lock().unwrap().ready(),
            Notify::Disconnected(ch, reason) => ch.lock().unwrap().disconnected(reason),
            Notify::AclInput(id, pdu) => {
                let callback = self.acl_input.lock().unwrap().clone();
                match callback {
                    Some(callback) => {
                        let mut cb = callback.lock().unwrap();
                        (*cb)(id, pdu);
                    }
                    None => debug!("{}: no ACL input callback, PDU dropped", id),
                }
            }
            Notify::ScoInput(ep, payload) => ep.lock().unwrap().input(&payload),
            Notify::ScoComplete(ep, count) => ep.lock().unwrap().complete(count),
            Notify::ScoDisconnected(ep, reason) => ep.lock().unwrap().disconnected(reason),
        }
    }
}

fn connect_command(addr: BdAddr) -> HciCommand {
    HciCommand::CreateConnection {
        bd_addr: addr,
        packet_type: ACL_DEFAULT_PACKET_TYPES,
        allow_role_switch: true,
    }
}

/// Free a link's queues and turn its channel set, plus any senders that
/// only had PDUs queued, into disconnect notifications, one per distinct
/// channel.
fn abort_channels(link: &mut Link, reason: u8, notifies: &mut Vec<Notify>) {
    let mut victims: Vec<ChannelRef> = link.channels.drain(..).collect();
    for ch in link.flush_queues() {
        if !victims.iter().any(|v| Arc::ptr_eq(v, &ch)) {
            victims.push(ch);
        }
    }
    for ch in victims {
        notifies.push(Notify::Disconnected(ch, reason));
    }
}

fn find_addr_locked(inner: &Inner, addr: BdAddr, kind: LinkKind) -> Option<LinkId> {
    inner
        .links
        .values()
        .filter(|link| link.addr == addr && link.kind == kind)
        .filter(|link| kind == LinkKind::Acl || link.handle.is_none())
        .map(|link| link.id)
        .min()
}

fn find_handle_locked(inner: &Inner, handle: u16) -> Option<LinkId> {
    inner
        .links
        .values()
        .find(|link| link.handle == Some(handle))
        .map(|link| link.id)
}

fn alloc_link_locked(inner: &mut Inner, mut link: Link) -> LinkId {
    let id = LinkId(inner.next_id);
    inner.next_id += 1;
    link.id = id;
    inner.links.insert(id, link);
    id
}
