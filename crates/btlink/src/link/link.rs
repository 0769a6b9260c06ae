//! Link entity
//!
//! A [`Link`] represents one logical connection (ACL or SCO) to one
//! remote device: its lifecycle state, mode flags, reference count,
//! outbound fragment queue and inbound reassembly buffer. The manager in
//! `core.rs` owns all links for a controller and drives the transitions.

use std::collections::VecDeque;
use std::time::Instant;

use byteorder::{ByteOrder, LittleEndian};
use log::warn;

use super::constants::FRAME_HEADER_LEN;
use super::packet::BoundaryFlag;
use super::types::{BdAddr, LinkId, LinkKind, LinkMode, LinkState};
use super::upper::{ChannelRef, ScoEndpointRef};

/// One outbound fragment awaiting submission to the transport
#[derive(Debug, Clone)]
pub(crate) struct Fragment {
    pub boundary: BoundaryFlag,
    pub data: Vec<u8>,
}

/// One upper-layer PDU queued on a link: the fragments not yet handed to
/// the transport plus the count of fragments still sitting in the
/// controller's buffers.
pub(crate) struct OutboundPdu {
    /// Originating channel; `None` for link-layer control traffic
    pub channel: Option<ChannelRef>,
    pub fragments: VecDeque<Fragment>,
    pub pending: u16,
}

impl OutboundPdu {
    /// Fully handed to the transport and confirmed by the controller
    pub fn is_retired(&self) -> bool {
        self.pending == 0 && self.fragments.is_empty()
    }
}

/// One logical connection to one remote device. Owned by the manager in
/// `core.rs`; callers address links through their [`LinkId`].
pub(crate) struct Link {
    pub(crate) id: LinkId,
    pub(crate) kind: LinkKind,
    pub(crate) addr: BdAddr,
    pub(crate) handle: Option<u16>,
    pub(crate) state: LinkState,
    pub(crate) mode_requested: LinkMode,
    pub(crate) mode_active: LinkMode,
    pub(crate) refcnt: u32,
    pub(crate) expiry: Option<Instant>,
    pub(crate) txq: VecDeque<OutboundPdu>,
    pub(crate) rxbuf: Option<Vec<u8>>,
    pub(crate) channels: Vec<ChannelRef>,
    /// ACL link that physically carries this SCO connection
    pub(crate) acl_parent: Option<LinkId>,
    pub(crate) sco_endpoint: Option<ScoEndpointRef>,
}

impl Link {
    pub(crate) fn new_acl(id: LinkId, addr: BdAddr) -> Self {
        Self {
            id,
            kind: LinkKind::Acl,
            addr,
            handle: None,
            state: LinkState::Closed,
            mode_requested: LinkMode::empty(),
            mode_active: LinkMode::empty(),
            refcnt: 0,
            expiry: None,
            txq: VecDeque::new(),
            rxbuf: None,
            channels: Vec::new(),
            acl_parent: None,
            sco_endpoint: None,
        }
    }

    pub(crate) fn new_sco(
        id: LinkId,
        addr: BdAddr,
        acl_parent: LinkId,
        endpoint: ScoEndpointRef,
    ) -> Self {
        let mut link = Self::new_acl(id, addr);
        link.kind = LinkKind::Sco;
        link.acl_parent = Some(acl_parent);
        link.sco_endpoint = Some(endpoint);
        link
    }

    /// Total fragments handed to the transport and not yet confirmed
    pub(crate) fn pending_fragments(&self) -> usize {
        self.txq.iter().map(|pdu| pdu.pending as usize).sum()
    }

    /// Queued PDUs not yet fully retired
    pub(crate) fn queue_len(&self) -> usize {
        self.txq.len()
    }

    /// No outbound PDUs queued and no partial inbound PDU buffered
    pub(crate) fn queues_inert(&self) -> bool {
        self.txq.is_empty() && self.rxbuf.is_none()
    }

    /// The teardown invariant: a link may be freed only when no upper
    /// layer holds it, its state has settled to Closed and its queues
    /// are inert.
    pub(crate) fn can_destroy(&self) -> bool {
        self.refcnt == 0 && self.state == LinkState::Closed && self.queues_inert()
    }

    /// Split `pdu` into fragments no larger than `frag_len` and append
    /// the resulting queue entry. The first fragment is tagged as the
    /// start of the PDU, the rest as continuations.
    pub(crate) fn enqueue_pdu(&mut self, channel: Option<ChannelRef>, pdu: &[u8], frag_len: usize) {
        let mut fragments = VecDeque::new();
        let mut offset = 0;

        while offset < pdu.len() {
            let end = usize::min(offset + frag_len, pdu.len());
            fragments.push_back(Fragment {
                boundary: if offset == 0 {
                    BoundaryFlag::FirstFragment
                } else {
                    BoundaryFlag::Continuation
                },
                data: pdu[offset..end].to_vec(),
            });
            offset = end;
        }

        self.txq.push_back(OutboundPdu {
            channel,
            fragments,
            pending: 0,
        });
    }

    /// Accumulate one inbound fragment. Returns the complete PDU
    /// (including its 4-byte frame header) once the declared length has
    /// arrived. Malformed input is dropped with a log message.
    pub(crate) fn reassemble(&mut self, payload: &[u8], is_start: bool) -> Option<Vec<u8>> {
        if is_start {
            if self.rxbuf.take().is_some() {
                warn!("{}: new PDU started while reassembly incomplete, discarding", self.id);
            }
            if payload.len() < FRAME_HEADER_LEN {
                warn!(
                    "{}: start fragment of {} bytes shorter than frame header, dropped",
                    self.id,
                    payload.len()
                );
                return None;
            }
            self.rxbuf = Some(payload.to_vec());
        } else {
            match self.rxbuf.as_mut() {
                Some(buf) => buf.extend_from_slice(payload),
                None => {
                    warn!("{}: continuation fragment with no PDU in progress, dropped", self.id);
                    return None;
                }
            }
        }

        let buf = self.rxbuf.as_ref()?;
        let want = LittleEndian::read_u16(&buf[0..2]) as usize + FRAME_HEADER_LEN;

        if buf.len() < want {
            return None;
        }
        if buf.len() > want {
            warn!(
                "{}: reassembled {} bytes but frame declares {}, discarding",
                self.id,
                buf.len(),
                want
            );
            self.rxbuf = None;
            return None;
        }

        self.rxbuf.take()
    }

    /// Drop all queued outbound data and any partial inbound PDU.
    /// Returns the originating channels of the flushed PDUs so the
    /// caller can notify them after releasing its lock.
    pub(crate) fn flush_queues(&mut self) -> Vec<ChannelRef> {
        self.rxbuf = None;
        self.txq
            .drain(..)
            .filter_map(|pdu| pdu.channel)
            .collect()
    }
}
