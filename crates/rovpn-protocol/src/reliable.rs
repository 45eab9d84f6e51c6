//! Reliable control channel
//!
//! Control packets are numbered per direction, retransmitted on timeout
//! with exponential backoff, and acknowledged through ACK vectors
//! piggy-backed on outgoing packets (or a dedicated AckV1 when nothing
//! else is due). Received payloads are released strictly in message-id
//! order; gaps are buffered. Time never comes from the system clock here,
//! every operation that needs it takes `now` explicitly.

use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::packet::ControlHeader;
use crate::{OpCode, ProtocolError, Result};

/// Bound on how far ahead of the next expected id a buffered packet may be
const RECV_AHEAD_LIMIT: u32 = 64;

/// Configuration for the reliable channel
#[derive(Debug, Clone)]
pub struct ReliableConfig {
    /// Timeout before the first retransmission
    pub initial_timeout: Duration,
    /// Cap on the backed-off timeout
    pub max_timeout: Duration,
    /// Retransmissions allowed per packet before the session fails
    pub max_retries: u32,
    /// Maximum unacknowledged packets in flight
    pub window: usize,
    /// Maximum ACK ids piggy-backed on one packet
    pub max_acks: usize,
}

impl Default for ReliableConfig {
    fn default() -> Self {
        Self {
            initial_timeout: Duration::from_secs(2),
            max_timeout: Duration::from_secs(60),
            max_retries: 5,
            window: 4,
            max_acks: crate::packet::MAX_ACKS,
        }
    }
}

#[derive(Debug)]
struct PendingSend {
    opcode: OpCode,
    payload: Bytes,
    /// Unset until the packet leaves for the first time
    next_retransmit: Option<Instant>,
    timeout: Duration,
    retries: u32,
}

/// A control packet ready to leave, with piggy-backed ACKs attached
#[derive(Debug)]
pub struct OutgoingControl {
    /// Opcode this payload was queued under
    pub opcode: OpCode,
    /// Message id, stable across retransmissions
    pub message_id: u32,
    /// Control payload
    pub payload: Bytes,
    /// ACK ids to carry, at most `max_acks`
    pub acks: Vec<u32>,
    /// Whether this is a retransmission
    pub retransmit: bool,
}

/// Reliable control channel state for both directions
pub struct ReliableChannel {
    config: ReliableConfig,
    next_send_id: u32,
    pending: BTreeMap<u32, PendingSend>,
    next_recv_id: u32,
    recv_buffer: BTreeMap<u32, (OpCode, Bytes)>,
    pending_acks: VecDeque<u32>,
}

impl ReliableChannel {
    /// Create a channel with the given configuration
    pub fn new(config: ReliableConfig) -> Self {
        Self {
            config,
            next_send_id: 0,
            pending: BTreeMap::new(),
            next_recv_id: 0,
            recv_buffer: BTreeMap::new(),
            pending_acks: VecDeque::new(),
        }
    }

    /// Queue a control payload for reliable delivery
    ///
    /// Fails with `WindowFull` when the send window is saturated.
    pub fn write(&mut self, opcode: OpCode, payload: Bytes) -> Result<u32> {
        if self.pending.len() >= self.config.window {
            return Err(ProtocolError::WindowFull);
        }

        let message_id = self.next_send_id;
        self.next_send_id = self.next_send_id.wrapping_add(1);

        self.pending.insert(
            message_id,
            PendingSend {
                opcode,
                payload,
                next_retransmit: None,
                timeout: self.config.initial_timeout,
                retries: 0,
            },
        );
        Ok(message_id)
    }

    /// Whether the send window has room
    pub fn can_write(&self) -> bool {
        self.pending.len() < self.config.window
    }

    /// Next in-order received payload, if available
    pub fn read(&mut self) -> Option<(OpCode, Bytes)> {
        let delivered = self.recv_buffer.remove(&self.next_recv_id)?;
        self.next_recv_id = self.next_recv_id.wrapping_add(1);
        Some(delivered)
    }

    /// Process an incoming control packet's header and payload
    ///
    /// Removes acknowledged ids from the pending set, queues an ACK for the
    /// packet's own message id, and buffers the payload for in-order
    /// delivery. Duplicates are dropped after being re-acked.
    pub fn on_incoming(&mut self, header: &ControlHeader, payload: Bytes) {
        for ack in &header.acks {
            if self.pending.remove(ack).is_some() {
                tracing::trace!(message_id = ack, "control packet acked");
            }
        }

        let Some(message_id) = header.message_id else {
            return; // AckV1 carries nothing to deliver
        };

        // Ack everything we see, including duplicates: the peer may have
        // lost our earlier ACK.
        if !self.pending_acks.contains(&message_id) {
            self.pending_acks.push_back(message_id);
        }

        if message_id < self.next_recv_id
            || message_id.wrapping_sub(self.next_recv_id) >= RECV_AHEAD_LIMIT
        {
            tracing::trace!(message_id, "dropping duplicate or out-of-window control packet");
            return;
        }
        self.recv_buffer
            .entry(message_id)
            .or_insert((header.opcode, payload));
    }

    /// Next packet due for (re)transmission at `now`
    ///
    /// Unsent packets go first, then timed-out ones oldest-first. Fails
    /// with `ControlTimeout` once a packet exhausts its retries.
    pub fn poll_transmit(&mut self, now: Instant) -> Result<Option<OutgoingControl>> {
        let due = self
            .pending
            .iter()
            .find(|(_, p)| match p.next_retransmit {
                None => true,
                Some(at) => at <= now,
            })
            .map(|(id, _)| *id);

        let Some(message_id) = due else {
            return Ok(None);
        };

        let entry = self.pending.get_mut(&message_id).expect("id from map scan");
        let retransmit = entry.next_retransmit.is_some();
        if retransmit {
            if entry.retries >= self.config.max_retries {
                return Err(ProtocolError::ControlTimeout);
            }
            entry.retries += 1;
            entry.timeout = (entry.timeout * 2).min(self.config.max_timeout);
        }
        entry.next_retransmit = Some(now + entry.timeout);

        let opcode = entry.opcode;
        let payload = entry.payload.clone();
        let acks = self.take_acks();
        Ok(Some(OutgoingControl {
            opcode,
            message_id,
            payload,
            acks,
            retransmit,
        }))
    }

    /// Drain ACK ids for a dedicated AckV1 when no data-bearing control
    /// packet is due
    pub fn poll_ack(&mut self) -> Option<Vec<u32>> {
        if self.pending_acks.is_empty() {
            return None;
        }
        Some(self.take_acks())
    }

    /// Whether any ACKs are waiting to be carried out
    pub fn has_pending_acks(&self) -> bool {
        !self.pending_acks.is_empty()
    }

    /// Whether any packet awaits acknowledgment
    pub fn has_pending_sends(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Time until the earliest retransmission is due
    ///
    /// `Some(ZERO)` means a packet is ready to leave right now.
    pub fn next_timeout(&self, now: Instant) -> Option<Duration> {
        self.pending
            .values()
            .map(|p| match p.next_retransmit {
                None => Duration::ZERO,
                Some(at) => at.saturating_duration_since(now),
            })
            .min()
    }

    fn take_acks(&mut self) -> Vec<u32> {
        let n = self.pending_acks.len().min(self.config.max_acks);
        self.pending_acks.drain(..n).collect()
    }
}
