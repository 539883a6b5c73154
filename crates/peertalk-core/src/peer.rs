//! Peer records and the session lifecycle state machine.
//!
//! ```text
//!            ┌──────────── refresh ────────────┐
//!            ▼                                 │
//! UNUSED ─► DISCOVERED ─► CONNECTING ─► CONNECTED ─► DISCONNECTING ─► UNUSED
//!    ▲          │  ▲          │             │
//!    │          │  └── FAILED ◄─────────────┘
//!    └──────────┴────────┘
//! ```
//!
//! Each [`Peer`] owns its send queue and reassembly state. Fields touched on
//! every packet (state, sequence numbers, negotiated limits) are grouped
//! ahead of the rarely-read ones.

use std::fmt;
use std::net::SocketAddr;

use serde::Serialize;

use crate::capability::Negotiated;
use crate::codec::capability::MAX_MESSAGE_SIZE;
use crate::codec::discovery::{PeerFlags, PeerName, Transports};
use crate::codec::message::{MessageFlags, MessageType};
use crate::error::{PeerError, QueueError};
use crate::flow::PressureTracker;
use crate::fragment::Reassembler;
use crate::queue::SendQueue;

/// Coalesce key base for position updates
pub const COALESCE_POSITION: u16 = 0x0001;
/// Coalesce key base for state updates
pub const COALESCE_STATE: u16 = 0x0002;
/// Coalesce key base for typing indicators
pub const COALESCE_TYPING: u16 = 0x0003;

/// Build a per-peer coalesce key: the base in the low byte, the peer id in
/// the high byte.
#[must_use]
pub fn coalesce_key(base: u16, peer: PeerId) -> u16 {
    base | (peer.get() << 8)
}

/// Peer identifier.
///
/// Identifiers are 1-based slot numbers; `0` denotes the local peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct PeerId(u16);

impl PeerId {
    /// The local peer
    pub const LOCAL: Self = Self(0);

    /// Wrap a raw identifier
    #[must_use]
    pub const fn new(raw: u16) -> Self {
        Self(raw)
    }

    /// Raw identifier
    #[must_use]
    pub const fn get(self) -> u16 {
        self.0
    }

    /// True for the local peer
    #[must_use]
    pub const fn is_local(self) -> bool {
        self.0 == 0
    }

    pub(crate) fn slot(self) -> Option<usize> {
        usize::from(self.0).checked_sub(1)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Generation-checked reference to a peer slot.
///
/// A handle taken before the slot was recycled no longer resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerHandle {
    id: PeerId,
    generation: u32,
}

impl PeerHandle {
    /// Peer the handle refers to
    #[must_use]
    pub fn id(&self) -> PeerId {
        self.id
    }

    /// Slot generation at the time the handle was issued
    #[must_use]
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

/// Opaque connection token owned by the host transport
pub type ConnectionHandle = u64;

/// Peer lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PeerState {
    /// Slot is free
    #[default]
    Unused,
    /// Seen via discovery, no session
    Discovered,
    /// Outbound connection in progress
    Connecting,
    /// Session established
    Connected,
    /// Graceful shutdown in progress
    Disconnecting,
    /// Connection attempt or session failed
    Failed,
}

impl PeerState {
    /// Upper-case display name
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            PeerState::Unused => "UNUSED",
            PeerState::Discovered => "DISCOVERED",
            PeerState::Connecting => "CONNECTING",
            PeerState::Connected => "CONNECTED",
            PeerState::Disconnecting => "DISCONNECTING",
            PeerState::Failed => "FAILED",
        }
    }
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Frame type and flags stored with each queued payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameMeta {
    /// Frame type to emit
    pub message_type: MessageType,
    /// Frame flags to emit
    pub flags: MessageFlags,
}

impl FrameMeta {
    /// Metadata for an ordinary DATA frame
    #[must_use]
    pub fn data(flags: MessageFlags) -> Self {
        Self {
            message_type: MessageType::Data,
            flags,
        }
    }

    /// Metadata for a control frame with no flags
    #[must_use]
    pub fn control(message_type: MessageType) -> Self {
        Self {
            message_type,
            flags: MessageFlags::new(),
        }
    }
}

impl Default for FrameMeta {
    fn default() -> Self {
        Self::data(MessageFlags::new())
    }
}

/// Per-peer traffic counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PeerStats {
    /// Frame bytes written
    pub bytes_sent: u64,
    /// Frame bytes accepted
    pub bytes_received: u64,
    /// Frames written
    pub messages_sent: u64,
    /// Frames accepted
    pub messages_received: u64,
    /// Sends rejected by flow control or a full queue
    pub messages_dropped: u64,
    /// Sends merged into an already-queued message
    pub messages_coalesced: u64,
    /// Fragments queued
    pub fragments_sent: u64,
    /// Fragments accepted
    pub fragments_received: u64,
}

/// Point-in-time snapshot of a peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerInfo {
    /// Peer identifier
    pub id: PeerId,
    /// Display name, lossily decoded
    pub name: String,
    /// Address and reliable port
    pub address: Option<SocketAddr>,
    /// Lifecycle state
    pub state: PeerState,
    /// Last measured round-trip latency
    pub latency_ms: Option<u64>,
    /// Buffer pressure the peer last reported
    pub remote_pressure: u8,
    /// Effective max message size
    pub effective_max: u16,
    /// Discovery role flags
    pub flags: u16,
    /// Traffic counters
    pub stats: PeerStats,
}

/// One remote endpoint
#[derive(Debug)]
pub struct Peer {
    id: PeerId,
    state: PeerState,
    generation: u32,
    last_seen: u64,
    send_seq: u8,
    recv_seq: u8,
    connection: Option<ConnectionHandle>,
    caps: Negotiated,

    address: Option<SocketAddr>,
    name: PeerName,
    flags: PeerFlags,
    transports: Transports,
    latency_ms: Option<u64>,
    ping_sent_at: Option<u64>,
    local_pressure: PressureTracker,
    stats: PeerStats,
    queue: SendQueue<FrameMeta>,
    reassembler: Reassembler,
}

impl Peer {
    /// Create an unused slot with its queue and reassembly buffers.
    ///
    /// `max_slot_size` bounds outbound queue slots only; reassembly always
    /// accepts messages up to [`MAX_MESSAGE_SIZE`].
    ///
    /// # Errors
    ///
    /// Returns `QueueError::NotPowerOfTwo` for an invalid queue capacity.
    pub fn new(
        id: PeerId,
        queue_capacity: usize,
        max_slot_size: usize,
    ) -> Result<Self, QueueError> {
        Ok(Self {
            id,
            state: PeerState::Unused,
            generation: 0,
            last_seen: 0,
            send_seq: 0,
            recv_seq: 0,
            connection: None,
            caps: Negotiated::LEGACY,
            address: None,
            name: PeerName::EMPTY,
            flags: PeerFlags::default(),
            transports: Transports::default(),
            latency_ms: None,
            ping_sent_at: None,
            local_pressure: PressureTracker::default(),
            stats: PeerStats::default(),
            queue: SendQueue::new(queue_capacity, max_slot_size)?,
            reassembler: Reassembler::new(usize::from(MAX_MESSAGE_SIZE)),
        })
    }

    /// Check if transition to `to` is valid
    #[must_use]
    pub fn can_transition(&self, to: PeerState) -> bool {
        matches!(
            (self.state, to),
            (PeerState::Unused, PeerState::Discovered)
                | (
                    PeerState::Discovered,
                    PeerState::Discovered
                        | PeerState::Connecting
                        | PeerState::Connected
                        | PeerState::Unused
                )
                | (
                    PeerState::Connecting,
                    PeerState::Connected | PeerState::Failed | PeerState::Unused
                )
                | (
                    PeerState::Connected,
                    PeerState::Disconnecting | PeerState::Failed | PeerState::Unused
                )
                | (PeerState::Disconnecting, PeerState::Unused)
                | (
                    PeerState::Failed,
                    PeerState::Failed | PeerState::Discovered | PeerState::Unused
                )
        )
    }

    /// Transition to a new state.
    ///
    /// FAILED to FAILED succeeds without effect.
    ///
    /// # Errors
    ///
    /// Returns `PeerError::AlreadyInState` or `PeerError::InvalidTransition`
    /// for a disallowed request; the state is left unchanged.
    pub fn transition_to(&mut self, to: PeerState) -> Result<(), PeerError> {
        let from = self.state;
        if !self.can_transition(to) {
            tracing::warn!(
                "Invalid peer state transition: {} -> {} (peer id={})",
                from,
                to,
                self.id
            );
            return Err(if from == to {
                PeerError::AlreadyInState(to)
            } else {
                PeerError::InvalidTransition { from, to }
            });
        }
        if from == to {
            return Ok(());
        }

        self.state = to;
        if to == PeerState::Connected {
            tracing::info!("Peer state transition: {} -> {} (peer id={})", from, to, self.id);
        } else {
            tracing::debug!("Peer state transition: {} -> {} (peer id={})", from, to, self.id);
        }
        Ok(())
    }

    /// True if no packet has been seen for longer than `timeout_ms`.
    ///
    /// A peer never seen (`last_seen == 0`) never times out.
    #[must_use]
    pub fn is_timed_out(&self, now: u64, timeout_ms: u64) -> bool {
        self.last_seen != 0 && now.saturating_sub(self.last_seen) > timeout_ms
    }

    pub(crate) fn activate(
        &mut self,
        name: PeerName,
        address: SocketAddr,
        flags: PeerFlags,
        transports: Transports,
        now: u64,
    ) -> Result<(), PeerError> {
        self.transition_to(PeerState::Discovered)?;
        self.generation = self.generation.wrapping_add(1);
        self.address = Some(address);
        self.name = name;
        self.flags = flags;
        self.transports = transports;
        self.last_seen = now;
        self.send_seq = 0;
        self.recv_seq = 0;
        self.connection = None;
        self.caps = Negotiated::LEGACY;
        self.latency_ms = None;
        self.ping_sent_at = None;
        self.local_pressure.reset();
        self.stats = PeerStats::default();
        self.queue.reset();
        self.reassembler.reset();
        Ok(())
    }

    pub(crate) fn refresh(&mut self, name: PeerName, flags: PeerFlags, transports: Transports, now: u64) {
        self.name = name;
        self.flags = flags;
        self.transports = transports;
        self.last_seen = now;
    }

    /// Return the slot to UNUSED, clearing identity and session data.
    pub(crate) fn clear(&mut self) {
        self.state = PeerState::Unused;
        self.address = None;
        self.name = PeerName::EMPTY;
        self.flags = PeerFlags::default();
        self.connection = None;
        self.last_seen = 0;
        self.caps = Negotiated::LEGACY;
        self.ping_sent_at = None;
        self.queue.reset();
        self.reassembler.reset();
    }

    /// Reset per-session state on entering CONNECTED
    pub(crate) fn begin_session(&mut self, connection: Option<ConnectionHandle>, now: u64) {
        self.connection = connection;
        self.last_seen = now;
        self.send_seq = 0;
        self.recv_seq = 0;
        self.caps = Negotiated::LEGACY;
        self.local_pressure.reset();
        self.reassembler.reset();
    }

    /// Peer identifier
    #[must_use]
    pub fn id(&self) -> PeerId {
        self.id
    }

    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> PeerState {
        self.state
    }

    /// True unless the slot is UNUSED
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.state != PeerState::Unused
    }

    /// Generation-checked handle to this slot
    #[must_use]
    pub fn handle(&self) -> PeerHandle {
        PeerHandle {
            id: self.id,
            generation: self.generation,
        }
    }

    /// Display name
    #[must_use]
    pub fn name(&self) -> &PeerName {
        &self.name
    }

    /// Address and reliable port
    #[must_use]
    pub fn address(&self) -> Option<SocketAddr> {
        self.address
    }

    /// Discovery role flags
    #[must_use]
    pub fn flags(&self) -> PeerFlags {
        self.flags
    }

    /// Advertised transports
    #[must_use]
    pub fn transports(&self) -> Transports {
        self.transports
    }

    /// Timestamp of the last packet from this peer
    #[must_use]
    pub fn last_seen(&self) -> u64 {
        self.last_seen
    }

    /// Host connection token, if connected
    #[must_use]
    pub fn connection(&self) -> Option<ConnectionHandle> {
        self.connection
    }

    /// Limits negotiated with this peer
    #[must_use]
    pub fn capabilities(&self) -> &Negotiated {
        &self.caps
    }

    /// Last measured round-trip latency
    #[must_use]
    pub fn latency_ms(&self) -> Option<u64> {
        self.latency_ms
    }

    /// Traffic counters
    #[must_use]
    pub fn stats(&self) -> &PeerStats {
        &self.stats
    }

    /// Outbound queue
    #[must_use]
    pub fn queue(&self) -> &SendQueue<FrameMeta> {
        &self.queue
    }

    pub(crate) fn touch(&mut self, now: u64) {
        self.last_seen = now;
    }

    pub(crate) fn next_send_seq(&mut self) -> u8 {
        let seq = self.send_seq;
        self.send_seq = self.send_seq.wrapping_add(1);
        seq
    }

    /// Record an inbound sequence number, returning true if it was the one
    /// expected.
    pub(crate) fn accept_recv_seq(&mut self, seq: u8) -> bool {
        let expected = self.recv_seq;
        self.recv_seq = seq.wrapping_add(1);
        seq == expected
    }

    pub(crate) fn set_capabilities(&mut self, caps: Negotiated) {
        self.caps = caps;
    }

    pub(crate) fn mark_ping(&mut self, now: u64) {
        self.ping_sent_at = Some(now);
    }

    pub(crate) fn record_pong(&mut self, now: u64) -> Option<u64> {
        let sent = self.ping_sent_at.take()?;
        let rtt = now.saturating_sub(sent);
        self.latency_ms = Some(rtt);
        Some(rtt)
    }

    pub(crate) fn local_pressure_mut(&mut self) -> &mut PressureTracker {
        &mut self.local_pressure
    }

    pub(crate) fn stats_mut(&mut self) -> &mut PeerStats {
        &mut self.stats
    }

    pub(crate) fn queue_mut(&mut self) -> &mut SendQueue<FrameMeta> {
        &mut self.queue
    }

    /// Inbound fragment reassembly state
    #[must_use]
    pub fn reassembler(&self) -> &Reassembler {
        &self.reassembler
    }

    pub(crate) fn reassembler_mut(&mut self) -> &mut Reassembler {
        &mut self.reassembler
    }

    /// Snapshot for display
    #[must_use]
    pub fn info(&self) -> PeerInfo {
        PeerInfo {
            id: self.id,
            name: self.name.to_string(),
            address: self.address,
            state: self.state,
            latency_ms: self.latency_ms,
            remote_pressure: self.caps.remote_pressure,
            effective_max: self.caps.max_message_size,
            flags: self.flags.bits(),
            stats: self.stats,
        }
    }
}
