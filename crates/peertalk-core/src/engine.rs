//! Session engine.
//!
//! [`Engine`] ties the codec, peer table, send queues, reassembly and
//! capability negotiation together for a host-supplied transport. The host
//! owns every socket; it feeds inbound bytes to the `handle_*` methods, drains
//! outbound frames with [`Engine::next_outbound`], reports connection
//! lifecycle through the `on_*` methods, and calls [`Engine::poll`] once per
//! tick to collect [`Event`]s.
//!
//! The engine is single-threaded and never blocks. Time is supplied by the
//! host as milliseconds from any monotonic origin.

use std::collections::VecDeque;
use std::net::SocketAddr;

use crate::capability::Negotiated;
use crate::codec::batch::Batch;
use crate::codec::capability::{CapabilityMessage, MAX_MESSAGE_SIZE};
use crate::codec::discovery::{DiscoveryPacket, DiscoveryType, PeerName};
use crate::codec::fragment::FragmentHeader;
use crate::codec::message::{Message, MessageBuilder, MessageFlags, MessageType};
use crate::codec::udp::{Datagram, MAX_UDP_PAYLOAD};
use crate::config::EngineConfig;
use crate::error::{CodecError, Error, PeerError, QueueError, Result};
use crate::flow::should_throttle;
use crate::fragment::{Reassembly, fragment};
use crate::peer::{ConnectionHandle, FrameMeta, Peer, PeerId, PeerState};
use crate::peer_table::{PeerTable, Upsert};
use crate::queue::{Backpressure, Priority, PushOutcome};

/// Something the host should know about
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A new peer announced itself
    PeerDiscovered {
        /// Peer id
        peer: PeerId,
        /// Advertised name
        name: PeerName,
    },
    /// Session established
    PeerConnected(PeerId),
    /// Session closed, locally or by the remote side
    PeerDisconnected(PeerId),
    /// Peer said goodbye or timed out
    PeerLost(PeerId),
    /// Outbound connection attempt failed
    ConnectFailed(PeerId),
    /// Complete reliable message
    Message {
        /// Sender
        peer: PeerId,
        /// Message bytes
        data: Vec<u8>,
    },
    /// Unreliable datagram
    Datagram {
        /// Sender
        peer: PeerId,
        /// Datagram payload
        data: Vec<u8>,
    },
    /// Peer sent a capability message
    CapabilitiesUpdated {
        /// Peer id
        peer: PeerId,
        /// Limits now in force
        negotiated: Negotiated,
    },
}

/// Peer-to-peer session engine
#[derive(Debug)]
pub struct Engine {
    config: EngineConfig,
    name: PeerName,
    peers: PeerTable,
    next_message_id: u16,
    events: VecDeque<Event>,
    scratch: Vec<u8>,
}

impl Engine {
    /// Create an engine from a validated configuration.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the configuration is invalid.
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let peers = PeerTable::new(
            config.peers.max_peers,
            config.queue.capacity,
            config.queue.max_slot_size,
        )?;

        tracing::info!(
            "Engine started: name='{}' tcp={} udp={} peers={}",
            config.local_name,
            config.tcp_port,
            config.udp_port,
            config.peers.max_peers
        );

        Ok(Self {
            name: config.peer_name(),
            config,
            peers,
            next_message_id: 1,
            events: VecDeque::new(),
            scratch: Vec::with_capacity(usize::from(MAX_MESSAGE_SIZE)),
        })
    }

    /// Active configuration
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Peer table
    #[must_use]
    pub fn peers(&self) -> &PeerTable {
        &self.peers
    }

    /// Live peer by id
    #[must_use]
    pub fn peer(&self, id: PeerId) -> Option<&Peer> {
        self.peers.get(id)
    }

    // ------------------------------------------------------------------
    // Discovery
    // ------------------------------------------------------------------

    fn discovery_packet(&self, packet_type: DiscoveryType) -> Vec<u8> {
        DiscoveryPacket {
            packet_type,
            flags: self.config.peer_flags(),
            sender_port: self.config.tcp_port,
            transports: self.config.transports.to_transports(),
            name: self.name,
        }
        .to_bytes()
    }

    /// Discovery ANNOUNCE for the local node
    #[must_use]
    pub fn build_announce(&self) -> Vec<u8> {
        self.discovery_packet(DiscoveryType::Announce)
    }

    /// Discovery QUERY asking listeners to announce
    #[must_use]
    pub fn build_query(&self) -> Vec<u8> {
        self.discovery_packet(DiscoveryType::Query)
    }

    /// Discovery GOODBYE for a clean exit
    #[must_use]
    pub fn build_goodbye(&self) -> Vec<u8> {
        self.discovery_packet(DiscoveryType::Goodbye)
    }

    /// Process a discovery packet received from `from`.
    ///
    /// Returns a packet to broadcast in reply (an ANNOUNCE answering a
    /// QUERY), if any. Our own broadcasts are ignored.
    ///
    /// # Errors
    ///
    /// Returns `Error::Codec` for a malformed packet and `Error::Peer` when a
    /// new peer cannot be stored. Engine state is untouched on error.
    pub fn handle_discovery(
        &mut self,
        bytes: &[u8],
        from: SocketAddr,
        now: u64,
    ) -> Result<Option<Vec<u8>>> {
        let packet = DiscoveryPacket::decode(bytes).inspect_err(|e| {
            tracing::warn!("Dropping discovery packet from {}: {}", from, e);
        })?;

        if packet.name == self.name && packet.sender_port == self.config.tcp_port {
            tracing::trace!("Ignoring own discovery packet from {}", from);
            return Ok(None);
        }

        let address = SocketAddr::new(from.ip(), packet.sender_port);
        match packet.packet_type {
            DiscoveryType::Announce => {
                self.upsert(&packet, address, now)?;
                Ok(None)
            }
            DiscoveryType::Query => {
                self.upsert(&packet, address, now)?;
                Ok(Some(self.build_announce()))
            }
            DiscoveryType::Goodbye => {
                let Some(id) = self.peers.find_by_address(address) else {
                    return Ok(None);
                };
                let connected = self
                    .peers
                    .get(id)
                    .is_some_and(|p| matches!(p.state(), PeerState::Connecting | PeerState::Connected));
                if connected {
                    tracing::debug!("Ignoring GOODBYE from connected peer {}", id);
                } else if self.peers.destroy(id) {
                    self.events.push_back(Event::PeerLost(id));
                }
                Ok(None)
            }
        }
    }

    fn upsert(&mut self, packet: &DiscoveryPacket, address: SocketAddr, now: u64) -> Result<PeerId> {
        let upsert = self.peers.create_or_refresh(
            packet.name,
            address,
            packet.flags,
            packet.transports,
            now,
        )?;
        let id = upsert.id();
        match upsert {
            Upsert::Created(_) => self.events.push_back(Event::PeerDiscovered {
                peer: id,
                name: packet.name,
            }),
            Upsert::Refreshed(_) => {
                if let Some(peer) = self.peers.get_mut(id) {
                    if peer.state() == PeerState::Failed {
                        peer.transition_to(PeerState::Discovered)?;
                    }
                }
            }
        }
        Ok(id)
    }

    // ------------------------------------------------------------------
    // Connection lifecycle
    // ------------------------------------------------------------------

    /// Begin an outbound connection; the host dials the peer's address.
    ///
    /// # Errors
    ///
    /// `PeerError::NotFound` or `PeerError::InvalidTransition`.
    pub fn connect(&mut self, id: PeerId) -> Result<SocketAddr> {
        let peer = live_peer_mut(&mut self.peers, id)?;
        let address = peer.address().ok_or(PeerError::NotFound(id))?;
        peer.transition_to(PeerState::Connecting)?;
        Ok(address)
    }

    /// Register an inbound connection from `from`, creating a peer if the
    /// address was never discovered.
    ///
    /// # Errors
    ///
    /// As for [`on_connected`](Self::on_connected), plus
    /// `PeerError::NoFreeSlot` when the table is full.
    pub fn on_accepted(
        &mut self,
        from: SocketAddr,
        connection: Option<ConnectionHandle>,
        now: u64,
    ) -> Result<PeerId> {
        let id = match self.peers.find_by_ip(from.ip()) {
            Some(id) => id,
            None => {
                let packet = DiscoveryPacket::new(DiscoveryType::Announce, PeerName::EMPTY, from.port());
                self.upsert(&packet, from, now)?
            }
        };
        self.on_connected(id, connection, now)?;
        Ok(id)
    }

    /// The host's connection to `id` is up.
    ///
    /// Moves the peer to CONNECTED and queues our capability message.
    ///
    /// # Errors
    ///
    /// `PeerError::NotFound` or `PeerError::InvalidTransition`.
    pub fn on_connected(
        &mut self,
        id: PeerId,
        connection: Option<ConnectionHandle>,
        now: u64,
    ) -> Result<()> {
        let peer = live_peer_mut(&mut self.peers, id)?;
        peer.transition_to(PeerState::Connected)?;
        peer.begin_session(connection, now);

        let caps = self
            .config
            .capabilities
            .to_message(peer.queue().pressure())
            .encode()?;
        peer.queue_mut().push_with(
            FrameMeta::control(MessageType::Capability),
            &caps,
            Priority::Critical,
            0,
        )?;

        self.events.push_back(Event::PeerConnected(id));
        Ok(())
    }

    /// An outbound connection attempt failed.
    ///
    /// # Errors
    ///
    /// `PeerError::NotFound` or `PeerError::InvalidTransition`.
    pub fn on_connect_failed(&mut self, id: PeerId) -> Result<()> {
        let peer = live_peer_mut(&mut self.peers, id)?;
        peer.transition_to(PeerState::Failed)?;
        tracing::warn!("Connection to peer {} failed", id);
        self.events.push_back(Event::ConnectFailed(id));
        Ok(())
    }

    /// Start a graceful disconnect: queue a DISCONNECT frame behind any
    /// pending messages and move to DISCONNECTING. The host drains the queue,
    /// closes the connection and calls [`on_closed`](Self::on_closed).
    ///
    /// # Errors
    ///
    /// `PeerError::NotFound`, `PeerError::InvalidTransition`, or
    /// `QueueError::Full` if the frame cannot be queued.
    pub fn disconnect(&mut self, id: PeerId) -> Result<()> {
        let peer = live_peer_mut(&mut self.peers, id)?;
        if !peer.can_transition(PeerState::Disconnecting) {
            return Err(PeerError::InvalidTransition {
                from: peer.state(),
                to: PeerState::Disconnecting,
            }
            .into());
        }
        // LOW lists are FIFO and drain last, so this follows everything queued
        peer.queue_mut().push_with(
            FrameMeta::control(MessageType::Disconnect),
            &[],
            Priority::Low,
            0,
        )?;
        peer.transition_to(PeerState::Disconnecting)?;
        Ok(())
    }

    /// The host's connection to `id` has closed.
    ///
    /// The peer is released; it reappears on its next announce.
    ///
    /// # Errors
    ///
    /// `PeerError::NotFound` if the peer is already gone.
    pub fn on_closed(&mut self, id: PeerId) -> Result<()> {
        let peer = live_peer_mut(&mut self.peers, id)?;
        if peer.state() == PeerState::Connecting {
            return self.on_connect_failed(id);
        }
        self.peers.destroy(id);
        self.events.push_back(Event::PeerDisconnected(id));
        Ok(())
    }

    // ------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------

    /// Queue a reliable message.
    ///
    /// Messages larger than the peer's effective max are split into fragments
    /// when fragmentation is enabled. A non-zero `coalesce_key` replaces any
    /// queued message with the same key.
    ///
    /// Returns the local queue's backpressure level after the push.
    ///
    /// # Errors
    ///
    /// - `Error::InvalidParam` for an empty message
    /// - `Error::MessageTooLarge` when the message cannot be sent to this peer
    /// - `PeerError::NotFound` / `PeerError::NotConnected`
    /// - `QueueError::Throttled` when the peer's reported pressure drops this
    ///   priority
    /// - `QueueError::Full` when the queue cannot take the message
    pub fn send(
        &mut self,
        id: PeerId,
        data: &[u8],
        priority: Priority,
        flags: MessageFlags,
        coalesce_key: u16,
    ) -> Result<Backpressure> {
        if data.is_empty() {
            return Err(Error::invalid_param("empty message"));
        }
        if data.len() > usize::from(MAX_MESSAGE_SIZE) {
            return Err(Error::MessageTooLarge {
                len: data.len(),
                max: usize::from(MAX_MESSAGE_SIZE),
            });
        }

        let peer = connected_peer_mut(&mut self.peers, id)?;
        let remote_pressure = peer.capabilities().remote_pressure;
        if should_throttle(remote_pressure, priority) {
            peer.stats_mut().messages_dropped += 1;
            tracing::warn!(
                "Throttled {:?} send to peer {} (remote pressure {}%)",
                priority,
                id,
                remote_pressure
            );
            return Err(QueueError::Throttled {
                level: Backpressure::from_pressure(remote_pressure),
                pressure: remote_pressure,
            }
            .into());
        }

        let max = peer.capabilities().max_message();
        if data.len() > max {
            if !self.config.capabilities.enable_fragmentation {
                return Err(Error::MessageTooLarge {
                    len: data.len(),
                    max,
                });
            }
            let message_id = self.next_message_id;
            self.next_message_id = self.next_message_id.wrapping_add(1);
            return send_fragmented(peer, message_id, data, max, priority, flags);
        }

        match peer
            .queue_mut()
            .push_with(FrameMeta::data(flags), data, priority, coalesce_key)
        {
            Ok(PushOutcome::Coalesced) => peer.stats_mut().messages_coalesced += 1,
            Ok(PushOutcome::Queued) => {}
            Err(e) => {
                peer.stats_mut().messages_dropped += 1;
                return Err(e.into());
            }
        }
        Ok(peer.queue().backpressure())
    }

    /// Encode an unreliable datagram for `id`; it is not queued.
    ///
    /// # Errors
    ///
    /// `PeerError::NotFound` for an unknown peer, `Error::InvalidParam` for an
    /// empty payload, `Error::MessageTooLarge` beyond one datagram.
    pub fn send_unreliable(&mut self, id: PeerId, data: &[u8]) -> Result<Vec<u8>> {
        if data.is_empty() {
            return Err(Error::invalid_param("empty datagram"));
        }
        if data.len() > MAX_UDP_PAYLOAD {
            return Err(Error::MessageTooLarge {
                len: data.len(),
                max: MAX_UDP_PAYLOAD,
            });
        }
        let udp_port = self.config.udp_port;
        let peer = live_peer_mut(&mut self.peers, id)?;
        let bytes = Datagram::new(udp_port, data).to_bytes()?;
        let stats = peer.stats_mut();
        stats.messages_sent += 1;
        stats.bytes_sent += bytes.len() as u64;
        Ok(bytes)
    }

    /// Queue a PING; the matching PONG updates the peer's latency.
    ///
    /// # Errors
    ///
    /// `PeerError::NotFound` / `PeerError::NotConnected`, or
    /// `QueueError::Full`.
    pub fn ping(&mut self, id: PeerId, now: u64) -> Result<()> {
        let peer = connected_peer_mut(&mut self.peers, id)?;
        peer.queue_mut().push_with(
            FrameMeta::control(MessageType::Ping),
            &now.to_be_bytes(),
            Priority::Critical,
            0,
        )?;
        peer.mark_ping(now);
        Ok(())
    }

    /// Pop and frame the next outbound message for `id`.
    ///
    /// Returns `None` when the queue is empty.
    ///
    /// # Errors
    ///
    /// `PeerError::NotFound`, or `PeerError::NotConnected` unless the peer
    /// is CONNECTED or DISCONNECTING.
    pub fn next_outbound(&mut self, id: PeerId) -> Result<Option<Vec<u8>>> {
        let peer = draining_peer_mut(&mut self.peers, id)?;
        let Some((_, meta)) = peer.queue_mut().pop_into(&mut self.scratch) else {
            return Ok(None);
        };
        frame(peer, meta, &self.scratch).map(Some)
    }

    /// Like [`next_outbound`](Self::next_outbound), but packs consecutive
    /// small DATA messages into one BATCH frame.
    ///
    /// # Errors
    ///
    /// As for [`next_outbound`](Self::next_outbound).
    pub fn next_outbound_batch(&mut self, id: PeerId) -> Result<Option<Vec<u8>>> {
        let peer = draining_peer_mut(&mut self.peers, id)?;
        let mut batch = Batch::with_limit(peer.capabilities().max_message());
        let mut first: Option<FrameMeta> = None;

        while let Some((_, meta, data)) = peer.queue().peek() {
            if !is_batchable(meta) || !batch.fits(data.len()) {
                break;
            }
            peer.queue_mut().pop_into(&mut self.scratch);
            batch.push(&self.scratch)?;
            first.get_or_insert(meta);
        }

        match (batch.count(), first) {
            (0, _) => self.next_outbound(id),
            // a lone message goes out unbatched; scratch still holds it
            (1, Some(meta)) => frame(peer, meta, &self.scratch).map(Some),
            _ => {
                let meta = FrameMeta::data(MessageFlags::new().with_batch());
                tracing::debug!("Batched {} messages for peer {}", batch.count(), id);
                frame(peer, meta, batch.as_bytes()).map(Some)
            }
        }
    }

    // ------------------------------------------------------------------
    // Receiving
    // ------------------------------------------------------------------

    /// Process one reliable frame from the start of `bytes`.
    ///
    /// Returns the number of bytes consumed so the host can advance its
    /// stream buffer.
    ///
    /// # Errors
    ///
    /// `Error::Codec` for a malformed or corrupt frame, including a bad
    /// capability, fragment header or batch payload (nothing is changed),
    /// `Error::Fragment` for a reassembly failure, `PeerError` when the peer
    /// has no session.
    pub fn handle_frame(&mut self, id: PeerId, bytes: &[u8], now: u64) -> Result<usize> {
        let message = Message::parse(bytes).inspect_err(|e| {
            tracing::warn!("Dropping frame from peer {}: {}", id, e);
        })?;
        let peer = draining_peer_mut(&mut self.peers, id)?;
        let inbound = Inbound::decode(&message).inspect_err(|e| {
            tracing::warn!(
                "Dropping {:?} frame from peer {}: {}",
                message.message_type(),
                id,
                e
            );
        })?;

        peer.touch(now);
        let stats = peer.stats_mut();
        stats.messages_received += 1;
        stats.bytes_received += message.frame_len() as u64;
        if !peer.accept_recv_seq(message.sequence()) {
            tracing::debug!(
                "Sequence gap from peer {}: got {}",
                id,
                message.sequence()
            );
        }

        match inbound {
            Inbound::Data(data) => self.events.push_back(Event::Message {
                peer: id,
                data: data.to_vec(),
            }),
            Inbound::Batch(entries) => {
                self.events
                    .extend(entries.into_iter().map(|data| Event::Message {
                        peer: id,
                        data: data.to_vec(),
                    }));
            }
            Inbound::Fragment(header, data) => {
                peer.stats_mut().fragments_received += 1;
                let result = peer
                    .reassembler_mut()
                    .process(&header, data)
                    .inspect_err(|e| {
                        tracing::warn!("Reassembly failed for peer {}: {}", id, e);
                    })?;
                if let Reassembly::Complete(data) = result {
                    self.events.push_back(Event::Message { peer: id, data });
                }
            }
            Inbound::Ping(payload) => {
                peer.queue_mut().push_with(
                    FrameMeta::control(MessageType::Pong),
                    payload,
                    Priority::Critical,
                    0,
                )?;
            }
            Inbound::Pong => {
                if let Some(rtt) = peer.record_pong(now) {
                    tracing::debug!("Peer {} latency {} ms", id, rtt);
                }
            }
            Inbound::Disconnect => {
                tracing::info!("Peer {} disconnected", id);
                self.peers.destroy(id);
                self.events.push_back(Event::PeerDisconnected(id));
            }
            Inbound::Capability(remote) => {
                let local = self.config.capabilities.to_message(peer.queue().pressure());
                let negotiated = Negotiated::between(&local, &remote);
                peer.set_capabilities(negotiated);
                tracing::debug!(
                    "Peer {} capabilities: max={} chunk={} pressure={}",
                    id,
                    negotiated.max_message_size,
                    negotiated.chunk_size,
                    negotiated.remote_pressure
                );
                self.events.push_back(Event::CapabilitiesUpdated {
                    peer: id,
                    negotiated,
                });
            }
            Inbound::Ack => tracing::debug!("ACK from peer {}", id),
            Inbound::Reject => tracing::warn!("REJECT from peer {}", id),
        }

        Ok(message.frame_len())
    }

    /// Process an unreliable datagram received from `from`.
    ///
    /// Datagrams from unknown addresses are dropped.
    ///
    /// # Errors
    ///
    /// Returns `Error::Codec` for a malformed datagram.
    pub fn handle_datagram(&mut self, bytes: &[u8], from: SocketAddr, now: u64) -> Result<()> {
        let datagram = Datagram::decode(bytes).inspect_err(|e| {
            tracing::warn!("Dropping datagram from {}: {}", from, e);
        })?;
        let Some(id) = self.peers.find_by_ip(from.ip()) else {
            tracing::debug!("Datagram from unknown address {}", from);
            return Ok(());
        };
        if let Some(peer) = self.peers.get_mut(id) {
            peer.touch(now);
            let stats = peer.stats_mut();
            stats.messages_received += 1;
            stats.bytes_received += bytes.len() as u64;
        }
        self.events.push_back(Event::Datagram {
            peer: id,
            data: datagram.payload.to_vec(),
        });
        Ok(())
    }

    // ------------------------------------------------------------------
    // Housekeeping
    // ------------------------------------------------------------------

    /// Run periodic work and drain pending events.
    ///
    /// - drops discovered or failed peers silent for longer than the timeout
    /// - queues a capability update to peers whose queue pressure crossed a
    ///   25/50/75 boundary
    pub fn poll(&mut self, now: u64) -> Vec<Event> {
        let timeout = self.config.peers.peer_timeout_ms;
        let expired: Vec<PeerId> = self
            .peers
            .iter()
            .filter(|p| matches!(p.state(), PeerState::Discovered | PeerState::Failed))
            .filter(|p| p.is_timed_out(now, timeout))
            .map(Peer::id)
            .collect();
        for id in expired {
            tracing::info!("Peer {} timed out", id);
            if self.peers.destroy(id) {
                self.events.push_back(Event::PeerLost(id));
            }
        }

        for id in self.peers.ids() {
            if let Err(e) = self.advertise_pressure(id) {
                tracing::warn!("Capability update for peer {} failed: {}", id, e);
            }
        }

        self.events.drain(..).collect()
    }

    fn advertise_pressure(&mut self, id: PeerId) -> Result<()> {
        let Some(peer) = self.peers.get_mut(id) else {
            return Ok(());
        };
        if peer.state() != PeerState::Connected {
            return Ok(());
        }
        let pressure = peer.queue().pressure();
        if !peer.local_pressure_mut().update(pressure) {
            return Ok(());
        }
        let caps = self.config.capabilities.to_message(pressure).encode()?;
        peer.queue_mut().push_with(
            FrameMeta::control(MessageType::Capability),
            &caps,
            Priority::Critical,
            0,
        )?;
        Ok(())
    }

    /// Drain pending events without running housekeeping
    pub fn drain_events(&mut self) -> Vec<Event> {
        self.events.drain(..).collect()
    }
}

/// A frame's payload, fully decoded before any peer state is touched
enum Inbound<'a> {
    Data(&'a [u8]),
    Batch(Vec<&'a [u8]>),
    Fragment(FragmentHeader, &'a [u8]),
    Ping(&'a [u8]),
    Pong,
    Disconnect,
    Capability(CapabilityMessage),
    Ack,
    Reject,
}

impl<'a> Inbound<'a> {
    fn decode(message: &Message<'a>) -> Result<Self> {
        let payload = message.payload();
        let flags = message.flags();
        Ok(match message.message_type() {
            MessageType::Data if flags.is_fragment() => {
                let (header, data) = FragmentHeader::split(payload)?;
                Self::Fragment(header, data)
            }
            MessageType::Data if flags.is_batch() => Self::Batch(
                Batch::entries(payload).collect::<std::result::Result<_, CodecError>>()?,
            ),
            MessageType::Data => Self::Data(payload),
            MessageType::Ping => Self::Ping(payload),
            MessageType::Pong => Self::Pong,
            MessageType::Disconnect => Self::Disconnect,
            MessageType::Capability => Self::Capability(CapabilityMessage::decode(payload)?),
            MessageType::Ack => Self::Ack,
            MessageType::Reject => Self::Reject,
        })
    }
}

fn live_peer_mut(peers: &mut PeerTable, id: PeerId) -> Result<&mut Peer> {
    peers
        .get_mut(id)
        .ok_or_else(|| PeerError::NotFound(id).into())
}

fn connected_peer_mut(peers: &mut PeerTable, id: PeerId) -> Result<&mut Peer> {
    let peer = live_peer_mut(peers, id)?;
    if peer.state() != PeerState::Connected {
        return Err(PeerError::NotConnected {
            id,
            state: peer.state(),
        }
        .into());
    }
    Ok(peer)
}

fn draining_peer_mut(peers: &mut PeerTable, id: PeerId) -> Result<&mut Peer> {
    let peer = live_peer_mut(peers, id)?;
    if !matches!(peer.state(), PeerState::Connected | PeerState::Disconnecting) {
        return Err(PeerError::NotConnected {
            id,
            state: peer.state(),
        }
        .into());
    }
    Ok(peer)
}

fn is_batchable(meta: FrameMeta) -> bool {
    meta.message_type == MessageType::Data && !meta.flags.is_fragment() && !meta.flags.is_batch()
}

fn frame(peer: &mut Peer, meta: FrameMeta, payload: &[u8]) -> Result<Vec<u8>> {
    let bytes = MessageBuilder::new()
        .message_type(meta.message_type)
        .flags(meta.flags)
        .sequence(peer.next_send_seq())
        .payload(payload)
        .build()?;
    let stats = peer.stats_mut();
    stats.messages_sent += 1;
    stats.bytes_sent += bytes.len() as u64;
    Ok(bytes)
}

fn send_fragmented(
    peer: &mut Peer,
    message_id: u16,
    data: &[u8],
    max: usize,
    priority: Priority,
    flags: MessageFlags,
) -> Result<Backpressure> {
    let fragments = fragment(message_id, data, max).map_err(|_| Error::MessageTooLarge {
        len: data.len(),
        max,
    })?;
    let count = fragments.len();
    if peer.queue().free_slots() < count {
        peer.stats_mut().messages_dropped += 1;
        return Err(QueueError::Full {
            capacity: peer.queue().capacity(),
        }
        .into());
    }

    tracing::info!(
        "Fragmenting {} bytes for peer {} (max={}, chunks={})",
        data.len(),
        peer.id(),
        max,
        count
    );

    let meta = FrameMeta::data(flags.with_fragment());
    let mut buf = Vec::with_capacity(max);
    for (header, piece) in fragments {
        buf.clear();
        buf.extend_from_slice(&header.to_bytes());
        buf.extend_from_slice(piece);
        peer.queue_mut().push_with(meta, &buf, priority, 0)?;
        tracing::debug!(
            "Queued fragment: message {} offset {} ({} bytes)",
            message_id,
            header.offset,
            piece.len()
        );
    }
    peer.stats_mut().fragments_sent += count as u64;
    Ok(peer.queue().backpressure())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::discovery::PeerFlags;

    fn engine(name: &str, port: u16) -> Engine {
        let config = EngineConfig {
            local_name: name.to_string(),
            tcp_port: port,
            ..EngineConfig::default()
        };
        Engine::new(config).unwrap()
    }

    fn addr(last: u8) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, last], 9999))
    }

    /// Discover and connect `b` from `a`'s point of view.
    fn connected(a: &mut Engine, b: &Engine) -> PeerId {
        a.handle_discovery(&b.build_announce(), addr(2), 100).unwrap();
        let id = a.peers().ids()[0];
        a.connect(id).unwrap();
        a.on_connected(id, Some(1), 150).unwrap();
        a.drain_events();
        id
    }

    fn drain(engine: &mut Engine, id: PeerId) -> Vec<Vec<u8>> {
        std::iter::from_fn(|| engine.next_outbound(id).unwrap()).collect()
    }

    #[test]
    fn test_engine_rejects_invalid_config() {
        let mut config = EngineConfig::default();
        config.queue.capacity = 3;
        assert!(matches!(Engine::new(config), Err(Error::Config(_))));
    }

    #[test]
    fn test_announce_creates_peer() {
        let mut a = engine("alpha", 7354);
        let b = engine("beta", 7400);
        assert_eq!(a.handle_discovery(&b.build_announce(), addr(2), 10).unwrap(), None);

        let events = a.poll(10);
        let id = a.peers().ids()[0];
        assert_eq!(
            events,
            vec![Event::PeerDiscovered {
                peer: id,
                name: PeerName::truncated("beta")
            }]
        );
        let peer = a.peer(id).unwrap();
        assert_eq!(peer.address(), Some(SocketAddr::from(([10, 0, 0, 2], 7400))));
        assert!(peer.flags().is_accepting());
    }

    #[test]
    fn test_repeat_announce_refreshes() {
        let mut a = engine("alpha", 7354);
        let b = engine("beta", 7400);
        a.handle_discovery(&b.build_announce(), addr(2), 10).unwrap();
        a.handle_discovery(&b.build_announce(), addr(2), 500).unwrap();
        assert_eq!(a.peers().live_count(), 1);
        assert_eq!(a.poll(500).len(), 1);
        assert_eq!(a.peer(a.peers().ids()[0]).unwrap().last_seen(), 500);
    }

    #[test]
    fn test_own_packets_ignored() {
        let mut a = engine("alpha", 7354);
        let announce = a.build_announce();
        assert_eq!(a.handle_discovery(&announce, addr(1), 10).unwrap(), None);
        assert_eq!(a.peers().live_count(), 0);
    }

    #[test]
    fn test_query_answered_with_announce() {
        let mut a = engine("alpha", 7354);
        let b = engine("beta", 7400);
        let reply = a.handle_discovery(&b.build_query(), addr(2), 10).unwrap().unwrap();
        let packet = DiscoveryPacket::decode(&reply).unwrap();
        assert_eq!(packet.packet_type, DiscoveryType::Announce);
        assert_eq!(packet.name, PeerName::truncated("alpha"));
    }

    #[test]
    fn test_goodbye_removes_discovered_peer() {
        let mut a = engine("alpha", 7354);
        let b = engine("beta", 7400);
        a.handle_discovery(&b.build_announce(), addr(2), 10).unwrap();
        let id = a.peers().ids()[0];
        a.drain_events();

        a.handle_discovery(&b.build_goodbye(), addr(2), 20).unwrap();
        assert_eq!(a.poll(20), vec![Event::PeerLost(id)]);
        assert_eq!(a.peers().live_count(), 0);
    }

    #[test]
    fn test_goodbye_ignored_while_connected() {
        let mut a = engine("alpha", 7354);
        let b = engine("beta", 7400);
        let id = connected(&mut a, &b);
        a.handle_discovery(&b.build_goodbye(), addr(2), 200).unwrap();
        assert!(a.peer(id).is_some());
    }

    #[test]
    fn test_corrupt_discovery_is_error_without_state_change() {
        let mut a = engine("alpha", 7354);
        let b = engine("beta", 7400);
        let mut bytes = b.build_announce();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        let err = a.handle_discovery(&bytes, addr(2), 10).unwrap_err();
        assert_eq!(err.code(), -20);
        assert_eq!(a.peers().live_count(), 0);
        assert!(a.poll(10).is_empty());
    }

    #[test]
    fn test_connect_queues_capability_first() {
        let mut a = engine("alpha", 7354);
        let b = engine("beta", 7400);
        let id = connected(&mut a, &b);
        assert_eq!(a.peer(id).unwrap().state(), PeerState::Connected);

        let frames = drain(&mut a, id);
        assert_eq!(frames.len(), 1);
        let msg = Message::parse(&frames[0]).unwrap();
        assert_eq!(msg.message_type(), MessageType::Capability);
        let caps = CapabilityMessage::decode(msg.payload()).unwrap();
        assert_eq!(caps.max_message_size, 8192);
    }

    #[test]
    fn test_connect_requires_discovered() {
        let mut a = engine("alpha", 7354);
        assert!(matches!(
            a.connect(PeerId::new(1)),
            Err(Error::Peer(PeerError::NotFound(_)))
        ));

        let b = engine("beta", 7400);
        let id = connected(&mut a, &b);
        assert!(matches!(
            a.connect(id),
            Err(Error::Peer(PeerError::InvalidTransition { .. }))
        ));
    }

    #[test]
    fn test_send_requires_connected() {
        let mut a = engine("alpha", 7354);
        let b = engine("beta", 7400);
        a.handle_discovery(&b.build_announce(), addr(2), 10).unwrap();
        let id = a.peers().ids()[0];
        let err = a
            .send(id, b"hi", Priority::Normal, MessageFlags::new(), 0)
            .unwrap_err();
        assert_eq!(err.code(), -18);
    }

    #[test]
    fn test_send_validation() {
        let mut a = engine("alpha", 7354);
        let b = engine("beta", 7400);
        let id = connected(&mut a, &b);
        assert!(matches!(
            a.send(id, b"", Priority::Normal, MessageFlags::new(), 0),
            Err(Error::InvalidParam(_))
        ));
        assert!(matches!(
            a.send(id, &[0u8; 8193], Priority::Normal, MessageFlags::new(), 0),
            Err(Error::MessageTooLarge { len: 8193, .. })
        ));
    }

    #[test]
    fn test_send_frames_in_priority_order_with_sequence() {
        let mut a = engine("alpha", 7354);
        let b = engine("beta", 7400);
        let id = connected(&mut a, &b);
        drain(&mut a, id);

        a.send(id, b"normal", Priority::Normal, MessageFlags::new(), 0).unwrap();
        a.send(id, b"crit", Priority::Critical, MessageFlags::new(), 0).unwrap();

        let frames = drain(&mut a, id);
        let first = Message::parse(&frames[0]).unwrap();
        let second = Message::parse(&frames[1]).unwrap();
        assert_eq!(first.payload(), b"crit");
        assert_eq!(second.payload(), b"normal");
        assert_eq!(second.sequence(), first.sequence().wrapping_add(1));
        assert_eq!(a.peer(id).unwrap().stats().messages_sent, 3);
    }

    #[test]
    fn test_send_coalesces() {
        let mut a = engine("alpha", 7354);
        let b = engine("beta", 7400);
        let id = connected(&mut a, &b);
        drain(&mut a, id);

        for i in 0..5u8 {
            a.send(id, &[i], Priority::Normal, MessageFlags::new(), 0x0101).unwrap();
        }
        let frames = drain(&mut a, id);
        assert_eq!(frames.len(), 1);
        assert_eq!(Message::parse(&frames[0]).unwrap().payload(), &[4]);
        assert_eq!(a.peer(id).unwrap().stats().messages_coalesced, 4);
    }

    #[test]
    fn test_unnegotiated_peer_gets_fragments() {
        let mut a = engine("alpha", 7354);
        let b = engine("beta", 7400);
        let id = connected(&mut a, &b);
        drain(&mut a, id);

        // legacy max 512 -> 504 data bytes per fragment
        a.send(id, &[7u8; 1200], Priority::Normal, MessageFlags::new(), 0).unwrap();
        let frames = drain(&mut a, id);
        assert_eq!(frames.len(), 3);
        for f in &frames {
            let msg = Message::parse(f).unwrap();
            assert!(msg.flags().is_fragment());
            assert!(msg.payload().len() <= 512);
        }
        assert_eq!(a.peer(id).unwrap().stats().fragments_sent, 3);
    }

    #[test]
    fn test_oversized_without_fragmentation() {
        let mut config = EngineConfig {
            local_name: "alpha".into(),
            ..EngineConfig::default()
        };
        config.capabilities.enable_fragmentation = false;
        let mut a = Engine::new(config).unwrap();
        let b = engine("beta", 7400);
        let id = connected(&mut a, &b);
        assert!(matches!(
            a.send(id, &[0u8; 600], Priority::Normal, MessageFlags::new(), 0),
            Err(Error::MessageTooLarge { len: 600, max: 512 })
        ));
    }

    #[test]
    fn test_fragments_need_room_for_all() {
        let mut config = EngineConfig {
            local_name: "alpha".into(),
            ..EngineConfig::default()
        };
        config.queue.capacity = 4;
        let mut a = Engine::new(config).unwrap();
        let b = engine("beta", 7400);
        let id = connected(&mut a, &b);

        // capability frame holds one slot; 2000 bytes needs 4 fragments
        let err = a
            .send(id, &[1u8; 2000], Priority::Normal, MessageFlags::new(), 0)
            .unwrap_err();
        assert!(matches!(err, Error::Queue(QueueError::Full { .. })));
        assert_eq!(a.peer(id).unwrap().queue().count(), 1);
    }

    #[test]
    fn test_remote_pressure_throttles() {
        let mut a = engine("alpha", 7354);
        let b = engine("beta", 7400);
        let id = connected(&mut a, &b);

        let remote = EngineConfig::default().capabilities.to_message(80);
        let frame = MessageBuilder::new()
            .message_type(MessageType::Capability)
            .payload(&remote.encode().unwrap())
            .build()
            .unwrap();
        a.handle_frame(id, &frame, 200).unwrap();

        let err = a
            .send(id, b"x", Priority::Normal, MessageFlags::new(), 0)
            .unwrap_err();
        assert!(err.is_transient());
        assert_eq!(err.code(), -25);
        assert!(a.send(id, b"x", Priority::High, MessageFlags::new(), 0).is_ok());
        assert_eq!(a.peer(id).unwrap().stats().messages_dropped, 1);
    }

    #[test]
    fn test_ping_pong_latency() {
        let mut a = engine("alpha", 7354);
        let b = engine("beta", 7400);
        let id = connected(&mut a, &b);
        drain(&mut a, id);

        a.ping(id, 1000).unwrap();
        let ping = drain(&mut a, id).remove(0);
        let ping_msg = Message::parse(&ping).unwrap();
        assert_eq!(ping_msg.message_type(), MessageType::Ping);

        // loop the ping back as if the remote answered
        let pong = MessageBuilder::new()
            .message_type(MessageType::Pong)
            .payload(ping_msg.payload())
            .build()
            .unwrap();
        a.handle_frame(id, &pong, 1025).unwrap();
        assert_eq!(a.peer(id).unwrap().latency_ms(), Some(25));
    }

    #[test]
    fn test_ping_answered_with_pong() {
        let mut a = engine("alpha", 7354);
        let b = engine("beta", 7400);
        let id = connected(&mut a, &b);
        drain(&mut a, id);

        let ping = MessageBuilder::new()
            .message_type(MessageType::Ping)
            .payload(b"t")
            .build()
            .unwrap();
        assert_eq!(a.handle_frame(id, &ping, 300).unwrap(), ping.len());
        let frames = drain(&mut a, id);
        let pong = Message::parse(&frames[0]).unwrap();
        assert_eq!(pong.message_type(), MessageType::Pong);
        assert_eq!(pong.payload(), b"t");
    }

    #[test]
    fn test_corrupt_frame_leaves_state() {
        let mut a = engine("alpha", 7354);
        let b = engine("beta", 7400);
        let id = connected(&mut a, &b);
        let mut frame = MessageBuilder::new().payload(b"data").build().unwrap();
        frame[11] ^= 0x01;
        assert!(matches!(
            a.handle_frame(id, &frame, 999),
            Err(Error::Codec(crate::error::CodecError::ChecksumMismatch { .. }))
        ));
        assert_eq!(a.peer(id).unwrap().last_seen(), 150);
        assert!(a.poll(999).is_empty());
    }

    #[test]
    fn test_malformed_capability_leaves_state() {
        let mut a = engine("alpha", 7354);
        let b = engine("beta", 7400);
        let id = connected(&mut a, &b);

        let frame = MessageBuilder::new()
            .message_type(MessageType::Capability)
            .payload(&[0x01, 2, 0, 5])
            .build()
            .unwrap();
        assert!(matches!(
            a.handle_frame(id, &frame, 999),
            Err(Error::Codec(crate::error::CodecError::InvalidField { .. }))
        ));

        let peer = a.peer(id).unwrap();
        assert_eq!(peer.last_seen(), 150);
        assert_eq!(peer.stats().messages_received, 0);
        assert_eq!(*peer.capabilities(), Negotiated::LEGACY);

        assert!(a.peers.get_mut(id).unwrap().accept_recv_seq(0));
    }

    #[test]
    fn test_truncated_batch_dropped_whole() {
        let mut a = engine("alpha", 7354);
        let b = engine("beta", 7400);
        let id = connected(&mut a, &b);

        let payload = [0, 2, 0, 0, b'a', b'b', 0, 9, 0, 0, b'x'];
        let frame = MessageBuilder::new()
            .flags(MessageFlags::new().with_batch())
            .payload(&payload)
            .build()
            .unwrap();
        assert!(matches!(
            a.handle_frame(id, &frame, 999),
            Err(Error::Codec(crate::error::CodecError::Truncated { .. }))
        ));
        assert!(a.poll(999).is_empty());
        assert_eq!(a.peer(id).unwrap().last_seen(), 150);
    }

    #[test]
    fn test_malformed_fragment_header_leaves_state() {
        let mut a = engine("alpha", 7354);
        let b = engine("beta", 7400);
        let id = connected(&mut a, &b);

        let frame = MessageBuilder::new()
            .flags(MessageFlags::new().with_fragment())
            .payload(&[0, 1, 0])
            .build()
            .unwrap();
        assert!(a.handle_frame(id, &frame, 999).is_err());
        let peer = a.peer(id).unwrap();
        assert_eq!(peer.last_seen(), 150);
        assert_eq!(peer.stats().fragments_received, 0);
        assert!(!peer.reassembler().is_active());
    }

    #[test]
    fn test_disconnect_flow() {
        let mut a = engine("alpha", 7354);
        let b = engine("beta", 7400);
        let id = connected(&mut a, &b);

        a.disconnect(id).unwrap();
        assert_eq!(a.peer(id).unwrap().state(), PeerState::Disconnecting);
        assert!(a.send(id, b"late", Priority::Critical, MessageFlags::new(), 0).is_err());

        let frames = drain(&mut a, id);
        let last = Message::parse(frames.last().unwrap()).unwrap();
        assert_eq!(last.message_type(), MessageType::Disconnect);
        assert!(last.payload().is_empty());

        a.on_closed(id).unwrap();
        assert_eq!(a.poll(300), vec![Event::PeerDisconnected(id)]);
        assert!(a.peer(id).is_none());
    }

    #[test]
    fn test_remote_disconnect_frame() {
        let mut a = engine("alpha", 7354);
        let b = engine("beta", 7400);
        let id = connected(&mut a, &b);
        let frame = MessageBuilder::new()
            .message_type(MessageType::Disconnect)
            .build()
            .unwrap();
        a.handle_frame(id, &frame, 200).unwrap();
        assert_eq!(a.poll(200), vec![Event::PeerDisconnected(id)]);
    }

    #[test]
    fn test_connect_failure_and_recovery() {
        let mut a = engine("alpha", 7354);
        let b = engine("beta", 7400);
        a.handle_discovery(&b.build_announce(), addr(2), 10).unwrap();
        let id = a.peers().ids()[0];
        a.connect(id).unwrap();
        a.on_connect_failed(id).unwrap();
        assert_eq!(a.peer(id).unwrap().state(), PeerState::Failed);

        // next announce makes it connectable again
        a.handle_discovery(&b.build_announce(), addr(2), 20).unwrap();
        assert_eq!(a.peer(id).unwrap().state(), PeerState::Discovered);
    }

    #[test]
    fn test_discovered_peer_times_out() {
        let mut a = engine("alpha", 7354);
        let b = engine("beta", 7400);
        a.handle_discovery(&b.build_announce(), addr(2), 1000).unwrap();
        let id = a.peers().ids()[0];
        a.drain_events();

        assert!(a.poll(16_000).is_empty());
        assert_eq!(a.poll(16_001), vec![Event::PeerLost(id)]);
    }

    #[test]
    fn test_accept_unknown_address() {
        let mut a = engine("alpha", 7354);
        let from = SocketAddr::from(([10, 0, 0, 9], 51234));
        let id = a.on_accepted(from, Some(9), 50).unwrap();
        let events = a.poll(50);
        assert!(events.contains(&Event::PeerConnected(id)));
        assert_eq!(a.peer(id).unwrap().connection(), Some(9));
    }

    #[test]
    fn test_datagram_from_known_peer() {
        let mut a = engine("alpha", 7354);
        let mut b = engine("beta", 7400);
        a.handle_discovery(&b.build_announce(), addr(2), 10).unwrap();
        b.handle_discovery(&a.build_announce(), addr(1), 10).unwrap();
        let a_id = a.peers().ids()[0];
        let b_id = b.peers().ids()[0];
        a.drain_events();

        let bytes = b.send_unreliable(b_id, b"pos").unwrap();
        a.handle_datagram(&bytes, SocketAddr::from(([10, 0, 0, 2], 7355)), 20)
            .unwrap();
        assert_eq!(
            a.poll(20),
            vec![Event::Datagram {
                peer: a_id,
                data: b"pos".to_vec()
            }]
        );

        // unknown sender is dropped quietly
        a.handle_datagram(&bytes, SocketAddr::from(([10, 0, 0, 77], 7355)), 20)
            .unwrap();
        assert!(a.poll(20).is_empty());
    }

    #[test]
    fn test_batch_outbound() {
        let mut a = engine("alpha", 7354);
        let b = engine("beta", 7400);
        let id = connected(&mut a, &b);
        drain(&mut a, id);

        for i in 0..5u8 {
            a.send(id, &[i; 10], Priority::Normal, MessageFlags::new(), 0).unwrap();
        }
        let frame = a.next_outbound_batch(id).unwrap().unwrap();
        let msg = Message::parse(&frame).unwrap();
        assert!(msg.flags().is_batch());
        assert_eq!(Batch::entries(msg.payload()).count(), 5);
        assert!(a.next_outbound_batch(id).unwrap().is_none());
    }

    #[test]
    fn test_batch_passes_control_frames_through() {
        let mut a = engine("alpha", 7354);
        let b = engine("beta", 7400);
        let id = connected(&mut a, &b);
        a.send(id, b"solo", Priority::Normal, MessageFlags::new(), 0).unwrap();

        let caps = Message::parse(&a.next_outbound_batch(id).unwrap().unwrap())
            .unwrap()
            .message_type();
        assert_eq!(caps, MessageType::Capability);

        let solo = a.next_outbound_batch(id).unwrap().unwrap();
        let msg = Message::parse(&solo).unwrap();
        assert!(!msg.flags().is_batch());
        assert_eq!(msg.payload(), b"solo");
    }

    #[test]
    fn test_pressure_crossing_queues_capability() {
        let mut a = engine("alpha", 7354);
        let b = engine("beta", 7400);
        let id = connected(&mut a, &b);
        drain(&mut a, id);

        for i in 0..8u8 {
            a.send(id, &[i], Priority::Normal, MessageFlags::new(), 0).unwrap();
        }
        // 8/32 = 25%
        a.poll(200);
        let frames = drain(&mut a, id);
        let first = Message::parse(&frames[0]).unwrap();
        assert_eq!(first.message_type(), MessageType::Capability);
        assert_eq!(CapabilityMessage::decode(first.payload()).unwrap().buffer_pressure, 25);

        // draining crossed back down; the next poll re-advertises
        a.poll(300);
        assert_eq!(a.peer(id).unwrap().queue().count(), 1);
    }

    #[test]
    fn test_peer_flags_advertised() {
        let mut config = EngineConfig::default();
        config.host = true;
        let host = Engine::new(config).unwrap();
        let packet = DiscoveryPacket::decode(&host.build_announce()).unwrap();
        assert_eq!(
            packet.flags,
            PeerFlags::default().with_accepting().with_host()
        );
    }
}
