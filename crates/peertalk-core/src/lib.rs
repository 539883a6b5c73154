//! # PeerTalk Core
//!
//! Session engine for the PeerTalk peer-to-peer protocol: LAN discovery,
//! reliable framed messaging and unreliable datagrams between small,
//! resource-constrained hosts.
//!
//! This crate provides:
//! - Wire codec for discovery, message, datagram, fragment and capability
//!   formats (bounds-checked, CRC-16 protected)
//! - Peer table and connection state machine
//! - Per-peer priority send queues with coalescing and backpressure
//! - Fragmentation and reassembly of oversized messages
//! - Capability negotiation and pressure-driven flow control
//!
//! The engine performs no I/O. The host owns every socket and feeds bytes in
//! and out; see [`Engine`].
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          Engine                                 │
//! │   (discovery, connection lifecycle, send/receive, events)       │
//! ├────────────────┬────────────────┬───────────────────────────────┤
//! │   PeerTable    │   SendQueue    │  Fragmenter / Reassembler     │
//! │ (state machine)│ (priority,     │  Capability negotiation       │
//! │                │  coalescing)   │  Flow control                 │
//! ├────────────────┴────────────────┴───────────────────────────────┤
//! │                          Codec                                  │
//! │   (PTLK discovery, PTMG frames, PTUD datagrams, CRC-16)         │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod capability;
pub mod codec;
pub mod config;
pub mod engine;
pub mod error;
pub mod flow;
pub mod fragment;
pub mod peer;
pub mod peer_table;
pub mod queue;

pub use capability::Negotiated;
pub use codec::discovery::{DiscoveryPacket, DiscoveryType, PeerFlags, PeerName, Transports};
pub use codec::message::{Message, MessageBuilder, MessageFlags, MessageType};
pub use config::EngineConfig;
pub use engine::{Engine, Event};
pub use error::{Error, Result};
pub use fragment::{Reassembler, Reassembly};
pub use peer::{Peer, PeerHandle, PeerId, PeerInfo, PeerState, PeerStats};
pub use peer_table::PeerTable;
pub use queue::{Backpressure, Priority, SendQueue};

/// Protocol version carried in discovery packets and frame headers
pub const PROTOCOL_VERSION: u8 = 1;
