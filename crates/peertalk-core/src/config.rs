//! Engine configuration

use serde::{Deserialize, Serialize};

use crate::codec::capability::{CapabilityFlags, CapabilityMessage, MAX_MESSAGE_SIZE, MIN_MESSAGE_SIZE};
use crate::codec::discovery::{MAX_PEER_NAME, PeerFlags, PeerName, Transports};
use crate::error::ConfigError;
use crate::peer_table::{DEFAULT_MAX_PEERS, MAX_PEERS};
use crate::queue::{DEFAULT_QUEUE_CAPACITY, MAX_QUEUE_CAPACITY};

/// Default UDP port for discovery broadcasts
pub const DEFAULT_DISCOVERY_PORT: u16 = 7353;
/// Default TCP port for reliable sessions
pub const DEFAULT_TCP_PORT: u16 = 7354;
/// Default UDP port for unreliable datagrams
pub const DEFAULT_UDP_PORT: u16 = 7355;

/// Session engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Name advertised in discovery packets (at most 31 bytes)
    pub local_name: String,

    /// Port accepting reliable sessions
    pub tcp_port: u16,

    /// Port receiving unreliable datagrams
    pub udp_port: u16,

    /// Port used for discovery broadcasts
    pub discovery_port: u16,

    /// Advertised transports
    pub transports: TransportSet,

    /// Whether this node advertises itself as a session host
    pub host: bool,

    /// Peer table configuration
    pub peers: PeerConfig,

    /// Send queue configuration
    pub queue: QueueConfig,

    /// Capability configuration
    pub capabilities: CapabilityConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            local_name: "peertalk".to_string(),
            tcp_port: DEFAULT_TCP_PORT,
            udp_port: DEFAULT_UDP_PORT,
            discovery_port: DEFAULT_DISCOVERY_PORT,
            transports: TransportSet::default(),
            host: false,
            peers: PeerConfig::default(),
            queue: QueueConfig::default(),
            capabilities: CapabilityConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Check every field against its allowed range.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` naming the first invalid field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.local_name.is_empty() {
            return Err(ConfigError::new("local_name must not be empty"));
        }
        if self.local_name.len() > MAX_PEER_NAME {
            return Err(ConfigError(
                format!(
                    "local_name is {} bytes, max {}",
                    self.local_name.len(),
                    MAX_PEER_NAME
                )
                .into(),
            ));
        }
        if self.tcp_port == 0 || self.udp_port == 0 || self.discovery_port == 0 {
            return Err(ConfigError::new("ports must be non-zero"));
        }
        if !self.transports.tcp && !self.transports.udp {
            return Err(ConfigError::new("at least one transport must be enabled"));
        }
        self.peers.validate()?;
        self.queue.validate()?;
        self.capabilities.validate()?;
        if self.queue.max_slot_size < usize::from(self.capabilities.max_message_size) {
            return Err(ConfigError::new(
                "queue.max_slot_size must hold capabilities.max_message_size",
            ));
        }
        Ok(())
    }

    /// Local name as it appears on the wire
    #[must_use]
    pub fn peer_name(&self) -> PeerName {
        PeerName::truncated(&self.local_name)
    }

    /// Discovery flags advertised for this node
    #[must_use]
    pub fn peer_flags(&self) -> PeerFlags {
        let flags = PeerFlags::default().with_accepting();
        if self.host { flags.with_host() } else { flags }
    }
}

/// Transports advertised in discovery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSet {
    /// Reliable stream transport
    pub tcp: bool,
    /// Unreliable datagram transport
    pub udp: bool,
}

impl Default for TransportSet {
    fn default() -> Self {
        Self {
            tcp: true,
            udp: true,
        }
    }
}

impl TransportSet {
    /// Wire bitmask
    #[must_use]
    pub fn to_transports(self) -> Transports {
        let mut bits = 0;
        if self.tcp {
            bits |= Transports::TCP;
        }
        if self.udp {
            bits |= Transports::UDP;
        }
        Transports::from_bits(bits)
    }
}

/// Peer table configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerConfig {
    /// Number of peer slots
    pub max_peers: usize,

    /// Milliseconds without traffic before a discovered peer is dropped
    pub peer_timeout_ms: u64,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            max_peers: DEFAULT_MAX_PEERS,
            peer_timeout_ms: 15_000,
        }
    }
}

impl PeerConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_peers == 0 || self.max_peers > MAX_PEERS {
            return Err(ConfigError::new("peers.max_peers must be 1-255"));
        }
        if self.peer_timeout_ms == 0 {
            return Err(ConfigError::new("peers.peer_timeout_ms must be non-zero"));
        }
        Ok(())
    }
}

/// Send queue configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Slots per peer queue (power of two)
    pub capacity: usize,

    /// Largest payload a slot holds
    pub max_slot_size: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_QUEUE_CAPACITY,
            max_slot_size: usize::from(MAX_MESSAGE_SIZE),
        }
    }
}

impl QueueConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if !self.capacity.is_power_of_two() || self.capacity > MAX_QUEUE_CAPACITY {
            return Err(ConfigError::new(
                "queue.capacity must be a power of two no larger than 1024",
            ));
        }
        if self.max_slot_size == 0 {
            return Err(ConfigError::new("queue.max_slot_size must be non-zero"));
        }
        Ok(())
    }
}

/// Local capabilities advertised to peers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CapabilityConfig {
    /// Largest message accepted (256-8192)
    pub max_message_size: u16,

    /// Preferred streaming chunk size
    pub preferred_chunk: u16,

    /// Split oversized sends into fragments
    pub enable_fragmentation: bool,

    /// Advertise streaming support
    pub enable_streaming: bool,
}

impl Default for CapabilityConfig {
    fn default() -> Self {
        Self {
            max_message_size: MAX_MESSAGE_SIZE,
            preferred_chunk: 1024,
            enable_fragmentation: true,
            enable_streaming: false,
        }
    }
}

impl CapabilityConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if !(MIN_MESSAGE_SIZE..=MAX_MESSAGE_SIZE).contains(&self.max_message_size) {
            return Err(ConfigError::new(
                "capabilities.max_message_size must be 256-8192",
            ));
        }
        if self.preferred_chunk == 0 || self.preferred_chunk > self.max_message_size {
            return Err(ConfigError::new(
                "capabilities.preferred_chunk must be 1..=max_message_size",
            ));
        }
        Ok(())
    }

    /// Capability message advertising these settings at `pressure`
    #[must_use]
    pub fn to_message(&self, pressure: u8) -> CapabilityMessage {
        let mut flags = CapabilityFlags::default();
        if self.enable_fragmentation {
            flags = flags.with_fragmentation();
        }
        if self.enable_streaming {
            flags = flags.with_streaming();
        }
        CapabilityMessage {
            max_message_size: self.max_message_size,
            preferred_chunk: self.preferred_chunk,
            buffer_pressure: pressure.min(100),
            flags,
        }
    }
}
