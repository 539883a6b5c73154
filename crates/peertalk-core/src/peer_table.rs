//! Fixed-capacity arena of peer records.
//!
//! Slots are allocated once at startup. A peer's id is its 1-based slot
//! index, so lookup by id is O(1); lookups by address or name scan the table.

use std::net::{IpAddr, SocketAddr};

use crate::codec::discovery::{PeerFlags, PeerName, Transports};
use crate::error::{PeerError, QueueError};
use crate::peer::{Peer, PeerHandle, PeerId};

/// Default number of peer slots
pub const DEFAULT_MAX_PEERS: usize = 16;

/// Largest peer table; ids must fit the high byte of a coalesce key
pub const MAX_PEERS: usize = 255;

/// Outcome of [`PeerTable::create_or_refresh`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    /// A new peer took a free slot
    Created(PeerId),
    /// An existing peer at the same address was refreshed
    Refreshed(PeerId),
}

impl Upsert {
    /// Peer that was created or refreshed
    #[must_use]
    pub fn id(&self) -> PeerId {
        match self {
            Upsert::Created(id) | Upsert::Refreshed(id) => *id,
        }
    }
}

/// Peer arena
#[derive(Debug)]
pub struct PeerTable {
    peers: Vec<Peer>,
    live: usize,
    version: u32,
}

impl PeerTable {
    /// Allocate `max_peers` slots, each with its own queue and reassembly
    /// buffer. `max_slot_size` bounds each queue slot.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::NotPowerOfTwo` for an invalid queue capacity.
    #[allow(clippy::cast_possible_truncation)]
    pub fn new(
        max_peers: usize,
        queue_capacity: usize,
        max_slot_size: usize,
    ) -> Result<Self, QueueError> {
        let max_peers = max_peers.min(MAX_PEERS);
        let peers = (1..=max_peers)
            .map(|i| Peer::new(PeerId::new(i as u16), queue_capacity, max_slot_size))
            .collect::<Result<Vec<_>, _>>()?;

        tracing::debug!("Peer table initialized: {} slots", max_peers);
        Ok(Self {
            peers,
            live: 0,
            version: 0,
        })
    }

    /// Refresh the peer at `address`, or create one in the first free slot.
    ///
    /// # Errors
    ///
    /// Returns `PeerError::NoFreeSlot` when the table is full.
    pub fn create_or_refresh(
        &mut self,
        name: PeerName,
        address: SocketAddr,
        flags: PeerFlags,
        transports: Transports,
        now: u64,
    ) -> Result<Upsert, PeerError> {
        if let Some(id) = self.find_by_address(address) {
            if let Some(peer) = self.get_mut(id) {
                peer.refresh(name, flags, transports, now);
                return Ok(Upsert::Refreshed(id));
            }
        }

        let Some(id) = self.find_unused() else {
            tracing::warn!("No available peer slots (max {})", self.capacity());
            return Err(PeerError::NoFreeSlot {
                capacity: self.capacity(),
            });
        };
        let slot = id.slot().ok_or(PeerError::NotFound(id))?;
        self.peers[slot].activate(name, address, flags, transports, now)?;
        self.live += 1;
        self.bump_version();

        tracing::info!("Peer created: id={} name='{}' addr={}", id, name, address);
        Ok(Upsert::Created(id))
    }

    /// Return a peer's slot to UNUSED.
    ///
    /// Returns false if the peer was already gone.
    pub fn destroy(&mut self, id: PeerId) -> bool {
        let Some(peer) = self.get_mut(id) else {
            return false;
        };
        tracing::info!("Peer destroyed: id={} name='{}'", id, peer.name());
        peer.clear();
        self.live -= 1;
        self.bump_version();
        true
    }

    fn bump_version(&mut self) {
        self.version = self.version.wrapping_add(1);
    }

    /// Live peer by id
    #[must_use]
    pub fn get(&self, id: PeerId) -> Option<&Peer> {
        self.peers.get(id.slot()?).filter(|p| p.is_live())
    }

    /// Mutable live peer by id
    pub fn get_mut(&mut self, id: PeerId) -> Option<&mut Peer> {
        self.peers.get_mut(id.slot()?).filter(|p| p.is_live())
    }

    /// Resolve a handle, rejecting ones whose slot has been recycled.
    ///
    /// # Errors
    ///
    /// `PeerError::NotFound` if the slot is unused, `PeerError::StaleHandle`
    /// if it now holds a different peer.
    pub fn resolve(&self, handle: PeerHandle) -> Result<&Peer, PeerError> {
        let peer = self.get(handle.id()).ok_or(PeerError::NotFound(handle.id()))?;
        if peer.handle() != handle {
            return Err(PeerError::StaleHandle(handle.id()));
        }
        Ok(peer)
    }

    /// Live peer at an exact address and port
    #[must_use]
    pub fn find_by_address(&self, address: SocketAddr) -> Option<PeerId> {
        self.iter()
            .find(|p| p.address() == Some(address))
            .map(Peer::id)
    }

    /// Live peer at an IP address, any port
    #[must_use]
    pub fn find_by_ip(&self, ip: IpAddr) -> Option<PeerId> {
        self.iter()
            .find(|p| p.address().is_some_and(|a| a.ip() == ip))
            .map(Peer::id)
    }

    /// Live peer with this display name
    #[must_use]
    pub fn find_by_name(&self, name: &[u8]) -> Option<PeerId> {
        if name.is_empty() {
            return None;
        }
        self.iter()
            .find(|p| p.name().as_bytes() == name)
            .map(Peer::id)
    }

    /// First unused slot
    #[must_use]
    pub fn find_unused(&self) -> Option<PeerId> {
        self.peers.iter().find(|p| !p.is_live()).map(Peer::id)
    }

    /// Live peers
    pub fn iter(&self) -> impl Iterator<Item = &Peer> {
        self.peers.iter().filter(|p| p.is_live())
    }

    /// Ids of live peers, in slot order
    #[must_use]
    pub fn ids(&self) -> Vec<PeerId> {
        self.iter().map(Peer::id).collect()
    }

    /// Number of live peers
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.live
    }

    /// Number of slots
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.peers.len()
    }

    /// Counter bumped whenever a peer is created or destroyed
    #[must_use]
    pub fn version(&self) -> u32 {
        self.version
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::PeerState;

    fn table(n: usize) -> PeerTable {
        PeerTable::new(n, 8, 512).unwrap()
    }

    fn addr(last: u8) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, last], 7354))
    }

    fn upsert(t: &mut PeerTable, name: &str, last: u8, now: u64) -> Result<Upsert, PeerError> {
        t.create_or_refresh(
            PeerName::truncated(name),
            addr(last),
            PeerFlags::default(),
            Transports::default(),
            now,
        )
    }

    #[test]
    fn test_create_assigns_first_free_slot() {
        let mut t = table(4);
        assert_eq!(upsert(&mut t, "a", 1, 10).unwrap(), Upsert::Created(PeerId::new(1)));
        assert_eq!(upsert(&mut t, "b", 2, 10).unwrap(), Upsert::Created(PeerId::new(2)));
        assert_eq!(t.live_count(), 2);
        assert_eq!(t.version(), 2);

        let peer = t.get(PeerId::new(2)).unwrap();
        assert_eq!(peer.state(), PeerState::Discovered);
        assert_eq!(peer.name().to_string(), "b");
    }

    #[test]
    fn test_refresh_same_address() {
        let mut t = table(4);
        upsert(&mut t, "old", 1, 10).unwrap();
        let version = t.version();
        assert_eq!(
            upsert(&mut t, "new", 1, 99).unwrap(),
            Upsert::Refreshed(PeerId::new(1))
        );
        assert_eq!(t.live_count(), 1);
        assert_eq!(t.version(), version);
        let peer = t.get(PeerId::new(1)).unwrap();
        assert_eq!(peer.name().to_string(), "new");
        assert_eq!(peer.last_seen(), 99);
    }

    #[test]
    fn test_table_full() {
        let mut t = table(2);
        upsert(&mut t, "a", 1, 1).unwrap();
        upsert(&mut t, "b", 2, 1).unwrap();
        assert_eq!(
            upsert(&mut t, "c", 3, 1),
            Err(PeerError::NoFreeSlot { capacity: 2 })
        );
    }

    #[test]
    fn test_destroy_is_idempotent() {
        let mut t = table(2);
        let id = upsert(&mut t, "a", 1, 1).unwrap().id();
        assert!(t.destroy(id));
        assert!(!t.destroy(id));
        assert_eq!(t.live_count(), 0);
        assert!(t.get(id).is_none());
        assert!(t.find_by_address(addr(1)).is_none());
        assert_eq!(t.find_unused(), Some(PeerId::new(1)));
    }

    #[test]
    fn test_lookup_out_of_range() {
        let t = table(2);
        assert!(t.get(PeerId::LOCAL).is_none());
        assert!(t.get(PeerId::new(3)).is_none());
        assert!(t.get(PeerId::new(1)).is_none());
    }

    #[test]
    fn test_stale_handle() {
        let mut t = table(1);
        let id = upsert(&mut t, "a", 1, 1).unwrap().id();
        let handle = t.get(id).unwrap().handle();
        assert!(t.resolve(handle).is_ok());

        t.destroy(id);
        assert_eq!(t.resolve(handle).unwrap_err(), PeerError::NotFound(id));

        upsert(&mut t, "b", 2, 1).unwrap();
        assert_eq!(t.resolve(handle).unwrap_err(), PeerError::StaleHandle(id));
    }

    #[test]
    fn test_find_by_name_and_ip() {
        let mut t = table(4);
        upsert(&mut t, "alice", 1, 1).unwrap();
        upsert(&mut t, "bob", 2, 1).unwrap();
        assert_eq!(t.find_by_name(b"bob"), Some(PeerId::new(2)));
        assert_eq!(t.find_by_name(b""), None);
        assert_eq!(t.find_by_ip(addr(1).ip()), Some(PeerId::new(1)));
        assert_eq!(t.ids(), vec![PeerId::new(1), PeerId::new(2)]);
    }

    #[test]
    fn test_table_capacity_capped() {
        let t = PeerTable::new(1000, 2, 64).unwrap();
        assert_eq!(t.capacity(), MAX_PEERS);
    }
}
