//! Per-peer priority send queue with coalescing and backpressure.
//!
//! # Design
//!
//! - **Fixed capacity**: slots are allocated once; a full queue rejects the
//!   push instead of growing
//! - **Priority lists**: each priority level threads a FIFO list through the
//!   slot array, so `pop` is O(1) and ties go to the earliest insertion
//! - **Free list**: vacated slots are threaded into a free list, so slots
//!   freed out of order are reused safely
//! - **Coalescing**: a push with a non-zero key replaces the queued payload
//!   with the same key instead of taking a new slot
//!
//! Each slot also carries a small `Copy` metadata value `M` that the queue
//! stores and returns untouched; the engine uses it for the frame type and
//! flags applied at dequeue time.
//!
//! Pressure is `count * 100 / capacity`. The [`Backpressure`] level derived
//! from it drives [`SendQueue::try_push`].

use crate::error::{Error, QueueError};

/// Default slots per peer queue
pub const DEFAULT_QUEUE_CAPACITY: usize = 32;

/// Upper bound on queue capacity
pub const MAX_QUEUE_CAPACITY: usize = 1024;

/// Coalesce key meaning "never coalesce"
pub const COALESCE_NONE: u16 = 0x0000;

/// Pressure below which sending is unrestricted
pub const PRESSURE_LOW: u8 = 25;
/// Pressure at which senders should slow down
pub const PRESSURE_MEDIUM: u8 = 50;
/// Pressure at which only high-priority traffic is admitted
pub const PRESSURE_HIGH: u8 = 75;
/// Pressure at which only critical traffic is admitted
pub const PRESSURE_CRITICAL: u8 = 90;

const PRIORITY_LEVELS: usize = 4;

/// Message priority, lowest to highest
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
pub enum Priority {
    /// Background traffic, first to be throttled
    Low = 0,
    /// Default priority
    #[default]
    Normal = 1,
    /// Latency-sensitive traffic
    High = 2,
    /// Control traffic that is never throttled
    Critical = 3,
}

impl Priority {
    /// All levels, highest first
    pub const DESCENDING: [Priority; PRIORITY_LEVELS] =
        [Priority::Critical, Priority::High, Priority::Normal, Priority::Low];

    fn index(self) -> usize {
        self as usize
    }
}

impl TryFrom<u8> for Priority {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Low),
            1 => Ok(Self::Normal),
            2 => Ok(Self::High),
            3 => Ok(Self::Critical),
            _ => Err(Error::invalid_param("priority out of range")),
        }
    }
}

/// Backpressure level derived from queue pressure
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Backpressure {
    /// Below 50%: send freely
    None,
    /// 50-75%: sender should reduce its rate
    Light,
    /// 75-90%: only HIGH and CRITICAL are admitted
    Heavy,
    /// 90% and above: only CRITICAL is admitted
    Blocking,
}

impl Backpressure {
    /// Classify a 0-100 pressure value
    #[must_use]
    pub fn from_pressure(pressure: u8) -> Self {
        match pressure {
            p if p >= PRESSURE_CRITICAL => Self::Blocking,
            p if p >= PRESSURE_HIGH => Self::Heavy,
            p if p >= PRESSURE_MEDIUM => Self::Light,
            _ => Self::None,
        }
    }

    /// Whether a message of `priority` is admitted at this level
    #[must_use]
    pub fn admits(self, priority: Priority) -> bool {
        match self {
            Self::None | Self::Light => true,
            Self::Heavy => priority >= Priority::High,
            Self::Blocking => priority == Priority::Critical,
        }
    }
}

/// What a successful push did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Payload took a new slot
    Queued,
    /// Payload replaced a queued message with the same coalesce key
    Coalesced,
}

/// A message removed from the queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedMessage<M = ()> {
    /// Priority it was queued at
    pub priority: Priority,
    /// Coalesce key, or [`COALESCE_NONE`]
    pub coalesce_key: u16,
    /// Caller metadata stored with the payload
    pub meta: M,
    /// Payload bytes
    pub data: Vec<u8>,
}

#[derive(Debug, Default)]
struct Slot<M> {
    data: Vec<u8>,
    priority: Priority,
    coalesce_key: u16,
    meta: M,
    used: bool,
    next: Option<usize>,
}

#[derive(Debug, Clone, Copy, Default)]
struct PriorityList {
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
}

/// Fixed-capacity outbound queue for one peer
#[derive(Debug)]
pub struct SendQueue<M = ()> {
    slots: Box<[Slot<M>]>,
    lists: [PriorityList; PRIORITY_LEVELS],
    free_head: Option<usize>,
    count: usize,
    max_slot_size: usize,
    pressure_alert: u8,
}

impl<M: Copy + Default> SendQueue<M> {
    /// Create a queue with `capacity` slots of up to `max_slot_size` bytes.
    ///
    /// Every slot buffer is reserved here, so pushes never allocate.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::NotPowerOfTwo` unless `capacity` is a power of two
    /// no larger than [`MAX_QUEUE_CAPACITY`].
    pub fn new(capacity: usize, max_slot_size: usize) -> Result<Self, QueueError> {
        if !capacity.is_power_of_two() || capacity > MAX_QUEUE_CAPACITY {
            return Err(QueueError::NotPowerOfTwo(capacity));
        }

        let slots = (0..capacity)
            .map(|_| Slot::<M> {
                data: Vec::with_capacity(max_slot_size),
                ..Slot::default()
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();

        let mut queue = Self {
            slots,
            lists: [PriorityList::default(); PRIORITY_LEVELS],
            free_head: None,
            count: 0,
            max_slot_size,
            pressure_alert: 0,
        };
        queue.rebuild_free_list();
        Ok(queue)
    }

    fn rebuild_free_list(&mut self) {
        let capacity = self.slots.len();
        for (i, slot) in self.slots.iter_mut().enumerate() {
            slot.used = false;
            slot.coalesce_key = COALESCE_NONE;
            slot.meta = M::default();
            slot.data.clear();
            slot.next = (i + 1 < capacity).then_some(i + 1);
        }
        self.free_head = Some(0);
    }

    /// Queue a payload with default metadata.
    ///
    /// # Errors
    ///
    /// As for [`push_with`](Self::push_with).
    pub fn push(
        &mut self,
        data: &[u8],
        priority: Priority,
        coalesce_key: u16,
    ) -> Result<PushOutcome, QueueError> {
        self.push_with(M::default(), data, priority, coalesce_key)
    }

    /// Queue a payload, coalescing with any queued message carrying the same
    /// non-zero key. A coalesced entry takes the new payload, metadata and
    /// priority.
    ///
    /// # Errors
    ///
    /// `QueueError::PayloadTooLarge` for an oversized payload;
    /// `QueueError::Full` if no slot is free and nothing coalesced.
    /// A failed push leaves the queue untouched.
    pub fn push_with(
        &mut self,
        meta: M,
        data: &[u8],
        priority: Priority,
        coalesce_key: u16,
    ) -> Result<PushOutcome, QueueError> {
        if data.len() > self.max_slot_size {
            return Err(QueueError::PayloadTooLarge {
                len: data.len(),
                max: self.max_slot_size,
            });
        }

        if coalesce_key != COALESCE_NONE {
            if let Some(idx) = self.find_key(coalesce_key) {
                let slot = &mut self.slots[idx];
                slot.data.clear();
                slot.data.extend_from_slice(data);
                slot.meta = meta;
                let old = slot.priority;
                if old != priority {
                    self.unlink(idx, old);
                    self.slots[idx].priority = priority;
                    self.append(idx, priority);
                }
                tracing::debug!(
                    "Coalesced message: key=0x{:04X} len={} priority={:?}",
                    coalesce_key,
                    data.len(),
                    priority
                );
                return Ok(PushOutcome::Coalesced);
            }
        }

        let Some(idx) = self.free_head else {
            tracing::warn!("Queue full: {}/{} slots", self.count, self.capacity());
            return Err(QueueError::Full {
                capacity: self.capacity(),
            });
        };

        let slot = &mut self.slots[idx];
        self.free_head = slot.next;
        slot.data.clear();
        slot.data.extend_from_slice(data);
        slot.priority = priority;
        slot.coalesce_key = coalesce_key;
        slot.meta = meta;
        slot.used = true;
        self.append(idx, priority);
        self.count += 1;

        self.log_pressure();
        Ok(PushOutcome::Queued)
    }

    /// Push subject to the backpressure policy.
    ///
    /// Returns the outcome together with the backpressure level after the
    /// push, so callers can slow down before the queue fills.
    ///
    /// # Errors
    ///
    /// `QueueError::Throttled` if the current level does not admit
    /// `priority`, otherwise as for [`push`](Self::push).
    pub fn try_push(
        &mut self,
        meta: M,
        data: &[u8],
        priority: Priority,
        coalesce_key: u16,
    ) -> Result<(PushOutcome, Backpressure), QueueError> {
        let pressure = self.pressure();
        let level = Backpressure::from_pressure(pressure);
        if !level.admits(priority) {
            return Err(QueueError::Throttled { level, pressure });
        }
        let outcome = self.push_with(meta, data, priority, coalesce_key)?;
        Ok((outcome, self.backpressure()))
    }

    /// Highest-priority message without removing it
    #[must_use]
    pub fn peek(&self) -> Option<(Priority, M, &[u8])> {
        let idx = self.front()?;
        let slot = &self.slots[idx];
        Some((slot.priority, slot.meta, &slot.data))
    }

    /// Remove the highest-priority message, copying its payload into `out`.
    ///
    /// Reuses `out`'s allocation; returns the priority and metadata.
    pub fn pop_into(&mut self, out: &mut Vec<u8>) -> Option<(Priority, M)> {
        let idx = self.front()?;
        out.clear();
        out.extend_from_slice(&self.slots[idx].data);
        let priority = self.slots[idx].priority;
        let meta = self.slots[idx].meta;
        self.remove_front(idx, priority);
        Some((priority, meta))
    }

    /// Remove and return the highest-priority message
    pub fn pop(&mut self) -> Option<QueuedMessage<M>> {
        let idx = self.front()?;
        let slot = &self.slots[idx];
        let message = QueuedMessage {
            priority: slot.priority,
            coalesce_key: slot.coalesce_key,
            meta: slot.meta,
            data: slot.data.clone(),
        };
        self.remove_front(idx, message.priority);
        Some(message)
    }

    fn front(&self) -> Option<usize> {
        Priority::DESCENDING
            .iter()
            .find_map(|p| self.lists[p.index()].head)
    }

    fn remove_front(&mut self, idx: usize, priority: Priority) {
        let list = &mut self.lists[priority.index()];
        list.head = self.slots[idx].next;
        if list.head.is_none() {
            list.tail = None;
        }
        list.len -= 1;
        self.release(idx);
    }

    fn release(&mut self, idx: usize) {
        let slot = &mut self.slots[idx];
        slot.used = false;
        slot.coalesce_key = COALESCE_NONE;
        slot.meta = M::default();
        slot.data.clear();
        slot.next = self.free_head;
        self.free_head = Some(idx);
        self.count -= 1;
        if self.pressure() < 80 {
            self.pressure_alert = 0;
        }
    }

    fn find_key(&self, key: u16) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.used && s.coalesce_key == key)
    }

    fn append(&mut self, idx: usize, priority: Priority) {
        self.slots[idx].next = None;
        let list = &mut self.lists[priority.index()];
        match list.tail {
            Some(tail) => self.slots[tail].next = Some(idx),
            None => list.head = Some(idx),
        }
        list.tail = Some(idx);
        list.len += 1;
    }

    fn unlink(&mut self, idx: usize, priority: Priority) {
        let list = self.lists[priority.index()];
        let mut prev: Option<usize> = None;
        let mut cursor = list.head;
        while let Some(i) = cursor {
            if i == idx {
                break;
            }
            prev = Some(i);
            cursor = self.slots[i].next;
        }
        let next = self.slots[idx].next;
        let list = &mut self.lists[priority.index()];
        match prev {
            Some(p) => self.slots[p].next = next,
            None => list.head = next,
        }
        if list.tail == Some(idx) {
            list.tail = prev;
        }
        list.len -= 1;
    }

    fn log_pressure(&mut self) {
        let pressure = self.pressure();
        for threshold in [95u8, 90, 80] {
            if pressure >= threshold {
                if self.pressure_alert < threshold {
                    tracing::warn!(
                        "Queue pressure at {}% ({}/{} slots)",
                        pressure,
                        self.count,
                        self.capacity()
                    );
                    self.pressure_alert = threshold;
                }
                return;
            }
        }
    }

    /// Number of queued messages
    #[must_use]
    pub fn count(&self) -> usize {
        self.count
    }

    /// Number of queued messages at one priority
    #[must_use]
    pub fn count_at(&self, priority: Priority) -> usize {
        self.lists[priority.index()].len
    }

    /// Slots still available
    #[must_use]
    pub fn free_slots(&self) -> usize {
        self.capacity() - self.count
    }

    /// Total slots
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Largest payload a slot holds
    #[must_use]
    pub fn max_slot_size(&self) -> usize {
        self.max_slot_size
    }

    /// True if nothing is queued
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// True if every slot is occupied
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.count == self.capacity()
    }

    /// Occupancy as a 0-100 percentage
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn pressure(&self) -> u8 {
        ((self.count * 100) / self.capacity()).min(100) as u8
    }

    /// Backpressure level for the current occupancy
    #[must_use]
    pub fn backpressure(&self) -> Backpressure {
        Backpressure::from_pressure(self.pressure())
    }

    /// Drop every queued message
    pub fn reset(&mut self) {
        self.lists = [PriorityList::default(); PRIORITY_LEVELS];
        self.count = 0;
        self.pressure_alert = 0;
        self.rebuild_free_list();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue(capacity: usize) -> SendQueue {
        SendQueue::new(capacity, 256).unwrap()
    }

    #[test]
    fn test_queue_basic() {
        let mut q = queue(8);
        assert!(q.is_empty());
        assert_eq!(q.push(b"hello", Priority::Normal, 0).unwrap(), PushOutcome::Queued);
        assert_eq!(q.count(), 1);
        assert_eq!(q.free_slots(), 7);

        let msg = q.pop().unwrap();
        assert_eq!(msg.data, b"hello");
        assert_eq!(msg.priority, Priority::Normal);
        assert!(q.pop().is_none());
        assert!(q.is_empty());
    }

    #[test]
    fn test_capacity_must_be_power_of_two() {
        assert!(matches!(SendQueue::<()>::new(0, 256), Err(QueueError::NotPowerOfTwo(0))));
        assert!(matches!(SendQueue::<()>::new(12, 256), Err(QueueError::NotPowerOfTwo(12))));
        assert!(matches!(
            SendQueue::<()>::new(2048, 256),
            Err(QueueError::NotPowerOfTwo(2048))
        ));
        assert_eq!(SendQueue::<()>::new(32, 256).unwrap().capacity(), 32);
    }

    #[test]
    fn test_slots_reserved_up_front() {
        let mut q = queue(4);
        assert!(q.slots.iter().all(|slot| slot.data.capacity() >= 256));

        q.push(&[7u8; 200], Priority::Normal, 0).unwrap();
        q.pop().unwrap();
        q.reset();
        assert!(q.slots.iter().all(|slot| slot.data.capacity() >= 256));
    }

    #[test]
    fn test_priority_order() {
        let mut q = queue(8);
        q.push(b"low", Priority::Low, 0).unwrap();
        q.push(b"normal", Priority::Normal, 0).unwrap();
        q.push(b"high", Priority::High, 0).unwrap();
        q.push(b"critical", Priority::Critical, 0).unwrap();

        let order: Vec<_> = std::iter::from_fn(|| q.pop()).map(|m| m.priority).collect();
        assert_eq!(
            order,
            vec![Priority::Critical, Priority::High, Priority::Normal, Priority::Low]
        );
    }

    #[test]
    fn test_fifo_within_priority() {
        let mut q = queue(8);
        q.push(b"a", Priority::High, 0).unwrap();
        q.push(b"x", Priority::Low, 0).unwrap();
        q.push(b"b", Priority::High, 0).unwrap();
        q.push(b"c", Priority::High, 0).unwrap();

        assert_eq!(q.pop().unwrap().data, b"a");
        assert_eq!(q.pop().unwrap().data, b"b");
        assert_eq!(q.pop().unwrap().data, b"c");
        assert_eq!(q.pop().unwrap().data, b"x");
    }

    #[test]
    fn test_coalesce_replaces_payload() {
        let mut q = queue(8);
        for i in 0..10u8 {
            q.push(&[i; 4], Priority::Normal, 0x0101).unwrap();
        }
        assert_eq!(q.count(), 1);
        let msg = q.pop().unwrap();
        assert_eq!(msg.data, [9u8; 4]);
        assert_eq!(msg.coalesce_key, 0x0101);
    }

    #[test]
    fn test_coalesce_keeps_position() {
        let mut q = queue(8);
        q.push(b"pos-1", Priority::Normal, 1).unwrap();
        q.push(b"chat", Priority::Normal, 0).unwrap();
        assert_eq!(q.push(b"pos-2", Priority::Normal, 1).unwrap(), PushOutcome::Coalesced);

        assert_eq!(q.pop().unwrap().data, b"pos-2");
        assert_eq!(q.pop().unwrap().data, b"chat");
    }

    #[test]
    fn test_coalesce_changes_priority() {
        let mut q = queue(8);
        q.push(b"state-1", Priority::Low, 2).unwrap();
        q.push(b"other", Priority::High, 0).unwrap();
        q.push(b"state-2", Priority::Critical, 2).unwrap();

        assert_eq!(q.count_at(Priority::Low), 0);
        assert_eq!(q.count_at(Priority::Critical), 1);
        let first = q.pop().unwrap();
        assert_eq!(first.data, b"state-2");
        assert_eq!(first.priority, Priority::Critical);
        assert_eq!(q.pop().unwrap().data, b"other");
        assert!(q.pop().is_none());
    }

    #[test]
    fn test_coalesce_works_when_full() {
        let mut q = queue(2);
        q.push(b"a", Priority::Normal, 7).unwrap();
        q.push(b"b", Priority::Normal, 0).unwrap();
        assert!(q.is_full());
        assert_eq!(q.push(b"c", Priority::Normal, 7).unwrap(), PushOutcome::Coalesced);
        assert_eq!(q.pop().unwrap().data, b"c");
    }

    #[test]
    fn test_full_queue_rejects_without_corruption() {
        let mut q = queue(4);
        for i in 0..4u8 {
            q.push(&[i], Priority::Normal, 0).unwrap();
        }
        assert!(q.is_full());
        assert_eq!(
            q.push(b"overflow", Priority::Critical, 0),
            Err(QueueError::Full { capacity: 4 })
        );
        assert_eq!(q.count(), 4);
        for i in 0..4u8 {
            assert_eq!(q.pop().unwrap().data, [i]);
        }
    }

    #[test]
    fn test_slot_reuse_after_out_of_order_pops() {
        let mut q = queue(4);
        q.push(b"low-1", Priority::Low, 0).unwrap();
        q.push(b"low-2", Priority::Low, 0).unwrap();
        q.push(b"crit", Priority::Critical, 0).unwrap();
        assert_eq!(q.pop().unwrap().data, b"crit");

        // the freed middle slot must not clobber queued data
        q.push(b"new-1", Priority::Low, 0).unwrap();
        q.push(b"new-2", Priority::Low, 0).unwrap();
        assert!(q.is_full());

        let rest: Vec<_> = std::iter::from_fn(|| q.pop()).map(|m| m.data).collect();
        assert_eq!(
            rest,
            vec![b"low-1".to_vec(), b"low-2".to_vec(), b"new-1".to_vec(), b"new-2".to_vec()]
        );
    }

    #[test]
    fn test_payload_validation() {
        let mut q = queue(4);
        assert_eq!(
            q.push(&[0u8; 257], Priority::Normal, 0),
            Err(QueueError::PayloadTooLarge { len: 257, max: 256 })
        );
        assert!(q.is_empty());

        // control frames carry no payload
        assert_eq!(q.push(b"", Priority::Critical, 0), Ok(PushOutcome::Queued));
        assert_eq!(q.pop().unwrap().data, b"");
    }

    #[test]
    fn test_pressure_and_backpressure() {
        let mut q = queue(8);
        assert_eq!(q.pressure(), 0);
        assert_eq!(q.backpressure(), Backpressure::None);

        for _ in 0..4 {
            q.push(b"x", Priority::Normal, 0).unwrap();
        }
        assert_eq!(q.pressure(), 50);
        assert_eq!(q.backpressure(), Backpressure::Light);

        for _ in 0..2 {
            q.push(b"x", Priority::Normal, 0).unwrap();
        }
        assert_eq!(q.pressure(), 75);
        assert_eq!(q.backpressure(), Backpressure::Heavy);

        q.push(b"x", Priority::Normal, 0).unwrap();
        q.push(b"x", Priority::Normal, 0).unwrap();
        assert_eq!(q.pressure(), 100);
        assert_eq!(q.backpressure(), Backpressure::Blocking);
    }

    #[test]
    fn test_try_push_policy() {
        let mut q = queue(4);
        for _ in 0..3 {
            q.push(b"x", Priority::Normal, 0).unwrap();
        }
        // 75% -> heavy: NORMAL rejected, HIGH admitted
        assert_eq!(
            q.try_push((), b"n", Priority::Normal, 0),
            Err(QueueError::Throttled {
                level: Backpressure::Heavy,
                pressure: 75
            })
        );
        let (outcome, level) = q.try_push((), b"h", Priority::High, 0).unwrap();
        assert_eq!(outcome, PushOutcome::Queued);
        assert_eq!(level, Backpressure::Blocking);

        q.pop();
        q.pop();
        q.pop();
        // 25% -> none
        let (_, level) = q.try_push((), b"l", Priority::Low, 0).unwrap();
        assert_eq!(level, Backpressure::Light);
    }

    #[test]
    fn test_backpressure_admits() {
        assert!(Backpressure::Light.admits(Priority::Low));
        assert!(!Backpressure::Heavy.admits(Priority::Normal));
        assert!(Backpressure::Heavy.admits(Priority::High));
        assert!(!Backpressure::Blocking.admits(Priority::High));
        assert!(Backpressure::Blocking.admits(Priority::Critical));
    }

    #[test]
    fn test_pop_into_reuses_buffer() {
        let mut q = queue(4);
        q.push(b"abc", Priority::High, 0).unwrap();
        let mut out = Vec::with_capacity(64);
        out.extend_from_slice(b"stale");
        assert_eq!(q.pop_into(&mut out), Some((Priority::High, ())));
        assert_eq!(out, b"abc");
        assert_eq!(q.pop_into(&mut out), None);
    }

    #[test]
    fn test_peek_does_not_remove() {
        let mut q = queue(4);
        q.push(b"n", Priority::Normal, 0).unwrap();
        q.push(b"h", Priority::High, 0).unwrap();
        assert_eq!(q.peek(), Some((Priority::High, (), &b"h"[..])));
        assert_eq!(q.count(), 2);
    }

    #[test]
    fn test_reset() {
        let mut q = queue(4);
        q.push(b"a", Priority::Low, 3).unwrap();
        q.push(b"b", Priority::Critical, 0).unwrap();
        q.reset();
        assert!(q.is_empty());
        assert_eq!(q.count_at(Priority::Critical), 0);
        // coalesce index cleared too
        assert_eq!(q.push(b"c", Priority::Low, 3).unwrap(), PushOutcome::Queued);
        for _ in 0..3 {
            q.push(b"d", Priority::Low, 0).unwrap();
        }
        assert!(q.is_full());
    }

    #[test]
    fn test_metadata_travels_with_payload() {
        let mut q: SendQueue<u8> = SendQueue::new(4, 64).unwrap();
        q.push_with(7, b"a", Priority::Normal, 5).unwrap();
        q.push_with(9, b"b", Priority::Normal, 5).unwrap();
        let msg = q.pop().unwrap();
        assert_eq!(msg.meta, 9);
        assert_eq!(msg.data, b"b");

        q.push_with(3, b"c", Priority::Low, 0).unwrap();
        let mut out = Vec::new();
        assert_eq!(q.pop_into(&mut out), Some((Priority::Low, 3)));
    }

    #[test]
    fn test_priority_from_u8() {
        assert_eq!(Priority::try_from(3).unwrap(), Priority::Critical);
        assert!(Priority::try_from(4).is_err());
    }
}
