//! Bounded connection table.
//!
//! The table is a fixed array of `capacity` slots.  Each slot is either free
//! or holds one live connection: its socket handle, the peer address, and a
//! bounded read buffer.  The slot index is the identifier the operator types
//! at the console, so indices are stable for the lifetime of a connection and
//! a freed index is reused by the next accepted connection.
//!
//! # Ownership (for beginners)
//!
//! The table *owns* each handle.  Dropping a handle closes the underlying
//! descriptor, so the only ways a descriptor gets closed are:
//!
//! - [`ConnectionTable::remove`] takes the slot and drops the handle, or
//! - [`ConnectionTable::insert`] rejects a connection because the table is
//!   full and drops the handle it was given.
//!
//! Because a freed slot is `None`, removing it a second time finds nothing
//! to drop and is a harmless no-op.  Double-close is impossible by
//! construction.

use std::fmt;
use std::os::fd::{AsRawFd, RawFd};

use thiserror::Error;

use super::peer::PeerAddress;

/// Default number of simultaneously connected clients.
pub const DEFAULT_MAX_CLIENTS: usize = 20;

/// Default per-connection receive buffer size in bytes.
pub const DEFAULT_BUFFER_CAPACITY: usize = 1024;

/// Index of a slot in a [`ConnectionTable`].
///
/// The operator selects a message target by typing this number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SlotId(usize);

impl SlotId {
    pub const fn new(index: usize) -> Self {
        Self(index)
    }

    pub const fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors produced by table mutations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TableError {
    /// Every slot is occupied.  The offered handle has already been closed.
    #[error("connection table is full ({capacity} clients)")]
    Full { capacity: usize },
}

/// One live connection held by the table.
#[derive(Debug)]
pub struct ConnectionSlot<H> {
    handle: H,
    peer: PeerAddress,
    read_buffer: Vec<u8>,
}

impl<H: AsRawFd> ConnectionSlot<H> {
    pub fn handle(&self) -> &H {
        &self.handle
    }

    pub fn handle_mut(&mut self) -> &mut H {
        &mut self.handle
    }

    pub fn peer(&self) -> &PeerAddress {
        &self.peer
    }

    pub fn descriptor(&self) -> RawFd {
        self.handle.as_raw_fd()
    }

    /// Bytes received but not yet delivered to the operator.
    pub fn read_buffer(&self) -> &[u8] {
        &self.read_buffer
    }

    /// Borrows the handle and the read buffer at the same time so a receive
    /// can read from one into the other.
    pub fn io_parts(&mut self) -> (&mut H, &mut Vec<u8>) {
        (&mut self.handle, &mut self.read_buffer)
    }

    /// Takes the buffered bytes, leaving the buffer empty but allocated.
    pub fn take_received(&mut self) -> Vec<u8> {
        self.read_buffer.drain(..).collect()
    }
}

/// Fixed-capacity registry of live connections.
///
/// Invariants maintained by every method:
///
/// - `live_count()` equals the number of occupied slots.
/// - `live_count() <= capacity()`.
/// - No two occupied slots share a descriptor (each handle is owned once).
#[derive(Debug)]
pub struct ConnectionTable<H> {
    slots: Vec<Option<ConnectionSlot<H>>>,
    live_count: usize,
    buffer_capacity: usize,
}

impl<H: AsRawFd> ConnectionTable<H> {
    /// Creates an empty table with `capacity` slots, each with a receive
    /// buffer of `buffer_capacity` bytes.
    pub fn new(capacity: usize, buffer_capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self {
            slots,
            live_count: 0,
            buffer_capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn buffer_capacity(&self) -> usize {
        self.buffer_capacity
    }

    pub fn live_count(&self) -> usize {
        self.live_count
    }

    pub fn is_empty(&self) -> bool {
        self.live_count == 0
    }

    pub fn is_full(&self) -> bool {
        self.live_count >= self.slots.len()
    }

    /// Places a new connection in the lowest-indexed free slot.
    ///
    /// When the table is full the handle is dropped (closing it) and
    /// [`TableError::Full`] is returned.
    pub fn insert(&mut self, handle: H, peer: PeerAddress) -> Result<SlotId, TableError> {
        let capacity = self.capacity();
        let Some(index) = self.slots.iter().position(Option::is_none) else {
            drop(handle);
            return Err(TableError::Full { capacity });
        };

        self.slots[index] = Some(ConnectionSlot {
            handle,
            peer,
            read_buffer: Vec::with_capacity(self.buffer_capacity),
        });
        self.live_count += 1;
        debug_assert!(self.live_count <= capacity);
        Ok(SlotId(index))
    }

    /// Frees a slot, closing its handle.
    ///
    /// Returns the peer address of the connection that was removed, or `None`
    /// when the slot was already free or out of range.  Removing a free slot
    /// has no other effect.
    pub fn remove(&mut self, slot: SlotId) -> Option<PeerAddress> {
        let entry = self.slots.get_mut(slot.0)?.take()?;
        self.live_count -= 1;
        let ConnectionSlot { handle, peer, .. } = entry;
        drop(handle);
        Some(peer)
    }

    /// Closes every live connection and returns how many were closed.
    pub fn clear(&mut self) -> usize {
        let closed = self.live_count;
        for slot in &mut self.slots {
            slot.take();
        }
        self.live_count = 0;
        closed
    }

    pub fn get(&self, slot: SlotId) -> Option<&ConnectionSlot<H>> {
        self.slots.get(slot.0)?.as_ref()
    }

    pub fn get_mut(&mut self, slot: SlotId) -> Option<&mut ConnectionSlot<H>> {
        self.slots.get_mut(slot.0)?.as_mut()
    }

    pub fn is_live(&self, slot: SlotId) -> bool {
        self.get(slot).is_some()
    }

    /// Iterates the live connections in ascending slot order.
    ///
    /// Each call starts a fresh pass from slot 0.
    pub fn live(&self) -> impl Iterator<Item = (SlotId, &ConnectionSlot<H>)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| slot.as_ref().map(|s| (SlotId(index), s)))
    }

    /// Snapshot of the live slot ids in ascending order.
    ///
    /// Useful when the caller needs to mutate the table while walking it.
    pub fn live_ids(&self) -> Vec<SlotId> {
        self.live().map(|(id, _)| id).collect()
    }

    /// Raw descriptors of every live connection, in slot order.
    pub fn descriptors(&self) -> Vec<RawFd> {
        self.live().map(|(_, slot)| slot.descriptor()).collect()
    }

    /// Finds the slot whose handle wraps `fd`.
    pub fn slot_of_descriptor(&self, fd: RawFd) -> Option<SlotId> {
        self.live()
            .find(|(_, slot)| slot.descriptor() == fd)
            .map(|(id, _)| id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    /// Handle stand-in that records how many times it was dropped.
    #[derive(Debug)]
    struct FakeHandle {
        fd: RawFd,
        drops: Rc<Cell<u32>>,
    }

    impl FakeHandle {
        fn new(fd: RawFd) -> (Self, Rc<Cell<u32>>) {
            let drops = Rc::new(Cell::new(0));
            (
                Self {
                    fd,
                    drops: Rc::clone(&drops),
                },
                drops,
            )
        }
    }

    impl AsRawFd for FakeHandle {
        fn as_raw_fd(&self) -> RawFd {
            self.fd
        }
    }

    impl Drop for FakeHandle {
        fn drop(&mut self) {
            self.drops.set(self.drops.get() + 1);
        }
    }

    fn inet_peer(port: u16) -> PeerAddress {
        PeerAddress::Inet(format!("127.0.0.1:{port}").parse().unwrap())
    }

    // ── insert ────────────────────────────────────────────────────────────────

    #[test]
    fn test_insert_into_empty_table_uses_slot_zero() {
        // Arrange
        let mut table = ConnectionTable::new(4, 64);
        let (handle, _) = FakeHandle::new(10);

        // Act
        let slot = table.insert(handle, inet_peer(5000)).unwrap();

        // Assert
        assert_eq!(slot, SlotId::new(0));
        assert_eq!(table.live_count(), 1);
        assert_eq!(table.get(slot).unwrap().descriptor(), 10);
    }

    #[test]
    fn test_insert_reuses_lowest_freed_slot() {
        let mut table = ConnectionTable::new(4, 64);
        for fd in 10..13 {
            table.insert(FakeHandle::new(fd).0, inet_peer(5000)).unwrap();
        }

        table.remove(SlotId::new(1));
        let reused = table.insert(FakeHandle::new(20).0, inet_peer(5001)).unwrap();

        assert_eq!(reused, SlotId::new(1));
        assert_eq!(table.get(reused).unwrap().descriptor(), 20);
    }

    #[test]
    fn test_insert_into_full_table_closes_the_offered_handle() {
        // Arrange
        let mut table = ConnectionTable::new(2, 64);
        table.insert(FakeHandle::new(10).0, inet_peer(1)).unwrap();
        table.insert(FakeHandle::new(11).0, inet_peer(2)).unwrap();
        let (extra, drops) = FakeHandle::new(12);

        // Act
        let result = table.insert(extra, inet_peer(3));

        // Assert
        assert_eq!(result, Err(TableError::Full { capacity: 2 }));
        assert_eq!(drops.get(), 1, "rejected handle must be closed exactly once");
        assert_eq!(table.live_count(), 2);
    }

    #[test]
    fn test_zero_capacity_table_rejects_everything() {
        let mut table = ConnectionTable::new(0, 64);
        let (handle, drops) = FakeHandle::new(10);

        assert!(table.insert(handle, inet_peer(1)).is_err());
        assert_eq!(drops.get(), 1);
        assert!(table.is_full());
    }

    // ── remove ────────────────────────────────────────────────────────────────

    #[test]
    fn test_remove_closes_handle_once_and_returns_peer() {
        let mut table = ConnectionTable::new(4, 64);
        let (handle, drops) = FakeHandle::new(10);
        let slot = table.insert(handle, inet_peer(7000)).unwrap();

        let peer = table.remove(slot);

        assert_eq!(peer, Some(inet_peer(7000)));
        assert_eq!(drops.get(), 1);
        assert_eq!(table.live_count(), 0);
        assert!(!table.is_live(slot));
    }

    #[test]
    fn test_remove_of_free_slot_is_a_no_op() {
        let mut table = ConnectionTable::new(4, 64);
        let (handle, drops) = FakeHandle::new(10);
        let slot = table.insert(handle, inet_peer(7000)).unwrap();
        table.remove(slot);

        // Second removal must not close anything again.
        assert_eq!(table.remove(slot), None);
        assert_eq!(drops.get(), 1);
        assert_eq!(table.live_count(), 0);
    }

    #[test]
    fn test_remove_out_of_range_slot_returns_none() {
        let mut table: ConnectionTable<FakeHandle> = ConnectionTable::new(4, 64);
        assert_eq!(table.remove(SlotId::new(99)), None);
    }

    #[test]
    fn test_clear_closes_every_live_handle() {
        let mut table = ConnectionTable::new(4, 64);
        let counters: Vec<_> = (10..13)
            .map(|fd| {
                let (handle, drops) = FakeHandle::new(fd);
                table.insert(handle, inet_peer(1)).unwrap();
                drops
            })
            .collect();

        let closed = table.clear();

        assert_eq!(closed, 3);
        assert!(counters.iter().all(|d| d.get() == 1));
        assert!(table.is_empty());
    }

    // ── iteration ─────────────────────────────────────────────────────────────

    #[test]
    fn test_live_iterates_in_slot_order_and_skips_free_slots() {
        let mut table = ConnectionTable::new(5, 64);
        for fd in 10..15 {
            table.insert(FakeHandle::new(fd).0, inet_peer(1)).unwrap();
        }
        table.remove(SlotId::new(0));
        table.remove(SlotId::new(3));

        let ids: Vec<usize> = table.live().map(|(id, _)| id.index()).collect();

        assert_eq!(ids, vec![1, 2, 4]);
        assert_eq!(table.descriptors(), vec![11, 12, 14]);
    }

    #[test]
    fn test_live_is_restartable() {
        let mut table = ConnectionTable::new(3, 64);
        table.insert(FakeHandle::new(10).0, inet_peer(1)).unwrap();

        assert_eq!(table.live().count(), 1);
        assert_eq!(table.live().count(), 1);
    }

    #[test]
    fn test_slot_of_descriptor_finds_owner() {
        let mut table = ConnectionTable::new(3, 64);
        table.insert(FakeHandle::new(10).0, inet_peer(1)).unwrap();
        let slot = table.insert(FakeHandle::new(42).0, inet_peer(2)).unwrap();

        assert_eq!(table.slot_of_descriptor(42), Some(slot));
        assert_eq!(table.slot_of_descriptor(99), None);
    }

    // ── read buffer ───────────────────────────────────────────────────────────

    #[test]
    fn test_take_received_empties_buffer() {
        let mut table = ConnectionTable::new(1, 64);
        let slot = table.insert(FakeHandle::new(10).0, inet_peer(1)).unwrap();
        let entry = table.get_mut(slot).unwrap();
        entry.io_parts().1.extend_from_slice(b"hello");

        assert_eq!(entry.take_received(), b"hello");
        assert!(entry.read_buffer().is_empty());
    }

    #[test]
    fn test_reused_slot_starts_with_empty_buffer() {
        let mut table = ConnectionTable::new(1, 64);
        let slot = table.insert(FakeHandle::new(10).0, inet_peer(1)).unwrap();
        table
            .get_mut(slot)
            .unwrap()
            .io_parts()
            .1
            .extend_from_slice(b"stale");
        table.remove(slot);

        let slot = table.insert(FakeHandle::new(11).0, inet_peer(2)).unwrap();

        assert!(table.get(slot).unwrap().read_buffer().is_empty());
    }
}
