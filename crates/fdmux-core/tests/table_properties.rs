//! Property tests for the connection table.
//!
//! Random sequences of inserts and removals are applied to a table holding
//! drop-counting handles.  After every step the live count must match the
//! occupied slots, no descriptor may be owned twice, and every handle that
//! left the table must have been closed exactly once.

use std::cell::Cell;
use std::collections::HashSet;
use std::os::fd::{AsRawFd, RawFd};
use std::rc::Rc;

use fdmux_core::{ConnectionTable, PeerAddress, SlotId, TableError};
use proptest::prelude::*;

struct CountedHandle {
    fd: RawFd,
    drops: Rc<Cell<u32>>,
}

impl AsRawFd for CountedHandle {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for CountedHandle {
    fn drop(&mut self) {
        self.drops.set(self.drops.get() + 1);
    }
}

#[derive(Debug, Clone)]
enum Op {
    Accept,
    Close(usize),
}

fn op_strategy(capacity: usize) -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => Just(Op::Accept),
        2 => (0..capacity + 2).prop_map(Op::Close),
    ]
}

fn assert_invariants(table: &ConnectionTable<CountedHandle>) {
    let occupied = (0..table.capacity())
        .filter(|&i| table.is_live(SlotId::new(i)))
        .count();
    assert_eq!(table.live_count(), occupied);
    assert!(table.live_count() <= table.capacity());

    let fds = table.descriptors();
    let unique: HashSet<_> = fds.iter().collect();
    assert_eq!(unique.len(), fds.len(), "descriptor owned by two slots");
}

proptest! {
    #[test]
    fn test_table_invariants_hold_for_any_operation_sequence(
        capacity in 1usize..=20,
        ops in prop::collection::vec(op_strategy(20), 0..120),
    ) {
        let mut table = ConnectionTable::new(capacity, 32);
        let mut counters: Vec<Rc<Cell<u32>>> = Vec::new();
        let mut live_handles = 0usize;
        let mut next_fd: RawFd = 1000;

        for op in ops {
            match op {
                Op::Accept => {
                    let drops = Rc::new(Cell::new(0));
                    counters.push(Rc::clone(&drops));
                    let handle = CountedHandle { fd: next_fd, drops: Rc::clone(&drops) };
                    next_fd += 1;

                    let was_full = table.is_full();
                    let before = table.live_count();
                    match table.insert(handle, PeerAddress::Local(None)) {
                        Ok(slot) => {
                            prop_assert!(!was_full);
                            prop_assert!(slot.index() < capacity);
                            live_handles += 1;
                        }
                        Err(TableError::Full { .. }) => {
                            prop_assert!(was_full);
                            prop_assert_eq!(drops.get(), 1);
                            prop_assert_eq!(table.live_count(), before);
                        }
                    }
                }
                Op::Close(index) => {
                    if table.remove(SlotId::new(index)).is_some() {
                        live_handles -= 1;
                    }
                }
            }
            assert_invariants(&table);
            prop_assert_eq!(table.live_count(), live_handles);
        }

        // Every handle is closed at most once while the table lives...
        prop_assert!(counters.iter().all(|d| d.get() <= 1));
        drop(table);
        // ...and exactly once after it is gone.
        prop_assert!(counters.iter().all(|d| d.get() == 1));
    }

    #[test]
    fn test_accepts_up_to_capacity_fill_slots_in_order(capacity in 1usize..=20) {
        let mut table = ConnectionTable::new(capacity, 32);
        for i in 0..capacity {
            let handle = CountedHandle { fd: 2000 + i as RawFd, drops: Rc::new(Cell::new(0)) };
            let slot = table.insert(handle, PeerAddress::Local(None)).unwrap();
            prop_assert_eq!(slot.index(), i);
        }
        prop_assert!(table.is_full());
        assert_invariants(&table);
    }
}
