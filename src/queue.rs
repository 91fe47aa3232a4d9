//! # Priority command queue
//!
//! Orders pending commands by `(priority desc, stamp asc)` and maintains a
//! per-id back-index so that [`PriorityQueue::push`] can find a compatible
//! pending command to merge into in O(pending-per-id) instead of scanning
//! the whole queue.
//!
//! Commands live in a slot arena (`Vec<Option<Slot>>`) addressed by stable
//! indices rather than through pointers into a resizable container — a
//! merge or [`PriorityQueue::update_at`] call overwrites a slot in place and
//! pushes a fresh heap entry for it, leaving the old heap entry for that
//! slot to be discarded lazily the next time it reaches the top of the
//! heap. This avoids the cyclic back-pointer-into-the-heap's-storage
//! pattern of the original C++ implementation, which does not translate to
//! a safe Rust `BinaryHeap`.
//!
//! ## Available Methods
//! - [`PriorityQueue::push`] - enqueue, optionally merging with a pending compatible command
//! - [`PriorityQueue::pop`] - remove and return the highest-priority, oldest-stamped command
//! - [`PriorityQueue::get`] - read-only view of pending commands for an id
//! - [`PriorityQueue::update_at`] - overwrite a pending command in place
//! - [`ConcurrentQueue`] - `Mutex`-guarded wrapper exposing the same operations atomically

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Mutex;

use crate::command::{Command, CommandId};

#[derive(Debug, Clone, Copy)]
struct Slot {
    command: Command,
    stamp: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct HeapEntry {
    priority: i32,
    stamp: u64,
    slot: usize,
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.stamp.cmp(&self.stamp))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Non-thread-safe priority queue of pending commands. See module docs.
#[derive(Debug, Default)]
pub struct PriorityQueue {
    slots: Vec<Option<Slot>>,
    free_slots: Vec<usize>,
    heap: BinaryHeap<HeapEntry>,
    /// Per-id insertion-ordered list of live slot indices.
    index: [Vec<usize>; 13],
    stamp_counter: u64,
    len: usize,
}

fn id_index(id: CommandId) -> usize {
    use CommandId::*;
    match id {
        RelayOn => 0,
        RelayOff => 1,
        ToggleRelay => 2,
        QueryRelay => 3,
        SetButtonMode => 4,
        QueryButtonMode => 5,
        StartTimer => 6,
        SetTimer => 7,
        QueryTimer => 8,
        ResetFactoryDefaults => 9,
        QueryJumperStatus => 10,
        QueryFirmwareVersion => 11,
        CommandId::None => 12,
    }
}

impl PriorityQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of pending commands.
    pub fn size(&self) -> usize {
        self.len
    }

    /// True if no commands are pending.
    pub fn empty(&self) -> bool {
        self.len == 0
    }

    /// Current stamp counter. Resets to zero once the queue fully drains.
    pub fn stamp_counter(&self) -> u64 {
        self.stamp_counter
    }

    /// Read-only view of pending commands with `id`, in enqueue order.
    pub fn get(&self, id: CommandId) -> Vec<Command> {
        self.index[id_index(id)]
            .iter()
            .filter_map(|&slot| self.slots[slot].map(|s| s.command))
            .collect()
    }

    /// Overwrites the `position`-th pending command with `id` (in enqueue
    /// order, as returned by [`PriorityQueue::get`]) with `new_command`,
    /// keeping the slot's original stamp. A priority change takes effect on
    /// the next [`PriorityQueue::pop`].
    ///
    /// Returns `false` if `position` is out of range for `id`.
    pub fn update_at(&mut self, id: CommandId, position: usize, new_command: Command) -> bool {
        let Some(&slot) = self.index[id_index(id)].get(position) else {
            return false;
        };
        let Some(existing) = self.slots[slot] else {
            return false;
        };
        self.slots[slot] = Some(Slot {
            command: new_command,
            stamp: existing.stamp,
        });
        self.heap.push(HeapEntry {
            priority: new_command.priority,
            stamp: existing.stamp,
            slot,
        });
        true
    }

    /// Enqueues `command`.
    ///
    /// If `unique` is true and a compatible pending command with the same
    /// id exists, `command` is merged into it in place (the merged entry
    /// keeps the earlier stamp, and takes the max of the two priorities),
    /// and cross-id opposite cancellation (`RelayOn` vs `RelayOff`) then
    /// runs against the resulting head command. If `unique` is false, the
    /// command is always inserted as a brand-new entry (used by the engine
    /// for retries).
    pub fn push(&mut self, command: Command, unique: bool) {
        let stamp = self.stamp_counter;
        self.stamp_counter += 1;

        if unique {
            if let Some(slot) = self.find_compatible_slot(command.id, &command) {
                let existing = self.slots[slot].expect("slot indexed but empty");
                let mut merged = existing.command;
                merged.merge(&command);
                self.slots[slot] = Some(Slot {
                    command: merged,
                    stamp: existing.stamp,
                });
                self.heap.push(HeapEntry {
                    priority: merged.priority,
                    stamp: existing.stamp,
                    slot,
                });
                self.cancel_opposite(slot);
                return;
            }
        }

        let slot = self.insert_new(command, stamp);
        if unique {
            self.cancel_opposite(slot);
        }
    }

    fn find_compatible_slot(&self, id: CommandId, incoming: &Command) -> Option<usize> {
        self.index[id_index(id)].iter().find_map(|&slot| {
            self.slots[slot].and_then(|s| {
                if s.command.is_compatible(incoming) {
                    Some(slot)
                } else {
                    None
                }
            })
        })
    }

    fn insert_new(&mut self, command: Command, stamp: u64) -> usize {
        let slot = if let Some(free) = self.free_slots.pop() {
            self.slots[free] = Some(Slot { command, stamp });
            free
        } else {
            self.slots.push(Some(Slot { command, stamp }));
            self.slots.len() - 1
        };
        self.index[id_index(command.id)].push(slot);
        self.heap.push(HeapEntry {
            priority: command.priority,
            stamp,
            slot,
        });
        self.len += 1;
        slot
    }

    /// Clears overlapping relay bits between the command that now sits in
    /// `slot` and its pending opposite (`RelayOn` <-> `RelayOff`).
    ///
    /// The overlap is removed from *both* sides: the pending opposite loses
    /// the bits the new command would otherwise re-touch, and the new
    /// command loses the bits the opposite already claims, since a relay
    /// switched on and back off (or vice versa) before either frame reaches
    /// the wire should not be touched at all. A resulting empty mask on
    /// either side leaves that command pending as a no-op rather than
    /// removing it, per the open question in the design notes.
    fn cancel_opposite(&mut self, slot: usize) {
        let Some(head) = self.slots[slot] else { return };
        let opposite_id = match head.command.id {
            CommandId::RelayOn => CommandId::RelayOff,
            CommandId::RelayOff => CommandId::RelayOn,
            _ => return,
        };
        let head_mask = head.command.mask;
        let mut overlap = 0u8;
        for &other_slot in self.index[id_index(opposite_id)].clone().iter() {
            if let Some(mut other) = self.slots[other_slot] {
                let shared = other.command.mask & head_mask;
                if shared != 0 {
                    overlap |= shared;
                    other.command.mask &= !shared;
                    self.slots[other_slot] = Some(other);
                }
            }
        }
        if overlap != 0 {
            if let Some(mut head) = self.slots[slot] {
                head.command.mask &= !overlap;
                self.slots[slot] = Some(head);
            }
        }
    }

    /// Removes and returns the pending command with the largest priority,
    /// ties broken by the smallest stamp (FIFO). Resets the stamp counter
    /// to zero once the queue becomes empty.
    pub fn pop(&mut self) -> Option<Command> {
        loop {
            let entry = self.heap.pop()?;
            let Some(slot_data) = self.slots[entry.slot] else {
                continue;
            };
            if slot_data.stamp != entry.stamp || slot_data.command.priority != entry.priority {
                continue;
            }
            self.slots[entry.slot] = None;
            self.free_slots.push(entry.slot);
            let id_vec = &mut self.index[id_index(slot_data.command.id)];
            if let Some(pos) = id_vec.iter().position(|&s| s == entry.slot) {
                id_vec.remove(pos);
            }
            self.len -= 1;
            if self.len == 0 {
                self.stamp_counter = 0;
            }
            return Some(slot_data.command);
        }
    }
}

/// `Mutex`-guarded [`PriorityQueue`] whose observable operations acquire
/// the lock for their full call, so that compatibility lookup, merge,
/// opposite cancellation and stamp assignment all happen atomically with
/// respect to other threads calling [`ConcurrentQueue::push`].
#[derive(Debug, Default)]
pub struct ConcurrentQueue {
    inner: Mutex<PriorityQueue>,
}

impl ConcurrentQueue {
    /// Create an empty concurrent queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// See [`PriorityQueue::push`].
    pub fn push(&self, command: Command, unique: bool) {
        self.inner.lock().expect("queue mutex poisoned").push(command, unique);
    }

    /// See [`PriorityQueue::pop`].
    pub fn pop(&self) -> Option<Command> {
        self.inner.lock().expect("queue mutex poisoned").pop()
    }

    /// See [`PriorityQueue::get`].
    pub fn get(&self, id: CommandId) -> Vec<Command> {
        self.inner.lock().expect("queue mutex poisoned").get(id)
    }

    /// See [`PriorityQueue::update_at`].
    pub fn update_at(&self, id: CommandId, position: usize, new_command: Command) -> bool {
        self.inner
            .lock()
            .expect("queue mutex poisoned")
            .update_at(id, position, new_command)
    }

    /// See [`PriorityQueue::empty`].
    pub fn empty(&self) -> bool {
        self.inner.lock().expect("queue mutex poisoned").empty()
    }

    /// See [`PriorityQueue::size`].
    pub fn size(&self) -> usize {
        self.inner.lock().expect("queue mutex poisoned").size()
    }

    /// See [`PriorityQueue::stamp_counter`].
    pub fn stamp_counter(&self) -> u64 {
        self.inner.lock().expect("queue mutex poisoned").stamp_counter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::RelaySet;
    use CommandId::*;

    #[test]
    fn pops_in_decreasing_priority_order() {
        let mut q = PriorityQueue::new();
        q.push(Command::with_priority(QueryRelay, 5, 0, 0, 0), false);
        q.push(Command::with_priority(QueryButtonMode, 1, 0, 0, 0), false);
        q.push(Command::with_priority(QueryJumperStatus, 3, 0, 0, 0), false);
        assert_eq!(q.pop().unwrap().id, QueryRelay);
        assert_eq!(q.pop().unwrap().id, QueryJumperStatus);
        assert_eq!(q.pop().unwrap().id, QueryButtonMode);
    }

    #[test]
    fn pops_fifo_within_equal_priority() {
        let mut q = PriorityQueue::new();
        q.push(Command::new(QueryRelay, 0, 0, 0), false);
        q.push(Command::new(QueryButtonMode, 0, 0, 0), false);
        q.push(Command::new(QueryJumperStatus, 0, 0, 0), false);
        assert_eq!(q.pop().unwrap().id, QueryRelay);
        assert_eq!(q.pop().unwrap().id, QueryButtonMode);
        assert_eq!(q.pop().unwrap().id, QueryJumperStatus);
    }

    #[test]
    fn merge_keeps_size_increase_of_one_and_single_index_entry() {
        let mut q = PriorityQueue::new();
        q.push(Command::new(RelayOn, RelaySet::relay(1).bits(), 0, 0), true);
        let size_before = q.size();
        q.push(Command::new(RelayOn, RelaySet::relay(2).bits(), 0, 0), true);
        assert_eq!(q.size(), size_before + 1);
        assert_eq!(q.get(RelayOn).len(), 1);
        assert_eq!(q.get(RelayOn)[0].relay_set(), RelaySet::relay(1) | RelaySet::relay(2));
    }

    #[test]
    fn stamp_counter_resets_when_queue_drains() {
        let mut q = PriorityQueue::new();
        q.push(Command::new(QueryRelay, 0, 0, 0), false);
        q.push(Command::new(QueryButtonMode, 0, 0, 0), false);
        assert!(q.stamp_counter() > 0);
        q.pop();
        q.pop();
        assert!(q.empty());
        assert_eq!(q.stamp_counter(), 0);
    }

    #[test]
    fn opposite_cancellation_trims_overlapping_mask() {
        let mut q = PriorityQueue::new();
        q.push(
            Command::new(RelayOn, RelaySet::relay(1).bits() | RelaySet::relay(2).bits() | RelaySet::relay(3).bits(), 0, 0),
            true,
        );
        q.push(
            Command::new(RelayOff, RelaySet::relay(2).bits() | RelaySet::relay(3).bits() | RelaySet::relay(4).bits(), 0, 0),
            true,
        );
        let first = q.pop().unwrap();
        assert_eq!(first.id, RelayOn);
        assert_eq!(first.relay_set(), RelaySet::relay(1));
        let second = q.pop().unwrap();
        assert_eq!(second.id, RelayOff);
        assert_eq!(second.relay_set(), RelaySet::relay(4));
    }

    #[test]
    fn update_at_changes_priority_for_next_pop() {
        let mut q = PriorityQueue::new();
        q.push(Command::with_priority(QueryRelay, 1, 0, 0, 0), false);
        q.push(Command::with_priority(QueryButtonMode, 1, 0, 0, 0), false);
        let updated = Command::with_priority(QueryRelay, 9, 0, 0, 0);
        assert!(q.update_at(QueryRelay, 0, updated));
        assert_eq!(q.pop().unwrap().id, QueryRelay);
        assert_eq!(q.pop().unwrap().id, QueryButtonMode);
    }
}
