// Copyright 2024 SuperHID Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Queue of interrupt IN requests waiting for an input report.
//!
//! The guest keeps a handful of interrupt transfers parked on the ring;
//! each becomes an entry here until a report completes it. Cancelled
//! entries are tombstoned in place so completion order is preserved.

use thiserror::Error;

/// Slot count of the queue. One slot is kept free to distinguish full from
/// empty, so at most `PENDING_CAPACITY - 1` entries are live at once.
pub const PENDING_CAPACITY: usize = 32;

#[derive(Error, Debug, PartialEq, Eq)]
#[error("Pending request queue is full")]
pub struct QueueFull;

/// One parked interrupt request: where the report payload must land.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PendingEntry {
    pub id: u64,
    pub gref: u32,
    pub offset: u16,
}

pub struct PendingQueue {
    slots: [Option<PendingEntry>; PENDING_CAPACITY],
    head: usize,
    tail: usize,
}

impl Default for PendingQueue {
    fn default() -> Self {
        PendingQueue::new()
    }
}

impl PendingQueue {
    pub fn new() -> Self {
        PendingQueue {
            slots: [None; PENDING_CAPACITY],
            head: 0,
            tail: 0,
        }
    }

    pub fn enqueue(&mut self, entry: PendingEntry) -> Result<(), QueueFull> {
        let next = (self.tail + 1) % PENDING_CAPACITY;
        if next == self.head {
            return Err(QueueFull);
        }
        self.slots[self.tail] = Some(entry);
        self.tail = next;
        Ok(())
    }

    /// Tombstones the entry with the given request id. Returns false if no
    /// such entry is live.
    pub fn cancel(&mut self, id: u64) -> bool {
        let mut i = self.head;
        while i != self.tail {
            if self.slots[i].is_some_and(|e| e.id == id) {
                self.slots[i] = None;
                return true;
            }
            i = (i + 1) % PENDING_CAPACITY;
        }
        false
    }

    /// Oldest live entry, if any. Leaves the entry queued.
    pub fn front(&mut self) -> Option<PendingEntry> {
        self.skip_tombstones();
        if self.head == self.tail {
            return None;
        }
        self.slots[self.head]
    }

    /// Removes and returns the oldest live entry.
    pub fn pop_front(&mut self) -> Option<PendingEntry> {
        let entry = self.front()?;
        self.slots[self.head] = None;
        self.head = (self.head + 1) % PENDING_CAPACITY;
        Some(entry)
    }

    /// True if at least one non-cancelled entry is queued.
    pub fn has_live(&mut self) -> bool {
        self.front().is_some()
    }

    pub fn live_count(&self) -> usize {
        let mut n = 0;
        let mut i = self.head;
        while i != self.tail {
            if self.slots[i].is_some() {
                n += 1;
            }
            i = (i + 1) % PENDING_CAPACITY;
        }
        n
    }

    fn skip_tombstones(&mut self) {
        while self.head != self.tail && self.slots[self.head].is_none() {
            self.head = (self.head + 1) % PENDING_CAPACITY;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: u64) -> PendingEntry {
        PendingEntry {
            id,
            gref: 100 + id as u32,
            offset: 0,
        }
    }

    #[test]
    fn test_fifo_order() {
        let mut q = PendingQueue::new();
        q.enqueue(entry(1)).unwrap();
        q.enqueue(entry(2)).unwrap();
        q.enqueue(entry(3)).unwrap();
        assert_eq!(q.pop_front().unwrap().id, 1);
        assert_eq!(q.pop_front().unwrap().id, 2);
        assert_eq!(q.pop_front().unwrap().id, 3);
        assert!(q.pop_front().is_none());
    }

    #[test]
    fn test_full_at_capacity_minus_one() {
        let mut q = PendingQueue::new();
        for i in 0..PENDING_CAPACITY as u64 - 1 {
            q.enqueue(entry(i)).unwrap();
        }
        assert_eq!(q.enqueue(entry(99)), Err(QueueFull));
        assert_eq!(q.live_count(), PENDING_CAPACITY - 1);
        // Draining one slot makes room again.
        assert_eq!(q.pop_front().unwrap().id, 0);
        q.enqueue(entry(99)).unwrap();
    }

    #[test]
    fn test_cancel_tombstones_in_place() {
        let mut q = PendingQueue::new();
        q.enqueue(entry(1)).unwrap();
        q.enqueue(entry(2)).unwrap();
        q.enqueue(entry(3)).unwrap();
        assert!(q.cancel(2));
        assert!(!q.cancel(2));
        assert!(!q.cancel(42));
        assert_eq!(q.live_count(), 2);
        assert_eq!(q.pop_front().unwrap().id, 1);
        // The tombstone is skipped, not completed.
        assert_eq!(q.pop_front().unwrap().id, 3);
        assert!(q.pop_front().is_none());
    }

    #[test]
    fn test_cancelled_head_is_skipped() {
        let mut q = PendingQueue::new();
        q.enqueue(entry(1)).unwrap();
        q.enqueue(entry(2)).unwrap();
        assert!(q.cancel(1));
        assert!(q.has_live());
        assert_eq!(q.front().unwrap().id, 2);
    }

    #[test]
    fn test_all_cancelled_is_empty() {
        let mut q = PendingQueue::new();
        q.enqueue(entry(1)).unwrap();
        assert!(q.cancel(1));
        assert!(!q.has_live());
        assert!(q.pop_front().is_none());
    }

    #[test]
    fn test_wraps_around_storage() {
        let mut q = PendingQueue::new();
        for round in 0..3u64 {
            for i in 0..20 {
                q.enqueue(entry(round * 100 + i)).unwrap();
            }
            for i in 0..20 {
                assert_eq!(q.pop_front().unwrap().id, round * 100 + i);
            }
        }
        assert!(!q.has_live());
    }
}
