// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Intrusive process queues.
//!
//! Every queue in the kernel (ready queues, the stopped pool, per-PCB
//! sender/receiver/waiter queues, the receive-any queue) is a doubly linked
//! list threaded through the PCB arena: a PCB carries one `prev`/`next`
//! link pair, and a `Queue` is just head/tail slot indices plus a length.
//! A PCB is on at most one queue at a time, which is what makes the shared
//! links sound; the operations assert it.
//!
//! The doubly linked shape exists for one reason: `remove` must be O(1),
//! because signal delivery can pluck a process out of the middle of
//! whatever queue it is blocked on.

use crate::task::Pcb;

/// A queue of PCBs, by arena slot. `Copy` so that a queue embedded in a PCB
/// can be lifted out, operated on against the arena, and stored back.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Queue {
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
}

impl Queue {
    pub const EMPTY: Self = Self {
        head: None,
        tail: None,
        len: 0,
    };

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// The slot `dequeue` would return, without removing it.
    pub fn peek_head(&self) -> Option<usize> {
        self.head
    }

    /// The most recently enqueued slot.
    pub fn peek_tail(&self) -> Option<usize> {
        self.tail
    }
}

/// Adds `slot` at the tail.
pub fn enqueue(procs: &mut [Pcb], q: &mut Queue, slot: usize) {
    let p = &mut procs[slot];
    uassert!(p.prev.is_none() && p.next.is_none());

    p.prev = q.tail;
    p.next = None;
    match q.tail {
        Some(t) => procs[t].next = Some(slot),
        None => q.head = Some(slot),
    }
    q.tail = Some(slot);
    q.len += 1;
}

/// Removes and returns the head, or `None` if the queue is empty.
pub fn dequeue(procs: &mut [Pcb], q: &mut Queue) -> Option<usize> {
    let slot = q.head?;
    remove(procs, q, slot);
    Some(slot)
}

/// Unlinks `slot`, which must be on this queue, from wherever it sits.
pub fn remove(procs: &mut [Pcb], q: &mut Queue, slot: usize) {
    uassert!(q.len > 0);
    let (prev, next) = {
        let p = &procs[slot];
        (p.prev, p.next)
    };
    match prev {
        Some(s) => procs[s].next = next,
        None => {
            uassert_eq!(q.head, Some(slot));
            q.head = next;
        }
    }
    match next {
        Some(s) => procs[s].prev = prev,
        None => {
            uassert_eq!(q.tail, Some(slot));
            q.tail = prev;
        }
    }
    let p = &mut procs[slot];
    p.prev = None;
    p.next = None;
    q.len -= 1;
}

/// Slots in dequeue order.
pub fn iter<'a>(procs: &'a [Pcb], q: &Queue) -> impl Iterator<Item = usize> + 'a {
    let mut at = q.head;
    core::iter::from_fn(move || {
        let slot = at?;
        at = procs[slot].next;
        Some(slot)
    })
}
