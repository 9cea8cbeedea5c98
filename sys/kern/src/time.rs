// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The sleep device and its delta list.
//!
//! Sleeping processes sit on a singly linked list ordered by wake time,
//! where each node's `key` is the delay *relative to its predecessor's
//! wake*. The head's key is the only thing the timer touches: one decrement
//! per tick advances every sleeper at once. Insertion walks until the
//! cumulative delay would pass the new delay and subtracts itself from the
//! successor, so prefix sums of keys are absolute wake times throughout.
//!
//! Removal from the middle (a signal cutting a sleep short) splices the
//! node out, gives its key to the successor, and reports the *absolute*
//! remaining ticks, which becomes the interrupted syscall's result.

use abi::{BlockedIn, ProcState, TICK_MS};

use crate::task::{Pcb, ProcTable};

/// The list of sleeping processes. Uses the PCBs' intrusive `next` links
/// and `key` fields; `prev` is unused because removal already has to walk
/// for the key sum.
#[derive(Copy, Clone, Debug, Default)]
pub struct DeltaList {
    head: Option<usize>,
    len: usize,
}

impl DeltaList {
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn peek(&self) -> Option<usize> {
        self.head
    }
}

/// Adds `slot` with `delay` ticks. Equal wake times keep insertion order,
/// so earlier sleepers wake first.
pub fn insert(procs: &mut [Pcb], list: &mut DeltaList, slot: usize, delay: i32) {
    uassert!(delay >= 0);
    uassert!(procs[slot].next.is_none());

    let mut delay = delay;
    let mut prev: Option<usize> = None;
    let mut cursor = list.head;
    while let Some(at) = cursor {
        if delay < procs[at].key {
            // Insert before `at`, which now waits relative to us.
            procs[slot].key = delay;
            procs[slot].next = Some(at);
            match prev {
                Some(p) => procs[p].next = Some(slot),
                None => list.head = Some(slot),
            }
            procs[at].key -= delay;
            list.len += 1;
            return;
        }
        delay -= procs[at].key;
        prev = Some(at);
        cursor = procs[at].next;
    }

    // Ran off the end: new tail.
    procs[slot].key = delay;
    procs[slot].next = None;
    match prev {
        Some(p) => procs[p].next = Some(slot),
        None => list.head = Some(slot),
    }
    list.len += 1;
}

/// Removes and returns the head. The removed key is folded into the new
/// head so absolute wake times are preserved.
pub fn poll(procs: &mut [Pcb], list: &mut DeltaList) -> Option<usize> {
    let slot = list.head?;
    let next = procs[slot].next;
    list.head = next;
    if let Some(n) = next {
        procs[n].key += procs[slot].key;
    }
    procs[slot].next = None;
    list.len -= 1;
    Some(slot)
}

/// Splices `slot` out of the list and returns the absolute ticks it had
/// left to sleep.
pub fn remove(procs: &mut [Pcb], list: &mut DeltaList, slot: usize) -> i32 {
    uassert!(list.len > 0);

    if list.head == Some(slot) {
        poll(procs, list);
        return procs[slot].key;
    }

    let mut prev = list.head.expect("non-empty list has a head");
    let mut acc = procs[prev].key;
    let mut cursor = procs[prev].next;
    while let Some(at) = cursor {
        if at == slot {
            procs[prev].next = procs[at].next;
            if let Some(n) = procs[at].next {
                procs[n].key += procs[at].key;
            }
            procs[at].next = None;
            list.len -= 1;
            return acc + procs[at].key;
        }
        acc += procs[at].key;
        prev = at;
        cursor = procs[at].next;
    }
    panic!("process not on the delta list");
}

/// Converts a sleep request to ticks, rounding up so a process never wakes
/// early.
pub fn ms_to_ticks(ms: u32) -> i32 {
    ms.div_ceil(TICK_MS) as i32
}

/// Parks `slot` on the delta list for at least `ms` milliseconds.
pub fn sleep(tab: &mut ProcTable, list: &mut DeltaList, slot: usize, ms: u32) {
    insert(&mut tab.procs, list, slot, ms_to_ticks(ms));
    let p = &mut tab.procs[slot];
    p.state = ProcState::Blocked;
    p.blocked_in = Some(BlockedIn::Sleep);
}

/// One timer tick: ages the head and wakes everything now due, each with
/// result 0.
pub fn tick(tab: &mut ProcTable, list: &mut DeltaList) {
    let Some(head) = list.peek() else { return };
    tab.procs[head].key -= 1;
    while let Some(head) = list.peek() {
        if tab.procs[head].key > 0 {
            break;
        }
        let woke = poll(&mut tab.procs, list).expect("peeked head exists");
        tab.unblock(woke, 0);
    }
}
