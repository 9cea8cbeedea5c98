// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Rendezvous message passing.
//!
//! Messages are one machine word, copied directly from sender to receiver
//! when both sides of the rendezvous have arrived. Whichever side arrives
//! first blocks: senders park on the receiver's sender queue, receivers on
//! the sender's receiver queue, and receive-any callers on one global
//! queue. No buffering, no timeouts; a blocked IPC call ends only by
//! rendezvous, peer death (result −1), or signal (result −666).
//!
//! The dispatcher validates PIDs and buffer addresses before calling in
//! here; these routines implement only the matching. A return of −1 means
//! "the caller blocked" and tells the dispatcher to reschedule; the value
//! is overwritten when the caller is eventually unblocked.

use abi::{codes, BlockedIn, IPC_BUFFER_SIZE, ProcState};

use crate::list;
use crate::task::{IpcArgs, ProcTable};
use crate::umem::Memory;

/// Kernel side of send: `caller` offers `message` to `dest`.
///
/// If `dest` is already blocked receiving from `caller` (specifically, or
/// via receive-any), the word and the sender's PID are written through the
/// receiver's captured addresses and the receiver wakes with 0. Otherwise
/// the caller parks on `dest`'s sender queue.
pub fn send(
    tab: &mut ProcTable,
    mem: &mut Memory,
    caller: usize,
    dest: usize,
    message: u32,
) -> i32 {
    if tab.remove_blocked(dest, caller, BlockedIn::Receiver)
        || tab.remove_receive_any(dest)
    {
        let IpcArgs::Recv { from, buffer } = tab.procs[dest].ipc_args else {
            panic!("receiver blocked without captured recv args");
        };
        mem.write_u32(from, tab.procs[caller].pid.0 as u32);
        mem.write_u32(buffer, message);

        tab.unblock(dest, codes::OK);
        return codes::OK;
    }

    tab.procs[caller].ipc_args = IpcArgs::Send { message };
    tab.enqueue_blocked(caller, dest, BlockedIn::Sender);
    -1
}

/// Kernel side of a directed receive: `caller` wants a word from `src`.
pub fn recv_from(
    tab: &mut ProcTable,
    mem: &mut Memory,
    caller: usize,
    src: usize,
    from: u32,
    buffer: u32,
) -> i32 {
    if tab.remove_blocked(src, caller, BlockedIn::Sender) {
        let IpcArgs::Send { message } = tab.procs[src].ipc_args else {
            panic!("sender blocked without captured send args");
        };
        mem.write_u32(buffer, message);

        tab.unblock(src, codes::OK);
        return codes::OK;
    }

    tab.procs[caller].ipc_args = IpcArgs::Recv { from, buffer };
    tab.enqueue_blocked(caller, src, BlockedIn::Receiver);
    -1
}

/// Kernel side of receive-any: the earliest blocked sender, if any, is the
/// match; otherwise the caller joins the global receive-any queue.
pub fn recv_any(
    tab: &mut ProcTable,
    mem: &mut Memory,
    caller: usize,
    from: u32,
    buffer: u32,
) -> i32 {
    let mut q = tab.procs[caller].senders;
    let sender = list::dequeue(&mut tab.procs, &mut q);
    tab.procs[caller].senders = q;

    if let Some(sender) = sender {
        let IpcArgs::Send { message } = tab.procs[sender].ipc_args else {
            panic!("sender blocked without captured send args");
        };
        mem.write_u32(buffer, message);
        mem.write_u32(from, tab.procs[sender].pid.0 as u32);

        tab.unblock(sender, codes::OK);
        return codes::OK;
    }

    tab.procs[caller].ipc_args = IpcArgs::Recv { from, buffer };
    let p = &mut tab.procs[caller];
    p.state = ProcState::Blocked;
    p.blocked_in = Some(BlockedIn::ReceiveAny);
    let mut q = tab.receive_any;
    list::enqueue(&mut tab.procs, &mut q, caller);
    tab.receive_any = q;
    -1
}

// IPC_BUFFER_SIZE is what a receive buffer must hold; the dispatcher
// validates against it before calling in here.
const _: () = assert!(IPC_BUFFER_SIZE == 4);
