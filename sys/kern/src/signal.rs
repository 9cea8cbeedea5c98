// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Prioritized signal delivery.
//!
//! Thirty-two signals, numbered 0..31, where the number *is* the priority:
//! among pending signals the highest number is delivered first, and a
//! handler may only be preempted by a strictly higher signal. Signal 31 is
//! the non-maskable terminate: its handler slot is pinned to the stop shim
//! and can be neither replaced nor ignored.
//!
//! Delivery works by rewriting the target's user stack. The kernel pushes a
//! [`SignalDeliveryContext`]: a context frame that resumes in the signal
//! trampoline, the handler address and the interrupted context pointer as
//! the trampoline's arguments, and the two words sigreturn needs to undo
//! everything (the previous delivery level and the interrupted syscall's
//! result). The trampoline runs in user space: it calls the handler, then
//! issues sigreturn, which restores the saved stack pointer, result, and
//! delivery level.
//!
//! Posting a signal to a *blocked* process yanks it off whatever queue it
//! occupies. What the interrupted syscall returns depends on the queue:
//! −666 generically, time-remaining for sleep, bytes-transferred for read.

use abi::{codes, text, BlockedIn, ProcState, SIGNAL_TABLE_SIZE, TICK_MS};

use crate::arch::SignalDeliveryContext;
use crate::kbd::Keyboard;
use crate::task::ProcTable;
use crate::time::{self, DeltaList};
use crate::umem::Memory;

pub fn set_bit(mask: u32, signal: i32) -> u32 {
    mask | (1u32 << signal)
}

pub fn clear_bit(mask: u32, signal: i32) -> u32 {
    mask & !(1u32 << signal)
}

pub fn is_bit_set(mask: u32, signal: i32) -> bool {
    (mask >> signal) & 1 == 1
}

/// Highest-numbered signal in `mask`, or -1 if the mask is empty.
fn highest_pending(mask: u32) -> i32 {
    31 - mask.leading_zeros() as i32
}

/// Registers `signal` for delivery to the process in `slot`.
///
/// The target's existence has already been established by the dispatcher
/// (a missing target is −514 there). An out-of-range number is −583. A
/// signal whose handler slot is empty is silently dropped: registering no
/// handler *is* how a process opts out. A blocked target is unblocked
/// immediately with the queue-specific result.
pub fn post(
    tab: &mut ProcTable,
    sleepers: &mut DeltaList,
    kbd: &mut Keyboard,
    slot: usize,
    signal: i32,
) -> i32 {
    if !(0..SIGNAL_TABLE_SIZE as i32).contains(&signal) {
        return codes::KILL_BAD_SIGNAL;
    }
    if tab.procs[slot].signal_table[signal as usize] == 0 {
        // Delivery disabled for this signal; ignore the post entirely.
        return codes::OK;
    }

    tab.procs[slot].pending_signals =
        set_bit(tab.procs[slot].pending_signals, signal);
    klog!("signal {} pending for {}", signal, tab.procs[slot].pid);

    if tab.procs[slot].state == ProcState::Blocked {
        unblock_on_signal(tab, sleepers, kbd, slot);
        tab.ready(slot);
    }
    codes::OK
}

/// Removes a blocked process from whichever queue holds it and writes the
/// result its interrupted syscall will report.
fn unblock_on_signal(
    tab: &mut ProcTable,
    sleepers: &mut DeltaList,
    kbd: &mut Keyboard,
    slot: usize,
) {
    uassert_eq!(tab.procs[slot].state, ProcState::Blocked);

    let result = match tab.procs[slot].blocked_in {
        Some(which @ (BlockedIn::Sender | BlockedIn::Receiver | BlockedIn::Wait)) => {
            let on = tab.procs[slot]
                .blocked_on
                .expect("peer-blocked process has a peer");
            let removed = tab.remove_blocked(slot, on, which);
            uassert!(removed);
            codes::INTERRUPTED
        }
        Some(BlockedIn::ReceiveAny) => {
            let removed = tab.remove_receive_any(slot);
            uassert!(removed);
            codes::INTERRUPTED
        }
        Some(BlockedIn::Sleep) => {
            let ticks_left = time::remove(&mut tab.procs, sleepers, slot);
            ticks_left * TICK_MS as i32
        }
        Some(BlockedIn::Read) => {
            // Report what already landed in the caller's buffer, and stop
            // the driver from touching that buffer again.
            let transferred = kbd.cancel_pending_read();
            if transferred == 0 {
                codes::INTERRUPTED
            } else {
                transferred as i32
            }
        }
        None => panic!("blocked process is on no blocked queue"),
    };
    tab.procs[slot].result_code = result;
    tab.procs[slot].blocked_on = None;
    tab.procs[slot].blocked_in = None;
}

/// Delivers the highest pending signal to the process about to run, if it
/// outranks whatever handler is already on that process's stack.
///
/// Delivery: clear the pending bit, push a [`SignalDeliveryContext`] below
/// the saved stack pointer, and point the saved context at the trampoline.
/// Lower-numbered signals stay pending until sigreturn lowers the delivery
/// level again.
pub fn deliver_pending(tab: &mut ProcTable, mem: &mut Memory, slot: usize) {
    let p = &mut tab.procs[slot];
    let signal = highest_pending(p.pending_signals);
    if signal == -1 || signal <= p.last_signal_delivered {
        return;
    }
    p.pending_signals = clear_bit(p.pending_signals, signal);

    let old_esp = p.esp;
    let new_esp = old_esp - SignalDeliveryContext::SIZE;
    uassert!(new_esp >= p.stack_base, "signal frame would overflow stack");

    let mut sdc = SignalDeliveryContext::default();
    sdc.frame.ebp = new_esp + crate::arch::CONTEXT_FRAME_SIZE;
    sdc.frame.iret_eip = text::SIGTRAMP;
    sdc.frame.iret_cs = abi::CODE_SELECTOR;
    sdc.frame.eflags = abi::EFLAGS;
    sdc.handler = p.signal_table[signal as usize];
    // The interrupted context starts where the stack pointer used to be.
    sdc.cntx = old_esp;
    sdc.last_signal_delivered = p.last_signal_delivered;
    sdc.saved_result_code = p.result_code;

    p.esp = new_esp;
    p.last_signal_delivered = signal;
    klog!("delivering signal {} to {}", signal, p.pid);

    mem.write_struct(new_esp, &sdc);
}
