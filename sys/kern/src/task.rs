// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Process control blocks and the scheduler's bookkeeping.
//!
//! All processes live in a fixed arena of [`PCB_TABLE_SIZE`] PCBs, addressed
//! by slot index. PIDs map back to slots in O(1); see [`abi::Pid`] for the
//! reuse scheme. The arena plus per-queue head/tail records replace the
//! classic pointer-linked PCB lists: a PCB's intrusive links can serve any
//! queue because a PCB is on at most one queue at a time.
//!
//! The idle process is a PCB *outside* the arena. It has PID 0, is never on
//! any queue, and is chosen only when every ready queue is empty.

use abi::{
    BlockedIn, Pid, Priority, ProcState, FD_TABLE_SIZE, NUM_PRIORITIES,
    PCB_TABLE_SIZE, SIGNAL_TABLE_SIZE, SIG_KILL,
};

use crate::list::{self, Queue};

/// Arguments captured from a trap that may finish long after the caller
/// blocked. The rendezvous partner reads them at match time.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum IpcArgs {
    #[default]
    None,
    /// A sender's pending message word.
    Send { message: u32 },
    /// A receiver's destination addresses: the sender-PID slot and the
    /// message buffer.
    Recv { from: u32, buffer: u32 },
}

/// One process control block.
#[derive(Debug)]
pub struct Pcb {
    pub pid: Pid,
    pub state: ProcState,
    /// Intrusive queue links, shared by every queue and the delta list.
    pub prev: Option<usize>,
    pub next: Option<usize>,
    /// Base and size of the allocated stack, 0 before first use.
    pub stack_base: u32,
    pub stack_size: u32,
    /// Saved user stack pointer; the context frame sits here.
    pub esp: u32,
    /// Saved accumulator: the syscall result delivered on resume.
    pub result_code: i32,
    pub priority: Priority,
    /// Which queue kind this PCB is blocked on, if any.
    pub blocked_in: Option<BlockedIn>,
    /// Slot of the process this one is blocked on; set exactly for
    /// Sender/Receiver/Wait blocks.
    pub blocked_on: Option<usize>,
    /// Processes waiting to send to this one.
    pub senders: Queue,
    /// Processes waiting to receive from this one.
    pub receivers: Queue,
    /// Processes waiting for this one to terminate.
    pub waiters: Queue,
    /// Trap arguments held across a block.
    pub ipc_args: IpcArgs,
    /// Delta-list key: ticks to wake, relative to the predecessor.
    pub key: i32,
    /// Timer ticks charged to this process.
    pub cpu_ticks: u32,
    /// Handler address per signal; 0 disables the signal. Slot 31 is pinned
    /// to the stop shim.
    pub signal_table: [u32; SIGNAL_TABLE_SIZE],
    /// One bit per signal awaiting delivery.
    pub pending_signals: u32,
    /// Highest signal currently being handled, -1 if none. Only strictly
    /// higher signals may be delivered over it.
    pub last_signal_delivered: i32,
    /// Open devices, by device-table index.
    pub fd_table: [Option<usize>; FD_TABLE_SIZE],
}

impl Pcb {
    /// A boot-state PCB for `slot`: stopped, seeded one PID generation back
    /// so that the first allocation of the slot yields PID `slot + 1`.
    pub fn new(slot: usize) -> Self {
        Self {
            pid: Pid::boot_seed(slot),
            state: ProcState::Stopped,
            prev: None,
            next: None,
            stack_base: 0,
            stack_size: 0,
            esp: 0,
            result_code: 0,
            priority: Priority::INITIAL,
            blocked_in: None,
            blocked_on: None,
            senders: Queue::EMPTY,
            receivers: Queue::EMPTY,
            waiters: Queue::EMPTY,
            ipc_args: IpcArgs::None,
            key: 0,
            cpu_ticks: 0,
            signal_table: [0; SIGNAL_TABLE_SIZE],
            pending_signals: 0,
            last_signal_delivered: -1,
            fd_table: [None; FD_TABLE_SIZE],
        }
    }
}

/// Return value for operations that can have scheduling implications.
/// Marked `must_use` because forgetting to reschedule after blocking the
/// caller would resume a process the kernel just parked.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[must_use]
pub enum NextProc {
    /// The caller keeps the CPU.
    Same,
    /// The caller blocked; the dispatcher must pick another process.
    Other,
}

/// The PCB arena and every scheduler-owned queue.
pub struct ProcTable {
    pub procs: Vec<Pcb>,
    /// One ready queue per priority, scanned from 0 up.
    pub ready: [Queue; NUM_PRIORITIES],
    /// Unused PCBs, recycled in FIFO order.
    pub stopped: Queue,
    /// Processes blocked in a receive-any.
    pub receive_any: Queue,
    /// The idle process; never in `procs`, never on a queue.
    pub idle: Pcb,
    /// Live user processes. The kernel shuts down when this reaches zero.
    pub user_count: usize,
}

impl ProcTable {
    pub fn new() -> Self {
        let mut tab = Self {
            procs: (0..PCB_TABLE_SIZE).map(Pcb::new).collect(),
            ready: [Queue::EMPTY; NUM_PRIORITIES],
            stopped: Queue::EMPTY,
            receive_any: Queue::EMPTY,
            idle: Pcb::new(0),
            user_count: 0,
        };
        tab.idle.pid = Pid::IDLE;
        for slot in 0..PCB_TABLE_SIZE {
            let mut q = tab.stopped;
            list::enqueue(&mut tab.procs, &mut q, slot);
            tab.stopped = q;
        }
        tab
    }

    /// O(1) PID-to-slot lookup. A PID is live iff its slot still holds it
    /// and the slot is not stopped.
    pub fn get(&self, pid: Pid) -> Option<usize> {
        if pid.0 < 1 {
            return None;
        }
        let slot = pid.slot();
        let p = &self.procs[slot];
        if p.pid == pid && p.state != ProcState::Stopped {
            Some(slot)
        } else {
            None
        }
    }

    /// Pulls a PCB from the stopped pool and readies it for a new life:
    /// next PID, zeroed accounting, default signal table (all disabled
    /// except the pinned terminate slot), cleared FD table.
    pub fn get_unused(&mut self) -> Option<usize> {
        let mut q = self.stopped;
        let slot = list::dequeue(&mut self.procs, &mut q)?;
        self.stopped = q;

        let p = &mut self.procs[slot];
        p.pid = p.pid.next_incarnation();
        uassert!(p.pid.0 >= 1);
        p.result_code = 0;
        p.cpu_ticks = 0;
        p.ipc_args = IpcArgs::None;
        p.key = 0;
        p.signal_table = [0; SIGNAL_TABLE_SIZE];
        p.signal_table[SIG_KILL as usize] = abi::text::STOP_SHIM;
        p.pending_signals = 0;
        p.last_signal_delivered = -1;
        p.fd_table = [None; FD_TABLE_SIZE];
        Some(slot)
    }

    /// Marks `slot` runnable and queues it behind its priority peers.
    pub fn ready(&mut self, slot: usize) {
        let p = &mut self.procs[slot];
        p.blocked_on = None;
        p.blocked_in = None;
        p.state = ProcState::Ready;
        let prio = p.priority.0 as usize;
        let mut q = self.ready[prio];
        list::enqueue(&mut self.procs, &mut q, slot);
        self.ready[prio] = q;
    }

    /// Writes the syscall result and readies the process.
    pub fn unblock(&mut self, slot: usize, result: i32) {
        self.procs[slot].result_code = result;
        self.ready(slot);
    }

    /// Selects the next process to run: the head of the most urgent
    /// non-empty ready queue, or `None` meaning the idle process.
    pub fn next(&mut self) -> Option<usize> {
        for prio in 0..NUM_PRIORITIES {
            let mut q = self.ready[prio];
            if let Some(slot) = list::dequeue(&mut self.procs, &mut q) {
                self.ready[prio] = q;
                self.procs[slot].state = ProcState::Running;
                return Some(slot);
            }
        }
        None
    }

    /// Returns a PCB to the stopped pool.
    pub fn stop(&mut self, slot: usize) {
        self.procs[slot].state = ProcState::Stopped;
        let mut q = self.stopped;
        list::enqueue(&mut self.procs, &mut q, slot);
        self.stopped = q;
    }

    /// Parks `slot` on one of `on`'s blocked queues.
    pub fn enqueue_blocked(&mut self, slot: usize, on: usize, which: BlockedIn) {
        let mut q = self.blocked_queue(on, which);
        list::enqueue(&mut self.procs, &mut q, slot);
        *self.blocked_queue_mut(on, which) = q;

        let p = &mut self.procs[slot];
        p.blocked_on = Some(on);
        p.blocked_in = Some(which);
        p.state = ProcState::Blocked;
    }

    /// Takes `slot` off `on`'s blocked queue of kind `which`, if that is
    /// where it is parked. Returns whether it was.
    pub fn remove_blocked(&mut self, slot: usize, on: usize, which: BlockedIn) -> bool {
        let p = &self.procs[slot];
        if p.blocked_on != Some(on) || p.blocked_in != Some(which) {
            return false;
        }
        let mut q = self.blocked_queue(on, which);
        list::remove(&mut self.procs, &mut q, slot);
        *self.blocked_queue_mut(on, which) = q;
        true
    }

    /// Takes `slot` off the receive-any queue, if that is where it is.
    pub fn remove_receive_any(&mut self, slot: usize) -> bool {
        if self.procs[slot].blocked_in != Some(BlockedIn::ReceiveAny) {
            return false;
        }
        let mut q = self.receive_any;
        list::remove(&mut self.procs, &mut q, slot);
        self.receive_any = q;
        true
    }

    /// True when the caller is the only live user process.
    pub fn only_process(&self) -> bool {
        self.user_count == 1
    }

    fn blocked_queue(&self, on: usize, which: BlockedIn) -> Queue {
        match which {
            BlockedIn::Sender => self.procs[on].senders,
            BlockedIn::Receiver => self.procs[on].receivers,
            BlockedIn::Wait => self.procs[on].waiters,
            _ => panic!("not a per-process blocked queue: {which:?}"),
        }
    }

    fn blocked_queue_mut(&mut self, on: usize, which: BlockedIn) -> &mut Queue {
        match which {
            BlockedIn::Sender => &mut self.procs[on].senders,
            BlockedIn::Receiver => &mut self.procs[on].receivers,
            BlockedIn::Wait => &mut self.procs[on].waiters,
            _ => panic!("not a per-process blocked queue: {which:?}"),
        }
    }
}

impl Default for ProcTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_allocations_count_up_from_one() {
        let mut tab = ProcTable::new();
        for expect in 1..=4 {
            let slot = tab.get_unused().unwrap();
            assert_eq!(tab.procs[slot].pid, Pid(expect));
        }
    }

    #[test]
    fn reused_slot_advances_pid_by_table_size() {
        let mut tab = ProcTable::new();
        let slot = tab.get_unused().unwrap();
        let first = tab.procs[slot].pid;
        tab.procs[slot].state = ProcState::Ready;

        // Exhaust the pool, then recycle the first slot.
        while tab.get_unused().is_some() {}
        tab.stop(slot);
        let again = tab.get_unused().unwrap();
        assert_eq!(again, slot);
        assert_eq!(
            tab.procs[slot].pid.0,
            first.0 + PCB_TABLE_SIZE as i32,
        );
    }

    #[test]
    fn lookup_rejects_stale_and_idle_pids() {
        let mut tab = ProcTable::new();
        let slot = tab.get_unused().unwrap();
        let pid = tab.procs[slot].pid;
        tab.procs[slot].state = ProcState::Ready;

        assert_eq!(tab.get(pid), Some(slot));
        assert_eq!(tab.get(Pid::IDLE), None);
        assert_eq!(tab.get(pid.next_incarnation()), None, "future PID");

        tab.stop(slot);
        assert_eq!(tab.get(pid), None, "stopped slot is not live");
    }

    #[test]
    fn next_scans_priorities_highest_first() {
        let mut tab = ProcTable::new();
        let low = tab.get_unused().unwrap();
        let high = tab.get_unused().unwrap();
        tab.procs[low].priority = Priority(3);
        tab.procs[high].priority = Priority(1);
        tab.ready(low);
        tab.ready(high);

        assert_eq!(tab.next(), Some(high));
        assert_eq!(tab.next(), Some(low));
        assert_eq!(tab.next(), None, "nothing ready means idle");
    }

    #[test]
    fn round_robin_within_a_priority() {
        let mut tab = ProcTable::new();
        let a = tab.get_unused().unwrap();
        let b = tab.get_unused().unwrap();
        tab.ready(a);
        tab.ready(b);

        let first = tab.next().unwrap();
        tab.ready(first);
        let second = tab.next().unwrap();
        assert_eq!((first, second), (a, b));
    }

    #[test]
    fn fresh_pcb_has_default_signal_table() {
        let mut tab = ProcTable::new();
        let slot = tab.get_unused().unwrap();
        let p = &tab.procs[slot];
        for sig in 0..SIGNAL_TABLE_SIZE - 1 {
            assert_eq!(p.signal_table[sig], 0, "signal {sig} starts disabled");
        }
        assert_eq!(p.signal_table[SIG_KILL as usize], abi::text::STOP_SHIM);
        assert_eq!(p.pending_signals, 0);
        assert_eq!(p.last_signal_delivered, -1);
        assert!(p.fd_table.iter().all(Option::is_none));
    }

    #[test]
    fn blocked_queue_membership_is_tracked() {
        let mut tab = ProcTable::new();
        let a = tab.get_unused().unwrap();
        let b = tab.get_unused().unwrap();
        tab.procs[a].state = ProcState::Running;
        tab.procs[b].state = ProcState::Running;

        tab.enqueue_blocked(a, b, BlockedIn::Sender);
        assert_eq!(tab.procs[a].state, ProcState::Blocked);
        assert_eq!(tab.procs[b].senders.len(), 1);

        assert!(!tab.remove_blocked(a, b, BlockedIn::Receiver), "wrong kind");
        assert!(tab.remove_blocked(a, b, BlockedIn::Sender));
        assert!(!tab.remove_blocked(a, b, BlockedIn::Sender), "already off");
        assert!(tab.procs[b].senders.is_empty());
    }
}
