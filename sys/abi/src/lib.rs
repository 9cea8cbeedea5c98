// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel ABI definitions, shared between the kernel and user programs.
//!
//! Everything a user program needs to talk to the kernel lives here: the
//! syscall request encoding, the trap classification, the numeric result
//! codes, process identity, and the compile-time configuration of the
//! machine (table sizes, tick period, memory layout).

// Allow std-y things to be used in test; everything else is core-only.
#![cfg_attr(not(test), no_std)]

use core::fmt;

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Number of process control blocks in the kernel's fixed table. PIDs are
/// assigned so that a PID maps back to its slot in constant time; see [`Pid`].
pub const PCB_TABLE_SIZE: usize = 32;

/// Number of ready queues. Priorities are `0..NUM_PRIORITIES`, 0 most urgent.
pub const NUM_PRIORITIES: usize = 4;

/// Number of signals. Signal number doubles as priority; 31 is highest and
/// reserved for termination.
pub const SIGNAL_TABLE_SIZE: usize = 32;

/// The reserved terminate signal. Its handler cannot be changed, and its
/// delivery cannot be masked by a lower handler already running.
pub const SIG_KILL: i32 = 31;

/// Per-process file descriptor table size.
pub const FD_TABLE_SIZE: usize = 4;

/// Number of records in the device table.
pub const DEVICE_TABLE_SIZE: usize = 2;

/// Timer tick period in milliseconds.
pub const TICK_MS: u32 = 10;

/// Minimum (and default) process stack allocation, in bytes.
pub const PROCESS_STACK_SIZE: u32 = 8192;

/// Stack allocation for the idle process, which needs almost none.
pub const IDLE_STACK_SIZE: u32 = 512;

/// Allocator alignment unit. Every allocation is a whole number of
/// paragraphs and starts on a paragraph boundary.
pub const PARAGRAPH_SIZE: u32 = 16;

/// Size in bytes of the IPC message word, the machine's word size.
pub const IPC_BUFFER_SIZE: u32 = 4;

/// Simulated physical memory layout. The kernel image occupies the bottom of
/// memory, a hole of reserved addresses sits where legacy device mappings
/// would, and everything else is allocatable RAM.
pub mod mem {
    /// First address past the kernel image; allocatable RAM starts here.
    pub const KERNEL_END: u32 = 0x0001_0000;
    /// First address of the reserved hole.
    pub const HOLE_START: u32 = 0x000A_0000;
    /// First address past the reserved hole.
    pub const HOLE_END: u32 = 0x0010_0000;
    /// First address past the end of physical memory.
    pub const MEM_MAX: u32 = 0x0040_0000;
}

/// Well-known addresses inside the kernel text region. User-visible code
/// (entry points, signal handlers) is addressed inside kernel text, exactly
/// as compiled function addresses were on the original machine; these three
/// are fixed shims the kernel itself plants in saved frames.
pub mod text {
    /// The signal trampoline: calls the handler, then issues sigreturn.
    pub const SIGTRAMP: u32 = 0x0000_0100;
    /// Where a returning process entry function lands; issues the stop
    /// syscall.
    pub const STOP_SHIM: u32 = 0x0000_0110;
    /// The idle loop.
    pub const IDLE_LOOP: u32 = 0x0000_0120;
    /// First address handed out for registered user program text.
    pub const USER_TEXT_BASE: u32 = 0x0000_1000;
}

/// Canonical flags word for a freshly built context frame: interrupts
/// enabled, IOPL 3.
pub const EFLAGS: u32 = 0x0000_3200;

/// The kernel code selector stored in every initial frame.
pub const CODE_SELECTOR: u32 = 0x8;

/// Names one incarnation of a process.
///
/// PIDs start at `slot + 1` for table slot `0..PCB_TABLE_SIZE`, so PID 0 can
/// name the idle process, which lives outside the table. When a slot is
/// reused the new PID is the previous plus `PCB_TABLE_SIZE`; on signed
/// overflow it wraps to `previous % PCB_TABLE_SIZE`. The slot is therefore
/// always recoverable as `(pid - 1) % PCB_TABLE_SIZE`, giving O(1) lookup,
/// and a stale PID for a reused slot will not match the slot's current PID.
/// This is the same trick as a generation number, folded into one integer.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct Pid(pub i32);

impl Pid {
    /// The idle process. Never in the PCB table, never on a queue.
    pub const IDLE: Self = Self(0);

    /// The PID a table slot yields the first time it is allocated.
    pub const fn initial_for_slot(slot: usize) -> Self {
        Self(slot as i32 + 1)
    }

    /// The value a slot is seeded with at boot: one incarnation *behind*
    /// [`Pid::initial_for_slot`], so the uniform advance in the allocator
    /// produces `slot + 1` on first use. Never observable by user code.
    pub const fn boot_seed(slot: usize) -> Self {
        Self(slot as i32 + 1 - PCB_TABLE_SIZE as i32)
    }

    /// Extracts the table slot this PID names. Meaningless for [`Pid::IDLE`].
    pub fn slot(&self) -> usize {
        (self.0 - 1).rem_euclid(PCB_TABLE_SIZE as i32) as usize
    }

    pub fn is_idle(&self) -> bool {
        self.0 == 0
    }

    /// The PID that replaces `self` when its slot is reused.
    pub fn next_incarnation(&self) -> Self {
        match self.0.checked_add(PCB_TABLE_SIZE as i32) {
            Some(p) => Self(p),
            None => Self(self.0 % PCB_TABLE_SIZE as i32),
        }
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Indicates priority of a process.
///
/// Priorities are small numbers starting from zero, and numerically lower
/// priorities are more important: the ready queues are scanned from 0 up.
/// This type deliberately does not implement `PartialOrd`, to keep us from
/// confusing "numerically greater" with "more important".
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Priority(pub u8);

impl Priority {
    /// The priority every created process starts with (the least urgent).
    pub const INITIAL: Self = Self(NUM_PRIORITIES as u8 - 1);

    /// Checks if `self` is strictly more important than `other`.
    pub fn is_more_important_than(self, other: Self) -> bool {
        self.0 < other.0
    }

    /// Validates a user-supplied priority number.
    pub fn from_i32(p: i32) -> Option<Self> {
        if (0..NUM_PRIORITIES as i32).contains(&p) {
            Some(Self(p as u8))
        } else {
            None
        }
    }
}

/// Gross process state, as reported by the status table.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum ProcState {
    Running = 0,
    Ready = 1,
    Blocked = 2,
    Stopped = 3,
}

impl TryFrom<u32> for ProcState {
    type Error = ();

    fn try_from(x: u32) -> Result<Self, Self::Error> {
        match x {
            0 => Ok(Self::Running),
            1 => Ok(Self::Ready),
            2 => Ok(Self::Blocked),
            3 => Ok(Self::Stopped),
            _ => Err(()),
        }
    }
}

/// Which kind of queue a blocked process is parked on. A blocked process is
/// on exactly one of these; everything else about the block (the peer, the
/// wake time) hangs off the PCB.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum BlockedIn {
    /// On the peer's queue of would-be senders.
    Sender = 0,
    /// On the peer's queue of would-be receivers.
    Receiver = 1,
    /// On the peer's queue of processes waiting for it to terminate.
    Wait = 2,
    /// On the global receive-any queue.
    ReceiveAny = 3,
    /// On the sleep delta list.
    Sleep = 4,
    /// Waiting for a device read to complete.
    Read = 5,
}

/// Status-table encoding of "not blocked".
pub const BLOCKED_IN_NONE: u32 = 6;

/// Encodes an optional [`BlockedIn`] the way the status table carries it.
pub fn blocked_in_code(b: Option<BlockedIn>) -> u32 {
    match b {
        Some(q) => q as u32,
        None => BLOCKED_IN_NONE,
    }
}

/// A system call request, as decoded at the trap boundary.
///
/// Pointer-typed arguments are addresses in simulated RAM; the kernel
/// validates every one of them with the memory manager's predicates before
/// dereferencing.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Syscall {
    /// Create a process running the code at `entry` with at least
    /// `stack_size` bytes of stack.
    Create { entry: u32, stack_size: u32 },
    /// Give up the CPU, staying ready.
    Yield,
    /// Terminate the calling process. Never returns.
    Stop,
    /// Report the caller's PID.
    GetPid,
    /// Print the NUL-terminated string at `text` on the console.
    Puts { text: u32 },
    /// Post `signal` to process `pid`.
    Kill { pid: i32, signal: i32 },
    /// Set the caller's priority; -1 queries without changing.
    SetPrio { priority: i32 },
    /// Send the word `message` to `dest`, rendezvous style.
    Send { dest: i32, message: u32 },
    /// Receive a word. `*from` names the sender (0 = any) on entry and
    /// carries the actual sender's PID on return; the word lands at
    /// `*buffer`.
    Recv { from: u32, buffer: u32 },
    /// Sleep for at least `ms` milliseconds.
    Sleep { ms: u32 },
    /// Fill the status table at `table`; returns the last slot written.
    GetCpuTimes { table: u32 },
    /// Install `handler` for `signal`, depositing the old handler at
    /// `old_handler`.
    SigHandler { signal: i32, handler: u32, old_handler: u32 },
    /// Return from a signal trampoline, unwinding to `old_sp`. Never
    /// returns to the caller.
    SigReturn { old_sp: u32 },
    /// Block until process `pid` terminates.
    Wait { pid: i32 },
    /// Open device `device`, yielding a file descriptor.
    Open { device: i32 },
    /// Close file descriptor `fd`.
    Close { fd: i32 },
    /// Write `len` bytes at `buffer` to `fd`.
    Write { fd: i32, buffer: u32, len: u32 },
    /// Read up to `len` bytes from `fd` into `buffer`.
    Read { fd: i32, buffer: u32, len: u32 },
    /// Device-specific control operation.
    Ioctl { fd: i32, command: u32, arg: u32 },
}

/// What pulled the CPU back into the kernel: a trap instruction carrying a
/// syscall, or a hardware interrupt.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Trap {
    Syscall(Syscall),
    /// The timer fired.
    Timer,
    /// The keyboard controller latched a scan code.
    Keyboard { scancode: u8 },
}

/// Numeric syscall results. Errors are plain negative integers on each
/// syscall path; the specific values are part of the ABI.
pub mod codes {
    /// Generic success.
    pub const OK: i32 = 0;
    /// Generic failure: bad argument, bad FD, out of resources.
    pub const SYSERR: i32 = -1;
    /// IPC peer does not exist.
    pub const NO_SUCH_PROCESS: i32 = -2;
    /// IPC directed at the caller itself.
    pub const SELF_TARGET: i32 = -3;
    /// The receive data buffer is invalid.
    pub const BAD_BUFFER: i32 = -4;
    /// The receive `from` pointer is invalid.
    pub const BAD_FROM_PTR: i32 = -5;
    /// Receive-any by the only remaining user process would sleep forever.
    pub const LAST_PROCESS: i32 = -10;
    /// Kill target does not exist.
    pub const KILL_NO_TARGET: i32 = -514;
    /// Kill signal number out of range.
    pub const KILL_BAD_SIGNAL: i32 = -583;
    /// A blocked call was cut short by signal delivery.
    pub const INTERRUPTED: i32 = -666;
    /// Driver-to-kernel sentinel: this read must block the caller.
    pub const READ_WOULD_BLOCK: i32 = -2;
    /// getcputimes: the table address is inside the reserved hole.
    pub const TABLE_IN_HOLE: i32 = -1;
    /// getcputimes: the table runs past the end of memory.
    pub const TABLE_PAST_END: i32 = -2;
}

/// Device numbers. Both records drive the same keyboard hardware; they
/// differ only in whether arriving characters are echoed. At most one of
/// the two may be open at any time.
pub const DEV_KBD_NO_ECHO: i32 = 0;
pub const DEV_KBD_ECHO: i32 = 1;

/// Keyboard ioctl commands.
pub const IOCTL_CHANGE_EOF: u32 = 53;
pub const IOCTL_ECHO_OFF: u32 = 55;
pub const IOCTL_ECHO_ON: u32 = 56;

/// EOF character a freshly opened keyboard recognizes (control-D).
pub const DEFAULT_EOF: u8 = 0x04;

/// Number of slots in the status table: every PCB plus the idle process.
pub const STATUS_SLOTS: usize = PCB_TABLE_SIZE + 1;

/// The table filled in by getcputimes, written into caller memory as raw
/// little-endian words. Slot `i` of each array describes the same process;
/// `entries` is the index of the last valid slot (always the idle process).
///
/// Fields are ordered and sized so the struct has no padding.
#[derive(Clone, Debug, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct ProcessStatuses {
    /// Index of the last slot written.
    pub entries: i32,
    /// PID per slot.
    pub pid: [i32; STATUS_SLOTS],
    /// [`ProcState`] per slot, as its wire code.
    pub state: [u32; STATUS_SLOTS],
    /// [`BlockedIn`] wire code per slot, [`BLOCKED_IN_NONE`] if runnable.
    pub blocked_in: [u32; STATUS_SLOTS],
    /// CPU time consumed, in milliseconds.
    pub cpu_time_ms: [u32; STATUS_SLOTS],
}

impl ProcessStatuses {
    pub const SIZE: usize = core::mem::size_of::<Self>();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pid_slot_round_trip() {
        for slot in 0..PCB_TABLE_SIZE {
            let pid = Pid::initial_for_slot(slot);
            assert_eq!(pid.slot(), slot);
            assert_eq!(pid.next_incarnation().slot(), slot);
            assert_eq!(Pid::boot_seed(slot).next_incarnation(), pid);
        }
    }

    #[test]
    fn pid_reuse_is_distinct() {
        let first = Pid::initial_for_slot(7);
        let second = first.next_incarnation();
        assert_ne!(first, second);
        assert_eq!(second.0, first.0 + PCB_TABLE_SIZE as i32);
    }

    #[test]
    fn priority_validation() {
        assert_eq!(Priority::from_i32(0), Some(Priority(0)));
        assert_eq!(Priority::from_i32(3), Some(Priority(3)));
        assert_eq!(Priority::from_i32(4), None);
        assert_eq!(Priority::from_i32(-1), None);
        assert!(Priority(0).is_more_important_than(Priority(3)));
        assert!(!Priority(3).is_more_important_than(Priority(3)));
    }

    #[test]
    fn status_table_is_padding_free() {
        assert_eq!(
            ProcessStatuses::SIZE,
            4 + 4 * STATUS_SLOTS * 4,
            "wire struct must stay padding-free",
        );
    }
}
