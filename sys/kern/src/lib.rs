// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Didact kernel.
//!
//! This is an educational preemptive microkernel for a simulated single-CPU,
//! x86-class machine. It manages a bounded table of processes, schedules
//! them by priority with round-robin within a priority, and mediates
//! rendezvous message passing, sleeping, prioritized signal delivery, and a
//! small device subsystem fronting one keyboard.
//!
//! The kernel is single-threaded and cooperative internally: a process traps
//! in (syscall, timer, or keyboard interrupt), the dispatcher services the
//! trap to completion while mutating kernel state, and then re-selects a
//! process. Nothing outside the dispatcher mutates kernel state.
//!
//! # Design principles
//!
//! 1. Simple and clear algorithms over fast and clever ones. Everything here
//!    is O(table size) at worst and most paths are O(1).
//! 2. Static configuration: table sizes, the memory layout, and the tick
//!    period are compile-time constants in the `abi` crate.
//! 3. Safe code only. User "memory" is a byte array owned by the kernel, so
//!    even hostile user pointers can at worst corrupt user-visible bytes,
//!    never kernel structures.
//! 4. All user pointers are allegations. They pass through the memory
//!    manager's validity predicates before the kernel dereferences them.

/// Asserts an internal kernel invariant. Failure here means the kernel
/// itself is broken, which is the only condition that may panic.
macro_rules! uassert {
    ($cond:expr) => {
        assert!($cond)
    };
    ($cond:expr, $($t:tt)*) => {
        assert!($cond, $($t)*)
    };
}

macro_rules! uassert_eq {
    ($left:expr, $right:expr) => {
        assert_eq!($left, $right)
    };
}

/// Kernel trace logging, through the `log` facade. The library installs no
/// logger; embedders that want boot and lifecycle chatter can.
macro_rules! klog {
    ($($t:tt)*) => {
        log::trace!($($t)*)
    };
}

pub mod arch;
pub mod console;
pub mod dev;
pub mod disp;
pub mod ipc;
pub mod kbd;
pub mod list;
pub mod signal;
pub mod startup;
pub mod syscalls;
pub mod task;
pub mod time;
pub mod umem;

pub use disp::Kernel;
