// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! User program support library.
//!
//! This contains the user-side half of the system: syscall stubs, the
//! [`Program`] model user code is written in, the [`Script`] builder most
//! programs use, and the [`Machine`] that stands in for the CPU, running
//! programs against the kernel and injecting interrupts. It re-exports the
//! `abi` crate that is shared with the kernel.
//!
//! # Writing a program
//!
//! A program is anything that can be resumed: handed the result of its
//! previous syscall, it performs some user-space work and produces its
//! next [`Action`] -- another syscall, one unit of computation, or a
//! return (which lands in the stop syscall, exactly as a process entry
//! function returning does). [`Script`] chains closures into that shape:
//!
//! ```
//! use userlib::{sys_puts, sys_yield, Machine, Script};
//!
//! let mut m = Machine::new();
//! let entry = m.register(|| {
//!     Script::new()
//!         .op(|ctx, _| {
//!             let s = ctx.stack_str(0, "hello\n");
//!             sys_puts(s)
//!         })
//!         .op(|_, _| sys_yield())
//! });
//! m.launch(entry);
//! m.run();
//! assert_eq!(m.console(), "hello\n");
//! ```

pub use abi::*;

mod machine;
mod script;

pub use machine::{Machine, UserCtx};
pub use script::Script;

/// What a resumed program does next.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Action {
    /// Trap into the kernel with a syscall.
    Call(Syscall),
    /// Execute one instruction's worth of user computation.
    Compute,
    /// Return from the current function: a program falls into the stop
    /// shim, a signal handler returns to the trampoline.
    Return,
}

/// A resumable user program (or signal handler).
pub trait Program {
    /// Continues execution. `result` is the value the last syscall left in
    /// the saved accumulator; on a program's first resume it is whatever
    /// the freshly built frame held (zero).
    fn resume(&mut self, ctx: &mut UserCtx<'_>, result: i32) -> Action;
}

// ===== syscall stubs =====
//
// Each stub packages its arguments the way the trap gate expects them.
// Programs return these from their steps.

pub fn sys_create(entry: u32, stack_size: u32) -> Action {
    Action::Call(Syscall::Create { entry, stack_size })
}

pub fn sys_yield() -> Action {
    Action::Call(Syscall::Yield)
}

pub fn sys_stop() -> Action {
    Action::Call(Syscall::Stop)
}

pub fn sys_getpid() -> Action {
    Action::Call(Syscall::GetPid)
}

pub fn sys_puts(text: u32) -> Action {
    Action::Call(Syscall::Puts { text })
}

pub fn sys_kill(pid: Pid, signal: i32) -> Action {
    Action::Call(Syscall::Kill { pid: pid.0, signal })
}

pub fn sys_setprio(priority: i32) -> Action {
    Action::Call(Syscall::SetPrio { priority })
}

pub fn sys_send(dest: Pid, message: u32) -> Action {
    Action::Call(Syscall::Send { dest: dest.0, message })
}

pub fn sys_recv(from: u32, buffer: u32) -> Action {
    Action::Call(Syscall::Recv { from, buffer })
}

pub fn sys_sleep(ms: u32) -> Action {
    Action::Call(Syscall::Sleep { ms })
}

pub fn sys_getcputimes(table: u32) -> Action {
    Action::Call(Syscall::GetCpuTimes { table })
}

pub fn sys_sighandler(signal: i32, handler: u32, old_handler: u32) -> Action {
    Action::Call(Syscall::SigHandler { signal, handler, old_handler })
}

pub fn sys_sigreturn(old_sp: u32) -> Action {
    Action::Call(Syscall::SigReturn { old_sp })
}

pub fn sys_wait(pid: Pid) -> Action {
    Action::Call(Syscall::Wait { pid: pid.0 })
}

pub fn sys_open(device: i32) -> Action {
    Action::Call(Syscall::Open { device })
}

pub fn sys_close(fd: i32) -> Action {
    Action::Call(Syscall::Close { fd })
}

pub fn sys_write(fd: i32, buffer: u32, len: u32) -> Action {
    Action::Call(Syscall::Write { fd, buffer, len })
}

pub fn sys_read(fd: i32, buffer: u32, len: u32) -> Action {
    Action::Call(Syscall::Read { fd, buffer, len })
}

pub fn sys_ioctl(fd: i32, command: u32, arg: u32) -> Action {
    Action::Call(Syscall::Ioctl { fd, command, arg })
}
