// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The dispatcher.
//!
//! [`Kernel`] owns every piece of kernel state, and [`Kernel::dispatch`] is
//! the only loop in the system: deliver any pending signal to the process
//! about to run, switch into it, classify the trap that brings control
//! back, and service it. Service routines never run concurrently with
//! anything; a routine that blocks its caller says so and the loop picks
//! the next ready process, falling back to idle.
//!
//! Scheduling is strict priority with round-robin inside a priority: the
//! ready queues are scanned from 0 up, a preempted or yielding process
//! re-enters its queue at the tail, and the idle process runs only when
//! every queue is empty.

use abi::{
    codes, BlockedIn, Pid, Priority, ProcState, Syscall, Trap,
    FD_TABLE_SIZE, PROCESS_STACK_SIZE,
};

use crate::arch::{self, Exit, UserMode};
use crate::console::Console;
use crate::kbd::Keyboard;
use crate::list;
use crate::signal;
use crate::syscalls;
use crate::task::{NextProc, ProcTable};
use crate::time::{self, DeltaList};
use crate::umem::{self, Memory};

/// What the CPU is running: a table slot, or the idle process.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Current {
    Idle,
    Proc(usize),
}

/// The kernel: all state, one mutator.
pub struct Kernel {
    pub mem: Memory,
    pub procs: ProcTable,
    pub sleepers: DeltaList,
    pub kbd: Keyboard,
    pub console: Console,
    current: Current,
    ticks: u64,
}

impl Kernel {
    pub(crate) fn new(mem: Memory, procs: ProcTable) -> Self {
        Self {
            mem,
            procs,
            sleepers: DeltaList::default(),
            kbd: Keyboard::new(),
            console: Console::new(),
            current: Current::Idle,
            ticks: 0,
        }
    }

    pub fn current(&self) -> Current {
        self.current
    }

    pub fn current_pid(&self) -> Pid {
        match self.current {
            Current::Idle => Pid::IDLE,
            Current::Proc(slot) => self.procs.procs[slot].pid,
        }
    }

    /// Saved stack pointer of the running process; the context frame the
    /// CPU resumes from lives here.
    pub fn current_esp(&self) -> u32 {
        match self.current {
            Current::Idle => self.procs.idle.esp,
            Current::Proc(slot) => self.procs.procs[slot].esp,
        }
    }

    /// The value the running process's last syscall produced, i.e. what
    /// its saved accumulator holds.
    pub fn current_result(&self) -> i32 {
        match self.current {
            Current::Idle => self.procs.idle.result_code,
            Current::Proc(slot) => self.procs.procs[slot].result_code,
        }
    }

    pub fn current_stack_base(&self) -> u32 {
        match self.current {
            Current::Idle => self.procs.idle.stack_base,
            Current::Proc(slot) => self.procs.procs[slot].stack_base,
        }
    }

    /// Timer ticks since boot.
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn user_count(&self) -> usize {
        self.procs.user_count
    }

    pub fn is_live(&self, pid: Pid) -> bool {
        self.procs.get(pid).is_some()
    }

    /// Whether the keyboard controller would raise interrupts right now.
    pub fn keyboard_interrupts_enabled(&self) -> bool {
        self.kbd.interrupts_enabled()
    }

    /// Builds a new process: validated entry point, clamped stack, initial
    /// frame wired to fall into the stop syscall on return, priority 3,
    /// ready to run. Returns its PID.
    pub fn create_process(&mut self, entry: u32, stack_size: u32) -> Option<Pid> {
        if !umem::valid_ptr(entry) {
            return None;
        }
        let stack_size = stack_size.max(PROCESS_STACK_SIZE);

        let stack_base = self.mem.alloc(stack_size)?;
        let Some(slot) = self.procs.get_unused() else {
            // PCB pool exhausted; the stack must not leak.
            self.mem.free(stack_base);
            return None;
        };

        let esp = arch::build_initial_frame(&mut self.mem, stack_base, stack_size, entry);
        let p = &mut self.procs.procs[slot];
        p.stack_base = stack_base;
        p.stack_size = stack_size;
        p.esp = esp;
        p.priority = Priority::INITIAL;
        let pid = p.pid;

        self.procs.ready(slot);
        self.procs.user_count += 1;
        klog!("created process {} (entry {:#x})", pid, entry);
        Some(pid)
    }

    /// Runs the system: the main loop of the kernel. Returns when the last
    /// user process stops, or when the CPU reports the system quiescent.
    pub fn dispatch(&mut self, cpu: &mut dyn UserMode) {
        self.pick_next();
        loop {
            if self.procs.user_count == 0 {
                klog!("no user processes remain; kernel returns");
                return;
            }
            if let Current::Proc(slot) = self.current {
                signal::deliver_pending(&mut self.procs, &mut self.mem, slot);
            }
            match cpu.context_switch(self) {
                Exit::Halt => return,
                Exit::Trap(trap) => self.service(trap),
            }
        }
    }

    /// Routes one trap to its service routine.
    fn service(&mut self, trap: Trap) {
        match trap {
            Trap::Timer => {
                self.ticks += 1;
                match self.current {
                    Current::Idle => self.procs.idle.cpu_ticks += 1,
                    Current::Proc(slot) => self.procs.procs[slot].cpu_ticks += 1,
                }
                time::tick(&mut self.procs, &mut self.sleepers);
                self.yield_current();
            }
            Trap::Keyboard { scancode } => {
                self.keyboard_isr(scancode);
                // The interrupt may have readied the reader while idle had
                // the CPU; idle never outranks a ready process.
                if self.current == Current::Idle {
                    self.pick_next();
                }
            }
            Trap::Syscall(sys) => {
                let Current::Proc(caller) = self.current else {
                    panic!("idle process issued a syscall");
                };
                self.service_syscall(caller, sys);
            }
        }
    }

    fn service_syscall(&mut self, caller: usize, sys: Syscall) {
        use Syscall::*;
        let next = match sys {
            Create { entry, stack_size } => {
                syscalls::create(self, caller, entry, stack_size);
                NextProc::Same
            }
            Yield => {
                self.yield_current();
                NextProc::Same
            }
            Stop => {
                self.cleanup(caller);
                self.pick_next();
                NextProc::Same
            }
            GetPid => {
                let p = &mut self.procs.procs[caller];
                p.result_code = p.pid.0;
                NextProc::Same
            }
            Puts { text } => {
                syscalls::puts(self, text);
                NextProc::Same
            }
            Kill { pid, signal } => {
                syscalls::kill(self, caller, pid, signal);
                NextProc::Same
            }
            SetPrio { priority } => {
                syscalls::setprio(self, caller, priority);
                NextProc::Same
            }
            Send { dest, message } => syscalls::send(self, caller, dest, message),
            Recv { from, buffer } => syscalls::recv(self, caller, from, buffer),
            Sleep { ms } => syscalls::sleep(self, caller, ms),
            GetCpuTimes { table } => {
                syscalls::getcputimes(self, caller, table);
                NextProc::Same
            }
            SigHandler { signal, handler, old_handler } => {
                syscalls::sighandler(self, caller, signal, handler, old_handler);
                NextProc::Same
            }
            SigReturn { old_sp } => {
                syscalls::sigreturn(self, caller, old_sp);
                NextProc::Same
            }
            Wait { pid } => syscalls::wait(self, caller, pid),
            Open { device } => {
                syscalls::open(self, caller, device);
                NextProc::Same
            }
            Close { fd } => {
                syscalls::close(self, caller, fd);
                NextProc::Same
            }
            Write { fd, buffer, len } => {
                syscalls::write(self, caller, fd, buffer, len);
                NextProc::Same
            }
            Read { fd, buffer, len } => syscalls::read(self, caller, fd, buffer, len),
            Ioctl { fd, command, arg } => {
                syscalls::ioctl(self, caller, fd, command, arg);
                NextProc::Same
            }
        };
        if next == NextProc::Other {
            self.pick_next();
        }
    }

    /// Puts the running process at the tail of its ready queue and picks
    /// the next one.
    fn yield_current(&mut self) {
        if let Current::Proc(slot) = self.current {
            self.procs.ready(slot);
        }
        self.pick_next();
    }

    fn pick_next(&mut self) {
        self.current = match self.procs.next() {
            Some(slot) => Current::Proc(slot),
            None => {
                self.procs.idle.state = ProcState::Running;
                Current::Idle
            }
        };
    }

    /// Destroys the process in `slot`: wakes everything blocked on it
    /// (IPC peers with −1, waiters with 0), releases its devices and
    /// stack, and recycles the PCB. A receive-any blocker left as the last
    /// user process wakes with the deadlock report.
    pub(crate) fn cleanup(&mut self, slot: usize) {
        klog!("process {} stopping", self.procs.procs[slot].pid);

        loop {
            let mut q = self.procs.procs[slot].senders;
            let peer = list::dequeue(&mut self.procs.procs, &mut q);
            self.procs.procs[slot].senders = q;
            match peer {
                Some(p) => self.procs.unblock(p, codes::SYSERR),
                None => break,
            }
        }
        loop {
            let mut q = self.procs.procs[slot].receivers;
            let peer = list::dequeue(&mut self.procs.procs, &mut q);
            self.procs.procs[slot].receivers = q;
            match peer {
                Some(p) => self.procs.unblock(p, codes::SYSERR),
                None => break,
            }
        }
        loop {
            let mut q = self.procs.procs[slot].waiters;
            let peer = list::dequeue(&mut self.procs.procs, &mut q);
            self.procs.procs[slot].waiters = q;
            match peer {
                Some(p) => self.procs.unblock(p, codes::OK),
                None => break,
            }
        }

        // A process that dies holding the keyboard must release it, or the
        // single-open rule wedges the device forever.
        if self.kbd.owner() == Some(slot) {
            self.kbd.close();
        }
        self.procs.procs[slot].fd_table = [None; FD_TABLE_SIZE];

        let stack_base = self.procs.procs[slot].stack_base;
        self.procs.stop(slot);
        self.procs.user_count -= 1;

        if self.procs.only_process() && self.procs.receive_any.len() == 1 {
            let mut q = self.procs.receive_any;
            let lonely = list::dequeue(&mut self.procs.procs, &mut q);
            self.procs.receive_any = q;
            if let Some(lonely) = lonely {
                self.procs.unblock(lonely, codes::LAST_PROCESS);
            }
        }

        self.mem.free(stack_base);
    }

    fn keyboard_isr(&mut self, scancode: u8) {
        if !self.kbd.interrupts_enabled() {
            // Stray byte with the controller quiesced; drop it.
            return;
        }
        klog!("kbd scan code {:#04x}", scancode);
        let outcome = self.kbd.isr(&mut self.mem, scancode);
        if let Some(c) = outcome.echo {
            self.console.putc(c);
        }
        if let Some(count) = outcome.completed {
            if let Some(owner) = self.kbd.owner() {
                if self.procs.procs[owner].blocked_in == Some(BlockedIn::Read) {
                    self.procs.unblock(owner, count);
                    self.kbd.finish_read();
                }
            }
        }
    }
}
