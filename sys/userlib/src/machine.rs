// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The virtual CPU.
//!
//! [`Machine`] owns a booted kernel and plays the processor: it implements
//! the kernel's context-switch seam by reading the saved frame of whatever
//! process the dispatcher selected, running the user code that frame
//! resumes, and handing the resulting trap back. "User code" is a table of
//! registered [`Program`]s keyed by fake text addresses; process entry
//! points, signal handlers, and the two kernel shims (trampoline target
//! and stop shim) are all just addresses, exactly as they were compiled
//! function addresses on the real machine.
//!
//! Interrupts are injected between user instructions: an optional periodic
//! timer (in instructions, standing in for the hardware tick) and a queue
//! of keyboard scan codes, delivered only while the keyboard controller is
//! enabled. The instruction counter is also a fuel limit so a deadlocked
//! or runaway system halts instead of hanging the test process.
//!
//! Per process, the machine keeps a stack of live program activations
//! mirroring the frames the kernel maintains on the user stack: delivering
//! a signal pushes (the saved frame at the new stack pointer resumes the
//! trampoline), sigreturn pops. The frame address is the identity that
//! ties an activation to its saved context.

use std::collections::{HashMap, VecDeque};

use abi::{text, Pid, ProcessStatuses, Syscall, Trap};
use kern::arch::{ContextFrame, Exit, SignalDeliveryContext, UserMode};
use kern::kbd::{KBCODE, KBCTL, KBSHIFT, KEY_UP, LCTL, LSHIFT};
use kern::umem::Memory;
use kern::{startup, Kernel};

use crate::{Action, Program};

/// Everything a running program may touch: its identity, its argument
/// (the interrupted-context pointer, for handlers), and user memory.
pub struct UserCtx<'a> {
    pub pid: Pid,
    /// Trampoline argument: the saved context this handler interrupted.
    /// Zero for a program's main activation.
    pub arg: u32,
    stack_base: u32,
    mem: &'a mut Memory,
}

impl UserCtx<'_> {
    /// Address of scratch space on this process's stack. Offsets count up
    /// from the base of the stack allocation, far below the live frames.
    pub fn local(&self, offset: u32) -> u32 {
        self.stack_base + offset
    }

    pub fn read_u32(&self, addr: u32) -> u32 {
        self.mem.read_u32(addr)
    }

    pub fn write_u32(&mut self, addr: u32, v: u32) {
        self.mem.write_u32(addr, v);
    }

    pub fn read_i32(&self, addr: u32) -> i32 {
        self.mem.read_i32(addr)
    }

    pub fn read_bytes(&self, addr: u32, len: u32) -> Vec<u8> {
        self.mem.read_bytes(addr, len).to_vec()
    }

    pub fn write_bytes(&mut self, addr: u32, bytes: &[u8]) {
        self.mem.write_bytes(addr, bytes);
    }

    /// Plants a NUL-terminated string in stack scratch space and returns
    /// its address, ready to pass to a syscall.
    pub fn stack_str(&mut self, offset: u32, s: &str) -> u32 {
        let addr = self.local(offset);
        self.mem.write_bytes(addr, s.as_bytes());
        self.mem.write_u8(addr + s.len() as u32, 0);
        addr
    }

    /// Reads back a status table deposited by getcputimes.
    pub fn read_statuses(&self, addr: u32) -> ProcessStatuses {
        self.mem.read_struct(addr)
    }
}

type Factory = Box<dyn Fn() -> Box<dyn Program>>;

/// One live activation: the program plus the address of the saved frame
/// it resumes from.
struct Activation {
    at: u32,
    arg: u32,
    program: Box<dyn Program>,
}

/// CPU-side state, split from the kernel so the two can borrow
/// independently during a context switch.
struct Cpu {
    programs: HashMap<u32, Factory>,
    next_text: u32,
    /// Live activations per PID, innermost last.
    running: HashMap<i32, Vec<Activation>>,
    /// Instructions retired.
    instret: u64,
    timer_period: Option<u64>,
    next_timer: u64,
    /// Scan codes awaiting delivery, with the instruction count they
    /// become due at.
    keys: VecDeque<(u64, u8)>,
    fuel: u64,
}

/// The simulated machine: kernel plus CPU.
pub struct Machine {
    kernel: Kernel,
    cpu: Cpu,
}

impl Machine {
    pub fn new() -> Self {
        Self {
            kernel: startup::boot(),
            cpu: Cpu {
                programs: HashMap::new(),
                next_text: text::USER_TEXT_BASE,
                running: HashMap::new(),
                instret: 0,
                timer_period: None,
                next_timer: 0,
                keys: VecDeque::new(),
                fuel: 10_000_000,
            },
        }
    }

    /// Registers a program factory and assigns it a text address, usable
    /// as a process entry point or a signal handler.
    pub fn register<P, F>(&mut self, make: F) -> u32
    where
        P: Program + 'static,
        F: Fn() -> P + 'static,
    {
        let addr = self.cpu.next_text;
        assert!(addr < abi::mem::KERNEL_END, "out of text addresses");
        self.cpu.next_text += 16;
        let factory: Factory = Box::new(move || Box::new(make()));
        self.cpu.programs.insert(addr, factory);
        addr
    }

    /// Creates a process running the program at `entry`, with the default
    /// stack.
    pub fn launch(&mut self, entry: u32) -> Pid {
        self.kernel
            .create_process(entry, 0)
            .expect("could not create process")
    }

    /// Arms the timer to fire every `period` retired instructions.
    pub fn set_timer_period(&mut self, period: u64) {
        assert!(period > 0);
        self.cpu.timer_period = Some(period);
        self.cpu.next_timer = self.cpu.instret + period;
    }

    /// Replaces the runaway-guard instruction budget.
    pub fn set_fuel(&mut self, fuel: u64) {
        self.cpu.fuel = fuel;
    }

    /// Queues the scan codes that type `s`, due immediately.
    pub fn type_str(&mut self, s: &str) {
        self.type_str_after(0, s);
    }

    /// Queues the scan codes that type `s`, deliverable once `delay` more
    /// instructions have retired. Lets a test park a reader first and
    /// type second.
    pub fn type_str_after(&mut self, delay: u64, s: &str) {
        let due = self.cpu.instret + delay;
        for b in s.bytes() {
            for code in encode_char(b) {
                self.cpu.keys.push_back((due, code));
            }
        }
    }

    /// Queues one raw scan code.
    pub fn press(&mut self, scancode: u8) {
        self.cpu.keys.push_back((self.cpu.instret, scancode));
    }

    /// Runs until the kernel returns: last process stopped, system
    /// quiescent, or out of fuel.
    pub fn run(&mut self) {
        self.kernel.dispatch(&mut self.cpu);
    }

    pub fn kernel(&self) -> &Kernel {
        &self.kernel
    }

    pub fn kernel_mut(&mut self) -> &mut Kernel {
        &mut self.kernel
    }

    /// The console transcript: `puts` output and keyboard echo.
    pub fn console(&self) -> &str {
        self.kernel.console.contents()
    }

    pub fn instructions_retired(&self) -> u64 {
        self.cpu.instret
    }
}

impl Default for Machine {
    fn default() -> Self {
        Self::new()
    }
}

impl UserMode for Cpu {
    fn context_switch(&mut self, kernel: &mut Kernel) -> Exit {
        loop {
            if self.instret >= self.fuel {
                log::warn!("machine out of fuel; halting");
                return Exit::Halt;
            }

            // Interrupts are sampled before each user instruction.
            if let Some(period) = self.timer_period {
                if self.instret >= self.next_timer {
                    self.next_timer = self.instret + period;
                    return Exit::Trap(Trap::Timer);
                }
            }
            if kernel.keyboard_interrupts_enabled() {
                if let Some(&(due, scancode)) = self.keys.front() {
                    if due <= self.instret {
                        self.keys.pop_front();
                        return Exit::Trap(Trap::Keyboard { scancode });
                    }
                }
            }

            let pid = kernel.current_pid();
            if pid.is_idle() {
                // The idle loop spins. If nothing can ever interrupt it,
                // the system is quiescent and a simulation should say so.
                let event_possible = self.timer_period.is_some()
                    || (kernel.keyboard_interrupts_enabled()
                        && !self.keys.is_empty());
                if !event_possible {
                    return Exit::Halt;
                }
                self.instret += 1;
                continue;
            }

            // Reap program images of dead processes before (possibly)
            // instantiating one for a recycled PID.
            self.running.retain(|p, _| kernel.is_live(Pid(*p)));

            let esp = kernel.current_esp();
            let result = kernel.current_result();
            let stack_base = kernel.current_stack_base();
            let activations = self.running.entry(pid.0).or_default();

            // Decide what the saved frame at `esp` resumes. Either the
            // activation we already have there, or something the kernel
            // just built: a fresh process's entry frame, or an injected
            // signal-delivery frame.
            if activations.last().map(|a| a.at) != Some(esp) {
                let frame: ContextFrame = kernel.mem.read_struct(esp);
                if frame.iret_eip == text::SIGTRAMP {
                    let sdc: SignalDeliveryContext = kernel.mem.read_struct(esp);
                    if sdc.handler == text::STOP_SHIM {
                        // The pinned terminate handler. No user code runs;
                        // the process goes straight into stop.
                        self.instret += 1;
                        return Exit::Trap(Trap::Syscall(Syscall::Stop));
                    }
                    let make = self
                        .programs
                        .get(&sdc.handler)
                        .expect("signal handler at unregistered address");
                    activations.push(Activation {
                        at: esp,
                        arg: sdc.cntx,
                        program: make(),
                    });
                } else {
                    // First run of this process.
                    let make = self
                        .programs
                        .get(&frame.iret_eip)
                        .expect("process entry at unregistered address");
                    activations.clear();
                    activations.push(Activation {
                        at: esp,
                        arg: 0,
                        program: make(),
                    });
                }
            }

            let act = activations.last_mut().expect("just ensured non-empty");
            let mut ctx = UserCtx {
                pid,
                arg: act.arg,
                stack_base,
                mem: &mut kernel.mem,
            };
            let action = act.program.resume(&mut ctx, result);
            self.instret += 1;

            match action {
                Action::Call(sys) => return Exit::Trap(Trap::Syscall(sys)),
                Action::Compute => continue,
                Action::Return => {
                    let done = activations.pop().expect("a program just ran");
                    if activations.is_empty() {
                        // The entry function returned; the planted return
                        // address drops it into the stop shim.
                        return Exit::Trap(Trap::Syscall(Syscall::Stop));
                    }
                    // A handler returned; the trampoline finishes with
                    // sigreturn on the context it was given.
                    return Exit::Trap(Trap::Syscall(Syscall::SigReturn {
                        old_sp: done.arg,
                    }));
                }
            }
        }
    }
}

/// Scan codes that type `b`: a plain code, shift-wrapped, or
/// control-wrapped.
fn encode_char(b: u8) -> Vec<u8> {
    if let Some(code) = lookup(&KBCODE, b) {
        return vec![code];
    }
    if let Some(code) = lookup(&KBSHIFT, b) {
        return vec![LSHIFT, code, LSHIFT | KEY_UP];
    }
    if let Some(code) = lookup(&KBCTL, b) {
        return vec![LCTL, code, LCTL | KEY_UP];
    }
    panic!("no scan code sequence types {b:#x}");
}

fn lookup(table: &[u8], b: u8) -> Option<u8> {
    table
        .iter()
        .position(|&x| x == b && x != 0)
        .map(|i| i as u8)
}
