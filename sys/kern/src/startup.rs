// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel bring-up.
//!
//! Initialization happens in dependency order: the memory manager first
//! (everything allocates from it), then the process table, then the idle
//! process, whose PCB lives outside the table and is never enqueued. The
//! embedder creates the first user process afterwards and enters
//! [`Kernel::dispatch`].

use abi::{text, Pid, ProcState, IDLE_STACK_SIZE};

use crate::arch;
use crate::disp::Kernel;
use crate::task::ProcTable;
use crate::umem::Memory;

/// Brings the kernel to the point where processes can be created: all
/// subsystems initialized, idle process built, nothing running.
pub fn boot() -> Kernel {
    klog!("boot: memory manager");
    let mem = Memory::new();

    klog!("boot: process table");
    let procs = ProcTable::new();

    let mut kernel = Kernel::new(mem, procs);

    klog!("boot: idle process");
    let stack_base = kernel
        .mem
        .alloc(IDLE_STACK_SIZE)
        .expect("fresh memory cannot fail the idle stack");
    let esp = arch::build_initial_frame(
        &mut kernel.mem,
        stack_base,
        IDLE_STACK_SIZE,
        text::IDLE_LOOP,
    );
    let idle = &mut kernel.procs.idle;
    idle.pid = Pid::IDLE;
    idle.state = ProcState::Ready;
    idle.stack_base = stack_base;
    idle.stack_size = IDLE_STACK_SIZE;
    idle.esp = esp;

    klog!("boot: complete");
    kernel
}

#[cfg(test)]
mod tests {
    use super::*;
    use abi::PCB_TABLE_SIZE;

    #[test]
    fn boot_produces_an_empty_quiet_system() {
        let kernel = boot();
        assert_eq!(kernel.user_count(), 0);
        assert_eq!(kernel.procs.stopped.len(), PCB_TABLE_SIZE);
        assert!(kernel.sleepers.is_empty());
        assert!(!kernel.keyboard_interrupts_enabled());
        assert_eq!(kernel.procs.idle.pid, Pid::IDLE);
        // The idle process has a real frame but sits on no queue.
        assert_ne!(kernel.procs.idle.esp, 0);
        assert!(kernel.procs.idle.prev.is_none());
        assert!(kernel.procs.idle.next.is_none());
    }

    #[test]
    fn first_process_gets_pid_one() {
        let mut kernel = boot();
        let pid = kernel.create_process(text::USER_TEXT_BASE, 0).unwrap();
        assert_eq!(pid, Pid(1));
        assert_eq!(kernel.user_count(), 1);
    }
}
