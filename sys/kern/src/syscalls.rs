// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Syscall service routines.
//!
//! Each routine has the same shape: validate the caller's arguments (every
//! user pointer goes through the memory manager's predicates first), do the
//! work against kernel state, and leave the numeric result in the caller's
//! saved accumulator. Routines for calls that can block return a
//! [`NextProc`] hint; `Other` means the caller was parked and the
//! dispatcher must schedule around it.
//!
//! Result codes are ABI, not incidental: see `abi::codes` and the tables in
//! the user documentation.

use abi::mem::{HOLE_END, HOLE_START, MEM_MAX};
use abi::{
    blocked_in_code, codes, BlockedIn, Pid, Priority, ProcState,
    ProcessStatuses, IPC_BUFFER_SIZE, PCB_TABLE_SIZE, SIG_KILL, TICK_MS,
};
use zerocopy::FromZeros;

use crate::dev;
use crate::disp::{Current, Kernel};
use crate::ipc;
use crate::signal;
use crate::task::NextProc;
use crate::time;
use crate::umem;

pub(crate) fn create(k: &mut Kernel, caller: usize, entry: u32, stack_size: u32) {
    let result = match k.create_process(entry, stack_size) {
        Some(pid) => pid.0,
        None => codes::SYSERR,
    };
    k.procs.procs[caller].result_code = result;
}

pub(crate) fn puts(k: &mut Kernel, text: u32) {
    // Invalid strings are silently ignored.
    if umem::valid_ptr(text) {
        let s = k.mem.read_cstr(text, MEM_MAX);
        k.console.puts(&s);
    }
}

pub(crate) fn kill(k: &mut Kernel, caller: usize, pid: i32, sig: i32) {
    let result = match k.procs.get(Pid(pid)) {
        None => codes::KILL_NO_TARGET,
        Some(target) => {
            signal::post(&mut k.procs, &mut k.sleepers, &mut k.kbd, target, sig)
        }
    };
    k.procs.procs[caller].result_code = result;
}

pub(crate) fn setprio(k: &mut Kernel, caller: usize, requested: i32) {
    let p = &mut k.procs.procs[caller];
    let previous = p.priority.0 as i32;
    let result = match Priority::from_i32(requested) {
        Some(prio) => {
            p.priority = prio;
            previous
        }
        // -1 queries the current priority without changing it.
        None if requested == -1 => previous,
        None => codes::SYSERR,
    };
    p.result_code = result;
}

pub(crate) fn send(
    k: &mut Kernel,
    caller: usize,
    dest: i32,
    message: u32,
) -> NextProc {
    let result = if k.procs.procs[caller].pid.0 == dest {
        codes::SELF_TARGET
    } else {
        match k.procs.get(Pid(dest)) {
            None => codes::NO_SUCH_PROCESS,
            Some(dest) => {
                ipc::send(&mut k.procs, &mut k.mem, caller, dest, message)
            }
        }
    };
    k.procs.procs[caller].result_code = result;
    if result == -1 {
        // The caller parked on the destination's sender queue.
        NextProc::Other
    } else {
        NextProc::Same
    }
}

pub(crate) fn recv(k: &mut Kernel, caller: usize, from: u32, buffer: u32) -> NextProc {
    let result = if !umem::valid_buf(from, IPC_BUFFER_SIZE) {
        codes::BAD_FROM_PTR
    } else if !umem::valid_buf(buffer, IPC_BUFFER_SIZE) {
        codes::BAD_BUFFER
    } else {
        let sender_pid = k.mem.read_u32(from) as i32;
        if sender_pid == 0 {
            // Receive from anyone. The sole surviving process would wait
            // forever, which is reported instead of committed to.
            if k.procs.only_process() {
                codes::LAST_PROCESS
            } else {
                ipc::recv_any(&mut k.procs, &mut k.mem, caller, from, buffer)
            }
        } else if k.procs.procs[caller].pid.0 == sender_pid {
            codes::SELF_TARGET
        } else {
            match k.procs.get(Pid(sender_pid)) {
                None => codes::NO_SUCH_PROCESS,
                Some(src) => ipc::recv_from(
                    &mut k.procs,
                    &mut k.mem,
                    caller,
                    src,
                    from,
                    buffer,
                ),
            }
        }
    };
    k.procs.procs[caller].result_code = result;
    if result == -1 {
        NextProc::Other
    } else {
        NextProc::Same
    }
}

pub(crate) fn sleep(k: &mut Kernel, caller: usize, ms: u32) -> NextProc {
    if ms > 0 {
        time::sleep(&mut k.procs, &mut k.sleepers, caller, ms);
        NextProc::Other
    } else {
        k.procs.procs[caller].result_code = codes::OK;
        NextProc::Same
    }
}

pub(crate) fn getcputimes(k: &mut Kernel, caller: usize, table: u32) {
    let result = fill_cpu_times(k, table);
    k.procs.procs[caller].result_code = result;
}

fn fill_cpu_times(k: &mut Kernel, table: u32) -> i32 {
    // The table must not sit in the reserved hole nor run past memory.
    if (HOLE_START..=HOLE_END).contains(&table) {
        return codes::TABLE_IN_HOLE;
    }
    match table.checked_add(ProcessStatuses::SIZE as u32) {
        Some(end) if end <= MEM_MAX => {}
        _ => return codes::TABLE_PAST_END,
    }

    let mut ps = ProcessStatuses::new_zeroed();
    let mut slot = 0usize;
    for i in 0..PCB_TABLE_SIZE {
        let p = &k.procs.procs[i];
        if p.state == ProcState::Stopped {
            continue;
        }
        ps.pid[slot] = p.pid.0;
        ps.state[slot] = if k.current() == Current::Proc(i) {
            ProcState::Running as u32
        } else {
            p.state as u32
        };
        ps.blocked_in[slot] = blocked_in_code(p.blocked_in);
        ps.cpu_time_ms[slot] = p.cpu_ticks * TICK_MS;
        slot += 1;
    }
    // The idle process reports last, as PID 0.
    ps.pid[slot] = Pid::IDLE.0;
    ps.state[slot] = ProcState::Ready as u32;
    ps.blocked_in[slot] = blocked_in_code(None);
    ps.cpu_time_ms[slot] = k.procs.idle.cpu_ticks * TICK_MS;
    ps.entries = slot as i32;

    k.mem.write_struct(table, &ps);
    slot as i32
}

pub(crate) fn sighandler(
    k: &mut Kernel,
    caller: usize,
    sig: i32,
    handler: u32,
    old_handler: u32,
) {
    let result = if !(0..SIG_KILL).contains(&sig) {
        // Signal 31 is pinned; it cannot be installed over or queried.
        codes::SYSERR
    } else if handler != 0 && !umem::valid_ptr(handler) {
        -2
    } else if !umem::valid_buf(old_handler, 4) {
        -3
    } else {
        let p = &mut k.procs.procs[caller];
        let previous = p.signal_table[sig as usize];
        p.signal_table[sig as usize] = handler;
        k.mem.write_u32(old_handler, previous);
        codes::OK
    };
    k.procs.procs[caller].result_code = result;
}

pub(crate) fn sigreturn(k: &mut Kernel, caller: usize, old_sp: u32) {
    // The trampoline hands back the context pointer it was given. An
    // implausible one is ignored rather than allowed to fault the kernel.
    if old_sp < 8 || old_sp > MEM_MAX - crate::arch::CONTEXT_FRAME_SIZE {
        klog!("sigreturn with bad context {:#x}", old_sp);
        return;
    }
    let p = &mut k.procs.procs[caller];
    p.esp = old_sp;
    // The delivery frame sits directly below the restored stack pointer;
    // recover the saved result and delivery level from its last two words.
    p.result_code = k.mem.read_i32(old_sp - 4);
    p.last_signal_delivered = k.mem.read_i32(old_sp - 8);
}

pub(crate) fn wait(k: &mut Kernel, caller: usize, pid: i32) -> NextProc {
    match k.procs.get(Pid(pid)) {
        Some(target) if target != caller => {
            k.procs.enqueue_blocked(caller, target, BlockedIn::Wait);
            NextProc::Other
        }
        _ => {
            k.procs.procs[caller].result_code = codes::SYSERR;
            NextProc::Same
        }
    }
}

pub(crate) fn open(k: &mut Kernel, caller: usize, device_no: i32) {
    let result = dev::open(&mut k.procs, &mut k.kbd, caller, device_no);
    k.procs.procs[caller].result_code = result;
}

pub(crate) fn close(k: &mut Kernel, caller: usize, fd: i32) {
    let result = dev::close(&mut k.procs, &mut k.kbd, caller, fd);
    k.procs.procs[caller].result_code = result;
}

pub(crate) fn write(k: &mut Kernel, caller: usize, fd: i32, buffer: u32, len: u32) {
    let result = dev::write(&mut k.procs, &mut k.kbd, caller, fd, buffer, len);
    k.procs.procs[caller].result_code = result;
}

pub(crate) fn read(
    k: &mut Kernel,
    caller: usize,
    fd: i32,
    buffer: u32,
    len: u32,
) -> NextProc {
    let result =
        dev::read(&mut k.procs, &mut k.kbd, &mut k.mem, caller, fd, buffer, len);
    if result == codes::READ_WOULD_BLOCK {
        let p = &mut k.procs.procs[caller];
        p.state = ProcState::Blocked;
        p.blocked_in = Some(BlockedIn::Read);
        NextProc::Other
    } else {
        k.procs.procs[caller].result_code = result;
        NextProc::Same
    }
}

pub(crate) fn ioctl(k: &mut Kernel, caller: usize, fd: i32, command: u32, arg: u32) {
    let result = dev::ioctl(&mut k.procs, &mut k.kbd, caller, fd, command, arg);
    k.procs.procs[caller].result_code = result;
}
