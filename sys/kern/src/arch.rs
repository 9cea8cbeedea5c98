// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The machine-facing edge of the kernel: saved-context layouts and the
//! context-switch seam.
//!
//! On the original hardware this was a page of inline assembly; here the
//! CPU is a trait. The kernel's side of the contract is unchanged:
//!
//! - A process's saved state is a [`ContextFrame`] in its own stack at
//!   `esp`, with `iret_eip` naming the code that runs on resume and the
//!   accumulator carrying the last syscall's result.
//! - Signal delivery pushes a [`SignalDeliveryContext`] whose embedded
//!   frame resumes in the trampoline.
//! - Whatever implements [`UserMode`] runs user code until the next trap,
//!   then returns control with the trap classified.
//!
//! Layouts are `#[repr(C)]` and written into simulated RAM byte-for-byte,
//! so everything sigreturn reads back at fixed offsets actually lives on
//! the user stack.

use abi::{text, Trap, CODE_SELECTOR, EFLAGS};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::disp::Kernel;
use crate::umem::Memory;

/// Saved register state, in push order. Only `iret_eip` (what runs on
/// resume), `iret_cs`, `eflags`, and `ebp` carry information the simulator
/// uses; the rest exist so the frame is the real 44-byte x86 shape.
#[derive(Copy, Clone, Debug, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct ContextFrame {
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    pub esp: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,
    pub iret_eip: u32,
    pub iret_cs: u32,
    pub eflags: u32,
}

pub const CONTEXT_FRAME_SIZE: u32 = core::mem::size_of::<ContextFrame>() as u32;

/// The record signal delivery pushes onto the user stack, directly below
/// the interrupted context. Field order is load-bearing: sigreturn recovers
/// `saved_result_code` and `last_signal_delivered` at fixed negative
/// offsets from the restored stack pointer.
#[derive(Copy, Clone, Debug, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct SignalDeliveryContext {
    /// Resumes in the trampoline.
    pub frame: ContextFrame,
    /// Return-address slot for the trampoline's call frame; unused.
    pub ret_addr: u32,
    /// First trampoline argument: the handler to run.
    pub handler: u32,
    /// Second trampoline argument: the interrupted context, i.e. the stack
    /// pointer at delivery time. Handed back to sigreturn.
    pub cntx: u32,
    /// Delivery level to restore at sigreturn.
    pub last_signal_delivered: i32,
    /// Interrupted syscall result to restore at sigreturn.
    pub saved_result_code: i32,
}

impl SignalDeliveryContext {
    pub const SIZE: u32 = core::mem::size_of::<Self>() as u32;
}

/// Builds the initial stack image for a new process and returns the stack
/// pointer to save in its PCB.
///
/// Top of stack gets the stop shim's address, so an entry function that
/// returns falls into the stop syscall; below that sits a zeroed context
/// frame resuming at `entry` with the canonical code selector and flags.
pub fn build_initial_frame(
    mem: &mut Memory,
    stack_base: u32,
    stack_size: u32,
    entry: u32,
) -> u32 {
    let stack_end = stack_base + stack_size;
    let return_slot = stack_end - 4;
    mem.write_u32(return_slot, text::STOP_SHIM);

    let esp = return_slot - CONTEXT_FRAME_SIZE;
    let frame = ContextFrame {
        ebp: esp + CONTEXT_FRAME_SIZE,
        iret_eip: entry,
        iret_cs: CODE_SELECTOR,
        eflags: EFLAGS,
        ..ContextFrame::default()
    };
    mem.write_struct(esp, &frame);
    esp
}

/// What the CPU reports back to the dispatcher.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Exit {
    /// A trap re-entered the kernel.
    Trap(Trap),
    /// The system is quiescent: only the idle process is runnable and no
    /// event source can ever interrupt it. A real machine would sit in the
    /// idle loop; a simulation returns.
    Halt,
}

/// The context switcher. Given the kernel (which knows the current process,
/// its saved frame, and its pending result), run user code until something
/// traps back in.
pub trait UserMode {
    fn context_switch(&mut self, kernel: &mut Kernel) -> Exit;
}
