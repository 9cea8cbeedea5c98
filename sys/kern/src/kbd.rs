// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The keyboard driver.
//!
//! Two logical devices (echo and no-echo) front one piece of hardware, so
//! there is one driver state and at most one of the two devices may be open
//! at a time.
//!
//! The upper half services open/close/read/write/ioctl on behalf of the
//! device-independent layer. The lower half is the ISR: it translates scan
//! codes to ASCII through a small modifier-state machine, buffers up to
//! four characters in a ring (arrivals beyond that are dropped), echoes if
//! the echo device is open, and completes any pending read.
//!
//! A read finishes when the caller's buffer fills, a newline is copied, or
//! the EOF character (default control-D, changeable by ioctl) appears in
//! the stream. EOF also disables the keyboard; every later read returns 0.
//! A read that cannot finish immediately returns the would-block sentinel
//! and the dispatcher parks the caller until the ISR completes the
//! transfer.

use abi::{
    codes, DEFAULT_EOF, DEV_KBD_ECHO, IOCTL_CHANGE_EOF, IOCTL_ECHO_OFF,
    IOCTL_ECHO_ON,
};
use bitflags::bitflags;

use crate::umem::Memory;

/// Ring slots: capacity four, plus the one empty slot that disambiguates
/// full from empty.
const RING_SLOTS: usize = 5;

/// Key-up events have the high bit set.
pub const KEY_UP: u8 = 0x80;
pub const LSHIFT: u8 = 0x2a;
pub const RSHIFT: u8 = 0x36;
pub const LMETA: u8 = 0x38;
pub const LCTL: u8 = 0x1d;
pub const CAPSL: u8 = 0x3a;

/// Translation result meaning "no character" (modifier, key-up, unmapped).
const NOCHAR: u32 = 256;

bitflags! {
    /// Modifier keys currently held (or latched, for caps lock).
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct Modifiers: u8 {
        const CTL = 0x01;
        const SHIFT = 0x02;
        const CAPSLOCK = 0x04;
        const META = 0x08;
    }
}

/// Plain translation table, indexed by scan code.
pub const KBCODE: [u8; 58] = [
    0, 27, b'1', b'2', b'3', b'4', b'5', b'6', b'7', b'8', b'9', b'0', b'-',
    b'=', 8, b'\t', b'q', b'w', b'e', b'r', b't', b'y', b'u', b'i', b'o',
    b'p', b'[', b']', b'\n', 0, b'a', b's', b'd', b'f', b'g', b'h', b'j',
    b'k', b'l', b';', b'\'', b'`', 0, b'\\', b'z', b'x', b'c', b'v', b'b',
    b'n', b'm', b',', b'.', b'/', 0, 0, 0, b' ',
];

/// Shifted translation table.
pub const KBSHIFT: [u8; 58] = [
    0, 0, b'!', b'@', b'#', b'$', b'%', b'^', b'&', b'*', b'(', b')', b'_',
    b'+', 8, b'\t', b'Q', b'W', b'E', b'R', b'T', b'Y', b'U', b'I', b'O',
    b'P', b'{', b'}', b'\n', 0, b'A', b'S', b'D', b'F', b'G', b'H', b'J',
    b'K', b'L', b':', b'"', b'~', 0, b'|', b'Z', b'X', b'C', b'V', b'B',
    b'N', b'M', b'<', b'>', b'?', 0, 0, 0, b' ',
];

/// Control translation table.
pub const KBCTL: [u8; 51] = [
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 31, 0, 8, b'\t', 17, 23, 5, 18, 20,
    25, 21, 9, 15, 16, 27, 29, b'\n', 0, 1, 19, 4, 6, 7, 8, 10, 11, 12, 0,
    0, 0, 0, 28, 26, 24, 3, 22, 2, 14, 13,
];

/// What the ISR wants the dispatcher to do after a scan code is handled.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct IsrOutcome {
    /// Character to echo on the console, if echoing is on.
    pub echo: Option<char>,
    /// A pending read just completed with this byte count; the owner is to
    /// be unblocked with it.
    pub completed: Option<i32>,
}

/// Driver state for the one keyboard.
#[derive(Debug)]
pub struct Keyboard {
    ring: [u8; RING_SLOTS],
    /// Next slot the ISR writes.
    head: usize,
    /// Next slot a read drains.
    tail: usize,
    /// Pending read destination, 0 when no read is outstanding.
    read_buf: u32,
    read_len: u32,
    /// Bytes already placed in the pending read's buffer.
    transferred: u32,
    /// The pending read has been fully serviced.
    read_finished: bool,
    eof: u8,
    eof_seen: bool,
    echo: bool,
    /// Slot of the process holding the device open.
    owner: Option<usize>,
    state: Modifiers,
    /// Keyboard controller enabled: the machine delivers interrupts only
    /// while this is set.
    hw_enabled: bool,
}

impl Keyboard {
    pub fn new() -> Self {
        Self {
            ring: [0; RING_SLOTS],
            head: 0,
            tail: 0,
            read_buf: 0,
            read_len: 0,
            transferred: 0,
            read_finished: false,
            eof: DEFAULT_EOF,
            eof_seen: false,
            echo: false,
            owner: None,
            state: Modifiers::empty(),
            hw_enabled: false,
        }
    }

    /// Everything except `echo` and the owner, back to initial state.
    fn reset(&mut self) {
        self.ring = [0; RING_SLOTS];
        self.head = 0;
        self.tail = 0;
        self.read_buf = 0;
        self.read_len = 0;
        self.transferred = 0;
        self.read_finished = false;
        self.eof = DEFAULT_EOF;
        self.eof_seen = false;
        self.state = Modifiers::empty();
    }

    pub fn owner(&self) -> Option<usize> {
        self.owner
    }

    pub fn interrupts_enabled(&self) -> bool {
        self.hw_enabled
    }

    /// Upper half of open. Fails if either keyboard device is already open.
    pub fn open(&mut self, slot: usize, device_no: i32) -> i32 {
        if self.owner.is_some() {
            return codes::SYSERR;
        }
        self.reset();
        self.echo = device_no == DEV_KBD_ECHO;
        self.owner = Some(slot);
        self.hw_enabled = true;
        codes::OK
    }

    /// Upper half of close. Releases the device and quiets the hardware.
    pub fn close(&mut self) -> i32 {
        self.reset();
        self.echo = false;
        self.owner = None;
        self.hw_enabled = false;
        codes::OK
    }

    /// Upper half of read. Drains whatever the ring already holds; either
    /// the read finishes on the spot or the caller must block until the ISR
    /// finishes it.
    pub fn read(&mut self, mem: &mut Memory, buf: u32, len: u32) -> i32 {
        if self.eof_seen {
            return 0;
        }
        self.read_buf = buf;
        self.read_len = len;
        self.transferred = 0;
        if self.transfer(mem) {
            let n = self.transferred as i32;
            self.clear_pending();
            n
        } else {
            self.read_finished = false;
            codes::READ_WOULD_BLOCK
        }
    }

    /// Writes are not a thing keyboards do.
    pub fn write(&mut self, _buf: u32, _len: u32) -> i32 {
        codes::SYSERR
    }

    pub fn ioctl(&mut self, command: u32, arg: u32) -> i32 {
        match command {
            IOCTL_CHANGE_EOF => {
                if (1..=127).contains(&arg) {
                    self.eof = arg as u8;
                    codes::OK
                } else {
                    codes::SYSERR
                }
            }
            IOCTL_ECHO_OFF => {
                self.echo = false;
                codes::OK
            }
            IOCTL_ECHO_ON => {
                self.echo = true;
                codes::OK
            }
            _ => codes::SYSERR,
        }
    }

    /// Lower half: one scan code from the hardware.
    pub fn isr(&mut self, mem: &mut Memory, scancode: u8) -> IsrOutcome {
        uassert!(self.owner.is_some(), "keyboard interrupt with device closed");
        let mut outcome = IsrOutcome::default();

        let ch = self.kbtoa(scancode);
        if (1..=127).contains(&ch) {
            let c = ch as u8;
            self.push_ring(c);
            if self.echo {
                outcome.echo = Some(c as char);
            }
            if self.read_buf != 0 && !self.read_finished {
                self.read_finished = self.transfer(mem);
                if self.read_finished {
                    outcome.completed = Some(self.transferred as i32);
                }
            }
        }
        outcome
    }

    /// Acknowledges a completed read once the owner has been unblocked.
    pub fn finish_read(&mut self) {
        self.transferred = 0;
    }

    /// Abandons the pending read (signal interrupted the reader). Returns
    /// how many bytes had already been transferred.
    pub fn cancel_pending_read(&mut self) -> u32 {
        let n = self.transferred;
        self.read_buf = 0;
        self.read_len = 0;
        self.transferred = 0;
        self.read_finished = false;
        n
    }

    fn ring_full(&self) -> bool {
        (self.head + 1) % RING_SLOTS == self.tail
    }

    /// Buffers one character; arrivals while full are discarded, EOF
    /// included.
    fn push_ring(&mut self, c: u8) {
        if !self.ring_full() {
            self.ring[self.head] = c;
            self.head = (self.head + 1) % RING_SLOTS;
        }
    }

    /// Moves buffered characters into the pending read's buffer. True when
    /// the read is fully serviced.
    fn transfer(&mut self, mem: &mut Memory) -> bool {
        while self.tail != self.head {
            let c = self.ring[self.tail];
            self.tail = (self.tail + 1) % RING_SLOTS;
            if c == self.eof {
                self.handle_eof();
                return true;
            }
            mem.write_u8(self.read_buf + self.transferred, c);
            self.transferred += 1;
            if self.transferred == self.read_len || c == b'\n' {
                return true;
            }
        }
        false
    }

    fn handle_eof(&mut self) {
        self.eof_seen = true;
        // No more input follows; quiet the controller.
        self.hw_enabled = false;
    }

    fn clear_pending(&mut self) {
        self.read_buf = 0;
        self.read_len = 0;
        self.transferred = 0;
        self.read_finished = false;
    }

    /// Scan code to ASCII, tracking modifier state. Returns [`NOCHAR`] for
    /// key-ups, modifiers, and unmapped codes.
    fn kbtoa(&mut self, code: u8) -> u32 {
        if code & KEY_UP != 0 {
            match code & 0x7f {
                LSHIFT | RSHIFT => self.state.remove(Modifiers::SHIFT),
                CAPSL => self.state.remove(Modifiers::CAPSLOCK),
                LCTL => self.state.remove(Modifiers::CTL),
                LMETA => self.state.remove(Modifiers::META),
                _ => {}
            }
            return NOCHAR;
        }

        match code {
            LSHIFT | RSHIFT => {
                self.state.insert(Modifiers::SHIFT);
                return NOCHAR;
            }
            CAPSL => {
                self.state.insert(Modifiers::CAPSLOCK);
                return NOCHAR;
            }
            LCTL => {
                self.state.insert(Modifiers::CTL);
                return NOCHAR;
            }
            LMETA => {
                self.state.insert(Modifiers::META);
                return NOCHAR;
            }
            _ => {}
        }

        let mut ch = NOCHAR;
        if (code as usize) < KBCODE.len() {
            ch = if self.state.contains(Modifiers::CAPSLOCK) {
                KBSHIFT[code as usize]
            } else {
                KBCODE[code as usize]
            } as u32;
        }
        if self.state.contains(Modifiers::SHIFT) {
            if code as usize >= KBSHIFT.len() {
                return NOCHAR;
            }
            ch = if self.state.contains(Modifiers::CAPSLOCK) {
                KBCODE[code as usize]
            } else {
                KBSHIFT[code as usize]
            } as u32;
        }
        if self.state.contains(Modifiers::CTL) {
            if code as usize >= KBCTL.len() {
                return NOCHAR;
            }
            ch = KBCTL[code as usize] as u32;
        }
        if self.state.contains(Modifiers::META) {
            ch += 0x80;
        }
        ch
    }
}

impl Default for Keyboard {
    fn default() -> Self {
        Self::new()
    }
}
