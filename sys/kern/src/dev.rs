// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The device-independent layer.
//!
//! A small fixed device table maps device numbers to records; a per-process
//! FD table maps descriptors 0..3 to device-table entries. Each file
//! syscall is a bounds-checked FD lookup followed by the device's
//! implementation of the fixed capability set (open/close/read/write/
//! ioctl). With one driver behind both records, routing is a `match` on
//! the record's driver tag rather than a table of function pointers; a
//! second driver would add a variant and its arms.
//!
//! Reads get one special power: a driver may answer "would block", which
//! the dispatcher turns into a Read-blocked process instead of a result.

use abi::{
    codes, DEVICE_TABLE_SIZE, DEV_KBD_ECHO, DEV_KBD_NO_ECHO, FD_TABLE_SIZE,
};

use crate::kbd::Keyboard;
use crate::task::ProcTable;
use crate::umem::{self, Memory};

/// Which driver services a device record.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Driver {
    Keyboard,
}

/// One device table entry.
#[derive(Debug)]
pub struct DevRecord {
    pub num: i32,
    pub name: &'static str,
    pub driver: Driver,
}

/// The device table: keyboard without echo, keyboard with echo.
pub const DEV_TABLE: [DevRecord; DEVICE_TABLE_SIZE] = [
    DevRecord {
        num: DEV_KBD_NO_ECHO,
        name: "/dev/keyboard0",
        driver: Driver::Keyboard,
    },
    DevRecord {
        num: DEV_KBD_ECHO,
        name: "/dev/keyboard1",
        driver: Driver::Keyboard,
    },
];

fn valid_fd(tab: &ProcTable, slot: usize, fd: i32) -> Option<usize> {
    if !(0..FD_TABLE_SIZE as i32).contains(&fd) {
        return None;
    }
    tab.procs[slot].fd_table[fd as usize]
}

/// Opens `device_no` for the process in `slot`, returning a descriptor in
/// 0..3, or −1 if the device number is bad, the FD table is full, or the
/// device refuses.
pub fn open(tab: &mut ProcTable, kbd: &mut Keyboard, slot: usize, device_no: i32) -> i32 {
    if !(0..DEVICE_TABLE_SIZE as i32).contains(&device_no) {
        return codes::SYSERR;
    }
    let Some(fd) = tab.procs[slot]
        .fd_table
        .iter()
        .position(Option::is_none)
    else {
        return codes::SYSERR;
    };

    let dev = device_no as usize;
    let rc = match DEV_TABLE[dev].driver {
        Driver::Keyboard => kbd.open(slot, device_no),
    };
    if rc != 0 {
        return codes::SYSERR;
    }
    tab.procs[slot].fd_table[fd] = Some(dev);
    klog!("{} open as fd {}", DEV_TABLE[dev].name, fd);
    fd as i32
}

pub fn close(tab: &mut ProcTable, kbd: &mut Keyboard, slot: usize, fd: i32) -> i32 {
    let Some(dev) = valid_fd(tab, slot, fd) else {
        return codes::SYSERR;
    };
    let rc = match DEV_TABLE[dev].driver {
        Driver::Keyboard => kbd.close(),
    };
    if rc != 0 {
        return codes::SYSERR;
    }
    tab.procs[slot].fd_table[fd as usize] = None;
    codes::OK
}

pub fn write(
    tab: &mut ProcTable,
    kbd: &mut Keyboard,
    slot: usize,
    fd: i32,
    buf: u32,
    len: u32,
) -> i32 {
    if !umem::valid_buf(buf, len) {
        return codes::SYSERR;
    }
    let Some(dev) = valid_fd(tab, slot, fd) else {
        return codes::SYSERR;
    };
    match DEV_TABLE[dev].driver {
        Driver::Keyboard => kbd.write(buf, len),
    }
}

/// May return [`codes::READ_WOULD_BLOCK`], which the dispatcher translates
/// into blocking the caller rather than a result.
pub fn read(
    tab: &mut ProcTable,
    kbd: &mut Keyboard,
    mem: &mut Memory,
    slot: usize,
    fd: i32,
    buf: u32,
    len: u32,
) -> i32 {
    if !umem::valid_buf(buf, len) {
        return codes::SYSERR;
    }
    let Some(dev) = valid_fd(tab, slot, fd) else {
        return codes::SYSERR;
    };
    match DEV_TABLE[dev].driver {
        Driver::Keyboard => kbd.read(mem, buf, len),
    }
}

pub fn ioctl(
    tab: &mut ProcTable,
    kbd: &mut Keyboard,
    slot: usize,
    fd: i32,
    command: u32,
    arg: u32,
) -> i32 {
    let Some(dev) = valid_fd(tab, slot, fd) else {
        return codes::SYSERR;
    };
    match DEV_TABLE[dev].driver {
        Driver::Keyboard => kbd.ioctl(command, arg),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use abi::mem::KERNEL_END;

    fn fixture() -> (ProcTable, Keyboard) {
        let mut tab = ProcTable::new();
        let slot = tab.get_unused().unwrap();
        assert_eq!(slot, 0);
        (tab, Keyboard::new())
    }

    #[test]
    fn open_fills_lowest_fd() {
        let (mut tab, mut kbd) = fixture();
        assert_eq!(open(&mut tab, &mut kbd, 0, DEV_KBD_ECHO), 0);
        // Second open fails at the driver (single-open), not the FD table.
        assert_eq!(open(&mut tab, &mut kbd, 0, DEV_KBD_NO_ECHO), codes::SYSERR);
        assert_eq!(close(&mut tab, &mut kbd, 0, 0), 0);
        assert_eq!(open(&mut tab, &mut kbd, 0, DEV_KBD_NO_ECHO), 0);
    }

    #[test]
    fn bad_device_and_fd_numbers() {
        let (mut tab, mut kbd) = fixture();
        assert_eq!(open(&mut tab, &mut kbd, 0, 2), codes::SYSERR);
        assert_eq!(open(&mut tab, &mut kbd, 0, -1), codes::SYSERR);
        assert_eq!(close(&mut tab, &mut kbd, 0, 0), codes::SYSERR);
        assert_eq!(close(&mut tab, &mut kbd, 0, 7), codes::SYSERR);
        assert_eq!(ioctl(&mut tab, &mut kbd, 0, 3, 0, 0), codes::SYSERR);
    }

    #[test]
    fn keyboard_rejects_writes() {
        let (mut tab, mut kbd) = fixture();
        let fd = open(&mut tab, &mut kbd, 0, DEV_KBD_ECHO);
        assert_eq!(
            write(&mut tab, &mut kbd, 0, fd, KERNEL_END + 32, 4),
            codes::SYSERR,
        );
    }

    #[test]
    fn read_validates_buffer_first() {
        let (mut tab, mut kbd) = fixture();
        let mut mem = Memory::new();
        let fd = open(&mut tab, &mut kbd, 0, DEV_KBD_ECHO);
        assert_eq!(read(&mut tab, &mut kbd, &mut mem, 0, fd, 0, 4), codes::SYSERR);
        assert_eq!(
            read(&mut tab, &mut kbd, &mut mem, 0, fd, KERNEL_END + 32, 0),
            codes::SYSERR,
        );
    }
}
