// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Simulated physical memory and the kernel allocator.
//!
//! The kernel owns a flat byte array standing in for the machine's RAM.
//! Everything user-visible lives in it: process stacks, context frames,
//! signal delivery frames, and every buffer a syscall argument points at.
//! Addresses are plain `u32`s, so a hostile or confused process can at worst
//! scribble over user-visible bytes; kernel structures are unreachable.
//!
//! Allocation uses a first-fit free list threaded *through* the array.
//! Each block carries a 16-byte header: total size (header included),
//! addresses of the previous and next free blocks, and a sanity word that
//! holds the block's data address while allocated and zero while free. The
//! list is kept sorted by address and fully coalesced, and it starts life as
//! exactly two blocks: the RAM below the reserved hole and the RAM above it.
//!
//! The validity predicates at the bottom gate every user pointer before the
//! kernel dereferences it. A `USlice`-style wrapper would be overkill here:
//! addresses are already untrusted integers, not aliasable references.

use abi::mem::{HOLE_END, HOLE_START, KERNEL_END, MEM_MAX};
use abi::PARAGRAPH_SIZE;
use byteorder::{ByteOrder, LittleEndian};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Free-list block header, exactly one paragraph.
#[derive(Copy, Clone, Debug, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
struct BlockHeader {
    /// Block size in bytes, header included.
    size: u32,
    /// Address of the previous free block, 0 if first.
    prev: u32,
    /// Address of the next free block, 0 if last.
    next: u32,
    /// Data address while allocated, 0 while free.
    sanity: u32,
}

const HEADER_SIZE: u32 = core::mem::size_of::<BlockHeader>() as u32;

/// The machine's RAM plus the allocator state.
pub struct Memory {
    ram: Box<[u8]>,
    /// Address of the first free block, 0 if none.
    free_list: u32,
}

impl Memory {
    /// Builds the RAM image and the initial free list: one block from the
    /// end of the kernel image to the hole, one from the hole to the top of
    /// memory.
    pub fn new() -> Self {
        let mut mem = Self {
            ram: vec![0; MEM_MAX as usize].into_boxed_slice(),
            free_list: KERNEL_END,
        };

        mem.write_header(
            KERNEL_END,
            &BlockHeader {
                size: HOLE_START - KERNEL_END,
                prev: 0,
                next: HOLE_END,
                sanity: 0,
            },
        );
        mem.write_header(
            HOLE_END,
            &BlockHeader {
                size: MEM_MAX - HOLE_END,
                prev: KERNEL_END,
                next: 0,
                sanity: 0,
            },
        );
        mem
    }

    /// Allocates `req_size` bytes, returning the data address, or `None` if
    /// no free block is large enough.
    pub fn alloc(&mut self, req_size: u32) -> Option<u32> {
        let max_size = MEM_MAX - KERNEL_END - HEADER_SIZE;
        if req_size == 0 || req_size > max_size {
            return None;
        }
        let size = round_up_to_paragraph(req_size) + HEADER_SIZE;

        // First fit: scan the free list for a block large enough.
        let mut at = self.free_list;
        while at != 0 {
            let header = self.read_header(at);
            if size <= header.size {
                if size != header.size {
                    self.split_off_free_block(at, size);
                }
                let header = self.read_header(at);
                let data = at + HEADER_SIZE;

                // Unlink the block and stamp it allocated.
                if header.prev != 0 {
                    self.update_header(header.prev, |h| h.next = header.next);
                } else {
                    self.free_list = header.next;
                }
                if header.next != 0 {
                    self.update_header(header.next, |h| h.prev = header.prev);
                }
                self.update_header(at, |h| {
                    h.prev = 0;
                    h.next = 0;
                    h.sanity = data;
                });

                uassert!(in_free_memory_range(data));
                uassert!(on_paragraph_boundary(data));
                return Some(data);
            }
            at = header.next;
        }
        None
    }

    /// Splits `size` bytes off the front of the free block at `at`, leaving
    /// the remainder as a smaller free block.
    fn split_off_free_block(&mut self, at: u32, size: u32) {
        let header = self.read_header(at);
        let rest = at + size;
        self.write_header(
            rest,
            &BlockHeader {
                size: header.size - size,
                prev: at,
                next: header.next,
                sanity: 0,
            },
        );
        if header.next != 0 {
            self.update_header(header.next, |h| h.prev = rest);
        }
        self.update_header(at, |h| {
            h.size = size;
            h.next = rest;
        });
    }

    /// Returns a previously allocated block to the free pool, coalescing
    /// with adjacent free blocks. Returns false (and does nothing) if the
    /// pointer is not something `alloc` handed out.
    pub fn free(&mut self, ptr: u32) -> bool {
        if ptr == 0 || !in_free_memory_range(ptr) || !on_paragraph_boundary(ptr) {
            return false;
        }
        let at = ptr - HEADER_SIZE;
        if !in_free_memory_range(at) || !on_paragraph_boundary(at) {
            return false;
        }
        if self.read_header(at).sanity != ptr {
            return false;
        }
        self.update_header(at, |h| h.sanity = 0);

        // Walk to the insertion point that keeps the list address-sorted.
        let mut prev = 0;
        let mut next = self.free_list;
        while next != 0 && next < at {
            let h = self.read_header(next);
            prev = next;
            next = h.next;
        }

        self.update_header(at, |h| {
            h.prev = prev;
            h.next = next;
        });
        if prev == 0 {
            self.free_list = at;
        } else {
            self.update_header(prev, |h| h.next = at);
        }
        if next != 0 {
            self.update_header(next, |h| h.prev = at);
        }

        // Coalesce with the right neighbor, then the left.
        if next != 0 && self.are_adjacent(at, next) {
            self.merge_blocks(at, next);
        }
        if prev != 0 && self.are_adjacent(prev, at) {
            self.merge_blocks(prev, at);
        }
        true
    }

    fn are_adjacent(&self, left: u32, right: u32) -> bool {
        left + self.read_header(left).size == right
    }

    /// Merges the right block into the left. Both must be free and adjacent.
    fn merge_blocks(&mut self, left: u32, right: u32) {
        let right_header = self.read_header(right);
        self.update_header(left, |h| {
            h.size += right_header.size;
            h.next = right_header.next;
        });
        if right_header.next != 0 {
            self.update_header(right_header.next, |h| h.prev = left);
        }
    }

    /// Number of blocks on the free list. Two at boot; tests use this to
    /// check that alloc/free round-trips restore it.
    pub fn free_list_len(&self) -> usize {
        let mut n = 0;
        let mut at = self.free_list;
        while at != 0 {
            n += 1;
            at = self.read_header(at).next;
        }
        n
    }

    /// Free block (address, size) pairs in list order, for invariant checks.
    pub fn free_blocks(&self) -> Vec<(u32, u32)> {
        let mut out = Vec::new();
        let mut at = self.free_list;
        while at != 0 {
            let h = self.read_header(at);
            out.push((at, h.size));
            at = h.next;
        }
        out
    }

    fn read_header(&self, at: u32) -> BlockHeader {
        self.read_struct(at)
    }

    fn write_header(&mut self, at: u32, h: &BlockHeader) {
        self.write_struct(at, h);
    }

    fn update_header(&mut self, at: u32, f: impl FnOnce(&mut BlockHeader)) {
        let mut h = self.read_header(at);
        f(&mut h);
        self.write_header(at, &h);
    }

    // ===== raw access, used after validation =====

    pub fn read_u8(&self, at: u32) -> u8 {
        self.ram[at as usize]
    }

    pub fn write_u8(&mut self, at: u32, v: u8) {
        self.ram[at as usize] = v;
    }

    pub fn read_u32(&self, at: u32) -> u32 {
        let at = at as usize;
        LittleEndian::read_u32(&self.ram[at..at + 4])
    }

    pub fn write_u32(&mut self, at: u32, v: u32) {
        let at = at as usize;
        LittleEndian::write_u32(&mut self.ram[at..at + 4], v);
    }

    pub fn read_i32(&self, at: u32) -> i32 {
        self.read_u32(at) as i32
    }

    pub fn write_i32(&mut self, at: u32, v: i32) {
        self.write_u32(at, v as u32);
    }

    pub fn read_bytes(&self, at: u32, len: u32) -> &[u8] {
        &self.ram[at as usize..(at + len) as usize]
    }

    pub fn write_bytes(&mut self, at: u32, bytes: &[u8]) {
        self.ram[at as usize..at as usize + bytes.len()].copy_from_slice(bytes);
    }

    /// Copies a `#[repr(C)]` struct out of RAM.
    pub fn read_struct<T: FromBytes>(&self, at: u32) -> T {
        let at = at as usize;
        let end = at + core::mem::size_of::<T>();
        uassert!(end <= self.ram.len());
        match T::read_from_bytes(&self.ram[at..end]) {
            Ok(v) => v,
            // The slice length is exact, so this cannot fail.
            Err(_) => unreachable!(),
        }
    }

    /// Copies a `#[repr(C)]` struct into RAM.
    pub fn write_struct<T: IntoBytes + Immutable>(&mut self, at: u32, v: &T) {
        let at = at as usize;
        let end = at + core::mem::size_of::<T>();
        uassert!(end <= self.ram.len());
        self.ram[at..end].copy_from_slice(v.as_bytes());
    }

    /// Reads a NUL-terminated string, lossily, stopping at `max` bytes.
    pub fn read_cstr(&self, at: u32, max: u32) -> String {
        let mut out = Vec::new();
        let mut a = at;
        while a < MEM_MAX && a - at < max {
            let b = self.read_u8(a);
            if b == 0 {
                break;
            }
            out.push(b);
            a += 1;
        }
        String::from_utf8_lossy(&out).into_owned()
    }
}

impl Default for Memory {
    fn default() -> Self {
        Self::new()
    }
}

/// Checks that a user pointer names an existing address outside the hole.
/// Kernel-text addresses are acceptable; function entry points live there.
pub fn valid_ptr(addr: u32) -> bool {
    addr != 0 && in_memory_range(addr)
}

/// Checks that a whole user buffer is usable: a valid, non-empty range with
/// both endpoints outside kernel memory and the hole.
pub fn valid_buf(addr: u32, len: u32) -> bool {
    if !valid_ptr(addr) || in_kernel_range(addr) || len == 0 {
        return false;
    }
    match addr.checked_add(len) {
        Some(end) => in_memory_range(end) && !in_kernel_range(end),
        None => false,
    }
}

fn in_memory_range(addr: u32) -> bool {
    (addr > 0 && addr < HOLE_START) || (addr >= HOLE_END && addr < MEM_MAX)
}

fn in_kernel_range(addr: u32) -> bool {
    addr > 0 && addr < KERNEL_END
}

/// Allocatable RAM, boundaries included; where data addresses may fall.
fn in_free_memory_range(addr: u32) -> bool {
    (addr >= KERNEL_END && addr <= HOLE_START)
        || (addr >= HOLE_END && addr <= MEM_MAX)
}

fn on_paragraph_boundary(addr: u32) -> bool {
    addr % PARAGRAPH_SIZE == 0
}

fn round_up_to_paragraph(n: u32) -> u32 {
    n.div_ceil(PARAGRAPH_SIZE) * PARAGRAPH_SIZE
}
