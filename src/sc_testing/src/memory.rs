/*
Copyright 2025  The Hyperlight Authors.

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

//! Guest physical memory as seen by both the simulated kernel and the
//! simulated hypervisor.
//!
//! Two kinds of physical address exist. Frames handed out by
//! [`PhysMemory::alloc_frame`] back user and vmalloc pages and live in
//! a table here. Every other physical address is the direct-map image
//! of a real address in the test process (stack locals, descriptors),
//! so it is turned back into a pointer by adding `page_offset`.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;

use sc_common::PAGE_SIZE;
use sc_common::addr::{Pfn, PhysAddr};

/// First frame number handed out for user and vmalloc pages. Low enough
/// that frame addresses fit the 32-bit operand slots of the word
/// operations.
pub const FIRST_FRAME: u64 = 0x4000;

type Frame = Box<[u8; PAGE_SIZE]>;

pub struct PhysMemory {
    page_offset: u64,
    frames: RefCell<HashMap<Pfn, Frame>>,
    next_pfn: Cell<u64>,
    view_id: Cell<u32>,
}

impl PhysMemory {
    pub(crate) fn new(page_offset: u64) -> Self {
        Self {
            page_offset,
            frames: RefCell::new(HashMap::new()),
            next_pfn: Cell::new(FIRST_FRAME),
            view_id: Cell::new(0),
        }
    }

    pub fn page_offset(&self) -> u64 {
        self.page_offset
    }

    /// A fresh zero-filled frame.
    pub fn alloc_frame(&self) -> Pfn {
        let pfn = Pfn::new(self.next_pfn.get());
        self.next_pfn.set(pfn.as_u64() + 1);
        self.frames
            .borrow_mut()
            .insert(pfn, Box::new([0u8; PAGE_SIZE]));
        pfn
    }

    /// Copy a whole frame into another.
    pub fn copy_frame(&self, from: Pfn, to: Pfn) {
        let mut frames = self.frames.borrow_mut();
        let data = **frames.get(&from).unwrap();
        **frames.get_mut(&to).unwrap() = data;
    }

    /// Read `buf.len()` bytes at `pa`. The range must not cross a page.
    pub fn read(&self, pa: PhysAddr, buf: &mut [u8]) {
        self.with_bytes(pa, buf.len(), |bytes| buf.copy_from_slice(bytes));
    }

    /// Write `data` at `pa`. The range must not cross a page.
    pub fn write(&self, pa: PhysAddr, data: &[u8]) {
        self.with_bytes(pa, data.len(), |bytes| bytes.copy_from_slice(data));
    }

    pub fn read_u32(&self, pa: PhysAddr) -> u32 {
        let mut b = [0u8; 4];
        self.read(pa, &mut b);
        u32::from_ne_bytes(b)
    }

    pub fn write_u32(&self, pa: PhysAddr, v: u32) {
        self.write(pa, &v.to_ne_bytes());
    }

    fn with_bytes<R>(&self, pa: PhysAddr, len: usize, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let off = pa.page_offset() as usize;
        assert!(
            off + len <= PAGE_SIZE,
            "access of {len} bytes at {pa} crosses a page"
        );
        let mut frames = self.frames.borrow_mut();
        match frames.get_mut(&pa.pfn()) {
            Some(frame) => f(&mut frame[off..off + len]),
            None => {
                drop(frames);
                let host = pa.as_u64().wrapping_add(self.page_offset) as usize as *mut u8;
                // SAFETY: non-frame physical addresses only ever come
                // from direct-map translation of live test memory
                let bytes = unsafe { std::slice::from_raw_parts_mut(host, len) };
                f(bytes)
            }
        }
    }

    /// The view id cached in the current task record.
    pub fn view_id(&self) -> u32 {
        self.view_id.get()
    }

    pub fn set_view_id(&self, id: u32) {
        self.view_id.set(id)
    }
}
