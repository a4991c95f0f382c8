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

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::ops::Range;
use std::rc::Rc;

use sc_common::PAGE_SIZE;
use sc_common::addr::{Pfn, PhysAddr, VirtAddr};
use sc_common::descriptor::PhysVirtMap;
use sc_guest::{Errno, GuestKernel, GuestMemoryLayout, TaskLayout};

use crate::memory::PhysMemory;
use crate::mock_hypervisor::MockHypervisor;

pub const USER_VRANGE_MAX: u64 = 0x1_0000_0000;
pub const VMALLOC_START: u64 = 0xffff_c900_0000_0000;
pub const VMALLOC_END: u64 = 0xffff_e900_0000_0000;
/// The vmalloc area with 5-level paging.
pub const VMALLOC_START_LA57: u64 = 0xffa0_0000_0000_0000;
pub const VMALLOC_END_LA57: u64 = 0xffd2_0000_0000_0000;
pub const START_KERNEL_MAP: u64 = 0xffff_ffff_8000_0000;
pub const MODULES_VADDR: u64 = 0xffff_ffff_a000_0000;
pub const MODULES_END: u64 = 0xffff_ffff_ff00_0000;
pub const PHYS_BASE: u64 = 0x100_0000;

/// Where the host stack of the thread that built the kernel appears in
/// guest physical memory.
const STACK_PHYS: u64 = 0x1000_0000;
/// Physical base of the simulated kernel page tables
const TABLES_PHYS: u64 = 0x3000_0000;
const CONTEXT_SLOTS_PHYS: u64 = 0x0200_0000;

pub const TASK_LAYOUT: TaskLayout = TaskLayout {
    task_size: 0x1a40,
    pid_offset: 0x4e8,
    view_id_offset: 0x1a38,
    comm_offset: 0x6a0,
    thread_offset: 0x1900,
};

const ENTRIES: usize = PAGE_SIZE / 8;
const PRESENT: u64 = 1;
const WRITABLE: u64 = 1 << 1;
const HUGE: u64 = 1 << 7;
/// Bits 51:12 of an entry
const ADDR_MASK: u64 = 0x000f_ffff_ffff_f000;

const SHIFTS_4LEVEL: &[u64] = &[39, 30, 21, 12];
const SHIFTS_5LEVEL: &[u64] = &[48, 39, 30, 21, 12];

/// Kernel page tables covering the vmalloc and module areas, with 4 or
/// 5 levels. Table `i` sits at physical address
/// `TABLES_PHYS + i * PAGE_SIZE`.
pub struct MockTables {
    shifts: &'static [u64],
    tables: RefCell<Vec<[u64; ENTRIES]>>,
}

impl MockTables {
    fn new(shifts: &'static [u64]) -> Self {
        Self {
            shifts,
            tables: RefCell::new(vec![[0u64; ENTRIES]]),
        }
    }

    fn table_phys(index: usize) -> u64 {
        TABLES_PHYS + (index * PAGE_SIZE) as u64
    }

    fn table_index(pte: u64) -> usize {
        ((pte & ADDR_MASK) - TABLES_PHYS) as usize / PAGE_SIZE
    }

    fn set(&self, table: usize, index: u64, pte: u64) {
        self.tables.borrow_mut()[table][index as usize] = pte;
    }

    /// Follow or create the tables for `va` down to the level indexed
    /// by `shift` and return the index of that table.
    fn walk_to(&self, va: u64, shift: u64) -> usize {
        let mut table = 0usize;
        for &s in self.shifts.iter().take_while(|&&s| s > shift) {
            let idx = ((va >> s) & 0x1ff) as usize;
            let pte = self.tables.borrow()[table][idx];
            table = if pte & PRESENT != 0 {
                Self::table_index(pte)
            } else {
                let next = {
                    let mut tables = self.tables.borrow_mut();
                    tables.push([0u64; ENTRIES]);
                    tables.len() - 1
                };
                self.set(table, idx as u64, Self::table_phys(next) | PRESENT | WRITABLE);
                next
            };
        }
        table
    }

    pub fn map_4k(&self, va: VirtAddr, pfn: Pfn, writable: bool) {
        let va = va.as_u64();
        let pt = self.walk_to(va, 12);
        let flags = PRESENT | if writable { WRITABLE } else { 0 };
        self.set(pt, (va >> 12) & 0x1ff, pfn.to_phys().as_u64() | flags);
    }

    /// Map a 2MiB leaf at the page directory level.
    pub fn map_2m(&self, va: VirtAddr, pa: PhysAddr) {
        let va = va.as_u64();
        let pd = self.walk_to(va, 21);
        self.set(pd, (va >> 21) & 0x1ff, pa.as_u64() | HUGE | PRESENT | WRITABLE);
    }

    /// Walk the tables for `va`, honouring 1GiB and 2MiB leaves.
    pub fn lookup(&self, va: VirtAddr) -> Option<PhysAddr> {
        let va = va.as_u64();
        let tables = self.tables.borrow();
        let mut table = 0usize;
        for &shift in self.shifts {
            let pte = tables[table][((va >> shift) & 0x1ff) as usize];
            if pte & PRESENT == 0 {
                return None;
            }
            if shift == 12 || (pte & HUGE != 0 && shift <= 30) {
                let mask = (1u64 << shift) - 1;
                return Some(PhysAddr::new((pte & ADDR_MASK & !mask) | (va & mask)));
            }
            table = Self::table_index(pte);
        }
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct UserPage {
    pfn: Pfn,
    /// Shared with another address space until written
    cow: bool,
}

#[derive(Debug, Clone)]
struct Vma {
    range: Range<u64>,
    writable: bool,
}

/// A simulated guest kernel for one process.
///
/// User memory is demand paged: a page only gets a frame the first
/// time it is pinned or touched. Pages marked shared with
/// [`MockKernel::share_page`] are broken on the first write pin.
pub struct MockKernel {
    mem: Rc<PhysMemory>,
    layout: GuestMemoryLayout,
    cpus: RefCell<Vec<usize>>,
    tables: MockTables,
    vmalloc: Range<u64>,
    vmas: RefCell<Vec<Vma>>,
    pages: RefCell<HashMap<u64, UserPage>>,
    pins: RefCell<HashMap<Pfn, usize>>,
    pin_log: RefCell<Vec<(VirtAddr, bool)>>,
    user_ip: Cell<VirtAddr>,
}

impl Default for MockKernel {
    fn default() -> Self {
        Self::new()
    }
}

impl MockKernel {
    /// A kernel with two processors and no user mappings.
    ///
    /// The direct map is anchored on the calling thread's stack, so
    /// kernel locals of code running on this thread translate to small
    /// physical addresses. Build the kernel on the thread that will use
    /// it.
    #[inline(never)]
    pub fn new() -> Self {
        let anchor = 0u8;
        let here = VirtAddr::from_ptr(std::hint::black_box(&anchor)).page_base();
        let page_offset = here.as_u64().wrapping_sub(STACK_PHYS);
        let layout = GuestMemoryLayout {
            is_x32: false,
            total_npages: 0x2_0000,
            kernel_text: PhysAddr::new(PHYS_BASE)..PhysAddr::new(0x1a0_0000),
            vdso: PhysAddr::new(0x1c0_0000)..PhysAddr::new(0x1c0_2000),
            vvar: PhysAddr::new(0x1c0_2000)..PhysAddr::new(0x1c0_3000),
            zero_page: PhysAddr::new(0x1c0_4000)..PhysAddr::new(0x1c0_5000),
            user_vrange_max: VirtAddr::new(USER_VRANGE_MAX),
            kernel_vrange: VirtAddr::new(START_KERNEL_MAP)..VirtAddr::new(MODULES_VADDR),
            module_vrange: VirtAddr::new(MODULES_VADDR)..VirtAddr::new(MODULES_END),
            pv: PhysVirtMap {
                phys_base: PHYS_BASE,
                start_kernel_map: START_KERNEL_MAP,
                page_offset,
            },
        };
        Self {
            mem: Rc::new(PhysMemory::new(page_offset)),
            layout,
            cpus: RefCell::new(vec![0, 1]),
            tables: MockTables::new(SHIFTS_4LEVEL),
            vmalloc: VMALLOC_START..VMALLOC_END,
            vmas: RefCell::new(Vec::new()),
            pages: RefCell::new(HashMap::new()),
            pins: RefCell::new(HashMap::new()),
            pin_log: RefCell::new(Vec::new()),
            user_ip: Cell::new(VirtAddr::new(0x40_0000)),
        }
    }

    /// As [`MockKernel::new`], but with 5-level kernel page tables and
    /// the vmalloc area where 5-level paging puts it.
    #[inline(never)]
    pub fn new_la57() -> Self {
        let mut kernel = Self::new();
        kernel.tables = MockTables::new(SHIFTS_5LEVEL);
        kernel.vmalloc = VMALLOC_START_LA57..VMALLOC_END_LA57;
        kernel
    }

    /// A hypervisor operating on this kernel's physical memory.
    pub fn hypervisor(&self) -> MockHypervisor {
        MockHypervisor::new(self.mem.clone())
    }

    pub fn memory(&self) -> &PhysMemory {
        &self.mem
    }

    pub fn layout_mut(&mut self) -> &mut GuestMemoryLayout {
        &mut self.layout
    }

    pub fn set_possible_cpus(&self, cpus: impl IntoIterator<Item = usize>) {
        *self.cpus.borrow_mut() = cpus.into_iter().collect();
    }

    pub fn set_user_ip(&self, ip: VirtAddr) {
        self.user_ip.set(ip)
    }

    pub fn set_view_id(&self, id: u32) {
        self.mem.set_view_id(id)
    }

    /// Add a user mapping of `len` bytes at `start`. Pages are not
    /// backed until first touched.
    pub fn map_user(&self, start: VirtAddr, len: u64, writable: bool) {
        let start = start.as_u64();
        assert!(start + len <= USER_VRANGE_MAX);
        self.vmas.borrow_mut().push(Vma {
            range: start..start + len,
            writable,
        });
    }

    /// Back a vmalloc address with a fresh frame.
    pub fn map_vmalloc(&self, va: VirtAddr) -> Pfn {
        assert!(self.is_vmalloc_or_module(va));
        let pfn = self.mem.alloc_frame();
        self.tables.map_4k(va.page_base(), pfn, true);
        pfn
    }

    pub fn page_tables(&self) -> &MockTables {
        &self.tables
    }

    /// Fault in the page at `va` (if needed) and mark it shared, as
    /// after a fork. The next write pin gets a private copy.
    pub fn share_page(&self, va: VirtAddr) -> Pfn {
        let page = self.fault_in(va).unwrap();
        self.pages
            .borrow_mut()
            .insert(va.page_base().as_u64(), UserPage { cow: true, ..page });
        page.pfn
    }

    /// The frame currently mapped at `va`, if any.
    pub fn user_frame(&self, va: VirtAddr) -> Option<Pfn> {
        self.pages
            .borrow()
            .get(&va.page_base().as_u64())
            .map(|p| p.pfn)
    }

    /// Store into user memory without going through a pin.
    pub fn write_user(&self, va: VirtAddr, data: &[u8]) {
        self.for_each_user_chunk(va, data.len(), |pa, off, len| {
            self.mem.write(pa, &data[off..off + len])
        });
    }

    pub fn read_user(&self, va: VirtAddr, len: usize) -> Vec<u8> {
        let mut out = vec![0u8; len];
        self.for_each_user_chunk(va, len, |pa, off, n| self.mem.read(pa, &mut out[off..off + n]));
        out
    }

    pub fn read_user_u32(&self, va: VirtAddr) -> u32 {
        let b = self.read_user(va, 4);
        u32::from_ne_bytes([b[0], b[1], b[2], b[3]])
    }

    pub fn write_user_u32(&self, va: VirtAddr, v: u32) {
        self.write_user(va, &v.to_ne_bytes())
    }

    fn for_each_user_chunk(&self, va: VirtAddr, len: usize, mut f: impl FnMut(PhysAddr, usize, usize)) {
        let mut done = 0usize;
        while done < len {
            let at = va.wrapping_add(done as u64);
            let n = std::cmp::min(len - done, at.bytes_to_page_end() as usize);
            let page = self.fault_in(at).unwrap();
            f(page.pfn.to_phys().wrapping_add(at.page_offset()), done, n);
            done += n;
        }
    }

    /// Pins currently held across all frames.
    pub fn outstanding_pins(&self) -> usize {
        self.pins.borrow().values().sum()
    }

    /// Every pin request so far, as (page address, write intent).
    pub fn pin_log(&self) -> Vec<(VirtAddr, bool)> {
        self.pin_log.borrow().clone()
    }

    fn vma(&self, va: VirtAddr) -> Option<Vma> {
        self.vmas
            .borrow()
            .iter()
            .find(|v| v.range.contains(&va.as_u64()))
            .cloned()
    }

    fn fault_in(&self, va: VirtAddr) -> Result<UserPage, Errno> {
        self.vma(va).ok_or(Errno::EFAULT)?;
        let key = va.page_base().as_u64();
        if let Some(page) = self.pages.borrow().get(&key) {
            return Ok(*page);
        }
        let page = UserPage {
            pfn: self.mem.alloc_frame(),
            cow: false,
        };
        self.pages.borrow_mut().insert(key, page);
        Ok(page)
    }
}

impl GuestKernel for MockKernel {
    fn memory_layout(&self) -> GuestMemoryLayout {
        self.layout.clone()
    }

    fn task_layout(&self) -> TaskLayout {
        TASK_LAYOUT
    }

    fn possible_cpus(&self) -> impl Iterator<Item = usize> + '_ {
        self.cpus.borrow().clone().into_iter()
    }

    fn context_slot(&self, cpu: usize) -> PhysAddr {
        PhysAddr::new(CONTEXT_SLOTS_PHYS + (cpu as u64) * 0x1_0000)
    }

    fn pin_user_page(&self, va: VirtAddr, write: bool) -> Result<Pfn, Errno> {
        self.pin_log.borrow_mut().push((va, write));
        let vma = self.vma(va).ok_or(Errno::EFAULT)?;
        if write && !vma.writable {
            return Err(Errno::EFAULT);
        }
        let mut page = self.fault_in(va)?;
        if write && page.cow {
            let copy = self.mem.alloc_frame();
            self.mem.copy_frame(page.pfn, copy);
            page = UserPage {
                pfn: copy,
                cow: false,
            };
            self.pages.borrow_mut().insert(va.page_base().as_u64(), page);
        }
        *self.pins.borrow_mut().entry(page.pfn).or_insert(0) += 1;
        Ok(page.pfn)
    }

    fn unpin_user_page(&self, pfn: Pfn) {
        let mut pins = self.pins.borrow_mut();
        let count = pins.get_mut(&pfn).expect("unpin of a frame that is not pinned");
        *count -= 1;
        if *count == 0 {
            pins.remove(&pfn);
        }
    }

    fn is_vmalloc_or_module(&self, va: VirtAddr) -> bool {
        let va = va.as_u64();
        self.vmalloc.contains(&va) || (MODULES_VADDR..MODULES_END).contains(&va)
    }

    fn vmalloc_to_pfn(&self, va: VirtAddr) -> Option<Pfn> {
        self.tables.lookup(va).map(|pa| pa.pfn())
    }

    fn current_view_id(&self) -> u32 {
        self.mem.view_id()
    }

    fn current_user_ip(&self) -> VirtAddr {
        self.user_ip.get()
    }
}
