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

use core::ops::Range;

use sc_common::addr::{Pfn, PhysAddr, VirtAddr};
use sc_common::descriptor::PhysVirtMap;

use crate::error::Errno;

/// The guest's static memory layout, as far as the hypervisor needs to
/// know it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestMemoryLayout {
    /// The kernel runs with 32-bit longs
    pub is_x32: bool,
    /// Highest physical frame number plus one
    pub total_npages: u64,
    pub kernel_text: Range<PhysAddr>,
    pub vdso: Range<PhysAddr>,
    pub vvar: Range<PhysAddr>,
    pub zero_page: Range<PhysAddr>,
    /// First address above the per-process address space
    pub user_vrange_max: VirtAddr,
    /// From the kernel image base up to the module area
    pub kernel_vrange: Range<VirtAddr>,
    pub module_vrange: Range<VirtAddr>,
    pub pv: PhysVirtMap,
}

/// Where the hypervisor finds things inside a task record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskLayout {
    pub task_size: u32,
    pub pid_offset: u32,
    pub view_id_offset: u32,
    pub comm_offset: u32,
    pub thread_offset: u32,
}

/// The guest kernel services the secure container code relies on.
///
/// Implemented over the real memory manager in a kernel build and by
/// a simulated kernel in tests.
pub trait GuestKernel {
    fn memory_layout(&self) -> GuestMemoryLayout;

    fn task_layout(&self) -> TaskLayout;

    /// Every processor that may ever come online
    fn possible_cpus(&self) -> impl Iterator<Item = usize> + '_;

    /// Physical location of `cpu`'s current-task pointer.
    fn context_slot(&self, cpu: usize) -> PhysAddr;

    /// Fault in and pin the page backing a user address of the calling
    /// process. With `write` set a shared copy-on-write page is broken
    /// first, so the returned frame is private to the caller. May block.
    fn pin_user_page(&self, va: VirtAddr, write: bool) -> Result<Pfn, Errno>;

    /// Drop a pin taken with [`GuestKernel::pin_user_page`].
    fn unpin_user_page(&self, pfn: Pfn);

    /// Whether `va` lies in the vmalloc or module areas.
    fn is_vmalloc_or_module(&self, va: VirtAddr) -> bool;

    /// The frame backing a vmalloc or module address, if it is mapped.
    /// Inside a large mapping this is the 4KiB frame holding `va`.
    fn vmalloc_to_pfn(&self, va: VirtAddr) -> Option<Pfn>;

    /// The view id cached in the current task record. Zero means the
    /// task is not isolated.
    fn current_view_id(&self) -> u32;

    /// Instruction pointer saved on entry from user mode.
    fn current_user_ip(&self) -> VirtAddr;
}
