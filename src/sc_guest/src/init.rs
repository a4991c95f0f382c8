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

use bytemuck::Zeroable;
use sc_common::PAGE_SIZE;
use sc_common::call::{Hypervisor, ScCall};
use sc_common::descriptor::{LayoutDescriptor, MAX_CPU};
#[cfg(feature = "tracing")]
use tracing::instrument;

use crate::error::{Result, ScError};
use crate::kernel::GuestKernel;
use crate::state::InitState;
use crate::{ScGuest, Staged};

fn check_range<T: PartialOrd>(r: &Range<T>, what: &'static str) -> Result<()> {
    if r.start > r.end {
        return Err(ScError::InvalidLayout(what));
    }
    Ok(())
}

impl<K: GuestKernel, H: Hypervisor> ScGuest<K, H> {
    /// Assemble the layout descriptor from the kernel's static layout,
    /// its task record offsets and every possible processor.
    ///
    /// Fails without touching the hypervisor if a processor id does not
    /// fit the per-processor table.
    pub fn build_layout(&self) -> Result<LayoutDescriptor> {
        let l = &self.layout;
        check_range(&l.kernel_text, "kernel text range is inverted")?;
        check_range(&l.vdso, "vdso range is inverted")?;
        check_range(&l.vvar, "vvar range is inverted")?;
        check_range(&l.zero_page, "zero page range is inverted")?;
        check_range(&l.kernel_vrange, "kernel virtual range is inverted")?;
        check_range(&l.module_vrange, "module virtual range is inverted")?;
        if (l.vdso.end.as_u64() - l.vdso.start.as_u64()) % PAGE_SIZE as u64 != 0 {
            return Err(ScError::InvalidLayout("vdso size is not a whole number of pages"));
        }

        let mut d = LayoutDescriptor::zeroed();
        d.is_x32 = l.is_x32 as u8;
        d.total_npages = l.total_npages;
        d.kernel_text_start = l.kernel_text.start.as_u64();
        d.kernel_text_end = l.kernel_text.end.as_u64();
        d.vdso_start = l.vdso.start.as_u64();
        d.vdso_end = l.vdso.end.as_u64();
        d.vvar_start = l.vvar.start.as_u64();
        d.vvar_end = l.vvar.end.as_u64();
        d.zero_start = l.zero_page.start.as_u64();
        d.zero_end = l.zero_page.end.as_u64();
        d.user_vrange_max = l.user_vrange_max.as_u64();
        d.kernel_vrange_start = l.kernel_vrange.start.as_u64();
        d.kernel_vrange_end = l.kernel_vrange.end.as_u64();
        d.module_vrange_start = l.module_vrange.start.as_u64();
        d.module_vrange_end = l.module_vrange.end.as_u64();
        d.pv = l.pv;
        d.erase_freed_page = self.config.get_erase_freed_pages() as u8;

        let task = self.kernel.task_layout();
        d.task.task_size = task.task_size;
        d.task.task2pid_off = task.pid_offset;
        d.task.task2viewid_off = task.view_id_offset;
        d.task.task2comm_off = task.comm_offset;
        d.task.task2thread_off = task.thread_offset;

        // smp_cpu counts ids, not processors: holes in the possible map
        // keep a zero slot
        let mut ncpu = 0usize;
        for cpu in self.kernel.possible_cpus() {
            if cpu >= MAX_CPU {
                return Err(ScError::TooManyCpus { cpu, max: MAX_CPU });
            }
            d.task.percpu_task[cpu] = self.kernel.context_slot(cpu).as_u64();
            ncpu = ncpu.max(cpu + 1);
        }
        if ncpu == 0 {
            return Err(ScError::InvalidLayout("no possible cpus"));
        }
        d.task.smp_cpu = ncpu as u32;
        Ok(d)
    }

    /// Hand the layout descriptor to the hypervisor. Runs at most once.
    ///
    /// On failure the subsystem stays disabled for the lifetime of the
    /// guest; the error is logged and returned but is not meant to stop
    /// the guest from booting.
    #[cfg_attr(feature = "tracing", instrument(err(Debug), skip(self), level = "Trace"))]
    pub fn init(&self) -> Result<()> {
        self.state.begin().map_err(ScError::AlreadyInitialized)?;

        let res = self.build_layout().and_then(|desc| {
            if self.config.get_dump_layout() {
                dump(&desc);
            }
            let staged = self.sent.call_once(|| Staged(desc));
            self.issue(ScCall::InitLayout, staged)
        });

        match res {
            Ok(()) => {
                self.state.finish(true);
                log::info!("secure container support enabled");
                Ok(())
            }
            Err(e) => {
                let state = self.state.finish(false);
                debug_assert_eq!(state, InitState::Failed);
                log::error!("secure container init failed: {}", e);
                Err(e)
            }
        }
    }
}

fn dump(d: &LayoutDescriptor) {
    log::debug!(
        "layout descriptor:\n\
         is_x32: {}\n\
         total_npages: {}\n\
         kernel_text: {:#x}..{:#x}\n\
         vdso: {:#x}..{:#x}\n\
         vvar: {:#x}..{:#x}\n\
         zero: {:#x}..{:#x}\n\
         user_vrange_max: {:#x}\n\
         kernel_vrange: {:#x}..{:#x}\n\
         module_vrange: {:#x}..{:#x}\n\
         smp_cpu: {}\n\
         percpu_task: {:x?}\n\
         task_size: {} pid: {} viewid: {} comm: {} thread: {}\n\
         phys_base: {:#x} start_kernel_map: {:#x} page_offset: {:#x}\n\
         erase_freed_page: {}",
        d.is_x32,
        d.total_npages,
        d.kernel_text_start,
        d.kernel_text_end,
        d.vdso_start,
        d.vdso_end,
        d.vvar_start,
        d.vvar_end,
        d.zero_start,
        d.zero_end,
        d.user_vrange_max,
        d.kernel_vrange_start,
        d.kernel_vrange_end,
        d.module_vrange_start,
        d.module_vrange_end,
        d.task.smp_cpu,
        d.task.percpu_tasks(),
        d.task.task_size,
        d.task.task2pid_off,
        d.task.task2viewid_off,
        d.task.task2comm_off,
        d.task.task2thread_off,
        d.pv.phys_base,
        d.pv.start_kernel_map,
        d.pv.page_offset,
        d.erase_freed_page,
    );
}
