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

use core::mem::size_of;

use sc_common::addr::Pfn;
use sc_common::call::{Hypervisor, ScCall};
use sc_common::descriptor::{PageRangeRecord, ViewDescriptor};
#[cfg(feature = "tracing")]
use tracing::instrument;

use crate::error::Result;
use crate::kernel::GuestKernel;
use crate::resolve::Access;
use crate::{ScGuest, Staged};

impl<K: GuestKernel, H: Hypervisor> ScGuest<K, H> {
    /// Ask for an isolation view for the calling process.
    ///
    /// The frame the process is executing from anchors the view. A
    /// `cluster_id` of zero requests a standalone view; any other value
    /// joins the views sharing that id. On error no view exists and the
    /// process stays unisolated.
    #[cfg_attr(feature = "tracing", instrument(err(Debug), skip(self), level = "Trace"))]
    pub fn create_view(&self, cluster_id: u32) -> Result<()> {
        self.require_ready()?;
        let ip = self.kernel.current_user_ip();
        let entry = self.pin_user(ip, Access::Read).inspect_err(|e| {
            log::error!("cannot pin entry page at {} for create view: {}", ip, e);
        })?;
        let desc = Staged(ViewDescriptor::new(entry.phys().pfn(), cluster_id));
        self.issue(ScCall::CreateView, &desc)
    }

    /// Whether the current process runs inside an isolation view.
    pub fn is_in_sc(&self) -> bool {
        self.kernel.current_view_id() != 0
    }

    /// Report `count` frames starting at `start` as returned to the
    /// allocator. The frames are already free whatever the outcome.
    #[cfg_attr(feature = "tracing", instrument(err(Debug), skip(self), level = "Trace"))]
    pub fn free_pages(&self, start: Pfn, count: u32) -> Result<()> {
        self.require_ready()?;
        let desc = Staged(PageRangeRecord::new(start, count));
        self.issue(ScCall::SetFreedPages, &desc)
    }

    /// Report `pfn` as shared between views. The frame address itself is
    /// the call argument.
    #[cfg_attr(feature = "tracing", instrument(err(Debug), skip(self), level = "Trace"))]
    pub fn set_shared_page(&self, pfn: Pfn) -> Result<()> {
        self.require_ready()?;
        self.trap(
            ScCall::SetSharedPage,
            pfn.to_phys().as_u64(),
            size_of::<u64>() as u64,
        )
    }
}
