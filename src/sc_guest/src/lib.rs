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

#![cfg_attr(not(any(test, debug_assertions)), warn(clippy::panic))]
#![cfg_attr(not(any(test, debug_assertions)), warn(clippy::expect_used))]
#![cfg_attr(not(any(test, debug_assertions)), warn(clippy::unwrap_used))]
#![cfg_attr(not(any(test, feature = "std")), no_std)]

//! Guest side of hypervisor-enforced secure containers.
//!
//! A guest hands the hypervisor a one-time description of its memory
//! layout ([`ScGuest::init`]), after which processes can ask for a
//! private isolation view ([`ScGuest::create_view`]) and kernel code can
//! read, write and atomically update memory that may sit behind such a
//! view through the data exchange calls, which never dereference the
//! target themselves.

extern crate alloc;

use sc_common::addr::VirtAddr;
use sc_common::call::{Hypervisor, ScCall};
use sc_common::descriptor::{
    ExchangeWire, LayoutDescriptor, PageRangeRecord, ViewDescriptor, WireDescriptor,
};
#[cfg(feature = "tracing")]
use tracing::instrument;

pub mod config;
pub mod error;
mod exchange;
#[cfg(target_arch = "x86_64")]
pub mod hypercall;
mod init;
pub mod kernel;
mod resolve;
pub mod state;
mod view;

pub use config::ScGuestConfig;
pub use error::{Errno, PartialTransfer, Result, ScError};
pub use kernel::{GuestKernel, GuestMemoryLayout, TaskLayout};
pub use resolve::{Access, Region, Resolved};
pub use state::InitState;

use crate::state::StateCell;

/// Backing storage for a descriptor whose address is handed to the
/// hypervisor. The alignment keeps any descriptor up to 512 bytes
/// inside a single page, so one translation covers all of it.
#[repr(C, align(512))]
pub(crate) struct Staged<D>(pub(crate) D);

const _: () = assert!(LayoutDescriptor::WIRE_SIZE <= 512);
const _: () = assert!(ViewDescriptor::WIRE_SIZE <= 512);
const _: () = assert!(PageRangeRecord::WIRE_SIZE <= 512);
const _: () = assert!(ExchangeWire::WIRE_SIZE <= 512);

/// The secure container subsystem of one guest.
///
/// Everything other than [`ScGuest::init`] and the pure queries refuses
/// to talk to the hypervisor until initialization has succeeded.
pub struct ScGuest<K: GuestKernel, H: Hypervisor> {
    kernel: K,
    hypervisor: H,
    config: ScGuestConfig,
    layout: GuestMemoryLayout,
    state: StateCell,
    sent: spin::Once<Staged<LayoutDescriptor>>,
}

impl<K: GuestKernel, H: Hypervisor> ScGuest<K, H> {
    pub fn new(kernel: K, hypervisor: H, config: ScGuestConfig) -> Self {
        let layout = kernel.memory_layout();
        Self {
            kernel,
            hypervisor,
            config,
            layout,
            state: StateCell::new(),
            sent: spin::Once::new(),
        }
    }

    pub fn kernel(&self) -> &K {
        &self.kernel
    }

    pub fn hypervisor(&self) -> &H {
        &self.hypervisor
    }

    pub fn config(&self) -> &ScGuestConfig {
        &self.config
    }

    pub fn state(&self) -> InitState {
        self.state.load()
    }

    /// The descriptor handed over by [`ScGuest::init`], once it has
    /// been sent.
    pub fn layout_descriptor(&self) -> Option<&LayoutDescriptor> {
        self.sent.get().map(|staged| &staged.0)
    }

    fn require_ready(&self) -> Result<()> {
        match self.state.load() {
            InitState::Ready => Ok(()),
            other => Err(ScError::NotReady(other)),
        }
    }

    /// Send `desc` by physical address. The translation (and any pin it
    /// needed) is held until the hypervisor returns.
    #[cfg_attr(feature = "tracing", instrument(err(Debug), skip_all, level = "Trace"))]
    fn issue<D: WireDescriptor>(&self, call: ScCall, desc: &Staged<D>) -> Result<()> {
        let at = self.resolve(VirtAddr::from_ptr(&desc.0), Access::Read)?;
        self.trap(call, at.phys().as_u64(), D::WIRE_SIZE as u64)
    }

    fn trap(&self, call: ScCall, arg: u64, len: u64) -> Result<()> {
        log::trace!("hypercall {:?} arg={:#x} len={}", call, arg, len);
        match self.hypervisor.hypercall(call, arg, len) {
            0 => Ok(()),
            status => Err(ScError::Hypercall { call, status }),
        }
    }
}
