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

//! Test doubles for `sc-guest`: a simulated guest kernel, a hypervisor
//! that records and executes calls against simulated physical memory,
//! and a capturing logger.

pub mod memory;
pub mod mock_hypervisor;
pub mod mock_kernel;
pub mod simplelogger;

pub use memory::PhysMemory;
pub use mock_hypervisor::{Decoded, MockHypervisor, RecordedCall};
pub use mock_kernel::MockKernel;

use sc_guest::{ScGuest, ScGuestConfig};

pub type MockGuest = ScGuest<MockKernel, MockHypervisor>;

/// A guest over a fresh simulated kernel, not yet initialized.
pub fn new_guest() -> MockGuest {
    new_guest_with(MockKernel::new(), ScGuestConfig::default())
}

pub fn new_guest_with(kernel: MockKernel, config: ScGuestConfig) -> MockGuest {
    let hv = kernel.hypervisor();
    ScGuest::new(kernel, hv, config)
}

/// A guest that has completed initialization.
pub fn ready_guest() -> MockGuest {
    let guest = new_guest();
    guest.init().unwrap();
    guest.hypervisor().clear();
    guest
}
