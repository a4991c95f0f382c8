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

//! Virtual to physical address resolution.

use sc_common::addr::{Pfn, PhysAddr, VirtAddr};
use sc_common::call::Hypervisor;

use crate::error::{Errno, Result, ScError};
use crate::kernel::GuestKernel;
use crate::ScGuest;

/// What the caller intends to do with the memory once resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    /// Breaks copy-on-write sharing of user pages
    Write,
}

/// The three ways a guest virtual address is backed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Region {
    /// Per-process address space; pages may be absent or shared
    User,
    /// Kernel image or direct map; permanently resident
    DirectMap,
    /// vmalloc and module areas; only the kernel's mappings know the frame
    Dynamic,
}

/// A resolved physical address.
///
/// For user addresses the backing frame stays pinned until this value
/// is dropped, so it cannot be reclaimed or migrated while the
/// hypervisor is working on it.
#[must_use]
pub struct Resolved<'k, K: GuestKernel> {
    phys: PhysAddr,
    region: Region,
    pin: Option<(&'k K, Pfn)>,
}

impl<K: GuestKernel> Resolved<'_, K> {
    pub fn phys(&self) -> PhysAddr {
        self.phys
    }

    pub fn region(&self) -> Region {
        self.region
    }

    pub fn pinned(&self) -> Option<Pfn> {
        self.pin.map(|(_, pfn)| pfn)
    }
}

impl<K: GuestKernel> core::fmt::Debug for Resolved<'_, K> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Resolved")
            .field("phys", &self.phys)
            .field("region", &self.region)
            .field("pinned", &self.pinned())
            .finish()
    }
}

impl<K: GuestKernel> Drop for Resolved<'_, K> {
    fn drop(&mut self) {
        if let Some((kernel, pfn)) = self.pin.take() {
            kernel.unpin_user_page(pfn);
        }
    }
}

impl<K: GuestKernel, H: Hypervisor> ScGuest<K, H> {
    pub fn classify(&self, va: VirtAddr) -> Region {
        if va < self.layout.user_vrange_max {
            Region::User
        } else if self.kernel.is_vmalloc_or_module(va) {
            Region::Dynamic
        } else {
            Region::DirectMap
        }
    }

    /// Resolve `va` to the physical address currently backing it.
    ///
    /// User pages are faulted in and pinned (honouring `access` for
    /// copy-on-write); the pin lives as long as the returned value.
    pub fn resolve(&self, va: VirtAddr, access: Access) -> Result<Resolved<'_, K>> {
        match self.classify(va) {
            Region::User => self.pin_user(va, access),
            Region::DirectMap => Ok(Resolved {
                phys: self.layout.pv.kernel_virt_to_phys(va),
                region: Region::DirectMap,
                pin: None,
            }),
            Region::Dynamic => {
                let pfn = self
                    .kernel
                    .vmalloc_to_pfn(va)
                    .ok_or(ScError::Resolution {
                        addr: va,
                        errno: Errno::EFAULT,
                    })?;
                Ok(Resolved {
                    phys: pfn.to_phys().wrapping_add(va.page_offset()),
                    region: Region::Dynamic,
                    pin: None,
                })
            }
        }
    }

    /// Pin the user page at `va`. Addresses outside the per-process
    /// range are refused.
    pub(crate) fn pin_user(&self, va: VirtAddr, access: Access) -> Result<Resolved<'_, K>> {
        if va >= self.layout.user_vrange_max {
            return Err(ScError::Resolution {
                addr: va,
                errno: Errno::EFAULT,
            });
        }
        let pfn = self
            .kernel
            .pin_user_page(va.page_base(), access == Access::Write)
            .map_err(|errno| ScError::Resolution { addr: va, errno })?;
        Ok(Resolved {
            phys: pfn.to_phys().wrapping_add(va.page_offset()),
            region: Region::User,
            pin: Some((&self.kernel, pfn)),
        })
    }

    /// Translate `va` without keeping the page pinned.
    ///
    /// For user addresses the result is only stable while the caller
    /// holds its own reference on the page; [`ScGuest::resolve`] is the
    /// safe choice when the address is about to be handed out.
    pub fn uvirt_to_phys(&self, va: VirtAddr, access: Access) -> Result<PhysAddr> {
        self.resolve(va, access).map(|r| r.phys())
    }
}
