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

use sc_common::addr::{PhysAddr, VirtAddr};
use sc_guest::{Access, Errno, Region, ScError, ScGuestConfig};
use sc_testing::mock_kernel::{
    MODULES_VADDR, PHYS_BASE, START_KERNEL_MAP, VMALLOC_START, VMALLOC_START_LA57,
};
use sc_testing::{MockGuest, MockKernel, new_guest_with};

const USER: u64 = 0x10_0000;

fn guest_with(setup: impl FnOnce(&MockKernel)) -> MockGuest {
    let kernel = MockKernel::new();
    setup(&kernel);
    new_guest_with(kernel, ScGuestConfig::default())
}

#[test]
fn classifies_the_three_regions() {
    let guest = guest_with(|_| {});
    let direct = VirtAddr::new(guest.kernel().memory().page_offset().wrapping_add(0x5000));

    assert_eq!(guest.classify(VirtAddr::new(USER)), Region::User);
    assert_eq!(guest.classify(VirtAddr::new(0)), Region::User);
    assert_eq!(guest.classify(direct), Region::DirectMap);
    assert_eq!(
        guest.classify(VirtAddr::new(START_KERNEL_MAP + 0x1000)),
        Region::DirectMap
    );
    assert_eq!(
        guest.classify(VirtAddr::new(VMALLOC_START + 0x1000)),
        Region::Dynamic
    );
    assert_eq!(
        guest.classify(VirtAddr::new(MODULES_VADDR + 0x1000)),
        Region::Dynamic
    );
}

#[test]
fn user_address_resolves_through_its_frame() {
    let guest = guest_with(|k| k.map_user(VirtAddr::new(USER), 0x4000, true));
    let va = VirtAddr::new(USER + 0x2123);
    assert_eq!(guest.kernel().user_frame(va), None);

    let pa = guest.uvirt_to_phys(va, Access::Read).unwrap();

    // demand paged on first use
    let frame = guest.kernel().user_frame(va).unwrap();
    assert_eq!(pa, frame.to_phys().wrapping_add(0x123));
    assert_eq!(guest.kernel().outstanding_pins(), 0);
}

#[test]
fn direct_map_and_kernel_image_use_fixed_offsets() {
    let guest = guest_with(|_| {});
    let direct = VirtAddr::new(guest.kernel().memory().page_offset().wrapping_add(0x5678));

    assert_eq!(
        guest.uvirt_to_phys(direct, Access::Write),
        Ok(PhysAddr::new(0x5678))
    );
    assert_eq!(
        guest.uvirt_to_phys(VirtAddr::new(START_KERNEL_MAP + 0x12_3456), Access::Read),
        Ok(PhysAddr::new(PHYS_BASE + 0x12_3456))
    );
    assert!(guest.kernel().pin_log().is_empty());
}

#[test]
fn vmalloc_address_walks_the_page_tables() {
    let va = VirtAddr::new(VMALLOC_START + 0x3045);
    let mut pfn = None;
    let guest = guest_with(|k| pfn = Some(k.map_vmalloc(va)));
    let pfn = pfn.unwrap();

    let r = guest.resolve(va, Access::Write).unwrap();

    assert_eq!(r.region(), Region::Dynamic);
    assert_eq!(r.phys(), pfn.to_phys().wrapping_add(0x45));
    assert_eq!(r.pinned(), None);
}

#[test]
fn module_address_in_a_large_page() {
    let base = VirtAddr::new(MODULES_VADDR + 0x20_0000);
    let guest = guest_with(|k| k.page_tables().map_2m(base, PhysAddr::new(0x4000_0000)));

    assert_eq!(
        guest.uvirt_to_phys(base.wrapping_add(0x1_1234), Access::Read),
        Ok(PhysAddr::new(0x4001_1234))
    );
}

#[test]
fn unmapped_vmalloc_address_fails() {
    let guest = guest_with(|_| {});
    let va = VirtAddr::new(VMALLOC_START + 0x8000);

    assert_eq!(
        guest.uvirt_to_phys(va, Access::Read),
        Err(ScError::Resolution {
            addr: va,
            errno: Errno::EFAULT
        })
    );
}

#[test]
fn missing_leaf_next_to_a_mapping_fails() {
    let mapped = VirtAddr::new(VMALLOC_START + 0x1000);
    let guest = guest_with(|k| {
        k.map_vmalloc(mapped);
    });
    let neighbour = VirtAddr::new(VMALLOC_START + 0x2010);

    assert!(guest.uvirt_to_phys(mapped, Access::Read).is_ok());
    assert_eq!(
        guest.uvirt_to_phys(neighbour, Access::Read),
        Err(ScError::Resolution {
            addr: neighbour,
            errno: Errno::EFAULT
        })
    );
}

#[test]
fn five_level_vmalloc_addresses_stay_distinct() {
    // differ only in bits 56:48
    let low = VirtAddr::new(VMALLOC_START_LA57 + 0xc900_0001_2345);
    let high = VirtAddr::new(low.as_u64() + (1 << 48));
    let kernel = MockKernel::new_la57();
    let low_pfn = kernel.map_vmalloc(low);
    let high_pfn = kernel.map_vmalloc(high);
    let guest = new_guest_with(kernel, ScGuestConfig::default());
    assert_ne!(low_pfn, high_pfn);

    assert_eq!(guest.classify(low), Region::Dynamic);
    assert_eq!(guest.classify(high), Region::Dynamic);
    assert_eq!(
        guest.uvirt_to_phys(low, Access::Read),
        Ok(low_pfn.to_phys().wrapping_add(0x345))
    );
    assert_eq!(
        guest.uvirt_to_phys(high, Access::Read),
        Ok(high_pfn.to_phys().wrapping_add(0x345))
    );
}

#[test]
fn unmapped_user_address_fails() {
    let guest = guest_with(|k| k.map_user(VirtAddr::new(USER), 0x1000, true));
    let va = VirtAddr::new(USER + 0x1000);

    assert_eq!(
        guest.uvirt_to_phys(va, Access::Read),
        Err(ScError::Resolution {
            addr: va,
            errno: Errno::EFAULT
        })
    );
    assert_eq!(guest.kernel().outstanding_pins(), 0);
}

#[test]
fn write_to_read_only_mapping_fails() {
    let guest = guest_with(|k| k.map_user(VirtAddr::new(USER), 0x1000, false));
    let va = VirtAddr::new(USER + 0x10);

    assert!(guest.uvirt_to_phys(va, Access::Read).is_ok());
    assert_eq!(
        guest.uvirt_to_phys(va, Access::Write),
        Err(ScError::Resolution {
            addr: va,
            errno: Errno::EFAULT
        })
    );
}

#[test]
fn write_intent_breaks_copy_on_write() {
    let guest = guest_with(|k| k.map_user(VirtAddr::new(USER), 0x1000, true));
    let va = VirtAddr::new(USER + 0x40);
    guest.kernel().write_user(va, b"hello");
    let shared = guest.kernel().share_page(va);

    let read = guest.uvirt_to_phys(va, Access::Read).unwrap();
    assert_eq!(read.pfn(), shared);

    let written = guest.uvirt_to_phys(va, Access::Write).unwrap();
    assert_ne!(written.pfn(), shared);
    assert_eq!(written.page_offset(), 0x40);

    // the private copy carries the old contents and is now mapped
    assert_eq!(guest.kernel().read_user(va, 5), b"hello");
    assert_eq!(guest.kernel().user_frame(va), Some(written.pfn()));
    assert_eq!(guest.uvirt_to_phys(va, Access::Read), Ok(written));
}

#[test]
fn pin_is_held_until_drop() {
    let guest = guest_with(|k| k.map_user(VirtAddr::new(USER), 0x2000, true));

    let a = guest.resolve(VirtAddr::new(USER + 8), Access::Write).unwrap();
    let b = guest.resolve(VirtAddr::new(USER + 0x1008), Access::Read).unwrap();
    assert_eq!(a.region(), Region::User);
    assert_eq!(a.pinned(), Some(a.phys().pfn()));
    assert_eq!(guest.kernel().outstanding_pins(), 2);

    drop(a);
    assert_eq!(guest.kernel().outstanding_pins(), 1);
    drop(b);
    assert_eq!(guest.kernel().outstanding_pins(), 0);
}

#[test]
fn resolution_needs_no_initialization() {
    let guest = guest_with(|k| k.map_user(VirtAddr::new(USER), 0x1000, true));

    assert!(guest.uvirt_to_phys(VirtAddr::new(USER), Access::Read).is_ok());
    assert_eq!(guest.hypervisor().num_calls(), 0);
}
