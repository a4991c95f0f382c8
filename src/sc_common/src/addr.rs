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

use core::fmt;

pub const PAGE_SHIFT: u32 = 12;
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT; // 4KB

const PAGE_MASK: u64 = PAGE_SIZE as u64 - 1;

/// A guest physical address.
///
/// Physical addresses are never dereferenced by the guest side of the
/// protocol; they only travel to the hypervisor inside descriptors.
#[repr(transparent)]
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PhysAddr(u64);

/// A guest virtual address, in any of the user, direct-map or
/// dynamically mapped kernel ranges.
#[repr(transparent)]
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VirtAddr(u64);

/// A guest physical frame number.
#[repr(transparent)]
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pfn(u64);

impl PhysAddr {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw value as it is written into a descriptor.
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    pub const fn pfn(self) -> Pfn {
        Pfn(self.0 >> PAGE_SHIFT)
    }

    pub const fn page_offset(self) -> u64 {
        self.0 & PAGE_MASK
    }

    pub const fn wrapping_add(self, bytes: u64) -> Self {
        Self(self.0.wrapping_add(bytes))
    }
}

impl VirtAddr {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn from_ptr<T: ?Sized>(ptr: *const T) -> Self {
        Self(ptr as *const u8 as usize as u64)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }

    pub const fn page_offset(self) -> u64 {
        self.0 & PAGE_MASK
    }

    pub const fn page_base(self) -> Self {
        Self(self.0 & !PAGE_MASK)
    }

    /// Number of bytes from this address up to and including the last
    /// byte of its page. Always in `1..=PAGE_SIZE`.
    pub const fn bytes_to_page_end(self) -> u64 {
        PAGE_SIZE as u64 - self.page_offset()
    }

    pub const fn wrapping_add(self, bytes: u64) -> Self {
        Self(self.0.wrapping_add(bytes))
    }
}

impl Pfn {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }

    pub const fn to_phys(self) -> PhysAddr {
        PhysAddr(self.0 << PAGE_SHIFT)
    }
}

macro_rules! hex_fmt {
    ($($ty:ident),*) => {
        $(
            impl fmt::Debug for $ty {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    write!(f, concat!(stringify!($ty), "({:#x})"), self.0)
                }
            }

            impl fmt::Display for $ty {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    write!(f, "{:#x}", self.0)
                }
            }

            impl fmt::LowerHex for $ty {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    fmt::LowerHex::fmt(&self.0, f)
                }
            }
        )*
    };
}

hex_fmt!(PhysAddr, VirtAddr, Pfn);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_span_of_aligned_address_is_whole_page() {
        assert_eq!(VirtAddr::new(0x4000).bytes_to_page_end(), PAGE_SIZE as u64);
    }

    #[test]
    fn page_span_of_last_byte_is_one() {
        assert_eq!(VirtAddr::new(0x4fff).bytes_to_page_end(), 1);
    }

    #[test]
    fn pfn_and_phys_agree() {
        let pa = PhysAddr::new(0x1234_5678);
        assert_eq!(pa.pfn(), Pfn::new(0x12345));
        assert_eq!(pa.pfn().to_phys().wrapping_add(pa.page_offset()), pa);
    }

    #[test]
    fn formats_as_hex() {
        use alloc::format;
        assert_eq!(format!("{}", VirtAddr::new(0xdead)), "0xdead");
        assert_eq!(format!("{:?}", Pfn::new(0x10)), "Pfn(0x10)");
    }
}
