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

//! Boundary-crossing memory operations.
//!
//! Every operand is translated to a physical address and the hypervisor
//! performs the access. Single operations must stay inside one page on
//! every side; [`ScGuest::data_copy`] and [`ScGuest::clear_user`] split
//! longer regions into page-bounded chunks.

use core::cell::UnsafeCell;
use core::cmp::min;

use sc_common::addr::VirtAddr;
use sc_common::call::{Hypervisor, ScCall};
use sc_common::descriptor::{AtomicOp, Exchange, ProtocolError};
#[cfg(feature = "tracing")]
use tracing::instrument;

use crate::error::{PartialTransfer, Result, ScError};
use crate::kernel::GuestKernel;
use crate::resolve::Access;
use crate::{ScGuest, Staged};

fn check_aligned(addr: VirtAddr, align: u32) -> Result<()> {
    if addr.as_u64() % align as u64 != 0 {
        return Err(ScError::Misaligned { addr, align });
    }
    Ok(())
}

impl<K: GuestKernel, H: Hypervisor> ScGuest<K, H> {
    fn exchange(&self, ex: Exchange) -> Result<()> {
        let staged = Staged(ex.encode()?);
        self.issue(ScCall::DataExchange, &staged)
    }

    /// Copy `size` bytes from `src` to `dst`. Neither range may cross a
    /// page boundary.
    #[cfg_attr(feature = "tracing", instrument(err(Debug), skip(self), level = "Trace"))]
    pub fn data_move(&self, src: VirtAddr, dst: VirtAddr, size: u64) -> Result<()> {
        self.require_ready()?;
        let src = self.resolve(src, Access::Read)?;
        let dst = self.resolve(dst, Access::Write)?;
        self.exchange(Exchange::Move {
            src: src.phys(),
            dst: dst.phys(),
            size,
        })
    }

    /// Fill `size` bytes at `ptr` with `value`, within one page.
    #[cfg_attr(feature = "tracing", instrument(err(Debug), skip(self), level = "Trace"))]
    pub fn data_set(&self, ptr: VirtAddr, value: u8, size: u64) -> Result<()> {
        self.require_ready()?;
        let ptr = self.resolve(ptr, Access::Write)?;
        self.exchange(Exchange::Set {
            ptr: ptr.phys(),
            value,
            size,
        })
    }

    fn data_atomic(&self, op: AtomicOp, uaddr: VirtAddr, operand: u32) -> Result<u32> {
        self.require_ready()?;
        check_aligned(uaddr, 4)?;

        let old = UnsafeCell::new(0u32);
        let arg = UnsafeCell::new(operand);
        let old_at = self.resolve(VirtAddr::from_ptr(old.get()), Access::Write)?;
        let ptr_at = self.resolve(uaddr, Access::Write)?;
        let arg_at = self.resolve(VirtAddr::from_ptr(arg.get()), Access::Read)?;
        self.exchange(Exchange::Atomic {
            op,
            old: old_at.phys(),
            ptr: ptr_at.phys(),
            operand: arg_at.phys(),
        })?;
        // SAFETY: the hypervisor wrote the prior value through the
        // physical alias of `old` before returning
        Ok(unsafe { core::ptr::read_volatile(old.get()) })
    }

    /// Atomically store `value` at `uaddr`, returning the previous word.
    #[cfg_attr(feature = "tracing", instrument(err(Debug), skip(self), level = "Trace"))]
    pub fn data_xchg(&self, uaddr: VirtAddr, value: u32) -> Result<u32> {
        self.data_atomic(AtomicOp::Exchange, uaddr, value)
    }

    /// Atomic wrapping add. Returns the previous word.
    #[cfg_attr(feature = "tracing", instrument(err(Debug), skip(self), level = "Trace"))]
    pub fn data_add(&self, uaddr: VirtAddr, operand: u32) -> Result<u32> {
        self.data_atomic(AtomicOp::Add, uaddr, operand)
    }

    #[cfg_attr(feature = "tracing", instrument(err(Debug), skip(self), level = "Trace"))]
    pub fn data_or(&self, uaddr: VirtAddr, operand: u32) -> Result<u32> {
        self.data_atomic(AtomicOp::Or, uaddr, operand)
    }

    #[cfg_attr(feature = "tracing", instrument(err(Debug), skip(self), level = "Trace"))]
    pub fn data_and(&self, uaddr: VirtAddr, operand: u32) -> Result<u32> {
        self.data_atomic(AtomicOp::And, uaddr, operand)
    }

    #[cfg_attr(feature = "tracing", instrument(err(Debug), skip(self), level = "Trace"))]
    pub fn data_xor(&self, uaddr: VirtAddr, operand: u32) -> Result<u32> {
        self.data_atomic(AtomicOp::Xor, uaddr, operand)
    }

    /// Compare the `size` bytes at `ptr` with the low `size` bytes of
    /// `expected` and store `new` if they match.
    ///
    /// Returns the value left in the expected slot: equal to `expected`
    /// when the swap happened, the current contents of `ptr` otherwise.
    /// No retry is attempted.
    #[cfg_attr(feature = "tracing", instrument(err(Debug), skip(self), level = "Trace"))]
    pub fn data_cmpxchg(&self, ptr: VirtAddr, expected: u64, new: u64, size: u32) -> Result<u64> {
        self.require_ready()?;
        if !matches!(size, 1 | 2 | 4 | 8) {
            return Err(ProtocolError::InvalidSize(size).into());
        }
        check_aligned(ptr, size)?;

        let slot = UnsafeCell::new(expected);
        let ptr_at = self.resolve(ptr, Access::Write)?;
        let slot_at = self.resolve(VirtAddr::from_ptr(slot.get()), Access::Write)?;
        self.exchange(Exchange::CompareExchange {
            ptr: ptr_at.phys(),
            expected: slot_at.phys(),
            new,
            size,
        })?;
        // SAFETY: as for the read-modify-write operations
        Ok(unsafe { core::ptr::read_volatile(slot.get()) })
    }

    /// Copy `len` bytes from `from` to `to`, one page-bounded move at a
    /// time. Copying nothing always succeeds.
    ///
    /// Stops at the first failing chunk. Chunks before it stay applied
    /// and the error reports how many bytes were left, counting the
    /// failed chunk.
    #[cfg_attr(feature = "tracing", instrument(err(Debug), skip(self), level = "Trace"))]
    pub fn data_copy(
        &self,
        to: VirtAddr,
        from: VirtAddr,
        len: u64,
    ) -> core::result::Result<(), PartialTransfer> {
        if len == 0 {
            return Ok(());
        }
        self.require_ready().map_err(|cause| PartialTransfer {
            remaining: len,
            cause,
        })?;

        let (mut src, mut dst, mut left) = (from, to, len);
        while left > 0 {
            let size = min(left, min(src.bytes_to_page_end(), dst.bytes_to_page_end()));
            if let Err(cause) = self.data_move(src, dst, size) {
                log::error!("data move of {} bytes {} -> {} failed: {}", size, src, dst, cause);
                return Err(PartialTransfer {
                    remaining: left,
                    cause,
                });
            }
            left -= size;
            src = src.wrapping_add(size);
            dst = dst.wrapping_add(size);
        }
        Ok(())
    }

    /// Zero `len` bytes starting at `addr`, one page-bounded set at a
    /// time. Partial failure is reported as for [`ScGuest::data_copy`].
    #[cfg_attr(feature = "tracing", instrument(err(Debug), skip(self), level = "Trace"))]
    pub fn clear_user(&self, addr: VirtAddr, len: u64) -> core::result::Result<(), PartialTransfer> {
        if len == 0 {
            return Ok(());
        }
        self.require_ready().map_err(|cause| PartialTransfer {
            remaining: len,
            cause,
        })?;

        let (mut ptr, mut left) = (addr, len);
        while left > 0 {
            let size = min(left, ptr.bytes_to_page_end());
            if let Err(cause) = self.data_set(ptr, 0, size) {
                log::error!("clearing {} bytes at {} failed: {}", size, ptr, cause);
                return Err(PartialTransfer {
                    remaining: left,
                    cause,
                });
            }
            left -= size;
            ptr = ptr.wrapping_add(size);
        }
        Ok(())
    }
}
