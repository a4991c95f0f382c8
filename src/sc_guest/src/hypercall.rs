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

use core::arch::asm;

use sc_common::call::{Hypervisor, ScCall};

/// The KVM paravirtual hypercall, carrying the secure container call id
/// and its two arguments as the three hypercall arguments.
///
/// The hypercall number is the one the host kernel assigns to secure
/// containers; it is not part of the upstream KVM numbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KvmHypercall {
    nr: u64,
}

impl KvmHypercall {
    pub const fn new(nr: u64) -> Self {
        Self { nr }
    }
}

impl Hypervisor for KvmHypercall {
    /// rax = hypercall number, rbx/rcx/rdx = arguments, status in rax.
    #[inline(never)]
    fn hypercall(&self, call: ScCall, arg: u64, len: u64) -> i64 {
        let ret: i64;
        // rbx is reserved by the compiler, so the first argument is
        // swapped in and out around the trap. Memory is not marked
        // untouched: the hypervisor reads descriptors and writes result
        // slots behind this call.
        // SAFETY: vmcall only exits to the hypervisor; rbx is restored
        // before the block ends and every other register it touches is
        // declared
        unsafe {
            asm!(
                "xchg {a0}, rbx",
                "vmcall",
                "xchg {a0}, rbx",
                a0 = inout(reg) call as u64 => _,
                inlateout("rax") self.nr as i64 => ret,
                in("rcx") arg,
                in("rdx") len,
                options(nostack)
            );
        }
        ret
    }
}
