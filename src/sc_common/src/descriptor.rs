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

//! Every descriptor here is `#[repr(C)]` with its padding spelled out
//! as explicit fields, so the in-memory image the hypervisor reads is
//! fully initialised and byte-for-byte identical on both sides of the
//! call.

use core::mem::size_of;

use bytemuck::{Pod, Zeroable};
use thiserror::Error;

use crate::addr::{Pfn, PhysAddr, VirtAddr};
use crate::call::ExchangeOp;

/// Capacity of the per-processor current-task table.
pub const MAX_CPU: usize = 32;

/// A fixed-layout record that is handed to the hypervisor by physical
/// address.
pub trait WireDescriptor: Pod {
    const WIRE_SIZE: usize = size_of::<Self>();

    fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }

    /// Read a descriptor from the start of `bytes`, which need not be
    /// aligned.
    fn read_from(bytes: &[u8]) -> Option<Self> {
        bytes.get(..Self::WIRE_SIZE).map(bytemuck::pod_read_unaligned)
    }
}

/// Errors raised while encoding or decoding descriptors.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolError {
    /// The operation code is not one of [`ExchangeOp`]
    #[error("unknown data exchange op {0}")]
    UnknownOp(u32),

    /// A compare-and-swap width other than 1, 2, 4 or 8 bytes
    #[error("invalid compare-exchange size {0}")]
    InvalidSize(u32),

    /// A physical address that does not fit a 32-bit operand slot
    #[error("{field} address {addr} does not fit in 32 bits")]
    AddressTooWide { field: &'static str, addr: PhysAddr },

    /// The byte buffer is shorter than the descriptor
    #[error("descriptor truncated: got {got} bytes, need {need}")]
    Truncated { got: usize, need: usize },
}

/// Where the kernel's fixed virtual-to-physical mappings live.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable, PartialEq, Eq)]
pub struct PhysVirtMap {
    /// Physical load address of the kernel image
    pub phys_base: u64,
    /// Virtual base of the kernel image mapping
    pub start_kernel_map: u64,
    /// Virtual base of the direct map of all physical memory
    pub page_offset: u64,
}

impl PhysVirtMap {
    /// Translate an address in the kernel image or the direct map.
    ///
    /// The result is meaningless for user or dynamically mapped
    /// addresses; callers classify first.
    pub const fn kernel_virt_to_phys(&self, va: VirtAddr) -> PhysAddr {
        let va = va.as_u64();
        if va >= self.start_kernel_map {
            PhysAddr::new(va.wrapping_sub(self.start_kernel_map).wrapping_add(self.phys_base))
        } else {
            PhysAddr::new(va.wrapping_sub(self.page_offset))
        }
    }
}

/// Per-processor current-task table and the offsets the hypervisor
/// needs to pick a task record apart.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable, PartialEq, Eq)]
pub struct TaskConfig {
    pub smp_cpu: u32,
    _pad0: u32,
    /// Physical address of each processor's current-task pointer
    pub percpu_task: [u64; MAX_CPU],
    pub task_size: u32,
    pub task2pid_off: u32,
    pub task2viewid_off: u32,
    pub task2comm_off: u32,
    pub task2thread_off: u32,
    _pad1: u32,
}

impl TaskConfig {
    /// The populated part of the per-processor table.
    pub fn percpu_tasks(&self) -> &[u64] {
        let n = core::cmp::min(self.smp_cpu as usize, MAX_CPU);
        &self.percpu_task[..n]
    }
}

/// The one-time description of the guest handed over with
/// [`ScCall::InitLayout`](crate::call::ScCall::InitLayout).
///
/// Ranges are half-open `[start, end)`. Physical ranges hold guest
/// physical addresses, the `*_vrange_*` fields hold guest virtual
/// addresses.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable, PartialEq, Eq)]
pub struct LayoutDescriptor {
    pub is_x32: u8,
    _pad0: [u8; 7],
    pub total_npages: u64,

    pub kernel_text_start: u64,
    pub kernel_text_end: u64,
    pub vdso_start: u64,
    pub vdso_end: u64,
    pub vvar_start: u64,
    pub vvar_end: u64,
    pub zero_start: u64,
    pub zero_end: u64,
    pub user_vrange_max: u64,
    pub kernel_vrange_start: u64,
    pub kernel_vrange_end: u64,
    pub module_vrange_start: u64,
    pub module_vrange_end: u64,

    pub task: TaskConfig,
    pub pv: PhysVirtMap,

    pub erase_freed_page: u8,
    _pad1: [u8; 7],
}

impl WireDescriptor for LayoutDescriptor {}

const _: () = assert!(size_of::<TaskConfig>() == 288);
const _: () = assert!(size_of::<PhysVirtMap>() == 24);
const _: () = assert!(size_of::<LayoutDescriptor>() == 440);

/// Parameters of a [`ScCall::CreateView`](crate::call::ScCall::CreateView) request.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable, PartialEq, Eq)]
pub struct ViewDescriptor {
    /// Frame backing the page the requesting process executes from
    pub first_pfn: u64,
    pub enable_cluster: u8,
    _pad0: [u8; 3],
    pub cluster_id: u32,
}

impl ViewDescriptor {
    /// A cluster id of zero requests a standalone view.
    pub const fn new(first_pfn: Pfn, cluster_id: u32) -> Self {
        Self {
            first_pfn: first_pfn.as_u64(),
            enable_cluster: (cluster_id != 0) as u8,
            _pad0: [0; 3],
            cluster_id,
        }
    }

    pub const fn first_pfn(&self) -> Pfn {
        Pfn::new(self.first_pfn)
    }

    pub const fn cluster_enabled(&self) -> bool {
        self.enable_cluster != 0
    }
}

impl WireDescriptor for ViewDescriptor {}

const _: () = assert!(size_of::<ViewDescriptor>() == 16);

/// A run of guest frames, used for freed-page notification.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable, PartialEq, Eq)]
pub struct PageRangeRecord {
    pub start_gfn: u64,
    pub numpages: u32,
    _pad0: u32,
}

impl PageRangeRecord {
    pub const fn new(start: Pfn, numpages: u32) -> Self {
        Self {
            start_gfn: start.as_u64(),
            numpages,
            _pad0: 0,
        }
    }

    pub const fn start(&self) -> Pfn {
        Pfn::new(self.start_gfn)
    }
}

impl WireDescriptor for PageRangeRecord {}

const _: () = assert!(size_of::<PageRangeRecord>() == 16);

/// The 32-bit read-modify-write operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AtomicOp {
    Exchange,
    Add,
    Or,
    And,
    Xor,
}

impl From<AtomicOp> for ExchangeOp {
    fn from(op: AtomicOp) -> Self {
        match op {
            AtomicOp::Exchange => ExchangeOp::Exchange,
            AtomicOp::Add => ExchangeOp::Add,
            AtomicOp::Or => ExchangeOp::Or,
            AtomicOp::And => ExchangeOp::And,
            AtomicOp::Xor => ExchangeOp::Xor,
        }
    }
}

/// One boundary-crossing memory operation, with every operand given
/// as a guest physical address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exchange {
    /// Copy `size` bytes from `src` to `dst`; neither side may cross a
    /// page boundary.
    Move {
        src: PhysAddr,
        dst: PhysAddr,
        size: u64,
    },
    /// Fill `size` bytes at `ptr` with `value`, within one page.
    Set { ptr: PhysAddr, value: u8, size: u64 },
    /// `*old = *ptr; *ptr = op(*ptr, *operand)` on 32-bit words.
    Atomic {
        op: AtomicOp,
        old: PhysAddr,
        ptr: PhysAddr,
        operand: PhysAddr,
    },
    /// Compare `size` bytes at `ptr` against `*expected` and store
    /// `new` on a match.
    CompareExchange {
        ptr: PhysAddr,
        expected: PhysAddr,
        new: u64,
        size: u32,
    },
}

const PAYLOAD_SIZE: usize = 32;

/// The on-the-wire image of an [`Exchange`]: an operation code
/// followed by a payload whose shape depends on the code.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable, PartialEq, Eq)]
pub struct ExchangeWire {
    op: u32,
    _pad0: u32,
    payload: [u8; PAYLOAD_SIZE],
}

impl WireDescriptor for ExchangeWire {}

const _: () = assert!(size_of::<ExchangeWire>() == 40);

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct MovePayload {
    src: u64,
    dst: u64,
    size: u64,
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct SetPayload {
    ptr: u64,
    value: u8,
    _pad0: [u8; 7],
    size: u64,
}

/// 32-bit physical operand slots.
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct AtomicPayload {
    ptr: u32,
    operand: u32,
    old: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct CmpxchgPayload {
    ptr: u64,
    expected: u64,
    new: u64,
    size: u32,
    _pad0: u32,
}

const _: () = assert!(size_of::<MovePayload>() <= PAYLOAD_SIZE);
const _: () = assert!(size_of::<SetPayload>() <= PAYLOAD_SIZE);
const _: () = assert!(size_of::<AtomicPayload>() <= PAYLOAD_SIZE);
const _: () = assert!(size_of::<CmpxchgPayload>() <= PAYLOAD_SIZE);

impl ExchangeWire {
    fn new<P: Pod>(op: ExchangeOp, payload: P) -> Self {
        let mut wire = Self::zeroed();
        wire.op = op as u32;
        wire.payload[..size_of::<P>()].copy_from_slice(bytemuck::bytes_of(&payload));
        wire
    }

    fn payload<P: Pod>(&self) -> P {
        bytemuck::pod_read_unaligned(&self.payload[..size_of::<P>()])
    }
}

fn valid_cmpxchg_size(size: u32) -> bool {
    matches!(size, 1 | 2 | 4 | 8)
}

fn narrow(field: &'static str, addr: PhysAddr) -> Result<u32, ProtocolError> {
    u32::try_from(addr.as_u64()).map_err(|_| ProtocolError::AddressTooWide { field, addr })
}

impl Exchange {
    pub fn op(&self) -> ExchangeOp {
        match self {
            Exchange::Move { .. } => ExchangeOp::Move,
            Exchange::Set { .. } => ExchangeOp::Set,
            Exchange::Atomic { op, .. } => (*op).into(),
            Exchange::CompareExchange { .. } => ExchangeOp::CompareExchange,
        }
    }

    /// Lay the operation out the way the hypervisor reads it.
    ///
    /// The read-modify-write variants carry 32-bit physical operand
    /// slots; an operand above 4GiB is refused rather than truncated.
    pub fn encode(&self) -> Result<ExchangeWire, ProtocolError> {
        let op = self.op();
        Ok(match *self {
            Exchange::Move { src, dst, size } => ExchangeWire::new(
                op,
                MovePayload {
                    src: src.as_u64(),
                    dst: dst.as_u64(),
                    size,
                },
            ),
            Exchange::Set { ptr, value, size } => ExchangeWire::new(
                op,
                SetPayload {
                    ptr: ptr.as_u64(),
                    value,
                    _pad0: [0; 7],
                    size,
                },
            ),
            Exchange::Atomic {
                old, ptr, operand, ..
            } => ExchangeWire::new(
                op,
                AtomicPayload {
                    ptr: narrow("target", ptr)?,
                    operand: narrow("operand", operand)?,
                    old: narrow("old value", old)?,
                },
            ),
            Exchange::CompareExchange {
                ptr,
                expected,
                new,
                size,
            } => {
                if !valid_cmpxchg_size(size) {
                    return Err(ProtocolError::InvalidSize(size));
                }
                ExchangeWire::new(
                    op,
                    CmpxchgPayload {
                        ptr: ptr.as_u64(),
                        expected: expected.as_u64(),
                        new,
                        size,
                        _pad0: 0,
                    },
                )
            }
        })
    }

    /// Read an operation back out of its wire image.
    pub fn decode(wire: &ExchangeWire) -> Result<Self, ProtocolError> {
        let op = ExchangeOp::try_from(wire.op).map_err(|_| ProtocolError::UnknownOp(wire.op))?;
        let atomic = |op| {
            let p: AtomicPayload = wire.payload();
            Exchange::Atomic {
                op,
                ptr: PhysAddr::new(p.ptr as u64),
                operand: PhysAddr::new(p.operand as u64),
                old: PhysAddr::new(p.old as u64),
            }
        };
        Ok(match op {
            ExchangeOp::Move => {
                let p: MovePayload = wire.payload();
                Exchange::Move {
                    src: PhysAddr::new(p.src),
                    dst: PhysAddr::new(p.dst),
                    size: p.size,
                }
            }
            ExchangeOp::Set => {
                let p: SetPayload = wire.payload();
                Exchange::Set {
                    ptr: PhysAddr::new(p.ptr),
                    value: p.value,
                    size: p.size,
                }
            }
            ExchangeOp::Exchange => atomic(AtomicOp::Exchange),
            ExchangeOp::Add => atomic(AtomicOp::Add),
            ExchangeOp::Or => atomic(AtomicOp::Or),
            ExchangeOp::And => atomic(AtomicOp::And),
            ExchangeOp::Xor => atomic(AtomicOp::Xor),
            ExchangeOp::CompareExchange => {
                let p: CmpxchgPayload = wire.payload();
                if !valid_cmpxchg_size(p.size) {
                    return Err(ProtocolError::InvalidSize(p.size));
                }
                Exchange::CompareExchange {
                    ptr: PhysAddr::new(p.ptr),
                    expected: PhysAddr::new(p.expected),
                    new: p.new,
                    size: p.size,
                }
            }
        })
    }

    /// Decode straight from the bytes the hypervisor was handed.
    pub fn decode_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let wire = ExchangeWire::read_from(bytes).ok_or(ProtocolError::Truncated {
            got: bytes.len(),
            need: ExchangeWire::WIRE_SIZE,
        })?;
        Self::decode(&wire)
    }
}
