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

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use sc_common::PAGE_SIZE;
use sc_common::addr::PhysAddr;
use sc_common::call::{Hypervisor, ScCall};
use sc_common::descriptor::{
    AtomicOp, Exchange, LayoutDescriptor, PageRangeRecord, ViewDescriptor, WireDescriptor,
};

use crate::memory::PhysMemory;

/// Status returned for descriptors the simulated hypervisor cannot
/// make sense of.
pub const EINVAL: i64 = -22;

/// A descriptor as the hypervisor read it out of guest memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    Layout(LayoutDescriptor),
    View(ViewDescriptor),
    FreedPages(PageRangeRecord),
    SharedPage(PhysAddr),
    Exchange(Exchange),
    Malformed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    pub call: ScCall,
    pub arg: u64,
    pub len: u64,
    pub decoded: Decoded,
    pub status: i64,
}

/// A hypervisor that records every call and carries out data exchanges
/// against the simulated physical memory.
///
/// Failures can be scripted per call kind: the `nth` call of that kind
/// (counting from zero) returns the given status without doing
/// anything.
pub struct MockHypervisor {
    mem: Rc<PhysMemory>,
    calls: RefCell<Vec<RecordedCall>>,
    counts: RefCell<HashMap<ScCall, usize>>,
    failures: RefCell<HashMap<(ScCall, usize), i64>>,
    always_fail: RefCell<HashMap<ScCall, i64>>,
    next_view_id: Cell<u32>,
}

impl MockHypervisor {
    pub(crate) fn new(mem: Rc<PhysMemory>) -> Self {
        Self {
            mem,
            calls: RefCell::new(Vec::new()),
            counts: RefCell::new(HashMap::new()),
            failures: RefCell::new(HashMap::new()),
            always_fail: RefCell::new(HashMap::new()),
            next_view_id: Cell::new(1),
        }
    }

    /// Make the `nth` call of kind `call` return `status`.
    pub fn fail_nth(&self, call: ScCall, nth: usize, status: i64) {
        self.failures.borrow_mut().insert((call, nth), status);
    }

    /// Make every call of kind `call` return `status`.
    pub fn fail_all(&self, call: ScCall, status: i64) {
        self.always_fail.borrow_mut().insert(call, status);
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.borrow().clone()
    }

    pub fn calls_of(&self, call: ScCall) -> Vec<RecordedCall> {
        self.calls
            .borrow()
            .iter()
            .filter(|c| c.call == call)
            .cloned()
            .collect()
    }

    pub fn num_calls(&self) -> usize {
        self.calls.borrow().len()
    }

    /// Every data exchange received, including failed ones.
    pub fn exchanges(&self) -> Vec<Exchange> {
        self.calls
            .borrow()
            .iter()
            .filter_map(|c| match c.decoded {
                Decoded::Exchange(ex) => Some(ex),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        self.calls.borrow_mut().clear();
    }

    fn decode(&self, call: ScCall, arg: u64, len: u64) -> Decoded {
        if call == ScCall::SetSharedPage {
            return if len == 8 {
                Decoded::SharedPage(PhysAddr::new(arg))
            } else {
                Decoded::Malformed
            };
        }
        let pa = PhysAddr::new(arg);
        if len as usize > PAGE_SIZE - pa.page_offset() as usize {
            return Decoded::Malformed;
        }
        let mut bytes = vec![0u8; len as usize];
        self.mem.read(pa, &mut bytes);
        match call {
            ScCall::InitLayout => read_exact(&bytes).map(Decoded::Layout),
            ScCall::CreateView => read_exact(&bytes).map(Decoded::View),
            ScCall::SetFreedPages => read_exact(&bytes).map(Decoded::FreedPages),
            ScCall::DataExchange => Exchange::decode_bytes(&bytes).ok().map(Decoded::Exchange),
            ScCall::SetSharedPage => None,
        }
        .unwrap_or(Decoded::Malformed)
    }

    fn perform(&self, decoded: &Decoded) -> i64 {
        match decoded {
            Decoded::Malformed => EINVAL,
            Decoded::View(_) => {
                let id = self.next_view_id.get();
                self.next_view_id.set(id + 1);
                self.mem.set_view_id(id);
                0
            }
            Decoded::Exchange(ex) => self.exchange(ex),
            _ => 0,
        }
    }

    fn exchange(&self, ex: &Exchange) -> i64 {
        let fits = |pa: PhysAddr, size: u64| pa.page_offset() + size <= PAGE_SIZE as u64;
        match *ex {
            Exchange::Move { src, dst, size } => {
                if !fits(src, size) || !fits(dst, size) {
                    return EINVAL;
                }
                let mut buf = vec![0u8; size as usize];
                self.mem.read(src, &mut buf);
                self.mem.write(dst, &buf);
            }
            Exchange::Set { ptr, value, size } => {
                if !fits(ptr, size) {
                    return EINVAL;
                }
                self.mem.write(ptr, &vec![value; size as usize]);
            }
            Exchange::Atomic {
                op,
                old,
                ptr,
                operand,
            } => {
                let cur = self.mem.read_u32(ptr);
                let arg = self.mem.read_u32(operand);
                let new = match op {
                    AtomicOp::Exchange => arg,
                    AtomicOp::Add => cur.wrapping_add(arg),
                    AtomicOp::Or => cur | arg,
                    AtomicOp::And => cur & arg,
                    AtomicOp::Xor => cur ^ arg,
                };
                self.mem.write_u32(ptr, new);
                self.mem.write_u32(old, cur);
            }
            Exchange::CompareExchange {
                ptr,
                expected,
                new,
                size,
            } => {
                let n = size as usize;
                if !fits(ptr, n as u64) {
                    return EINVAL;
                }
                let mut cur = [0u8; 8];
                let mut want = [0u8; 8];
                self.mem.read(ptr, &mut cur[..n]);
                self.mem.read(expected, &mut want);
                if cur[..n] == want[..n] {
                    self.mem.write(ptr, &new.to_ne_bytes()[..n]);
                } else {
                    self.mem.write(expected, &cur[..n]);
                }
            }
        }
        0
    }
}

fn read_exact<D: WireDescriptor>(bytes: &[u8]) -> Option<D> {
    if bytes.len() != D::WIRE_SIZE {
        return None;
    }
    D::read_from(bytes)
}

impl Hypervisor for MockHypervisor {
    fn hypercall(&self, call: ScCall, arg: u64, len: u64) -> i64 {
        let nth = {
            let mut counts = self.counts.borrow_mut();
            let n = counts.entry(call).or_insert(0);
            *n += 1;
            *n - 1
        };
        let decoded = self.decode(call, arg, len);
        let scripted = self
            .failures
            .borrow()
            .get(&(call, nth))
            .copied()
            .or_else(|| self.always_fail.borrow().get(&call).copied());
        let status = match scripted {
            Some(status) => status,
            None => self.perform(&decoded),
        };
        self.calls.borrow_mut().push(RecordedCall {
            call,
            arg,
            len,
            decoded,
            status,
        });
        status
    }
}
