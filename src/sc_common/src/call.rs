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

use anyhow::{Result, bail};

/// Secure container operations understood by the hypervisor.
/// - InitLayout: hand over the guest [`LayoutDescriptor`](crate::descriptor::LayoutDescriptor),
/// - CreateView: create an isolation view for the calling process,
/// - SetSharedPage: register a page shared between views,
/// - SetFreedPages: notify that a range of frames went back to the allocator,
/// - DataExchange: perform one [`Exchange`](crate::descriptor::Exchange).
#[repr(u64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScCall {
    InitLayout = 1,
    CreateView = 2,
    SetSharedPage = 3,
    SetFreedPages = 4,
    DataExchange = 5,
}

impl TryFrom<u64> for ScCall {
    type Error = anyhow::Error;
    fn try_from(val: u64) -> Result<Self> {
        match val {
            1 => Ok(ScCall::InitLayout),
            2 => Ok(ScCall::CreateView),
            3 => Ok(ScCall::SetSharedPage),
            4 => Ok(ScCall::SetFreedPages),
            5 => Ok(ScCall::DataExchange),
            _ => bail!("Invalid secure container call: {}", val),
        }
    }
}

/// Operation codes carried in the first word of an exchange descriptor.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExchangeOp {
    Move = 1,
    Set = 2,
    Exchange = 3,
    Add = 4,
    Or = 5,
    And = 6,
    Xor = 7,
    CompareExchange = 8,
}

impl TryFrom<u32> for ExchangeOp {
    type Error = anyhow::Error;
    fn try_from(val: u32) -> Result<Self> {
        match val {
            1 => Ok(ExchangeOp::Move),
            2 => Ok(ExchangeOp::Set),
            3 => Ok(ExchangeOp::Exchange),
            4 => Ok(ExchangeOp::Add),
            5 => Ok(ExchangeOp::Or),
            6 => Ok(ExchangeOp::And),
            7 => Ok(ExchangeOp::Xor),
            8 => Ok(ExchangeOp::CompareExchange),
            _ => bail!("Invalid data exchange op: {}", val),
        }
    }
}

/// The trap into the hypervisor.
///
/// `arg` is the guest physical address of the descriptor for `call`
/// (for [`ScCall::SetSharedPage`] it is the shared page itself) and
/// `len` its size in bytes. A status of zero means success; anything
/// else is the hypervisor's error code and is passed back to callers
/// untouched.
pub trait Hypervisor {
    fn hypercall(&self, call: ScCall, arg: u64, len: u64) -> i64;
}

impl<T: Hypervisor + ?Sized> Hypervisor for &T {
    fn hypercall(&self, call: ScCall, arg: u64, len: u64) -> i64 {
        (**self).hypercall(call, arg, len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_ids_round_trip() {
        for call in [
            ScCall::InitLayout,
            ScCall::CreateView,
            ScCall::SetSharedPage,
            ScCall::SetFreedPages,
            ScCall::DataExchange,
        ] {
            assert_eq!(ScCall::try_from(call as u64).unwrap(), call);
        }
    }

    #[test]
    fn unknown_call_id_is_rejected() {
        let err = ScCall::try_from(0).unwrap_err();
        assert_eq!(
            alloc::format!("{err}"),
            "Invalid secure container call: 0"
        );
        assert!(ScCall::try_from(6).is_err());
    }

    #[test]
    fn exchange_ops_match_wire_codes() {
        assert_eq!(ExchangeOp::Move as u32, 1);
        assert_eq!(ExchangeOp::CompareExchange as u32, 8);
        assert!(ExchangeOp::try_from(9).is_err());
        assert!(ExchangeOp::try_from(0).is_err());
        assert_eq!(ExchangeOp::try_from(5).unwrap(), ExchangeOp::Or);
    }
}
