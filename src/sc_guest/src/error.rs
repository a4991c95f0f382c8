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

use sc_common::addr::VirtAddr;
use sc_common::call::ScCall;
use sc_common::descriptor::ProtocolError;
use thiserror::Error;

use crate::state::InitState;

pub type Result<T> = core::result::Result<T, ScError>;

/// A kernel error number, as reported by the guest kernel's
/// page-pinning and mapping services.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Errno(pub i32);

impl Errno {
    pub const EPERM: Errno = Errno(1);
    pub const ENOMEM: Errno = Errno(12);
    pub const EFAULT: Errno = Errno(14);
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "errno {}", self.0)
    }
}

/// The error type for secure container operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScError {
    /// The address could not be pinned or has no mapping
    #[error("cannot resolve {addr}: {errno}")]
    Resolution { addr: VirtAddr, errno: Errno },

    /// The hypervisor rejected or could not complete the call
    #[error("{call:?} hypercall failed with status {status}")]
    Hypercall { call: ScCall, status: i64 },

    /// An operation was attempted before initialization succeeded
    #[error("secure container support is not ready ({0:?})")]
    NotReady(InitState),

    /// `init` was called more than once
    #[error("secure container support already initialized ({0:?})")]
    AlreadyInitialized(InitState),

    /// An atomic target that is not naturally aligned for its width
    #[error("{addr} is not aligned to {align} bytes")]
    Misaligned { addr: VirtAddr, align: u32 },

    /// A possible processor does not fit the per-processor task table
    #[error("cpu {cpu} exceeds the {max}-entry task table")]
    TooManyCpus { cpu: usize, max: usize },

    /// The guest kernel reported an inconsistent memory layout
    #[error("invalid guest layout: {0}")]
    InvalidLayout(&'static str),

    /// A descriptor could not be encoded
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl ScError {
    /// The hypervisor's status code, unmodified, if this error came
    /// from a hypercall.
    pub fn status(&self) -> Option<i64> {
        match self {
            ScError::Hypercall { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// A bulk copy or clear that stopped part-way.
///
/// Chunks before the failing one have already been applied. `remaining`
/// is the number of bytes from the failing chunk onwards, not a count
/// of bytes moved; any non-zero value means the operation as a whole
/// failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{remaining} bytes left unprocessed: {cause}")]
pub struct PartialTransfer {
    pub remaining: u64,
    #[source]
    pub cause: ScError,
}
