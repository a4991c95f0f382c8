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

#![cfg_attr(not(any(test, debug_assertions)), warn(clippy::panic))]
#![cfg_attr(not(any(test, debug_assertions)), warn(clippy::expect_used))]
#![cfg_attr(not(any(test, debug_assertions)), warn(clippy::unwrap_used))]
#![cfg_attr(not(any(test, feature = "std")), no_std)]

extern crate alloc;

/// Physical and virtual address newtypes, page frame numbers and
/// page-span arithmetic.
pub mod addr;

/// Hypercall identifiers, exchange operation codes and the
/// [`call::Hypervisor`] trap interface.
///
/// The guest and the hypervisor agree on a small numbered set of
/// operations. Each is issued as `(operation, descriptor gpa, descriptor
/// size)`; the descriptor layouts live in [`descriptor`].
pub mod call;

/// Fixed-layout descriptors exchanged over the hypercall interface.
pub mod descriptor;

pub use addr::{PAGE_SHIFT, PAGE_SIZE};
