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

use core::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle of the secure container subsystem.
///
/// Transitions only go forward:
/// `Uninitialized -> Initializing -> Ready | Failed`. `Failed` is
/// terminal for the lifetime of the guest.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitState {
    Uninitialized = 0,
    Initializing = 1,
    Ready = 2,
    Failed = 3,
}

impl From<u8> for InitState {
    fn from(raw: u8) -> Self {
        match raw {
            0 => InitState::Uninitialized,
            1 => InitState::Initializing,
            2 => InitState::Ready,
            _ => InitState::Failed,
        }
    }
}

pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub(crate) const fn new() -> Self {
        Self(AtomicU8::new(InitState::Uninitialized as u8))
    }

    pub(crate) fn load(&self) -> InitState {
        self.0.load(Ordering::Acquire).into()
    }

    /// Claim the one initialization attempt. Returns the state that
    /// was observed if someone else already claimed it.
    pub(crate) fn begin(&self) -> Result<(), InitState> {
        self.0
            .compare_exchange(
                InitState::Uninitialized as u8,
                InitState::Initializing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(|_| ())
            .map_err(InitState::from)
    }

    /// Leave `Initializing`. Has no effect from any other state.
    pub(crate) fn finish(&self, ok: bool) -> InitState {
        let to = if ok {
            InitState::Ready
        } else {
            InitState::Failed
        };
        match self.0.compare_exchange(
            InitState::Initializing as u8,
            to as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => to,
            Err(cur) => cur.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_attempt_only() {
        let s = StateCell::new();
        assert_eq!(s.load(), InitState::Uninitialized);
        assert_eq!(s.begin(), Ok(()));
        assert_eq!(s.load(), InitState::Initializing);
        assert_eq!(s.begin(), Err(InitState::Initializing));
        assert_eq!(s.finish(true), InitState::Ready);
        assert_eq!(s.begin(), Err(InitState::Ready));
    }

    #[test]
    fn failed_is_terminal() {
        let s = StateCell::new();
        s.begin().unwrap();
        assert_eq!(s.finish(false), InitState::Failed);
        // a late success report cannot revive it
        assert_eq!(s.finish(true), InitState::Failed);
        assert_eq!(s.load(), InitState::Failed);
    }

    #[test]
    fn finish_without_begin_is_ignored() {
        let s = StateCell::new();
        assert_eq!(s.finish(true), InitState::Uninitialized);
        assert_eq!(s.load(), InitState::Uninitialized);
    }
}
