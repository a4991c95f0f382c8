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

/// Guest-side choices that end up in the layout descriptor or affect
/// how initialization reports itself.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ScGuestConfig {
    /// Ask the hypervisor to zero frames reported through freed-page
    /// notifications before they can be handed to another view.
    erase_freed_pages: bool,
    /// Log every field of the layout descriptor at debug level before
    /// it is sent.
    dump_layout: bool,
}

impl ScGuestConfig {
    /// Freed frames are not erased unless asked for
    pub const DEFAULT_ERASE_FREED_PAGES: bool = false;
    /// The layout descriptor is logged by default
    pub const DEFAULT_DUMP_LAYOUT: bool = true;

    /// Set whether the hypervisor should erase freed pages
    pub fn set_erase_freed_pages(&mut self, erase: bool) {
        self.erase_freed_pages = erase;
    }

    /// Get whether the hypervisor should erase freed pages
    pub fn get_erase_freed_pages(&self) -> bool {
        self.erase_freed_pages
    }

    /// Set whether the layout descriptor is logged during initialization
    pub fn set_dump_layout(&mut self, dump: bool) {
        self.dump_layout = dump;
    }

    pub fn get_dump_layout(&self) -> bool {
        self.dump_layout
    }
}

impl Default for ScGuestConfig {
    fn default() -> Self {
        Self {
            erase_freed_pages: Self::DEFAULT_ERASE_FREED_PAGES,
            dump_layout: Self::DEFAULT_DUMP_LAYOUT,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::ScGuestConfig;

    #[test]
    fn defaults() {
        let cfg = ScGuestConfig::default();
        assert!(!cfg.get_erase_freed_pages());
        assert!(cfg.get_dump_layout());
    }

    #[test]
    fn setters() {
        let mut cfg = ScGuestConfig::default();
        cfg.set_erase_freed_pages(true);
        cfg.set_dump_layout(false);
        assert!(cfg.get_erase_freed_pages());
        assert!(!cfg.get_dump_layout());
    }
}
