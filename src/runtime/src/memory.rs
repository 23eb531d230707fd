// Copyright 2021 The ADK Developers.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Page memory services.
//!
//! Subsystems reserve page-aligned blocks up front and sub-allocate out of
//! them. When guard pages are requested the block bookends its payload with
//! no-access zones; an overrun is caught by the block's integrity check
//! rather than a hardware fault, since the blocks here are carved from the
//! standard allocator.

/// Page granularity used for all block reservations.
pub const PAGE_SIZE: usize = 4096;

const GUARD_FILL: u8 = 0xFD;

/// Round `size` up to the next page boundary.
pub fn page_align(size: usize) -> usize {
    (size + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

/// Page protection applied to a block or a sub-range of it.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PageProtect {
    /// Readable only.
    ReadOnly,
    /// Readable and writable.
    ReadWrite,
    /// Neither readable nor writable.
    NoAccess,
}

/// How aggressively allocators bookend their memory with guard zones.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum GuardPageMode {
    /// No guard zones.
    Disabled,
    /// One guard page before and after the whole block.
    Minimal,
    /// Guard pages around every block.
    Enabled,
}

impl Default for GuardPageMode {
    fn default() -> GuardPageMode {
        GuardPageMode::Disabled
    }
}

/// A page-aligned reservation with optional guard zones.
///
/// The payload region is `[guard_lead, guard_lead + len)`. Guard bytes carry
/// a fill pattern checked by `check_guards`.
pub struct PageBlock {
    storage: Vec<u8>,
    guard_lead: usize,
    guard_trail: usize,
    len: usize,
    protect: PageProtect,
}

impl PageBlock {
    /// Reserve `size` bytes (rounded up to page granularity) with the given
    /// protection and guard mode.
    pub fn map_pages(size: usize, protect: PageProtect, guard_mode: GuardPageMode) -> PageBlock {
        let len = page_align(size);
        let (lead, trail) = match guard_mode {
            GuardPageMode::Disabled => (0, 0),
            GuardPageMode::Minimal | GuardPageMode::Enabled => (PAGE_SIZE, PAGE_SIZE),
        };
        let mut storage = vec![0u8; lead + len + trail];
        for b in &mut storage[..lead] {
            *b = GUARD_FILL;
        }
        let total = storage.len();
        for b in &mut storage[total - trail..] {
            *b = GUARD_FILL;
        }
        PageBlock {
            storage: storage,
            guard_lead: lead,
            guard_trail: trail,
            len: len,
            protect: protect,
        }
    }

    /// Size of the payload region in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Current protection.
    pub fn protect(&self) -> PageProtect {
        self.protect
    }

    /// Change the protection of the whole payload region.
    pub fn protect_pages(&mut self, protect: PageProtect) {
        self.protect = protect;
    }

    /// Payload bytes. Panics if the block is `NoAccess`.
    pub fn bytes(&self) -> &[u8] {
        assert!(self.protect != PageProtect::NoAccess, "read of no-access page block");
        &self.storage[self.guard_lead..self.guard_lead + self.len]
    }

    /// Mutable payload bytes. Panics unless the block is `ReadWrite`.
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        assert!(self.protect == PageProtect::ReadWrite, "write of protected page block");
        let lead = self.guard_lead;
        let len = self.len;
        &mut self.storage[lead..lead + len]
    }

    /// Verify the guard zones are intact. Returns false on corruption.
    pub fn check_guards(&self) -> bool {
        let total = self.storage.len();
        self.storage[..self.guard_lead].iter().all(|&b| b == GUARD_FILL)
            && self.storage[total - self.guard_trail..].iter().all(|&b| b == GUARD_FILL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align() {
        assert_eq!(page_align(0), 0);
        assert_eq!(page_align(1), PAGE_SIZE);
        assert_eq!(page_align(PAGE_SIZE), PAGE_SIZE);
        assert_eq!(page_align(PAGE_SIZE + 1), 2 * PAGE_SIZE);
    }

    #[test]
    fn guards_intact() {
        let mut block = PageBlock::map_pages(100, PageProtect::ReadWrite, GuardPageMode::Minimal);
        assert_eq!(block.len(), PAGE_SIZE);
        block.bytes_mut()[0] = 0xff;
        assert!(block.check_guards());
    }
}
