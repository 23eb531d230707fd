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

//! Fixed-region allocators.
//!
//! `Heap` is a first-fit free-list allocator over a fixed reservation, with
//! every live allocation tagged by a source string for leak reporting.
//! `LinearBlockAllocator` bump-allocates scratch for a single pass and is
//! reset in bulk.

use std::fmt;
use std::sync::Mutex;

use memory::{GuardPageMode, PageBlock, PageProtect};

const MIN_SPLIT: usize = 16;

/// A live allocation: offset + size into the owning heap's region.
///
/// Blocks are plain handles; data access goes back through the heap so the
/// region stays singly owned.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct HeapBlock {
    ofs: usize,
    size: usize,
}

impl HeapBlock {
    /// Requested size of the block in bytes.
    pub fn size(&self) -> usize {
        self.size
    }
}

/// Heap failure modes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HeapError {
    /// The region cannot satisfy the request.
    OutOfMemory,
    /// The block does not belong to this heap or was already freed.
    BadBlock,
}

impl fmt::Display for HeapError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            HeapError::OutOfMemory => write!(f, "heap region exhausted"),
            HeapError::BadBlock => write!(f, "block is not live in this heap"),
        }
    }
}

impl ::std::error::Error for HeapError {
    fn description(&self) -> &str {
        "heap error"
    }
}

/// Usage counters maintained by a heap.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct HeapMetrics {
    /// Total region size in bytes.
    pub size: usize,
    /// Bytes currently allocated (including alignment padding).
    pub used_bytes: usize,
    /// Bytes currently free.
    pub free_bytes: usize,
    /// High-water mark of `used_bytes`.
    pub peak_used_bytes: usize,
    /// Live allocation count.
    pub num_live_allocs: usize,
    /// Total allocations made over the heap's lifetime.
    pub total_allocs: u64,
}

#[derive(Clone, Copy)]
struct Span {
    ofs: usize,
    size: usize,
    free: bool,
    tag: &'static str,
}

/// First-fit free-list allocator over a fixed page block.
pub struct Heap {
    storage: PageBlock,
    spans: Vec<Span>,
    alignment: usize,
    name: &'static str,
    metrics: HeapMetrics,
}

impl Heap {
    /// Create a heap over a fresh reservation of `size` bytes.
    pub fn new(size: usize, alignment: usize, name: &'static str, guard_mode: GuardPageMode) -> Heap {
        assert!(alignment.is_power_of_two());
        let storage = PageBlock::map_pages(size, PageProtect::ReadWrite, guard_mode);
        let len = storage.len();
        Heap {
            storage: storage,
            spans: vec![Span {
                ofs: 0,
                size: len,
                free: true,
                tag: "",
            }],
            alignment: alignment,
            name: name,
            metrics: HeapMetrics {
                size: len,
                free_bytes: len,
                ..HeapMetrics::default()
            },
        }
    }

    /// Heap name given at init.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Allocate `size` bytes, or `None` if the region is exhausted.
    pub fn unchecked_alloc(&mut self, size: usize, tag: &'static str) -> Option<HeapBlock> {
        if size == 0 {
            return None;
        }
        let size = align_up(size, self.alignment);
        let idx = match self.spans.iter().position(|s| s.free && s.size >= size) {
            Some(idx) => idx,
            None => return None,
        };
        let span = self.spans[idx];
        if span.size - size >= MIN_SPLIT {
            self.spans[idx].size = size;
            self.spans.insert(
                idx + 1,
                Span {
                    ofs: span.ofs + size,
                    size: span.size - size,
                    free: true,
                    tag: "",
                },
            );
        }
        self.spans[idx].free = false;
        self.spans[idx].tag = tag;
        let taken = self.spans[idx].size;
        self.metrics.used_bytes += taken;
        self.metrics.free_bytes -= taken;
        self.metrics.num_live_allocs += 1;
        self.metrics.total_allocs += 1;
        if self.metrics.used_bytes > self.metrics.peak_used_bytes {
            self.metrics.peak_used_bytes = self.metrics.used_bytes;
        }
        Some(HeapBlock {
            ofs: self.spans[idx].ofs,
            size: size,
        })
    }

    /// Allocate or panic on exhaustion.
    pub fn alloc(&mut self, size: usize, tag: &'static str) -> HeapBlock {
        match self.unchecked_alloc(size, tag) {
            Some(b) => b,
            None => panic!("{}: out of memory allocating {} bytes ({})", self.name, size, tag),
        }
    }

    /// Allocate and zero-fill.
    pub fn calloc(&mut self, size: usize, tag: &'static str) -> HeapBlock {
        let block = self.alloc(size, tag);
        for b in self.bytes_mut(&block) {
            *b = 0;
        }
        block
    }

    /// Resize a block, preserving its prefix. Falls back to alloc+copy+free.
    pub fn unchecked_realloc(
        &mut self,
        block: HeapBlock,
        new_size: usize,
        tag: &'static str,
    ) -> Option<HeapBlock> {
        if new_size <= block.size {
            return Some(HeapBlock {
                ofs: block.ofs,
                size: new_size,
            });
        }
        let new_block = match self.unchecked_alloc(new_size, tag) {
            Some(b) => b,
            None => return None,
        };
        let copy: Vec<u8> = self.bytes(&block).to_vec();
        self.bytes_mut(&new_block)[..copy.len()].copy_from_slice(&copy);
        self.free(block);
        Some(new_block)
    }

    /// Return a block to the free list, coalescing neighbors.
    pub fn free(&mut self, block: HeapBlock) {
        let idx = self.span_of(&block).expect("free of foreign or dead heap block");
        let taken = self.spans[idx].size;
        self.spans[idx].free = true;
        self.spans[idx].tag = "";
        self.metrics.used_bytes -= taken;
        self.metrics.free_bytes += taken;
        self.metrics.num_live_allocs -= 1;
        // coalesce with the following span, then the preceding one
        if idx + 1 < self.spans.len() && self.spans[idx + 1].free {
            self.spans[idx].size += self.spans[idx + 1].size;
            self.spans.remove(idx + 1);
        }
        if idx > 0 && self.spans[idx - 1].free {
            self.spans[idx - 1].size += self.spans[idx].size;
            self.spans.remove(idx);
        }
    }

    /// Immutable view of a block's bytes.
    pub fn bytes(&self, block: &HeapBlock) -> &[u8] {
        &self.storage.bytes()[block.ofs..block.ofs + block.size]
    }

    /// Mutable view of a block's bytes.
    pub fn bytes_mut(&mut self, block: &HeapBlock) -> &mut [u8] {
        &mut self.storage.bytes_mut()[block.ofs..block.ofs + block.size]
    }

    /// Current usage counters.
    pub fn metrics(&self) -> HeapMetrics {
        self.metrics
    }

    /// Log every live allocation with its tag.
    pub fn debug_print_leaks(&self) {
        for span in self.spans.iter().filter(|s| !s.free) {
            debug!(
                "{}: leaked {} bytes at +{} ({})",
                self.name, span.size, span.ofs, span.tag
            );
        }
    }

    /// Log a one-line usage summary.
    pub fn dump_usage(&self) {
        let m = &self.metrics;
        debug!(
            "{}: {}/{} bytes used, peak {}, {} live allocs",
            self.name, m.used_bytes, m.size, m.peak_used_bytes, m.num_live_allocs
        );
    }

    fn span_of(&self, block: &HeapBlock) -> Option<usize> {
        self.spans
            .iter()
            .position(|s| s.ofs == block.ofs && !s.free)
    }
}

/// A heap shared between threads behind a mutex. Heap operations are short
/// and non-reentrant; callers must not hold the lock across other waits.
pub struct ThreadSafeHeap {
    inner: Mutex<Heap>,
}

impl ThreadSafeHeap {
    /// Wrap a heap.
    pub fn new(heap: Heap) -> ThreadSafeHeap {
        ThreadSafeHeap {
            inner: Mutex::new(heap),
        }
    }

    /// Run `f` with the heap locked.
    pub fn with<T, F: FnOnce(&mut Heap) -> T>(&self, f: F) -> T {
        let mut heap = self.inner.lock().unwrap();
        f(&mut heap)
    }
}

fn align_up(x: usize, a: usize) -> usize {
    (x + a - 1) & !(a - 1)
}

/// Monotonic bump allocator over a fixed scratch region, reset in bulk once
/// per pass.
pub struct LinearBlockAllocator {
    storage: Vec<u8>,
    cursor: usize,
    name: &'static str,
    high_water: usize,
}

impl LinearBlockAllocator {
    /// Create an allocator with `size` bytes of scratch.
    pub fn new(size: usize, name: &'static str) -> LinearBlockAllocator {
        LinearBlockAllocator {
            storage: vec![0; size],
            cursor: 0,
            name: name,
            high_water: 0,
        }
    }

    /// Bump-allocate `size` bytes at `align`, or `None` when the scratch is
    /// exhausted.
    pub fn allocate(&mut self, align: usize, size: usize) -> Option<(usize, usize)> {
        let ofs = align_up(self.cursor, align);
        if ofs + size > self.storage.len() {
            warn!("{}: scratch exhausted ({} + {} > {})", self.name, ofs, size, self.storage.len());
            return None;
        }
        self.cursor = ofs + size;
        if self.cursor > self.high_water {
            self.high_water = self.cursor;
        }
        Some((ofs, size))
    }

    /// Bytes for a span returned by `allocate`.
    pub fn bytes_mut(&mut self, span: (usize, usize)) -> &mut [u8] {
        &mut self.storage[span.0..span.0 + span.1]
    }

    /// Invalidate every span and rewind the cursor.
    pub fn reset(&mut self) {
        self.cursor = 0;
    }

    /// High-water mark over the allocator's lifetime.
    pub fn high_water(&self) -> usize {
        self.high_water
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use memory::GuardPageMode;

    #[test]
    fn alloc_free_coalesce() {
        let mut heap = Heap::new(4096, 8, "test_heap", GuardPageMode::Disabled);
        let a = heap.alloc(100, "a");
        let b = heap.alloc(200, "b");
        assert_eq!(heap.metrics().num_live_allocs, 2);
        heap.free(a);
        heap.free(b);
        let m = heap.metrics();
        assert_eq!(m.num_live_allocs, 0);
        assert_eq!(m.used_bytes, 0);
        assert_eq!(m.free_bytes, m.size);
        // full region must be reusable again
        let c = heap.unchecked_alloc(m.size, "c");
        assert!(c.is_some());
    }

    #[test]
    fn exhaustion_is_unchecked() {
        let mut heap = Heap::new(4096, 8, "test_heap", GuardPageMode::Disabled);
        assert!(heap.unchecked_alloc(1 << 20, "big").is_none());
    }

    #[test]
    fn realloc_preserves_prefix() {
        let mut heap = Heap::new(8192, 8, "test_heap", GuardPageMode::Disabled);
        let a = heap.alloc(16, "a");
        heap.bytes_mut(&a).copy_from_slice(&[7u8; 16]);
        let b = heap.unchecked_realloc(a, 64, "a").unwrap();
        assert_eq!(&heap.bytes(&b)[..16], &[7u8; 16][..]);
    }

    #[test]
    fn lba_reset() {
        let mut lba = LinearBlockAllocator::new(64, "scratch");
        assert!(lba.allocate(4, 40).is_some());
        assert!(lba.allocate(4, 40).is_none());
        lba.reset();
        assert!(lba.allocate(4, 40).is_some());
    }
}
