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

//! Runtime services shared by every ADK subsystem.
//!
//! ADK applications are generally forbidden from allocating dynamic memory
//! ad-hoc and instead draw from their own subsystem's reserved memory. This
//! crate provides the reserved-memory primitives (page blocks, heaps, linear
//! block allocators), the small container algorithms the subsystems lean on,
//! monotonic clocks, and the worker pool used for decode/load jobs.

#[macro_use]
extern crate log;

pub mod algorithm;
pub mod heap;
pub mod memory;
pub mod thread_pool;
pub mod time;

pub use algorithm::{crc32, fourcc, lower_bound, next_power_of_2, update_crc32, utf8};
pub use heap::{Heap, HeapBlock, HeapError, HeapMetrics, LinearBlockAllocator, ThreadSafeHeap};
pub use memory::{page_align, GuardPageMode, PageBlock, PageProtect, PAGE_SIZE};
pub use thread_pool::{Completion, ThreadPool};
pub use time::{read_microsecond_clock, read_millisecond_clock, time_since_epoch, Microseconds,
               Milliseconds, TimeSinceEpoch};
