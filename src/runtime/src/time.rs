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

//! Clocks: monotonic millisecond/microsecond readings and wall-clock time
//! since the unix epoch.

use std::sync::Once;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Monotonic milliseconds since process start.
#[derive(Clone, Copy, Debug, Default, Eq, Ord, PartialEq, PartialOrd)]
pub struct Milliseconds {
    /// Millisecond count.
    pub ms: u32,
}

/// Monotonic microseconds since process start.
#[derive(Clone, Copy, Debug, Default, Eq, Ord, PartialEq, PartialOrd)]
pub struct Microseconds {
    /// Microsecond count.
    pub us: u64,
}

/// Wall-clock seconds + sub-second microseconds since the unix epoch.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct TimeSinceEpoch {
    /// Whole seconds.
    pub seconds: u32,
    /// Microseconds within the current second.
    pub microseconds: u32,
}

static EPOCH_INIT: Once = Once::new();
static mut PROCESS_EPOCH: Option<Instant> = None;

fn process_epoch() -> Instant {
    unsafe {
        EPOCH_INIT.call_once(|| {
            PROCESS_EPOCH = Some(Instant::now());
        });
        PROCESS_EPOCH.unwrap()
    }
}

/// Read the monotonic millisecond clock.
pub fn read_millisecond_clock() -> Milliseconds {
    let d = process_epoch().elapsed();
    Milliseconds {
        ms: (d.as_secs() as u32).wrapping_mul(1000).wrapping_add(d.subsec_nanos() / 1_000_000),
    }
}

/// Read the monotonic microsecond clock.
pub fn read_microsecond_clock() -> Microseconds {
    let d = process_epoch().elapsed();
    Microseconds {
        us: d.as_secs() * 1_000_000 + (d.subsec_nanos() / 1_000) as u64,
    }
}

/// Read the wall clock.
pub fn time_since_epoch() -> TimeSinceEpoch {
    let d = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    TimeSinceEpoch {
        seconds: d.as_secs() as u32,
        microseconds: d.subsec_nanos() / 1_000,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clocks_are_monotonic() {
        let a = read_microsecond_clock();
        let b = read_microsecond_clock();
        assert!(b.us >= a.us);
        let m0 = read_millisecond_clock();
        let m1 = read_millisecond_clock();
        assert!(m1.ms >= m0.ms);
    }
}
