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

//! Low overhead publishing of values over the cncbus.

use std::sync::Arc;

use adk_cncbus::{msg_types, Address, Bus, INVALID_ADDRESS};
use adk_runtime::{time_since_epoch, Milliseconds};

/// Typed metric payloads. A listener reads the header, checks the type,
/// and then reads the payload bytes that follow it.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MetricType {
    /// A bare i32.
    Int = 0,
    /// A bare f32.
    Float = 1,
    /// A frame delta in milliseconds.
    DeltaTimeInMs = 2,
    /// `TimeToFirstInteraction`.
    TimeToFirstInteraction = 3,
    /// `MemoryFootprint`.
    MemoryFootprint = 4,
}

/// Startup milestones published once the app becomes interactive.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct TimeToFirstInteraction {
    /// `main()` entry.
    pub main_timestamp: Milliseconds,
    /// App init complete.
    pub app_init_timestamp: Milliseconds,
    /// System splash dismissed.
    pub dismiss_system_splash_timestamp: Milliseconds,
}

/// Canvas heap sizes published for fleet telemetry.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct MemoryFootprint {
    /// Low region size in bytes.
    pub low_memory_size: u32,
    /// High region size in bytes.
    pub high_memory_size: u32,
}

/// Publishes metric records onto the bus; a detached publisher drops them.
pub struct MetricsPublisher {
    bus: Option<Arc<Bus>>,
    address: Address,
    subnet_mask: Address,
}

impl MetricsPublisher {
    /// A publisher targeting `address`/`subnet` on `bus`.
    pub fn new(bus: Arc<Bus>, address: Address, subnet_mask: Address) -> MetricsPublisher {
        MetricsPublisher {
            bus: Some(bus),
            address: address,
            subnet_mask: subnet_mask,
        }
    }

    /// A publisher with no bus; every publish is a no-op.
    pub fn detached() -> MetricsPublisher {
        MetricsPublisher {
            bus: None,
            address: INVALID_ADDRESS,
            subnet_mask: INVALID_ADDRESS,
        }
    }

    /// Publish one metric: `MET2` header followed by the payload bytes.
    pub fn publish_metric(&self, metric_type: MetricType, value: &[u8]) {
        let bus = match self.bus {
            Some(ref bus) => bus,
            None => return,
        };
        let now = time_since_epoch();
        let mut header = Vec::with_capacity(16);
        for &v in &[now.seconds, now.microseconds, metric_type as u32, value.len() as u32] {
            header.push(v as u8);
            header.push((v >> 8) as u8);
            header.push((v >> 16) as u8);
            header.push((v >> 24) as u8);
        }

        if let Some(mut msg) = bus.msg_begin_unchecked(msg_types::METRIC_V2) {
            if msg.write_unchecked(&header) && msg.write_unchecked(value) {
                bus.send_async(msg, INVALID_ADDRESS, self.address, self.subnet_mask, None);
            }
        }
    }

    /// Publish a bare integer.
    pub fn publish_int(&self, value: i32) {
        let bytes = [
            value as u8,
            (value >> 8) as u8,
            (value >> 16) as u8,
            (value >> 24) as u8,
        ];
        self.publish_metric(MetricType::Int, &bytes);
    }

    /// Publish a frame delta.
    pub fn publish_delta_time(&self, delta: Milliseconds) {
        let ms = delta.ms;
        let bytes = [ms as u8, (ms >> 8) as u8, (ms >> 16) as u8, (ms >> 24) as u8];
        self.publish_metric(MetricType::DeltaTimeInMs, &bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use adk_cncbus::{DispatchMode, MsgHeader, MsgReader, MsgReceiver, Receiver};
    use std::sync::Mutex;

    struct Capture(Arc<Mutex<Vec<Vec<u8>>>>);

    impl MsgReceiver for Capture {
        fn on_msg_recv(&self, header: &MsgHeader, msg: &mut MsgReader) -> i32 {
            assert_eq!(header.msg_type, msg_types::METRIC_V2);
            let mut payload = vec![0u8; msg.size()];
            msg.read(&mut payload);
            self.0.lock().unwrap().push(payload);
            0
        }
    }

    #[test]
    fn publishes_header_and_value() {
        let bus = Arc::new(Bus::new(64 * 1024));
        let captured = Arc::new(Mutex::new(Vec::new()));
        let receiver = Receiver::new(Address(0x10101010), Box::new(Capture(captured.clone())));
        bus.connect(&receiver);

        let metrics =
            MetricsPublisher::new(bus.clone(), Address(0x10101010), Address(0xffffffff));
        metrics.publish_int(-5);
        bus.dispatch(DispatchMode::Flush);

        let captured = captured.lock().unwrap();
        assert_eq!(captured.len(), 1);
        let payload = &captured[0];
        // 16-byte header then the 4-byte value
        assert_eq!(payload.len(), 20);
        assert_eq!(payload[8], MetricType::Int as u8);
        assert_eq!(payload[12], 4);
        assert_eq!(payload[16], (-5i32) as u8);

        bus.disconnect(&receiver);
    }

    #[test]
    fn detached_publisher_is_a_no_op() {
        let metrics = MetricsPublisher::detached();
        metrics.publish_int(1);
    }
}
