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

//! Core logging: structured log records over the cncbus, with defined
//! levels and category tagging. When no bus is attached records format
//! straight through the `log` facade.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use adk_cncbus::{msg_types, Address, Bus, MsgHeader, MsgReader, MsgReceiver, INVALID_ADDRESS};
use adk_runtime::{time_since_epoch, TimeSinceEpoch};

/// Largest log message retained; longer text is truncated.
pub const MAX_LOG_MSG_LENGTH: usize = 16 * 1024;

/// Log severity.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub enum LogLevel {
    /// Developer chatter.
    Debug = 0,
    /// Operational messages.
    Info = 1,
    /// Something surprising but recoverable.
    Warn = 2,
    /// Something broke.
    Error = 3,
    /// Unconditional output.
    Always = 4,
}

/// All levels in severity order.
pub const NUM_LOG_LEVELS: usize = 5;

static LOG_LEVEL_NAMES: [&'static str; NUM_LOG_LEVELS] =
    ["DEBUG", "INFO", "WARN", "ERROR", "ALWAYS"];
static LOG_LEVEL_SHORT_NAMES: [&'static str; NUM_LOG_LEVELS] = ["DBG", "INF", "WRN", "ERR", "ALW"];

impl LogLevel {
    /// Full level name.
    pub fn name(&self) -> &'static str {
        LOG_LEVEL_NAMES[*self as usize]
    }

    /// Three-letter level name.
    pub fn short_name(&self) -> &'static str {
        LOG_LEVEL_SHORT_NAMES[*self as usize]
    }

    fn from_u8(v: u8) -> Option<LogLevel> {
        match v {
            0 => Some(LogLevel::Debug),
            1 => Some(LogLevel::Info),
            2 => Some(LogLevel::Warn),
            3 => Some(LogLevel::Error),
            4 => Some(LogLevel::Always),
            _ => None,
        }
    }
}

static MIN_LOG_LEVEL: AtomicUsize = AtomicUsize::new(if cfg!(debug_assertions) { 0 } else { 1 });

/// The minimum level that publishes.
pub fn log_get_min_level() -> LogLevel {
    LogLevel::from_u8(MIN_LOG_LEVEL.load(Ordering::Relaxed) as u8).unwrap_or(LogLevel::Debug)
}

/// Set the minimum level that publishes.
pub fn log_set_min_level(level: LogLevel) {
    MIN_LOG_LEVEL.store(level as usize, Ordering::Relaxed);
}

/// Fixed part of the wire record; UTF-8 message text follows to the end of
/// the bus message.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct LogRecordHeader {
    /// Wall-clock stamp.
    pub time_since_epoch: TimeSinceEpoch,
    /// Subsystem FOURCC tag.
    pub fourcc_tag: u32,
    /// Source line.
    pub line: u16,
    /// Severity.
    pub level: LogLevel,
}

const LOG_RECORD_HEADER_SIZE: usize = 4 + 4 + 4 + 2 + 1;

fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.push(v as u8);
    out.push((v >> 8) as u8);
    out.push((v >> 16) as u8);
    out.push((v >> 24) as u8);
}

fn get_u32(bytes: &[u8], ofs: usize) -> u32 {
    bytes[ofs] as u32
        | ((bytes[ofs + 1] as u32) << 8)
        | ((bytes[ofs + 2] as u32) << 16)
        | ((bytes[ofs + 3] as u32) << 24)
}

impl LogRecordHeader {
    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(LOG_RECORD_HEADER_SIZE);
        put_u32(&mut out, self.time_since_epoch.seconds);
        put_u32(&mut out, self.time_since_epoch.microseconds);
        put_u32(&mut out, self.fourcc_tag);
        out.push(self.line as u8);
        out.push((self.line >> 8) as u8);
        out.push(self.level as u8);
        out
    }

    fn decode(bytes: &[u8]) -> Option<LogRecordHeader> {
        if bytes.len() < LOG_RECORD_HEADER_SIZE {
            return None;
        }
        Some(LogRecordHeader {
            time_since_epoch: TimeSinceEpoch {
                seconds: get_u32(bytes, 0),
                microseconds: get_u32(bytes, 4),
            },
            fourcc_tag: get_u32(bytes, 8),
            line: bytes[12] as u16 | ((bytes[13] as u16) << 8),
            level: LogLevel::from_u8(bytes[14])?,
        })
    }
}

/// Publishes structured log records onto the bus; with no bus attached,
/// records print through the `log` facade instead.
pub struct BusLogger {
    bus: Option<Arc<Bus>>,
    address: Address,
    subnet_mask: Address,
}

impl BusLogger {
    /// A logger publishing to `address`/`subnet` on `bus`.
    pub fn new(bus: Arc<Bus>, address: Address, subnet_mask: Address) -> BusLogger {
        BusLogger {
            bus: Some(bus),
            address: address,
            subnet_mask: subnet_mask,
        }
    }

    /// A bus-less logger: records go straight to the `log` facade.
    pub fn detached() -> BusLogger {
        BusLogger {
            bus: None,
            address: INVALID_ADDRESS,
            subnet_mask: INVALID_ADDRESS,
        }
    }

    /// Publish one record. Filtered by the minimum level.
    pub fn log_message(
        &self,
        file: &str,
        line: u32,
        level: LogLevel,
        fourcc_tag: u32,
        text: &str,
    ) {
        assert!((level as usize) < NUM_LOG_LEVELS);
        if level < log_get_min_level() {
            return;
        }

        let header = LogRecordHeader {
            time_since_epoch: time_since_epoch(),
            fourcc_tag: fourcc_tag,
            line: line as u16,
            level: level,
        };

        let mut text_bytes = text.as_bytes();
        if text_bytes.len() > MAX_LOG_MSG_LENGTH {
            text_bytes = &text_bytes[..MAX_LOG_MSG_LENGTH];
        }

        match self.bus {
            Some(ref bus) => {
                // graceful on saturation; a dropped log record must never
                // take the app down
                if let Some(mut msg) = bus.msg_begin_unchecked(msg_types::LOG_V1) {
                    if msg.write_unchecked(&header.encode()) && msg.write_unchecked(text_bytes) {
                        bus.send_async(
                            msg,
                            INVALID_ADDRESS,
                            self.address,
                            self.subnet_mask,
                            None,
                        );
                    }
                }
            }
            None => log_msg_print_basic(&header, file, text),
        }
    }
}

/// Format a record through the `log` facade (the bus-less path and the
/// receiver's sink).
pub fn log_msg_print_basic(header: &LogRecordHeader, file: &str, text: &str) {
    let tag = fourcc_to_str(header.fourcc_tag);
    match header.level {
        LogLevel::Debug => debug!("{}({}): [{}][DBG] {}", file, header.line, tag, text),
        LogLevel::Info => info!("{}({}): [{}][INF] {}", file, header.line, tag, text),
        LogLevel::Warn => warn!("{}({}): [{}][WRN] {}", file, header.line, tag, text),
        LogLevel::Error | LogLevel::Always => {
            error!("{}({}): [{}][{}] {}", file, header.line, tag, header.level.short_name(), text)
        }
    }
}

fn fourcc_to_str(tag: u32) -> String {
    let bytes = [tag as u8, (tag >> 8) as u8, (tag >> 16) as u8, (tag >> 24) as u8];
    bytes
        .iter()
        .map(|&b| {
            if b.is_ascii_graphic() || b == b' ' {
                b as char
            } else {
                '.'
            }
        })
        .collect()
}

const COLOR_RED: &'static str = "\x1b[31m";
const COLOR_RESET: &'static str = "\x1b[0m";

/// Bus receiver that formats `LOG1` records to the TTY sink, colorizing
/// error-level lines.
pub struct LogReceiverHooks {
    colorize: bool,
}

impl LogReceiverHooks {
    /// A receiver hook set; `colorize` wraps error lines in ANSI red.
    pub fn new(colorize: bool) -> LogReceiverHooks {
        LogReceiverHooks { colorize: colorize }
    }
}

impl MsgReceiver for LogReceiverHooks {
    fn on_msg_recv(&self, header: &MsgHeader, msg: &mut MsgReader) -> i32 {
        if header.msg_type != msg_types::LOG_V1 {
            return 0;
        }
        let mut payload = vec![0u8; msg.size()];
        let read = msg.read(&mut payload);
        payload.truncate(read);

        let record = match LogRecordHeader::decode(&payload) {
            Some(r) => r,
            None => return -1,
        };
        let text = String::from_utf8_lossy(&payload[LOG_RECORD_HEADER_SIZE..]);
        let tag = fourcc_to_str(record.fourcc_tag);
        let line = format!(
            "[{:}.{:06}][{}][{}] {}",
            record.time_since_epoch.seconds,
            record.time_since_epoch.microseconds,
            tag,
            record.level.short_name(),
            text
        );
        if record.level >= LogLevel::Error && self.colorize {
            error!("{}{}{}", COLOR_RED, line, COLOR_RESET);
        } else {
            match record.level {
                LogLevel::Debug => debug!("{}", line),
                LogLevel::Info => info!("{}", line),
                LogLevel::Warn => warn!("{}", line),
                _ => error!("{}", line),
            }
        }
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let header = LogRecordHeader {
            time_since_epoch: TimeSinceEpoch {
                seconds: 1_600_000_000,
                microseconds: 123_456,
            },
            fourcc_tag: ::adk_cncbus::msg_type_fourcc(b"TEST"),
            line: 4242,
            level: LogLevel::Warn,
        };
        let bytes = header.encode();
        assert_eq!(bytes.len(), LOG_RECORD_HEADER_SIZE);
        assert_eq!(LogRecordHeader::decode(&bytes), Some(header));
    }

    #[test]
    fn min_level_filters() {
        log_set_min_level(LogLevel::Warn);
        assert_eq!(log_get_min_level(), LogLevel::Warn);
        assert!(LogLevel::Info < log_get_min_level());
        log_set_min_level(LogLevel::Debug);
    }

    #[test]
    fn level_names() {
        assert_eq!(LogLevel::Debug.name(), "DEBUG");
        assert_eq!(LogLevel::Always.short_name(), "ALW");
    }

    #[test]
    fn fourcc_formatting() {
        let tag = ::adk_cncbus::msg_type_fourcc(b"FONT");
        assert_eq!(fourcc_to_str(tag), "FONT");
        assert_eq!(fourcc_to_str(0), "....");
    }
}
