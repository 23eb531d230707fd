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

//! Bus messages: fixed-size fragment chains, the construction cursor, and
//! the read cursor handed to receivers.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Condvar, Mutex};

use Bus;

/// Fragment stride; a chain of these backs every message.
pub const MSG_FRAGMENT_SIZE: usize = 1024;
/// Payload bytes per fragment (the stride minus the free-list link word).
pub const FRAG_PAYLOAD: usize = MSG_FRAGMENT_SIZE - 8;
/// Offset of payload in the first fragment; the head of the fragment is
/// reserved for the in-flight message record.
pub const FIRST_FRAG_OFS: usize = 96;
/// Payload bytes available in the first fragment.
pub const FIRST_FRAG_PAYLOAD: usize = FRAG_PAYLOAD - FIRST_FRAG_OFS;

/// One pooled fragment's payload storage.
pub type Frag = Box<[u8; FRAG_PAYLOAD]>;

/// Allocate a zeroed fragment (pool construction only).
pub fn new_frag() -> Frag {
    Box::new([0u8; FRAG_PAYLOAD])
}

fn frag_capacity(index: usize) -> usize {
    if index == 0 {
        FIRST_FRAG_PAYLOAD
    } else {
        FRAG_PAYLOAD
    }
}

/// Bus addresses are modeled after IP addresses for routing flexibility.
/// They are, however, NOT IP addresses and have nothing to do with sending
/// data over a network.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Address(pub u32);

/// The broadcast address; matches every receiver.
pub const BROADCAST_ADDRESS: Address = Address(0);
/// Sentinel reply address for senders that accept no replies.
pub const INVALID_ADDRESS: Address = Address(0xffff_ffff);

impl Address {
    /// Build an address from dotted parts, `a` most significant.
    pub fn from_parts(a: u8, b: u8, c: u8, d: u8) -> Address {
        Address(((a as u32) << 24) | ((b as u32) << 16) | ((c as u32) << 8) | (d as u32))
    }

    /// The address masked by a subnet.
    pub fn masked(&self, subnet: Address) -> u32 {
        self.0 & subnet.0
    }
}

/// Wire header carried by every message.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct MsgHeader {
    /// FOURCC message type.
    pub msg_type: u32,
    /// Payload size in bytes; grows monotonically during construction.
    pub msg_size: u32,
    /// Millisecond clock reading at send time.
    pub msg_time: u32,
    /// Address replies should be sent to.
    pub msg_reply_address: Address,
    /// Destination address.
    pub msg_dest_address: Address,
    /// Destination subnet mask.
    pub msg_dest_subnet: Address,
}

/// Condition a sender can attach to a message; raised when the last
/// reference to the message is released.
pub struct Signal {
    mutex: Mutex<bool>,
    condition: Condvar,
}

impl Signal {
    /// New, unraised.
    pub fn new() -> Signal {
        Signal {
            mutex: Mutex::new(false),
            condition: Condvar::new(),
        }
    }

    pub(crate) fn reset(&self) {
        *self.mutex.lock().unwrap() = false;
    }

    pub(crate) fn raise(&self) {
        let mut raised = self.mutex.lock().unwrap();
        *raised = true;
        // wake under the mutex; waking outside risks the condition being
        // destroyed while we still touch it
        self.condition.notify_all();
    }

    /// Block until the signal raises.
    pub fn wait(&self) {
        let mut raised = self.mutex.lock().unwrap();
        while !*raised {
            raised = self.condition.wait(raised).unwrap();
        }
    }
}

/// An immutable, sent message shared by its pending receivers.
pub(crate) struct SentMsg {
    pub header: MsgHeader,
    frags: Mutex<Vec<Frag>>,
    ref_count: AtomicI32,
    signal_token: Mutex<Option<::std::sync::Arc<Signal>>>,
}

impl SentMsg {
    pub(crate) fn add_ref(&self) {
        self.ref_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Drop one reference; on the last one return the fragments to the bus
    /// pool and raise any attached signal.
    pub(crate) fn release(&self, bus: &Bus) {
        if self.ref_count.fetch_sub(1, Ordering::Relaxed) == 1 {
            let frags = ::std::mem::replace(&mut *self.frags.lock().unwrap(), Vec::new());
            bus.release_frags(frags);
            if let Some(signal) = self.signal_token.lock().unwrap().take() {
                signal.raise();
            }
        }
    }

    pub(crate) fn read_at(&self, frag_idx: usize, frag_ofs: usize, out: &mut [u8]) -> usize {
        let frags = self.frags.lock().unwrap();
        copy_out(&frags, frag_idx, frag_ofs, out)
    }
}

fn copy_out(frags: &[Frag], mut frag_idx: usize, mut frag_ofs: usize, out: &mut [u8]) -> usize {
    let mut read = 0;
    while read < out.len() {
        if frag_idx >= frags.len() {
            break;
        }
        let cap = frag_capacity(frag_idx);
        let left = cap - frag_ofs;
        if left == 0 {
            frag_idx += 1;
            frag_ofs = 0;
            continue;
        }
        let take = ::std::cmp::min(left, out.len() - read);
        let base = if frag_idx == 0 { FIRST_FRAG_OFS } else { 0 };
        out[read..read + take]
            .copy_from_slice(&frags[frag_idx][base + frag_ofs..base + frag_ofs + take]);
        read += take;
        frag_ofs += take;
    }
    read
}

/// Seek origin for [`MsgCursor::seek`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SeekMode {
    /// From the start of the payload.
    Set,
    /// Relative to the current cursor.
    Cur,
    /// From the end of the payload (offset must be <= 0).
    End,
}

#[derive(Clone, Copy, Default)]
pub(crate) struct Cursor {
    pub cursor: usize,
    pub frag_idx: usize,
    pub frag_ofs: usize,
}

impl Cursor {
    /// Seek with the fast in-fragment path, falling back to a re-walk of
    /// the chain from the head.
    fn seek(&mut self, ofs: i64, mode: SeekMode, msg_size: usize) -> Option<usize> {
        let target = match mode {
            SeekMode::Set => ofs,
            SeekMode::Cur => self.cursor as i64 + ofs,
            SeekMode::End => {
                debug_assert!(ofs <= 0);
                msg_size as i64 + ofs
            }
        };
        if target < 0 || target > msg_size as i64 {
            return None;
        }
        let target = target as usize;

        // fast path: the target lands in the current fragment
        let delta = target as i64 - self.cursor as i64;
        let frag_ofs = self.frag_ofs as i64 + delta;
        let cap = frag_capacity(self.frag_idx) as i64;
        if frag_ofs >= 0 && (frag_ofs < cap || (frag_ofs == cap && target == msg_size)) {
            self.frag_ofs = frag_ofs as usize;
            self.cursor = target;
            return Some(target);
        }

        // slow path: re-walk from the first fragment
        self.cursor = 0;
        self.frag_idx = 0;
        self.frag_ofs = 0;
        let mut cap = frag_capacity(0);
        while self.cursor + cap < target {
            self.cursor += cap;
            self.frag_idx += 1;
            self.frag_ofs = 0;
            cap = frag_capacity(self.frag_idx);
        }
        self.frag_ofs = target - self.cursor;
        self.cursor = target;
        Some(target)
    }

    fn advance(&mut self, mut n: usize) {
        while n > 0 {
            let cap = frag_capacity(self.frag_idx);
            let left = cap - self.frag_ofs;
            if left == 0 {
                self.frag_idx += 1;
                self.frag_ofs = 0;
                continue;
            }
            let take = ::std::cmp::min(left, n);
            self.frag_ofs += take;
            self.cursor += take;
            n -= take;
        }
    }
}

/// A message under construction. Dropping it without sending returns its
/// fragments to the pool.
pub struct Msg<'a> {
    bus: &'a Bus,
    frags: Vec<Frag>,
    reserved: usize,
    header: MsgHeader,
    cursor: Cursor,
}

impl<'a> Msg<'a> {
    pub(crate) fn begin(bus: &'a Bus, msg_type: u32) -> Option<Msg<'a>> {
        let frag = match bus.get_free_frag() {
            Some(f) => f,
            None => return None,
        };
        let mut header = MsgHeader::default();
        header.msg_type = msg_type;
        Some(Msg {
            bus: bus,
            frags: vec![frag],
            reserved: FIRST_FRAG_PAYLOAD,
            header: header,
            cursor: Cursor::default(),
        })
    }

    /// Grow the fragment chain to cover `size` payload bytes. Returns false
    /// if the bus is saturated.
    pub fn reserve_unchecked(&mut self, size: usize) -> bool {
        while self.reserved < size {
            match self.bus.get_free_frag() {
                Some(frag) => {
                    self.frags.push(frag);
                    self.reserved += FRAG_PAYLOAD;
                }
                None => return false,
            }
        }
        true
    }

    /// Reserve or panic on bus saturation.
    pub fn reserve_checked(&mut self, size: usize) {
        assert!(self.reserve_unchecked(size), "out of bus message fragments");
    }

    /// Write `src` at the cursor, growing the chain as needed; advances the
    /// cursor and the message size high-water mark. Returns false if the
    /// bus is saturated.
    pub fn write_unchecked(&mut self, src: &[u8]) -> bool {
        if !self.reserve_unchecked(self.cursor.cursor + src.len()) {
            return false;
        }
        let mut written = 0;
        while written < src.len() {
            let cap = frag_capacity(self.cursor.frag_idx);
            let left = cap - self.cursor.frag_ofs;
            if left == 0 {
                self.cursor.frag_idx += 1;
                self.cursor.frag_ofs = 0;
                continue;
            }
            let take = ::std::cmp::min(left, src.len() - written);
            let base = if self.cursor.frag_idx == 0 { FIRST_FRAG_OFS } else { 0 };
            let ofs = base + self.cursor.frag_ofs;
            self.frags[self.cursor.frag_idx][ofs..ofs + take]
                .copy_from_slice(&src[written..written + take]);
            written += take;
            self.cursor.frag_ofs += take;
            self.cursor.cursor += take;
        }
        if self.cursor.cursor as u32 > self.header.msg_size {
            self.header.msg_size = self.cursor.cursor as u32;
        }
        true
    }

    /// Write or panic on bus saturation.
    pub fn write_checked(&mut self, src: &[u8]) {
        assert!(self.write_unchecked(src), "out of bus message fragments");
    }

    /// Explicitly set the payload size, growing the chain to cover it.
    pub fn set_size_unchecked(&mut self, size: usize) -> bool {
        if !self.reserve_unchecked(size) {
            return false;
        }
        self.header.msg_size = size as u32;
        true
    }

    /// Read from the cursor into `dst`; may return less than requested at
    /// end of message.
    pub fn read(&mut self, dst: &mut [u8]) -> usize {
        let want = ::std::cmp::min(
            dst.len(),
            self.header.msg_size as usize - self.cursor.cursor,
        );
        let read = copy_out(
            &self.frags,
            self.cursor.frag_idx,
            self.cursor.frag_ofs,
            &mut dst[..want],
        );
        self.cursor.advance(read);
        read
    }

    /// Payload size so far.
    pub fn size(&self) -> usize {
        self.header.msg_size as usize
    }

    /// Cursor position.
    pub fn tell(&self) -> usize {
        self.cursor.cursor
    }

    /// Move the cursor; returns the new position or `None` when out of
    /// range.
    pub fn seek(&mut self, ofs: i64, mode: SeekMode) -> Option<usize> {
        let size = self.header.msg_size as usize;
        self.cursor.seek(ofs, mode, size)
    }

    /// Abandon construction, returning the fragments immediately.
    pub fn cancel(self) {}

    pub(crate) fn into_sent(
        mut self,
        source: Address,
        dest: Address,
        subnet: Address,
        signal: Option<::std::sync::Arc<Signal>>,
    ) -> (SentMsg, &'a Bus) {
        self.header.msg_reply_address = source;
        self.header.msg_dest_address = dest;
        self.header.msg_dest_subnet = subnet;
        self.header.msg_time = ::adk_runtime::read_millisecond_clock().ms;
        if let Some(ref s) = signal {
            s.reset();
        }
        let frags = ::std::mem::replace(&mut self.frags, Vec::new());
        let sent = SentMsg {
            header: self.header,
            frags: Mutex::new(frags),
            ref_count: AtomicI32::new(1),
            signal_token: Mutex::new(signal),
        };
        (sent, self.bus)
    }
}

impl<'a> Drop for Msg<'a> {
    fn drop(&mut self) {
        if !self.frags.is_empty() {
            let frags = ::std::mem::replace(&mut self.frags, Vec::new());
            self.bus.release_frags(frags);
        }
    }
}

/// Read cursor handed to `on_msg_recv`; starts at the first payload byte.
pub struct MsgReader<'a> {
    msg: &'a SentMsg,
    cursor: Cursor,
}

impl<'a> MsgReader<'a> {
    pub(crate) fn new(msg: &'a SentMsg) -> MsgReader<'a> {
        MsgReader {
            msg: msg,
            cursor: Cursor::default(),
        }
    }

    /// Read from the cursor into `dst`; may return less than requested at
    /// end of message.
    pub fn read(&mut self, dst: &mut [u8]) -> usize {
        let want = ::std::cmp::min(
            dst.len(),
            self.msg.header.msg_size as usize - self.cursor.cursor,
        );
        let read = self
            .msg
            .read_at(self.cursor.frag_idx, self.cursor.frag_ofs, &mut dst[..want]);
        self.cursor.advance(read);
        read
    }

    /// Payload size.
    pub fn size(&self) -> usize {
        self.msg.header.msg_size as usize
    }

    /// Cursor position.
    pub fn tell(&self) -> usize {
        self.cursor.cursor
    }

    /// Move the cursor; returns the new position or `None` when out of
    /// range.
    pub fn seek(&mut self, ofs: i64, mode: SeekMode) -> Option<usize> {
        let size = self.msg.header.msg_size as usize;
        self.cursor.seek(ofs, mode, size)
    }
}
