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

//! Command & Control Bus.
//!
//! An asynchronous message queue, dispatch, and delivery system with minimal
//! dependencies. The bus routes messages to receivers by address; delivery
//! and per-receiver order are guaranteed. Addressing supports one-to-many
//! (broadcast) and many-to-one.
//!
//! A connected receiver is invoked serially and never from multiple threads
//! simultaneously, but no guarantee is made about which thread a dispatch
//! runs on.
//!
//! The contention design minimizes dispatch contention: a dispatch fails
//! with `Busy` while a connect or disconnect (cdc) is in progress. The only
//! contention between send and dispatch is the per-receiver queue push/pop,
//! which is held only long enough to move a message. Cdc operations are
//! rare (app init/shutdown) and are the ones that stall.

#[macro_use]
extern crate log;
extern crate adk_runtime;
extern crate smallvec;

mod msg;

pub use msg::{new_frag, Address, Frag, Msg, MsgHeader, MsgReader, SeekMode, Signal,
              BROADCAST_ADDRESS, FIRST_FRAG_OFS, FIRST_FRAG_PAYLOAD, FRAG_PAYLOAD,
              INVALID_ADDRESS, MSG_FRAGMENT_SIZE};

use std::collections::VecDeque;
use std::sync::atomic::{spin_loop_hint, AtomicI32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use adk_runtime::{fourcc, lower_bound};
use msg::SentMsg;
use smallvec::SmallVec;

/// Upper bound on simultaneously connected receivers.
pub const MAX_RECEIVERS: usize = 10;

// sizes the chain node pool only; not enforced as a hard per-receiver cap
const MAX_PENDING_MESSAGES_PER_RECEIVER_SOFT_LIMIT: usize = 4;
const CHAIN_NODE_SIZE: usize = 24;

/// Well-known bus message types (FOURCC).
pub mod msg_types {
    /// Plain UTF-8 text.
    pub const UTF8: u32 = 0x38465455;
    /// Structured log record, v1.
    pub const LOG_V1: u32 = 0x31474f4c;
    /// Metric record, v2.
    pub const METRIC_V2: u32 = 0x3254454d;
    /// Event record.
    pub const EVENT: u32 = 0x544e5645;
}

/// Well-known bus addresses.
pub mod addresses {
    use super::Address;

    /// The event router.
    pub fn events() -> Address {
        Address::from_parts(84, 84, 1, 0)
    }

    /// The log receiver.
    pub fn logger() -> Address {
        Address::from_parts(42, 42, 1, 0)
    }

    /// Subnet mask covering the core services.
    pub fn core_subnet_mask() -> Address {
        Address::from_parts(255, 255, 0, 0)
    }
}

/// How much work one `dispatch` call performs.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DispatchMode {
    /// Deliver at most one pending message.
    SingleMessage,
    /// Drain every receiver's pending queue.
    Flush,
}

/// Outcome of a `dispatch` call.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DispatchResult {
    /// No pending messages anywhere.
    NoMessages,
    /// Messages pending but every receiver is busy (or a cdc is active).
    Busy,
    /// One or more messages were dispatched.
    Ok,
}

const HAZARD_DISPATCH: i32 = 2;
const HAZARD_DESTROYED: i32 = 4;

/// Receiver callbacks. Invoked serially per receiver; the implementation
/// must be safe to call from any dispatching thread.
pub trait MsgReceiver: Send + Sync {
    /// Handle one delivered message. Non-zero return codes are errors.
    fn on_msg_recv(&self, header: &MsgHeader, msg: &mut MsgReader) -> i32;
}

struct ReceiverSlot {
    address: Address,
    hazard: AtomicI32,
    queue: Mutex<VecDeque<Arc<SentMsg>>>,
    hooks: Box<dyn MsgReceiver>,
}

/// A receiver instance bound to an address, managed by the receiver author.
pub struct Receiver {
    slot: Arc<ReceiverSlot>,
}

impl Receiver {
    /// Initialize a receiver at `address` with the given callbacks.
    pub fn new(address: Address, hooks: Box<dyn MsgReceiver>) -> Receiver {
        Receiver {
            slot: Arc::new(ReceiverSlot {
                address: address,
                hazard: AtomicI32::new(0),
                queue: Mutex::new(VecDeque::new()),
                hooks: hooks,
            }),
        }
    }

    /// The address this receiver was bound to.
    pub fn address(&self) -> Address {
        self.slot.address
    }
}

/// The bus object: fixed fragment and chain-node pools plus the sorted
/// receiver table.
pub struct Bus {
    frag_pool: Mutex<Vec<Frag>>,
    total_frags: usize,
    free_chain_nodes: AtomicI32,
    total_chain_nodes: i32,
    receivers: RwLock<Vec<Arc<ReceiverSlot>>>,
    next_dispatch_slot: AtomicUsize,
}

impl Bus {
    /// Initialize the bus with pools carved from a notional region of
    /// `region_size` bytes: the receiver chain block first, message
    /// fragments from the remainder.
    pub fn new(region_size: usize) -> Bus {
        let num_chain_nodes = MAX_PENDING_MESSAGES_PER_RECEIVER_SOFT_LIMIT * MAX_RECEIVERS;
        let chain_block_size = (num_chain_nodes * CHAIN_NODE_SIZE + 7) & !7;
        assert!(chain_block_size < region_size);
        let num_frags = (region_size - chain_block_size) / MSG_FRAGMENT_SIZE;
        assert!(num_frags >= 1);

        let mut pool = Vec::with_capacity(num_frags);
        for _ in 0..num_frags {
            pool.push(new_frag());
        }
        Bus {
            frag_pool: Mutex::new(pool),
            total_frags: num_frags,
            free_chain_nodes: AtomicI32::new(num_chain_nodes as i32),
            total_chain_nodes: num_chain_nodes as i32,
            receivers: RwLock::new(Vec::with_capacity(MAX_RECEIVERS)),
            next_dispatch_slot: AtomicUsize::new(0),
        }
    }

    /// Free fragments currently in the pool.
    pub fn free_frag_count(&self) -> usize {
        self.frag_pool.lock().unwrap().len()
    }

    /// Total fragments the pool was built with.
    pub fn total_frag_count(&self) -> usize {
        self.total_frags
    }

    /// Begin constructing a message; `None` if the bus is saturated and out
    /// of message buffers.
    pub fn msg_begin_unchecked(&self, msg_type: u32) -> Option<Msg> {
        Msg::begin(self, msg_type)
    }

    /// Begin constructing a message; panics if the bus is saturated.
    pub fn msg_begin_checked(&self, msg_type: u32) -> Msg {
        self.msg_begin_unchecked(msg_type)
            .expect("no free bus messages")
    }

    /// Connect a receiver. One receiver at a time; not thread-safe with
    /// respect to other connects/disconnects, but sends and dispatches may
    /// proceed concurrently on other threads.
    pub fn connect(&self, receiver: &Receiver) {
        let slot = receiver.slot.clone();
        slot.hazard.store(0, Ordering::Relaxed);
        slot.queue.lock().unwrap().clear();

        let mut entries = self.receivers.write().unwrap();
        assert!(entries.len() < MAX_RECEIVERS);
        debug_assert!(
            entries.iter().all(|e| !Arc::ptr_eq(e, &slot)),
            "bus receiver connected multiple times"
        );
        let pos = lower_bound(&entries, &slot, |a, b| a.address < b.address);
        entries.insert(pos, slot);
    }

    /// Disconnect a receiver, draining and releasing its undelivered
    /// messages once in-flight dispatches complete.
    pub fn disconnect(&self, receiver: &Receiver) {
        let slot = &receiver.slot;
        slot.hazard.fetch_or(HAZARD_DESTROYED, Ordering::Relaxed);
        {
            let mut entries = self.receivers.write().unwrap();
            let pos = entries
                .iter()
                .position(|e| Arc::ptr_eq(e, slot))
                .expect("disconnect of receiver that is not connected");
            entries.remove(pos);
        }
        // wait for an in-flight dispatch on this receiver to finish
        while slot.hazard.load(Ordering::Acquire) != HAZARD_DESTROYED {
            spin_loop_hint();
        }
        let pending: Vec<Arc<SentMsg>> = slot.queue.lock().unwrap().drain(..).collect();
        for msg in pending {
            msg.release(self);
            self.release_chain_node();
        }
    }

    /// Deliver pending messages to receivers. Safe to call from multiple
    /// threads simultaneously.
    pub fn dispatch(&self, mode: DispatchMode) -> DispatchResult {
        let mut entries = match self.receivers.try_read() {
            Ok(guard) => guard,
            Err(_) => return DispatchResult::Busy,
        };
        let mut num_receivers = entries.len();
        let mut all_busy = num_receivers > 0;
        let mut result = DispatchResult::NoMessages;

        let mut i = 0;
        while i < num_receivers {
            let idx = self.next_dispatch_slot.fetch_add(1, Ordering::Relaxed) % num_receivers;
            let slot = entries[idx].clone();

            // try to take dispatch access to the receiver
            let prior = slot.hazard.fetch_or(HAZARD_DISPATCH, Ordering::Acquire);
            if prior & HAZARD_DISPATCH == 0 {
                all_busy = false;
                // safe for other threads to modify the receiver table now
                drop(entries);

                let taken: Vec<Arc<SentMsg>> = {
                    let mut queue = slot.queue.lock().unwrap();
                    match mode {
                        DispatchMode::Flush => queue.drain(..).collect(),
                        DispatchMode::SingleMessage => {
                            queue.pop_front().into_iter().collect()
                        }
                    }
                };
                let delivered = !taken.is_empty();
                for sent in taken {
                    {
                        let mut reader = MsgReader::new(&sent);
                        let rc = slot.hooks.on_msg_recv(&sent.header, &mut reader);
                        if rc != 0 {
                            warn!(
                                "bus receiver {:08x} returned {} for msg type {:08x}",
                                slot.address.0, rc, sent.header.msg_type
                            );
                        }
                    }
                    sent.release(self);
                    self.release_chain_node();
                }
                slot.hazard.fetch_and(!HAZARD_DISPATCH, Ordering::Release);

                if delivered {
                    result = DispatchResult::Ok;
                    if mode == DispatchMode::SingleMessage {
                        return result;
                    }
                }

                entries = match self.receivers.try_read() {
                    Ok(guard) => guard,
                    Err(_) => return DispatchResult::Busy,
                };
                num_receivers = entries.len();
            }
            i += 1;
        }

        if all_busy {
            DispatchResult::Busy
        } else {
            result
        }
    }

    /// Send a message to the destination address/subnet. The message is
    /// delivered at some point in the future by `dispatch` pumps; `signal`,
    /// if supplied, raises once every matched receiver has processed it.
    pub fn send_async(
        &self,
        msg: Msg,
        source_address: Address,
        dest_address: Address,
        subnet_mask: Address,
        signal: Option<Arc<Signal>>,
    ) {
        let (sent, bus) = msg.into_sent(source_address, dest_address, subnet_mask, signal);
        assert!(
            bus as *const Bus == self as *const Bus,
            "attempt to send a message on a bus it was not created from"
        );
        let sent = Arc::new(sent);

        let matched: SmallVec<[Arc<ReceiverSlot>; MAX_RECEIVERS]> = {
            let entries = self.receivers.read().unwrap();
            collect_receivers(&entries, dest_address, subnet_mask)
        };

        if matched.is_empty() {
            sent.release(self);
            return;
        }

        for slot in &matched {
            // grab a chain node; if the pool is empty run the dispatch pump
            // to free one up
            while !self.try_acquire_chain_node() {
                self.dispatch(DispatchMode::SingleMessage);
            }
            sent.add_ref();

            let destroyed = {
                let mut queue = slot.queue.lock().unwrap();
                if slot.hazard.load(Ordering::Acquire) & HAZARD_DESTROYED != 0 {
                    true
                } else {
                    queue.push_back(sent.clone());
                    false
                }
            };
            if destroyed {
                sent.release(self);
                self.release_chain_node();
            }
        }

        // drop the sender's holding reference
        sent.release(self);
    }

    pub(crate) fn get_free_frag(&self) -> Option<Frag> {
        self.frag_pool.lock().unwrap().pop()
    }

    pub(crate) fn release_frags(&self, frags: Vec<Frag>) {
        let mut pool = self.frag_pool.lock().unwrap();
        for frag in frags {
            pool.push(frag);
        }
    }

    fn try_acquire_chain_node(&self) -> bool {
        let mut cur = self.free_chain_nodes.load(Ordering::Relaxed);
        loop {
            if cur <= 0 {
                return false;
            }
            match self.free_chain_nodes.compare_exchange_weak(
                cur,
                cur - 1,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(seen) => cur = seen,
            }
        }
    }

    fn release_chain_node(&self) {
        self.free_chain_nodes.fetch_add(1, Ordering::Release);
    }
}

impl Drop for Bus {
    fn drop(&mut self) {
        let free = self.free_frag_count();
        if free != self.total_frags {
            debug!("bus drop: leaked {} message fragments", self.total_frags - free);
        }
        let free_nodes = self.free_chain_nodes.load(Ordering::Relaxed);
        if free_nodes != self.total_chain_nodes {
            debug!(
                "bus drop: leaked {} message chains",
                self.total_chain_nodes - free_nodes
            );
        }
    }
}

// must run inside the receiver-table read guard; the table is sorted
// ascending by address so the walk can stop once an address exceeds the
// subnet mask
fn collect_receivers(
    entries: &[Arc<ReceiverSlot>],
    dest: Address,
    subnet: Address,
) -> SmallVec<[Arc<ReceiverSlot>; MAX_RECEIVERS]> {
    let mut matched = SmallVec::new();
    if dest == BROADCAST_ADDRESS {
        for e in entries {
            matched.push(e.clone());
        }
        return matched;
    }
    let masked = dest.masked(subnet);
    for e in entries {
        if e.address.0 > subnet.0 {
            break;
        }
        if e.address.masked(subnet) == masked {
            matched.push(e.clone());
        }
    }
    matched
}

/// Convenience: FOURCC of a 4-byte tag (little-endian, first byte lowest).
pub fn msg_type_fourcc(tag: &[u8; 4]) -> u32 {
    fourcc(tag)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn msg_type_constants_are_fourccs() {
        assert_eq!(msg_types::UTF8, msg_type_fourcc(b"UTF8"));
        assert_eq!(msg_types::LOG_V1, msg_type_fourcc(b"LOG1"));
        assert_eq!(msg_types::METRIC_V2, msg_type_fourcc(b"MET2"));
        assert_eq!(msg_types::EVENT, msg_type_fourcc(b"EVNT"));
    }

    #[test]
    fn address_parts() {
        assert_eq!(addresses::logger().0, 0x2a2a0100);
        assert_eq!(addresses::core_subnet_mask().0, 0xffff0000);
    }
}
