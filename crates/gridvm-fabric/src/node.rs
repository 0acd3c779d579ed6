//! Addressed nodes and the edge graph
//!
//! Each node keeps two singly-linked edge lists threaded through the
//! arena: `senders` (stepping the `next` axis, keyed by sender) and
//! `receivers` (stepping the `down` axis, keyed by receiver). Lists are
//! kept in ascending node-key order as a traversal heuristic; membership
//! checks scan to the end, so ordering is never a correctness concern.
//!
//! A node only mutates its own lists (from user calls and its strand);
//! the single cross-thread coordination point is the atomic receiver
//! slot of each edge. Whoever loses the clear race frees the edge.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};

use gridvm_core::strand::Strand;
use gridvm_core::task::function_task;

use crate::address::Address;
use crate::clock::ScalarTime;
use crate::edge::{EdgeHandle, EDGE_NONE, NODE_NONE};
use crate::error::FabricResult;
use crate::message::{Message, MessageKind};
use crate::vm::Vm;

type DataHandler = Box<dyn Fn(&Message) + Send + Sync>;

/// An addressable participant of the fabric
pub struct Node {
    addr: Address,
    key: u32,
    vm: Weak<Vm>,
    clock: Mutex<ScalarTime>,

    /// Head of the senders list (`next` axis)
    senders: AtomicU32,

    /// Head of the receivers list (`down` axis)
    receivers: AtomicU32,

    strand: Strand,

    /// Invoked for inbound `port_data`, on the node's strand
    data_handler: Mutex<Option<DataHandler>>,
}

impl Node {
    /// Create and register a node
    pub fn new(vm: &Arc<Vm>, addr: Address) -> FabricResult<Arc<Node>> {
        vm.register_node(addr, |key, strand| {
            Arc::new(Node {
                addr,
                key,
                vm: Arc::downgrade(vm),
                clock: Mutex::new(ScalarTime::default()),
                senders: AtomicU32::new(EDGE_NONE),
                receivers: AtomicU32::new(EDGE_NONE),
                strand,
                data_handler: Mutex::new(None),
            })
        })
    }

    #[inline]
    pub fn address(&self) -> Address {
        self.addr
    }

    /// Registry token; what edges carry instead of a pointer
    #[inline]
    pub fn key(&self) -> u32 {
        self.key
    }

    pub fn time(&self) -> ScalarTime {
        *self.clock.lock().unwrap()
    }

    pub(crate) fn vm(&self) -> Option<Arc<Vm>> {
        self.vm.upgrade()
    }

    /// Install the sink for inbound `port_data`
    pub fn set_data_handler<H>(&self, handler: H)
    where
        H: Fn(&Message) + Send + Sync + 'static,
    {
        *self.data_handler.lock().unwrap() = Some(Box::new(handler));
    }

    fn advance_clock(&self) -> ScalarTime {
        let mut clock = self.clock.lock().unwrap();
        clock.advance();
        *clock
    }

    fn merge_clock(&self, observed: ScalarTime) {
        let mut clock = self.clock.lock().unwrap();
        clock.merge(observed);
        clock.advance();
    }

    /// Connect `other` as a receiver of this node
    ///
    /// Splices a fresh edge into the local receivers list, then posts
    /// `connect_sender` so the peer attaches the mirror entry on its
    /// strand. Returns `false` when already connected.
    pub fn connect(&self, other: &Arc<Node>) -> bool {
        let Some(vm) = self.vm.upgrade() else {
            return false;
        };
        let arena = vm.arena();
        let target = other.key;

        // Membership first: the sort order is only a hint
        let mut scan = self.receivers.load(Ordering::Acquire);
        while scan != EDGE_NONE {
            let slot = arena.get(scan);
            if slot.receiver() == target {
                return false;
            }
            scan = slot.down.load(Ordering::Acquire);
        }

        // Insertion point: first live entry with key >= target
        let mut before = EDGE_NONE;
        let mut cur = self.receivers.load(Ordering::Acquire);
        while cur != EDGE_NONE {
            let slot = arena.get(cur);
            let rk = slot.receiver();
            if rk != NODE_NONE && rk >= target {
                break;
            }
            before = cur;
            cur = slot.down.load(Ordering::Acquire);
        }

        let handle = match arena.allocate(self.key, target) {
            Ok(handle) => handle,
            Err(e) => {
                tracing::error!(error = %e, "connect dropped");
                return false;
            }
        };
        let slot = arena.get(handle.index);
        slot.down.store(cur, Ordering::Relaxed);
        if before == EDGE_NONE {
            self.receivers.store(handle.index, Ordering::Release);
        } else {
            arena.get(before).down.store(handle.index, Ordering::Release);
        }

        let time = self.advance_clock();
        vm.post_message(Message::new(
            MessageKind::ConnectSender,
            self.addr,
            other.addr,
            time,
            handle.to_string(),
        ));
        true
    }

    /// Disconnect a receiver connected through [`Node::connect`]
    ///
    /// Returns `false` when no such edge exists.
    pub fn disconnect(&self, other: &Arc<Node>) -> bool {
        self.detach_receiver(other.key)
    }

    /// Handle one inbound message; runs on this node's strand
    pub fn on_message(&self, msg: &Message) {
        self.merge_clock(msg.time);

        match msg.kind {
            MessageKind::PortData => {
                if let Some(handler) = &*self.data_handler.lock().unwrap() {
                    handler(msg);
                }
            }
            MessageKind::ConnectSender => {
                if let Some(handle) = EdgeHandle::parse(&msg.data) {
                    self.attach_sender_edge(handle);
                }
            }
            MessageKind::ConnectReceiver => {
                if let Some(handle) = EdgeHandle::parse(&msg.data) {
                    self.attach_receiver_edge(handle);
                }
            }
            MessageKind::DisconnectSender => {
                if let Some(key) = parse_key(&msg.data) {
                    self.detach_sender(key);
                }
            }
            MessageKind::DisconnectReceiver => {
                if let Some(key) = parse_key(&msg.data) {
                    self.detach_receiver(key);
                }
            }
            MessageKind::Unknown => {}
        }
    }

    /// Broadcast `data` to every live receiver, reaping cleared edges
    pub fn post_data(&self, data: &str) {
        let Some(vm) = self.vm.upgrade() else {
            return;
        };
        let arena = vm.arena();
        let time = self.advance_clock();

        let mut before = EDGE_NONE;
        let mut cur = self.receivers.load(Ordering::Acquire);
        while cur != EDGE_NONE {
            let slot = arena.get(cur);
            let rk = slot.receiver();
            let next = slot.down.load(Ordering::Acquire);

            if rk != NODE_NONE {
                if let Some(addr) = vm.address_of(rk) {
                    vm.post_message(Message::new(
                        MessageKind::PortData,
                        self.addr,
                        addr,
                        time,
                        data,
                    ));
                }
                before = cur;
            } else {
                // Peer cleared the edge; the observer owns the release
                if before == EDGE_NONE {
                    self.receivers.store(next, Ordering::Release);
                } else {
                    arena.get(before).down.store(next, Ordering::Release);
                }
                arena.release(cur);
            }
            cur = next;
        }
    }

    /// Splice the mirror edge of a `connect_sender` message into the
    /// senders list
    fn attach_sender_edge(&self, handle: EdgeHandle) {
        let Some(vm) = self.vm.upgrade() else {
            return;
        };
        let arena = vm.arena();
        let Some(slot) = arena.resolve(handle) else {
            // Stale handle: the edge died before the message arrived
            return;
        };
        let sender_key = slot.sender();
        if sender_key == NODE_NONE {
            return;
        }

        let mut scan = self.senders.load(Ordering::Acquire);
        while scan != EDGE_NONE {
            if scan == handle.index {
                return;
            }
            let entry = arena.get(scan);
            if entry.sender() == sender_key {
                return;
            }
            scan = entry.next.load(Ordering::Acquire);
        }

        let mut before = EDGE_NONE;
        let mut cur = self.senders.load(Ordering::Acquire);
        while cur != EDGE_NONE {
            let entry = arena.get(cur);
            let sk = entry.sender();
            if sk != NODE_NONE && sk >= sender_key {
                break;
            }
            before = cur;
            cur = entry.next.load(Ordering::Acquire);
        }

        let slot = arena.get(handle.index);
        slot.next.store(cur, Ordering::Relaxed);
        if before == EDGE_NONE {
            self.senders.store(handle.index, Ordering::Release);
        } else {
            arena.get(before).next.store(handle.index, Ordering::Release);
        }
    }

    /// Splice the mirror edge of a `connect_receiver` message into the
    /// receivers list
    fn attach_receiver_edge(&self, handle: EdgeHandle) {
        let Some(vm) = self.vm.upgrade() else {
            return;
        };
        let arena = vm.arena();
        let Some(slot) = arena.resolve(handle) else {
            return;
        };
        let receiver_key = slot.receiver();
        if receiver_key == NODE_NONE {
            return;
        }

        let mut scan = self.receivers.load(Ordering::Acquire);
        while scan != EDGE_NONE {
            if scan == handle.index {
                return;
            }
            let entry = arena.get(scan);
            if entry.receiver() == receiver_key {
                return;
            }
            scan = entry.down.load(Ordering::Acquire);
        }

        let mut before = EDGE_NONE;
        let mut cur = self.receivers.load(Ordering::Acquire);
        while cur != EDGE_NONE {
            let entry = arena.get(cur);
            let rk = entry.receiver();
            if rk != NODE_NONE && rk >= receiver_key {
                break;
            }
            before = cur;
            cur = entry.down.load(Ordering::Acquire);
        }

        let slot = arena.get(handle.index);
        slot.down.store(cur, Ordering::Relaxed);
        if before == EDGE_NONE {
            self.receivers.store(handle.index, Ordering::Release);
        } else {
            arena.get(before).down.store(handle.index, Ordering::Release);
        }
    }

    /// Unlink the edge whose sender is `sender_key` from the senders list
    fn detach_sender(&self, sender_key: u32) -> bool {
        let Some(vm) = self.vm.upgrade() else {
            return false;
        };
        let arena = vm.arena();

        let mut before = EDGE_NONE;
        let mut cur = self.senders.load(Ordering::Acquire);
        while cur != EDGE_NONE {
            let slot = arena.get(cur);
            let next = slot.next.load(Ordering::Acquire);
            if slot.sender() == sender_key {
                if before == EDGE_NONE {
                    self.senders.store(next, Ordering::Release);
                } else {
                    arena.get(before).next.store(next, Ordering::Release);
                }

                if slot.clear_receiver(self.key) {
                    // We won the race: tell the sender to drop its entry
                    let time = self.advance_clock();
                    if let Some(addr) = vm.address_of(sender_key) {
                        vm.post_message(Message::new(
                            MessageKind::DisconnectSender,
                            self.addr,
                            addr,
                            time,
                            self.key.to_string(),
                        ));
                    }
                } else {
                    // Peer already cleared it: the edge is ours to free
                    arena.release(cur);
                }
                return true;
            }
            before = cur;
            cur = next;
        }
        false
    }

    /// Unlink the edge whose receiver is `receiver_key` from the
    /// receivers list
    fn detach_receiver(&self, receiver_key: u32) -> bool {
        let Some(vm) = self.vm.upgrade() else {
            return false;
        };
        let arena = vm.arena();

        let mut before = EDGE_NONE;
        let mut cur = self.receivers.load(Ordering::Acquire);
        while cur != EDGE_NONE {
            let slot = arena.get(cur);
            let next = slot.down.load(Ordering::Acquire);
            if slot.receiver() == receiver_key {
                if before == EDGE_NONE {
                    self.receivers.store(next, Ordering::Release);
                } else {
                    arena.get(before).down.store(next, Ordering::Release);
                }

                if slot.clear_receiver(receiver_key) {
                    let time = self.advance_clock();
                    if let Some(addr) = vm.address_of(receiver_key) {
                        vm.post_message(Message::new(
                            MessageKind::DisconnectSender,
                            self.addr,
                            addr,
                            time,
                            self.key.to_string(),
                        ));
                    }
                } else {
                    arena.release(cur);
                }
                return true;
            }
            before = cur;
            cur = next;
        }
        false
    }

    /// Sever every sender edge; part of teardown
    pub fn disconnect_all_senders(&self) {
        let Some(vm) = self.vm.upgrade() else {
            return;
        };
        let arena = vm.arena();

        let mut cur = self.senders.load(Ordering::Acquire);
        while cur != EDGE_NONE {
            let slot = arena.get(cur);
            let next = slot.next.load(Ordering::Acquire);
            if !slot.clear_receiver(self.key) {
                // Already cleared by the sender: free it here
                arena.release(cur);
            }
            // On success the sender's traversal observes the null and
            // reaps the entry; no message needed
            self.senders.store(next, Ordering::Release);
            cur = next;
        }
    }

    /// Sever every receiver edge; part of teardown
    pub fn disconnect_all_receivers(&self) {
        let Some(vm) = self.vm.upgrade() else {
            return;
        };
        let arena = vm.arena();

        let mut cur = self.receivers.load(Ordering::Acquire);
        while cur != EDGE_NONE {
            let slot = arena.get(cur);
            let next = slot.down.load(Ordering::Acquire);
            let receiver = slot.take_receiver();

            if receiver == NODE_NONE {
                arena.release(cur);
            } else {
                let time = self.advance_clock();
                if let Some(addr) = vm.address_of(receiver) {
                    vm.post_message(Message::new(
                        MessageKind::DisconnectSender,
                        self.addr,
                        addr,
                        time,
                        self.key.to_string(),
                    ));
                }
            }
            self.receivers.store(next, Ordering::Release);
            cur = next;
        }
    }

    /// Whether `other` is currently a live receiver of this node
    pub fn has_receiver(&self, other: &Arc<Node>) -> bool {
        let Some(vm) = self.vm.upgrade() else {
            return false;
        };
        let arena = vm.arena();
        let mut cur = self.receivers.load(Ordering::Acquire);
        while cur != EDGE_NONE {
            let slot = arena.get(cur);
            if slot.receiver() == other.key {
                return true;
            }
            cur = slot.down.load(Ordering::Acquire);
        }
        false
    }

    /// Live receiver keys, in list order
    pub fn receiver_keys(&self) -> Vec<u32> {
        let Some(vm) = self.vm.upgrade() else {
            return Vec::new();
        };
        let arena = vm.arena();
        let mut keys = Vec::new();
        let mut cur = self.receivers.load(Ordering::Acquire);
        while cur != EDGE_NONE {
            let slot = arena.get(cur);
            let rk = slot.receiver();
            if rk != NODE_NONE {
                keys.push(rk);
            }
            cur = slot.down.load(Ordering::Acquire);
        }
        keys
    }

    /// Live sender keys, in list order
    pub fn sender_keys(&self) -> Vec<u32> {
        let Some(vm) = self.vm.upgrade() else {
            return Vec::new();
        };
        let arena = vm.arena();
        let mut keys = Vec::new();
        let mut cur = self.senders.load(Ordering::Acquire);
        while cur != EDGE_NONE {
            let slot = arena.get(cur);
            let sk = slot.sender();
            if sk != NODE_NONE {
                keys.push(sk);
            }
            cur = slot.next.load(Ordering::Acquire);
        }
        keys
    }

    /// Schedule `msg` on this node's strand
    pub(crate) fn deliver(self: &Arc<Self>, msg: Message) {
        let node = Arc::clone(self);
        let (task, _result) = function_task(1, move || {
            node.on_message(&msg);
        });
        self.strand.post(task);
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.disconnect_all_senders();
        self.disconnect_all_receivers();
    }
}

fn parse_key(text: &str) -> Option<u32> {
    text.trim().parse().ok()
}
