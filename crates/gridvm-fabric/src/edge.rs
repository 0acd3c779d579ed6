//! Edge arena
//!
//! Edges live in a fixed-capacity arena and are addressed by 32-bit
//! handles instead of raw pointers. The handle that crosses thread (and
//! process) boundaries in `connect_*` messages carries a generation
//! counter; a stale handle fails the generation check instead of touching
//! a recycled slot, which closes the ABA hole of pointer-based edges.
//!
//! Slot reuse is a LIFO free stack plus a fresh-index watermark, so
//! recently released slots come back warm.

use core::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use gridvm_core::spinlock::SpinLock;

use crate::error::{FabricError, FabricResult};

/// Sentinel for "no node" in an edge slot
pub const NODE_NONE: u32 = u32::MAX;

/// Sentinel for "no edge" in a list link
pub const EDGE_NONE: u32 = u32::MAX;

/// A directed connection between two nodes
///
/// `receiver` is atomically nullable: a disconnecting receiver clears it
/// concurrently with sender traversals, which observe the null and skip
/// (or reap) the entry. `next` steps through the senders of the sink,
/// `down` through the receivers of the source.
pub struct EdgeSlot {
    pub(crate) sender: AtomicU32,
    pub(crate) receiver: AtomicU32,
    pub(crate) next: AtomicU32,
    pub(crate) down: AtomicU32,
    pub(crate) weight: AtomicU32,
    generation: AtomicU32,
}

impl EdgeSlot {
    const fn empty() -> Self {
        EdgeSlot {
            sender: AtomicU32::new(NODE_NONE),
            receiver: AtomicU32::new(NODE_NONE),
            next: AtomicU32::new(EDGE_NONE),
            down: AtomicU32::new(EDGE_NONE),
            weight: AtomicU32::new(0),
            generation: AtomicU32::new(0),
        }
    }

    #[inline]
    pub fn sender(&self) -> u32 {
        self.sender.load(Ordering::Acquire)
    }

    #[inline]
    pub fn receiver(&self) -> u32 {
        self.receiver.load(Ordering::Acquire)
    }

    /// Clear the receiver slot if it still holds `expected`
    ///
    /// The winner of this race owns the disconnect notification; the
    /// loser owns the deallocation.
    #[inline]
    pub fn clear_receiver(&self, expected: u32) -> bool {
        self.receiver
            .compare_exchange(expected, NODE_NONE, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Unconditionally clear the receiver slot, returning the old value
    #[inline]
    pub fn take_receiver(&self) -> u32 {
        self.receiver.swap(NODE_NONE, Ordering::AcqRel)
    }

    /// Edge weight as raw bits of an `f32`
    pub fn weight(&self) -> f32 {
        f32::from_bits(self.weight.load(Ordering::Relaxed))
    }

    pub fn set_weight(&self, weight: f32) {
        self.weight.store(weight.to_bits(), Ordering::Relaxed);
    }
}

/// Stable identity of an edge across messages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EdgeHandle {
    pub index: u32,
    pub generation: u32,
}

impl EdgeHandle {
    pub fn pack(&self) -> u64 {
        (u64::from(self.generation) << 32) | u64::from(self.index)
    }

    pub fn unpack(packed: u64) -> Self {
        EdgeHandle {
            index: packed as u32,
            generation: (packed >> 32) as u32,
        }
    }

    /// Parse the decimal rendering used in `connect_*` message payloads
    pub fn parse(text: &str) -> Option<Self> {
        text.trim().parse::<u64>().ok().map(Self::unpack)
    }
}

impl fmt::Display for EdgeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.pack())
    }
}

/// Fixed-capacity arena of edges
pub struct EdgeArena {
    slots: Box<[EdgeSlot]>,
    free: SpinLock<Vec<u32>>,
    next_fresh: AtomicU32,
}

impl EdgeArena {
    pub fn new(capacity: usize) -> Self {
        let slots = (0..capacity)
            .map(|_| EdgeSlot::empty())
            .collect::<Vec<_>>()
            .into_boxed_slice();
        EdgeArena {
            slots,
            free: SpinLock::new(Vec::new()),
            next_fresh: AtomicU32::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Allocate an edge `sender -> receiver`
    pub fn allocate(&self, sender: u32, receiver: u32) -> FabricResult<EdgeHandle> {
        let index = self.claim_index()?;
        let slot = &self.slots[index as usize];
        slot.sender.store(sender, Ordering::Relaxed);
        slot.next.store(EDGE_NONE, Ordering::Relaxed);
        slot.down.store(EDGE_NONE, Ordering::Relaxed);
        slot.weight.store(0, Ordering::Relaxed);
        // Publish the receiver last; traversals key on it
        slot.receiver.store(receiver, Ordering::Release);
        Ok(EdgeHandle {
            index,
            generation: slot.generation.load(Ordering::Acquire),
        })
    }

    fn claim_index(&self) -> FabricResult<u32> {
        {
            let mut free = self.free.lock();
            if let Some(index) = free.pop() {
                return Ok(index);
            }
        }

        loop {
            let current = self.next_fresh.load(Ordering::Acquire);
            if current as usize >= self.slots.len() {
                return Err(FabricError::EdgesExhausted);
            }
            match self.next_fresh.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(current),
                Err(_) => continue,
            }
        }
    }

    /// Return an edge to the arena; bumping the generation invalidates
    /// every outstanding handle to it
    pub fn release(&self, index: u32) {
        let slot = &self.slots[index as usize];
        slot.generation.fetch_add(1, Ordering::AcqRel);
        slot.sender.store(NODE_NONE, Ordering::Relaxed);
        slot.receiver.store(NODE_NONE, Ordering::Relaxed);
        slot.next.store(EDGE_NONE, Ordering::Relaxed);
        slot.down.store(EDGE_NONE, Ordering::Relaxed);
        self.free.lock().push(index);
    }

    #[inline]
    pub fn get(&self, index: u32) -> &EdgeSlot {
        &self.slots[index as usize]
    }

    /// Current handle for a live slot
    pub fn handle_of(&self, index: u32) -> EdgeHandle {
        EdgeHandle {
            index,
            generation: self.slots[index as usize].generation.load(Ordering::Acquire),
        }
    }

    /// Resolve a handle, failing on staleness or out-of-range indices
    pub fn resolve(&self, handle: EdgeHandle) -> Option<&EdgeSlot> {
        let slot = self.slots.get(handle.index as usize)?;
        if slot.generation.load(Ordering::Acquire) == handle.generation {
            Some(slot)
        } else {
            None
        }
    }
}
