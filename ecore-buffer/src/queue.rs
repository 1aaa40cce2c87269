//! Bounded provider/consumer buffer queue
//!
//! The queue is a fixed table of slots plus a FIFO of submitted ones. A slot
//! moves through:
//!
//! ```text
//!  Empty ──acquire──▶ Reserved ──enqueue──▶ Queued ──dequeue──▶ ConsumerOwned
//!                                             ▲                      │
//!                       ProviderOwned ─enqueue┘       Free ◀─release─┘
//!                             ▲                         │
//!                             └────────acquire──────────┘
//! ```
//!
//! `Reserved` records an outstanding NEED_ALLOC answer: the provider was told
//! to allocate a new buffer and may enqueue exactly one unseen buffer into
//! it. Both endpoints keep their own mirror of this table.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;

/// Queue size used when the consumer does not ask for one
pub const DEFAULT_QUEUE_SIZE: usize = 2;

/// Protocol-wide identity of a buffer bound to a queue slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BufferSerial(pub u32);

impl fmt::Display for BufferSerial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// No buffer bound
    Empty,
    /// NEED_ALLOC handed out, waiting for a new buffer
    Reserved,
    /// Holds a buffer nobody is using
    Free,
    ProviderOwned,
    Queued,
    ConsumerOwned,
}

/// Result codes shared by both endpoints
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnCode {
    Error,
    Success,
    Empty,
    NotEmpty,
    NeedAlloc,
}

/// Outcome of a provider-side acquire on the slot table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquire {
    /// A previously released buffer is handed back for reuse
    Success(BufferSerial),
    /// A slot is free but has no buffer: allocate one and enqueue it
    NeedAlloc,
    /// Every slot is in use; wait for a release
    Empty,
}

impl Acquire {
    pub fn code(&self) -> ReturnCode {
        match self {
            Acquire::Success(_) => ReturnCode::Success,
            Acquire::NeedAlloc => ReturnCode::NeedAlloc,
            Acquire::Empty => ReturnCode::Empty,
        }
    }
}

/// Non-blocking peek of what `acquire` would return
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquirable {
    NotEmpty,
    Empty,
    NeedAlloc,
}

impl Acquirable {
    pub fn code(&self) -> ReturnCode {
        match self {
            Acquirable::NotEmpty => ReturnCode::NotEmpty,
            Acquirable::Empty => ReturnCode::Empty,
            Acquirable::NeedAlloc => ReturnCode::NeedAlloc,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    state: SlotState,
    serial: Option<BufferSerial>,
}

impl Slot {
    const EMPTY: Slot = Slot {
        state: SlotState::Empty,
        serial: None,
    };
}

#[derive(Debug, Clone)]
pub struct BufferQueue {
    slots: Vec<Slot>,
    /// Slots in `Queued`, oldest first
    queued: VecDeque<usize>,
    /// Slots in `Free`, in release order
    free: VecDeque<usize>,
}

impl BufferQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: vec![Slot::EMPTY; capacity],
            queued: VecDeque::with_capacity(capacity),
            free: VecDeque::with_capacity(capacity),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn slot_of(&self, serial: BufferSerial) -> Option<usize> {
        self.slots.iter().position(|s| s.serial == Some(serial))
    }

    fn first_in(&self, state: SlotState) -> Option<usize> {
        self.slots.iter().position(|s| s.state == state)
    }

    pub fn state(&self, serial: BufferSerial) -> Option<SlotState> {
        self.slot_of(serial).map(|i| self.slots[i].state)
    }

    pub fn contains(&self, serial: BufferSerial) -> bool {
        self.slot_of(serial).is_some()
    }

    /// Serials currently bound to slots in the given state
    pub fn serials_in(&self, state: SlotState) -> Vec<BufferSerial> {
        self.slots
            .iter()
            .filter(|s| s.state == state)
            .filter_map(|s| s.serial)
            .collect()
    }

    pub fn count(&self, state: SlotState) -> usize {
        self.slots.iter().filter(|s| s.state == state).count()
    }

    /// Provider: take a reusable buffer, or learn that one must be allocated
    pub fn acquire(&mut self) -> Acquire {
        if let Some(i) = self.free.pop_front() {
            self.slots[i].state = SlotState::ProviderOwned;
            if let Some(serial) = self.slots[i].serial {
                return Acquire::Success(serial);
            }
        }
        if let Some(i) = self.first_in(SlotState::Empty) {
            self.slots[i].state = SlotState::Reserved;
            return Acquire::NeedAlloc;
        }
        Acquire::Empty
    }

    pub fn acquirable_check(&self) -> Acquirable {
        if !self.free.is_empty() {
            Acquirable::NotEmpty
        } else if self.first_in(SlotState::Empty).is_some() {
            Acquirable::NeedAlloc
        } else {
            Acquirable::Empty
        }
    }

    /// Check that the provider may enqueue `serial`, without changing anything
    pub fn can_enqueue(&self, serial: BufferSerial) -> Result<()> {
        match self.slot_of(serial) {
            Some(i) if self.slots[i].state == SlotState::ProviderOwned => Ok(()),
            Some(_) => Err(Error::NotAcquiredByThisProvider),
            None if self.first_in(SlotState::Reserved).is_some() => Ok(()),
            None if self.first_in(SlotState::Empty).is_some() => {
                Err(Error::NotAcquiredByThisProvider)
            }
            None => Err(Error::QueueFull),
        }
    }

    /// Provider: submit an acquired buffer, or a new one into a reserved slot
    pub fn enqueue(&mut self, serial: BufferSerial) -> Result<()> {
        self.can_enqueue(serial)?;
        let i = match self.slot_of(serial) {
            Some(i) => i,
            None => self
                .first_in(SlotState::Reserved)
                .ok_or(Error::NotAcquiredByThisProvider)?,
        };
        self.slots[i] = Slot {
            state: SlotState::Queued,
            serial: Some(serial),
        };
        self.queued.push_back(i);
        Ok(())
    }

    /// Consumer mirror: the peer reported `serial` as enqueued
    pub fn enqueue_remote(&mut self, serial: BufferSerial) -> Result<()> {
        let i = match self.slot_of(serial) {
            Some(i) => i,
            None => self.first_in(SlotState::Empty).ok_or(Error::QueueFull)?,
        };
        match self.slots[i].state {
            SlotState::Empty | SlotState::Free | SlotState::ProviderOwned => {}
            state => {
                return Err(Error::Protocol(format!(
                    "buffer {} enqueued while {:?}",
                    serial, state
                )))
            }
        }
        self.free.retain(|&f| f != i);
        self.slots[i] = Slot {
            state: SlotState::Queued,
            serial: Some(serial),
        };
        self.queued.push_back(i);
        Ok(())
    }

    /// Consumer mirror: remember a buffer the peer attached but did not queue yet
    pub fn attach(&mut self, serial: BufferSerial) -> Result<()> {
        if self.contains(serial) {
            return Ok(());
        }
        let i = self.first_in(SlotState::Empty).ok_or(Error::QueueFull)?;
        self.slots[i] = Slot {
            state: SlotState::Free,
            serial: Some(serial),
        };
        Ok(())
    }

    /// Consumer: take the oldest queued buffer
    pub fn dequeue(&mut self) -> Option<BufferSerial> {
        let i = self.queued.pop_front()?;
        self.slots[i].state = SlotState::ConsumerOwned;
        self.slots[i].serial
    }

    pub fn is_empty(&self) -> bool {
        self.queued.is_empty()
    }

    /// Consumer: hand a dequeued buffer back
    pub fn release(&mut self, serial: BufferSerial) -> Result<()> {
        let i = self.slot_of(serial).ok_or(Error::NotOwnedByConsumer)?;
        if self.slots[i].state != SlotState::ConsumerOwned {
            return Err(Error::NotOwnedByConsumer);
        }
        self.slots[i].state = SlotState::Free;
        self.free.push_back(i);
        Ok(())
    }

    /// Provider mirror: the consumer released `serial`
    pub fn mark_released(&mut self, serial: BufferSerial) -> Result<()> {
        let i = self
            .slot_of(serial)
            .ok_or_else(|| Error::Protocol(format!("release of unknown buffer {}", serial)))?;
        match self.slots[i].state {
            SlotState::Queued => {
                self.queued.retain(|&q| q != i);
            }
            SlotState::ConsumerOwned => {}
            state => {
                return Err(Error::Protocol(format!(
                    "buffer {} released while {:?}",
                    serial, state
                )))
            }
        }
        self.slots[i].state = SlotState::Free;
        self.free.push_back(i);
        Ok(())
    }

    /// Unbind a buffer from its slot; returns the state it was in
    pub fn detach(&mut self, serial: BufferSerial) -> Option<SlotState> {
        let i = self.slot_of(serial)?;
        let state = self.slots[i].state;
        self.slots[i] = Slot::EMPTY;
        self.queued.retain(|&q| q != i);
        self.free.retain(|&f| f != i);
        Some(state)
    }

    /// The peer went away: everything it held becomes free again and
    /// outstanding reservations are cancelled
    pub fn reclaim_all(&mut self) -> Vec<BufferSerial> {
        let mut reclaimed = Vec::new();
        self.queued.clear();
        for i in 0..self.slots.len() {
            match self.slots[i].state {
                SlotState::Queued | SlotState::ConsumerOwned => {
                    self.slots[i].state = SlotState::Free;
                    self.free.push_back(i);
                    reclaimed.extend(self.slots[i].serial);
                }
                SlotState::Reserved => self.slots[i] = Slot::EMPTY,
                _ => {}
            }
        }
        reclaimed
    }

    /// Change the slot count; only unused slots are dropped
    ///
    /// Returns the serials of `Free` buffers that no longer fit.
    pub fn resize(&mut self, capacity: usize) -> Vec<BufferSerial> {
        let capacity = capacity.max(1);
        let mut evicted = Vec::new();

        while self.slots.len() > capacity {
            let victim = self
                .slots
                .iter()
                .rposition(|s| s.state == SlotState::Empty || s.state == SlotState::Reserved)
                .or_else(|| self.free.back().copied());
            let Some(i) = victim else {
                break;
            };
            if let Some(serial) = self.slots[i].serial {
                evicted.push(serial);
            }
            self.slots.remove(i);
            let fix = |v: &mut VecDeque<usize>| {
                v.retain(|&x| x != i);
                for x in v.iter_mut() {
                    if *x > i {
                        *x -= 1;
                    }
                }
            };
            fix(&mut self.queued);
            fix(&mut self.free);
        }
        while self.slots.len() < capacity {
            self.slots.push(Slot::EMPTY);
        }
        evicted
    }
}

impl Default for BufferQueue {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_SIZE)
    }
}
