//! # Reader Table
//!
//! Fixed-size slot array recording the snapshot of every live read
//! transaction, plus the meta state new readers start from.
//!
//! ```text
//! ReaderTable {
//!     slots:     [AtomicU64; max_readers],   // snapshot + 1, 0 = free
//!     published: Mutex<MetaState>,           // also the slot lock
//! }
//! ```
//!
//! Claiming a slot and reading the published meta state happen under one
//! lock, and a commit replaces the meta state under that same lock. The
//! oldest snapshot is found by scanning the slots without locking: a slot
//! being claimed concurrently holds a snapshot at least as new as the
//! writer's base, which the writer does not reclaim anyway.

use std::sync::atomic::{AtomicU64, Ordering};

use log::warn;
use parking_lot::Mutex;

use super::TxnId;
use crate::storage::MetaState;
use crate::{Error, Result};

pub struct ReaderTable {
    slots: Box<[AtomicU64]>,
    published: Mutex<MetaState>,
}

impl ReaderTable {
    pub fn new(max_readers: u32, meta: MetaState) -> Self {
        Self {
            slots: (0..max_readers.max(1)).map(|_| AtomicU64::new(0)).collect(),
            published: Mutex::new(meta),
        }
    }

    pub fn capacity(&self) -> u32 {
        self.slots.len() as u32
    }

    /// The most recently committed meta state.
    pub fn current(&self) -> MetaState {
        *self.published.lock()
    }

    /// Registers a reader on the current snapshot.
    pub fn begin(&self) -> Result<(MetaState, usize)> {
        let meta = self.published.lock();
        let marker = meta.txn_id + 1;

        for (idx, slot) in self.slots.iter().enumerate() {
            if slot.load(Ordering::Relaxed) == 0 {
                slot.store(marker, Ordering::SeqCst);
                if idx + 1 == self.slots.len() {
                    warn!("reader table at capacity ({} slots)", self.slots.len());
                }
                return Ok((*meta, idx));
            }
        }

        Err(Error::ReadersFull {
            max: self.capacity(),
        })
    }

    pub fn release(&self, slot: usize) {
        if let Some(slot) = self.slots.get(slot) {
            slot.store(0, Ordering::SeqCst);
        }
    }

    pub fn publish(&self, meta: MetaState) {
        *self.published.lock() = meta;
    }

    /// Oldest snapshot still registered.
    pub fn oldest(&self) -> Option<TxnId> {
        self.slots
            .iter()
            .map(|slot| slot.load(Ordering::SeqCst))
            .filter(|&marker| marker != 0)
            .min()
            .map(|marker| marker - 1)
    }

    pub fn live(&self) -> u32 {
        self.slots
            .iter()
            .filter(|slot| slot.load(Ordering::Relaxed) != 0)
            .count() as u32
    }
}
