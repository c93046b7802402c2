//! Memory-access watch registry.
//!
//! Watches are kept in registration order. Several watches may share an
//! address; each carries its own access mask and callback.

use alloc::vec::Vec;

use crate::frame::{Access, TrapFrame};
use crate::slots::{MAX_FIRED, Slots};

bitflags::bitflags! {
    /// Access kinds a watch is interested in.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AccessMask: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
    }
}

impl AccessMask {
    /// Mask bit for one access kind. Instruction fetches are never watched.
    pub fn from_access(access: Access) -> Option<Self> {
        match access {
            Access::Read => Some(Self::READ),
            Access::Write => Some(Self::WRITE),
            Access::Execute => None,
        }
    }
}

/// Callback invoked on the faulting thread with its registers and the access kind.
pub type WatchCallback = fn(&mut dyn TrapFrame, Access);

/// Callbacks collected for one access, run once the engine lock is released.
pub type Fired = Slots<WatchCallback, MAX_FIRED>;

/// A registered watch.
#[derive(Clone, Copy)]
pub struct WatchEntry {
    /// Watched byte address (not page aligned).
    pub address: usize,
    /// Access kinds that fire the callback.
    pub mask: AccessMask,
    /// Callback to invoke.
    pub callback: WatchCallback,
    /// Number of callback invocations.
    pub hits: u64,
}

impl core::fmt::Debug for WatchEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("WatchEntry")
            .field("address", &format_args!("{:#x}", self.address))
            .field("mask", &self.mask)
            .field("callback", &(self.callback as usize as *const ()))
            .field("hits", &self.hits)
            .finish()
    }
}

/// Snapshot of one watch for listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchInfo {
    pub address: usize,
    pub mask: AccessMask,
    pub hits: u64,
}

/// Ordered collection of watches.
#[derive(Debug, Default, Clone)]
pub struct WatchRegistry {
    entries: Vec<WatchEntry>,
}

impl WatchRegistry {
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Append a watch. Duplicates are allowed.
    pub fn push(&mut self, address: usize, mask: AccessMask, callback: WatchCallback) {
        self.entries.push(WatchEntry {
            address,
            mask,
            callback,
            hits: 0,
        });
    }

    /// Drop the most recently pushed watch.
    pub fn pop(&mut self) -> Option<WatchEntry> {
        self.entries.pop()
    }

    /// Remove every watch at exactly `address`. Returns how many were removed.
    pub fn remove_all(&mut self, address: usize) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| e.address != address);
        before - self.entries.len()
    }

    /// Count a hit on every watch matching `address` and `access` and collect
    /// their callbacks into `fired` in registry order.
    ///
    /// Returns how many matching watches did not fit; those are neither
    /// counted nor run.
    pub fn fire(&mut self, address: usize, access: Access, fired: &mut Fired) -> usize {
        let Some(bit) = AccessMask::from_access(access) else {
            return 0;
        };

        let mut dropped = 0;
        for entry in self
            .entries
            .iter_mut()
            .filter(|e| e.address == address && e.mask.contains(bit))
        {
            if fired.insert(entry.callback) {
                entry.hits += 1;
            } else {
                dropped += 1;
            }
        }
        dropped
    }

    /// Watches at exactly `address`.
    pub fn at(&self, address: usize) -> impl Iterator<Item = &WatchEntry> {
        self.entries.iter().filter(move |e| e.address == address)
    }

    pub fn iter(&self) -> impl Iterator<Item = &WatchEntry> {
        self.entries.iter()
    }

    pub fn list(&self) -> Vec<WatchInfo> {
        self.entries
            .iter()
            .map(|e| WatchInfo {
                address: e.address,
                mask: e.mask,
                hits: e.hits,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
