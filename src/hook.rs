//! Function hook registry.
//!
//! At most one hook exists per origin address, so hooks are keyed by origin.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};

/// A registered hook.
#[derive(Debug)]
pub struct HookEntry {
    /// Hooked function entry point.
    pub origin: usize,
    /// Replacement routine.
    pub target: usize,
    /// Caller-owned slot receiving the original entry point on redirection.
    pub original: &'static AtomicUsize,
    /// Set from a redirection until its single step fires. An execute fault at
    /// `origin` in that window runs the original code and clears it.
    pub reentry_suppressed: bool,
    /// Number of redirections.
    pub hits: u64,
}

impl HookEntry {
    /// Publish the original entry point for the target's call-through.
    pub fn publish_original(&self, ip: usize) {
        self.original.store(ip, Ordering::SeqCst);
    }
}

/// Snapshot of one hook for listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HookInfo {
    pub origin: usize,
    pub target: usize,
    pub hits: u64,
    pub reentry_suppressed: bool,
}

/// Hooks keyed by origin address.
#[derive(Debug, Default)]
pub struct HookRegistry {
    hooks: BTreeMap<usize, HookEntry>,
}

impl HookRegistry {
    pub const fn new() -> Self {
        Self {
            hooks: BTreeMap::new(),
        }
    }

    /// Insert a hook. Returns false, leaving the registry untouched, if
    /// `origin` is already hooked.
    pub fn insert(&mut self, origin: usize, target: usize, original: &'static AtomicUsize) -> bool {
        if self.hooks.contains_key(&origin) {
            return false;
        }
        self.hooks.insert(
            origin,
            HookEntry {
                origin,
                target,
                original,
                reentry_suppressed: false,
                hits: 0,
            },
        );
        true
    }

    pub fn remove(&mut self, origin: usize) -> Option<HookEntry> {
        self.hooks.remove(&origin)
    }

    /// Put back an entry taken out by [`Self::remove`].
    pub fn restore(&mut self, entry: HookEntry) {
        self.hooks.insert(entry.origin, entry);
    }

    pub fn get(&self, origin: usize) -> Option<&HookEntry> {
        self.hooks.get(&origin)
    }

    pub fn get_mut(&mut self, origin: usize) -> Option<&mut HookEntry> {
        self.hooks.get_mut(&origin)
    }

    pub fn contains(&self, origin: usize) -> bool {
        self.hooks.contains_key(&origin)
    }

    pub fn iter(&self) -> impl Iterator<Item = &HookEntry> {
        self.hooks.values()
    }

    pub fn list(&self) -> Vec<HookInfo> {
        self.hooks
            .values()
            .map(|h| HookInfo {
                origin: h.origin,
                target: h.target,
                hits: h.hits,
                reentry_suppressed: h.reentry_suppressed,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    pub fn clear(&mut self) {
        self.hooks.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static SLOT_A: AtomicUsize = AtomicUsize::new(0);
    static SLOT_B: AtomicUsize = AtomicUsize::new(0);

    #[test]
    fn test_duplicate_origin_keeps_first() {
        let mut hooks = HookRegistry::new();
        assert!(hooks.insert(0x1000, 0x5000, &SLOT_A));
        assert!(!hooks.insert(0x1000, 0x6000, &SLOT_B));

        assert_eq!(hooks.len(), 1);
        assert_eq!(hooks.get(0x1000).unwrap().target, 0x5000);
    }

    #[test]
    fn test_remove_and_restore() {
        let mut hooks = HookRegistry::new();
        hooks.insert(0x1000, 0x5000, &SLOT_A);
        hooks.get_mut(0x1000).unwrap().hits = 3;

        let entry = hooks.remove(0x1000).unwrap();
        assert!(hooks.is_empty());
        assert!(hooks.remove(0x1000).is_none());

        hooks.restore(entry);
        assert_eq!(hooks.get(0x1000).unwrap().hits, 3);
    }

    #[test]
    fn test_publish_original() {
        let mut hooks = HookRegistry::new();
        hooks.insert(0x2000, 0x7000, &SLOT_A);
        hooks.get(0x2000).unwrap().publish_original(0x2000);
        assert_eq!(SLOT_A.load(Ordering::SeqCst), 0x2000);
    }
}
