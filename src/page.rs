//! Per-page guard bookkeeping.
//!
//! One page can carry entries from both registries. The guard attribute lives
//! on the page, so the table counts hook and watch entries per page: the page
//! is guarded iff its count is non-zero. It also tracks whether the attribute
//! is currently applied or was cleared by a fault that has not been re-armed.
//!
//! [`Protector`] is the only caller of the platform's protection primitive.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use crate::error::Error;
use crate::platform::{PageOps, page_base};

/// Applies and removes the guard attribute on the page holding an address.
pub struct Protector<P: PageOps> {
    platform: P,
    page_size: usize,
}

impl<P: PageOps> Protector<P> {
    /// Wrap `platform`, querying its page size once.
    pub fn new(platform: P) -> Self {
        let page_size = platform.page_size();
        debug_assert!(page_size.is_power_of_two(), "page size {:#x}", page_size);
        Self {
            platform,
            page_size,
        }
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Page base holding `address`.
    #[inline]
    pub fn page_of(&self, address: usize) -> usize {
        page_base(address, self.page_size)
    }

    /// Guard the page holding `address`.
    pub fn guard(&self, address: usize) -> Result<(), Error> {
        self.set(address, true)
    }

    /// Unguard the page holding `address`.
    pub fn unguard(&self, address: usize) -> Result<(), Error> {
        self.set(address, false)
    }

    fn set(&self, address: usize, guarded: bool) -> Result<(), Error> {
        let page = self.page_of(address);
        self.platform
            .set_guard(page, self.page_size, guarded)
            .map_err(|cause| Error::ProtectionChangeFailed {
                address,
                page,
                cause,
            })?;
        log::trace!(
            "protector: page {:#x} {}",
            page,
            if guarded { "guarded" } else { "unguarded" }
        );
        Ok(())
    }
}

/// Which registry an entry belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Owner {
    Hook,
    Watch,
}

/// Protection state of a tracked page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardState {
    /// Guard attribute applied.
    Guarded,
    /// A fault cleared the guard and a single-step trap was requested.
    TrapArmed,
}

/// Bookkeeping for one tracked page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageEntry {
    pub hooks: usize,
    pub watches: usize,
    pub state: GuardState,
}

impl PageEntry {
    fn refs(&self) -> usize {
        self.hooks + self.watches
    }
}

/// Tracked pages keyed by page base.
#[derive(Debug, Default, Clone)]
pub struct PageTable {
    pages: BTreeMap<usize, PageEntry>,
}

impl PageTable {
    pub const fn new() -> Self {
        Self {
            pages: BTreeMap::new(),
        }
    }

    /// Count one more entry on `page`. Returns true if the page was untracked,
    /// i.e. the caller must apply the guard.
    pub fn acquire(&mut self, page: usize, owner: Owner) -> bool {
        let mut fresh = false;
        let entry = self.pages.entry(page).or_insert_with(|| {
            fresh = true;
            PageEntry {
                hooks: 0,
                watches: 0,
                state: GuardState::Guarded,
            }
        });
        match owner {
            Owner::Hook => entry.hooks += 1,
            Owner::Watch => entry.watches += 1,
        }
        fresh
    }

    /// Drop `count` entries of `owner` from `page`. Returns true if no entry
    /// remains, i.e. the caller must remove the guard.
    pub fn release(&mut self, page: usize, owner: Owner, count: usize) -> bool {
        let Some(entry) = self.pages.get_mut(&page) else {
            debug_assert!(false, "release of untracked page {:#x}", page);
            return false;
        };
        let slot = match owner {
            Owner::Hook => &mut entry.hooks,
            Owner::Watch => &mut entry.watches,
        };
        debug_assert!(*slot >= count, "page {:#x} tally underflow", page);
        *slot = slot.saturating_sub(count);

        if entry.refs() == 0 {
            self.pages.remove(&page);
            true
        } else {
            false
        }
    }

    pub fn get(&self, page: usize) -> Option<&PageEntry> {
        self.pages.get(&page)
    }

    pub fn contains(&self, page: usize) -> bool {
        self.pages.contains_key(&page)
    }

    /// Whether `page` hosts at least one hook.
    pub fn has_hooks(&self, page: usize) -> bool {
        self.pages.get(&page).is_some_and(|e| e.hooks > 0)
    }

    pub fn set_state(&mut self, page: usize, state: GuardState) {
        if let Some(entry) = self.pages.get_mut(&page) {
            entry.state = state;
        }
    }

    /// Tracked page bases, ascending.
    pub fn pages(&self) -> Vec<usize> {
        self.pages.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn clear(&mut self) {
        self.pages.clear();
    }

    /// Recompute the tally from the entry pages of both registries and compare.
    pub fn matches(
        &self,
        hook_pages: impl Iterator<Item = usize>,
        watch_pages: impl Iterator<Item = usize>,
    ) -> bool {
        let mut expected: BTreeMap<usize, (usize, usize)> = BTreeMap::new();
        for page in hook_pages {
            expected.entry(page).or_default().0 += 1;
        }
        for page in watch_pages {
            expected.entry(page).or_default().1 += 1;
        }

        expected.len() == self.pages.len()
            && expected.iter().all(|(page, (hooks, watches))| {
                self.pages
                    .get(page)
                    .is_some_and(|e| e.hooks == *hooks && e.watches == *watches)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::mock::MockPlatform;

    #[test]
    fn test_protector_rounds_to_page() {
        let protector = Protector::new(MockPlatform::new());
        protector.guard(0x1234).unwrap();
        assert!(protector.platform().is_guarded(0x1000));

        protector.unguard(0x1ffc).unwrap();
        assert!(!protector.platform().is_guarded(0x1000));
        assert!(protector.platform().calls().iter().all(|c| c.len == 0x1000));
    }

    #[test]
    fn test_protector_reports_failure() {
        let protector = Protector::new(MockPlatform::new());
        protector.platform().fail_on(0x5000);
        let err = protector.guard(0x5008).unwrap_err();
        assert!(matches!(
            err,
            Error::ProtectionChangeFailed {
                address: 0x5008,
                page: 0x5000,
                ..
            }
        ));
    }

    #[test]
    fn test_first_acquire_requests_guard() {
        let mut table = PageTable::new();
        assert!(table.acquire(0x1000, Owner::Watch));
        assert!(!table.acquire(0x1000, Owner::Watch));
        assert!(!table.acquire(0x1000, Owner::Hook));
        assert_eq!(table.get(0x1000).unwrap().refs(), 3);
    }

    #[test]
    fn test_last_release_requests_unguard() {
        let mut table = PageTable::new();
        table.acquire(0x1000, Owner::Hook);
        table.acquire(0x1000, Owner::Watch);
        table.acquire(0x1000, Owner::Watch);

        assert!(!table.release(0x1000, Owner::Watch, 2));
        assert!(table.has_hooks(0x1000));
        assert!(table.release(0x1000, Owner::Hook, 1));
        assert!(table.is_empty());
    }

    #[test]
    fn test_state_transitions() {
        let mut table = PageTable::new();
        table.acquire(0x3000, Owner::Hook);
        assert_eq!(table.get(0x3000).unwrap().state, GuardState::Guarded);

        table.set_state(0x3000, GuardState::TrapArmed);
        assert_eq!(table.get(0x3000).unwrap().state, GuardState::TrapArmed);

        // Untracked pages are ignored.
        table.set_state(0x9000, GuardState::TrapArmed);
        assert!(!table.contains(0x9000));
    }

    #[test]
    fn test_matches_rescan() {
        let mut table = PageTable::new();
        table.acquire(0x1000, Owner::Hook);
        table.acquire(0x2000, Owner::Watch);
        table.acquire(0x2000, Owner::Watch);

        assert!(table.matches([0x1000].into_iter(), [0x2000, 0x2000].into_iter()));
        assert!(!table.matches([0x1000].into_iter(), [0x2000].into_iter()));
        assert!(!table.matches(core::iter::empty(), [0x2000, 0x2000].into_iter()));
    }
}
