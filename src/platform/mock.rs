//! Instrumented fake platform for tests.
//!
//! Records the guard state of every page it is asked to touch and every
//! protection call, and can be told to refuse protection changes for a page.

use alloc::collections::{BTreeMap, BTreeSet};
use alloc::vec::Vec;
use core::cell::Cell;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::Mutex;

use axerrno::AxResult;

use super::PageOps;

/// Mock page size (4KB).
pub const MOCK_PAGE_SIZE: usize = 0x1000;

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

std::thread_local! {
    static THREAD_ID: Cell<u64> = const { Cell::new(0) };
}

/// One recorded protection change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtectCall {
    pub page: usize,
    pub len: usize,
    pub guarded: bool,
}

#[derive(Default)]
struct MockState {
    guarded: BTreeMap<usize, bool>,
    calls: Vec<ProtectCall>,
    failing: BTreeSet<usize>,
}

/// Mock platform operations for testing.
pub struct MockPlatform {
    page_size: usize,
    state: Mutex<MockState>,
}

impl Default for MockPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl MockPlatform {
    /// Mock with 4KB pages.
    pub fn new() -> Self {
        Self::with_page_size(MOCK_PAGE_SIZE)
    }

    /// Mock with a custom page size (power of two).
    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            page_size,
            state: Mutex::new(MockState::default()),
        }
    }

    /// Whether `page` currently carries the guard attribute.
    pub fn is_guarded(&self, page: usize) -> bool {
        self.state.lock().guarded.get(&page).copied().unwrap_or(false)
    }

    /// All pages currently guarded, ascending.
    pub fn guarded_pages(&self) -> Vec<usize> {
        self.state
            .lock()
            .guarded
            .iter()
            .filter(|(_, on)| **on)
            .map(|(page, _)| *page)
            .collect()
    }

    /// Every protection call seen so far.
    pub fn calls(&self) -> Vec<ProtectCall> {
        self.state.lock().calls.clone()
    }

    /// Number of protection calls seen so far.
    pub fn call_count(&self) -> usize {
        self.state.lock().calls.len()
    }

    /// Make protection changes on `page` fail until [`Self::heal`] is called.
    pub fn fail_on(&self, page: usize) {
        self.state.lock().failing.insert(page);
    }

    /// Let protection changes on `page` succeed again.
    pub fn heal(&self, page: usize) {
        self.state.lock().failing.remove(&page);
    }

    /// Simulate the OS clearing the guard as a side effect of a guard fault.
    pub fn trip(&self, page: usize) {
        self.state.lock().guarded.insert(page, false);
    }
}

impl PageOps for MockPlatform {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn set_guard(&self, page: usize, len: usize, guarded: bool) -> AxResult {
        let mut state = self.state.lock();
        if state.failing.contains(&page) {
            return axerrno::ax_err!(PermissionDenied, "mock protection change refused");
        }
        state.calls.push(ProtectCall { page, len, guarded });
        state.guarded.insert(page, guarded);
        Ok(())
    }

    fn thread_id(&self) -> u64 {
        THREAD_ID.with(|id| {
            if id.get() == 0 {
                id.set(NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed));
            }
            id.get()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_records_calls() {
        let mock = MockPlatform::new();
        mock.set_guard(0x1000, MOCK_PAGE_SIZE, true).unwrap();
        assert!(mock.is_guarded(0x1000));
        assert_eq!(mock.guarded_pages(), [0x1000]);

        mock.set_guard(0x1000, MOCK_PAGE_SIZE, false).unwrap();
        assert!(!mock.is_guarded(0x1000));
        assert_eq!(mock.call_count(), 2);
    }

    #[test]
    fn test_mock_failure_injection() {
        let mock = MockPlatform::new();
        mock.fail_on(0x2000);
        assert!(mock.set_guard(0x2000, MOCK_PAGE_SIZE, true).is_err());
        assert!(!mock.is_guarded(0x2000));
        assert_eq!(mock.call_count(), 0);

        mock.heal(0x2000);
        assert!(mock.set_guard(0x2000, MOCK_PAGE_SIZE, true).is_ok());
    }

    #[test]
    fn test_mock_thread_ids_differ() {
        let mock = MockPlatform::new();
        let here = mock.thread_id();
        assert_eq!(here, mock.thread_id());

        let there = std::thread::spawn(|| MockPlatform::new().thread_id())
            .join()
            .unwrap();
        assert_ne!(here, there);
    }
}
