//! Fixed-capacity record tables used on the fault path.
//!
//! The dispatcher runs inside signal and exception handlers, so the records
//! it keeps per fault live in pre-allocated arrays rather than heap maps.

/// Number of single-step traps that can be pending at once.
pub const NUM_TRAP_SLOTS: usize = 64;

/// Number of call-through tokens kept at once.
pub const NUM_TOKEN_SLOTS: usize = 64;

/// Number of watch callbacks run for one access.
pub const MAX_FIRED: usize = 16;

/// Unordered table of at most `N` records.
///
/// Records are placed in the first free slot, so a table filled without
/// removals iterates in insertion order.
#[derive(Debug, Clone, Copy)]
pub struct Slots<T: Copy, const N: usize> {
    slots: [Option<T>; N],
    /// Next slot to overwrite when the table is full.
    cursor: usize,
}

impl<T: Copy, const N: usize> Default for Slots<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Copy, const N: usize> Slots<T, N> {
    pub fn new() -> Self {
        Self {
            slots: [None; N],
            cursor: 0,
        }
    }

    /// Store `value` in a free slot. Returns false if the table is full.
    pub fn insert(&mut self, value: T) -> bool {
        match self.slots.iter_mut().find(|s| s.is_none()) {
            Some(slot) => {
                *slot = Some(value);
                true
            }
            None => false,
        }
    }

    /// Store `value`, overwriting the oldest-placed record if the table is
    /// full. Returns the overwritten record.
    pub fn insert_evicting(&mut self, value: T) -> Option<T> {
        if self.insert(value) {
            return None;
        }
        if N == 0 {
            return Some(value);
        }
        let idx = self.cursor % N;
        self.cursor = (idx + 1) % N;
        self.slots[idx].replace(value)
    }

    /// Remove and return the first record matching `pred`.
    pub fn take(&mut self, pred: impl Fn(&T) -> bool) -> Option<T> {
        self.slots
            .iter_mut()
            .find(|s| s.as_ref().is_some_and(&pred))
            .and_then(Option::take)
    }

    /// Whether any record matches `pred`.
    pub fn any(&self, pred: impl Fn(&T) -> bool) -> bool {
        self.iter().any(|v| pred(v))
    }

    /// Keep only the records matching `pred`.
    pub fn retain(&mut self, pred: impl Fn(&T) -> bool) {
        for slot in self.slots.iter_mut() {
            if slot.as_ref().is_some_and(|v| !pred(v)) {
                *slot = None;
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.slots.iter().flatten()
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }

    pub fn is_full(&self) -> bool {
        self.slots.iter().all(Option::is_some)
    }

    pub fn clear(&mut self) {
        self.slots = [None; N];
        self.cursor = 0;
    }
}
