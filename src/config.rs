//! Runtime configuration for the fault engine.

/// Options applied when the fault handler is installed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuardConfig {
    /// Re-apply the guard after a watch-triggered single step.
    ///
    /// Off by default: a page that only hosts watches stays unguarded after its
    /// first access until [`rearm`](crate::rearm) is called or the entries change.
    /// Pages hosting a hook are always re-guarded.
    pub rearm_watches: bool,
    /// Install the handler at the front of the process handler chain.
    pub first_handler: bool,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            rearm_watches: false,
            first_handler: true,
        }
    }
}

impl GuardConfig {
    /// Enable or disable watch re-arming.
    pub fn with_rearm_watches(mut self, enabled: bool) -> Self {
        self.rearm_watches = enabled;
        self
    }

    /// Choose whether the handler goes first in the handler chain.
    pub fn with_first_handler(mut self, first: bool) -> Self {
        self.first_handler = first;
        self
    }
}
