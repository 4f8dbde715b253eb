//! Diagnostic trace callbacks
//!
//! A session forwards protocol diagnostics to an optional handler filtered
//! by a category mask. The slot is shared with the native layer so that
//! clearing it detaches the handler before the native handle is released.

use std::fmt;
use std::ops::BitOr;
use std::sync::{Arc, Mutex};

/// Bit mask of trace categories
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TraceMask(u8);

impl TraceMask {
    pub const NONE: Self = Self(0);
    /// Version exchange and packet I/O
    pub const TRANSPORT: Self = Self(0b0_0001);
    /// Key exchange and host key checks
    pub const KEX: Self = Self(0b0_0010);
    /// User authentication
    pub const AUTH: Self = Self(0b0_0100);
    /// Connection teardown
    pub const CONNECTION: Self = Self(0b0_1000);
    /// Errors reported by the native layer
    pub const ERROR: Self = Self(0b1_0000);
    pub const ALL: Self = Self(0b1_1111);

    pub fn bits(self) -> u8 {
        self.0
    }

    /// Whether any category of `other` is enabled in this mask
    pub fn intersects(self, other: TraceMask) -> bool {
        self.0 & other.0 != 0
    }
}

impl BitOr for TraceMask {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Debug for TraceMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TraceMask({:#07b})", self.0)
    }
}

/// Receives trace messages as `(category, message)`
pub type TraceHandler = Arc<dyn Fn(TraceMask, &str) + Send + Sync>;

/// Shared slot holding the installed trace handler
#[derive(Clone, Default)]
pub struct TraceSlot {
    inner: Arc<Mutex<Option<(TraceMask, TraceHandler)>>>,
}

impl TraceSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a handler, replacing any previous one
    pub fn set(&self, mask: TraceMask, handler: TraceHandler) {
        if let Ok(mut slot) = self.inner.lock() {
            *slot = Some((mask, handler));
        }
    }

    /// Detach the handler; later messages are only logged
    pub fn clear(&self) {
        if let Ok(mut slot) = self.inner.lock() {
            *slot = None;
        }
    }

    pub fn is_set(&self) -> bool {
        self.inner.lock().map(|slot| slot.is_some()).unwrap_or(false)
    }

    /// Deliver a message to the handler if its category is enabled
    pub fn emit(&self, category: TraceMask, message: &str) {
        tracing::trace!("[{:?}] {}", category, message);

        let handler = match self.inner.lock() {
            Ok(slot) => match slot.as_ref() {
                Some((mask, handler)) if mask.intersects(category) => Some(Arc::clone(handler)),
                _ => None,
            },
            Err(_) => None,
        };

        // Called outside the lock so a handler may clear the slot.
        if let Some(handler) = handler {
            handler(category, message);
        }
    }
}

impl fmt::Debug for TraceSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TraceSlot").field("set", &self.is_set()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recording() -> (TraceHandler, Arc<Mutex<Vec<String>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handler: TraceHandler = Arc::new(move |_: TraceMask, message: &str| {
            sink.lock().unwrap().push(message.to_string());
        });
        (handler, seen)
    }

    #[test]
    fn test_mask_filters_categories() {
        let slot = TraceSlot::new();
        let (handler, seen) = recording();
        slot.set(TraceMask::KEX | TraceMask::ERROR, handler);

        slot.emit(TraceMask::KEX, "kex");
        slot.emit(TraceMask::AUTH, "auth");
        slot.emit(TraceMask::ERROR, "error");

        assert_eq!(*seen.lock().unwrap(), vec!["kex", "error"]);
    }

    #[test]
    fn test_clear_detaches_handler() {
        let slot = TraceSlot::new();
        let (handler, seen) = recording();
        slot.set(TraceMask::ALL, handler);
        let shared = slot.clone();

        shared.emit(TraceMask::TRANSPORT, "before");
        slot.clear();
        shared.emit(TraceMask::TRANSPORT, "after");

        assert!(!shared.is_set());
        assert_eq!(*seen.lock().unwrap(), vec!["before"]);
    }
}
