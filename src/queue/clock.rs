//! Time source for ready timestamps and lease expiry.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Epoch-millisecond clock. `Manual` lets tests move time explicitly.
#[derive(Debug, Clone, Default)]
pub enum Clock {
    #[default]
    System,
    Manual(Arc<AtomicU64>),
}

impl Clock {
    /// A manual clock starting at `start_ms`.
    pub fn manual(start_ms: u64) -> Self {
        Clock::Manual(Arc::new(AtomicU64::new(start_ms)))
    }

    pub fn now_ms(&self) -> u64 {
        match self {
            Clock::System => u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0),
            Clock::Manual(now) => now.load(Ordering::SeqCst),
        }
    }

    /// Move a manual clock forward. No-op on the system clock.
    pub fn advance(&self, ms: u64) {
        if let Clock::Manual(now) = self {
            now.fetch_add(ms, Ordering::SeqCst);
        }
    }
}
