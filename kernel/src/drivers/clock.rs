//! Clock source registration
//!
//! Timer drivers register a [`ClockSource`]; the highest-rated one
//! answers [`now_ns`]. Until one shows up, a coarse tick counter keeps
//! relative deadlines (sleep wakeups) moving forward.

#[cfg(feature = "alloc")]
extern crate alloc;

#[cfg(feature = "alloc")]
use alloc::sync::Arc;

use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

/// A monotonic time source.
pub trait ClockSource: Send + Sync {
    fn name(&self) -> &'static str;
    /// Higher wins when several sources are registered.
    fn rating(&self) -> u32;
    fn now_ns(&self) -> u64;
}

static SOURCE: Mutex<Option<Arc<dyn ClockSource>>> = Mutex::new(None);
static FALLBACK_NS: AtomicU64 = AtomicU64::new(0);

pub fn init() {
    log::debug!("clock: registration interface ready");
}

/// Offer a clock source; it becomes active if it outrates the current one.
pub fn register(source: Arc<dyn ClockSource>) {
    let mut active = SOURCE.lock();
    let replace = match active.as_ref() {
        Some(current) => source.rating() > current.rating(),
        None => true,
    };
    if replace {
        log::info!(
            "clock: \"{}\" (rating {}) is now the system clock",
            source.name(),
            source.rating()
        );
        *active = Some(source);
    }
}

/// Monotonic nanoseconds since boot, best source available.
pub fn now_ns() -> u64 {
    if let Some(source) = SOURCE.lock().as_ref() {
        return source.now_ns();
    }
    // No calibrated source yet: every query advances a coarse tick so
    // relative timeouts still expire.
    FALLBACK_NS.fetch_add(1_000, Ordering::Relaxed)
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    struct Fixed(&'static str, u32, u64);
    impl ClockSource for Fixed {
        fn name(&self) -> &'static str {
            self.0
        }
        fn rating(&self) -> u32 {
            self.1
        }
        fn now_ns(&self) -> u64 {
            self.2
        }
    }

    #[test]
    fn best_rated_source_wins() {
        register(Arc::new(Fixed("coarse", 10, 111)));
        register(Arc::new(Fixed("tsc", 100, 222)));
        register(Arc::new(Fixed("worse", 50, 333)));
        assert_eq!(now_ns(), 222);
    }
}
