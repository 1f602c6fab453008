use std::sync::atomic::{AtomicI64, Ordering};

/// Cost of a retry caused by anything other than a timeout.
pub const THROTTLED_RETRY_COST: i64 = 5;
/// Cost of a retry caused by a connect, socket or request timeout.
pub const TIMEOUT_RETRY_COST: i64 = 10;
pub const DEFAULT_MAX_CONSECUTIVE_RETRIES_BEFORE_THROTTLING: usize = 100;

const UNBOUNDED: i64 = -1;

/// Shared pool of retry capacity.
///
/// Every concurrent call on a client draws from the same pool, so all state
/// changes are single compare-and-swap operations. A negative maximum turns
/// the pool off: every acquire succeeds and nothing is tracked.
#[derive(Debug)]
pub struct CapacityManager {
    max_capacity: i64,
    available: AtomicI64,
}

impl CapacityManager {
    pub fn new(max_capacity: i64) -> Self {
        let max_capacity = max_capacity.max(UNBOUNDED);
        Self {
            max_capacity,
            available: AtomicI64::new(max_capacity),
        }
    }

    pub fn unbounded() -> Self {
        Self::new(UNBOUNDED)
    }

    /// Pool sized for `max_consecutive_retries` non-timeout retries.
    pub fn for_consecutive_retries(max_consecutive_retries: usize) -> Self {
        let retries = i64::try_from(max_consecutive_retries).unwrap_or(i64::MAX);
        Self::new(THROTTLED_RETRY_COST.saturating_mul(retries))
    }

    pub fn is_bounded(&self) -> bool {
        self.max_capacity >= 0
    }

    pub fn acquire(&self) -> bool {
        self.acquire_n(1)
    }

    pub fn acquire_n(&self, capacity: i64) -> bool {
        if !self.is_bounded() || capacity <= 0 {
            return true;
        }
        self.available
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |available| {
                (available >= capacity).then_some(available - capacity)
            })
            .is_ok()
    }

    pub fn release(&self) {
        self.release_n(1);
    }

    pub fn release_n(&self, capacity: i64) {
        if !self.is_bounded() || capacity <= 0 {
            return;
        }
        let max_capacity = self.max_capacity;
        let _ = self
            .available
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |available| {
                Some(available.saturating_add(capacity).min(max_capacity))
            });
    }

    /// Remaining capacity, or `-1` when the pool is unbounded.
    pub fn available_capacity(&self) -> i64 {
        if !self.is_bounded() {
            return UNBOUNDED;
        }
        self.available.load(Ordering::Acquire)
    }

    pub fn consumed_capacity(&self) -> i64 {
        if !self.is_bounded() {
            return 0;
        }
        self.max_capacity - self.available.load(Ordering::Acquire)
    }

    pub fn max_capacity(&self) -> i64 {
        self.max_capacity
    }
}
