use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::debug;

use crate::cancel::CancellationToken;
use crate::clock::{Clock, SystemClock};
use crate::util::{epoch_seconds, lock_unpoisoned};

const MIN_FILL_RATE: f64 = 0.5;
const MIN_CAPACITY: f64 = 1.0;
const SMOOTH: f64 = 0.8;
/// Multiplicative decrease applied to the send rate on a throttling response.
const BETA: f64 = 0.7;
/// How aggressively the rate grows back after a throttle.
const SCALE_CONSTANT: f64 = 0.4;

/// Cost of sending one attempt through the adaptive limiter.
pub const SEND_TOKEN_COST: f64 = 1.0;

/// Client-side send-rate limiter used in adaptive retry mode.
///
/// The bucket grants everything until the first throttling response is
/// observed; from then on the fill rate follows a CUBIC curve driven by
/// [`TokenBucket::update_client_sending_rate`].
pub struct TokenBucket {
    clock: Arc<dyn Clock>,
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    fill_rate: f64,
    max_capacity: f64,
    current_capacity: f64,
    last_timestamp: Option<f64>,
    enabled: bool,
    measured_tx_rate: f64,
    last_tx_rate_bucket: f64,
    request_count: u64,
    last_max_rate: f64,
    last_throttle_time: f64,
}

/// Point-in-time view of the limiter, for diagnostics and tests.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TokenBucketSnapshot {
    pub enabled: bool,
    pub fill_rate: f64,
    pub max_capacity: f64,
    pub current_capacity: f64,
    pub measured_tx_rate: f64,
}

impl std::fmt::Debug for TokenBucket {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("TokenBucket")
            .field("state", &self.snapshot())
            .finish()
    }
}

impl Default for TokenBucket {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenBucket {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        let now = epoch_seconds(clock.now_system());
        Self {
            clock,
            state: Mutex::new(BucketState {
                fill_rate: 0.0,
                max_capacity: 0.0,
                current_capacity: 0.0,
                last_timestamp: None,
                enabled: false,
                measured_tx_rate: 0.0,
                last_tx_rate_bucket: now.floor(),
                request_count: 0,
                last_max_rate: 0.0,
                last_throttle_time: now,
            }),
        }
    }

    /// Takes `amount` tokens.
    ///
    /// With `fast_fail` an underfilled bucket returns `false` without
    /// waiting. Otherwise the tokens are reserved and the caller sleeps until
    /// the refill covers them; `false` then means the wait was cancelled.
    pub fn acquire(
        &self,
        amount: f64,
        fast_fail: bool,
        cancellation: &CancellationToken,
    ) -> bool {
        let wait = {
            let mut state = lock_unpoisoned(&self.state);
            if !state.enabled {
                return true;
            }
            state.refill(self.now());

            let shortfall = amount - state.current_capacity;
            if shortfall > 0.0 && fast_fail {
                debug!(
                    amount,
                    current_capacity = state.current_capacity,
                    fill_rate = state.fill_rate,
                    "send token unavailable"
                );
                return false;
            }
            let wait = if shortfall > 0.0 && state.fill_rate > 0.0 {
                Duration::from_secs_f64(shortfall / state.fill_rate)
            } else {
                Duration::ZERO
            };
            state.current_capacity -= amount;
            wait
        };

        if wait.is_zero() {
            return true;
        }
        debug!(wait_ms = wait.as_millis() as u64, "rate limiter delaying request");
        cancellation.sleep(wait)
    }

    pub fn update_client_sending_rate(&self, is_throttled: bool) {
        let now = self.now();
        let mut state = lock_unpoisoned(&self.state);
        state.update_measured_rate(now);

        let calculated_rate = if is_throttled {
            let rate_to_use = if state.enabled {
                state.measured_tx_rate.min(state.fill_rate)
            } else {
                state.measured_tx_rate
            };
            state.last_max_rate = rate_to_use;
            state.last_throttle_time = now;
            if !state.enabled {
                debug!("client send-rate limiting enabled");
            }
            state.enabled = true;
            cubic_throttle(rate_to_use)
        } else {
            state.cubic_success(now)
        };

        let new_rate = calculated_rate.min(2.0 * state.measured_tx_rate);
        state.update_fill_rate(now, new_rate);
    }

    pub fn snapshot(&self) -> TokenBucketSnapshot {
        let state = lock_unpoisoned(&self.state);
        TokenBucketSnapshot {
            enabled: state.enabled,
            fill_rate: state.fill_rate,
            max_capacity: state.max_capacity,
            current_capacity: state.current_capacity,
            measured_tx_rate: state.measured_tx_rate,
        }
    }

    fn now(&self) -> f64 {
        epoch_seconds(self.clock.now_system())
    }
}

impl BucketState {
    fn refill(&mut self, now: f64) {
        if let Some(last_timestamp) = self.last_timestamp {
            let fill_amount = (now - last_timestamp).max(0.0) * self.fill_rate;
            self.current_capacity = (self.current_capacity + fill_amount).min(self.max_capacity);
        }
        self.last_timestamp = Some(now);
    }

    fn update_fill_rate(&mut self, now: f64, new_rate: f64) {
        self.refill(now);
        self.fill_rate = new_rate.max(MIN_FILL_RATE);
        self.max_capacity = new_rate.max(MIN_CAPACITY);
        self.current_capacity = self.current_capacity.min(self.max_capacity);
        debug!(
            fill_rate = self.fill_rate,
            max_capacity = self.max_capacity,
            current_capacity = self.current_capacity,
            measured_tx_rate = self.measured_tx_rate,
            "client send rate updated"
        );
    }

    fn update_measured_rate(&mut self, now: f64) {
        let time_bucket = (now * 2.0).floor() / 2.0;
        self.request_count += 1;
        if time_bucket > self.last_tx_rate_bucket {
            let current_rate =
                self.request_count as f64 / (time_bucket - self.last_tx_rate_bucket);
            self.measured_tx_rate = current_rate * SMOOTH + self.measured_tx_rate * (1.0 - SMOOTH);
            self.request_count = 0;
            self.last_tx_rate_bucket = time_bucket;
        }
    }

    fn time_window(&self) -> f64 {
        ((self.last_max_rate * (1.0 - BETA)) / SCALE_CONSTANT).cbrt()
    }

    fn cubic_success(&self, now: f64) -> f64 {
        let elapsed = now - self.last_throttle_time - self.time_window();
        SCALE_CONSTANT * elapsed.powi(3) + self.last_max_rate
    }
}

fn cubic_throttle(rate_to_use: f64) -> f64 {
    rate_to_use * BETA
}
