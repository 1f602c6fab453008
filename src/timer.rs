use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::cancel::CancellationToken;
use crate::util::lock_unpoisoned;

type ScheduledCallback = Box<dyn FnOnce() + Send>;

const ARMED: u8 = 0;
const CANCELLED: u8 = 1;
const EXPIRED: u8 = 2;

/// Single background thread that runs timeout callbacks for one client.
///
/// The worker is spawned on first use and exits when the scheduler is
/// dropped.
pub(crate) struct TimeoutScheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    thread_name: String,
    state: Mutex<SchedulerState>,
    condvar: Condvar,
}

#[derive(Default)]
struct SchedulerState {
    tasks: BTreeMap<(Instant, u64), ScheduledCallback>,
    next_id: u64,
    worker_running: bool,
    shutdown: bool,
}

impl TimeoutScheduler {
    pub(crate) fn new(thread_name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                thread_name: thread_name.into(),
                state: Mutex::new(SchedulerState::default()),
                condvar: Condvar::new(),
            }),
        }
    }

    fn schedule(&self, delay: Duration, callback: ScheduledCallback) -> ScheduledTask {
        let mut state = lock_unpoisoned(&self.inner.state);
        let key = (Instant::now() + delay, state.next_id);
        state.next_id = state.next_id.wrapping_add(1);
        state.tasks.insert(key, callback);
        if !state.worker_running {
            let worker_inner = Arc::clone(&self.inner);
            let spawned = thread::Builder::new()
                .name(self.inner.thread_name.clone())
                .spawn(move || run_worker(worker_inner));
            match spawned {
                Ok(_) => state.worker_running = true,
                Err(error) => warn!(error = %error, "failed to spawn timeout scheduler thread"),
            }
        }
        drop(state);
        self.inner.condvar.notify_all();
        ScheduledTask {
            key,
            scheduler: Arc::downgrade(&self.inner),
        }
    }
}

impl Drop for TimeoutScheduler {
    fn drop(&mut self) {
        let mut state = lock_unpoisoned(&self.inner.state);
        state.shutdown = true;
        state.tasks.clear();
        drop(state);
        self.inner.condvar.notify_all();
    }
}

fn run_worker(inner: Arc<SchedulerInner>) {
    let mut state = lock_unpoisoned(&inner.state);
    loop {
        if state.shutdown {
            state.worker_running = false;
            return;
        }
        let now = Instant::now();
        let next_key = state.tasks.keys().next().copied();
        state = match next_key {
            None => match inner.condvar.wait(state) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            },
            Some(key) if key.0 <= now => {
                let callback = state.tasks.remove(&key);
                drop(state);
                if let Some(callback) = callback {
                    callback();
                }
                lock_unpoisoned(&inner.state)
            }
            Some(key) => match inner.condvar.wait_timeout(state, key.0 - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            },
        };
    }
}

struct ScheduledTask {
    key: (Instant, u64),
    scheduler: Weak<SchedulerInner>,
}

impl ScheduledTask {
    fn cancel(&self) {
        if let Some(scheduler) = self.scheduler.upgrade() {
            lock_unpoisoned(&scheduler.state).tasks.remove(&self.key);
        }
    }
}

/// One armed timeout. Dropping the task cancels it.
pub(crate) struct TimerTask {
    state: Arc<AtomicU8>,
    scheduled: Option<ScheduledTask>,
    timeout: Duration,
    deadline: Option<Instant>,
}

impl TimerTask {
    pub(crate) fn disabled() -> Self {
        Self {
            state: Arc::new(AtomicU8::new(CANCELLED)),
            scheduled: None,
            timeout: Duration::ZERO,
            deadline: None,
        }
    }

    fn arm(
        scheduler: &TimeoutScheduler,
        timeout: Option<Duration>,
        token: &CancellationToken,
        label: &'static str,
    ) -> Self {
        let Some(timeout) = timeout.filter(|timeout| !timeout.is_zero()) else {
            return Self::disabled();
        };
        let state = Arc::new(AtomicU8::new(ARMED));
        let state_for_callback = Arc::clone(&state);
        let token = token.clone();
        let scheduled = scheduler.schedule(
            timeout,
            Box::new(move || {
                if state_for_callback
                    .compare_exchange(ARMED, EXPIRED, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    debug!(timer = label, timeout_ms = timeout.as_millis() as u64, "timer expired");
                    token.cancel();
                }
            }),
        );
        Self {
            state,
            scheduled: Some(scheduled),
            timeout,
            deadline: Some(Instant::now() + timeout),
        }
    }

    pub(crate) fn is_enabled(&self) -> bool {
        self.deadline.is_some()
    }

    pub(crate) fn timeout(&self) -> Duration {
        self.timeout
    }

    pub(crate) fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// `true` once the deadline has passed without the task being cancelled
    /// first, whether or not the scheduler callback has run yet.
    pub(crate) fn has_timeout_expired(&self) -> bool {
        match self.state.load(Ordering::Acquire) {
            EXPIRED => true,
            ARMED => self.deadline_passed(),
            _ => false,
        }
    }

    /// Idempotent. A task whose deadline already passed settles as expired.
    pub(crate) fn cancel_task(&self) {
        if let Some(scheduled) = &self.scheduled {
            scheduled.cancel();
        }
        let settled = if self.deadline_passed() {
            EXPIRED
        } else {
            CANCELLED
        };
        let _ = self
            .state
            .compare_exchange(ARMED, settled, Ordering::AcqRel, Ordering::Acquire);
    }

    fn deadline_passed(&self) -> bool {
        self.deadline
            .is_some_and(|deadline| Instant::now() >= deadline)
    }
}

impl Drop for TimerTask {
    fn drop(&mut self) {
        self.cancel_task();
    }
}

/// Bounds a whole logical call, across every retry.
pub(crate) struct ClientExecutionTimer {
    scheduler: Arc<TimeoutScheduler>,
}

impl ClientExecutionTimer {
    pub(crate) fn new(scheduler: Arc<TimeoutScheduler>) -> Self {
        Self { scheduler }
    }

    /// On expiry the call token is cancelled, interrupting backoff sleeps,
    /// rate-limiter waits and the in-flight attempt.
    pub(crate) fn start(
        &self,
        timeout: Option<Duration>,
        call_token: &CancellationToken,
    ) -> TimerTask {
        TimerTask::arm(
            &self.scheduler,
            timeout,
            call_token,
            "client_execution",
        )
    }
}

/// Bounds a single HTTP round trip.
pub(crate) struct RequestTimer {
    scheduler: Arc<TimeoutScheduler>,
}

impl RequestTimer {
    pub(crate) fn new(scheduler: Arc<TimeoutScheduler>) -> Self {
        Self { scheduler }
    }

    pub(crate) fn start(
        &self,
        timeout: Option<Duration>,
        attempt_token: &CancellationToken,
    ) -> TimerTask {
        TimerTask::arm(&self.scheduler, timeout, attempt_token, "request")
    }
}
