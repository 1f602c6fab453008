use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::{Duration, Instant};

use crate::util::lock_unpoisoned;

type AbortHook = Box<dyn FnOnce() + Send>;

/// Cooperative cancellation shared between a call, its attempts and the
/// timers that bound them.
///
/// Cancelling a token cancels every child created from it, runs the abort
/// hooks registered through [`CancellationToken::on_cancel`] and wakes any
/// thread blocked in [`CancellationToken::sleep`]. A transport that can close
/// its connection from another thread registers a hook to do so; one that
/// cannot only observes the token between reads.
#[derive(Clone, Default)]
pub struct CancellationToken {
    inner: Arc<TokenInner>,
}

#[derive(Default)]
struct TokenInner {
    cancelled: AtomicBool,
    state: Mutex<TokenState>,
    condvar: Condvar,
}

#[derive(Default)]
struct TokenState {
    hooks: Vec<AbortHook>,
    children: Vec<Weak<TokenInner>>,
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    pub fn cancel(&self) {
        let (hooks, children) = {
            let mut state = lock_unpoisoned(&self.inner.state);
            if self.inner.cancelled.swap(true, Ordering::AcqRel) {
                return;
            }
            (
                std::mem::take(&mut state.hooks),
                std::mem::take(&mut state.children),
            )
        };
        self.inner.condvar.notify_all();

        for hook in hooks {
            hook();
        }
        for child in children.iter().filter_map(Weak::upgrade) {
            CancellationToken { inner: child }.cancel();
        }
    }

    /// A token that is cancelled whenever `self` is, but can also be
    /// cancelled on its own.
    pub fn child(&self) -> Self {
        let child = Self::new();
        {
            let mut state = lock_unpoisoned(&self.inner.state);
            if !self.is_cancelled() {
                state.children.retain(|existing| existing.strong_count() > 0);
                state.children.push(Arc::downgrade(&child.inner));
                return child;
            }
        }
        child.cancel();
        child
    }

    /// Runs `hook` once when the token is cancelled, immediately if it
    /// already is.
    pub fn on_cancel(&self, hook: impl FnOnce() + Send + 'static) {
        {
            let mut state = lock_unpoisoned(&self.inner.state);
            if !self.is_cancelled() {
                state.hooks.push(Box::new(hook));
                return;
            }
        }
        hook();
    }

    /// Blocks for `duration`; returns `false` as soon as the token is
    /// cancelled.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let mut state = lock_unpoisoned(&self.inner.state);
        loop {
            if self.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            state = match self.inner.condvar.wait_timeout(state, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::{Duration, Instant};

    use super::CancellationToken;

    #[test]
    fn cancelling_parent_cancels_children_and_runs_hooks_once() {
        let parent = CancellationToken::new();
        let child = parent.child();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_in_hook = Arc::clone(&fired);
        child.on_cancel(move || {
            fired_in_hook.fetch_add(1, Ordering::SeqCst);
        });

        parent.cancel();
        parent.cancel();
        child.cancel();

        assert!(child.is_cancelled());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancelling_child_leaves_parent_running() {
        let parent = CancellationToken::new();
        let child = parent.child();
        child.cancel();
        assert!(!parent.is_cancelled());
    }

    #[test]
    fn child_of_cancelled_token_starts_cancelled() {
        let parent = CancellationToken::new();
        parent.cancel();
        assert!(parent.child().is_cancelled());
    }

    #[test]
    fn sleep_wakes_promptly_on_cancel() {
        let token = CancellationToken::new();
        let canceller = token.clone();
        let started = Instant::now();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            canceller.cancel();
        });

        assert!(!token.sleep(Duration::from_secs(5)));
        assert!(started.elapsed() < Duration::from_secs(2));
        handle.join().expect("canceller thread should not panic");
    }

    #[test]
    fn sleep_completes_when_not_cancelled() {
        let token = CancellationToken::new();
        assert!(token.sleep(Duration::from_millis(5)));
    }
}
