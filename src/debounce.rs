//! A small trailing-edge debounce primitive.
//!
//! [`Debouncer::trigger`] (re)arms a timer; the action runs once the timer
//! survives a full quiet window. [`Debouncer::flush`] runs a pending action
//! immediately and [`Debouncer::cancel`] discards it.
//!
//! The action reads whatever state is current when it fires, so N triggers
//! inside one window produce exactly one call that observes the state as of
//! the last trigger.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::lock;

type Action = Box<dyn Fn() + Send + Sync>;

/// Coalesces bursts of triggers into a single deferred action.
///
/// Must be used from within a Tokio runtime: [`trigger`](Self::trigger)
/// spawns the timer task.
pub struct Debouncer {
    inner: Arc<Inner>,
}

struct Inner {
    window: Duration,
    action: Action,
    state: Mutex<TimerState>,
}

#[derive(Default)]
struct TimerState {
    /// Bumped on every trigger, flush and cancel so a superseded timer can tell it lost.
    generation: u64,
    armed: bool,
    timer: Option<JoinHandle<()>>,
}

impl Debouncer {
    pub fn new(window: Duration, action: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            inner: Arc::new(Inner {
                window,
                action: Box::new(action),
                state: Mutex::new(TimerState::default()),
            }),
        }
    }

    /// Arm (or re-arm) the timer.
    pub fn trigger(&self) {
        let mut state = lock(&self.inner.state);
        state.generation = state.generation.wrapping_add(1);
        state.armed = true;
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        let generation = state.generation;
        let inner = Arc::clone(&self.inner);
        state.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(inner.window).await;
            inner.fire(generation);
        }));
    }

    /// Run the pending action now, if any. Returns `true` if it ran.
    pub fn flush(&self) -> bool {
        if self.disarm() {
            (self.inner.action)();
            true
        } else {
            false
        }
    }

    /// Discard the pending action, if any. Returns `true` if one was pending.
    pub fn cancel(&self) -> bool {
        self.disarm()
    }

    pub fn is_pending(&self) -> bool {
        lock(&self.inner.state).armed
    }

    pub fn window(&self) -> Duration {
        self.inner.window
    }

    fn disarm(&self) -> bool {
        let mut state = lock(&self.inner.state);
        let was_armed = state.armed;
        state.armed = false;
        state.generation = state.generation.wrapping_add(1);
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        was_armed
    }
}

impl Inner {
    fn fire(&self, generation: u64) {
        {
            let mut state = lock(&self.state);
            if !state.armed || state.generation != generation {
                return;
            }
            state.armed = false;
            state.timer = None;
        }
        (self.action)();
    }
}

impl Drop for Debouncer {
    fn drop(&mut self) {
        if let Some(timer) = lock(&self.inner.state).timer.take() {
            timer.abort();
        }
    }
}

impl fmt::Debug for Debouncer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Debouncer")
            .field("window", &self.inner.window)
            .field("pending", &self.is_pending())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const WINDOW: Duration = Duration::from_millis(50);

    fn counting() -> (Debouncer, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        let debouncer = Debouncer::new(WINDOW, move || {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        (debouncer, count)
    }

    #[tokio::test(start_paused = true)]
    async fn burst_collapses_into_one_call() {
        let (debouncer, count) = counting();
        for _ in 0..10 {
            debouncer.trigger();
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(count.load(Ordering::SeqCst), 0);

        tokio::time::sleep(WINDOW * 2).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!debouncer.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn action_observes_state_as_of_last_trigger() {
        let value = Arc::new(AtomicUsize::new(0));
        let observed = Arc::new(Mutex::new(Vec::new()));
        let (v, o) = (Arc::clone(&value), Arc::clone(&observed));
        let debouncer = Debouncer::new(WINDOW, move || {
            o.lock().unwrap().push(v.load(Ordering::SeqCst));
        });

        for n in 1..=5 {
            value.store(n, Ordering::SeqCst);
            debouncer.trigger();
        }
        tokio::time::sleep(WINDOW * 2).await;
        assert_eq!(*observed.lock().unwrap(), vec![5]);
    }

    #[tokio::test(start_paused = true)]
    async fn flush_runs_immediately_and_only_once() {
        let (debouncer, count) = counting();
        debouncer.trigger();
        assert!(debouncer.flush());
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // The aborted timer must not fire a second time.
        tokio::time::sleep(WINDOW * 2).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!debouncer.flush());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_discards_pending_action() {
        let (debouncer, count) = counting();
        debouncer.trigger();
        assert!(debouncer.cancel());
        tokio::time::sleep(WINDOW * 2).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(!debouncer.cancel());
    }

    #[tokio::test(start_paused = true)]
    async fn separate_windows_fire_separately() {
        let (debouncer, count) = counting();
        debouncer.trigger();
        tokio::time::sleep(WINDOW * 2).await;
        debouncer.trigger();
        tokio::time::sleep(WINDOW * 2).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}
