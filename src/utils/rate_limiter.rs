//! Coalesces bursts of activations into at most one action per window.
//!
//! The first [`RateLimiter::activate`] in a quiet window runs the action immediately. Further
//! activations inside the window collapse into a single trailing run when the window ends.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::trace;

type Action = dyn Fn() + Send + Sync + 'static;

struct LimiterState {
    last_invoked: Option<Instant>,
    pending: Option<JoinHandle<()>>,
}

pub struct RateLimiter {
    window: Duration,
    action: Arc<Action>,
    state: Arc<Mutex<LimiterState>>,
}

impl RateLimiter {
    /// Create a limiter allowing `max_rate` actions per second.
    ///
    /// Must be activated from within a Tokio runtime.
    pub fn new<F>(max_rate: f64, action: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        let window = if max_rate.is_finite() && max_rate > 0.0 {
            Duration::from_secs_f64(1.0 / max_rate)
        } else {
            Duration::ZERO
        };
        Self {
            window,
            action: Arc::new(action),
            state: Arc::new(Mutex::new(LimiterState {
                last_invoked: None,
                pending: None,
            })),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn activate(&self) {
        let mut state = lock(&self.state);
        if state.pending.is_some() {
            trace!("Activation folded into pending run");
            return;
        }

        let now = Instant::now();
        match state.last_invoked {
            Some(last) if now.duration_since(last) < self.window => {
                let fire_at = last + self.window;
                let action = self.action.clone();
                let shared = self.state.clone();
                state.pending = Some(tokio::spawn(async move {
                    tokio::time::sleep_until(fire_at).await;
                    {
                        let mut state = lock(&shared);
                        state.pending = None;
                        state.last_invoked = Some(Instant::now());
                    }
                    action();
                }));
            }
            _ => {
                state.last_invoked = Some(now);
                drop(state);
                (self.action)();
            }
        }
    }

    /// Discard a pending trailing run, if any
    pub fn cancel(&self) {
        if let Some(handle) = lock(&self.state).pending.take() {
            handle.abort();
        }
    }

    pub fn is_pending(&self) -> bool {
        lock(&self.state).pending.is_some()
    }
}

impl Drop for RateLimiter {
    fn drop(&mut self) {
        self.cancel();
    }
}

fn lock(state: &Mutex<LimiterState>) -> MutexGuard<'_, LimiterState> {
    // The state stays consistent even if an action panicked while a guard was held.
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
