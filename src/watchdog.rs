//! Watchdog timer
//!
//! A background thread that waits on a condition with a configurable timeout
//! and invokes a handler when the timeout expires while the watchdog is armed.
//! Used by the input stage to abort a blocked receive operation.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::debug;

/// Invoked from the watchdog thread, outside the watchdog mutex.
pub trait WatchdogHandler: Send + Sync + 'static {
    fn on_timeout(&self, id: u64);
}

impl<F: Fn(u64) + Send + Sync + 'static> WatchdogHandler for F {
    fn on_timeout(&self, id: u64) {
        self(id)
    }
}

struct State {
    timeout: Duration,
    active: bool,
    terminate: bool,
}

struct Inner {
    state: Mutex<State>,
    cond: Condvar,
    handler: Box<dyn WatchdogHandler>,
    id: u64,
}

/// A watchdog with its background thread.
///
/// `restart` re-arms the timeout, `suspend` disarms it. A zero timeout means
/// "never expires" while armed. The thread is joined on drop.
pub struct Watchdog {
    inner: Arc<Inner>,
    thread: Option<JoinHandle<()>>,
}

impl Watchdog {
    pub fn new(handler: impl WatchdogHandler, timeout: Duration, id: u64) -> Self {
        let inner = Arc::new(Inner {
            state: Mutex::new(State {
                timeout,
                active: false,
                terminate: false,
            }),
            cond: Condvar::new(),
            handler: Box::new(handler),
            id,
        });
        let thread_inner = inner.clone();
        let thread = thread::Builder::new()
            .name(format!("watchdog-{id}"))
            .spawn(move || watchdog_thread(thread_inner))
            .expect("failed to spawn watchdog thread");
        Self {
            inner,
            thread: Some(thread),
        }
    }

    /// Re-arm the watchdog; any previous countdown is canceled.
    pub fn restart(&self) {
        let mut state = self.inner.state.lock();
        state.active = true;
        self.inner.cond.notify_all();
    }

    /// Disarm the watchdog; any previous countdown is canceled.
    pub fn suspend(&self) {
        let mut state = self.inner.state.lock();
        state.active = false;
        self.inner.cond.notify_all();
    }

    /// Change the timeout, optionally re-arming atomically.
    pub fn set_timeout(&self, timeout: Duration, auto_start: bool) {
        let mut state = self.inner.state.lock();
        state.timeout = timeout;
        state.active = auto_start;
        self.inner.cond.notify_all();
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        {
            let mut state = self.inner.state.lock();
            state.terminate = true;
            self.inner.cond.notify_all();
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn watchdog_thread(inner: Arc<Inner>) {
    debug!(id = inner.id, "watchdog thread started");
    loop {
        let expired = {
            let mut state = inner.state.lock();
            if state.terminate {
                break;
            }
            if !state.active || state.timeout.is_zero() {
                // Inactive, or active with an infinite timeout: sleep until
                // the configuration changes.
                inner.cond.wait(&mut state);
                false
            } else {
                let timeout = state.timeout;
                inner.cond.wait_for(&mut state, timeout).timed_out() && state.active
            }
        };
        // Call the handler outside the mutex.
        let state = inner.state.lock();
        let terminate = state.terminate;
        drop(state);
        if terminate {
            break;
        }
        if expired {
            debug!(id = inner.id, "watchdog expired");
            inner.handler.on_timeout(inner.id);
        }
    }
    debug!(id = inner.id, "watchdog thread completed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_fires_on_timeout() {
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        let dog = Watchdog::new(
            move |_id| {
                fired2.fetch_add(1, Ordering::SeqCst);
            },
            Duration::from_millis(30),
            7,
        );
        dog.restart();
        thread::sleep(Duration::from_millis(150));
        assert!(fired.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn test_suspend_prevents_firing() {
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        let dog = Watchdog::new(
            move |_id| {
                fired2.fetch_add(1, Ordering::SeqCst);
            },
            Duration::from_millis(30),
            8,
        );
        dog.restart();
        dog.suspend();
        thread::sleep(Duration::from_millis(120));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_zero_timeout_never_expires() {
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        let dog = Watchdog::new(
            move |_id| {
                fired2.fetch_add(1, Ordering::SeqCst);
            },
            Duration::ZERO,
            9,
        );
        dog.restart();
        thread::sleep(Duration::from_millis(80));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
