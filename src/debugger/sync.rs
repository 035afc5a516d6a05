use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Event-like wake up primitive.
///
/// Manual-reset signals stay set until [`Signal::reset`], auto-reset ones are consumed by the
/// first waiter that observes them.
pub struct Signal {
    state: Mutex<bool>,
    cv: Condvar,
    manual_reset: bool,
}

impl Signal {
    pub fn manual() -> Self {
        Self {
            state: Mutex::new(false),
            cv: Condvar::new(),
            manual_reset: true,
        }
    }

    pub fn auto() -> Self {
        Self {
            manual_reset: false,
            ..Self::manual()
        }
    }

    pub fn set(&self) {
        let mut state = self.state.lock();
        *state = true;
        if self.manual_reset {
            self.cv.notify_all();
        } else {
            self.cv.notify_one();
        }
    }

    pub fn reset(&self) {
        *self.state.lock() = false;
    }

    pub fn is_set(&self) -> bool {
        *self.state.lock()
    }

    /// Block until the signal is set or `timeout` expires, `None` timeout means forever.
    /// Returns `true` if signal was observed.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock();
        while !*state {
            match deadline {
                None => self.cv.wait(&mut state),
                Some(deadline) => {
                    if self.cv.wait_until(&mut state, deadline).timed_out() && !*state {
                        return false;
                    }
                }
            }
        }
        if !self.manual_reset {
            *state = false;
        }
        true
    }
}
