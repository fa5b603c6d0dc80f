//! A one-shot completion signal: fires exactly once, any number of
//! threads may wait on it.

use std::sync::{Condvar, Mutex};

pub struct VmLost {
    fired: Mutex<bool>,
    cv: Condvar,
}

impl Default for VmLost {
    fn default() -> Self {
        Self {
            fired: Mutex::new(false),
            cv: Condvar::new(),
        }
    }
}

impl VmLost {
    /// Fire the signal. Returns `true` if this call was the one that
    /// fired it, `false` if it had already fired — callers that need
    /// the "exactly once" teardown action should act only on `true`.
    pub fn fire(&self) -> bool {
        let mut fired = self.fired.lock().unwrap();
        if *fired {
            return false;
        }
        *fired = true;
        self.cv.notify_all();
        true
    }

    pub fn has_fired(&self) -> bool {
        *self.fired.lock().unwrap()
    }

    /// Block until [`Self::fire`] has been called by any thread.
    pub fn wait(&self) {
        let guard = self.fired.lock().unwrap();
        let _unused = self.cv.wait_while(guard, |fired| !*fired).unwrap();
    }
}
