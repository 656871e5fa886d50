//! Single-slot event flag.
//!
//! A binary semaphore for worker wake-ups: `set` from any thread, `wait`
//! consumes the slot. Setting an already-set flag is a no-op, so producers
//! can signal freely without queueing wake-ups.

use std::sync::{Condvar, Mutex};
use std::time::Duration;

#[derive(Debug, Default)]
pub struct EventFlag {
    state: Mutex<bool>,
    cvar: Condvar,
}

impl EventFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        let mut set = self.state.lock().unwrap();
        *set = true;
        self.cvar.notify_one();
    }

    /// Block until set, then consume
    pub fn wait(&self) {
        let mut set = self.state.lock().unwrap();
        while !*set {
            set = self.cvar.wait(set).unwrap();
        }
        *set = false;
    }

    /// Block until set or `timeout` elapses; returns true if the flag was set
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut set = self.state.lock().unwrap();
        if !*set {
            let (guard, _result) = self.cvar.wait_timeout(set, timeout).unwrap();
            set = guard;
        }
        let was_set = *set;
        *set = false;
        was_set
    }
}
