//! State shared between the decision loop and the control-socket listener.
//!
//! Only two kinds of data cross the thread boundary: single-value mode flags
//! (word-sized atomics) and the event history (append-only, snapshot-copied
//! for rendering). The model itself never leaves the main loop.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use chrono::Local;

/// One entry of the daemon's event history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    /// What the event is about: a port name, "pmd", "ncd" or "switch".
    pub subject: String,
    pub kind: &'static str,
    pub timestamp: String,
}

pub fn now_ts() -> String {
    Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Append-only event history.
#[derive(Debug, Default)]
pub struct EventLog {
    entries: Mutex<Vec<Event>>,
}

impl EventLog {
    pub fn append(&self, subject: &str, kind: &'static str) {
        self.append_at(subject, kind, now_ts());
    }

    pub fn append_at(&self, subject: &str, kind: &'static str, timestamp: String) {
        self.entries.lock().unwrap().push(Event {
            subject: subject.to_string(),
            kind,
            timestamp,
        });
    }

    pub fn snapshot(&self) -> Vec<Event> {
        self.entries.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Mode flags mutated by the listener, read by the main loop.
#[derive(Debug)]
pub struct RuntimeFlags {
    pub trace_mode: AtomicBool,
    pub rebal_mode: AtomicBool,
    pub rebal_quick: AtomicBool,
    /// Debug-level logging in the log file.
    pub verbose: AtomicBool,
    /// Set by the signal handler; every phase boundary checks it.
    pub shutdown: AtomicBool,
    /// Rebalances actually committed to the switch.
    pub rebal_count: AtomicU64,
}

impl Default for RuntimeFlags {
    fn default() -> Self {
        RuntimeFlags {
            trace_mode: AtomicBool::new(false),
            rebal_mode: AtomicBool::new(false),
            rebal_quick: AtomicBool::new(false),
            verbose: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            rebal_count: AtomicU64::new(0),
        }
    }
}

impl RuntimeFlags {
    pub fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }
}
