//! Collapse bursts of compositor events into one settle signal.
//!
//! The debouncer only tracks a deadline; the event loop sleeps until it and
//! then calls [`Debouncer::fire`]. Every event pushes the deadline out, so a
//! burst produces exactly one settle once the window passes quietly.

use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug)]
pub struct Debouncer {
    window: Duration,
    deadline: Option<Instant>,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            deadline: None,
        }
    }

    /// Record an event, restarting the quiet window.
    pub fn poke(&mut self) {
        self.deadline = Some(Instant::now() + self.window);
    }

    /// When the pending settle is due, if one is pending.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Consume the pending settle if its window has passed.
    pub fn fire(&mut self) -> bool {
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }
}
