//! Deferred-event seam for the CGI kill timers.
//!
//! The readiness loop owns the timer wheel.  The engine only schedules
//! events through this trait and exposes the handlers the loop invokes when
//! they fire (see [`crate::cgi::on_timer`]).

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerEvent {
    /// Ask a long-running CGI child to stop (SIGINT).
    CgiSoftKill(libc::pid_t),
    /// The child ignored the soft kill; force it (SIGKILL).
    CgiHardKill(libc::pid_t),
}

pub trait TimerSet {
    fn schedule(&mut self, delay: Duration, event: TimerEvent);
}

/// Collects scheduled events instead of arming anything; for embedders that
/// poll, and for tests.
#[derive(Debug, Default)]
pub struct RecordingTimers {
    pub scheduled: Vec<(Duration, TimerEvent)>,
}

impl TimerSet for RecordingTimers {
    fn schedule(&mut self, delay: Duration, event: TimerEvent) {
        self.scheduled.push((delay, event));
    }
}
