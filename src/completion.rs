//! Render completion detection.
//!
//! The in-page exporter gives no completion signal, only filesystem side effects. Completion is
//! detected in two phases: the output file appearing (start detection), then the output directory
//! going quiet for a sustained window (quiescence).
//!
//! Both phases are pure state machines over caller-supplied instants; the `await_*` functions
//! drive them against the real clock and filesystem.

use std::{
    path::Path,
    sync::mpsc,
    thread,
    time::{Duration, Instant},
};

use notify::{EventKind, RecursiveMode, Watcher as _};
use tracing::{debug, info, warn};

use crate::foundation::error::{DriverError, DriverResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StartState {
    Waiting,
    Found,
    TimedOut,
}

/// Start detection: waits for the output file to exist.
#[derive(Clone, Copy, Debug)]
pub struct StartWatch {
    started_at: Instant,
    timeout: Duration,
}

impl StartWatch {
    pub fn new(started_at: Instant, timeout: Duration) -> Self {
        Self {
            started_at,
            timeout,
        }
    }

    /// A file that exists wins over an elapsed timeout at the same poll.
    pub fn poll(&self, now: Instant, exists: bool) -> StartState {
        if exists {
            StartState::Found
        } else if now.saturating_duration_since(self.started_at) >= self.timeout {
            StartState::TimedOut
        } else {
            StartState::Waiting
        }
    }

    pub fn remaining(&self, now: Instant) -> Duration {
        self.timeout
            .saturating_sub(now.saturating_duration_since(self.started_at))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatchState {
    Watching,
    Quiesced,
    TimedOut,
}

/// Quiescence detection: resolves once no change was recorded for longer than `stall_window`.
///
/// The phase start counts as the first change.
#[derive(Clone, Copy, Debug)]
pub struct QuiescenceWatch {
    started_at: Instant,
    last_change: Instant,
    stall_window: Duration,
    timeout: Duration,
    changes: u64,
}

impl QuiescenceWatch {
    pub fn new(started_at: Instant, stall_window: Duration, timeout: Duration) -> Self {
        Self {
            started_at,
            last_change: started_at,
            stall_window,
            timeout,
            changes: 0,
        }
    }

    pub fn record_change(&mut self, at: Instant) {
        if at > self.last_change {
            self.last_change = at;
        }
        self.changes += 1;
    }

    pub fn changes(&self) -> u64 {
        self.changes
    }

    pub fn last_change(&self) -> Instant {
        self.last_change
    }

    /// Instant after which the directory counts as quiet, absent further changes.
    pub fn deadline(&self) -> Instant {
        self.last_change + self.stall_window
    }

    /// Quiescence is checked before the overall timeout.
    pub fn poll(&self, now: Instant) -> WatchState {
        if now.saturating_duration_since(self.last_change) > self.stall_window {
            WatchState::Quiesced
        } else if now.saturating_duration_since(self.started_at) >= self.timeout {
            WatchState::TimedOut
        } else {
            WatchState::Watching
        }
    }
}

fn is_regular_file(path: &Path) -> bool {
    std::fs::symlink_metadata(path)
        .map(|m| m.is_file())
        .unwrap_or(false)
}

/// Poll every `interval` until `path` is a regular file (`true`) or `timeout` elapses (`false`).
///
/// Returns within `timeout + interval`.
pub fn await_file_exists(path: &Path, timeout: Duration, interval: Duration) -> bool {
    let watch = StartWatch::new(Instant::now(), timeout);
    loop {
        let now = Instant::now();
        match watch.poll(now, is_regular_file(path)) {
            StartState::Found => {
                debug!(path = %path.display(), "output file appeared");
                return true;
            }
            StartState::TimedOut => return false,
            StartState::Waiting => {
                let nap = interval.min(watch.remaining(now));
                thread::sleep(nap.max(Duration::from_millis(1)));
            }
        }
    }
}

/// Watch `dir` recursively until it stops changing for longer than `stall_window` (`true`)
/// or `timeout` elapses (`false`). The watcher is released on every return path.
pub fn await_quiescence(
    dir: &Path,
    stall_window: Duration,
    timeout: Duration,
    interval: Duration,
) -> DriverResult<bool> {
    let (tx, rx) = mpsc::channel::<notify::Result<notify::Event>>();
    let mut watcher = notify::recommended_watcher(tx)
        .map_err(|e| DriverError::watch(format!("failed to create watcher: {e}")))?;
    watcher
        .watch(dir, RecursiveMode::Recursive)
        .map_err(|e| DriverError::watch(format!("failed to watch '{}': {e}", dir.display())))?;

    let mut watch = QuiescenceWatch::new(Instant::now(), stall_window, timeout);
    loop {
        match rx.recv_timeout(interval) {
            Ok(Ok(event)) => {
                if !matches!(event.kind, EventKind::Access(_)) {
                    watch.record_change(Instant::now());
                    debug!(kind = ?event.kind, "change detected, still rendering");
                }
            }
            Ok(Err(e)) => warn!(dir = %dir.display(), error = %e, "watcher reported an error"),
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                return Err(DriverError::watch(format!(
                    "watcher for '{}' disconnected",
                    dir.display()
                )));
            }
        }

        match watch.poll(Instant::now()) {
            WatchState::Watching => {}
            WatchState::Quiesced => {
                info!(
                    dir = %dir.display(),
                    changes = watch.changes(),
                    "output stopped changing"
                );
                return Ok(true);
            }
            WatchState::TimedOut => {
                warn!(
                    dir = %dir.display(),
                    changes = watch.changes(),
                    "output still changing at timeout"
                );
                return Ok(false);
            }
        }
    }
}
