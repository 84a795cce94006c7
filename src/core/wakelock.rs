//! Shared wake lock accounting
//!
//! Every undelivered wake-up event holds one reference on the shared wake
//! lock. The client acknowledges processed wake-up events through the ack
//! channel; the monitor task turns those acks into releases and force-resets
//! the lock when the client goes quiet for longer than the timeout.

use crossbeam::channel::{Receiver, RecvTimeoutError};
use crossbeam::select;
use log::{debug, trace, warn};
use multihal_core::{PowerLock, WakelockRefCounter};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Snapshot of the coordinator state for diagnostics
#[derive(Debug, Clone, Copy)]
pub struct WakelockStats {
    pub ref_count: usize,
    pub acquired: bool,
    pub since_timeout_start: Duration,
    pub since_last_reset: Duration,
}

struct WakelockState {
    ref_count: usize,
    /// Always equal to `ref_count > 0`
    acquired: bool,
    timeout_start: Instant,
    last_reset: Instant,
    running: bool,
}

/// Reference-counted, timeout-guarded owner of the shared wake lock
pub struct WakelockCoordinator {
    state: Mutex<WakelockState>,
    /// Signalled when the ref count leaves zero or the coordinator stops
    cond: Condvar,
    power: Arc<dyn PowerLock>,
    name: String,
    timeout: Duration,
}

impl WakelockCoordinator {
    pub fn new(power: Arc<dyn PowerLock>, name: impl Into<String>, timeout: Duration) -> Self {
        let now = Instant::now();
        Self {
            state: Mutex::new(WakelockState {
                ref_count: 0,
                acquired: false,
                timeout_start: now,
                last_reset: now,
                running: false,
            }),
            cond: Condvar::new(),
            power,
            name: name.into(),
            timeout,
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, WakelockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Allow acquisitions (start of a proxy generation)
    pub fn start(&self) {
        self.lock_state().running = true;
    }

    /// Refuse further acquisitions and wake the monitor so it can exit
    pub fn stop(&self) {
        self.lock_state().running = false;
        self.cond.notify_all();
    }

    pub fn is_running(&self) -> bool {
        self.lock_state().running
    }

    /// Add `delta` references, acquiring the platform lock on the first one
    ///
    /// Always restarts the timeout window. Returns the new timeout start, or
    /// `None` if the coordinator is stopped.
    pub fn acquire_or_extend(&self, delta: usize) -> Option<Instant> {
        let mut state = self.lock_state();
        if !state.running {
            return None;
        }
        if delta == 0 {
            return Some(state.timeout_start);
        }
        if state.ref_count == 0 {
            if !self.power.acquire(&self.name) {
                warn!("Platform refused wake lock '{}'", self.name);
            }
            state.acquired = true;
            debug!("Acquired wake lock '{}'", self.name);
            self.cond.notify_all();
        }
        state.timeout_start = Instant::now();
        state.ref_count += delta;
        trace!("Wake lock ref count +{} -> {}", delta, state.ref_count);
        Some(state.timeout_start)
    }

    /// Drop `delta` references taken at `since`
    ///
    /// A release whose `since` predates the last reset belongs to an earlier
    /// accounting window and is ignored. `None` is treated as current.
    pub fn release(&self, delta: usize, since: Option<Instant>) {
        let mut state = self.lock_state();
        let since = since.unwrap_or(state.last_reset);
        if state.ref_count == 0 || since < state.last_reset {
            return;
        }
        state.ref_count -= state.ref_count.min(delta);
        trace!("Wake lock ref count -{} -> {}", delta, state.ref_count);
        if state.ref_count == 0 {
            self.release_platform_lock(&mut state);
        }
    }

    /// Whether the current hold exceeded the timeout, and how long is left
    pub fn check_timeout(&self) -> (bool, Duration) {
        let state = self.lock_state();
        self.timeout_status(&state)
    }

    fn timeout_status(&self, state: &WakelockState) -> (bool, Duration) {
        let elapsed = state.timeout_start.elapsed();
        if elapsed > self.timeout {
            (true, Duration::ZERO)
        } else {
            (false, self.timeout - elapsed)
        }
    }

    /// Drop every reference and release the platform lock
    ///
    /// Releases carrying a timestamp from before this call are ignored.
    pub fn reset(&self) {
        let mut state = self.lock_state();
        self.reset_locked(&mut state);
    }

    fn reset_locked(&self, state: &mut WakelockState) {
        state.ref_count = 0;
        if state.acquired {
            self.release_platform_lock(state);
        }
        state.last_reset = Instant::now();
    }

    fn release_platform_lock(&self, state: &mut WakelockState) {
        state.ref_count = 0;
        state.acquired = false;
        if !self.power.release(&self.name) {
            warn!("Platform failed to release wake lock '{}'", self.name);
        }
        debug!("Released wake lock '{}'", self.name);
    }

    pub fn stats(&self) -> WakelockStats {
        let state = self.lock_state();
        WakelockStats {
            ref_count: state.ref_count,
            acquired: state.acquired,
            since_timeout_start: state.timeout_start.elapsed(),
            since_last_reset: state.last_reset.elapsed(),
        }
    }

    /// Monitor loop run by the wake lock task
    ///
    /// Waits for references to be held, then for acks from the client until
    /// the timeout window closes. Returns once the coordinator is stopped or
    /// `shutdown` fires (its sender is dropped).
    pub fn run_monitor(&self, acks: Receiver<u32>, shutdown: Receiver<()>) {
        let mut acks_open = true;
        loop {
            let time_left = {
                let state = self.lock_state();
                let mut state = self
                    .cond
                    .wait_while(state, |s| s.running && s.ref_count == 0)
                    .unwrap_or_else(|e| e.into_inner());
                if !state.running {
                    break;
                }
                let (expired, time_left) = self.timeout_status(&state);
                if expired {
                    warn!(
                        "Wake lock held for over {:?} without acks, releasing {} references",
                        self.timeout, state.ref_count
                    );
                    self.reset_locked(&mut state);
                    continue;
                }
                time_left
            };

            if acks_open {
                select! {
                    recv(acks) -> msg => match msg {
                        Ok(processed) => self.release(processed as usize, None),
                        Err(_) => {
                            debug!("Wake lock ack channel closed");
                            acks_open = false;
                        }
                    },
                    recv(shutdown) -> _ => break,
                    default(time_left) => {}
                }
            } else {
                match shutdown.recv_timeout(time_left) {
                    Err(RecvTimeoutError::Timeout) => {}
                    _ => break,
                }
            }
        }
        self.reset();
        debug!("Wake lock monitor exiting");
    }
}

impl WakelockRefCounter for WakelockCoordinator {
    fn increment_ref_count(&self, delta: usize) -> Option<Instant> {
        self.acquire_or_extend(delta)
    }

    fn decrement_ref_count(&self, delta: usize, since: Option<Instant>) {
        self.release(delta, since);
    }
}
