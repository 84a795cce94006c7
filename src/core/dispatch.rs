//! Event dispatch queue
//!
//! Events posted by sub-HALs go straight to the client channel when nothing
//! is buffered and the channel has room. Whatever does not fit is queued as a
//! pending batch and written by the dispatch task, strictly in FIFO order.

use log::{debug, error, warn};
use multihal_core::{Event, EventSink, WriteOutcome};
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use super::wakelock::WakelockCoordinator;

/// Longest single blocking write slice, so a stop request is noticed quickly
const WRITE_SLICE: Duration = Duration::from_millis(50);

/// Events that could not be written immediately
struct PendingBatch {
    events: Vec<Event>,
    /// Parallel to `events`: whether each event came from a wake-up sensor
    wake_up: Vec<bool>,
    /// Index of the first event not yet written
    offset: usize,
    /// When the wake lock references for this batch were taken
    acquired_at: Option<Instant>,
}

impl PendingBatch {
    fn remaining(&self) -> usize {
        self.events.len() - self.offset
    }

    fn wakeups_between(&self, start: usize, end: usize) -> usize {
        self.wake_up[start..end].iter().filter(|w| **w).count()
    }
}

/// Snapshot of the queue for diagnostics
#[derive(Debug, Clone, Copy, Default)]
pub struct QueueStats {
    /// Events currently buffered
    pub pending_events: usize,
    /// Most events ever buffered at once
    pub high_water_mark: usize,
    /// Remaining events of the batch at the front
    pub front_batch_len: Option<usize>,
    pub pending_batches: usize,
    /// Events dropped because the buffer was full
    pub dropped_overflow: u64,
    /// Events dropped because a blocking write timed out
    pub dropped_timeout: u64,
    /// Events dropped because the client closed its channel
    pub dropped_disconnected: u64,
}

struct QueueState {
    batches: VecDeque<PendingBatch>,
    /// Sum of `remaining()` over all batches
    size: usize,
    high_water_mark: usize,
    running: bool,
    sink: Option<Arc<dyn EventSink>>,
    dropped_overflow: u64,
    dropped_timeout: u64,
    dropped_disconnected: u64,
}

impl QueueState {
    /// Empty the queue, returning the dropped count and the wake-ups to release
    fn discard_all(&mut self) -> (usize, Vec<(usize, Option<Instant>)>) {
        let count = self.size;
        let releases = self
            .batches
            .drain(..)
            .map(|b| (b.wakeups_between(b.offset, b.events.len()), b.acquired_at))
            .filter(|(wakeups, _)| *wakeups > 0)
            .collect();
        self.size = 0;
        (count, releases)
    }
}

/// Bounded backpressure queue in front of the client event channel
pub struct EventDispatchQueue {
    state: Mutex<QueueState>,
    /// Signalled when a batch is queued or the queue stops
    cond: Condvar,
    wakelock: Arc<WakelockCoordinator>,
    max_pending: usize,
    write_timeout: Duration,
}

impl EventDispatchQueue {
    pub fn new(wakelock: Arc<WakelockCoordinator>, max_pending: usize, write_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(QueueState {
                batches: VecDeque::new(),
                size: 0,
                high_water_mark: 0,
                running: false,
                sink: None,
                dropped_overflow: 0,
                dropped_timeout: 0,
                dropped_disconnected: 0,
            }),
            cond: Condvar::new(),
            wakelock,
            max_pending,
            write_timeout,
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start delivering to `sink`
    pub fn start(&self, sink: Arc<dyn EventSink>) {
        let mut state = self.lock_state();
        state.sink = Some(sink);
        state.running = true;
    }

    /// Stop accepting events and wake the dispatch task so it exits
    pub fn stop(&self) {
        self.lock_state().running = false;
        self.cond.notify_all();
    }

    pub fn is_running(&self) -> bool {
        self.lock_state().running
    }

    /// Discard every buffered event, returning how many were dropped
    ///
    /// Wake lock references are not returned; callers reset the wake lock.
    pub fn clear(&self) -> usize {
        let mut state = self.lock_state();
        let dropped = state.size;
        state.batches.clear();
        state.size = 0;
        state.sink = None;
        dropped
    }

    /// Post a batch of namespaced events
    ///
    /// `wake_up[i]` tells whether `events[i]` is a wake-up event; the caller
    /// has already taken one wake lock reference per wake-up event at
    /// `acquired_at`. References for events that end up dropped are released
    /// here.
    pub fn post(&self, events: Vec<Event>, wake_up: Vec<bool>, acquired_at: Option<Instant>) {
        debug_assert_eq!(events.len(), wake_up.len());
        if events.is_empty() {
            return;
        }

        let dropped_wakeups = {
            let mut state = self.lock_state();
            let sink = if state.running { state.sink.clone() } else { None };
            let Some(sink) = sink else {
                drop(state);
                let wakeups = wake_up.iter().filter(|w| **w).count();
                debug!("Dispatch queue stopped, discarding {} events", events.len());
                self.release_wakeups(wakeups, acquired_at);
                return;
            };

            let outcome = if state.batches.is_empty() {
                sink.try_write(&events)
            } else {
                WriteOutcome::Written(0)
            };
            let written = outcome.written();
            let remaining = events.len() - written;

            if outcome.is_closed() {
                if remaining > 0 {
                    state.dropped_disconnected += remaining as u64;
                    debug!("Client event channel closed, dropping {} events", remaining);
                }
                drop(state);
                let wakeups = wake_up[written..].iter().filter(|w| **w).count();
                self.release_wakeups(wakeups, acquired_at);
                return;
            }

            let room = self.max_pending.saturating_sub(state.size);
            let kept = remaining.min(room);
            let dropped = remaining - kept;

            let dropped_wakeups = wake_up[written + kept..].iter().filter(|w| **w).count();
            if dropped > 0 {
                state.dropped_overflow += dropped as u64;
                warn!(
                    "Pending event buffer full ({} events), dropping {} events",
                    state.size, dropped
                );
            }

            if kept > 0 {
                let end = written + kept;
                let mut events = events;
                let mut wake_up = wake_up;
                events.truncate(end);
                wake_up.truncate(end);
                state.batches.push_back(PendingBatch {
                    events,
                    wake_up,
                    offset: written,
                    acquired_at,
                });
                state.size += kept;
                state.high_water_mark = state.high_water_mark.max(state.size);
                self.cond.notify_all();
            }
            dropped_wakeups
        };

        self.release_wakeups(dropped_wakeups, acquired_at);
    }

    fn release_wakeups(&self, count: usize, acquired_at: Option<Instant>) {
        if count > 0 {
            self.wakelock.release(count, acquired_at);
        }
    }

    /// Dispatch loop run by the pending-writes task
    ///
    /// Returns once the queue is stopped.
    pub fn run(&self) {
        let mut state = self.lock_state();
        loop {
            state = self
                .cond
                .wait_while(state, |s| s.running && s.batches.is_empty())
                .unwrap_or_else(|e| e.into_inner());
            if !state.running {
                break;
            }

            let Some(sink) = state.sink.clone() else {
                break;
            };
            let (chunk, acquired_at) = match state.batches.front() {
                Some(front) => {
                    let len = front.remaining().min(sink.capacity()).max(1);
                    let chunk = front.events[front.offset..front.offset + len].to_vec();
                    (chunk, front.acquired_at)
                }
                None => continue,
            };
            drop(state);

            let outcome = self.write_blocking(sink.as_ref(), &chunk);
            let written = outcome.written();

            state = self.lock_state();
            let stopped = !state.running;
            let Some(front) = state.batches.front_mut() else {
                continue;
            };
            front.offset += written;
            let mut dropped = 0;
            let mut dropped_wakeups = 0;
            if written < chunk.len() && !stopped && !outcome.is_closed() {
                dropped = front.remaining();
                dropped_wakeups = front.wakeups_between(front.offset, front.events.len());
                front.offset = front.events.len();
            }
            let finished = front.remaining() == 0;
            state.size -= written + dropped;
            if finished {
                state.batches.pop_front();
            }

            let mut releases = Vec::new();
            if dropped > 0 {
                state.dropped_timeout += dropped as u64;
                error!(
                    "Dropping {} events after blocking write timed out ({} of {} written)",
                    dropped,
                    written,
                    chunk.len()
                );
                releases.push((dropped_wakeups, acquired_at));
            }
            if outcome.is_closed() {
                let (count, mut rest) = state.discard_all();
                state.dropped_disconnected += count as u64;
                warn!("Client event channel closed, dropping {} pending events", count);
                releases.append(&mut rest);
            }

            if !releases.is_empty() {
                drop(state);
                for (wakeups, acquired_at) in releases {
                    self.release_wakeups(wakeups, acquired_at);
                }
                state = self.lock_state();
            }
        }
        debug!("Dispatch task exiting");
    }

    /// Write `events` in order, giving up after the write timeout, on stop or
    /// when the client channel closes
    fn write_blocking(&self, sink: &dyn EventSink, events: &[Event]) -> WriteOutcome {
        let deadline = Instant::now() + self.write_timeout;
        let mut written = 0;
        while written < events.len() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let slice = (deadline - now).min(WRITE_SLICE);
            let outcome = sink.write_with_timeout(&events[written..], slice);
            written += outcome.written();
            if outcome.is_closed() {
                return WriteOutcome::Closed(written);
            }
            if written < events.len() && !self.is_running() {
                break;
            }
        }
        WriteOutcome::Written(written)
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.lock_state();
        QueueStats {
            pending_events: state.size,
            high_water_mark: state.high_water_mark,
            front_batch_len: state.batches.front().map(|b| b.remaining()),
            pending_batches: state.batches.len(),
            dropped_overflow: state.dropped_overflow,
            dropped_timeout: state.dropped_timeout,
            dropped_disconnected: state.dropped_disconnected,
        }
    }
}
