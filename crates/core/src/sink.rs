//! Output event channel abstraction

use crossbeam::channel::{SendTimeoutError, Sender, TrySendError};
use multihal_types::Event;
use std::time::{Duration, Instant};

/// Result of a write into an [`EventSink`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The channel is still open; this many leading events were written
    Written(usize),
    /// The reader is gone; this many leading events were written before that
    Closed(usize),
}

impl WriteOutcome {
    pub fn written(self) -> usize {
        match self {
            WriteOutcome::Written(n) | WriteOutcome::Closed(n) => n,
        }
    }

    pub fn is_closed(self) -> bool {
        matches!(self, WriteOutcome::Closed(_))
    }
}

/// Bounded output channel towards the client
pub trait EventSink: Send + Sync {
    /// Total number of events the channel can hold
    fn capacity(&self) -> usize;

    /// Write as many leading events as fit without blocking
    ///
    /// Written events are always a prefix of `events`.
    fn try_write(&self, events: &[Event]) -> WriteOutcome;

    /// Write events in order, blocking up to `timeout` in total
    fn write_with_timeout(&self, events: &[Event], timeout: Duration) -> WriteOutcome;
}

impl EventSink for Sender<Event> {
    fn capacity(&self) -> usize {
        Sender::capacity(self).unwrap_or(usize::MAX)
    }

    fn try_write(&self, events: &[Event]) -> WriteOutcome {
        let mut written = 0;
        for event in events {
            match self.try_send(event.clone()) {
                Ok(()) => written += 1,
                Err(TrySendError::Full(_)) => break,
                Err(TrySendError::Disconnected(_)) => return WriteOutcome::Closed(written),
            }
        }
        WriteOutcome::Written(written)
    }

    fn write_with_timeout(&self, events: &[Event], timeout: Duration) -> WriteOutcome {
        let deadline = Instant::now() + timeout;
        let mut written = 0;
        for event in events {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.send_timeout(event.clone(), remaining) {
                Ok(()) => written += 1,
                Err(SendTimeoutError::Timeout(_)) => break,
                Err(SendTimeoutError::Disconnected(_)) => return WriteOutcome::Closed(written),
            }
        }
        WriteOutcome::Written(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel::bounded;
    use multihal_types::{EventPayload, SensorType};

    fn event(handle: i32) -> Event {
        Event::new(handle, SensorType::Light, 0, EventPayload::Scalar(1.0))
    }

    #[test]
    fn test_try_write_fills_free_capacity() {
        let (tx, rx) = bounded::<Event>(4);
        tx.send(event(0)).unwrap();

        let events: Vec<Event> = (1..=5).map(event).collect();
        assert_eq!(tx.try_write(&events), WriteOutcome::Written(3));
        assert!(tx.is_full());

        let handles: Vec<i32> = rx.try_iter().map(|e| e.sensor_handle).collect();
        assert_eq!(handles, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_write_with_timeout_gives_up() {
        let (tx, _rx) = bounded::<Event>(1);
        let events: Vec<Event> = (0..3).map(event).collect();
        assert_eq!(
            tx.write_with_timeout(&events, Duration::from_millis(20)),
            WriteOutcome::Written(1)
        );
    }

    #[test]
    fn test_disconnected_channel_reports_closed() {
        let (tx, rx) = bounded::<Event>(2);
        drop(rx);
        assert_eq!(tx.try_write(&[event(1)]), WriteOutcome::Closed(0));

        let start = Instant::now();
        let outcome = tx.write_with_timeout(&[event(1)], Duration::from_secs(1));
        assert!(outcome.is_closed());
        assert_eq!(outcome.written(), 0);
        assert!(start.elapsed() < Duration::from_millis(500));
    }
}
