//! Bounded ingest buffer
//!
//! Holds finalized events until the background cycle writes them to the
//! gateway. The cap covers re-queued batches as well as new events; when it
//! is reached the configured [`OverflowStrategy`] decides what is lost.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{trace, warn};
use usage_analytics_config::OverflowStrategy;
use usage_analytics_types::{TimeRange, UsageEvent};

/// What happened to a pushed event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Buffered
    Accepted,
    /// Buffered after evicting the oldest event
    DroppedOldest,
    /// Discarded because the buffer was full
    DroppedNewest,
    /// Refused; the caller gets an error
    Rejected,
}

impl PushOutcome {
    pub fn is_overflow(&self) -> bool {
        !matches!(self, Self::Accepted)
    }

    /// Whether the pushed event made it into the buffer
    pub fn is_buffered(&self) -> bool {
        matches!(self, Self::Accepted | Self::DroppedOldest)
    }
}

/// Buffer statistics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BufferStats {
    pub current_size: usize,
    pub capacity: usize,
    pub utilization_percent: f64,
    /// Events lost to overflow, including re-queued ones
    pub dropped: u64,
    /// Events refused under `RejectNew`
    pub rejected: u64,
}

#[derive(Debug)]
pub struct EventBuffer {
    queue: Mutex<VecDeque<UsageEvent>>,
    capacity: usize,
    strategy: OverflowStrategy,
    dropped: AtomicU64,
    rejected: AtomicU64,
}

impl EventBuffer {
    pub fn new(capacity: usize, strategy: OverflowStrategy) -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity: capacity.max(1),
            strategy,
            dropped: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn strategy(&self) -> OverflowStrategy {
        self.strategy
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    /// Append an event, applying the overflow strategy at capacity
    pub fn push(&self, event: UsageEvent) -> PushOutcome {
        let mut queue = self.queue.lock();
        if queue.len() < self.capacity {
            queue.push_back(event);
            return PushOutcome::Accepted;
        }

        match self.strategy {
            OverflowStrategy::DropOldest => {
                if let Some(evicted) = queue.pop_front() {
                    trace!(event_id = %evicted.id, "Evicted oldest buffered event");
                }
                queue.push_back(event);
                self.dropped.fetch_add(1, Ordering::Relaxed);
                PushOutcome::DroppedOldest
            }
            OverflowStrategy::DropNewest => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                PushOutcome::DroppedNewest
            }
            OverflowStrategy::RejectNew => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                PushOutcome::Rejected
            }
        }
    }

    /// Remove up to `max` events from the head
    pub fn take_batch(&self, max: usize) -> Vec<UsageEvent> {
        let mut queue = self.queue.lock();
        let n = max.min(queue.len());
        queue.drain(..n).collect()
    }

    /// Copies of buffered events timestamped within `range`
    pub fn snapshot(&self, range: TimeRange) -> Vec<UsageEvent> {
        self.queue
            .lock()
            .iter()
            .filter(|e| range.contains(e.timestamp))
            .cloned()
            .collect()
    }

    /// Put a failed batch back at the head, preserving its order
    ///
    /// Returns the number of events lost to the cap.
    pub fn requeue(&self, batch: Vec<UsageEvent>) -> usize {
        let mut queue = self.queue.lock();
        for event in batch.into_iter().rev() {
            queue.push_front(event);
        }

        let mut lost = 0;
        while queue.len() > self.capacity {
            match self.strategy {
                OverflowStrategy::DropOldest => queue.pop_front(),
                OverflowStrategy::DropNewest | OverflowStrategy::RejectNew => queue.pop_back(),
            };
            lost += 1;
        }

        if lost > 0 {
            self.dropped.fetch_add(lost as u64, Ordering::Relaxed);
            warn!(
                lost,
                strategy = self.strategy.name(),
                "Re-queued batch exceeded buffer capacity"
            );
        }
        lost
    }

    pub fn stats(&self) -> BufferStats {
        let current_size = self.len();
        BufferStats {
            current_size,
            capacity: self.capacity,
            utilization_percent: current_size as f64 / self.capacity as f64 * 100.0,
            dropped: self.dropped.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use chrono::{Duration, TimeZone, Utc};
    use usage_analytics_types::{AiRequest, EventDraft};

    fn events(n: i64) -> Vec<UsageEvent> {
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        (0..n)
            .map(|i| {
                let ts = base + Duration::seconds(i);
                EventDraft::from(AiRequest::new("chat", "m", "p", 1.0, 1, 0.0))
                    .at(ts)
                    .finalize(ts)
            })
            .collect()
    }

    #[test]
    fn test_drop_oldest_keeps_latest() {
        let buffer = EventBuffer::new(3, OverflowStrategy::DropOldest);
        let evs = events(5);
        let outcomes: Vec<_> = evs.iter().cloned().map(|e| buffer.push(e)).collect();

        assert_eq!(outcomes[2], PushOutcome::Accepted);
        assert_eq!(outcomes[3], PushOutcome::DroppedOldest);
        let kept = buffer.take_batch(10);
        assert_eq!(
            kept.iter().map(|e| e.id).collect::<Vec<_>>(),
            evs[2..].iter().map(|e| e.id).collect::<Vec<_>>()
        );
        assert_eq!(buffer.stats().dropped, 2);
    }

    #[test]
    fn test_drop_newest_and_reject() {
        let newest = EventBuffer::new(2, OverflowStrategy::DropNewest);
        let reject = EventBuffer::new(2, OverflowStrategy::RejectNew);
        for event in events(3) {
            newest.push(event.clone());
            reject.push(event);
        }

        assert_eq!(newest.len(), 2);
        assert_eq!(newest.stats().dropped, 1);
        assert_eq!(reject.len(), 2);
        assert_eq!(reject.stats().rejected, 1);
        assert_eq!(reject.stats().dropped, 0);
    }

    #[test]
    fn test_requeue_restores_head_order() {
        let buffer = EventBuffer::new(10, OverflowStrategy::DropOldest);
        let evs = events(6);
        for e in &evs {
            buffer.push(e.clone());
        }

        let batch = buffer.take_batch(4);
        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.requeue(batch), 0);

        let range = TimeRange::new(evs[1].timestamp, evs[3].timestamp);
        assert_eq!(buffer.snapshot(range).len(), 2);

        let all = buffer.take_batch(10);
        assert_eq!(
            all.iter().map(|e| e.id).collect::<Vec<_>>(),
            evs.iter().map(|e| e.id).collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_requeue_respects_capacity() {
        let buffer = EventBuffer::new(4, OverflowStrategy::DropNewest);
        let evs = events(4);
        for e in &evs {
            buffer.push(e.clone());
        }
        let batch = buffer.take_batch(3);
        buffer.push(evs[0].clone());
        buffer.push(evs[1].clone());

        // 3 re-queued + 3 buffered against a cap of 4
        assert_eq!(buffer.requeue(batch), 2);
        assert_eq!(buffer.len(), 4);
        assert_relative_eq!(buffer.stats().utilization_percent, 100.0);
    }
}
