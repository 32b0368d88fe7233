//! Time-order merger: buffers decoded events from every ring buffer briefly
//! and releases them in nondecreasing timestamp order.
//!
//! Unlike round-robin group gating, this merger has no notion of "rounds"
//! — each stream can be arbitrarily far ahead of another. Readiness is
//! instead decided by a grace window: an
//! event is released once its timestamp is more than `grace_ns` older than
//! `now`, on the assumption that no stream can still be holding an
//! undelivered event older than that.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::counters::Counters;
use crate::model::PerfEvent;

struct HeapItem(PerfEvent);

impl PartialEq for HeapItem {
    fn eq(&self, other: &Self) -> bool {
        self.0.timestamp_ns() == other.0.timestamp_ns()
    }
}
impl Eq for HeapItem {}

impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapItem {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed so `BinaryHeap`, which is a max-heap, pops the smallest
        // timestamp first.
        other.0.timestamp_ns().cmp(&self.0.timestamp_ns())
    }
}

#[derive(Default)]
pub struct TimeOrderMerger {
    heap: BinaryHeap<HeapItem>,
    /// The newest timestamp ever released by `pull_ready`. A push older than
    /// this would have to be inserted behind already-delivered events to
    /// keep the output nondecreasing, which isn't possible once they're
    /// gone, so such pushes are counted and dropped instead: an event late
    /// enough to fall outside the window is reported via the
    /// out-of-order-discarded counter rather than risking misordered output.
    high_watermark: u64,
}

impl TimeOrderMerger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: PerfEvent, counters: &Counters) {
        if event.timestamp_ns() < self.high_watermark {
            counters.bump_out_of_order_discarded();
            return;
        }
        self.heap.push(HeapItem(event));
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Drains every buffered event whose timestamp is at least `grace_ns`
    /// older than `now`, in nondecreasing timestamp order, into `out`.
    /// Returns the number of events drained.
    pub fn pull_ready(&mut self, now_ns: u64, grace_ns: u64, out: &mut Vec<PerfEvent>) -> usize {
        let threshold = now_ns.saturating_sub(grace_ns);
        let mut drained = 0;
        while let Some(HeapItem(event)) = self.heap.peek() {
            if event.timestamp_ns() > threshold {
                break;
            }
            let HeapItem(event) = self.heap.pop().unwrap();
            self.high_watermark = self.high_watermark.max(event.timestamp_ns());
            out.push(event);
            drained += 1;
        }
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stack_sample(timestamp_ns: u64) -> PerfEvent {
        PerfEvent::Fork {
            tid: 1,
            pid: 1,
            timestamp_ns,
            stream: 0,
        }
    }

    #[test]
    fn releases_in_timestamp_order_regardless_of_push_order() {
        let mut merger = TimeOrderMerger::new();
        let counters = Counters::new();
        merger.push(stack_sample(30), &counters);
        merger.push(stack_sample(10), &counters);
        merger.push(stack_sample(20), &counters);

        let mut out = Vec::new();
        let drained = merger.pull_ready(1_000_000, 0, &mut out);
        assert_eq!(drained, 3);
        let timestamps: Vec<_> = out.iter().map(PerfEvent::timestamp_ns).collect();
        assert_eq!(timestamps, vec![10, 20, 30]);
    }

    #[test]
    fn grace_window_withholds_recent_events() {
        let mut merger = TimeOrderMerger::new();
        let counters = Counters::new();
        merger.push(stack_sample(100), &counters);
        merger.push(stack_sample(990), &counters);

        let mut out = Vec::new();
        let drained = merger.pull_ready(1_000, 100, &mut out);
        assert_eq!(drained, 1);
        assert_eq!(out[0].timestamp_ns(), 100);
        assert_eq!(merger.len(), 1);
    }

    #[test]
    fn empty_merger_pulls_nothing() {
        let mut merger = TimeOrderMerger::new();
        let mut out = Vec::new();
        assert_eq!(merger.pull_ready(1_000_000, 0, &mut out), 0);
        assert!(out.is_empty());
    }

    #[test]
    fn push_older_than_high_watermark_is_discarded_and_counted() {
        let mut merger = TimeOrderMerger::new();
        let counters = Counters::new();
        merger.push(stack_sample(100), &counters);
        let mut out = Vec::new();
        merger.pull_ready(1_000_000, 0, &mut out);
        assert_eq!(out.len(), 1);

        merger.push(stack_sample(50), &counters);
        assert!(merger.is_empty());
        assert_eq!(counters.out_of_order_events_discarded(), 1);
    }
}
