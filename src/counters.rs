//! Cross-thread-readable counters: the only values a running session
//! exposes to another thread, as plain atomic integers rather than behind a
//! lock.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct Counters {
    unwinding_errors: AtomicU64,
    discarded_samples_in_uretprobes: AtomicU64,
    out_of_order_events_discarded: AtomicU64,
    lost_perf_records: AtomicU64,
}

impl Counters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bump_unwinding_errors(&self) {
        self.unwinding_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bump_discarded_in_uretprobes(&self) {
        self.discarded_samples_in_uretprobes
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn bump_out_of_order_discarded(&self) {
        self.out_of_order_events_discarded
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_lost_records(&self, count: u64) {
        self.lost_perf_records.fetch_add(count, Ordering::Relaxed);
    }

    pub fn unwinding_errors(&self) -> u64 {
        self.unwinding_errors.load(Ordering::Relaxed)
    }

    pub fn discarded_samples_in_uretprobes(&self) -> u64 {
        self.discarded_samples_in_uretprobes.load(Ordering::Relaxed)
    }

    pub fn out_of_order_events_discarded(&self) -> u64 {
        self.out_of_order_events_discarded.load(Ordering::Relaxed)
    }

    pub fn lost_perf_records(&self) -> u64 {
        self.lost_perf_records.load(Ordering::Relaxed)
    }
}
