//! Process-wide counters for the pipeline.
//!
//! Kept as plain atomics so the hot paths never contend on a lock. The
//! daemon logs a snapshot periodically and `status` renders the same shape.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Mutex;

use serde::Serialize;

#[derive(Debug, Default)]
pub struct Metrics {
    polls_attempted: AtomicU64,
    polls_succeeded: AtomicU64,
    polls_failed: AtomicU64,
    polls_not_modified: AtomicU64,
    entries_discovered: AtomicU64,
    items_skipped: AtomicU64,
    deliveries_succeeded: AtomicU64,
    deliveries_failed: AtomicU64,
    deliveries_rate_limited: AtomicU64,
    duplicates_suppressed: AtomicU64,
    sources_disabled: AtomicU64,
    queue_depth: Mutex<BTreeMap<String, i64>>,
    queue_total: AtomicI64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub polls_attempted: u64,
    pub polls_succeeded: u64,
    pub polls_failed: u64,
    pub polls_not_modified: u64,
    pub entries_discovered: u64,
    pub items_skipped: u64,
    pub deliveries_succeeded: u64,
    pub deliveries_failed: u64,
    pub deliveries_rate_limited: u64,
    pub duplicates_suppressed: u64,
    pub sources_disabled: u64,
    pub queue_depth: i64,
    pub queue_depth_by_sink: BTreeMap<String, i64>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn poll_attempted(&self) {
        self.polls_attempted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn poll_succeeded(&self) {
        self.polls_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn poll_failed(&self) {
        self.polls_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn poll_not_modified(&self) {
        self.polls_not_modified.fetch_add(1, Ordering::Relaxed);
    }

    pub fn entries_discovered(&self, count: usize) {
        self.entries_discovered
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn items_skipped(&self, count: usize) {
        self.items_skipped.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn delivery_succeeded(&self) {
        self.deliveries_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn delivery_failed(&self) {
        self.deliveries_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn delivery_rate_limited(&self) {
        self.deliveries_rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    pub fn duplicate_suppressed(&self) {
        self.duplicates_suppressed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn source_disabled(&self) {
        self.sources_disabled.fetch_add(1, Ordering::Relaxed);
    }

    /// Adjust the queued-job gauge for one sink
    pub fn queue_changed(&self, sink_id: &str, delta: i64) {
        self.queue_total.fetch_add(delta, Ordering::Relaxed);
        let mut depth = match self.queue_depth.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *depth.entry(sink_id.to_string()).or_insert(0) += delta;
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let by_sink = match self.queue_depth.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };

        MetricsSnapshot {
            polls_attempted: self.polls_attempted.load(Ordering::Relaxed),
            polls_succeeded: self.polls_succeeded.load(Ordering::Relaxed),
            polls_failed: self.polls_failed.load(Ordering::Relaxed),
            polls_not_modified: self.polls_not_modified.load(Ordering::Relaxed),
            entries_discovered: self.entries_discovered.load(Ordering::Relaxed),
            items_skipped: self.items_skipped.load(Ordering::Relaxed),
            deliveries_succeeded: self.deliveries_succeeded.load(Ordering::Relaxed),
            deliveries_failed: self.deliveries_failed.load(Ordering::Relaxed),
            deliveries_rate_limited: self.deliveries_rate_limited.load(Ordering::Relaxed),
            duplicates_suppressed: self.duplicates_suppressed.load(Ordering::Relaxed),
            sources_disabled: self.sources_disabled.load(Ordering::Relaxed),
            queue_depth: self.queue_total.load(Ordering::Relaxed),
            queue_depth_by_sink: by_sink,
        }
    }
}

impl MetricsSnapshot {
    /// One `name value` line per counter
    pub fn render_text(&self) -> String {
        let mut lines = vec![
            format!("polls_attempted {}", self.polls_attempted),
            format!("polls_succeeded {}", self.polls_succeeded),
            format!("polls_failed {}", self.polls_failed),
            format!("polls_not_modified {}", self.polls_not_modified),
            format!("entries_discovered {}", self.entries_discovered),
            format!("items_skipped {}", self.items_skipped),
            format!("deliveries_succeeded {}", self.deliveries_succeeded),
            format!("deliveries_failed {}", self.deliveries_failed),
            format!("deliveries_rate_limited {}", self.deliveries_rate_limited),
            format!("duplicates_suppressed {}", self.duplicates_suppressed),
            format!("sources_disabled {}", self.sources_disabled),
            format!("queue_depth {}", self.queue_depth),
        ];
        for (sink, depth) in &self.queue_depth_by_sink {
            lines.push(format!("queue_depth{{sink=\"{}\"}} {}", sink, depth));
        }
        lines.join("\n")
    }
}
