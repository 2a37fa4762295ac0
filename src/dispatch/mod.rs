//! Delivery of notifications to sinks.
//!
//! Every sink gets its own worker task and bounded queue, so a sink that is
//! rate limited or failing only delays its own jobs.

pub mod channel_sink;
pub mod rate_limit;
pub mod retry;
pub mod sink;

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

pub use channel_sink::ChannelSink;
pub use rate_limit::{RateLimitConfig, RateLimitResult, SlidingWindow};
pub use retry::{cooldown_end, AttemptState, DeliveryAttempt, RetryPolicy, MAX_COOLDOWN};
pub use sink::{Sink, SinkError};

use crate::domain::{DeliveryRecord, Notification};
use crate::errors::{FeederError, FeederResult};
use crate::metrics::Metrics;
use crate::storage::Store;

/// One entry bound for one sink
#[derive(Debug, Clone)]
pub struct DeliveryJob {
    pub entry_id: i64,
    pub notification: Notification,
}

#[derive(Debug, Clone, Copy)]
pub struct DispatchSettings {
    pub queue_capacity: usize,
    pub retry: RetryPolicy,
    pub rate_limit: RateLimitConfig,
}

/// Sending side of the per-sink queues. Workers exit once every handle is
/// dropped and their queue is drained.
#[derive(Clone)]
pub struct DispatchHandle {
    queues: Arc<Vec<(String, mpsc::Sender<DeliveryJob>)>>,
    metrics: Arc<Metrics>,
}

impl DispatchHandle {
    pub fn sink_ids(&self) -> Vec<String> {
        self.queues.iter().map(|(id, _)| id.clone()).collect()
    }

    pub fn has_sink(&self, sink_id: &str) -> bool {
        self.queues.iter().any(|(id, _)| id == sink_id)
    }

    /// Queue a job, waiting for room if the sink is backed up
    pub async fn enqueue(
        &self,
        sink_id: &str,
        job: DeliveryJob,
        cancel: &CancellationToken,
    ) -> FeederResult<()> {
        let sender = self
            .queues
            .iter()
            .find(|(id, _)| id == sink_id)
            .map(|(_, sender)| sender)
            .ok_or_else(|| FeederError::Config(format!("unknown sink: {}", sink_id)))?;

        self.metrics.queue_changed(sink_id, 1);
        let sent = tokio::select! {
            _ = cancel.cancelled() => false,
            result = sender.send(job) => result.is_ok(),
        };
        if !sent {
            self.metrics.queue_changed(sink_id, -1);
            return Err(FeederError::Persistence(format!(
                "queue for sink {} is closed",
                sink_id
            )));
        }
        Ok(())
    }
}

/// Start one worker per sink. Returns the handle used to queue jobs and the
/// set of worker tasks.
pub fn start(
    sinks: Vec<Arc<dyn Sink>>,
    store: Store,
    metrics: Arc<Metrics>,
    settings: DispatchSettings,
    cancel: CancellationToken,
) -> (DispatchHandle, JoinSet<()>) {
    let mut queues = Vec::with_capacity(sinks.len());
    let mut workers = JoinSet::new();

    for sink in sinks {
        let (tx, rx) = mpsc::channel(settings.queue_capacity.max(1));
        let sink_id = sink.id().to_string();
        queues.push((sink_id.clone(), tx));

        let worker = SinkWorker {
            sink,
            queue: rx,
            store: store.clone(),
            metrics: metrics.clone(),
            policy: settings.retry,
            limiter: SlidingWindow::new(settings.rate_limit),
            cooldown_until: None,
        };
        let span = info_span!("sink", sink = %sink_id);
        workers.spawn(worker.run(cancel.clone()).instrument(span));
    }

    (
        DispatchHandle {
            queues: Arc::new(queues),
            metrics,
        },
        workers,
    )
}

struct SinkWorker {
    sink: Arc<dyn Sink>,
    queue: mpsc::Receiver<DeliveryJob>,
    store: Store,
    metrics: Arc<Metrics>,
    policy: RetryPolicy,
    limiter: SlidingWindow,
    /// Set when the sink told us to back off; applies to every job
    cooldown_until: Option<Instant>,
}

impl SinkWorker {
    async fn run(mut self, cancel: CancellationToken) {
        info!("Sink worker started");
        loop {
            let job = tokio::select! {
                _ = cancel.cancelled() => break,
                job = self.queue.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
            };
            self.metrics.queue_changed(self.sink.id(), -1);
            self.process(job, &cancel).await;
        }
        info!("Sink worker stopped");
    }

    /// Deliver one job to completion. Returns early, without recording
    /// anything, only on cancellation; the entry stays pending in the store.
    async fn process(&mut self, job: DeliveryJob, cancel: &CancellationToken) {
        let entry_id = job.entry_id;
        let sink_id = self.sink.id().to_string();

        let lookup_sink = sink_id.clone();
        match self
            .store
            .run_retrying("has_delivered", self.policy, cancel, move |s| {
                s.deliveries.has_delivered(entry_id, &lookup_sink)
            })
            .await
        {
            Ok(true) => {
                debug!(entry_id, "Already delivered, skipping");
                self.metrics.duplicate_suppressed();
                return;
            }
            Ok(false) => {}
            Err(e) => {
                // Sending without the check could duplicate; leave it pending
                error!(entry_id, error = %e, "Could not check delivery state, giving up");
                return;
            }
        }

        let mut attempt = DeliveryAttempt::new(self.policy);
        loop {
            if !self.wait_until_sendable(&attempt, cancel).await {
                return;
            }

            attempt.start(Instant::now());
            let outcome = self.sink.deliver(&job.notification).await;

            if let Err(SinkError::RateLimited(cooldown)) = &outcome {
                warn!(entry_id, ?cooldown, "Sink is rate limited");
                self.metrics.delivery_rate_limited();
                self.cooldown_until = Some(cooldown_end(Instant::now(), *cooldown));
            }

            let record = match attempt.resolve(outcome, Instant::now()) {
                AttemptState::Delivered { attempts } => {
                    DeliveryRecord::delivered(entry_id, &sink_id, *attempts)
                }
                AttemptState::Failed { attempts, reason } => {
                    warn!(entry_id, attempts, reason = %reason, "Delivery failed");
                    DeliveryRecord::failed(entry_id, &sink_id, *attempts, reason.clone())
                }
                AttemptState::Retrying { attempt: failures, .. } => {
                    debug!(entry_id, failures, "Delivery will be retried");
                    continue;
                }
                AttemptState::Pending | AttemptState::InFlight { .. } => continue,
            };

            self.finish(record, cancel).await;
            return;
        }
    }

    /// Wait out the sink cooldown, the rate limiter and the attempt's own
    /// backoff. False if cancelled while waiting.
    async fn wait_until_sendable(
        &mut self,
        attempt: &DeliveryAttempt,
        cancel: &CancellationToken,
    ) -> bool {
        loop {
            let now = Instant::now();
            let mut until = attempt.next_eligible().filter(|at| *at > now);
            if let Some(cooldown) = self.cooldown_until.filter(|at| *at > now) {
                until = Some(until.map_or(cooldown, |u| u.max(cooldown)));
            }

            if let Some(until) = until {
                tokio::select! {
                    _ = cancel.cancelled() => return false,
                    _ = tokio::time::sleep_until(until) => {}
                }
                continue;
            }

            match self.limiter.check_and_record(now) {
                RateLimitResult::Allowed => return true,
                RateLimitResult::Denied { retry_after } => {
                    debug!(?retry_after, "Send window full");
                    tokio::select! {
                        _ = cancel.cancelled() => return false,
                        _ = tokio::time::sleep(retry_after) => {}
                    }
                }
            }
        }
    }

    /// Persist the outcome. Store failures are retried; if they persist the
    /// entry stays pending and a later run re-queues it.
    async fn finish(&self, record: DeliveryRecord, cancel: &CancellationToken) {
        let delivered = record.status == crate::domain::DeliveryStatus::Delivered;
        let entry_id = record.entry_id;

        match self
            .store
            .run_retrying("record_delivery", self.policy, cancel, move |s| {
                s.deliveries.record_delivery(&record)
            })
            .await
        {
            Ok(true) if delivered => {
                debug!(entry_id, "Delivered");
                self.metrics.delivery_succeeded();
            }
            Ok(true) => self.metrics.delivery_failed(),
            Ok(false) => {
                // Someone else resolved this pair first
                self.metrics.duplicate_suppressed();
            }
            Err(e) => error!(entry_id, error = %e, "Could not record delivery"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::sink::test_sink::ScriptedSink;
    use crate::domain::{DeliveryStatus, Entry, NewFeedSource};
    use crate::storage::traits::MockDeliveryRepository;
    use crate::storage::{SqliteEntryRepository, SqliteSourceRepository, SqliteStorage};
    use std::time::Duration;

    fn settings(max_attempts: u32) -> DispatchSettings {
        DispatchSettings {
            queue_capacity: 16,
            retry: RetryPolicy::new(max_attempts)
                .with_delays(Duration::from_secs(1), Duration::from_secs(8)),
            rate_limit: RateLimitConfig::new(100, Duration::from_secs(1)),
        }
    }

    /// A store holding one source with `count` entries; returns their ids
    fn store_with_entries(count: usize) -> (Store, Vec<(i64, Notification)>) {
        let store = Store::sqlite(SqliteStorage::in_memory().unwrap(), Duration::from_secs(60));
        let source_id = store
            .sources
            .add(&NewFeedSource::new("https://a.com/feed", "A"))
            .unwrap();
        let entries: Vec<_> = (0..count)
            .map(|i| {
                Entry::new(
                    source_id,
                    Some(&i.to_string()),
                    format!("Entry {}", i),
                    None,
                    None,
                )
            })
            .collect();
        let stored = store.entries.save_entries(&entries).unwrap();
        let jobs = stored
            .iter()
            .map(|s| (s.id, Notification::new("A", &s.entry)))
            .collect();
        (store, jobs)
    }

    fn job(pair: &(i64, Notification)) -> DeliveryJob {
        DeliveryJob {
            entry_id: pair.0,
            notification: pair.1.clone(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_delivers_and_records() {
        let (store, jobs) = store_with_entries(2);
        let sink = ScriptedSink::new("feeds", vec![]);
        let metrics = Arc::new(Metrics::new());
        let cancel = CancellationToken::new();

        let (handle, mut workers) = start(
            vec![sink.clone() as Arc<dyn Sink>],
            store.clone(),
            metrics.clone(),
            settings(3),
            cancel.clone(),
        );
        for pair in &jobs {
            handle.enqueue("feeds", job(pair), &cancel).await.unwrap();
        }
        drop(handle);
        while workers.join_next().await.is_some() {}

        assert_eq!(sink.delivered(), vec!["Entry 0", "Entry 1"]);
        for (entry_id, _) in &jobs {
            assert!(store.deliveries.has_delivered(*entry_id, "feeds").unwrap());
        }
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.deliveries_succeeded, 2);
        assert_eq!(snapshot.queue_depth, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_job_is_not_resent() {
        let (store, jobs) = store_with_entries(1);
        let sink = ScriptedSink::new("feeds", vec![]);
        let metrics = Arc::new(Metrics::new());
        let cancel = CancellationToken::new();

        let (handle, mut workers) = start(
            vec![sink.clone() as Arc<dyn Sink>],
            store.clone(),
            metrics.clone(),
            settings(3),
            cancel.clone(),
        );
        handle.enqueue("feeds", job(&jobs[0]), &cancel).await.unwrap();
        handle.enqueue("feeds", job(&jobs[0]), &cancel).await.unwrap();
        drop(handle);
        while workers.join_next().await.is_some() {}

        assert_eq!(sink.calls(), 1);
        assert_eq!(metrics.snapshot().duplicates_suppressed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_exhaust_attempts() {
        let (store, jobs) = store_with_entries(1);
        let sink = ScriptedSink::new(
            "feeds",
            vec![
                Err(SinkError::Transient("502".into())),
                Err(SinkError::Transient("502".into())),
                Err(SinkError::Transient("502".into())),
            ],
        );
        let metrics = Arc::new(Metrics::new());
        let cancel = CancellationToken::new();

        let (handle, mut workers) = start(
            vec![sink.clone() as Arc<dyn Sink>],
            store.clone(),
            metrics.clone(),
            settings(3),
            cancel.clone(),
        );
        handle.enqueue("feeds", job(&jobs[0]), &cancel).await.unwrap();
        drop(handle);
        while workers.join_next().await.is_some() {}

        assert_eq!(sink.calls(), 3);
        let record = store.deliveries.get(jobs[0].0, "feeds").unwrap().unwrap();
        assert_eq!(record.status, DeliveryStatus::Failed);
        assert_eq!(record.attempts, 3);
        assert_eq!(metrics.snapshot().deliveries_failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_sink_does_not_block_other_sink() {
        let (store, jobs) = store_with_entries(1);
        let slow = ScriptedSink::new(
            "slow",
            vec![Err(SinkError::RateLimited(Duration::from_secs(30)))],
        );
        let fast = ScriptedSink::new("fast", vec![]);
        let metrics = Arc::new(Metrics::new());
        let cancel = CancellationToken::new();

        let (handle, mut workers) = start(
            vec![slow.clone() as Arc<dyn Sink>, fast.clone()],
            store.clone(),
            metrics.clone(),
            settings(1),
            cancel.clone(),
        );
        handle.enqueue("slow", job(&jobs[0]), &cancel).await.unwrap();
        handle.enqueue("fast", job(&jobs[0]), &cancel).await.unwrap();

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(fast.delivered(), vec!["Entry 0"]);
        assert!(slow.delivered().is_empty());

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(slow.delivered(), vec!["Entry 0"]);
        // The rate-limited call did not count against the single attempt
        let record = store.deliveries.get(jobs[0].0, "slow").unwrap().unwrap();
        assert_eq!(record.status, DeliveryStatus::Delivered);
        assert_eq!(record.attempts, 1);
        assert_eq!(metrics.snapshot().deliveries_rate_limited, 1);

        drop(handle);
        while workers.join_next().await.is_some() {}
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_cooldown_is_capped_and_worker_survives() {
        let (store, jobs) = store_with_entries(2);
        let sink = ScriptedSink::new("feeds", vec![Err(SinkError::RateLimited(Duration::MAX))]);
        let metrics = Arc::new(Metrics::new());
        let cancel = CancellationToken::new();

        let (handle, mut workers) = start(
            vec![sink.clone() as Arc<dyn Sink>],
            store.clone(),
            metrics,
            settings(3),
            cancel.clone(),
        );
        handle.enqueue("feeds", job(&jobs[0]), &cancel).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        handle.enqueue("feeds", job(&jobs[1]), &cancel).await.unwrap();

        tokio::time::sleep(MAX_COOLDOWN + Duration::from_secs(5)).await;
        assert_eq!(sink.delivered(), vec!["Entry 0", "Entry 1"]);

        drop(handle);
        while let Some(joined) = workers.join_next().await {
            assert!(joined.is_ok());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_hiccup_does_not_drop_the_job() {
        let mut deliveries = MockDeliveryRepository::new();
        let mut lookups = 0;
        deliveries.expect_has_delivered().times(2).returning(move |_, _| {
            lookups += 1;
            if lookups == 1 {
                Err(FeederError::Timeout("store busy".to_string()))
            } else {
                Ok(false)
            }
        });
        let mut writes = 0;
        deliveries.expect_record_delivery().times(2).returning(move |record| {
            writes += 1;
            assert_eq!(record.status, DeliveryStatus::Delivered);
            if writes == 1 {
                Err(FeederError::Timeout("store busy".to_string()))
            } else {
                Ok(true)
            }
        });
        let storage = SqliteStorage::in_memory().unwrap();
        let store = Store::new(
            Arc::new(SqliteSourceRepository::new(storage.clone())),
            Arc::new(SqliteEntryRepository::new(storage)),
            Arc::new(deliveries),
            Duration::from_secs(60),
        );

        let entry = Entry::new(1, Some("1"), "Entry 0".to_string(), None, None);
        let sink = ScriptedSink::new("feeds", vec![]);
        let metrics = Arc::new(Metrics::new());
        let cancel = CancellationToken::new();
        let (handle, mut workers) = start(
            vec![sink.clone() as Arc<dyn Sink>],
            store,
            metrics.clone(),
            settings(3),
            cancel.clone(),
        );
        let job = DeliveryJob {
            entry_id: 1,
            notification: Notification::new("A", &entry),
        };
        handle.enqueue("feeds", job, &cancel).await.unwrap();
        drop(handle);
        while workers.join_next().await.is_some() {}

        assert_eq!(sink.delivered(), vec!["Entry 0"]);
        assert_eq!(metrics.snapshot().deliveries_succeeded, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_waiting_workers() {
        let (store, jobs) = store_with_entries(1);
        let sink = ScriptedSink::new(
            "feeds",
            vec![Err(SinkError::RateLimited(Duration::from_secs(3600)))],
        );
        let metrics = Arc::new(Metrics::new());
        let cancel = CancellationToken::new();

        let (handle, mut workers) = start(
            vec![sink.clone() as Arc<dyn Sink>],
            store.clone(),
            metrics,
            settings(3),
            cancel.clone(),
        );
        handle.enqueue("feeds", job(&jobs[0]), &cancel).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        cancel.cancel();
        while workers.join_next().await.is_some() {}

        // Nothing recorded, so the entry is still pending for recovery
        assert!(store.deliveries.get(jobs[0].0, "feeds").unwrap().is_none());
        assert_eq!(store.entries.undelivered_for_sink("feeds", 10).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_sink_is_rejected() {
        let (store, jobs) = store_with_entries(1);
        let cancel = CancellationToken::new();
        let (handle, _workers) = start(
            vec![],
            store,
            Arc::new(Metrics::new()),
            settings(1),
            cancel.clone(),
        );

        let result = handle.enqueue("nowhere", job(&jobs[0]), &cancel).await;
        assert!(matches!(result, Err(FeederError::Config(_))));
    }
}
