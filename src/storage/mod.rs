pub mod sqlite;
pub mod traits;

use std::sync::Arc;
use std::time::Duration;

pub use sqlite::{
    SqliteDeliveryRepository, SqliteEntryRepository, SqliteSourceRepository, SqliteStorage,
};
pub use traits::{DeliveryRepository, EntryRepository, PendingEntry, SourceRepository};

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::dispatch::RetryPolicy;
use crate::errors::{FeederError, FeederResult};

/// The three repositories behind one handle, plus an async bridge that runs
/// blocking repository calls off the runtime with a deadline.
#[derive(Clone)]
pub struct Store {
    pub sources: Arc<dyn SourceRepository>,
    pub entries: Arc<dyn EntryRepository>,
    pub deliveries: Arc<dyn DeliveryRepository>,
    timeout: Duration,
}

impl Store {
    pub fn new(
        sources: Arc<dyn SourceRepository>,
        entries: Arc<dyn EntryRepository>,
        deliveries: Arc<dyn DeliveryRepository>,
        timeout: Duration,
    ) -> Self {
        Self {
            sources,
            entries,
            deliveries,
            timeout,
        }
    }

    pub fn sqlite(storage: SqliteStorage, timeout: Duration) -> Self {
        Self::new(
            Arc::new(SqliteSourceRepository::new(storage.clone())),
            Arc::new(SqliteEntryRepository::new(storage.clone())),
            Arc::new(SqliteDeliveryRepository::new(storage)),
            timeout,
        )
    }

    /// Run `f` on the blocking pool. Past the deadline the caller gets
    /// `Timeout`; the statement itself still runs to completion, so a
    /// transaction either fully lands or fully rolls back.
    pub async fn run<T, F>(&self, operation: &'static str, f: F) -> FeederResult<T>
    where
        F: FnOnce(&Store) -> FeederResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.clone();
        let task = tokio::task::spawn_blocking(move || f(&store));

        match tokio::time::timeout(self.timeout, task).await {
            Ok(joined) => joined?,
            Err(_) => Err(FeederError::Timeout(format!(
                "store {} exceeded {:?}",
                operation, self.timeout
            ))),
        }
    }

    /// `run`, repeated with the policy's backoff while it fails. Gives up
    /// with the last error once `policy.max_attempts` calls have failed, or
    /// with `Cancelled` if `cancel` fires while waiting.
    pub async fn run_retrying<T, F>(
        &self,
        operation: &'static str,
        policy: RetryPolicy,
        cancel: &CancellationToken,
        f: F,
    ) -> FeederResult<T>
    where
        F: Fn(&Store) -> FeederResult<T> + Clone + Send + 'static,
        T: Send + 'static,
    {
        let mut failures = 0;
        loop {
            let err = match self.run(operation, f.clone()).await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            failures += 1;
            if failures >= policy.max_attempts {
                return Err(err);
            }
            let delay = policy.delay(failures);
            warn!(operation, failures, error = %err, ?delay, "Store call failed, retrying");
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(FeederError::Cancelled(format!("store {}", operation)));
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::NewFeedSource;
    use crate::storage::traits::{
        MockDeliveryRepository, MockEntryRepository, MockSourceRepository,
    };

    #[tokio::test]
    async fn test_run_returns_result() {
        let store = Store::sqlite(SqliteStorage::in_memory().unwrap(), Duration::from_secs(5));

        let id = store
            .run("add source", |s| {
                s.sources
                    .add(&NewFeedSource::new("https://a.com/feed", "A"))
            })
            .await
            .unwrap();

        let source = store
            .run("get source", move |s| s.sources.get_by_id(id))
            .await
            .unwrap();
        assert_eq!(source.unwrap().title, "A");
    }

    #[tokio::test]
    async fn test_run_times_out() {
        let mut sources = MockSourceRepository::new();
        sources.expect_get_all().returning(|| {
            std::thread::sleep(Duration::from_millis(500));
            Ok(Vec::new())
        });

        let store = Store::new(
            Arc::new(sources),
            Arc::new(MockEntryRepository::new()),
            Arc::new(MockDeliveryRepository::new()),
            Duration::from_millis(50),
        );

        let result = store.run("list sources", |s| s.sources.get_all()).await;
        assert!(matches!(result, Err(FeederError::Timeout(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_retrying_recovers_from_one_failure() {
        let mut deliveries = MockDeliveryRepository::new();
        let mut calls = 0;
        deliveries.expect_has_delivered().times(2).returning(move |_, _| {
            calls += 1;
            if calls == 1 {
                Err(FeederError::Timeout("busy".to_string()))
            } else {
                Ok(true)
            }
        });
        let store = Store::new(
            Arc::new(MockSourceRepository::new()),
            Arc::new(MockEntryRepository::new()),
            Arc::new(deliveries),
            Duration::from_secs(5),
        );

        let delivered = store
            .run_retrying("has_delivered", RetryPolicy::new(3), &CancellationToken::new(), |s| {
                s.deliveries.has_delivered(1, "feeds")
            })
            .await
            .unwrap();
        assert!(delivered);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_retrying_gives_up() {
        let store = Store::sqlite(SqliteStorage::in_memory().unwrap(), Duration::from_secs(5));
        let result = store
            .run_retrying("disable", RetryPolicy::new(2), &CancellationToken::new(), |s| {
                s.sources.set_disabled(7, true)
            })
            .await;
        assert!(matches!(result, Err(FeederError::SourceNotFound(_))));
    }

    #[tokio::test]
    async fn test_run_propagates_errors() {
        let store = Store::sqlite(SqliteStorage::in_memory().unwrap(), Duration::from_secs(5));
        let result = store.run("disable", |s| s.sources.set_disabled(7, true)).await;
        assert!(matches!(result, Err(FeederError::SourceNotFound(_))));
    }
}
