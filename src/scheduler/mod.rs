//! Periodic polling of enabled sources.
//!
//! Each tick reloads the enabled sources from the store, so sources added,
//! removed or re-enabled from the CLI are picked up without a restart. A
//! source becomes due at its last attempt plus its interval plus a random
//! jitter. Due polls run as tasks in a `JoinSet`, bounded by a FIFO
//! semaphore, and a source is never polled twice at once.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::QuietWindow;
use crate::domain::{FeedSource, MAX_POLL_INTERVAL_SECS};
use crate::errors::FeederResult;
use crate::storage::Store;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    NotModified,
    Updated { new_entries: usize, skipped: usize },
    Failed { failures: u32, disabled: bool },
    Cancelled,
}

/// One poll cycle for one source
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SourcePoller: Send + Sync {
    async fn poll(&self, source: FeedSource, cancel: CancellationToken) -> FeederResult<PollOutcome>;
}

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub default_interval: Duration,
    pub max_jitter: Duration,
    pub workers: usize,
    pub shutdown_grace: Duration,
    pub quiet_window: Option<QuietWindow>,
    /// How often due sources are checked
    pub tick: Duration,
}

impl SchedulerSettings {
    pub fn new(default_interval: Duration, workers: usize) -> Self {
        Self {
            default_interval,
            max_jitter: Duration::ZERO,
            workers,
            shutdown_grace: Duration::from_secs(10),
            quiet_window: None,
            tick: Duration::from_secs(1),
        }
    }
}

/// Removes the source from the in-flight set when the poll task ends,
/// including by panic or abort.
struct InFlightGuard {
    in_flight: Arc<Mutex<HashSet<i64>>>,
    source_id: i64,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut set = match self.in_flight.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        set.remove(&self.source_id);
    }
}

pub struct Scheduler {
    store: Store,
    poller: Arc<dyn SourcePoller>,
    settings: SchedulerSettings,
    semaphore: Arc<Semaphore>,
    in_flight: Arc<Mutex<HashSet<i64>>>,
}

impl Scheduler {
    pub fn new(store: Store, poller: Arc<dyn SourcePoller>, settings: SchedulerSettings) -> Self {
        let semaphore = Arc::new(Semaphore::new(settings.workers.max(1)));
        Self {
            store,
            poller,
            settings,
            semaphore,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Poll until `cancel` fires, then give in-flight polls the shutdown
    /// grace period before aborting them.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            workers = self.settings.workers,
            interval = ?self.settings.default_interval,
            "Scheduler started"
        );

        let mut tasks = JoinSet::new();
        let mut next_due: HashMap<i64, Instant> = HashMap::new();
        let mut ticker = tokio::time::interval(self.settings.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut was_quiet = false;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            error!(error = %e, "Poll task panicked");
                        }
                    }
                }
                _ = ticker.tick() => {
                    let quiet = self.in_quiet_window();
                    if quiet != was_quiet {
                        info!(quiet, "Quiet window changed");
                        was_quiet = quiet;
                    }
                    if !quiet {
                        self.start_due(&mut tasks, &mut next_due, &cancel).await;
                    }
                }
            }
        }

        self.shutdown(tasks).await;
        info!("Scheduler stopped");
    }

    /// Poll every enabled source once and wait for all of them
    pub async fn run_once(&self, cancel: CancellationToken) -> FeederResult<usize> {
        let sources = self
            .store
            .run("list_enabled", |s| s.sources.list_enabled())
            .await?;
        let count = sources.len();

        let mut tasks = JoinSet::new();
        for source in sources {
            self.spawn_poll(&mut tasks, source, &cancel);
        }
        while tasks.join_next().await.is_some() {}

        Ok(count)
    }

    fn in_quiet_window(&self) -> bool {
        self.settings
            .quiet_window
            .map(|window| window.contains(Utc::now().time()))
            .unwrap_or(false)
    }

    async fn start_due(
        &self,
        tasks: &mut JoinSet<()>,
        next_due: &mut HashMap<i64, Instant>,
        cancel: &CancellationToken,
    ) {
        let sources = match self
            .store
            .run("list_enabled", |s| s.sources.list_enabled())
            .await
        {
            Ok(sources) => sources,
            Err(e) => {
                error!(error = %e, "Failed to load sources");
                return;
            }
        };

        // Forget removed sources so a re-enable starts a fresh schedule
        let enabled: HashSet<i64> = sources.iter().map(|s| s.id).collect();
        next_due.retain(|id, _| enabled.contains(id));

        let now = Instant::now();
        for source in sources {
            let interval = source.poll_interval(self.settings.default_interval);
            let due = *next_due
                .entry(source.id)
                .or_insert_with(|| self.first_due(&source, interval, now));
            if due > now || self.is_in_flight(source.id) {
                continue;
            }

            next_due.insert(source.id, due_after(now, interval + self.jitter()));
            self.spawn_poll(tasks, source, cancel);
        }
    }

    /// A source polled recently by an earlier run waits out the rest of its
    /// interval; a new one is due after jitter alone.
    fn first_due(&self, source: &FeedSource, interval: Duration, now: Instant) -> Instant {
        let remaining = source
            .last_fetched_at
            .and_then(|last| {
                let elapsed = (Utc::now() - last).to_std().ok()?;
                interval.checked_sub(elapsed)
            })
            .unwrap_or(Duration::ZERO);
        due_after(now, remaining + self.jitter())
    }

    fn jitter(&self) -> Duration {
        let max = self
            .settings
            .max_jitter
            .min(Duration::from_secs(MAX_POLL_INTERVAL_SECS))
            .as_millis() as u64;
        if max == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=max))
    }

    fn is_in_flight(&self, source_id: i64) -> bool {
        match self.in_flight.lock() {
            Ok(set) => set.contains(&source_id),
            Err(poisoned) => poisoned.into_inner().contains(&source_id),
        }
    }

    fn spawn_poll(&self, tasks: &mut JoinSet<()>, source: FeedSource, cancel: &CancellationToken) {
        {
            let mut set = match self.in_flight.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if !set.insert(source.id) {
                return;
            }
        }
        let guard = InFlightGuard {
            in_flight: self.in_flight.clone(),
            source_id: source.id,
        };

        let semaphore = self.semaphore.clone();
        let poller = self.poller.clone();
        let cancel = cancel.clone();
        let span = info_span!("poll", source_id = source.id);

        tasks.spawn(
            async move {
                let _guard = guard;
                let _permit = tokio::select! {
                    _ = cancel.cancelled() => return,
                    permit = semaphore.acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => return,
                    },
                };

                match poller.poll(source, cancel).await {
                    Ok(outcome) => debug!(?outcome, "Poll finished"),
                    Err(e) => error!(error = %e, "Poll aborted"),
                }
            }
            .instrument(span),
        );
    }

    async fn shutdown(&self, mut tasks: JoinSet<()>) {
        if tasks.is_empty() {
            return;
        }

        info!(in_flight = tasks.len(), "Waiting for in-flight polls");
        let drained = tokio::time::timeout(self.settings.shutdown_grace, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            warn!(
                remaining = tasks.len(),
                "Shutdown grace expired, aborting polls"
            );
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }
    }
}

/// `now + delay`, with the delay capped at twice the longest poll interval
fn due_after(now: Instant, delay: Duration) -> Instant {
    let cap = Duration::from_secs(2 * MAX_POLL_INTERVAL_SECS);
    now.checked_add(delay.min(cap)).unwrap_or(now)
}
