//! The periodic job that re-reads every subscribed entity, stores what it
//! finds and tells subscribers about price changes.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures::FutureExt;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio::sync::{Mutex, Notify};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::Instrument;

use crate::entity::Entity;
use crate::error::{Result, TrackerError};
use crate::extract::Extractor;
use crate::notify::Notifier;
use crate::repository::EntityRepository;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub checked: usize,
    pub unchanged: usize,
    pub changed: usize,
    pub removed: usize,
    pub skipped: usize,
    /// Notices delivered, price changes and removals together.
    pub notified: usize,
    pub users_deleted: usize,
}

#[derive(Debug, Default, Clone, Copy)]
struct Delivery {
    notified: usize,
    users_deleted: usize,
}

#[derive(Debug, Clone, Copy)]
enum Outcome {
    Unchanged,
    Changed(Delivery),
    Removed(Delivery),
    Skipped,
}

impl ReconcileReport {
    fn absorb(&mut self, outcome: Outcome) {
        self.checked += 1;
        let delivery = match outcome {
            Outcome::Unchanged => {
                self.unchanged += 1;
                return;
            }
            Outcome::Skipped => {
                self.skipped += 1;
                return;
            }
            Outcome::Changed(d) => {
                self.changed += 1;
                d
            }
            Outcome::Removed(d) => {
                self.removed += 1;
                d
            }
        };
        self.notified += delivery.notified;
        self.users_deleted += delivery.users_deleted;
    }
}

pub struct Reconciler {
    repo: Arc<dyn EntityRepository>,
    extractor: Arc<Extractor>,
    notifier: Arc<dyn Notifier>,
    concurrency: usize,
    /// Held for the length of a run.
    running: Mutex<()>,
    wake: Notify,
}

impl Reconciler {
    pub fn new(
        repo: Arc<dyn EntityRepository>,
        extractor: Arc<Extractor>,
        notifier: Arc<dyn Notifier>,
        concurrency: usize,
    ) -> Self {
        Self {
            repo,
            extractor,
            notifier,
            concurrency: concurrency.max(1),
            running: Mutex::new(()),
            wake: Notify::new(),
        }
    }

    /// Asks the scheduler for a run outside the regular ticks.
    pub fn request_run(&self) {
        self.wake.notify_one();
    }

    /// Resolves once a run has been requested.
    pub async fn run_requested(&self) {
        self.wake.notified().await;
    }

    /// One pass over every entity with at least one subscriber. Failures and
    /// panics are contained per entity; only failing to list the entities
    /// aborts the run. A second caller while a run is going gets `RunInProgress`.
    pub async fn run_once(&self) -> Result<ReconcileReport> {
        let Ok(_running) = self.running.try_lock() else {
            tracing::warn!("reconciliation already running");
            return Err(TrackerError::RunInProgress);
        };

        let entities = self.repo.entities_with_subscribers().await?;
        tracing::debug!(count = entities.len(), "entities to check");

        let outcomes: Vec<Outcome> = stream::iter(entities)
            .map(|entity| {
                let key = entity.key();
                let span = tracing::info_span!("entity", kind = %entity.kind(), id = entity.id());
                AssertUnwindSafe(self.process(entity).instrument(span))
                    .catch_unwind()
                    .map(move |done| {
                        done.unwrap_or_else(|_| {
                            tracing::error!(entity = %key, "entity check panicked, skipped");
                            Outcome::Skipped
                        })
                    })
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut report = ReconcileReport::default();
        for outcome in outcomes {
            report.absorb(outcome);
        }
        tracing::info!(
            checked = report.checked,
            changed = report.changed,
            unchanged = report.unchanged,
            removed = report.removed,
            skipped = report.skipped,
            notified = report.notified,
            users_deleted = report.users_deleted,
            "reconciliation finished"
        );
        Ok(report)
    }

    async fn process(&self, entity: Entity) -> Outcome {
        match self.try_process(&entity).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(error = %e, "entity left as is after a failure");
                Outcome::Skipped
            }
        }
    }

    async fn try_process(&self, old: &Entity) -> Result<Outcome> {
        let key = old.key();
        let fresh = match self.extractor.fetch_and_build(old.url(), old.kind()).await {
            Ok(fresh) => fresh,
            Err(TrackerError::NotPublic) => return self.retire(old).await.map(Outcome::Removed),
            Err(e) if e.is_transient() => {
                tracing::warn!(error = %e, "skipping until the next run");
                return Ok(Outcome::Skipped);
            }
            Err(e) => return Err(e),
        };

        // Stored on every successful read so history has one point per run.
        self.repo.update_price(key, fresh.price()).await?;
        if fresh.name() != old.name() {
            tracing::info!(old = old.name(), new = fresh.name(), "name changed");
            self.repo.update_name(key, fresh.name()).await?;
        }

        if fresh.price() == old.price() {
            return Ok(Outcome::Unchanged);
        }

        tracing::info!(old = %old.price(), new = %fresh.price(), "price changed");
        let mut delivery = Delivery::default();
        for user_id in self.repo.subscribers(key).await? {
            let sent = self.notifier.notify(user_id, &fresh, old.price()).await;
            self.settle(user_id, sent, &mut delivery).await?;
        }
        Ok(Outcome::Changed(delivery))
    }

    /// The source went private: tell every subscriber, drop the edges, drop the entity.
    async fn retire(&self, old: &Entity) -> Result<Delivery> {
        let key = old.key();
        tracing::warn!("entity is no longer public, removing it");

        let mut delivery = Delivery::default();
        for user_id in self.repo.subscribers(key).await? {
            let sent = self.notifier.notify_removed(user_id, old).await;
            self.settle(user_id, sent, &mut delivery).await?;
            self.repo.unsubscribe(user_id, key).await?;
        }
        self.repo.remove_entity(key).await?;
        Ok(delivery)
    }

    async fn settle(&self, user_id: u64, sent: Result<()>, delivery: &mut Delivery) -> Result<()> {
        match sent {
            Ok(()) => delivery.notified += 1,
            Err(TrackerError::UserUnreachable(_)) => {
                tracing::info!(user_id, "subscriber unreachable, deleting user");
                self.repo.delete_user(user_id).await?;
                delivery.users_deleted += 1;
            }
            Err(e) => tracing::warn!(user_id, error = %e, "notification not delivered"),
        }
        Ok(())
    }
}

/// Time until the next multiple of `interval` since the epoch. Lands a full
/// interval ahead when `now` sits exactly on a boundary.
pub fn delay_until_next_boundary(now_unix: u64, interval: Duration) -> Duration {
    let step = interval.as_secs().max(1);
    Duration::from_secs(step - now_unix % step)
}

/// Runs the reconciler on wall-clock aligned ticks until told to stop.
pub struct Scheduler {
    reconciler: Arc<Reconciler>,
    interval: Duration,
}

impl Scheduler {
    pub fn new(reconciler: Arc<Reconciler>, interval: Duration) -> Self {
        Self {
            reconciler,
            interval,
        }
    }

    pub fn start(self, shutdown: Arc<Notify>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default();
            let first = delay_until_next_boundary(now, self.interval);
            tracing::info!(first_run_in = ?first, interval = ?self.interval, "scheduler started");

            let mut ticks = tokio::time::interval_at(Instant::now() + first, self.interval);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);

            let mut run = 0u64;
            loop {
                tokio::select! {
                    _ = shutdown.notified() => {
                        tracing::info!("scheduler received shutdown signal");
                        break;
                    }
                    _ = ticks.tick() => {
                        run += 1;
                        self.run(run, "tick").await;
                    }
                    _ = self.reconciler.run_requested() => {
                        run += 1;
                        self.run(run, "request").await;
                    }
                }
            }
        })
    }

    async fn run(&self, run: u64, trigger: &'static str) {
        let span = tracing::info_span!("reconcile", run, trigger);
        match self.reconciler.run_once().instrument(span).await {
            Ok(_) | Err(TrackerError::RunInProgress) => {}
            Err(e) => tracing::error!(run, error = %e, "reconciliation run failed"),
        }
    }
}
