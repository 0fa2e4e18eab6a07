//! Selection of due schedules.
//!
//! The default implementation polls the persister. Anything satisfying
//! the [`Scheduler`] contract — "every schedule in `scheduled` state
//! whose `updated_at` is null or older than the skip interval is
//! eventually emitted at least once" — can replace it through
//! [`EngineBuilder::scheduler`](crate::EngineBuilder::scheduler).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::HookError;
use crate::persister::Persister;
use crate::types::HookSchedule;

/// Emits due schedules on the engine's dispatch channel.
#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Run until `cancel` fires. Channel sends may block when the worker
    /// pool is saturated; that backpressure is intended.
    async fn start(
        &self,
        cancel: CancellationToken,
        schedule_tx: mpsc::Sender<HookSchedule>,
        error_tx: Option<mpsc::Sender<HookError>>,
    );
}

/// Default polling scheduler.
///
/// Every `runner_interval` it reads the due set and emits each schedule
/// whose `updated_at` is null or older than `skip_interval`. The skip
/// filter is what keeps a schedule from being dispatched again while an
/// attempt is still in flight or has just returned.
pub struct PollScheduler {
    persister: Arc<dyn Persister>,
    runner_interval: Duration,
    skip_interval: Duration,
}

impl PollScheduler {
    /// Create a scheduler with the default 10s poll / 40s skip intervals.
    pub fn new(persister: Arc<dyn Persister>) -> Self {
        Self {
            persister,
            runner_interval: Duration::from_secs(10),
            skip_interval: Duration::from_secs(40),
        }
    }

    /// Set the polling cadence.
    pub fn with_runner_interval(mut self, runner_interval: Duration) -> Self {
        self.runner_interval = runner_interval;
        self
    }

    /// Set the minimum time since the last attempt before a schedule is
    /// re-picked.
    pub fn with_skip_interval(mut self, skip_interval: Duration) -> Self {
        self.skip_interval = skip_interval;
        self
    }
}

#[async_trait]
impl Scheduler for PollScheduler {
    async fn start(
        &self,
        cancel: CancellationToken,
        schedule_tx: mpsc::Sender<HookSchedule>,
        error_tx: Option<mpsc::Sender<HookError>>,
    ) {
        let skip = chrono::Duration::from_std(self.skip_interval)
            .unwrap_or_else(|_| chrono::Duration::seconds(40));

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(self.runner_interval) => {}
            }

            let now = chrono::Utc::now();
            let due = match self.persister.find_due_schedules().await {
                Ok(due) => due,
                Err(err) => {
                    report(&error_tx, err).await;
                    continue;
                }
            };

            for schedule in due {
                if let Some(updated_at) = schedule.updated_at {
                    if now.signed_duration_since(updated_at) < skip {
                        continue;
                    }
                }

                debug!(schedule_id = %schedule.id, "emitting due schedule");
                if schedule_tx.send(schedule).await.is_err() {
                    // Channel closed: the engine is shutting down.
                    return;
                }
            }
        }
    }
}

pub(crate) async fn report(error_tx: &Option<mpsc::Sender<HookError>>, err: HookError) {
    if let Some(tx) = error_tx {
        let _ = tx.send(err).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persister::InMemoryPersister;
    use crate::types::{HookDefinition, HttpMethod};

    async fn seeded_persister() -> Arc<InMemoryPersister> {
        let persister = Arc::new(InMemoryPersister::new());
        let definition = HookDefinition::new("on_created", "on created", HttpMethod::Post, 3);
        persister
            .write_definitions(std::slice::from_ref(&definition))
            .await
            .unwrap();
        let configuration = definition
            .create_configuration("cfg-1", "http://example.com/hook", "global", None)
            .unwrap();
        persister.write_configuration(&configuration).await.unwrap();

        let schedule = configuration.schedule("sched-1", b"{}".to_vec(), None).unwrap();
        persister.write_schedule(&schedule, &[]).await.unwrap();
        persister
    }

    #[tokio::test]
    async fn emits_schedule_with_null_updated_at() {
        let persister = seeded_persister().await;
        let scheduler = PollScheduler::new(persister.clone())
            .with_runner_interval(Duration::from_millis(20))
            .with_skip_interval(Duration::from_secs(40));

        let (tx, mut rx) = mpsc::channel(10);
        let cancel = CancellationToken::new();

        let handle = {
            let cancel = cancel.clone();
            tokio::spawn(async move { scheduler.start(cancel, tx, None).await })
        };

        let emitted = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("scheduler should emit within a second")
            .expect("channel open");
        assert_eq!(emitted.id, "sched-1");

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn skips_recently_attempted_schedule() {
        let persister = seeded_persister().await;

        // Mark the schedule as just-attempted.
        let (mut schedule, _) = persister.find_schedule_by_id("sched-1").await.unwrap();
        schedule.updated_at = Some(chrono::Utc::now());
        persister.write_schedule(&schedule, &[]).await.unwrap();

        let scheduler = PollScheduler::new(persister.clone())
            .with_runner_interval(Duration::from_millis(20))
            .with_skip_interval(Duration::from_secs(40));

        let (tx, mut rx) = mpsc::channel(10);
        let cancel = CancellationToken::new();

        let handle = {
            let cancel = cancel.clone();
            tokio::spawn(async move { scheduler.start(cancel, tx, None).await })
        };

        let emitted = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
        assert!(emitted.is_err(), "schedule inside the skip window must not be emitted");

        cancel.cancel();
        handle.await.unwrap();
    }
}
