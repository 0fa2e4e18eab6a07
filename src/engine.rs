//! Engine facade: registration, enqueue and the delivery run loop.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{HookError, Result};
use crate::executor;
use crate::persister::{InMemoryPersister, Persister};
use crate::schema::{JsonSchemaValidator, SchemaValidator};
use crate::scheduler::{report, PollScheduler, Scheduler};
use crate::types::{HookConfiguration, HookDefinition, HookExecution, HookSchedule};

/// Shared context handed to every delivery worker.
struct WorkerContext {
    persister: Arc<dyn Persister>,
    http_client: reqwest::Client,
    error_tx: Option<mpsc::Sender<HookError>>,
    skip_interval: Duration,
    cancel: CancellationToken,
}

/// Builder for [`Engine`].
///
/// Every option has a default: in-memory persister, JSON Schema
/// validation enabled, a fresh `reqwest` client, 5 workers, a dispatch
/// buffer of 100, 10s polling and a 40s skip interval.
pub struct EngineBuilder {
    persister: Arc<dyn Persister>,
    schema_validator: Option<Arc<dyn SchemaValidator>>,
    http_client: reqwest::Client,
    workers_count: usize,
    schedule_buffer_size: usize,
    runner_interval: Duration,
    skip_interval: Duration,
    scheduler: Option<Arc<dyn Scheduler>>,
    error_tx: Option<mpsc::Sender<HookError>>,
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self {
            persister: Arc::new(InMemoryPersister::new()),
            schema_validator: Some(Arc::new(JsonSchemaValidator::new())),
            http_client: reqwest::Client::new(),
            workers_count: 5,
            schedule_buffer_size: 100,
            runner_interval: Duration::from_secs(10),
            skip_interval: Duration::from_secs(40),
            scheduler: None,
            error_tx: None,
        }
    }
}

impl EngineBuilder {
    /// Use a custom persister.
    pub fn persister(mut self, persister: Arc<dyn Persister>) -> Self {
        self.persister = persister;
        self
    }

    /// Replace the payload validator. `None` disables schema validation.
    pub fn schema_validator(mut self, validator: Option<Arc<dyn SchemaValidator>>) -> Self {
        self.schema_validator = validator;
        self
    }

    /// Use a custom outbound HTTP client. Must be safe for concurrent
    /// use; `reqwest::Client` is.
    pub fn http_client(mut self, client: reqwest::Client) -> Self {
        self.http_client = client;
        self
    }

    /// Number of delivery workers.
    pub fn workers_count(mut self, count: usize) -> Self {
        self.workers_count = count.max(1);
        self
    }

    /// Capacity of the dispatch channel between scheduler and workers.
    pub fn schedule_buffer_size(mut self, size: usize) -> Self {
        self.schedule_buffer_size = size.max(1);
        self
    }

    /// Polling cadence of the default scheduler.
    pub fn runner_interval(mut self, interval: Duration) -> Self {
        self.runner_interval = interval;
        self
    }

    /// Minimum wall-clock separation between two dispatches of the same
    /// schedule.
    pub fn skip_interval(mut self, interval: Duration) -> Self {
        self.skip_interval = interval;
        self
    }

    /// Replace the default polling scheduler. The implementation must
    /// eventually emit every due schedule at least once.
    pub fn scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Sink for asynchronous errors from the scheduler and workers.
    /// Without one, those errors are dropped. Sends block when the
    /// channel is full, so keep reading from the receiving end.
    pub fn error_channel(mut self, error_tx: mpsc::Sender<HookError>) -> Self {
        self.error_tx = Some(error_tx);
        self
    }

    pub fn build(self) -> Engine {
        let scheduler = self.scheduler.unwrap_or_else(|| {
            Arc::new(
                PollScheduler::new(self.persister.clone())
                    .with_runner_interval(self.runner_interval)
                    .with_skip_interval(self.skip_interval),
            )
        });

        Engine {
            persister: self.persister,
            schema_validator: self.schema_validator,
            http_client: self.http_client,
            workers_count: self.workers_count,
            schedule_buffer_size: self.schedule_buffer_size,
            skip_interval: self.skip_interval,
            scheduler,
            error_tx: self.error_tx,
        }
    }
}

/// The webhook dispatch engine.
///
/// Owns the scheduler and worker pool lifecycle and exposes the API
/// surface for registering hooks and enqueuing deliveries. Cheap to
/// share behind an `Arc`.
pub struct Engine {
    persister: Arc<dyn Persister>,
    schema_validator: Option<Arc<dyn SchemaValidator>>,
    http_client: reqwest::Client,
    workers_count: usize,
    schedule_buffer_size: usize,
    skip_interval: Duration,
    scheduler: Arc<dyn Scheduler>,
    error_tx: Option<mpsc::Sender<HookError>>,
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }

    /// Validate and persist definitions.
    pub async fn register_definitions(&self, definitions: &[HookDefinition]) -> Result<()> {
        for definition in definitions {
            definition.validate()?;
        }
        self.persister.write_definitions(definitions).await
    }

    /// Resolve each configuration's parent definition, validate and
    /// persist.
    pub async fn register_configurations(
        &self,
        configurations: Vec<HookConfiguration>,
    ) -> Result<()> {
        for mut configuration in configurations {
            let definition = self
                .persister
                .find_definition_by_id(&configuration.hook_definition_id)
                .await?;
            configuration.hook_definition = Some(definition);
            configuration.validate()?;
            self.persister.write_configuration(&configuration).await?;
        }
        Ok(())
    }

    /// Create a configuration under `definition_id`, generate its RSA
    /// key pair, persist and return it.
    pub async fn create_configuration_from_definition(
        &self,
        definition_id: &str,
        url: impl Into<String>,
        tag: impl Into<String>,
        client_secret: Option<String>,
    ) -> Result<HookConfiguration> {
        let definition = self.persister.find_definition_by_id(definition_id).await?;

        let mut configuration = definition.create_configuration(
            Uuid::new_v4().to_string(),
            url,
            tag,
            client_secret,
        )?;
        configuration.generate_private_key(false)?;

        self.persister.write_configuration(&configuration).await?;
        Ok(configuration)
    }

    /// Enqueue a delivery of `payload` for the `(definition_id, tag)`
    /// configuration.
    ///
    /// A caller-supplied `id` acts as an idempotency anchor: a second
    /// call with the same id fails with
    /// [`HookError::DuplicateSchedule`]. Without one, a UUID is minted.
    pub async fn schedule(
        &self,
        id: Option<String>,
        definition_id: &str,
        tag: &str,
        payload: Vec<u8>,
    ) -> Result<HookSchedule> {
        let configuration = self.persister.find_configuration(definition_id, tag).await?;

        let schedule_id = match id {
            Some(id) => match self.persister.find_schedule_by_id(&id).await {
                Ok(_) => return Err(HookError::duplicate_schedule(id)),
                Err(err) if err.is_not_found() => id,
                Err(err) => return Err(err),
            },
            None => Uuid::new_v4().to_string(),
        };

        let schedule = configuration.schedule(
            schedule_id,
            payload,
            self.schema_validator.as_deref(),
        )?;

        self.persister.write_schedule(&schedule, &[]).await?;
        debug!(schedule_id = %schedule.id, definition_id, tag, "schedule enqueued");
        Ok(schedule)
    }

    /// Like [`schedule`](Self::schedule) but with any `Serialize`
    /// payload.
    pub async fn schedule_json<T: Serialize>(
        &self,
        id: Option<String>,
        definition_id: &str,
        tag: &str,
        payload: &T,
    ) -> Result<HookSchedule> {
        let payload = serde_json::to_vec(payload)
            .map_err(|e| HookError::validation(format!("payload is not serializable: {e}")))?;
        self.schedule(id, definition_id, tag, payload).await
    }

    /// Like [`schedule`](Self::schedule), but a missing
    /// `(definition_id, tag)` configuration is a no-op success rather
    /// than an error.
    pub async fn try_schedule(
        &self,
        id: Option<String>,
        definition_id: &str,
        tag: &str,
        payload: Vec<u8>,
    ) -> Result<Option<HookSchedule>> {
        match self.persister.find_configuration(definition_id, tag).await {
            Ok(_) => {}
            Err(err) if err.is_not_found() => return Ok(None),
            Err(err) => return Err(err),
        }

        self.schedule(id, definition_id, tag, payload).await.map(Some)
    }

    /// [`try_schedule`](Self::try_schedule) with any `Serialize` payload.
    pub async fn try_schedule_json<T: Serialize>(
        &self,
        id: Option<String>,
        definition_id: &str,
        tag: &str,
        payload: &T,
    ) -> Result<Option<HookSchedule>> {
        let payload = serde_json::to_vec(payload)
            .map_err(|e| HookError::validation(format!("payload is not serializable: {e}")))?;
        self.try_schedule(id, definition_id, tag, payload).await
    }

    /// Enqueue and run one delivery attempt synchronously.
    pub async fn schedule_and_execute(
        &self,
        id: Option<String>,
        definition_id: &str,
        tag: &str,
        payload: Vec<u8>,
    ) -> Result<()> {
        let schedule = self.schedule(id, definition_id, tag, payload).await?;
        self.execute_once(&schedule.id).await
    }

    /// Run one delivery attempt for an existing schedule, regardless of
    /// its state. The only path that re-dispatches a terminal schedule.
    pub async fn retry_schedule_by_id(&self, schedule_id: &str) -> Result<()> {
        self.execute_once(schedule_id).await
    }

    pub async fn find_schedule_by_id(
        &self,
        schedule_id: &str,
    ) -> Result<(HookSchedule, Vec<HookExecution>)> {
        self.persister.find_schedule_by_id(schedule_id).await
    }

    pub async fn list_schedules_by_tag(&self, tag: &str) -> Result<Vec<HookSchedule>> {
        self.persister.list_schedules_by_tag(tag).await
    }

    pub async fn list_definitions(&self) -> Result<Vec<HookDefinition>> {
        self.persister.list_definitions().await
    }

    pub async fn list_configurations(&self) -> Result<Vec<HookConfiguration>> {
        self.persister.list_configurations().await
    }

    pub async fn list_configurations_by_tag(
        &self,
        tag: &str,
    ) -> Result<Vec<HookConfiguration>> {
        self.persister.list_configurations_by_tag(tag).await
    }

    /// Start the worker pool and the scheduler; block until `cancel`
    /// fires, then close the dispatch channel and drain the workers.
    ///
    /// In-flight HTTP requests observe the same token and abort
    /// mid-flight.
    pub async fn run(&self, cancel: CancellationToken) {
        let (schedule_tx, schedule_rx) = mpsc::channel(self.schedule_buffer_size);
        let schedule_rx = Arc::new(Mutex::new(schedule_rx));

        let ctx = Arc::new(WorkerContext {
            persister: self.persister.clone(),
            http_client: self.http_client.clone(),
            error_tx: self.error_tx.clone(),
            skip_interval: self.skip_interval,
            cancel: cancel.clone(),
        });

        info!(workers = self.workers_count, "starting hook dispatch engine");

        let mut worker_handles = Vec::with_capacity(self.workers_count);
        for worker_id in 0..self.workers_count {
            worker_handles.push(tokio::spawn(worker_loop(
                worker_id,
                schedule_rx.clone(),
                ctx.clone(),
            )));
        }

        self.scheduler
            .start(cancel, schedule_tx, self.error_tx.clone())
            .await;

        // The scheduler only returns on cancellation; its sender is gone
        // so the channel closes and workers drain out.
        for handle in worker_handles {
            let _ = handle.await;
        }

        info!("hook dispatch engine stopped");
    }

    /// Load, execute and persist a single attempt.
    async fn execute_once(&self, schedule_id: &str) -> Result<()> {
        let (mut schedule, _) = self.persister.find_schedule_by_id(schedule_id).await?;

        let execution = executor::execute(
            &mut schedule,
            Uuid::new_v4().to_string(),
            &self.http_client,
            &CancellationToken::new(),
        )
        .await?;

        self.persister
            .write_schedule(&schedule, std::slice::from_ref(&execution))
            .await
    }
}

/// Worker loop: pull schedules off the shared channel until it closes.
async fn worker_loop(
    worker_id: usize,
    schedule_rx: Arc<Mutex<mpsc::Receiver<HookSchedule>>>,
    ctx: Arc<WorkerContext>,
) {
    debug!(worker_id, "delivery worker starting");

    loop {
        let schedule = {
            let mut guard = schedule_rx.lock().await;
            guard.recv().await
        };

        let Some(schedule) = schedule else { break };

        if let Err(err) = deliver(&ctx, &schedule.id).await {
            report(&ctx.error_tx, err).await;
        }
    }

    debug!(worker_id, "delivery worker stopped");
}

/// Process one dispatched schedule.
///
/// The schedule is re-read by id so the attempt acts on current state,
/// not the snapshot the scheduler emitted. Duplicates still in the
/// channel from a previous tick are dropped here: terminal schedules
/// and schedules attempted within the skip window are skipped.
///
/// `updated_at` is persisted *before* the attempt. That mark is what
/// keeps the scheduler from re-emitting the schedule during a slow
/// first attempt (when `updated_at` would otherwise still be null) and
/// what delays the re-pick after a transport error.
async fn deliver(ctx: &WorkerContext, schedule_id: &str) -> Result<()> {
    let (mut schedule, _) = ctx.persister.find_schedule_by_id(schedule_id).await?;

    if schedule.status.is_terminal() {
        return Ok(());
    }

    let now = chrono::Utc::now();
    if let Some(updated_at) = schedule.updated_at {
        let skip = chrono::Duration::from_std(ctx.skip_interval)
            .unwrap_or_else(|_| chrono::Duration::seconds(40));
        if now.signed_duration_since(updated_at) < skip {
            return Ok(());
        }
    }

    schedule.updated_at = Some(now);
    ctx.persister.write_schedule(&schedule, &[]).await?;

    let execution = executor::execute(
        &mut schedule,
        Uuid::new_v4().to_string(),
        &ctx.http_client,
        &ctx.cancel,
    )
    .await?;

    ctx.persister
        .write_schedule(&schedule, std::slice::from_ref(&execution))
        .await
}
