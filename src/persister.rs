//! Durable state for definitions, configurations, schedules and
//! executions.
//!
//! The engine treats persistence as a capability set behind the
//! [`Persister`] trait. Persisted rows store foreign keys only; the
//! resolved parent handles on [`HookConfiguration`] and [`HookSchedule`]
//! are rehydrated on read.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::{HookError, Result};
use crate::types::{HookConfiguration, HookDefinition, HookExecution, HookSchedule};

/// Durable store used by the engine.
///
/// Any store error propagates as [`HookError::Persistence`];
/// [`HookError::NotFound`] is the distinct lookup-miss condition that
/// `try_schedule` recognizes.
#[async_trait]
pub trait Persister: Send + Sync {
    /// Upsert definitions by id.
    async fn write_definitions(&self, definitions: &[HookDefinition]) -> Result<()>;

    async fn find_definition_by_id(&self, id: &str) -> Result<HookDefinition>;

    async fn list_definitions(&self) -> Result<Vec<HookDefinition>>;

    /// Upsert a configuration by id.
    async fn write_configuration(&self, configuration: &HookConfiguration) -> Result<()>;

    /// The unique configuration for `(definition_id, tag)`, with its
    /// definition resolved.
    async fn find_configuration(
        &self,
        definition_id: &str,
        tag: &str,
    ) -> Result<HookConfiguration>;

    async fn list_configurations(&self) -> Result<Vec<HookConfiguration>>;

    async fn list_configurations_by_tag(&self, tag: &str) -> Result<Vec<HookConfiguration>>;

    /// Upsert the schedule and append `executions` atomically. On
    /// conflict the mutable columns (`status`, `current_attempt`,
    /// `updated_at`) are updated.
    async fn write_schedule(
        &self,
        schedule: &HookSchedule,
        executions: &[HookExecution],
    ) -> Result<()>;

    /// The schedule and its execution history, with configuration and
    /// definition resolved.
    async fn find_schedule_by_id(&self, id: &str)
        -> Result<(HookSchedule, Vec<HookExecution>)>;

    async fn list_schedules_by_tag(&self, tag: &str) -> Result<Vec<HookSchedule>>;

    /// Every schedule currently in `scheduled` status. The skip-interval
    /// filter is the scheduler's job, not the persister's.
    async fn find_due_schedules(&self) -> Result<Vec<HookSchedule>>;
}

#[derive(Default)]
struct State {
    definitions: HashMap<String, HookDefinition>,
    configurations: HashMap<String, HookConfiguration>,
    schedules: HashMap<String, HookSchedule>,
    executions: HashMap<String, Vec<HookExecution>>,
}

/// In-memory persister for tests and lightweight embeddings.
///
/// All four maps live behind a single mutex; every operation is fully
/// serialized. Nothing survives a restart.
#[derive(Default)]
pub struct InMemoryPersister {
    state: Mutex<State>,
}

impl InMemoryPersister {
    pub fn new() -> Self {
        Self::default()
    }
}

impl State {
    /// Attach the resolved definition to a stored configuration.
    fn resolve_configuration(&self, configuration: &HookConfiguration) -> HookConfiguration {
        let mut configuration = configuration.clone();
        configuration.hook_definition =
            self.definitions.get(&configuration.hook_definition_id).cloned();
        configuration
    }

    /// Attach the resolved configuration (definition included) to a
    /// stored schedule.
    fn resolve_schedule(&self, schedule: &HookSchedule) -> HookSchedule {
        let mut schedule = schedule.clone();
        schedule.hook_configuration = self
            .configurations
            .get(&schedule.hook_configuration_id)
            .map(|c| self.resolve_configuration(c));
        schedule
    }

    fn lock_err() -> HookError {
        HookError::persistence("in-memory state lock poisoned")
    }
}

#[async_trait]
impl Persister for InMemoryPersister {
    async fn write_definitions(&self, definitions: &[HookDefinition]) -> Result<()> {
        let mut state = self.state.lock().map_err(|_| State::lock_err())?;
        for definition in definitions {
            state.definitions.insert(definition.id.clone(), definition.clone());
        }
        Ok(())
    }

    async fn find_definition_by_id(&self, id: &str) -> Result<HookDefinition> {
        let state = self.state.lock().map_err(|_| State::lock_err())?;
        state.definitions.get(id).cloned().ok_or(HookError::NotFound)
    }

    async fn list_definitions(&self) -> Result<Vec<HookDefinition>> {
        let state = self.state.lock().map_err(|_| State::lock_err())?;
        Ok(state.definitions.values().cloned().collect())
    }

    async fn write_configuration(&self, configuration: &HookConfiguration) -> Result<()> {
        let mut state = self.state.lock().map_err(|_| State::lock_err())?;
        // Persisted form keeps foreign keys only.
        let mut stored = configuration.clone();
        stored.hook_definition = None;
        state.configurations.insert(stored.id.clone(), stored);
        Ok(())
    }

    async fn find_configuration(
        &self,
        definition_id: &str,
        tag: &str,
    ) -> Result<HookConfiguration> {
        let state = self.state.lock().map_err(|_| State::lock_err())?;
        state
            .configurations
            .values()
            .find(|c| c.hook_definition_id == definition_id && c.tag == tag)
            .map(|c| state.resolve_configuration(c))
            .ok_or(HookError::NotFound)
    }

    async fn list_configurations(&self) -> Result<Vec<HookConfiguration>> {
        let state = self.state.lock().map_err(|_| State::lock_err())?;
        Ok(state
            .configurations
            .values()
            .map(|c| state.resolve_configuration(c))
            .collect())
    }

    async fn list_configurations_by_tag(&self, tag: &str) -> Result<Vec<HookConfiguration>> {
        let state = self.state.lock().map_err(|_| State::lock_err())?;
        Ok(state
            .configurations
            .values()
            .filter(|c| c.tag == tag)
            .map(|c| state.resolve_configuration(c))
            .collect())
    }

    async fn write_schedule(
        &self,
        schedule: &HookSchedule,
        executions: &[HookExecution],
    ) -> Result<()> {
        let mut state = self.state.lock().map_err(|_| State::lock_err())?;
        let mut stored = schedule.clone();
        stored.hook_configuration = None;
        state.schedules.insert(stored.id.clone(), stored);
        state
            .executions
            .entry(schedule.id.clone())
            .or_default()
            .extend_from_slice(executions);
        Ok(())
    }

    async fn find_schedule_by_id(
        &self,
        id: &str,
    ) -> Result<(HookSchedule, Vec<HookExecution>)> {
        let state = self.state.lock().map_err(|_| State::lock_err())?;
        let schedule = state.schedules.get(id).ok_or(HookError::NotFound)?;
        let executions = state.executions.get(id).cloned().unwrap_or_default();
        Ok((state.resolve_schedule(schedule), executions))
    }

    async fn list_schedules_by_tag(&self, tag: &str) -> Result<Vec<HookSchedule>> {
        let state = self.state.lock().map_err(|_| State::lock_err())?;
        Ok(state
            .schedules
            .values()
            .filter(|s| {
                state
                    .configurations
                    .get(&s.hook_configuration_id)
                    .is_some_and(|c| c.tag == tag)
            })
            .map(|s| state.resolve_schedule(s))
            .collect())
    }

    async fn find_due_schedules(&self) -> Result<Vec<HookSchedule>> {
        let state = self.state.lock().map_err(|_| State::lock_err())?;
        Ok(state
            .schedules
            .values()
            .filter(|s| s.status == crate::types::ScheduleStatus::Scheduled)
            .map(|s| state.resolve_schedule(s))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::types::{HttpMethod, ScheduleStatus};

    fn seeded() -> InMemoryPersister {
        InMemoryPersister::new()
    }

    fn definition() -> HookDefinition {
        HookDefinition::new("on_created", "on created", HttpMethod::Post, 3)
    }

    async fn seed_configuration(persister: &InMemoryPersister) -> HookConfiguration {
        let definition = definition();
        persister
            .write_definitions(std::slice::from_ref(&definition))
            .await
            .expect("write definition");

        let configuration = definition
            .create_configuration("cfg-1", "http://example.com/hook", "global", None)
            .expect("configuration");
        persister
            .write_configuration(&configuration)
            .await
            .expect("write configuration");
        configuration
    }

    #[tokio::test]
    async fn missing_definition_is_not_found() {
        let err = seeded().find_definition_by_id("nope").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn definitions_upsert_by_id() {
        let persister = seeded();
        let mut def = definition();
        persister.write_definitions(std::slice::from_ref(&def)).await.unwrap();

        def.total_attempts = 7;
        persister.write_definitions(std::slice::from_ref(&def)).await.unwrap();

        let stored = persister.find_definition_by_id("on_created").await.unwrap();
        assert_eq!(stored.total_attempts, 7);
        assert_eq!(persister.list_definitions().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn configuration_lookup_resolves_definition() {
        let persister = seeded();
        seed_configuration(&persister).await;

        let found = persister.find_configuration("on_created", "global").await.unwrap();
        assert_eq!(found.id, "cfg-1");
        assert!(found.hook_definition.is_some(), "definition must be rehydrated");

        let err = persister.find_configuration("on_created", "other").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn schedule_write_appends_executions() {
        let persister = seeded();
        let configuration = seed_configuration(&persister).await;

        let mut schedule = configuration
            .schedule("sched-1", b"{}".to_vec(), None)
            .expect("schedule");
        persister.write_schedule(&schedule, &[]).await.unwrap();

        schedule.record_attempt(500);
        let execution = HookExecution {
            id: "exec-1".to_string(),
            hook_schedule_id: "sched-1".to_string(),
            response_status: 500,
            response_payload: b"oops".to_vec(),
            request_payload: None,
            created_at: Utc::now(),
        };
        persister
            .write_schedule(&schedule, std::slice::from_ref(&execution))
            .await
            .unwrap();

        let (stored, executions) = persister.find_schedule_by_id("sched-1").await.unwrap();
        assert_eq!(stored.current_attempt, 1);
        assert_eq!(executions.len(), 1);
        assert!(stored.hook_configuration.is_some(), "configuration must be rehydrated");
        assert!(
            stored
                .hook_configuration
                .as_ref()
                .and_then(|c| c.hook_definition.as_ref())
                .is_some(),
            "definition must be rehydrated through the configuration"
        );
    }

    #[tokio::test]
    async fn due_set_is_scheduled_only() {
        let persister = seeded();
        let configuration = seed_configuration(&persister).await;

        let mut executed = configuration.schedule("done", b"{}".to_vec(), None).unwrap();
        executed.record_attempt(200);
        persister.write_schedule(&executed, &[]).await.unwrap();

        let pending = configuration.schedule("pending", b"{}".to_vec(), None).unwrap();
        persister.write_schedule(&pending, &[]).await.unwrap();

        let due = persister.find_due_schedules().await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, "pending");
        assert_eq!(due[0].status, ScheduleStatus::Scheduled);
    }

    #[tokio::test]
    async fn schedules_filter_by_configuration_tag() {
        let persister = seeded();
        let configuration = seed_configuration(&persister).await;

        let schedule = configuration.schedule("sched-1", b"{}".to_vec(), None).unwrap();
        persister.write_schedule(&schedule, &[]).await.unwrap();

        assert_eq!(persister.list_schedules_by_tag("global").await.unwrap().len(), 1);
        assert!(persister.list_schedules_by_tag("other").await.unwrap().is_empty());
    }
}
