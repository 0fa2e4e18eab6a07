//! Relational persister backed by `tokio-postgres`.
//!
//! Four tables keyed by `id`; writes are `ON CONFLICT (id) DO UPDATE`
//! upserts on the mutable columns. Schedule upserts and execution
//! appends share one transaction.

use std::str::FromStr;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_postgres::{Client, Row};

use crate::error::{HookError, Result};
use crate::persister::Persister;
use crate::types::{
    HookConfiguration, HookDefinition, HookExecution, HookSchedule, HttpMethod,
    ScheduleStatus,
};

/// Postgres-backed persister.
///
/// The client sits behind a mutex so schedule writes can run in a
/// transaction; connection pooling belongs to the caller.
pub struct PostgresPersister {
    client: Mutex<Client>,
}

impl PostgresPersister {
    /// Wrap a connected client, creating the schema if missing.
    pub async fn new(client: Client) -> Result<Self> {
        client
            .batch_execute(
                "CREATE TABLE IF NOT EXISTS hook_definitions (
                    id TEXT PRIMARY KEY,
                    name TEXT NOT NULL DEFAULT '',
                    description TEXT NOT NULL DEFAULT '',
                    payload_scheme JSONB,
                    http_request_method TEXT NOT NULL,
                    total_attempts INT NOT NULL,
                    hide_execution_metadata BOOL NOT NULL DEFAULT FALSE
                );
                CREATE TABLE IF NOT EXISTS hook_configurations (
                    id TEXT PRIMARY KEY,
                    hook_definition_id TEXT NOT NULL,
                    tag TEXT NOT NULL,
                    url TEXT NOT NULL,
                    client_secret TEXT,
                    client_rsa_private_key TEXT,
                    created_at TIMESTAMPTZ NOT NULL
                );
                CREATE TABLE IF NOT EXISTS hook_schedules (
                    id TEXT PRIMARY KEY,
                    hook_configuration_id TEXT NOT NULL,
                    http_request_method TEXT NOT NULL,
                    url TEXT NOT NULL,
                    payload BYTEA NOT NULL,
                    status TEXT NOT NULL,
                    max_attempt INT NOT NULL,
                    current_attempt INT NOT NULL,
                    hide_execution_metadata BOOL NOT NULL DEFAULT FALSE,
                    created_at TIMESTAMPTZ NOT NULL,
                    updated_at TIMESTAMPTZ
                );
                CREATE TABLE IF NOT EXISTS hook_executions (
                    id TEXT PRIMARY KEY,
                    hook_schedule_id TEXT NOT NULL,
                    response_status INT NOT NULL,
                    response_payload BYTEA NOT NULL,
                    request_payload BYTEA,
                    created_at TIMESTAMPTZ NOT NULL
                );",
            )
            .await
            .map_err(db_err)?;

        Ok(Self { client: Mutex::new(client) })
    }

    async fn configuration_by_id(
        &self,
        client: &Client,
        id: &str,
    ) -> Result<HookConfiguration> {
        let row = client
            .query_opt("SELECT * FROM hook_configurations WHERE id = $1", &[&id])
            .await
            .map_err(db_err)?
            .ok_or(HookError::NotFound)?;

        let mut configuration = configuration_from_row(&row)?;
        configuration.hook_definition =
            Some(self.definition_by_id(client, &configuration.hook_definition_id).await?);
        Ok(configuration)
    }

    async fn definition_by_id(&self, client: &Client, id: &str) -> Result<HookDefinition> {
        let row = client
            .query_opt("SELECT * FROM hook_definitions WHERE id = $1", &[&id])
            .await
            .map_err(db_err)?
            .ok_or(HookError::NotFound)?;

        definition_from_row(&row)
    }
}

#[async_trait]
impl Persister for PostgresPersister {
    async fn write_definitions(&self, definitions: &[HookDefinition]) -> Result<()> {
        let mut client = self.client.lock().await;
        let tx = client.transaction().await.map_err(db_err)?;

        for definition in definitions {
            tx.execute(
                "INSERT INTO hook_definitions
                    (id, name, description, payload_scheme, http_request_method,
                     total_attempts, hide_execution_metadata)
                 VALUES ($1, $2, $3, $4, $5, $6, $7)
                 ON CONFLICT (id) DO UPDATE SET
                    name = excluded.name,
                    description = excluded.description,
                    payload_scheme = excluded.payload_scheme,
                    http_request_method = excluded.http_request_method,
                    total_attempts = excluded.total_attempts,
                    hide_execution_metadata = excluded.hide_execution_metadata",
                &[
                    &definition.id,
                    &definition.name,
                    &definition.description,
                    &definition.payload_scheme,
                    &definition.http_request_method.as_str(),
                    &(definition.total_attempts as i32),
                    &definition.hide_execution_metadata,
                ],
            )
            .await
            .map_err(db_err)?;
        }

        tx.commit().await.map_err(db_err)
    }

    async fn find_definition_by_id(&self, id: &str) -> Result<HookDefinition> {
        let client = self.client.lock().await;
        self.definition_by_id(&client, id).await
    }

    async fn list_definitions(&self) -> Result<Vec<HookDefinition>> {
        let client = self.client.lock().await;
        let rows = client
            .query("SELECT * FROM hook_definitions", &[])
            .await
            .map_err(db_err)?;
        rows.iter().map(definition_from_row).collect()
    }

    async fn write_configuration(&self, configuration: &HookConfiguration) -> Result<()> {
        let client = self.client.lock().await;
        client
            .execute(
                "INSERT INTO hook_configurations
                    (id, hook_definition_id, tag, url, client_secret,
                     client_rsa_private_key, created_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7)
                 ON CONFLICT (id) DO UPDATE SET
                    tag = excluded.tag,
                    url = excluded.url,
                    client_secret = excluded.client_secret,
                    client_rsa_private_key = excluded.client_rsa_private_key",
                &[
                    &configuration.id,
                    &configuration.hook_definition_id,
                    &configuration.tag,
                    &configuration.url,
                    &configuration.client_secret,
                    &configuration.client_rsa_private_key,
                    &configuration.created_at,
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn find_configuration(
        &self,
        definition_id: &str,
        tag: &str,
    ) -> Result<HookConfiguration> {
        let client = self.client.lock().await;
        let row = client
            .query_opt(
                "SELECT * FROM hook_configurations
                 WHERE hook_definition_id = $1 AND tag = $2",
                &[&definition_id, &tag],
            )
            .await
            .map_err(db_err)?
            .ok_or(HookError::NotFound)?;

        let mut configuration = configuration_from_row(&row)?;
        configuration.hook_definition =
            Some(self.definition_by_id(&client, &configuration.hook_definition_id).await?);
        Ok(configuration)
    }

    async fn list_configurations(&self) -> Result<Vec<HookConfiguration>> {
        let client = self.client.lock().await;
        let rows = client
            .query("SELECT * FROM hook_configurations", &[])
            .await
            .map_err(db_err)?;
        rows.iter().map(configuration_from_row).collect()
    }

    async fn list_configurations_by_tag(&self, tag: &str) -> Result<Vec<HookConfiguration>> {
        let client = self.client.lock().await;
        let rows = client
            .query("SELECT * FROM hook_configurations WHERE tag = $1", &[&tag])
            .await
            .map_err(db_err)?;
        rows.iter().map(configuration_from_row).collect()
    }

    async fn write_schedule(
        &self,
        schedule: &HookSchedule,
        executions: &[HookExecution],
    ) -> Result<()> {
        let mut client = self.client.lock().await;
        let tx = client.transaction().await.map_err(db_err)?;

        tx.execute(
            "INSERT INTO hook_schedules
                (id, hook_configuration_id, http_request_method, url, payload,
                 status, max_attempt, current_attempt, hide_execution_metadata,
                 created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
             ON CONFLICT (id) DO UPDATE SET
                status = excluded.status,
                current_attempt = excluded.current_attempt,
                updated_at = excluded.updated_at",
            &[
                &schedule.id,
                &schedule.hook_configuration_id,
                &schedule.http_request_method.as_str(),
                &schedule.url,
                &schedule.payload,
                &schedule.status.as_str(),
                &(schedule.max_attempt as i32),
                &(schedule.current_attempt as i32),
                &schedule.hide_execution_metadata,
                &schedule.created_at,
                &schedule.updated_at,
            ],
        )
        .await
        .map_err(db_err)?;

        for execution in executions {
            tx.execute(
                "INSERT INTO hook_executions
                    (id, hook_schedule_id, response_status, response_payload,
                     request_payload, created_at)
                 VALUES ($1, $2, $3, $4, $5, $6)",
                &[
                    &execution.id,
                    &execution.hook_schedule_id,
                    &(execution.response_status as i32),
                    &execution.response_payload,
                    &execution.request_payload,
                    &execution.created_at,
                ],
            )
            .await
            .map_err(db_err)?;
        }

        tx.commit().await.map_err(db_err)
    }

    async fn find_schedule_by_id(
        &self,
        id: &str,
    ) -> Result<(HookSchedule, Vec<HookExecution>)> {
        let client = self.client.lock().await;
        let row = client
            .query_opt("SELECT * FROM hook_schedules WHERE id = $1", &[&id])
            .await
            .map_err(db_err)?
            .ok_or(HookError::NotFound)?;

        let mut schedule = schedule_from_row(&row)?;
        schedule.hook_configuration =
            Some(self.configuration_by_id(&client, &schedule.hook_configuration_id).await?);

        let rows = client
            .query(
                "SELECT * FROM hook_executions WHERE hook_schedule_id = $1
                 ORDER BY created_at",
                &[&id],
            )
            .await
            .map_err(db_err)?;
        let executions = rows.iter().map(execution_from_row).collect::<Result<Vec<_>>>()?;

        Ok((schedule, executions))
    }

    async fn list_schedules_by_tag(&self, tag: &str) -> Result<Vec<HookSchedule>> {
        let client = self.client.lock().await;
        let rows = client
            .query(
                "SELECT s.* FROM hook_schedules s
                 JOIN hook_configurations c ON c.id = s.hook_configuration_id
                 WHERE c.tag = $1",
                &[&tag],
            )
            .await
            .map_err(db_err)?;
        rows.iter().map(schedule_from_row).collect()
    }

    async fn find_due_schedules(&self) -> Result<Vec<HookSchedule>> {
        let client = self.client.lock().await;
        let rows = client
            .query(
                "SELECT * FROM hook_schedules WHERE status = $1",
                &[&ScheduleStatus::Scheduled.as_str()],
            )
            .await
            .map_err(db_err)?;
        rows.iter().map(schedule_from_row).collect()
    }
}

fn db_err(err: tokio_postgres::Error) -> HookError {
    HookError::persistence(err.to_string())
}

fn definition_from_row(row: &Row) -> Result<HookDefinition> {
    let method: String = row.try_get("http_request_method").map_err(db_err)?;
    let total_attempts: i32 = row.try_get("total_attempts").map_err(db_err)?;

    Ok(HookDefinition {
        id: row.try_get("id").map_err(db_err)?,
        name: row.try_get("name").map_err(db_err)?,
        description: row.try_get("description").map_err(db_err)?,
        payload_scheme: row.try_get("payload_scheme").map_err(db_err)?,
        http_request_method: HttpMethod::from_str(&method)?,
        total_attempts: total_attempts as u32,
        hide_execution_metadata: row.try_get("hide_execution_metadata").map_err(db_err)?,
    })
}

fn configuration_from_row(row: &Row) -> Result<HookConfiguration> {
    Ok(HookConfiguration {
        id: row.try_get("id").map_err(db_err)?,
        hook_definition_id: row.try_get("hook_definition_id").map_err(db_err)?,
        tag: row.try_get("tag").map_err(db_err)?,
        url: row.try_get("url").map_err(db_err)?,
        client_secret: row.try_get("client_secret").map_err(db_err)?,
        client_rsa_private_key: row.try_get("client_rsa_private_key").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
        hook_definition: None,
    })
}

fn schedule_from_row(row: &Row) -> Result<HookSchedule> {
    let method: String = row.try_get("http_request_method").map_err(db_err)?;
    let status: String = row.try_get("status").map_err(db_err)?;
    let max_attempt: i32 = row.try_get("max_attempt").map_err(db_err)?;
    let current_attempt: i32 = row.try_get("current_attempt").map_err(db_err)?;

    Ok(HookSchedule {
        id: row.try_get("id").map_err(db_err)?,
        hook_configuration_id: row.try_get("hook_configuration_id").map_err(db_err)?,
        http_request_method: HttpMethod::from_str(&method)?,
        url: row.try_get("url").map_err(db_err)?,
        payload: row.try_get("payload").map_err(db_err)?,
        status: ScheduleStatus::from_str(&status)?,
        max_attempt: max_attempt as u32,
        current_attempt: current_attempt as u32,
        hide_execution_metadata: row.try_get("hide_execution_metadata").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
        updated_at: row.try_get("updated_at").map_err(db_err)?,
        hook_configuration: None,
    })
}

fn execution_from_row(row: &Row) -> Result<HookExecution> {
    let response_status: i32 = row.try_get("response_status").map_err(db_err)?;

    Ok(HookExecution {
        id: row.try_get("id").map_err(db_err)?,
        hook_schedule_id: row.try_get("hook_schedule_id").map_err(db_err)?,
        response_status: response_status as u16,
        response_payload: row.try_get("response_payload").map_err(db_err)?,
        request_payload: row.try_get("request_payload").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
    })
}
