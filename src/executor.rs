//! Builds, signs and sends a single delivery attempt.
//!
//! Transport failures (no HTTP response) return an error without
//! touching the schedule: no execution is recorded and the attempt
//! counter stays put. Once a response arrives — any status — the
//! attempt counts and the schedule state machine advances.

use chrono::{DateTime, Utc};
use reqwest::header::CONTENT_TYPE;
use serde::Serialize;
use serde_json::value::RawValue;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{HookError, Result};
use crate::signing;
use crate::types::{
    HookExecution, HookSchedule, CLIENT_SECRET_HEADER, CLIENT_SIGNATURE_HEADER,
};

/// Metadata envelope wrapped around the payload unless the definition
/// opts out via `hide_execution_metadata`.
#[derive(Serialize)]
struct DeliveryEnvelope<'a> {
    /// Schedule id — a stable idempotency anchor for receivers.
    id: &'a str,
    sent_at: DateTime<Utc>,
    hook_definition_id: &'a str,
    data: &'a RawValue,
}

/// Run one delivery attempt for `schedule`.
///
/// On an HTTP response the schedule is mutated in place (attempt
/// counter, `updated_at`, state transition) and the execution record is
/// returned; the caller persists both. A transport error leaves the
/// schedule exactly as it was.
pub(crate) async fn execute(
    schedule: &mut HookSchedule,
    execution_id: String,
    client: &reqwest::Client,
    cancel: &CancellationToken,
) -> Result<HookExecution> {
    let configuration = schedule
        .hook_configuration
        .clone()
        .ok_or_else(|| HookError::validation("hook configuration is not set"))?;

    let created_at = Utc::now();
    let body = build_request_body(schedule)?;

    let mut request = client
        .request(schedule.http_request_method.into(), &schedule.url)
        .header(CONTENT_TYPE, "application/json")
        .body(body.clone());

    if let Some(secret) = &configuration.client_secret {
        request = request.header(CLIENT_SECRET_HEADER, secret);
    }

    if let Some(private_key_pem) = &configuration.client_rsa_private_key {
        let signature = signing::sign_body(&body, private_key_pem)?;
        request = request.header(CLIENT_SIGNATURE_HEADER, signature);
    }

    debug!(
        schedule_id = %schedule.id,
        method = %schedule.http_request_method,
        url = %schedule.url,
        attempt = schedule.current_attempt + 1,
        "sending hook delivery"
    );

    let response = tokio::select! {
        _ = cancel.cancelled() => {
            return Err(HookError::transport("delivery cancelled"));
        }
        result = request.send() => {
            result.map_err(|e| HookError::transport(e.to_string()))?
        }
    };

    let response_status = response.status().as_u16();
    let response_payload = match response.bytes().await {
        Ok(bytes) => bytes.to_vec(),
        Err(e) => format!("unable to retrieve response body: {e}").into_bytes(),
    };

    schedule.record_attempt(response_status);

    debug!(
        schedule_id = %schedule.id,
        response_status,
        status = %schedule.status,
        "hook delivery attempt finished"
    );

    Ok(HookExecution {
        id: execution_id,
        hook_schedule_id: schedule.id.clone(),
        response_status,
        response_payload,
        request_payload: Some(body),
        created_at,
    })
}

/// The request body: raw payload bytes, or the metadata envelope with
/// the payload embedded verbatim under `data`.
fn build_request_body(schedule: &HookSchedule) -> Result<Vec<u8>> {
    if schedule.hide_execution_metadata {
        return Ok(schedule.payload.clone());
    }

    let configuration = schedule
        .hook_configuration
        .as_ref()
        .ok_or_else(|| HookError::validation("hook configuration is not set"))?;

    let data: &RawValue = serde_json::from_slice(&schedule.payload)
        .map_err(|e| HookError::validation(format!("payload is not valid JSON: {e}")))?;

    let envelope = DeliveryEnvelope {
        id: &schedule.id,
        sent_at: Utc::now(),
        hook_definition_id: &configuration.hook_definition_id,
        data,
    };

    serde_json::to_vec(&envelope)
        .map_err(|e| HookError::validation(format!("failed to encode envelope: {e}")))
}
