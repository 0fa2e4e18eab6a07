use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{HookError, Result};
use crate::schema::SchemaValidator;
use crate::signing;

/// Header carrying the configuration's shared secret, sent verbatim.
pub const CLIENT_SECRET_HEADER: &str = "X-Client-Secret";

/// Header carrying the base64 RSA signature of the request body.
pub const CLIENT_SIGNATURE_HEADER: &str = "X-Client-Signature";

/// Default tag for configurations that apply to every subscriber.
pub const GLOBAL_TAG: &str = "global";

/// HTTP method used for outbound deliveries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HttpMethod {
    #[serde(rename = "GET")]
    Get,
    #[serde(rename = "POST")]
    Post,
    #[serde(rename = "PUT")]
    Put,
    #[serde(rename = "DELETE")]
    Delete,
}

impl HttpMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HttpMethod {
    type Err = HookError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "GET" => Ok(Self::Get),
            "POST" => Ok(Self::Post),
            "PUT" => Ok(Self::Put),
            "DELETE" => Ok(Self::Delete),
            other => Err(HookError::validation(format!(
                "http request method is not valid: {other}"
            ))),
        }
    }
}

impl From<HttpMethod> for reqwest::Method {
    fn from(method: HttpMethod) -> Self {
        match method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Delete => reqwest::Method::DELETE,
        }
    }
}

/// Lifecycle state of a [`HookSchedule`].
///
/// `Executed` and `Failed` are terminal; the scheduler never revisits
/// them. `retry_schedule_by_id` is the only path that re-dispatches a
/// terminal schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleStatus {
    Scheduled,
    Executed,
    Failed,
}

impl ScheduleStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Executed => "executed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Executed | Self::Failed)
    }
}

impl fmt::Display for ScheduleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScheduleStatus {
    type Err = HookError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "scheduled" => Ok(Self::Scheduled),
            "executed" => Ok(Self::Executed),
            "failed" => Ok(Self::Failed),
            other => Err(HookError::validation(format!(
                "unknown schedule status: {other}"
            ))),
        }
    }
}

/// Schema-level template for a kind of hook event.
///
/// A definition describes *what* may be delivered: the payload schema,
/// the HTTP method and the retry budget. Concrete subscriptions are
/// [`HookConfiguration`]s created from it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookDefinition {
    /// Logical identifier, e.g. `entity_created`.
    pub id: String,

    /// Human-readable name.
    pub name: String,

    /// Longer description of when this hook fires.
    pub description: String,

    /// Optional JSON Schema the enqueue payload must satisfy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_scheme: Option<serde_json::Value>,

    /// Method used for every delivery of this hook.
    pub http_request_method: HttpMethod,

    /// Maximum delivery attempts before a schedule is marked failed.
    pub total_attempts: u32,

    /// When true, deliveries carry the raw payload bytes instead of the
    /// metadata envelope.
    #[serde(default)]
    pub hide_execution_metadata: bool,
}

impl HookDefinition {
    /// Create a new definition with an empty description and no schema.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        http_request_method: HttpMethod,
        total_attempts: u32,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            payload_scheme: None,
            http_request_method,
            total_attempts,
            hide_execution_metadata: false,
        }
    }

    /// Set the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Require payloads to satisfy the given JSON Schema at enqueue time.
    pub fn with_payload_scheme(mut self, scheme: serde_json::Value) -> Self {
        self.payload_scheme = Some(scheme);
        self
    }

    /// Deliver raw payload bytes instead of the metadata envelope.
    pub fn with_hidden_metadata(mut self, hide: bool) -> Self {
        self.hide_execution_metadata = hide;
        self
    }

    /// Check the definition invariants.
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(HookError::validation("id is required"));
        }

        if self.total_attempts == 0 {
            return Err(HookError::validation("total attempts must be higher than 0"));
        }

        Ok(())
    }

    /// Create a configuration subscribing `url` to this definition.
    ///
    /// The returned configuration carries a resolved handle back to this
    /// definition and has been validated.
    pub fn create_configuration(
        &self,
        id: impl Into<String>,
        url: impl Into<String>,
        tag: impl Into<String>,
        client_secret: Option<String>,
    ) -> Result<HookConfiguration> {
        let configuration = HookConfiguration {
            id: id.into(),
            hook_definition_id: self.id.clone(),
            tag: tag.into(),
            url: url.into(),
            client_secret,
            client_rsa_private_key: None,
            created_at: Utc::now(),
            hook_definition: Some(self.clone()),
        };

        configuration.validate()?;
        Ok(configuration)
    }
}

/// A concrete subscription binding a definition to a URL.
///
/// Configurations own credentials: an optional shared secret sent in
/// [`CLIENT_SECRET_HEADER`] and an optional PKCS#1 PEM RSA private key
/// used to sign request bodies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookConfiguration {
    pub id: String,

    /// Parent definition, by id.
    pub hook_definition_id: String,

    /// Selection key used to resolve configurations at enqueue time.
    pub tag: String,

    /// Absolute URL deliveries are sent to.
    pub url: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,

    /// PKCS#1 PEM encoded RSA private key. Never serialized.
    #[serde(skip)]
    pub client_rsa_private_key: Option<String>,

    pub created_at: DateTime<Utc>,

    /// Resolved parent definition, attached on read. Not persisted.
    #[serde(skip)]
    pub hook_definition: Option<HookDefinition>,
}

impl HookConfiguration {
    /// Check the configuration invariants.
    ///
    /// The resolved definition must be attached; registration and reads
    /// through the persister take care of that.
    pub fn validate(&self) -> Result<()> {
        Url::parse(&self.url)
            .map_err(|e| HookError::validation(format!("url is not valid: {e}")))?;

        if self.tag.is_empty() {
            return Err(HookError::validation("tag is required"));
        }

        if self.hook_definition_id.is_empty() {
            return Err(HookError::validation("hook definition id must be set"));
        }

        if self.hook_definition.is_none() {
            return Err(HookError::validation("hook definition is not set"));
        }

        Ok(())
    }

    /// Build a schedule for `payload` under this configuration.
    ///
    /// When the definition carries a payload schema and a validator is
    /// supplied, the payload is validated here — once, at enqueue time —
    /// and never again during delivery. Unless the definition hides
    /// execution metadata, the payload must be well-formed JSON: the
    /// delivery envelope embeds it verbatim, so a payload that cannot
    /// be embedded is rejected here rather than wedging delivery.
    pub fn schedule(
        &self,
        id: impl Into<String>,
        payload: Vec<u8>,
        validator: Option<&dyn SchemaValidator>,
    ) -> Result<HookSchedule> {
        let definition = self
            .hook_definition
            .as_ref()
            .ok_or_else(|| HookError::validation("hook definition is not set"))?;

        if let (Some(scheme), Some(validator)) = (&definition.payload_scheme, validator) {
            validator.validate(scheme, &payload)?;
        }

        if !definition.hide_execution_metadata {
            serde_json::from_slice::<&serde_json::value::RawValue>(&payload)
                .map_err(|e| HookError::validation(format!("payload is not valid JSON: {e}")))?;
        }

        let schedule = HookSchedule {
            id: id.into(),
            hook_configuration_id: self.id.clone(),
            http_request_method: definition.http_request_method,
            url: self.url.clone(),
            payload,
            status: ScheduleStatus::Scheduled,
            max_attempt: definition.total_attempts,
            current_attempt: 0,
            hide_execution_metadata: definition.hide_execution_metadata,
            created_at: Utc::now(),
            updated_at: None,
            hook_configuration: Some(self.clone()),
        };

        schedule.validate()?;
        Ok(schedule)
    }

    /// Generate and store an RSA-2048 private key for body signing.
    ///
    /// Fails if a key is already present and `override_existing` is false.
    pub fn generate_private_key(&mut self, override_existing: bool) -> Result<()> {
        if self.client_rsa_private_key.is_some() && !override_existing {
            return Err(HookError::crypto("private key already set"));
        }

        self.client_rsa_private_key = Some(signing::generate_private_key_pem()?);
        Ok(())
    }

    /// Derive the RSA public key matching the stored private key.
    ///
    /// Receivers use this with [`signing::verify_signature`] to check the
    /// [`CLIENT_SIGNATURE_HEADER`] of incoming requests.
    pub fn public_key(&self) -> Result<rsa::RsaPublicKey> {
        let pem = self
            .client_rsa_private_key
            .as_deref()
            .ok_or_else(|| HookError::crypto("no private key on configuration"))?;

        signing::public_key_from_private_pem(pem)
    }
}

/// A single pending or terminal delivery instance.
///
/// Created in `scheduled` state with `current_attempt = 0` and a null
/// `updated_at`. Every delivery attempt increments the attempt counter,
/// bumps `updated_at` and applies the transition: HTTP 200 makes it
/// `executed`; a non-200 past the attempt budget makes it `failed`;
/// anything else leaves it `scheduled` for the next poll.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookSchedule {
    pub id: String,

    pub hook_configuration_id: String,

    pub http_request_method: HttpMethod,

    pub url: String,

    /// Opaque JSON payload bytes, exactly as supplied at enqueue.
    pub payload: Vec<u8>,

    pub status: ScheduleStatus,

    pub max_attempt: u32,

    pub current_attempt: u32,

    pub hide_execution_metadata: bool,

    pub created_at: DateTime<Utc>,

    /// Null until the first attempt; afterwards the instant of the most
    /// recent dispatch or response. Drives the skip-interval filter.
    pub updated_at: Option<DateTime<Utc>>,

    /// Resolved parent configuration, attached on read. Not persisted.
    #[serde(skip)]
    pub hook_configuration: Option<HookConfiguration>,
}

impl HookSchedule {
    /// Check the schedule invariants.
    pub fn validate(&self) -> Result<()> {
        if self.hook_configuration_id.is_empty() {
            return Err(HookError::validation("hook configuration id is required"));
        }

        if self.hook_configuration.is_none() {
            return Err(HookError::validation("hook configuration is not set"));
        }

        let url = Url::parse(&self.url)
            .map_err(|e| HookError::validation(format!("url is not valid: {e}")))?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(HookError::validation("url scheme must be http or https"));
        }

        if self.max_attempt == 0 {
            return Err(HookError::validation("max attempt must be higher than 0"));
        }

        Ok(())
    }

    /// Apply the post-attempt state transition for `response_status`.
    pub(crate) fn record_attempt(&mut self, response_status: u16) {
        self.current_attempt += 1;
        if response_status == 200 {
            self.status = ScheduleStatus::Executed;
        } else if self.current_attempt > self.max_attempt {
            self.status = ScheduleStatus::Failed;
        }
        self.updated_at = Some(Utc::now());
    }
}

/// Append-only audit record of one delivery attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookExecution {
    pub id: String,

    pub hook_schedule_id: String,

    /// HTTP status of the response. Success is 200 exactly.
    pub response_status: u16,

    /// Response body bytes, or a diagnostic string when the body could
    /// not be read.
    pub response_payload: Vec<u8>,

    /// Body as it went over the wire, envelope included.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_payload: Option<Vec<u8>>,

    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn definition() -> HookDefinition {
        HookDefinition::new("entity_created", "on entity created", HttpMethod::Post, 3)
            .with_description("fires when an entity is created")
    }

    #[test]
    fn definition_validates() {
        assert!(definition().validate().is_ok());
    }

    #[test]
    fn definition_rejects_empty_id() {
        let mut def = definition();
        def.id = String::new();
        assert!(def.validate().is_err());
    }

    #[test]
    fn definition_rejects_zero_attempts() {
        let mut def = definition();
        def.total_attempts = 0;
        assert!(def.validate().is_err());
    }

    #[test]
    fn create_configuration_attaches_definition() {
        let cfg = definition()
            .create_configuration("cfg-1", "http://example.com/hook", "test-tag", None)
            .expect("configuration");

        assert_eq!(cfg.hook_definition_id, "entity_created");
        assert!(cfg.hook_definition.is_some());
    }

    #[test]
    fn configuration_rejects_empty_tag() {
        let err = definition()
            .create_configuration("cfg-1", "http://example.com/hook", "", None)
            .unwrap_err();
        assert!(matches!(err, HookError::Validation { .. }));
    }

    #[test]
    fn configuration_rejects_relative_url() {
        let err = definition()
            .create_configuration("cfg-1", "/hook", "test-tag", None)
            .unwrap_err();
        assert!(matches!(err, HookError::Validation { .. }));
    }

    #[test]
    fn schedule_inherits_definition_fields() {
        let cfg = definition()
            .create_configuration("cfg-1", "http://example.com/hook", "test-tag", None)
            .expect("configuration");

        let schedule = cfg
            .schedule("sched-1", br#"{"key":"value"}"#.to_vec(), None)
            .expect("schedule");

        assert_eq!(schedule.status, ScheduleStatus::Scheduled);
        assert_eq!(schedule.max_attempt, 3);
        assert_eq!(schedule.current_attempt, 0);
        assert_eq!(schedule.http_request_method, HttpMethod::Post);
        assert!(schedule.updated_at.is_none());
        assert!(schedule.hook_configuration.is_some());
    }

    #[test]
    fn schedule_rejects_non_json_payload() {
        let cfg = definition()
            .create_configuration("cfg-1", "http://example.com/hook", "test-tag", None)
            .expect("configuration");

        let err = cfg
            .schedule("sched-1", b"not json".to_vec(), None)
            .unwrap_err();
        assert!(matches!(err, HookError::Validation { .. }));
    }

    #[test]
    fn hidden_metadata_allows_opaque_payload() {
        let cfg = definition()
            .with_hidden_metadata(true)
            .create_configuration("cfg-1", "http://example.com/hook", "test-tag", None)
            .expect("configuration");

        // Raw-body mode never embeds the payload in an envelope, so
        // arbitrary bytes are acceptable.
        assert!(cfg.schedule("sched-1", b"not json".to_vec(), None).is_ok());
    }

    #[test]
    fn schedule_rejects_non_http_scheme() {
        let mut cfg = definition()
            .create_configuration("cfg-1", "http://example.com/hook", "test-tag", None)
            .expect("configuration");
        cfg.url = "ftp://example.com/hook".to_string();

        let err = cfg.schedule("sched-1", b"{}".to_vec(), None).unwrap_err();
        assert!(matches!(err, HookError::Validation { .. }));
    }

    #[test]
    fn attempt_success_is_terminal() {
        let cfg = definition()
            .create_configuration("cfg-1", "http://example.com/hook", "test-tag", None)
            .expect("configuration");
        let mut schedule = cfg.schedule("sched-1", b"{}".to_vec(), None).expect("schedule");

        schedule.record_attempt(200);
        assert_eq!(schedule.status, ScheduleStatus::Executed);
        assert_eq!(schedule.current_attempt, 1);
        assert!(schedule.updated_at.is_some());
    }

    #[test]
    fn attempts_exhaust_into_failed() {
        let cfg = definition()
            .create_configuration("cfg-1", "http://example.com/hook", "test-tag", None)
            .expect("configuration");
        let mut schedule = cfg.schedule("sched-1", b"{}".to_vec(), None).expect("schedule");

        // total_attempts = 3: three failures stay scheduled, the fourth
        // pushes current_attempt past max_attempt.
        for _ in 0..3 {
            schedule.record_attempt(500);
        }
        assert_eq!(schedule.status, ScheduleStatus::Scheduled);

        schedule.record_attempt(500);
        assert_eq!(schedule.status, ScheduleStatus::Failed);
        assert_eq!(schedule.current_attempt, 4);
    }

    #[test]
    fn generate_private_key_refuses_overwrite() {
        let mut cfg = definition()
            .create_configuration("cfg-1", "http://example.com/hook", "test-tag", None)
            .expect("configuration");

        cfg.generate_private_key(false).expect("first key");
        assert!(cfg.client_rsa_private_key.is_some());

        let err = cfg.generate_private_key(false).unwrap_err();
        assert!(matches!(err, HookError::Crypto { .. }));

        cfg.generate_private_key(true).expect("override");
    }

    #[test]
    fn method_and_status_round_trip_strings() {
        assert_eq!("POST".parse::<HttpMethod>().unwrap(), HttpMethod::Post);
        assert_eq!(HttpMethod::Delete.as_str(), "DELETE");
        assert!("PATCH".parse::<HttpMethod>().is_err());

        assert_eq!("failed".parse::<ScheduleStatus>().unwrap(), ScheduleStatus::Failed);
        assert!(ScheduleStatus::Executed.is_terminal());
        assert!(!ScheduleStatus::Scheduled.is_terminal());
    }
}
