//! An embeddable webhook dispatch engine.
//!
//! This crate accepts application-defined hook events, persists
//! scheduled deliveries, and reliably delivers them as signed HTTP
//! requests to subscriber endpoints.
//!
//! ## Guarantees
//! - At-least-once delivery while the process lives
//! - At most one attempt in flight per schedule
//! - Bounded worker concurrency with channel backpressure
//! - Schema validation at enqueue, never at delivery
//! - RSA-signed request bodies for configurations holding a key
//!
//! ## Non-Guarantees
//! - Exactly-once delivery
//! - Cross-process coordination (one process owns its schedule set)
//! - Ordering across distinct schedules
//!
//! The domain is a three-level hierarchy: a [`HookDefinition`] is the
//! schema-level template, a [`HookConfiguration`] binds it to a
//! subscriber URL and credentials, a [`HookSchedule`] is one pending or
//! terminal delivery, and each attempt leaves a [`HookExecution`]
//! audit record.

mod engine;
mod error;
mod executor;
mod loader;
mod persister;
mod schema;
mod scheduler;
pub mod signing;
mod types;

#[cfg(feature = "postgres")]
mod persister_postgres;

pub use engine::{Engine, EngineBuilder};
pub use error::{HookError, Result};
pub use persister::{InMemoryPersister, Persister};
pub use schema::{JsonSchemaValidator, SchemaValidator};
pub use scheduler::{PollScheduler, Scheduler};
pub use types::{
    HookConfiguration, HookDefinition, HookExecution, HookSchedule, HttpMethod,
    ScheduleStatus, CLIENT_SECRET_HEADER, CLIENT_SIGNATURE_HEADER, GLOBAL_TAG,
};

#[cfg(feature = "postgres")]
pub use persister_postgres::PostgresPersister;
