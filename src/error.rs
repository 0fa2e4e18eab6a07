use thiserror::Error;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, HookError>;

/// Errors surfaced by the dispatch engine.
///
/// Synchronous operations (registration, enqueue) return these to the
/// caller. Asynchronous paths (scheduler, workers) forward them to the
/// optional error channel; with no channel configured they are dropped.
///
/// A non-200 HTTP response is *not* an error — it is recorded as a
/// [`HookExecution`](crate::HookExecution) and drives the retry state
/// machine instead.
#[derive(Debug, Clone, Error)]
pub enum HookError {
    /// A persister lookup found no matching record.
    #[error("record not found")]
    NotFound,

    /// An entity failed its invariant checks.
    #[error("validation failed: {message}")]
    Validation {
        /// Which invariant was violated
        message: String,
    },

    /// The payload did not satisfy the definition's JSON Schema.
    /// All violations are joined into one message.
    #[error("payload rejected by schema: {message}")]
    Schema {
        /// Joined violation descriptions
        message: String,
    },

    /// A caller-supplied schedule id already exists.
    #[error("schedule {id} already exists")]
    DuplicateSchedule {
        /// The conflicting schedule id
        id: String,
    },

    /// The HTTP request failed before any response was received.
    /// The attempt is not counted; the schedule stays `scheduled`.
    #[error("transport error: {message}")]
    Transport {
        /// Underlying client error description
        message: String,
    },

    /// A store operation failed.
    #[error("persistence error: {message}")]
    Persistence {
        /// Underlying store error description
        message: String,
    },

    /// Key generation, parsing or signing failed.
    #[error("crypto error: {message}")]
    Crypto {
        /// Underlying crypto error description
        message: String,
    },
}

impl HookError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation { message: message.into() }
    }

    pub fn schema(message: impl Into<String>) -> Self {
        Self::Schema { message: message.into() }
    }

    pub fn duplicate_schedule(id: impl Into<String>) -> Self {
        Self::DuplicateSchedule { id: id.into() }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport { message: message.into() }
    }

    pub fn persistence(message: impl Into<String>) -> Self {
        Self::Persistence { message: message.into() }
    }

    pub fn crypto(message: impl Into<String>) -> Self {
        Self::Crypto { message: message.into() }
    }

    /// True for the lookup-miss condition that `try_schedule` swallows.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_is_recognizable() {
        assert!(HookError::NotFound.is_not_found());
        assert!(!HookError::validation("tag is required").is_not_found());
    }

    #[test]
    fn error_display_format() {
        let err = HookError::duplicate_schedule("abc");
        assert_eq!(err.to_string(), "schedule abc already exists");

        let err = HookError::transport("connection refused");
        assert_eq!(err.to_string(), "transport error: connection refused");
    }
}
