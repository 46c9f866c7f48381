//! Shared error type and the error classification taxonomy.
//!
//! Errors fall into five classes (Transient / Permanent / Conflict /
//! MissingCapability / Danger). Classification is pattern-based and
//! fail-safe: anything unrecognised is Permanent, never Transient.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Shared error type used across all Aviary crates.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("database: {0}")]
    Database(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("LLM provider: {0}")]
    Provider(String),

    #[error("routing: {0}")]
    Routing(String),

    #[error("decomposition: {0}")]
    Decomposition(String),

    #[error("conflict: {message}")]
    Conflict {
        message: String,
        action_hint: Option<String>,
    },

    #[error("session {session_id}: {message}")]
    Session {
        session_id: String,
        message: String,
    },

    #[error(transparent)]
    Parrot(#[from] ParrotError),

    #[error(transparent)]
    MissingCapability(#[from] MissingCapability),

    #[error(transparent)]
    DangerBlocked(#[from] DangerBlocked),

    #[error("config: {0}")]
    Config(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Typed payloads
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// An in-agent failure, wrapped with the parrot name and the operation
/// that was running when it happened.
#[derive(thiserror::Error, Debug)]
#[error("{parrot_name}.{operation}: {wrapped}")]
pub struct ParrotError {
    pub parrot_name: String,
    pub operation: String,
    #[source]
    pub wrapped: Box<Error>,
}

impl ParrotError {
    pub fn wrap(parrot_name: impl Into<String>, operation: impl Into<String>, err: Error) -> Self {
        Self {
            parrot_name: parrot_name.into(),
            operation: operation.into(),
            wrapped: Box::new(err),
        }
    }
}

/// Raised when the selected expert cannot serve the request.
/// Triggers a handoff when the orchestrator has a handler configured.
#[derive(thiserror::Error, Debug, Clone, Serialize, Deserialize)]
#[error("expert {expert} missing capabilities: {missing_capabilities:?}")]
pub struct MissingCapability {
    pub expert: String,
    pub missing_capabilities: Vec<String>,
    pub original: String,
    pub suggestion: Option<HandoffSuggestion>,
}

/// A handoff target proposed alongside a [`MissingCapability`] failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandoffSuggestion {
    pub target: String,
    pub input: String,
}

/// Severity levels assigned by the danger gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DangerLevel {
    Critical,
    High,
    Moderate,
}

/// Operation categories recognised by the danger gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DangerCategory {
    FileDelete,
    System,
    Network,
    Database,
    Git,
    Permission,
}

/// The danger gate blocked a subprocess invocation before execution.
#[derive(thiserror::Error, Debug, Clone, Serialize, Deserialize)]
#[error("dangerous operation blocked ({category:?}/{level:?}): {reason}")]
pub struct DangerBlocked {
    pub operation: String,
    pub reason: String,
    pub pattern_matched: String,
    pub level: DangerLevel,
    pub category: DangerCategory,
    pub bypass_allowed: bool,
    pub suggestions: Vec<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Classification
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The class an error resolves to (data, not a type hierarchy).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Transient,
    Permanent,
    Conflict,
    MissingCapability,
    Danger,
}

/// A classified error as surfaced to callers.
#[derive(Debug, Clone)]
pub struct ClassifiedError {
    pub class: ErrorClass,
    /// Suggested retry delay for Transient errors.
    pub retry_after: Option<Duration>,
    /// Hint for orchestration on Conflict errors (e.g. "find_free_time").
    pub action_hint: Option<String>,
    pub original: String,
}

/// Substrings that mark an error message as transient.
const TRANSIENT_MARKERS: &[&str] = &[
    "connection refused",
    "connection reset",
    "i/o timeout",
    "deadline exceeded",
    "timed out",
    "temporarily unavailable",
    "broken pipe",
    "too many requests",
];

/// Substrings that mark an error message as permanent.
const PERMANENT_MARKERS: &[&str] = &[
    "invalid",
    "not found",
    "unauthorized",
    "forbidden",
    "required",
];

/// Classify an error. Pattern-based: network-ish substrings are Transient,
/// validation-ish substrings are Permanent, everything unrecognised defaults
/// to Permanent. Unknown is never classified as Transient.
pub fn classify(err: &Error) -> ClassifiedError {
    let original = err.to_string();

    match err {
        Error::DangerBlocked(_) => ClassifiedError {
            class: ErrorClass::Danger,
            retry_after: None,
            action_hint: None,
            original,
        },
        Error::MissingCapability(_) => ClassifiedError {
            class: ErrorClass::MissingCapability,
            retry_after: None,
            action_hint: None,
            original,
        },
        Error::Conflict { action_hint, .. } => ClassifiedError {
            class: ErrorClass::Conflict,
            retry_after: None,
            action_hint: action_hint.clone(),
            original,
        },
        Error::Timeout(_) | Error::Cancelled => ClassifiedError {
            class: ErrorClass::Transient,
            retry_after: Some(Duration::from_secs(2)),
            action_hint: None,
            original,
        },
        Error::Parrot(inner) => {
            let mut classified = classify(&inner.wrapped);
            classified.original = original;
            classified
        }
        _ => classify_message(&original),
    }
}

fn classify_message(message: &str) -> ClassifiedError {
    let lower = message.to_lowercase();

    if TRANSIENT_MARKERS.iter().any(|m| lower.contains(m)) {
        return ClassifiedError {
            class: ErrorClass::Transient,
            retry_after: Some(Duration::from_secs(3)),
            action_hint: None,
            original: message.to_string(),
        };
    }

    if PERMANENT_MARKERS.iter().any(|m| lower.contains(m)) {
        return ClassifiedError {
            class: ErrorClass::Permanent,
            retry_after: None,
            action_hint: None,
            original: message.to_string(),
        };
    }

    // Fail-safe default.
    ClassifiedError {
        class: ErrorClass::Permanent,
        retry_after: None,
        action_hint: None,
        original: message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_is_transient_with_retry_hint() {
        let c = classify(&Error::Timeout("provider timed out after 60000ms".into()));
        assert_eq!(c.class, ErrorClass::Transient);
        assert!(c.retry_after.is_some());
    }

    #[test]
    fn network_substring_is_transient() {
        let c = classify(&Error::Provider("dial tcp: connection refused".into()));
        assert_eq!(c.class, ErrorClass::Transient);
        let secs = c.retry_after.unwrap().as_secs();
        assert!((2..=3).contains(&secs));
    }

    #[test]
    fn validation_substring_is_permanent() {
        let c = classify(&Error::Other("field 'agent' is required".into()));
        assert_eq!(c.class, ErrorClass::Permanent);
        assert!(c.retry_after.is_none());
    }

    #[test]
    fn unknown_defaults_to_permanent_never_transient() {
        let c = classify(&Error::Other("some entirely novel failure".into()));
        assert_eq!(c.class, ErrorClass::Permanent);
    }

    #[test]
    fn conflict_carries_action_hint() {
        let c = classify(&Error::Conflict {
            message: "overlapping schedule".into(),
            action_hint: Some("find_free_time".into()),
        });
        assert_eq!(c.class, ErrorClass::Conflict);
        assert_eq!(c.action_hint.as_deref(), Some("find_free_time"));
    }

    #[test]
    fn missing_capability_classifies_to_its_own_class() {
        let mc = MissingCapability {
            expert: "note".into(),
            missing_capabilities: vec!["web_search".into()],
            original: "cannot search the web".into(),
            suggestion: None,
        };
        let c = classify(&Error::MissingCapability(mc));
        assert_eq!(c.class, ErrorClass::MissingCapability);
    }

    #[test]
    fn danger_classifies_to_danger() {
        let d = DangerBlocked {
            operation: "rm -rf /".into(),
            reason: "recursive delete of filesystem root".into(),
            pattern_matched: "rm -rf /".into(),
            level: DangerLevel::Critical,
            category: DangerCategory::System,
            bypass_allowed: false,
            suggestions: vec![],
        };
        let c = classify(&Error::DangerBlocked(d));
        assert_eq!(c.class, ErrorClass::Danger);
    }

    #[test]
    fn parrot_wrap_classifies_inner_error() {
        let inner = Error::Provider("read tcp: i/o timeout".into());
        let wrapped = Error::Parrot(ParrotError::wrap("schedule", "execute", inner));
        let c = classify(&wrapped);
        assert_eq!(c.class, ErrorClass::Transient);
        assert!(c.original.starts_with("schedule.execute:"));
    }

    #[test]
    fn parrot_error_prefixes_name_and_operation() {
        let err = ParrotError::wrap("geek", "execute", Error::Other("boom".into()));
        assert_eq!(err.to_string(), "geek.execute: boom");
    }
}
