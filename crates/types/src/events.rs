//! Usage event types
//!
//! Every event carries exactly the fields relevant to its kind. Events are
//! immutable once finalized; [`EventDraft`] is the mutable form accepted at
//! ingestion, before identity and timestamp have been assigned.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::errors::{AnalyticsError, Result};

/// Discriminant of an event payload
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A request served by a model
    AiRequest,
    /// A feature interaction that did not necessarily reach a model
    FeatureUsage,
    /// An application error
    Error,
}

impl EventKind {
    /// Stable name used in logs and storage keys
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AiRequest => "ai_request",
            Self::FeatureUsage => "feature_usage",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload of a model request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AiRequest {
    /// Feature that issued the request
    pub feature_id: String,
    /// Model identifier, e.g. `claude-3-haiku`
    pub model: String,
    /// Provider identifier, e.g. `anthropic`
    pub provider: String,
    /// End-to-end latency in milliseconds
    pub latency_ms: f64,
    /// Total tokens consumed
    pub tokens: u64,
    /// Cost in USD
    pub cost: f64,
    /// Whether the response was served from cache
    pub cache_hit: bool,
    /// Whether the request succeeded
    pub success: bool,
    /// Error message for failed requests
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AiRequest {
    /// Create a successful, uncached request record
    pub fn new(
        feature_id: impl Into<String>,
        model: impl Into<String>,
        provider: impl Into<String>,
        latency_ms: f64,
        tokens: u64,
        cost: f64,
    ) -> Self {
        Self {
            feature_id: feature_id.into(),
            model: model.into(),
            provider: provider.into(),
            latency_ms,
            tokens,
            cost,
            cache_hit: false,
            success: true,
            error: None,
        }
    }

    /// Mark the request as served from cache
    pub fn cached(mut self) -> Self {
        self.cache_hit = true;
        self
    }

    /// Mark the request as failed
    pub fn failed(mut self, error: impl Into<String>) -> Self {
        self.success = false;
        self.error = Some(error.into());
        self
    }

    /// Wrap into an event payload
    pub fn into_payload(self) -> EventPayload {
        EventPayload::AiRequest(self)
    }
}

/// Event payload, one variant per event kind
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    /// A model request
    AiRequest(AiRequest),
    /// A feature interaction
    FeatureUsage {
        feature_id: String,
        action: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration_ms: Option<f64>,
    },
    /// An application error
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        feature_id: Option<String>,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
}

impl EventPayload {
    /// Kind of this payload
    pub fn kind(&self) -> EventKind {
        match self {
            Self::AiRequest(_) => EventKind::AiRequest,
            Self::FeatureUsage { .. } => EventKind::FeatureUsage,
            Self::Error { .. } => EventKind::Error,
        }
    }

    /// Reject payloads with empty identifiers or negative/non-finite measurements
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::AiRequest(req) => {
                require_non_empty("feature_id", &req.feature_id)?;
                require_non_empty("model", &req.model)?;
                require_measurement("latency_ms", req.latency_ms)?;
                require_measurement("cost", req.cost)
            }
            Self::FeatureUsage {
                feature_id,
                duration_ms,
                ..
            } => {
                require_non_empty("feature_id", feature_id)?;
                match duration_ms {
                    Some(d) => require_measurement("duration_ms", *d),
                    None => Ok(()),
                }
            }
            Self::Error { message, .. } => require_non_empty("message", message),
        }
    }
}

fn require_non_empty(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(AnalyticsError::Validation(format!("{} must not be empty", field)));
    }
    Ok(())
}

fn require_measurement(field: &str, value: f64) -> Result<()> {
    if !value.is_finite() || value < 0.0 {
        return Err(AnalyticsError::Validation(format!(
            "{} must be a finite non-negative number, got {}",
            field, value
        )));
    }
    Ok(())
}

/// A finalized usage event
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UsageEvent {
    /// Unique identifier
    pub id: Uuid,
    /// When the event occurred
    pub timestamp: DateTime<Utc>,
    /// Optional end-user identifier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Optional session identifier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Kind-specific payload
    pub payload: EventPayload,
}

impl UsageEvent {
    /// Create an event with a fresh id stamped with the current time
    pub fn new(payload: EventPayload) -> Self {
        EventDraft::new(payload).finalize(Utc::now())
    }

    /// Event kind tag
    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }

    /// Latency sample carried by this event, if any
    pub fn latency_ms(&self) -> Option<f64> {
        match &self.payload {
            EventPayload::AiRequest(req) => Some(req.latency_ms),
            EventPayload::FeatureUsage { duration_ms, .. } => *duration_ms,
            EventPayload::Error { .. } => None,
        }
    }

    /// Cost attributed to this event
    pub fn cost(&self) -> f64 {
        match &self.payload {
            EventPayload::AiRequest(req) => req.cost,
            _ => 0.0,
        }
    }

    /// Tokens attributed to this event
    pub fn tokens(&self) -> u64 {
        match &self.payload {
            EventPayload::AiRequest(req) => req.tokens,
            _ => 0,
        }
    }

    /// Cache outcome; only model requests have one
    pub fn cache_hit(&self) -> Option<bool> {
        match &self.payload {
            EventPayload::AiRequest(req) => Some(req.cache_hit),
            _ => None,
        }
    }

    /// Whether this event counts as an error
    pub fn is_error(&self) -> bool {
        match &self.payload {
            EventPayload::AiRequest(req) => !req.success,
            EventPayload::FeatureUsage { .. } => false,
            EventPayload::Error { .. } => true,
        }
    }

    /// Feature the event is attributed to
    pub fn feature_id(&self) -> Option<&str> {
        match &self.payload {
            EventPayload::AiRequest(req) => Some(&req.feature_id),
            EventPayload::FeatureUsage { feature_id, .. } => Some(feature_id),
            EventPayload::Error { feature_id, .. } => feature_id.as_deref(),
        }
    }

    /// Model the event is attributed to
    pub fn model(&self) -> Option<&str> {
        match &self.payload {
            EventPayload::AiRequest(req) => Some(&req.model),
            _ => None,
        }
    }
}

/// An event as submitted by a caller, possibly lacking id and timestamp
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventDraft {
    #[serde(default)]
    pub id: Option<Uuid>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    pub payload: EventPayload,
}

impl EventDraft {
    /// Start a draft for the given payload
    pub fn new(payload: EventPayload) -> Self {
        Self {
            id: None,
            timestamp: None,
            user_id: None,
            session_id: None,
            payload,
        }
    }

    /// Use a caller-provided identifier
    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = Some(id);
        self
    }

    /// Use a caller-provided timestamp
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Attribute the event to a user
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Attribute the event to a session
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Fill in missing identity and timestamp
    pub fn finalize(self, now: DateTime<Utc>) -> UsageEvent {
        UsageEvent {
            id: self.id.unwrap_or_else(Uuid::new_v4),
            timestamp: self.timestamp.unwrap_or(now),
            user_id: self.user_id,
            session_id: self.session_id,
            payload: self.payload,
        }
    }
}

impl From<EventPayload> for EventDraft {
    fn from(payload: EventPayload) -> Self {
        Self::new(payload)
    }
}

impl From<AiRequest> for EventDraft {
    fn from(request: AiRequest) -> Self {
        Self::new(EventPayload::AiRequest(request))
    }
}

impl From<UsageEvent> for EventDraft {
    fn from(event: UsageEvent) -> Self {
        Self {
            id: Some(event.id),
            timestamp: Some(event.timestamp),
            user_id: event.user_id,
            session_id: event.session_id,
            payload: event.payload,
        }
    }
}
