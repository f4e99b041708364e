use std::collections::HashMap;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

// ============================================================================
// Envelope Types
// ============================================================================

/// Message body as seen by the endpoint layer.
///
/// Bodies arrive as raw bytes from the transport and are only parsed when an
/// endpoint needs to look inside them (content-aware endpoints, body
/// expressions).
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    Raw(Bytes),
    Json(serde_json::Value),
}

impl Body {
    pub fn is_materialized(&self) -> bool {
        matches!(self, Body::Json(_))
    }
}

/// The outgoing payload plus its transport headers
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub id: String,
    pub headers: HashMap<String, String>,
    pub body: Body,
}

impl Envelope {
    pub fn new(body: Body) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            headers: HashMap::new(),
            body,
        }
    }

    pub fn json(payload: serde_json::Value) -> Self {
        Self::new(Body::Json(payload))
    }

    pub fn raw(bytes: impl Into<Bytes>) -> Self {
        Self::new(Body::Raw(bytes.into()))
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Parse a raw body into JSON in place.
    ///
    /// Returns false when the body could not be parsed; the raw bytes are kept
    /// untouched in that case so the message can still be forwarded as-is.
    pub fn materialize(&mut self) -> bool {
        let parsed = match &self.body {
            Body::Json(_) => return true,
            Body::Raw(bytes) => serde_json::from_slice::<serde_json::Value>(bytes),
        };

        match parsed {
            Ok(value) => {
                self.body = Body::Json(value);
                true
            }
            Err(e) => {
                warn!(envelope_id = %self.id, error = %e, "Body is not JSON, keeping raw payload");
                false
            }
        }
    }

    /// JSON view of the body, parsing a raw body on the fly without storing it
    pub fn json_view(&self) -> Option<serde_json::Value> {
        match &self.body {
            Body::Json(value) => Some(value.clone()),
            Body::Raw(bytes) => serde_json::from_slice(bytes).ok(),
        }
    }
}

// ============================================================================
// Endpoint Health Types
// ============================================================================

/// Health state of a single endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EndpointState {
    /// Accepting traffic
    Active,
    /// Timed out recently, still accepting traffic until the retry budget is spent
    TimeoutRetry,
    /// Excluded from routing until the suspension expires
    Suspended,
    /// Switched off by an operator
    AdminOff,
}

impl EndpointState {
    pub fn accepts_traffic(&self) -> bool {
        matches!(self, EndpointState::Active | EndpointState::TimeoutRetry)
    }
}

/// What to do with a response that did not arrive in time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutAction {
    #[default]
    None,
    Discard,
    DiscardAndFault,
}

impl std::str::FromStr for TimeoutAction {
    type Err = FlowCatalystError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" | "never" => Ok(TimeoutAction::None),
            "discard" => Ok(TimeoutAction::Discard),
            "discard_and_fault" | "fault" => Ok(TimeoutAction::DiscardAndFault),
            other => Err(FlowCatalystError::Config(format!("unknown timeout action '{}'", other))),
        }
    }
}

/// Point-in-time view of an endpoint for monitoring
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointHealthReport {
    pub endpoint: String,
    pub state: EndpointState,
    pub consecutive_timeouts: u32,
    pub current_suspend_duration_ms: Option<u64>,
    pub suspended_until: Option<DateTime<Utc>>,
    pub last_error_code: Option<i32>,
    pub reported_at: DateTime<Utc>,
}

// ============================================================================
// Well-known Error Codes
// ============================================================================

/// Error codes attached to faulted messages.
///
/// Transport codes are reported by the transport layer; endpoint codes are
/// raised by the routing layer itself.
pub mod error_codes {
    pub const CONNECTION_FAILED: i32 = 101503;
    pub const CONNECTION_TIMEOUT: i32 = 101504;
    pub const CONNECTION_CLOSED: i32 = 101505;

    /// No child of a failover endpoint was ready
    pub const ENDPOINT_FAILOVER_NONE_READY: i32 = 303000;
    /// A leaf endpoint was asked to send while suspended or switched off
    pub const ENDPOINT_ADDRESS_NONE_READY: i32 = 303001;
    /// A resolving endpoint could not find its target
    pub const ENDPOINT_RESOLUTION_FAILED: i32 = 303002;
}

// ============================================================================
// Message Property Names
// ============================================================================

/// Property names the endpoint layer reads from and writes to messages
pub mod properties {
    pub const ERROR_CODE: &str = "ERROR_CODE";
    pub const ERROR_MESSAGE: &str = "ERROR_MESSAGE";
    /// Name of the endpoint that last dispatched the message
    pub const LAST_ENDPOINT: &str = "last_endpoint";
    /// Index chosen by the HTTP status failover endpoint
    pub const FAILOVER_ENDPOINT_INDEX: &str = "failover_endpoint_index";
    /// Set when a late response was dropped by a DISCARD timeout action
    pub const RESPONSE_DISCARDED: &str = "response_discarded";
    /// HTTP status of the last response, written by the transport
    pub const HTTP_STATUS_CODE: &str = "HTTP_SC";
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum FlowCatalystError {
    #[error("Configuration error: {0}")]
    Config(String),
}
