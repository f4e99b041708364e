//! EndpointPolicy - Resilience configuration attached to every endpoint
//!
//! Each value is either a literal or an expression evaluated against the
//! message being dispatched. Evaluation never fails: an expression that is
//! absent or unparseable logs a warning and the field's default is used.
//!
//! Error classification:
//! - timeout: empty set means connection-timeout / connection-closed only
//! - suspend: empty set means every error suspends (fail closed)
//! - retry: disabled codes win, a non-empty enabled set is an allow-list,
//!   otherwise retry (fail open)

use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use fc_common::{error_codes, TimeoutAction};
use fc_config::{ConfigValue, PolicyConfig};
use serde_json::Value;
use tracing::{debug, warn};

use crate::context::MessageContext;
use crate::error::EndpointError;
use crate::expression::Expression;

/// Suspend duration used when no initial duration is configured
pub const DEFAULT_SUSPEND_DURATION_MS: u64 = 30_000;
/// Upper bound used when no maximum is configured
pub const DEFAULT_SUSPEND_MAXIMUM_MS: u64 = i64::MAX as u64;

// ============================================================================
// Policy Values
// ============================================================================

/// Conversion from an evaluated expression result into a policy field type
pub trait PolicyLiteral: Clone + fmt::Debug + Send + Sync {
    fn from_value(value: &Value) -> Option<Self>;
}

impl PolicyLiteral for u64 {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

impl PolicyLiteral for i64 {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

impl PolicyLiteral for u32 {
    fn from_value(value: &Value) -> Option<Self> {
        u64::from_value(value).and_then(|v| u32::try_from(v).ok())
    }
}

impl PolicyLiteral for f64 {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

impl PolicyLiteral for TimeoutAction {
    fn from_value(value: &Value) -> Option<Self> {
        value.as_str().and_then(|s| s.parse().ok())
    }
}

/// Set of error codes used by the classification checks
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorCodeSet(BTreeSet<i32>);

impl ErrorCodeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, code: i32) -> bool {
        self.0.contains(&code)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl FromIterator<i32> for ErrorCodeSet {
    fn from_iter<I: IntoIterator<Item = i32>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<const N: usize> From<[i32; N]> for ErrorCodeSet {
    fn from(codes: [i32; N]) -> Self {
        codes.into_iter().collect()
    }
}

impl From<Vec<i32>> for ErrorCodeSet {
    fn from(codes: Vec<i32>) -> Self {
        codes.into_iter().collect()
    }
}

impl PolicyLiteral for ErrorCodeSet {
    /// Accepts a JSON array of numbers, a single number, or comma separated text
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Array(items) => items
                .iter()
                .map(|v| v.as_i64().and_then(|n| i32::try_from(n).ok()))
                .collect::<Option<Vec<i32>>>()
                .map(ErrorCodeSet::from),
            Value::Number(n) => n.as_i64().and_then(|n| i32::try_from(n).ok()).map(|c| ErrorCodeSet::from([c])),
            Value::String(s) => s
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(|p| p.parse::<i32>().ok())
                .collect::<Option<Vec<i32>>>()
                .map(ErrorCodeSet::from),
            _ => None,
        }
    }
}

/// A policy field: a literal, or an expression evaluated per message
#[derive(Debug, Clone)]
pub enum PolicyValue<T> {
    Literal(T),
    Expression(Expression),
}

impl<T> From<T> for PolicyValue<T> {
    fn from(value: T) -> Self {
        PolicyValue::Literal(value)
    }
}

impl<T: PolicyLiteral> PolicyValue<T> {
    pub fn expression(expr: Expression) -> Self {
        PolicyValue::Expression(expr)
    }

    /// Resolve against a message, substituting `default` when evaluation fails
    pub fn resolve(&self, ctx: &MessageContext, field: &str, default: T) -> T {
        match self {
            PolicyValue::Literal(value) => value.clone(),
            PolicyValue::Expression(expr) => match expr.evaluate(ctx) {
                Some(raw) => match T::from_value(&raw) {
                    Some(value) => value,
                    None => {
                        warn!(
                            field = field,
                            expression = %expr,
                            value = %raw,
                            message_id = %ctx.id(),
                            default = ?default,
                            "Policy expression produced an unusable value, using default"
                        );
                        default
                    }
                },
                None => {
                    warn!(
                        field = field,
                        expression = %expr,
                        message_id = %ctx.id(),
                        default = ?default,
                        "Policy expression did not evaluate, using default"
                    );
                    default
                }
            },
        }
    }

    fn from_config(value: Option<&ConfigValue<T>>, default: T) -> Result<Self, EndpointError> {
        match value {
            None => Ok(PolicyValue::Literal(default)),
            Some(ConfigValue::Literal(v)) => Ok(PolicyValue::Literal(v.clone())),
            Some(ConfigValue::Expression(raw)) => Ok(PolicyValue::Expression(Expression::parse(raw)?)),
        }
    }
}

// ============================================================================
// Resolved Settings
// ============================================================================

/// Suspend/retry parameters resolved for one message
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SuspendSettings {
    pub initial_suspend_ms: u64,
    pub progression_factor: f64,
    pub maximum_suspend_ms: u64,
    pub retries_on_timeout_before_suspend: u32,
    pub retry_duration_on_timeout_ms: u64,
}

impl Default for SuspendSettings {
    fn default() -> Self {
        Self {
            initial_suspend_ms: DEFAULT_SUSPEND_DURATION_MS,
            progression_factor: 1.0,
            maximum_suspend_ms: DEFAULT_SUSPEND_MAXIMUM_MS,
            retries_on_timeout_before_suspend: 0,
            retry_duration_on_timeout_ms: 0,
        }
    }
}

impl SuspendSettings {
    /// Duration of a fresh suspension
    pub fn first_suspend_ms(&self) -> u64 {
        self.initial_suspend_ms.min(self.maximum_suspend_ms)
    }

    /// Duration of a suspension that extends a running one. Never shrinks.
    pub fn next_suspend_ms(&self, current_ms: u64) -> u64 {
        let grown = (current_ms as f64 * self.progression_factor).max(current_ms as f64);
        (grown as u64).min(self.maximum_suspend_ms)
    }
}

// ============================================================================
// EndpointPolicy
// ============================================================================

#[derive(Debug, Clone)]
pub struct EndpointPolicy {
    /// `None` falls back to the environment's global timeout
    timeout_duration_ms: Option<PolicyValue<u64>>,
    timeout_action: PolicyValue<TimeoutAction>,
    /// Negative means "use the default suspend duration"
    initial_suspend_duration_ms: PolicyValue<i64>,
    suspend_progression_factor: PolicyValue<f64>,
    suspend_maximum_duration_ms: PolicyValue<u64>,
    suspend_error_codes: PolicyValue<ErrorCodeSet>,
    timeout_error_codes: PolicyValue<ErrorCodeSet>,
    retries_on_timeout_before_suspend: PolicyValue<u32>,
    retry_duration_on_timeout_ms: PolicyValue<u64>,
    retry_disabled_error_codes: PolicyValue<ErrorCodeSet>,
    retry_enabled_error_codes: PolicyValue<ErrorCodeSet>,
    format: Option<String>,
    security_enabled: bool,
    reliable_messaging_enabled: bool,
}

impl Default for EndpointPolicy {
    fn default() -> Self {
        Self {
            timeout_duration_ms: None,
            timeout_action: PolicyValue::Literal(TimeoutAction::None),
            initial_suspend_duration_ms: PolicyValue::Literal(-1),
            suspend_progression_factor: PolicyValue::Literal(1.0),
            suspend_maximum_duration_ms: PolicyValue::Literal(DEFAULT_SUSPEND_MAXIMUM_MS),
            suspend_error_codes: PolicyValue::Literal(ErrorCodeSet::new()),
            timeout_error_codes: PolicyValue::Literal(ErrorCodeSet::new()),
            retries_on_timeout_before_suspend: PolicyValue::Literal(0),
            retry_duration_on_timeout_ms: PolicyValue::Literal(0),
            retry_disabled_error_codes: PolicyValue::Literal(ErrorCodeSet::new()),
            retry_enabled_error_codes: PolicyValue::Literal(ErrorCodeSet::new()),
            format: None,
            security_enabled: false,
            reliable_messaging_enabled: false,
        }
    }
}

impl EndpointPolicy {
    pub fn builder() -> EndpointPolicyBuilder {
        EndpointPolicyBuilder::default()
    }

    /// Build from the config file model, parsing expressions up front
    pub fn from_config(config: &PolicyConfig) -> Result<Self, EndpointError> {
        let timeout_duration_ms = match &config.timeout_duration_ms {
            None => None,
            Some(value) => Some(PolicyValue::from_config(Some(value), 0)?),
        };

        let policy = Self {
            timeout_duration_ms,
            timeout_action: PolicyValue::from_config(config.timeout_action.as_ref(), TimeoutAction::None)?,
            initial_suspend_duration_ms: PolicyValue::from_config(config.initial_suspend_duration_ms.as_ref(), -1)?,
            suspend_progression_factor: PolicyValue::from_config(config.suspend_progression_factor.as_ref(), 1.0)?,
            suspend_maximum_duration_ms: PolicyValue::from_config(
                config.suspend_maximum_duration_ms.as_ref(),
                DEFAULT_SUSPEND_MAXIMUM_MS,
            )?,
            suspend_error_codes: codes_from_config(config.suspend_error_codes.as_ref())?,
            timeout_error_codes: codes_from_config(config.timeout_error_codes.as_ref())?,
            retries_on_timeout_before_suspend: PolicyValue::from_config(
                config.retries_on_timeout_before_suspend.as_ref(),
                0,
            )?,
            retry_duration_on_timeout_ms: PolicyValue::from_config(config.retry_duration_on_timeout_ms.as_ref(), 0)?,
            retry_disabled_error_codes: codes_from_config(config.retry_disabled_error_codes.as_ref())?,
            retry_enabled_error_codes: codes_from_config(config.retry_enabled_error_codes.as_ref())?,
            format: config.format.clone(),
            security_enabled: config.security_enabled,
            reliable_messaging_enabled: config.reliable_messaging_enabled,
        };
        Ok(policy)
    }

    /// Timeout for the outgoing call, falling back to the global timeout
    pub fn timeout_for(&self, ctx: &MessageContext, global: Duration) -> Duration {
        match &self.timeout_duration_ms {
            None => global,
            Some(value) => {
                let fallback = u64::try_from(global.as_millis()).unwrap_or(u64::MAX);
                Duration::from_millis(value.resolve(ctx, "timeout_duration_ms", fallback))
            }
        }
    }

    pub fn timeout_action(&self, ctx: &MessageContext) -> TimeoutAction {
        self.timeout_action.resolve(ctx, "timeout_action", TimeoutAction::None)
    }

    pub fn suspend_settings(&self, ctx: &MessageContext) -> SuspendSettings {
        let initial = self.initial_suspend_duration_ms.resolve(ctx, "initial_suspend_duration_ms", -1);
        let factor = self.suspend_progression_factor.resolve(ctx, "suspend_progression_factor", 1.0);
        let factor = if factor.is_finite() && factor >= 0.0 {
            factor
        } else {
            warn!(factor = factor, message_id = %ctx.id(), "Invalid suspend progression factor, using 1.0");
            1.0
        };

        SuspendSettings {
            initial_suspend_ms: u64::try_from(initial).unwrap_or(DEFAULT_SUSPEND_DURATION_MS),
            progression_factor: factor,
            maximum_suspend_ms: self.suspend_maximum_duration_ms.resolve(
                ctx,
                "suspend_maximum_duration_ms",
                DEFAULT_SUSPEND_MAXIMUM_MS,
            ),
            retries_on_timeout_before_suspend: self.retries_on_timeout_before_suspend(ctx),
            retry_duration_on_timeout_ms: self.retry_duration_on_timeout_ms.resolve(
                ctx,
                "retry_duration_on_timeout_ms",
                0,
            ),
        }
    }

    pub fn retries_on_timeout_before_suspend(&self, ctx: &MessageContext) -> u32 {
        self.retries_on_timeout_before_suspend
            .resolve(ctx, "retries_on_timeout_before_suspend", 0)
    }

    pub fn classify_timeout(&self, code: Option<i32>, ctx: &MessageContext) -> bool {
        let Some(code) = code else {
            return false;
        };
        let codes = self.timeout_error_codes.resolve(ctx, "timeout_error_codes", ErrorCodeSet::new());
        let is_timeout = if codes.is_empty() {
            code == error_codes::CONNECTION_TIMEOUT || code == error_codes::CONNECTION_CLOSED
        } else {
            codes.contains(code)
        };
        debug!(code = code, is_timeout = is_timeout, "Timeout classification");
        is_timeout
    }

    pub fn classify_suspend(&self, code: Option<i32>, ctx: &MessageContext) -> bool {
        let Some(code) = code else {
            return false;
        };
        let codes = self.suspend_error_codes.resolve(ctx, "suspend_error_codes", ErrorCodeSet::new());
        codes.is_empty() || codes.contains(code)
    }

    pub fn classify_retryable(&self, code: Option<i32>, ctx: &MessageContext) -> bool {
        let disabled = self
            .retry_disabled_error_codes
            .resolve(ctx, "retry_disabled_error_codes", ErrorCodeSet::new());
        let enabled = self
            .retry_enabled_error_codes
            .resolve(ctx, "retry_enabled_error_codes", ErrorCodeSet::new());

        match code {
            Some(code) if disabled.contains(code) => false,
            Some(code) if !enabled.is_empty() => enabled.contains(code),
            None if !enabled.is_empty() => false,
            _ => true,
        }
    }

    /// True when the outgoing message has to be fully parsed before send
    pub fn requires_content(&self) -> bool {
        self.format.is_some() || self.security_enabled || self.reliable_messaging_enabled
    }

    pub fn format(&self) -> Option<&str> {
        self.format.as_deref()
    }
}

fn codes_from_config(value: Option<&ConfigValue<Vec<i32>>>) -> Result<PolicyValue<ErrorCodeSet>, EndpointError> {
    match value {
        None => Ok(PolicyValue::Literal(ErrorCodeSet::new())),
        Some(ConfigValue::Literal(codes)) => Ok(PolicyValue::Literal(ErrorCodeSet::from(codes.clone()))),
        Some(ConfigValue::Expression(raw)) => Ok(PolicyValue::Expression(Expression::parse(raw)?)),
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Fluent construction of policies in code and tests
#[derive(Debug, Clone, Default)]
pub struct EndpointPolicyBuilder {
    policy: EndpointPolicy,
}

impl EndpointPolicyBuilder {
    pub fn timeout_duration_ms(mut self, value: impl Into<PolicyValue<u64>>) -> Self {
        self.policy.timeout_duration_ms = Some(value.into());
        self
    }

    pub fn timeout_action(mut self, value: impl Into<PolicyValue<TimeoutAction>>) -> Self {
        self.policy.timeout_action = value.into();
        self
    }

    pub fn initial_suspend_duration_ms(mut self, value: impl Into<PolicyValue<i64>>) -> Self {
        self.policy.initial_suspend_duration_ms = value.into();
        self
    }

    pub fn suspend_progression_factor(mut self, value: impl Into<PolicyValue<f64>>) -> Self {
        self.policy.suspend_progression_factor = value.into();
        self
    }

    pub fn suspend_maximum_duration_ms(mut self, value: impl Into<PolicyValue<u64>>) -> Self {
        self.policy.suspend_maximum_duration_ms = value.into();
        self
    }

    pub fn suspend_error_codes(mut self, value: impl Into<PolicyValue<ErrorCodeSet>>) -> Self {
        self.policy.suspend_error_codes = value.into();
        self
    }

    pub fn timeout_error_codes(mut self, value: impl Into<PolicyValue<ErrorCodeSet>>) -> Self {
        self.policy.timeout_error_codes = value.into();
        self
    }

    pub fn retries_on_timeout_before_suspend(mut self, value: impl Into<PolicyValue<u32>>) -> Self {
        self.policy.retries_on_timeout_before_suspend = value.into();
        self
    }

    pub fn retry_duration_on_timeout_ms(mut self, value: impl Into<PolicyValue<u64>>) -> Self {
        self.policy.retry_duration_on_timeout_ms = value.into();
        self
    }

    pub fn retry_disabled_error_codes(mut self, value: impl Into<PolicyValue<ErrorCodeSet>>) -> Self {
        self.policy.retry_disabled_error_codes = value.into();
        self
    }

    pub fn retry_enabled_error_codes(mut self, value: impl Into<PolicyValue<ErrorCodeSet>>) -> Self {
        self.policy.retry_enabled_error_codes = value.into();
        self
    }

    pub fn format(mut self, format: impl Into<String>) -> Self {
        self.policy.format = Some(format.into());
        self
    }

    pub fn security_enabled(mut self, enabled: bool) -> Self {
        self.policy.security_enabled = enabled;
        self
    }

    pub fn reliable_messaging_enabled(mut self, enabled: bool) -> Self {
        self.policy.reliable_messaging_enabled = enabled;
        self
    }

    pub fn build(self) -> EndpointPolicy {
        self.policy
    }
}
