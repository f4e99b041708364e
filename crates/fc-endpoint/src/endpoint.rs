//! Endpoint - dispatch contract shared by every endpoint variant
//!
//! An endpoint sends a message, keeps its own health, and reports failures
//! back up the message's fault-handler stack:
//!
//! ```text
//! router.send ──push(router)──► leaf.send ──push(leaf)──► transport
//!                                                            │ fault
//!                          pop(leaf) ◄───────────────────────┘
//!                          leaf.on_fault  (classify, update health)
//!                          pop(router) -> router.on_child_endpoint_fail
//! ```
//!
//! Variants implement [`Endpoint`] and embed an [`EndpointCore`] holding the
//! name, policy, resilience context, property bag, and lifecycle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use dashmap::DashMap;
use fc_common::{error_codes, EndpointState};
use fc_config::{is_expression, PropertyConfig, PropertyScopeConfig};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::context::{FaultHandler, MediatorFaultHandler, MessageContext};
use crate::environment::EndpointEnvironment;
use crate::expression::Expression;
use crate::policy::EndpointPolicy;
use crate::resilience::ResilienceContext;
use crate::Result;

// ============================================================================
// Endpoint Trait
// ============================================================================

#[async_trait]
pub trait Endpoint: Send + Sync {
    fn core(&self) -> &EndpointCore;

    fn name(&self) -> &str {
        self.core().name()
    }

    fn children(&self) -> &[Arc<dyn Endpoint>] {
        &[]
    }

    fn is_leaf(&self) -> bool {
        self.children().is_empty()
    }

    /// Idempotent; cascades to children
    fn init(&self, env: &Arc<EndpointEnvironment>) {
        if self.core().init(env) {
            for child in self.children() {
                child.init(env);
            }
        }
    }

    fn destroy(&self) {
        self.core().destroy();
        for child in self.children() {
            child.destroy();
        }
    }

    /// Panics when called before `init`
    fn ready_to_send(&self) -> bool {
        self.core().assert_initialized();
        self.core().resilience().ready_to_send()
    }

    /// Dispatch the message. Delivery failures are reported through the
    /// fault-handler stack; `Err` means a fault handler itself failed.
    async fn send(&self, ctx: &mut MessageContext) -> Result<()>;

    /// Transport callback: classify the fault, update health, propagate
    async fn on_fault(&self, ctx: &mut MessageContext) -> Result<()> {
        self.core().apply_fault(ctx);
        invoke_next_fault_handler(self.core().handle(), ctx).await
    }

    fn on_success(&self) {
        self.core().resilience().on_success();
    }

    /// Called when a child this endpoint dispatched to has failed
    async fn on_child_endpoint_fail(&self, child: Arc<dyn Endpoint>, ctx: &mut MessageContext) -> Result<()> {
        debug!(
            endpoint = %self.name(),
            child = %child.name(),
            message_id = %ctx.id(),
            "Child endpoint failed, passing fault upward"
        );
        invoke_next_fault_handler(self.core().handle(), ctx).await
    }

    /// Response inspection hook; `true` when the endpoint re-routed the message
    async fn on_response_status(&self, _status: u16, _ctx: &mut MessageContext) -> Result<bool> {
        Ok(false)
    }

    fn is_retryable(&self, ctx: &MessageContext) -> bool {
        self.core().policy().classify_retryable(ctx.error_code(), ctx)
    }

    fn is_timeout(&self, ctx: &MessageContext) -> bool {
        self.core().policy().classify_timeout(ctx.error_code(), ctx)
    }

    fn is_suspend_fault(&self, ctx: &MessageContext) -> bool {
        self.core().policy().classify_suspend(ctx.error_code(), ctx)
    }

    /// Attempts a router may spend on this endpoint for a single message
    fn attempt_budget(&self, ctx: &MessageContext) -> u32 {
        self.core()
            .policy()
            .retries_on_timeout_before_suspend(ctx)
            .saturating_add(1)
    }
}

// ============================================================================
// Properties
// ============================================================================

/// Where an endpoint property lands on the outgoing message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PropertyScope {
    /// Message property
    #[default]
    Default,
    /// Transport header
    Transport,
}

#[derive(Debug, Clone)]
pub enum PropertyValue {
    Literal(String),
    Expression(Expression),
}

#[derive(Debug, Clone)]
pub struct EndpointProperty {
    pub name: String,
    pub value: PropertyValue,
    pub scope: PropertyScope,
}

impl EndpointProperty {
    pub fn literal(name: impl Into<String>, value: impl Into<String>, scope: PropertyScope) -> Self {
        Self {
            name: name.into(),
            value: PropertyValue::Literal(value.into()),
            scope,
        }
    }

    pub fn expression(name: impl Into<String>, expr: Expression, scope: PropertyScope) -> Self {
        Self {
            name: name.into(),
            value: PropertyValue::Expression(expr),
            scope,
        }
    }

    pub fn from_config(config: &PropertyConfig) -> Result<Self> {
        let scope = match config.scope {
            PropertyScopeConfig::Default => PropertyScope::Default,
            PropertyScopeConfig::Transport => PropertyScope::Transport,
        };
        if is_expression(&config.value) {
            Ok(Self::expression(&config.name, Expression::parse(&config.value)?, scope))
        } else {
            Ok(Self::literal(&config.name, &config.value, scope))
        }
    }

    pub fn evaluate(&self, ctx: &MessageContext) -> Option<String> {
        match &self.value {
            PropertyValue::Literal(value) => Some(value.clone()),
            PropertyValue::Expression(expr) => expr.evaluate_text(ctx),
        }
    }
}

// ============================================================================
// EndpointCore
// ============================================================================

/// State every endpoint variant embeds
pub struct EndpointCore {
    name: String,
    policy: EndpointPolicy,
    resilience: Arc<ResilienceContext>,
    properties: DashMap<String, EndpointProperty>,
    parent: RwLock<Option<Weak<dyn Endpoint>>>,
    this: Weak<dyn Endpoint>,
    environment: Mutex<Option<Arc<EndpointEnvironment>>>,
    initialized: AtomicBool,
    content_aware: AtomicBool,
}

impl EndpointCore {
    /// `this` is the weak self-reference handed out by `Arc::new_cyclic`
    pub fn new(name: Option<String>, policy: EndpointPolicy, this: Weak<dyn Endpoint>) -> Self {
        let name = name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| format!("anonymous-{}", uuid::Uuid::new_v4()));

        Self {
            resilience: Arc::new(ResilienceContext::new(name.clone())),
            name,
            policy,
            properties: DashMap::new(),
            parent: RwLock::new(None),
            this,
            environment: Mutex::new(None),
            initialized: AtomicBool::new(false),
            content_aware: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn policy(&self) -> &EndpointPolicy {
        &self.policy
    }

    pub fn resilience(&self) -> &Arc<ResilienceContext> {
        &self.resilience
    }

    /// Shared handle to the endpoint embedding this core
    pub fn handle(&self) -> Arc<dyn Endpoint> {
        self.this
            .upgrade()
            .unwrap_or_else(|| panic!("endpoint '{}' used after it was dropped", self.name))
    }

    /// Owning router; configuration rejects children shared between routers
    pub fn parent(&self) -> Option<Arc<dyn Endpoint>> {
        self.parent.read().as_ref().and_then(Weak::upgrade)
    }

    pub fn set_parent(&self, parent: Weak<dyn Endpoint>) {
        *self.parent.write() = Some(parent);
    }

    pub fn is_content_aware(&self) -> bool {
        self.content_aware.load(Ordering::Acquire)
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Returns true for the call that actually initialized the endpoint
    pub fn init(&self, env: &Arc<EndpointEnvironment>) -> bool {
        let mut environment = self.environment.lock();
        if environment.is_some() {
            return false;
        }

        let content_aware = self.policy.requires_content();
        self.content_aware.store(content_aware, Ordering::Release);
        env.monitor().register(&self.name, self.resilience.clone());
        *environment = Some(env.clone());
        self.initialized.store(true, Ordering::Release);

        info!(endpoint = %self.name, content_aware = content_aware, "Endpoint initialized");
        true
    }

    pub fn destroy(&self) {
        let mut environment = self.environment.lock();
        if let Some(env) = environment.take() {
            env.monitor().unregister(&self.name);
            self.initialized.store(false, Ordering::Release);
            info!(endpoint = %self.name, "Endpoint destroyed");
        }
    }

    pub fn assert_initialized(&self) {
        if !self.is_initialized() {
            panic!("endpoint '{}' used before init()", self.name);
        }
    }

    /// Environment passed to `init`; panics before `init`
    pub fn environment(&self) -> Arc<EndpointEnvironment> {
        self.environment
            .lock()
            .clone()
            .unwrap_or_else(|| panic!("endpoint '{}' used before init()", self.name))
    }

    // ------------------------------------------------------------------
    // Property bag
    // ------------------------------------------------------------------

    pub fn add_property(&self, property: EndpointProperty) {
        self.properties.insert(property.name.clone(), property);
    }

    pub fn property(&self, name: &str) -> Option<EndpointProperty> {
        self.properties.get(name).map(|p| p.value().clone())
    }

    pub fn remove_property(&self, name: &str) -> Option<EndpointProperty> {
        self.properties.remove(name).map(|(_, p)| p)
    }

    /// Materialize the body when required and attach the property bag
    pub fn prepare(&self, ctx: &mut MessageContext) {
        if self.is_content_aware() && !ctx.envelope().body.is_materialized() {
            ctx.envelope_mut().materialize();
        }

        for entry in self.properties.iter() {
            let property = entry.value();
            let Some(value) = property.evaluate(ctx) else {
                warn!(
                    endpoint = %self.name,
                    property = %property.name,
                    message_id = %ctx.id(),
                    "Endpoint property did not evaluate, skipping"
                );
                continue;
            };
            match property.scope {
                PropertyScope::Default => ctx.set_property(property.name.clone(), Value::String(value)),
                PropertyScope::Transport => {
                    ctx.envelope_mut().headers.insert(property.name.clone(), value);
                }
            }
        }
    }

    /// Classify the fault on the message and drive the health transition
    pub fn apply_fault(&self, ctx: &MessageContext) -> EndpointState {
        let code = ctx.error_code();
        let settings = self.policy.suspend_settings(ctx);

        if self.policy.classify_timeout(code, ctx) {
            self.resilience.on_timeout(&settings, code)
        } else if self.policy.classify_suspend(code, ctx) {
            self.resilience.on_suspend_fault(&settings, code)
        } else {
            self.resilience.record_ignored_fault(code);
            debug!(
                endpoint = %self.name,
                error_code = ?code,
                message_id = %ctx.id(),
                "Fault does not affect endpoint health"
            );
            self.resilience.state()
        }
    }
}

impl std::fmt::Debug for EndpointCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointCore")
            .field("name", &self.name)
            .field("initialized", &self.is_initialized())
            .field("health", &self.resilience.snapshot())
            .finish()
    }
}

// ============================================================================
// Fault Propagation
// ============================================================================

/// Pop the next fault handler and hand it the failure raised by `source`
pub async fn invoke_next_fault_handler(source: Arc<dyn Endpoint>, ctx: &mut MessageContext) -> Result<()> {
    match ctx.pop_fault_handler() {
        Some(FaultHandler::Endpoint(parent)) => {
            debug!(
                endpoint = %source.name(),
                parent = %parent.name(),
                message_id = %ctx.id(),
                "Propagating fault to parent endpoint"
            );
            parent.on_child_endpoint_fail(source, ctx).await
        }
        Some(FaultHandler::Sequence(sequence)) => run_sequence_handler(sequence, ctx).await,
        Some(FaultHandler::Generic(handler)) => run_handler(handler, ctx).await,
        None => run_terminal(ctx).await,
    }
}

/// Set the error on the message and propagate it without touching health
pub async fn inform_failure(
    source: Arc<dyn Endpoint>,
    ctx: &mut MessageContext,
    code: i32,
    message: impl Into<String>,
) -> Result<()> {
    let message = message.into();
    warn!(
        endpoint = %source.name(),
        message_id = %ctx.id(),
        error_code = code,
        error = %message,
        "Endpoint failure"
    );
    ctx.set_error(code, message);
    invoke_next_fault_handler(source, ctx).await
}

/// Transport callback for a failed delivery: the endpoint on top of the
/// stack receives `on_fault`
pub async fn report_transport_fault(ctx: &mut MessageContext, code: i32, message: impl Into<String>) -> Result<()> {
    ctx.set_error(code, message);
    match ctx.pop_fault_handler() {
        Some(FaultHandler::Endpoint(endpoint)) => endpoint.on_fault(ctx).await,
        Some(FaultHandler::Sequence(sequence)) => run_sequence_handler(sequence, ctx).await,
        Some(FaultHandler::Generic(handler)) => run_handler(handler, ctx).await,
        None => run_terminal(ctx).await,
    }
}

/// Transport callback for a delivery: the delivering endpoint recovers and
/// the endpoint entries above the mediator handlers are unwound
pub fn report_transport_success(ctx: &mut MessageContext) {
    match ctx.pop_fault_handler() {
        Some(FaultHandler::Endpoint(endpoint)) => endpoint.on_success(),
        Some(other) => {
            ctx.push_fault_handler(other);
            return;
        }
        None => return,
    }
    unwind_endpoint_handlers(ctx);
}

/// Drop every endpoint entry on top of the stack
pub fn unwind_endpoint_handlers(ctx: &mut MessageContext) {
    while ctx.peek_fault_handler().map_or(false, FaultHandler::is_endpoint) {
        ctx.pop_fault_handler();
    }
}

async fn run_sequence_handler(sequence: Arc<dyn MediatorFaultHandler>, ctx: &mut MessageContext) -> Result<()> {
    match last_sequence_override(ctx) {
        Some(last) => {
            debug!(
                handler = %last.name(),
                bypassed = %sequence.name(),
                message_id = %ctx.id(),
                "Connection failure routed to last sequence fault handler"
            );
            run_handler(last, ctx).await
        }
        None => run_handler(sequence, ctx).await,
    }
}

async fn run_handler(handler: Arc<dyn MediatorFaultHandler>, ctx: &mut MessageContext) -> Result<()> {
    debug!(handler = %handler.name(), message_id = %ctx.id(), "Invoking fault handler");
    handler.handle_fault(ctx).await
}

async fn run_terminal(ctx: &mut MessageContext) -> Result<()> {
    match last_sequence_override(ctx) {
        Some(last) => run_handler(last, ctx).await,
        None => {
            warn!(
                message_id = %ctx.id(),
                error_code = ?ctx.error_code(),
                error = ?ctx.error_message(),
                "Fault reached the bottom of the handler stack, absorbing"
            );
            Ok(())
        }
    }
}

/// The last sequence fault handler wins only for connection failures
fn last_sequence_override(ctx: &MessageContext) -> Option<Arc<dyn MediatorFaultHandler>> {
    if ctx.error_code() == Some(error_codes::CONNECTION_FAILED) {
        ctx.last_sequence_fault_handler()
    } else {
        None
    }
}
