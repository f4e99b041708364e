//! MessageContext - Per-message state carried through endpoint dispatch
//!
//! Everything that belongs to one in-flight message lives here rather than on
//! the (shared) endpoints:
//! - property bag (error code/message, last endpoint marker, ...)
//! - the fault-handler stack used to propagate failures upward
//! - one dispatch frame per router: the envelope it saw on entry and the
//!   attempts it has spent on each child during that dispatch
//! - the attempt log keyed by endpoint name

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use fc_common::{properties, Envelope};
use indexmap::IndexMap;
use serde_json::Value;

use crate::endpoint::Endpoint;
use crate::Result;

/// Fault handler installed by the mediation engine (sequence or generic)
#[async_trait]
pub trait MediatorFaultHandler: Send + Sync {
    fn name(&self) -> &str;

    async fn handle_fault(&self, ctx: &mut MessageContext) -> Result<()>;
}

/// Entry on a message's fault-handler stack
#[derive(Clone)]
pub enum FaultHandler {
    /// A parent endpoint waiting to hear about its child's failure
    Endpoint(Arc<dyn Endpoint>),
    /// A mediator fault sequence
    Sequence(Arc<dyn MediatorFaultHandler>),
    Generic(Arc<dyn MediatorFaultHandler>),
}

impl FaultHandler {
    pub fn name(&self) -> &str {
        match self {
            FaultHandler::Endpoint(endpoint) => endpoint.name(),
            FaultHandler::Sequence(handler) | FaultHandler::Generic(handler) => handler.name(),
        }
    }

    pub fn is_endpoint(&self) -> bool {
        matches!(self, FaultHandler::Endpoint(_))
    }
}

impl fmt::Debug for FaultHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FaultHandler::Endpoint(_) => write!(f, "Endpoint({})", self.name()),
            FaultHandler::Sequence(_) => write!(f, "Sequence({})", self.name()),
            FaultHandler::Generic(_) => write!(f, "Generic({})", self.name()),
        }
    }
}

/// Attempts made against one endpoint for the current message
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttemptRecord {
    pub attempts: u32,
    pub last_error_code: Option<i32>,
}

/// State of one dispatch through a router
#[derive(Debug, Clone)]
struct DispatchFrame {
    snapshot: Envelope,
    spent: HashMap<String, u32>,
}

pub struct MessageContext {
    envelope: Envelope,
    properties: HashMap<String, Value>,
    fault_stack: Vec<FaultHandler>,
    /// Open dispatches keyed by the endpoint that opened them
    frames: HashMap<String, DispatchFrame>,
    attempt_log: IndexMap<String, AttemptRecord>,
    last_sequence_fault_handler: Option<Arc<dyn MediatorFaultHandler>>,
}

impl MessageContext {
    pub fn new(envelope: Envelope) -> Self {
        Self {
            envelope,
            properties: HashMap::new(),
            fault_stack: Vec::new(),
            frames: HashMap::new(),
            attempt_log: IndexMap::new(),
            last_sequence_fault_handler: None,
        }
    }

    /// Message id (the envelope id)
    pub fn id(&self) -> &str {
        &self.envelope.id
    }

    // ------------------------------------------------------------------
    // Properties
    // ------------------------------------------------------------------

    pub fn property(&self, name: &str) -> Option<&Value> {
        self.properties.get(name)
    }

    pub fn set_property(&mut self, name: impl Into<String>, value: Value) {
        self.properties.insert(name.into(), value);
    }

    pub fn remove_property(&mut self, name: &str) -> Option<Value> {
        self.properties.remove(name)
    }

    pub fn error_code(&self) -> Option<i32> {
        self.properties
            .get(properties::ERROR_CODE)
            .and_then(Value::as_i64)
            .and_then(|code| i32::try_from(code).ok())
    }

    pub fn error_message(&self) -> Option<&str> {
        self.properties.get(properties::ERROR_MESSAGE).and_then(Value::as_str)
    }

    pub fn set_error(&mut self, code: i32, message: impl Into<String>) {
        self.set_property(properties::ERROR_CODE, Value::from(code));
        self.set_property(properties::ERROR_MESSAGE, Value::String(message.into()));
    }

    pub fn last_endpoint(&self) -> Option<&str> {
        self.properties.get(properties::LAST_ENDPOINT).and_then(Value::as_str)
    }

    pub fn set_last_endpoint(&mut self, name: &str) {
        self.set_property(properties::LAST_ENDPOINT, Value::String(name.to_string()));
    }

    pub fn set_last_sequence_fault_handler(&mut self, handler: Arc<dyn MediatorFaultHandler>) {
        self.last_sequence_fault_handler = Some(handler);
    }

    pub fn last_sequence_fault_handler(&self) -> Option<Arc<dyn MediatorFaultHandler>> {
        self.last_sequence_fault_handler.clone()
    }

    // ------------------------------------------------------------------
    // Envelope
    // ------------------------------------------------------------------

    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    pub fn envelope_mut(&mut self) -> &mut Envelope {
        &mut self.envelope
    }

    pub fn set_envelope(&mut self, envelope: Envelope) {
        self.envelope = envelope;
    }

    /// Open a fresh dispatch for `key`: snapshot the envelope and forget
    /// attempts spent by earlier dispatches of the same message
    pub fn begin_dispatch(&mut self, key: &str) {
        self.frames.insert(
            key.to_string(),
            DispatchFrame {
                snapshot: self.envelope.clone(),
                spent: HashMap::new(),
            },
        );
    }

    /// Put the saved envelope back; the frame stays open for later attempts
    pub fn restore_snapshot(&mut self, key: &str) -> bool {
        match self.frames.get(key) {
            Some(frame) => {
                self.envelope = frame.snapshot.clone();
                true
            }
            None => false,
        }
    }

    pub fn end_dispatch(&mut self, key: &str) {
        self.frames.remove(key);
    }

    // ------------------------------------------------------------------
    // Fault-handler stack
    // ------------------------------------------------------------------

    pub fn push_fault_handler(&mut self, handler: FaultHandler) {
        self.fault_stack.push(handler);
    }

    pub fn pop_fault_handler(&mut self) -> Option<FaultHandler> {
        self.fault_stack.pop()
    }

    pub fn peek_fault_handler(&self) -> Option<&FaultHandler> {
        self.fault_stack.last()
    }

    pub fn fault_stack_empty(&self) -> bool {
        self.fault_stack.is_empty()
    }

    pub fn fault_stack_len(&self) -> usize {
        self.fault_stack.len()
    }

    // ------------------------------------------------------------------
    // Attempt log
    // ------------------------------------------------------------------

    /// Count a dispatch from `router` to `endpoint` in the open frame and in
    /// the attempt log; returns the attempt number within the frame
    pub fn record_attempt(&mut self, router: &str, endpoint: &str) -> u32 {
        self.attempt_log.entry(endpoint.to_string()).or_default().attempts += 1;
        match self.frames.get_mut(router) {
            Some(frame) => {
                let spent = frame.spent.entry(endpoint.to_string()).or_default();
                *spent += 1;
                *spent
            }
            None => 1,
        }
    }

    pub fn record_failure(&mut self, endpoint: &str, error_code: Option<i32>) {
        self.attempt_log.entry(endpoint.to_string()).or_default().last_error_code = error_code;
    }

    /// Attempts `router` has spent on `endpoint` in its open dispatch
    pub fn spent(&self, router: &str, endpoint: &str) -> u32 {
        self.frames
            .get(router)
            .and_then(|frame| frame.spent.get(endpoint))
            .copied()
            .unwrap_or(0)
    }

    /// Endpoints in the order they were first tried
    pub fn attempt_log(&self) -> &IndexMap<String, AttemptRecord> {
        &self.attempt_log
    }
}

impl fmt::Debug for MessageContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageContext")
            .field("id", &self.envelope.id)
            .field("properties", &self.properties)
            .field("fault_stack", &self.fault_stack)
            .field("attempt_log", &self.attempt_log)
            .finish()
    }
}
