//! AddressEndpoint - Leaf endpoint delivering through a transport
//!
//! The wire protocol lives behind [`Transport`]. The endpoint checks its own
//! health, prepares the message, delivers, and turns the outcome into the
//! transport callbacks (`on_success` / `on_fault`).
//!
//! A timeout below `retries_on_timeout_before_suspend` never reaches the
//! caller: the endpoint waits `retry_duration_on_timeout_ms`, restores the
//! envelope it was given and delivers again.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use fc_common::{error_codes, properties, EndpointState, TimeoutAction};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::context::{FaultHandler, MessageContext};
use crate::endpoint::{
    inform_failure, invoke_next_fault_handler, report_transport_fault, report_transport_success,
    unwind_endpoint_handlers, Endpoint, EndpointCore,
};
use crate::metrics;
use crate::policy::EndpointPolicy;
use crate::Result;

/// What the transport is asked to deliver
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryRequest {
    pub endpoint: String,
    pub address: String,
    /// Enforced by the transport, not by the endpoint
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportOutcome {
    Delivered,
    Fault { code: i32, message: String },
    /// No response within the request timeout
    TimedOut,
}

impl TransportOutcome {
    pub fn fault(code: i32, message: impl Into<String>) -> Self {
        TransportOutcome::Fault {
            code,
            message: message.into(),
        }
    }
}

/// Wire-level delivery
#[async_trait]
pub trait Transport: Send + Sync {
    async fn deliver(&self, request: &DeliveryRequest, ctx: &mut MessageContext) -> TransportOutcome;
}

pub struct AddressEndpoint {
    core: EndpointCore,
    address: String,
    transport: Arc<dyn Transport>,
}

impl AddressEndpoint {
    pub fn new(
        name: Option<String>,
        address: impl Into<String>,
        policy: EndpointPolicy,
        transport: Arc<dyn Transport>,
    ) -> Arc<Self> {
        let address = address.into();
        Arc::new_cyclic(|this: &Weak<AddressEndpoint>| {
            let this: Weak<dyn Endpoint> = this.clone();
            Self {
                core: EndpointCore::new(name, policy, this),
                address,
                transport,
            }
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    async fn deliver(&self, ctx: &mut MessageContext) -> Result<()> {
        let this = self.core.handle();

        if !self.ready_to_send() {
            let state = self.core.resilience().state();
            return inform_failure(
                this,
                ctx,
                error_codes::ENDPOINT_ADDRESS_NONE_READY,
                format!("Endpoint '{}' is not ready ({:?})", self.core.name(), state),
            )
            .await;
        }

        self.core.prepare(ctx);
        ctx.set_last_endpoint(self.core.name());
        ctx.push_fault_handler(FaultHandler::Endpoint(this));

        let request = DeliveryRequest {
            endpoint: self.core.name().to_string(),
            address: self.address.clone(),
            timeout: self
                .core
                .policy()
                .timeout_for(ctx, self.core.environment().global_timeout()),
        };

        debug!(
            endpoint = %request.endpoint,
            address = %request.address,
            message_id = %ctx.id(),
            timeout_ms = request.timeout.as_millis() as u64,
            "Delivering message"
        );

        match self.transport.deliver(&request, ctx).await {
            TransportOutcome::Delivered => {
                metrics::record_delivery(self.core.name(), "delivered");
                ctx.end_dispatch(self.core.name());
                report_transport_success(ctx);
                Ok(())
            }
            TransportOutcome::Fault { code, message } => {
                metrics::record_delivery(self.core.name(), "fault");
                report_transport_fault(ctx, code, message).await
            }
            TransportOutcome::TimedOut => self.handle_timeout(request.timeout, ctx).await,
        }
    }

    async fn retry_after_timeout(&self, ctx: &mut MessageContext) -> Result<()> {
        let health = self.core.resilience().snapshot();
        let delay = Duration::from_millis(self.core.policy().suspend_settings(ctx).retry_duration_on_timeout_ms);
        info!(
            endpoint = %self.core.name(),
            message_id = %ctx.id(),
            consecutive_timeouts = health.consecutive_timeouts,
            retry_in_ms = delay.as_millis() as u64,
            "Timeout below suspend threshold, retrying"
        );

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        ctx.restore_snapshot(self.core.name());
        self.deliver(ctx).await
    }

    async fn handle_timeout(&self, timeout: Duration, ctx: &mut MessageContext) -> Result<()> {
        match self.core.policy().timeout_action(ctx) {
            TimeoutAction::Discard => {
                warn!(
                    endpoint = %self.core.name(),
                    message_id = %ctx.id(),
                    timeout_ms = timeout.as_millis() as u64,
                    "Response timed out, discarding"
                );
                metrics::record_delivery(self.core.name(), "discarded");
                ctx.set_property(properties::RESPONSE_DISCARDED, Value::Bool(true));
                unwind_endpoint_handlers(ctx);
                Ok(())
            }
            TimeoutAction::None | TimeoutAction::DiscardAndFault => {
                metrics::record_delivery(self.core.name(), "timeout");
                report_transport_fault(
                    ctx,
                    error_codes::CONNECTION_TIMEOUT,
                    format!("No response from {} within {}ms", self.address, timeout.as_millis()),
                )
                .await
            }
        }
    }
}

#[async_trait]
impl Endpoint for AddressEndpoint {
    fn core(&self) -> &EndpointCore {
        &self.core
    }

    async fn send(&self, ctx: &mut MessageContext) -> Result<()> {
        if self.core.policy().retries_on_timeout_before_suspend(ctx) > 0 {
            ctx.begin_dispatch(self.core.name());
        }
        self.deliver(ctx).await
    }

    async fn on_fault(&self, ctx: &mut MessageContext) -> Result<()> {
        let timeout = self.is_timeout(ctx);
        if self.core.apply_fault(ctx) == EndpointState::TimeoutRetry && timeout {
            return self.retry_after_timeout(ctx).await;
        }
        ctx.end_dispatch(self.core.name());
        invoke_next_fault_handler(self.core.handle(), ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::MediatorFaultHandler;
    use crate::environment::EndpointEnvironment;
    use fc_common::{Body, Envelope};
    use parking_lot::Mutex;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Replays scripted outcomes, then delivers
    struct ScriptedTransport {
        outcomes: Mutex<VecDeque<TransportOutcome>>,
        calls: AtomicUsize,
        last_request: Mutex<Option<DeliveryRequest>>,
    }

    impl ScriptedTransport {
        fn new(outcomes: Vec<TransportOutcome>) -> Arc<Self> {
            Arc::new(Self {
                outcomes: Mutex::new(outcomes.into()),
                calls: AtomicUsize::new(0),
                last_request: Mutex::new(None),
            })
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn deliver(&self, request: &DeliveryRequest, _ctx: &mut MessageContext) -> TransportOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last_request.lock() = Some(request.clone());
            self.outcomes.lock().pop_front().unwrap_or(TransportOutcome::Delivered)
        }
    }

    /// Times out once after mangling the body, then delivers
    #[derive(Default)]
    struct MangleOnTimeout {
        timed_out: AtomicUsize,
        delivered: Mutex<Vec<Body>>,
    }

    #[async_trait]
    impl Transport for MangleOnTimeout {
        async fn deliver(&self, _request: &DeliveryRequest, ctx: &mut MessageContext) -> TransportOutcome {
            if self.timed_out.fetch_add(1, Ordering::SeqCst) == 0 {
                ctx.envelope_mut().body = Body::Json(json!({"half": "written"}));
                return TransportOutcome::TimedOut;
            }
            self.delivered.lock().push(ctx.envelope().body.clone());
            TransportOutcome::Delivered
        }
    }

    #[derive(Default)]
    struct RecordingHandler {
        codes: Mutex<Vec<Option<i32>>>,
    }

    #[async_trait]
    impl MediatorFaultHandler for RecordingHandler {
        fn name(&self) -> &str {
            "recording"
        }

        async fn handle_fault(&self, ctx: &mut MessageContext) -> Result<()> {
            self.codes.lock().push(ctx.error_code());
            Ok(())
        }
    }

    fn endpoint(policy: EndpointPolicy, transport: Arc<ScriptedTransport>) -> Arc<AddressEndpoint> {
        let endpoint = AddressEndpoint::new(Some("orders".into()), "http://orders.local", policy, transport);
        endpoint.init(&EndpointEnvironment::new(Duration::from_secs(30)));
        endpoint
    }

    fn ctx() -> MessageContext {
        MessageContext::new(Envelope::json(json!({"id": 1})))
    }

    #[tokio::test]
    async fn test_delivery_success() {
        let transport = ScriptedTransport::new(vec![]);
        let endpoint = endpoint(EndpointPolicy::default(), transport.clone());

        let mut ctx = ctx();
        endpoint.send(&mut ctx).await.unwrap();

        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
        assert_eq!(ctx.last_endpoint(), Some("orders"));
        assert!(ctx.fault_stack_empty());

        let request = transport.last_request.lock().clone().unwrap();
        assert_eq!(request.address, "http://orders.local");
        assert_eq!(request.timeout, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_policy_timeout_overrides_global() {
        let transport = ScriptedTransport::new(vec![]);
        let policy = EndpointPolicy::builder().timeout_duration_ms(2500u64).build();
        let endpoint = endpoint(policy, transport.clone());

        endpoint.send(&mut ctx()).await.unwrap();
        let request = transport.last_request.lock().clone().unwrap();
        assert_eq!(request.timeout, Duration::from_millis(2500));
    }

    #[tokio::test]
    async fn test_fault_suspends() {
        let transport = ScriptedTransport::new(vec![TransportOutcome::fault(error_codes::CONNECTION_FAILED, "refused")]);
        let endpoint = endpoint(EndpointPolicy::default(), transport.clone());

        let mut ctx = ctx();
        endpoint.send(&mut ctx).await.unwrap();

        assert_eq!(ctx.error_code(), Some(error_codes::CONNECTION_FAILED));
        assert_eq!(endpoint.core().resilience().state(), EndpointState::Suspended);
        assert!(!endpoint.ready_to_send());
    }

    #[tokio::test]
    async fn test_not_ready_skips_transport() {
        let transport = ScriptedTransport::new(vec![]);
        let endpoint = endpoint(EndpointPolicy::default(), transport.clone());
        endpoint.core().resilience().switch_off();

        let mut ctx = ctx();
        endpoint.send(&mut ctx).await.unwrap();

        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
        assert_eq!(ctx.error_code(), Some(error_codes::ENDPOINT_ADDRESS_NONE_READY));
    }

    #[tokio::test]
    async fn test_timeout_counts_before_suspend() {
        let transport = ScriptedTransport::new(vec![TransportOutcome::TimedOut, TransportOutcome::TimedOut]);
        let policy = EndpointPolicy::builder().retries_on_timeout_before_suspend(1u32).build();
        let endpoint = endpoint(policy, transport.clone());

        let mut ctx = ctx();
        endpoint.send(&mut ctx).await.unwrap();

        assert_eq!(transport.calls.load(Ordering::SeqCst), 2);
        assert_eq!(ctx.error_code(), Some(error_codes::CONNECTION_TIMEOUT));
        assert_eq!(endpoint.core().resilience().state(), EndpointState::Suspended);
        assert!(ctx.fault_stack_empty());
    }

    #[tokio::test]
    async fn test_timeout_retry_stays_local() {
        let transport = ScriptedTransport::new(vec![TransportOutcome::TimedOut]);
        let policy = EndpointPolicy::builder()
            .retries_on_timeout_before_suspend(2u32)
            .retry_duration_on_timeout_ms(40u64)
            .build();
        let endpoint = endpoint(policy, transport.clone());
        let handler = Arc::new(RecordingHandler::default());

        let mut ctx = ctx();
        ctx.push_fault_handler(FaultHandler::Sequence(handler.clone()));
        let started = std::time::Instant::now();
        endpoint.send(&mut ctx).await.unwrap();

        assert!(started.elapsed() >= Duration::from_millis(40));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 2);
        assert!(handler.codes.lock().is_empty());
        assert_eq!(ctx.fault_stack_len(), 1);
        assert_eq!(endpoint.core().resilience().state(), EndpointState::Active);
    }

    #[tokio::test]
    async fn test_timeout_discard_keeps_health() {
        let transport = ScriptedTransport::new(vec![TransportOutcome::TimedOut]);
        let policy = EndpointPolicy::builder().timeout_action(TimeoutAction::Discard).build();
        let endpoint = endpoint(policy, transport);

        let mut ctx = ctx();
        endpoint.send(&mut ctx).await.unwrap();

        assert_eq!(ctx.property(properties::RESPONSE_DISCARDED), Some(&json!(true)));
        assert_eq!(ctx.error_code(), None);
        assert!(ctx.fault_stack_empty());
        assert_eq!(endpoint.core().resilience().state(), EndpointState::Active);
    }

    #[tokio::test]
    async fn test_success_recovers_timeout_retry() {
        let transport = ScriptedTransport::new(vec![TransportOutcome::TimedOut]);
        let policy = EndpointPolicy::builder().retries_on_timeout_before_suspend(3u32).build();
        let endpoint = endpoint(policy, transport.clone());

        endpoint.send(&mut ctx()).await.unwrap();

        let health = endpoint.core().resilience().snapshot();
        assert_eq!(transport.calls.load(Ordering::SeqCst), 2);
        assert_eq!(health.state, EndpointState::Active);
        assert_eq!(health.consecutive_timeouts, 0);
    }

    #[tokio::test]
    async fn test_timeout_retry_restores_envelope() {
        let transport = Arc::new(MangleOnTimeout::default());
        let policy = EndpointPolicy::builder().retries_on_timeout_before_suspend(1u32).build();
        let endpoint = AddressEndpoint::new(Some("orders".into()), "http://orders.local", policy, transport.clone());
        endpoint.init(&EndpointEnvironment::new(Duration::from_secs(30)));

        endpoint.send(&mut ctx()).await.unwrap();

        assert_eq!(*transport.delivered.lock(), vec![Body::Json(json!({"id": 1}))]);
    }
}
