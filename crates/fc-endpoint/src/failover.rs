//! FailoverEndpoint - Routes each message to the first ready child
//!
//! Modes:
//! - DYNAMIC: scan children in order on every send; recovers back to the
//!   first child as soon as it is ready again
//! - STATIC: stick with the current child until it stops being ready
//!
//! Every `send` opens a fresh dispatch frame on the message. On a child
//! failure the router restores the envelope the frame saw on entry and
//! re-dispatches when the child's policy allows a retry. Each child gets at
//! most `attempt_budget` attempts per dispatch.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use fc_common::error_codes;
use fc_config::FailoverModeConfig;
use tracing::{debug, info, warn};

use crate::context::{FaultHandler, MessageContext};
use crate::endpoint::{inform_failure, invoke_next_fault_handler, Endpoint, EndpointCore};
use crate::metrics;
use crate::policy::EndpointPolicy;
use crate::Result;

const NO_CURRENT: usize = usize::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailoverMode {
    #[default]
    Dynamic,
    Static,
}

impl From<FailoverModeConfig> for FailoverMode {
    fn from(mode: FailoverModeConfig) -> Self {
        match mode {
            FailoverModeConfig::Dynamic => FailoverMode::Dynamic,
            FailoverModeConfig::Static => FailoverMode::Static,
        }
    }
}

pub struct FailoverEndpoint {
    core: EndpointCore,
    mode: FailoverMode,
    children: Vec<Arc<dyn Endpoint>>,
    /// STATIC mode only: index of the sticky child
    current: AtomicUsize,
}

impl FailoverEndpoint {
    pub fn new(
        name: Option<String>,
        mode: FailoverMode,
        children: Vec<Arc<dyn Endpoint>>,
        policy: EndpointPolicy,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this: &Weak<FailoverEndpoint>| {
            let this: Weak<dyn Endpoint> = this.clone();
            for child in &children {
                child.core().set_parent(this.clone());
            }
            Self {
                core: EndpointCore::new(name, policy, this),
                mode,
                children,
                current: AtomicUsize::new(NO_CURRENT),
            }
        })
    }

    pub fn mode(&self) -> FailoverMode {
        self.mode
    }

    /// Sticky child in STATIC mode
    pub fn current_endpoint(&self) -> Option<Arc<dyn Endpoint>> {
        self.children.get(self.current.load(Ordering::Acquire)).cloned()
    }

    fn eligible(&self, child: &Arc<dyn Endpoint>, ctx: &MessageContext) -> bool {
        child.ready_to_send() && ctx.spent(self.core.name(), child.name()) < child.attempt_budget(ctx)
    }

    fn first_eligible(&self, ctx: &MessageContext) -> Option<usize> {
        self.children.iter().position(|child| self.eligible(child, ctx))
    }

    fn select_child(&self, ctx: &MessageContext) -> Option<usize> {
        match self.mode {
            FailoverMode::Dynamic => self.first_eligible(ctx),
            FailoverMode::Static => self.select_sticky(ctx),
        }
    }

    fn select_sticky(&self, ctx: &MessageContext) -> Option<usize> {
        let current = self.ready_current()?;
        if self.eligible(&self.children[current], ctx) {
            Some(current)
        } else {
            // healthy but spent for this message: stays sticky for others
            self.first_eligible(ctx)
        }
    }

    /// Sticky child while it is ready, otherwise the first ready child is
    /// adopted. Per-message budgets never move `current`.
    fn ready_current(&self) -> Option<usize> {
        loop {
            let current = self.current.load(Ordering::Acquire);
            if let Some(child) = self.children.get(current) {
                if child.ready_to_send() {
                    return Some(current);
                }
            }

            let next = self
                .children
                .iter()
                .position(|child| child.ready_to_send())
                .unwrap_or(NO_CURRENT);
            match self
                .current
                .compare_exchange(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    if next != NO_CURRENT {
                        info!(
                            endpoint = %self.core.name(),
                            child = %self.children[next].name(),
                            "Adopting new current endpoint"
                        );
                    }
                    return (next != NO_CURRENT).then_some(next);
                }
                // another message swapped first; re-check what it adopted
                Err(_) => continue,
            }
        }
    }

    async fn dispatch(&self, ctx: &mut MessageContext) -> Result<()> {
        let this = self.core.handle();

        let selected = if self.core.resilience().ready_to_send() {
            self.select_child(ctx)
        } else {
            None
        };

        let Some(index) = selected else {
            metrics::record_failover_exhausted(self.core.name());
            ctx.end_dispatch(self.core.name());
            return inform_failure(
                this,
                ctx,
                error_codes::ENDPOINT_FAILOVER_NONE_READY,
                format!("No ready child endpoints for failover endpoint '{}'", self.core.name()),
            )
            .await;
        };

        let child = self.children[index].clone();
        let attempt = ctx.record_attempt(self.core.name(), child.name());
        debug!(
            endpoint = %self.core.name(),
            child = %child.name(),
            index = index,
            attempt = attempt,
            message_id = %ctx.id(),
            "Failover endpoint selected child"
        );

        ctx.push_fault_handler(FaultHandler::Endpoint(this));
        child.send(ctx).await
    }
}

#[async_trait]
impl Endpoint for FailoverEndpoint {
    fn core(&self) -> &EndpointCore {
        &self.core
    }

    fn children(&self) -> &[Arc<dyn Endpoint>] {
        &self.children
    }

    fn ready_to_send(&self) -> bool {
        self.core.assert_initialized();
        self.core.resilience().ready_to_send() && self.children.iter().any(|child| child.ready_to_send())
    }

    async fn send(&self, ctx: &mut MessageContext) -> Result<()> {
        self.core.assert_initialized();
        ctx.begin_dispatch(self.core.name());
        self.dispatch(ctx).await
    }

    async fn on_child_endpoint_fail(&self, child: Arc<dyn Endpoint>, ctx: &mut MessageContext) -> Result<()> {
        ctx.restore_snapshot(self.core.name());
        ctx.record_failure(child.name(), ctx.error_code());

        if child.is_retryable(ctx) {
            info!(
                endpoint = %self.core.name(),
                child = %child.name(),
                error_code = ?ctx.error_code(),
                message_id = %ctx.id(),
                "Child endpoint failed, failing over"
            );
            metrics::record_failover_switch(self.core.name());
            self.dispatch(ctx).await
        } else {
            warn!(
                endpoint = %self.core.name(),
                child = %child.name(),
                error_code = ?ctx.error_code(),
                message_id = %ctx.id(),
                "Child endpoint failed with a non-retryable error"
            );
            ctx.end_dispatch(self.core.name());
            invoke_next_fault_handler(self.core.handle(), ctx).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::{AddressEndpoint, DeliveryRequest, Transport, TransportOutcome};
    use crate::environment::EndpointEnvironment;
    use crate::policy::ErrorCodeSet;
    use fc_common::{Body, EndpointState, Envelope};
    use parking_lot::Mutex;
    use serde_json::json;
    use std::collections::HashMap;
    use std::time::Duration;

    /// Fails deliveries to the configured addresses, records every call
    #[derive(Default)]
    struct RoutingTransport {
        failing: Mutex<HashMap<String, i32>>,
        calls: Mutex<Vec<String>>,
        bodies: Mutex<Vec<Body>>,
    }

    impl RoutingTransport {
        fn fail(&self, endpoint: &str, code: i32) {
            self.failing.lock().insert(endpoint.to_string(), code);
        }

        fn heal(&self, endpoint: &str) {
            self.failing.lock().remove(endpoint);
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl Transport for RoutingTransport {
        async fn deliver(&self, request: &DeliveryRequest, ctx: &mut MessageContext) -> TransportOutcome {
            self.calls.lock().push(request.endpoint.clone());
            let failing = self.failing.lock().get(&request.endpoint).copied();
            match failing {
                Some(code) => {
                    // partial mutation before failing
                    ctx.envelope_mut().body = Body::Json(json!({"mangled": request.endpoint}));
                    TransportOutcome::fault(code, "failed")
                }
                None => {
                    self.bodies.lock().push(ctx.envelope().body.clone());
                    TransportOutcome::Delivered
                }
            }
        }
    }

    fn leaf(name: &str, policy: EndpointPolicy, transport: &Arc<RoutingTransport>) -> Arc<dyn Endpoint> {
        let transport: Arc<dyn Transport> = transport.clone();
        AddressEndpoint::new(Some(name.to_string()), format!("mem://{}", name), policy, transport)
    }

    fn suspending() -> EndpointPolicy {
        EndpointPolicy::builder().initial_suspend_duration_ms(60_000i64).build()
    }

    fn router(mode: FailoverMode, children: Vec<Arc<dyn Endpoint>>) -> Arc<FailoverEndpoint> {
        let router = FailoverEndpoint::new(Some("router".into()), mode, children, EndpointPolicy::default());
        router.init(&EndpointEnvironment::new(Duration::from_secs(5)));
        router
    }

    fn ctx() -> MessageContext {
        MessageContext::new(Envelope::json(json!({"order": 42})))
    }

    #[tokio::test]
    async fn test_dynamic_prefers_first_ready() {
        let transport = Arc::new(RoutingTransport::default());
        let a = leaf("a", suspending(), &transport);
        let b = leaf("b", suspending(), &transport);
        let router = router(FailoverMode::Dynamic, vec![a.clone(), b.clone()]);

        router.send(&mut ctx()).await.unwrap();
        router.send(&mut ctx()).await.unwrap();
        assert_eq!(transport.calls(), vec!["a", "a"]);
    }

    #[tokio::test]
    async fn test_fails_over_with_original_envelope() {
        let transport = Arc::new(RoutingTransport::default());
        transport.fail("a", 500);
        let a = leaf("a", suspending(), &transport);
        let b = leaf("b", suspending(), &transport);
        let router = router(FailoverMode::Dynamic, vec![a.clone(), b.clone()]);

        let mut ctx = ctx();
        router.send(&mut ctx).await.unwrap();

        assert_eq!(transport.calls(), vec!["a", "b"]);
        assert_eq!(*transport.bodies.lock(), vec![Body::Json(json!({"order": 42}))]);
        assert_eq!(a.core().resilience().state(), EndpointState::Suspended);
        assert!(ctx.fault_stack_empty());
        assert_eq!(ctx.attempt_log()["a"].last_error_code, Some(500));
    }

    #[tokio::test]
    async fn test_non_retryable_propagates() {
        let transport = Arc::new(RoutingTransport::default());
        transport.fail("a", 400);
        let no_retry = EndpointPolicy::builder()
            .retry_disabled_error_codes(ErrorCodeSet::from([400]))
            .build();
        let a = leaf("a", no_retry, &transport);
        let b = leaf("b", suspending(), &transport);
        let router = router(FailoverMode::Dynamic, vec![a, b]);

        let mut ctx = ctx();
        router.send(&mut ctx).await.unwrap();

        assert_eq!(transport.calls(), vec!["a"]);
        assert_eq!(ctx.error_code(), Some(400));
    }

    #[tokio::test]
    async fn test_ignored_fault_does_not_loop() {
        let transport = Arc::new(RoutingTransport::default());
        transport.fail("a", 500);
        transport.fail("b", 500);
        // 500 is not a suspend code, so both children stay ready
        let only_503 = || {
            EndpointPolicy::builder()
                .suspend_error_codes(ErrorCodeSet::from([503]))
                .build()
        };
        let a = leaf("a", only_503(), &transport);
        let b = leaf("b", only_503(), &transport);
        let router = router(FailoverMode::Dynamic, vec![a.clone(), b.clone()]);

        let mut ctx = ctx();
        router.send(&mut ctx).await.unwrap();

        assert_eq!(transport.calls(), vec!["a", "b"]);
        assert_eq!(ctx.error_code(), Some(error_codes::ENDPOINT_FAILOVER_NONE_READY));
        assert!(a.ready_to_send() && b.ready_to_send());
    }

    #[tokio::test]
    async fn test_static_sticks_until_not_ready() {
        let transport = Arc::new(RoutingTransport::default());
        let a = leaf("a", suspending(), &transport);
        let b = leaf("b", suspending(), &transport);
        let router = router(FailoverMode::Static, vec![a.clone(), b.clone()]);
        assert!(router.current_endpoint().is_none());

        for _ in 0..3 {
            router.send(&mut ctx()).await.unwrap();
        }
        assert_eq!(router.current_endpoint().unwrap().name(), "a");

        transport.fail("a", 500);
        router.send(&mut ctx()).await.unwrap();
        assert_eq!(router.current_endpoint().unwrap().name(), "b");

        // a healed but STATIC stays on b
        transport.heal("a");
        a.core().resilience().switch_on();
        router.send(&mut ctx()).await.unwrap();
        assert_eq!(transport.calls(), vec!["a", "a", "a", "a", "b", "b"]);
    }

    #[tokio::test]
    async fn test_same_message_sent_repeatedly() {
        let transport = Arc::new(RoutingTransport::default());
        let a = leaf("a", suspending(), &transport);
        let b = leaf("b", suspending(), &transport);
        let router = router(FailoverMode::Dynamic, vec![a, b]);

        let mut ctx = ctx();
        for _ in 0..3 {
            router.send(&mut ctx).await.unwrap();
        }

        assert_eq!(transport.calls(), vec!["a", "a", "a"]);
        assert_eq!(ctx.error_code(), None);
        assert_eq!(ctx.attempt_log()["a"].attempts, 3);
    }

    #[tokio::test]
    async fn test_later_dispatch_restores_its_own_envelope() {
        let transport = Arc::new(RoutingTransport::default());
        let a = leaf("a", suspending(), &transport);
        let b = leaf("b", suspending(), &transport);
        let router = router(FailoverMode::Dynamic, vec![a, b]);

        let mut ctx = ctx();
        router.send(&mut ctx).await.unwrap();

        ctx.envelope_mut().body = Body::Json(json!({"order": 43}));
        transport.fail("a", 500);
        router.send(&mut ctx).await.unwrap();

        assert_eq!(transport.calls(), vec!["a", "a", "b"]);
        assert_eq!(
            *transport.bodies.lock(),
            vec![Body::Json(json!({"order": 42})), Body::Json(json!({"order": 43}))]
        );
    }

    #[tokio::test]
    async fn test_static_adoption_ignores_message_budget() {
        let transport = Arc::new(RoutingTransport::default());
        let a = leaf("a", suspending(), &transport);
        let b = leaf("b", suspending(), &transport);
        let router = router(FailoverMode::Static, vec![a.clone(), b.clone()]);
        router.send(&mut ctx()).await.unwrap();
        assert_eq!(router.current_endpoint().unwrap().name(), "a");

        // this message already spent b, then a goes down
        let mut spent = ctx();
        spent.begin_dispatch("router");
        spent.record_attempt("router", "b");
        a.core().resilience().switch_off();

        assert_eq!(router.select_child(&spent), None);
        assert_eq!(router.current_endpoint().unwrap().name(), "b");

        router.send(&mut ctx()).await.unwrap();
        assert_eq!(transport.calls(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_router_admin_off() {
        let transport = Arc::new(RoutingTransport::default());
        let a = leaf("a", suspending(), &transport);
        let router = router(FailoverMode::Dynamic, vec![a]);
        assert!(router.ready_to_send());

        router.core().resilience().switch_off();
        assert!(!router.ready_to_send());

        let mut ctx = ctx();
        router.send(&mut ctx).await.unwrap();
        assert!(transport.calls().is_empty());
        assert_eq!(ctx.error_code(), Some(error_codes::ENDPOINT_FAILOVER_NONE_READY));
    }

    #[test]
    fn test_mode_from_config() {
        assert_eq!(FailoverMode::from(FailoverModeConfig::Static), FailoverMode::Static);
        assert_eq!(FailoverMode::default(), FailoverMode::Dynamic);
    }
}
