//! HttpStatusFailoverEndpoint - Failover driven by response status codes
//!
//! Transport faults fail over the same way as [`FailoverEndpoint`]. In
//! addition, when the engine reports a response whose HTTP status is one of
//! the configured failover codes, the message is re-sent to the next ready
//! child after the one that answered. The chosen index is recorded on the
//! message under `FAILOVER_ENDPOINT_INDEX`.
//!
//! [`FailoverEndpoint`]: crate::failover::FailoverEndpoint

use std::collections::BTreeSet;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use fc_common::{error_codes, properties};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::context::{FaultHandler, MessageContext};
use crate::endpoint::{inform_failure, invoke_next_fault_handler, Endpoint, EndpointCore};
use crate::metrics;
use crate::policy::EndpointPolicy;
use crate::Result;

pub struct HttpStatusFailoverEndpoint {
    core: EndpointCore,
    children: Vec<Arc<dyn Endpoint>>,
    failover_status_codes: BTreeSet<u16>,
}

impl HttpStatusFailoverEndpoint {
    pub fn new(
        name: Option<String>,
        children: Vec<Arc<dyn Endpoint>>,
        failover_status_codes: impl IntoIterator<Item = u16>,
        policy: EndpointPolicy,
    ) -> Arc<Self> {
        let failover_status_codes = failover_status_codes.into_iter().collect();
        Arc::new_cyclic(|this: &Weak<HttpStatusFailoverEndpoint>| {
            let this: Weak<dyn Endpoint> = this.clone();
            for child in &children {
                child.core().set_parent(this.clone());
            }
            Self {
                core: EndpointCore::new(name, policy, this),
                children,
                failover_status_codes,
            }
        })
    }

    pub fn is_failover_status(&self, status: u16) -> bool {
        self.failover_status_codes.contains(&status)
    }

    /// Index recorded on the message by the last dispatch
    pub fn recorded_index(ctx: &MessageContext) -> Option<usize> {
        ctx.property(properties::FAILOVER_ENDPOINT_INDEX)
            .and_then(Value::as_u64)
            .and_then(|i| usize::try_from(i).ok())
    }

    /// Send to the first ready child at or after `start`
    async fn dispatch_from(&self, start: usize, ctx: &mut MessageContext) -> Result<()> {
        let this = self.core.handle();

        let selected = if self.core.resilience().ready_to_send() {
            self.children
                .iter()
                .enumerate()
                .skip(start)
                .find(|(_, child)| child.ready_to_send())
                .map(|(index, child)| (index, child.clone()))
        } else {
            None
        };

        let Some((index, child)) = selected else {
            metrics::record_failover_exhausted(self.core.name());
            ctx.end_dispatch(self.core.name());
            return inform_failure(
                this,
                ctx,
                error_codes::ENDPOINT_FAILOVER_NONE_READY,
                format!(
                    "No ready child endpoints after position {} for '{}'",
                    start,
                    self.core.name()
                ),
            )
            .await;
        };

        ctx.set_property(properties::FAILOVER_ENDPOINT_INDEX, Value::from(index as u64));
        ctx.record_attempt(self.core.name(), child.name());
        debug!(
            endpoint = %self.core.name(),
            child = %child.name(),
            index = index,
            message_id = %ctx.id(),
            "Status failover endpoint selected child"
        );

        ctx.push_fault_handler(FaultHandler::Endpoint(this));
        child.send(ctx).await
    }

    fn next_start(ctx: &MessageContext) -> usize {
        Self::recorded_index(ctx).map_or(0, |index| index + 1)
    }
}

#[async_trait]
impl Endpoint for HttpStatusFailoverEndpoint {
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
        ctx.remove_property(properties::FAILOVER_ENDPOINT_INDEX);
        self.dispatch_from(0, ctx).await
    }

    async fn on_child_endpoint_fail(&self, child: Arc<dyn Endpoint>, ctx: &mut MessageContext) -> Result<()> {
        ctx.restore_snapshot(self.core.name());
        ctx.record_failure(child.name(), ctx.error_code());

        if child.is_retryable(ctx) {
            metrics::record_failover_switch(self.core.name());
            self.dispatch_from(Self::next_start(ctx), ctx).await
        } else {
            warn!(
                endpoint = %self.core.name(),
                child = %child.name(),
                error_code = ?ctx.error_code(),
                "Child endpoint failed with a non-retryable error"
            );
            ctx.end_dispatch(self.core.name());
            invoke_next_fault_handler(self.core.handle(), ctx).await
        }
    }

    async fn on_response_status(&self, status: u16, ctx: &mut MessageContext) -> Result<bool> {
        if !self.is_failover_status(status) {
            return Ok(false);
        }

        let start = Self::next_start(ctx);
        info!(
            endpoint = %self.core.name(),
            status = status,
            next_index = start,
            message_id = %ctx.id(),
            "Response status triggers failover"
        );

        ctx.set_property(properties::HTTP_STATUS_CODE, Value::from(status));
        ctx.restore_snapshot(self.core.name());
        metrics::record_failover_switch(self.core.name());
        self.dispatch_from(start, ctx).await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::{AddressEndpoint, DeliveryRequest, Transport, TransportOutcome};
    use crate::environment::EndpointEnvironment;
    use fc_common::Envelope;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::time::Duration;

    /// Always delivers; answers with a per-endpoint status
    struct StatusTransport {
        statuses: Vec<(&'static str, u16)>,
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Transport for StatusTransport {
        async fn deliver(&self, request: &DeliveryRequest, ctx: &mut MessageContext) -> TransportOutcome {
            self.calls.lock().push(request.endpoint.clone());
            let status = self
                .statuses
                .iter()
                .find(|(name, _)| *name == request.endpoint)
                .map_or(200, |(_, status)| *status);
            ctx.set_property(properties::HTTP_STATUS_CODE, Value::from(status));
            TransportOutcome::Delivered
        }
    }

    fn setup(statuses: Vec<(&'static str, u16)>) -> (Arc<HttpStatusFailoverEndpoint>, Arc<StatusTransport>) {
        let transport = Arc::new(StatusTransport {
            statuses,
            calls: Mutex::new(Vec::new()),
        });
        let children: Vec<Arc<dyn Endpoint>> = ["a", "b", "c"]
            .iter()
            .map(|name| {
                let endpoint: Arc<dyn Endpoint> = AddressEndpoint::new(
                    Some(name.to_string()),
                    format!("http://{}", name),
                    EndpointPolicy::default(),
                    transport.clone(),
                );
                endpoint
            })
            .collect();
        let router =
            HttpStatusFailoverEndpoint::new(Some("status".into()), children, [502, 503], EndpointPolicy::default());
        router.init(&EndpointEnvironment::new(Duration::from_secs(5)));
        (router, transport)
    }

    /// Mimics the engine: send, then report statuses until no failover happens
    async fn drive(router: &HttpStatusFailoverEndpoint, ctx: &mut MessageContext) {
        router.send(ctx).await.unwrap();
        loop {
            let status = ctx
                .property(properties::HTTP_STATUS_CODE)
                .and_then(Value::as_u64)
                .map(|s| s as u16);
            match status {
                Some(status) if router.on_response_status(status, ctx).await.unwrap() => {
                    if ctx.error_code() == Some(error_codes::ENDPOINT_FAILOVER_NONE_READY) {
                        break;
                    }
                }
                _ => break,
            }
        }
    }

    #[tokio::test]
    async fn test_advances_past_bad_status() {
        let (router, transport) = setup(vec![("a", 503)]);
        let mut ctx = MessageContext::new(Envelope::json(json!({})));

        drive(&router, &mut ctx).await;

        assert_eq!(*transport.calls.lock(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(HttpStatusFailoverEndpoint::recorded_index(&ctx), Some(1));
    }

    #[tokio::test]
    async fn test_skips_not_ready_children() {
        let (router, transport) = setup(vec![("a", 502)]);
        router.children()[1].core().resilience().switch_off();
        let mut ctx = MessageContext::new(Envelope::json(json!({})));

        drive(&router, &mut ctx).await;

        assert_eq!(*transport.calls.lock(), vec!["a".to_string(), "c".to_string()]);
        assert_eq!(HttpStatusFailoverEndpoint::recorded_index(&ctx), Some(2));
    }

    #[tokio::test]
    async fn test_exhausts_at_end_of_list() {
        let (router, transport) = setup(vec![("a", 503), ("b", 503), ("c", 503)]);
        let mut ctx = MessageContext::new(Envelope::json(json!({})));

        drive(&router, &mut ctx).await;

        assert_eq!(transport.calls.lock().len(), 3);
        assert_eq!(ctx.error_code(), Some(error_codes::ENDPOINT_FAILOVER_NONE_READY));
    }

    #[tokio::test]
    async fn test_resend_starts_from_first_child() {
        let (router, transport) = setup(vec![("a", 503)]);
        let mut ctx = MessageContext::new(Envelope::json(json!({})));

        drive(&router, &mut ctx).await;
        drive(&router, &mut ctx).await;

        assert_eq!(*transport.calls.lock(), vec!["a", "b", "a", "b"]);
        assert_eq!(ctx.error_code(), None);
    }

    #[tokio::test]
    async fn test_other_status_is_ignored() {
        let (router, _) = setup(vec![]);
        let mut ctx = MessageContext::new(Envelope::json(json!({})));
        router.send(&mut ctx).await.unwrap();

        assert!(!router.on_response_status(500, &mut ctx).await.unwrap());
        assert_eq!(HttpStatusFailoverEndpoint::recorded_index(&ctx), Some(0));
    }
}
