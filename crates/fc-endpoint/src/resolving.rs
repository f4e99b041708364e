//! ResolvingEndpoint - Looks up its target in the endpoint library per message
//!
//! The key is a literal name or an expression evaluated against the message.
//! The resolved endpoint is dispatched to with this endpoint on the fault
//! stack, so failures still reach the parent through the resolving endpoint.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use fc_common::error_codes;
use tracing::debug;

use crate::context::{FaultHandler, MessageContext};
use crate::endpoint::{inform_failure, Endpoint, EndpointCore, PropertyValue};
use crate::expression::Expression;
use crate::policy::EndpointPolicy;
use crate::Result;

pub struct ResolvingEndpoint {
    core: EndpointCore,
    key: PropertyValue,
}

impl ResolvingEndpoint {
    pub fn new(name: Option<String>, key: PropertyValue, policy: EndpointPolicy) -> Arc<Self> {
        Arc::new_cyclic(|this: &Weak<ResolvingEndpoint>| {
            let this: Weak<dyn Endpoint> = this.clone();
            Self {
                core: EndpointCore::new(name, policy, this),
                key,
            }
        })
    }

    /// Literal key, or `${...}` expression
    pub fn from_key(name: Option<String>, key: &str, policy: EndpointPolicy) -> Result<Arc<Self>> {
        let key = if fc_config::is_expression(key) {
            PropertyValue::Expression(Expression::parse(key)?)
        } else {
            PropertyValue::Literal(key.trim().to_string())
        };
        Ok(Self::new(name, key, policy))
    }

    fn resolve_key(&self, ctx: &MessageContext) -> Option<String> {
        match &self.key {
            PropertyValue::Literal(name) => Some(name.clone()),
            PropertyValue::Expression(expr) => expr.evaluate_text(ctx),
        }
    }
}

#[async_trait]
impl Endpoint for ResolvingEndpoint {
    fn core(&self) -> &EndpointCore {
        &self.core
    }

    async fn send(&self, ctx: &mut MessageContext) -> Result<()> {
        self.core.assert_initialized();
        let this = self.core.handle();

        let Some(key) = self.resolve_key(ctx) else {
            return inform_failure(
                this,
                ctx,
                error_codes::ENDPOINT_RESOLUTION_FAILED,
                format!("Endpoint key for '{}' did not evaluate", self.core.name()),
            )
            .await;
        };

        let Some(target) = self.core.environment().library().get(&key) else {
            return inform_failure(
                this,
                ctx,
                error_codes::ENDPOINT_RESOLUTION_FAILED,
                format!("No endpoint named '{}' in the library", key),
            )
            .await;
        };

        if target.name() == self.core.name() {
            return inform_failure(
                this,
                ctx,
                error_codes::ENDPOINT_RESOLUTION_FAILED,
                format!("Endpoint '{}' resolves to itself", key),
            )
            .await;
        }

        debug!(
            endpoint = %self.core.name(),
            target = %target.name(),
            message_id = %ctx.id(),
            "Resolved endpoint"
        );

        self.core.prepare(ctx);
        ctx.push_fault_handler(FaultHandler::Endpoint(this));
        target.send(ctx).await
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

    #[derive(Default)]
    struct RecordingTransport {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn deliver(&self, request: &DeliveryRequest, _ctx: &mut MessageContext) -> TransportOutcome {
            self.calls.lock().push(request.endpoint.clone());
            TransportOutcome::Delivered
        }
    }

    fn setup() -> (Arc<EndpointEnvironment>, Arc<RecordingTransport>) {
        let env = EndpointEnvironment::new(Duration::from_secs(5));
        let transport = Arc::new(RecordingTransport::default());
        for region in ["eu", "us"] {
            let endpoint = AddressEndpoint::new(
                Some(format!("orders-{}", region)),
                format!("http://{}.orders", region),
                EndpointPolicy::default(),
                transport.clone(),
            );
            endpoint.init(&env);
            env.library().register(endpoint);
        }
        (env, transport)
    }

    #[tokio::test]
    async fn test_resolves_from_header() {
        let (env, transport) = setup();
        let resolving =
            ResolvingEndpoint::from_key(Some("by-region".into()), "${header:x-region}", EndpointPolicy::default())
                .unwrap();
        resolving.init(&env);

        let mut ctx = MessageContext::new(Envelope::json(json!({})).with_header("x-region", "orders-us"));
        resolving.send(&mut ctx).await.unwrap();

        assert_eq!(*transport.calls.lock(), vec!["orders-us".to_string()]);
        assert!(ctx.fault_stack_empty());
    }

    #[tokio::test]
    async fn test_literal_key() {
        let (env, transport) = setup();
        let resolving = ResolvingEndpoint::from_key(None, "orders-eu", EndpointPolicy::default()).unwrap();
        resolving.init(&env);

        resolving
            .send(&mut MessageContext::new(Envelope::json(json!({}))))
            .await
            .unwrap();
        assert_eq!(*transport.calls.lock(), vec!["orders-eu".to_string()]);
    }

    #[tokio::test]
    async fn test_unknown_key_fails() {
        let (env, transport) = setup();
        let resolving =
            ResolvingEndpoint::from_key(Some("by-region".into()), "${ctx:region}", EndpointPolicy::default()).unwrap();
        resolving.init(&env);

        let mut ctx = MessageContext::new(Envelope::json(json!({})));
        ctx.set_property("region", json!("orders-apac"));
        resolving.send(&mut ctx).await.unwrap();
        assert_eq!(ctx.error_code(), Some(error_codes::ENDPOINT_RESOLUTION_FAILED));

        let mut ctx = MessageContext::new(Envelope::json(json!({})));
        resolving.send(&mut ctx).await.unwrap();
        assert_eq!(ctx.error_code(), Some(error_codes::ENDPOINT_RESOLUTION_FAILED));

        assert!(transport.calls.lock().is_empty());
    }

    #[test]
    fn test_rejects_bad_expression() {
        assert!(ResolvingEndpoint::from_key(None, "${nope:x}", EndpointPolicy::default()).is_err());
    }
}
