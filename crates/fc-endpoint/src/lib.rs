//! FlowCatalyst Endpoint Layer
//!
//! Decides where each outbound message goes and tracks destination health:
//! - ResilienceContext: per-endpoint health state machine with suspend backoff
//! - EndpointPolicy: timeouts, backoff and error-code classification, literal or per-message
//! - Endpoint: dispatch contract and fault-handler-stack propagation
//! - FailoverEndpoint / HttpStatusFailoverEndpoint: routing across child endpoints
//! - ResolvingEndpoint: per-message lookup in the endpoint library
//! - EndpointMonitor: operator view (switch off/on, health reports)
//! - EndpointBuilder: endpoint trees from TOML configuration

pub mod address;
pub mod builder;
pub mod context;
pub mod endpoint;
pub mod environment;
pub mod error;
pub mod expression;
pub mod failover;
pub mod metrics;
pub mod policy;
pub mod resilience;
pub mod resolving;
pub mod status_failover;

pub use address::{AddressEndpoint, DeliveryRequest, Transport, TransportOutcome};
pub use builder::{EndpointBuilder, EndpointTree};
pub use context::{AttemptRecord, FaultHandler, MediatorFaultHandler, MessageContext};
pub use endpoint::{
    inform_failure, invoke_next_fault_handler, report_transport_fault, report_transport_success,
    unwind_endpoint_handlers, Endpoint, EndpointCore, EndpointProperty, PropertyScope, PropertyValue,
};
pub use environment::{EndpointEnvironment, EndpointLibrary, EndpointMonitor};
pub use error::EndpointError;
pub use expression::Expression;
pub use failover::{FailoverEndpoint, FailoverMode};
pub use policy::{EndpointPolicy, EndpointPolicyBuilder, ErrorCodeSet, PolicyValue, SuspendSettings};
pub use resilience::{HealthSnapshot, ResilienceContext};
pub use resolving::ResolvingEndpoint;
pub use status_failover::HttpStatusFailoverEndpoint;

pub type Result<T> = std::result::Result<T, EndpointError>;
