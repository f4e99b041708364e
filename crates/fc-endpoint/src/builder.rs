//! EndpointBuilder - Turns an `EndpointsConfig` into live endpoints
//!
//! Children are built before their parents, shared children are built once,
//! every named endpoint is registered in the environment's library, and the
//! whole tree is initialized before it is handed out.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use fc_config::{EndpointConfig, EndpointKind, EndpointsConfig};
use indexmap::IndexMap;
use tracing::info;

use crate::address::{AddressEndpoint, Transport};
use crate::endpoint::{Endpoint, EndpointProperty};
use crate::environment::EndpointEnvironment;
use crate::error::EndpointError;
use crate::failover::FailoverEndpoint;
use crate::policy::EndpointPolicy;
use crate::resolving::ResolvingEndpoint;
use crate::status_failover::HttpStatusFailoverEndpoint;
use crate::Result;

/// Initialized endpoints built from one configuration
pub struct EndpointTree {
    env: Arc<EndpointEnvironment>,
    endpoints: IndexMap<String, Arc<dyn Endpoint>>,
    roots: Vec<Arc<dyn Endpoint>>,
}

impl EndpointTree {
    pub fn environment(&self) -> &Arc<EndpointEnvironment> {
        &self.env
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Endpoint>> {
        self.endpoints.get(name).cloned()
    }

    /// Endpoints no other endpoint uses as a child, in config order
    pub fn roots(&self) -> &[Arc<dyn Endpoint>] {
        &self.roots
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.endpoints.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    /// Destroy every endpoint and empty the library
    pub fn destroy(&self) {
        for endpoint in self.endpoints.values() {
            endpoint.destroy();
        }
        self.env.library().clear();
        info!(endpoints = self.endpoints.len(), "Endpoint tree destroyed");
    }
}

pub struct EndpointBuilder {
    transport: Arc<dyn Transport>,
}

impl EndpointBuilder {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    /// Build into a fresh environment using the configured global timeout
    pub fn build(&self, config: &EndpointsConfig) -> Result<EndpointTree> {
        let env = EndpointEnvironment::new(Duration::from_millis(config.defaults.global_timeout_ms));
        self.build_in(config, env)
    }

    pub fn build_in(&self, config: &EndpointsConfig, env: Arc<EndpointEnvironment>) -> Result<EndpointTree> {
        config.validate()?;

        let mut built = HashMap::new();
        let mut endpoints = IndexMap::new();
        let root_configs = config.roots();
        let mut roots = Vec::new();

        for endpoint_config in &config.endpoints {
            let endpoint = self.build_endpoint(endpoint_config, config, &mut built)?;
            endpoints.insert(endpoint.name().to_string(), endpoint.clone());
            if root_configs.iter().any(|root| std::ptr::eq(*root, endpoint_config)) {
                roots.push(endpoint);
            }
        }

        for endpoint in built.values() {
            env.library().register(endpoint.clone());
        }
        for endpoint in endpoints.values() {
            endpoint.init(&env);
        }

        info!(
            endpoints = endpoints.len(),
            roots = roots.len(),
            global_timeout_ms = config.defaults.global_timeout_ms,
            "Endpoint tree built"
        );

        Ok(EndpointTree { env, endpoints, roots })
    }

    fn build_endpoint(
        &self,
        endpoint_config: &EndpointConfig,
        config: &EndpointsConfig,
        built: &mut HashMap<String, Arc<dyn Endpoint>>,
    ) -> Result<Arc<dyn Endpoint>> {
        if let Some(existing) = endpoint_config.name.as_ref().and_then(|name| built.get(name)) {
            return Ok(existing.clone());
        }

        let mut children = Vec::with_capacity(endpoint_config.children.len());
        for child_name in &endpoint_config.children {
            let child_config = config
                .endpoint(child_name)
                .ok_or_else(|| EndpointError::UnknownEndpoint(child_name.clone()))?;
            children.push(self.build_endpoint(child_config, config, built)?);
        }

        let name = endpoint_config.name.clone();
        let policy = EndpointPolicy::from_config(&endpoint_config.policy)?;

        let endpoint: Arc<dyn Endpoint> = match endpoint_config.kind {
            EndpointKind::Address => AddressEndpoint::new(
                name,
                endpoint_config.address.clone().unwrap_or_default(),
                policy,
                self.transport.clone(),
            ),
            EndpointKind::Failover => FailoverEndpoint::new(name, endpoint_config.mode.into(), children, policy),
            EndpointKind::HttpStatusFailover => HttpStatusFailoverEndpoint::new(
                name,
                children,
                endpoint_config.failover_http_status_codes.iter().copied(),
                policy,
            ),
            EndpointKind::Resolving => {
                ResolvingEndpoint::from_key(name, endpoint_config.key.as_deref().unwrap_or_default(), policy)?
            }
        };

        for property in &endpoint_config.properties {
            endpoint.core().add_property(EndpointProperty::from_config(property)?);
        }

        if let Some(name) = &endpoint_config.name {
            built.insert(name.clone(), endpoint.clone());
        }
        Ok(endpoint)
    }
}
