//! Endpoint environment - collaborators handed to endpoints at init
//!
//! - `EndpointMonitor`: health registry for operators (switch off/on, reports)
//! - `EndpointLibrary`: named endpoints that resolving endpoints look up

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use fc_common::EndpointHealthReport;
use tracing::{debug, info};

use crate::endpoint::Endpoint;
use crate::error::EndpointError;
use crate::resilience::ResilienceContext;
use crate::Result;

pub const DEFAULT_GLOBAL_TIMEOUT: Duration = Duration::from_secs(60);

pub struct EndpointEnvironment {
    global_timeout: Duration,
    monitor: Arc<EndpointMonitor>,
    library: Arc<EndpointLibrary>,
}

impl EndpointEnvironment {
    pub fn new(global_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            global_timeout,
            monitor: Arc::new(EndpointMonitor::new()),
            library: Arc::new(EndpointLibrary::new()),
        })
    }

    /// Timeout used by endpoints whose policy sets none
    pub fn global_timeout(&self) -> Duration {
        self.global_timeout
    }

    pub fn monitor(&self) -> &Arc<EndpointMonitor> {
        &self.monitor
    }

    pub fn library(&self) -> &Arc<EndpointLibrary> {
        &self.library
    }
}

impl Default for EndpointEnvironment {
    fn default() -> Self {
        Self {
            global_timeout: DEFAULT_GLOBAL_TIMEOUT,
            monitor: Arc::new(EndpointMonitor::new()),
            library: Arc::new(EndpointLibrary::new()),
        }
    }
}

// ============================================================================
// Monitor
// ============================================================================

/// Registry of endpoint health, populated by `init` and drained by `destroy`
#[derive(Default)]
pub struct EndpointMonitor {
    contexts: DashMap<String, Arc<ResilienceContext>>,
}

impl EndpointMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: &str, context: Arc<ResilienceContext>) {
        debug!(endpoint = %name, "Registering endpoint with monitor");
        self.contexts.insert(name.to_string(), context);
    }

    pub fn unregister(&self, name: &str) {
        if self.contexts.remove(name).is_some() {
            debug!(endpoint = %name, "Unregistered endpoint from monitor");
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.contexts.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    pub fn switch_off(&self, name: &str) -> Result<()> {
        let context = self.context(name)?;
        info!(endpoint = %name, "Operator switching endpoint off");
        context.switch_off();
        Ok(())
    }

    pub fn switch_on(&self, name: &str) -> Result<()> {
        let context = self.context(name)?;
        info!(endpoint = %name, "Operator switching endpoint on");
        context.switch_on();
        Ok(())
    }

    pub fn report(&self, name: &str) -> Option<EndpointHealthReport> {
        self.contexts.get(name).map(|entry| entry.value().report())
    }

    /// Reports for every registered endpoint, sorted by name
    pub fn reports(&self) -> Vec<EndpointHealthReport> {
        let mut reports: Vec<_> = self.contexts.iter().map(|entry| entry.value().report()).collect();
        reports.sort_by(|a, b| a.endpoint.cmp(&b.endpoint));
        reports
    }

    fn context(&self, name: &str) -> Result<Arc<ResilienceContext>> {
        self.contexts
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| EndpointError::UnknownEndpoint(name.to_string()))
    }
}

// ============================================================================
// Library
// ============================================================================

/// Named endpoints available for lookup at dispatch time
#[derive(Default)]
pub struct EndpointLibrary {
    endpoints: DashMap<String, Arc<dyn Endpoint>>,
}

impl EndpointLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register under the endpoint's own name, replacing any previous entry
    pub fn register(&self, endpoint: Arc<dyn Endpoint>) -> Option<Arc<dyn Endpoint>> {
        let name = endpoint.name().to_string();
        debug!(endpoint = %name, "Registering endpoint in library");
        self.endpoints.insert(name, endpoint)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Endpoint>> {
        self.endpoints.get(name).map(|entry| entry.value().clone())
    }

    pub fn remove(&self, name: &str) -> Option<Arc<dyn Endpoint>> {
        self.endpoints.remove(name).map(|(_, endpoint)| endpoint)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.endpoints.iter().map(|entry| entry.key().clone()).collect();
        names.sort();
        names
    }

    /// Drop every entry; endpoints hold the environment, so this breaks the cycle
    pub fn clear(&self) {
        self.endpoints.clear();
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::SuspendSettings;
    use fc_common::EndpointState;

    #[test]
    fn test_monitor_switch_off_on() {
        let monitor = EndpointMonitor::new();
        let context = Arc::new(ResilienceContext::new("orders"));
        monitor.register("orders", context.clone());

        monitor.switch_off("orders").unwrap();
        assert_eq!(context.state(), EndpointState::AdminOff);
        assert_eq!(monitor.report("orders").unwrap().state, EndpointState::AdminOff);

        monitor.switch_on("orders").unwrap();
        assert!(context.ready_to_send());
    }

    #[test]
    fn test_monitor_unknown_endpoint() {
        let monitor = EndpointMonitor::new();
        assert!(matches!(
            monitor.switch_off("ghost"),
            Err(EndpointError::UnknownEndpoint(name)) if name == "ghost"
        ));
        assert!(monitor.report("ghost").is_none());
    }

    #[test]
    fn test_monitor_reports_sorted() {
        let monitor = EndpointMonitor::new();
        let b = Arc::new(ResilienceContext::new("b"));
        monitor.register("b", b.clone());
        monitor.register("a", Arc::new(ResilienceContext::new("a")));
        b.on_suspend_fault(&SuspendSettings::default(), Some(500));

        let reports = monitor.reports();
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].endpoint, "a");
        assert_eq!(reports[1].state, EndpointState::Suspended);

        monitor.unregister("a");
        assert!(!monitor.contains("a"));
        assert_eq!(monitor.len(), 1);
    }

    #[test]
    fn test_default_environment() {
        let env = EndpointEnvironment::default();
        assert_eq!(env.global_timeout(), DEFAULT_GLOBAL_TIMEOUT);
        assert!(env.monitor().is_empty());
        assert!(env.library().is_empty());
    }
}
