//! Endpoint counters
//!
//! Recorded through the `metrics` facade; installing an exporter is left to
//! the binary.

use metrics::counter;

pub const SUSPENSIONS_TOTAL: &str = "fc_endpoint_suspensions_total";
pub const TIMEOUTS_TOTAL: &str = "fc_endpoint_timeouts_total";
pub const RECOVERIES_TOTAL: &str = "fc_endpoint_recoveries_total";
pub const DELIVERIES_TOTAL: &str = "fc_endpoint_deliveries_total";
pub const FAILOVER_SWITCHES_TOTAL: &str = "fc_failover_switches_total";
pub const FAILOVER_EXHAUSTED_TOTAL: &str = "fc_failover_exhausted_total";

pub fn record_suspension(endpoint: &str) {
    counter!(SUSPENSIONS_TOTAL, "endpoint" => endpoint.to_string()).increment(1);
}

pub fn record_timeout(endpoint: &str) {
    counter!(TIMEOUTS_TOTAL, "endpoint" => endpoint.to_string()).increment(1);
}

pub fn record_recovery(endpoint: &str) {
    counter!(RECOVERIES_TOTAL, "endpoint" => endpoint.to_string()).increment(1);
}

pub fn record_delivery(endpoint: &str, outcome: &'static str) {
    counter!(DELIVERIES_TOTAL, "endpoint" => endpoint.to_string(), "outcome" => outcome).increment(1);
}

pub fn record_failover_switch(router: &str) {
    counter!(FAILOVER_SWITCHES_TOTAL, "router" => router.to_string()).increment(1);
}

pub fn record_failover_exhausted(router: &str) {
    counter!(FAILOVER_EXHAUSTED_TOTAL, "router" => router.to_string()).increment(1);
}
