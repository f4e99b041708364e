//! FlowCatalyst Endpoint Simulator
//!
//! Builds an endpoint tree from a TOML file and pushes synthetic messages
//! through one of its roots over a transport that fails, times out or answers
//! with a failover status at configurable rates. At the end it prints the
//! health report of every endpoint and the Prometheus counters.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use futures::stream::{self, StreamExt};
use metrics_exporter_prometheus::PrometheusBuilder;
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use fc_common::{error_codes, properties, Envelope};
use fc_config::EndpointsConfig;
use fc_endpoint::{
    DeliveryRequest, Endpoint, EndpointBuilder, FaultHandler, MediatorFaultHandler, MessageContext, Transport,
    TransportOutcome,
};

/// FlowCatalyst Endpoint Simulator
#[derive(Parser, Debug)]
#[command(name = "fc-endpoint-sim")]
#[command(about = "Drive synthetic traffic through a configured endpoint tree")]
struct Args {
    /// Endpoint configuration file
    #[arg(long, env = "FC_ENDPOINTS_CONFIG", default_value = "config/endpoints.toml")]
    config: PathBuf,

    /// Overrides `defaults.global_timeout_ms` from the config file
    #[arg(long, env = "FC_GLOBAL_TIMEOUT_MS")]
    global_timeout_ms: Option<u64>,

    /// Root endpoint to send to (defaults to the first root)
    #[arg(long, env = "FC_SIM_ROOT")]
    root: Option<String>,

    /// Number of messages to send
    #[arg(long, env = "FC_SIM_MESSAGES", default_value = "200")]
    messages: usize,

    /// Messages in flight at once
    #[arg(long, env = "FC_SIM_CONCURRENCY", default_value = "8")]
    concurrency: usize,

    /// Probability that a delivery fails with a connection error
    #[arg(long, env = "FC_SIM_FAILURE_RATE", default_value = "0.2")]
    failure_rate: f64,

    /// Probability that a delivery times out
    #[arg(long, env = "FC_SIM_TIMEOUT_RATE", default_value = "0.05")]
    timeout_rate: f64,

    /// Probability that a delivery answers 503
    #[arg(long, env = "FC_SIM_UNAVAILABLE_RATE", default_value = "0.05")]
    unavailable_rate: f64,

    /// Upper bound of simulated delivery latency
    #[arg(long, env = "FC_SIM_MAX_LATENCY_MS", default_value = "20")]
    max_latency_ms: u64,

    /// Emit JSON logs
    #[arg(long, env = "FC_LOG_JSON", default_value = "false")]
    log_json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    init_tracing(args.log_json);

    let recorder = PrometheusBuilder::new()
        .install_recorder()
        .context("Failed to install Prometheus recorder")?;

    info!(config = %args.config.display(), "Starting FlowCatalyst endpoint simulator");

    let mut config = EndpointsConfig::from_file(&args.config)
        .with_context(|| format!("Failed to load {}", args.config.display()))?;
    if let Some(global_timeout_ms) = args.global_timeout_ms {
        config.defaults.global_timeout_ms = global_timeout_ms;
    }

    let transport = Arc::new(SimulatedTransport::new(&args));
    let tree = EndpointBuilder::new(transport.clone()).build(&config)?;

    let root = match &args.root {
        Some(name) => tree
            .get(name)
            .ok_or_else(|| anyhow::anyhow!("No endpoint named '{}' in {}", name, args.config.display()))?,
        None => tree
            .roots()
            .first()
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("{} defines no endpoints", args.config.display()))?,
    };

    info!(
        root = %root.name(),
        endpoints = tree.len(),
        messages = args.messages,
        concurrency = args.concurrency,
        "Endpoint tree ready"
    );

    let fault_sequence = Arc::new(CountingFaultSequence::default());
    let delivered = Arc::new(AtomicU64::new(0));

    stream::iter(0..args.messages)
        .for_each_concurrent(args.concurrency.max(1), |seq| {
            let root = root.clone();
            let fault_sequence = fault_sequence.clone();
            let delivered = delivered.clone();
            async move {
                match dispatch(root, fault_sequence, seq).await {
                    Ok(true) => {
                        delivered.fetch_add(1, Ordering::Relaxed);
                    }
                    Ok(false) => {}
                    Err(e) => warn!(seq = seq, error = %e, "Dispatch error"),
                }
            }
        })
        .await;

    info!(
        delivered = delivered.load(Ordering::Relaxed),
        faulted = fault_sequence.faults.load(Ordering::Relaxed),
        transport_calls = transport.calls.load(Ordering::Relaxed),
        "Simulation finished"
    );

    let reports = tree.environment().monitor().reports();
    println!("{}", serde_json::to_string_pretty(&reports)?);
    println!("{}", recorder.render());

    tree.destroy();
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into());
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

/// Send one message and feed response statuses back until no endpoint
/// fails over on them. Returns true when the message was delivered.
async fn dispatch(root: Arc<dyn Endpoint>, fault_sequence: Arc<CountingFaultSequence>, seq: usize) -> Result<bool> {
    let envelope = Envelope::json(json!({
        "sequence": seq,
        "type": "order.created",
    }))
    .with_header("x-tenant", if seq % 2 == 0 { "acme" } else { "globex" });

    let mut ctx = MessageContext::new(envelope);
    ctx.push_fault_handler(FaultHandler::Sequence(fault_sequence));

    root.send(&mut ctx).await?;

    while let Some(status) = response_status(&ctx) {
        if faulted(&ctx) || !root.on_response_status(status, &mut ctx).await? {
            break;
        }
    }

    Ok(!faulted(&ctx))
}

/// Error properties outlive a successful failover, so faults are tracked
/// by the marker the fault sequence leaves
fn faulted(ctx: &MessageContext) -> bool {
    ctx.property(FAULTED).is_some()
}

fn response_status(ctx: &MessageContext) -> Option<u16> {
    ctx.property(properties::HTTP_STATUS_CODE)
        .and_then(Value::as_u64)
        .and_then(|status| u16::try_from(status).ok())
}

/// Transport with random latency, failures, timeouts and 503 responses
struct SimulatedTransport {
    failure_rate: f64,
    timeout_rate: f64,
    unavailable_rate: f64,
    max_latency_ms: u64,
    calls: AtomicU64,
}

impl SimulatedTransport {
    fn new(args: &Args) -> Self {
        Self {
            failure_rate: args.failure_rate.clamp(0.0, 1.0),
            timeout_rate: args.timeout_rate.clamp(0.0, 1.0),
            unavailable_rate: args.unavailable_rate.clamp(0.0, 1.0),
            max_latency_ms: args.max_latency_ms,
            calls: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl Transport for SimulatedTransport {
    async fn deliver(&self, request: &DeliveryRequest, ctx: &mut MessageContext) -> TransportOutcome {
        self.calls.fetch_add(1, Ordering::Relaxed);

        let latency = rand::random::<u64>() % self.max_latency_ms.saturating_add(1);
        tokio::time::sleep(Duration::from_millis(latency)).await;

        let roll: f64 = rand::random();
        debug!(
            endpoint = %request.endpoint,
            address = %request.address,
            latency_ms = latency,
            message_id = %ctx.id(),
            "Simulated delivery"
        );

        if roll < self.failure_rate {
            return TransportOutcome::fault(
                error_codes::CONNECTION_FAILED,
                format!("Connection refused by {}", request.address),
            );
        }
        if roll < self.failure_rate + self.timeout_rate {
            return TransportOutcome::TimedOut;
        }

        let status: u16 = if roll < self.failure_rate + self.timeout_rate + self.unavailable_rate {
            503
        } else {
            200
        };
        ctx.set_property(properties::HTTP_STATUS_CODE, Value::from(status));
        TransportOutcome::Delivered
    }
}

const FAULTED: &str = "sim_faulted";

/// Mediator fault sequence that counts faulted messages
#[derive(Default)]
struct CountingFaultSequence {
    faults: AtomicU64,
}

#[async_trait]
impl MediatorFaultHandler for CountingFaultSequence {
    fn name(&self) -> &str {
        "sim-fault-sequence"
    }

    async fn handle_fault(&self, ctx: &mut MessageContext) -> fc_endpoint::Result<()> {
        self.faults.fetch_add(1, Ordering::Relaxed);
        ctx.set_property(FAULTED, Value::Bool(true));
        warn!(
            message_id = %ctx.id(),
            error_code = ?ctx.error_code(),
            error = ctx.error_message().unwrap_or_default(),
            last_endpoint = ?ctx.last_endpoint(),
            "Message faulted"
        );
        Ok(())
    }
}
