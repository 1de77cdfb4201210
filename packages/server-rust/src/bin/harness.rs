//! Dispatch harness: pushes a burst of calls through an in-process server.
//!
//! ```sh
//! quiver-harness --requests 5000 --threads 8 --queue-capacity 64
//! RUST_LOG=quiver_server=debug quiver-harness --config server.json
//! ```
//!
//! Every 10th call targets an unknown service so the error path is exercised.
//! Prints how many calls were answered with a payload, with each error kind,
//! or not at all.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use quiver_core::{MethodDescriptor, Request, Value};
use quiver_server::network::BizContext;
use quiver_server::service::{
    DispatchError, InboundCall, InvocationContext, MetricsEventSink, OneshotSink, ProviderConfig,
    ServerConfig, TracingEventSink,
};
use quiver_server::{RpcServer, ServiceHandler};
use tokio::sync::oneshot;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "quiver-harness")]
#[command(about = "Push a burst of RPC calls through the quiver dispatch pipeline")]
struct Args {
    /// Number of calls to dispatch.
    #[arg(short, long, default_value_t = 1000, env = "QUIVER_REQUESTS")]
    requests: usize,

    /// Business pool threads (overrides the config file).
    #[arg(short, long, env = "QUIVER_BIZ_THREADS")]
    threads: Option<usize>,

    /// Business pool queue capacity (overrides the config file).
    #[arg(short, long, env = "QUIVER_BIZ_QUEUE")]
    queue_capacity: Option<usize>,

    /// Client timeout per call in milliseconds; 0 disables it.
    #[arg(long, default_value_t = 0, env = "QUIVER_CLIENT_TIMEOUT_MS")]
    client_timeout_ms: u64,

    /// JSON server configuration.
    #[arg(short, long, env = "QUIVER_CONFIG")]
    config: Option<PathBuf>,
}

struct Greeter;

impl ServiceHandler for Greeter {
    fn handle(&self, method: &MethodDescriptor, args: &[Value], _ctx: &mut InvocationContext) -> Result<Value> {
        match method.name.as_str() {
            "sayHi" => {
                let name = args.first().and_then(Value::as_str).unwrap_or("stranger");
                Ok(Value::from(format!("hi {name}")))
            }
            other => anyhow::bail!("unsupported method {other}"),
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).compact().init();
}

fn load_config(args: &Args) -> Result<ServerConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config {}", path.display()))?;
            ServerConfig::from_json(&json)?
        }
        None => ServerConfig::default(),
    };
    if let Some(threads) = args.threads {
        config.biz_pool.threads = threads;
    }
    if let Some(capacity) = args.queue_capacity {
        config.biz_pool.queue_capacity = capacity;
    }
    config.app_name.get_or_insert_with(|| "quiver-harness".to_owned());
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    let config = load_config(&args)?;

    let server = RpcServer::new(config)?;
    server.events().subscribe(Arc::new(TracingEventSink));
    server.events().subscribe(Arc::new(MetricsEventSink));
    server.register_provider(
        ProviderConfig::new("Greeter").with_app_name("greeter-app"),
        Arc::new(Greeter),
        [MethodDescriptor::new("Greeter", "sayHi", ["Str"]).returning("Str")],
    );
    server.start()?;

    let dispatcher = server.dispatcher();
    let client_timeout = Duration::from_millis(args.client_timeout_ms);
    let started = Instant::now();
    let mut outcomes: BTreeMap<String, usize> = BTreeMap::new();
    let mut pending = Vec::with_capacity(args.requests);

    for i in 0..args.requests {
        let request = if i % 10 == 9 {
            Request::new("Ghost", "boo")
        } else {
            Request::new("Greeter", "sayHi").with_arg("Str", format!("caller-{i}"))
        };
        let (tx, rx) = oneshot::channel();
        let transport = Arc::new(BizContext::new(None).with_client_timeout(client_timeout));
        let call = InboundCall::new(transport, Arc::new(OneshotSink::new(tx)), request);

        match dispatcher.dispatch(call) {
            // Rejected calls were answered with an error response already.
            Ok(_) | Err(DispatchError::Rejected { .. }) => pending.push(rx),
            Err(err) => *outcomes.entry(format!("undispatched: {err}")).or_default() += 1,
        }
    }

    for result in futures_util::future::join_all(pending).await {
        let outcome = match result {
            Ok(response) => match response.as_error() {
                Some(desc) => desc.kind.as_str().to_owned(),
                None => "ok".to_owned(),
            },
            Err(_) => "no response".to_owned(),
        };
        *outcomes.entry(outcome).or_default() += 1;
    }
    let elapsed = started.elapsed();

    let drained = server.stop().await;
    info!(requests = args.requests, elapsed = ?elapsed, drained, "burst complete");
    for (outcome, count) in &outcomes {
        println!("{outcome:>28}: {count}");
    }
    Ok(())
}
