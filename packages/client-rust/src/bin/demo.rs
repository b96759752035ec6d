//! Demo: two clients on one in-process broker. One serves `sum` and listens
//! for `greeting` events, the other calls it and sends it a directed event.

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tether_client::{
    params, CallOptions, ClientConfig, CodecFormat, HandlerError, MemoryBroker, Params, RpcClient,
};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "tether-demo")]
#[command(about = "Call a service and emit an event over an in-memory broker")]
struct Args {
    /// Wire format: json or msgpack
    #[arg(long, env = "TETHER_CODEC", default_value = "json")]
    codec: CodecFormat,

    /// Call timeout in milliseconds
    #[arg(long, env = "TETHER_TIMEOUT_MS", default_value = "2000")]
    timeout_ms: u64,

    /// First operand
    #[arg(long, default_value = "2")]
    a: i64,

    /// Second operand
    #[arg(long, default_value = "3")]
    b: i64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    info!(codec = %args.codec, timeout_ms = args.timeout_ms, "starting demo");

    let broker = MemoryBroker::new();
    let config = |id: &str| ClientConfig {
        client_id: Some(id.to_string()),
        codec: args.codec,
        timeout: Duration::from_millis(args.timeout_ms),
        ..ClientConfig::default()
    };

    let (transport, inbound) = broker.connect();
    let server = RpcClient::start(transport, inbound, config("server"))
        .context("failed to start server client")?;
    let (transport, inbound) = broker.connect();
    let caller = RpcClient::start(transport, inbound, config("caller"))
        .context("failed to start calling client")?;

    server
        .register("sum", |p: Params| async move {
            p.expect_arity(2)?;
            Ok::<_, HandlerError>(p.arg::<i64>(0)? + p.arg::<i64>(1)?)
        })
        .await
        .context("failed to register sum")?;
    server
        .subscribe("greeting", |p: Params| {
            let text = p.arg::<String>(0).unwrap_or_default();
            info!(receiver = ?p.info().receiver, %text, "greeting received");
        })
        .await
        .context("failed to subscribe greeting")?;

    let total: i64 = caller
        .call_as("sum", params![args.a, args.b])
        .await
        .context("sum call failed")?;
    info!(a = args.a, b = args.b, total, "sum returned");

    match caller
        .call_with("missing", None, CallOptions::timeout(Duration::from_millis(200)), params![])
        .await
    {
        Ok(value) => info!(%value, "unexpected answer from missing service"),
        Err(err) => info!(error = %err, "missing service call failed as expected"),
    }

    caller
        .control("greeting", server.client_id().as_str(), params!["hello from caller"])
        .await
        .context("greeting emit failed")?;

    // Let the router deliver the event before shutting down.
    tokio::time::sleep(Duration::from_millis(50)).await;
    caller.close().await;
    server.close().await;
    Ok(())
}
