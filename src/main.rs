//! nats-rpc - send one RPC request over NATS and print the response

use anyhow::Context;
use base64::{engine::general_purpose::STANDARD, Engine};
use bytes::Bytes;
use clap::Parser;
use std::io::{Read, Write};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use nats_rpc_client::{ClientArgs, NatsBus, NatsRpcClient, RequestOptions};

/// Send a single RPC request over NATS
#[derive(Parser, Debug)]
#[command(name = "nats-rpc")]
#[command(about = "Send a single RPC request over NATS and print the response")]
struct Cli {
    /// Service name, e.g. Warehouse::ShipmentService
    #[arg(long)]
    service: String,

    /// Method name, e.g. create
    #[arg(long)]
    method: String,

    /// Encoded request payload; read from stdin when omitted
    #[arg(long)]
    data: Option<String>,

    /// Request is base64 and the response is printed as base64
    #[arg(long)]
    base64: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Emit logs as JSON lines
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    #[command(flatten)]
    client: ClientArgs,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    // Logs go to stderr; stdout carries the response
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("nats_rpc_client={},info", cli.log_level).into());
    if cli.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }

    let payload = read_payload(cli.data.as_deref(), cli.base64)?;
    let nats = cli.client.nats.clone();
    let config = cli
        .client
        .into_config()
        .context("Invalid client configuration")?;

    info!("NATS: {}", nats.nats_url);
    info!(
        "Ack timeout {:?}, response timeout {:?}, pool size {}",
        config.ack_timeout, config.response_timeout, config.subscription_pool_size
    );

    let bus = NatsBus::new(nats, &format!("nats-rpc-{}", uuid::Uuid::new_v4()));
    let client = NatsRpcClient::new(bus, config)?;
    let options = RequestOptions::new(&cli.service, &cli.method, client.config());

    match client.send_request_with(payload, &options).await {
        Ok(response) => write_response(&response, cli.base64)?,
        Err(e) => {
            error!("{} failed: {}", options.service_and_method(), e);
            std::process::exit(1);
        }
    }

    client.close();
    Ok(())
}

fn read_payload(data: Option<&str>, base64: bool) -> anyhow::Result<Bytes> {
    let raw = match data {
        Some(data) => data.as_bytes().to_vec(),
        None => {
            let mut buf = Vec::new();
            std::io::stdin()
                .read_to_end(&mut buf)
                .context("Failed to read request from stdin")?;
            buf
        }
    };

    if base64 {
        let text = String::from_utf8(raw).context("Base64 request is not UTF-8")?;
        let decoded = STANDARD
            .decode(text.trim())
            .context("Request is not valid base64")?;
        Ok(Bytes::from(decoded))
    } else {
        Ok(Bytes::from(raw))
    }
}

fn write_response(response: &[u8], base64: bool) -> anyhow::Result<()> {
    let mut stdout = std::io::stdout().lock();
    if base64 {
        writeln!(stdout, "{}", STANDARD.encode(response))?;
    } else {
        stdout.write_all(response)?;
    }
    stdout.flush()?;
    Ok(())
}
