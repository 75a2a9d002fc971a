//! Standalone HookTunnel binary: start the callback listener, print the public callback URL,
//! log every callback until Ctrl-C.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use hooktunnel::{CallbackEvent, CallbackListener, Config, Level};

#[derive(Debug, Parser)]
#[command(name = "hooktunnel", version, about = "Receive webhook callbacks on localhost through an ngrok tunnel")]
struct Cli {
    /// settings.json with tunnel.ngrok.{auth_token,domain} and listener.{port,max_port_attempts}
    #[arg(long, default_value = "settings.json")]
    config: PathBuf,

    /// First local port to try; the next port up is tried while ports are taken
    #[arg(long)]
    port: Option<u16>,

    /// Give up after this many bind attempts
    #[arg(long)]
    max_port_attempts: Option<u32>,

    /// ngrok auth token (overrides settings.json and NGROK_AUTHTOKEN)
    #[arg(long)]
    authtoken: Option<String>,

    /// Reserved ngrok domain (overrides settings.json and NGROK_DOMAIN)
    #[arg(long)]
    domain: Option<String>,

    /// Print each callback as one JSON line on stdout instead of logging it
    #[arg(long)]
    json: bool,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hooktunnel=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut config = Config::load(Some(cli.config.as_path()))
        .with_context(|| format!("loading {}", cli.config.display()))?;
    if let Some(port) = cli.port {
        config.listener.port = port;
    }
    if let Some(n) = cli.max_port_attempts {
        config.listener.max_port_attempts = n;
    }
    if let Some(token) = cli.authtoken.as_deref() {
        config.handler.tunnel_auth_token = token.trim().to_string();
    }
    if let Some(domain) = cli.domain.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        config.handler.reserved_hostname = Some(domain.to_string());
    }
    Ok(config)
}

/// One JSON line per callback. A serialization failure still yields valid JSON.
fn callback_line(event: &CallbackEvent) -> String {
    serde_json::to_string(event)
        .unwrap_or_else(|err| serde_json::json!({ "error": err.to_string() }).to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    tracing::debug!(?config, "config loaded");

    let mut listener = CallbackListener::with_options(config.handler, config.listener);
    let events = listener.events();
    events.on_log(|e| match e.level {
        Level::Info => tracing::info!("{}", e.message),
        Level::Warn => tracing::warn!("{}", e.message),
        Level::Error => tracing::error!("{}", e.message),
    });
    events.on_tunnel_status(|e| match e.level {
        Level::Error => tracing::error!(status = %e.level, "tunnel: {}", e.message),
        _ => tracing::info!(status = %e.level, "tunnel: {}", e.message),
    });
    let json = cli.json;
    events.on_callback(move |e| {
        let line = callback_line(e);
        if json {
            println!("{}", line);
        } else {
            tracing::info!(callback = %line, "callback");
        }
    });

    let url = listener.start().await.context("starting callback listener")?;
    tracing::info!("Callback URL: {}", url);

    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    tracing::info!("Shutting down");
    listener.stop().await;
    Ok(())
}
