//! Hooktunnel probe
//!
//! Dials a relay once, the way the tunnel client would, and prints the
//! public URL the relay assigns. Useful for checking credentials and relay
//! reachability without running a service.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::Parser;
use tracing::{error, info};

use hooktunnel_client::credential::jwt_freshness;
use hooktunnel_client::tracing_init::init_tracing;
use hooktunnel_client::{
    Configurer, Connector, FileConfigurer, Freshness, RetryPolicy, TunnelConfig, WsDialer,
};

#[derive(Parser, Debug)]
#[command(name = "hooktunnel-probe")]
#[command(version, about = "Dial a hooktunnel relay once and print the public URL")]
struct Args {
    /// JSON configuration file; overrides the individual settings below
    #[arg(long, env = "HOOKTUNNEL_CONFIG")]
    config: Option<PathBuf>,

    /// Client identity registered with the relay
    #[arg(long, env = "HOOKTUNNEL_ID")]
    id: Option<String>,

    /// Relay address (e.g. "<https://relay.example.com>")
    #[arg(long, env = "HOOKTUNNEL_RELAY_ADDR")]
    relay_addr: Option<String>,

    /// Bearer token presented during the handshake
    #[arg(long, env = "HOOKTUNNEL_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Total retry budget in milliseconds (0 uses the default)
    #[arg(long, default_value_t = 0, env = "HOOKTUNNEL_RETRY_BUDGET_MS")]
    retry_budget_ms: u64,

    /// Handshake timeout in seconds
    #[arg(long, default_value_t = 30, env = "HOOKTUNNEL_CONNECT_TIMEOUT")]
    connect_timeout: u64,

    /// Present the token as-is instead of checking JWT expiry first
    #[arg(long, env = "HOOKTUNNEL_OPAQUE_TOKEN")]
    opaque_token: bool,

    /// Emit logs as JSON lines
    #[arg(long, env = "HOOKTUNNEL_LOG_JSON")]
    log_json: bool,
}

impl Args {
    fn configurer(&self) -> anyhow::Result<Arc<dyn Configurer>> {
        if let Some(path) = &self.config {
            return Ok(Arc::new(FileConfigurer::new(path)));
        }
        let (Some(id), Some(relay_addr), Some(token)) = (&self.id, &self.relay_addr, &self.token)
        else {
            bail!("either --config or all of --id, --relay-addr and --token are required");
        };
        let retry = RetryPolicy {
            max_elapsed_time: Duration::from_millis(self.retry_budget_ms),
            ..RetryPolicy::default()
        };
        let config = TunnelConfig::new(id, relay_addr, token).with_retry(retry);
        Ok(Arc::new(move || Ok::<_, String>(config.clone())))
    }

    fn freshness(&self) -> Freshness {
        if self.opaque_token {
            Arc::new(|token: &str| !token.is_empty())
        } else {
            jwt_freshness()
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing("hooktunnel_client=info,hooktunnel_probe=info", args.log_json);

    let dialer = WsDialer::new().with_connect_timeout(Duration::from_secs(args.connect_timeout));
    let connector = Connector::new(args.configurer()?, dialer, args.freshness())
        .await
        .context("failed to load tunnel configuration")?;

    let mut conn = match connector.connect().await {
        Ok(conn) => conn,
        Err(e) => {
            error!(error = %e, timeout = e.is_timeout(), "Relay probe failed");
            return Err(e).context("relay probe failed");
        }
    };
    info!(url = %conn.url, "Relay accepted the tunnel");

    #[allow(clippy::print_stdout)]
    {
        println!("{}", conn.url);
    }

    if let Err(e) = conn.transport.close(None).await {
        info!(error = %e, "Transport close failed");
    }
    Ok(())
}
