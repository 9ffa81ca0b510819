//! Authenticated dialing with credential refresh and bounded retry.

use std::sync::Arc;

use http::header::AUTHORIZATION;
use http::{HeaderMap, HeaderValue};
use tokio::sync::Mutex;
use tokio::time::{Instant, sleep, timeout_at};
use tracing::{debug, info, warn};

use crate::config::{Configurer, TunnelConfig};
use crate::credential::Freshness;
use crate::dial::{DialError, DialVerdict, Dialer, HandshakeResponse, classify};
use crate::error::{Result, TunnelError};
use crate::retry::RetryPolicy;

/// Header carrying the client identity on the handshake.
pub const CLIENT_ID_HEADER: &str = "x-webhooktunnel-id";

/// Response header carrying the public URL the relay assigned.
pub const CLIENT_URL_HEADER: &str = "x-webhooktunnel-client-url";

/// A live transport and the public URL the relay serves it under.
#[derive(Debug)]
pub struct Connection<T> {
    pub transport: T,
    pub url: String,
}

/// Dials the relay, refreshing credentials first when needed.
pub struct Connector<D> {
    dialer: D,
    configurer: Arc<dyn Configurer>,
    freshness: Freshness,
    /// Working configuration; replaced wholesale on refresh.
    config: Mutex<TunnelConfig>,
}

impl<D: Dialer> Connector<D> {
    /// Pull the initial configuration and build a connector around it.
    pub async fn new(
        configurer: Arc<dyn Configurer>,
        dialer: D,
        freshness: Freshness,
    ) -> Result<Self> {
        let config = pull_config(configurer.as_ref()).await?;
        Ok(Self {
            dialer,
            configurer,
            freshness,
            config: Mutex::new(config),
        })
    }

    /// Snapshot of the working configuration.
    pub async fn config(&self) -> TunnelConfig {
        self.config.lock().await.clone()
    }

    /// Establish a transport to the relay.
    ///
    /// Makes one immediate attempt; if the outcome is retryable, keeps
    /// dialing with exponential backoff until the policy's time budget runs
    /// out.
    pub async fn connect(&self) -> Result<Connection<D::Transport>> {
        let config = self.fresh_config().await?;
        let url = config.relay_url();
        let headers = handshake_headers(&config)?;

        info!(client_id = %config.id, url = %url, "Connecting to relay");
        match self.dialer.dial(&url, &headers).await {
            Ok((transport, response)) => Ok(established(&config.id, transport, &response)),
            Err(e) => match classify(false, e.status()) {
                DialVerdict::ShouldRetry => {
                    warn!(client_id = %config.id, error = %e, "Relay dial failed, will retry");
                    self.retry(&config, &url, &headers).await
                }
                verdict => {
                    warn!(client_id = %config.id, error = %e, "Relay dial failed");
                    Err(terminal(verdict, &e))
                }
            },
        }
    }

    /// Backoff loop: a delay timer and the overall budget race each other,
    /// and the budget wins ties.
    async fn retry(
        &self,
        config: &TunnelConfig,
        url: &str,
        headers: &HeaderMap,
    ) -> Result<Connection<D::Transport>> {
        let policy: &RetryPolicy = &config.retry;
        let deadline = Instant::now() + policy.max_elapsed_time;
        let budget = tokio::time::sleep_until(deadline);
        tokio::pin!(budget);

        let mut delay = policy.initial_delay;
        let mut attempt: u32 = 1;
        loop {
            tokio::select! {
                biased;
                () = &mut budget => {
                    warn!(client_id = %config.id, attempt, "Retry budget exhausted");
                    return Err(TunnelError::RetryTimedOut(policy.max_elapsed_time));
                }
                () = sleep(delay) => {}
            }

            attempt = attempt.saturating_add(1);
            debug!(client_id = %config.id, attempt, url = %url, "Dialing relay");
            let Ok(outcome) = timeout_at(deadline, self.dialer.dial(url, headers)).await else {
                warn!(client_id = %config.id, attempt, "Retry budget exhausted mid-dial");
                return Err(TunnelError::RetryTimedOut(policy.max_elapsed_time));
            };

            match outcome {
                Ok((transport, response)) => {
                    return Ok(established(&config.id, transport, &response));
                }
                Err(e) => match classify(false, e.status()) {
                    DialVerdict::ShouldRetry => {
                        delay = policy.next_delay(delay);
                        debug!(
                            client_id = %config.id,
                            attempt,
                            error = %e,
                            delay_ms = delay.as_millis(),
                            "Relay dial failed, backing off"
                        );
                    }
                    verdict => {
                        warn!(client_id = %config.id, attempt, error = %e, "Relay dial failed, giving up");
                        return Err(terminal(verdict, &e));
                    }
                },
            }
        }
    }

    /// Current configuration, refreshed through the configurer if the
    /// credential is no longer usable.
    async fn fresh_config(&self) -> Result<TunnelConfig> {
        let mut current = self.config.lock().await;
        if !(self.freshness)(&current.token) {
            debug!(client_id = %current.id, "Credential not usable, refreshing configuration");
            *current = pull_config(self.configurer.as_ref()).await?;
        }
        Ok(current.clone())
    }
}

async fn pull_config(configurer: &dyn Configurer) -> Result<TunnelConfig> {
    let mut config = configurer
        .configure()
        .await
        .map_err(|e| TunnelError::ConfigRefresh(e.to_string()))?;
    config.retry = config.retry.with_defaults();
    Ok(config)
}

fn handshake_headers(config: &TunnelConfig) -> Result<HeaderMap> {
    let invalid = |what: &str| TunnelError::ConfigRefresh(format!("{what} is not a valid header value"));

    let mut headers = HeaderMap::new();
    let bearer = HeaderValue::from_str(&format!("Bearer {}", config.token))
        .map_err(|_| invalid("token"))?;
    headers.insert(AUTHORIZATION, bearer);
    let id = HeaderValue::from_str(&config.id).map_err(|_| invalid("client id"))?;
    headers.insert(CLIENT_ID_HEADER, id);
    Ok(headers)
}

fn established<T>(client_id: &str, transport: T, response: &HandshakeResponse) -> Connection<T> {
    let url = response.header_str(CLIENT_URL_HEADER).to_string();
    if url.is_empty() {
        warn!(client_id = %client_id, "Relay did not report a public URL");
    }
    info!(client_id = %client_id, url = %url, "Connected to relay");
    Connection { transport, url }
}

fn terminal(verdict: DialVerdict, err: &DialError) -> TunnelError {
    match verdict {
        DialVerdict::AuthFailure => TunnelError::AuthFailed,
        _ => TunnelError::RetryFailed {
            status: err.status(),
        },
    }
}
