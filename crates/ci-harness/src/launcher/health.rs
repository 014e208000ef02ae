//! Readiness checks against the servers a pod depends on.

use std::time::Duration;

use error_stack::Report;
use error_stack::ResultExt;
use tokio::net::TcpStream;
use tracing::debug;
use tracing::info;

use crate::error::HarnessError;
use crate::error::HarnessResult;
use crate::util::poll_until;

pub const HEALTH_INTERVAL: Duration = Duration::from_secs(5);
pub const REACHABILITY_INTERVAL: Duration = Duration::from_secs(15);
const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(3);

/// Wait until `GET {url}` answers with a success status.
///
/// # Errors
///
/// - [`HarnessError::HealthTimeout`] if it never does within `timeout`
/// - [`HarnessError::LaunchFailed`] if the HTTP client cannot be built
#[tracing::instrument(skip(interval))]
pub async fn wait_healthy(url: &str, interval: Duration, timeout: Duration) -> HarnessResult<()> {
    let client = reqwest::Client::builder()
        .timeout(ATTEMPT_TIMEOUT)
        .build()
        .change_context(HarnessError::LaunchFailed {
            what: "health check client".to_string(),
        })?;
    let client = &client;

    let healthy = poll_until(interval, timeout, move || async move {
        match client.get(url).send().await {
            Ok(response) if response.status().is_success() => Some(()),
            Ok(response) => {
                debug!(status = %response.status(), "not healthy yet");
                None
            }
            Err(e) => {
                debug!(error = %e, "health check failed");
                None
            }
        }
    })
    .await;

    match healthy {
        Some(()) => {
            info!("server healthy");
            Ok(())
        }
        None => Err(Report::new(HarnessError::HealthTimeout {
            url: url.to_string(),
            timeout,
        })),
    }
}

/// Wait until every `ip:port` accepts a TCP connection at the same tick.
///
/// # Errors
///
/// - [`HarnessError::UpstreamUnreachable`] listing the addresses still closed at timeout
#[tracing::instrument(skip(interval))]
pub async fn wait_reachable(
    addresses: &[String],
    interval: Duration,
    timeout: Duration,
) -> HarnessResult<()> {
    let reachable = poll_until(interval, timeout, move || async move {
        let closed = closed_addresses(addresses).await;
        if closed.is_empty() {
            Some(())
        } else {
            debug!(?closed, "upstreams not reachable yet");
            None
        }
    })
    .await;

    match reachable {
        Some(()) => {
            info!("all upstreams reachable");
            Ok(())
        }
        None => Err(Report::new(HarnessError::UpstreamUnreachable {
            addresses: closed_addresses(addresses).await,
            timeout,
        })),
    }
}

async fn closed_addresses(addresses: &[String]) -> Vec<String> {
    let mut closed = Vec::new();
    for address in addresses {
        let connected = tokio::time::timeout(ATTEMPT_TIMEOUT, TcpStream::connect(address.as_str()))
            .await
            .is_ok_and(|result| result.is_ok());
        if !connected {
            closed.push(address.clone());
        }
    }
    closed
}
