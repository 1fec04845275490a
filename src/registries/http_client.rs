//! Shared HTTP client for all source transports.
//!
//! Every [`super::transport::AuthenticatedTransport`] wraps the same
//! `reqwest::Client`, so sources hosted on the same server reuse pooled
//! connections and TLS sessions.

use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;

use crate::config::HttpConfig;

const USER_AGENT: &str = concat!(
    "feedscout/",
    env!("CARGO_PKG_VERSION"),
    " (NuGet metadata resolver)"
);

const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

pub fn create_shared_client(config: &HttpConfig) -> anyhow::Result<Arc<Client>> {
    let user_agent = config.user_agent.as_deref().unwrap_or(USER_AGENT);

    let client = Client::builder()
        .user_agent(user_agent)
        .timeout(Duration::from_secs(config.timeout_secs))
        .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
        .pool_idle_timeout(POOL_IDLE_TIMEOUT)
        .pool_max_idle_per_host(10)
        .tcp_keepalive(Duration::from_secs(60))
        .build()?;

    Ok(Arc::new(client))
}
