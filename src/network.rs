use reqwest::{Client, StatusCode};
use std::time::Duration;

const CONNECTIVITY_URL: &str = "http://www.gstatic.com/generate_204";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkEnvironment {
    /// The connectivity check answered: traffic is leaving through a proxy or
    /// tunnel, which distorts edge measurements
    Proxied,
    Direct,
}

/// 通过访问 generate_204 判断当前是否处于代理环境
pub async fn check_network_environment() -> NetworkEnvironment {
    check_against(CONNECTIVITY_URL, Duration::from_secs(2)).await
}

async fn check_against(url: &str, timeout: Duration) -> NetworkEnvironment {
    let client = match Client::builder().timeout(timeout).build() {
        Ok(c) => c,
        Err(e) => {
            tracing::debug!(error = %e, "Cannot build connectivity client");
            return NetworkEnvironment::Direct;
        }
    };
    match client.get(url).send().await {
        Ok(resp) if resp.status() == StatusCode::NO_CONTENT => NetworkEnvironment::Proxied,
        Ok(resp) => {
            tracing::debug!(status = %resp.status(), "Connectivity check answered unexpectedly");
            NetworkEnvironment::Direct
        }
        Err(_) => NetworkEnvironment::Direct,
    }
}
