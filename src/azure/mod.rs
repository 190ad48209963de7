pub mod auth;
pub mod graph;
pub mod keyvault;

use std::time::Duration;

use reqwest::Client;

/// Shared outbound HTTP client; every request inherits the timeout.
pub fn build_http_client(timeout: Duration) -> reqwest::Result<Client> {
    Client::builder()
        .timeout(timeout)
        .user_agent(format!("hr-panel/{}", crate::VERSION))
        .build()
}
