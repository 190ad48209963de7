use std::time::Duration;

use thiserror::Error;

pub const DEFAULT_AUTHORITY_HOST: &str = "https://login.microsoftonline.com";
pub const DEFAULT_GRAPH_API_URL: &str = "https://graph.microsoft.com";
const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 10;
const DEFAULT_ROLE_CONCURRENCY: usize = 4;
const DEFAULT_PORT_SECRET_NAME: &str = "port";

/// Variables that must be present and non-empty before the server starts.
pub const REQUIRED_VARS: [&str; 5] = [
    "AZURE_TENANT_ID",
    "AZURE_CLIENT_ID",
    "AZURE_CLIENT_SECRET",
    "AZURE_KEYVAULT_URL",
    "AZURE_CERT_NAME",
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing environment variable: {0}")]
    Missing(&'static str),
    #[error("invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

/// Process configuration, read once at startup and shared read-only.
#[derive(Clone)]
pub struct Config {
    pub tenant_id: String,
    pub client_id: String,
    pub client_secret: String,
    pub keyvault_url: String,
    pub cert_name: String,
    pub port_secret_name: String,
    pub authority_host: String,
    pub graph_api_url: String,
    pub http_timeout: Duration,
    pub role_concurrency: usize,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("tenant_id", &self.tenant_id)
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("keyvault_url", &self.keyvault_url)
            .field("cert_name", &self.cert_name)
            .field("port_secret_name", &self.port_secret_name)
            .field("authority_host", &self.authority_host)
            .field("graph_api_url", &self.graph_api_url)
            .field("http_timeout", &self.http_timeout)
            .field("role_concurrency", &self.role_concurrency)
            .finish()
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the config from an arbitrary key lookup.
    ///
    /// Required values are trimmed and must be non-empty. Optional tunables
    /// fall back to their defaults when unset or blank.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |name: &'static str| -> Result<String, ConfigError> {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .ok_or(ConfigError::Missing(name))
        };
        let optional = |name: &str| -> Option<String> {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let tenant_id = required("AZURE_TENANT_ID")?;
        let client_id = required("AZURE_CLIENT_ID")?;
        let client_secret = required("AZURE_CLIENT_SECRET")?;
        let keyvault_url = required("AZURE_KEYVAULT_URL")?;
        let cert_name = required("AZURE_CERT_NAME")?;

        let http_timeout = match optional("HTTP_TIMEOUT_SECS") {
            Some(raw) => {
                let secs = raw.parse::<u64>().map_err(|e| ConfigError::Invalid {
                    name: "HTTP_TIMEOUT_SECS",
                    reason: e.to_string(),
                })?;
                if secs == 0 {
                    return Err(ConfigError::Invalid {
                        name: "HTTP_TIMEOUT_SECS",
                        reason: "must be greater than zero".to_string(),
                    });
                }
                Duration::from_secs(secs)
            }
            None => Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS),
        };

        let role_concurrency = match optional("GRAPH_ROLE_CONCURRENCY") {
            Some(raw) => raw
                .parse::<usize>()
                .map_err(|e| ConfigError::Invalid {
                    name: "GRAPH_ROLE_CONCURRENCY",
                    reason: e.to_string(),
                })?
                .max(1),
            None => DEFAULT_ROLE_CONCURRENCY,
        };

        Ok(Self {
            tenant_id,
            client_id,
            client_secret,
            keyvault_url: keyvault_url.trim_end_matches('/').to_string(),
            cert_name,
            port_secret_name: optional("AZURE_PORT_SECRET_NAME")
                .unwrap_or_else(|| DEFAULT_PORT_SECRET_NAME.to_string()),
            authority_host: optional("AZURE_AUTHORITY_HOST")
                .unwrap_or_else(|| DEFAULT_AUTHORITY_HOST.to_string())
                .trim_end_matches('/')
                .to_string(),
            graph_api_url: optional("GRAPH_API_URL")
                .unwrap_or_else(|| DEFAULT_GRAPH_API_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            http_timeout,
            role_concurrency,
        })
    }
}
