use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::config::Config;

pub const GRAPH_SCOPE: &str = "https://graph.microsoft.com/.default";
pub const KEYVAULT_SCOPE: &str = "https://vault.azure.net/.default";

/// Client-credentials grant inputs for one token request.
#[derive(Clone)]
pub struct ClientCredentials {
    pub authority_host: String,
    pub tenant_id: String,
    pub client_id: String,
    pub client_secret: String,
    pub scope: String,
}

impl std::fmt::Debug for ClientCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientCredentials")
            .field("authority_host", &self.authority_host)
            .field("tenant_id", &self.tenant_id)
            .field("client_id", &self.client_id)
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

impl ClientCredentials {
    pub fn from_config(config: &Config, scope: &str) -> Self {
        Self {
            authority_host: config.authority_host.clone(),
            tenant_id: config.tenant_id.clone(),
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            scope: scope.to_string(),
        }
    }

    pub fn token_url(&self) -> String {
        format!(
            "{}/{}/oauth2/v2.0/token",
            self.authority_host.trim_end_matches('/'),
            self.tenant_id
        )
    }

    fn validate(&self) -> Result<(), CredentialError> {
        let fields = [
            ("authority_host", &self.authority_host),
            ("tenant_id", &self.tenant_id),
            ("client_id", &self.client_id),
            ("client_secret", &self.client_secret),
            ("scope", &self.scope),
        ];
        for (name, value) in fields {
            if value.trim().is_empty() {
                return Err(CredentialError::MissingField(name));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct AccessToken {
    pub token: String,
    pub expires_in: Duration,
}

impl AccessToken {
    pub fn bearer(&self) -> &str {
        &self.token
    }
}

#[derive(Debug, Clone, Error)]
pub enum CredentialError {
    #[error("credential field {0} is empty")]
    MissingField(&'static str),
    #[error("failed to request token: {0}")]
    Request(String),
    #[error("token endpoint rejected the request: {status} {body}")]
    Rejected { status: StatusCode, body: String },
    #[error("failed to parse token response: {0}")]
    Parse(String),
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

/// Exchanges client credentials for bearer tokens. Holds no token state.
#[derive(Debug, Clone)]
pub struct CredentialProvider {
    http_client: Client,
    credentials: ClientCredentials,
}

impl CredentialProvider {
    pub fn new(http_client: Client, credentials: ClientCredentials) -> Self {
        Self {
            http_client,
            credentials,
        }
    }

    /// Provider for Microsoft Graph tokens.
    pub fn for_graph(http_client: Client, config: &Config) -> Self {
        Self::new(http_client, ClientCredentials::from_config(config, GRAPH_SCOPE))
    }

    /// Run the client-credentials exchange. Every call hits the token endpoint.
    pub async fn acquire_token(&self) -> Result<AccessToken, CredentialError> {
        request_access_token(&self.http_client, &self.credentials).await
    }
}

pub async fn request_access_token(
    client: &Client,
    cfg: &ClientCredentials,
) -> Result<AccessToken, CredentialError> {
    cfg.validate()?;

    let url = cfg.token_url();
    let params = [
        ("client_id", cfg.client_id.as_str()),
        ("client_secret", cfg.client_secret.as_str()),
        ("scope", cfg.scope.as_str()),
        ("grant_type", "client_credentials"),
    ];

    debug!(tenant_id = %cfg.tenant_id, scope = %cfg.scope, "requesting access token");

    let response = client
        .post(url)
        .form(&params)
        .send()
        .await
        .map_err(|err| CredentialError::Request(err.to_string()))?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        return Err(CredentialError::Rejected { status, body });
    }

    let payload: TokenResponse = response
        .json()
        .await
        .map_err(|err| CredentialError::Parse(err.to_string()))?;

    if payload.access_token.trim().is_empty() {
        return Err(CredentialError::Parse(
            "token response contained an empty access_token".to_string(),
        ));
    }

    Ok(AccessToken {
        token: payload.access_token,
        expires_in: Duration::from_secs(payload.expires_in.unwrap_or(3600)),
    })
}
