use reqwest::{Client, StatusCode};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::azure::auth::{request_access_token, ClientCredentials, CredentialError, KEYVAULT_SCOPE};
use crate::config::Config;
use crate::utils::temp_file::CertificateFile;

const SECRETS_API_VERSION: &str = "7.4";

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("could not acquire vault credential: {0}")]
    Credential(#[from] CredentialError),
    #[error("vault request for secret '{name}' failed: {message}")]
    Request { name: String, message: String },
    #[error("secret '{0}' not found in vault")]
    NotFound(String),
    #[error("vault returned {status} for secret '{name}': {body}")]
    Status {
        name: String,
        status: StatusCode,
        body: String,
    },
    #[error("could not parse vault response for secret '{name}': {message}")]
    Parse { name: String, message: String },
    #[error("could not write certificate bundle: {0}")]
    TempFile(#[from] std::io::Error),
}

/// Key Vault secret bundle, only the fields read here.
#[derive(Debug, Deserialize)]
struct SecretBundle {
    value: Option<String>,
}

/// Resolves secrets from Azure Key Vault.
///
/// Authenticates with its own client-credentials token scoped to the vault,
/// requested on every call.
#[derive(Debug, Clone)]
pub struct SecretResolver {
    vault_url: String,
    credentials: ClientCredentials,
    http_client: Client,
}

impl SecretResolver {
    pub fn new(http_client: Client, vault_url: &str, credentials: ClientCredentials) -> Self {
        Self {
            vault_url: vault_url.trim_end_matches('/').to_string(),
            credentials,
            http_client,
        }
    }

    pub fn from_config(http_client: Client, config: &Config) -> Self {
        Self::new(
            http_client,
            &config.keyvault_url,
            ClientCredentials::from_config(config, KEYVAULT_SCOPE),
        )
    }

    fn secret_url(&self, name: &str) -> String {
        format!(
            "{}/secrets/{}?api-version={}",
            self.vault_url, name, SECRETS_API_VERSION
        )
    }

    /// Fetch the current version of a secret.
    ///
    /// Path: GET {vault_url}/secrets/{name}?api-version=7.4
    pub async fn resolve_secret(&self, name: &str) -> Result<String, VaultError> {
        let token = request_access_token(&self.http_client, &self.credentials).await?;
        let url = self.secret_url(name);

        debug!(secret = %name, "fetching secret from vault");

        let response = self
            .http_client
            .get(&url)
            .bearer_auth(token.bearer())
            .send()
            .await
            .map_err(|e| VaultError::Request {
                name: name.to_string(),
                message: e.to_string(),
            })?;

        match response.status() {
            StatusCode::NOT_FOUND => Err(VaultError::NotFound(name.to_string())),
            status if status.is_success() => {
                let bundle: SecretBundle =
                    response.json().await.map_err(|e| VaultError::Parse {
                        name: name.to_string(),
                        message: e.to_string(),
                    })?;
                bundle.value.ok_or_else(|| VaultError::Parse {
                    name: name.to_string(),
                    message: "secret bundle has no value".to_string(),
                })
            }
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(VaultError::Status {
                    name: name.to_string(),
                    status,
                    body,
                })
            }
        }
    }

    /// Fetch a PEM certificate+key bundle and persist it to a temporary file.
    ///
    /// The caller owns the returned file; dropping it deletes the file.
    pub async fn resolve_certificate_bundle(
        &self,
        cert_name: &str,
    ) -> Result<CertificateFile, VaultError> {
        let pem = self.resolve_secret(cert_name).await?;
        let file = CertificateFile::write(pem.as_bytes())?;
        info!(secret = %cert_name, path = %file.path().display(), "certificate bundle resolved");
        Ok(file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server, ServerGuard};

    fn credentials(host: &str) -> ClientCredentials {
        ClientCredentials {
            authority_host: host.to_string(),
            tenant_id: "tenant-1".to_string(),
            client_id: "client-1".to_string(),
            client_secret: "s3cret".to_string(),
            scope: KEYVAULT_SCOPE.to_string(),
        }
    }

    async fn mock_token(server: &mut ServerGuard) -> mockito::Mock {
        server
            .mock("POST", "/tenant-1/oauth2/v2.0/token")
            .match_body(Matcher::UrlEncoded("scope".into(), KEYVAULT_SCOPE.into()))
            .with_status(200)
            .with_body(r#"{"access_token":"vault-token","expires_in":3600}"#)
            .create_async()
            .await
    }

    fn resolver(server: &ServerGuard) -> SecretResolver {
        SecretResolver::new(Client::new(), &format!("{}/", server.url()), credentials(&server.url()))
    }

    #[tokio::test]
    async fn test_resolve_secret() {
        let mut server = Server::new_async().await;
        let token = mock_token(&mut server).await;
        let secret = server
            .mock("GET", "/secrets/port")
            .match_query(Matcher::UrlEncoded("api-version".into(), "7.4".into()))
            .match_header("authorization", "Bearer vault-token")
            .with_status(200)
            .with_body(r#"{"value":"8443","id":"https://kv/secrets/port/abc"}"#)
            .create_async()
            .await;

        let value = resolver(&server).resolve_secret("port").await.unwrap();

        token.assert_async().await;
        secret.assert_async().await;
        assert_eq!(value, "8443");
    }

    #[tokio::test]
    async fn test_resolve_secret_not_found() {
        let mut server = Server::new_async().await;
        let _token = mock_token(&mut server).await;
        let _m = server
            .mock("GET", "/secrets/missing")
            .match_query(Matcher::Any)
            .with_status(404)
            .with_body(r#"{"error":{"code":"SecretNotFound"}}"#)
            .create_async()
            .await;

        let err = resolver(&server).resolve_secret("missing").await.unwrap_err();
        assert!(matches!(err, VaultError::NotFound(ref n) if n == "missing"));
    }

    #[tokio::test]
    async fn test_resolve_secret_server_error() {
        let mut server = Server::new_async().await;
        let _token = mock_token(&mut server).await;
        let _m = server
            .mock("GET", "/secrets/port")
            .match_query(Matcher::Any)
            .with_status(503)
            .with_body("unavailable")
            .create_async()
            .await;

        match resolver(&server).resolve_secret("port").await {
            Err(VaultError::Status { status, body, .. }) => {
                assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
                assert_eq!(body, "unavailable");
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_resolve_secret_credential_failure() {
        let mut server = Server::new_async().await;
        let _m = server
            .mock("POST", "/tenant-1/oauth2/v2.0/token")
            .with_status(400)
            .create_async()
            .await;
        let secret = server
            .mock("GET", Matcher::Any)
            .expect(0)
            .create_async()
            .await;

        let err = resolver(&server).resolve_secret("port").await.unwrap_err();
        assert!(matches!(err, VaultError::Credential(_)));
        secret.assert_async().await;
    }

    #[tokio::test]
    async fn test_resolve_certificate_bundle_writes_file() {
        let mut server = Server::new_async().await;
        let _token = mock_token(&mut server).await;
        let pem = "-----BEGIN CERTIFICATE-----\nMIIB\n-----END CERTIFICATE-----\n";
        let _m = server
            .mock("GET", "/secrets/tls-cert")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(serde_json::json!({ "value": pem }).to_string())
            .create_async()
            .await;

        let file = resolver(&server)
            .resolve_certificate_bundle("tls-cert")
            .await
            .unwrap();
        let path = file.path().to_path_buf();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), pem);

        drop(file);
        assert!(!path.exists());
    }
}
