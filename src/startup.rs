use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;

use crate::azure::build_http_client;
use crate::azure::keyvault::SecretResolver;
use crate::config::Config;
use crate::utils::temp_file::CertificateFile;

/// Everything resolved before the listener binds.
#[derive(Debug)]
pub struct Bootstrap {
    pub config: Arc<Config>,
    pub http_client: reqwest::Client,
    pub certificate: CertificateFile,
    pub port: u16,
}

/// Fetch the TLS bundle and listening port from Key Vault.
///
/// `port_override` skips the port secret lookup. Any failure here is fatal.
pub async fn bootstrap(config: Config, port_override: Option<u16>) -> Result<Bootstrap> {
    let http_client = build_http_client(config.http_timeout).context("creating HTTP client")?;
    let resolver = SecretResolver::from_config(http_client.clone(), &config);

    let certificate = resolver
        .resolve_certificate_bundle(&config.cert_name)
        .await
        .with_context(|| format!("fetching certificate '{}' from Key Vault", config.cert_name))?;

    let port = match port_override {
        Some(port) => port,
        None => {
            let raw = resolver
                .resolve_secret(&config.port_secret_name)
                .await
                .with_context(|| {
                    format!("fetching port secret '{}' from Key Vault", config.port_secret_name)
                })?;
            parse_port(&raw)?
        }
    };

    info!(port, cert = %config.cert_name, "startup secrets resolved");

    Ok(Bootstrap {
        config: Arc::new(config),
        http_client,
        certificate,
        port,
    })
}

/// Load the config from `lookup`, then [`bootstrap`].
///
/// A missing or invalid variable stops here, before any vault request.
pub async fn bootstrap_from_lookup<F>(lookup: F, port_override: Option<u16>) -> Result<Bootstrap>
where
    F: Fn(&str) -> Option<String>,
{
    let config = Config::from_lookup(lookup).context("loading configuration")?;
    bootstrap(config, port_override).await
}

fn parse_port(raw: &str) -> Result<u16> {
    let raw = raw.trim();
    let raw = raw.strip_prefix(':').unwrap_or(raw);
    match raw.parse::<u16>() {
        Ok(0) => anyhow::bail!("port secret must not be 0"),
        Ok(port) => Ok(port),
        Err(e) => Err(anyhow::anyhow!("invalid port secret '{}': {}", raw, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::REQUIRED_VARS;
    use mockito::{Matcher, Server, ServerGuard};
    use std::collections::HashMap;

    fn config_for(server: &ServerGuard) -> Config {
        let mut env: HashMap<&str, String> = REQUIRED_VARS
            .iter()
            .map(|k| (*k, format!("{}-value", k.to_lowercase())))
            .collect();
        env.insert("AZURE_TENANT_ID", "tenant-1".to_string());
        env.insert("AZURE_CERT_NAME", "tls-cert".to_string());
        env.insert("AZURE_KEYVAULT_URL", server.url());
        env.insert("AZURE_AUTHORITY_HOST", server.url());
        Config::from_lookup(|k| env.get(k).cloned()).unwrap()
    }

    async fn mock_vault(server: &mut ServerGuard, port_value: &str) -> Vec<mockito::Mock> {
        let token = server
            .mock("POST", "/tenant-1/oauth2/v2.0/token")
            .with_status(200)
            .with_body(r#"{"access_token":"vault-token"}"#)
            .expect_at_least(1)
            .create_async()
            .await;
        let cert = server
            .mock("GET", "/secrets/tls-cert")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"value":"-----BEGIN CERTIFICATE-----\n"}"#)
            .create_async()
            .await;
        let port = server
            .mock("GET", "/secrets/port")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(serde_json::json!({ "value": port_value }).to_string())
            .create_async()
            .await;
        vec![token, cert, port]
    }

    #[tokio::test]
    async fn test_missing_variable_stops_before_vault() {
        let mut server = Server::new_async().await;
        let token = server
            .mock("POST", Matcher::Any)
            .expect(0)
            .create_async()
            .await;
        let vault = server
            .mock("GET", Matcher::Any)
            .expect(0)
            .create_async()
            .await;

        let url = server.url();
        let lookup = |k: &str| match k {
            "AZURE_TENANT_ID" => Some("tenant-1".to_string()),
            "AZURE_CLIENT_ID" => Some("client-1".to_string()),
            "AZURE_CLIENT_SECRET" => Some("   ".to_string()),
            "AZURE_KEYVAULT_URL" | "AZURE_AUTHORITY_HOST" => Some(url.clone()),
            "AZURE_CERT_NAME" => Some("tls-cert".to_string()),
            _ => None,
        };

        let err = bootstrap_from_lookup(lookup, None).await.unwrap_err();
        assert!(format!("{:#}", err).contains("AZURE_CLIENT_SECRET"));
        token.assert_async().await;
        vault.assert_async().await;
    }

    #[tokio::test]
    async fn test_certificate_failure_skips_port_secret() {
        let mut server = Server::new_async().await;
        let _m = server
            .mock("POST", "/tenant-1/oauth2/v2.0/token")
            .with_status(200)
            .with_body(r#"{"access_token":"vault-token"}"#)
            .create_async()
            .await;
        let _m = server
            .mock("GET", "/secrets/tls-cert")
            .match_query(Matcher::Any)
            .with_status(500)
            .create_async()
            .await;
        let port_mock = server
            .mock("GET", "/secrets/port")
            .match_query(Matcher::Any)
            .expect(0)
            .create_async()
            .await;

        assert!(bootstrap(config_for(&server), None).await.is_err());
        port_mock.assert_async().await;
    }

    #[test]
    fn test_parse_port() {
        assert_eq!(parse_port("8443").unwrap(), 8443);
        assert_eq!(parse_port(" :443\n").unwrap(), 443);
        assert!(parse_port("0").is_err());
        assert!(parse_port("https").is_err());
        assert!(parse_port("70000").is_err());
    }

    #[tokio::test]
    async fn test_bootstrap_resolves_certificate_and_port() {
        let mut server = Server::new_async().await;
        let _vault = mock_vault(&mut server, "8443").await;

        let boot = bootstrap(config_for(&server), None).await.unwrap();
        assert_eq!(boot.port, 8443);
        assert!(boot.certificate.path().exists());
    }

    #[tokio::test]
    async fn test_bootstrap_port_override_skips_port_secret() {
        let mut server = Server::new_async().await;
        let _m = server
            .mock("POST", "/tenant-1/oauth2/v2.0/token")
            .with_status(200)
            .with_body(r#"{"access_token":"vault-token"}"#)
            .create_async()
            .await;
        let _m = server
            .mock("GET", "/secrets/tls-cert")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"value":"pem"}"#)
            .create_async()
            .await;
        let port_mock = server
            .mock("GET", "/secrets/port")
            .match_query(Matcher::Any)
            .expect(0)
            .create_async()
            .await;

        let boot = bootstrap(config_for(&server), Some(9443)).await.unwrap();
        assert_eq!(boot.port, 9443);
        port_mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_bootstrap_fails_when_certificate_missing() {
        let mut server = Server::new_async().await;
        let _m = server
            .mock("POST", "/tenant-1/oauth2/v2.0/token")
            .with_status(200)
            .with_body(r#"{"access_token":"vault-token"}"#)
            .create_async()
            .await;
        let _m = server
            .mock("GET", "/secrets/tls-cert")
            .match_query(Matcher::Any)
            .with_status(404)
            .create_async()
            .await;

        let err = bootstrap(config_for(&server), Some(9443)).await.unwrap_err();
        assert!(format!("{:#}", err).contains("tls-cert"));
    }

    #[tokio::test]
    async fn test_bootstrap_fails_on_bad_port_secret() {
        let mut server = Server::new_async().await;
        let _vault = mock_vault(&mut server, "not-a-port").await;

        assert!(bootstrap(config_for(&server), None).await.is_err());
    }
}
