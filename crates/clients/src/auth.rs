//! Client-credentials access tokens for the catalog and deployment manager.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tenant_core::SecretReader;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::{check, ClientError, ClientResult};

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

enum Grant {
    /// Exchange `client_id`/`client_secret` from a cluster secret at `token_url`.
    ClientCredentials { token_url: String, secrets: Arc<dyn SecretReader>, secret_name: String },
    Fixed,
}

/// Caches a bearer token; shared by every client that talks to the same identity provider.
pub struct TokenSource {
    http: reqwest::Client,
    grant: Grant,
    token: RwLock<Option<String>>,
}

impl TokenSource {
    /// `keycloak` is the identity provider base URL, e.g. `http://keycloak:8080`.
    pub fn client_credentials(keycloak: &str, realm: &str, secrets: Arc<dyn SecretReader>, secret_name: impl Into<String>) -> Self {
        let token_url = format!("{}/realms/{}/protocol/openid-connect/token", keycloak.trim_end_matches('/'), realm);
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { http, grant: Grant::ClientCredentials { token_url, secrets, secret_name: secret_name.into() }, token: RwLock::new(None) }
    }

    /// A token that never changes (tests, or backends without auth).
    pub fn fixed(token: impl Into<String>) -> Self {
        Self { http: reqwest::Client::new(), grant: Grant::Fixed, token: RwLock::new(Some(token.into())) }
    }

    /// Read the client secret and fetch a fresh token.
    pub async fn refresh(&self) -> ClientResult<()> {
        let Grant::ClientCredentials { token_url, secrets, secret_name } = &self.grant else {
            return Ok(());
        };
        let secret = secrets
            .read_secret(secret_name)
            .await
            .map_err(|e| ClientError::Unauthorized(format!("reading secret {}: {:#}", secret_name, e)))?;
        let field = |k: &str| -> ClientResult<String> {
            secret
                .get(k)
                .map(|v| String::from_utf8_lossy(v).trim().to_string())
                .filter(|v| !v.is_empty())
                .ok_or_else(|| ClientError::Unauthorized(format!("secret {} missing {}", secret_name, k)))
        };
        let client_id = field("client_id")?;
        let client_secret = field("client_secret")?;
        let form = [("grant_type", "client_credentials"), ("client_id", client_id.as_str()), ("client_secret", client_secret.as_str())];
        let resp = self.http.post(token_url).form(&form[..]).send().await?;
        let resp = check("token request", resp).await?;
        let tok: TokenResponse = resp.json().await?;
        *self.token.write().await = Some(tok.access_token);
        info!(client_id = %client_id, "access token refreshed");
        Ok(())
    }

    /// Current token, fetching one first if none is cached.
    pub async fn bearer(&self) -> ClientResult<String> {
        if let Some(t) = self.token.read().await.clone() {
            return Ok(t);
        }
        self.refresh().await?;
        self.token.read().await.clone().ok_or_else(|| ClientError::Unauthorized("no access token".into()))
    }

    /// Drop the cached token so the next call refreshes it. Fixed tokens are kept.
    pub async fn invalidate(&self) {
        if matches!(self.grant, Grant::ClientCredentials { .. }) {
            debug!("invalidating cached access token");
            *self.token.write().await = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tenant_core::mem::MemSecrets;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn exchanges_client_secret_and_caches() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/realms/master/protocol/openid-connect/token"))
            .and(body_string_contains("grant_type=client_credentials"))
            .and(body_string_contains("client_id=tenant-controller"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "access_token": "tok-1", "expires_in": 300 })))
            .expect(1)
            .mount(&server)
            .await;
        let secrets = MemSecrets::new();
        secrets.insert("m2m-client-secret", "client_id", b"tenant-controller");
        secrets.insert("m2m-client-secret", "client_secret", b"s3cr3t\n");
        let ts = TokenSource::client_credentials(&server.uri(), "master", Arc::new(secrets), "m2m-client-secret");
        assert_eq!(ts.bearer().await.unwrap(), "tok-1");
        assert_eq!(ts.bearer().await.unwrap(), "tok-1");
    }

    #[tokio::test]
    async fn missing_secret_field_is_unauthorized() {
        let secrets = MemSecrets::new();
        secrets.insert("m2m-client-secret", "client_id", b"tenant-controller");
        let ts = TokenSource::client_credentials("http://127.0.0.1:1", "master", Arc::new(secrets), "m2m-client-secret");
        let err = ts.refresh().await.unwrap_err();
        assert!(matches!(err, ClientError::Unauthorized(ref m) if m.contains("client_secret")), "err={}", err);
    }

    #[tokio::test]
    async fn fixed_token_survives_invalidate() {
        let ts = TokenSource::fixed("static");
        ts.invalidate().await;
        assert_eq!(ts.bearer().await.unwrap(), "static");
    }
}
