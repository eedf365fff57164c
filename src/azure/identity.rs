//! Microsoft Entra token acquisition.
//!
//! [`DefaultAzureCredential`] walks a fixed chain of sources and returns the
//! first token issued: a service principal secret from the environment, the
//! managed identity of the host, then the signed-in Azure CLI account.
//! Tokens are never cached; every call goes to the issuing source.

use async_trait::async_trait;
use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tokio::process::Command;

use crate::config::env::Secret;
use crate::config::types::AzureSettings;
use crate::gateway::error::GatewayError;

/// Scope of Azure Database for PostgreSQL data-plane tokens.
pub const DATABASE_SCOPE: &str = "https://ossrdbms-aad.database.windows.net/.default";
/// Scope of Azure Resource Manager tokens.
pub const MANAGEMENT_SCOPE: &str = "https://management.azure.com/.default";

const IMDS_ENDPOINT: &str = "http://169.254.169.254/metadata/identity/oauth2/token";
const IMDS_API_VERSION: &str = "2018-02-01";
const APP_SERVICE_API_VERSION: &str = "2019-08-01";
const IMDS_CHECK_TIMEOUT: Duration = Duration::from_secs(3);
const CLI_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug, Clone)]
pub struct AccessToken {
    pub token: Secret,
    pub expires_on: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn get_token(&self, scope: &str) -> Result<AccessToken, GatewayError>;

    /// Short label used in logs and aggregated errors.
    fn name(&self) -> &'static str;
}

/// v1 endpoints (IMDS, App Service, CLI) take a resource, not a scope.
pub fn resource_for_scope(scope: &str) -> &str {
    scope.strip_suffix("/.default").unwrap_or(scope)
}

fn parse_epoch(value: &Value) -> Option<DateTime<Utc>> {
    let secs = match value {
        Value::Number(n) => n.as_i64()?,
        Value::String(s) => s.trim().parse::<i64>().ok()?,
        _ => return None,
    };
    Utc.timestamp_opt(secs, 0).single()
}

async fn error_body(response: reqwest::Response) -> String {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    let detail = serde_json::from_str::<Value>(&body)
        .ok()
        .and_then(|json| {
            json.get("error_description")
                .or_else(|| json.get("message"))
                .or_else(|| json.get("error"))
                .map(|v| match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
        })
        .unwrap_or(body);
    format!("HTTP {}: {}", status, detail)
}

#[derive(Deserialize)]
struct OAuthTokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<Value>,
    #[serde(default)]
    expires_on: Option<Value>,
}

impl OAuthTokenResponse {
    fn into_token(self) -> AccessToken {
        let expires_on = self.expires_on.as_ref().and_then(parse_epoch).or_else(|| {
            let secs = match self.expires_in.as_ref()? {
                Value::Number(n) => n.as_i64()?,
                Value::String(s) => s.parse::<i64>().ok()?,
                _ => return None,
            };
            Some(Utc::now() + chrono::Duration::seconds(secs))
        });

        AccessToken {
            token: Secret::new(self.access_token),
            expires_on,
        }
    }
}

/// Service principal credential (`AZURE_TENANT_ID`, `AZURE_CLIENT_ID`,
/// `AZURE_CLIENT_SECRET`).
pub struct ClientSecretCredential {
    http: reqwest::Client,
    authority_host: String,
    tenant_id: String,
    client_id: String,
    client_secret: Secret,
}

impl ClientSecretCredential {
    pub fn new(
        http: reqwest::Client,
        authority_host: &str,
        tenant_id: String,
        client_id: String,
        client_secret: Secret,
    ) -> Self {
        Self {
            http,
            authority_host: authority_host.trim_end_matches('/').to_string(),
            tenant_id,
            client_id,
            client_secret,
        }
    }
}

#[async_trait]
impl TokenProvider for ClientSecretCredential {
    async fn get_token(&self, scope: &str) -> Result<AccessToken, GatewayError> {
        let url = format!("{}/{}/oauth2/v2.0/token", self.authority_host, self.tenant_id);
        let form = [
            ("grant_type", "client_credentials"),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.expose()),
            ("scope", scope),
        ];

        let response = self
            .http
            .post(&url)
            .form(&form)
            .send()
            .await
            .map_err(|e| GatewayError::Authentication(e.to_string()))?;

        if !response.status().is_success() {
            return Err(GatewayError::Authentication(error_body(response).await));
        }

        let body: OAuthTokenResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::Authentication(format!("Invalid token response: {}", e)))?;
        Ok(body.into_token())
    }

    fn name(&self) -> &'static str {
        "ClientSecretCredential"
    }
}

enum ManagedIdentitySource {
    AppService { endpoint: String, header: Secret },
    Imds,
}

/// Host-assigned identity, through App Service when its endpoint is
/// advertised and through the instance metadata service otherwise.
pub struct ManagedIdentityCredential {
    http: reqwest::Client,
    source: ManagedIdentitySource,
    client_id: Option<String>,
}

impl ManagedIdentityCredential {
    pub fn from_lookup<F>(http: reqwest::Client, lookup: &F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |name: &str| lookup(name).filter(|v| !v.is_empty());

        let source = match (non_empty("IDENTITY_ENDPOINT"), non_empty("IDENTITY_HEADER")) {
            (Some(endpoint), Some(header)) => ManagedIdentitySource::AppService {
                endpoint,
                header: Secret::new(header),
            },
            _ => ManagedIdentitySource::Imds,
        };

        Self {
            http,
            source,
            client_id: non_empty("AZURE_CLIENT_ID"),
        }
    }
}

#[async_trait]
impl TokenProvider for ManagedIdentityCredential {
    async fn get_token(&self, scope: &str) -> Result<AccessToken, GatewayError> {
        let resource = resource_for_scope(scope);
        let mut query = vec![("resource", resource)];
        if let Some(client_id) = &self.client_id {
            query.push(("client_id", client_id.as_str()));
        }

        let request = match &self.source {
            ManagedIdentitySource::AppService { endpoint, header } => {
                query.push(("api-version", APP_SERVICE_API_VERSION));
                self.http
                    .get(endpoint)
                    .header("X-IDENTITY-HEADER", header.expose())
                    .query(&query)
            }
            ManagedIdentitySource::Imds => {
                query.push(("api-version", IMDS_API_VERSION));
                self.http
                    .get(IMDS_ENDPOINT)
                    .header("Metadata", "true")
                    .query(&query)
                    .timeout(IMDS_CHECK_TIMEOUT)
            }
        };

        let response = request
            .send()
            .await
            .map_err(|e| GatewayError::Authentication(format!("managed identity endpoint unreachable: {}", e)))?;

        if !response.status().is_success() {
            return Err(GatewayError::Authentication(error_body(response).await));
        }

        let body: OAuthTokenResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::Authentication(format!("Invalid token response: {}", e)))?;
        Ok(body.into_token())
    }

    fn name(&self) -> &'static str {
        "ManagedIdentityCredential"
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CliTokenResponse {
    access_token: String,
    #[serde(default)]
    expires_on: Option<String>,
    #[serde(default, rename = "expires_on")]
    expires_on_epoch: Option<Value>,
}

/// Token of the account signed in to the Azure CLI.
pub struct AzureCliCredential;

#[async_trait]
impl TokenProvider for AzureCliCredential {
    async fn get_token(&self, scope: &str) -> Result<AccessToken, GatewayError> {
        let output = Command::new("az")
            .args(["account", "get-access-token", "--output", "json", "--resource"])
            .arg(resource_for_scope(scope))
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(CLI_TIMEOUT, output)
            .await
            .map_err(|_| GatewayError::Authentication("az did not answer in time".to_string()))?
            .map_err(|e| GatewayError::Authentication(format!("az is not available: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(GatewayError::Authentication(stderr.trim().to_string()));
        }

        let body: CliTokenResponse = serde_json::from_slice(&output.stdout)
            .map_err(|e| GatewayError::Authentication(format!("Invalid az output: {}", e)))?;

        let expires_on = body.expires_on_epoch.as_ref().and_then(parse_epoch).or_else(|| {
            let naive =
                NaiveDateTime::parse_from_str(body.expires_on.as_deref()?, "%Y-%m-%d %H:%M:%S%.f").ok()?;
            Local
                .from_local_datetime(&naive)
                .single()
                .map(|t| t.with_timezone(&Utc))
        });

        Ok(AccessToken {
            token: Secret::new(body.access_token),
            expires_on,
        })
    }

    fn name(&self) -> &'static str {
        "AzureCliCredential"
    }
}

/// Ordered credential chain; the first source that issues a token wins.
pub struct DefaultAzureCredential {
    sources: Vec<Box<dyn TokenProvider>>,
}

impl DefaultAzureCredential {
    pub fn new(sources: Vec<Box<dyn TokenProvider>>) -> Self {
        Self { sources }
    }

    pub fn from_env(settings: &AzureSettings) -> Result<Self, GatewayError> {
        Self::from_lookup(settings, |name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(settings: &AzureSettings, lookup: F) -> Result<Self, GatewayError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let http = reqwest::Client::builder()
            .timeout(settings.http_timeout)
            .build()
            .map_err(|e| GatewayError::Configuration(format!("Failed to build HTTP client: {}", e)))?;

        let non_empty = |name: &str| lookup(name).filter(|v| !v.is_empty());
        let mut sources: Vec<Box<dyn TokenProvider>> = Vec::new();

        if let (Some(tenant_id), Some(client_id), Some(secret)) = (
            non_empty("AZURE_TENANT_ID"),
            non_empty("AZURE_CLIENT_ID"),
            non_empty("AZURE_CLIENT_SECRET"),
        ) {
            sources.push(Box::new(ClientSecretCredential::new(
                http.clone(),
                &settings.authority_host,
                tenant_id,
                client_id,
                Secret::new(secret),
            )));
        }
        sources.push(Box::new(ManagedIdentityCredential::from_lookup(http, &lookup)));
        sources.push(Box::new(AzureCliCredential));

        Ok(Self { sources })
    }

    pub fn source_names(&self) -> Vec<&'static str> {
        self.sources.iter().map(|s| s.name()).collect()
    }
}

#[async_trait]
impl TokenProvider for DefaultAzureCredential {
    async fn get_token(&self, scope: &str) -> Result<AccessToken, GatewayError> {
        let mut failures = Vec::with_capacity(self.sources.len());

        for source in &self.sources {
            match source.get_token(scope).await {
                Ok(token) => {
                    tracing::debug!(source = source.name(), "token acquired");
                    return Ok(token);
                }
                Err(e) => {
                    tracing::debug!(source = source.name(), error = %e, "token source failed");
                    failures.push(format!("{}: {}", source.name(), e));
                }
            }
        }

        Err(GatewayError::Authentication(format!(
            "no credential source could issue a token ({})",
            failures.join("; ")
        )))
    }

    fn name(&self) -> &'static str {
        "DefaultAzureCredential"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::error::ErrorKind;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Fixed {
        result: Result<&'static str, &'static str>,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl TokenProvider for Fixed {
        async fn get_token(&self, _scope: &str) -> Result<AccessToken, GatewayError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.result {
                Ok(token) => Ok(AccessToken {
                    token: Secret::new(token),
                    expires_on: None,
                }),
                Err(reason) => Err(GatewayError::Authentication(reason.to_string())),
            }
        }

        fn name(&self) -> &'static str {
            "Fixed"
        }
    }

    #[test]
    fn scope_to_resource() {
        assert_eq!(
            resource_for_scope(DATABASE_SCOPE),
            "https://ossrdbms-aad.database.windows.net"
        );
        assert_eq!(resource_for_scope("https://x"), "https://x");
    }

    #[test]
    fn epoch_parsing_accepts_numbers_and_strings() {
        let from_num = parse_epoch(&serde_json::json!(1700000000)).unwrap();
        let from_str = parse_epoch(&serde_json::json!("1700000000")).unwrap();
        assert_eq!(from_num, from_str);
        assert!(parse_epoch(&serde_json::json!(null)).is_none());
    }

    #[tokio::test]
    async fn chain_stops_at_first_success() {
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let third = Arc::new(AtomicUsize::new(0));
        let chain = DefaultAzureCredential::new(vec![
            Box::new(Fixed { result: Err("no env"), calls: first.clone() }),
            Box::new(Fixed { result: Ok("token-abc"), calls: second.clone() }),
            Box::new(Fixed { result: Ok("unused"), calls: third.clone() }),
        ]);

        let token = chain.get_token(DATABASE_SCOPE).await.unwrap();

        assert_eq!(token.token.expose(), "token-abc");
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 1);
        assert_eq!(third.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn chain_reports_every_failure() {
        let calls = Arc::new(AtomicUsize::new(0));
        let chain = DefaultAzureCredential::new(vec![
            Box::new(Fixed { result: Err("denied"), calls: calls.clone() }),
            Box::new(Fixed { result: Err("expired"), calls: calls.clone() }),
        ]);

        let err = chain.get_token(DATABASE_SCOPE).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::AuthenticationError);
        assert!(err.to_string().contains("denied"));
        assert!(err.to_string().contains("expired"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn client_secret_source_only_with_full_environment() {
        let settings = AzureSettings::default();

        let partial = DefaultAzureCredential::from_lookup(&settings, |name| match name {
            "AZURE_TENANT_ID" => Some("tenant".to_string()),
            _ => None,
        })
        .unwrap();
        assert_eq!(
            partial.source_names(),
            vec!["ManagedIdentityCredential", "AzureCliCredential"]
        );

        let full = DefaultAzureCredential::from_lookup(&settings, |name| match name {
            "AZURE_TENANT_ID" | "AZURE_CLIENT_ID" | "AZURE_CLIENT_SECRET" => Some("x".to_string()),
            _ => None,
        })
        .unwrap();
        assert_eq!(full.source_names()[0], "ClientSecretCredential");
    }

    #[test]
    fn token_response_expiry() {
        let body: OAuthTokenResponse =
            serde_json::from_str(r#"{"access_token":"t","expires_on":"1700000000"}"#).unwrap();
        let token = body.into_token();
        assert_eq!(token.expires_on.unwrap().timestamp(), 1_700_000_000);

        let body: OAuthTokenResponse =
            serde_json::from_str(r#"{"access_token":"t","expires_in":3599}"#).unwrap();
        assert!(body.into_token().expires_on.unwrap() > Utc::now());
    }
}
