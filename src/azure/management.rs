//! Control-plane access to Azure Database for PostgreSQL flexible servers.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use url::Url;

use crate::azure::identity::{TokenProvider, MANAGEMENT_SCOPE};
use crate::config::types::AzureSettings;
use crate::gateway::error::GatewayError;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageProfile {
    pub storage_size_gb: Option<i64>,
    pub backup_retention_days: Option<i64>,
    pub geo_redundant_backup: Option<String>,
}

/// Server configuration as reported by the management API. Every field is
/// optional because the provider omits properties it does not know.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub name: Option<String>,
    pub location: Option<String>,
    pub version: Option<String>,
    pub sku: Option<String>,
    pub storage_profile: StorageProfile,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerParameter {
    pub param: String,
    pub value: Option<String>,
}

#[async_trait]
pub trait ManagementApi: Send + Sync {
    async fn get_server(&self, resource_group: &str, server_name: &str) -> Result<ServerInfo, GatewayError>;

    async fn get_configuration(
        &self,
        resource_group: &str,
        server_name: &str,
        parameter_name: &str,
    ) -> Result<ServerParameter, GatewayError>;
}

// Wire shapes of the resource provider.

#[derive(Deserialize)]
struct ArmServer {
    name: Option<String>,
    location: Option<String>,
    sku: Option<ArmSku>,
    #[serde(default)]
    properties: ArmServerProperties,
}

#[derive(Deserialize)]
struct ArmSku {
    name: Option<String>,
}

#[derive(Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ArmServerProperties {
    version: Option<String>,
    storage: Option<ArmStorage>,
    backup: Option<ArmBackup>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ArmStorage {
    #[serde(rename = "storageSizeGB")]
    storage_size_gb: Option<i64>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ArmBackup {
    backup_retention_days: Option<i64>,
    geo_redundant_backup: Option<String>,
}

impl From<ArmServer> for ServerInfo {
    fn from(server: ArmServer) -> Self {
        let properties = server.properties;
        Self {
            name: server.name,
            location: server.location,
            version: properties.version,
            sku: server.sku.and_then(|sku| sku.name),
            storage_profile: StorageProfile {
                storage_size_gb: properties.storage.and_then(|s| s.storage_size_gb),
                backup_retention_days: properties
                    .backup
                    .as_ref()
                    .and_then(|b| b.backup_retention_days),
                geo_redundant_backup: properties.backup.and_then(|b| b.geo_redundant_backup),
            },
        }
    }
}

#[derive(Deserialize)]
struct ArmConfiguration {
    name: String,
    #[serde(default)]
    properties: ArmConfigurationProperties,
}

#[derive(Default, Deserialize)]
struct ArmConfigurationProperties {
    value: Option<String>,
}

#[derive(Deserialize)]
struct ArmErrorResponse {
    error: ArmErrorBody,
}

#[derive(Deserialize)]
struct ArmErrorBody {
    code: String,
    message: String,
}

/// Azure Resource Manager client for `Microsoft.DBforPostgreSQL/flexibleServers`.
pub struct ArmClient {
    http: reqwest::Client,
    credential: Arc<dyn TokenProvider>,
    endpoint: Url,
    api_version: String,
    subscription_id: String,
}

impl ArmClient {
    pub fn new(
        settings: &AzureSettings,
        subscription_id: &str,
        credential: Arc<dyn TokenProvider>,
    ) -> Result<Self, GatewayError> {
        let http = reqwest::Client::builder()
            .timeout(settings.http_timeout)
            .build()
            .map_err(|e| GatewayError::Configuration(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            credential,
            endpoint: Url::parse(&settings.management_endpoint).map_err(|e| {
                GatewayError::Configuration(format!(
                    "invalid management endpoint '{}': {}",
                    settings.management_endpoint, e
                ))
            })?,
            api_version: settings.api_version.clone(),
            subscription_id: subscription_id.to_string(),
        })
    }

    /// URL of a flexible server, or of a child resource when `child` is given.
    /// Every segment is percent-encoded.
    fn server_url(&self, resource_group: &str, server_name: &str, child: &[&str]) -> Result<Url, GatewayError> {
        let mut url = self.endpoint.clone();
        url.path_segments_mut()
            .map_err(|_| {
                GatewayError::Configuration(format!("invalid management endpoint '{}'", self.endpoint))
            })?
            .pop_if_empty()
            .extend([
                "subscriptions",
                self.subscription_id.as_str(),
                "resourceGroups",
                resource_group,
                "providers",
                "Microsoft.DBforPostgreSQL",
                "flexibleServers",
                server_name,
            ])
            .extend(child);
        Ok(url)
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(&self, url: Url) -> Result<T, GatewayError> {
        let token = self.credential.get_token(MANAGEMENT_SCOPE).await?;

        let response = self
            .http
            .get(url)
            .query(&[("api-version", self.api_version.as_str())])
            .bearer_auth(token.token.expose())
            .send()
            .await
            .map_err(|e| GatewayError::ManagementApi(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = match serde_json::from_str::<ArmErrorResponse>(&body) {
                Ok(err) => format!("{} ({}): {}", status, err.error.code, err.error.message),
                Err(_) => format!("{}: {}", status, body),
            };
            return Err(GatewayError::ManagementApi(message));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| GatewayError::ManagementApi(format!("Unexpected response: {}", e)))
    }
}

#[async_trait]
impl ManagementApi for ArmClient {
    async fn get_server(&self, resource_group: &str, server_name: &str) -> Result<ServerInfo, GatewayError> {
        let url = self.server_url(resource_group, server_name, &[])?;
        let server: ArmServer = self.get_json(url).await?;
        Ok(server.into())
    }

    async fn get_configuration(
        &self,
        resource_group: &str,
        server_name: &str,
        parameter_name: &str,
    ) -> Result<ServerParameter, GatewayError> {
        let url = self.server_url(resource_group, server_name, &["configurations", parameter_name])?;
        let configuration: ArmConfiguration = self.get_json(url).await?;
        Ok(ServerParameter {
            param: configuration.name,
            value: configuration.properties.value,
        })
    }
}
