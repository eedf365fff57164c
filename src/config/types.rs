use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    pub server: ServerSettings,
    #[serde(default)]
    pub database: DatabaseSettings,
    #[serde(default)]
    pub azure: AzureSettings,
    #[serde(default)]
    pub security: SecuritySettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub transport: TransportType,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            transport: TransportType::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportType {
    Stdio,
}

impl Default for TransportType {
    fn default() -> Self {
        TransportType::Stdio
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SslMode {
    Disable,
    Prefer,
    Require,
}

impl Default for SslMode {
    fn default() -> Self {
        SslMode::Require
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSettings {
    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,
    /// TLS negotiation mode
    #[serde(default)]
    pub ssl_mode: SslMode,
    /// Upper bound for establishing a connection
    #[serde(with = "humantime_serde", default = "default_connect_timeout")]
    pub connect_timeout: Duration,
    /// When false the mutating tools are registered as well
    #[serde(default = "default_true")]
    pub read_only: bool,
    #[serde(default = "default_application_name")]
    pub application_name: String,
    /// Database used to list the other databases
    #[serde(default = "default_maintenance_database")]
    pub maintenance_database: String,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            port: default_port(),
            ssl_mode: SslMode::default(),
            connect_timeout: default_connect_timeout(),
            read_only: default_true(),
            application_name: default_application_name(),
            maintenance_database: default_maintenance_database(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AzureSettings {
    /// Azure Resource Manager endpoint
    #[serde(default = "default_management_endpoint")]
    pub management_endpoint: String,
    /// API version of the flexible server resource provider
    #[serde(default = "default_api_version")]
    pub api_version: String,
    /// Microsoft Entra authority used by the client secret credential
    #[serde(default = "default_authority_host")]
    pub authority_host: String,
    #[serde(with = "humantime_serde", default = "default_http_timeout")]
    pub http_timeout: Duration,
    /// Scheme of the databases resource URI
    #[serde(default = "default_resource_scheme")]
    pub resource_scheme: String,
}

impl Default for AzureSettings {
    fn default() -> Self {
        Self {
            management_endpoint: default_management_endpoint(),
            api_version: default_api_version(),
            authority_host: default_authority_host(),
            http_timeout: default_http_timeout(),
            resource_scheme: default_resource_scheme(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecuritySettings {
    /// Rate limiting settings
    #[serde(default)]
    pub rate_limiting: RateLimitSettings,
    /// Tool restrictions
    #[serde(default)]
    pub tools: ToolSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSettings {
    /// Enable rate limiting
    #[serde(default)]
    pub enabled: bool,
    /// Maximum number of requests per minute
    #[serde(default = "default_rate_limit")]
    pub requests_per_minute: u32,
    /// Burst allowance above the base rate
    #[serde(default = "default_burst_limit")]
    pub burst: u32,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            requests_per_minute: default_rate_limit(),
            burst: default_burst_limit(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolSettings {
    /// List of allowed tools (if None, all registered tools are allowed)
    #[serde(default)]
    pub allowed: Option<HashSet<String>>,
    /// List of denied tools
    #[serde(default)]
    pub denied: HashSet<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
    /// Path to a JSON-lines request log (if None, requests are only traced)
    pub request_log: Option<PathBuf>,
    /// Whether to enable request logging
    #[serde(default = "default_true")]
    pub log_requests: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            request_log: None,
            log_requests: default_true(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

impl Default for LogFormat {
    fn default() -> Self {
        LogFormat::Text
    }
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_port() -> u16 {
    5432
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(15)
}

fn default_application_name() -> String {
    "azure-postgres-mcp".to_string()
}

fn default_maintenance_database() -> String {
    "postgres".to_string()
}

fn default_management_endpoint() -> String {
    "https://management.azure.com".to_string()
}

fn default_api_version() -> String {
    "2022-12-01".to_string()
}

fn default_authority_host() -> String {
    "https://login.microsoftonline.com".to_string()
}

fn default_http_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_resource_scheme() -> String {
    "flexpg".to_string()
}

fn default_rate_limit() -> u32 {
    120
}

fn default_burst_limit() -> u32 {
    20
}

fn default_log_level() -> String {
    "info".to_string()
}
