//! Credentialed query gateway: resolves a credential, opens a connection
//! for one statement, and hands back a [`QueryResult`].

pub mod connection;
pub mod credential;
pub mod error;
pub mod guard;
pub mod query;

use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, instrument, warn};

use crate::azure::identity::TokenProvider;
use crate::azure::management::{ManagementApi, ServerInfo, ServerParameter};
use crate::config::env::{AuthMode, AzureIdentity, GatewayConfig, PGPASSWORD};
use crate::config::types::DatabaseSettings;

use self::connection::{ConnectionFactory, PgSession};
use self::error::GatewayError;
pub use self::query::QueryResult;

pub const LIST_DATABASES: &str = "SELECT datname FROM pg_database WHERE datistemplate = false;";
pub const LIST_SCHEMAS: &str = "SELECT table_name, column_name, data_type FROM information_schema.columns \
     WHERE table_schema = 'public' ORDER BY table_name, ordinal_position;";

const ENTRA_ONLY: &str = "This tool is available only with Microsoft Entra ID authentication";

/// Identity and control-plane clients used in managed identity mode.
#[derive(Clone)]
pub struct AzureClients {
    pub identity: Arc<dyn TokenProvider>,
    pub management: Arc<dyn ManagementApi>,
}

pub struct Gateway {
    config: Arc<GatewayConfig>,
    settings: DatabaseSettings,
    connections: ConnectionFactory,
    azure: Option<AzureClients>,
}

impl Gateway {
    /// Fails with a configuration error unless `azure` is present exactly
    /// when `config` selects managed identity.
    pub fn new(
        config: GatewayConfig,
        settings: &DatabaseSettings,
        azure: Option<AzureClients>,
    ) -> Result<Self, GatewayError> {
        match (&config.auth, &azure) {
            (AuthMode::Password(password), None) if password.is_empty() => {
                return Err(GatewayError::Configuration(format!("{} is empty", PGPASSWORD)));
            }
            (AuthMode::Password(_), Some(_)) => {
                return Err(GatewayError::Configuration(
                    "Azure clients supplied but password authentication is configured".to_string(),
                ));
            }
            (AuthMode::ManagedIdentity(_), None) => {
                return Err(GatewayError::Configuration(
                    "managed identity mode needs identity and management clients".to_string(),
                ));
            }
            _ => {}
        }

        Ok(Self {
            config: Arc::new(config),
            settings: settings.clone(),
            connections: ConnectionFactory::new(settings)?,
            azure,
        })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn settings(&self) -> &DatabaseSettings {
        &self.settings
    }

    pub fn connections(&self) -> &ConnectionFactory {
        &self.connections
    }

    pub fn is_read_only(&self) -> bool {
        self.settings.read_only
    }

    /// URI of the databases resource, e.g. `flexpg://flex01/databases`.
    pub fn databases_resource_uri(&self, scheme: &str) -> String {
        format!("{}://{}/databases", scheme, self.config.server_short_name())
    }

    pub fn token_provider(&self) -> Option<&dyn TokenProvider> {
        self.azure.as_ref().map(|clients| clients.identity.as_ref())
    }

    async fn connect(&self, dbname: &str) -> Result<PgSession, GatewayError> {
        let credential = credential::resolve(&self.config, self.token_provider()).await?;
        self.connections.open(&self.config, &credential, dbname).await
    }

    async fn run(&self, dbname: &str, statement: &str) -> Result<QueryResult, GatewayError> {
        let session = self.connect(dbname).await?;
        let result = query::execute(session.client(), statement).await;
        session.close().await;
        result
    }

    #[instrument(skip(self))]
    pub async fn get_databases(&self) -> Result<QueryResult, GatewayError> {
        let start = Instant::now();
        match self.run(&self.settings.maintenance_database, LIST_DATABASES).await {
            Ok(result) => {
                info!(
                    "Retrieved {} databases in {:.2}s",
                    result.row_count,
                    start.elapsed().as_secs_f64()
                );
                Ok(result)
            }
            Err(e) => {
                error!(
                    "Error fetching databases after {:.2}s: {}",
                    start.elapsed().as_secs_f64(),
                    e
                );
                Err(e)
            }
        }
    }

    #[instrument(skip(self))]
    pub async fn get_schemas(&self, database: &str) -> Result<QueryResult, GatewayError> {
        let start = Instant::now();
        match self.run(database, LIST_SCHEMAS).await {
            Ok(result) => {
                let mut tables: Vec<&str> = result
                    .rows
                    .iter()
                    .filter_map(|row| row.first().and_then(|v| v.as_str()))
                    .collect();
                tables.dedup();
                info!(
                    "Retrieved schemas for {} tables with {} columns in {:.2}s",
                    tables.len(),
                    result.row_count,
                    start.elapsed().as_secs_f64()
                );
                Ok(result)
            }
            Err(e) => {
                error!(
                    "Error fetching schemas for database '{}' after {:.2}s: {}",
                    database,
                    start.elapsed().as_secs_f64(),
                    e
                );
                Err(e)
            }
        }
    }

    /// Runs a caller-supplied read statement. Anything not starting with
    /// `SELECT` is rejected before a credential is even resolved.
    #[instrument(skip(self, statement))]
    pub async fn query_data(&self, dbname: &str, statement: &str) -> Result<QueryResult, GatewayError> {
        if let Err(e) = guard::ensure_read_only(statement) {
            warn!("Rejected statement on '{}': {}", dbname, e);
            return Err(e);
        }

        let start = Instant::now();
        match self.run(dbname, statement).await {
            Ok(result) => {
                info!(
                    "Query returned {} rows with {} columns in {:.2}s",
                    result.row_count,
                    result.columns.len(),
                    start.elapsed().as_secs_f64()
                );
                Ok(result)
            }
            Err(e) => {
                error!(
                    "Query on database '{}' failed after {:.2}s: {}",
                    dbname,
                    start.elapsed().as_secs_f64(),
                    e
                );
                Err(e)
            }
        }
    }

    /// Executes a mutating statement and commits it. Never retried.
    #[instrument(skip(self, statement))]
    pub async fn exec_and_commit(&self, dbname: &str, statement: &str) -> Result<(), GatewayError> {
        let start = Instant::now();
        let mut session = self.connect(dbname).await?;
        let result = query::execute_and_commit(session.client_mut(), statement).await;
        session.close().await;

        match &result {
            Ok(()) => info!(
                "Transaction committed on '{}' in {:.2}s",
                dbname,
                start.elapsed().as_secs_f64()
            ),
            Err(e) => error!(
                "Transaction on '{}' failed after {:.2}s: {}",
                dbname,
                start.elapsed().as_secs_f64(),
                e
            ),
        }
        result
    }

    fn control_plane(&self) -> Result<(&AzureIdentity, &dyn ManagementApi), GatewayError> {
        match (self.config.azure_identity(), &self.azure) {
            (Some(identity), Some(clients)) => Ok((identity, clients.management.as_ref())),
            _ => Err(GatewayError::NotSupported(ENTRA_ONLY.to_string())),
        }
    }

    #[instrument(skip(self))]
    pub async fn get_server_config(&self) -> Result<ServerInfo, GatewayError> {
        let (identity, management) = self.control_plane().map_err(|e| {
            warn!("get_server_config called without Microsoft Entra ID");
            e
        })?;

        let start = Instant::now();
        let server = management
            .get_server(&identity.resource_group, &identity.server_name)
            .await
            .map_err(|e| {
                error!(
                    "Failed to get server configuration after {:.2}s: {}",
                    start.elapsed().as_secs_f64(),
                    e
                );
                e
            })?;

        info!(
            "Server configuration retrieved in {:.2}s",
            start.elapsed().as_secs_f64()
        );
        Ok(server)
    }

    #[instrument(skip(self))]
    pub async fn get_server_parameter(&self, parameter_name: &str) -> Result<ServerParameter, GatewayError> {
        let (identity, management) = self.control_plane().map_err(|e| {
            warn!("get_server_parameter '{}' called without Microsoft Entra ID", parameter_name);
            e
        })?;

        let start = Instant::now();
        let parameter = management
            .get_configuration(&identity.resource_group, &identity.server_name, parameter_name)
            .await
            .map_err(|e| {
                error!(
                    "Failed to get server parameter '{}' after {:.2}s: {}",
                    parameter_name,
                    start.elapsed().as_secs_f64(),
                    e
                );
                e
            })?;

        info!(
            "Server parameter '{}' retrieved in {:.2}s",
            parameter_name,
            start.elapsed().as_secs_f64()
        );
        Ok(parameter)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Counting fakes for the Azure clients.

    use super::*;
    use crate::azure::identity::AccessToken;
    use crate::config::env::Secret;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    pub struct FakeIdentity {
        pub calls: AtomicUsize,
        pub fail: bool,
    }

    #[async_trait]
    impl TokenProvider for FakeIdentity {
        async fn get_token(&self, _scope: &str) -> Result<AccessToken, GatewayError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(GatewayError::Authentication("identity endpoint unreachable".to_string()));
            }
            Ok(AccessToken {
                token: Secret::new("fake-token"),
                expires_on: None,
            })
        }

        fn name(&self) -> &'static str {
            "FakeIdentity"
        }
    }

    #[derive(Default)]
    pub struct FakeManagement {
        pub calls: AtomicUsize,
        pub fail: bool,
    }

    #[async_trait]
    impl ManagementApi for FakeManagement {
        async fn get_server(&self, _rg: &str, server_name: &str) -> Result<ServerInfo, GatewayError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(GatewayError::ManagementApi("404 (ResourceNotFound)".to_string()));
            }
            Ok(ServerInfo {
                name: Some(server_name.to_string()),
                location: Some("westeurope".to_string()),
                version: Some("16".to_string()),
                sku: Some("Standard_B1ms".to_string()),
                ..ServerInfo::default()
            })
        }

        async fn get_configuration(
            &self,
            _rg: &str,
            _server_name: &str,
            parameter_name: &str,
        ) -> Result<ServerParameter, GatewayError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(GatewayError::ManagementApi("403 (AuthorizationFailed)".to_string()));
            }
            Ok(ServerParameter {
                param: parameter_name.to_string(),
                value: Some("100".to_string()),
            })
        }
    }

    pub fn password_config(host: &str) -> GatewayConfig {
        GatewayConfig {
            host: host.to_string(),
            user: "app".to_string(),
            auth: AuthMode::Password(Secret::new("secret")),
        }
    }

    pub fn identity_config(host: &str) -> GatewayConfig {
        GatewayConfig {
            host: host.to_string(),
            user: "app".to_string(),
            auth: AuthMode::ManagedIdentity(AzureIdentity {
                subscription_id: "sub".to_string(),
                resource_group: "rg".to_string(),
                server_name: crate::config::env::server_short_name(host).to_string(),
            }),
        }
    }

    /// Settings pointing at nothing reachable, with a short timeout.
    pub fn offline_settings() -> DatabaseSettings {
        DatabaseSettings {
            port: 1,
            ssl_mode: crate::config::types::SslMode::Disable,
            connect_timeout: std::time::Duration::from_secs(1),
            ..DatabaseSettings::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::gateway::error::ErrorKind;
    use std::sync::atomic::Ordering;

    fn clients(identity: Arc<FakeIdentity>, management: Arc<FakeManagement>) -> AzureClients {
        AzureClients {
            identity,
            management,
        }
    }

    #[test]
    fn construction_checks_the_credential_pairing() {
        let settings = offline_settings();

        assert!(Gateway::new(password_config("127.0.0.1"), &settings, None).is_ok());

        let err = Gateway::new(identity_config("flex01.example.com"), &settings, None)
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::ConfigurationError);

        let err = Gateway::new(
            password_config("127.0.0.1"),
            &settings,
            Some(clients(Arc::default(), Arc::default())),
        )
        .err()
        .unwrap();
        assert_eq!(err.kind(), ErrorKind::ConfigurationError);
    }

    #[test]
    fn resource_uri_uses_the_server_short_name() {
        let gateway = Gateway::new(
            password_config("flex01.postgres.database.azure.com"),
            &offline_settings(),
            None,
        )
        .unwrap();
        assert_eq!(
            gateway.databases_resource_uri("flexpg"),
            "flexpg://flex01/databases"
        );
    }

    #[tokio::test]
    async fn server_config_without_entra_is_not_supported() {
        let gateway = Gateway::new(password_config("127.0.0.1"), &offline_settings(), None).unwrap();

        let err = gateway.get_server_config().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotSupportedError);

        let err = gateway.get_server_parameter("max_connections").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotSupportedError);
    }

    #[tokio::test]
    async fn server_config_uses_the_identity_coordinates() {
        let management = Arc::new(FakeManagement::default());
        let identity = Arc::new(FakeIdentity::default());
        let gateway = Gateway::new(
            identity_config("flex01.postgres.database.azure.com"),
            &offline_settings(),
            Some(clients(identity.clone(), management.clone())),
        )
        .unwrap();

        let server = gateway.get_server_config().await.unwrap();
        assert_eq!(server.name.as_deref(), Some("flex01"));

        let parameter = gateway.get_server_parameter("max_connections").await.unwrap();
        assert_eq!(parameter.param, "max_connections");

        assert_eq!(management.calls.load(Ordering::SeqCst), 2);
        assert_eq!(identity.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn control_plane_failures_propagate() {
        let management = Arc::new(FakeManagement {
            fail: true,
            ..FakeManagement::default()
        });
        let gateway = Gateway::new(
            identity_config("flex01.postgres.database.azure.com"),
            &offline_settings(),
            Some(clients(Arc::default(), management)),
        )
        .unwrap();

        let err = gateway.get_server_config().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ManagementApiError);
    }

    #[tokio::test]
    async fn guarded_query_never_resolves_a_credential() {
        let identity = Arc::new(FakeIdentity::default());
        let gateway = Gateway::new(
            identity_config("flex01.postgres.database.azure.com"),
            &offline_settings(),
            Some(clients(identity.clone(), Arc::default())),
        )
        .unwrap();

        let err = gateway.query_data("appdb", "DROP TABLE users").await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::ValidationError);
        assert_eq!(identity.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn token_failure_stops_before_connecting() {
        let identity = Arc::new(FakeIdentity {
            fail: true,
            ..FakeIdentity::default()
        });
        let gateway = Gateway::new(
            identity_config("flex01.postgres.database.azure.com"),
            &offline_settings(),
            Some(clients(identity.clone(), Arc::default())),
        )
        .unwrap();

        let err = gateway.query_data("appdb", "SELECT 1").await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::AuthenticationError);
        assert_eq!(identity.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unreachable_server_is_a_connection_error() {
        let gateway = Gateway::new(password_config("127.0.0.1"), &offline_settings(), None).unwrap();

        let err = gateway.get_databases().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConnectionError);

        let err = gateway.exec_and_commit("appdb", "CREATE TABLE t (id int)").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConnectionError);
    }
}
