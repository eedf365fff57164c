use anyhow::{Context, Result};
use clap::{Arg, Command};
use tracing::{error, info};
use std::path::PathBuf;
use std::sync::Arc;

use azure_postgres_mcp::azure::{ArmClient, DefaultAzureCredential, ManagementApi, TokenProvider};
use azure_postgres_mcp::config::env::GatewayConfig;
use azure_postgres_mcp::config::loader::load_config;
use azure_postgres_mcp::config::types::{AzureSettings, TransportType};
use azure_postgres_mcp::diagnostics;
use azure_postgres_mcp::gateway::{AzureClients, Gateway};
use azure_postgres_mcp::logging::{self, RequestLog};
use azure_postgres_mcp::server::McpServer;
use azure_postgres_mcp::transport::stdio::StdioTransport;

fn cli() -> Command<'static> {
    Command::new("azure-postgres-mcp")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Model Context Protocol server for Azure Database for PostgreSQL flexible servers")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Path to configuration file")
                .takes_value(true),
        )
        .arg(
            Arg::new("read-write")
                .long("read-write")
                .help("Register the tools that modify data"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Log at debug level"),
        )
        .subcommand(
            Command::new("check-connection")
                .about("Check DNS, TCP and database connectivity with the current environment"),
        )
}

fn azure_clients(config: &GatewayConfig, settings: &AzureSettings) -> Result<Option<AzureClients>> {
    let Some(identity) = config.azure_identity() else {
        return Ok(None);
    };

    let credential = DefaultAzureCredential::from_env(settings)?;
    info!("Microsoft Entra ID credential chain: {}", credential.source_names().join(", "));
    let credential: Arc<dyn TokenProvider> = Arc::new(credential);
    let management: Arc<dyn ManagementApi> = Arc::new(ArmClient::new(
        settings,
        &identity.subscription_id,
        credential.clone(),
    )?);

    Ok(Some(AzureClients {
        identity: credential,
        management,
    }))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let matches = cli().get_matches();

    let config_path = matches.value_of("config").map(PathBuf::from);
    let mut config = load_config(config_path).context("Failed to load configuration")?;
    if matches.is_present("read-write") {
        config.database.read_only = false;
    }
    if matches.is_present("verbose") {
        config.logging.level = "debug".to_string();
    }

    logging::init(&config.logging)?;

    let gateway_config = match GatewayConfig::from_env() {
        Ok(gateway_config) => gateway_config,
        Err(e) => {
            error!("{}", e);
            return Err(e).context("Invalid database environment");
        }
    };
    let azure = azure_clients(&gateway_config, &config.azure)?;

    if matches.subcommand_matches("check-connection").is_some() {
        let gateway = Gateway::new(gateway_config, &config.database, azure)?;
        let ok = diagnostics::check_connection(
            gateway.config(),
            gateway.connections(),
            &config.database.maintenance_database,
            config.database.port,
            gateway.token_provider(),
        )
        .await;
        if ok {
            info!("Connection check passed");
            return Ok(());
        }
        anyhow::bail!("Connection check failed");
    }

    info!(
        "Starting {} {} for {} ({}, {})",
        config.server.name,
        config.server.version,
        gateway_config.host,
        if gateway_config.uses_managed_identity() {
            "Microsoft Entra ID"
        } else {
            "password"
        },
        if config.database.read_only {
            "read-only"
        } else {
            "read-write"
        }
    );

    let gateway = Arc::new(Gateway::new(gateway_config, &config.database, azure)?);
    let request_log = RequestLog::new(&config.logging).context("Failed to open request log")?;
    let server = McpServer::new(config.clone(), gateway, request_log)?;

    match config.server.transport {
        TransportType::Stdio => {
            info!("Using stdio transport");
            let mut transport = StdioTransport::new(server);
            transport.run().await?;
        }
    }

    info!("Server shutting down");
    Ok(())
}
