//! `check-connection`: step-by-step connectivity checks with hints for the
//! usual Azure misconfigurations.

use percent_encoding::percent_decode_str;
use regex::Regex;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::net::{lookup_host, TcpStream};
use tracing::{error, info, warn};

use crate::azure::identity::TokenProvider;
use crate::config::env::{
    server_short_name, GatewayConfig, AZURE_USE_AAD, PGHOST, PGPASSWORD, PGUSER,
};
use crate::config::types::SslMode;
use crate::gateway::connection::ConnectionFactory;
use crate::gateway::credential;
use crate::gateway::query;

const VERSION_QUERY: &str = "SELECT current_database(), version();";
const NETWORK_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// Environment as seen by the gateway, with the password reduced to its length.
pub fn describe_environment<F>(lookup: F) -> Vec<(&'static str, String)>
where
    F: Fn(&str) -> Option<String>,
{
    [PGHOST, PGUSER, PGPASSWORD, AZURE_USE_AAD]
        .into_iter()
        .map(|name| {
            let value = match lookup(name).filter(|v| !v.is_empty()) {
                None => "NOT SET".to_string(),
                Some(password) if name == PGPASSWORD => {
                    let len = password.chars().count();
                    format!("{} (length: {})", "*".repeat(len), len)
                }
                Some(value) => value,
            };
            (name, value)
        })
        .collect()
}

fn secret_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [r"(?i)(password\s*=\s*)\S+", r"(postgres(?:ql)?://[^:/@\s]+:)[^@\s]+(@)"]
            .iter()
            .filter_map(|pattern| Regex::new(pattern).ok())
            .collect()
    })
}

/// Masks `password=` pairs and URI userinfo secrets in free text.
pub fn mask_secrets(text: &str) -> String {
    secret_patterns()
        .iter()
        .fold(text.to_string(), |masked, pattern| {
            pattern.replace_all(&masked, "${1}****${2}").into_owned()
        })
}

/// Suggestion for a failed connection attempt, if the error is a known one.
pub fn hint_for(error: &str, host: &str, user: &str) -> Option<String> {
    let lower = error.to_lowercase();
    if lower.contains("password authentication failed") {
        Some(format!(
            "Try username with server suffix: {}@{}",
            user,
            server_short_name(host)
        ))
    } else if lower.contains("ssl") || lower.contains("tls") {
        Some("SSL/TLS issue: Azure requires SSL connections".to_string())
    } else if lower.contains("timeout") || lower.contains("timed out") || lower.contains("network") {
        Some("Network issue: check firewall rules and server status".to_string())
    } else {
        None
    }
}

async fn check_network(host: &str, port: u16) -> bool {
    let addrs: Vec<_> = match lookup_host((host, port)).await {
        Ok(addrs) => addrs.collect(),
        Err(e) => {
            error!("DNS resolution failed for {}: {}", host, e);
            return false;
        }
    };
    let Some(addr) = addrs.first() else {
        error!("DNS resolution returned no addresses for {}", host);
        return false;
    };
    info!("DNS resolved: {} -> {}", host, addr.ip());

    match tokio::time::timeout(NETWORK_CHECK_TIMEOUT, TcpStream::connect(addr)).await {
        Ok(Ok(_)) => {
            info!("Port {} is reachable on {}", port, host);
            true
        }
        Ok(Err(e)) => {
            error!("Port {} is NOT reachable on {}: {}", port, host, e);
            false
        }
        Err(_) => {
            error!("Port {} on {} did not answer within {:?}", port, host, NETWORK_CHECK_TIMEOUT);
            false
        }
    }
}

/// Runs every check and reports whether a connection could be established.
pub async fn check_connection(
    config: &GatewayConfig,
    connections: &ConnectionFactory,
    maintenance_database: &str,
    port: u16,
    identity: Option<&dyn TokenProvider>,
) -> bool {
    info!("Environment:");
    for (name, value) in describe_environment(|name| std::env::var(name).ok()) {
        info!("  {}: {}", name, value);
    }

    let user = percent_decode_str(&config.user).decode_utf8_lossy().into_owned();
    if config.host.ends_with(".postgres.database.azure.com") && !user.contains('@') {
        info!(
            "Azure host detected; if password authentication fails, try {}@{}",
            user,
            config.server_short_name()
        );
    }

    if !check_network(&config.host, port).await {
        warn!("Network issue: check firewall rules and server status");
    }

    let credential = match credential::resolve(config, identity).await {
        Ok(credential) => credential,
        Err(e) => {
            error!("Could not resolve a credential: {}", e);
            return false;
        }
    };

    for (attempt, ssl_mode) in [("SSL required", SslMode::Require), ("SSL preferred", SslMode::Prefer)] {
        info!("Trying: {}", attempt);
        let session = match connections
            .open_with(config, &credential, maintenance_database, ssl_mode)
            .await
        {
            Ok(session) => session,
            Err(e) => {
                let message = mask_secrets(&e.to_string());
                error!("Connection failed: {}", message);
                if let Some(hint) = hint_for(&message, &config.host, &user) {
                    warn!("{}", hint);
                }
                continue;
            }
        };

        info!("Database connection successful");
        let outcome = query::execute(session.client(), VERSION_QUERY).await;
        session.close().await;
        match outcome {
            Ok(result) => {
                if let Some(row) = result.rows.first() {
                    let text = |idx: usize| {
                        row.get(idx)
                            .and_then(|v| v.as_str())
                            .unwrap_or_default()
                            .to_string()
                    };
                    info!("Connected to database: {}", text(0));
                    info!("Server version: {}", text(1));
                }
                return true;
            }
            Err(e) => error!("Version query failed: {}", e),
        }
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn environment_masks_the_password() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("PGHOST", "flex01.postgres.database.azure.com"),
            ("PGPASSWORD", "hunter22"),
        ]);
        let described = describe_environment(|name| env.get(name).map(|v| v.to_string()));

        assert_eq!(described[0], ("PGHOST", "flex01.postgres.database.azure.com".to_string()));
        assert_eq!(described[1], ("PGUSER", "NOT SET".to_string()));
        assert_eq!(described[2], ("PGPASSWORD", "******** (length: 8)".to_string()));
        assert_eq!(described[3], ("AZURE_USE_AAD", "NOT SET".to_string()));
    }

    #[test]
    fn secrets_are_masked_in_messages() {
        assert_eq!(
            mask_secrets("host=db user=app password=s3cr3t sslmode=require"),
            "host=db user=app password=**** sslmode=require"
        );
        assert_eq!(
            mask_secrets("postgresql://app:s3cr3t@db:5432/postgres"),
            "postgresql://app:****@db:5432/postgres"
        );
        assert_eq!(mask_secrets("nothing to hide"), "nothing to hide");
    }

    #[test]
    fn hints() {
        let host = "flex01.postgres.database.azure.com";
        assert_eq!(
            hint_for("FATAL: password authentication failed for user \"app\"", host, "app").as_deref(),
            Some("Try username with server suffix: app@flex01")
        );
        assert!(hint_for("server does not support SSL", host, "app")
            .unwrap()
            .contains("Azure requires SSL"));
        assert!(hint_for("timed out after 15s", host, "app")
            .unwrap()
            .contains("firewall"));
        assert_eq!(hint_for("database \"x\" does not exist", host, "app"), None);
    }
}
