//! Gateway configuration sourced from the libpq-style environment variables.

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use std::fmt;

use crate::gateway::error::GatewayError;

pub const PGHOST: &str = "PGHOST";
pub const PGUSER: &str = "PGUSER";
pub const PGPASSWORD: &str = "PGPASSWORD";
pub const AZURE_USE_AAD: &str = "AZURE_USE_AAD";
pub const AZURE_SUBSCRIPTION_ID: &str = "AZURE_SUBSCRIPTION_ID";
pub const AZURE_RESOURCE_GROUP: &str = "AZURE_RESOURCE_GROUP";

/// Characters left as-is in the userinfo part of a connection URI.
pub const USERINFO: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

pub fn percent_encode(value: &str) -> String {
    utf8_percent_encode(value, USERINFO).to_string()
}

/// A string that never shows up in `Debug` or `Display` output.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Secret(****)")
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "****")
    }
}

/// Cloud coordinates of the server, needed for the management API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AzureIdentity {
    pub subscription_id: String,
    pub resource_group: String,
    pub server_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthMode {
    Password(Secret),
    ManagedIdentity(AzureIdentity),
}

/// Immutable configuration built once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayConfig {
    pub host: String,
    /// Percent-encoded user name.
    pub user: String,
    pub auth: AuthMode,
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self, GatewayError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, GatewayError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let require = |name: &str| -> Result<String, GatewayError> {
            lookup(name)
                .filter(|value| !value.is_empty())
                .ok_or_else(|| {
                    GatewayError::Configuration(format!("Environment variable {} not found", name))
                })
        };

        let host = require(PGHOST)?;
        let user = percent_encode(&require(PGUSER)?);

        let auth = if lookup(AZURE_USE_AAD).as_deref() == Some("True") {
            AuthMode::ManagedIdentity(AzureIdentity {
                subscription_id: require(AZURE_SUBSCRIPTION_ID)?,
                resource_group: require(AZURE_RESOURCE_GROUP)?,
                server_name: server_short_name(&host).to_string(),
            })
        } else {
            AuthMode::Password(Secret::new(require(PGPASSWORD)?))
        };

        Ok(Self { host, user, auth })
    }

    pub fn server_short_name(&self) -> &str {
        server_short_name(&self.host)
    }

    pub fn uses_managed_identity(&self) -> bool {
        matches!(self.auth, AuthMode::ManagedIdentity(_))
    }

    pub fn azure_identity(&self) -> Option<&AzureIdentity> {
        match &self.auth {
            AuthMode::ManagedIdentity(identity) => Some(identity),
            AuthMode::Password(_) => None,
        }
    }
}

/// First DNS label of the host.
pub fn server_short_name(host: &str) -> &str {
    host.split('.').next().unwrap_or(host)
}
