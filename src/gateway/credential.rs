use crate::azure::identity::{AccessToken, TokenProvider, DATABASE_SCOPE};
use crate::config::env::{AuthMode, GatewayConfig, Secret, PGPASSWORD};
use crate::gateway::error::GatewayError;

/// Secret presented to the database for one connection.
#[derive(Debug, Clone)]
pub enum Credential {
    Password(Secret),
    Token(AccessToken),
}

impl Credential {
    pub fn secret(&self) -> &Secret {
        match self {
            Credential::Password(password) => password,
            Credential::Token(token) => &token.token,
        }
    }
}

/// Resolves the credential for a new connection. In managed identity mode
/// every call is a round trip to the identity provider.
pub async fn resolve(
    config: &GatewayConfig,
    identity: Option<&dyn TokenProvider>,
) -> Result<Credential, GatewayError> {
    match &config.auth {
        AuthMode::Password(password) => {
            if password.is_empty() {
                return Err(GatewayError::Configuration(format!("{} is empty", PGPASSWORD)));
            }
            Ok(Credential::Password(password.clone()))
        }
        AuthMode::ManagedIdentity(_) => {
            let provider = identity.ok_or_else(|| {
                GatewayError::Configuration(
                    "managed identity mode needs a token provider".to_string(),
                )
            })?;

            let token = provider
                .get_token(DATABASE_SCOPE)
                .await
                .map_err(|e| match e {
                    GatewayError::Authentication(_) => e,
                    other => GatewayError::Authentication(other.to_string()),
                })?;

            if token.token.is_empty() {
                return Err(GatewayError::Authentication(
                    "identity provider returned an empty token".to_string(),
                ));
            }
            Ok(Credential::Token(token))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::env::AzureIdentity;
    use crate::gateway::error::ErrorKind;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct RecordingProvider {
        scopes: Mutex<Vec<String>>,
        token: Option<&'static str>,
    }

    #[async_trait]
    impl TokenProvider for RecordingProvider {
        async fn get_token(&self, scope: &str) -> Result<AccessToken, GatewayError> {
            self.scopes.lock().unwrap().push(scope.to_string());
            match self.token {
                Some(token) => Ok(AccessToken {
                    token: Secret::new(token),
                    expires_on: None,
                }),
                None => Err(GatewayError::Authentication("provider unreachable".to_string())),
            }
        }

        fn name(&self) -> &'static str {
            "Recording"
        }
    }

    fn password_config(password: &str) -> GatewayConfig {
        GatewayConfig {
            host: "db.example.com".to_string(),
            user: "app".to_string(),
            auth: AuthMode::Password(Secret::new(password)),
        }
    }

    fn identity_config() -> GatewayConfig {
        GatewayConfig {
            host: "flex01.postgres.database.azure.com".to_string(),
            user: "app".to_string(),
            auth: AuthMode::ManagedIdentity(AzureIdentity {
                subscription_id: "sub".to_string(),
                resource_group: "rg".to_string(),
                server_name: "flex01".to_string(),
            }),
        }
    }

    #[tokio::test]
    async fn password_is_returned_verbatim() {
        for password in ["secret", "with spaces", "p@ss:w/rd%"] {
            let credential = resolve(&password_config(password), None).await.unwrap();
            assert_eq!(credential.secret().expose(), password);
        }
    }

    #[tokio::test]
    async fn empty_password_is_a_configuration_error() {
        let err = resolve(&password_config(""), None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConfigurationError);
    }

    #[tokio::test]
    async fn token_is_requested_for_the_database_scope() {
        let provider = RecordingProvider {
            scopes: Mutex::new(Vec::new()),
            token: Some("eyJ0eXAi.token"),
        };

        let credential = resolve(&identity_config(), Some(&provider)).await.unwrap();

        assert_eq!(credential.secret().expose(), "eyJ0eXAi.token");
        assert_eq!(*provider.scopes.lock().unwrap(), vec![DATABASE_SCOPE.to_string()]);
    }

    #[tokio::test]
    async fn every_resolution_fetches_a_fresh_token() {
        let provider = RecordingProvider {
            scopes: Mutex::new(Vec::new()),
            token: Some("t"),
        };
        let config = identity_config();

        resolve(&config, Some(&provider)).await.unwrap();
        resolve(&config, Some(&provider)).await.unwrap();

        assert_eq!(provider.scopes.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn unreachable_provider_is_an_authentication_error() {
        let provider = RecordingProvider {
            scopes: Mutex::new(Vec::new()),
            token: None,
        };

        let err = resolve(&identity_config(), Some(&provider)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AuthenticationError);
    }

    #[tokio::test]
    async fn empty_token_is_rejected() {
        let provider = RecordingProvider {
            scopes: Mutex::new(Vec::new()),
            token: Some(""),
        };

        let err = resolve(&identity_config(), Some(&provider)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AuthenticationError);
    }
}
