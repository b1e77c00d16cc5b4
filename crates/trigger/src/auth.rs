//! Credentials for the connection.
//!
//! Auth is best effort: a missing provider, a failing provider, or missing
//! fields all resolve to an (partially) empty [`AuthContext`] and the
//! connection goes ahead.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::AuthError;

/// Access token and client credentials, each optional.
///
/// Fetched once before the first connect attempt and copied into every
/// open-script invocation. Empty strings are treated as absent.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

impl AuthContext {
    pub fn new(
        access_token: Option<String>,
        client_id: Option<String>,
        client_secret: Option<String>,
    ) -> Self {
        Self {
            access_token: non_empty(access_token),
            client_id: non_empty(client_id),
            client_secret: non_empty(client_secret),
        }
    }

    /// Read OAuth2 credential data.
    ///
    /// The token is taken from `oauthTokenData.access_token`, falling back to
    /// a top-level `access_token`/`accessToken`. Client credentials come from
    /// `clientId`/`client_id` and `clientSecret`/`client_secret`.
    pub fn from_oauth2(credentials: &Value) -> Self {
        let text = |value: Option<&Value>| value.and_then(Value::as_str).map(str::to_owned);
        let field = |camel: &str, snake: &str| {
            text(credentials.get(camel)).or_else(|| text(credentials.get(snake)))
        };

        let access_token = text(
            credentials
                .get("oauthTokenData")
                .and_then(|data| data.get("access_token")),
        )
        .or_else(|| field("accessToken", "access_token"));

        Self::new(
            access_token,
            field("clientId", "client_id"),
            field("clientSecret", "client_secret"),
        )
    }

    pub fn access_token(&self) -> Option<&str> {
        self.access_token.as_deref()
    }

    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }

    pub fn client_secret(&self) -> Option<&str> {
        self.client_secret.as_deref()
    }

    pub fn is_empty(&self) -> bool {
        self.access_token.is_none() && self.client_id.is_none() && self.client_secret.is_none()
    }

    /// Ask the provider for credentials, defaulting to empty ones on any failure.
    pub async fn resolve(provider: Option<&dyn AuthProvider>) -> Self {
        let Some(provider) = provider else {
            debug!("no credential provider configured, connecting without credentials");
            return Self::default();
        };

        match provider.credentials().await {
            Ok(Some(context)) => Self::new(
                context.access_token,
                context.client_id,
                context.client_secret,
            ),
            Ok(None) => {
                debug!("credential provider returned nothing, connecting without credentials");
                Self::default()
            }
            Err(err) => {
                warn!("credential provider failed ({err}), connecting without credentials");
                Self::default()
            }
        }
    }
}

// Secrets never reach logs.
impl fmt::Debug for AuthContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mark = |value: &Option<String>| if value.is_some() { "<redacted>" } else { "<none>" };
        f.debug_struct("AuthContext")
            .field("access_token", &mark(&self.access_token))
            .field("client_id", &self.client_id)
            .field("client_secret", &mark(&self.client_secret))
            .finish()
    }
}

/// Supplies credentials for the connection. Implemented by the host.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// `Ok(None)` means "no credentials configured".
    async fn credentials(&self) -> Result<Option<AuthContext>, AuthError>;
}

/// A provider that hands out a fixed set of credentials.
#[derive(Debug, Clone, Default)]
pub struct StaticAuthProvider(pub AuthContext);

#[async_trait]
impl AuthProvider for StaticAuthProvider {
    async fn credentials(&self) -> Result<Option<AuthContext>, AuthError> {
        Ok(Some(self.0.clone()))
    }
}
