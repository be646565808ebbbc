//! The credential source contract.

use async_trait::async_trait;

use crate::error::ApiError;

/// Supplies the bearer token used for both the WebSocket `auth` frame and
/// REST calls.
///
/// The token's actual source (a static string, a keyring, an OAuth refresh
/// flow) is a concern of the host application, not this crate.
#[async_trait]
pub trait AuthTokenProvider: Send + Sync {
    async fn fetch(&self) -> Result<String, ApiError>;
}

/// A provider that always returns the same token, for the common case of a
/// long-lived access token.
pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

#[async_trait]
impl AuthTokenProvider for StaticToken {
    async fn fetch(&self) -> Result<String, ApiError> {
        Ok(self.0.clone())
    }
}
