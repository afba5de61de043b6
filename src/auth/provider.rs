use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// The caller behind a verified token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthenticatedUser {
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

/// Turns a bearer token into an [`AuthenticatedUser`].
///
/// Implement this to plug in an external identity provider; the bundled
/// [`JwtAuthProvider`](super::JwtAuthProvider) covers shared-secret JWTs.
/// Failures should be `CarepayError::Unauthorized`.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn authenticate(&self, token: &str) -> Result<AuthenticatedUser>;
}
