use axum::{extract::FromRequestParts, http::request::Parts};

use super::provider::AuthenticatedUser;
use super::token::TokenExtractor;
use crate::app::AppContext;
use crate::error::CarepayError;

/// Axum extractor for authenticated users
///
/// Rejects with 401 when the bearer token is missing or invalid, and with
/// 503 when no auth provider is configured.
///
/// ```rust,ignore
/// async fn my_payments(
///     State(ctx): State<AppContext>,
///     AuthUser(user): AuthUser,
/// ) -> JsonResponse<Vec<PaymentAttempt>> {
///     Ok(Json(ctx.payments()?.attempts_for_user(&user.user_id).await?))
/// }
/// ```
#[derive(Debug, Clone)]
pub struct AuthUser(pub AuthenticatedUser);

impl FromRequestParts<AppContext> for AuthUser {
    type Rejection = CarepayError;

    async fn from_request_parts(
        parts: &mut Parts,
        ctx: &AppContext,
    ) -> Result<Self, Self::Rejection> {
        let provider = ctx.auth()?;
        let token = TokenExtractor::from_header(parts)?;
        let user = provider.authenticate(&token).await?;
        Ok(AuthUser(user))
    }
}

/// Axum extractor for optional authentication
///
/// `Some(user)` for a valid bearer token, `None` otherwise. Never rejects.
#[derive(Debug, Clone)]
pub struct OptionalAuth(pub Option<AuthenticatedUser>);

impl FromRequestParts<AppContext> for OptionalAuth {
    type Rejection = CarepayError;

    async fn from_request_parts(
        parts: &mut Parts,
        ctx: &AppContext,
    ) -> Result<Self, Self::Rejection> {
        let Ok(provider) = ctx.auth() else {
            return Ok(OptionalAuth(None));
        };
        let Ok(token) = TokenExtractor::from_header(parts) else {
            return Ok(OptionalAuth(None));
        };
        Ok(OptionalAuth(provider.authenticate(&token).await.ok()))
    }
}
