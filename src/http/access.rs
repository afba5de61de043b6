use axum::{
    Json, Router,
    extract::{Query, State},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};

use super::response::JsonResponse;
use super::routes::RouteModule;
use crate::access::{RouteDecision, UserAccessFacts};
use crate::app::AppContext;
use crate::auth::OptionalAuth;

/// Navigation decisions from the access gate.
#[derive(Debug, Clone, Copy, Default)]
pub struct AccessRoutes;

impl RouteModule for AccessRoutes {
    fn routes(&self) -> Router<AppContext> {
        Router::new()
            .route("/api/access/decision", post(decide_for_facts))
            .route("/api/me/access", get(decide_for_user))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessDecisionRequest {
    #[serde(default)]
    pub facts: UserAccessFacts,
    pub current_path: String,
}

#[derive(Debug, Deserialize)]
struct CurrentPath {
    #[serde(default = "root_path")]
    path: String,
}

fn root_path() -> String {
    "/".to_string()
}

#[derive(Debug, Serialize)]
struct UserDecision {
    facts: UserAccessFacts,
    #[serde(flatten)]
    decision: RouteDecision,
}

/// Decide for caller-supplied facts. No store is read.
async fn decide_for_facts(
    State(ctx): State<AppContext>,
    Json(request): Json<AccessDecisionRequest>,
) -> Json<RouteDecision> {
    Json(ctx.access_gate.decide(&request.facts, &request.current_path))
}

/// Read the caller's facts, then decide for `?path=`.
///
/// Without a valid bearer token the caller is treated as signed out.
async fn decide_for_user(
    State(ctx): State<AppContext>,
    OptionalAuth(user): OptionalAuth,
    Query(current): Query<CurrentPath>,
) -> JsonResponse<UserDecision> {
    let user_id = user.map(|u| u.user_id);
    let facts = ctx.access_facts()?.resolve(user_id.as_deref()).await;
    let decision = ctx.access_gate.decide(&facts, &current.path);

    tracing::debug!(
        target: "carepay::access",
        user_id = user_id.as_deref().unwrap_or("anonymous"),
        path = %current.path,
        destination = ?decision.destination,
        "Access decision"
    );

    Ok(Json(UserDecision { facts, decision }))
}
