//! HTTP surface.
//!
//! Route modules for payments, gateway callbacks and the access gate, plus
//! the RouteModule trait they are composed with.

mod access;
mod payments;
pub mod response;
pub mod routes;

pub use access::{AccessDecisionRequest, AccessRoutes};
pub use payments::{PaymentRoutes, PaymentStatusResponse};
pub use response::{CreatedResponse, JsonResponse};
pub use routes::RouteModule;
