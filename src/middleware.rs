use tower_http::request_id::{MakeRequestId, RequestId};
use tower_http::timeout::TimeoutLayer;
use uuid::Uuid;

use crate::config::ServerConfig;

/// Stamps every request with a UUID `x-request-id`.
#[derive(Clone, Default)]
pub struct MakeRequestUuid;

impl MakeRequestId for MakeRequestUuid {
    fn make_request_id<B>(&mut self, _request: &axum::http::Request<B>) -> Option<RequestId> {
        let request_id = Uuid::new_v4().to_string().parse().ok()?;
        Some(RequestId::new(request_id))
    }
}

/// Whole-request timeout, or `None` when `request_timeout_seconds` is 0.
pub fn build_timeout_layer(config: &ServerConfig) -> Option<TimeoutLayer> {
    config.request_timeout().map(TimeoutLayer::new)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_ids_are_unique_uuids() {
        let request = axum::http::Request::new(());
        let mut make = MakeRequestUuid;
        let a = make.make_request_id(&request).unwrap();
        let b = make.make_request_id(&request).unwrap();
        let a = a.header_value().to_str().unwrap().to_string();
        assert!(Uuid::parse_str(&a).is_ok());
        assert_ne!(a, b.header_value().to_str().unwrap());
    }

    #[test]
    fn timeout_follows_server_config() {
        let mut config = ServerConfig::default();
        assert!(build_timeout_layer(&config).is_some());
        config.request_timeout_seconds = 0;
        assert!(build_timeout_layer(&config).is_none());
    }
}
