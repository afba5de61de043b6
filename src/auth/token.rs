use axum::http::request::Parts;

use crate::error::CarepayError;

/// Extracts the bearer token from request headers
pub struct TokenExtractor;

impl TokenExtractor {
    /// Extract token from the Authorization header
    pub fn from_header(parts: &Parts) -> Result<String, CarepayError> {
        let auth_header = parts
            .headers
            .get("authorization")
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| CarepayError::unauthorized("Missing authorization header"))?;

        let token = auth_header.strip_prefix("Bearer ").ok_or_else(|| {
            CarepayError::unauthorized("Invalid authorization header format. Expected: Bearer <token>")
        })?;

        if token.trim().is_empty() {
            return Err(CarepayError::unauthorized("Empty bearer token"));
        }

        Ok(token.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    fn parts(header: Option<&str>) -> Parts {
        let mut builder = Request::builder();
        if let Some(value) = header {
            builder = builder.header("authorization", value);
        }
        builder.body(()).unwrap().into_parts().0
    }

    #[test]
    fn extracts_bearer_token() {
        assert_eq!(
            TokenExtractor::from_header(&parts(Some("Bearer tok_123"))).unwrap(),
            "tok_123"
        );
    }

    #[test]
    fn rejects_missing_or_malformed_headers() {
        assert!(matches!(
            TokenExtractor::from_header(&parts(None)),
            Err(CarepayError::Unauthorized(_))
        ));
        assert!(TokenExtractor::from_header(&parts(Some("Basic dXNlcjpwYXNz"))).is_err());
        assert!(TokenExtractor::from_header(&parts(Some("Bearer   "))).is_err());
    }
}
