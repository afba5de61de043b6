//! Caller identity for the per-user routes.
//!
//! Handlers take [`AuthUser`] to require a bearer token or [`OptionalAuth`]
//! when anonymous visitors are allowed. Tokens are checked by the
//! [`AuthProvider`] held in `AppContext`; [`JwtAuthProvider`] verifies
//! HS256 tokens whose `sub` is the user id.

pub mod extractors;
pub mod jwt;
pub mod provider;
pub mod token;

pub use extractors::{AuthUser, OptionalAuth};
pub use jwt::{AuthClaims, AuthConfig, JwtAuthProvider};
pub use provider::{AuthProvider, AuthenticatedUser};
pub use token::TokenExtractor;
