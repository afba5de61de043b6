//! Testing utilities for carepay applications
//!
//! Alba-style scenarios drive an axum router in-process:
//!
//! ```rust,ignore
//! let response = carepay::testing::get(app, "/api/me/subscription")
//!     .header("authorization", &format!("Bearer {}", token))
//!     .execute()
//!     .await
//!     .assert_ok();
//! ```

mod scenario;

pub use scenario::{Scenario, ScenarioAssert, get, post};
