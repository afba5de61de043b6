use axum::Router;
use crate::app::AppContext;

/// Trait for composable route modules
///
/// Implement this trait to group related routes. Each module is merged (or
/// nested under its prefix) into the application router.
///
/// # Example
///
/// ```ignore
/// struct ReportsModule;
///
/// impl RouteModule for ReportsModule {
///     fn routes(&self) -> Router<AppContext> {
///         Router::new().route("/reports/{id}", get(get_report))
///     }
/// }
/// ```
pub trait RouteModule {
    /// Returns a router with all routes for this module
    ///
    /// The router should NOT have state applied; the App applies
    /// `AppContext` when it builds the final router.
    fn routes(&self) -> Router<AppContext>
    where
        Self: Sized;

    /// Optional: specify a path prefix for all routes in this module
    fn prefix(&self) -> Option<&str> {
        None
    }

    /// Registers this module's routes into the application router
    fn register(self, router: Router<AppContext>) -> Router<AppContext>
    where
        Self: Sized,
    {
        let routes = self.routes();

        if let Some(prefix) = self.prefix() {
            router.nest(prefix, routes)
        } else {
            router.merge(routes)
        }
    }
}
