use crate::{AppState, handlers};
use axum::{Router, routing::get};

/// Admin Router Module
///
/// Nested under `/admin`. Every visitor without a known admin role, anonymous ones
/// included, is sent home without learning the area exists.
pub fn admin_routes() -> Router<AppState> {
    Router::new()
        // GET /admin
        // Entry point after an admin signs in.
        .route("/", get(handlers::get_dashboard))
        // GET /admin/dashboard
        .route("/dashboard", get(handlers::get_dashboard))
        // GET /admin/quotes
        // Same listing as /quotes, scheduled quotes included for previewing.
        .route("/quotes", get(handlers::get_admin_quotes))
}
