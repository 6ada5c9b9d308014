use crate::{AppState, handlers};
use axum::{Router, routing::get};

/// Authenticated Router Module
///
/// Member pages. Anonymous visitors are redirected to `/login` with the visited path
/// remembered.
pub fn authenticated_routes() -> Router<AppState> {
    Router::<AppState>::new()
        // GET /profile
        .route("/profile", get(handlers::get_profile))
}
