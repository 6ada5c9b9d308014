use crate::{AppState, handlers};
use axum::{
    Router,
    routing::{get, post},
};

/// Public Router Module
///
/// Read-only content access plus the sign-in handshake. Listings here never include
/// scheduled quotes.
pub fn public_routes() -> Router<AppState> {
    Router::new()
        // GET /health
        .route("/health", get(|| async { "ok" }))
        // GET /quotes?search=...&author_id=...&time_range=...&page=...
        // Filtered, paginated listing with the result summary.
        .route("/quotes", get(handlers::get_quotes))
        // GET /quote/{id}
        .route("/quote/{id}", get(handlers::get_quote))
        // GET /authors, /categories
        // Options for the facet selectors.
        .route("/authors", get(handlers::get_authors))
        .route("/categories", get(handlers::get_categories))
        // GET /session
        // The caller's session as the gate sees it; anonymous when no token is sent.
        .route("/session", get(handlers::get_session))
        // POST /login
        // Exchanges a fresh access token for the page to continue to.
        .route("/login", post(handlers::login))
}
