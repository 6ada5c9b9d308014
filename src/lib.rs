use axum::{
    Router,
    extract::{FromRef, OriginalUri, Request, State},
    http::{HeaderName, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Redirect, Response},
};
use std::sync::Arc;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::{DefaultOnResponse, TraceLayer},
};
use tracing::{Level, Span};

// --- Module Structure ---

// Content querying: facets, cache keys, the store and the page engine.
pub mod filters;
pub mod query;
pub mod repository;
pub mod summary;

// Visitor session and route protection.
pub mod auth;
pub mod gate;
pub mod session;

pub mod config;
pub mod error;
pub mod handlers;
pub mod models;

// Module for routing segregation (Public, Authenticated, Admin).
pub mod routes;
use routes::{admin, authenticated, public};

use auth::{AuthState, RequestSession, bearer_token, resolve_token};
use gate::{HOME_PATH, RouteGuardDecision, login_location};

// --- Public Re-exports ---

pub use auth::SupabaseAuth;
pub use config::AppConfig;
pub use query::ContentQueryEngine;
pub use repository::{ContentStoreState, InMemoryContentStore, PostgresContentStore};

/// ApiDoc
///
/// OpenAPI description of every HTTP endpoint, served at `/api-docs/openapi.json`.
#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::get_quotes, handlers::get_quote, handlers::get_authors,
        handlers::get_categories, handlers::get_session, handlers::login,
        handlers::get_profile, handlers::get_admin_quotes, handlers::get_dashboard
    ),
    components(
        schemas(
            models::ContentItem, models::PageResult, models::LookupOption, models::Role,
            models::LoginRequest, models::LoginResponse, models::QuoteListResponse,
            models::SessionView, models::DashboardStats, gate::Capability,
        )
    ),
    tags(
        (name = "quote-portal", description = "Quote Portal API")
    )
)]
struct ApiDoc;

/// AppState
///
/// Services shared by every request. The query engine is shared as well, so all
/// visitors benefit from one page cache and one in-flight table.
#[derive(Clone)]
pub struct AppState {
    pub store: ContentStoreState,
    pub engine: Arc<ContentQueryEngine>,
    pub auth: AuthState,
    pub config: AppConfig,
}

impl AppState {
    /// Builds the state around `store`, with a query engine configured from `config`.
    pub fn new(store: ContentStoreState, auth: AuthState, config: AppConfig) -> Self {
        let engine = Arc::new(ContentQueryEngine::new(store.clone(), config.cache));
        Self {
            store,
            engine,
            auth,
            config,
        }
    }
}

// --- Axum FromRef Extractor Implementations ---

impl FromRef<AppState> for ContentStoreState {
    fn from_ref(app_state: &AppState) -> ContentStoreState {
        app_state.store.clone()
    }
}

impl FromRef<AppState> for Arc<ContentQueryEngine> {
    fn from_ref(app_state: &AppState) -> Arc<ContentQueryEngine> {
        app_state.engine.clone()
    }
}

impl FromRef<AppState> for AuthState {
    fn from_ref(app_state: &AppState) -> AuthState {
        app_state.auth.clone()
    }
}

impl FromRef<AppState> for AppConfig {
    fn from_ref(app_state: &AppState) -> AppConfig {
        app_state.config.clone()
    }
}

/// route_gate
///
/// Middleware over the whole router. Looks up the capability the visited path requires
/// in the route table, so protected paths are refused the same way whether or not a
/// handler is mounted there. Public paths pass through without resolving the caller.
/// On `Allow` the resolved session is stored in the request so handlers do not resolve
/// it again.
async fn route_gate(State(state): State<AppState>, request: Request, next: Next) -> Response {
    // Nested routers see a stripped URI; decide on what the visitor asked for.
    let visited = request
        .extensions()
        .get::<OriginalUri>()
        .map(|uri| uri.0.clone())
        .unwrap_or_else(|| request.uri().clone());
    let visited = visited
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| visited.path().to_string());

    let Some(capability) = state.config.routes.required_capability(&visited) else {
        return next.run(request).await;
    };

    let (mut parts, body) = request.into_parts();
    let session = resolve_token(state.auth.as_ref(), bearer_token(&parts)).await;

    match gate::decide(&session, capability, &visited) {
        RouteGuardDecision::Allow => {
            parts.extensions.insert(RequestSession(session));
            next.run(Request::from_parts(parts, body)).await
        }
        RouteGuardDecision::RedirectToLogin { return_path } => {
            tracing::debug!(path = %visited, "anonymous visitor sent to sign-in");
            Redirect::to(&login_location(&return_path)).into_response()
        }
        RouteGuardDecision::RedirectToHome => {
            tracing::warn!(path = %visited, user_id = ?session.user_id(), "admin area refused");
            Redirect::to(HOME_PATH).into_response()
        }
        // resolve_token always settles the session; this only guards the match.
        RouteGuardDecision::Pending => StatusCode::SERVICE_UNAVAILABLE.into_response(),
    }
}

/// create_router
///
/// Assembles the routing structure, puts the gate in front of every path (unmatched
/// ones included) and wraps everything in the observability layers.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_methods(Any)
        .allow_origin(Any)
        .allow_headers(Any);

    let x_request_id = HeaderName::from_static("x-request-id");

    let base_router = Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .merge(public::public_routes())
        .merge(authenticated::authenticated_routes())
        .nest("/admin", admin::admin_routes())
        // Registered before the gate so unmatched paths are gated too.
        .fallback(|| async { StatusCode::NOT_FOUND })
        .layer(middleware::from_fn_with_state(state.clone(), route_gate))
        .with_state(state);

    base_router
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::new(x_request_id.clone(), MakeRequestUuid))
                .layer(
                    TraceLayer::new_for_http()
                        .make_span_with(trace_span_logger)
                        .on_response(
                            DefaultOnResponse::new()
                                .level(Level::INFO)
                                .latency_unit(tower_http::LatencyUnit::Millis),
                        ),
                )
                .layer(PropagateRequestIdLayer::new(x_request_id)),
        )
        .layer(cors)
}

/// trace_span_logger
///
/// Span for one HTTP request, correlated by its `x-request-id`.
fn trace_span_logger(request: &axum::http::Request<axum::body::Body>) -> Span {
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|value| value.to_str().ok())
        .unwrap_or("unknown");

    tracing::info_span!(
        "http_request",
        method = ?request.method(),
        uri = ?request.uri(),
        req_id = %request_id,
    )
}
