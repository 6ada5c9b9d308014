use crate::{
    AppState,
    auth::{RequestSession, resolve_token},
    error::{ContentError, QueryError},
    filters::{FetchOptions, FilterState},
    gate::post_login_destination,
    models::{
        ContentItem, DashboardStats, LoginRequest, LoginResponse, LookupOption, QuoteListResponse,
        SessionView,
    },
    summary::{ResolvedNames, empty_notice, summarize},
};
use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use uuid::Uuid;

// --- Filter Structs ---

/// QuoteFilterParams
///
/// Query parameters of the quote listings. Facets take an identifier or `"all"`;
/// `page` is 1-based and defaults to the first page.
#[derive(Debug, Default, Deserialize, utoipa::IntoParams)]
#[into_params(parameter_in = Query)]
pub struct QuoteFilterParams {
    /// Free-text match against the quote text.
    pub search: Option<String>,
    pub author_id: Option<String>,
    pub category_id: Option<String>,
    pub source_id: Option<String>,
    /// `today`, `last_week`, `last_month`, `last_year` or `lifetime`.
    pub time_range: Option<String>,
    pub page: Option<u32>,
}

impl QuoteFilterParams {
    pub fn filters(&self) -> Result<FilterState, QueryError> {
        FilterState::parse(
            self.search.as_deref(),
            self.author_id.as_deref(),
            self.category_id.as_deref(),
            self.source_id.as_deref(),
            self.time_range.as_deref(),
        )
    }
}

// --- Error Mapping ---

/// ApiError
///
/// A content failure as the client sees it: `502` for a retryable transport failure,
/// `400` for a query that will never succeed. Both are distinct from an empty result.
#[derive(Debug)]
pub struct ApiError(pub ContentError);

impl From<ContentError> for ApiError {
    fn from(err: ContentError) -> Self {
        ApiError(err)
    }
}

impl From<QueryError> for ApiError {
    fn from(err: QueryError) -> Self {
        ApiError(err.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = if self.0.is_retryable() {
            StatusCode::BAD_GATEWAY
        } else {
            StatusCode::BAD_REQUEST
        };
        let body = serde_json::json!({
            "error": self.0.to_string(),
            "retryable": self.0.is_retryable(),
        });
        (status, Json(body)).into_response()
    }
}

// --- Handlers ---

/// list_quotes
///
/// Shared body of the public and admin listings.
async fn list_quotes(
    state: &AppState,
    params: &QuoteFilterParams,
    options: FetchOptions,
) -> Result<QuoteListResponse, ApiError> {
    let filters = params.filters()?;
    let page = params.page.unwrap_or(1);
    let page_size = state.config.page_size;

    let result = state
        .engine
        .fetch_page(&filters, page, page_size, options)
        .await?;

    let names = ResolvedNames::from_items(&result.items);
    Ok(QuoteListResponse {
        page,
        page_size,
        total_pages: result.total_pages(page_size),
        summary: summarize(&filters, result.total_count, &names),
        notice: empty_notice(&filters, result.total_count).map(str::to_string),
        result,
    })
}

/// get_quotes
///
/// [Public Route] Published quotes matching the filters, newest first.
#[utoipa::path(
    get,
    path = "/quotes",
    params(QuoteFilterParams),
    responses(
        (status = 200, description = "A page of quotes", body = QuoteListResponse),
        (status = 400, description = "Malformed filter"),
        (status = 502, description = "Content store unreachable")
    )
)]
pub async fn get_quotes(
    State(state): State<AppState>,
    Query(params): Query<QuoteFilterParams>,
) -> Result<Json<QuoteListResponse>, ApiError> {
    Ok(Json(list_quotes(&state, &params, FetchOptions::default()).await?))
}

/// get_quote
///
/// [Public Route] A single published quote.
#[utoipa::path(
    get,
    path = "/quote/{id}",
    params(("id" = Uuid, Path, description = "Quote ID")),
    responses(
        (status = 200, description = "Found", body = ContentItem),
        (status = 404, description = "Unknown or not yet published")
    )
)]
pub async fn get_quote(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ContentItem>, Response> {
    match state.store.get_item(id).await {
        Ok(Some(item)) => Ok(Json(item)),
        Ok(None) => Err(StatusCode::NOT_FOUND.into_response()),
        Err(e) => Err(ApiError(e).into_response()),
    }
}

/// get_authors
///
/// [Public Route] Author selector options, ordered by name.
#[utoipa::path(
    get,
    path = "/authors",
    responses((status = 200, description = "Authors", body = [LookupOption]))
)]
pub async fn get_authors(State(state): State<AppState>) -> Result<Json<Vec<LookupOption>>, ApiError> {
    Ok(Json(state.store.list_authors().await?))
}

/// get_categories
///
/// [Public Route] Category selector options, ordered by name.
#[utoipa::path(
    get,
    path = "/categories",
    responses((status = 200, description = "Categories", body = [LookupOption]))
)]
pub async fn get_categories(
    State(state): State<AppState>,
) -> Result<Json<Vec<LookupOption>>, ApiError> {
    Ok(Json(state.store.list_categories().await?))
}

/// get_session
///
/// [Public Route] The caller's resolved session. Anonymous callers get an
/// unauthenticated view rather than an error.
#[utoipa::path(
    get,
    path = "/session",
    responses((status = 200, description = "Current session", body = SessionView))
)]
pub async fn get_session(RequestSession(session): RequestSession) -> Json<SessionView> {
    Json(session.view())
}

/// login
///
/// [Public Route] Called by the sign-in page after the hosted auth flow succeeded.
/// Answers with the page to continue to: the remembered return path, or the admin
/// entry point for admin-capable users who did not start from the admin area.
#[utoipa::path(
    post,
    path = "/login",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Signed in", body = LoginResponse),
        (status = 401, description = "Token rejected")
    )
)]
pub async fn login(
    State(state): State<AppState>,
    Json(payload): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, StatusCode> {
    let session = resolve_token(state.auth.as_ref(), Some(payload.access_token.as_str())).await;
    if !session.is_authenticated() {
        return Err(StatusCode::UNAUTHORIZED);
    }

    let destination = post_login_destination(payload.return_path.as_deref(), &session);
    tracing::info!(user_id = ?session.user_id(), %destination, "sign-in completed");
    Ok(Json(LoginResponse { destination }))
}

/// get_profile
///
/// [Authenticated Route] The signed-in visitor's session.
#[utoipa::path(
    get,
    path = "/profile",
    responses(
        (status = 200, description = "Profile", body = SessionView),
        (status = 303, description = "Not signed in, redirected to /login")
    )
)]
pub async fn get_profile(RequestSession(session): RequestSession) -> Json<SessionView> {
    Json(session.view())
}

/// get_admin_quotes
///
/// [Admin Route] The quote listing including scheduled quotes, for previewing.
#[utoipa::path(
    get,
    path = "/admin/quotes",
    params(QuoteFilterParams),
    responses(
        (status = 200, description = "A page of quotes, scheduled included", body = QuoteListResponse),
        (status = 303, description = "Not an admin, redirected to /")
    )
)]
pub async fn get_admin_quotes(
    State(state): State<AppState>,
    Query(params): Query<QuoteFilterParams>,
) -> Result<Json<QuoteListResponse>, ApiError> {
    Ok(Json(list_quotes(&state, &params, FetchOptions::preview()).await?))
}

/// get_dashboard
///
/// [Admin Route] Content counters for the dashboard.
#[utoipa::path(
    get,
    path = "/admin/dashboard",
    responses(
        (status = 200, description = "Dashboard counters", body = DashboardStats),
        (status = 303, description = "Not an admin, redirected to /")
    )
)]
pub async fn get_dashboard(State(state): State<AppState>) -> Result<Json<DashboardStats>, ApiError> {
    Ok(Json(state.store.get_stats().await?))
}
