use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use ts_rs::TS;
use utoipa::ToSchema;
use uuid::Uuid;

// --- Core Content Schemas (Mapped to Database) ---

/// ContentItem
///
/// A quote as the listing pages see it: the `public.quotes` row joined with the display
/// fields of its author, category and source. The joined fields are optional because
/// the foreign keys are nullable.
#[derive(Debug, Clone, Serialize, Deserialize, TS, ToSchema, FromRow, Default, PartialEq)]
#[ts(export)]
pub struct ContentItem {
    pub id: Uuid,
    pub title: Option<String>,
    // The primary content field; free-text search runs against it.
    pub text: String,

    pub author_id: Option<Uuid>,
    pub author_name: Option<String>,
    pub author_image_url: Option<String>,

    pub category_id: Option<Uuid>,
    pub category_name: Option<String>,

    pub source_id: Option<Uuid>,
    pub source_title: Option<String>,
    pub source_url: Option<String>,

    /// Publication date. Items dated in the future are "scheduled".
    #[ts(type = "string")]
    pub post_date: DateTime<Utc>,
}

impl ContentItem {
    pub fn is_scheduled(&self, now: DateTime<Utc>) -> bool {
        self.post_date > now
    }
}

/// PageResult
///
/// One page of a filtered listing plus the size of the whole filtered set.
/// `items.len()` never exceeds the page size it was fetched with.
#[derive(Debug, Clone, Serialize, Deserialize, TS, ToSchema, Default, PartialEq)]
#[ts(export)]
pub struct PageResult {
    pub items: Vec<ContentItem>,
    #[ts(type = "number")]
    pub total_count: u64,
}

impl PageResult {
    pub fn empty() -> Self {
        Self::default()
    }

    /// `ceil(total_count / page_size)`; zero when there is nothing to show.
    pub fn total_pages(&self, page_size: u32) -> u64 {
        total_pages(self.total_count, page_size)
    }
}

/// total_pages
///
/// Page-count arithmetic shared by the engine and the handlers. A zero page size yields
/// zero pages instead of dividing by zero.
pub fn total_pages(total_count: u64, page_size: u32) -> u64 {
    if page_size == 0 {
        return 0;
    }
    total_count.div_ceil(u64::from(page_size))
}

/// LookupOption
///
/// An `(id, name)` pair used to populate the author and category selectors.
#[derive(Debug, Clone, Serialize, Deserialize, TS, ToSchema, FromRow, Default, PartialEq)]
#[ts(export)]
pub struct LookupOption {
    pub id: Uuid,
    pub name: String,
}

// --- Identity & Roles ---

/// Role
///
/// The RBAC field stored in `public.profiles.role`. A profile without a role is
/// represented as `Option<Role>::None` at the call sites.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, TS, ToSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
#[ts(export)]
pub enum Role {
    Subscriber,
    Editor,
    Author,
    Admin,
    #[serde(rename = "superadmin")]
    SuperAdmin,
}

impl Role {
    /// The canonical admin capability set: `{Admin, SuperAdmin}`.
    pub fn is_admin(self) -> bool {
        matches!(self, Role::Admin | Role::SuperAdmin)
    }

    /// Lenient parse of the database value. Unknown strings yield `None`.
    pub fn parse(raw: &str) -> Option<Role> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "subscriber" => Some(Role::Subscriber),
            "editor" => Some(Role::Editor),
            "author" => Some(Role::Author),
            "admin" => Some(Role::Admin),
            "superadmin" => Some(Role::SuperAdmin),
            _ => None,
        }
    }
}

/// Identity
///
/// Who the auth provider says the visitor is, before any role is known.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Identity {
    pub user_id: Uuid,
}

// --- Request Payloads (Input Schemas) ---

/// LoginRequest
///
/// Sent by the sign-in page once the hosted auth flow has produced an access token.
/// `return_path` is the destination remembered by the gate that redirected here.
#[derive(Debug, Clone, Serialize, Deserialize, TS, ToSchema, Default)]
#[ts(export)]
pub struct LoginRequest {
    pub access_token: String,
    pub return_path: Option<String>,
}

// --- Output Schemas ---

/// QuoteListResponse
///
/// A page of quotes together with everything the listing needs to render around it.
#[derive(Debug, Clone, Serialize, Deserialize, TS, ToSchema, Default)]
#[ts(export)]
pub struct QuoteListResponse {
    pub page: u32,
    pub page_size: u32,
    #[ts(type = "number")]
    pub total_pages: u64,
    pub result: PageResult,
    /// Description of the active filters, absent when nothing is filtered.
    pub summary: Option<String>,
    /// Shown when a search produced no results.
    pub notice: Option<String>,
}

/// LoginResponse
///
/// Where the sign-in page should send the visitor next.
#[derive(Debug, Clone, Serialize, Deserialize, TS, ToSchema, Default)]
#[ts(export)]
pub struct LoginResponse {
    pub destination: String,
}

/// SessionView
///
/// Serializable snapshot of a resolved session (GET /session, GET /profile).
#[derive(Debug, Clone, Serialize, Deserialize, TS, ToSchema, Default, PartialEq)]
#[ts(export)]
pub struct SessionView {
    pub authenticated: bool,
    pub user_id: Option<Uuid>,
    pub role: Option<Role>,
    pub is_admin: bool,
}

/// DashboardStats
///
/// Output schema for the admin dashboard (GET /admin/dashboard).
#[derive(Debug, Clone, Serialize, Deserialize, TS, ToSchema, Default, PartialEq)]
#[ts(export)]
pub struct DashboardStats {
    pub total_quotes: i64,
    /// Quotes dated in the future.
    pub scheduled_quotes: i64,
    pub total_authors: i64,
    pub total_categories: i64,
}
