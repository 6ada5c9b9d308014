use thiserror::Error;

/// QueryError
///
/// A content query that can never succeed as written: a malformed facet value, an
/// impossible page request, or a predicate the store rejected. Not retryable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueryError {
    /// A facet value that is neither `"all"` nor a valid identifier.
    #[error("malformed {facet} identifier: {value}")]
    MalformedId { facet: &'static str, value: String },

    #[error("unknown time range: {0}")]
    UnknownTimeRange(String),

    /// Pages are 1-based.
    #[error("page numbers start at 1")]
    InvalidPage,

    #[error("page size must be greater than zero")]
    InvalidPageSize,

    /// The store understood the request but refused it (e.g. an identifier it does not know).
    #[error("query rejected by store: {0}")]
    Rejected(String),
}

/// ContentError
///
/// Everything a content fetch can fail with. `Clone` so one in-flight result can be
/// handed to every caller waiting on the same query key.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContentError {
    /// Transport failure talking to the store. The caller may retry.
    #[error("network error: {0}")]
    Network(String),

    #[error(transparent)]
    Query(#[from] QueryError),
}

impl ContentError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ContentError::Network(_))
    }
}

impl From<sqlx::Error> for ContentError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            // The database understood the statement and said no: treat as a bad query.
            sqlx::Error::Database(db) => ContentError::Query(QueryError::Rejected(db.to_string())),
            sqlx::Error::RowNotFound => {
                ContentError::Query(QueryError::Rejected("row not found".to_string()))
            }
            other => ContentError::Network(other.to_string()),
        }
    }
}

/// AuthError
///
/// Identity or role resolution failed. Consumers treat every variant as
/// "not signed in" / "no role" (fail-closed).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("auth provider unreachable: {0}")]
    Network(String),

    #[error("invalid access token: {0}")]
    InvalidToken(String),

    #[error("role lookup failed: {0}")]
    RoleLookup(String),
}

impl From<reqwest::Error> for AuthError {
    fn from(err: reqwest::Error) -> Self {
        AuthError::Network(err.to_string())
    }
}
