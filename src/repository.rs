use crate::{
    error::{ContentError, QueryError},
    filters::FilterState,
    models::{ContentItem, DashboardStats, LookupOption, PageResult},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, query_builder::QueryBuilder};
use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};
use uuid::Uuid;

/// ContentPredicate
///
/// The storage-neutral form of a facet selection: a conjunction of equality
/// constraints, an optional case-insensitive substring match on the quote text, and a
/// lower date bound. `now` is captured once per fetch so the count and the page agree.
#[derive(Debug, Clone, PartialEq)]
pub struct ContentPredicate {
    pub author_id: Option<Uuid>,
    pub category_id: Option<Uuid>,
    pub source_id: Option<Uuid>,
    pub text_contains: Option<String>,
    pub published_from: Option<DateTime<Utc>>,
    pub now: DateTime<Utc>,
}

impl ContentPredicate {
    pub fn from_filters(filters: &FilterState, now: DateTime<Utc>) -> Self {
        Self {
            author_id: filters.author().id(),
            category_id: filters.category().id(),
            source_id: filters.source().id(),
            text_contains: filters.search_term().map(str::to_string),
            published_from: filters.time_range().window().map(|window| now - window),
            now,
        }
    }

    /// Evaluates the predicate against one item. Scheduled items (dated after `now`)
    /// only pass when `include_scheduled` is set, and never inside an active time range,
    /// whose window is the half-open `[now - window, now)`.
    pub fn matches(&self, item: &ContentItem, include_scheduled: bool) -> bool {
        let eq = |wanted: Option<Uuid>, actual: Option<Uuid>| wanted.is_none_or(|w| actual == Some(w));

        if !eq(self.author_id, item.author_id)
            || !eq(self.category_id, item.category_id)
            || !eq(self.source_id, item.source_id)
        {
            return false;
        }
        if let Some(term) = &self.text_contains
            && !item.text.to_lowercase().contains(&term.to_lowercase())
        {
            return false;
        }
        if let Some(from) = self.published_from
            && (item.post_date < from || item.post_date >= self.now)
        {
            return false;
        }
        include_scheduled || item.post_date <= self.now
    }
}

/// SortOrder
///
/// The only listing order: newest publication first, ties broken by id (descending)
/// so that consecutive pages never overlap or skip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    #[default]
    NewestFirst,
}

/// ContentStore Trait
///
/// The contract of the hosted persistence layer as far as listings are concerned.
/// Handlers and the query engine only ever see `Arc<dyn ContentStore>`, so the
/// Postgres implementation and the in-memory one are interchangeable.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// One page of matching items plus the size of the whole matching set.
    async fn query(
        &self,
        predicate: &ContentPredicate,
        order: SortOrder,
        offset: u64,
        limit: u32,
        include_scheduled: bool,
    ) -> Result<PageResult, ContentError>;

    /// A single published item.
    async fn get_item(&self, id: Uuid) -> Result<Option<ContentItem>, ContentError>;

    // --- Selector lookups, ordered by name ---
    async fn list_authors(&self) -> Result<Vec<LookupOption>, ContentError>;
    async fn list_categories(&self) -> Result<Vec<LookupOption>, ContentError>;

    async fn get_stats(&self) -> Result<DashboardStats, ContentError>;
}

/// ContentStoreState
///
/// The shared handle stored in the application state.
pub type ContentStoreState = Arc<dyn ContentStore>;

/// PostgresContentStore
///
/// `ContentStore` backed by the hosted Postgres database (`quotes`, `authors`,
/// `categories`, `sources`).
pub struct PostgresContentStore {
    pool: PgPool,
}

impl PostgresContentStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const QUOTE_COLUMNS: &str = r#"
    SELECT
        q.id, q.title, q.text,
        q.author_id, a.name AS author_name, a.image_url AS author_image_url,
        q.category_id, c.name AS category_name,
        q.source_id, s.title AS source_title, q.source_url,
        q.post_date
    FROM quotes q
    LEFT JOIN authors a ON a.id = q.author_id
    LEFT JOIN categories c ON c.id = q.category_id
    LEFT JOIN sources s ON s.id = q.source_id
"#;

/// push_predicate
///
/// Appends the `WHERE` clause for a predicate. Every value goes through `push_bind`;
/// nothing user-supplied is spliced into the SQL text.
fn push_predicate(
    builder: &mut QueryBuilder<'_, Postgres>,
    predicate: &ContentPredicate,
    include_scheduled: bool,
) {
    builder.push(" WHERE TRUE");

    if let Some(author_id) = predicate.author_id {
        builder.push(" AND q.author_id = ");
        builder.push_bind(author_id);
    }
    if let Some(category_id) = predicate.category_id {
        builder.push(" AND q.category_id = ");
        builder.push_bind(category_id);
    }
    if let Some(source_id) = predicate.source_id {
        builder.push(" AND q.source_id = ");
        builder.push_bind(source_id);
    }
    if let Some(term) = &predicate.text_contains {
        builder.push(" AND q.text ILIKE ");
        builder.push_bind(format!("%{}%", escape_like(term)));
    }
    if let Some(from) = predicate.published_from {
        builder.push(" AND q.post_date >= ");
        builder.push_bind(from);
        builder.push(" AND q.post_date < ");
        builder.push_bind(predicate.now);
    } else if !include_scheduled {
        builder.push(" AND q.post_date <= ");
        builder.push_bind(predicate.now);
    }
}

/// Escapes LIKE wildcards so the search text matches literally (backslash is the
/// default escape character in Postgres).
fn escape_like(term: &str) -> String {
    let mut escaped = String::with_capacity(term.len());
    for ch in term.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

#[async_trait]
impl ContentStore for PostgresContentStore {
    async fn query(
        &self,
        predicate: &ContentPredicate,
        order: SortOrder,
        offset: u64,
        limit: u32,
        include_scheduled: bool,
    ) -> Result<PageResult, ContentError> {
        let offset = i64::try_from(offset).map_err(|_| QueryError::InvalidPage)?;

        let mut count: QueryBuilder<Postgres> = QueryBuilder::new("SELECT COUNT(*) FROM quotes q");
        push_predicate(&mut count, predicate, include_scheduled);
        let total: i64 = count
            .build_query_scalar::<i64>()
            .fetch_one(&self.pool)
            .await
            .inspect_err(|e| tracing::error!("quote count error: {:?}", e))?;

        let mut page: QueryBuilder<Postgres> = QueryBuilder::new(QUOTE_COLUMNS);
        push_predicate(&mut page, predicate, include_scheduled);
        match order {
            SortOrder::NewestFirst => page.push(" ORDER BY q.post_date DESC, q.id DESC"),
        };
        page.push(" LIMIT ");
        page.push_bind(i64::from(limit));
        page.push(" OFFSET ");
        page.push_bind(offset);

        let items = page
            .build_query_as::<ContentItem>()
            .fetch_all(&self.pool)
            .await
            .inspect_err(|e| tracing::error!("quote page error: {:?}", e))?;

        Ok(PageResult {
            items,
            total_count: u64::try_from(total).unwrap_or_default(),
        })
    }

    async fn get_item(&self, id: Uuid) -> Result<Option<ContentItem>, ContentError> {
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(QUOTE_COLUMNS);
        builder.push(" WHERE q.id = ");
        builder.push_bind(id);
        builder.push(" AND q.post_date <= NOW()");

        let item = builder
            .build_query_as::<ContentItem>()
            .fetch_optional(&self.pool)
            .await
            .inspect_err(|e| tracing::error!("get_item error: {:?}", e))?;
        Ok(item)
    }

    async fn list_authors(&self) -> Result<Vec<LookupOption>, ContentError> {
        let authors = sqlx::query_as::<_, LookupOption>("SELECT id, name FROM authors ORDER BY name")
            .fetch_all(&self.pool)
            .await
            .inspect_err(|e| tracing::error!("list_authors error: {:?}", e))?;
        Ok(authors)
    }

    async fn list_categories(&self) -> Result<Vec<LookupOption>, ContentError> {
        let categories =
            sqlx::query_as::<_, LookupOption>("SELECT id, name FROM categories ORDER BY name")
                .fetch_all(&self.pool)
                .await
                .inspect_err(|e| tracing::error!("list_categories error: {:?}", e))?;
        Ok(categories)
    }

    /// get_stats
    ///
    /// Compiles the dashboard counters.
    async fn get_stats(&self) -> Result<DashboardStats, ContentError> {
        let count = |sql: &'static str| sqlx::query_scalar::<_, i64>(sql).fetch_one(&self.pool);

        Ok(DashboardStats {
            total_quotes: count("SELECT COUNT(*) FROM quotes").await?,
            scheduled_quotes: count("SELECT COUNT(*) FROM quotes WHERE post_date > NOW()").await?,
            total_authors: count("SELECT COUNT(*) FROM authors").await?,
            total_categories: count("SELECT COUNT(*) FROM categories").await?,
        })
    }
}

/// InMemoryContentStore
///
/// A `ContentStore` over a fixed set of items. Used by the tests and for running the
/// server without a database. It evaluates predicates with `ContentPredicate::matches`
/// and counts how many queries reached it, so cache behaviour can be asserted.
#[derive(Default)]
pub struct InMemoryContentStore {
    items: Vec<ContentItem>,
    authors: Vec<LookupOption>,
    categories: Vec<LookupOption>,
    /// When set, every call fails with this error.
    failure: Option<ContentError>,
    queries: AtomicUsize,
}

impl InMemoryContentStore {
    pub fn new(items: Vec<ContentItem>) -> Self {
        Self {
            items,
            ..Self::default()
        }
    }

    pub fn failing(error: ContentError) -> Self {
        Self {
            failure: Some(error),
            ..Self::default()
        }
    }

    pub fn with_lookups(mut self, authors: Vec<LookupOption>, categories: Vec<LookupOption>) -> Self {
        self.authors = authors;
        self.categories = categories;
        self
    }

    /// Number of `query` calls served so far.
    pub fn query_count(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), ContentError> {
        match &self.failure {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ContentStore for InMemoryContentStore {
    async fn query(
        &self,
        predicate: &ContentPredicate,
        order: SortOrder,
        offset: u64,
        limit: u32,
        include_scheduled: bool,
    ) -> Result<PageResult, ContentError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        self.check()?;

        let mut matching: Vec<&ContentItem> = self
            .items
            .iter()
            .filter(|item| predicate.matches(item, include_scheduled))
            .collect();
        match order {
            SortOrder::NewestFirst => matching.sort_by(|a, b| {
                b.post_date.cmp(&a.post_date).then_with(|| b.id.cmp(&a.id))
            }),
        }

        let total_count = matching.len() as u64;
        let items = matching
            .into_iter()
            .skip(usize::try_from(offset).unwrap_or(usize::MAX))
            .take(limit as usize)
            .cloned()
            .collect();
        Ok(PageResult { items, total_count })
    }

    async fn get_item(&self, id: Uuid) -> Result<Option<ContentItem>, ContentError> {
        self.check()?;
        let now = Utc::now();
        Ok(self
            .items
            .iter()
            .find(|item| item.id == id && !item.is_scheduled(now))
            .cloned())
    }

    async fn list_authors(&self) -> Result<Vec<LookupOption>, ContentError> {
        self.check()?;
        let mut authors = self.authors.clone();
        authors.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(authors)
    }

    async fn list_categories(&self) -> Result<Vec<LookupOption>, ContentError> {
        self.check()?;
        let mut categories = self.categories.clone();
        categories.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(categories)
    }

    async fn get_stats(&self) -> Result<DashboardStats, ContentError> {
        self.check()?;
        let now = Utc::now();
        Ok(DashboardStats {
            total_quotes: self.items.len() as i64,
            scheduled_quotes: self.items.iter().filter(|i| i.is_scheduled(now)).count() as i64,
            total_authors: self.authors.len() as i64,
            total_categories: self.categories.len() as i64,
        })
    }
}
