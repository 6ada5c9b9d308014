//! Filter-driven page fetching.
//!
//! `ContentQueryEngine` is shared: it caches pages by `QueryKey` and collapses
//! concurrent fetches of the same key into one store call. `QueryView` is owned by a
//! single listing and makes sure only the latest selection it asked for is ever shown.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

use chrono::Utc;
use tokio::sync::{OnceCell, watch};

use crate::{
    error::{ContentError, QueryError},
    filters::{FacetKey, FetchOptions, FilterState, QueryKey, build_key_with_options},
    models::PageResult,
    repository::{ContentPredicate, ContentStoreState, SortOrder},
};

type SharedFetch = Arc<OnceCell<Result<PageResult, ContentError>>>;
type InFlightTable = Mutex<HashMap<QueryKey, SharedFetch>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// CacheSettings
///
/// Bounds of the page cache: how many distinct filter sets are kept, how many pages
/// each set may hold and how long a page stays fresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheSettings {
    pub max_filter_sets: usize,
    pub max_pages_per_set: usize,
    pub ttl: Duration,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            max_filter_sets: 32,
            max_pages_per_set: 64,
            ttl: Duration::from_secs(60),
        }
    }
}

struct CachedPage {
    result: PageResult,
    stored_at: Instant,
}

/// PageCache
///
/// Pages grouped by filter set. Storing page N never touches the other fresh pages of
/// the same set until the set is full; then its oldest page makes room. When too many
/// sets are held, the least recently used set is dropped whole. Expired pages are swept
/// on every insert.
struct PageCache {
    settings: CacheSettings,
    sets: HashMap<FacetKey, HashMap<u32, CachedPage>>,
    recency: VecDeque<FacetKey>,
}

impl PageCache {
    fn new(settings: CacheSettings) -> Self {
        Self {
            settings,
            sets: HashMap::new(),
            recency: VecDeque::new(),
        }
    }

    fn touch(&mut self, facets: &FacetKey) {
        if let Some(pos) = self.recency.iter().position(|k| k == facets) {
            self.recency.remove(pos);
        }
        self.recency.push_back(facets.clone());
    }

    fn get(&mut self, key: &QueryKey) -> Option<PageResult> {
        let ttl = self.settings.ttl;
        let pages = self.sets.get_mut(key.facets())?;
        let fresh = pages
            .get(&key.page())
            .is_some_and(|cached| cached.stored_at.elapsed() < ttl);
        if !fresh {
            pages.remove(&key.page());
            return None;
        }
        let result = pages.get(&key.page()).map(|cached| cached.result.clone());
        self.touch(key.facets());
        result
    }

    fn sweep_expired(&mut self) {
        let ttl = self.settings.ttl;
        self.sets.retain(|_, pages| {
            pages.retain(|_, cached| cached.stored_at.elapsed() < ttl);
            !pages.is_empty()
        });
        let sets = &self.sets;
        self.recency.retain(|facets| sets.contains_key(facets));
    }

    fn insert(&mut self, key: &QueryKey, result: PageResult) {
        if self.settings.max_filter_sets == 0 || self.settings.max_pages_per_set == 0 {
            return;
        }
        self.sweep_expired();

        let pages = self.sets.entry(key.facets().clone()).or_default();
        pages.insert(
            key.page(),
            CachedPage {
                result,
                stored_at: Instant::now(),
            },
        );
        while pages.len() > self.settings.max_pages_per_set {
            let oldest = pages
                .iter()
                .filter(|(page, _)| **page != key.page())
                .min_by_key(|(_, cached)| cached.stored_at)
                .map(|(page, _)| *page);
            match oldest {
                Some(page) => pages.remove(&page),
                None => break,
            };
        }
        self.touch(key.facets());

        while self.recency.len() > self.settings.max_filter_sets {
            if let Some(evicted) = self.recency.pop_front() {
                tracing::debug!(facets = %evicted, "evicting cached filter set");
                self.sets.remove(&evicted);
            }
        }
    }

    fn pages_of(&self, facets: &FacetKey) -> Vec<u32> {
        let mut pages: Vec<u32> = self
            .sets
            .get(facets)
            .map(|pages| pages.keys().copied().collect())
            .unwrap_or_default();
        pages.sort_unstable();
        pages
    }

    fn clear(&mut self) {
        self.sets.clear();
        self.recency.clear();
    }
}

/// InFlightSlot
///
/// One caller's share of an in-flight fetch. The table entry goes away with the last
/// share, so a fetch abandoned by every caller (a dropped request, a timeout) leaves
/// nothing behind.
struct InFlightSlot<'a> {
    table: &'a InFlightTable,
    key: QueryKey,
    cell: SharedFetch,
}

impl<'a> InFlightSlot<'a> {
    fn join(table: &'a InFlightTable, key: QueryKey) -> Self {
        let cell = lock(table).entry(key.clone()).or_default().clone();
        Self { table, key, cell }
    }
}

impl Drop for InFlightSlot<'_> {
    fn drop(&mut self) {
        // Every share is created and released under the table lock, so the count is exact.
        let mut table = lock(self.table);
        drop(std::mem::take(&mut self.cell));
        if table
            .get(&self.key)
            .is_some_and(|cell| Arc::strong_count(cell) == 1)
        {
            table.remove(&self.key);
        }
    }
}

/// ContentQueryEngine
///
/// Turns a facet selection and a page number into a store query. Results are cached by
/// `QueryKey`; a key already being fetched is awaited instead of fetched twice.
pub struct ContentQueryEngine {
    store: ContentStoreState,
    cache: Mutex<PageCache>,
    in_flight: InFlightTable,
}

impl ContentQueryEngine {
    pub fn new(store: ContentStoreState, settings: CacheSettings) -> Self {
        Self {
            store,
            cache: Mutex::new(PageCache::new(settings)),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// fetch_page
    ///
    /// Fetches page `page` (1-based) of the listing described by `filters`.
    ///
    /// # Errors
    /// `QueryError` for a page or page size of zero and for anything the store rejects;
    /// `ContentError::Network` when the store cannot be reached.
    pub async fn fetch_page(
        &self,
        filters: &FilterState,
        page: u32,
        page_size: u32,
        options: FetchOptions,
    ) -> Result<PageResult, ContentError> {
        if page == 0 {
            return Err(QueryError::InvalidPage.into());
        }
        if page_size == 0 {
            return Err(QueryError::InvalidPageSize.into());
        }

        let key = build_key_with_options(filters, page, page_size, options);
        if let Some(hit) = lock(&self.cache).get(&key) {
            tracing::debug!(%key, "query cache hit");
            return Ok(hit);
        }

        let slot = InFlightSlot::join(&self.in_flight, key.clone());
        slot.cell
            .get_or_init(|| self.load(&key, filters, page, page_size, options))
            .await
            .clone()
    }

    async fn load(
        &self,
        key: &QueryKey,
        filters: &FilterState,
        page: u32,
        page_size: u32,
        options: FetchOptions,
    ) -> Result<PageResult, ContentError> {
        tracing::debug!(%key, "query cache miss, fetching");
        let predicate = ContentPredicate::from_filters(filters, Utc::now());
        let offset = u64::from(page - 1) * u64::from(page_size);

        let result = self
            .store
            .query(
                &predicate,
                SortOrder::NewestFirst,
                offset,
                page_size,
                options.include_scheduled,
            )
            .await;

        match &result {
            Ok(page_result) => lock(&self.cache).insert(key, page_result.clone()),
            Err(err) => tracing::error!(%key, error = %err, "content query failed"),
        }
        // Cache first, then release the in-flight slot, so late arrivals hit the cache.
        lock(&self.in_flight).remove(key);
        result
    }

    /// Page numbers currently cached for a filter set.
    pub fn cached_pages(&self, facets: &FacetKey) -> Vec<u32> {
        lock(&self.cache).pages_of(facets)
    }

    /// Number of keys with a fetch in progress.
    pub fn in_flight(&self) -> usize {
        lock(&self.in_flight).len()
    }

    /// Drops every cached page, e.g. after the content was edited.
    pub fn invalidate(&self) {
        lock(&self.cache).clear();
    }
}

/// ViewState
///
/// What a listing shows. Every non-idle state carries the key it belongs to.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum ViewState {
    #[default]
    Idle,
    Loading {
        key: QueryKey,
    },
    Ready {
        key: QueryKey,
        filters: FilterState,
        result: PageResult,
    },
    /// A failed fetch, distinct from a legitimately empty `Ready`.
    Failed {
        key: QueryKey,
        error: ContentError,
    },
}

impl ViewState {
    pub fn key(&self) -> Option<&QueryKey> {
        match self {
            ViewState::Idle => None,
            ViewState::Loading { key }
            | ViewState::Ready { key, .. }
            | ViewState::Failed { key, .. } => Some(key),
        }
    }
}

/// LoadOutcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    /// The response was for the current selection and is now displayed.
    Applied,
    /// A newer selection was requested while this one was in flight; the response was dropped.
    Superseded,
}

/// QueryView
///
/// The query state of one listing. Each `load` makes its key the current one; a
/// response is only applied if its key is still current when it arrives, so an
/// earlier request resolving late can never overwrite a later one.
pub struct QueryView {
    engine: Arc<ContentQueryEngine>,
    page_size: u32,
    options: FetchOptions,
    current: Mutex<Option<QueryKey>>,
    state: watch::Sender<ViewState>,
}

impl QueryView {
    pub fn new(engine: Arc<ContentQueryEngine>, page_size: u32, options: FetchOptions) -> Self {
        let (state, _) = watch::channel(ViewState::Idle);
        Self {
            engine,
            page_size,
            options,
            current: Mutex::new(None),
            state,
        }
    }

    pub async fn load(&self, filters: &FilterState, page: u32) -> LoadOutcome {
        let key = build_key_with_options(filters, page, self.page_size, self.options);
        {
            let mut current = lock(&self.current);
            *current = Some(key.clone());
            self.state.send_replace(ViewState::Loading { key: key.clone() });
        }

        let outcome = self
            .engine
            .fetch_page(filters, page, self.page_size, self.options)
            .await;

        let current = lock(&self.current);
        if current.as_ref() != Some(&key) {
            tracing::debug!(%key, "discarding stale response");
            return LoadOutcome::Superseded;
        }
        let next = match outcome {
            Ok(result) => ViewState::Ready {
                key,
                filters: filters.clone(),
                result,
            },
            Err(error) => ViewState::Failed { key, error },
        };
        self.state.send_replace(next);
        LoadOutcome::Applied
    }

    /// Abandons interest in whatever is in flight; its response will be dropped.
    pub fn reset(&self) {
        let mut current = lock(&self.current);
        *current = None;
        self.state.send_replace(ViewState::Idle);
    }

    pub fn state(&self) -> ViewState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ViewState> {
        self.state.subscribe()
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }
}
