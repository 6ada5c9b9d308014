use async_trait::async_trait;
use chrono::{Duration, Utc};
use quote_portal::{
    error::{ContentError, QueryError},
    filters::{Facet, FetchOptions, FilterState, build_key, build_key_with_options},
    models::{ContentItem, DashboardStats, LookupOption, PageResult},
    query::{CacheSettings, ContentQueryEngine, LoadOutcome, QueryView, ViewState},
    repository::{ContentPredicate, ContentStore, InMemoryContentStore, SortOrder},
};
use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};
use tokio::{sync::Notify, time::timeout};
use uuid::Uuid;

// --- Fixtures ---

fn quote(n: u128, text: &str, hours_ago: i64) -> ContentItem {
    ContentItem {
        id: Uuid::from_u128(n),
        text: text.to_string(),
        post_date: Utc::now() - Duration::hours(hours_ago),
        ..ContentItem::default()
    }
}

fn library() -> Vec<ContentItem> {
    let mut items = Vec::new();
    for n in 1..=30u128 {
        let text = if n % 2 == 0 { "stoic calm" } else { "hope endures" };
        items.push(quote(n, text, n as i64));
    }
    items
}

// --- Gated Store ---

/// Holds every query until the test releases the gate for its search term, so the
/// order in which responses arrive is under the test's control.
struct GatedStore {
    inner: InMemoryContentStore,
    gates: Mutex<HashMap<String, Arc<Notify>>>,
    calls: AtomicUsize,
}

impl GatedStore {
    fn new(items: Vec<ContentItem>) -> Self {
        Self {
            inner: InMemoryContentStore::new(items),
            gates: Mutex::new(HashMap::new()),
            calls: AtomicUsize::new(0),
        }
    }

    fn gate(&self, term: &str) -> Arc<Notify> {
        self.gates
            .lock()
            .unwrap()
            .entry(term.to_string())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    fn release(&self, term: &str) {
        self.gate(term).notify_one();
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    async fn wait_for_calls(&self, n: usize) {
        timeout(std::time::Duration::from_secs(5), async {
            while self.calls() < n {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("store was never queried");
    }
}

#[async_trait]
impl ContentStore for GatedStore {
    async fn query(
        &self,
        predicate: &ContentPredicate,
        order: SortOrder,
        offset: u64,
        limit: u32,
        include_scheduled: bool,
    ) -> Result<PageResult, ContentError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let gate = self.gate(predicate.text_contains.as_deref().unwrap_or_default());
        gate.notified().await;
        self.inner
            .query(predicate, order, offset, limit, include_scheduled)
            .await
    }

    async fn get_item(&self, id: Uuid) -> Result<Option<ContentItem>, ContentError> {
        self.inner.get_item(id).await
    }

    async fn list_authors(&self) -> Result<Vec<LookupOption>, ContentError> {
        self.inner.list_authors().await
    }

    async fn list_categories(&self) -> Result<Vec<LookupOption>, ContentError> {
        self.inner.list_categories().await
    }

    async fn get_stats(&self) -> Result<DashboardStats, ContentError> {
        self.inner.get_stats().await
    }
}

// --- Engine Tests ---

#[tokio::test]
async fn test_pages_partition_the_filtered_set() {
    let store = Arc::new(InMemoryContentStore::new(library()));
    let engine = ContentQueryEngine::new(store, CacheSettings::default());
    let filters = FilterState::new();

    let mut seen = Vec::new();
    for page in 1..=3 {
        let result = engine
            .fetch_page(&filters, page, 12, FetchOptions::default())
            .await
            .unwrap();
        assert_eq!(result.total_count, 30);
        assert!(result.items.len() <= 12);
        seen.extend(result.items.into_iter().map(|item| item.id));
    }
    assert_eq!(seen.len(), 30);
    let distinct: HashSet<Uuid> = seen.iter().copied().collect();
    assert_eq!(distinct.len(), 30, "pages overlap");

    let beyond = engine
        .fetch_page(&filters, 4, 12, FetchOptions::default())
        .await
        .unwrap();
    assert!(beyond.items.is_empty());
    assert_eq!(beyond.total_count, 30);
}

#[tokio::test]
async fn test_newest_first_ordering() {
    let store = Arc::new(InMemoryContentStore::new(library()));
    let engine = ContentQueryEngine::new(store, CacheSettings::default());

    let result = engine
        .fetch_page(&FilterState::new(), 1, 12, FetchOptions::default())
        .await
        .unwrap();
    let dates: Vec<_> = result.items.iter().map(|item| item.post_date).collect();
    assert!(dates.windows(2).all(|pair| pair[0] >= pair[1]));
}

#[tokio::test]
async fn test_zero_page_and_page_size_are_rejected_before_the_store() {
    let store = Arc::new(InMemoryContentStore::new(library()));
    let engine = ContentQueryEngine::new(store.clone(), CacheSettings::default());
    let filters = FilterState::new();

    let err = engine
        .fetch_page(&filters, 0, 12, FetchOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err, ContentError::Query(QueryError::InvalidPage));

    let err = engine
        .fetch_page(&filters, 1, 0, FetchOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err, ContentError::Query(QueryError::InvalidPageSize));
    assert_eq!(store.query_count(), 0);
}

#[tokio::test]
async fn test_cache_keeps_sibling_pages() {
    let store = Arc::new(InMemoryContentStore::new(library()));
    let engine = ContentQueryEngine::new(store.clone(), CacheSettings::default());
    let filters = FilterState::new().with_search("stoic");

    for page in [1, 2, 1, 2] {
        engine
            .fetch_page(&filters, page, 12, FetchOptions::default())
            .await
            .unwrap();
    }
    assert_eq!(store.query_count(), 2);

    // Another filter set does not disturb the first one.
    engine
        .fetch_page(&FilterState::new().with_search("hope"), 1, 12, FetchOptions::default())
        .await
        .unwrap();
    let key = build_key(&filters, 1, 12);
    assert_eq!(engine.cached_pages(key.facets()), vec![1, 2]);

    engine.invalidate();
    assert!(engine.cached_pages(key.facets()).is_empty());
}

#[tokio::test]
async fn test_failures_are_not_cached_and_stay_distinct_from_empty() {
    let store = Arc::new(InMemoryContentStore::failing(ContentError::Network(
        "connection refused".to_string(),
    )));
    let engine = ContentQueryEngine::new(store.clone(), CacheSettings::default());
    let filters = FilterState::new();

    for _ in 0..2 {
        let err = engine
            .fetch_page(&filters, 1, 12, FetchOptions::default())
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }
    assert_eq!(store.query_count(), 2);

    let empty = ContentQueryEngine::new(
        Arc::new(InMemoryContentStore::new(vec![])),
        CacheSettings::default(),
    );
    let result = empty
        .fetch_page(&filters, 1, 12, FetchOptions::default())
        .await
        .unwrap();
    assert_eq!(result, PageResult::empty());
}

#[tokio::test]
async fn test_scheduled_items_only_in_preview() {
    let mut items = library();
    items.push(quote(99, "stoic tomorrow", -24));
    let store = Arc::new(InMemoryContentStore::new(items));
    let engine = ContentQueryEngine::new(store, CacheSettings::default());
    let filters = FilterState::new().with_search("tomorrow");

    let published = engine
        .fetch_page(&filters, 1, 12, FetchOptions::default())
        .await
        .unwrap();
    assert_eq!(published.total_count, 0);

    let preview = engine
        .fetch_page(&filters, 1, 12, FetchOptions::preview())
        .await
        .unwrap();
    assert_eq!(preview.total_count, 1);
    assert_ne!(
        build_key(&filters, 1, 12),
        build_key_with_options(&filters, 1, 12, FetchOptions::preview())
    );
}

#[tokio::test]
async fn test_facets_combine_as_a_conjunction() {
    let author = Uuid::from_u128(500);
    let mut items = library();
    let mut pinned = quote(200, "stoic by author", 1);
    pinned.author_id = Some(author);
    items.push(pinned);
    let mut other = quote(201, "hope by author", 1);
    other.author_id = Some(author);
    items.push(other);

    let engine = ContentQueryEngine::new(
        Arc::new(InMemoryContentStore::new(items)),
        CacheSettings::default(),
    );
    let filters = FilterState::new()
        .with_search("STOIC")
        .with_author(Facet::Only(author));
    let result = engine
        .fetch_page(&filters, 1, 12, FetchOptions::default())
        .await
        .unwrap();
    assert_eq!(result.total_count, 1);
    assert_eq!(result.items[0].id, Uuid::from_u128(200));
}

#[tokio::test]
async fn test_concurrent_identical_fetches_share_one_store_call() {
    let store = Arc::new(GatedStore::new(library()));
    let engine = Arc::new(ContentQueryEngine::new(store.clone(), CacheSettings::default()));
    let filters = FilterState::new().with_search("stoic");

    let tasks: Vec<_> = (0..3)
        .map(|_| {
            let engine = engine.clone();
            let filters = filters.clone();
            tokio::spawn(async move {
                engine
                    .fetch_page(&filters, 1, 12, FetchOptions::default())
                    .await
            })
        })
        .collect();

    store.wait_for_calls(1).await;
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    store.release("stoic");

    let mut results = Vec::new();
    for task in tasks {
        results.push(task.await.unwrap().unwrap());
    }
    assert_eq!(store.calls(), 1);
    assert!(results.windows(2).all(|pair| pair[0] == pair[1]));
    assert_eq!(engine.in_flight(), 0);
}

#[tokio::test]
async fn test_abandoned_fetches_leave_no_in_flight_entries() {
    let store = Arc::new(GatedStore::new(library()));
    let engine = ContentQueryEngine::new(store.clone(), CacheSettings::default());

    // The store never answers these; every caller gives up.
    for n in 0..50 {
        let filters = FilterState::new().with_search(&format!("term {n}"));
        let abandoned = timeout(
            std::time::Duration::from_millis(1),
            engine.fetch_page(&filters, 1, 12, FetchOptions::default()),
        )
        .await;
        assert!(abandoned.is_err());
    }
    assert_eq!(engine.in_flight(), 0);

    // A later fetch of an abandoned key starts over and completes.
    store.release("term 0");
    let filters = FilterState::new().with_search("term 0");
    let result = engine
        .fetch_page(&filters, 1, 12, FetchOptions::default())
        .await
        .unwrap();
    assert_eq!(result.total_count, 0);
    assert_eq!(engine.in_flight(), 0);
}

#[tokio::test]
async fn test_one_caller_giving_up_does_not_cancel_the_others() {
    let store = Arc::new(GatedStore::new(library()));
    let engine = Arc::new(ContentQueryEngine::new(store.clone(), CacheSettings::default()));
    let filters = FilterState::new().with_search("stoic");

    let waiter = {
        let engine = engine.clone();
        let filters = filters.clone();
        tokio::spawn(async move {
            engine
                .fetch_page(&filters, 1, 12, FetchOptions::default())
                .await
        })
    };
    store.wait_for_calls(1).await;

    let abandoned = timeout(
        std::time::Duration::from_millis(10),
        engine.fetch_page(&filters, 1, 12, FetchOptions::default()),
    )
    .await;
    assert!(abandoned.is_err());
    assert_eq!(engine.in_flight(), 1);

    store.release("stoic");
    let result = waiter.await.unwrap().unwrap();
    assert_eq!(result.total_count, 15);
    assert_eq!(store.calls(), 1);
    assert_eq!(engine.in_flight(), 0);
}

// --- View Tests ---

#[tokio::test]
async fn test_late_response_for_an_old_selection_is_discarded() {
    let store = Arc::new(GatedStore::new(library()));
    let engine = Arc::new(ContentQueryEngine::new(store.clone(), CacheSettings::default()));
    let view = Arc::new(QueryView::new(engine, 12, FetchOptions::default()));

    let stoic = FilterState::new().with_search("stoic");
    let hope = FilterState::new().with_search("hope");

    let first = {
        let view = view.clone();
        let filters = stoic.clone();
        tokio::spawn(async move { view.load(&filters, 1).await })
    };
    store.wait_for_calls(1).await;

    let second = {
        let view = view.clone();
        let filters = hope.clone();
        tokio::spawn(async move { view.load(&filters, 1).await })
    };
    store.wait_for_calls(2).await;
    assert_eq!(view.state(), ViewState::Loading { key: build_key(&hope, 1, 12) });

    // The newer selection answers first, the older one last.
    store.release("hope");
    assert_eq!(second.await.unwrap(), LoadOutcome::Applied);
    store.release("stoic");
    assert_eq!(first.await.unwrap(), LoadOutcome::Superseded);

    match view.state() {
        ViewState::Ready { key, filters, result } => {
            assert_eq!(key, build_key(&hope, 1, 12));
            assert_eq!(filters, hope);
            assert!(result.items.iter().all(|item| item.text.contains("hope")));
        }
        other => panic!("expected the newer selection to be shown, got {other:?}"),
    }
}

#[tokio::test]
async fn test_reset_drops_the_in_flight_response() {
    let store = Arc::new(GatedStore::new(library()));
    let engine = Arc::new(ContentQueryEngine::new(store.clone(), CacheSettings::default()));
    let view = Arc::new(QueryView::new(engine, 12, FetchOptions::default()));

    let pending = {
        let view = view.clone();
        tokio::spawn(async move { view.load(&FilterState::new(), 1).await })
    };
    store.wait_for_calls(1).await;
    view.reset();
    store.release("");

    assert_eq!(pending.await.unwrap(), LoadOutcome::Superseded);
    assert_eq!(view.state(), ViewState::Idle);
}

#[tokio::test]
async fn test_view_reports_failures_with_their_key() {
    let store = Arc::new(InMemoryContentStore::failing(ContentError::Network(
        "timeout".to_string(),
    )));
    let engine = Arc::new(ContentQueryEngine::new(store, CacheSettings::default()));
    let view = QueryView::new(engine, 12, FetchOptions::default());
    let mut updates = view.subscribe();

    assert_eq!(view.load(&FilterState::new(), 1).await, LoadOutcome::Applied);
    assert!(updates.has_changed().unwrap());
    match view.state() {
        ViewState::Failed { key, error } => {
            assert_eq!(key, build_key(&FilterState::new(), 1, 12));
            assert!(error.is_retryable());
        }
        other => panic!("expected a failure, got {other:?}"),
    }
}
