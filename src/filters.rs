//! Facet selection and the cache keys derived from it.
//!
//! A `FilterState` is an immutable snapshot: edits go through the `with_*` methods,
//! which return a new value. Keys are built from field values only, so two states
//! constructed in any order compare and hash identically.

use std::fmt;

use chrono::Duration;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::QueryError;

/// Facet
///
/// One independent filter dimension: either unconstrained (`"all"`) or pinned to a
/// concrete identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Facet {
    #[default]
    All,
    Only(Uuid),
}

impl Facet {
    /// Parses a raw selector value. `"all"` and the empty string mean no constraint.
    pub fn parse(facet: &'static str, raw: &str) -> Result<Facet, QueryError> {
        let raw = raw.trim();
        if raw.is_empty() || raw.eq_ignore_ascii_case("all") {
            return Ok(Facet::All);
        }
        Uuid::parse_str(raw)
            .map(Facet::Only)
            .map_err(|_| QueryError::MalformedId {
                facet,
                value: raw.to_string(),
            })
    }

    pub fn id(self) -> Option<Uuid> {
        match self {
            Facet::All => None,
            Facet::Only(id) => Some(id),
        }
    }

    pub fn is_active(self) -> bool {
        matches!(self, Facet::Only(_))
    }
}

impl fmt::Display for Facet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Facet::All => f.write_str("all"),
            Facet::Only(id) => write!(f, "{id}"),
        }
    }
}

/// TimeRange
///
/// How far back from "now" the listing reaches. `Lifetime` puts no bound on the date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeRange {
    Today,
    LastWeek,
    LastMonth,
    LastYear,
    #[default]
    Lifetime,
}

impl TimeRange {
    pub fn parse(raw: &str) -> Result<TimeRange, QueryError> {
        match raw.trim() {
            "" | "lifetime" | "all" => Ok(TimeRange::Lifetime),
            "today" => Ok(TimeRange::Today),
            "last_week" => Ok(TimeRange::LastWeek),
            "last_month" => Ok(TimeRange::LastMonth),
            "last_year" => Ok(TimeRange::LastYear),
            other => Err(QueryError::UnknownTimeRange(other.to_string())),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TimeRange::Today => "today",
            TimeRange::LastWeek => "last_week",
            TimeRange::LastMonth => "last_month",
            TimeRange::LastYear => "last_year",
            TimeRange::Lifetime => "lifetime",
        }
    }

    /// Length of the half-open window `[now - window, now)`.
    pub fn window(self) -> Option<Duration> {
        match self {
            TimeRange::Today => Some(Duration::days(1)),
            TimeRange::LastWeek => Some(Duration::days(7)),
            TimeRange::LastMonth => Some(Duration::days(30)),
            TimeRange::LastYear => Some(Duration::days(365)),
            TimeRange::Lifetime => None,
        }
    }

    pub fn is_active(self) -> bool {
        self != TimeRange::Lifetime
    }
}

/// FilterState
///
/// The complete facet selection of a listing view. Search text is stored trimmed, so
/// `"stoic "` and `"stoic"` are the same selection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct FilterState {
    search_text: String,
    author: Facet,
    category: Facet,
    source: Facet,
    time_range: TimeRange,
}

impl FilterState {
    /// A selection with every facet on `"all"` and no search text.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a selection from the raw selector values of the filter panel.
    pub fn parse(
        search: Option<&str>,
        author: Option<&str>,
        category: Option<&str>,
        source: Option<&str>,
        time_range: Option<&str>,
    ) -> Result<FilterState, QueryError> {
        Ok(FilterState::new()
            .with_search(search.unwrap_or_default())
            .with_author(Facet::parse("author", author.unwrap_or_default())?)
            .with_category(Facet::parse("category", category.unwrap_or_default())?)
            .with_source(Facet::parse("source", source.unwrap_or_default())?)
            .with_time_range(TimeRange::parse(time_range.unwrap_or_default())?))
    }

    pub fn with_search(self, text: &str) -> Self {
        Self {
            search_text: text.trim().to_string(),
            ..self
        }
    }

    pub fn with_author(self, author: Facet) -> Self {
        Self { author, ..self }
    }

    pub fn with_category(self, category: Facet) -> Self {
        Self { category, ..self }
    }

    pub fn with_source(self, source: Facet) -> Self {
        Self { source, ..self }
    }

    pub fn with_time_range(self, time_range: TimeRange) -> Self {
        Self { time_range, ..self }
    }

    /// The search text, or `None` when it is empty.
    pub fn search_term(&self) -> Option<&str> {
        if self.search_text.is_empty() {
            None
        } else {
            Some(&self.search_text)
        }
    }

    pub fn author(&self) -> Facet {
        self.author
    }

    pub fn category(&self) -> Facet {
        self.category
    }

    pub fn source(&self) -> Facet {
        self.source
    }

    pub fn time_range(&self) -> TimeRange {
        self.time_range
    }

    /// True when no facet constrains the listing.
    pub fn is_unfiltered(&self) -> bool {
        self.search_term().is_none()
            && !self.author.is_active()
            && !self.category.is_active()
            && !self.source.is_active()
            && !self.time_range.is_active()
    }
}

/// FetchOptions
///
/// Per-request switches that change what a listing contains and therefore belong in the key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FetchOptions {
    /// Include items dated in the future (preview contexts only).
    pub include_scheduled: bool,
}

impl FetchOptions {
    pub fn preview() -> Self {
        Self {
            include_scheduled: true,
        }
    }
}

/// FacetKey
///
/// Canonical encoding of everything in a query except the page number. All pages of one
/// filter set share a `FacetKey`, which is what the page cache groups by.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FacetKey(String);

impl FacetKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FacetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// QueryKey
///
/// Cache and staleness key of one page fetch. Equal field values always give equal keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryKey {
    facets: FacetKey,
    page: u32,
}

impl QueryKey {
    pub fn facets(&self) -> &FacetKey {
        &self.facets
    }

    pub fn page(&self) -> u32 {
        self.page
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#page={}", self.facets, self.page)
    }
}

/// build_key
///
/// Key for a published-only listing page.
pub fn build_key(filters: &FilterState, page: u32, page_size: u32) -> QueryKey {
    build_key_with_options(filters, page, page_size, FetchOptions::default())
}

/// build_key_with_options
///
/// Pure and total. Every field is written with its label so that no two distinct
/// selections can collide, and the search text is JSON-escaped so separators inside it
/// cannot forge another field.
pub fn build_key_with_options(
    filters: &FilterState,
    page: u32,
    page_size: u32,
    options: FetchOptions,
) -> QueryKey {
    let search = escape(&filters.search_text);
    let facets = format!(
        "q={search};author={};category={};source={};time={};scheduled={};size={page_size}",
        filters.author,
        filters.category,
        filters.source,
        filters.time_range.as_str(),
        u8::from(options.include_scheduled),
    );
    QueryKey {
        facets: FacetKey(facets),
        page,
    }
}

fn escape(text: &str) -> String {
    // Serializing a &str cannot fail.
    serde_json::to_string(text).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u128) -> Uuid {
        Uuid::from_u128(n)
    }

    #[test]
    fn equal_selections_built_in_any_order_share_a_key() {
        let a = FilterState::new()
            .with_search("stoic")
            .with_author(Facet::Only(id(1)))
            .with_time_range(TimeRange::LastWeek);
        let b = FilterState::new()
            .with_time_range(TimeRange::LastWeek)
            .with_author(Facet::Only(id(1)))
            .with_search("  stoic ");

        assert_eq!(a, b);
        assert_eq!(build_key(&a, 2, 12), build_key(&b, 2, 12));
    }

    #[test]
    fn each_facet_changes_the_key() {
        let base = FilterState::new();
        let base_key = build_key(&base, 1, 12);
        let variants = [
            base.clone().with_search("hope"),
            base.clone().with_author(Facet::Only(id(1))),
            base.clone().with_category(Facet::Only(id(1))),
            base.clone().with_source(Facet::Only(id(1))),
            base.clone().with_time_range(TimeRange::Today),
        ];
        for variant in &variants {
            assert_ne!(build_key(variant, 1, 12), base_key, "{variant:?}");
        }
        // The same id under different facets must not collide.
        assert_ne!(build_key(&variants[1], 1, 12), build_key(&variants[2], 1, 12));
    }

    #[test]
    fn page_changes_the_key_but_not_the_facet_group() {
        let filters = FilterState::new().with_search("hope");
        let one = build_key(&filters, 1, 12);
        let two = build_key(&filters, 2, 12);
        assert_ne!(one, two);
        assert_eq!(one.facets(), two.facets());
    }

    #[test]
    fn scheduled_and_page_size_are_part_of_the_key() {
        let filters = FilterState::new();
        let published = build_key(&filters, 1, 12);
        let preview = build_key_with_options(&filters, 1, 12, FetchOptions::preview());
        assert_ne!(published, preview);
        assert_ne!(published, build_key(&filters, 1, 24));
    }

    #[test]
    fn search_text_cannot_forge_other_fields() {
        let forged = FilterState::new().with_search("x\";author=all");
        let plain = FilterState::new().with_search("x");
        assert_ne!(build_key(&forged, 1, 12), build_key(&plain, 1, 12));
    }

    #[test]
    fn parse_accepts_all_and_rejects_malformed_ids() {
        let parsed = FilterState::parse(Some(" stoic "), Some("all"), None, Some(""), None)
            .expect("valid selection");
        assert!(parsed.search_term() == Some("stoic"));
        assert!(!parsed.author().is_active());

        let err = FilterState::parse(None, Some("not-a-uuid"), None, None, None).unwrap_err();
        assert_eq!(
            err,
            QueryError::MalformedId {
                facet: "author",
                value: "not-a-uuid".to_string()
            }
        );
        assert!(matches!(
            FilterState::parse(None, None, None, None, Some("fortnight")),
            Err(QueryError::UnknownTimeRange(_))
        ));
    }

    #[test]
    fn empty_selection_is_unfiltered() {
        assert!(FilterState::new().is_unfiltered());
        assert!(FilterState::new().with_search("   ").is_unfiltered());
        assert!(!FilterState::new().with_time_range(TimeRange::LastYear).is_unfiltered());
    }
}
