//! Human-readable description of an active filter combination.

use crate::{filters::FilterState, models::ContentItem};

/// Notice shown when a search matched nothing.
pub const NO_RESULTS_NOTICE: &str =
    "No quotes found matching your search criteria. Try adjusting your filters or search terms.";

/// ResolvedNames
///
/// Display names for the facets pinned to an identifier. A missing name makes the
/// summary fall back to the identifier itself.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedNames {
    pub author: Option<String>,
    pub category: Option<String>,
    pub source: Option<String>,
}

impl ResolvedNames {
    /// Takes the names from the joined fields of the first result item. When a facet is
    /// active every item carries the same value for it, so the first item is enough.
    pub fn from_items(items: &[ContentItem]) -> Self {
        let Some(first) = items.first() else {
            return Self::default();
        };
        Self {
            author: first.author_name.clone(),
            category: first.category_name.clone(),
            source: first.source_title.clone(),
        }
    }
}

/// summarize
///
/// `None` when nothing is filtered. Otherwise `Found N quote(s)` followed by one clause
/// per active facet, always in the order: text, author, category, source, time range.
pub fn summarize(filters: &FilterState, total_count: u64, names: &ResolvedNames) -> Option<String> {
    if filters.is_unfiltered() {
        return None;
    }

    let mut clauses = Vec::with_capacity(5);
    if let Some(term) = filters.search_term() {
        clauses.push(format!("containing \"{term}\""));
    }
    if let Some(id) = filters.author().id() {
        let name = names.author.clone().unwrap_or_else(|| id.to_string());
        clauses.push(format!("by {name}"));
    }
    if let Some(id) = filters.category().id() {
        let name = names.category.clone().unwrap_or_else(|| id.to_string());
        clauses.push(format!("in category \"{name}\""));
    }
    if let Some(id) = filters.source().id() {
        let name = names.source.clone().unwrap_or_else(|| id.to_string());
        clauses.push(format!("from source \"{name}\""));
    }
    if filters.time_range().is_active() {
        clauses.push(format!("from {}", filters.time_range().as_str().replace('_', " ")));
    }

    let plural = if total_count == 1 { "" } else { "s" };
    Some(format!("Found {total_count} quote{plural} {}", clauses.join(" ")))
}

/// The empty-results notice, shown only when a search is active and matched nothing.
pub fn empty_notice(filters: &FilterState, total_count: u64) -> Option<&'static str> {
    (total_count == 0 && filters.search_term().is_some()).then_some(NO_RESULTS_NOTICE)
}
