//! Catalog domain model built from upstream payloads.

mod item;

pub use item::{AuthorRef, LibraryItem, MediaKind, SeriesRef, ebook_format, ebook_mime_type};

use crate::error::{AppError, Result};
use crate::upstream::models::{
    AbsAuthor, AbsCollection, AbsItem, AbsLibrary, AbsSeries, SearchResponse,
};
use serde::Serialize;
use std::cmp::Ordering;

/// A library.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Library {
    /// Library id.
    pub id: String,
    /// Display name.
    pub name: String,
    /// `book` or `podcast`.
    pub media_type: String,
}

impl From<&AbsLibrary> for Library {
    fn from(library: &AbsLibrary) -> Self {
        Self {
            id: library.id.clone(),
            name: library.name.clone(),
            media_type: library.media_type.clone(),
        }
    }
}

/// A series, author or collection rendered as a navigation entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Container {
    /// Container id.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Number of listed items inside.
    pub count: usize,
    /// Item whose cover represents the container.
    pub cover_item: Option<String>,
}

/// Browse order for item feeds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ItemSort {
    /// Case-insensitive title.
    #[default]
    Title,
    /// Date added to the library.
    Added,
}

impl ItemSort {
    /// Parse the `sort` query parameter.
    pub fn parse(raw: Option<&str>) -> Result<Self> {
        match raw.map(str::trim).unwrap_or("") {
            "" | "title" => Ok(ItemSort::Title),
            "added" | "addedAt" | "recent" => Ok(ItemSort::Added),
            other => Err(AppError::BadRequest(format!("unknown sort order '{other}'"))),
        }
    }
}

/// An ordered search result row.
#[derive(Debug, Clone, PartialEq)]
pub enum SearchHit {
    /// Matching item.
    Item(LibraryItem),
    /// Matching series.
    Series(Container),
    /// Matching author.
    Author(Container),
}

/// Convert upstream items, keeping only what the catalog lists.
pub fn catalog_items(items: &[AbsItem], include_audio: bool) -> Vec<LibraryItem> {
    items
        .iter()
        .filter_map(LibraryItem::from_abs)
        .filter(|item| include_audio || item.is_ebook())
        .collect()
}

/// Sort items in place.
pub fn sort_items(items: &mut [LibraryItem], sort: ItemSort, desc: bool) {
    match sort {
        ItemSort::Title => items.sort_by_cached_key(|item| item.title.to_lowercase()),
        ItemSort::Added => items.sort_by_key(|item| item.added_at),
    }
    if desc {
        items.reverse();
    }
}

/// Most recently added first.
pub fn recent_items(mut items: Vec<LibraryItem>) -> Vec<LibraryItem> {
    sort_items(&mut items, ItemSort::Added, true);
    items
}

/// Sort by series position, unnumbered entries last by title.
pub fn sort_by_sequence(items: &mut [LibraryItem]) {
    items.sort_by(|a, b| match (a.series_position(), b.series_position()) {
        (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => a.title.to_lowercase().cmp(&b.title.to_lowercase()),
    });
}

/// Items belonging to a series, in reading order.
pub fn items_in_series(items: &[LibraryItem], series_id: &str, series_name: &str) -> Vec<LibraryItem> {
    let mut matching: Vec<LibraryItem> = items
        .iter()
        .filter(|item| item.in_series(series_id, series_name))
        .cloned()
        .collect();
    sort_by_sequence(&mut matching);
    matching
}

/// Items written by an author, by title.
pub fn items_by_author(items: &[LibraryItem], author_id: &str, author_name: &str) -> Vec<LibraryItem> {
    let mut matching: Vec<LibraryItem> = items
        .iter()
        .filter(|item| item.has_author(author_id, author_name))
        .cloned()
        .collect();
    sort_items(&mut matching, ItemSort::Title, false);
    matching
}

/// Series that contain at least one listed item, by name.
pub fn series_containers(series: &[AbsSeries], items: &[LibraryItem]) -> Vec<Container> {
    let mut containers: Vec<Container> = series
        .iter()
        .filter_map(|s| {
            let members = items_in_series(items, &s.id, &s.name);
            let first = members.first()?;
            Some(Container {
                id: s.id.clone(),
                name: s.name.clone(),
                count: members.len(),
                cover_item: Some(first.id.clone()),
            })
        })
        .collect();
    containers.sort_by_cached_key(|c| c.name.to_lowercase());
    containers
}

/// Authors with at least one listed item, by name.
pub fn author_containers(authors: &[AbsAuthor], items: &[LibraryItem]) -> Vec<Container> {
    let mut containers: Vec<Container> = authors
        .iter()
        .filter_map(|a| {
            let written = items_by_author(items, &a.id, &a.name);
            let first = written.first()?;
            Some(Container {
                id: a.id.clone(),
                name: a.name.clone(),
                count: written.len(),
                cover_item: Some(first.id.clone()),
            })
        })
        .collect();
    containers.sort_by_cached_key(|c| c.name.to_lowercase());
    containers
}

/// Collections with at least one listed item, by name.
pub fn collection_containers(collections: &[AbsCollection], include_audio: bool) -> Vec<Container> {
    let mut containers: Vec<Container> = collections
        .iter()
        .filter_map(|c| {
            let books = catalog_items(&c.books, include_audio);
            let first = books.first()?;
            Some(Container {
                id: c.id.clone(),
                name: c.name.clone(),
                count: books.len(),
                cover_item: Some(first.id.clone()),
            })
        })
        .collect();
    containers.sort_by_cached_key(|c| c.name.to_lowercase());
    containers
}

/// Flatten a search response into items, then series, then authors.
///
/// Series and author counts come from `library_items` so they agree with the
/// browse feeds.
pub fn search_hits(
    response: &SearchResponse,
    library_items: &[LibraryItem],
    include_audio: bool,
) -> Vec<SearchHit> {
    let mut hits = Vec::new();

    let matched: Vec<AbsItem> = response
        .book
        .iter()
        .filter_map(|b| b.library_item.clone())
        .collect();
    hits.extend(
        catalog_items(&matched, include_audio)
            .into_iter()
            .map(SearchHit::Item),
    );

    for found in &response.series {
        let id = found.series.id.clone().unwrap_or_default();
        let members = items_in_series(library_items, &id, &found.series.name);
        if let Some(first) = members.first() {
            hits.push(SearchHit::Series(Container {
                id,
                name: found.series.name.clone(),
                count: members.len(),
                cover_item: Some(first.id.clone()),
            }));
        }
    }

    for author in &response.authors {
        let written = items_by_author(library_items, &author.id, &author.name);
        if let Some(first) = written.first() {
            hits.push(SearchHit::Author(Container {
                id: author.id.clone(),
                name: author.name.clone(),
                count: written.len(),
                cover_item: Some(first.id.clone()),
            }));
        }
    }

    hits
}
