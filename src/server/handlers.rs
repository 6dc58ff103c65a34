//! HTTP request handlers.

use crate::error::{AppError, Result};
use crate::library::{self, Container, ItemSort, LibraryItem, SearchHit};
use crate::opds::{self, ACQUISITION_TYPE, Entry, FeedBuilder, NAVIGATION_TYPE, OPENSEARCH_TYPE};
use crate::paginate::{self, Page, PageQuery};
use crate::server::AppState;
use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use chrono::Utc;
use serde::Deserialize;

/// Build a response, returning 500 on error (which shouldn't happen).
fn build_response(status: StatusCode, content_type: &str, body: impl Into<Body>) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, content_type)
        .body(body.into())
        .unwrap_or_else(|_| {
            Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .body(Body::from("Internal error"))
                .unwrap_or_default()
        })
}

/// Query parameters accepted by feed routes.
#[derive(Debug, Default, Deserialize)]
pub struct FeedQuery {
    page: Option<String>,
    per_page: Option<String>,
    sort: Option<String>,
    desc: Option<String>,
    q: Option<String>,
}

impl FeedQuery {
    fn page_query(&self) -> PageQuery {
        PageQuery {
            page: self.page.clone(),
            per_page: self.per_page.clone(),
        }
    }

    fn descending(&self) -> Result<bool> {
        match self.desc.as_deref().map(str::trim) {
            None | Some("") | Some("0") | Some("false") | Some("no") => Ok(false),
            Some("1") | Some("true") | Some("yes") => Ok(true),
            Some(other) => Err(AppError::BadRequest(format!("invalid desc value '{other}'"))),
        }
    }

    /// `href` with every non-page parameter carried over.
    fn base_href(&self, href: String) -> String {
        let params: Vec<String> = [
            ("q", &self.q),
            ("per_page", &self.per_page),
            ("sort", &self.sort),
            ("desc", &self.desc),
        ]
        .into_iter()
        .filter_map(|(name, value)| {
            value
                .as_deref()
                .filter(|v| !v.is_empty())
                .map(|v| format!("{}={}", name, urlencoding::encode(v)))
        })
        .collect();

        if params.is_empty() {
            href
        } else {
            format!("{}?{}", href, params.join("&"))
        }
    }
}

/// Self href of a feed page.
fn self_href<T>(page: &Page<T>, base: &str) -> String {
    if page.is_paginated() && page.index > 0 {
        opds::page_href(base, page.index)
    } else {
        base.to_string()
    }
}

/// Feed skeleton shared by everything inside a library.
fn library_feed(state: &AppState, key: &str, title: impl Into<String>, library_id: &str) -> FeedBuilder {
    let hrefs = state.hrefs();
    FeedBuilder::new(key, title)
        .updated(Utc::now())
        .author(state.config.server.title.clone())
        .start_link(hrefs.root())
        .search_link(hrefs.opensearch(library_id))
}

/// Acquisition feed for a page of items.
fn items_response(
    state: &AppState,
    library_id: &str,
    title: impl Into<String>,
    base: &str,
    up: String,
    page: Page<LibraryItem>,
) -> Response {
    let hrefs = state.hrefs();
    let mut feed = library_feed(state, &self_href(&page, base), title, library_id)
        .self_link(self_href(&page, base), ACQUISITION_TYPE)
        .up_link(up)
        .paginate(&page, base, ACQUISITION_TYPE);

    for item in &page.items {
        feed = feed.item_entry(item, hrefs);
    }

    build_response(StatusCode::OK, ACQUISITION_TYPE, feed.build())
}

/// Navigation feed for a page of containers.
fn containers_response(
    state: &AppState,
    library_id: &str,
    kind: &str,
    title: impl Into<String>,
    base: &str,
    page: Page<Container>,
) -> Response {
    let hrefs = state.hrefs();
    let mut feed = library_feed(state, &self_href(&page, base), title, library_id)
        .self_link(self_href(&page, base), NAVIGATION_TYPE)
        .up_link(hrefs.library_nav(library_id))
        .paginate(&page, base, NAVIGATION_TYPE);

    let section = match kind {
        "series" => "series",
        "author" => "authors",
        _ => "collections",
    };
    for container in &page.items {
        let href = hrefs.library(library_id, &format!("{}/{}", section, urlencoding::encode(&container.id)));
        feed = feed.container_entry(kind, container, href, hrefs);
    }

    build_response(StatusCode::OK, NAVIGATION_TYPE, feed.build())
}

// ============================================================================
// SERVICE
// ============================================================================

/// Plain-text service banner.
pub async fn index(State(state): State<AppState>) -> impl IntoResponse {
    let body = format!(
        "{} ({} {})\nOPDS catalog: {}\n",
        state.config.server.title,
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        state.hrefs().root(),
    );
    build_response(StatusCode::OK, "text/plain; charset=utf-8", body)
}

/// Liveness probe.
pub async fn health() -> impl IntoResponse {
    build_response(StatusCode::OK, "text/plain; charset=utf-8", "ok")
}

// ============================================================================
// OPDS CATALOG
// ============================================================================

/// Root feed listing the libraries of the session.
pub async fn catalog_root(State(state): State<AppState>, headers: HeaderMap) -> Result<Response> {
    let session = state.authenticate(&headers).await?;
    let libraries = state.libraries(&session).await?;
    let hrefs = state.hrefs();

    let mut feed = FeedBuilder::new("/opds", &state.config.server.title)
        .updated(Utc::now())
        .author(state.config.server.title.clone())
        .self_link(hrefs.root(), NAVIGATION_TYPE)
        .start_link(hrefs.root());

    for library in &libraries {
        feed = feed.library_entry(library, hrefs);
    }

    Ok(build_response(StatusCode::OK, NAVIGATION_TYPE, feed.build()))
}

/// Navigation menu of a library.
pub async fn library_nav(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(library_id): Path<String>,
) -> Result<Response> {
    let session = state.authenticate(&headers).await?;
    let library = state.library(&session, &library_id).await?;
    let hrefs = state.hrefs();
    let now = Utc::now();

    let base = hrefs.library_nav(&library_id);
    let mut feed = library_feed(&state, &base, &library.name, &library_id)
        .updated(now)
        .self_link(base.clone(), NAVIGATION_TYPE)
        .up_link(hrefs.root());

    let menu = [
        ("", "All items", "Every item, by title", ACQUISITION_TYPE),
        ("recent", "Recently added", "Newest items first", ACQUISITION_TYPE),
        ("series", "Series", "Browse by series", NAVIGATION_TYPE),
        ("collections", "Collections", "Browse by collection", NAVIGATION_TYPE),
        ("authors", "Authors", "Browse by author", NAVIGATION_TYPE),
    ];
    for (rest, title, summary, kind) in menu {
        feed = feed.navigation_entry(Entry::navigation(
            &format!("{}#{}", base, rest),
            title,
            Some(summary.to_string()),
            hrefs.library(&library_id, rest),
            kind,
            now,
        ));
    }

    Ok(build_response(StatusCode::OK, NAVIGATION_TYPE, feed.build()))
}

/// Items of a library.
pub async fn library_items(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(library_id): Path<String>,
    Query(query): Query<FeedQuery>,
) -> Result<Response> {
    let session = state.authenticate(&headers).await?;
    let request = state.page_request(&query.page_query())?;
    let sort = ItemSort::parse(query.sort.as_deref())?;
    let desc = query.descending()?;

    let library = state.library(&session, &library_id).await?;
    let mut items = state.items(&session, &library_id).await?;
    library::sort_items(&mut items, sort, desc);

    let hrefs = state.hrefs();
    let base = query.base_href(hrefs.library(&library_id, ""));
    let page = paginate::paginate(items, request);
    Ok(items_response(&state, &library_id, library.name, &base, hrefs.library_nav(&library_id), page))
}

/// Recently added items.
pub async fn library_recent(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(library_id): Path<String>,
    Query(query): Query<FeedQuery>,
) -> Result<Response> {
    let session = state.authenticate(&headers).await?;
    let request = state.page_request(&query.page_query())?;
    let library = state.library(&session, &library_id).await?;
    let items = library::recent_items(state.items(&session, &library_id).await?);

    let hrefs = state.hrefs();
    let base = query.base_href(hrefs.library(&library_id, "recent"));
    let page = paginate::paginate(items, request);
    let title = format!("{}: recently added", library.name);
    Ok(items_response(&state, &library_id, title, &base, hrefs.library_nav(&library_id), page))
}

/// Search within a library.
pub async fn library_search(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(library_id): Path<String>,
    Query(query): Query<FeedQuery>,
) -> Result<Response> {
    let session = state.authenticate(&headers).await?;
    let request = state.page_request(&query.page_query())?;
    let terms = query.q.as_deref().map(str::trim).unwrap_or_default();

    let hits = if terms.is_empty() {
        Vec::new()
    } else {
        let response = state.upstream.search(&session, &library_id, terms).await?;
        let items = state.items(&session, &library_id).await?;
        library::search_hits(&response, &items, state.config.opds.include_audio)
    };

    let hrefs = state.hrefs();
    let base = query.base_href(hrefs.library(&library_id, "search"));
    let page = paginate::paginate(hits, request);

    let mut feed = library_feed(&state, &self_href(&page, &base), format!("Search results for: {}", terms), &library_id)
        .self_link(self_href(&page, &base), ACQUISITION_TYPE)
        .up_link(hrefs.library_nav(&library_id))
        .paginate(&page, &base, ACQUISITION_TYPE);

    for hit in &page.items {
        feed = match hit {
            SearchHit::Item(item) => feed.item_entry(item, hrefs),
            SearchHit::Series(series) => {
                let href = hrefs.library(&library_id, &format!("series/{}", urlencoding::encode(&series.id)));
                feed.container_entry("series", series, href, hrefs)
            }
            SearchHit::Author(author) => {
                let href = hrefs.library(&library_id, &format!("authors/{}", urlencoding::encode(&author.id)));
                feed.container_entry("author", author, href, hrefs)
            }
        };
    }

    Ok(build_response(StatusCode::OK, ACQUISITION_TYPE, feed.build()))
}

/// OpenSearch description of a library.
pub async fn opensearch(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(library_id): Path<String>,
) -> Result<Response> {
    let session = state.authenticate(&headers).await?;
    let library = state.library(&session, &library_id).await?;
    let search = state.hrefs().library(&library_id, "search");
    let xml = opds::generate_opensearch(&state.config.server.title, &library.name, &search);
    Ok(build_response(StatusCode::OK, OPENSEARCH_TYPE, xml))
}

// ============================================================================
// SERIES, COLLECTIONS, AUTHORS
// ============================================================================

/// Series of a library.
pub async fn series_list(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(library_id): Path<String>,
    Query(query): Query<FeedQuery>,
) -> Result<Response> {
    let session = state.authenticate(&headers).await?;
    let request = state.page_request(&query.page_query())?;
    let library = state.library(&session, &library_id).await?;
    let series = state.upstream.series(&session, &library_id).await?;
    let items = state.items(&session, &library_id).await?;

    let base = query.base_href(state.hrefs().library(&library_id, "series"));
    let page = paginate::paginate(library::series_containers(&series, &items), request);
    let title = format!("{}: series", library.name);
    Ok(containers_response(&state, &library_id, "series", title, &base, page))
}

/// Items of one series, in reading order.
pub async fn series_items(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((library_id, series_id)): Path<(String, String)>,
    Query(query): Query<FeedQuery>,
) -> Result<Response> {
    let session = state.authenticate(&headers).await?;
    let request = state.page_request(&query.page_query())?;
    let series = state
        .upstream
        .series(&session, &library_id)
        .await?
        .into_iter()
        .find(|s| s.id == series_id)
        .ok_or_else(|| AppError::NotFound(format!("Series not found: {}", series_id)))?;
    let items = state.items(&session, &library_id).await?;

    let hrefs = state.hrefs();
    let members = library::items_in_series(&items, &series.id, &series.name);
    let base = query.base_href(hrefs.library(&library_id, &format!("series/{}", urlencoding::encode(&series_id))));
    let page = paginate::paginate(members, request);
    Ok(items_response(&state, &library_id, series.name, &base, hrefs.library(&library_id, "series"), page))
}

/// Collections of a library.
pub async fn collections_list(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(library_id): Path<String>,
    Query(query): Query<FeedQuery>,
) -> Result<Response> {
    let session = state.authenticate(&headers).await?;
    let request = state.page_request(&query.page_query())?;
    let library = state.library(&session, &library_id).await?;
    let collections = state.upstream.collections(&session, &library_id).await?;

    let containers = library::collection_containers(&collections, state.config.opds.include_audio);
    let base = query.base_href(state.hrefs().library(&library_id, "collections"));
    let page = paginate::paginate(containers, request);
    let title = format!("{}: collections", library.name);
    Ok(containers_response(&state, &library_id, "collection", title, &base, page))
}

/// Items of one collection, in collection order.
pub async fn collection_items(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((library_id, collection_id)): Path<(String, String)>,
    Query(query): Query<FeedQuery>,
) -> Result<Response> {
    let session = state.authenticate(&headers).await?;
    let request = state.page_request(&query.page_query())?;
    let collection = state.upstream.collection(&session, &collection_id).await?;
    if collection.library_id.as_deref().is_some_and(|id| id != library_id) {
        return Err(AppError::NotFound(format!("Collection not found: {}", collection_id)));
    }

    let hrefs = state.hrefs();
    let items = state.listed(&collection.books);
    let base = query.base_href(hrefs.library(&library_id, &format!("collections/{}", urlencoding::encode(&collection_id))));
    let page = paginate::paginate(items, request);
    Ok(items_response(&state, &library_id, collection.name, &base, hrefs.library(&library_id, "collections"), page))
}

/// Authors of a library.
pub async fn authors_list(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(library_id): Path<String>,
    Query(query): Query<FeedQuery>,
) -> Result<Response> {
    let session = state.authenticate(&headers).await?;
    let request = state.page_request(&query.page_query())?;
    let library = state.library(&session, &library_id).await?;
    let authors = state.upstream.authors(&session, &library_id).await?;
    let items = state.items(&session, &library_id).await?;

    let base = query.base_href(state.hrefs().library(&library_id, "authors"));
    let page = paginate::paginate(library::author_containers(&authors, &items), request);
    let title = format!("{}: authors", library.name);
    Ok(containers_response(&state, &library_id, "author", title, &base, page))
}

/// Items written by one author.
pub async fn author_items(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((library_id, author_id)): Path<(String, String)>,
    Query(query): Query<FeedQuery>,
) -> Result<Response> {
    let session = state.authenticate(&headers).await?;
    let request = state.page_request(&query.page_query())?;
    let author = state
        .upstream
        .authors(&session, &library_id)
        .await?
        .into_iter()
        .find(|a| a.id == author_id)
        .ok_or_else(|| AppError::NotFound(format!("Author not found: {}", author_id)))?;
    let items = state.items(&session, &library_id).await?;

    let hrefs = state.hrefs();
    let written = library::items_by_author(&items, &author.id, &author.name);
    let base = query.base_href(hrefs.library(&library_id, &format!("authors/{}", urlencoding::encode(&author_id))));
    let page = paginate::paginate(written, request);
    Ok(items_response(&state, &library_id, author.name, &base, hrefs.library(&library_id, "authors"), page))
}

// ============================================================================
// PROXIED FILES
// ============================================================================

/// Download the file of an item.
pub async fn download(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(item_id): Path<String>,
) -> Result<Response> {
    let session = state.authenticate(&headers).await?;
    let acquisition = state.acquisition(&session, &item_id).await?;
    let upstream = state.upstream.download(&session, &item_id, &acquisition.ino).await?;

    tracing::info!(item = %item_id, subject = %session.subject, "Proxying download");

    let disposition = format!(
        "attachment; filename=\"{}\"",
        acquisition.filename.replace(['"', '\\'], "_")
    );
    proxy_response(upstream, &acquisition.mime_type, Some(disposition))
}

/// Cover image of an item.
pub async fn cover(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(item_id): Path<String>,
) -> Result<Response> {
    let session = state.authenticate(&headers).await?;
    let upstream = state.upstream.cover(&session, &item_id).await?;
    let mut response = proxy_response(upstream, "image/jpeg", None)?;
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("private, max-age=86400"));
    Ok(response)
}

/// Stream an upstream body back to the client.
fn proxy_response(upstream: reqwest::Response, fallback_type: &str, disposition: Option<String>) -> Result<Response> {
    let content_type = upstream
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty() && !v.starts_with("application/octet-stream"))
        .unwrap_or(fallback_type)
        .to_string();
    let content_length = upstream.content_length();

    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type);
    if let Some(length) = content_length {
        builder = builder.header(header::CONTENT_LENGTH, length);
    }
    if let Some(disposition) = disposition {
        builder = builder.header(header::CONTENT_DISPOSITION, disposition);
    }

    builder
        .body(Body::from_stream(upstream.bytes_stream()))
        .map_err(|e| AppError::Internal(format!("Failed to build response: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(pairs: &[(&str, &str)]) -> FeedQuery {
        let mut q = FeedQuery::default();
        for (name, value) in pairs {
            let value = Some(value.to_string());
            match *name {
                "page" => q.page = value,
                "per_page" => q.per_page = value,
                "sort" => q.sort = value,
                "desc" => q.desc = value,
                "q" => q.q = value,
                _ => {}
            }
        }
        q
    }

    #[test]
    fn base_href_keeps_everything_but_page() {
        let q = query(&[("page", "2"), ("per_page", "10"), ("q", "dune messiah")]);
        assert_eq!(q.base_href("/opds/L1/search".into()), "/opds/L1/search?q=dune%20messiah&per_page=10");
    }

    #[test]
    fn base_href_without_parameters_is_unchanged() {
        assert_eq!(FeedQuery::default().base_href("/opds/L1".into()), "/opds/L1");
    }

    #[test]
    fn desc_flag_parsing() {
        assert!(!query(&[]).descending().unwrap());
        assert!(query(&[("desc", "true")]).descending().unwrap());
        assert!(query(&[("desc", "sideways")]).descending().is_err());
    }
}
