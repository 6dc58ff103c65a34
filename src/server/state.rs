//! Application state shared across handlers.

use crate::auth::{AuthResolver, Session};
use crate::cache::Cache;
use crate::config::Config;
use crate::error::{AppError, Result};
use crate::library::{self, Library, LibraryItem};
use crate::opds::Hrefs;
use crate::paginate::{PageQuery, PageRequest};
use crate::upstream::UpstreamClient;
use crate::upstream::models::AbsItem;
use axum::http::{HeaderMap, header};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// File served by the download route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Acquisition {
    /// Inode of the file upstream.
    pub ino: String,
    /// MIME type announced to the client.
    pub mime_type: String,
    /// File name for `Content-Disposition`.
    pub filename: String,
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration.
    pub config: Arc<Config>,
    /// Session and catalog cache.
    pub cache: Arc<Cache>,
    /// Audiobookshelf client.
    pub upstream: Arc<UpstreamClient>,
    /// Credential resolver.
    pub auth: Arc<AuthResolver>,
    hrefs: Hrefs,
}

impl AppState {
    /// Create state with the cache selected by configuration.
    pub fn new(config: Config) -> Result<Self> {
        let cache = Cache::from_config(&config)?;
        Self::with_cache(config, cache)
    }

    /// Create state around an existing cache.
    pub fn with_cache(config: Config, cache: Cache) -> Result<Self> {
        let cache = Arc::new(cache);
        let upstream = Arc::new(UpstreamClient::new(&config, cache.clone())?);
        let auth = Arc::new(AuthResolver::new(&config, cache.clone(), upstream.clone()));
        let hrefs = Hrefs::new(&config.server.public_url);

        Ok(Self {
            config: Arc::new(config),
            cache,
            upstream,
            auth,
            hrefs,
        })
    }

    /// Link builder for feeds.
    pub fn hrefs(&self) -> &Hrefs {
        &self.hrefs
    }

    /// Resolve the session of a request.
    pub async fn authenticate(&self, headers: &HeaderMap) -> Result<Session> {
        let header = match headers.get(header::AUTHORIZATION) {
            Some(value) => Some(value.to_str().map_err(|_| {
                AppError::Unauthorized("authorization header is not valid text".to_string())
            })?),
            None => None,
        };
        self.auth.authenticate(header).await
    }

    /// Validate pagination parameters against configuration.
    pub fn page_request(&self, query: &PageQuery) -> Result<PageRequest> {
        PageRequest::from_query(
            query,
            self.config.opds.items_per_page,
            self.config.opds.max_per_page,
        )
    }

    /// Libraries visible to the session.
    pub async fn libraries(&self, session: &Session) -> Result<Vec<Library>> {
        let libraries = self.upstream.libraries(session).await?;
        Ok(libraries.iter().map(Library::from).collect())
    }

    /// One library by id.
    pub async fn library(&self, session: &Session, library_id: &str) -> Result<Library> {
        self.libraries(session)
            .await?
            .into_iter()
            .find(|l| l.id == library_id)
            .ok_or_else(|| AppError::NotFound(format!("Library not found: {}", library_id)))
    }

    /// Listed items of a library, in upstream order.
    pub async fn items(&self, session: &Session, library_id: &str) -> Result<Vec<LibraryItem>> {
        let items = self.upstream.library_items(session, library_id).await?;
        Ok(self.listed(&items))
    }

    /// Convert and filter upstream items for listing.
    pub fn listed(&self, items: &[AbsItem]) -> Vec<LibraryItem> {
        library::catalog_items(items, self.config.opds.include_audio)
    }

    /// File to serve for an item.
    pub async fn acquisition(&self, session: &Session, item_id: &str) -> Result<Acquisition> {
        let item = self.upstream.item(session, item_id).await?;
        select_acquisition(&item, self.config.opds.include_audio)
            .ok_or_else(|| AppError::NotFound(format!("No downloadable file for item {}", item_id)))
    }

    /// Start the periodic cache sweep.
    pub fn spawn_sweeper(&self) -> Option<JoinHandle<()>> {
        let secs = self.config.cache.sweep_interval_secs;
        if secs == 0 {
            return None;
        }

        let cache = self.cache.clone();
        Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(secs));
            interval.tick().await;
            loop {
                interval.tick().await;
                let removed = cache.sweep();
                if removed > 0 {
                    tracing::debug!(removed, "Swept expired cache entries");
                }
            }
        }))
    }
}

/// Pick the file of an item detail payload to serve.
fn select_acquisition(item: &AbsItem, include_audio: bool) -> Option<Acquisition> {
    if let Some(format) = library::ebook_format(item) {
        let file = item.media.ebook_file.as_ref();
        let ino = file.and_then(|f| f.ino.clone()).or_else(|| {
            item.library_files
                .iter()
                .find(|f| f.file_type.contains("ebook"))
                .and_then(|f| f.ino.clone())
        })?;

        let filename = file
            .map(|f| f.metadata.filename.clone())
            .filter(|n| !n.is_empty())
            .or_else(|| {
                item.library_files
                    .iter()
                    .find(|f| f.ino.as_deref() == Some(ino.as_str()))
                    .map(|f| f.metadata.filename.clone())
                    .filter(|n| !n.is_empty())
            })
            .unwrap_or_else(|| format!("{}.{}", item.id, format));

        return Some(Acquisition {
            ino,
            mime_type: library::ebook_mime_type(&format).to_string(),
            filename,
        });
    }

    if !include_audio {
        return None;
    }

    let track = item.media.audio_files.first()?;
    Some(Acquisition {
        ino: track.ino.clone()?,
        mime_type: track
            .mime_type
            .clone()
            .unwrap_or_else(|| "audio/mpeg".to_string()),
        filename: if track.metadata.filename.is_empty() {
            item.id.clone()
        } else {
            track.metadata.filename.clone()
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn item(value: serde_json::Value) -> AbsItem {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn acquisition_prefers_ebook_file() {
        let detail = item(json!({
            "id": "li_1",
            "media": {
                "ebookFile": {"ino": "11", "ebookFormat": "epub", "metadata": {"filename": "dune.epub"}},
                "audioFiles": [{"ino": "12"}]
            }
        }));

        let acquisition = select_acquisition(&detail, true).unwrap();
        assert_eq!(acquisition.ino, "11");
        assert_eq!(acquisition.filename, "dune.epub");
        assert_eq!(acquisition.mime_type, "application/epub+zip");
    }

    #[test]
    fn acquisition_falls_back_to_library_files() {
        let detail = item(json!({
            "id": "li_2",
            "media": {"ebookFormat": "pdf"},
            "libraryFiles": [
                {"ino": "20", "fileType": "image", "metadata": {"filename": "cover.jpg"}},
                {"ino": "21", "fileType": "ebook", "metadata": {"filename": "book.pdf"}}
            ]
        }));

        let acquisition = select_acquisition(&detail, false).unwrap();
        assert_eq!(acquisition.ino, "21");
        assert_eq!(acquisition.filename, "book.pdf");
    }

    #[test]
    fn audio_requires_opt_in() {
        let detail = item(json!({
            "id": "li_3",
            "media": {"audioFiles": [{"ino": "30", "mimeType": "audio/mp4", "metadata": {"filename": "a.m4b"}}]}
        }));

        assert!(select_acquisition(&detail, false).is_none());
        assert_eq!(select_acquisition(&detail, true).unwrap().mime_type, "audio/mp4");
    }
}
