//! Audiobookshelf API client.
//!
//! Every call carries the session's upstream token as a bearer token.
//! Network failures and 5xx responses are retried with exponential backoff;
//! 4xx responses are not. JSON listings and item detail are cached in the
//! catalog namespace, keyed by endpoint, sorted query and subject.

pub mod models;

use crate::auth::Session;
use crate::cache::{Cache, Namespace};
use crate::config::{Config, UpstreamConfig};
use crate::error::{AppError, Result};
use models::{
    AbsAuthor, AbsCollection, AbsItem, AbsLibrary, AbsSeries, AbsUser, AuthorsResponse,
    LibrariesResponse, LoginResponse, ResultsResponse, SearchResponse,
};
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;

/// Items requested per library listing.
const ITEMS_LIMIT: &str = "10000";

/// Entries requested per search, series or author listing.
const LISTING_LIMIT: &str = "2000";

/// TTL class of a cached endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointClass {
    /// Library, series, author and collection listings.
    Listing,
    /// Search results.
    Search,
    /// Single item detail.
    Item,
}

/// Catalog cache key for a request.
pub fn catalog_key(path: &str, query: &[(&str, String)], subject: &str) -> String {
    let mut params: Vec<_> = query.iter().collect();
    params.sort();

    let mut hasher = Sha256::new();
    hasher.update(path.as_bytes());
    hasher.update([0]);
    for (name, value) in params {
        hasher.update(name.as_bytes());
        hasher.update(b"=");
        hasher.update(value.as_bytes());
        hasher.update(b"&");
    }
    hasher.update([0]);
    hasher.update(subject.as_bytes());
    hex::encode(hasher.finalize())
}

/// Client for one Audiobookshelf server.
pub struct UpstreamClient {
    http: reqwest::Client,
    base_url: String,
    settings: UpstreamConfig,
    cache: Arc<Cache>,
    listing_ttl: Duration,
    search_ttl: Duration,
    item_ttl: Duration,
}

impl UpstreamClient {
    /// Create a client from configuration.
    pub fn new(config: &Config, cache: Arc<Cache>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(config.upstream.timeout())
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| AppError::Internal(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url: config.upstream.base_url().to_string(),
            settings: config.upstream.clone(),
            cache,
            listing_ttl: Duration::from_secs(config.cache.catalog_ttl_secs),
            search_ttl: Duration::from_secs(config.cache.search_ttl_secs),
            item_ttl: Duration::from_secs(config.cache.item_ttl_secs),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn ttl(&self, class: EndpointClass) -> Duration {
        match class {
            EndpointClass::Listing => self.listing_ttl,
            EndpointClass::Search => self.search_ttl,
            EndpointClass::Item => self.item_ttl,
        }
    }

    /// Send a request with retries.
    ///
    /// `fingerprint` names the session to evict from the auth cache when the
    /// upstream rejects the token.
    async fn send<F>(&self, path: &str, fingerprint: Option<&str>, build: F) -> Result<reqwest::Response>
    where
        F: Fn(&reqwest::Client) -> RequestBuilder,
    {
        let mut attempt: u32 = 0;

        loop {
            let failure = match build(&self.http).send().await {
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response) => {
                    let status = response.status();
                    match status {
                        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                            if fingerprint.is_some_and(|fp| self.cache.invalidate(Namespace::Auth, fp)) {
                                tracing::info!(path = %path, "Upstream rejected token, session evicted");
                            }
                            return Err(AppError::Unauthorized(format!(
                                "upstream rejected credentials ({})",
                                status.as_u16()
                            )));
                        }
                        StatusCode::NOT_FOUND => {
                            return Err(AppError::NotFound(path.to_string()));
                        }
                        s if s.is_server_error() => format!("{} returned {}", path, s.as_u16()),
                        s => {
                            return Err(AppError::UpstreamUnavailable(format!(
                                "{} returned {}",
                                path,
                                s.as_u16()
                            )));
                        }
                    }
                }
                Err(e) => format!("{}: {}", path, e),
            };

            if attempt >= self.settings.retries {
                return Err(AppError::UpstreamUnavailable(failure));
            }

            let delay = self.settings.backoff(attempt);
            tracing::warn!(
                attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                error = %failure,
                "Upstream request failed, retrying"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    async fn fetch_json<T: DeserializeOwned>(
        &self,
        session: &Session,
        path: &str,
        query: &[(&str, String)],
        class: EndpointClass,
    ) -> Result<T> {
        let key = catalog_key(path, query, &session.subject);
        if let Some(cached) = self.cache.get_as::<T>(Namespace::Catalog, &key) {
            tracing::debug!(path = %path, "Catalog cache hit");
            return Ok(cached);
        }

        let url = self.url(path);
        let response = self
            .send(path, Some(&session.fingerprint), |http| {
                http.get(&url)
                    .bearer_auth(&session.upstream_token)
                    .query(query)
                    .timeout(self.settings.timeout())
            })
            .await?;

        let value: serde_json::Value = response
            .json()
            .await
            .map_err(|e| AppError::UpstreamUnavailable(format!("{}: {}", path, e)))?;
        let decoded = serde_json::from_value::<T>(value.clone())
            .map_err(|e| AppError::UpstreamUnavailable(format!("{}: unexpected payload: {}", path, e)))?;

        self.cache.set(Namespace::Catalog, &key, value, self.ttl(class));
        Ok(decoded)
    }

    /// Libraries visible to the session.
    pub async fn libraries(&self, session: &Session) -> Result<Vec<AbsLibrary>> {
        let response: LibrariesResponse = self
            .fetch_json(session, "/api/libraries", &[], EndpointClass::Listing)
            .await?;
        Ok(response.libraries)
    }

    /// Every item of a library with expanded media.
    pub async fn library_items(&self, session: &Session, library_id: &str) -> Result<Vec<AbsItem>> {
        let path = format!("/api/libraries/{}/items", encode(library_id));
        let query = [("limit", ITEMS_LIMIT.to_string()), ("expand", "media".to_string())];
        let response: ResultsResponse<AbsItem> = self
            .fetch_json(session, &path, &query, EndpointClass::Listing)
            .await?;
        Ok(response.results)
    }

    /// Item detail including its files.
    pub async fn item(&self, session: &Session, item_id: &str) -> Result<AbsItem> {
        let path = format!("/api/items/{}", encode(item_id));
        self.fetch_json(session, &path, &[], EndpointClass::Item).await
    }

    /// Search a library.
    pub async fn search(&self, session: &Session, library_id: &str, query: &str) -> Result<SearchResponse> {
        let path = format!("/api/libraries/{}/search", encode(library_id));
        let params = [("q", query.to_string()), ("limit", LISTING_LIMIT.to_string())];
        self.fetch_json(session, &path, &params, EndpointClass::Search).await
    }

    /// Series of a library.
    pub async fn series(&self, session: &Session, library_id: &str) -> Result<Vec<AbsSeries>> {
        let path = format!("/api/libraries/{}/series", encode(library_id));
        let query = [("limit", LISTING_LIMIT.to_string()), ("sort", "name".to_string())];
        let response: ResultsResponse<AbsSeries> = self
            .fetch_json(session, &path, &query, EndpointClass::Listing)
            .await?;
        Ok(response.results)
    }

    /// Collections of a library.
    pub async fn collections(&self, session: &Session, library_id: &str) -> Result<Vec<AbsCollection>> {
        let path = format!("/api/libraries/{}/collections", encode(library_id));
        let response: ResultsResponse<AbsCollection> = self
            .fetch_json(session, &path, &[], EndpointClass::Listing)
            .await?;
        Ok(response.results)
    }

    /// One collection with its items.
    pub async fn collection(&self, session: &Session, collection_id: &str) -> Result<AbsCollection> {
        let path = format!("/api/collections/{}", encode(collection_id));
        self.fetch_json(session, &path, &[], EndpointClass::Listing).await
    }

    /// Authors of a library.
    pub async fn authors(&self, session: &Session, library_id: &str) -> Result<Vec<AbsAuthor>> {
        let path = format!("/api/libraries/{}/authors", encode(library_id));
        let query = [("limit", LISTING_LIMIT.to_string()), ("sort", "name".to_string())];
        let response: AuthorsResponse = self
            .fetch_json(session, &path, &query, EndpointClass::Listing)
            .await?;
        Ok(response.authors)
    }

    /// Identity owning `token`. Never cached.
    pub async fn me(&self, token: &str) -> Result<AbsUser> {
        let url = self.url("/api/me");
        let response = self
            .send("/api/me", None, |http| {
                http.get(&url).bearer_auth(token).timeout(self.settings.timeout())
            })
            .await?;

        response
            .json()
            .await
            .map_err(|e| AppError::Unauthorized(format!("unusable identity response: {}", e)))
    }

    /// Exchange a username and password for a user token. Never cached.
    pub async fn login(&self, username: &str, password: &str) -> Result<AbsUser> {
        let url = self.url("/login");
        let body = serde_json::json!({ "username": username, "password": password });
        let response = self
            .send("/login", None, |http| {
                http.post(&url).json(&body).timeout(self.settings.timeout())
            })
            .await?;

        let login: LoginResponse = response
            .json()
            .await
            .map_err(|e| AppError::Unauthorized(format!("unusable login response: {}", e)))?;
        Ok(login.user)
    }

    /// Stream a file of an item.
    pub async fn download(&self, session: &Session, item_id: &str, ino: &str) -> Result<reqwest::Response> {
        let path = format!("/api/items/{}/file/{}/download", encode(item_id), encode(ino));
        self.stream(session, &path, &[]).await
    }

    /// Stream the cover of an item as JPEG.
    pub async fn cover(&self, session: &Session, item_id: &str) -> Result<reqwest::Response> {
        let path = format!("/api/items/{}/cover", encode(item_id));
        self.stream(session, &path, &[("format", "jpeg".to_string())]).await
    }

    async fn stream(&self, session: &Session, path: &str, query: &[(&str, String)]) -> Result<reqwest::Response> {
        let url = self.url(path);
        self.send(path, Some(&session.fingerprint), |http| {
            http.request(Method::GET, &url)
                .bearer_auth(&session.upstream_token)
                .query(query)
        })
        .await
    }
}

fn encode(segment: &str) -> String {
    urlencoding::encode(segment).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_key_ignores_parameter_order() {
        let a = catalog_key("/api/x", &[("a", "1".into()), ("b", "2".into())], "alice");
        let b = catalog_key("/api/x", &[("b", "2".into()), ("a", "1".into())], "alice");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn catalog_key_depends_on_subject_and_path() {
        let base = catalog_key("/api/x", &[], "alice");
        assert_ne!(base, catalog_key("/api/x", &[], "bob"));
        assert_ne!(base, catalog_key("/api/y", &[], "alice"));
    }

    #[test]
    fn path_segments_are_encoded() {
        assert_eq!(encode("a b/c"), "a%20b%2Fc");
    }
}
