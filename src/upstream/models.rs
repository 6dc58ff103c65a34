//! Audiobookshelf API payloads.
//!
//! Only the fields the catalog renders are modelled. Everything is lenient:
//! missing fields default, and numeric fields that the server sometimes
//! sends as strings (or the reverse) are accepted either way.

use serde::{Deserialize, Deserializer};

/// `GET /api/libraries`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LibrariesResponse {
    /// Libraries visible to the user.
    #[serde(default)]
    pub libraries: Vec<AbsLibrary>,
}

/// A library.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AbsLibrary {
    /// Library id.
    pub id: String,
    /// Display name.
    pub name: String,
    /// `book` or `podcast`.
    #[serde(default)]
    pub media_type: String,
}

/// Paged list wrapper used by items, series and collections.
#[derive(Debug, Clone, Deserialize)]
pub struct ResultsResponse<T> {
    /// Entries.
    #[serde(default = "Vec::new")]
    pub results: Vec<T>,
}

/// A library item.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AbsItem {
    /// Item id.
    pub id: String,
    /// Owning library.
    pub library_id: Option<String>,
    /// Media block.
    pub media: AbsMedia,
    /// Milliseconds since the epoch.
    #[serde(deserialize_with = "lenient_i64")]
    pub added_at: Option<i64>,
    /// Milliseconds since the epoch.
    #[serde(deserialize_with = "lenient_i64")]
    pub updated_at: Option<i64>,
    /// Total size in bytes.
    #[serde(deserialize_with = "lenient_u64")]
    pub size: Option<u64>,
    /// Files on disk, present on item detail.
    pub library_files: Vec<AbsLibraryFile>,
}

/// Media block of an item.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AbsMedia {
    /// Bibliographic metadata.
    pub metadata: AbsMetadata,
    /// Ebook format in minified payloads.
    pub ebook_format: Option<String>,
    /// Ebook file in expanded payloads.
    pub ebook_file: Option<AbsEbookFile>,
    /// Audio tracks.
    pub audio_files: Vec<AbsAudioFile>,
    /// Track count in minified payloads.
    pub num_audio_files: Option<u32>,
}

/// Bibliographic metadata.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AbsMetadata {
    /// Title.
    pub title: Option<String>,
    /// Subtitle.
    pub subtitle: Option<String>,
    /// Joined author names.
    pub author_name: Option<String>,
    /// Structured authors.
    pub authors: Vec<AbsAuthorRef>,
    /// Joined series name, e.g. `Dune #1`.
    pub series_name: Option<String>,
    /// Structured series, a list or a single object.
    pub series: Option<SeriesField>,
    /// Description, possibly HTML.
    pub description: Option<String>,
    /// Publication year.
    #[serde(deserialize_with = "lenient_string")]
    pub published_year: Option<String>,
    /// Genres.
    pub genres: Vec<String>,
    /// Language.
    pub language: Option<String>,
    /// Publisher.
    pub publisher: Option<String>,
}

/// Author reference inside item metadata.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AbsAuthorRef {
    /// Author id.
    pub id: Option<String>,
    /// Author name.
    pub name: String,
}

/// Series reference inside item metadata.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AbsSeriesRef {
    /// Series id.
    pub id: Option<String>,
    /// Series name.
    pub name: String,
    /// Position within the series.
    #[serde(deserialize_with = "lenient_string")]
    pub sequence: Option<String>,
}

/// Series metadata shape, which differs between endpoints.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum SeriesField {
    /// Expanded payloads carry a list.
    Many(Vec<AbsSeriesRef>),
    /// Filtered payloads carry a single object.
    One(AbsSeriesRef),
}

impl SeriesField {
    /// First series reference.
    pub fn first(&self) -> Option<&AbsSeriesRef> {
        match self {
            SeriesField::Many(list) => list.first(),
            SeriesField::One(one) => Some(one),
        }
    }
}

/// Ebook file of an item.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AbsEbookFile {
    /// File inode used in download paths.
    #[serde(deserialize_with = "lenient_string")]
    pub ino: Option<String>,
    /// Format, e.g. `epub`.
    pub ebook_format: Option<String>,
    /// File metadata.
    pub metadata: AbsFileMetadata,
}

/// Audio track of an item.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AbsAudioFile {
    /// File inode used in download paths.
    #[serde(deserialize_with = "lenient_string")]
    pub ino: Option<String>,
    /// MIME type reported by the server.
    pub mime_type: Option<String>,
    /// File metadata.
    pub metadata: AbsFileMetadata,
}

/// A file listed on item detail.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AbsLibraryFile {
    /// File inode used in download paths.
    #[serde(deserialize_with = "lenient_string")]
    pub ino: Option<String>,
    /// `ebook`, `audio`, `image`, ...
    pub file_type: String,
    /// File metadata.
    pub metadata: AbsFileMetadata,
}

/// Metadata of a file on disk.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AbsFileMetadata {
    /// File name.
    pub filename: String,
    /// Extension including the dot.
    pub ext: String,
    /// Size in bytes.
    #[serde(deserialize_with = "lenient_u64")]
    pub size: Option<u64>,
}

/// `GET /api/libraries/{id}/series` entry.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AbsSeries {
    /// Series id.
    pub id: String,
    /// Series name.
    pub name: String,
}

/// `GET /api/libraries/{id}/collections` entry and `GET /api/collections/{id}`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AbsCollection {
    /// Collection id.
    pub id: String,
    /// Collection name.
    pub name: String,
    /// Owning library.
    pub library_id: Option<String>,
    /// Items in the collection.
    pub books: Vec<AbsItem>,
}

/// `GET /api/libraries/{id}/authors`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthorsResponse {
    /// Authors of the library.
    #[serde(default)]
    pub authors: Vec<AbsAuthor>,
}

/// An author.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AbsAuthor {
    /// Author id.
    pub id: String,
    /// Author name.
    pub name: String,
}

/// `GET /api/libraries/{id}/search`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SearchResponse {
    /// Matching items.
    pub book: Vec<SearchBook>,
    /// Matching series.
    pub series: Vec<SearchSeries>,
    /// Matching authors.
    pub authors: Vec<AbsAuthor>,
}

/// Item match.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SearchBook {
    /// Matched item.
    pub library_item: Option<AbsItem>,
}

/// Series match.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SearchSeries {
    /// Matched series.
    pub series: AbsSeriesRef,
}

/// `GET /api/me`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AbsUser {
    /// User id.
    pub id: String,
    /// Username.
    pub username: String,
    /// Legacy API token.
    #[serde(default)]
    pub token: Option<String>,
    /// Access token issued at login by newer servers.
    #[serde(default)]
    pub access_token: Option<String>,
}

/// `POST /login`.
#[derive(Debug, Clone, Deserialize)]
pub struct LoginResponse {
    /// Authenticated user.
    pub user: AbsUser,
}

fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) if !s.is_empty() => Some(s),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

fn lenient_i64<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    })
}

fn lenient_u64<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::Number(n) => n.as_u64().or_else(|| n.as_f64().map(|f| f as u64)),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_expanded_item() {
        let item: AbsItem = serde_json::from_value(json!({
            "id": "li_1",
            "libraryId": "lib_1",
            "addedAt": 1700000000000i64,
            "size": "2048",
            "media": {
                "metadata": {
                    "title": "Dune",
                    "authors": [{"id": "au_1", "name": "Frank Herbert"}],
                    "series": [{"id": "se_1", "name": "Dune", "sequence": 1}],
                    "publishedYear": 1965,
                    "genres": ["SF"]
                },
                "ebookFile": {"ino": 42, "ebookFormat": "epub", "metadata": {"filename": "dune.epub", "ext": ".epub"}}
            }
        }))
        .unwrap();

        assert_eq!(item.size, Some(2048));
        assert_eq!(item.media.metadata.published_year.as_deref(), Some("1965"));
        let series = item.media.metadata.series.as_ref().and_then(|s| s.first()).unwrap();
        assert_eq!(series.sequence.as_deref(), Some("1"));
        assert_eq!(item.media.ebook_file.unwrap().ino.as_deref(), Some("42"));
    }

    #[test]
    fn parses_single_series_object() {
        let meta: AbsMetadata = serde_json::from_value(json!({
            "series": {"id": "se_1", "name": "Foundation", "sequence": "2"}
        }))
        .unwrap();

        let series = meta.series.unwrap();
        assert!(matches!(series, SeriesField::One(_)));
        assert_eq!(series.first().map(|s| s.name.as_str()), Some("Foundation"));
    }

    #[test]
    fn tolerates_missing_and_null_fields() {
        let item: AbsItem = serde_json::from_value(json!({
            "id": "li_2",
            "media": {"metadata": {"publishedYear": null}},
            "updatedAt": null
        }))
        .unwrap();

        assert!(item.updated_at.is_none());
        assert!(item.media.metadata.title.is_none());
    }

    #[test]
    fn parses_search_payload() {
        let search: SearchResponse = serde_json::from_value(json!({
            "book": [{"libraryItem": {"id": "li_1"}}],
            "series": [{"series": {"id": "se_1", "name": "Dune"}, "books": []}],
            "authors": [{"id": "au_1", "name": "Frank Herbert", "numBooks": 3}]
        }))
        .unwrap();

        assert_eq!(search.book.len(), 1);
        assert_eq!(search.series[0].series.name, "Dune");
        assert_eq!(search.authors[0].name, "Frank Herbert");
    }
}
