//! Catalog item model.

use crate::upstream::models::AbsItem;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// What an item can be acquired as.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum MediaKind {
    /// Ebook in the given format (`epub`, `pdf`, ...).
    Ebook {
        /// Lowercase format name.
        format: String,
    },
    /// Audiobook without an ebook file.
    Audio {
        /// MIME type of the first track.
        mime_type: String,
    },
}

/// Series membership of an item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SeriesRef {
    /// Series id, when the payload carries one.
    pub id: Option<String>,
    /// Series name.
    pub name: String,
    /// Position within the series, e.g. `1` or `2.5`.
    pub sequence: Option<String>,
}

/// Author of an item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthorRef {
    /// Author id, when the payload carries one.
    pub id: Option<String>,
    /// Author name.
    pub name: String,
}

/// Immutable snapshot of an upstream item at fetch time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LibraryItem {
    /// Item id.
    pub id: String,

    /// Owning library id.
    pub library_id: Option<String>,

    /// Title.
    pub title: String,

    /// Subtitle.
    pub subtitle: Option<String>,

    /// Authors, in upstream order.
    pub authors: Vec<AuthorRef>,

    /// First series the item belongs to.
    pub series: Option<SeriesRef>,

    /// Acquisition kind.
    pub media: MediaKind,

    /// Size in bytes of the file behind the acquisition link.
    pub size: Option<u64>,

    /// When the item was added upstream.
    pub added_at: Option<DateTime<Utc>>,

    /// When the item was last updated upstream.
    pub updated_at: Option<DateTime<Utc>>,

    /// Description, possibly HTML.
    pub description: Option<String>,

    /// Publication year.
    pub published_year: Option<String>,

    /// Genres.
    pub genres: Vec<String>,

    /// Language.
    pub language: Option<String>,

    /// Publisher.
    pub publisher: Option<String>,
}

impl LibraryItem {
    /// Convert an upstream item, returning `None` when it carries nothing to acquire.
    pub fn from_abs(item: &AbsItem) -> Option<Self> {
        let media = &item.media;
        let meta = &media.metadata;

        let (kind, size) = if let Some(format) = ebook_format(item) {
            let size = media.ebook_file.as_ref().and_then(|f| f.metadata.size);
            (MediaKind::Ebook { format }, size.or(item.size))
        } else if !media.audio_files.is_empty() || media.num_audio_files.unwrap_or(0) > 0 {
            let first = media.audio_files.first();
            let mime_type = first
                .and_then(|f| f.mime_type.clone())
                .unwrap_or_else(|| "audio/mpeg".to_string());
            (MediaKind::Audio { mime_type }, first.and_then(|f| f.metadata.size))
        } else {
            return None;
        };

        let mut authors: Vec<AuthorRef> = meta
            .authors
            .iter()
            .filter(|a| !a.name.is_empty())
            .map(|a| AuthorRef {
                id: a.id.clone(),
                name: a.name.clone(),
            })
            .collect();
        if authors.is_empty() {
            authors = split_names(meta.author_name.as_deref());
        }

        let series = meta
            .series
            .as_ref()
            .and_then(|s| s.first())
            .filter(|s| !s.name.is_empty())
            .map(|s| SeriesRef {
                id: s.id.clone(),
                name: s.name.clone(),
                sequence: s.sequence.clone(),
            })
            .or_else(|| parse_series_name(meta.series_name.as_deref()));

        Some(Self {
            id: item.id.clone(),
            library_id: item.library_id.clone(),
            title: meta
                .title
                .clone()
                .filter(|t| !t.trim().is_empty())
                .unwrap_or_else(|| "Unknown Title".to_string()),
            subtitle: meta.subtitle.clone().filter(|s| !s.is_empty()),
            authors,
            series,
            media: kind,
            size,
            added_at: item.added_at.and_then(DateTime::from_timestamp_millis),
            updated_at: item.updated_at.and_then(DateTime::from_timestamp_millis),
            description: meta.description.clone().filter(|d| !d.trim().is_empty()),
            published_year: meta.published_year.clone(),
            genres: meta.genres.clone(),
            language: meta.language.clone().filter(|l| !l.is_empty()),
            publisher: meta.publisher.clone().filter(|p| !p.is_empty()),
        })
    }

    /// Whether the item carries an ebook.
    pub fn is_ebook(&self) -> bool {
        matches!(self.media, MediaKind::Ebook { .. })
    }

    /// MIME type of the acquisition link.
    pub fn mime_type(&self) -> &str {
        match &self.media {
            MediaKind::Ebook { format } => ebook_mime_type(format),
            MediaKind::Audio { mime_type } => mime_type.as_str(),
        }
    }

    /// Whether `author` wrote this item, matching by id and falling back to name.
    pub fn has_author(&self, id: &str, name: &str) -> bool {
        self.authors.iter().any(|a| match &a.id {
            Some(author_id) => author_id == id,
            None => a.name.eq_ignore_ascii_case(name),
        })
    }

    /// Whether this item belongs to series `id` (or `name` when ids are absent).
    pub fn in_series(&self, id: &str, name: &str) -> bool {
        self.series.as_ref().is_some_and(|s| match &s.id {
            Some(series_id) => series_id == id,
            None => s.name.eq_ignore_ascii_case(name),
        })
    }

    /// Numeric series position, for ordering.
    pub fn series_position(&self) -> Option<f64> {
        self.series
            .as_ref()
            .and_then(|s| s.sequence.as_deref())
            .and_then(|seq| seq.trim().parse::<f64>().ok())
    }
}

/// Ebook format of an upstream item, if it has one.
pub fn ebook_format(item: &AbsItem) -> Option<String> {
    let media = &item.media;
    let from_file = media.ebook_file.as_ref().map(|file| {
        file.ebook_format
            .clone()
            .filter(|f| !f.is_empty())
            .or_else(|| Some(file.metadata.ext.trim_start_matches('.').to_string()))
            .filter(|f| !f.is_empty())
            .unwrap_or_else(|| "epub".to_string())
    });

    media
        .ebook_format
        .clone()
        .filter(|f| !f.is_empty())
        .or(from_file)
        .map(|f| f.to_ascii_lowercase())
}

/// MIME type for an ebook format name.
pub fn ebook_mime_type(format: &str) -> &'static str {
    match format.to_ascii_lowercase().as_str() {
        "epub" => "application/epub+zip",
        "pdf" => "application/pdf",
        "mobi" => "application/x-mobipocket-ebook",
        "azw" | "azw3" => "application/vnd.amazon.ebook",
        "cbz" => "application/vnd.comicbook+zip",
        "cbr" => "application/vnd.comicbook-rar",
        "cb7" => "application/x-cb7",
        "fb2" => "application/x-fictionbook+xml",
        "djvu" => "image/vnd.djvu",
        "txt" => "text/plain",
        "rtf" => "application/rtf",
        _ => "application/octet-stream",
    }
}

fn split_names(joined: Option<&str>) -> Vec<AuthorRef> {
    joined
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .map(|name| AuthorRef {
            id: None,
            name: name.to_string(),
        })
        .collect()
}

/// Parse `Name #3` into a series reference.
fn parse_series_name(joined: Option<&str>) -> Option<SeriesRef> {
    let first = joined?.split(',').next()?.trim();
    if first.is_empty() {
        return None;
    }

    let (name, sequence) = match first.rsplit_once(" #") {
        Some((name, seq)) if !seq.trim().is_empty() => (name.trim(), Some(seq.trim().to_string())),
        _ => (first, None),
    };

    Some(SeriesRef {
        id: None,
        name: name.to_string(),
        sequence,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn abs(value: serde_json::Value) -> AbsItem {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn converts_minified_ebook() {
        let item = LibraryItem::from_abs(&abs(json!({
            "id": "li_1",
            "addedAt": 1700000000000i64,
            "media": {
                "ebookFormat": "EPUB",
                "metadata": {
                    "title": "Dune",
                    "authorName": "Frank Herbert, Brian Herbert",
                    "seriesName": "Dune #1"
                }
            }
        })))
        .unwrap();

        assert!(item.is_ebook());
        assert_eq!(item.mime_type(), "application/epub+zip");
        let names: Vec<_> = item.authors.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, ["Frank Herbert", "Brian Herbert"]);
        assert_eq!(item.series_position(), Some(1.0));
        assert_eq!(item.series.unwrap().name, "Dune");
        assert!(item.added_at.is_some());
    }

    #[test]
    fn format_falls_back_to_file_extension() {
        let item = abs(json!({
            "id": "li_2",
            "size": 9000,
            "media": {"ebookFile": {"ino": "7", "metadata": {"filename": "x.pdf", "ext": ".pdf", "size": 512}}}
        }));

        assert_eq!(ebook_format(&item).as_deref(), Some("pdf"));
        assert_eq!(LibraryItem::from_abs(&item).unwrap().size, Some(512));
    }

    #[test]
    fn audio_only_item() {
        let item = LibraryItem::from_abs(&abs(json!({
            "id": "li_3",
            "media": {"audioFiles": [{"ino": "9", "mimeType": "audio/mp4"}]}
        })))
        .unwrap();

        assert!(!item.is_ebook());
        assert_eq!(item.mime_type(), "audio/mp4");
        assert_eq!(item.title, "Unknown Title");
    }

    #[test]
    fn item_without_media_is_skipped() {
        assert!(LibraryItem::from_abs(&abs(json!({"id": "li_4"}))).is_none());
    }

    #[test]
    fn author_and_series_matching() {
        let item = LibraryItem::from_abs(&abs(json!({
            "id": "li_5",
            "media": {
                "ebookFormat": "epub",
                "metadata": {
                    "authors": [{"id": "au_1", "name": "Ursula K. Le Guin"}],
                    "series": [{"id": "se_1", "name": "Earthsea", "sequence": "2"}]
                }
            }
        })))
        .unwrap();

        assert!(item.has_author("au_1", "whatever"));
        assert!(!item.has_author("au_2", "Ursula K. Le Guin"));
        assert!(item.in_series("se_1", ""));
        assert!(!item.in_series("se_2", "Earthsea"));
    }

    #[test]
    fn mime_types() {
        assert_eq!(ebook_mime_type("cbz"), "application/vnd.comicbook+zip");
        assert_eq!(ebook_mime_type("AZW3"), "application/vnd.amazon.ebook");
        assert_eq!(ebook_mime_type("weird"), "application/octet-stream");
    }
}
