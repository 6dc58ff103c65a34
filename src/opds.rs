//! OPDS catalog generation.

use crate::library::{Container, Library, LibraryItem};
use crate::paginate::Page;
use chrono::{DateTime, Utc};
use quick_xml::Writer;
use quick_xml::escape::{escape, unescape};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use serde::Serialize;
use std::io::Cursor;
use uuid::Uuid;

/// Navigation feed MIME type.
pub const NAVIGATION_TYPE: &str = "application/atom+xml;profile=opds-catalog;kind=navigation";

/// Acquisition feed MIME type.
pub const ACQUISITION_TYPE: &str = "application/atom+xml;profile=opds-catalog;kind=acquisition";

/// OpenSearch description MIME type.
pub const OPENSEARCH_TYPE: &str = "application/opensearchdescription+xml";

const ACQUISITION_REL: &str = "http://opds-spec.org/acquisition";
const IMAGE_REL: &str = "http://opds-spec.org/image";
const THUMBNAIL_REL: &str = "http://opds-spec.org/image/thumbnail";

/// Deterministic `urn:uuid` for a catalog path or entity key.
pub fn urn(key: &str) -> String {
    format!("urn:uuid:{}", Uuid::new_v5(&Uuid::NAMESPACE_URL, key.as_bytes()))
}

/// OPDS feed link.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Link {
    /// Link relation type (e.g., "self", "subsection", "acquisition").
    pub rel: String,
    /// URL of the linked resource.
    pub href: String,
    /// MIME type of the linked resource.
    pub link_type: String,
    /// Optional title for the link.
    pub title: Option<String>,
    /// Size in bytes of the linked resource.
    pub length: Option<u64>,
}

impl Link {
    /// Create a link without a title.
    pub fn new(rel: impl Into<String>, href: impl Into<String>, link_type: impl Into<String>) -> Self {
        Self {
            rel: rel.into(),
            href: href.into(),
            link_type: link_type.into(),
            title: None,
            length: None,
        }
    }

    /// Set the link title.
    pub fn titled(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    /// Set the resource size.
    pub fn sized(mut self, length: Option<u64>) -> Self {
        self.length = length;
        self
    }
}

/// Atom category.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Category {
    /// Machine term.
    pub term: String,
    /// Display label.
    pub label: String,
}

/// OPDS feed entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Entry {
    /// Unique identifier for the entry.
    pub id: String,
    /// Entry title.
    pub title: String,
    /// Last update timestamp.
    pub updated: DateTime<Utc>,
    /// Authors list.
    pub authors: Vec<String>,
    /// Short summary text.
    pub summary: Option<String>,
    /// Full content/description.
    pub content: Option<String>,
    /// Links associated with this entry.
    pub links: Vec<Link>,
    /// Categories/tags.
    pub categories: Vec<Category>,
    /// Dublin Core language.
    pub language: Option<String>,
    /// Dublin Core publisher.
    pub publisher: Option<String>,
    /// Dublin Core issued date.
    pub issued: Option<String>,
}

impl Entry {
    /// Navigation entry pointing at a sub-feed.
    pub fn navigation(
        key: &str,
        title: impl Into<String>,
        summary: Option<String>,
        href: impl Into<String>,
        kind: &str,
        updated: DateTime<Utc>,
    ) -> Self {
        let title = title.into();
        Self {
            id: urn(key),
            title: title.clone(),
            updated,
            authors: Vec::new(),
            summary,
            content: None,
            links: vec![Link::new("subsection", href, kind).titled(title)],
            categories: Vec::new(),
            language: None,
            publisher: None,
            issued: None,
        }
    }
}

/// Resolves public hrefs for catalog resources.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Hrefs {
    prefix: String,
}

impl Hrefs {
    /// Links under `public_url`, or relative links when it is empty.
    pub fn new(public_url: &str) -> Self {
        Self {
            prefix: public_url.trim_end_matches('/').to_string(),
        }
    }

    /// Absolute or root-relative href for `path`.
    pub fn href(&self, path: &str) -> String {
        format!("{}{}", self.prefix, path)
    }

    /// Root catalog.
    pub fn root(&self) -> String {
        self.href("/opds")
    }

    /// Library navigation menu.
    pub fn library_nav(&self, library_id: &str) -> String {
        self.href(&format!("/opds/{}/nav", enc(library_id)))
    }

    /// Library sub-feed, e.g. `recent` or `series/{id}`.
    pub fn library(&self, library_id: &str, rest: &str) -> String {
        if rest.is_empty() {
            self.href(&format!("/opds/{}", enc(library_id)))
        } else {
            self.href(&format!("/opds/{}/{}", enc(library_id), rest))
        }
    }

    /// OpenSearch description of a library.
    pub fn opensearch(&self, library_id: &str) -> String {
        self.library(library_id, "opensearch.xml")
    }

    /// Proxied download of an item.
    pub fn download(&self, item_id: &str) -> String {
        self.href(&format!("/download/{}", enc(item_id)))
    }

    /// Proxied cover of an item.
    pub fn cover(&self, item_id: &str) -> String {
        self.href(&format!("/cover/{}", enc(item_id)))
    }
}

fn enc(segment: &str) -> String {
    urlencoding::encode(segment).into_owned()
}

/// Append `page` to an href that may already carry a query.
pub fn page_href(base: &str, index: usize) -> String {
    let separator = if base.contains('?') { '&' } else { '?' };
    format!("{}{}page={}", base, separator, index)
}

/// OpenSearch counters of a paginated feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Counters {
    total: usize,
    per_page: usize,
    start_index: usize,
}

/// OPDS feed builder.
pub struct FeedBuilder {
    id: String,
    title: String,
    updated: DateTime<Utc>,
    author_name: Option<String>,
    links: Vec<Link>,
    entries: Vec<Entry>,
    counters: Option<Counters>,
}

impl FeedBuilder {
    /// Create a new feed builder. The id is derived from `key`.
    pub fn new(key: &str, title: impl Into<String>) -> Self {
        Self {
            id: urn(key),
            title: title.into(),
            updated: Utc::now(),
            author_name: None,
            links: Vec::new(),
            entries: Vec::new(),
            counters: None,
        }
    }

    /// Set the feed timestamp.
    pub fn updated(mut self, updated: DateTime<Utc>) -> Self {
        self.updated = updated;
        self
    }

    /// Set the feed author.
    pub fn author(mut self, name: impl Into<String>) -> Self {
        self.author_name = Some(name.into());
        self
    }

    /// Add a self link.
    pub fn self_link(mut self, href: impl Into<String>, kind: &str) -> Self {
        self.links.push(Link::new("self", href, kind));
        self
    }

    /// Add a start link.
    pub fn start_link(mut self, href: impl Into<String>) -> Self {
        self.links.push(Link::new("start", href, NAVIGATION_TYPE));
        self
    }

    /// Add a search link.
    pub fn search_link(mut self, href: impl Into<String>) -> Self {
        self.links.push(Link::new("search", href, OPENSEARCH_TYPE).titled("Search"));
        self
    }

    /// Add an "up" link to the parent feed.
    pub fn up_link(mut self, href: impl Into<String>) -> Self {
        self.links.push(Link::new("up", href, NAVIGATION_TYPE));
        self
    }

    /// Add pagination links and OpenSearch counters for `page`.
    ///
    /// Nothing is added when pagination is disabled. `base` is the feed href
    /// without the `page` parameter.
    pub fn paginate<T>(mut self, page: &Page<T>, base: &str, kind: &str) -> Self {
        if !page.is_paginated() {
            return self;
        }

        self.links.push(Link::new("first", page_href(base, 0), kind));
        if page.has_previous {
            let previous = page.index.saturating_sub(1).min(page.last_index());
            self.links.push(Link::new("previous", page_href(base, previous), kind));
        }
        if page.has_next {
            self.links.push(Link::new("next", page_href(base, page.index + 1), kind));
        }
        self.links.push(Link::new("last", page_href(base, page.last_index()), kind));

        self.counters = Some(Counters {
            total: page.total,
            per_page: page.size,
            start_index: page.start_index() + 1,
        });
        self
    }

    /// Add a navigation entry.
    pub fn navigation_entry(mut self, entry: Entry) -> Self {
        self.entries.push(entry);
        self
    }

    /// Add an acquisition entry for an item.
    pub fn item_entry(mut self, item: &LibraryItem, hrefs: &Hrefs) -> Self {
        let updated = item.updated_at.or(item.added_at).unwrap_or(self.updated);
        self.entries.push(item_entry(item, hrefs, updated));
        self
    }

    /// Add a navigation entry for a library.
    pub fn library_entry(mut self, library: &Library, hrefs: &Hrefs) -> Self {
        let updated = self.updated;
        self.entries.push(Entry::navigation(
            &format!("library:{}", library.id),
            library.name.clone(),
            media_label(&library.media_type),
            hrefs.library_nav(&library.id),
            NAVIGATION_TYPE,
            updated,
        ));
        self
    }

    /// Add a navigation entry for a series, author or collection.
    pub fn container_entry(mut self, kind: &str, container: &Container, href: String, hrefs: &Hrefs) -> Self {
        let mut entry = Entry::navigation(
            &format!("{}:{}", kind, container.id),
            container.name.clone(),
            Some(count_label(container.count)),
            href,
            ACQUISITION_TYPE,
            self.updated,
        );
        if let Some(item_id) = &container.cover_item {
            entry
                .links
                .push(Link::new(IMAGE_REL, hrefs.cover(item_id), "image/jpeg"));
            entry
                .links
                .push(Link::new(THUMBNAIL_REL, hrefs.cover(item_id), "image/jpeg"));
        }
        self.entries.push(entry);
        self
    }

    /// Build the XML feed.
    pub fn build(self) -> String {
        let mut writer = Writer::new(Cursor::new(Vec::new()));

        // XML declaration - writing to Vec can't fail
        let _ = writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)));

        let mut feed = BytesStart::new("feed");
        feed.push_attribute(("xmlns", "http://www.w3.org/2005/Atom"));
        feed.push_attribute(("xmlns:opds", "http://opds-spec.org/2010/catalog"));
        feed.push_attribute(("xmlns:dc", "http://purl.org/dc/terms/"));
        feed.push_attribute(("xmlns:opensearch", "http://a9.com/-/spec/opensearch/1.1/"));
        let _ = writer.write_event(Event::Start(feed));

        write_text_element(&mut writer, "id", &self.id);
        write_text_element(&mut writer, "title", &self.title);
        write_text_element(&mut writer, "updated", &self.updated.to_rfc3339());

        if let Some(name) = &self.author_name {
            let _ = writer.write_event(Event::Start(BytesStart::new("author")));
            write_text_element(&mut writer, "name", name);
            let _ = writer.write_event(Event::End(BytesEnd::new("author")));
        }

        if let Some(counters) = self.counters {
            write_text_element(&mut writer, "opensearch:totalResults", &counters.total.to_string());
            write_text_element(&mut writer, "opensearch:itemsPerPage", &counters.per_page.to_string());
            write_text_element(&mut writer, "opensearch:startIndex", &counters.start_index.to_string());
        }

        for link in &self.links {
            write_link(&mut writer, link);
        }

        for entry in &self.entries {
            write_entry(&mut writer, entry);
        }

        let _ = writer.write_event(Event::End(BytesEnd::new("feed")));

        String::from_utf8(writer.into_inner().into_inner()).unwrap_or_default()
    }
}

fn count_label(count: usize) -> String {
    if count == 1 {
        "1 book".to_string()
    } else {
        format!("{} books", count)
    }
}

/// Summary of a library entry from its upstream media type.
fn media_label(media_type: &str) -> Option<String> {
    match media_type {
        "" => None,
        "book" => Some("Books".to_string()),
        "podcast" => Some("Podcasts".to_string()),
        other => Some(other.to_string()),
    }
}

fn item_entry(item: &LibraryItem, hrefs: &Hrefs, updated: DateTime<Utc>) -> Entry {
    let mut links = vec![
        Link::new(ACQUISITION_REL, hrefs.download(&item.id), item.mime_type())
            .titled("Download")
            .sized(item.size),
        Link::new(IMAGE_REL, hrefs.cover(&item.id), "image/jpeg"),
        Link::new(THUMBNAIL_REL, hrefs.cover(&item.id), "image/jpeg"),
    ];

    let mut categories: Vec<Category> = item
        .genres
        .iter()
        .map(|genre| Category {
            term: genre.clone(),
            label: genre.clone(),
        })
        .collect();

    if let Some(series) = &item.series {
        let label = match &series.sequence {
            Some(seq) => format!("{} #{}", series.name, seq),
            None => series.name.clone(),
        };
        categories.push(Category {
            term: format!("series:{}", series.name),
            label,
        });

        if let (Some(series_id), Some(library_id)) = (&series.id, &item.library_id) {
            links.push(
                Link::new(
                    "related",
                    hrefs.library(library_id, &format!("series/{}", enc(series_id))),
                    ACQUISITION_TYPE,
                )
                .titled(series.name.clone()),
            );
        }
    }

    let title = match &item.subtitle {
        Some(subtitle) => format!("{}: {}", item.title, subtitle),
        None => item.title.clone(),
    };

    Entry {
        id: urn(&format!("item:{}", item.id)),
        title,
        updated,
        authors: item.authors.iter().map(|a| a.name.clone()).collect(),
        summary: item.description.as_deref().map(strip_tags).filter(|s| !s.is_empty()),
        content: Some(item_details(item)),
        links,
        categories,
        language: item.language.clone(),
        publisher: item.publisher.clone(),
        issued: item.published_year.clone(),
    }
}

/// HTML block with the details reading apps show under the description.
fn item_details(item: &LibraryItem) -> String {
    let mut html = String::new();
    if let Some(description) = &item.description {
        html.push_str(description);
        html.push_str("<br/><br/>");
    }
    if let Some(series) = &item.series {
        html.push_str(&format!("Series: {}", series.name));
        if let Some(seq) = &series.sequence {
            html.push_str(&format!(" #{}", seq));
        }
        html.push_str("<br/>");
    }
    if let Some(year) = &item.published_year {
        html.push_str(&format!("Published year: {}<br/>", year));
    }
    if !item.genres.is_empty() {
        html.push_str(&format!("Genres: {}<br/>", item.genres.join(", ")));
    }
    if let Some(added) = item.added_at {
        html.push_str(&format!("Added at: {}<br/>", added.format("%Y-%m-%d")));
    }
    html
}

/// Plain text of an HTML fragment, with character references decoded.
///
/// Fragments with entities XML does not define are kept as written.
fn strip_tags(html: &str) -> String {
    let mut text = String::with_capacity(html.len());
    let mut in_tag = false;
    for c in html.chars() {
        match c {
            '<' => in_tag = true,
            '>' if in_tag => {
                in_tag = false;
                text.push(' ');
            }
            _ if !in_tag => text.push(c),
            _ => {}
        }
    }
    let text = match unescape(&text) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => text,
    };
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Write a simple text element.
fn write_text_element<W: std::io::Write>(writer: &mut Writer<W>, name: &str, text: &str) {
    let _ = writer.write_event(Event::Start(BytesStart::new(name)));
    let _ = writer.write_event(Event::Text(BytesText::new(text)));
    let _ = writer.write_event(Event::End(BytesEnd::new(name)));
}

/// Write a link element.
fn write_link<W: std::io::Write>(writer: &mut Writer<W>, link: &Link) {
    let mut elem = BytesStart::new("link");
    elem.push_attribute(("rel", link.rel.as_str()));
    elem.push_attribute(("href", link.href.as_str()));
    elem.push_attribute(("type", link.link_type.as_str()));
    if let Some(title) = &link.title {
        elem.push_attribute(("title", title.as_str()));
    }
    if let Some(length) = link.length {
        elem.push_attribute(("length", length.to_string().as_str()));
    }
    let _ = writer.write_event(Event::Empty(elem));
}

/// Write an entry element.
fn write_entry<W: std::io::Write>(writer: &mut Writer<W>, entry: &Entry) {
    let _ = writer.write_event(Event::Start(BytesStart::new("entry")));

    write_text_element(writer, "id", &entry.id);
    write_text_element(writer, "title", &entry.title);
    write_text_element(writer, "updated", &entry.updated.to_rfc3339());

    for author in &entry.authors {
        let _ = writer.write_event(Event::Start(BytesStart::new("author")));
        write_text_element(writer, "name", author);
        let _ = writer.write_event(Event::End(BytesEnd::new("author")));
    }

    if let Some(language) = &entry.language {
        write_text_element(writer, "dc:language", language);
    }
    if let Some(publisher) = &entry.publisher {
        write_text_element(writer, "dc:publisher", publisher);
    }
    if let Some(issued) = &entry.issued {
        write_text_element(writer, "dc:issued", issued);
    }

    if let Some(summary) = &entry.summary {
        let mut elem = BytesStart::new("summary");
        elem.push_attribute(("type", "text"));
        let _ = writer.write_event(Event::Start(elem));
        let _ = writer.write_event(Event::Text(BytesText::new(summary)));
        let _ = writer.write_event(Event::End(BytesEnd::new("summary")));
    }

    if let Some(content) = &entry.content {
        let mut elem = BytesStart::new("content");
        elem.push_attribute(("type", "html"));
        let _ = writer.write_event(Event::Start(elem));
        let _ = writer.write_event(Event::Text(BytesText::new(content)));
        let _ = writer.write_event(Event::End(BytesEnd::new("content")));
    }

    for link in &entry.links {
        write_link(writer, link);
    }

    for category in &entry.categories {
        let mut elem = BytesStart::new("category");
        elem.push_attribute(("term", category.term.as_str()));
        elem.push_attribute(("label", category.label.as_str()));
        let _ = writer.write_event(Event::Empty(elem));
    }

    let _ = writer.write_event(Event::End(BytesEnd::new("entry")));
}

/// Generate OpenSearch description XML for a library.
pub fn generate_opensearch(title: &str, library_name: &str, search_href: &str) -> String {
    let short_name: String = title.chars().take(16).collect();
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<OpenSearchDescription xmlns="http://a9.com/-/spec/opensearch/1.1/">
  <ShortName>{}</ShortName>
  <Description>Search {} in {}</Description>
  <InputEncoding>UTF-8</InputEncoding>
  <OutputEncoding>UTF-8</OutputEncoding>
  <Url type="{}" template="{}?q={{searchTerms}}"/>
</OpenSearchDescription>"#,
        escape(short_name.as_str()),
        escape(library_name),
        escape(title),
        ACQUISITION_TYPE,
        escape(search_href)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::library::catalog_items;
    use crate::paginate::{PageRequest, paginate};
    use crate::upstream::models::AbsItem;
    use chrono::TimeZone;
    use serde_json::json;

    fn fixed_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap()
    }

    fn items(n: usize) -> Vec<LibraryItem> {
        let raw: Vec<AbsItem> = (0..n)
            .map(|i| {
                serde_json::from_value(json!({
                    "id": format!("li_{i:02}"),
                    "libraryId": "lib_1",
                    "addedAt": 1_700_000_000_000i64 + i as i64,
                    "size": 2048,
                    "media": {
                        "ebookFormat": "epub",
                        "metadata": {
                            "title": format!("Book {i:02}"),
                            "authors": [{"id": "au_1", "name": "Ann <Writer>"}],
                            "series": [{"id": "se_1", "name": "Saga", "sequence": i.to_string()}],
                            "description": "<p>Fine &amp; dandy</p>",
                            "genres": ["SF"]
                        }
                    }
                }))
                .unwrap()
            })
            .collect();
        catalog_items(&raw, false)
    }

    fn acquisition_feed(page: &Page<LibraryItem>) -> String {
        let hrefs = Hrefs::new("");
        let mut feed = FeedBuilder::new("/opds/lib_1", "Library")
            .updated(fixed_time())
            .self_link("/opds/lib_1", ACQUISITION_TYPE)
            .start_link(hrefs.root())
            .search_link(hrefs.opensearch("lib_1"))
            .paginate(page, "/opds/lib_1", ACQUISITION_TYPE);
        for item in &page.items {
            feed = feed.item_entry(item, &hrefs);
        }
        feed.build()
    }

    fn rels(xml: &str) -> Vec<String> {
        let doc = roxmltree::Document::parse(xml).unwrap();
        doc.root_element()
            .children()
            .filter(|n| n.has_tag_name("link"))
            .filter_map(|n| n.attribute("rel").map(String::from))
            .collect()
    }

    #[test]
    fn paginated_feed_links_follow_position() {
        let first = acquisition_feed(&paginate(items(30), PageRequest::new(0, 25)));
        assert_eq!(rels(&first), ["self", "start", "search", "first", "next", "last"]);

        let second = acquisition_feed(&paginate(items(30), PageRequest::new(1, 25)));
        assert_eq!(rels(&second), ["self", "start", "search", "first", "previous", "last"]);
        assert!(second.contains("<opensearch:startIndex>26</opensearch:startIndex>"));
        assert!(second.contains("<opensearch:totalResults>30</opensearch:totalResults>"));
    }

    #[test]
    fn unpaginated_feed_has_no_page_links() {
        let xml = acquisition_feed(&paginate(items(3), PageRequest::new(0, 0)));
        assert_eq!(rels(&xml), ["self", "start", "search"]);
        assert!(!xml.contains("opensearch:totalResults"));
    }

    #[test]
    fn item_entries_are_well_formed() {
        let xml = acquisition_feed(&paginate(items(1), PageRequest::new(0, 25)));
        let doc = roxmltree::Document::parse(&xml).unwrap();
        let entry = doc
            .root_element()
            .children()
            .find(|n| n.has_tag_name("entry"))
            .unwrap();

        let acquisition = entry
            .children()
            .find(|n| n.attribute("rel") == Some(ACQUISITION_REL))
            .unwrap();
        assert_eq!(acquisition.attribute("href"), Some("/download/li_00"));
        assert_eq!(acquisition.attribute("type"), Some("application/epub+zip"));

        let author = entry
            .descendants()
            .find(|n| n.has_tag_name("name"))
            .and_then(|n| n.text());
        assert_eq!(author, Some("Ann <Writer>"));

        let summary = entry
            .children()
            .find(|n| n.has_tag_name("summary"))
            .and_then(|n| n.text());
        assert_eq!(summary, Some("Fine & dandy"));
        assert_eq!(acquisition.attribute("length"), Some("2048"));

        assert!(entry.children().any(|n| n.has_tag_name("category")
            && n.attribute("label") == Some("Saga #0")));
    }

    #[test]
    fn summaries_decode_character_references() {
        assert_eq!(strip_tags("<p>Fish &amp; Chips</p>"), "Fish & Chips");
        assert_eq!(strip_tags("<b>5 &lt; 6</b>&#33;"), "5 < 6 !");
        assert_eq!(strip_tags("Caf&eacute; <i>noir</i>"), "Caf&eacute; noir");
    }

    #[test]
    fn output_is_deterministic() {
        let page = paginate(items(5), PageRequest::new(0, 2));
        assert_eq!(acquisition_feed(&page), acquisition_feed(&page));
        assert_eq!(urn("/opds"), urn("/opds"));
        assert_ne!(urn("/opds"), urn("/opds/lib_1"));
    }

    #[test]
    fn hrefs_use_public_prefix() {
        let hrefs = Hrefs::new("https://books.example.org/");
        assert_eq!(hrefs.root(), "https://books.example.org/opds");
        assert_eq!(hrefs.download("a b"), "https://books.example.org/download/a%20b");
        assert_eq!(page_href("/opds/x/search?q=dune", 2), "/opds/x/search?q=dune&page=2");
    }

    #[test]
    fn opensearch_is_valid_xml() {
        let xml = generate_opensearch("Books & More", "Main", "/opds/lib_1/search");
        let doc = roxmltree::Document::parse(&xml).unwrap();
        let url = doc
            .descendants()
            .find(|n| n.has_tag_name("Url"))
            .unwrap();
        assert_eq!(url.attribute("template"), Some("/opds/lib_1/search?q={searchTerms}"));
    }
}
