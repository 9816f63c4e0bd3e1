//! Storefront adapters: sitemap indexing and product payload extraction.

use harvest_core::{ProductPayload, ProductUrl, Scalar, VariantRow};
use harvest_storage::{FetchError, PageSource};
use quick_xml::events::{BytesStart, Event};
use quick_xml::name::{Namespace, ResolveResult};
use quick_xml::NsReader;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "harvest-adapters";

pub const SITEMAP_INDEX_PATH: &str = "/sitemap.xml";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SitemapKind {
    Index,
    UrlSet,
}

impl SitemapKind {
    fn root(self) -> &'static str {
        match self {
            SitemapKind::Index => "sitemapindex",
            SitemapKind::UrlSet => "urlset",
        }
    }

    fn entry(self) -> &'static [u8] {
        match self {
            SitemapKind::Index => b"sitemap",
            SitemapKind::UrlSet => b"url",
        }
    }
}

#[derive(Debug, Error)]
pub enum SitemapError {
    #[error("malformed xml: {0}")]
    Xml(#[from] quick_xml::Error),
    #[error("expected <{expected}> root element, found <{found}>")]
    UnexpectedRoot { expected: &'static str, found: String },
    #[error("document has no root element")]
    Empty,
}

/// Fatal: without the index there is no catalog to window.
#[derive(Debug, Error)]
pub enum IndexError {
    #[error("sitemap index {url} could not be fetched: {source}")]
    Fetch {
        url: String,
        #[source]
        source: FetchError,
    },
    #[error("sitemap index {url} could not be parsed: {source}")]
    Parse {
        url: String,
        #[source]
        source: SitemapError,
    },
    #[error("sitemap index {url} lists no child sitemaps")]
    NoSitemaps { url: String },
}

/// Recoverable: the child sitemap is skipped and indexing continues.
#[derive(Debug, Error)]
pub enum ChildSitemapError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("child sitemap {url} could not be parsed: {source}")]
    Parse {
        url: String,
        #[source]
        source: SitemapError,
    },
}

fn declared_default_namespace(root: &BytesStart<'_>) -> Result<Option<Vec<u8>>, SitemapError> {
    for attr in root.attributes() {
        let attr = attr.map_err(quick_xml::Error::from)?;
        if attr.key.as_ref() == b"xmlns" {
            return Ok(Some(attr.value.into_owned()));
        }
    }
    Ok(None)
}

fn in_default_namespace(resolved: &ResolveResult<'_>, default_ns: Option<&[u8]>) -> bool {
    match (resolved, default_ns) {
        (ResolveResult::Bound(Namespace(uri)), Some(expected)) => *uri == expected,
        (ResolveResult::Unbound, None) => true,
        _ => false,
    }
}

fn check_root(kind: SitemapKind, local: &[u8]) -> Result<(), SitemapError> {
    if local == kind.root().as_bytes() {
        Ok(())
    } else {
        Err(SitemapError::UnexpectedRoot {
            expected: kind.root(),
            found: String::from_utf8_lossy(local).into_owned(),
        })
    }
}

/// Extract `<loc>` values of a sitemap document in document order.
///
/// The namespace is whatever the root element declares as its default (`xmlns="..."`);
/// only `loc` elements in that namespace directly under `<sitemap>` (index) or `<url>`
/// (url set) count, so extension elements such as `<image:loc>` are ignored.
pub fn parse_sitemap(xml: &[u8], kind: SitemapKind) -> Result<Vec<String>, SitemapError> {
    let mut reader = NsReader::from_reader(xml);
    let mut buf = Vec::new();
    let mut stack: Vec<Vec<u8>> = Vec::new();
    let mut default_ns: Option<Vec<u8>> = None;
    let mut seen_root = false;
    let mut current: Option<String> = None;
    let mut locations = Vec::new();

    loop {
        match reader.read_resolved_event_into(&mut buf)? {
            (resolved, Event::Start(e)) => {
                let local = e.local_name().as_ref().to_vec();
                if !seen_root {
                    check_root(kind, &local)?;
                    default_ns = declared_default_namespace(&e)?;
                    seen_root = true;
                } else if local == b"loc"
                    && stack.last().map(Vec::as_slice) == Some(kind.entry())
                    && in_default_namespace(&resolved, default_ns.as_deref())
                {
                    current = Some(String::new());
                }
                stack.push(local);
            }
            (_, Event::Empty(e)) => {
                if !seen_root {
                    check_root(kind, e.local_name().as_ref())?;
                    seen_root = true;
                }
            }
            (_, Event::Text(t)) => {
                if let Some(loc) = current.as_mut() {
                    loc.push_str(&t.unescape()?);
                }
            }
            (_, Event::CData(c)) => {
                if let Some(loc) = current.as_mut() {
                    loc.push_str(&String::from_utf8_lossy(&c.into_inner()));
                }
            }
            (_, Event::End(_)) => {
                let closed = stack.pop();
                if closed.as_deref() == Some(b"loc".as_slice()) {
                    if let Some(loc) = current.take() {
                        let loc = loc.trim();
                        if !loc.is_empty() {
                            locations.push(loc.to_string());
                        }
                    }
                }
            }
            (_, Event::Eof) => break,
            _ => {}
        }
        buf.clear();
    }

    if !seen_root {
        return Err(SitemapError::Empty);
    }
    Ok(locations)
}

/// Sitemap-level selection applied before the global batch window.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SitemapSelection {
    pub offset: usize,
    /// Child sitemaps to visit after the offset, 0 = all.
    pub max_sitemaps: usize,
    /// Locations kept per child sitemap, 0 = all.
    pub max_urls_per_sitemap: usize,
    pub url_contains: Option<String>,
}

impl SitemapSelection {
    fn select_sitemaps(&self, sitemaps: Vec<String>) -> Vec<String> {
        let take = if self.max_sitemaps == 0 {
            usize::MAX
        } else {
            self.max_sitemaps
        };
        sitemaps.into_iter().skip(self.offset).take(take).collect()
    }

    fn select_pages(&self, pages: Vec<String>) -> Vec<String> {
        let take = if self.max_urls_per_sitemap == 0 {
            usize::MAX
        } else {
            self.max_urls_per_sitemap
        };
        pages
            .into_iter()
            .take(take)
            .filter(|page| match &self.url_contains {
                Some(needle) => page.contains(needle.as_str()),
                None => true,
            })
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CatalogIndex {
    pub index_url: String,
    pub sitemaps_listed: usize,
    pub sitemaps_selected: usize,
    pub sitemaps_visited: usize,
    pub sitemaps_failed: usize,
    pub stopped_early: bool,
    pub page_urls: Vec<String>,
}

pub fn sitemap_index_url(base_url: &str) -> String {
    format!("{}{}", base_url.trim_end_matches('/'), SITEMAP_INDEX_PATH)
}

pub struct SitemapIndexer<'a> {
    source: &'a dyn PageSource,
    selection: SitemapSelection,
}

impl<'a> SitemapIndexer<'a> {
    pub fn new(source: &'a dyn PageSource, selection: SitemapSelection) -> Self {
        Self { source, selection }
    }

    /// Walk the index and its child sitemaps. With `limit`, no further child sitemap is
    /// fetched once `limit` page locations have been collected.
    pub async fn index(&self, base_url: &str, limit: Option<usize>) -> Result<CatalogIndex, IndexError> {
        let index_url = sitemap_index_url(base_url);
        info!(url = %index_url, "fetching sitemap index");

        let bytes = self
            .source
            .fetch(&index_url)
            .await
            .map_err(|source| IndexError::Fetch {
                url: index_url.clone(),
                source,
            })?;
        let sitemaps = parse_sitemap(&bytes, SitemapKind::Index).map_err(|source| IndexError::Parse {
            url: index_url.clone(),
            source,
        })?;
        if sitemaps.is_empty() {
            return Err(IndexError::NoSitemaps { url: index_url });
        }

        let sitemaps_listed = sitemaps.len();
        let selected = self.selection.select_sitemaps(sitemaps);
        info!(
            listed = sitemaps_listed,
            selected = selected.len(),
            offset = self.selection.offset,
            "sitemap index loaded"
        );

        let mut catalog = CatalogIndex {
            index_url,
            sitemaps_listed,
            sitemaps_selected: selected.len(),
            ..CatalogIndex::default()
        };

        for (idx, sitemap_url) in selected.iter().enumerate() {
            if let Some(limit) = limit {
                if catalog.page_urls.len() >= limit {
                    catalog.stopped_early = true;
                    info!(collected = catalog.page_urls.len(), limit, "batch window filled, stopping sitemap traversal");
                    break;
                }
            }

            info!(
                sitemap = idx + 1,
                of = selected.len(),
                url = %sitemap_url,
                "fetching child sitemap"
            );
            catalog.sitemaps_visited += 1;
            match self.child_locations(sitemap_url).await {
                Ok(pages) => {
                    let found = pages.len();
                    let kept = self.selection.select_pages(pages);
                    info!(found, kept = kept.len(), "child sitemap parsed");
                    catalog.page_urls.extend(kept);
                }
                Err(err) => {
                    catalog.sitemaps_failed += 1;
                    warn!(url = %sitemap_url, error = %err, "skipping child sitemap");
                }
            }
        }

        info!(
            pages = catalog.page_urls.len(),
            visited = catalog.sitemaps_visited,
            failed = catalog.sitemaps_failed,
            "sitemap traversal finished"
        );
        Ok(catalog)
    }

    async fn child_locations(&self, sitemap_url: &str) -> Result<Vec<String>, ChildSitemapError> {
        let bytes = self.source.fetch(sitemap_url).await?;
        parse_sitemap(&bytes, SitemapKind::UrlSet).map_err(|source| ChildSitemapError::Parse {
            url: sitemap_url.to_string(),
            source,
        })
    }
}

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("payload from {url} is not valid product json: {source}")]
    Json {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("payload from {url} has no variants")]
    NoVariants { url: String },
}

pub fn parse_payload(url: &ProductUrl, bytes: &[u8]) -> Result<ProductPayload, ExtractError> {
    let payload: ProductPayload = serde_json::from_slice(bytes).map_err(|source| ExtractError::Json {
        url: url.payload_url(),
        source,
    })?;
    if payload.variants.is_empty() {
        return Err(ExtractError::NoVariants {
            url: url.payload_url(),
        });
    }
    Ok(payload)
}

pub fn normalize_image_url(url: &str) -> String {
    match url.strip_prefix("//") {
        Some(rest) => format!("https://{rest}"),
        None => url.to_string(),
    }
}

pub fn flatten_variants(url: &ProductUrl, payload: &ProductPayload) -> Vec<VariantRow> {
    let image_url = payload
        .images
        .iter()
        .map(|image| normalize_image_url(&image.0))
        .collect::<Vec<_>>()
        .join(",");
    let option_name = |idx: usize| payload.option_name(idx).unwrap_or_default().to_string();

    payload
        .variants
        .iter()
        .map(|variant| {
            let option_value = |idx: usize| variant.option_value(idx).unwrap_or_default().to_string();
            VariantRow {
                product_id: payload.id.to_string(),
                product_title: payload.title.to_string(),
                vendor: payload.vendor.to_string(),
                product_type: payload.product_type.to_string(),
                handle: payload.handle.to_string(),
                variant_id: variant.id.to_string(),
                variant_title: variant.title.to_string(),
                sku: variant.sku.as_ref().map(Scalar::to_string).unwrap_or_default(),
                option_1_name: option_name(0),
                option_1_value: option_value(0),
                option_2_name: option_name(1),
                option_2_value: option_value(1),
                option_3_name: option_name(2),
                option_3_value: option_value(2),
                variant_price: variant.price.to_string(),
                available: if variant.available { "1" } else { "0" }.to_string(),
                variant_url: url.variant_url(variant.id.as_str()),
                image_url: image_url.clone(),
            }
        })
        .collect()
}

pub fn extract_rows(url: &ProductUrl, bytes: &[u8]) -> Result<Vec<VariantRow>, ExtractError> {
    let payload = parse_payload(url, bytes)?;
    let rows = flatten_variants(url, &payload);
    debug!(url = %url, variants = rows.len(), "payload extracted");
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    const INDEX: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<sitemapindex xmlns="http://www.sitemaps.org/schemas/sitemap/0.9">
  <sitemap><loc>https://shop.test/sitemap_products_1.xml?from=1&amp;to=99</loc></sitemap>
  <sitemap><loc>https://shop.test/sitemap_pages_1.xml</loc></sitemap>
</sitemapindex>"#;

    const URLSET_WITH_IMAGES: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<urlset xmlns="http://www.sitemaps.org/schemas/sitemap/0.9" xmlns:image="http://www.google.com/schemas/sitemap-image/1.1">
  <url>
    <loc>https://shop.test/products/chair</loc>
    <image:image><image:loc>https://cdn.test/chair.jpg</image:loc></image:image>
  </url>
  <url><loc>
     https://shop.test/products/table/
  </loc></url>
  <url><loc><![CDATA[https://shop.test/products/lamp]]></loc></url>
</urlset>"#;

    #[derive(Default)]
    struct FakeSource {
        pages: HashMap<String, Vec<u8>>,
        fetched: Mutex<Vec<String>>,
    }

    impl FakeSource {
        fn with(mut self, url: &str, body: &str) -> Self {
            self.pages.insert(url.to_string(), body.as_bytes().to_vec());
            self
        }

        fn fetched(&self) -> Vec<String> {
            self.fetched.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PageSource for FakeSource {
        async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
            self.fetched.lock().unwrap().push(url.to_string());
            self.pages.get(url).cloned().ok_or_else(|| FetchError::HttpStatus {
                status: 404,
                url: url.to_string(),
            })
        }
    }

    fn urlset(urls: &[&str]) -> String {
        let entries = urls
            .iter()
            .map(|u| format!("<url><loc>{u}</loc></url>"))
            .collect::<String>();
        format!(r#"<urlset xmlns="http://www.sitemaps.org/schemas/sitemap/0.9">{entries}</urlset>"#)
    }

    fn index(children: &[&str]) -> String {
        let entries = children
            .iter()
            .map(|u| format!("<sitemap><loc>{u}</loc></sitemap>"))
            .collect::<String>();
        format!(r#"<sitemapindex xmlns="http://www.sitemaps.org/schemas/sitemap/0.9">{entries}</sitemapindex>"#)
    }

    #[test]
    fn index_locations_are_unescaped_in_order() {
        let locs = parse_sitemap(INDEX.as_bytes(), SitemapKind::Index).unwrap();
        assert_eq!(
            locs,
            vec![
                "https://shop.test/sitemap_products_1.xml?from=1&to=99".to_string(),
                "https://shop.test/sitemap_pages_1.xml".to_string(),
            ]
        );
    }

    #[test]
    fn urlset_ignores_image_locations_and_trims() {
        let locs = parse_sitemap(URLSET_WITH_IMAGES.as_bytes(), SitemapKind::UrlSet).unwrap();
        assert_eq!(
            locs,
            vec![
                "https://shop.test/products/chair".to_string(),
                "https://shop.test/products/table/".to_string(),
                "https://shop.test/products/lamp".to_string(),
            ]
        );
    }

    #[test]
    fn default_namespace_is_read_from_document() {
        let xml = r#"<urlset xmlns="urn:shop:legacy-sitemap">
            <url><loc>https://shop.test/products/a</loc></url>
        </urlset>"#;
        let locs = parse_sitemap(xml.as_bytes(), SitemapKind::UrlSet).unwrap();
        assert_eq!(locs, vec!["https://shop.test/products/a".to_string()]);

        let no_ns = "<urlset><url><loc>https://shop.test/products/b</loc></url></urlset>";
        let locs = parse_sitemap(no_ns.as_bytes(), SitemapKind::UrlSet).unwrap();
        assert_eq!(locs, vec!["https://shop.test/products/b".to_string()]);
    }

    #[test]
    fn foreign_namespace_loc_is_ignored() {
        let xml = r#"<urlset xmlns="http://www.sitemaps.org/schemas/sitemap/0.9" xmlns:x="urn:other">
            <url><x:loc>https://shop.test/products/hidden</x:loc><loc>https://shop.test/products/shown</loc></url>
        </urlset>"#;
        let locs = parse_sitemap(xml.as_bytes(), SitemapKind::UrlSet).unwrap();
        assert_eq!(locs, vec!["https://shop.test/products/shown".to_string()]);
    }

    #[test]
    fn wrong_root_and_malformed_documents_fail() {
        assert!(matches!(
            parse_sitemap(URLSET_WITH_IMAGES.as_bytes(), SitemapKind::Index),
            Err(SitemapError::UnexpectedRoot { expected: "sitemapindex", .. })
        ));
        assert!(matches!(
            parse_sitemap(b"<html><body>blocked</body></html>", SitemapKind::UrlSet),
            Err(SitemapError::UnexpectedRoot { .. })
        ));
        assert!(matches!(
            parse_sitemap(b"<urlset><url><loc>x</url></urlset>", SitemapKind::UrlSet),
            Err(SitemapError::Xml(_))
        ));
        assert!(matches!(parse_sitemap(b"", SitemapKind::UrlSet), Err(SitemapError::Empty)));
        assert_eq!(
            parse_sitemap(b"<urlset/>", SitemapKind::UrlSet).unwrap(),
            Vec::<String>::new()
        );
    }

    #[tokio::test]
    async fn indexer_concatenates_children_and_skips_failures() {
        let source = FakeSource::default()
            .with(
                "https://shop.test/sitemap.xml",
                &index(&[
                    "https://shop.test/s1.xml",
                    "https://shop.test/missing.xml",
                    "https://shop.test/broken.xml",
                    "https://shop.test/s2.xml",
                ]),
            )
            .with("https://shop.test/s1.xml", &urlset(&["https://shop.test/products/a", "https://shop.test/products/b"]))
            .with("https://shop.test/broken.xml", "<html><body>blocked</body></html>")
            .with("https://shop.test/s2.xml", &urlset(&["https://shop.test/products/c"]));

        let indexer = SitemapIndexer::new(&source, SitemapSelection::default());
        let catalog = indexer.index("https://shop.test/", None).await.unwrap();
        assert_eq!(
            catalog.page_urls,
            vec![
                "https://shop.test/products/a".to_string(),
                "https://shop.test/products/b".to_string(),
                "https://shop.test/products/c".to_string(),
            ]
        );
        assert_eq!(catalog.sitemaps_listed, 4);
        assert_eq!(catalog.sitemaps_visited, 4);
        assert_eq!(catalog.sitemaps_failed, 2);
        assert!(!catalog.stopped_early);
    }

    #[tokio::test]
    async fn indexer_stops_fetching_children_once_limit_reached() {
        let source = FakeSource::default()
            .with(
                "https://shop.test/sitemap.xml",
                &index(&["https://shop.test/s1.xml", "https://shop.test/s2.xml", "https://shop.test/s3.xml"]),
            )
            .with("https://shop.test/s1.xml", &urlset(&["https://shop.test/products/a", "https://shop.test/products/b"]))
            .with("https://shop.test/s2.xml", &urlset(&["https://shop.test/products/c", "https://shop.test/products/d"]))
            .with("https://shop.test/s3.xml", &urlset(&["https://shop.test/products/e"]));

        let indexer = SitemapIndexer::new(&source, SitemapSelection::default());
        let catalog = indexer.index("https://shop.test", Some(3)).await.unwrap();
        assert!(catalog.stopped_early);
        assert_eq!(catalog.page_urls.len(), 4);
        assert!(!source.fetched().contains(&"https://shop.test/s3.xml".to_string()));
    }

    #[tokio::test]
    async fn indexer_applies_sitemap_selection() {
        let source = FakeSource::default()
            .with(
                "https://shop.test/sitemap.xml",
                &index(&["https://shop.test/s1.xml", "https://shop.test/s2.xml", "https://shop.test/s3.xml"]),
            )
            .with("https://shop.test/s2.xml", &urlset(&[
                "https://shop.test/products/a",
                "https://shop.test/pages/about",
                "https://shop.test/products/b",
                "https://shop.test/products/c",
            ]));

        let selection = SitemapSelection {
            offset: 1,
            max_sitemaps: 1,
            max_urls_per_sitemap: 3,
            url_contains: Some("/products/".into()),
        };
        let indexer = SitemapIndexer::new(&source, selection);
        let catalog = indexer.index("https://shop.test", None).await.unwrap();
        assert_eq!(
            catalog.page_urls,
            vec!["https://shop.test/products/a".to_string(), "https://shop.test/products/b".to_string()]
        );
        assert_eq!(catalog.sitemaps_selected, 1);
        assert_eq!(
            source.fetched(),
            vec!["https://shop.test/sitemap.xml".to_string(), "https://shop.test/s2.xml".to_string()]
        );
    }

    #[tokio::test]
    async fn missing_or_empty_index_is_fatal() {
        let source = FakeSource::default();
        let indexer = SitemapIndexer::new(&source, SitemapSelection::default());
        assert!(matches!(
            indexer.index("https://shop.test", None).await,
            Err(IndexError::Fetch { .. })
        ));

        let source = FakeSource::default().with("https://shop.test/sitemap.xml", "<sitemapindex></sitemapindex>");
        let indexer = SitemapIndexer::new(&source, SitemapSelection::default());
        assert!(matches!(
            indexer.index("https://shop.test", None).await,
            Err(IndexError::NoSitemaps { .. })
        ));

        let source = FakeSource::default().with("https://shop.test/sitemap.xml", "not xml at all <");
        let indexer = SitemapIndexer::new(&source, SitemapSelection::default());
        assert!(matches!(
            indexer.index("https://shop.test", None).await,
            Err(IndexError::Parse { .. })
        ));
    }

    const PAYLOAD: &str = r#"{
        "id": 501,
        "title": "Oak Chair",
        "vendor": "Acme",
        "type": "Chairs",
        "handle": "oak-chair",
        "options": [{"name": "Color", "position": 1, "values": ["Red", "Blue"]}, {"name": "Size", "position": 2, "values": ["S"]}],
        "images": ["//cdn.test/oak-1.jpg", "https://cdn.test/oak-2.jpg", "http://cdn.test/oak-3.jpg"],
        "variants": [
            {"id": 9001, "title": "Red / S", "sku": "OAK-R-S", "option1": "Red", "option2": "S", "option3": null, "price": 12900, "available": true},
            {"id": 9002, "title": "Blue / S", "sku": null, "option1": "Blue", "option2": "S", "option3": null, "price": 12900, "available": false},
            {"id": 9003, "title": "Blue / S bundle", "option1": "Blue", "price": "13900", "available": true}
        ]
    }"#;

    #[test]
    fn each_variant_becomes_one_row_with_shared_product_fields() {
        let url = ProductUrl::from_page_url("https://shop.test/products/oak-chair/");
        let rows = extract_rows(&url, PAYLOAD.as_bytes()).unwrap();
        assert_eq!(rows.len(), 3);
        for row in &rows {
            assert_eq!(row.product_id, "501");
            assert_eq!(row.product_title, "Oak Chair");
            assert_eq!(row.vendor, "Acme");
            assert_eq!(row.product_type, "Chairs");
            assert_eq!(row.handle, "oak-chair");
            assert_eq!(row.option_1_name, "Color");
            assert_eq!(row.option_2_name, "Size");
            assert_eq!(row.option_3_name, "");
            assert_eq!(
                row.image_url,
                "https://cdn.test/oak-1.jpg,https://cdn.test/oak-2.jpg,http://cdn.test/oak-3.jpg"
            );
        }

        assert_eq!(rows[0].variant_id, "9001");
        assert_eq!(rows[0].sku, "OAK-R-S");
        assert_eq!(rows[0].option_1_value, "Red");
        assert_eq!(rows[0].option_2_value, "S");
        assert_eq!(rows[0].option_3_value, "");
        assert_eq!(rows[0].variant_price, "12900");
        assert_eq!(rows[0].available, "1");
        assert_eq!(rows[0].variant_url, "https://shop.test/products/oak-chair?variant=9001");

        assert_eq!(rows[1].sku, "");
        assert_eq!(rows[1].available, "0");
        assert_eq!(rows[2].option_2_value, "");
        assert_eq!(rows[2].variant_price, "13900");
    }

    #[test]
    fn image_normalization_only_touches_protocol_relative_urls() {
        assert_eq!(normalize_image_url("//cdn.test/a.jpg"), "https://cdn.test/a.jpg");
        assert_eq!(normalize_image_url("https://cdn.test/a.jpg"), "https://cdn.test/a.jpg");
        assert_eq!(normalize_image_url("http://cdn.test/a.jpg"), "http://cdn.test/a.jpg");
        assert_eq!(normalize_image_url("/files/a.jpg"), "/files/a.jpg");
        assert_eq!(normalize_image_url(""), "");
    }

    #[test]
    fn empty_variants_and_bad_json_yield_errors() {
        let url = ProductUrl::from_page_url("https://shop.test/products/ghost");
        let empty = r#"{"id": 1, "title": "Ghost", "variants": []}"#;
        assert!(matches!(
            extract_rows(&url, empty.as_bytes()),
            Err(ExtractError::NoVariants { .. })
        ));
        assert!(matches!(
            extract_rows(&url, b"<html>Just a moment...</html>"),
            Err(ExtractError::Json { .. })
        ));
        let missing = r#"{"id": 1, "title": "Ghost"}"#;
        assert!(matches!(
            extract_rows(&url, missing.as_bytes()),
            Err(ExtractError::NoVariants { .. })
        ));
    }

    #[test]
    fn product_without_options_or_images_gets_empty_columns() {
        let url = ProductUrl::from_page_url("https://shop.test/products/gift-card");
        let payload = r#"{"id": "gc", "title": "Gift Card", "vendor": null, "variants": [{"id": 1, "title": "Default Title", "price": "25.00", "available": true}]}"#;
        let rows = extract_rows(&url, payload.as_bytes()).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].vendor, "");
        assert_eq!(rows[0].option_1_name, "");
        assert_eq!(rows[0].option_1_value, "");
        assert_eq!(rows[0].image_url, "");
    }

    #[test]
    fn numeric_text_fields_are_kept_as_their_literal_text() {
        let url = ProductUrl::from_page_url("https://shop.test/products/bolt");
        let payload = r#"{"id": 1, "title": 1984, "type": 7, "variants": [
            {"id": 2, "title": 10, "sku": 12345, "option1": 42, "option2": "A", "option3": 0.5, "price": "1.00", "available": true}
        ]}"#;
        let rows = extract_rows(&url, payload.as_bytes()).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].product_title, "1984");
        assert_eq!(rows[0].product_type, "7");
        assert_eq!(rows[0].variant_title, "10");
        assert_eq!(rows[0].sku, "12345");
        assert_eq!(rows[0].option_1_value, "42");
        assert_eq!(rows[0].option_2_value, "A");
        assert_eq!(rows[0].option_3_value, "0.5");
        assert_eq!(rows[0].variant_url, "https://shop.test/products/bolt?variant=2");
    }
}
