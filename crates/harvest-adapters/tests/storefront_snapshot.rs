use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use harvest_adapters::{extract_rows, SitemapIndexer, SitemapSelection};
use harvest_core::{ProductUrl, VariantRow};
use harvest_storage::{FetchError, PageSource};

fn fixture_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .join("fixtures")
        .join("storefront")
        .join("sample")
}

/// Serves the sample storefront from disk under `https://shop.example`.
struct FixtureSource {
    routes: HashMap<String, PathBuf>,
}

impl FixtureSource {
    fn sample() -> Self {
        let dir = fixture_dir();
        let routes = [
            ("https://shop.example/sitemap.xml", dir.join("sitemap.xml")),
            (
                "https://shop.example/sitemap_products_1.xml?from=1&to=900",
                dir.join("sitemap_products_1.xml"),
            ),
            (
                "https://shop.example/products/walnut-desk.js",
                dir.join("products/walnut-desk.js"),
            ),
            (
                "https://shop.example/products/linen-throw.js",
                dir.join("products/linen-throw.js"),
            ),
        ]
        .into_iter()
        .map(|(url, path)| (url.to_string(), path))
        .collect();
        Self { routes }
    }
}

#[async_trait]
impl PageSource for FixtureSource {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        match self.routes.get(url) {
            Some(path) => Ok(fs::read(path).expect("read fixture")),
            None => Err(FetchError::HttpStatus {
                status: 404,
                url: url.to_string(),
            }),
        }
    }
}

fn read_snapshot() -> Vec<VariantRow> {
    let text = fs::read_to_string(fixture_dir().join("snapshot.json")).expect("read snapshot");
    serde_json::from_str(&text).expect("parse snapshot")
}

#[tokio::test]
async fn sample_storefront_matches_snapshot() {
    let source = FixtureSource::sample();
    let selection = SitemapSelection {
        url_contains: Some("/products/".into()),
        ..SitemapSelection::default()
    };
    let catalog = SitemapIndexer::new(&source, selection)
        .index("https://shop.example", None)
        .await
        .expect("index");

    assert_eq!(catalog.sitemaps_listed, 2);
    assert_eq!(catalog.sitemaps_failed, 1);
    assert_eq!(
        catalog.page_urls,
        vec![
            "https://shop.example/products/walnut-desk".to_string(),
            "https://shop.example/products/linen-throw/".to_string(),
        ]
    );

    let mut rows = Vec::new();
    for page in &catalog.page_urls {
        let url = ProductUrl::from_page_url(page);
        let bytes = source.fetch(&url.payload_url()).await.expect("payload");
        rows.extend(extract_rows(&url, &bytes).expect("rows"));
    }

    assert_eq!(rows, read_snapshot());
}
