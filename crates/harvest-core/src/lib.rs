//! Core catalog model for the storefront harvester.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};

pub const CRATE_NAME: &str = "harvest-core";

/// Suffix appended to a product page location to reach its JSON payload.
pub const PAYLOAD_SUFFIX: &str = ".js";

/// Fixed output column order shared by every row sink.
pub const COLUMNS: [&str; 18] = [
    "product_id",
    "product_title",
    "vendor",
    "type",
    "handle",
    "variant_id",
    "variant_title",
    "sku",
    "option_1_name",
    "option_1_value",
    "option_2_name",
    "option_2_value",
    "option_3_name",
    "option_3_value",
    "variant_price",
    "available",
    "variant_url",
    "image_url",
];

/// A product page location and the payload locator derived from it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProductUrl {
    base: String,
}

impl ProductUrl {
    /// Derive from a sitemap `loc`: surrounding whitespace and trailing slashes are dropped.
    pub fn from_page_url(page_url: &str) -> Self {
        Self {
            base: page_url.trim().trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base
    }

    pub fn payload_url(&self) -> String {
        format!("{}{}", self.base, PAYLOAD_SUFFIX)
    }

    pub fn variant_url(&self, variant_id: &str) -> String {
        format!("{}?variant={}", self.base, variant_id)
    }
}

impl fmt::Display for ProductUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.base)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FetchState {
    Pending,
    InFlight,
    Completed,
    Failed,
}

impl FetchState {
    pub fn is_terminal(self) -> bool {
        matches!(self, FetchState::Completed | FetchState::Failed)
    }
}

/// One admitted payload fetch. Moves forward only: Pending -> InFlight -> Completed | Failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchTask {
    pub position: usize,
    pub url: ProductUrl,
    state: FetchState,
}

impl FetchTask {
    pub fn new(position: usize, url: ProductUrl) -> Self {
        Self {
            position,
            url,
            state: FetchState::Pending,
        }
    }

    pub fn state(&self) -> FetchState {
        self.state
    }

    /// Returns false and leaves the task untouched when the transition would go backwards
    /// or leave a terminal state.
    pub fn transition(&mut self, next: FetchState) -> bool {
        let allowed = matches!(
            (self.state, next),
            (FetchState::Pending, FetchState::InFlight)
                | (FetchState::InFlight, FetchState::Completed)
                | (FetchState::InFlight, FetchState::Failed)
        );
        if allowed {
            self.state = next;
        }
        allowed
    }
}

/// JSON scalar rendered as text. Storefront payloads mix numeric and string ids and prices.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(transparent)]
pub struct Scalar(pub String);

impl Scalar {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawScalar {
    Text(String),
    Unsigned(u64),
    Signed(i64),
    Float(f64),
    Bool(bool),
}

impl<'de> Deserialize<'de> for Scalar {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Option::<RawScalar>::deserialize(deserializer)?;
        Ok(Scalar(match raw {
            Some(RawScalar::Text(s)) => s,
            Some(RawScalar::Unsigned(n)) => n.to_string(),
            Some(RawScalar::Signed(n)) => n.to_string(),
            Some(RawScalar::Float(n)) => n.to_string(),
            Some(RawScalar::Bool(b)) => b.to_string(),
            None => String::new(),
        }))
    }
}

/// Product option header. Accepts `{"name": ..}` objects as well as bare strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProductOption {
    pub name: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawOption {
    Named { name: String },
    Bare(String),
}

impl<'de> Deserialize<'de> for ProductOption {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = match RawOption::deserialize(deserializer)? {
            RawOption::Named { name } | RawOption::Bare(name) => name,
        };
        Ok(ProductOption { name })
    }
}

/// Image reference. Accepts bare URL strings and `{"src": ..}` objects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ImageRef(pub String);

#[derive(Deserialize)]
#[serde(untagged)]
enum RawImage {
    Bare(String),
    Object { src: String },
}

impl<'de> Deserialize<'de> for ImageRef {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let src = match RawImage::deserialize(deserializer)? {
            RawImage::Bare(src) | RawImage::Object { src } => src,
        };
        Ok(ImageRef(src))
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variant {
    pub id: Scalar,
    #[serde(default)]
    pub title: Scalar,
    #[serde(default)]
    pub sku: Option<Scalar>,
    #[serde(default)]
    pub option1: Option<Scalar>,
    #[serde(default)]
    pub option2: Option<Scalar>,
    #[serde(default)]
    pub option3: Option<Scalar>,
    #[serde(default)]
    pub price: Scalar,
    #[serde(default, deserialize_with = "null_as_default")]
    pub available: bool,
}

impl Variant {
    pub fn option_value(&self, index: usize) -> Option<&str> {
        let value = match index {
            0 => self.option1.as_ref(),
            1 => self.option2.as_ref(),
            2 => self.option3.as_ref(),
            _ => None,
        };
        value.map(Scalar::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductPayload {
    pub id: Scalar,
    #[serde(default)]
    pub title: Scalar,
    #[serde(default)]
    pub vendor: Scalar,
    #[serde(rename = "type", default)]
    pub product_type: Scalar,
    #[serde(default)]
    pub handle: Scalar,
    #[serde(default, deserialize_with = "null_as_default")]
    pub options: Vec<ProductOption>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub images: Vec<ImageRef>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub variants: Vec<Variant>,
}

impl ProductPayload {
    pub fn option_name(&self, index: usize) -> Option<&str> {
        self.options.get(index).map(|o| o.name.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariantRow {
    pub product_id: String,
    pub product_title: String,
    pub vendor: String,
    #[serde(rename = "type")]
    pub product_type: String,
    pub handle: String,
    pub variant_id: String,
    pub variant_title: String,
    pub sku: String,
    pub option_1_name: String,
    pub option_1_value: String,
    pub option_2_name: String,
    pub option_2_value: String,
    pub option_3_name: String,
    pub option_3_value: String,
    pub variant_price: String,
    pub available: String,
    pub variant_url: String,
    pub image_url: String,
}

impl VariantRow {
    pub fn fields(&self) -> [&str; 18] {
        [
            self.product_id.as_str(),
            self.product_title.as_str(),
            self.vendor.as_str(),
            self.product_type.as_str(),
            self.handle.as_str(),
            self.variant_id.as_str(),
            self.variant_title.as_str(),
            self.sku.as_str(),
            self.option_1_name.as_str(),
            self.option_1_value.as_str(),
            self.option_2_name.as_str(),
            self.option_2_value.as_str(),
            self.option_3_name.as_str(),
            self.option_3_value.as_str(),
            self.variant_price.as_str(),
            self.available.as_str(),
            self.variant_url.as_str(),
            self.image_url.as_str(),
        ]
    }
}

/// Offset/size window over the global ordered URL sequence. `size == 0` means unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BatchWindow {
    pub start: usize,
    pub size: usize,
}

impl BatchWindow {
    pub fn new(start: usize, size: usize) -> Self {
        Self { start, size }
    }

    pub fn unbounded() -> Self {
        Self::default()
    }

    pub fn is_unbounded(&self) -> bool {
        self.size == 0
    }

    /// Number of leading positions that must be materialized to fill the window, if bounded.
    pub fn end(&self) -> Option<usize> {
        if self.is_unbounded() {
            None
        } else {
            Some(self.start.saturating_add(self.size))
        }
    }

    pub fn slice<T: Clone>(&self, items: &[T]) -> Vec<T> {
        self.apply(items.iter().cloned())
    }

    pub fn apply<T, I: IntoIterator<Item = T>>(&self, items: I) -> Vec<T> {
        let take = if self.is_unbounded() { usize::MAX } else { self.size };
        items.into_iter().skip(self.start).take(take).collect()
    }
}

pub trait SeenStore: Send {
    /// Records `url`; returns true when it had not been seen before.
    fn insert(&mut self, url: &str) -> bool;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Default)]
pub struct InMemorySeenStore {
    urls: HashSet<String>,
}

impl InMemorySeenStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SeenStore for InMemorySeenStore {
    fn insert(&mut self, url: &str) -> bool {
        self.urls.insert(url.to_string())
    }

    fn len(&self) -> usize {
        self.urls.len()
    }
}
