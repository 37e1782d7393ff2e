//! Fetch phase: scrape the listing, or fall back to synthetic data.
//!
//! Transient failures, exhausted rate limits and unusable responses fall back
//! to a listing derived from a SHA-256 digest of the URL, so the same URL
//! always yields the same data, tagged [`DataSource::Synthetic`]. A fatal
//! response (4xx other than 429) means the scraper rejected the listing
//! itself; that is returned to the caller and fails the job.

use std::sync::Arc;

use apify_client::StartUrl;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use super::models::{DataSource, ListingData};
use crate::kernel::external::{CallOptions, ExternalCallClient, ExternalCallError, ExternalRequest};
use crate::kernel::resource_key::ResourceKey;

/// Result of the fetch phase.
#[derive(Debug, Clone)]
pub struct FetchOutcome {
    pub listing: ListingData,
    pub source: DataSource,
    /// Retries the external client spent, successful or not.
    pub retries: u32,
    /// Why the synthetic path was taken.
    pub fallback_reason: Option<String>,
}

pub struct ListingFetcher {
    client: Option<Arc<ExternalCallClient>>,
    resource_key: ResourceKey,
}

impl ListingFetcher {
    pub fn new(client: Arc<ExternalCallClient>, resource_key: impl Into<ResourceKey>) -> Self {
        Self {
            client: Some(client),
            resource_key: resource_key.into(),
        }
    }

    /// No scraping backend configured; every fetch is synthetic.
    pub fn synthetic_only() -> Self {
        Self {
            client: None,
            resource_key: ResourceKey::new("synthetic"),
        }
    }

    pub fn resource_key(&self) -> &ResourceKey {
        &self.resource_key
    }

    /// Fetch `url`, spending at most `retry_budget` retries on the scrape,
    /// and never more than the client's own retry policy allows.
    ///
    /// Only [`ExternalCallError::Fatal`] is returned as an error.
    pub async fn fetch(&self, url: &str, retry_budget: u32) -> Result<FetchOutcome, ExternalCallError> {
        let Some(client) = &self.client else {
            return Ok(synthetic(url, 0, "no scraping backend configured".into()));
        };

        let request = ExternalRequest::new(json!({
            "detailsUrls": [StartUrl::new(url)],
            "scrapeMode": "AUTO",
        }));
        let retries = retry_budget.min(client.policy().max_retries);
        let options = CallOptions::default().retries(retries);

        match client.execute(self.resource_key.clone(), &request, options).await {
            Ok(response) => {
                let retries = response.retries();
                Ok(match parse_listing(url, &response.body) {
                    Some(listing) => {
                        debug!(url, retries, "listing scraped");
                        FetchOutcome {
                            listing,
                            source: DataSource::Scraped,
                            retries,
                            fallback_reason: None,
                        }
                    }
                    None => synthetic(url, retries, "scrape returned no usable listing".into()),
                })
            }
            Err(e @ ExternalCallError::Fatal { .. }) => Err(e),
            Err(e) => Ok(synthetic(url, e.retries(), e.to_string())),
        }
    }
}

fn synthetic(url: &str, retries: u32, reason: String) -> FetchOutcome {
    warn!(url, reason = %reason, "falling back to synthetic listing data");
    FetchOutcome {
        listing: synthetic_listing(url),
        source: DataSource::Synthetic,
        retries,
        fallback_reason: Some(reason),
    }
}

/// Stable placeholder listing for a URL.
pub fn synthetic_listing(url: &str) -> ListingData {
    let digest = Sha256::digest(url.as_bytes());
    let word = |i: usize| u16::from_be_bytes([digest[i], digest[i + 1]]);

    let slug = url
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty() && !s.contains(':'))
        .unwrap_or("listing");
    let title = format!("{} {}", title_case(slug), hex::encode(&digest[..3]));

    let price_cents = 999 + u32::from(word(0)) % 49_000;
    let image_count = usize::from(digest[2] % 6);

    ListingData {
        url: url.to_string(),
        title,
        description: (digest[3] % 3 != 0)
            .then(|| format!("Listing details for {slug}.").repeat(1 + usize::from(digest[4] % 8))),
        price: Some(f64::from(price_cents) / 100.0),
        currency: Some("USD".into()),
        brand: (digest[5] % 2 == 0).then(|| format!("Brand {}", hex::encode(&digest[6..8]))),
        image_urls: (0..image_count)
            .map(|i| format!("https://images.invalid/{}/{i}.jpg", hex::encode(&digest[..8])))
            .collect(),
        rating: Some(3.0 + f64::from(digest[8] % 21) / 10.0),
        review_count: Some(u32::from(word(9)) % 500),
        in_stock: Some(digest[11] % 5 != 0),
    }
}

fn title_case(slug: &str) -> String {
    slug.split(['-', '_', '.'])
        .filter(|w| !w.is_empty())
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Map the first dataset item onto [`ListingData`]. `None` when no item has
/// a title.
pub fn parse_listing(url: &str, body: &Value) -> Option<ListingData> {
    let item = match body {
        Value::Array(items) => items.iter().find(|i| title_of(i).is_some())?,
        Value::Object(_) => body,
        _ => return None,
    };

    let offers = item.get("offers").map(|o| match o {
        Value::Array(list) => list.first().cloned().unwrap_or(Value::Null),
        other => other.clone(),
    });
    let offers = offers.as_ref();
    let rating = item.get("aggregateRating");

    Some(ListingData {
        url: str_field(item, "url").unwrap_or_else(|| url.to_string()),
        title: title_of(item)?,
        description: str_field(item, "description"),
        price: number(item.get("price")).or_else(|| number(offers.and_then(|o| o.get("price")))),
        currency: str_field(item, "currency")
            .or_else(|| offers.and_then(|o| str_field(o, "priceCurrency"))),
        brand: match item.get("brand") {
            Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
            Some(obj @ Value::Object(_)) => str_field(obj, "name"),
            _ => None,
        },
        image_urls: images(item),
        rating: number(item.get("rating"))
            .or_else(|| number(rating.and_then(|r| r.get("ratingValue")))),
        review_count: number(item.get("reviewCount"))
            .or_else(|| number(rating.and_then(|r| r.get("reviewCount"))))
            .map(|n| n.max(0.0) as u32),
        in_stock: item.get("inStock").and_then(Value::as_bool).or_else(|| {
            offers
                .and_then(|o| o.get("availability"))
                .and_then(Value::as_str)
                .map(|a| a.contains("InStock"))
        }),
    })
}

fn title_of(item: &Value) -> Option<String> {
    str_field(item, "title").or_else(|| str_field(item, "name"))
}

fn str_field(item: &Value, key: &str) -> Option<String> {
    item.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
}

fn number(value: Option<&Value>) -> Option<f64> {
    match value? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s
            .trim()
            .trim_start_matches(['$', '€', '£'])
            .replace(',', "")
            .parse()
            .ok(),
        _ => None,
    }
}

fn images(item: &Value) -> Vec<String> {
    let raw = item.get("images").or_else(|| item.get("image"));
    match raw {
        Some(Value::String(s)) => vec![s.clone()],
        Some(Value::Array(list)) => list
            .iter()
            .filter_map(|v| match v {
                Value::String(s) => Some(s.clone()),
                obj @ Value::Object(_) => str_field(obj, "url"),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}
