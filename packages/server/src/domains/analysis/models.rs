//! Result payloads stored on completed jobs.

use serde::{Deserialize, Serialize};

/// Where the listing data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DataSource {
    /// Fetched from the scraping platform.
    #[default]
    Scraped,
    /// Generated locally after the fetch failed. Not authoritative.
    Synthetic,
}

impl DataSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataSource::Scraped => "scraped",
            DataSource::Synthetic => "synthetic",
        }
    }
}

/// Normalized view of one product listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ListingData {
    pub url: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub brand: Option<String>,
    #[serde(default)]
    pub image_urls: Vec<String>,
    #[serde(default)]
    pub rating: Option<f64>,
    #[serde(default)]
    pub review_count: Option<u32>,
    #[serde(default)]
    pub in_stock: Option<bool>,
}

/// Severity of a finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingSeverity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Finding {
    pub area: String,
    pub severity: FindingSeverity,
    pub message: String,
}

/// Output of the analysis step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListingAnalysis {
    /// 0..=100
    pub score: u8,
    pub findings: Vec<Finding>,
    pub recommendations: Vec<String>,
}

/// Everything a completed job carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisResult {
    pub listing: ListingData,
    pub analysis: ListingAnalysis,
    pub data_source: DataSource,
}

impl AnalysisResult {
    pub fn is_degraded(&self) -> bool {
        self.data_source == DataSource::Synthetic
    }

    /// Structural checks applied before a result is persisted.
    pub fn check(&self) -> Result<(), String> {
        if self.listing.url.trim().is_empty() {
            return Err("listing.url is empty".into());
        }
        if self.analysis.score > 100 {
            return Err(format!("analysis.score {} is above 100", self.analysis.score));
        }
        if let Some(price) = self.listing.price {
            if !price.is_finite() || price < 0.0 {
                return Err(format!("listing.price {price} is not a valid amount"));
            }
        }
        if let Some(rating) = self.listing.rating {
            if !(0.0..=5.0).contains(&rating) {
                return Err(format!("listing.rating {rating} is outside 0..=5"));
            }
        }
        Ok(())
    }
}
