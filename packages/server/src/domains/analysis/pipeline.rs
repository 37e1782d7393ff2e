//! Analysis step injected into the dispatcher.

use async_trait::async_trait;
use thiserror::Error;

use super::models::{DataSource, Finding, FindingSeverity, ListingAnalysis, ListingData};

#[derive(Debug, Clone, Error)]
pub enum StepError {
    /// May succeed if run again.
    #[error("transient analysis error: {0}")]
    Transient(String),

    #[error("fatal analysis error: {0}")]
    Fatal(String),
}

impl StepError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StepError::Transient(_))
    }
}

/// Turns fetched listing data into an analysis.
#[async_trait]
pub trait PipelineStep: Send + Sync {
    fn name(&self) -> &'static str;

    async fn analyze(
        &self,
        listing: &ListingData,
        source: DataSource,
    ) -> Result<ListingAnalysis, StepError>;
}

/// Rule-based listing quality scoring. Deterministic and offline.
#[derive(Debug, Clone, Default)]
pub struct HeuristicAnalyzer;

impl HeuristicAnalyzer {
    pub fn new() -> Self {
        Self
    }

    pub fn score(&self, listing: &ListingData) -> ListingAnalysis {
        let mut score: u32 = 0;
        let mut findings = Vec::new();
        let mut recommendations = Vec::new();

        let mut check = |passed: bool,
                         points: u32,
                         area: &str,
                         severity: FindingSeverity,
                         problem: &str,
                         advice: &str| {
            if passed {
                score += points;
            } else {
                findings.push(Finding {
                    area: area.to_string(),
                    severity,
                    message: problem.to_string(),
                });
                recommendations.push(advice.to_string());
            }
        };

        let title_len = listing.title.chars().count();
        check(
            (40..=150).contains(&title_len),
            20,
            "title",
            FindingSeverity::Warning,
            "title length is outside 40-150 characters",
            "Write a descriptive title with brand, product type and key attribute",
        );

        let description_len = listing.description.as_deref().map_or(0, |d| d.chars().count());
        check(
            description_len >= 200,
            20,
            "description",
            if description_len == 0 {
                FindingSeverity::Critical
            } else {
                FindingSeverity::Warning
            },
            "description is missing or too short",
            "Add a description of at least 200 characters covering features and use",
        );

        check(
            listing.image_urls.len() >= 3,
            15,
            "images",
            if listing.image_urls.is_empty() {
                FindingSeverity::Critical
            } else {
                FindingSeverity::Warning
            },
            "fewer than 3 images",
            "Add at least 3 images from different angles",
        );

        check(
            listing.price.is_some(),
            10,
            "price",
            FindingSeverity::Critical,
            "no price found",
            "Show a clear price",
        );

        check(
            listing.rating.is_some_and(|r| r >= 4.0),
            15,
            "reviews",
            FindingSeverity::Warning,
            "average rating below 4.0 or missing",
            "Address common complaints in reviews",
        );

        check(
            listing.review_count.is_some_and(|n| n >= 25),
            10,
            "reviews",
            FindingSeverity::Info,
            "fewer than 25 reviews",
            "Ask recent buyers for reviews",
        );

        check(
            listing.brand.is_some(),
            5,
            "brand",
            FindingSeverity::Info,
            "no brand information",
            "Name the brand or manufacturer",
        );

        check(
            listing.in_stock != Some(false),
            5,
            "availability",
            FindingSeverity::Warning,
            "listing is out of stock",
            "Restock or mark a restock date",
        );

        ListingAnalysis {
            score: score.min(100) as u8,
            findings,
            recommendations,
        }
    }
}

#[async_trait]
impl PipelineStep for HeuristicAnalyzer {
    fn name(&self) -> &'static str {
        "heuristic-analyzer"
    }

    async fn analyze(
        &self,
        listing: &ListingData,
        source: DataSource,
    ) -> Result<ListingAnalysis, StepError> {
        if listing.title.trim().is_empty() {
            return Err(StepError::Fatal("listing has no title".into()));
        }

        let mut analysis = self.score(listing);
        if source == DataSource::Synthetic {
            analysis.findings.push(Finding {
                area: "data".into(),
                severity: FindingSeverity::Info,
                message: "listing data could not be fetched; scores are estimates".into(),
            });
        }
        Ok(analysis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn complete_listing() -> ListingData {
        ListingData {
            url: "https://example.com/item/1".into(),
            title: "Oakline Walnut Standing Desk with Adjustable Height, 48 inch".into(),
            description: Some("A solid walnut desk. ".repeat(12)),
            price: Some(499.0),
            currency: Some("USD".into()),
            brand: Some("Oakline".into()),
            image_urls: vec!["a".into(), "b".into(), "c".into()],
            rating: Some(4.7),
            review_count: Some(120),
            in_stock: Some(true),
        }
    }

    #[test]
    fn complete_listing_scores_full_marks() {
        let analysis = HeuristicAnalyzer::new().score(&complete_listing());
        assert_eq!(analysis.score, 100);
        assert!(analysis.findings.is_empty());
        assert!(analysis.recommendations.is_empty());
    }

    #[test]
    fn sparse_listing_gets_findings_for_each_gap() {
        let listing = ListingData {
            url: "https://example.com/item/2".into(),
            title: "Desk".into(),
            ..Default::default()
        };
        let analysis = HeuristicAnalyzer::new().score(&listing);

        // only the availability check passes (unknown stock is not penalised)
        assert_eq!(analysis.score, 5);
        assert_eq!(analysis.findings.len(), 7);
        assert_eq!(analysis.findings.len(), analysis.recommendations.len());
        assert!(analysis
            .findings
            .iter()
            .any(|f| f.area == "description" && f.severity == FindingSeverity::Critical));
    }

    #[tokio::test]
    async fn synthetic_source_is_flagged() {
        let analysis = HeuristicAnalyzer::new()
            .analyze(&complete_listing(), DataSource::Synthetic)
            .await
            .unwrap();
        assert!(analysis.findings.iter().any(|f| f.area == "data"));
    }

    #[tokio::test]
    async fn untitled_listing_is_fatal() {
        let err = HeuristicAnalyzer::new()
            .analyze(&ListingData::default(), DataSource::Scraped)
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
    }
}
