use serde::{Deserialize, Serialize};

/// A start URL entry as accepted by Apify scraper actors.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StartUrl {
    pub url: String,
}

impl StartUrl {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_url_serializes_as_object() {
        let value = serde_json::to_value(StartUrl::new("https://example.com/p/1")).unwrap();
        assert_eq!(value, serde_json::json!({ "url": "https://example.com/p/1" }));
    }
}
