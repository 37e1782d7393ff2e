//! Resource keys for rate-limited external dependencies.
//!
//! External actors are addressed as `owner/name` in docs and dashboards but as
//! `owner~name` in the platform API. Both spellings must land in the same
//! limiter bucket and hit the same endpoint, so every key is normalized to the
//! `~` form on construction.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A normalized identifier for an external resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey(String);

impl ResourceKey {
    /// Normalize a raw identifier.
    ///
    /// Trims whitespace and rewrites the first `/` separator to `~`. Keys
    /// without an owner part are kept as-is.
    pub fn new(raw: &str) -> Self {
        let trimmed = raw.trim();
        match trimmed.split_once('/') {
            Some((owner, name)) if !owner.is_empty() && !name.is_empty() => {
                Self(format!("{}~{}", owner, name))
            }
            _ => Self(trimmed.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResourceKey {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

impl From<String> for ResourceKey {
    fn from(raw: String) -> Self {
        Self::new(&raw)
    }
}

impl Serialize for ResourceKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for ResourceKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::new(&raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slash_and_tilde_forms_are_equal() {
        assert_eq!(
            ResourceKey::new("apify/web-scraper"),
            ResourceKey::new("apify~web-scraper")
        );
    }

    #[test]
    fn normalized_form_uses_tilde() {
        assert_eq!(ResourceKey::new("apify/web-scraper").as_str(), "apify~web-scraper");
    }

    #[test]
    fn whitespace_is_trimmed() {
        assert_eq!(ResourceKey::new("  apify/x ").as_str(), "apify~x");
    }

    #[test]
    fn bare_key_is_unchanged() {
        assert_eq!(ResourceKey::new("nH2AHrwxeTRJoN5hX").as_str(), "nH2AHrwxeTRJoN5hX");
    }

    #[test]
    fn deserialize_normalizes() {
        let key: ResourceKey = serde_json::from_str("\"owner/actor\"").unwrap();
        assert_eq!(key.as_str(), "owner~actor");
    }
}
