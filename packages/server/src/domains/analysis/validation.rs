//! Creation contract for analysis jobs.
//!
//! Every rule is checked and every violation reported, so a client can fix
//! a request in one round trip.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use url::{Host, Url};

static TOKEN_CHARS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").unwrap());

pub const MIN_TOKEN_LEN: usize = 8;
pub const MAX_TOKEN_LEN: usize = 128;
pub const MAX_URL_LEN: usize = 2048;
pub const MAX_RETRIES_CEILING: i32 = 10;

/// One broken rule on one input field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldViolation {
    pub field: String,
    pub message: String,
}

impl FieldViolation {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// All violations found in one request. Never empty when returned as an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationErrors {
    pub violations: Vec<FieldViolation>,
}

impl ValidationErrors {
    pub fn single(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            violations: vec![FieldViolation::new(field, message)],
        }
    }

    pub fn has_field(&self, field: &str) -> bool {
        self.violations.iter().any(|v| v.field == field)
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .violations
            .iter()
            .map(|v| format!("{}: {}", v.field, v.message))
            .collect();
        write!(f, "validation failed: {}", parts.join("; "))
    }
}

impl std::error::Error for ValidationErrors {}

/// Knobs for creation-time validation.
#[derive(Debug, Clone, Default)]
pub struct ValidationPolicy {
    /// When set, only these hosts (and their subdomains) may be analysed.
    pub allowed_hosts: Option<Vec<String>>,
}

impl ValidationPolicy {
    pub fn with_allowed_hosts(hosts: Vec<String>) -> Self {
        let hosts: Vec<String> = hosts
            .into_iter()
            .map(|h| h.trim().to_ascii_lowercase())
            .filter(|h| !h.is_empty())
            .collect();
        Self {
            allowed_hosts: (!hosts.is_empty()).then_some(hosts),
        }
    }

    /// Check a creation request, collecting every violation.
    pub fn validate(&self, token: &str, url: &str, max_retries: i32) -> Result<(), ValidationErrors> {
        let mut violations = Vec::new();

        violations.extend(check_token(token));
        violations.extend(self.check_url(url));

        if !(0..=MAX_RETRIES_CEILING).contains(&max_retries) {
            violations.push(FieldViolation::new(
                "maxRetries",
                format!("must be between 0 and {MAX_RETRIES_CEILING}"),
            ));
        }

        if violations.is_empty() {
            Ok(())
        } else {
            Err(ValidationErrors { violations })
        }
    }

    fn check_url(&self, raw: &str) -> Vec<FieldViolation> {
        let mut out = Vec::new();
        let raw = raw.trim();

        if raw.is_empty() {
            out.push(FieldViolation::new("url", "is required"));
            return out;
        }
        if raw.len() > MAX_URL_LEN {
            out.push(FieldViolation::new(
                "url",
                format!("must be at most {MAX_URL_LEN} characters"),
            ));
        }

        let parsed = match Url::parse(raw) {
            Ok(parsed) => parsed,
            Err(e) => {
                out.push(FieldViolation::new("url", format!("is not a valid URL ({e})")));
                return out;
            }
        };

        if !matches!(parsed.scheme(), "http" | "https") {
            out.push(FieldViolation::new("url", "must use http or https"));
        }
        if !parsed.username().is_empty() || parsed.password().is_some() {
            out.push(FieldViolation::new("url", "must not embed credentials"));
        }

        match parsed.host() {
            None => out.push(FieldViolation::new("url", "must include a host")),
            Some(host) => {
                if is_internal_host(&host) {
                    out.push(FieldViolation::new("url", "must not target a private or local address"));
                } else if let Some(allowed) = &self.allowed_hosts {
                    let host = host.to_string().to_ascii_lowercase();
                    if !allowed
                        .iter()
                        .any(|a| host == *a || host.ends_with(&format!(".{a}")))
                    {
                        out.push(FieldViolation::new("url", format!("host {host} is not supported")));
                    }
                }
            }
        }

        out
    }
}

fn check_token(token: &str) -> Vec<FieldViolation> {
    let mut out = Vec::new();
    let len = token.chars().count();

    if len < MIN_TOKEN_LEN {
        out.push(FieldViolation::new(
            "token",
            format!("must be at least {MIN_TOKEN_LEN} characters"),
        ));
    }
    if len > MAX_TOKEN_LEN {
        out.push(FieldViolation::new(
            "token",
            format!("must be at most {MAX_TOKEN_LEN} characters"),
        ));
    }
    if !token.is_empty() && !TOKEN_CHARS.is_match(token) {
        out.push(FieldViolation::new(
            "token",
            "may only contain letters, digits, '-' and '_'",
        ));
    }

    out
}

fn is_internal_host(host: &Host<&str>) -> bool {
    match host {
        Host::Domain(domain) => {
            let domain = domain.trim_end_matches('.').to_ascii_lowercase();
            domain == "localhost" || domain.ends_with(".localhost") || domain.ends_with(".internal")
        }
        Host::Ipv4(ip) => is_internal_v4(ip),
        Host::Ipv6(ip) => is_internal_ip(&IpAddr::V6(*ip)),
    }
}

fn is_internal_v4(ip: &Ipv4Addr) -> bool {
    ip.is_loopback()
        || ip.is_private()
        || ip.is_link_local()
        || ip.is_unspecified()
        || ip.is_broadcast()
        // carrier-grade NAT, 100.64.0.0/10
        || (ip.octets()[0] == 100 && (ip.octets()[1] & 0xc0) == 64)
}

fn is_internal_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_internal_v4(v4),
        IpAddr::V6(v6) => {
            if let Some(mapped) = v6.to_ipv4_mapped() {
                return is_internal_v4(&mapped);
            }
            v6.is_loopback() || v6.is_unspecified() || is_unique_local(v6) || is_unicast_link_local(v6)
        }
    }
}

fn is_unique_local(ip: &Ipv6Addr) -> bool {
    (ip.segments()[0] & 0xfe00) == 0xfc00
}

fn is_unicast_link_local(ip: &Ipv6Addr) -> bool {
    (ip.segments()[0] & 0xffc0) == 0xfe80
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOKEN: &str = "anon_4f9c2e1b";

    fn validate(token: &str, url: &str) -> Result<(), ValidationErrors> {
        ValidationPolicy::default().validate(token, url, 2)
    }

    #[test]
    fn accepts_public_https_listing() {
        assert!(validate(TOKEN, "https://example.com/item/123").is_ok());
        assert!(validate(TOKEN, "http://shop.example.co.uk/p?id=9").is_ok());
    }

    #[test]
    fn reports_every_violation_not_just_the_first() {
        let err = ValidationPolicy::default()
            .validate("ab!", "ftp://example.com/x", 99)
            .unwrap_err();

        assert!(err.has_field("token"));
        assert!(err.has_field("url"));
        assert!(err.has_field("maxRetries"));
        // short and bad charset
        assert_eq!(err.violations.iter().filter(|v| v.field == "token").count(), 2);
    }

    #[test]
    fn rejects_empty_and_unparseable_urls() {
        assert!(validate(TOKEN, "").unwrap_err().has_field("url"));
        assert!(validate(TOKEN, "not a url").unwrap_err().has_field("url"));
    }

    #[test]
    fn rejects_internal_targets() {
        for url in [
            "http://localhost:8080/admin",
            "http://127.0.0.1/",
            "http://10.0.0.4/",
            "http://192.168.1.1/",
            "http://169.254.169.254/latest/meta-data",
            "http://[::1]/",
            "http://[fd00::1]/",
            "http://metadata.google.internal/",
        ] {
            let err = validate(TOKEN, url).unwrap_err();
            assert!(err.has_field("url"), "{url} should be rejected");
        }
    }

    #[test]
    fn rejects_embedded_credentials() {
        assert!(validate(TOKEN, "https://user:pw@example.com/")
            .unwrap_err()
            .has_field("url"));
    }

    #[test]
    fn allowlist_accepts_subdomains_only_of_listed_hosts() {
        let policy = ValidationPolicy::with_allowed_hosts(vec!["Example.com".into(), " ".into()]);

        assert!(policy.validate(TOKEN, "https://www.example.com/item/1", 0).is_ok());
        assert!(policy.validate(TOKEN, "https://example.com/item/1", 0).is_ok());
        assert!(policy
            .validate(TOKEN, "https://badexample.com/item/1", 0)
            .unwrap_err()
            .has_field("url"));
    }

    #[test]
    fn token_length_bounds() {
        assert!(validate(&"a".repeat(MIN_TOKEN_LEN), "https://example.com").is_ok());
        assert!(validate(&"a".repeat(MIN_TOKEN_LEN - 1), "https://example.com").is_err());
        assert!(validate(&"a".repeat(MAX_TOKEN_LEN + 1), "https://example.com").is_err());
    }

    #[test]
    fn display_lists_fields() {
        let err = validate("x", "").unwrap_err();
        let text = err.to_string();
        assert!(text.contains("token"));
        assert!(text.contains("url"));
    }
}
