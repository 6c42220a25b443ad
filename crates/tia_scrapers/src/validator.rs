use reqwest::{Client, StatusCode};
use std::collections::BTreeSet;
use std::time::Duration;
use tia_core::config::{ExtractionConfig, ValidationConfig};
use tia_core::{Result, ValidationError};
use tracing::{debug, info};
use url::{Host, Url};

/// Checks a submitted URL before anything is fetched from it.
pub struct UrlValidator {
    allowed_tlds: BTreeSet<String>,
    blocked_domains: Vec<String>,
    probe: Option<Client>,
}

fn normalize_domain(domain: &str) -> String {
    domain.trim().trim_end_matches('.').to_ascii_lowercase()
}

/// The key a URL is stored under: its parsed, serialized form, so the host
/// is lowercased and an empty path becomes `/`. Unparseable input is only
/// trimmed.
pub fn normalize_url(raw: &str) -> String {
    let candidate = raw.trim();
    Url::parse(candidate).map_or_else(|_| candidate.to_string(), |url| url.to_string())
}

impl UrlValidator {
    pub fn new(validation: &ValidationConfig, extraction: &ExtractionConfig) -> Result<Self> {
        let probe = if validation.probe_reachability {
            Some(
                Client::builder()
                    .timeout(Duration::from_secs(validation.probe_timeout_secs))
                    .user_agent(extraction.user_agent.as_str())
                    .build()?,
            )
        } else {
            None
        };

        Ok(Self {
            allowed_tlds: validation
                .allowed_tlds
                .iter()
                .map(|tld| normalize_domain(tld.trim_start_matches('.')))
                .filter(|tld| !tld.is_empty())
                .collect(),
            blocked_domains: validation
                .blocked_domains
                .iter()
                .map(|d| normalize_domain(d))
                .filter(|d| !d.is_empty())
                .collect(),
            probe,
        })
    }

    /// Static checks in order: syntax, scheme, host, TLD, blocklist.
    pub fn check(&self, raw: &str) -> std::result::Result<Url, ValidationError> {
        let candidate = raw.trim();
        if candidate.is_empty() {
            return Err(ValidationError::Malformed("empty URL".to_string()));
        }

        let url = Url::parse(candidate).map_err(|e| ValidationError::Malformed(format!("{}: {}", candidate, e)))?;

        match url.scheme() {
            "http" | "https" => {}
            other => return Err(ValidationError::InvalidProtocol(other.to_string())),
        }

        let host = url
            .host()
            .ok_or_else(|| ValidationError::MissingHost(candidate.to_string()))?;

        let domain = match host {
            Host::Domain(domain) => normalize_domain(domain),
            Host::Ipv4(addr) => addr.to_string(),
            Host::Ipv6(addr) => addr.to_string(),
        };
        if domain.is_empty() {
            return Err(ValidationError::MissingHost(candidate.to_string()));
        }

        if !self.allowed_tlds.is_empty() {
            let tld = match host {
                Host::Domain(_) => domain.rsplit('.').next(),
                // IP literals have no TLD to allow.
                Host::Ipv4(_) | Host::Ipv6(_) => None,
            };
            if !tld.map_or(false, |tld| self.allowed_tlds.contains(tld)) {
                return Err(ValidationError::DisallowedTld(domain));
            }
        }

        let blocked = self
            .blocked_domains
            .iter()
            .any(|b| domain == *b || domain.ends_with(&format!(".{}", b)));
        if blocked {
            return Err(ValidationError::BlockedDomain(domain));
        }

        debug!("URL passed validation: {}", url);
        Ok(url)
    }

    /// Static checks, then an optional live probe that must answer 200.
    pub async fn validate(&self, raw: &str) -> std::result::Result<Url, ValidationError> {
        let url = self.check(raw)?;
        let Some(client) = &self.probe else {
            return Ok(url);
        };

        info!("🔎 Probing {}", url);
        let response = client
            .get(url.as_str())
            .send()
            .await
            .map_err(|e| ValidationError::Unreachable(format!("{}: {}", url, e)))?;
        if response.status() != StatusCode::OK {
            return Err(ValidationError::Unreachable(format!(
                "{} answered HTTP {}",
                url,
                response.status().as_u16()
            )));
        }
        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{http_response, serve_once};

    fn validator() -> UrlValidator {
        let validation = ValidationConfig {
            blocked_domains: vec!["localhost".to_string(), "blocked.com".to_string()],
            ..ValidationConfig::default()
        };
        UrlValidator::new(&validation, &ExtractionConfig::default()).unwrap()
    }

    #[test]
    fn test_accepts_ordinary_article_urls() {
        let v = validator();
        for url in [
            "https://www.bleepingcomputer.com/news/security/new-loader/",
            "http://blog.example.org/post?id=7",
            "  https://unit42.paloaltonetworks.com/threat-brief  ",
            "https://WWW.CISA.GOV/news-events/alerts",
        ] {
            assert!(v.check(url).is_ok(), "{} rejected", url);
        }
    }

    #[test]
    fn test_rejects_non_http_schemes() {
        let v = validator();
        for url in ["ftp://files.example.com/report.pdf", "file:///etc/passwd", "javascript:alert(1)"] {
            assert!(
                matches!(v.check(url), Err(ValidationError::InvalidProtocol(_))),
                "{} should be rejected",
                url
            );
        }
        assert_eq!(
            v.check("ftp://files.example.com/report.pdf").unwrap_err(),
            ValidationError::InvalidProtocol("ftp".to_string())
        );
    }

    #[test]
    fn test_rejects_malformed_input() {
        let v = validator();
        for url in ["", "   ", "not a url", "www.example.com/path", "https://"] {
            assert!(matches!(v.check(url), Err(ValidationError::Malformed(_))), "{:?}", url);
        }
    }

    #[test]
    fn test_tld_allow_list() {
        let v = validator();
        assert_eq!(
            v.check("https://malicious.zzz/payload").unwrap_err(),
            ValidationError::DisallowedTld("malicious.zzz".to_string())
        );
        assert!(matches!(
            v.check("http://203.0.113.5/report"),
            Err(ValidationError::DisallowedTld(_))
        ));

        let open = ValidationConfig {
            allowed_tlds: Vec::new(),
            blocked_domains: Vec::new(),
            ..ValidationConfig::default()
        };
        let v = UrlValidator::new(&open, &ExtractionConfig::default()).unwrap();
        assert!(v.check("https://malicious.zzz/payload").is_ok());
        assert!(v.check("http://203.0.113.5/report").is_ok());
    }

    #[test]
    fn test_blocklist_covers_subdomains_only() {
        let v = validator();
        assert_eq!(
            v.check("https://news.blocked.com/a").unwrap_err(),
            ValidationError::BlockedDomain("news.blocked.com".to_string())
        );
        assert!(matches!(v.check("https://blocked.com"), Err(ValidationError::BlockedDomain(_))));
        assert!(v.check("https://notblocked.com/a").is_ok());
    }

    #[tokio::test]
    async fn test_validate_without_probe_is_offline() {
        let v = validator();
        let url = v.validate("https://www.securityweek.com/some-story").await.unwrap();
        assert_eq!(url.host_str(), Some("www.securityweek.com"));
        assert!(matches!(
            v.validate("ftp://www.securityweek.com").await,
            Err(ValidationError::InvalidProtocol(_))
        ));
    }

    fn reachability_validator() -> UrlValidator {
        let validation = ValidationConfig {
            allowed_tlds: Vec::new(),
            blocked_domains: Vec::new(),
            probe_reachability: true,
            probe_timeout_secs: 5,
        };
        UrlValidator::new(&validation, &ExtractionConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn test_reachability_check_accepts_live_page() {
        let url = serve_once(http_response("200 OK", "<html>ok</html>")).await;
        let validated = reachability_validator().validate(url.as_str()).await.unwrap();
        assert_eq!(validated, url);
    }

    #[tokio::test]
    async fn test_reachability_check_rejects_missing_page() {
        let url = serve_once(http_response("404 Not Found", "gone")).await;
        let err = reachability_validator().validate(url.as_str()).await.unwrap_err();
        assert!(matches!(err, ValidationError::Unreachable(ref m) if m.contains("404")), "{:?}", err);
    }

    #[test]
    fn test_normalize_url_matches_stored_key() {
        let v = validator();
        let raw = " https://WWW.SecureNews.com ";
        assert_eq!(normalize_url(raw), "https://www.securenews.com/");
        assert_eq!(normalize_url(raw), v.check(raw).unwrap().to_string());
        assert_eq!(normalize_url(" not a url "), "not a url");
    }
}
