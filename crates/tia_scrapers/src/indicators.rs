use lazy_static::lazy_static;
use regex::Regex;
use std::net::{Ipv4Addr, Ipv6Addr};
use tia_core::{IndicatorMap, IndicatorType};
use url::Url;

const DOMAIN_TLDS: &[&str] = &[
    "com", "net", "org", "edu", "gov", "mil", "int", "info", "biz", "name", "pro", "mobi", "app", "io",
    "ai", "dev", "cloud", "us", "uk", "ca", "au", "de", "fr", "jp", "cn", "ru", "br", "in", "it", "nl",
    "es", "ch", "se", "no", "fi", "dk", "ie", "at", "be", "nz", "sg", "ae", "security", "secure",
    "protection", "defense", "cyber", "tech",
];

/// Suffixes that make a "domain" match a file name instead.
const FILE_EXTENSIONS: &[&str] = &[
    "exe", "dll", "sys", "bat", "cmd", "vbs", "ps1", "msi", "jar", "py", "js", "docx", "doc", "pdf",
    "xls", "xlsx", "ppt", "pptx", "txt", "csv", "json", "xml", "html", "htm", "css", "jpg", "jpeg",
    "png", "gif", "bmp", "svg", "mp3", "mp4", "avi", "mov", "wmv", "zip", "rar", "7z", "tar", "gz",
    "log", "ini", "cfg",
];

const BENIGN_IPV4: &[&str] = &[
    "0.0.0.0", "127.0.0.1", "255.255.255.255", "1.0.0.1", "1.1.1.1", "8.8.8.8", "8.8.4.4",
];

const PLACEHOLDER_DOMAINS: &[&str] = &[
    "example.com", "domain.com", "test.com", "company.com", "yourcompany.com", "attacker.com",
    "victim.com",
];

const URL_TRAILING_PUNCTUATION: &[char] = &['.', ',', ';', ':', '!', '?', '\''];

lazy_static! {
    static ref IPV4: Regex = Regex::new(
        r"\b(?:(?:25[0-5]|2[0-4]\d|1\d\d|[1-9]?\d)\.){3}(?:25[0-5]|2[0-4]\d|1\d\d|[1-9]?\d)\b"
    )
    .unwrap();
    // Loose candidate shape; see `ipv6_at` for the checks each match must pass.
    static ref IPV6: Regex = Regex::new(r"(?i)[0-9a-f]{0,4}(?::[0-9a-f]{0,4}){2,7}").unwrap();
    static ref DOMAIN: Regex = Regex::new(&format!(
        r"(?i)\b(?:[a-z0-9](?:[a-z0-9-]{{0,61}}[a-z0-9])?\.)+(?:{})\b",
        DOMAIN_TLDS.join("|")
    ))
    .unwrap();
    static ref URL: Regex = Regex::new(r#"(?i)\bhttps?://[^\s<>"'()\[\]{}]+"#).unwrap();
    static ref EMAIL: Regex = Regex::new(r"(?i)\b[a-z0-9._%+-]+@[a-z0-9.-]+\.[a-z]{2,}\b").unwrap();
    static ref CVE: Regex = Regex::new(r"(?i)\bCVE-\d{4}-\d{4,}\b").unwrap();
    static ref MD5: Regex = Regex::new(r"\b[a-fA-F0-9]{32}\b").unwrap();
    static ref SHA1: Regex = Regex::new(r"\b[a-fA-F0-9]{40}\b").unwrap();
    static ref SHA256: Regex = Regex::new(r"\b[a-fA-F0-9]{64}\b").unwrap();
    static ref MITRE: Regex = Regex::new(r"\b[Tt](\d{4})(?:\.(\d{3}))?\b").unwrap();
}

/// Where the article itself lives, so self-references can be dropped.
struct ArticleOrigin {
    url: String,
    host: String,
}

impl ArticleOrigin {
    fn parse(source_url: &str) -> Option<Self> {
        let url = Url::parse(source_url).ok()?;
        let host = url.host_str()?.trim_end_matches('.').to_ascii_lowercase();
        Some(Self {
            url: source_url.trim().to_string(),
            host,
        })
    }

    fn bare_host(&self) -> &str {
        self.host.strip_prefix("www.").unwrap_or(&self.host)
    }

    fn covers_domain(&self, domain: &str) -> bool {
        let bare = self.bare_host();
        domain == self.host
            || domain == bare
            || self.host.ends_with(&format!(".{}", domain))
            || domain.ends_with(&format!(".{}", bare))
    }

    fn covers_url(&self, url: &str) -> bool {
        url.trim_end_matches('/') == self.url.trim_end_matches('/')
            || Url::parse(url)
                .ok()
                .and_then(|u| u.host_str().map(|h| h.to_ascii_lowercase()))
                .map_or(false, |h| self.covers_domain(&h))
    }
}

fn is_placeholder_domain(domain: &str) -> bool {
    PLACEHOLDER_DOMAINS
        .iter()
        .any(|p| domain == *p || domain.ends_with(&format!(".{}", p)))
}

fn is_placeholder_url(url: &str) -> bool {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_ascii_lowercase()))
        .map_or(false, |h| is_placeholder_domain(&h))
}

fn is_address_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == ':'
}

/// Confirms an IPv6 candidate. The match must stand alone in the text, carry
/// at least two hex groups and one decimal digit, and parse as an address.
/// Scope operators such as `std::vector` or `Abc::Def` fail these checks.
fn ipv6_at(text: &str, m: regex::Match<'_>) -> Option<Ipv6Addr> {
    let before = text[..m.start()].chars().next_back();
    let after = text[m.end()..].chars().next();
    if before.map_or(false, is_address_char) || after.map_or(false, is_address_char) {
        return None;
    }
    let candidate = m.as_str();
    let groups = candidate.split(':').filter(|g| !g.is_empty()).count();
    if groups < 2 || !candidate.bytes().any(|b| b.is_ascii_digit()) {
        return None;
    }
    candidate.parse().ok()
}

/// Pulls indicators of compromise out of free text.
///
/// Values are normalized (hashes and domains lowercased, CVE ids uppercased,
/// technique ids as `T####` or `T####.###`) and deduplicated. Well-known
/// benign addresses, placeholder domains and references back to the
/// article's own site are left out. The same input always yields the same
/// map.
pub fn extract_indicators(text: &str, source_url: Option<&str>) -> IndicatorMap {
    let origin = source_url.and_then(ArticleOrigin::parse);
    let mut found = IndicatorMap::new();

    for m in IPV4.find_iter(text) {
        let value = m.as_str();
        if value.parse::<Ipv4Addr>().is_ok() && !BENIGN_IPV4.contains(&value) {
            found.insert(IndicatorType::Ipv4, value);
        }
    }

    for m in IPV6.find_iter(text) {
        if let Some(addr) = ipv6_at(text, m) {
            if !addr.is_unspecified() && !addr.is_loopback() {
                found.insert(IndicatorType::Ipv6, addr.to_string());
            }
        }
    }

    for m in DOMAIN.find_iter(text) {
        let domain = m.as_str().to_ascii_lowercase();
        let extension = domain.rsplit('.').next().unwrap_or_default();
        if FILE_EXTENSIONS.contains(&extension) || is_placeholder_domain(&domain) {
            continue;
        }
        if origin.as_ref().map_or(false, |o| o.covers_domain(&domain)) {
            continue;
        }
        found.insert(IndicatorType::Domain, domain);
    }

    for m in URL.find_iter(text) {
        let url = m.as_str().trim_end_matches(URL_TRAILING_PUNCTUATION);
        if is_placeholder_url(url) || origin.as_ref().map_or(false, |o| o.covers_url(url)) {
            continue;
        }
        found.insert(IndicatorType::Url, url);
    }

    for m in EMAIL.find_iter(text) {
        found.insert(IndicatorType::Email, m.as_str().to_ascii_lowercase());
    }

    for m in CVE.find_iter(text) {
        found.insert(IndicatorType::Cve, m.as_str().to_ascii_uppercase());
    }

    for (kind, pattern) in [
        (IndicatorType::Md5, &*MD5),
        (IndicatorType::Sha1, &*SHA1),
        (IndicatorType::Sha256, &*SHA256),
    ] {
        for m in pattern.find_iter(text) {
            let value = m.as_str();
            // All-digit runs are ids or timestamps, not digests.
            if value.bytes().all(|b| b.is_ascii_digit()) {
                continue;
            }
            found.insert(kind, value.to_ascii_lowercase());
        }
    }

    for caps in MITRE.captures_iter(text) {
        let id = match caps.get(2) {
            Some(sub) => format!("T{}.{}", &caps[1], sub.as_str()),
            None => format!("T{}", &caps[1]),
        };
        found.insert(IndicatorType::MitreTechnique, id);
    }

    found
}

#[cfg(test)]
mod tests {
    use super::*;

    const REPORT: &str = r#"
The operators behind CVE-2024-3400 staged payloads on 45.137.21.9 and 2001:db8:85a3::8a2e:370:7334.
Victims were redirected to https://login-update.net/verify?id=77, then to http://cdn.badhost.ru/a.js.
Contact was made from ops@evil-mail.com. Resolver traffic to 8.8.8.8 and 127.0.0.1 is benign.
Dropper MD5 44D88612FEA8A8F36DE82E1278ABB02F, SHA1 3395856ce81f2b7382dee72602f798b642f14140 and
SHA256 275a021bbfb6489e54d471899f7db9d1663fc695ec2fe2a2c4538aabf651fd0f were recovered.
Order number 12345678901234567890123456789012 is unrelated.
Techniques: T1566.001 (spearphishing) and t1059. The loader was named invoice.pdf.
See example.com for the template and www.securenews.com/archive for older coverage.
"#;

    fn values(map: &IndicatorMap, kind: IndicatorType) -> Vec<String> {
        map.get(kind).map(|s| s.iter().cloned().collect()).unwrap_or_default()
    }

    #[test]
    fn test_extracts_each_indicator_type() {
        let map = extract_indicators(REPORT, Some("https://www.securenews.com/2024/loader"));

        assert_eq!(values(&map, IndicatorType::Ipv4), vec!["45.137.21.9"]);
        assert_eq!(values(&map, IndicatorType::Ipv6), vec!["2001:db8:85a3::8a2e:370:7334"]);
        assert_eq!(values(&map, IndicatorType::Cve), vec!["CVE-2024-3400"]);
        assert_eq!(values(&map, IndicatorType::Email), vec!["ops@evil-mail.com"]);
        assert_eq!(values(&map, IndicatorType::Md5), vec!["44d88612fea8a8f36de82e1278abb02f"]);
        assert_eq!(values(&map, IndicatorType::Sha1), vec!["3395856ce81f2b7382dee72602f798b642f14140"]);
        assert_eq!(
            values(&map, IndicatorType::Sha256),
            vec!["275a021bbfb6489e54d471899f7db9d1663fc695ec2fe2a2c4538aabf651fd0f"]
        );
        assert_eq!(values(&map, IndicatorType::MitreTechnique), vec!["T1059", "T1566.001"]);
        assert_eq!(
            values(&map, IndicatorType::Url),
            vec!["http://cdn.badhost.ru/a.js", "https://login-update.net/verify?id=77"]
        );

        let domains = values(&map, IndicatorType::Domain);
        assert!(domains.contains(&"login-update.net".to_string()));
        assert!(domains.contains(&"cdn.badhost.ru".to_string()));
        assert!(domains.contains(&"evil-mail.com".to_string()));
    }

    #[test]
    fn test_filters_benign_and_self_references() {
        let map = extract_indicators(REPORT, Some("https://www.securenews.com/2024/loader"));
        let domains = values(&map, IndicatorType::Domain);
        assert!(!domains.iter().any(|d| d.contains("securenews")), "{:?}", domains);
        assert!(!domains.contains(&"example.com".to_string()));
        assert!(!domains.iter().any(|d| d.ends_with(".pdf")));
        assert!(!values(&map, IndicatorType::Ipv4).contains(&"8.8.8.8".to_string()));
        assert!(values(&map, IndicatorType::Md5).iter().all(|h| !h.starts_with("1234")));

        // Without a source URL the article's own site counts as an indicator.
        let map = extract_indicators(REPORT, None);
        assert!(values(&map, IndicatorType::Domain).contains(&"www.securenews.com".to_string()));
    }

    #[test]
    fn test_extraction_is_deterministic() {
        let first = extract_indicators(REPORT, Some("https://www.securenews.com/2024/loader"));
        let second = extract_indicators(REPORT, Some("https://www.securenews.com/2024/loader"));
        assert_eq!(first, second);
        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second).unwrap()
        );
    }

    #[test]
    fn test_duplicates_collapse_after_normalization() {
        let text = "cve-2023-1234 CVE-2023-1234 Evil.COM evil.com T1003 t1003";
        let map = extract_indicators(text, None);
        assert_eq!(values(&map, IndicatorType::Cve), vec!["CVE-2023-1234"]);
        assert_eq!(values(&map, IndicatorType::Domain), vec!["evil.com"]);
        assert_eq!(values(&map, IndicatorType::MitreTechnique), vec!["T1003"]);
    }

    #[test]
    fn test_urls_lose_trailing_punctuation_and_self_links() {
        let text = "Read https://malware-drop.io/p/1. Also https://news.site.com/other-story, and https://www.example.com/x";
        let map = extract_indicators(text, Some("https://news.site.com/story"));
        assert_eq!(values(&map, IndicatorType::Url), vec!["https://malware-drop.io/p/1"]);
    }

    #[test]
    fn test_scope_operators_are_not_ipv6() {
        let text = "The stager ran [System.Convert]::FromBase64String($p) and std::vector, then Abc::Def.";
        let map = extract_indicators(text, None);
        assert_eq!(values(&map, IndicatorType::Ipv6).len(), 0);

        let map = extract_indicators("Beacons to fe80::1 and (2001:db8::2a), not ::1 or x2001:db8::3.", None);
        assert_eq!(values(&map, IndicatorType::Ipv6), vec!["2001:db8::2a", "fe80::1"]);
    }

    #[test]
    fn test_plain_prose_has_no_indicators() {
        let map = extract_indicators("Nothing to see here, just a quiet week in security news.", None);
        assert!(map.is_empty());
    }
}
