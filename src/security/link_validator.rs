use crate::config::ModerationConfig;
use crate::security::moderation::{ReasonCode, Rejection};
use regex::{Regex, RegexBuilder};
use tracing::debug;
use url::Url;

/// Patterns matched case-insensitively against the whole normalized URL.
pub const DEFAULT_MALICIOUS_URL_PATTERNS: &[&str] = &[
    // link shorteners hide the real destination
    r"://(?:[^/?#]*\.)?(?:bit\.ly|bitly\.com|tinyurl\.com|goo\.gl|t\.co|ow\.ly|is\.gd|buff\.ly|adf\.ly|rebrand\.ly|cutt\.ly|shorturl\.at|j\.mp|lnk\.co|short\.link)(?::\d+)?(?:[/?#]|$)",
    // direct downloads of executables and scripts
    r"://[^/?#]+/[^?#]*\.(?:exe|scr|bat|cmd|msi|vbs|vbe|ps1|jar|apk|dmg|pif|cpl|hta|wsf)(?:[?#]|$)",
    // clickbait giveaways
    r"\b(?:free|claim|win|won|winner)\b.*\b(?:iphone|cash|money|bitcoin|crypto|giftcards?|prizes?|rewards?)\b",
    r"\b(?:verify|update|confirm)[-_]?(?:your)?[-_]?(?:account|password|wallet)\b",
];

/// Hostnames containing any of these are rejected (substring match).
pub const DEFAULT_BLOCKED_DOMAINS: &[&str] = &[
    "t.me",
    "telegram.me",
    "telegram.org",
    "clickbank.net",
    "grabify.link",
    "iplogger.org",
    "iplogger.com",
    "2no.co",
    "blasze.com",
    "freegiftcards",
    "crypto-giveaway",
];

/// Link stage of the moderation pipeline.
#[derive(Clone)]
pub struct LinkValidator {
    malicious_patterns: Vec<Regex>,
    blocked_domains: Vec<String>,
}

impl LinkValidator {
    pub fn new(config: &ModerationConfig) -> Result<Self, regex::Error> {
        let malicious_patterns = config
            .malicious_url_patterns
            .iter()
            .map(|pattern| RegexBuilder::new(pattern).case_insensitive(true).build())
            .collect::<Result<Vec<_>, _>>()?;

        let blocked_domains = config
            .blocked_domains
            .iter()
            .map(|d| d.trim().to_lowercase())
            .filter(|d| !d.is_empty())
            .collect();

        Ok(Self {
            malicious_patterns,
            blocked_domains,
        })
    }

    /// Validate one user-supplied link.
    pub fn check(&self, link: &str) -> Result<(), Rejection> {
        let url = parse_http_url(link.trim()).ok_or_else(|| {
            Rejection::new(
                ReasonCode::InvalidUrl,
                "Link must be a valid http or https URL",
            )
        })?;

        // Url normalizes the scheme and host to lowercase
        let normalized = url.as_str();
        if self.malicious_patterns.iter().any(|re| re.is_match(normalized)) {
            debug!(url = %normalized, "Link matched malicious pattern");
            return Err(Rejection::new(
                ReasonCode::MaliciousUrl,
                "Link appears to be unsafe",
            ));
        }

        let host = url.host_str().unwrap_or_default().to_lowercase();
        if let Some(domain) = self.blocked_domains.iter().find(|d| host.contains(d.as_str())) {
            debug!(%host, %domain, "Link host is blocked");
            return Err(Rejection::new(
                ReasonCode::BlockedDomain,
                "Links to this domain are not allowed",
            ));
        }

        Ok(())
    }
}

/// Absolute http(s) URL with a host, or nothing.
fn parse_http_url(raw: &str) -> Option<Url> {
    let url = Url::parse(raw).ok()?;
    match url.scheme() {
        "http" | "https" => {}
        _ => return None,
    }
    url.host_str()?;
    Some(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator() -> LinkValidator {
        LinkValidator::new(&ModerationConfig::default()).unwrap()
    }

    fn code(result: Result<(), Rejection>) -> Option<ReasonCode> {
        result.err().map(|r| r.code)
    }

    #[test]
    fn test_valid_links() {
        let validator = validator();
        assert!(validator.check("https://example.com").is_ok());
        assert!(validator.check("http://blog.example.org/posts/12?ref=home").is_ok());
        assert!(validator.check("https://example.com/docs/setup.html").is_ok());
    }

    #[test]
    fn test_rejects_non_http_and_relative() {
        let validator = validator();
        for link in [
            "javascript:alert(1)",
            "ftp://example.com/file",
            "www.example.com",
            "/relative/path",
            "not a url",
            "",
        ] {
            assert_eq!(
                code(validator.check(link)),
                Some(ReasonCode::InvalidUrl),
                "Should reject: {:?}",
                link
            );
        }
    }

    #[test]
    fn test_rejects_shorteners() {
        let validator = validator();
        assert_eq!(
            code(validator.check("https://bit.ly/3abcd")),
            Some(ReasonCode::MaliciousUrl)
        );
        assert_eq!(
            code(validator.check("http://TinyURL.com/xyz")),
            Some(ReasonCode::MaliciousUrl)
        );
        // Suffix lookalikes are not shorteners
        assert!(validator.check("https://notbit.lyrics.example.com/").is_ok());
    }

    #[test]
    fn test_rejects_executable_downloads() {
        let validator = validator();
        assert_eq!(
            code(validator.check("https://example.com/setup.exe")),
            Some(ReasonCode::MaliciousUrl)
        );
        assert_eq!(
            code(validator.check("https://example.com/run.PS1?x=1")),
            Some(ReasonCode::MaliciousUrl)
        );
    }

    #[test]
    fn test_rejects_clickbait() {
        let validator = validator();
        assert_eq!(
            code(validator.check("https://example.com/claim-your-free-iphone")),
            Some(ReasonCode::MaliciousUrl)
        );
    }

    #[test]
    fn test_blocked_domain_substring() {
        let validator = validator();
        assert_eq!(
            code(validator.check("https://t.me/somechannel")),
            Some(ReasonCode::BlockedDomain)
        );
        assert_eq!(
            code(validator.check("https://cdn.iplogger.org/track")),
            Some(ReasonCode::BlockedDomain)
        );
    }
}
