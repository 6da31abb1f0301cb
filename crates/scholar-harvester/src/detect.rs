//! Block detection.
//!
//! A response is blocked when its body carries a known captcha / rate-limit phrase, or
//! when it ended up on a different host than the one requested (the source redirects
//! to a verification page). Host mismatch also flags legitimate cross-host redirects,
//! e.g. a regional domain; that behaviour is kept and pinned by fixture tests.

use url::Url;

use crate::client::{PageRequest, SignatureSet};

/// Phrases the profile source shows on captcha and rate-limit pages.
pub const SCHOLAR_SIGNATURES: &[&str] = &[
    "captcha",
    "recaptcha",
    "unusual traffic",
    "automated queries",
    "our systems have detected",
    "sorry, we have detected",
    "gs_captcha_ccl",
    "rc-doscaptcha-body",
];

/// Narrower set for third-party pages, many of which embed a captcha widget on
/// perfectly usable pages.
pub const CHALLENGE_SIGNATURES: &[&str] = &[
    "unusual traffic",
    "gs_captcha_ccl",
    "captcha-form",
    "rc-doscaptcha-body",
];

/// Classifies fetched pages as blocked or usable.
#[derive(Debug, Clone)]
pub struct BlockDetector {
    expected_host: String,
    signatures: &'static [&'static str],
}

impl BlockDetector {
    /// Detector expecting responses from `expected_host`.
    #[must_use]
    pub fn new(expected_host: impl Into<String>, signatures: &'static [&'static str]) -> Self {
        Self { expected_host: expected_host.into().to_ascii_lowercase(), signatures }
    }

    /// Detector for a request: expected host is the request's override or its URL host.
    #[must_use]
    pub fn for_request(request: &PageRequest) -> Self {
        let host = request
            .expected_host
            .clone()
            .or_else(|| host_of(&request.url))
            .unwrap_or_default();
        let signatures = match request.signatures {
            SignatureSet::Scholar => SCHOLAR_SIGNATURES,
            SignatureSet::Challenge => CHALLENGE_SIGNATURES,
        };
        Self::new(host, signatures)
    }

    /// Host the response must come from.
    #[must_use]
    pub fn expected_host(&self) -> &str {
        &self.expected_host
    }

    /// Pure classification of `(final_url, body)`.
    #[must_use]
    pub fn is_blocked(&self, final_url: &str, body: &str) -> bool {
        self.matched_signature(body).is_some() || !self.host_matches(final_url)
    }

    /// First signature found in `body`, case-insensitively.
    #[must_use]
    pub fn matched_signature(&self, body: &str) -> Option<&'static str> {
        let lower = body.to_lowercase();
        self.signatures.iter().copied().find(|sig| lower.contains(sig))
    }

    fn host_matches(&self, final_url: &str) -> bool {
        // An unparseable final URL cannot be attributed to the source.
        host_of(final_url).is_some_and(|host| host == self.expected_host)
    }
}

fn host_of(url: &str) -> Option<String> {
    Url::parse(url).ok()?.host_str().map(str::to_ascii_lowercase)
}
