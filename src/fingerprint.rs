//! Request header rotation for proxied clients.
//!
//! Every proxied client gets a User-Agent and Accept-Language drawn from
//! common desktop values so requests from different classes don't share a
//! stable header fingerprint.

use rand::seq::SliceRandom;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT_LANGUAGE, USER_AGENT};

/// Header pools used for proxied clients.
pub struct HeaderProfile;

impl HeaderProfile {
    pub const USER_AGENTS: &'static [&'static str] = &[
        "Mozilla/5.0 (X11; Linux x86_64; rv:115.0) Gecko/20100101 Firefox/115.0",
        "Mozilla/5.0 (Windows NT 10.0; rv:115.0) Gecko/20100101 Firefox/115.0",
        "Mozilla/5.0 (Macintosh; Intel Mac OS X 10.15; rv:115.0) Gecko/20100101 Firefox/115.0",
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
        "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.1 Safari/605.1.15",
    ];

    pub const ACCEPT_LANGUAGES: &'static [&'static str] = &[
        "en-US,en;q=0.5",
        "en-US,en;q=0.9",
        "en-GB,en;q=0.8",
        "de-DE,de;q=0.9,en;q=0.6",
        "fr-FR,fr;q=0.9,en;q=0.5",
    ];

    /// Pick a User-Agent at random
    pub fn user_agent() -> &'static str {
        Self::USER_AGENTS
            .choose(&mut rand::thread_rng())
            .copied()
            .unwrap_or(Self::USER_AGENTS[0])
    }

    /// Pick an Accept-Language at random
    pub fn accept_language() -> &'static str {
        Self::ACCEPT_LANGUAGES
            .choose(&mut rand::thread_rng())
            .copied()
            .unwrap_or(Self::ACCEPT_LANGUAGES[0])
    }

    /// Default headers for a freshly built proxied client
    pub fn randomized_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static(Self::user_agent()));
        headers.insert(
            ACCEPT_LANGUAGE,
            HeaderValue::from_static(Self::accept_language()),
        );
        headers
    }
}
