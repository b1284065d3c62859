//! Host-key prompt parsing
//!
//! OpenSSH splits the interesting bits across stderr (host, fingerprint) and
//! the askpass prompt itself, so callers concatenate both before parsing.

use regex::Regex;
use std::sync::OnceLock;

/// Details recovered from an OpenSSH host-key prompt
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostKeyDetails {
    pub host: Option<String>,
    pub key_type: Option<String>,
    pub fingerprint: Option<String>,
}

struct Patterns {
    authenticity: Option<Regex>,
    changed: Option<Regex>,
    fingerprint: Option<Regex>,
}

static PATTERNS: OnceLock<Patterns> = OnceLock::new();

fn patterns() -> &'static Patterns {
    PATTERNS.get_or_init(|| Patterns {
        authenticity: Regex::new(r"authenticity of host '([^']+)'").ok(),
        changed: Regex::new(r"(?i)host key for (\S+?) has changed").ok(),
        fingerprint: Regex::new(r"(?m)^\s*(\S+) key fingerprint is (\S+?)\.?\s*$").ok(),
    })
}

/// Pull host, key type and fingerprint out of ssh output
///
/// `'example.com (93.184.216.34)'` yields host `example.com`.
pub fn parse_host_key_details(text: &str) -> HostKeyDetails {
    let p = patterns();
    let mut details = HostKeyDetails::default();

    let host = p
        .authenticity
        .as_ref()
        .and_then(|re| re.captures(text))
        .or_else(|| p.changed.as_ref().and_then(|re| re.captures(text)))
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string());
    details.host = host.map(|h| match h.split_once(" (") {
        Some((name, _)) => name.to_string(),
        None => h,
    });

    if let Some(caps) = p.fingerprint.as_ref().and_then(|re| re.captures(text)) {
        details.key_type = caps.get(1).map(|m| m.as_str().to_string());
        details.fingerprint = caps.get(2).map(|m| m.as_str().to_string());
    }

    details
}
