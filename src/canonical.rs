//! Rewrites user-pasted links into the form the extraction engine accepts.
//!
//! The rules are plain substring rewrites applied in a fixed order. Nothing
//! here validates the link: a malformed input comes back trimmed and
//! otherwise untouched, and the engine reports the problem later.

/// A top-level domain variant that users paste but the engine does not
/// recognise.
struct DomainCorrection {
    wrong: &'static str,
    right: &'static str,
}

const DOMAIN_CORRECTIONS: [DomainCorrection; 1] = [DomainCorrection {
    wrong: "threads.com",
    right: "threads.net",
}];

/// Domains whose share links carry tracking query strings that break
/// extraction.
const TRACKING_QUERY_DOMAINS: [&str; 1] = ["threads.net"];

pub fn canonicalize(raw: &str) -> String {
    let mut url = raw.trim().to_string();

    for correction in &DOMAIN_CORRECTIONS {
        if url.contains(correction.wrong) {
            url = url.replace(correction.wrong, correction.right);
        }
    }

    if TRACKING_QUERY_DOMAINS
        .iter()
        .any(|domain| url.contains(domain))
        && let Some(index) = url.find('?')
    {
        url.truncate(index);
    }

    url
}
