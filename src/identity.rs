// =============================================================================
// Content addressing and text normalization for job identity
// =============================================================================
//
// Every content-addressed identifier in the engine (cache keys, job
// fingerprints, alert ids) is the same shape: the first 128 bits of a
// SHA-256 digest, rendered as 32 lowercase hex characters. One width
// everywhere keeps on-disk artifacts and logs comparable.
// =============================================================================

use sha2::{Digest, Sha256};
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

/// Number of hex characters in a canonical key (128-bit prefix).
pub const KEY_WIDTH: usize = 32;

/// Derive the canonical 32-hex-char key for arbitrary input.
pub fn content_key(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    hex::encode(&digest[..KEY_WIDTH / 2])
}

/// Normalize free text for identity comparison: lowercase, diacritics
/// stripped, whitespace collapsed to single spaces, trimmed.
///
/// "Desenvolvedor   Python   Sênior" and "desenvolvedor python senior"
/// normalize to the same string.
pub fn normalize_text(text: &str) -> String {
    let stripped: String = text
        .nfd()
        .filter(|c| !is_combining_mark(*c))
        .collect::<String>()
        .to_lowercase();

    stripped.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Fingerprint of a job: canonical key over normalized title, company, and
/// link, joined with a separator that cannot occur inside the parts.
pub fn job_fingerprint(title: &str, company: &str, link: &str) -> String {
    let joined = format!(
        "{}\u{1f}{}\u{1f}{}",
        normalize_text(title),
        normalize_text(company),
        link.trim().to_lowercase()
    );
    content_key(&joined)
}
