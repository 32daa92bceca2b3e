use sha2::{Digest, Sha256};

/// Compute the day-salted ip+ua fingerprint.
///
/// Formula: sha256(salt_epoch + ip + user_agent)[0..8] encoded as 16 hex chars,
/// where salt_epoch = floor(unix_utc_timestamp / 86400) rotates at midnight UTC.
///
/// This is *not* the visitor id — the tracking script mints that and keeps it
/// client-side. The fingerprint is stored alongside events purely as the
/// low-confidence fallback key for attribution matching, and day rotation
/// bounds how long it stays linkable.
pub fn compute_fingerprint(ip: &str, user_agent: &str) -> String {
    let salt_epoch = chrono::Utc::now().timestamp() / 86400;
    let input = format!("{}{}{}", salt_epoch, ip, user_agent);
    let hash = Sha256::digest(input.as_bytes());
    hex::encode(&hash[..8])
}

/// Extract the host portion of a full referrer URL.
///
/// Returns `None` if referrer is empty or cannot be parsed to a non-empty host.
pub fn extract_referrer_domain(referrer: &str) -> Option<String> {
    if referrer.is_empty() {
        return None;
    }
    let stripped = referrer
        .trim_start_matches("https://")
        .trim_start_matches("http://");
    let domain = stripped.split('/').next()?;
    if domain.is_empty() {
        None
    } else {
        Some(domain.to_lowercase())
    }
}
