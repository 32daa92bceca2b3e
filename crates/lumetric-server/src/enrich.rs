use axum::http::HeaderMap;

/// Extract the real client IP from `X-Forwarded-For` (first entry), falling
/// back to `"unknown"` when the header is absent.
pub fn extract_client_ip(headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.split(',').next())
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

pub fn extract_user_agent(headers: &HeaderMap) -> String {
    headers
        .get(axum::http::header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string()
}

/// ISO country code for `ip`, if the GeoIP database is loaded and knows it.
pub fn lookup_country(reader: Option<&maxminddb::Reader<Vec<u8>>>, ip: &str) -> Option<String> {
    use std::net::IpAddr;
    use std::str::FromStr;

    let reader = reader?;
    let ip_addr = IpAddr::from_str(ip).ok()?;
    let record: maxminddb::geoip2::City = reader.lookup(ip_addr).ok()?;
    record
        .country
        .as_ref()
        .and_then(|c| c.iso_code)
        .map(|s| s.to_string())
}

/// Coarse device class from the User-Agent, via `woothee`.
///
/// Returns `None` for empty or unparseable UAs; categories are normalised to
/// the dashboard-facing vocabulary (desktop / mobile / tablet / bot / other).
pub fn device_class(user_agent: &str) -> Option<String> {
    if user_agent.is_empty() {
        return None;
    }
    let parsed = woothee::parser::Parser::new().parse(user_agent)?;
    let class = match parsed.category {
        "pc" => "desktop",
        "smartphone" | "mobilephone" => "mobile",
        "appliance" => "tablet",
        "crawler" => "bot",
        _ => "other",
    };
    Some(class.to_string())
}
