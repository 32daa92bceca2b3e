// Not every test binary uses every helper.
#![allow(dead_code)]

use chrono::{DateTime, TimeZone, Utc};

use lumetric_core::event::{Event, EventKind, TrafficAttributes};
use lumetric_duckdb::DuckDbBackend;

pub const SITE: &str = "site_1";

pub async fn backend() -> DuckDbBackend {
    let db = DuckDbBackend::open_in_memory().unwrap();
    db.seed_site(SITE, "example.com").await.unwrap();
    db
}

pub fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
}

pub fn pageview(event_id: &str, visitor_id: &str, occurred_at: DateTime<Utc>) -> Event {
    Event {
        event_id: event_id.to_string(),
        site_id: SITE.to_string(),
        visitor_id: visitor_id.to_string(),
        session_id: String::new(),
        kind: EventKind::Pageview,
        occurred_at,
        url: "/".to_string(),
        referrer: None,
        referrer_domain: None,
        traffic: TrafficAttributes::default(),
        device_class: None,
        country: None,
        language: None,
        identity: None,
        fingerprint: None,
    }
}

pub fn with_source(mut event: Event, source: &str) -> Event {
    event.traffic.source = Some(source.to_string());
    event
}

pub fn with_device(mut event: Event, device: &str) -> Event {
    event.device_class = Some(device.to_string());
    event
}

pub fn with_identity(mut event: Event, identity: &str) -> Event {
    event.identity = Some(identity.to_string());
    event
}

pub fn purchase(event_id: &str, visitor_id: &str, occurred_at: DateTime<Utc>, amount: f64) -> Event {
    let mut event = pageview(event_id, visitor_id, occurred_at);
    event.kind = EventKind::Purchase { amount };
    event
}

pub fn goal(event_id: &str, visitor_id: &str, occurred_at: DateTime<Utc>, name: &str) -> Event {
    let mut event = pageview(event_id, visitor_id, occurred_at);
    event.kind = EventKind::Goal {
        goal_name: name.to_string(),
    };
    event
}
