mod common;

use std::sync::Arc;

use chrono::{Duration, Utc};

use common::{at, backend, pageview, with_identity, with_source, SITE};
use lumetric_core::attribution::{CandidateMatcher, MatchConfidence, PurchaseNotification};
use lumetric_core::visitor::compute_fingerprint;
use lumetric_duckdb::attribution::{ExactIdentityMatcher, FingerprintMatcher};
use lumetric_duckdb::DuckDbBackend;

fn gap() -> Duration {
    Duration::minutes(30)
}

fn exact_chain(db: &DuckDbBackend) -> Vec<Box<dyn CandidateMatcher>> {
    vec![Box::new(ExactIdentityMatcher::new(Arc::new(db.clone())))]
}

fn full_chain(db: &DuckDbBackend) -> Vec<Box<dyn CandidateMatcher>> {
    let db = Arc::new(db.clone());
    vec![
        Box::new(ExactIdentityMatcher::new(db.clone())),
        Box::new(FingerprintMatcher::new(db)),
    ]
}

fn notification(purchase_id: &str, identity: &str, occurred_at: chrono::DateTime<Utc>) -> PurchaseNotification {
    PurchaseNotification {
        purchase_id: purchase_id.to_string(),
        site_id: SITE.to_string(),
        visitor_identity: identity.to_string(),
        amount: 49.0,
        currency: "USD".to_string(),
        occurred_at,
        client_ip: None,
        user_agent: None,
    }
}

#[tokio::test]
async fn last_touch_credits_the_most_recent_session() {
    let db = backend().await;
    let base = at(2026, 7, 10, 9, 0, 0);
    db.append_events(&[
        // First session, google.
        with_identity(with_source(pageview("e1", "v1", base), "google"), "alice@example.com"),
        // Second session 45 minutes later, direct.
        pageview("e2", "v1", base + Duration::minutes(45)),
    ])
    .await
    .unwrap();
    db.run_session_aggregation_once(gap(), 100).await.unwrap();

    let sessions = db.sessions_for_visitor(SITE, "v1").await.unwrap();
    assert_eq!(sessions.len(), 2);

    let purchase = notification("p1", "alice@example.com", base + Duration::minutes(50));
    let (record, newly) = db.attribute(&purchase, 30, &exact_chain(&db)).await.unwrap();
    assert!(newly);
    // Last touch: the later (direct) session wins over the earlier google one.
    assert_eq!(
        record.matched_session_id.as_deref(),
        Some(sessions[1].session_id.as_str())
    );
    assert_eq!(record.confidence, Some(MatchConfidence::Exact));
}

#[tokio::test]
async fn unknown_identity_records_a_direct_purchase() {
    let db = backend().await;
    db.append_events(&[pageview("e1", "v1", at(2026, 7, 10, 9, 0, 0))])
        .await
        .unwrap();
    db.run_session_aggregation_once(gap(), 100).await.unwrap();

    let purchase = notification("p1", "stranger@example.com", at(2026, 7, 10, 12, 0, 0));
    let (record, newly) = db.attribute(&purchase, 30, &exact_chain(&db)).await.unwrap();
    assert!(newly);
    assert_eq!(record.matched_session_id, None);
    assert_eq!(record.confidence, None);
    assert_eq!(record.amount, 49.0);
}

#[tokio::test]
async fn sessions_outside_the_lookback_window_do_not_qualify() {
    let db = backend().await;
    let session_time = at(2026, 6, 1, 9, 0, 0);
    db.append_events(&[with_identity(
        pageview("e1", "v1", session_time),
        "alice@example.com",
    )])
    .await
    .unwrap();
    db.run_session_aggregation_once(gap(), 100).await.unwrap();

    // Purchase 31 days after the only session, lookback 30 days: direct.
    let purchase = notification("p1", "alice@example.com", session_time + Duration::days(31));
    let (record, _) = db.attribute(&purchase, 30, &exact_chain(&db)).await.unwrap();
    assert_eq!(record.matched_session_id, None);

    // The same purchase one day earlier would have matched.
    let purchase = notification("p2", "alice@example.com", session_time + Duration::days(29));
    let (record, _) = db.attribute(&purchase, 30, &exact_chain(&db)).await.unwrap();
    assert!(record.matched_session_id.is_some());
}

#[tokio::test]
async fn sessions_started_after_the_purchase_do_not_qualify() {
    let db = backend().await;
    let base = at(2026, 7, 10, 9, 0, 0);
    db.append_events(&[with_identity(
        pageview("e1", "v1", base),
        "alice@example.com",
    )])
    .await
    .unwrap();
    db.run_session_aggregation_once(gap(), 100).await.unwrap();

    let purchase = notification("p1", "alice@example.com", base - Duration::hours(1));
    let (record, _) = db.attribute(&purchase, 30, &exact_chain(&db)).await.unwrap();
    assert_eq!(record.matched_session_id, None);
}

#[tokio::test]
async fn duplicate_delivery_returns_the_original_record() {
    let db = backend().await;
    let base = at(2026, 7, 10, 9, 0, 0);
    db.append_events(&[with_identity(
        pageview("e1", "v1", base),
        "alice@example.com",
    )])
    .await
    .unwrap();
    db.run_session_aggregation_once(gap(), 100).await.unwrap();

    let purchase = notification("p1", "alice@example.com", base + Duration::minutes(5));
    let (first, newly_first) = db.attribute(&purchase, 30, &exact_chain(&db)).await.unwrap();
    assert!(newly_first);

    // Same purchase_id, different amount: the retry must not create a second
    // record or overwrite the first.
    let mut retry = purchase.clone();
    retry.amount = 999.0;
    let (second, newly_second) = db.attribute(&retry, 30, &exact_chain(&db)).await.unwrap();
    assert!(!newly_second);
    assert_eq!(second.matched_session_id, first.matched_session_id);
    assert_eq!(second.amount, 49.0);
}

#[tokio::test]
async fn equal_start_times_break_ties_deterministically() {
    let db = backend().await;
    let base = at(2026, 7, 10, 9, 0, 0);
    // Two visitors sharing one identity, sessions starting the same instant.
    db.append_events(&[
        with_identity(pageview("e1", "v1", base), "team@example.com"),
        with_identity(pageview("e2", "v2", base), "team@example.com"),
    ])
    .await
    .unwrap();
    db.run_session_aggregation_once(gap(), 100).await.unwrap();

    let mut session_ids: Vec<String> = Vec::new();
    for visitor in ["v1", "v2"] {
        for session in db.sessions_for_visitor(SITE, visitor).await.unwrap() {
            session_ids.push(session.session_id);
        }
    }
    session_ids.sort();

    let purchase = notification("p1", "team@example.com", base + Duration::minutes(5));
    let (record, _) = db.attribute(&purchase, 30, &exact_chain(&db)).await.unwrap();
    // Larger session_id wins the tie, every time.
    assert_eq!(
        record.matched_session_id.as_deref(),
        session_ids.last().map(String::as_str)
    );
}

#[tokio::test]
async fn fingerprint_fallback_matches_when_identity_is_unknown() {
    let db = backend().await;
    // Fingerprints are day-salted, so this test lives at "now".
    let base = Utc::now() - Duration::minutes(10);
    let fingerprint = compute_fingerprint("203.0.113.9", "test-agent");
    let mut event = pageview("e1", "v1", base);
    event.fingerprint = Some(fingerprint);
    db.append_events(&[event]).await.unwrap();
    db.run_session_aggregation_once(gap(), 100).await.unwrap();

    let mut purchase = notification("p1", "unseen@example.com", base + Duration::minutes(5));
    purchase.client_ip = Some("203.0.113.9".to_string());
    purchase.user_agent = Some("test-agent".to_string());

    let (record, _) = db.attribute(&purchase, 30, &full_chain(&db)).await.unwrap();
    assert!(record.matched_session_id.is_some());
    assert_eq!(record.confidence, Some(MatchConfidence::Fingerprint));
}

#[tokio::test]
async fn exact_match_outranks_fingerprint_in_the_chain() {
    let db = backend().await;
    let base = Utc::now() - Duration::minutes(10);
    let fingerprint = compute_fingerprint("203.0.113.9", "test-agent");
    let mut identified = with_identity(pageview("e1", "v1", base), "alice@example.com");
    identified.fingerprint = Some(fingerprint.clone());
    let mut other = pageview("e2", "v2", base + Duration::minutes(1));
    other.fingerprint = Some(fingerprint);
    db.append_events(&[identified, other]).await.unwrap();
    db.run_session_aggregation_once(gap(), 100).await.unwrap();

    let mut purchase = notification("p1", "alice@example.com", base + Duration::minutes(5));
    purchase.client_ip = Some("203.0.113.9".to_string());
    purchase.user_agent = Some("test-agent".to_string());

    let (record, _) = db.attribute(&purchase, 30, &full_chain(&db)).await.unwrap();
    let v1_sessions = db.sessions_for_visitor(SITE, "v1").await.unwrap();
    assert_eq!(
        record.matched_session_id.as_deref(),
        Some(v1_sessions[0].session_id.as_str())
    );
    assert_eq!(record.confidence, Some(MatchConfidence::Exact));
}
