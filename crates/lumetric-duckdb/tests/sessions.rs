mod common;

use chrono::Duration;

use common::{at, backend, goal, pageview, with_device, with_source, SITE};
use lumetric_duckdb::cursor::SESSION_AGGREGATOR_CURSOR;

fn gap() -> Duration {
    Duration::minutes(30)
}

#[tokio::test]
async fn inactivity_gap_splits_sessions() {
    let db = backend().await;
    let base = at(2026, 7, 10, 9, 0, 0);
    db.append_events(&[
        pageview("e1", "v1", base),
        pageview("e2", "v1", base + Duration::minutes(10)),
        // 31 minutes after e2 — past the gap, opens a new session.
        pageview("e3", "v1", base + Duration::minutes(41)),
    ])
    .await
    .unwrap();

    let applied = db.run_session_aggregation_once(gap(), 100).await.unwrap();
    assert_eq!(applied, 3);

    let sessions = db.sessions_for_visitor(SITE, "v1").await.unwrap();
    assert_eq!(sessions.len(), 2);

    let first = &sessions[0];
    assert_eq!(first.event_count, 2);
    assert_eq!(first.pageview_count, 2);
    assert_eq!(first.started_at, base);
    assert_eq!(first.ended_at, base + Duration::minutes(10));
    assert!(!first.is_bounce);

    let second = &sessions[1];
    assert_eq!(second.event_count, 1);
    assert!(second.is_bounce);
}

#[tokio::test]
async fn event_within_gap_extends_the_session() {
    let db = backend().await;
    let base = at(2026, 7, 10, 9, 0, 0);
    db.append_events(&[
        pageview("e1", "v1", base),
        // Exactly at the gap boundary still belongs.
        pageview("e2", "v1", base + gap()),
    ])
    .await
    .unwrap();

    db.run_session_aggregation_once(gap(), 100).await.unwrap();
    let sessions = db.sessions_for_visitor(SITE, "v1").await.unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].event_count, 2);
}

#[tokio::test]
async fn entry_attributes_are_frozen_at_session_start() {
    let db = backend().await;
    let base = at(2026, 7, 10, 9, 0, 0);
    db.append_events(&[
        with_device(
            with_source(pageview("e1", "v1", base), "google"),
            "desktop",
        ),
        // Mid-session campaign change must not rewrite the entry attributes.
        with_source(pageview("e2", "v1", base + Duration::minutes(5)), "newsletter"),
    ])
    .await
    .unwrap();

    db.run_session_aggregation_once(gap(), 100).await.unwrap();
    let sessions = db.sessions_for_visitor(SITE, "v1").await.unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].entry_traffic.source.as_deref(), Some("google"));
    assert_eq!(sessions[0].entry_device_class.as_deref(), Some("desktop"));
}

#[tokio::test]
async fn second_session_gets_its_own_entry_attributes() {
    let db = backend().await;
    let base = at(2026, 7, 10, 9, 0, 0);
    db.append_events(&[
        with_source(pageview("e1", "v1", base), "google"),
        // Direct return visit 45 minutes later.
        pageview("e2", "v1", base + Duration::minutes(45)),
    ])
    .await
    .unwrap();

    db.run_session_aggregation_once(gap(), 100).await.unwrap();
    let sessions = db.sessions_for_visitor(SITE, "v1").await.unwrap();
    assert_eq!(sessions.len(), 2);
    assert_eq!(sessions[0].entry_traffic.source.as_deref(), Some("google"));
    assert_eq!(sessions[1].entry_traffic.source, None);
}

#[tokio::test]
async fn goal_events_extend_sessions_without_counting_pageviews() {
    let db = backend().await;
    let base = at(2026, 7, 10, 9, 0, 0);
    db.append_events(&[
        pageview("e1", "v1", base),
        goal("e2", "v1", base + Duration::minutes(2), "signup"),
    ])
    .await
    .unwrap();

    db.run_session_aggregation_once(gap(), 100).await.unwrap();
    let sessions = db.sessions_for_visitor(SITE, "v1").await.unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].event_count, 2);
    assert_eq!(sessions[0].pageview_count, 1);
    // One pageview, so the session still counts as a bounce.
    assert!(sessions[0].is_bounce);
}

#[tokio::test]
async fn visitors_are_sessionized_independently() {
    let db = backend().await;
    let base = at(2026, 7, 10, 9, 0, 0);
    db.append_events(&[
        pageview("a1", "v1", base),
        pageview("b1", "v2", base + Duration::minutes(1)),
        pageview("a2", "v1", base + Duration::minutes(2)),
    ])
    .await
    .unwrap();

    db.run_session_aggregation_once(gap(), 100).await.unwrap();
    assert_eq!(db.sessions_for_visitor(SITE, "v1").await.unwrap().len(), 1);
    let v2 = db.sessions_for_visitor(SITE, "v2").await.unwrap();
    assert_eq!(v2.len(), 1);
    assert_eq!(v2[0].event_count, 1);
}

#[tokio::test]
async fn cursor_replay_does_not_double_count() {
    let db = backend().await;
    let base = at(2026, 7, 10, 9, 0, 0);
    db.append_events(&[
        pageview("e1", "v1", base),
        pageview("e2", "v1", base + Duration::minutes(5)),
    ])
    .await
    .unwrap();

    db.run_session_aggregation_once(gap(), 100).await.unwrap();

    // Simulate a crash after commit but before the cursor advanced: rewind
    // and replay the whole batch. The stamp guard must absorb it.
    db.set_cursor(SESSION_AGGREGATOR_CURSOR, 0).await.unwrap();
    db.run_session_aggregation_once(gap(), 100).await.unwrap();

    let sessions = db.sessions_for_visitor(SITE, "v1").await.unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].event_count, 2);
    assert_eq!(sessions[0].pageview_count, 2);
}

#[tokio::test]
async fn aggregation_in_small_batches_matches_one_big_batch() {
    let db = backend().await;
    let base = at(2026, 7, 10, 9, 0, 0);
    let events: Vec<_> = (0..6)
        .map(|i| pageview(&format!("e{i}"), "v1", base + Duration::minutes(i)))
        .collect();
    db.append_events(&events).await.unwrap();

    // batch_limit 2 forces three passes over the same stream.
    while db.run_session_aggregation_once(gap(), 2).await.unwrap() > 0 {}

    let sessions = db.sessions_for_visitor(SITE, "v1").await.unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].event_count, 6);
}

#[tokio::test]
async fn events_are_stamped_with_their_session_id() {
    let db = backend().await;
    let base = at(2026, 7, 10, 9, 0, 0);
    db.append_events(&[pageview("e1", "v1", base)]).await.unwrap();
    db.run_session_aggregation_once(gap(), 100).await.unwrap();

    let page = db
        .scan_events(
            SITE,
            at(2026, 7, 10, 0, 0, 0),
            at(2026, 7, 11, 0, 0, 0),
            &Default::default(),
            None,
            10,
        )
        .await
        .unwrap();
    let sessions = db.sessions_for_visitor(SITE, "v1").await.unwrap();
    assert_eq!(page.events[0].session_id, sessions[0].session_id);
}
