use rescue_devkit::test_utils::TestHarness;
use rescue_devkit::EventBuilder;
use rescue_monitor::alert::AlertReason;
use std::time::Duration;

#[tokio::test]
async fn test_cancelled_orders_alert_once_per_cooldown() {
    let h = TestHarness::new().unwrap();
    h.activate().await.unwrap();
    h.wait_connected().await.unwrap();

    h.deliver(EventBuilder::cancelled("m1")).await.unwrap();
    h.deliver(EventBuilder::cancelled("m2")).await.unwrap();
    // redelivery of m1 must not count again
    h.deliver(EventBuilder::cancelled("m1")).await.unwrap();
    // processed in order, so once this lands the three above are done
    h.deliver(EventBuilder::claimed("c1")).await.unwrap();

    let state = h
        .wait_for_state("claimed order counted", |s| s.claimed_count == 1)
        .await
        .unwrap();
    assert_eq!(state.cancelled_count, 2);
    assert_eq!(h.alerts.count(), 1);

    let alert = &h.alerts.alerts()[0];
    assert_eq!(alert.reason, AlertReason::CancelledOrder);
    assert_eq!(alert.message_id.as_deref(), Some("m1"));
    assert_eq!(alert.location.as_ref().map(|l| l.name.as_str()), Some("Downtown"));
    assert_eq!(state.last_alert_at, alert.fired_at);

    h.monitor.shutdown().await;
}

#[tokio::test]
async fn test_alert_fires_again_after_cooldown() {
    let h = TestHarness::new().unwrap();
    h.activate().await.unwrap();
    h.wait_connected().await.unwrap();

    h.deliver(EventBuilder::cancelled("m1")).await.unwrap();
    h.wait_for_state("first cancel", |s| s.cancelled_count == 1)
        .await
        .unwrap();

    h.clock.advance(Duration::from_secs(181));
    h.deliver(EventBuilder::cancelled("m2")).await.unwrap();
    h.wait_for_state("second cancel", |s| s.cancelled_count == 2)
        .await
        .unwrap();

    assert_eq!(h.alerts.count(), 2);
    h.monitor.shutdown().await;
}

#[tokio::test]
async fn test_stale_and_malformed_messages_are_dropped() {
    let h = TestHarness::new().unwrap();
    h.activate().await.unwrap();
    h.wait_connected().await.unwrap();

    let old = h.clock.now_secs() - 600;
    h.transport
        .deliver(EventBuilder::cancelled("old").at_secs(old).to_bytes().unwrap())
        .await
        .unwrap();
    h.deliver_raw(b"not json".to_vec()).await.unwrap();
    h.deliver(EventBuilder::new().id("x").event_type("order_delivered"))
        .await
        .unwrap();
    h.deliver(EventBuilder::claimed("c1")).await.unwrap();

    let state = h
        .wait_for_state("claimed order counted", |s| s.claimed_count == 1)
        .await
        .unwrap();
    assert_eq!(state.cancelled_count, 0);
    assert_eq!(h.alerts.count(), 0);

    // a stale message is not remembered, a fresh copy still counts
    h.deliver(EventBuilder::cancelled("old")).await.unwrap();
    h.wait_for_state("fresh copy counted", |s| s.cancelled_count == 1)
        .await
        .unwrap();
    assert_eq!(h.alerts.count(), 1);
    h.monitor.shutdown().await;
}

#[tokio::test]
async fn test_messages_without_id_are_never_deduplicated() {
    let h = TestHarness::new().unwrap();
    h.activate().await.unwrap();
    h.wait_connected().await.unwrap();

    for _ in 0..3 {
        h.deliver(EventBuilder::new().event_type("order_claimed"))
            .await
            .unwrap();
    }
    h.wait_for_state("three claims", |s| s.claimed_count == 3)
        .await
        .unwrap();
    assert!(h.monitor.dedup().is_empty());
    h.monitor.shutdown().await;
}
