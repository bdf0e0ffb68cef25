//! Behavioural tests for the session router.
//!
//! These tests drive a [`SessionRouter`] through a scripted
//! [`MemoryTransport`] and verify:
//! - one upstream stream pair per session
//! - fan-out and cross-session isolation
//! - asynchronous replay of screen state and exit codes
//! - teardown and cleanup semantics

use std::sync::{Arc, Mutex};
use std::time::Duration;

use protocol::MemoryTransport;
use router::{SessionEvent, SessionRouter, SubscriberCallbacks, Subscription};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{sleep, timeout};

fn setup() -> (MemoryTransport, SessionRouter) {
    let transport = MemoryTransport::new();
    let router = SessionRouter::new(Arc::new(transport.clone()));
    (transport, router)
}

async fn recv(rx: &mut UnboundedReceiver<SessionEvent>) -> SessionEvent {
    timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("timed out waiting for session event")
        .expect("subscriber channel closed")
}

/// Asserts nothing arrives within a short grace period.
async fn assert_quiet(rx: &mut UnboundedReceiver<SessionEvent>) {
    sleep(Duration::from_millis(50)).await;
    assert!(rx.try_recv().is_err(), "unexpected event delivered");
}

/// Callbacks that record every event into a shared log.
fn recorder() -> (SubscriberCallbacks, Arc<Mutex<Vec<SessionEvent>>>) {
    let log = Arc::new(Mutex::new(Vec::new()));
    let (out, state, exit) = (log.clone(), log.clone(), log.clone());
    let callbacks = SubscriberCallbacks::new()
        .on_output(move |d| out.lock().unwrap().push(SessionEvent::Output(d.to_string())))
        .on_screen_state(move |s| {
            state
                .lock()
                .unwrap()
                .push(SessionEvent::ScreenState(s.to_string()))
        })
        .on_exit(move |code| exit.lock().unwrap().push(SessionEvent::Exit(code)));
    (callbacks, log)
}

// =============================================================================
// Single-stream invariant
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_subscribes_start_one_stream() {
    let (transport, router) = setup();

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let router = router.clone();
            tokio::spawn(async move { router.subscribe("s1", SubscriberCallbacks::new()) })
        })
        .collect();

    let mut subscriptions = Vec::new();
    for handle in handles {
        subscriptions.push(handle.await.unwrap());
    }

    assert_eq!(transport.attach_count("s1"), 1);
    assert_eq!(transport.exit_count("s1"), 1);
    assert_eq!(router.subscriber_count("s1"), 16);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_churn_never_leaks_sessions() {
    let (transport, router) = setup();
    let anchor = router.subscribe("s1", SubscriberCallbacks::new());

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let router = router.clone();
            tokio::spawn(async move {
                for _ in 0..50 {
                    let sub = router.subscribe("s1", SubscriberCallbacks::new());
                    tokio::task::yield_now().await;
                    sub.unsubscribe();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap();
    }

    // The anchor kept the session alive throughout.
    assert_eq!(transport.attach_count("s1"), 1);
    assert_eq!(router.subscriber_count("s1"), 1);

    anchor.unsubscribe();
    assert_eq!(router.session_count(), 0);
}

// =============================================================================
// Fan-out and isolation
// =============================================================================

#[tokio::test]
async fn test_output_fans_out_to_all_subscribers() {
    let (transport, router) = setup();
    let (_a, mut rx_a) = router.subscribe_channel("s1");
    let (_b, mut rx_b) = router.subscribe_channel("s1");
    let (_c, mut rx_c) = router.subscribe_channel("s1");
    let (_other, mut rx_other) = router.subscribe_channel("s2");

    transport.emit_output("s1", "data");

    let expected = SessionEvent::Output("data".to_string());
    assert_eq!(recv(&mut rx_a).await, expected);
    assert_eq!(recv(&mut rx_b).await, expected);
    assert_eq!(recv(&mut rx_c).await, expected);
    assert_quiet(&mut rx_other).await;
}

#[tokio::test]
async fn test_sessions_are_isolated() {
    let (transport, router) = setup();
    let (_a, mut rx_a) = router.subscribe_channel("a");
    let (_b, mut rx_b) = router.subscribe_channel("b");

    transport.emit_output("a", "for a");
    transport.emit_screen_state("b", "for b");
    assert_eq!(recv(&mut rx_a).await, SessionEvent::Output("for a".to_string()));

    transport.exit("a", 1);
    assert_eq!(recv(&mut rx_a).await, SessionEvent::Exit(1));
    assert_eq!(recv(&mut rx_b).await, SessionEvent::ScreenState("for b".to_string()));
    assert_quiet(&mut rx_a).await;
    assert_quiet(&mut rx_b).await;
}

#[tokio::test]
async fn test_output_order_preserved_per_subscriber() {
    let (transport, router) = setup();
    let (_sub, mut rx) = router.subscribe_channel("s1");

    for i in 0..20 {
        transport.emit_output("s1", &i.to_string());
    }
    for i in 0..20 {
        assert_eq!(recv(&mut rx).await, SessionEvent::Output(i.to_string()));
    }
}

// =============================================================================
// Replay
// =============================================================================

#[tokio::test]
async fn test_late_subscriber_gets_screen_state_asynchronously() {
    let (transport, router) = setup();
    let (_first, mut first_rx) = router.subscribe_channel("s1");
    transport.emit_screen_state("s1", "snapshot");
    recv(&mut first_rx).await;

    let (callbacks, log) = recorder();
    let _late = router.subscribe("s1", callbacks);
    assert!(log.lock().unwrap().is_empty());

    sleep(Duration::from_millis(20)).await;
    assert_eq!(
        *log.lock().unwrap(),
        vec![SessionEvent::ScreenState("snapshot".to_string())]
    );
    assert_eq!(transport.attach_count("s1"), 1);
}

#[tokio::test]
async fn test_late_subscriber_gets_latest_screen_state_only() {
    let (transport, router) = setup();
    let (_first, mut first_rx) = router.subscribe_channel("s1");
    transport.emit_screen_state("s1", "one");
    transport.emit_screen_state("s1", "two");
    recv(&mut first_rx).await;
    recv(&mut first_rx).await;

    let (_late, mut late_rx) = router.subscribe_channel("s1");
    assert_eq!(recv(&mut late_rx).await, SessionEvent::ScreenState("two".to_string()));
    assert_quiet(&mut late_rx).await;
}

#[tokio::test]
async fn test_exit_replayed_to_new_subscriber() {
    let (transport, router) = setup();
    let (_first, mut first_rx) = router.subscribe_channel("s1");
    transport.emit_screen_state("s1", "$ ");
    recv(&mut first_rx).await;
    transport.exit("s1", 0);
    assert_eq!(recv(&mut first_rx).await, SessionEvent::Exit(0));

    let (callbacks, log) = recorder();
    let _late = router.subscribe("s1", callbacks);
    assert!(log.lock().unwrap().is_empty());

    sleep(Duration::from_millis(20)).await;
    assert_eq!(
        *log.lock().unwrap(),
        vec![
            SessionEvent::ScreenState("$ ".to_string()),
            SessionEvent::Exit(0)
        ]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_slow_replay_is_not_overtaken_by_live_screen_state() {
    let (transport, router) = setup();
    let (_first, mut first_rx) = router.subscribe_channel("s1");
    transport.emit_screen_state("s1", "old");
    recv(&mut first_rx).await;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let _late = router.subscribe(
        "s1",
        SubscriberCallbacks::new().on_screen_state(move |state| {
            if state == "old" {
                // Stalls the replay while the live event arrives on another worker.
                std::thread::sleep(Duration::from_millis(200));
            }
            sink.lock().unwrap().push(state.to_string());
        }),
    );

    sleep(Duration::from_millis(50)).await;
    transport.emit_screen_state("s1", "new");
    assert_eq!(recv(&mut first_rx).await, SessionEvent::ScreenState("new".to_string()));

    timeout(Duration::from_secs(2), async {
        while seen.lock().unwrap().len() < 2 {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("late subscriber never saw both screen states");

    assert_eq!(*seen.lock().unwrap(), vec!["old".to_string(), "new".to_string()]);
}

#[tokio::test]
async fn test_no_replay_for_fresh_session() {
    let (_transport, router) = setup();
    let (_sub, mut rx) = router.subscribe_channel("s1");
    assert_quiet(&mut rx).await;
}

// =============================================================================
// Teardown
// =============================================================================

#[tokio::test]
async fn test_unsubscribe_is_idempotent() {
    let (_transport, router) = setup();
    let a = router.subscribe("s1", SubscriberCallbacks::new());
    let b = router.subscribe("s1", SubscriberCallbacks::new());

    a.unsubscribe();
    a.unsubscribe();
    assert_eq!(router.subscriber_count("s1"), 1);
    assert!(router.has_subscribers("s1"));

    b.unsubscribe();
    b.unsubscribe();
    assert!(!router.has_subscribers("s1"));
}

#[tokio::test]
async fn test_unsubscribe_after_dispose_is_noop() {
    let (_transport, router) = setup();
    let sub = router.subscribe("s1", SubscriberCallbacks::new());
    router.dispose();

    sub.unsubscribe();
    assert_eq!(router.session_count(), 0);
}

#[tokio::test]
async fn test_last_unsubscribe_removes_session_and_restarts() {
    let (transport, router) = setup();
    let sub = router.subscribe("s1", SubscriberCallbacks::new());
    sleep(Duration::from_millis(10)).await;
    assert_eq!(transport.open_streams("s1"), 1);

    sub.unsubscribe();
    assert!(!router.has_subscribers("s1"));
    sleep(Duration::from_millis(10)).await;
    assert_eq!(transport.open_streams("s1"), 0);

    let _again = router.subscribe("s1", SubscriberCallbacks::new());
    assert_eq!(transport.attach_count("s1"), 2);
    assert_eq!(transport.exit_count("s1"), 2);
}

#[tokio::test]
async fn test_router_never_closes_sessions() {
    let (transport, router) = setup();
    let sub = router.subscribe("s1", SubscriberCallbacks::new());
    sub.unsubscribe();
    router.dispose();
    sleep(Duration::from_millis(10)).await;
    assert!(transport.closed().is_empty());
}

#[tokio::test]
async fn test_dropped_subscription_unsubscribes() {
    let (transport, router) = setup();
    let keep: Subscription = router.subscribe("s1", SubscriberCallbacks::new());
    drop(router.subscribe("s1", SubscriberCallbacks::new()));

    assert_eq!(router.subscriber_count("s1"), 1);
    drop(keep);
    assert!(!router.has_subscribers("s1"));
    assert_eq!(transport.attach_count("s1"), 1);
}

// =============================================================================
// Input and resize
// =============================================================================

#[tokio::test]
async fn test_input_forwarded_in_call_order() {
    let (transport, router) = setup();
    router.send_input("s1", "a");
    router.send_input("s1", "b");
    router.send_input("s2", "c");

    assert_eq!(
        transport.inputs(),
        vec![
            ("s1".to_string(), "a".to_string()),
            ("s1".to_string(), "b".to_string()),
            ("s2".to_string(), "c".to_string()),
        ]
    );
}

#[tokio::test]
async fn test_input_after_exit_is_forwarded() {
    let (transport, router) = setup();
    let (_sub, mut rx) = router.subscribe_channel("s1");
    transport.exit("s1", 0);
    recv(&mut rx).await;

    router.send_input("s1", "still here");
    assert_eq!(transport.inputs().len(), 1);
}

#[tokio::test]
async fn test_resize_without_subscribers() {
    let (transport, router) = setup();
    router.resize("background", 100, 50).await.unwrap();
    assert_eq!(transport.resizes(), vec![("background".to_string(), 100, 50)]);
}

// =============================================================================
// End-to-end
// =============================================================================

#[tokio::test]
async fn test_end_to_end_scenario() {
    let (transport, router) = setup();

    let (cb1, log1) = recorder();
    let sub1 = router.subscribe("s1", cb1);

    transport.emit_screen_state("s1", "$ ");
    sleep(Duration::from_millis(20)).await;
    assert_eq!(
        *log1.lock().unwrap(),
        vec![SessionEvent::ScreenState("$ ".to_string())]
    );

    let (cb2, log2) = recorder();
    let sub2 = router.subscribe("s1", cb2);
    sleep(Duration::from_millis(20)).await;
    assert_eq!(
        *log2.lock().unwrap(),
        vec![SessionEvent::ScreenState("$ ".to_string())]
    );
    assert_eq!(transport.attach_count("s1"), 1);

    transport.emit_output("s1", "ls\n");
    sleep(Duration::from_millis(20)).await;
    assert_eq!(
        log1.lock().unwrap().last(),
        Some(&SessionEvent::Output("ls\n".to_string()))
    );
    assert_eq!(
        log2.lock().unwrap().last(),
        Some(&SessionEvent::Output("ls\n".to_string()))
    );

    sub1.unsubscribe();
    transport.exit("s1", 0);
    sleep(Duration::from_millis(20)).await;
    assert_eq!(log2.lock().unwrap().last(), Some(&SessionEvent::Exit(0)));
    assert!(!log1.lock().unwrap().contains(&SessionEvent::Exit(0)));

    sub2.unsubscribe();
    assert!(!router.has_subscribers("s1"));
    assert_eq!(router.session_count(), 0);
}
