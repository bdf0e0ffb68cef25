//! End-to-end tests: the session router driving real PTY sessions through
//! the local transport.

#![cfg(unix)]

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use protocol::{SessionSpec, TerminalEvent, TerminalTransport};
use ptyhost::config::SessionConfig;
use ptyhost::{LocalTransport, SessionManager};
use router::{SessionEvent, SessionRouter};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

fn setup() -> (Arc<SessionManager>, LocalTransport) {
    let config = SessionConfig {
        default_shell: "/bin/sh".to_string(),
        ..SessionConfig::default()
    };
    let manager = Arc::new(SessionManager::new(config));
    let transport = LocalTransport::new(Arc::clone(&manager));
    (manager, transport)
}

fn sh(script: &str) -> SessionSpec {
    SessionSpec::default().command("/bin/sh", vec!["-c".to_string(), script.to_string()])
}

/// Collects output until `needle` shows up. Returns everything seen.
async fn read_until(rx: &mut UnboundedReceiver<SessionEvent>, needle: &str) -> String {
    let mut seen = String::new();
    while !seen.contains(needle) {
        match timeout(Duration::from_secs(5), rx.recv()).await {
            Ok(Some(SessionEvent::Output(data))) | Ok(Some(SessionEvent::ScreenState(data))) => {
                seen.push_str(&data)
            }
            Ok(Some(SessionEvent::Exit(_))) | Ok(None) | Err(_) => break,
        }
    }
    seen
}

async fn wait_exit(rx: &mut UnboundedReceiver<SessionEvent>) -> Option<i32> {
    loop {
        match timeout(Duration::from_secs(5), rx.recv()).await {
            Ok(Some(SessionEvent::Exit(code))) => return Some(code),
            Ok(Some(_)) => continue,
            Ok(None) | Err(_) => return None,
        }
    }
}

#[tokio::test]
async fn test_attach_starts_with_scrollback() {
    let (manager, transport) = setup();
    let id = manager.create(sh("echo scrollback_marker; sleep 2")).unwrap();

    let session = manager.get(&id).unwrap();
    for _ in 0..50 {
        if session.snapshot().contains("scrollback_marker") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let mut events = transport.attach(&id, CancellationToken::new());
    let first = timeout(Duration::from_secs(1), events.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    match first {
        TerminalEvent::ScreenState(state) => assert!(state.contains("scrollback_marker")),
        other => panic!("expected screen state, got {other:?}"),
    }

    manager.close(&id).unwrap();
}

#[tokio::test]
async fn test_router_over_local_shell() {
    let (manager, transport) = setup();
    let id = manager.create(SessionSpec::default()).unwrap();
    let router = SessionRouter::new(Arc::new(transport));

    let (_main, mut main_rx) = router.subscribe_channel(&id);
    let (_popup, mut popup_rx) = router.subscribe_channel(&id);

    router.send_input(&id, "echo router_marker\n");
    assert!(read_until(&mut main_rx, "router_marker").await.contains("router_marker"));
    assert!(read_until(&mut popup_rx, "router_marker").await.contains("router_marker"));

    router.send_input(&id, "exit 5\n");
    assert_eq!(wait_exit(&mut main_rx).await, Some(5));
    assert_eq!(wait_exit(&mut popup_rx).await, Some(5));
}

#[tokio::test]
async fn test_late_viewer_gets_cached_screen_state() {
    let (manager, transport) = setup();
    let id = manager.create(sh("echo late_marker; sleep 2")).unwrap();
    let router = SessionRouter::new(Arc::new(transport));

    let (_first, mut first_rx) = router.subscribe_channel(&id);
    let initial = match timeout(Duration::from_secs(1), first_rx.recv()).await {
        Ok(Some(SessionEvent::ScreenState(state))) => state,
        other => panic!("expected screen state, got {other:?}"),
    };

    // The second viewer shares the upstream stream and is replayed the cache.
    let (_late, mut late_rx) = router.subscribe_channel(&id);
    let replayed = timeout(Duration::from_secs(1), late_rx.recv()).await.unwrap();
    assert_eq!(replayed, Some(SessionEvent::ScreenState(initial)));
    assert_eq!(manager.get(&id).unwrap().reader_count(), 1);

    manager.close(&id).unwrap();
}

#[tokio::test]
async fn test_exit_code_for_finished_command() {
    let (manager, transport) = setup();
    let id = manager.create(sh("exit 7")).unwrap();

    let mut exits = transport.on_exit(&id, CancellationToken::new());
    let code = timeout(Duration::from_secs(5), exits.next()).await.unwrap();
    assert_eq!(code, Some(Ok(7)));
    assert!(exits.next().await.is_none());
}

#[tokio::test]
async fn test_resize_through_router() {
    let (manager, transport) = setup();
    let id = manager.create(sh("sleep 2")).unwrap();
    let router = SessionRouter::new(Arc::new(transport));

    router.resize(&id, 132, 43).await.unwrap();
    assert_eq!(manager.get(&id).unwrap().size(), (132, 43));

    let err = router.resize("missing", 80, 24).await.unwrap_err();
    assert!(err.to_string().contains("not found"));

    manager.close(&id).unwrap();
}

#[tokio::test]
async fn test_close_ends_session() {
    let (manager, transport) = setup();
    let id = manager.create(sh("sleep 10")).unwrap();

    transport.close(&id).await.unwrap();
    assert!(!manager.exists(&id));
    assert!(transport.close(&id).await.unwrap_err().is_not_found());
}
