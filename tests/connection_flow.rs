//! Connection flow tests.
//!
//! Drives the public API against a scripted in-memory peer.
//!
//! Run with: cargo test --test connection_flow

use std::sync::Arc;
use std::time::Duration;

use browser_session::{
    Connection, ConnectionEvent, ConnectionOptions, ErrorKind, MemoryPeer, MemoryTransport,
    Protocol, RealmOwner, Session, SessionId, WaitOptions, WaitState,
};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_test::{assert_err, assert_ok};
use tracing_subscriber::EnvFilter;

// ============================================================================
// Harness
// ============================================================================

const STEP: Duration = Duration::from_secs(2);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn open(protocol: Protocol) -> anyhow::Result<(Connection, Arc<MemoryPeer>)> {
    init_tracing();
    let (transport, inbound, peer) = MemoryTransport::pair();
    let connection = Connection::new(
        "memory://flow",
        transport,
        inbound,
        protocol,
        ConnectionOptions::new().with_poll_interval(Duration::from_millis(10)),
    )?;
    Ok((connection, Arc::new(peer)))
}

/// Answers every request with `answer(request)`; records every request.
fn respond(
    peer: &Arc<MemoryPeer>,
    answer: impl Fn(&Value) -> Value + Send + 'static,
) -> (JoinHandle<()>, Arc<Mutex<Vec<Value>>>) {
    let peer = Arc::clone(peer);
    let log = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&log);

    let task = tokio::spawn(async move {
        while let Some(request) = peer.recv_json().await {
            let mut response = json!({"id": request["id"], "result": answer(&request)});
            if let Some(session) = request.get("sessionId") {
                response["sessionId"] = session.clone();
            }
            seen.lock().push(request);
            peer.deliver_json(&response);
        }
    });
    (task, log)
}

fn methods(log: &Mutex<Vec<Value>>) -> Vec<String> {
    log.lock()
        .iter()
        .filter_map(|r| r["method"].as_str().map(str::to_string))
        .collect()
}

fn attach_event(parent: Option<&str>, session: &str) -> Value {
    let mut event = json!({
        "method": "Target.attachedToTarget",
        "params": {
            "sessionId": session,
            "targetInfo": {"targetId": format!("target-{session}"), "type": "page", "url": "about:blank"},
            "waitingForDebugger": false
        }
    });
    if let Some(parent) = parent {
        event["sessionId"] = json!(parent);
    }
    event
}

fn context_created(session: &str, id: i64, frame: &str) -> Value {
    json!({
        "method": "Runtime.executionContextCreated",
        "sessionId": session,
        "params": {"context": {
            "id": id,
            "origin": "https://example.com",
            "name": "",
            "auxData": {"isDefault": true, "type": "default", "frameId": frame}
        }}
    })
}

async fn attach(connection: &Connection, peer: &MemoryPeer, parent: Option<&str>, id: &str) -> anyhow::Result<Session> {
    peer.deliver_json(&attach_event(parent, id));
    Ok(connection.wait_for_session(&SessionId::from(id), STEP).await?)
}

// ============================================================================
// End-to-End
// ============================================================================

#[tokio::test]
async fn test_end_to_end_call_then_close() -> anyhow::Result<()> {
    let (connection, peer) = open(Protocol::Cdp)?;

    let first = tokio::spawn({
        let connection = connection.clone();
        async move { connection.send_and_wait("Foo.bar", json!({}), None).await }
    });

    let wire = timeout(STEP, peer.recv_json()).await?.expect("request");
    assert_eq!(wire["id"], 1);
    assert_eq!(wire["method"], "Foo.bar");
    assert!(wire.get("sessionId").is_none());

    peer.deliver_json(&json!({"id": 1, "result": {"ok": true}}));
    let value = assert_ok!(first.await?);
    assert_eq!(value, json!({"ok": true}));

    let second = tokio::spawn({
        let connection = connection.clone();
        async move { connection.send_and_wait("Foo.baz", json!({}), None).await }
    });
    let wire = timeout(STEP, peer.recv_json()).await?.expect("request");
    assert_eq!(wire["id"], 2);

    connection.close("bye").await;

    let err = assert_err!(second.await?);
    assert_eq!(err.kind(), ErrorKind::TransportClosed);
    assert_eq!(err.reason(), "bye");
    Ok(())
}

// ============================================================================
// Exactly-Once Resolution
// ============================================================================

#[tokio::test]
async fn test_each_call_resolves_exactly_once() -> anyhow::Result<()> {
    let (connection, peer) = open(Protocol::Cdp)?;

    // Timed out first: the late response must not resolve it again.
    let err = connection
        .send_and_wait_with_timeout("Slow.call", json!({}), None, Duration::from_millis(20))
        .await
        .expect_err("timeout");
    assert_eq!(err.kind(), ErrorKind::Timeout);

    let late = timeout(STEP, peer.recv_json()).await?.expect("request");
    peer.deliver_json(&json!({"id": late["id"], "result": {}}));

    // Answered first: a duplicate response is flagged, not delivered.
    let call = tokio::spawn({
        let connection = connection.clone();
        async move { connection.send_and_wait("Fast.call", json!({}), None).await }
    });
    let fast = timeout(STEP, peer.recv_json()).await?.expect("request");
    peer.deliver_json(&json!({"id": fast["id"], "result": {"n": 1}}));
    peer.deliver_json(&json!({"id": fast["id"], "result": {"n": 2}}));
    assert_eq!(assert_ok!(call.await?), json!({"n": 1}));

    let stats = loop {
        let stats = connection.stats().await?;
        if stats.unmatched >= 2 {
            break stats;
        }
        sleep(Duration::from_millis(5)).await;
    };
    assert_eq!(stats.resolved, 2);
    assert_eq!(stats.unmatched, 2);
    assert_eq!(stats.pending, 0);
    Ok(())
}

#[tokio::test]
async fn test_protocol_error_is_local_to_its_call() -> anyhow::Result<()> {
    let (connection, peer) = open(Protocol::Cdp)?;

    let failing = tokio::spawn({
        let connection = connection.clone();
        async move { connection.send_and_wait("Bad.call", json!({}), None).await }
    });
    let request = timeout(STEP, peer.recv_json()).await?.expect("request");
    peer.deliver_json(&json!({"id": request["id"], "error": {"code": -32601, "message": "'Bad.call' wasn't found"}}));

    let err = assert_err!(failing.await?);
    assert_eq!(err.kind(), ErrorKind::Protocol);
    assert!(err.reason().contains("wasn't found"));
    assert!(!connection.is_closed());
    Ok(())
}

// ============================================================================
// Close Cascade
// ============================================================================

#[tokio::test]
async fn test_close_cascade_reaches_every_session_before_disconnect() -> anyhow::Result<()> {
    let (connection, peer) = open(Protocol::Cdp)?;
    let root = attach(&connection, &peer, None, "A").await?;
    let child = attach(&connection, &peer, Some("A"), "B").await?;
    let grandchild = attach(&connection, &peer, Some("B"), "C").await?;

    let mut calls = Vec::new();
    for session in [&root, &child, &grandchild] {
        let session = session.clone();
        calls.push(tokio::spawn(async move {
            session.send_and_wait("Runtime.evaluate", json!({"expression": "1"})).await
        }));
        timeout(STEP, peer.recv_json()).await?.expect("request");
    }

    let mut events = connection.subscribe();
    connection.close("bye").await;

    for call in calls {
        let err = assert_err!(call.await?);
        assert_eq!(err.kind(), ErrorKind::TransportClosed);
        assert_eq!(err.reason(), "bye");
    }
    assert!(root.is_closed() && child.is_closed() && grandchild.is_closed());

    let mut order = Vec::new();
    while let Some(event) = timeout(STEP, events.recv()).await? {
        match event {
            ConnectionEvent::SessionDetached { session, .. } => order.push(session.to_string()),
            ConnectionEvent::Disconnected { reason } => {
                assert_eq!(reason, "bye");
                order.push("disconnected".to_string());
                break;
            }
            _ => {}
        }
    }
    assert_eq!(order, vec!["C", "B", "A", "disconnected"]);

    // Idempotent: a second close changes nothing.
    connection.close("again").await;
    assert_eq!(connection.close_reason().as_deref(), Some("bye"));
    Ok(())
}

#[tokio::test]
async fn test_peer_close_runs_the_same_cascade() -> anyhow::Result<()> {
    let (connection, peer) = open(Protocol::Cdp)?;
    let session = attach(&connection, &peer, None, "A").await?;
    let disconnected = connection.wait_for_event("Never.sent");

    peer.close("browser exited");

    let err = assert_err!(disconnected.wait(STEP).await);
    assert_eq!(err.kind(), ErrorKind::TransportClosed);
    assert_eq!(err.reason(), "browser exited");
    assert!(session.is_closed());
    assert!(connection.is_closed());
    Ok(())
}

#[tokio::test]
async fn test_session_close_fails_only_its_subtree() -> anyhow::Result<()> {
    let (connection, peer) = open(Protocol::Cdp)?;
    let parent = attach(&connection, &peer, None, "P").await?;
    let child = attach(&connection, &peer, Some("P"), "K").await?;
    let sibling = attach(&connection, &peer, None, "Q").await?;

    let pending = tokio::spawn({
        let child = child.clone();
        async move { child.send_and_wait("Page.navigate", json!({"url": "about:blank"})).await }
    });
    timeout(STEP, peer.recv_json()).await?.expect("request");

    parent.close("tab closed").await;

    let err = assert_err!(pending.await?);
    assert_eq!(err.kind(), ErrorKind::SessionClosed);
    assert_eq!(err.reason(), "tab closed");
    assert!(child.is_closed());
    assert!(!sibling.is_closed());

    let err = assert_err!(child.send_and_wait("Page.reload", json!({})).await);
    assert_eq!(err.kind(), ErrorKind::SessionClosed);
    assert!(!connection.is_closed());
    Ok(())
}

// ============================================================================
// Unknown Sessions
// ============================================================================

#[tokio::test]
async fn test_messages_for_detached_session_are_dropped() -> anyhow::Result<()> {
    let (connection, peer) = open(Protocol::Cdp)?;
    let session = attach(&connection, &peer, None, "S").await?;

    let detached = session.wait_for_event("Never.sent");
    peer.deliver_json(&json!({"method": "Target.detachedFromTarget", "params": {"sessionId": "S"}}));
    assert_eq!(assert_err!(detached.wait(STEP).await).kind(), ErrorKind::SessionClosed);

    peer.deliver_json(&json!({"method": "Page.loadEventFired", "sessionId": "S", "params": {}}));
    peer.deliver_json(&json!({"id": 99, "sessionId": "S", "result": {}}));

    // The dispatcher is still healthy.
    let call = tokio::spawn({
        let connection = connection.clone();
        async move { connection.send_and_wait("Browser.getVersion", json!({}), None).await }
    });
    let request = timeout(STEP, peer.recv_json()).await?.expect("request");
    peer.deliver_json(&json!({"id": request["id"], "result": {"product": "Chrome"}}));
    assert_ok!(call.await?);

    let stats = connection.stats().await?;
    assert_eq!(stats.dropped, 2);
    assert_eq!(stats.unmatched, 0);
    assert_eq!(stats.sessions, 0);
    Ok(())
}

// ============================================================================
// Realms and Handles
// ============================================================================

#[tokio::test]
async fn test_replaced_realm_rejects_old_handles_locally() -> anyhow::Result<()> {
    let (connection, peer) = open(Protocol::Cdp)?;
    let session = attach(&connection, &peer, None, "S").await?;
    let frame = RealmOwner::frame("F");

    peer.deliver_json(&context_created("S", 1, "F"));
    let first = session.wait_for_realm(&frame, None, STEP).await?;

    let minted = tokio::spawn({
        let realm = first.clone();
        async move { realm.evaluate_handle("document").await }
    });
    let request = timeout(STEP, peer.recv_json()).await?.expect("request");
    assert_eq!(request["method"], "Runtime.evaluate");
    assert_eq!(request["params"]["contextId"], 1);
    peer.deliver_json(&json!({
        "id": request["id"],
        "sessionId": "S",
        "result": {"result": {"type": "object", "className": "HTMLDocument", "objectId": "obj-1"}}
    }));
    let handle = assert_ok!(minted.await?);
    assert_eq!(first.live_handles(), 1);

    let mut events = connection.subscribe();
    peer.deliver_json(&context_created("S", 2, "F"));
    let second = loop {
        if let Some(ConnectionEvent::RealmUpdated { previous, current }) = timeout(STEP, events.recv()).await? {
            assert_eq!(previous, first.id());
            break current;
        }
    };
    assert_ne!(second.id, first.id());

    let err = assert_err!(handle.evaluate("(node) => node.title", &[]).await);
    assert_eq!(err.kind(), ErrorKind::RealmDestroyed);
    assert!(err.to_string().contains("frame F"));
    assert!(first.is_destroyed());
    assert_eq!(first.live_handles(), 0);
    assert!(peer.try_recv().is_none(), "nothing may reach the new realm");

    let current = session.current_realm(&frame, None).await.expect("replacement");
    assert_eq!(current.id(), second.id);
    Ok(())
}

#[tokio::test]
async fn test_dispose_twice_releases_once() -> anyhow::Result<()> {
    let (connection, peer) = open(Protocol::Cdp)?;
    let session = attach(&connection, &peer, None, "S").await?;
    peer.deliver_json(&context_created("S", 5, "F"));
    let realm = session.wait_for_realm(&RealmOwner::frame("F"), None, STEP).await?;

    let (_responder, log) = respond(&peer, |request| match request["method"].as_str() {
        Some("Runtime.evaluate") => json!({"result": {"type": "object", "objectId": "obj-9"}}),
        _ => json!({}),
    });

    let handle = realm.evaluate_handle("window").await?;
    handle.dispose().await;
    handle.dispose().await;

    assert!(handle.is_disposed());
    assert!(!handle.is_usable());
    assert_eq!(realm.live_handles(), 0);
    let releases = methods(&log)
        .iter()
        .filter(|m| *m == "Runtime.releaseObject")
        .count();
    assert_eq!(releases, 1);

    let err = assert_err!(handle.json_value().await);
    assert_eq!(err.kind(), ErrorKind::HandleDisposed);
    Ok(())
}

#[tokio::test]
async fn test_handle_from_other_realm_is_rejected() -> anyhow::Result<()> {
    let (connection, peer) = open(Protocol::Cdp)?;
    let session = attach(&connection, &peer, None, "S").await?;
    peer.deliver_json(&context_created("S", 1, "F"));
    peer.deliver_json(&context_created("S", 2, "G"));
    let main = session.wait_for_realm(&RealmOwner::frame("F"), None, STEP).await?;
    let other = session.wait_for_realm(&RealmOwner::frame("G"), None, STEP).await?;

    let (_responder, log) = respond(&peer, |_| json!({"result": {"type": "object", "objectId": "obj-1"}}));
    let handle = main.evaluate_handle("document.body").await?;
    let before = log.lock().len();

    let err = assert_err!(other.call_function("(el) => el.id", &[handle.into()]).await);
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    assert_eq!(log.lock().len(), before);
    Ok(())
}

#[tokio::test]
async fn test_utility_is_cached_per_realm_and_replaced_on_navigation() -> anyhow::Result<()> {
    let (connection, peer) = open(Protocol::Cdp)?;
    let session = attach(&connection, &peer, None, "S").await?;
    let frame = RealmOwner::frame("F");
    peer.deliver_json(&context_created("S", 1, "F"));
    let first = session.wait_for_realm(&frame, None, STEP).await?;

    let (_responder, log) = respond(&peer, |request| {
        let context = &request["params"]["contextId"];
        json!({"result": {"type": "object", "objectId": format!("util-{context}")}})
    });

    let old_utility = first.utility().await?;
    let again = first.utility().await?;
    assert_eq!(again.remote(), old_utility.remote());
    assert_eq!(methods(&log), vec!["Runtime.evaluate"]);

    let mut events = connection.subscribe();
    peer.deliver_json(&context_created("S", 2, "F"));
    loop {
        if let Some(ConnectionEvent::RealmUpdated { .. }) = timeout(STEP, events.recv()).await? {
            break;
        }
    }

    assert!(!old_utility.is_usable());
    let err = assert_err!(old_utility.evaluate("(u) => u", &[]).await);
    assert_eq!(err.kind(), ErrorKind::RealmDestroyed);
    assert_eq!(assert_err!(first.utility().await).kind(), ErrorKind::RealmDestroyed);

    let second = session.current_realm(&frame, None).await.expect("replacement");
    let fresh = second.utility().await?;
    assert_eq!(fresh.remote().map(|r| r.object_id.as_str()), Some("util-2"));
    assert_eq!(methods(&log), vec!["Runtime.evaluate", "Runtime.evaluate"]);
    let sent = log.lock().last().cloned().expect("request");
    assert_eq!(sent["params"]["contextId"], 2);
    Ok(())
}

#[tokio::test]
async fn test_dropping_every_handle_releases_the_transport() -> anyhow::Result<()> {
    let (connection, peer) = open(Protocol::Cdp)?;
    let session = attach(&connection, &peer, None, "S").await?;
    peer.deliver_json(&context_created("S", 1, "F"));
    let realm = session.wait_for_realm(&RealmOwner::frame("F"), None, STEP).await?;

    let (_responder, _log) = respond(&peer, |request| match request["method"].as_str() {
        Some("Runtime.evaluate") => json!({"result": {"type": "object", "objectId": "util-1"}}),
        _ => json!({"result": {"type": "boolean", "value": false}}),
    });

    let utility = realm.utility().await?;
    // Never satisfied and never timed out: only the close can end it.
    let wait = realm.wait_for_function("() => false", Vec::new(), WaitOptions::new())?;
    sleep(Duration::from_millis(30)).await;

    drop(utility);
    drop(realm);
    drop(session);
    drop(connection);

    timeout(STEP, async {
        while !peer.is_closed() {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await?;

    let err = assert_err!(timeout(STEP, wait.wait()).await?);
    assert_eq!(err.kind(), ErrorKind::TransportClosed);
    Ok(())
}

// ============================================================================
// Wait-Operations
// ============================================================================

#[tokio::test]
async fn test_wait_reruns_in_replacement_realm() -> anyhow::Result<()> {
    let (connection, peer) = open(Protocol::Cdp)?;
    let session = attach(&connection, &peer, None, "S").await?;
    peer.deliver_json(&context_created("S", 1, "F"));
    let realm = session.wait_for_realm(&RealmOwner::frame("F"), None, STEP).await?;

    // The predicate only holds in the second context.
    let (_responder, _log) = respond(&peer, |request| {
        let ready = request["params"]["executionContextId"] == 2;
        json!({"result": {"type": "boolean", "value": ready}})
    });

    let wait = realm.wait_for_function("() => window.ready", Vec::new(), WaitOptions::new())?;
    sleep(Duration::from_millis(40)).await;
    assert_eq!(wait.state(), WaitState::Pending);

    peer.deliver_json(&context_created("S", 2, "F"));
    let value = timeout(STEP, wait.wait()).await??;
    assert_eq!(value, json!(true));
    Ok(())
}

#[tokio::test]
async fn test_wait_fails_when_owner_goes_away() -> anyhow::Result<()> {
    let (connection, peer) = open(Protocol::Cdp)?;
    let session = attach(&connection, &peer, None, "S").await?;
    peer.deliver_json(&context_created("S", 1, "F"));
    let realm = session.wait_for_realm(&RealmOwner::frame("F"), None, STEP).await?;

    let (_responder, _log) = respond(&peer, |_| json!({"result": {"type": "boolean", "value": false}}));
    let wait = realm.wait_for_function("() => false", Vec::new(), WaitOptions::new())?;
    sleep(Duration::from_millis(30)).await;

    peer.deliver_json(&json!({
        "method": "Page.frameDetached",
        "sessionId": "S",
        "params": {"frameId": "F", "reason": "remove"}
    }));

    let err = assert_err!(timeout(STEP, wait.wait()).await?);
    assert_eq!(err.kind(), ErrorKind::RealmDestroyed);
    assert!(realm.is_destroyed());
    Ok(())
}

#[tokio::test]
async fn test_wait_timeout_and_cancel() -> anyhow::Result<()> {
    let (connection, peer) = open(Protocol::Cdp)?;
    let session = attach(&connection, &peer, None, "S").await?;
    peer.deliver_json(&context_created("S", 1, "F"));
    let realm = session.wait_for_realm(&RealmOwner::frame("F"), None, STEP).await?;
    let (_responder, _log) = respond(&peer, |_| json!({"result": {"type": "boolean", "value": false}}));

    let timed = realm.wait_for_function(
        "() => false",
        Vec::new(),
        WaitOptions::new().with_timeout(Duration::from_millis(50)),
    )?;
    let err = assert_err!(timeout(STEP, timed.wait()).await?);
    assert_eq!(err.kind(), ErrorKind::Timeout);

    let cancelled = realm.wait_for_function("() => false", Vec::new(), WaitOptions::new())?;
    cancelled.cancel();
    let err = assert_err!(timeout(STEP, cancelled.wait()).await?);
    assert_eq!(err.kind(), ErrorKind::Cancelled);

    let stats = connection.stats().await?;
    assert_eq!(stats.waits, 0);
    Ok(())
}

// ============================================================================
// BiDi
// ============================================================================

#[tokio::test]
async fn test_bidi_contexts_and_realms() -> anyhow::Result<()> {
    let (connection, peer) = open(Protocol::Bidi)?;

    peer.deliver_json(&json!({
        "type": "event",
        "method": "browsingContext.contextCreated",
        "params": {"context": "C1", "url": "about:blank", "children": null, "parent": null}
    }));
    let session = connection.wait_for_session(&SessionId::from("C1"), STEP).await?;

    peer.deliver_json(&json!({
        "type": "event",
        "method": "script.realmCreated",
        "params": {"realm": "r-1", "origin": "null", "type": "window", "context": "C1"}
    }));
    let realm = session.wait_for_realm(&session.main_frame(), None, STEP).await?;

    let evaluation = tokio::spawn({
        let realm = realm.clone();
        async move { realm.evaluate("6 * 7").await }
    });
    let request = timeout(STEP, peer.recv_json()).await?.expect("request");
    assert_eq!(request["method"], "script.evaluate");
    assert_eq!(request["params"]["target"], json!({"realm": "r-1"}));
    assert!(request.get("sessionId").is_none());
    peer.deliver_json(&json!({
        "type": "success",
        "id": request["id"],
        "result": {"type": "success", "realm": "r-1", "result": {"type": "number", "value": 42}}
    }));
    assert_eq!(assert_ok!(evaluation.await?), json!(42));

    let closed = session.wait_for_event("Never.sent");
    peer.deliver_json(&json!({
        "type": "event",
        "method": "browsingContext.contextDestroyed",
        "params": {"context": "C1", "url": "about:blank", "children": null, "parent": null}
    }));
    assert_eq!(assert_err!(closed.wait(STEP).await).kind(), ErrorKind::SessionClosed);
    assert!(realm.is_destroyed());
    Ok(())
}
