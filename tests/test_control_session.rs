//! Control plane session tests
//!
//! Drives a control-plane engine against the scripted mock server:
//! - Version-gated authentication handshake
//! - Request/reply correlation, timeouts and bulk cancellation
//! - Push event dispatch


use ma_session::protocol::ServerEvent;
use ma_session::session::ConnectionState;
use ma_session::testing::ClientFrame;
use ma_session::transport::Frame;
use ma_session::{AuthFailure, SessionError, TimeoutKind};
use serde_json::json;
use std::collections::HashSet;
use std::time::Duration;
use test_helpers::*;
use tokio::sync::broadcast::error::TryRecvError;

#[tokio::test(start_paused = true)]
async fn test_call_fails_fast_when_not_connected() {
    let (handle, mut server) = spawn_control();

    let result = handle.call("players/all", json!({})).await;
    assert_eq!(result, Err(SessionError::NotConnected));

    // Still Connecting: no hello yet
    handle.connect(target()).await.unwrap();
    let _conn = server.next_connection().await.unwrap();
    assert_eq!(handle.state(), ConnectionState::Connecting);
    let result = handle.call("players/all", json!({})).await;
    assert_eq!(result, Err(SessionError::NotConnected));
}

#[tokio::test(start_paused = true)]
async fn test_legacy_schema_connects_without_credential_exchange() {
    let (handle, mut server) = spawn_control();
    let mut conn = connect_legacy(&handle, &mut server).await;

    assert_eq!(handle.state(), ConnectionState::Connected);
    assert_eq!(conn.endpoint.url, "ws://music.local:8095/ws");
    assert_eq!(conn.endpoint.origin, "http://music.local:8095");

    // Nothing was sent to the server
    let sent: Vec<_> = conn
        .drain()
        .into_iter()
        .filter(|f| matches!(f, ClientFrame::Frame(_)))
        .collect();
    assert!(sent.is_empty(), "legacy path sent frames: {sent:?}");

    let info = handle.server_info().unwrap();
    assert_eq!(info.schema_version, 27);
    assert_eq!(info.server_id, "test-server");
}

#[tokio::test(start_paused = true)]
async fn test_schema_28_sends_credential_and_authenticates() {
    let (handle, mut server) = spawn_control();
    handle.connect(target_with_token("secret")).await.unwrap();

    let mut conn = server.next_connection().await.unwrap();
    conn.send_json(server_hello(28));

    let auth = conn.recv_json().await.unwrap();
    assert_eq!(auth["message_id"], "auth-handshake");
    assert_eq!(auth["command"], "auth");
    assert_eq!(auth["args"]["token"], "secret");

    wait_for_state(&handle, |s| *s == ConnectionState::Authenticating).await;
    assert_eq!(
        handle.call("players/all", json!({})).await,
        Err(SessionError::NotConnected)
    );

    conn.send_json(json!({"message_id": "auth-handshake", "result": {"authenticated": true}}));
    handle.wait_connected(Duration::from_secs(1)).await.unwrap();
    assert_eq!(handle.server_info().unwrap().schema_version, 28);
    assert_eq!(handle.retry_state().attempt_count, 0);
}

#[tokio::test(start_paused = true)]
async fn test_missing_credential_is_terminal_without_reconnect() {
    let (handle, mut server) = spawn_control();
    handle.connect(target()).await.unwrap();

    let mut conn = server.next_connection().await.unwrap();
    conn.send_json(server_hello(28));

    let result = handle.wait_connected(Duration::from_secs(1)).await;
    assert_eq!(result, Err(SessionError::Auth(AuthFailure::Required)));
    assert_eq!(
        handle.state(),
        ConnectionState::Error("authentication required".to_string())
    );
    assert!(handle.requires_credential());

    // No handshake attempted, no reconnection scheduled
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert!(conn
        .drain()
        .iter()
        .all(|f| !matches!(f, ClientFrame::Frame(_))));
    assert_eq!(server.open_count().await, 1);
    assert_eq!(handle.retry_state().attempt_count, 0);
    assert!(!handle.reconnect_if_needed().await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_rejected_credential_is_terminal_and_keeps_retry_count() {
    let (handle, mut server) = spawn_control();
    handle.connect(target_with_token("wrong")).await.unwrap();

    let mut conn = server.next_connection().await.unwrap();
    conn.send_json(server_hello(28));
    let _auth = conn.recv_json().await.unwrap();
    conn.send_json(json!({"message_id": "auth-handshake", "result": {"authenticated": false}}));

    let result = handle.wait_connected(Duration::from_secs(1)).await;
    assert_eq!(result, Err(SessionError::Auth(AuthFailure::Rejected)));
    assert_eq!(
        handle.state(),
        ConnectionState::Error("authentication failed".to_string())
    );
    assert!(!handle.requires_credential());

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(server.open_count().await, 1);
    assert_eq!(handle.retry_state().attempt_count, 0);
    assert_eq!(
        handle.terminal_error(),
        Some(SessionError::Auth(AuthFailure::Rejected))
    );
}

#[tokio::test(start_paused = true)]
async fn test_malformed_auth_reply_is_rejection() {
    let (handle, mut server) = spawn_control();
    handle.connect(target_with_token("secret")).await.unwrap();

    let mut conn = server.next_connection().await.unwrap();
    conn.send_json(server_hello(30));
    let _auth = conn.recv_json().await.unwrap();
    conn.send_json(json!({"message_id": "auth-handshake", "result": "yes"}));

    let result = handle.wait_connected(Duration::from_secs(1)).await;
    assert_eq!(result, Err(SessionError::Auth(AuthFailure::Rejected)));
}

#[tokio::test(start_paused = true)]
async fn test_new_connect_clears_auth_failure() {
    let (handle, mut server) = spawn_control();
    handle.connect(target()).await.unwrap();
    let conn = server.next_connection().await.unwrap();
    conn.send_json(server_hello(28));
    assert!(handle.wait_connected(Duration::from_secs(1)).await.is_err());
    assert!(handle.requires_credential());

    let _conn = connect_with_token(&handle, &mut server).await;
    assert!(!handle.requires_credential());
    assert_eq!(handle.terminal_error(), None);
    assert_eq!(server.open_count().await, 2);
}

#[tokio::test(start_paused = true)]
async fn test_missing_hello_times_out_and_reconnects() {
    let (handle, mut server) = spawn_control();
    handle.connect(target()).await.unwrap();
    let _silent = server.next_connection().await.unwrap();

    let state = wait_for_state(&handle, is_error).await;
    assert_eq!(
        state,
        ConnectionState::Error(SessionError::Timeout(TimeoutKind::Hello).to_string())
    );
    assert_eq!(handle.retry_state().attempt_count, 1);

    // Retry after the first backoff step
    let started = tokio::time::Instant::now();
    let conn = server.next_connection().await.unwrap();
    assert!(started.elapsed() >= Duration::from_secs(2));
    conn.send_json(server_hello(27));
    handle.wait_connected(Duration::from_secs(1)).await.unwrap();
    assert_eq!(handle.retry_state().attempt_count, 0);
}

#[tokio::test(start_paused = true)]
async fn test_missing_auth_reply_times_out_and_reconnects() {
    let (handle, mut server) = spawn_control();
    handle.connect(target_with_token("secret")).await.unwrap();

    let mut conn = server.next_connection().await.unwrap();
    conn.send_json(server_hello(28));
    let _auth = conn.recv_json().await.unwrap();

    let state = wait_for_state(&handle, is_error).await;
    assert_eq!(
        state,
        ConnectionState::Error(SessionError::Timeout(TimeoutKind::AuthReply).to_string())
    );
    assert!(!handle.requires_credential());

    let _retry = server.next_connection().await.unwrap();
    assert_eq!(server.open_count().await, 2);
}

#[tokio::test(start_paused = true)]
async fn test_malformed_hello_fails_attempt() {
    let (handle, mut server) = spawn_control();
    handle.connect(target()).await.unwrap();

    let conn = server.next_connection().await.unwrap();
    conn.send_json(json!({"server_version": "2.4.0", "schema_version": "new"}));

    let state = wait_for_state(&handle, is_error).await;
    assert!(matches!(state, ConnectionState::Error(reason) if reason.starts_with("protocol error")));
    assert_eq!(handle.retry_state().attempt_count, 1);
}

#[tokio::test(start_paused = true)]
async fn test_call_resolves_with_matching_reply() {
    let (handle, mut server) = spawn_control();
    let mut conn = connect_with_token(&handle, &mut server).await;

    let caller = handle.clone();
    let call = tokio::spawn(async move {
        caller
            .call("player_queues/play_media", json!({"queue_id": "kitchen"}))
            .await
    });

    let request = conn.recv_json().await.unwrap();
    assert_eq!(request["command"], "player_queues/play_media");
    assert_eq!(request["args"]["queue_id"], "kitchen");
    let id = request["message_id"].as_str().unwrap().to_string();
    assert_ne!(id, "auth-handshake");

    conn.send_json(json!({"message_id": id, "result": {"ok": true}}));
    assert_eq!(call.await.unwrap(), Ok(json!({"ok": true})));

    let metrics = handle.metrics();
    assert_eq!(metrics.traffic.requests_sent, 1);
    assert_eq!(metrics.traffic.requests_completed, 1);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_calls_use_distinct_ids_and_route_out_of_order() {
    let (handle, mut server) = spawn_control();
    let mut conn = connect_legacy(&handle, &mut server).await;

    let calls: Vec<_> = (0..50)
        .map(|n| {
            let caller = handle.clone();
            tokio::spawn(async move { caller.call("echo", json!({"n": n})).await })
        })
        .collect();

    let mut requests = Vec::new();
    for _ in 0..50 {
        requests.push(conn.recv_json().await.unwrap());
    }
    let ids: HashSet<_> = requests
        .iter()
        .map(|r| r["message_id"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(ids.len(), 50);

    // Reply in reverse order
    for request in requests.iter().rev() {
        conn.send_json(json!({"message_id": request["message_id"], "result": request["args"]["n"]}));
    }

    for (n, call) in calls.into_iter().enumerate() {
        assert_eq!(call.await.unwrap(), Ok(json!(n)));
    }
}

#[tokio::test(start_paused = true)]
async fn test_request_timeout_and_late_reply_is_ignored() {
    let (handle, mut server) = spawn_control();
    let mut conn = connect_legacy(&handle, &mut server).await;

    let caller = handle.clone();
    let slow = tokio::spawn(async move { caller.call("music/sync", json!({})).await });
    let request = conn.recv_json().await.unwrap();

    assert_eq!(
        slow.await.unwrap(),
        Err(SessionError::Timeout(TimeoutKind::Request))
    );
    assert_eq!(handle.metrics().traffic.requests_timed_out, 1);

    // A late reply is dropped without disturbing the session
    conn.send_json(json!({"message_id": request["message_id"], "result": "late"}));

    let caller = handle.clone();
    let next = tokio::spawn(async move { caller.call("players/all", json!({})).await });
    let request = conn.recv_json().await.unwrap();
    conn.send_json(json!({"message_id": request["message_id"], "result": []}));

    assert_eq!(next.await.unwrap(), Ok(json!([])));
    assert_eq!(handle.state(), ConnectionState::Connected);
    assert!(handle.metrics().traffic.frames_dropped >= 1);
}

#[tokio::test(start_paused = true)]
async fn test_error_reply_resolves_call_with_server_error() {
    let (handle, mut server) = spawn_control();
    let mut conn = connect_legacy(&handle, &mut server).await;

    let caller = handle.clone();
    let call = tokio::spawn(async move { caller.call("players/cmd/play", json!({})).await });
    let request = conn.recv_json().await.unwrap();
    conn.send_json(json!({
        "message_id": request["message_id"],
        "error_code": 999,
        "details": "player unavailable"
    }));

    assert_eq!(
        call.await.unwrap(),
        Err(SessionError::Server {
            code: 999,
            details: "player unavailable".to_string()
        })
    );
    assert_eq!(handle.state(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_transport_loss_fails_every_pending_call() {
    let (handle, mut server) = spawn_control();
    let mut conn = connect_legacy(&handle, &mut server).await;

    let calls: Vec<_> = (0..3)
        .map(|_| {
            let caller = handle.clone();
            tokio::spawn(async move { caller.call("players/all", json!({})).await })
        })
        .collect();
    for _ in 0..3 {
        conn.recv_json().await.unwrap();
    }

    conn.close();

    for call in calls {
        assert!(matches!(call.await.unwrap(), Err(SessionError::Transport(_))));
    }
    let state = wait_for_state(&handle, is_error).await;
    assert!(matches!(state, ConnectionState::Error(_)));
    assert!(handle.server_info().is_none());
    assert_eq!(handle.metrics().traffic.requests_failed, 3);
}

#[tokio::test(start_paused = true)]
async fn test_push_events_reach_every_subscriber() {
    let (handle, mut server) = spawn_control();
    let conn = connect_legacy(&handle, &mut server).await;

    let mut first = handle.subscribe();
    let mut second = handle.subscribe();

    conn.send_json(json!({"event": "player_updated", "object_id": "kitchen", "data": {"volume": 30}}));
    conn.send_json(json!({"event": "media_item_added", "data": {"uri": "library://track/1"}}));
    conn.send_json(json!({"error_code": 7, "details": "library scan failed"}));

    for subscriber in [&mut first, &mut second] {
        assert_eq!(
            subscriber.recv().await.unwrap(),
            ServerEvent::PlayerUpdated {
                object_id: Some("kitchen".to_string()),
                data: json!({"volume": 30})
            }
        );
        assert_eq!(
            subscriber.recv().await.unwrap(),
            ServerEvent::Other {
                event: "media_item_added".to_string(),
                object_id: None,
                data: json!({"uri": "library://track/1"})
            }
        );
        assert_eq!(
            subscriber.recv().await.unwrap(),
            ServerEvent::Error {
                code: 7,
                details: "library scan failed".to_string()
            }
        );
    }
    assert_eq!(handle.state(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_error_for_unknown_request_is_broadcast() {
    let (handle, mut server) = spawn_control();
    let conn = connect_legacy(&handle, &mut server).await;
    let mut events = handle.subscribe();

    conn.send_json(json!({"message_id": "not-pending", "error_code": 3, "details": "stale"}));

    assert_eq!(
        events.recv().await.unwrap(),
        ServerEvent::Error {
            code: 3,
            details: "stale".to_string()
        }
    );
}

#[tokio::test(start_paused = true)]
async fn test_frames_before_hello_are_dropped() {
    let (handle, mut server) = spawn_control();
    let mut events = handle.subscribe();
    handle.connect(target()).await.unwrap();

    let mut conn = server.next_connection().await.unwrap();
    conn.send_json(json!({"event": "players_updated", "data": []}));
    conn.send_json(server_hello(27));
    handle.wait_connected(Duration::from_secs(1)).await.unwrap();

    // Round trip so every earlier frame has been processed
    let caller = handle.clone();
    let call = tokio::spawn(async move { caller.call("ping", json!({})).await });
    let request = conn.recv_json().await.unwrap();
    conn.send_json(json!({"message_id": request["message_id"], "result": null}));
    call.await.unwrap().unwrap();

    assert_eq!(events.try_recv(), Err(TryRecvError::Empty));
    assert!(handle.metrics().traffic.frames_dropped >= 1);
}

#[tokio::test(start_paused = true)]
async fn test_auth_required_while_connected_stops_session() {
    let (handle, mut server) = spawn_control();
    let conn = connect_with_token(&handle, &mut server).await;
    let mut events = handle.subscribe();

    conn.send_json(json!({"error_code": 20, "details": "token expired"}));

    assert_eq!(
        events.recv().await.unwrap(),
        ServerEvent::Error {
            code: 20,
            details: "token expired".to_string()
        }
    );
    let state = wait_for_state(&handle, is_error).await;
    assert_eq!(
        state,
        ConnectionState::Error("authentication required".to_string())
    );
    assert!(handle.requires_credential());

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(server.open_count().await, 1);
}

#[tokio::test(start_paused = true)]
async fn test_notify_sends_without_waiting() {
    let (handle, mut server) = spawn_control();
    let mut conn = connect_legacy(&handle, &mut server).await;

    handle
        .notify("players/cmd/volume_up", json!({"player_id": "kitchen"}))
        .await
        .unwrap();

    let sent = conn.recv_json().await.unwrap();
    assert_eq!(sent["command"], "players/cmd/volume_up");
    assert!(sent["message_id"].is_string());
    assert_eq!(handle.metrics().traffic.notifications_sent, 1);
}

#[tokio::test(start_paused = true)]
async fn test_binary_frames_are_dropped_on_control_channel() {
    let (handle, mut server) = spawn_control();
    let conn = connect_legacy(&handle, &mut server).await;
    let mut events = handle.subscribe();

    conn.send_binary(vec![4u8; 16]);
    conn.send_json(json!({"event": "players_updated", "data": []}));

    assert!(matches!(
        events.recv().await.unwrap(),
        ServerEvent::PlayersUpdated { .. }
    ));
    assert_eq!(handle.metrics().traffic.frames_dropped, 1);
}

#[tokio::test(start_paused = true)]
async fn test_auth_frame_credential_is_only_on_the_wire() {
    let (handle, mut server) = spawn_control();
    handle.connect(target_with_token("secret")).await.unwrap();
    let mut conn = server.next_connection().await.unwrap();
    conn.send_json(server_hello(28));

    match conn.recv().await.unwrap() {
        ClientFrame::Frame(Frame::Text(text)) => assert!(text.contains("secret")),
        other => panic!("expected auth frame, got {other:?}"),
    }
    assert!(!format!("{:?}", target_with_token("secret")).contains("secret"));
}
