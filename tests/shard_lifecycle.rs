//! Connection lifecycle of a single shard against an in-memory gateway.

mod common;

use common::{Harness, TOKEN};
use serde_json::json;
use shardgate::codec::Encoding;
use shardgate::events::ShardEvent;
use shardgate::shard::{
    ShardConnection, ShardStage, CLOSE_CODE, ERROR_BACKOFF, INVALID_SESSION_BACKOFF,
    SERVER_CLOSE_BACKOFF,
};
use shardgate::GatewayError;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

#[tokio::test(start_paused = true)]
async fn hello_then_ready_resolves_and_heartbeats_every_interval() {
    let mut harness = Harness::new(Encoding::Json, 1);
    harness.ctx.state.register(0);
    let (_handle, ready) = ShardConnection::new(0, Arc::clone(&harness.ctx)).spawn();

    let mut server = harness.acceptor.accept().await;
    assert_eq!(server.url, "wss://gateway.test/?encoding=json&v=10");

    server.hello(1000);
    let hello_at = Instant::now();

    let identify = server.recv().await.unwrap();
    assert_eq!(identify["op"], 2);
    assert_eq!(identify["d"]["token"], TOKEN);
    assert_eq!(identify["d"]["shard"], json!([0, 1]));

    server.ready(1, "abc");
    let ready = ready.await.unwrap();
    assert_eq!(ready.shard_id, 0);
    assert_eq!(ready.session_id, "abc");

    let beat = server.recv().await.unwrap();
    assert_eq!(beat, json!({"op": 1, "d": 1}));
    let elapsed = hello_at.elapsed();
    assert!(elapsed >= Duration::from_millis(1000), "first beat after {elapsed:?}");
    assert!(elapsed < Duration::from_millis(1100), "first beat after {elapsed:?}");

    server.ack();
    let beat = server.recv().await.unwrap();
    assert_eq!(beat["op"], 1);
    let elapsed = hello_at.elapsed();
    assert!(elapsed >= Duration::from_millis(2000), "second beat after {elapsed:?}");
    assert!(elapsed < Duration::from_millis(2100), "second beat after {elapsed:?}");

    assert_eq!(harness.ctx.state.get_stage(0), Some(ShardStage::Ready));
}

#[tokio::test(start_paused = true)]
async fn missed_ack_closes_and_resumes() {
    let mut harness = Harness::new(Encoding::Json, 1);
    harness.ctx.state.register(0);
    let (_handle, ready) = ShardConnection::new(0, Arc::clone(&harness.ctx)).spawn();

    let mut first = harness.acceptor.accept().await;
    first.hello(1000);
    first.recv_op(2).await.unwrap();
    first.ready(1, "abc");
    first.dispatch(5, "GUILD_CREATE", json!({"id": "1"}));
    ready.await.unwrap();

    // Beat goes unanswered; the following tick gives up on the connection
    let beat = first.recv().await.unwrap();
    assert_eq!(beat, json!({"op": 1, "d": 5}));

    let mut second = harness.acceptor.accept().await;
    assert_eq!(first.close_codes(), vec![CLOSE_CODE]);

    second.hello(1000);
    let resume = second.recv().await.unwrap();
    assert_eq!(
        resume,
        json!({"op": 6, "d": {"token": TOKEN, "session_id": "abc", "seq": 5}})
    );

    second.dispatch(6, "RESUMED", json!({}));
    second.recv_op(1).await.unwrap();
    assert_eq!(harness.ctx.state.get_stage(0), Some(ShardStage::Ready));
    assert!(harness.ctx.state.reconnects(0) >= 1);
}

#[tokio::test(start_paused = true)]
async fn server_close_resumes_with_last_sequence_after_backoff() {
    let mut harness = Harness::new(Encoding::Json, 1);
    harness.ctx.state.register(0);
    let (_handle, ready) = ShardConnection::new(0, Arc::clone(&harness.ctx)).spawn();

    let mut first = harness.acceptor.accept().await;
    first.hello(45_000);
    first.recv_op(2).await.unwrap();
    first.ready(1, "abc");
    first.dispatch(42, "MESSAGE_CREATE", json!({"content": "hi"}));
    ready.await.unwrap();

    first.close(1001);
    let closed_at = Instant::now();

    let mut second = harness.acceptor.accept().await;
    assert!(closed_at.elapsed() >= SERVER_CLOSE_BACKOFF);
    // The server ended it, so the client sends no close of its own
    assert!(first.close_codes().is_empty());

    second.hello(45_000);
    let resume = second.recv().await.unwrap();
    assert_eq!(
        resume,
        json!({"op": 6, "d": {"token": TOKEN, "session_id": "abc", "seq": 42}})
    );
}

#[tokio::test(start_paused = true)]
async fn invalid_session_reidentifies_after_backoff() {
    let mut harness = Harness::new(Encoding::Json, 2);
    harness.ctx.state.register(1);
    let (_handle, _ready) = ShardConnection::new(1, Arc::clone(&harness.ctx)).spawn();

    let mut first = harness.acceptor.accept().await;
    first.hello(45_000);
    first.recv_op(2).await.unwrap();
    first.send(json!({"op": 9, "d": false}));
    let rejected_at = Instant::now();

    let mut second = harness.acceptor.accept().await;
    assert!(rejected_at.elapsed() >= INVALID_SESSION_BACKOFF);
    assert_eq!(first.close_codes(), vec![CLOSE_CODE]);

    second.hello(45_000);
    let identify = second.recv().await.unwrap();
    assert_eq!(identify["op"], 2);
    assert_eq!(identify["d"]["shard"], json!([1, 2]));
}

#[tokio::test(start_paused = true)]
async fn failed_open_retries_after_error_backoff() {
    let mut harness = Harness::new(Encoding::Json, 1);
    harness.connector.refuse_next(1);
    let started = Instant::now();
    let (_handle, _ready) = ShardConnection::new(0, Arc::clone(&harness.ctx)).spawn();

    let server = harness.acceptor.accept().await;
    assert!(started.elapsed() >= ERROR_BACKOFF);
    assert_eq!(harness.connector.attempts(), 2);
    drop(server);
}

#[tokio::test(start_paused = true)]
async fn reconnect_request_resumes_immediately() {
    let mut harness = Harness::new(Encoding::Json, 1);
    let (_handle, ready) = ShardConnection::new(0, Arc::clone(&harness.ctx)).spawn();

    let mut first = harness.acceptor.accept().await;
    first.hello(45_000);
    first.recv_op(2).await.unwrap();
    first.ready(3, "xyz");
    ready.await.unwrap();

    first.send(json!({"op": 7, "d": null}));
    let requested_at = Instant::now();
    let mut second = harness.acceptor.accept().await;
    assert!(requested_at.elapsed() < Duration::from_millis(10));

    second.hello(45_000);
    let resume = second.recv().await.unwrap();
    assert_eq!(resume["op"], 6);
    assert_eq!(resume["d"]["session_id"], "xyz");
    assert_eq!(resume["d"]["seq"], 3);
}

#[tokio::test(start_paused = true)]
async fn server_heartbeat_request_is_answered_at_once() {
    let mut harness = Harness::new(Encoding::Json, 1);
    let (_handle, ready) = ShardConnection::new(0, Arc::clone(&harness.ctx)).spawn();

    let mut server = harness.acceptor.accept().await;
    server.hello(45_000);
    server.recv_op(2).await.unwrap();
    server.ready(8, "abc");
    ready.await.unwrap();

    server.send(json!({"op": 1, "d": null}));
    let asked_at = Instant::now();
    let beat = server.recv().await.unwrap();
    assert_eq!(beat, json!({"op": 1, "d": 8}));
    assert!(asked_at.elapsed() < Duration::from_millis(10));
}

#[tokio::test(start_paused = true)]
async fn dispatches_reach_sink_with_shard_id() {
    let mut harness = Harness::new(Encoding::Json, 4);
    let (_handle, ready) = ShardConnection::new(3, Arc::clone(&harness.ctx)).spawn();

    let mut server = harness.acceptor.accept().await;
    server.hello(45_000);
    let identify = server.recv_op(2).await.unwrap();
    assert_eq!(identify["d"]["shard"], json!([3, 4]));
    server.ready(1, "abc");
    ready.await.unwrap();

    let (shard_id, event_type, _) = harness.next_dispatch().await;
    assert_eq!((shard_id, event_type.as_str()), (3, "READY"));

    server.dispatch(2, "MESSAGE_CREATE", json!({"content": "hello"}));
    let (shard_id, event_type, data) = harness.next_dispatch().await;
    assert_eq!(shard_id, 3);
    assert_eq!(event_type, "MESSAGE_CREATE");
    assert_eq!(data, json!({"content": "hello"}));
}

#[tokio::test(start_paused = true)]
async fn every_frame_is_forwarded_as_payload() {
    let mut harness = Harness::new(Encoding::Json, 1);
    let (_handle, ready) = ShardConnection::new(0, Arc::clone(&harness.ctx)).spawn();

    let mut server = harness.acceptor.accept().await;
    server.hello(45_000);
    server.recv_op(2).await.unwrap();
    server.ready(1, "abc");
    ready.await.unwrap();

    let mut ops = Vec::new();
    while let Ok(event) = harness.events.try_recv() {
        if let ShardEvent::Payload { shard_id, frame } = event {
            assert_eq!(shard_id, 0);
            ops.push(frame.op);
        }
    }
    assert_eq!(ops, vec![10, 0]);
}

#[tokio::test(start_paused = true)]
async fn sequence_is_monotonic_across_out_of_order_frames() {
    let mut harness = Harness::new(Encoding::Json, 1);
    harness.ctx.state.register(0);
    let (_handle, ready) = ShardConnection::new(0, Arc::clone(&harness.ctx)).spawn();

    let mut server = harness.acceptor.accept().await;
    server.hello(1000);
    server.recv_op(2).await.unwrap();
    server.ready(10, "abc");
    server.dispatch(12, "TYPING_START", json!({}));
    server.dispatch(11, "TYPING_START", json!({}));
    ready.await.unwrap();

    let beat = server.recv_op(1).await.unwrap();
    assert_eq!(beat["d"], 12);
    assert_eq!(harness.ctx.state.get_sequence(0), Some(12));
}

#[tokio::test(start_paused = true)]
async fn close_is_idempotent_and_stops_heartbeat() {
    let mut harness = Harness::new(Encoding::Json, 1);
    let mut shard = ShardConnection::new(0, Arc::clone(&harness.ctx));

    let (connected, mut server) = tokio::join!(shard.connect(), async {
        let server = harness.acceptor.accept().await;
        server.hello(1000);
        server
    });
    connected.unwrap();
    assert!(shard.is_heartbeating());
    assert_eq!(shard.heartbeat_interval(), Some(Duration::from_millis(1000)));

    shard.close().await.unwrap();
    shard.close().await.unwrap();

    assert!(!shard.is_heartbeating());
    assert!(!shard.is_connected());
    assert_eq!(server.close_codes(), vec![CLOSE_CODE]);
    // Nothing was ever sent: no identify before it is asked for, no beat after close
    assert_eq!(server.recv().await, None);
}

#[tokio::test(start_paused = true)]
async fn first_frame_must_be_hello() {
    let mut harness = Harness::new(Encoding::Json, 1);
    let mut shard = ShardConnection::new(0, Arc::clone(&harness.ctx));

    let (connected, _server) = tokio::join!(shard.connect(), async {
        let server = harness.acceptor.accept().await;
        server.ready(1, "abc");
        server
    });

    assert!(matches!(
        connected,
        Err(GatewayError::UnexpectedFrame {
            expected: "hello",
            op: 0
        })
    ));
    assert!(!shard.is_heartbeating());
}

#[tokio::test(start_paused = true)]
async fn handle_send_and_close() {
    let mut harness = Harness::new(Encoding::Json, 1);
    harness.ctx.state.register(0);
    let (handle, ready) = ShardConnection::new(0, Arc::clone(&harness.ctx)).spawn();

    let mut server = harness.acceptor.accept().await;
    server.hello(45_000);
    server.recv_op(2).await.unwrap();
    server.ready(1, "abc");
    ready.await.unwrap();

    let presence = json!({"op": 3, "d": {"status": "online", "afk": false}});
    handle.send(presence.clone()).await.unwrap();
    assert_eq!(server.recv().await.unwrap(), presence);

    handle.close().await.unwrap();
    assert_eq!(server.close_codes(), vec![CLOSE_CODE]);
    assert_eq!(harness.ctx.state.get_stage(0), Some(ShardStage::Terminated));
}

#[tokio::test(start_paused = true)]
async fn close_during_backoff_terminates() {
    let mut harness = Harness::new(Encoding::Json, 1);
    harness.ctx.state.register(0);
    harness.connector.refuse_next(usize::MAX);
    let (handle, ready) = ShardConnection::new(0, Arc::clone(&harness.ctx)).spawn();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        harness.ctx.state.get_stage(0),
        Some(ShardStage::Reconnecting)
    );

    let result = handle.send(json!({"op": 1, "d": null})).await;
    assert!(matches!(result, Err(GatewayError::NotConnected { shard_id: 0 })));

    handle.close().await.unwrap();
    assert!(ready.await.is_err());
    assert!(harness.acceptor.try_accept().is_none());
}

#[tokio::test(start_paused = true)]
async fn etf_encoding_end_to_end() {
    let mut harness = Harness::new(Encoding::Etf, 1);
    let (_handle, ready) = ShardConnection::new(0, Arc::clone(&harness.ctx)).spawn();

    let mut server = harness.acceptor.accept().await;
    assert_eq!(server.url, "wss://gateway.test/?encoding=etf&v=10");
    server.hello(45_000);

    let identify = server.recv().await.unwrap();
    assert_eq!(identify["op"], 2);
    assert_eq!(identify["d"]["shard"], json!([0, 1]));
    assert_eq!(identify["d"]["compress"], false);

    server.ready(1, "etf-session");
    assert_eq!(ready.await.unwrap().session_id, "etf-session");
}

#[tokio::test(start_paused = true)]
async fn identify_is_sent_once_per_fresh_session() {
    let mut harness = Harness::new(Encoding::Json, 1);
    let (_handle, ready) = ShardConnection::new(0, Arc::clone(&harness.ctx)).spawn();

    let mut server = harness.acceptor.accept().await;
    server.hello(1000);
    assert_eq!(server.recv().await.unwrap()["op"], 2);
    server.ready(1, "abc");
    ready.await.unwrap();

    // The next thing on the wire is the heartbeat, not another identify
    assert_eq!(server.recv().await.unwrap(), json!({"op": 1, "d": 1}));
    server.ack();
    assert_eq!(server.recv().await.unwrap()["op"], 1);
    assert_eq!(harness.connector.attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn resume_uses_session_from_latest_identify() {
    let mut harness = Harness::new(Encoding::Json, 1);
    let (_handle, ready) = ShardConnection::new(0, Arc::clone(&harness.ctx)).spawn();

    let mut first = harness.acceptor.accept().await;
    first.hello(45_000);
    first.recv_op(2).await.unwrap();
    first.ready(1, "abc");
    ready.await.unwrap();
    first.send(json!({"op": 9, "d": false}));

    let mut second = harness.acceptor.accept().await;
    second.hello(1000);
    let identify = second.recv().await.unwrap();
    assert_eq!(identify["op"], 2);
    second.ready(2, "def");

    // Beat goes unanswered, forcing a resume on the next tick
    assert_eq!(second.recv_op(1).await.unwrap(), json!({"op": 1, "d": 2}));

    let mut third = harness.acceptor.accept().await;
    assert_eq!(second.close_codes(), vec![CLOSE_CODE]);
    third.hello(45_000);
    assert_eq!(
        third.recv().await.unwrap(),
        json!({"op": 6, "d": {"token": TOKEN, "session_id": "def", "seq": 2}})
    );
}

#[tokio::test(start_paused = true)]
async fn due_heartbeat_goes_out_ahead_of_queued_frames() {
    let mut harness = Harness::new(Encoding::Json, 1);
    let (_handle, ready) = ShardConnection::new(0, Arc::clone(&harness.ctx)).spawn();

    let mut server = harness.acceptor.accept().await;
    server.hello(1000);
    server.recv_op(2).await.unwrap();
    server.ready(1, "abc");
    ready.await.unwrap();

    tokio::time::advance(Duration::from_millis(1000)).await;
    for seq in 2..200 {
        server.dispatch(seq, "TYPING_START", json!({}));
    }

    assert_eq!(server.recv().await.unwrap(), json!({"op": 1, "d": 1}));
}
