//! In-memory transport for driving shards from tests.
#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use shardgate::bootstrap::{GatewayInfo, StaticGatewayInfo};
use shardgate::codec::{Encoding, WireMessage};
use shardgate::events::{ChannelSink, ShardEvent};
use shardgate::metrics::GatewayMetrics;
use shardgate::shard::{ShardContext, ShardState, StartupPacer};
use shardgate::transport::{Connector, Transport, TransportEvent};
use shardgate::GatewayError;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

pub const GATEWAY_URL: &str = "wss://gateway.test";
pub const TOKEN: &str = "test-token";

/// Server side of one accepted connection.
pub struct MockServer {
    pub url: String,
    encoding: Encoding,
    from_client: mpsc::UnboundedReceiver<WireMessage>,
    to_client: mpsc::UnboundedSender<TransportEvent>,
    closes: Arc<Mutex<Vec<u16>>>,
}

impl MockServer {
    pub fn send(&self, value: Value) {
        let message = self.encoding.encode(&value).expect("encode frame");
        let _ = self.to_client.send(TransportEvent::Message(message));
    }

    pub fn hello(&self, heartbeat_interval: u64) {
        self.send(json!({"op": 10, "d": {"heartbeat_interval": heartbeat_interval}}));
    }

    pub fn ready(&self, seq: u64, session_id: &str) {
        self.send(json!({"op": 0, "s": seq, "t": "READY", "d": {"session_id": session_id}}));
    }

    pub fn dispatch(&self, seq: u64, event_type: &str, data: Value) {
        self.send(json!({"op": 0, "s": seq, "t": event_type, "d": data}));
    }

    pub fn ack(&self) {
        self.send(json!({"op": 11}));
    }

    /// Close from the server side.
    pub fn close(&self, code: u16) {
        let _ = self.to_client.send(TransportEvent::Closed {
            code: Some(code),
            reason: "server closing".to_string(),
        });
    }

    /// Next frame the client sent, or `None` once the client dropped the transport.
    pub async fn recv(&mut self) -> Option<Value> {
        let message = self.from_client.recv().await?;
        Some(self.encoding.decode(&message).expect("decode frame"))
    }

    /// Next client frame with the given opcode, skipping others.
    pub async fn recv_op(&mut self, op: u64) -> Option<Value> {
        loop {
            let frame = self.recv().await?;
            if frame["op"] == op {
                return Some(frame);
            }
        }
    }

    /// Close codes the client sent on this connection.
    pub fn close_codes(&self) -> Vec<u16> {
        self.closes.lock().clone()
    }
}

/// Client side of one connection.
struct MockSocket {
    from_server: mpsc::UnboundedReceiver<TransportEvent>,
    to_server: mpsc::UnboundedSender<WireMessage>,
    closes: Arc<Mutex<Vec<u16>>>,
    closed: bool,
}

#[async_trait]
impl Transport for MockSocket {
    async fn send(&mut self, message: WireMessage) -> Result<(), GatewayError> {
        if self.closed {
            return Err(GatewayError::Transport {
                message: "socket closed".to_string(),
            });
        }
        self.to_server
            .send(message)
            .map_err(|_| GatewayError::Transport {
                message: "server gone".to_string(),
            })
    }

    async fn next_event(&mut self) -> TransportEvent {
        let event = self
            .from_server
            .recv()
            .await
            .unwrap_or(TransportEvent::Closed {
                code: None,
                reason: "server dropped".to_string(),
            });
        if !matches!(event, TransportEvent::Message(_)) {
            self.closed = true;
        }
        event
    }

    async fn close(&mut self, code: u16, _reason: &str) -> Result<(), GatewayError> {
        if !self.closed {
            self.closes.lock().push(code);
            self.closed = true;
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

/// Connector handing every new connection to an [`Acceptor`].
pub struct MockConnector {
    encoding: Encoding,
    accepted: mpsc::UnboundedSender<MockServer>,
    refuse: AtomicUsize,
    attempts: AtomicUsize,
}

impl MockConnector {
    pub fn new(encoding: Encoding) -> (Arc<Self>, Acceptor) {
        let (accepted, rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            encoding,
            accepted,
            refuse: AtomicUsize::new(0),
            attempts: AtomicUsize::new(0),
        });
        (connector, Acceptor { rx })
    }

    /// Fail the next `count` connection attempts.
    pub fn refuse_next(&self, count: usize) {
        self.refuse.store(count, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn Transport>, GatewayError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let refused = self
            .refuse
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(GatewayError::Connect {
                url: url.to_string(),
                source: "connection refused".into(),
            });
        }

        let (to_client, from_server) = mpsc::unbounded_channel();
        let (to_server, from_client) = mpsc::unbounded_channel();
        let closes = Arc::new(Mutex::new(Vec::new()));

        let _ = self.accepted.send(MockServer {
            url: url.to_string(),
            encoding: self.encoding,
            from_client,
            to_client,
            closes: Arc::clone(&closes),
        });

        Ok(Box::new(MockSocket {
            from_server,
            to_server,
            closes,
            closed: false,
        }))
    }
}

pub struct Acceptor {
    rx: mpsc::UnboundedReceiver<MockServer>,
}

impl Acceptor {
    pub async fn accept(&mut self) -> MockServer {
        self.rx.recv().await.expect("connector dropped")
    }

    pub fn try_accept(&mut self) -> Option<MockServer> {
        self.rx.try_recv().ok()
    }
}

pub fn static_gateway(shards: u64) -> Arc<StaticGatewayInfo> {
    Arc::new(StaticGatewayInfo(GatewayInfo {
        url: GATEWAY_URL.to_string(),
        shards,
    }))
}

/// A standalone shard context wired to a mock connector and a channel sink.
pub struct Harness {
    pub ctx: Arc<ShardContext>,
    pub connector: Arc<MockConnector>,
    pub acceptor: Acceptor,
    pub events: mpsc::UnboundedReceiver<ShardEvent>,
}

impl Harness {
    pub fn new(encoding: Encoding, total_shards: u64) -> Self {
        let (connector, acceptor) = MockConnector::new(encoding);
        let (sink, events) = ChannelSink::new();
        let ctx = ShardContext {
            token: TOKEN.to_string(),
            gateway_url: GATEWAY_URL.to_string(),
            encoding,
            total_shards,
            intents: 1,
            connector: Arc::clone(&connector) as Arc<dyn Connector>,
            sink: Arc::new(sink),
            pacer: Arc::new(StartupPacer::default()),
            state: ShardState::new(),
            metrics: Arc::new(GatewayMetrics::new()),
        };
        Self {
            ctx: Arc::new(ctx),
            connector,
            acceptor,
            events,
        }
    }

    /// Wait for the next dispatch event the sink received.
    pub async fn next_dispatch(&mut self) -> (u64, String, Value) {
        loop {
            match self.events.recv().await.expect("sink closed") {
                ShardEvent::Dispatch {
                    shard_id,
                    event_type,
                    data,
                } => return (shard_id, event_type, data),
                _ => continue,
            }
        }
    }
}
