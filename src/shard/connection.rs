//! Single shard connection
//!
//! A `ShardConnection` owns at most one transport at a time and drives it from one
//! spawned task. Every wait (inbound frame, heartbeat tick, identify deadline,
//! control command) is a branch of the same `select!`, so there is exactly one
//! receive loop per transport and closing it cancels all of them at once.

use crate::bootstrap::connect_url;
use crate::codec::{Encoding, WireMessage};
use crate::error::GatewayError;
use crate::events::{EventSink, ShardEvent};
use crate::metrics::GatewayMetrics;
use crate::protocol::{
    invalid_session_resumable, ready_session_id, GatewayFrame, HeartbeatAction, Hello, Identify,
    OpCode, Resume, TickStep, READY_EVENT, RESUMED_EVENT,
};
use crate::shard::pacer::StartupPacer;
use crate::shard::state::{ShardStage, ShardState};
use crate::transport::{Connector, Transport, TransportEvent};

use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

/// Close code sent when the client drops a transport. Non-1000 keeps the session resumable.
pub const CLOSE_CODE: u16 = 4000;

/// Close reason sent alongside [`CLOSE_CODE`].
pub const CLOSE_REASON: &str = "client reconnecting";

/// Wait after the server closed the transport.
pub const SERVER_CLOSE_BACKOFF: Duration = Duration::from_millis(10_000);

/// Wait after a transport error or a failed open.
pub const ERROR_BACKOFF: Duration = Duration::from_millis(5000);

/// Wait after the server rejected the session.
pub const INVALID_SESSION_BACKOFF: Duration = Duration::from_millis(5000);

const COMMAND_BUFFER: usize = 64;

/// Everything shards of one pool share.
pub struct ShardContext {
    pub token: String,
    pub gateway_url: String,
    pub encoding: Encoding,
    pub total_shards: u64,
    pub intents: u64,
    pub connector: Arc<dyn Connector>,
    pub sink: Arc<dyn EventSink>,
    pub pacer: Arc<StartupPacer>,
    pub state: ShardState,
    pub metrics: Arc<GatewayMetrics>,
}

impl ShardContext {
    pub fn connect_url(&self) -> String {
        connect_url(&self.gateway_url, self.encoding)
    }
}

/// Resolved once per shard, when its first READY arrives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardReady {
    pub shard_id: u64,
    pub session_id: String,
    pub time_ready: Instant,
}

/// Requests from a [`ShardHandle`] to its task.
#[derive(Debug)]
pub enum ShardCommand {
    Send {
        payload: Value,
        reply: oneshot::Sender<Result<(), GatewayError>>,
    },
    Close {
        done: oneshot::Sender<()>,
    },
}

/// Why the receive loop of a transport ended.
#[derive(Debug)]
enum Disconnect {
    /// Close, wait, then reconnect.
    Backoff {
        delay: Duration,
        reason: &'static str,
    },
    /// Close and reconnect immediately, resuming the session.
    Resume { reason: &'static str },
    /// Stop for good.
    Shutdown(Option<oneshot::Sender<()>>),
}

enum Step {
    Transport(TransportEvent),
    Command(Option<ShardCommand>),
    Heartbeat,
    Identify,
}

/// Connection state machine for one shard.
pub struct ShardConnection {
    shard_id: u64,
    ctx: Arc<ShardContext>,
    sequence: Option<u64>,
    session_id: Option<String>,
    heartbeat_interval: Option<Duration>,
    heartbeat_action: HeartbeatAction,
    heartbeat: Option<Interval>,
    identify_at: Option<Instant>,
    transport: Option<Box<dyn Transport>>,
    ready_tx: Option<oneshot::Sender<ShardReady>>,
}

impl ShardConnection {
    pub fn new(shard_id: u64, ctx: Arc<ShardContext>) -> Self {
        Self {
            shard_id,
            ctx,
            sequence: None,
            session_id: None,
            heartbeat_interval: None,
            heartbeat_action: HeartbeatAction::default(),
            heartbeat: None,
            identify_at: None,
            transport: None,
            ready_tx: None,
        }
    }

    pub fn shard_id(&self) -> u64 {
        self.shard_id
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Highest sequence seen on the current session.
    pub fn sequence(&self) -> Option<u64> {
        self.sequence
    }

    pub fn heartbeat_interval(&self) -> Option<Duration> {
        self.heartbeat_interval
    }

    pub fn heartbeat_action(&self) -> HeartbeatAction {
        self.heartbeat_action
    }

    pub fn is_heartbeating(&self) -> bool {
        self.heartbeat.is_some()
    }

    pub fn is_connected(&self) -> bool {
        self.transport.as_ref().is_some_and(|t| !t.is_closed())
    }

    /// Open a transport and wait for hello, then arm the heartbeat timer.
    ///
    /// Nothing is sent before hello. The first tick fires one full interval later.
    pub async fn connect(&mut self) -> Result<(), GatewayError> {
        self.set_stage(ShardStage::Connecting);
        let url = self.ctx.connect_url();
        self.debug(format!("connecting to {url}"));

        let transport = self.ctx.connector.connect(&url).await?;
        self.transport = Some(transport);
        self.set_stage(ShardStage::AwaitingHello);

        let hello = self.await_hello().await?;
        let period = Duration::from_millis(hello.heartbeat_interval.max(1));
        let mut interval = time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        self.heartbeat_interval = Some(period);
        self.heartbeat_action = HeartbeatAction::SendBeat;
        self.heartbeat = Some(interval);

        self.debug(format!(
            "received hello, heartbeat interval {} ms",
            period.as_millis()
        ));
        Ok(())
    }

    /// Read exactly one frame and require it to be hello.
    async fn await_hello(&mut self) -> Result<Hello, GatewayError> {
        let transport = self.transport.as_mut().ok_or(GatewayError::NotConnected {
            shard_id: self.shard_id,
        })?;

        match transport.next_event().await {
            TransportEvent::Message(message) => {
                let frame = GatewayFrame::decode(self.ctx.encoding, &message)?;
                self.record_inbound(&frame);
                Hello::from_frame(&frame)
            }
            TransportEvent::Closed { code, reason } => {
                Err(GatewayError::ConnectionClosed { code, reason })
            }
            TransportEvent::Error(message) => Err(GatewayError::Transport { message }),
        }
    }

    /// Claim a new session. Clears any previous session and sequence.
    pub async fn identify(&mut self) -> Result<(), GatewayError> {
        self.session_id = None;
        self.sequence = None;
        self.ctx.state.set_sequence(self.shard_id, None);
        self.set_stage(ShardStage::Identifying);

        let frame = GatewayFrame::command(
            OpCode::Identify,
            Identify::new(
                &self.ctx.token,
                self.shard_id,
                self.ctx.total_shards,
                self.ctx.intents,
            ),
        )?;
        self.send_frame(&frame).await?;

        self.ctx.metrics.record_session(self.shard_id, "identify");
        self.debug(format!(
            "identifying as shard [{}, {}]",
            self.shard_id, self.ctx.total_shards
        ));
        Ok(())
    }

    /// Ask the server to replay events missed since `sequence`.
    pub async fn resume(&mut self) -> Result<(), GatewayError> {
        let Some(session_id) = self.session_id.as_deref() else {
            return Err(GatewayError::NoSession {
                shard_id: self.shard_id,
            });
        };

        let frame = GatewayFrame::command(
            OpCode::Resume,
            Resume {
                token: &self.ctx.token,
                session_id,
                seq: self.sequence,
            },
        )?;
        self.set_stage(ShardStage::Resuming);
        self.send_frame(&frame).await?;

        self.ctx.metrics.record_session(self.shard_id, "resume");
        self.debug(format!("resuming session at sequence {:?}", self.sequence));
        Ok(())
    }

    /// Encode a payload and write it to the transport. No buffering.
    pub async fn send(&mut self, payload: &Value) -> Result<(), GatewayError> {
        let message = self.ctx.encoding.encode(payload)?;
        self.write(message).await
    }

    async fn send_frame(&mut self, frame: &GatewayFrame) -> Result<(), GatewayError> {
        let message = frame.encode(self.ctx.encoding)?;
        self.write(message).await
    }

    async fn write(&mut self, message: WireMessage) -> Result<(), GatewayError> {
        let transport = self.transport.as_mut().ok_or(GatewayError::NotConnected {
            shard_id: self.shard_id,
        })?;
        transport.send(message).await
    }

    async fn send_heartbeat(&mut self) -> Result<(), GatewayError> {
        self.send_frame(&GatewayFrame::heartbeat(self.sequence)).await?;
        self.ctx.metrics.record_heartbeat_sent(self.shard_id);
        trace!(shard_id = self.shard_id, seq = ?self.sequence, "Sent heartbeat");
        Ok(())
    }

    /// Stop the heartbeat timer and close the transport, waiting for the handshake.
    ///
    /// Idempotent: later calls find neither timer nor transport and return at once.
    pub async fn close(&mut self) -> Result<(), GatewayError> {
        self.heartbeat = None;
        self.identify_at = None;

        let Some(mut transport) = self.transport.take() else {
            return Ok(());
        };
        if transport.is_closed() {
            return Ok(());
        }

        self.set_stage(ShardStage::Closing);
        self.debug("closing connection");
        transport.close(CLOSE_CODE, CLOSE_REASON).await
    }

    /// Spawn the shard task. The receiver resolves on the first READY.
    pub fn spawn(mut self) -> (ShardHandle, oneshot::Receiver<ShardReady>) {
        let (ready_tx, ready_rx) = oneshot::channel();
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_BUFFER);
        self.ready_tx = Some(ready_tx);

        let shard_id = self.shard_id;
        let task = tokio::spawn(self.run(commands_rx));

        (
            ShardHandle {
                shard_id,
                commands: commands_tx,
                task,
            },
            ready_rx,
        )
    }

    async fn run(mut self, mut commands: mpsc::Receiver<ShardCommand>) {
        let shard_id = self.shard_id;
        info!(shard_id, "Shard starting");

        let mut backoff: Option<Duration> = None;
        let done = loop {
            if let Some(delay) = backoff.take() {
                self.close_quietly().await;
                self.set_stage(ShardStage::Reconnecting);
                self.debug(format!("reconnecting in {} ms", delay.as_millis()));
                if let Err(done) = interruptible(shard_id, time::sleep(delay), &mut commands).await {
                    break done;
                }
            }

            match interruptible(shard_id, self.connect(), &mut commands).await {
                Err(done) => break done,
                Ok(Err(e)) => {
                    let delay = if e.is_server_close() {
                        SERVER_CLOSE_BACKOFF
                    } else {
                        ERROR_BACKOFF
                    };
                    self.record_failure(&e, "connect_failed");
                    backoff = Some(delay);
                    continue;
                }
                Ok(Ok(())) => {}
            }

            if self.session_id.is_some() {
                if let Err(e) = self.resume().await {
                    self.record_failure(&e, "resume_failed");
                    backoff = Some(ERROR_BACKOFF);
                    continue;
                }
            } else {
                self.schedule_identify();
            }

            match self.drive(&mut commands).await {
                Disconnect::Backoff { delay, reason } => {
                    self.record_reconnect(reason);
                    backoff = Some(delay);
                }
                Disconnect::Resume { reason } => {
                    self.record_reconnect(reason);
                    self.close_quietly().await;
                }
                Disconnect::Shutdown(done) => break done,
            }
        };

        self.close_quietly().await;
        self.set_stage(ShardStage::Terminated);
        self.debug("shard terminated");
        if let Some(done) = done {
            let _ = done.send(());
        }
    }

    /// Defer identify until the pool-wide spacing since the last ready shard has passed.
    fn schedule_identify(&mut self) {
        let now = Instant::now();
        let identify_at = self.ctx.pacer.identify_deadline(now);
        let delay = identify_at - now;
        self.identify_at = Some(identify_at);
        self.set_stage(ShardStage::Identifying);
        if !delay.is_zero() {
            self.debug(format!(
                "waiting {} ms before identifying",
                delay.as_millis()
            ));
        }
    }

    /// Receive loop for the current transport.
    async fn drive(&mut self, commands: &mut mpsc::Receiver<ShardCommand>) -> Disconnect {
        loop {
            let step = {
                let Some(transport) = self.transport.as_mut() else {
                    return Disconnect::Backoff {
                        delay: ERROR_BACKOFF,
                        reason: "not_connected",
                    };
                };
                let heartbeat = &mut self.heartbeat;
                let identify_at = self.identify_at;

                // Timers ahead of inbound frames
                tokio::select! {
                    biased;
                    () = next_tick(heartbeat) => Step::Heartbeat,
                    () = deadline(identify_at) => Step::Identify,
                    command = commands.recv() => Step::Command(command),
                    event = transport.next_event() => Step::Transport(event),
                }
            };

            let outcome = match step {
                Step::Transport(TransportEvent::Message(message)) => {
                    match GatewayFrame::decode(self.ctx.encoding, &message) {
                        Ok(frame) => self.handle_frame(frame).await,
                        Err(e) => {
                            warn!(shard_id = self.shard_id, error = %e, "Skipping undecodable frame");
                            self.ctx
                                .metrics
                                .record_error(self.shard_id, e.error_type_label());
                            Ok(None)
                        }
                    }
                }
                Step::Transport(TransportEvent::Closed { code, reason }) => {
                    self.debug(format!("connection closed by server ({code:?}): {reason}"));
                    Ok(Some(Disconnect::Backoff {
                        delay: SERVER_CLOSE_BACKOFF,
                        reason: "server_close",
                    }))
                }
                Step::Transport(TransportEvent::Error(message)) => {
                    self.debug(format!("transport error: {message}"));
                    self.ctx.metrics.record_error(self.shard_id, "transport");
                    Ok(Some(Disconnect::Backoff {
                        delay: ERROR_BACKOFF,
                        reason: "transport_error",
                    }))
                }
                Step::Heartbeat => self.on_heartbeat_tick().await,
                Step::Identify => {
                    self.identify_at = None;
                    self.identify().await.map(|()| None)
                }
                Step::Command(Some(ShardCommand::Send { payload, reply })) => {
                    let _ = reply.send(self.send(&payload).await);
                    Ok(None)
                }
                Step::Command(Some(ShardCommand::Close { done })) => {
                    return Disconnect::Shutdown(Some(done))
                }
                Step::Command(None) => return Disconnect::Shutdown(None),
            };

            match outcome {
                Ok(None) => {}
                Ok(Some(disconnect)) => return disconnect,
                Err(e) => {
                    self.debug(format!("send failed: {e}"));
                    self.ctx
                        .metrics
                        .record_error(self.shard_id, e.error_type_label());
                    return Disconnect::Backoff {
                        delay: ERROR_BACKOFF,
                        reason: "send_failed",
                    };
                }
            }
        }
    }

    async fn on_heartbeat_tick(&mut self) -> Result<Option<Disconnect>, GatewayError> {
        let (step, next) = self.heartbeat_action.on_tick();
        self.heartbeat_action = next;

        match step {
            TickStep::Beat => {
                self.send_heartbeat().await?;
                Ok(None)
            }
            TickStep::ForceResume => {
                warn!(shard_id = self.shard_id, "Heartbeat ack missed");
                self.debug("heartbeat ack missed, forcing resume");
                Ok(Some(Disconnect::Resume {
                    reason: "heartbeat_timeout",
                }))
            }
        }
    }

    /// Process one inbound frame in delivery order.
    async fn handle_frame(
        &mut self,
        frame: GatewayFrame,
    ) -> Result<Option<Disconnect>, GatewayError> {
        self.record_inbound(&frame);

        match frame.opcode() {
            Some(OpCode::HeartbeatAck) => {
                self.heartbeat_action = self.heartbeat_action.on_ack();
                self.ctx.state.record_heartbeat_ack(self.shard_id);
                self.ctx.metrics.record_heartbeat_ack(self.shard_id);
                trace!(shard_id = self.shard_id, "Heartbeat acknowledged");
            }
            Some(OpCode::Heartbeat) => {
                self.debug("server requested heartbeat");
                self.send_heartbeat().await?;
            }
            Some(OpCode::Dispatch) => self.handle_dispatch(frame),
            Some(OpCode::InvalidSession) => {
                let resumable = invalid_session_resumable(&frame);
                if !resumable {
                    self.session_id = None;
                    self.sequence = None;
                    self.ctx.state.set_sequence(self.shard_id, None);
                }
                self.debug(format!("invalid session (resumable: {resumable})"));
                return Ok(Some(Disconnect::Backoff {
                    delay: INVALID_SESSION_BACKOFF,
                    reason: "invalid_session",
                }));
            }
            Some(OpCode::Reconnect) => {
                self.debug("server requested reconnect");
                return Ok(Some(Disconnect::Resume {
                    reason: "server_request",
                }));
            }
            _ => {
                debug!(shard_id = self.shard_id, op = frame.op, "Ignoring frame");
            }
        }

        Ok(None)
    }

    fn handle_dispatch(&mut self, frame: GatewayFrame) {
        let session_id = ready_session_id(&frame).map(str::to_owned);
        let GatewayFrame { d, s, t, .. } = frame;
        let Some(event_type) = t else {
            warn!(shard_id = self.shard_id, seq = ?s, "Dispatch frame without event type");
            return;
        };

        if event_type == RESUMED_EVENT {
            self.set_stage(ShardStage::Ready);
            self.debug("successfully resumed");
            return;
        }

        self.ctx.state.record_dispatch(self.shard_id);
        self.ctx.metrics.record_dispatch(self.shard_id, &event_type);

        if event_type == READY_EVENT {
            self.on_ready(session_id);
        }

        self.ctx.sink.emit(ShardEvent::Dispatch {
            shard_id: self.shard_id,
            event_type,
            data: d,
        });
    }

    fn on_ready(&mut self, session_id: Option<String>) {
        let now = Instant::now();
        match session_id {
            Some(id) => self.session_id = Some(id),
            None => warn!(shard_id = self.shard_id, "READY without session id"),
        }
        self.set_stage(ShardStage::Ready);
        self.ctx.pacer.mark_ready(now);

        info!(
            shard_id = self.shard_id,
            session_id = ?self.session_id,
            "Shard ready"
        );

        if let Some(tx) = self.ready_tx.take() {
            let _ = tx.send(ShardReady {
                shard_id: self.shard_id,
                session_id: self.session_id.clone().unwrap_or_default(),
                time_ready: now,
            });
        }
    }

    /// Sequence tracking and verbatim forwarding shared by every inbound frame.
    fn record_inbound(&mut self, frame: &GatewayFrame) {
        if let Some(seq) = frame.s {
            let next = self.sequence.map_or(seq, |current| current.max(seq));
            self.sequence = Some(next);
            self.ctx.state.set_sequence(self.shard_id, Some(next));
        }

        self.ctx.state.record_frame(self.shard_id);
        self.ctx.metrics.record_frame(self.shard_id, frame.op);
        self.ctx.sink.emit(ShardEvent::Payload {
            shard_id: self.shard_id,
            frame: frame.clone(),
        });
    }

    async fn close_quietly(&mut self) {
        if let Err(e) = self.close().await {
            debug!(shard_id = self.shard_id, error = %e, "Close handshake failed");
        }
    }

    fn record_failure(&self, error: &GatewayError, reason: &'static str) {
        warn!(shard_id = self.shard_id, error = %error, reason, "Shard connection failed");
        self.ctx
            .metrics
            .record_error(self.shard_id, error.error_type_label());
        self.debug(format!("{reason}: {error}"));
        self.record_reconnect(reason);
    }

    fn record_reconnect(&self, reason: &'static str) {
        self.ctx.state.record_reconnect(self.shard_id);
        self.ctx.metrics.record_reconnect(self.shard_id, reason);
    }

    fn set_stage(&self, stage: ShardStage) {
        self.ctx.state.set_stage(self.shard_id, stage);
        self.ctx
            .metrics
            .set_shards_ready(self.ctx.state.ready_shards());
    }

    /// Diagnostic event, mirrored to tracing.
    fn debug(&self, message: impl Into<String>) {
        let message = message.into();
        debug!(shard_id = self.shard_id, "{message}");
        self.ctx.sink.emit(ShardEvent::Debug {
            shard_id: self.shard_id,
            message,
        });
    }
}

/// Run `fut` while answering commands. Returns `Err` with the close acknowledgement
/// if a close was requested (or every handle dropped) first.
async fn interruptible<F: Future>(
    shard_id: u64,
    fut: F,
    commands: &mut mpsc::Receiver<ShardCommand>,
) -> Result<F::Output, Option<oneshot::Sender<()>>> {
    tokio::pin!(fut);
    loop {
        tokio::select! {
            output = &mut fut => return Ok(output),
            command = commands.recv() => match command {
                Some(ShardCommand::Send { reply, .. }) => {
                    let _ = reply.send(Err(GatewayError::NotConnected { shard_id }));
                }
                Some(ShardCommand::Close { done }) => return Err(Some(done)),
                None => return Err(None),
            },
        }
    }
}

async fn next_tick(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn deadline(at: Option<Instant>) {
    match at {
        Some(at) => time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Control handle for a spawned shard.
#[derive(Debug)]
pub struct ShardHandle {
    shard_id: u64,
    commands: mpsc::Sender<ShardCommand>,
    task: JoinHandle<()>,
}

impl ShardHandle {
    pub fn shard_id(&self) -> u64 {
        self.shard_id
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Send a payload on the shard's current transport.
    pub async fn send(&self, payload: Value) -> Result<(), GatewayError> {
        let terminated = || GatewayError::ShardTerminated {
            shard_id: self.shard_id,
        };
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(ShardCommand::Send { payload, reply })
            .await
            .map_err(|_| terminated())?;
        rx.await.map_err(|_| terminated())?
    }

    /// Close the shard for good and wait for its task to end.
    pub async fn close(self) -> Result<(), GatewayError> {
        let (done, rx) = oneshot::channel();
        if self.commands.send(ShardCommand::Close { done }).await.is_ok() {
            let _ = rx.await;
        }
        self.task.await.map_err(|_| GatewayError::ShardTerminated {
            shard_id: self.shard_id,
        })
    }
}
