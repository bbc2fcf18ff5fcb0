//! # Connector
//!
//! Per-connection transport state machine. A connector owns at most one socket at a time and
//! turns it into a reliable, ordered channel that survives short disconnects.
//!
//! ## States
//! ```text
//! new -> connecting -> connected <-> resuming -> closed
//! ```
//!
//! ## Sessions
//! Every outgoing `request`, `response`, `responseError` and `event` is numbered and kept in a
//! [`SendBuffer`] until the peer acknowledges it. Acknowledgements ride on `heartbeat.seq`,
//! `resume.last_seq` and `continue.last_seq`, each carrying the sender's last received seq.
//! Once half a buffer's worth of traffic arrived unacknowledged, an extra `heartbeat` goes out
//! so a busy peer never fills its buffer between two ticks.
//!
//! When the socket drops unexpectedly the connector enters `resuming`:
//! - the initiator redials with exponential backoff and presents `resume{token, last_seq}`;
//!   `continue` replays everything the acceptor has not seen, `invalidate` starts a fresh
//!   session with `hello` on the same socket
//! - the acceptor waits for a new socket to be handed to [`Connector::resume`] and closes the
//!   session once the session timeout elapses
//!
//! ## Heartbeats
//! The initiator sends `heartbeat` every interval and expects the answer before the next tick.
//! The acceptor answers each heartbeat and treats two intervals of silence as a dead socket.
//!
//! Reading and writing of a socket run concurrently, so a peer that is slow to read never
//! holds up inbound traffic or heartbeat checks.
//!
//! All state lives behind one mutex which is never held across an await; events are emitted
//! under that lock so their order matches the state changes that caused them.

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, instrument, trace, warn};

use crate::config::LinkConfig;
use crate::core::address::Address;
use crate::core::message::{
    ContinueData, Envelope, HeartbeatData, HelloData, MessageKind, ReadyData, ResumeData,
};
use crate::error::{constants, ProtocolError, Result};
use crate::transport::dialer::Dialer;
use crate::transport::session::{CloseReason, ConnectorState, SendBuffer, Session};
use crate::transport::socket::{FrameSink, FrameStream, Socket};
use crate::utils::backoff::ExponentialBackoff;
use crate::utils::metrics::global_metrics;
use crate::utils::timeout::with_timeout_error;

/// Lifecycle events and inbound session traffic, in the order they happened
#[derive(Debug, Clone)]
pub enum ConnectorEvent {
    /// A session was established with `hello`/`ready`
    Connected(ReadyData),
    /// Inbound session traffic, already deduplicated and in seq order
    Message(Envelope),
    /// The socket dropped; the session is waiting for a resume
    Resuming,
    /// A resume succeeded and buffered traffic was replayed
    Resumed,
    /// The peer discarded the session; unacknowledged traffic is lost
    Invalidated,
    Closed(CloseReason),
}

pub type ConnectorEvents = mpsc::UnboundedReceiver<ConnectorEvent>;

/// Limits and timings of one connector
#[derive(Debug, Clone)]
pub struct ConnectorOptions {
    pub max_send_buffer: usize,
    pub max_frame_size: usize,
    pub handshake_timeout: Duration,
    pub reconnect_base_delay: Duration,
    pub reconnect_max_delay: Duration,
    pub reconnect_reset: Duration,
}

impl ConnectorOptions {
    pub fn from_config(config: &LinkConfig) -> Self {
        Self {
            max_send_buffer: config.session.max_send_buffer,
            max_frame_size: config.session.max_frame_size,
            handshake_timeout: config.controller.handshake_timeout,
            reconnect_base_delay: config.client.reconnect_base_delay,
            reconnect_max_delay: config.client.reconnect_max_delay,
            reconnect_reset: config.client.reconnect_reset,
        }
    }

    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff::new(
            self.reconnect_base_delay,
            self.reconnect_max_delay,
            self.reconnect_reset,
        )
        .with_jitter()
    }

    /// Unacknowledged inbound messages that trigger an early acknowledgement
    fn ack_threshold(&self) -> u64 {
        u64::try_from(self.max_send_buffer / 2).unwrap_or(u64::MAX).max(1)
    }
}

impl Default for ConnectorOptions {
    fn default() -> Self {
        Self::from_config(&LinkConfig::default())
    }
}

enum Role {
    Acceptor,
    Initiator { dialer: Dialer, hello: HelloData },
}

struct Inner {
    state: ConnectorState,
    closing: bool,
    close_reason: Option<CloseReason>,
    session: Option<Session>,
    buffer: SendBuffer,
    last_received: u64,
    /// Highest received seq already reported to the peer
    acked_to_peer: u64,
    writer: Option<mpsc::UnboundedSender<Envelope>>,
    driver: Option<JoinHandle<()>>,
    /// Bumped whenever a socket is attached; frames and timers of older sockets are ignored
    generation: u64,
    counted: bool,
}

struct Shared {
    role: Role,
    options: ConnectorOptions,
    inner: Mutex<Inner>,
    events: mpsc::UnboundedSender<ConnectorEvent>,
    state: watch::Sender<ConnectorState>,
}

/// What the driver should do after a frame was processed
enum FrameAction {
    Continue,
    Reply(Envelope),
    HeartbeatAnswered,
    Stop,
}

/// Why a driver loop ended
enum DriverExit {
    Lost(ProtocolError),
    Violation(String),
    Released,
}

/// Handle to a connector; clones share the same session
#[derive(Clone)]
pub struct Connector {
    shared: Arc<Shared>,
}

impl Connector {
    /// Dial, perform `hello`/`ready` and start the session.
    ///
    /// The returned connector redials on its own after unexpected drops.
    #[instrument(skip(dialer, hello, options), fields(target = %dialer.target()))]
    pub async fn connect(
        dialer: Dialer,
        hello: HelloData,
        options: ConnectorOptions,
    ) -> Result<(Self, ConnectorEvents)> {
        let handshake_timeout = options.handshake_timeout;
        let (shared, events) = Shared::new(
            Role::Initiator {
                dialer: dialer.clone(),
                hello: hello.clone(),
            },
            options,
        );
        {
            let mut inner = shared.lock();
            shared.transition(&mut inner, ConnectorState::Connecting);
        }

        let attempt = with_timeout_error(
            async {
                let mut socket = dialer.dial().await?;
                let ready = client_hello(&mut socket, &hello, handshake_timeout).await?;
                Ok::<_, ProtocolError>((socket, ready))
            },
            handshake_timeout,
        )
        .await;

        match attempt {
            Ok((socket, ready)) => {
                info!(address = %ready.address, "Session established");
                shared.establish(socket, ready);
                Ok((Self { shared }, events))
            }
            Err(e) => {
                global_metrics().handshake_failed();
                let mut inner = shared.lock();
                shared.close_locked(&mut inner, CloseReason::HandshakeFailed(e.to_string()));
                Err(e)
            }
        }
    }

    /// Wrap a socket whose `hello` was already answered with `ready`
    pub fn accepted(
        socket: Socket,
        session: Session,
        options: ConnectorOptions,
    ) -> (Self, ConnectorEvents) {
        let (shared, events) = Shared::new(Role::Acceptor, options);
        {
            let mut inner = shared.lock();
            let heartbeat = session.heartbeat_interval;
            inner.session = Some(session);
            inner.counted = true;
            global_metrics().connection_established();
            shared.transition(&mut inner, ConnectorState::Connected);
            shared.attach(&mut inner, socket, heartbeat, Vec::new());
        }
        (Self { shared }, events)
    }

    /// Continue this session on `socket` after the peer presented `resume{last_seq}`.
    ///
    /// Queues `continue` followed by every buffered message above `last_seq`, and returns the
    /// number of replayed messages. The socket is handed back when the session cannot be
    /// resumed so the caller can answer `invalidate`.
    pub fn resume(&self, socket: Socket, last_seq: u64) -> std::result::Result<usize, Socket> {
        let shared = &self.shared;
        let mut inner = shared.lock();
        if !matches!(inner.state, ConnectorState::Connected | ConnectorState::Resuming)
            || inner.closing
        {
            return Err(socket);
        }
        let Some(session) = inner.session.clone() else {
            return Err(socket);
        };
        if last_seq > inner.buffer.last_seq() {
            warn!(
                address = %session.address,
                last_seq,
                sent = inner.buffer.last_seq(),
                "{}",
                constants::ERR_RESUME_AHEAD
            );
            shared.close_locked(
                &mut inner,
                CloseReason::ProtocolViolation(constants::ERR_RESUME_AHEAD.to_string()),
            );
            return Err(socket);
        }

        inner.buffer.acknowledge(last_seq);
        inner.acked_to_peer = inner.last_received;
        let heartbeat_ms = duration_ms(session.heartbeat_interval);
        let reply = match Envelope::continue_session(&ContinueData {
            last_seq: inner.last_received,
            heartbeat_interval: heartbeat_ms,
        }) {
            Ok(reply) => reply,
            Err(_) => return Err(socket),
        };
        let mut queued = Vec::with_capacity(inner.buffer.len() + 1);
        queued.push(reply);
        queued.extend(inner.buffer.replay_after(last_seq).cloned());
        let replayed = queued.len() - 1;

        let was_resuming = inner.state == ConnectorState::Resuming;
        shared.transition(&mut inner, ConnectorState::Connected);
        shared.attach(&mut inner, socket, session.heartbeat_interval, queued);
        if was_resuming {
            shared.emit(ConnectorEvent::Resumed);
        }
        global_metrics().session_resumed(replayed as u64);
        info!(address = %session.address, last_seq, replayed, "Session resumed");
        Ok(replayed)
    }

    /// Send session traffic; returns the assigned seq
    pub fn send(&self, kind: MessageKind, data: Value) -> Result<u64> {
        self.send_with(kind, move |_| Ok(data))
    }

    /// Send session traffic whose body depends on its own seq
    pub fn send_with<F>(&self, kind: MessageKind, build: F) -> Result<u64>
    where
        F: FnOnce(u64) -> Result<Value>,
    {
        let shared = &self.shared;
        let mut inner = shared.lock();
        match inner.state {
            ConnectorState::Connected | ConnectorState::Resuming => {}
            ConnectorState::Closed => return Err(ProtocolError::ConnectionClosed),
            ConnectorState::New | ConnectorState::Connecting => {
                return Err(ProtocolError::ConnectionLost)
            }
        }

        let envelope = match inner.buffer.push(kind, build) {
            Ok(envelope) => envelope,
            Err(ProtocolError::SendBufferOverflow(pending)) => {
                warn!(pending, "Send buffer overflow, closing session");
                shared.close_locked(&mut inner, CloseReason::BufferOverflow);
                return Err(ProtocolError::SendBufferOverflow(pending));
            }
            Err(e @ ProtocolError::FrameTooLarge { .. }) => {
                warn!(error = %e, kind = %kind, "Refusing oversized message");
                return Err(e);
            }
            Err(e) => return Err(e),
        };
        let seq = envelope.seq.unwrap_or_default();
        if let Some(writer) = &inner.writer {
            // A dead writer means the socket is gone; the buffer replays it on resume
            let _ = writer.send(envelope);
        }
        global_metrics().message_sent();
        trace!(seq, kind = %kind, "Queued session message");
        Ok(seq)
    }

    /// Expect no resume: the next socket drop closes the session
    pub fn set_closing(&self) {
        self.shared.lock().closing = true;
    }

    pub fn is_closing(&self) -> bool {
        self.shared.lock().closing
    }

    /// Close the session for good. Queued frames are still flushed to the socket.
    pub fn close(&self, reason: CloseReason) {
        let mut inner = self.shared.lock();
        self.shared.close_locked(&mut inner, reason);
    }

    /// Drop the current socket while keeping the session, forcing a resume
    pub fn drop_transport(&self) {
        let (generation, driver) = {
            let mut inner = self.shared.lock();
            (inner.generation, inner.driver.take())
        };
        if let Some(driver) = driver {
            driver.abort();
        }
        self.shared.socket_lost(generation);
    }

    pub fn state(&self) -> ConnectorState {
        *self.shared.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectorState> {
        self.shared.state.subscribe()
    }

    /// Resolves once the connector reached `Closed`
    pub async fn closed(&self) {
        let mut states = self.watch_state();
        // The sender lives in `self`, so the wait only ends on `Closed`
        let _ = states
            .wait_for(|state| *state == ConnectorState::Closed)
            .await;
    }

    /// Why the connector closed; `None` while it is still open
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.shared.lock().close_reason.clone()
    }

    pub fn session(&self) -> Option<Session> {
        self.shared.lock().session.clone()
    }

    pub fn address(&self) -> Option<Address> {
        self.shared.lock().session.as_ref().map(|s| s.address)
    }

    pub fn is_initiator(&self) -> bool {
        matches!(self.shared.role, Role::Initiator { .. })
    }

    /// Number of sent but unacknowledged messages
    pub fn unacknowledged(&self) -> usize {
        self.shared.lock().buffer.len()
    }

    pub fn last_received(&self) -> u64 {
        self.shared.lock().last_received
    }

    pub fn ptr_eq(&self, other: &Connector) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl fmt::Debug for Connector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.shared.lock();
        f.debug_struct("Connector")
            .field("state", &inner.state)
            .field("address", &inner.session.as_ref().map(|s| s.address))
            .field("unacknowledged", &inner.buffer.len())
            .finish()
    }
}

impl Shared {
    fn new(role: Role, options: ConnectorOptions) -> (Arc<Self>, ConnectorEvents) {
        let (events, receiver) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ConnectorState::New);
        let shared = Arc::new(Self {
            role,
            inner: Mutex::new(Inner {
                state: ConnectorState::New,
                closing: false,
                close_reason: None,
                session: None,
                buffer: SendBuffer::new(options.max_send_buffer)
                    .with_frame_limit(options.max_frame_size),
                last_received: 0,
                acked_to_peer: 0,
                writer: None,
                driver: None,
                generation: 0,
                counted: false,
            }),
            options,
            events,
            state,
        });
        (shared, receiver)
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: ConnectorEvent) {
        // Nobody listening is not an error for the connector itself
        let _ = self.events.send(event);
    }

    fn transition(&self, inner: &mut Inner, next: ConnectorState) -> bool {
        if !inner.state.can_transition_to(next) {
            warn!(from = %inner.state, to = %next, "Refusing illegal connector transition");
            return false;
        }
        inner.state = next;
        self.state.send_replace(next);
        true
    }

    /// Start a driver for `socket`, preloading its outgoing queue
    fn attach(
        self: &Arc<Self>,
        inner: &mut Inner,
        socket: Socket,
        heartbeat: Duration,
        preload: Vec<Envelope>,
    ) {
        inner.generation += 1;
        let (writer, outgoing) = mpsc::unbounded_channel();
        for envelope in preload {
            let _ = writer.send(envelope);
        }
        if let Some(previous) = inner.driver.take() {
            previous.abort();
        }
        inner.writer = Some(writer);
        inner.driver = Some(tokio::spawn(drive(
            Arc::clone(self),
            socket,
            inner.generation,
            outgoing,
            heartbeat,
        )));
    }

    /// Install a fresh session from `ready` (initiator side)
    fn establish(self: &Arc<Self>, socket: Socket, ready: ReadyData) {
        let mut inner = self.lock();
        let session = Session {
            token: ready.session_token.clone(),
            address: ready.address,
            heartbeat_interval: Duration::from_millis(ready.heartbeat_interval),
            timeout: Duration::from_millis(ready.session_timeout),
        };
        let heartbeat = session.heartbeat_interval;
        inner.session = Some(session);
        inner.last_received = 0;
        inner.acked_to_peer = 0;
        inner.buffer.reset();
        if !inner.counted {
            inner.counted = true;
            global_metrics().connection_established();
        }
        self.transition(&mut inner, ConnectorState::Connected);
        self.attach(&mut inner, socket, heartbeat, Vec::new());
        self.emit(ConnectorEvent::Connected(ready));
    }

    fn close_locked(&self, inner: &mut Inner, reason: CloseReason) {
        if inner.state == ConnectorState::Closed {
            return;
        }
        if !self.transition(inner, ConnectorState::Closed) {
            return;
        }
        // Dropping the writer lets the driver flush what is queued and release the socket
        inner.writer = None;
        inner.close_reason = Some(reason.clone());
        inner.driver = None;
        if inner.counted {
            global_metrics().connection_closed();
        }
        match &reason {
            CloseReason::Requested => debug!("Session closed"),
            other => info!(reason = %other, "Session closed"),
        }
        self.emit(ConnectorEvent::Closed(reason));
    }

    fn close_if_current(&self, generation: u64, reason: CloseReason) {
        let mut inner = self.lock();
        if inner.generation == generation {
            self.close_locked(&mut inner, reason);
        }
    }

    fn socket_lost(self: &Arc<Self>, generation: u64) {
        let mut inner = self.lock();
        if inner.generation != generation || inner.state != ConnectorState::Connected {
            return;
        }
        inner.writer = None;
        inner.driver = None;
        if inner.closing {
            self.close_locked(&mut inner, CloseReason::Requested);
            return;
        }
        let Some(timeout) = inner.session.as_ref().map(|s| s.timeout) else {
            self.close_locked(&mut inner, CloseReason::SessionExpired);
            return;
        };

        self.transition(&mut inner, ConnectorState::Resuming);
        self.emit(ConnectorEvent::Resuming);
        debug!(
            unacknowledged = inner.buffer.len(),
            "Socket lost, waiting for resume"
        );
        drop(inner);

        let deadline = Instant::now() + timeout;
        match self.role {
            Role::Acceptor => {
                let shared = Arc::clone(self);
                tokio::spawn(async move {
                    tokio::time::sleep_until(deadline).await;
                    shared.expire(generation);
                });
            }
            Role::Initiator { .. } => {
                tokio::spawn(Arc::clone(self).reconnect(generation, deadline));
            }
        }
    }

    /// Give up on a session that was not resumed in time
    fn expire(&self, generation: u64) {
        let mut inner = self.lock();
        if inner.generation != generation
            || !matches!(
                inner.state,
                ConnectorState::Resuming | ConnectorState::Connecting
            )
        {
            return;
        }
        global_metrics().session_expired();
        self.close_locked(&mut inner, CloseReason::SessionExpired);
    }

    fn is_waiting(&self, generation: u64) -> bool {
        let inner = self.lock();
        inner.generation == generation && inner.state == ConnectorState::Resuming
    }

    /// Initiator side: redial until resumed, invalidated or expired
    async fn reconnect(self: Arc<Self>, generation: u64, deadline: Instant) {
        let mut backoff = self.options.backoff();
        loop {
            if !self.is_waiting(generation) {
                return;
            }
            let now = Instant::now();
            if now >= deadline {
                self.expire(generation);
                return;
            }

            match tokio::time::timeout(deadline - now, self.try_resume(generation)).await {
                Ok(Ok(())) => return,
                Ok(Err(ProtocolError::SchemaViolation(detail)))
                | Ok(Err(ProtocolError::UnexpectedMessage(detail))) => {
                    global_metrics().protocol_error();
                    self.close_if_current(generation, CloseReason::ProtocolViolation(detail));
                    return;
                }
                Ok(Err(e)) => debug!(error = %e, "Resume attempt failed"),
                Err(_) => {
                    self.expire(generation);
                    return;
                }
            }

            let delay = backoff.delay();
            let wake = (Instant::now() + delay).min(deadline);
            trace!(delay_ms = delay.as_millis() as u64, "Waiting before next resume attempt");
            tokio::time::sleep_until(wake).await;
        }
    }

    async fn try_resume(self: &Arc<Self>, generation: u64) -> Result<()> {
        let Role::Initiator { dialer, hello } = &self.role else {
            return Err(ProtocolError::ConnectionLost);
        };
        let mut socket = dialer.dial().await?;
        let request = {
            let mut inner = self.lock();
            let token = inner
                .session
                .as_ref()
                .map(|s| s.token.clone())
                .ok_or(ProtocolError::SessionExpired)?;
            inner.acked_to_peer = inner.last_received;
            ResumeData {
                session_token: token,
                last_seq: inner.last_received,
            }
        };
        socket.send(Envelope::resume(&request)?).await?;

        let reply = socket.recv_timeout(self.options.handshake_timeout).await?;
        match reply.kind {
            MessageKind::Continue => {
                let body: ContinueData = reply.decode()?;
                self.continue_session(generation, socket, body)
            }
            MessageKind::Invalidate => {
                self.restart_session(generation, socket, hello).await;
                Ok(())
            }
            other => Err(ProtocolError::UnexpectedMessage(format!(
                "expected continue or invalidate, got {other}"
            ))),
        }
    }

    fn continue_session(
        self: &Arc<Self>,
        generation: u64,
        socket: Socket,
        body: ContinueData,
    ) -> Result<()> {
        let mut inner = self.lock();
        if inner.generation != generation || inner.state != ConnectorState::Resuming {
            return Err(ProtocolError::ConnectionClosed);
        }
        if body.last_seq > inner.buffer.last_seq() {
            global_metrics().protocol_error();
            self.close_locked(
                &mut inner,
                CloseReason::ProtocolViolation(constants::ERR_RESUME_AHEAD.to_string()),
            );
            return Err(ProtocolError::UnexpectedMessage(
                constants::ERR_RESUME_AHEAD.to_string(),
            ));
        }

        inner.buffer.acknowledge(body.last_seq);
        let replay: Vec<Envelope> = inner.buffer.replay_after(body.last_seq).cloned().collect();
        let replayed = replay.len();
        let heartbeat = Duration::from_millis(body.heartbeat_interval);
        if let Some(session) = inner.session.as_mut() {
            session.heartbeat_interval = heartbeat;
        }
        self.transition(&mut inner, ConnectorState::Connected);
        self.attach(&mut inner, socket, heartbeat, replay);
        self.emit(ConnectorEvent::Resumed);
        global_metrics().session_resumed(replayed as u64);
        info!(last_seq = body.last_seq, replayed, "Session resumed");
        Ok(())
    }

    /// The acceptor forgot the session: discard it and run `hello` again on the same socket
    async fn restart_session(self: &Arc<Self>, generation: u64, mut socket: Socket, hello: &HelloData) {
        {
            let mut inner = self.lock();
            if inner.generation != generation || inner.state != ConnectorState::Resuming {
                return;
            }
            warn!(
                lost = inner.buffer.len(),
                "Session invalidated by peer, unacknowledged messages are lost"
            );
            inner.buffer.reset();
            inner.last_received = 0;
            inner.acked_to_peer = 0;
            inner.session = None;
            self.transition(&mut inner, ConnectorState::Connecting);
            self.emit(ConnectorEvent::Invalidated);
            global_metrics().session_invalidated();
        }

        match client_hello(&mut socket, hello, self.options.handshake_timeout).await {
            Ok(ready) => {
                let still_current = {
                    let inner = self.lock();
                    inner.generation == generation && inner.state == ConnectorState::Connecting
                };
                if still_current {
                    info!(address = %ready.address, "Session re-established");
                    self.establish(socket, ready);
                }
            }
            Err(e) => {
                global_metrics().handshake_failed();
                self.close_if_current(generation, CloseReason::HandshakeFailed(e.to_string()));
            }
        }
    }

    /// Last received seq, recorded as reported to the peer
    fn take_ack(&self) -> u64 {
        let mut inner = self.lock();
        inner.acked_to_peer = inner.last_received;
        inner.last_received
    }

    fn on_frame(&self, generation: u64, envelope: Envelope) -> FrameAction {
        let mut inner = self.lock();
        if inner.generation != generation || inner.state != ConnectorState::Connected {
            return FrameAction::Stop;
        }

        if envelope.kind == MessageKind::Heartbeat {
            let body: HeartbeatData = match envelope.decode() {
                Ok(body) => body,
                Err(e) => return self.violation(&mut inner, e.to_string()),
            };
            if body.seq > inner.buffer.last_seq() {
                return self.violation(&mut inner, constants::ERR_RESUME_AHEAD.to_string());
            }
            inner.buffer.acknowledge(body.seq);
            return match self.role {
                Role::Acceptor => {
                    inner.acked_to_peer = inner.last_received;
                    FrameAction::Reply(Envelope::heartbeat(inner.last_received))
                }
                Role::Initiator { .. } => FrameAction::HeartbeatAnswered,
            };
        }

        if !envelope.kind.is_session_traffic() {
            return self.violation(
                &mut inner,
                format!("{} received on an established session", envelope.kind),
            );
        }
        let Some(seq) = envelope.seq else {
            return self.violation(&mut inner, format!("{} without seq", envelope.kind));
        };
        if seq <= inner.last_received {
            trace!(seq, "Ignoring duplicate message");
            return FrameAction::Continue;
        }
        let expected = inner.last_received + 1;
        if seq != expected {
            let gap = ProtocolError::SequenceGap {
                expected,
                received: seq,
            };
            return self.violation(&mut inner, gap.to_string());
        }

        inner.last_received = seq;
        global_metrics().message_received();
        self.emit(ConnectorEvent::Message(envelope));
        if seq - inner.acked_to_peer >= self.options.ack_threshold() {
            inner.acked_to_peer = seq;
            trace!(seq, "Acknowledging early");
            return FrameAction::Reply(Envelope::heartbeat(seq));
        }
        FrameAction::Continue
    }

    fn violation(&self, inner: &mut Inner, detail: String) -> FrameAction {
        warn!(detail = %detail, "Protocol violation, closing session");
        global_metrics().protocol_error();
        self.close_locked(inner, CloseReason::ProtocolViolation(detail));
        FrameAction::Stop
    }
}

/// Initiator side of `hello`/`ready`
pub(crate) async fn client_hello(
    socket: &mut Socket,
    hello: &HelloData,
    limit: Duration,
) -> Result<ReadyData> {
    global_metrics().handshake_attempt();
    socket.send(Envelope::hello(hello)?).await?;
    let reply = socket.recv_timeout(limit).await?;
    let ready = reply.expect::<ReadyData>(MessageKind::Ready)?;
    global_metrics().handshake_success();
    Ok(ready)
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Pump one socket until it is lost, released or breaks the protocol
async fn drive(
    shared: Arc<Shared>,
    socket: Socket,
    generation: u64,
    outgoing: mpsc::UnboundedReceiver<Envelope>,
    heartbeat: Duration,
) {
    let (sink, stream) = socket.into_parts();
    let (control, control_rx) = mpsc::unbounded_channel();
    let reader = read_frames(&shared, stream, generation, control, heartbeat);
    let writer = write_frames(sink, outgoing, control_rx);
    tokio::pin!(reader, writer);

    let (exit, writer_running) = tokio::select! {
        exit = &mut reader => (exit, true),
        exit = &mut writer => (exit, false),
    };
    if writer_running && matches!(exit, DriverExit::Released) {
        // Frames queued before the session let go of this socket still go out
        let _ = tokio::time::timeout(shared.options.handshake_timeout, &mut writer).await;
    }

    match exit {
        DriverExit::Lost(e) => {
            debug!(error = %e, generation, "Socket lost");
            shared.socket_lost(generation);
        }
        DriverExit::Violation(detail) => {
            warn!(detail = %detail, "Malformed frame, closing session");
            global_metrics().protocol_error();
            shared.close_if_current(generation, CloseReason::ProtocolViolation(detail));
        }
        DriverExit::Released => trace!(generation, "Driver released socket"),
    }
}

/// Inbound frames and heartbeat timing; replies go to the writer through `control`
async fn read_frames(
    shared: &Shared,
    mut stream: FrameStream,
    generation: u64,
    control: mpsc::UnboundedSender<Envelope>,
    heartbeat: Duration,
) -> DriverExit {
    let heartbeat = heartbeat.max(Duration::from_millis(1));
    let mut ticker = tokio::time::interval_at(Instant::now() + heartbeat, heartbeat);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let initiator = matches!(shared.role, Role::Initiator { .. });
    let mut awaiting_answer = false;
    let mut last_heard = Instant::now();

    loop {
        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(envelope)) => {
                    last_heard = Instant::now();
                    match shared.on_frame(generation, envelope) {
                        FrameAction::Continue => {}
                        FrameAction::HeartbeatAnswered => awaiting_answer = false,
                        FrameAction::Reply(reply) => {
                            // A closed writer ends the driver on its own
                            let _ = control.send(reply);
                        }
                        FrameAction::Stop => return DriverExit::Released,
                    }
                }
                Some(Err(ProtocolError::SchemaViolation(detail))) => {
                    return DriverExit::Violation(detail);
                }
                Some(Err(e)) => return DriverExit::Lost(e),
                None => return DriverExit::Lost(ProtocolError::ConnectionClosed),
            },
            _ = ticker.tick() => {
                if initiator {
                    if awaiting_answer {
                        return DriverExit::Lost(ProtocolError::Timeout);
                    }
                    awaiting_answer = true;
                    let _ = control.send(Envelope::heartbeat(shared.take_ack()));
                } else if last_heard.elapsed() >= heartbeat * 2 {
                    return DriverExit::Lost(ProtocolError::Timeout);
                }
            }
        }
    }
}

/// Outgoing frames: heartbeat traffic from the reader first, then queued session traffic.
///
/// Ends with `Released` once the session dropped its queue and everything was flushed.
async fn write_frames(
    mut sink: FrameSink,
    mut outgoing: mpsc::UnboundedReceiver<Envelope>,
    mut control: mpsc::UnboundedReceiver<Envelope>,
) -> DriverExit {
    loop {
        let envelope = tokio::select! {
            biased;
            Some(envelope) = control.recv() => envelope,
            queued = outgoing.recv() => match queued {
                Some(envelope) => envelope,
                None => {
                    let _ = sink.close().await;
                    return DriverExit::Released;
                }
            },
        };
        match sink.send(envelope).await {
            Ok(()) => {}
            Err(e @ ProtocolError::FrameTooLarge { .. }) => {
                return DriverExit::Violation(e.to_string());
            }
            Err(e) => return DriverExit::Lost(e),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::{MAX_FRAME_SIZE, PROTOCOL_VERSION};
    use crate::core::message::Registration;
    use crate::transport::socket::memory_pair;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn session(heartbeat: Duration, timeout: Duration) -> Session {
        Session {
            token: "token-1".to_string(),
            address: Address::host(1),
            heartbeat_interval: heartbeat,
            timeout,
        }
    }

    fn options() -> ConnectorOptions {
        ConnectorOptions {
            max_send_buffer: 64,
            max_frame_size: MAX_FRAME_SIZE,
            handshake_timeout: Duration::from_secs(5),
            reconnect_base_delay: Duration::from_millis(100),
            reconnect_max_delay: Duration::from_secs(1),
            reconnect_reset: Duration::from_secs(5),
        }
    }

    fn hello() -> HelloData {
        HelloData {
            version: PROTOCOL_VERSION.to_string(),
            plugins: BTreeMap::new(),
            registration: Registration::Host { id: 1 },
            token: None,
        }
    }

    fn event(seq: u64, n: u64) -> Envelope {
        Envelope {
            seq: Some(seq),
            kind: MessageKind::Event,
            data: json!({ "n": n }),
        }
    }

    async fn next_message(events: &mut ConnectorEvents) -> Envelope {
        loop {
            match events.recv().await.expect("event stream ended") {
                ConnectorEvent::Message(envelope) => return envelope,
                ConnectorEvent::Closed(reason) => panic!("closed: {reason}"),
                _ => {}
            }
        }
    }

    async fn next_closed(events: &mut ConnectorEvents) -> CloseReason {
        loop {
            if let ConnectorEvent::Closed(reason) = events.recv().await.expect("event stream ended")
            {
                return reason;
            }
        }
    }

    /// Answer `hello` on the first dialed socket and wrap it as the accepted side
    async fn accept_hello(
        incoming: &mut mpsc::UnboundedReceiver<Socket>,
        session: Session,
    ) -> (Connector, ConnectorEvents) {
        let mut socket = incoming.recv().await.unwrap();
        let first = socket.recv().await.unwrap().unwrap();
        assert_eq!(first.kind, MessageKind::Hello);
        let ready = ReadyData {
            address: session.address,
            session_token: session.token.clone(),
            session_timeout: duration_ms(session.timeout),
            heartbeat_interval: duration_ms(session.heartbeat_interval),
        };
        socket.send(Envelope::ready(&ready).unwrap()).await.unwrap();
        Connector::accepted(socket, session, options())
    }

    #[tokio::test]
    async fn test_delivery_in_send_order() {
        let (server_side, mut client_side) = memory_pair(MAX_FRAME_SIZE);
        let (connector, mut events) = Connector::accepted(
            server_side,
            session(Duration::from_secs(10), Duration::from_secs(30)),
            options(),
        );

        for n in 0..5 {
            connector.send(MessageKind::Event, json!({ "n": n })).unwrap();
        }
        for expected in 1..=5u64 {
            let envelope = client_side.recv().await.unwrap().unwrap();
            assert_eq!(envelope.seq, Some(expected));
            assert_eq!(envelope.data["n"], expected - 1);
        }

        client_side.send(event(1, 10)).await.unwrap();
        client_side.send(event(2, 11)).await.unwrap();
        assert_eq!(next_message(&mut events).await.data["n"], 10);
        assert_eq!(next_message(&mut events).await.data["n"], 11);
    }

    #[tokio::test]
    async fn test_duplicates_are_ignored() {
        let (server_side, mut client_side) = memory_pair(MAX_FRAME_SIZE);
        let (connector, mut events) = Connector::accepted(
            server_side,
            session(Duration::from_secs(10), Duration::from_secs(30)),
            options(),
        );

        client_side.send(event(1, 1)).await.unwrap();
        client_side.send(event(1, 1)).await.unwrap();
        client_side.send(event(2, 2)).await.unwrap();
        assert_eq!(next_message(&mut events).await.seq, Some(1));
        assert_eq!(next_message(&mut events).await.seq, Some(2));
        assert_eq!(connector.last_received(), 2);
    }

    #[tokio::test]
    async fn test_sequence_gap_is_fatal() {
        let (server_side, mut client_side) = memory_pair(MAX_FRAME_SIZE);
        let (connector, mut events) = Connector::accepted(
            server_side,
            session(Duration::from_secs(10), Duration::from_secs(30)),
            options(),
        );

        client_side.send(event(2, 2)).await.unwrap();
        let reason = next_closed(&mut events).await;
        assert!(matches!(reason, CloseReason::ProtocolViolation(_)));
        assert_eq!(connector.state(), ConnectorState::Closed);
    }

    #[tokio::test]
    async fn test_handshake_message_on_session_is_fatal() {
        let (server_side, mut client_side) = memory_pair(MAX_FRAME_SIZE);
        let (_connector, mut events) = Connector::accepted(
            server_side,
            session(Duration::from_secs(10), Duration::from_secs(30)),
            options(),
        );

        client_side.send(Envelope::hello(&hello()).unwrap()).await.unwrap();
        assert!(matches!(
            next_closed(&mut events).await,
            CloseReason::ProtocolViolation(_)
        ));
    }

    #[tokio::test]
    async fn test_heartbeat_acknowledges_and_is_answered() {
        let (server_side, mut client_side) = memory_pair(MAX_FRAME_SIZE);
        let (connector, _events) = Connector::accepted(
            server_side,
            session(Duration::from_secs(10), Duration::from_secs(30)),
            options(),
        );
        for n in 0..3 {
            connector.send(MessageKind::Event, json!({ "n": n })).unwrap();
        }
        for _ in 0..3 {
            client_side.recv().await.unwrap().unwrap();
        }
        assert_eq!(connector.unacknowledged(), 3);

        client_side.send(Envelope::heartbeat(2)).await.unwrap();
        let answer = client_side.recv().await.unwrap().unwrap();
        assert_eq!(answer.kind, MessageKind::Heartbeat);
        assert_eq!(answer.data["seq"], 0);
        assert_eq!(connector.unacknowledged(), 1);
    }

    #[tokio::test]
    async fn test_buffer_overflow_closes_session() {
        let (server_side, _client_side) = memory_pair(MAX_FRAME_SIZE);
        let (connector, mut events) = Connector::accepted(
            server_side,
            session(Duration::from_secs(10), Duration::from_secs(30)),
            ConnectorOptions {
                max_send_buffer: 2,
                ..options()
            },
        );

        connector.send(MessageKind::Event, json!({})).unwrap();
        connector.send(MessageKind::Event, json!({})).unwrap();
        let result = connector.send(MessageKind::Event, json!({}));
        assert!(matches!(result, Err(ProtocolError::SendBufferOverflow(2))));
        assert_eq!(next_closed(&mut events).await, CloseReason::BufferOverflow);
        assert!(matches!(
            connector.send(MessageKind::Event, json!({})),
            Err(ProtocolError::ConnectionClosed)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acceptor_expires_without_resume() {
        let (server_side, client_side) = memory_pair(MAX_FRAME_SIZE);
        let (connector, mut events) = Connector::accepted(
            server_side,
            session(Duration::from_secs(10), Duration::from_secs(30)),
            options(),
        );
        drop(client_side);

        assert!(matches!(events.recv().await, Some(ConnectorEvent::Resuming)));
        let started = Instant::now();
        assert_eq!(next_closed(&mut events).await, CloseReason::SessionExpired);
        assert!(started.elapsed() >= Duration::from_secs(29));
        assert_eq!(connector.state(), ConnectorState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acceptor_detects_silent_peer() {
        let (server_side, _client_side) = memory_pair(MAX_FRAME_SIZE);
        let (_connector, mut events) = Connector::accepted(
            server_side,
            session(Duration::from_secs(1), Duration::from_secs(30)),
            options(),
        );
        assert!(matches!(events.recv().await, Some(ConnectorEvent::Resuming)));
    }

    #[tokio::test]
    async fn test_closing_turns_drop_into_close() {
        let (server_side, client_side) = memory_pair(MAX_FRAME_SIZE);
        let (connector, mut events) = Connector::accepted(
            server_side,
            session(Duration::from_secs(10), Duration::from_secs(30)),
            options(),
        );
        connector.set_closing();
        drop(client_side);
        assert_eq!(next_closed(&mut events).await, CloseReason::Requested);
    }

    #[tokio::test]
    async fn test_acceptor_resume_replays_unacknowledged() {
        let (server_side, mut client_side) = memory_pair(MAX_FRAME_SIZE);
        let (connector, _events) = Connector::accepted(
            server_side,
            session(Duration::from_secs(10), Duration::from_secs(30)),
            options(),
        );
        for n in 0..4 {
            connector.send(MessageKind::Event, json!({ "n": n })).unwrap();
        }
        for _ in 0..4 {
            client_side.recv().await.unwrap().unwrap();
        }

        let (server_side, mut client_side) = memory_pair(MAX_FRAME_SIZE);
        let replayed = connector.resume(server_side, 2).ok().unwrap();
        assert_eq!(replayed, 2);

        let reply = client_side.recv().await.unwrap().unwrap();
        assert_eq!(reply.kind, MessageKind::Continue);
        let seqs: Vec<_> = [
            client_side.recv().await.unwrap().unwrap(),
            client_side.recv().await.unwrap().unwrap(),
        ]
        .iter()
        .map(|e| e.seq)
        .collect();
        assert_eq!(seqs, vec![Some(3), Some(4)]);
        assert_eq!(connector.unacknowledged(), 2);
    }

    #[tokio::test]
    async fn test_resume_ahead_of_sent_is_refused() {
        let (server_side, _client_side) = memory_pair(MAX_FRAME_SIZE);
        let (connector, _events) = Connector::accepted(
            server_side,
            session(Duration::from_secs(10), Duration::from_secs(30)),
            options(),
        );
        let (server_side, _client_side) = memory_pair(MAX_FRAME_SIZE);
        assert!(connector.resume(server_side, 7).is_err());
        assert_eq!(connector.state(), ConnectorState::Closed);
    }

    #[tokio::test]
    async fn test_initiator_resumes_in_order() {
        let (tx, mut incoming) = mpsc::unbounded_channel();
        let dialer = Dialer::memory(tx, MAX_FRAME_SIZE);
        let accept = tokio::spawn(async move {
            let accepted = accept_hello(
                &mut incoming,
                session(Duration::from_secs(10), Duration::from_secs(30)),
            )
            .await;
            (accepted, incoming)
        });
        let (client, mut client_events) = Connector::connect(dialer, hello(), options())
            .await
            .unwrap();
        let ((server, mut server_events), mut incoming) = accept.await.unwrap();
        assert!(matches!(
            client_events.recv().await,
            Some(ConnectorEvent::Connected(_))
        ));

        for n in 1..=3 {
            client.send(MessageKind::Event, json!({ "n": n })).unwrap();
        }
        for n in 1..=3u64 {
            assert_eq!(next_message(&mut server_events).await.data["n"], n);
        }

        client.drop_transport();
        assert!(matches!(
            client_events.recv().await,
            Some(ConnectorEvent::Resuming)
        ));
        for n in 4..=5 {
            client.send(MessageKind::Event, json!({ "n": n })).unwrap();
        }

        let mut socket = incoming.recv().await.unwrap();
        let resume: ResumeData = socket
            .recv()
            .await
            .unwrap()
            .unwrap()
            .expect(MessageKind::Resume)
            .unwrap();
        assert_eq!(resume.session_token, "token-1");
        server.resume(socket, resume.last_seq).ok().unwrap();

        assert!(matches!(
            client_events.recv().await,
            Some(ConnectorEvent::Resumed)
        ));
        for n in 4..=5u64 {
            assert_eq!(next_message(&mut server_events).await.data["n"], n);
        }
        assert_eq!(server.last_received(), 5);
        assert_eq!(client.state(), ConnectorState::Connected);
    }

    #[tokio::test]
    async fn test_initiator_restarts_after_invalidate() {
        let (tx, mut incoming) = mpsc::unbounded_channel();
        let dialer = Dialer::memory(tx, MAX_FRAME_SIZE);
        let accept = tokio::spawn(async move {
            let accepted = accept_hello(
                &mut incoming,
                session(Duration::from_secs(10), Duration::from_secs(30)),
            )
            .await;
            (accepted, incoming)
        });
        let (client, mut client_events) = Connector::connect(dialer, hello(), options())
            .await
            .unwrap();
        let (_first, mut incoming) = accept.await.unwrap();
        client.send(MessageKind::Event, json!({})).unwrap();

        client.drop_transport();
        let mut socket = incoming.recv().await.unwrap();
        let first = socket.recv().await.unwrap().unwrap();
        assert_eq!(first.kind, MessageKind::Resume);
        socket.send(Envelope::invalidate()).await.unwrap();

        let second = socket.recv().await.unwrap().unwrap();
        assert_eq!(second.kind, MessageKind::Hello);
        let ready = ReadyData {
            address: Address::host(1),
            session_token: "token-2".to_string(),
            session_timeout: 30_000,
            heartbeat_interval: 10_000,
        };
        socket.send(Envelope::ready(&ready).unwrap()).await.unwrap();

        let mut seen = Vec::new();
        while seen.len() < 4 {
            match client_events.recv().await.unwrap() {
                ConnectorEvent::Connected(_) => seen.push("connected"),
                ConnectorEvent::Resuming => seen.push("resuming"),
                ConnectorEvent::Invalidated => seen.push("invalidated"),
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert_eq!(seen, vec!["connected", "resuming", "invalidated", "connected"]);
        assert_eq!(client.session().unwrap().token, "token-2");
        assert_eq!(client.unacknowledged(), 0);
    }

    #[tokio::test]
    async fn test_connect_fails_when_peer_hangs_up() {
        let (tx, mut incoming) = mpsc::unbounded_channel::<Socket>();
        let dialer = Dialer::memory(tx, MAX_FRAME_SIZE);
        tokio::spawn(async move {
            let socket = incoming.recv().await.unwrap();
            drop(socket);
        });
        let result = Connector::connect(dialer, hello(), options()).await;
        assert!(result.is_err());
    }

    async fn receive_all(mut events: ConnectorEvents, count: u64) {
        for expected in 0..count {
            assert_eq!(next_message(&mut events).await.data["n"], expected);
        }
    }

    #[tokio::test]
    async fn test_two_way_load_keeps_flowing() {
        let (left, right) = memory_pair(MAX_FRAME_SIZE);
        let roomy = ConnectorOptions {
            max_send_buffer: 4096,
            ..options()
        };
        let quiet = session(Duration::from_secs(10), Duration::from_secs(30));
        let (a, a_events) = Connector::accepted(left, quiet.clone(), roomy.clone());
        let (b, b_events) = Connector::accepted(right, quiet, roomy);

        let blob = "x".repeat(1024);
        for n in 0..2000u64 {
            a.send(MessageKind::Event, json!({ "n": n, "blob": blob })).unwrap();
            b.send(MessageKind::Event, json!({ "n": n, "blob": blob })).unwrap();
        }

        tokio::time::timeout(Duration::from_secs(10), async {
            tokio::join!(receive_all(a_events, 2000), receive_all(b_events, 2000))
        })
        .await
        .expect("traffic stalled with both sides writing");
        assert_eq!(a.state(), ConnectorState::Connected);
        assert_eq!(b.state(), ConnectorState::Connected);
    }

    #[tokio::test]
    async fn test_oversized_inbound_frame_closes_session() {
        use tokio::io::AsyncWriteExt;

        let (left, mut raw) = tokio::io::duplex(4096);
        let (connector, mut events) = Connector::accepted(
            Socket::new(left, 64),
            session(Duration::from_secs(10), Duration::from_secs(30)),
            ConnectorOptions {
                max_frame_size: 64,
                ..options()
            },
        );

        let mut frame = 1024u32.to_be_bytes().to_vec();
        frame.extend_from_slice(&[b' '; 32]);
        raw.write_all(&frame).await.unwrap();

        match events.recv().await {
            Some(ConnectorEvent::Closed(CloseReason::ProtocolViolation(_))) => {}
            other => panic!("expected a protocol violation, got {other:?}"),
        }
        assert!(matches!(
            connector.close_reason(),
            Some(CloseReason::ProtocolViolation(_))
        ));
    }

    #[tokio::test]
    async fn test_oversized_send_refused_and_session_kept() {
        let (server_side, mut client_side) = memory_pair(MAX_FRAME_SIZE);
        let (connector, _events) = Connector::accepted(
            server_side,
            session(Duration::from_secs(10), Duration::from_secs(30)),
            ConnectorOptions {
                max_frame_size: 256,
                ..options()
            },
        );

        let result = connector.send(MessageKind::Event, json!({ "blob": "x".repeat(512) }));
        assert!(
            matches!(result, Err(ProtocolError::FrameTooLarge { limit: 256, .. })),
            "{result:?}"
        );
        assert_eq!(connector.unacknowledged(), 0);
        assert_eq!(connector.state(), ConnectorState::Connected);

        assert_eq!(connector.send(MessageKind::Event, json!({ "n": 1 })).unwrap(), 1);
        let delivered = client_side.recv().await.unwrap().unwrap();
        assert_eq!(delivered.seq, Some(1));
    }

    #[tokio::test]
    async fn test_busy_peer_acknowledges_before_buffer_fills() {
        let (tx, mut incoming) = mpsc::unbounded_channel();
        let dialer = Dialer::memory(tx, MAX_FRAME_SIZE);
        let accept = tokio::spawn(async move {
            accept_hello(
                &mut incoming,
                session(Duration::from_secs(10), Duration::from_secs(30)),
            )
            .await
        });
        let (_client, mut client_events) = Connector::connect(dialer, hello(), options())
            .await
            .unwrap();
        let (server, _server_events) = accept.await.unwrap();

        // Well past the 64 message buffer, with no heartbeat tick in between
        for n in 0..150u64 {
            server.send(MessageKind::Event, json!({ "n": n })).unwrap();
            assert_eq!(next_message(&mut client_events).await.data["n"], n);
        }
        assert_eq!(server.state(), ConnectorState::Connected);
        assert!(server.unacknowledged() < 64);
    }
}
