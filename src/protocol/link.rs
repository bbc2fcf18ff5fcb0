//! # Link
//!
//! Typed request/response/event endpoint over one [`Connector`], used on both the initiating
//! and the accepting side.
//!
//! ## Outgoing
//! - [`Link::send_event`] writes an event; delivery is only guaranteed as far as the transport
//! - [`Link::request`] numbers the request, registers it as pending and waits for the matching
//!   `response`/`responseError`, a permanent disconnect or the request timeout
//!
//! Requests are correlated by the seq the connector assigned them, carried as `request_id` in
//! the application body so the answer still matches after being relayed by other nodes.
//!
//! ## Incoming
//! Each message is decoded, its source checked against what the peer may relay, its class
//! looked up, and its address pair checked against the class. Messages for other addresses go
//! to the [`Forwarder`]. Requests run their handler in a task of their own and are answered
//! with its result; events are handled in arrival order, so an event handler must not wait
//! for a request on the link it was invoked from.
//!
//! Requests from control connections are checked against the class permission before they
//! are handled or forwarded.
//!
//! Malformed bodies, implausible sources and illegal address pairs close the connection.
//! Unknown classes, failed payload validation and handler errors answer requests with
//! `responseError` and drop events.

use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use crate::core::address::{Address, AddressKind};
use crate::core::message::{ApplicationData, Envelope, ErrorData, MessageKind};
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::dispatcher::{Dispatcher, MessageContext};
use crate::protocol::registry::{
    ClassKind, Event, MessageClass, MessageRegistry, PrepareDisconnect, Request,
};
use crate::protocol::router::Forwarder;
use crate::transport::connector::{Connector, ConnectorEvent, ConnectorEvents};
use crate::transport::session::CloseReason;
use crate::utils::metrics::global_metrics;
use crate::utils::timeout::REQUEST_TIMEOUT;

type PendingMap = HashMap<u64, oneshot::Sender<Result<Value>>>;

/// External decision whether a control connection holds a permission
pub trait PermissionCheck: Send + Sync + 'static {
    fn check(&self, src: &Address, permission: &str) -> bool;
}

impl<F> PermissionCheck for F
where
    F: Fn(&Address, &str) -> bool + Send + Sync + 'static,
{
    fn check(&self, src: &Address, permission: &str) -> bool {
        self(src, permission)
    }
}

struct LinkInner {
    connector: Connector,
    local: RwLock<Address>,
    peer: Address,
    registry: Arc<MessageRegistry>,
    dispatcher: Arc<Dispatcher>,
    forwarder: Option<Weak<dyn Forwarder>>,
    permissions: Option<Arc<dyn PermissionCheck>>,
    pending: Mutex<PendingMap>,
    request_timeout: Duration,
}

/// Handle to a protocol endpoint; clones share the same link
#[derive(Clone)]
pub struct Link {
    inner: Arc<LinkInner>,
}

/// Configures a [`Link`] before its event loop starts
pub struct LinkBuilder {
    connector: Connector,
    local: Address,
    peer: Address,
    registry: Arc<MessageRegistry>,
    dispatcher: Arc<Dispatcher>,
    forwarder: Option<Weak<dyn Forwarder>>,
    permissions: Option<Arc<dyn PermissionCheck>>,
    request_timeout: Duration,
}

/// Forgets a pending request once its caller stops waiting for it
struct PendingEntry<'a> {
    link: &'a Link,
    seq: u64,
}

impl Drop for PendingEntry<'_> {
    fn drop(&mut self) {
        self.link.pending().remove(&self.seq);
    }
}

impl LinkBuilder {
    pub fn registry(mut self, registry: Arc<MessageRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn dispatcher(mut self, dispatcher: Arc<Dispatcher>) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    /// Where messages for other addresses go
    pub fn forwarder(mut self, forwarder: Weak<dyn Forwarder>) -> Self {
        self.forwarder = Some(forwarder);
        self
    }

    pub fn permissions(mut self, permissions: Arc<dyn PermissionCheck>) -> Self {
        self.permissions = Some(permissions);
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Spawn the event loop consuming `events` and hand out the link
    pub fn start(self, events: ConnectorEvents) -> Link {
        let link = Link {
            inner: Arc::new(LinkInner {
                connector: self.connector,
                local: RwLock::new(self.local),
                peer: self.peer,
                registry: self.registry,
                dispatcher: self.dispatcher,
                forwarder: self.forwarder,
                permissions: self.permissions,
                pending: Mutex::new(HashMap::new()),
                request_timeout: self.request_timeout,
            }),
        };
        tokio::spawn(link.clone().run(events));
        link
    }
}

impl Link {
    pub fn builder(connector: Connector, local: Address, peer: Address) -> LinkBuilder {
        LinkBuilder {
            connector,
            local,
            peer,
            registry: Arc::new(MessageRegistry::new()),
            dispatcher: Arc::new(Dispatcher::new()),
            forwarder: None,
            permissions: None,
            request_timeout: REQUEST_TIMEOUT,
        }
    }

    /// Address of this side of the link
    pub fn local(&self) -> Address {
        *self
            .inner
            .local
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Address of the directly connected participant
    pub fn peer(&self) -> Address {
        self.inner.peer
    }

    pub fn connector(&self) -> &Connector {
        &self.inner.connector
    }

    pub fn registry(&self) -> &MessageRegistry {
        &self.inner.registry
    }

    /// Number of requests waiting for an answer
    pub fn pending_requests(&self) -> usize {
        self.pending().len()
    }

    pub fn ptr_eq(&self, other: &Link) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Resolves once the underlying connector closed for good
    pub async fn closed(&self) {
        self.inner.connector.closed().await
    }

    /// Send a request of class `T` and wait for its response
    pub async fn request<T: Request>(&self, dst: Address, request: &T) -> Result<T::Response> {
        let class = MessageClass::request::<T>();
        let local = self.local();
        if !class.allows(MessageKind::Request, &local, &dst) {
            return Err(ProtocolError::IllegalAddressPair {
                name: T::NAME.to_string(),
                src: local,
                dst,
            });
        }
        request.validate()?;

        let data = serde_json::to_value(request)?;
        let response = self.request_raw(T::NAME, dst, data).await?;
        serde_json::from_value(response).map_err(|e| {
            ProtocolError::SchemaViolation(format!("{} response: {e}", T::NAME))
        })
    }

    /// Send a request by class name with an untyped payload
    pub async fn request_raw(&self, name: &str, dst: Address, data: Value) -> Result<Value> {
        let src = self.local();
        let (tx, rx) = oneshot::channel();
        global_metrics().request_started();

        let seq = {
            // Held across the send so the answer cannot overtake the registration
            let mut pending = self.pending();
            let sent = self.inner.connector.send_with(MessageKind::Request, |seq| {
                Ok(serde_json::to_value(ApplicationData {
                    src,
                    dst,
                    name: name.to_string(),
                    request_id: Some(seq),
                    data,
                })?)
            });
            let seq = match sent {
                Ok(seq) => seq,
                Err(e) => {
                    global_metrics().request_failed();
                    return Err(e);
                }
            };
            pending.insert(seq, tx);
            seq
        };
        trace!(seq, name, dst = %dst, "Request sent");
        let _registered = PendingEntry { link: self, seq };

        let outcome = match tokio::time::timeout(self.inner.request_timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(ProtocolError::ConnectionLost),
            Err(_) => {
                debug!(seq, name, "Request timed out");
                Err(ProtocolError::Timeout)
            }
        };
        if outcome.is_err() {
            global_metrics().request_failed();
        }
        outcome
    }

    /// Send an event of class `T`
    pub fn send_event<T: Event>(&self, dst: Address, event: &T) -> Result<()> {
        let class = MessageClass::event::<T>();
        let local = self.local();
        if !class.allows(MessageKind::Event, &local, &dst) {
            return Err(ProtocolError::IllegalAddressPair {
                name: T::NAME.to_string(),
                src: local,
                dst,
            });
        }
        event.validate()?;

        let body = ApplicationData {
            src: local,
            dst,
            name: T::NAME.to_string(),
            request_id: None,
            data: serde_json::to_value(event)?,
        };
        self.inner
            .connector
            .send(MessageKind::Event, serde_json::to_value(body)?)?;
        Ok(())
    }

    /// Relay a message on behalf of another participant, unchanged
    pub fn forward_message(&self, kind: MessageKind, message: &ApplicationData) -> Result<u64> {
        self.inner
            .connector
            .send(kind, serde_json::to_value(message)?)
    }

    /// Answer `request` with a `responseError` carrying `error` as its message
    pub fn reply_error(&self, request: &ApplicationData, error: impl fmt::Display) -> Result<u64> {
        self.send_reply(MessageKind::ResponseError, &request.reply_error(error))
    }

    /// Tell the peer not to expect a resume, then close
    pub async fn disconnect(&self) -> Result<()> {
        let outcome = self.request(self.peer(), &PrepareDisconnect {}).await;
        self.inner.connector.set_closing();
        self.inner.connector.close(CloseReason::Requested);
        outcome
    }

    fn send_reply(&self, kind: MessageKind, body: &ApplicationData) -> Result<u64> {
        self.inner.connector.send(kind, serde_json::to_value(body)?)
    }

    fn pending(&self) -> MutexGuard<'_, PendingMap> {
        self.inner
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn reject_pending(&self, error: fn() -> ProtocolError) {
        let drained: Vec<_> = self.pending().drain().collect();
        if !drained.is_empty() {
            debug!(count = drained.len(), error = %error(), "Rejecting pending requests");
        }
        for (_, sender) in drained {
            let _ = sender.send(Err(error()));
        }
    }

    async fn run(self, mut events: ConnectorEvents) {
        while let Some(event) = events.recv().await {
            match event {
                ConnectorEvent::Message(envelope) => self.handle_message(envelope).await,
                ConnectorEvent::Connected(ready) => {
                    *self
                        .inner
                        .local
                        .write()
                        .unwrap_or_else(PoisonError::into_inner) = ready.address;
                    debug!(local = %ready.address, peer = %self.peer(), "Link connected");
                }
                ConnectorEvent::Resuming => {
                    debug!(peer = %self.peer(), pending = self.pending_requests(), "Link resuming")
                }
                ConnectorEvent::Resumed => debug!(peer = %self.peer(), "Link resumed"),
                ConnectorEvent::Invalidated => {
                    self.reject_pending(|| ProtocolError::SessionInvalidated)
                }
                ConnectorEvent::Closed(reason) => {
                    debug!(peer = %self.peer(), reason = %reason, "Link closed");
                    break;
                }
            }
        }
        self.reject_pending(|| ProtocolError::ConnectionLost);
    }

    async fn handle_message(&self, envelope: Envelope) {
        let kind = envelope.kind;
        let message: ApplicationData = match envelope.decode() {
            Ok(message) => message,
            Err(e) => return self.fatal(e.to_string()),
        };

        if matches!(kind, MessageKind::Request | MessageKind::Event)
            && !self.source_plausible(&message.src)
        {
            return self.fatal(format!(
                "{}: {} via {}",
                constants::ERR_SOURCE_MISMATCH,
                message.src,
                self.peer()
            ));
        }

        let Some(class) = self.inner.registry.get(&message.name).cloned() else {
            warn!(name = %message.name, kind = %kind, src = %message.src, "Unknown message class");
            if kind == MessageKind::Request {
                self.answer_error(&message, ProtocolError::UnknownMessage(message.name.clone()));
            }
            return;
        };

        if !class.allows(kind, &message.src, &message.dst) {
            return self.fatal(
                ProtocolError::IllegalAddressPair {
                    name: message.name.clone(),
                    src: message.src,
                    dst: message.dst,
                }
                .to_string(),
            );
        }

        if kind.is_session_traffic() && kind != MessageKind::Event && message.request_id.is_none() {
            return self.fatal(constants::ERR_MISSING_REQUEST_ID.to_string());
        }

        if kind == MessageKind::Request && !self.permitted(&class, &message) {
            return;
        }

        if !message.dst.addresses(&self.local()) {
            return self.forward(kind, message);
        }

        match kind {
            MessageKind::Request => self.handle_request(&class, message),
            MessageKind::Response => {
                let data = message.data.clone();
                self.resolve(&message, Ok(data));
            }
            MessageKind::ResponseError => {
                let error = match serde_json::from_value::<ErrorData>(message.data.clone()) {
                    Ok(body) => body.message,
                    Err(e) => return self.fatal(format!("invalid responseError body: {e}")),
                };
                self.resolve(&message, Err(ProtocolError::Remote(error)));
            }
            MessageKind::Event if class.kind == ClassKind::Event => {
                self.handle_event(&class, message).await
            }
            other => self.fatal(format!("{other} is not application traffic")),
        }
    }

    /// Whether `src` can reach us through the directly connected peer
    fn source_plausible(&self, src: &Address) -> bool {
        let peer = self.peer();
        match peer.kind {
            AddressKind::Controller => true,
            AddressKind::Host if self.local().kind == AddressKind::Instance => true,
            AddressKind::Host => *src == peer || src.kind == AddressKind::Instance,
            _ => *src == peer,
        }
    }

    /// Permission gate for control-originated requests; denied requests are answered here
    fn permitted(&self, class: &MessageClass, message: &ApplicationData) -> bool {
        let (Some(permission), AddressKind::Control) = (class.permission, message.src.kind) else {
            return true;
        };
        let Some(check) = &self.inner.permissions else {
            return true;
        };
        if check.check(&message.src, permission) {
            return true;
        }
        warn!(src = %message.src, permission, name = %message.name, "Permission denied");
        self.answer_error(message, ProtocolError::PermissionDenied(permission.to_string()));
        false
    }

    fn forward(&self, kind: MessageKind, message: ApplicationData) {
        match self.inner.forwarder.as_ref().and_then(Weak::upgrade) {
            Some(forwarder) => {
                // Unroutable traffic is answered or logged by the forwarder itself
                let _ = forwarder.forward(self, kind, message);
            }
            None if kind == MessageKind::Request => {
                warn!(name = %message.name, dst = %message.dst, "No forwarder for request");
                self.answer_error(&message, constants::ERR_NO_ROUTE);
            }
            None => {
                warn!(name = %message.name, dst = %message.dst, kind = %kind, "Dropping message without route");
                global_metrics().message_unroutable();
            }
        }
    }

    fn handle_request(&self, class: &MessageClass, message: ApplicationData) {
        if let Err(e) = class.validate(&message.data) {
            warn!(name = %message.name, error = %e, "Request failed validation");
            return self.answer_error(&message, e);
        }

        let context = MessageContext {
            src: message.src,
            dst: message.dst,
            link: self.clone(),
        };
        let pending = match self
            .inner
            .dispatcher
            .dispatch(&message.name, message.data.clone(), context)
        {
            Ok(pending) => pending,
            Err(ProtocolError::UnknownMessage(_)) => {
                return self.answer_error(&message, constants::ERR_NO_HANDLER)
            }
            Err(e) => return self.answer_error(&message, e),
        };

        let link = self.clone();
        tokio::spawn(async move {
            let sent = match pending.await {
                Ok(data) => link.send_reply(MessageKind::Response, &message.reply(data)),
                Err(e) => {
                    debug!(name = %message.name, error = %e, "Request handler failed");
                    link.send_reply(MessageKind::ResponseError, &message.reply_error(e))
                }
            };
            if let Err(e) = sent {
                debug!(name = %message.name, error = %e, "Could not send response");
            }
        });
    }

    async fn handle_event(&self, class: &MessageClass, message: ApplicationData) {
        if let Err(e) = class.validate(&message.data) {
            warn!(name = %message.name, error = %e, "Dropping event that failed validation");
            return;
        }
        let context = MessageContext {
            src: message.src,
            dst: message.dst,
            link: self.clone(),
        };
        match self
            .inner
            .dispatcher
            .dispatch(&message.name, message.data, context)
        {
            Ok(handler) => {
                if let Err(e) = handler.await {
                    warn!(name = %message.name, error = %e, "Event handler failed");
                }
            }
            Err(_) => trace!(name = %message.name, "No handler for event"),
        }
    }

    fn resolve(&self, message: &ApplicationData, outcome: Result<Value>) {
        let Some(request_id) = message.request_id else {
            return self.fatal(constants::ERR_MISSING_REQUEST_ID.to_string());
        };
        match self.pending().remove(&request_id) {
            Some(sender) => {
                let _ = sender.send(outcome);
            }
            None => debug!(request_id, name = %message.name, "Answer for unknown or expired request"),
        }
    }

    fn answer_error(&self, request: &ApplicationData, error: impl fmt::Display) {
        if let Err(e) = self.reply_error(request, error) {
            debug!(name = %request.name, error = %e, "Could not send responseError");
        }
    }

    fn fatal(&self, detail: String) {
        warn!(peer = %self.peer(), detail = %detail, "Protocol violation on link");
        global_metrics().protocol_error();
        self.inner
            .connector
            .close(CloseReason::ProtocolViolation(detail));
    }
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Link")
            .field("local", &self.local())
            .field("peer", &self.peer())
            .field("state", &self.inner.connector.state())
            .finish()
    }
}
