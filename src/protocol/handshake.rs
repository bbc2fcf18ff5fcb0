//! # Handshake
//!
//! Acceptor side of connection setup. The first frame on a fresh socket decides what happens:
//!
//! - `hello`: the protocol version must agree on major.minor, the token must pass the
//!   [`TokenValidator`], the registration kind must be accepted here and the session table
//!   must have room. The peer gets an address and a `ready` with a new session token.
//! - `resume`: a live session with that token continues on the new socket; an unknown or
//!   closed session is answered with `invalidate`, after which the peer must send `hello`
//!   on the same socket.
//!
//! A new session for an address that already has one closes the older session.
//! Differences in the announced plugin versions are logged and otherwise ignored.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::config::{LinkConfig, PROTOCOL_VERSION};
use crate::core::address::{Address, AddressKind};
use crate::core::message::{Envelope, HelloData, MessageKind, ReadyData, Registration, ResumeData};
use crate::error::{constants, ProtocolError, Result};
use crate::transport::connector::{Connector, ConnectorEvents, ConnectorOptions};
use crate::transport::session::{generate_token, CloseReason, Session};
use crate::transport::session_table::SessionTable;
use crate::transport::socket::Socket;
use crate::utils::metrics::{global_metrics, Timer};

/// External check of the opaque token presented in `hello`
pub trait TokenValidator: Send + Sync + 'static {
    fn validate(&self, registration: &Registration, token: Option<&str>) -> bool;
}

impl<F> TokenValidator for F
where
    F: Fn(&Registration, Option<&str>) -> bool + Send + Sync + 'static,
{
    fn validate(&self, registration: &Registration, token: Option<&str>) -> bool {
        self(registration, token)
    }
}

/// Accepts every token
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl TokenValidator for AcceptAll {
    fn validate(&self, _registration: &Registration, _token: Option<&str>) -> bool {
        true
    }
}

/// `hello` announcing `registration` with this build's protocol version
pub fn hello(registration: Registration) -> HelloData {
    HelloData {
        version: PROTOCOL_VERSION.to_string(),
        plugins: BTreeMap::new(),
        registration,
        token: None,
    }
}

fn major_minor(version: &str) -> Option<(u64, u64)> {
    let mut parts = version.trim().split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    Some((major, minor))
}

/// Whether two protocol versions agree on major.minor
pub fn version_compatible(ours: &str, theirs: &str) -> bool {
    match (major_minor(ours), major_minor(theirs)) {
        (Some(ours), Some(theirs)) => ours == theirs,
        _ => false,
    }
}

/// What an [`Acceptor`] is willing to accept and how it sets sessions up
#[derive(Debug, Clone)]
pub struct AcceptorOptions {
    /// Registration kinds accepted
    pub accepted: Vec<AddressKind>,
    pub session_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub handshake_timeout: Duration,
    pub max_sessions: usize,
    /// Plugin versions compared against the peer's
    pub plugins: BTreeMap<String, String>,
    pub connector: ConnectorOptions,
}

impl AcceptorOptions {
    /// Controller acceptor: hosts and control connections
    pub fn controller(config: &LinkConfig) -> Self {
        Self::with_kinds(config, vec![AddressKind::Host, AddressKind::Control])
    }

    /// Host acceptor: instances
    pub fn host(config: &LinkConfig) -> Self {
        Self::with_kinds(config, vec![AddressKind::Instance])
    }

    fn with_kinds(config: &LinkConfig, accepted: Vec<AddressKind>) -> Self {
        Self {
            accepted,
            session_timeout: config.controller.session_timeout,
            heartbeat_interval: config.controller.heartbeat_interval,
            handshake_timeout: config.controller.handshake_timeout,
            max_sessions: config.controller.max_sessions,
            plugins: BTreeMap::new(),
            connector: ConnectorOptions::from_config(config),
        }
    }
}

/// A connection that completed `hello`/`ready`
#[derive(Debug)]
pub struct NewConnection {
    pub connector: Connector,
    pub events: ConnectorEvents,
    /// Address assigned to the peer
    pub address: Address,
    pub hello: HelloData,
}

/// Outcome of a successful handshake
#[derive(Debug)]
pub enum Accepted {
    New(NewConnection),
    /// An existing session continued; its link keeps running unchanged
    Resumed {
        address: Address,
        replayed: usize,
        connector: Connector,
    },
}

/// Acceptor-side handshake and the table of resumable sessions
pub struct Acceptor {
    options: AcceptorOptions,
    sessions: SessionTable,
    validator: Arc<dyn TokenValidator>,
    next_control_id: AtomicU32,
}

impl Acceptor {
    pub fn new(options: AcceptorOptions) -> Self {
        let sessions = SessionTable::new(options.max_sessions);
        Self {
            options,
            sessions,
            validator: Arc::new(AcceptAll),
            next_control_id: AtomicU32::new(1),
        }
    }

    pub fn with_validator(mut self, validator: Arc<dyn TokenValidator>) -> Self {
        self.validator = validator;
        self
    }

    pub fn options(&self) -> &AcceptorOptions {
        &self.options
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    /// Run the handshake on a freshly accepted socket
    #[instrument(skip_all)]
    pub async fn accept(&self, socket: Socket) -> Result<Accepted> {
        global_metrics().handshake_attempt();
        let _timer = Timer::start("handshake");
        let result = self.negotiate(socket).await;
        match &result {
            Ok(_) => global_metrics().handshake_success(),
            Err(e) => {
                global_metrics().handshake_failed();
                debug!(error = %e, "Handshake failed");
            }
        }
        result
    }

    async fn negotiate(&self, mut socket: Socket) -> Result<Accepted> {
        let limit = self.options.handshake_timeout;
        let first = socket.recv_timeout(limit).await?;
        match first.kind {
            MessageKind::Hello => {
                let hello: HelloData = first.decode()?;
                self.greet(socket, hello).await
            }
            MessageKind::Resume => {
                let resume: ResumeData = first.decode()?;
                let mut socket = match self.sessions.get(&resume.session_token).await {
                    Some((address, connector)) => match connector.resume(socket, resume.last_seq) {
                        Ok(replayed) => {
                            return Ok(Accepted::Resumed {
                                address,
                                replayed,
                                connector,
                            })
                        }
                        Err(socket) => socket,
                    },
                    None => socket,
                };

                debug!("Session not resumable, sending invalidate");
                socket.send(Envelope::invalidate()).await?;
                let next = socket.recv_timeout(limit).await?;
                if next.kind != MessageKind::Hello {
                    return Err(ProtocolError::HandshakeError(format!(
                        "{}, got {}",
                        constants::ERR_EXPECTED_HELLO,
                        next.kind
                    )));
                }
                let hello: HelloData = next.decode()?;
                self.greet(socket, hello).await
            }
            other => Err(ProtocolError::UnexpectedMessage(format!(
                "expected hello or resume, got {other}"
            ))),
        }
    }

    async fn greet(&self, mut socket: Socket, hello: HelloData) -> Result<Accepted> {
        if !version_compatible(PROTOCOL_VERSION, &hello.version) {
            warn!(ours = PROTOCOL_VERSION, theirs = %hello.version, "Protocol version mismatch");
            return Err(ProtocolError::UnsupportedVersion(hello.version));
        }

        let kind = hello.registration.kind();
        if !self.options.accepted.contains(&kind) {
            return Err(ProtocolError::HandshakeError(format!(
                "{}: {kind}",
                constants::ERR_REGISTRATION_REFUSED
            )));
        }

        if !self
            .validator
            .validate(&hello.registration, hello.token.as_deref())
        {
            warn!(kind = %kind, "Token rejected");
            return Err(ProtocolError::PermissionDenied(format!(
                "token rejected for {kind}"
            )));
        }

        self.compare_plugins(&hello.plugins);

        let address = match hello.registration {
            Registration::Host { id } => Address::host(id),
            Registration::Instance { id } => Address::instance(id),
            Registration::Control => {
                Address::control(self.next_control_id.fetch_add(1, Ordering::Relaxed))
            }
        };

        if !self.sessions.has_room_for(&address).await {
            warn!(address = %address, "Session limit reached");
            return Err(ProtocolError::Custom(constants::ERR_SESSION_LIMIT.to_string()));
        }

        let session = Session {
            token: generate_token()?,
            address,
            heartbeat_interval: self.options.heartbeat_interval,
            timeout: self.options.session_timeout,
        };
        let ready = ReadyData {
            address,
            session_token: session.token.clone(),
            session_timeout: millis(session.timeout),
            heartbeat_interval: millis(session.heartbeat_interval),
        };
        socket.send(Envelope::ready(&ready)?).await?;

        let token = session.token.clone();
        let (connector, events) =
            Connector::accepted(socket, session, self.options.connector.clone());
        match self
            .sessions
            .insert(token.clone(), address, connector.clone())
            .await
        {
            Ok(Some(previous)) => {
                info!(address = %address, "Closing superseded session");
                previous.close(CloseReason::Superseded);
            }
            Ok(None) => {}
            Err(e) => {
                connector.close(CloseReason::HandshakeFailed(e.to_string()));
                return Err(e);
            }
        }
        self.forget_on_close(token, connector.clone());

        info!(address = %address, "Session accepted");
        Ok(Accepted::New(NewConnection {
            connector,
            events,
            address,
            hello,
        }))
    }

    fn forget_on_close(&self, token: String, connector: Connector) {
        let sessions = self.sessions.clone();
        tokio::spawn(async move {
            connector.closed().await;
            sessions.remove(&token, &connector).await;
        });
    }

    fn compare_plugins(&self, theirs: &BTreeMap<String, String>) {
        for (name, version) in &self.options.plugins {
            match theirs.get(name) {
                Some(other) if other == version => {}
                Some(other) => {
                    warn!(plugin = %name, ours = %version, theirs = %other, "Plugin version mismatch")
                }
                None => warn!(plugin = %name, "Plugin missing on peer"),
            }
        }
        for name in theirs.keys().filter(|name| !self.options.plugins.contains_key(*name)) {
            warn!(plugin = %name, "Peer announced unknown plugin");
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::MAX_FRAME_SIZE;
    use crate::transport::connector::ConnectorEvent;
    use crate::transport::dialer::Dialer;
    use crate::transport::session::ConnectorState;
    use crate::transport::socket::memory_pair;
    use tokio::sync::mpsc;

    fn acceptor() -> Acceptor {
        Acceptor::new(AcceptorOptions::controller(&LinkConfig::default()))
    }

    async fn send_hello(socket: &mut Socket, hello: &HelloData) -> Envelope {
        socket.send(Envelope::hello(hello).unwrap()).await.unwrap();
        socket.recv().await.unwrap().unwrap()
    }

    #[test]
    fn test_version_compatibility() {
        assert!(version_compatible("2.0.0", "2.0.7"));
        assert!(!version_compatible("2.0.0", "2.1.0"));
        assert!(!version_compatible("2.0.0", "3.0.0"));
        assert!(!version_compatible("2.0.0", "two"));
    }

    #[tokio::test]
    async fn test_hello_assigns_address() {
        let acceptor = acceptor();
        let (mut client, server) = memory_pair(MAX_FRAME_SIZE);
        let client_side = tokio::spawn(async move {
            let reply = send_hello(&mut client, &hello(Registration::Host { id: 4 })).await;
            (client, reply)
        });

        let accepted = acceptor.accept(server).await.unwrap();
        let (_client, reply) = client_side.await.unwrap();
        let ready: ReadyData = reply.expect(MessageKind::Ready).unwrap();
        assert_eq!(ready.address, Address::host(4));
        match accepted {
            Accepted::New(connection) => {
                assert_eq!(connection.address, Address::host(4));
                assert_eq!(connection.connector.state(), ConnectorState::Connected);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(acceptor.sessions().live_count().await, 1);
    }

    #[tokio::test]
    async fn test_control_connections_get_fresh_ids() {
        let acceptor = acceptor();
        let mut addresses = Vec::new();
        for _ in 0..2 {
            let (mut client, server) = memory_pair(MAX_FRAME_SIZE);
            let client_side = tokio::spawn(async move {
                let reply = send_hello(&mut client, &hello(Registration::Control)).await;
                (client, reply)
            });
            let Accepted::New(connection) = acceptor.accept(server).await.unwrap() else {
                panic!("expected a new connection");
            };
            let _ = client_side.await.unwrap();
            addresses.push(connection.address);
        }
        assert_eq!(addresses, vec![Address::control(1), Address::control(2)]);
    }

    #[tokio::test]
    async fn test_incompatible_version_rejected() {
        let acceptor = acceptor();
        let (mut client, server) = memory_pair(MAX_FRAME_SIZE);
        let mut old = hello(Registration::Host { id: 1 });
        old.version = "1.4.0".to_string();
        client.send(Envelope::hello(&old).unwrap()).await.unwrap();

        let result = acceptor.accept(server).await;
        assert!(matches!(result, Err(ProtocolError::UnsupportedVersion(_))));
    }

    #[tokio::test]
    async fn test_registration_kind_refused() {
        let acceptor = Acceptor::new(AcceptorOptions::host(&LinkConfig::default()));
        let (mut client, server) = memory_pair(MAX_FRAME_SIZE);
        client
            .send(Envelope::hello(&hello(Registration::Host { id: 1 })).unwrap())
            .await
            .unwrap();

        let result = acceptor.accept(server).await;
        assert!(matches!(result, Err(ProtocolError::HandshakeError(_))));
    }

    #[tokio::test]
    async fn test_token_validator_rejects() {
        let acceptor = acceptor().with_validator(Arc::new(
            |_: &Registration, token: Option<&str>| token == Some("secret"),
        ));
        let (mut client, server) = memory_pair(MAX_FRAME_SIZE);
        client
            .send(Envelope::hello(&hello(Registration::Control)).unwrap())
            .await
            .unwrap();

        let result = acceptor.accept(server).await;
        assert!(matches!(result, Err(ProtocolError::PermissionDenied(_))));
    }

    #[tokio::test]
    async fn test_unknown_resume_is_invalidated() {
        let acceptor = acceptor();
        let (mut client, server) = memory_pair(MAX_FRAME_SIZE);
        let client_side = tokio::spawn(async move {
            let resume = ResumeData {
                session_token: "forgotten".to_string(),
                last_seq: 3,
            };
            client.send(Envelope::resume(&resume).unwrap()).await.unwrap();
            let first = client.recv().await.unwrap().unwrap();
            assert_eq!(first.kind, MessageKind::Invalidate);
            let reply = send_hello(&mut client, &hello(Registration::Host { id: 2 })).await;
            (client, reply)
        });

        let accepted = acceptor.accept(server).await.unwrap();
        let (_client, reply) = client_side.await.unwrap();
        assert_eq!(reply.kind, MessageKind::Ready);
        assert!(matches!(accepted, Accepted::New(_)));
    }

    #[tokio::test]
    async fn test_new_session_supersedes_old() {
        let acceptor = acceptor();
        let mut connectors = Vec::new();
        let mut clients = Vec::new();
        for _ in 0..2 {
            let (mut client, server) = memory_pair(MAX_FRAME_SIZE);
            let client_side = tokio::spawn(async move {
                send_hello(&mut client, &hello(Registration::Host { id: 7 })).await;
                client
            });
            let Accepted::New(connection) = acceptor.accept(server).await.unwrap() else {
                panic!("expected a new connection");
            };
            clients.push(client_side.await.unwrap());
            connectors.push((connection.connector, connection.events));
        }

        let (first, mut first_events) = connectors.remove(0);
        loop {
            if let ConnectorEvent::Closed(reason) = first_events.recv().await.unwrap() {
                assert_eq!(reason, CloseReason::Superseded);
                break;
            }
        }
        assert_eq!(first.state(), ConnectorState::Closed);
        assert_eq!(connectors[0].0.state(), ConnectorState::Connected);
        assert_eq!(acceptor.sessions().live_count().await, 1);
    }

    #[tokio::test]
    async fn test_initiator_resumes_through_acceptor() {
        let acceptor = Arc::new(acceptor());
        let (tx, mut incoming) = mpsc::unbounded_channel();
        let server = acceptor.clone();
        let accept_loop = tokio::spawn(async move {
            let mut outcomes = Vec::new();
            while outcomes.len() < 2 {
                let socket = incoming.recv().await.unwrap();
                outcomes.push(server.accept(socket).await.unwrap());
            }
            outcomes
        });

        let (client, mut events) = Connector::connect(
            Dialer::memory(tx, MAX_FRAME_SIZE),
            hello(Registration::Host { id: 3 }),
            ConnectorOptions::default(),
        )
        .await
        .unwrap();
        assert!(matches!(events.recv().await, Some(ConnectorEvent::Connected(_))));

        client.drop_transport();
        assert!(matches!(events.recv().await, Some(ConnectorEvent::Resuming)));
        assert!(matches!(events.recv().await, Some(ConnectorEvent::Resumed)));

        let outcomes = accept_loop.await.unwrap();
        assert!(matches!(outcomes[0], Accepted::New(_)));
        assert!(matches!(
            outcomes[1],
            Accepted::Resumed {
                address,
                replayed: 0,
                ..
            } if address == Address::host(3)
        ));
    }
}
