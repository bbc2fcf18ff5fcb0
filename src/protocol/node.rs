//! # Nodes
//!
//! Wiring of acceptor, links and router into the participants of a cluster.
//!
//! - [`ControllerNode`] accepts hosts and control connections and routes between them
//! - [`HostNode`] keeps a supervised link to the controller and accepts its instances
//! - [`connect_link`] is the plain initiator used by control clients and instances

use futures::FutureExt;
use std::sync::{Arc, Weak};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{error, info, instrument, warn};

use crate::config::LinkConfig;
use crate::core::address::Address;
use crate::core::message::{HelloData, Registration};
use crate::error::Result;
use crate::protocol::dispatcher::Dispatcher;
use crate::protocol::handshake::{self, Accepted, Acceptor, AcceptorOptions, TokenValidator};
use crate::protocol::link::{Link, PermissionCheck};
use crate::protocol::registry::MessageRegistry;
use crate::protocol::router::{weak_forwarder, ControllerRouter, Forwarder, HostRouter, InstanceDirectory};
use crate::transport::connector::{Connector, ConnectorOptions};
use crate::transport::dialer::Dialer;
use crate::transport::session::CloseReason;
use crate::transport::socket::Socket;
use crate::transport::tcp::{self, ServeOptions};
use crate::utils::metrics::global_metrics;
use crate::utils::timeout::with_timeout_error;

/// Dial, handshake and start a link to `peer`
#[instrument(skip_all, fields(target = %dialer.target(), peer = %peer))]
pub async fn connect_link(
    dialer: Dialer,
    hello: HelloData,
    peer: Address,
    config: &LinkConfig,
    registry: Arc<MessageRegistry>,
    dispatcher: Arc<Dispatcher>,
    forwarder: Option<Weak<dyn Forwarder>>,
) -> Result<Link> {
    let options = ConnectorOptions::from_config(config);
    let (connector, events) = with_timeout_error(
        Connector::connect(dialer, hello, options),
        config.client.connect_timeout + config.controller.handshake_timeout,
    )
    .await?;
    let local = connector.address().unwrap_or(peer);

    let mut builder = Link::builder(connector, local, peer)
        .registry(registry)
        .dispatcher(dispatcher)
        .request_timeout(config.client.request_timeout);
    if let Some(forwarder) = forwarder {
        builder = builder.forwarder(forwarder);
    }
    Ok(builder.start(events))
}

/// What a served TCP connection turned into; it counts as active until this closes
enum Served {
    Link(Link),
    Resumed(Connector),
}

/// Controller: accepts hosts and control connections and routes between them
pub struct ControllerNode {
    config: LinkConfig,
    acceptor: Acceptor,
    router: Arc<ControllerRouter>,
    registry: Arc<MessageRegistry>,
    dispatcher: Arc<Dispatcher>,
    permissions: Option<Arc<dyn PermissionCheck>>,
}

impl ControllerNode {
    pub fn new(
        config: LinkConfig,
        registry: MessageRegistry,
        instances: Arc<dyn InstanceDirectory>,
    ) -> Self {
        let acceptor = Acceptor::new(AcceptorOptions::controller(&config));
        Self {
            config,
            acceptor,
            router: ControllerRouter::new(instances),
            registry: Arc::new(registry),
            dispatcher: Arc::new(Dispatcher::new()),
            permissions: None,
        }
    }

    pub fn with_token_validator(mut self, validator: Arc<dyn TokenValidator>) -> Self {
        self.acceptor = self.acceptor.with_validator(validator);
        self
    }

    pub fn with_permissions(mut self, permissions: Arc<dyn PermissionCheck>) -> Self {
        self.permissions = Some(permissions);
        self
    }

    /// Handlers for messages addressed to the controller
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn router(&self) -> &Arc<ControllerRouter> {
        &self.router
    }

    pub fn acceptor(&self) -> &Acceptor {
        &self.acceptor
    }

    /// Handshake on `socket`; a new session gets a link registered with the router.
    ///
    /// Returns `None` when the socket resumed an existing session.
    pub async fn handle_socket(&self, socket: Socket) -> Result<Option<Link>> {
        Ok(match self.accept_socket(socket).await? {
            Served::Link(link) => Some(link),
            Served::Resumed(_) => None,
        })
    }

    async fn accept_socket(&self, socket: Socket) -> Result<Served> {
        let connection = match self.acceptor.accept(socket).await? {
            Accepted::New(connection) => connection,
            Accepted::Resumed {
                address,
                replayed,
                connector,
            } => {
                info!(peer = %address, replayed, "Link resumed");
                return Ok(Served::Resumed(connector));
            }
        };

        let mut builder = Link::builder(
            connection.connector,
            Address::controller(),
            connection.address,
        )
        .registry(self.registry.clone())
        .dispatcher(self.dispatcher.clone())
        .forwarder(weak_forwarder(&self.router))
        .request_timeout(self.config.client.request_timeout);
        if let Some(permissions) = &self.permissions {
            builder = builder.permissions(permissions.clone());
        }
        let link = builder.start(connection.events);
        self.router.register(link.clone());
        Ok(Served::Link(link))
    }

    /// Close every session for good; peers are not expected to resume
    pub async fn close_sessions(&self) {
        for connector in self.acceptor.sessions().drain().await {
            connector.set_closing();
            connector.close(CloseReason::Requested);
        }
    }

    /// Accept TCP connections on the configured bind address until `shutdown_rx` fires
    pub async fn listen(self: Arc<Self>, shutdown_rx: mpsc::Receiver<()>) -> Result<()> {
        let listener = TcpListener::bind(&self.config.controller.bind_address).await?;
        self.serve(listener, shutdown_rx).await
    }

    /// Accept TCP connections on `listener` until `shutdown_rx` fires.
    ///
    /// Each connection counts as active until its link closes; shutdown closes all sessions
    /// and waits for them within the configured shutdown timeout.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown_rx: mpsc::Receiver<()>,
    ) -> Result<()> {
        let options = ServeOptions {
            max_frame_size: self.config.session.max_frame_size,
            shutdown_timeout: self.config.controller.shutdown_timeout,
        };

        let (stop_tx, stop_rx) = mpsc::channel::<()>(1);
        let node = self.clone();
        tokio::spawn(async move {
            let _ = shutdown_rx.recv().await;
            node.close_sessions().await;
            let _ = stop_tx.send(()).await;
        });

        let node = self;
        let served = tcp::serve(listener, options, stop_rx, move |socket, peer| {
            let node = node.clone();
            async move {
                match node.accept_socket(socket).await {
                    Ok(Served::Link(link)) => link.closed().await,
                    Ok(Served::Resumed(connector)) => connector.closed().await,
                    Err(e) => warn!(peer = %peer, error = %e, "Rejected connection"),
                }
            }
            .boxed()
        })
        .await;
        global_metrics().log_metrics();
        served
    }
}

/// Host: link to the controller plus the instances running on this host
pub struct HostNode {
    id: u32,
    config: LinkConfig,
    acceptor: Acceptor,
    router: Arc<HostRouter>,
    registry: Arc<MessageRegistry>,
    dispatcher: Arc<Dispatcher>,
}

impl HostNode {
    pub fn new(id: u32, config: LinkConfig, registry: MessageRegistry) -> Self {
        let acceptor = Acceptor::new(AcceptorOptions::host(&config));
        Self {
            id,
            config,
            acceptor,
            router: HostRouter::new(),
            registry: Arc::new(registry),
            dispatcher: Arc::new(Dispatcher::new()),
        }
    }

    pub fn with_token_validator(mut self, validator: Arc<dyn TokenValidator>) -> Self {
        self.acceptor = self.acceptor.with_validator(validator);
        self
    }

    pub fn address(&self) -> Address {
        Address::host(self.id)
    }

    /// Handlers for messages addressed to this host
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn router(&self) -> &Arc<HostRouter> {
        &self.router
    }

    pub fn acceptor(&self) -> &Acceptor {
        &self.acceptor
    }

    /// Connect to the controller once and install the link in the router
    pub async fn connect(&self, dialer: Dialer) -> Result<Link> {
        let link = connect_link(
            dialer,
            handshake::hello(Registration::Host { id: self.id }),
            Address::controller(),
            &self.config,
            self.registry.clone(),
            self.dispatcher.clone(),
            Some(weak_forwarder(&self.router)),
        )
        .await?;
        self.router.set_controller(link.clone());
        Ok(link)
    }

    /// TCP dialer for the configured controller address
    pub fn controller_dialer(&self) -> Dialer {
        Dialer::tcp(
            self.config.client.controller_address.clone(),
            self.config.session.max_frame_size,
        )
    }

    /// [`HostNode::run`] against the configured controller address
    pub async fn run_configured(&self, shutdown_rx: mpsc::Receiver<()>) -> Result<()> {
        self.run(self.controller_dialer(), shutdown_rx).await
    }

    /// Keep a controller link up until `shutdown_rx` fires, reconnecting with backoff after
    /// the link closes for good
    pub async fn run(&self, dialer: Dialer, mut shutdown_rx: mpsc::Receiver<()>) -> Result<()> {
        let mut backoff = self.config.client.backoff();
        loop {
            match self.connect(dialer.clone()).await {
                Ok(link) => {
                    info!(host = self.id, "Connected to controller");
                    tokio::select! {
                        _ = link.closed() => {
                            warn!(host = self.id, "Controller link closed");
                            self.router.clear_controller(&link);
                        }
                        _ = shutdown_rx.recv() => {
                            if let Err(e) = link.disconnect().await {
                                warn!(error = %e, "Controller did not confirm disconnect");
                            }
                            self.router.clear_controller(&link);
                            return Ok(());
                        }
                    }
                }
                Err(e) => error!(host = self.id, error = %e, "Controller connection failed"),
            }

            let delay = backoff.delay();
            info!(delay_ms = delay.as_millis() as u64, "Reconnecting to controller");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown_rx.recv() => return Ok(()),
            }
        }
    }

    /// Handshake on an instance socket and register the instance link
    pub async fn handle_instance_socket(&self, socket: Socket) -> Result<Option<Link>> {
        let connection = match self.acceptor.accept(socket).await? {
            Accepted::New(connection) => connection,
            Accepted::Resumed {
                address, replayed, ..
            } => {
                info!(peer = %address, replayed, "Instance link resumed");
                return Ok(None);
            }
        };

        let link = Link::builder(connection.connector, self.address(), connection.address)
            .registry(self.registry.clone())
            .dispatcher(self.dispatcher.clone())
            .forwarder(weak_forwarder(&self.router))
            .request_timeout(self.config.client.request_timeout)
            .start(connection.events);
        self.router.register_instance(link.clone());
        Ok(Some(link))
    }
}
