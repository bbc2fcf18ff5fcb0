//! # cluster-link
//!
//! Resumable message links between the participants of a star-shaped cluster: one
//! controller, hosts connected to it, instances connected to their host, and control clients.
//!
//! ## Layers
//! - [`core`]: addresses, the `{seq, type, data}` envelope and its length-delimited framing
//! - [`transport`]: sockets, dialers and the [`Connector`](transport::Connector), which keeps a
//!   session alive across socket drops with heartbeats, resume and replay
//! - [`protocol`]: typed requests and events over a [`Link`](protocol::Link), the acceptor
//!   handshake and the controller/host routers
//! - [`utils`]: backoff, rate limiting, timeouts, logging and metrics
//!
//! ## Example
//! ```no_run
//! use std::sync::Arc;
//! use cluster_link::config::LinkConfig;
//! use cluster_link::protocol::registry::MessageRegistry;
//! use cluster_link::protocol::router::StaticInstanceDirectory;
//! use cluster_link::protocol::ControllerNode;
//!
//! #[tokio::main]
//! async fn main() -> cluster_link::error::Result<()> {
//!     let config = LinkConfig::default();
//!     let node = Arc::new(ControllerNode::new(
//!         config,
//!         MessageRegistry::new(),
//!         Arc::new(StaticInstanceDirectory::new()),
//!     ));
//!     let (_shutdown_tx, shutdown_rx) = tokio::sync::mpsc::channel(1);
//!     node.listen(shutdown_rx).await
//! }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod protocol;
pub mod transport;
pub mod utils;

pub use crate::core::address::{Address, AddressKind};
pub use crate::core::message::{Envelope, MessageKind};
pub use crate::error::{ProtocolError, Result};
