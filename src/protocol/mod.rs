//! # Protocol Layer
//!
//! Typed messaging and routing on top of the transport connectors.
//!
//! ## Components
//! - **Registry**: message classes, their address pairs and payload schemas
//! - **Dispatcher**: handler table shared by the links of a node
//! - **Link**: request/response/event endpoint over one connector
//! - **Handshake**: acceptor side of `hello`/`resume`
//! - **Router**: next-hop resolution on the controller and on hosts
//! - **Node**: controller and host wiring, initiator helper

pub mod dispatcher;
pub mod handshake;
pub mod link;
pub mod node;
pub mod registry;
pub mod router;

pub use dispatcher::{Dispatcher, MessageContext};
pub use handshake::{Accepted, Acceptor, AcceptorOptions, TokenValidator};
pub use link::{Link, PermissionCheck};
pub use node::{connect_link, ControllerNode, HostNode};
pub use registry::{AddressPair, Event, MessageClass, MessageRegistry, Request};
pub use router::{ControllerRouter, Forwarder, HostRouter, InstanceDirectory, RouteError};
