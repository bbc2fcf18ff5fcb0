//! # Transport Layer
//!
//! Sockets and the session machinery that keeps them reliable.
//!
//! ## Components
//! - **Socket**: length-delimited JSON frames over any async byte stream
//! - **Dialer**: reconnectable socket factories (TCP, in-memory)
//! - **Connector**: handshake, heartbeat, resume and replay state machine
//! - **Session**: send buffer, state table and session tokens
//! - **Session Table**: acceptor-side registry of resumable sessions
//! - **TCP**: accept loop with graceful shutdown

pub mod connector;
pub mod dialer;
pub mod session;
pub mod session_table;
pub mod socket;
pub mod tcp;

pub use connector::{Connector, ConnectorEvent, ConnectorEvents, ConnectorOptions};
pub use dialer::Dialer;
pub use session::{CloseReason, ConnectorState, Session};
pub use socket::Socket;
