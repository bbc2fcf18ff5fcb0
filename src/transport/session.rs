//! Session bookkeeping: sequence numbering, the replay buffer and the connector state table.
//!
//! Everything here is synchronous and socket-free so the resume rules can be tested in
//! isolation from the I/O driving them.

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use serde_json::Value;

use crate::core::address::Address;
use crate::core::message::{Envelope, MessageKind};
use crate::error::{ProtocolError, Result};

/// Lifecycle of a connector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectorState {
    New,
    Connecting,
    Connected,
    Resuming,
    Closed,
}

impl ConnectorState {
    /// Transition table of the connector state machine
    pub fn can_transition_to(self, next: ConnectorState) -> bool {
        use ConnectorState::*;
        matches!(
            (self, next),
            (New, Connecting)
                | (New, Connected)
                | (New, Closed)
                | (Connecting, Connected)
                | (Connecting, Closed)
                | (Connected, Resuming)
                | (Connected, Connected)
                | (Connected, Closed)
                | (Resuming, Connected)
                | (Resuming, Connecting)
                | (Resuming, Closed)
        )
    }

    pub fn is_open(self) -> bool {
        matches!(self, ConnectorState::Connected | ConnectorState::Resuming)
    }
}

impl fmt::Display for ConnectorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectorState::New => "new",
            ConnectorState::Connecting => "connecting",
            ConnectorState::Connected => "connected",
            ConnectorState::Resuming => "resuming",
            ConnectorState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Why a connector reached `Closed`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Local or peer-agreed shutdown
    Requested,
    /// No resume arrived before the session timeout
    SessionExpired,
    /// The peer broke the protocol; the text describes how
    ProtocolViolation(String),
    /// Too many unacknowledged messages
    BufferOverflow,
    /// A newer session registered the same address
    Superseded,
    /// The initial handshake could not be completed
    HandshakeFailed(String),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Requested => f.write_str("closed on request"),
            CloseReason::SessionExpired => f.write_str("session expired"),
            CloseReason::ProtocolViolation(detail) => write!(f, "protocol violation: {detail}"),
            CloseReason::BufferOverflow => f.write_str("send buffer overflow"),
            CloseReason::Superseded => f.write_str("superseded by a newer session"),
            CloseReason::HandshakeFailed(detail) => write!(f, "handshake failed: {detail}"),
        }
    }
}

/// Resumable identity of a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub token: String,
    pub address: Address,
    pub heartbeat_interval: Duration,
    pub timeout: Duration,
}

/// Generate an opaque session token from the OS RNG
pub fn generate_token() -> Result<String> {
    let mut bytes = [0u8; 24];
    getrandom::fill(&mut bytes)
        .map_err(|e| ProtocolError::Custom(format!("Failed to generate session token: {e}")))?;
    Ok(bytes.iter().map(|b| format!("{b:02x}")).collect())
}

/// Ordered buffer of sent but unacknowledged session traffic
#[derive(Debug)]
pub struct SendBuffer {
    next_seq: u64,
    entries: VecDeque<Envelope>,
    capacity: usize,
    max_frame_size: Option<usize>,
}

impl SendBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            next_seq: 1,
            entries: VecDeque::new(),
            capacity,
            max_frame_size: None,
        }
    }

    /// Refuse messages whose encoded envelope would exceed `limit` bytes
    pub fn with_frame_limit(mut self, limit: usize) -> Self {
        self.max_frame_size = Some(limit);
        self
    }

    /// Number the next message and keep it for replay.
    ///
    /// `build` receives the assigned seq so bodies can embed it. The seq is only consumed
    /// when the message is accepted.
    pub fn push<F>(&mut self, kind: MessageKind, build: F) -> Result<Envelope>
    where
        F: FnOnce(u64) -> Result<Value>,
    {
        if !kind.is_session_traffic() {
            return Err(ProtocolError::UnexpectedMessage(format!(
                "{kind} is not session traffic"
            )));
        }
        if self.entries.len() >= self.capacity {
            return Err(ProtocolError::SendBufferOverflow(self.entries.len()));
        }

        let seq = self.next_seq;
        let envelope = Envelope {
            seq: Some(seq),
            kind,
            data: build(seq)?,
        };
        if let Some(limit) = self.max_frame_size {
            let size = serde_json::to_vec(&envelope)?.len();
            if size > limit {
                return Err(ProtocolError::FrameTooLarge { size, limit });
            }
        }
        self.next_seq += 1;
        self.entries.push_back(envelope.clone());
        Ok(envelope)
    }

    /// Drop every entry with seq at or below `seq`; returns how many were released
    pub fn acknowledge(&mut self, seq: u64) -> usize {
        let mut released = 0;
        while self
            .entries
            .front()
            .and_then(|entry| entry.seq)
            .is_some_and(|front| front <= seq)
        {
            self.entries.pop_front();
            released += 1;
        }
        released
    }

    /// Entries the peer has not seen, given it last received `last_seq`
    pub fn replay_after(&self, last_seq: u64) -> impl Iterator<Item = &Envelope> {
        self.entries
            .iter()
            .filter(move |entry| entry.seq.is_some_and(|seq| seq > last_seq))
    }

    /// Highest seq handed out so far (0 before the first message)
    pub fn last_seq(&self) -> u64 {
        self.next_seq - 1
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Forget the session's numbering and traffic entirely
    pub fn reset(&mut self) {
        self.next_seq = 1;
        self.entries.clear();
    }
}
