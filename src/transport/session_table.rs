//! # Session Table
//!
//! Acceptor-side registry of resumable sessions, keyed by session token.
//!
//! ## Features
//! - **Thread-safe**: shared behind `Arc<Mutex<>>`, cloned into every connection task
//! - **One session per address**: registering an address again hands back the previous
//!   connector so the caller can close it as superseded
//! - **Memory-bounded**: at most `max_sessions` live entries
//! - **Lazy eviction**: closed connectors are dropped whenever the table is touched

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, trace};

use crate::core::address::Address;
use crate::error::{constants, ProtocolError, Result};
use crate::transport::connector::Connector;
use crate::transport::session::ConnectorState;

struct SessionEntry {
    address: Address,
    connector: Connector,
}

struct SessionTableInner {
    /// Session token -> live session
    sessions: HashMap<String, SessionEntry>,
    /// Address -> token of its current session
    addresses: HashMap<Address, String>,
}

#[derive(Clone)]
pub struct SessionTable {
    max_sessions: usize,
    inner: Arc<Mutex<SessionTableInner>>,
}

impl SessionTable {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            max_sessions,
            inner: Arc::new(Mutex::new(SessionTableInner {
                sessions: HashMap::new(),
                addresses: HashMap::new(),
            })),
        }
    }

    /// Whether a new session for `address` would fit
    pub async fn has_room_for(&self, address: &Address) -> bool {
        let mut inner = self.inner.lock().await;
        Self::evict_closed(&mut inner);
        inner.sessions.len() < self.max_sessions || inner.addresses.contains_key(address)
    }

    /// Register a session. Returns the connector previously holding the same address.
    pub async fn insert(
        &self,
        token: impl Into<String>,
        address: Address,
        connector: Connector,
    ) -> Result<Option<Connector>> {
        let token = token.into();
        let mut inner = self.inner.lock().await;
        Self::evict_closed(&mut inner);

        let previous = inner
            .addresses
            .remove(&address)
            .and_then(|old_token| inner.sessions.remove(&old_token))
            .map(|entry| entry.connector);

        if inner.sessions.len() >= self.max_sessions {
            return Err(ProtocolError::Custom(
                constants::ERR_SESSION_LIMIT.to_string(),
            ));
        }

        inner.addresses.insert(address, token.clone());
        inner
            .sessions
            .insert(token, SessionEntry { address, connector });

        trace!(
            session_count = inner.sessions.len(),
            address = %address,
            "Session registered"
        );
        Ok(previous)
    }

    /// Look up a resumable session; closed sessions are forgotten on the way
    pub async fn get(&self, token: &str) -> Option<(Address, Connector)> {
        let mut inner = self.inner.lock().await;
        let closed = match inner.sessions.get(token) {
            Some(entry) if entry.connector.state() != ConnectorState::Closed => {
                trace!("Session table hit");
                return Some((entry.address, entry.connector.clone()));
            }
            Some(_) => true,
            None => false,
        };
        if closed {
            Self::remove_token(&mut inner, token);
        }
        trace!("Session table miss");
        None
    }

    /// Remove `token` if it still maps to `connector`
    pub async fn remove(&self, token: &str, connector: &Connector) -> bool {
        let mut inner = self.inner.lock().await;
        let matches = inner
            .sessions
            .get(token)
            .is_some_and(|entry| entry.connector.ptr_eq(connector));
        if matches {
            Self::remove_token(&mut inner, token);
        }
        matches
    }

    /// Number of sessions that are not closed
    pub async fn live_count(&self) -> usize {
        let mut inner = self.inner.lock().await;
        Self::evict_closed(&mut inner);
        inner.sessions.len()
    }

    /// Forget every session, handing the connectors back for shutdown
    pub async fn drain(&self) -> Vec<Connector> {
        let mut inner = self.inner.lock().await;
        inner.addresses.clear();
        let drained: Vec<Connector> = inner
            .sessions
            .drain()
            .map(|(_, entry)| entry.connector)
            .collect();
        debug!(drained = drained.len(), "Session table drained");
        drained
    }

    fn remove_token(inner: &mut SessionTableInner, token: &str) {
        if let Some(entry) = inner.sessions.remove(token) {
            if inner
                .addresses
                .get(&entry.address)
                .is_some_and(|current| current == token)
            {
                inner.addresses.remove(&entry.address);
            }
        }
    }

    fn evict_closed(inner: &mut SessionTableInner) {
        let before = inner.sessions.len();
        inner
            .sessions
            .retain(|_, entry| entry.connector.state() != ConnectorState::Closed);
        let SessionTableInner {
            sessions,
            addresses,
            ..
        } = &mut *inner;
        addresses.retain(|_, token| sessions.contains_key(token));

        let after = inner.sessions.len();
        if before != after {
            debug!(
                removed_count = before - after,
                remaining_count = after,
                "Closed sessions evicted"
            );
        }
    }
}
