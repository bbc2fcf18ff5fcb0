//! # Addresses
//!
//! Every participant of the link protocol is identified by an [`Address`]: a kind tag and a
//! numeric id. The controller always has id 0. A broadcast address stores the kind it
//! broadcasts to in its id field.
//!
//! ```rust
//! use cluster_link::core::address::{Address, AddressKind};
//!
//! let everyone = Address::broadcast(AddressKind::Instance);
//! assert_eq!(everyone.broadcast_target(), Some(AddressKind::Instance));
//! assert_eq!(Address::host(3).to_string(), "host 3");
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of protocol participant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressKind {
    Controller,
    Host,
    Instance,
    Control,
    Broadcast,
}

impl AddressKind {
    /// Numeric index used when a kind is carried in a broadcast address id
    pub fn index(self) -> u32 {
        match self {
            AddressKind::Controller => 0,
            AddressKind::Host => 1,
            AddressKind::Instance => 2,
            AddressKind::Control => 3,
            AddressKind::Broadcast => 4,
        }
    }

    pub fn from_index(index: u32) -> Option<Self> {
        match index {
            0 => Some(AddressKind::Controller),
            1 => Some(AddressKind::Host),
            2 => Some(AddressKind::Instance),
            3 => Some(AddressKind::Control),
            4 => Some(AddressKind::Broadcast),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            AddressKind::Controller => "controller",
            AddressKind::Host => "host",
            AddressKind::Instance => "instance",
            AddressKind::Control => "control",
            AddressKind::Broadcast => "broadcast",
        }
    }
}

impl fmt::Display for AddressKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Identifies any protocol participant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    pub kind: AddressKind,
    pub id: u32,
}

impl Address {
    pub const fn new(kind: AddressKind, id: u32) -> Self {
        Self { kind, id }
    }

    pub const fn controller() -> Self {
        Self::new(AddressKind::Controller, 0)
    }

    pub const fn host(id: u32) -> Self {
        Self::new(AddressKind::Host, id)
    }

    pub const fn instance(id: u32) -> Self {
        Self::new(AddressKind::Instance, id)
    }

    pub const fn control(id: u32) -> Self {
        Self::new(AddressKind::Control, id)
    }

    /// Address reaching every participant of `target` kind
    pub fn broadcast(target: AddressKind) -> Self {
        Self::new(AddressKind::Broadcast, target.index())
    }

    pub fn is_broadcast(&self) -> bool {
        self.kind == AddressKind::Broadcast
    }

    /// The kind a broadcast address is aimed at, `None` for point-to-point addresses
    /// or a broadcast id that names no kind.
    pub fn broadcast_target(&self) -> Option<AddressKind> {
        if self.is_broadcast() {
            AddressKind::from_index(self.id).filter(|kind| *kind != AddressKind::Broadcast)
        } else {
            None
        }
    }

    /// Kind used for address-pair checks: the target kind for broadcasts, the own kind otherwise
    pub fn effective_kind(&self) -> AddressKind {
        self.broadcast_target().unwrap_or(self.kind)
    }

    /// Whether a message sent to `self` should be handled by the participant at `local`
    pub fn addresses(&self, local: &Address) -> bool {
        match self.broadcast_target() {
            Some(kind) => kind == local.kind,
            None => self == local,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            AddressKind::Controller => f.write_str("controller"),
            AddressKind::Broadcast => match self.broadcast_target() {
                Some(kind) => write!(f, "broadcast({kind})"),
                None => write!(f, "broadcast(#{})", self.id),
            },
            kind => write!(f, "{kind} {}", self.id),
        }
    }
}
