//! # Message Classes
//!
//! Every application message names a registered class. A class declares whether it is a
//! request or an event, which `(src.kind, dst.kind)` pairs may carry it, an optional namespace
//! and required permission, and the schema of its `data` (the serde shape of the Rust type plus
//! an optional `validate()` hook).
//!
//! Responses reuse their request's class with the pair reversed. Broadcasts are only legal for
//! events and are checked against the kind being broadcast to.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

use crate::core::address::{Address, AddressKind};
use crate::core::message::MessageKind;
use crate::error::{ProtocolError, Result};

/// Legal `(src.kind, dst.kind)` combination of a message class
pub type AddressPair = (AddressKind, AddressKind);

/// A request class and the response it is answered with
pub trait Request: Serialize + DeserializeOwned + Send + Sync + 'static {
    const NAME: &'static str;
    const NAMESPACE: Option<&'static str> = None;
    const PAIRS: &'static [AddressPair];
    /// Permission a control connection needs to send this request
    const PERMISSION: Option<&'static str> = None;

    type Response: Serialize + DeserializeOwned + Send + 'static;

    /// Checks beyond the serde shape
    fn validate(&self) -> Result<()> {
        Ok(())
    }
}

/// A fire-and-forget event class
pub trait Event: Serialize + DeserializeOwned + Send + Sync + 'static {
    const NAME: &'static str;
    const NAMESPACE: Option<&'static str> = None;
    const PAIRS: &'static [AddressPair];
    const PERMISSION: Option<&'static str> = None;

    fn validate(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassKind {
    Request,
    Event,
}

/// Type-erased description of one message class
#[derive(Clone)]
pub struct MessageClass {
    pub name: &'static str,
    pub kind: ClassKind,
    pub pairs: &'static [AddressPair],
    pub namespace: Option<&'static str>,
    pub permission: Option<&'static str>,
    validate: fn(&Value) -> Result<()>,
}

impl MessageClass {
    pub fn request<T: Request>() -> Self {
        Self {
            name: T::NAME,
            kind: ClassKind::Request,
            pairs: T::PAIRS,
            namespace: T::NAMESPACE,
            permission: T::PERMISSION,
            validate: validate_request::<T>,
        }
    }

    pub fn event<T: Event>() -> Self {
        Self {
            name: T::NAME,
            kind: ClassKind::Event,
            pairs: T::PAIRS,
            namespace: T::NAMESPACE,
            permission: T::PERMISSION,
            validate: validate_event::<T>,
        }
    }

    /// Check a request or event payload against the class schema
    pub fn validate(&self, data: &Value) -> Result<()> {
        (self.validate)(data)
    }

    /// Whether `kind` traffic of this class may travel from `src` to `dst`
    pub fn allows(&self, kind: MessageKind, src: &Address, dst: &Address) -> bool {
        let expected = match (self.kind, kind) {
            (ClassKind::Request, MessageKind::Request) | (ClassKind::Event, MessageKind::Event) => {
                if dst.is_broadcast()
                    && (self.kind != ClassKind::Event || dst.broadcast_target().is_none())
                {
                    return false;
                }
                (src.kind, dst.effective_kind())
            }
            (ClassKind::Request, MessageKind::Response | MessageKind::ResponseError) => {
                if dst.is_broadcast() || src.is_broadcast() {
                    return false;
                }
                (dst.kind, src.kind)
            }
            _ => return false,
        };
        self.pairs.contains(&expected)
    }

    /// Message kind this class travels as when initiated
    pub fn message_kind(&self) -> MessageKind {
        match self.kind {
            ClassKind::Request => MessageKind::Request,
            ClassKind::Event => MessageKind::Event,
        }
    }

    /// `namespace:name`, or the bare name without a namespace
    pub fn qualified_name(&self) -> String {
        match self.namespace {
            Some(namespace) => format!("{namespace}:{}", self.name),
            None => self.name.to_string(),
        }
    }
}

impl fmt::Debug for MessageClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageClass")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("pairs", &self.pairs)
            .field("namespace", &self.namespace)
            .field("permission", &self.permission)
            .finish()
    }
}

fn validate_request<T: Request>(data: &Value) -> Result<()> {
    let request = T::deserialize(data)
        .map_err(|e| ProtocolError::SchemaViolation(format!("{}: {e}", T::NAME)))?;
    request.validate()
}

fn validate_event<T: Event>(data: &Value) -> Result<()> {
    let event = T::deserialize(data)
        .map_err(|e| ProtocolError::SchemaViolation(format!("{}: {e}", T::NAME)))?;
    event.validate()
}

/// Ask the peer to expect the connection to close rather than resume
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrepareDisconnect {}

impl Request for PrepareDisconnect {
    const NAME: &'static str = "prepare_disconnect";
    const PAIRS: &'static [AddressPair] = &[
        (AddressKind::Controller, AddressKind::Host),
        (AddressKind::Host, AddressKind::Controller),
        (AddressKind::Controller, AddressKind::Control),
        (AddressKind::Control, AddressKind::Controller),
        (AddressKind::Host, AddressKind::Instance),
        (AddressKind::Instance, AddressKind::Host),
    ];
    type Response = ();
}

/// Message classes known to a node, keyed by name
#[derive(Debug, Clone)]
pub struct MessageRegistry {
    classes: HashMap<&'static str, MessageClass>,
}

impl Default for MessageRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageRegistry {
    /// Registry holding the built-in classes
    pub fn new() -> Self {
        let mut registry = Self {
            classes: HashMap::new(),
        };
        registry.register(MessageClass::request::<PrepareDisconnect>());
        registry
    }

    pub fn with_request<T: Request>(mut self) -> Self {
        self.register(MessageClass::request::<T>());
        self
    }

    pub fn with_event<T: Event>(mut self) -> Self {
        self.register(MessageClass::event::<T>());
        self
    }

    /// Add a class, replacing any class of the same name
    pub fn register(&mut self, class: MessageClass) -> &mut Self {
        self.classes.insert(class.name, class);
        self
    }

    pub fn get(&self, name: &str) -> Option<&MessageClass> {
        self.classes.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.classes.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.classes.keys().copied()
    }
}
