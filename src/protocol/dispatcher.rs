use futures::future::{self, BoxFuture, FutureExt};
use serde_json::Value;
use std::borrow::Cow;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};

use crate::core::address::Address;
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::link::Link;
use crate::protocol::registry::{Event, PrepareDisconnect, Request};

pub type HandlerFuture = BoxFuture<'static, Result<Value>>;
type HandlerFn = dyn Fn(Value, MessageContext) -> HandlerFuture + Send + Sync + 'static;

/// Where a dispatched message came from
#[derive(Clone)]
pub struct MessageContext {
    pub src: Address,
    pub dst: Address,
    /// Link the message arrived on
    pub link: Link,
}

impl std::fmt::Debug for MessageContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageContext")
            .field("src", &self.src)
            .field("dst", &self.dst)
            .field("peer", &self.link.peer())
            .finish()
    }
}

/// Handler table shared by the links of a node, keyed by message class name.
/// Static class names are stored borrowed.
pub struct Dispatcher {
    handlers: Arc<RwLock<HashMap<Cow<'static, str>, Arc<HandlerFn>>>>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    /// Dispatcher with the built-in handlers installed
    pub fn new() -> Self {
        let dispatcher = Self {
            handlers: Arc::new(RwLock::new(HashMap::new())),
        };
        dispatcher.insert(
            Cow::Borrowed(PrepareDisconnect::NAME),
            Arc::new(|_: Value, context: MessageContext| -> HandlerFuture {
                context.link.connector().set_closing();
                future::ready(Ok(Value::Null)).boxed()
            }),
        );
        dispatcher
    }

    /// Register an untyped handler for `name`
    pub fn register<F, Fut>(&self, name: &str, handler: F) -> Result<()>
    where
        F: Fn(Value, MessageContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let mut handlers = self.handlers.write().map_err(|_| {
            ProtocolError::Custom(constants::ERR_DISPATCHER_WRITE_LOCK.to_string())
        })?;

        handlers.insert(
            Cow::Owned(name.to_string()),
            Arc::new(move |data: Value, context: MessageContext| -> HandlerFuture {
                handler(data, context).boxed()
            }),
        );
        Ok(())
    }

    /// Register the handler answering requests of class `T`
    pub fn on_request<T, F, Fut>(&self, handler: F) -> Result<()>
    where
        T: Request,
        F: Fn(T, MessageContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T::Response>> + Send + 'static,
    {
        let erased = move |data: Value, context: MessageContext| -> HandlerFuture {
            let request = match serde_json::from_value::<T>(data) {
                Ok(request) => request,
                Err(e) => {
                    return future::ready(Err(ProtocolError::SchemaViolation(format!(
                        "{}: {e}",
                        T::NAME
                    ))))
                    .boxed()
                }
            };
            let pending = handler(request, context);
            async move {
                let response = pending.await?;
                Ok::<_, ProtocolError>(serde_json::to_value(response)?)
            }
            .boxed()
        };
        self.insert_checked(Cow::Borrowed(T::NAME), Arc::new(erased))
    }

    /// Register the handler receiving events of class `T`
    pub fn on_event<T, F, Fut>(&self, handler: F) -> Result<()>
    where
        T: Event,
        F: Fn(T, MessageContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let erased = move |data: Value, context: MessageContext| -> HandlerFuture {
            let event = match serde_json::from_value::<T>(data) {
                Ok(event) => event,
                Err(e) => {
                    return future::ready(Err(ProtocolError::SchemaViolation(format!(
                        "{}: {e}",
                        T::NAME
                    ))))
                    .boxed()
                }
            };
            let pending = handler(event, context);
            async move {
                pending.await?;
                Ok::<_, ProtocolError>(Value::Null)
            }
            .boxed()
        };
        self.insert_checked(Cow::Borrowed(T::NAME), Arc::new(erased))
    }

    pub fn has_handler(&self, name: &str) -> bool {
        self.handlers
            .read()
            .map(|handlers| handlers.contains_key(name))
            .unwrap_or(false)
    }

    /// Start the handler for `name`
    pub fn dispatch(&self, name: &str, data: Value, context: MessageContext) -> Result<HandlerFuture> {
        let handler = {
            let handlers = self.handlers.read().map_err(|_| {
                ProtocolError::Custom(constants::ERR_DISPATCHER_READ_LOCK.to_string())
            })?;
            handlers
                .get(name)
                .cloned()
                .ok_or_else(|| ProtocolError::UnknownMessage(name.to_string()))?
        };
        Ok(handler(data, context))
    }

    fn insert_checked(&self, name: Cow<'static, str>, handler: Arc<HandlerFn>) -> Result<()> {
        let mut handlers = self.handlers.write().map_err(|_| {
            ProtocolError::Custom(constants::ERR_DISPATCHER_WRITE_LOCK.to_string())
        })?;
        handlers.insert(name, handler);
        Ok(())
    }

    fn insert(&self, name: Cow<'static, str>, handler: Arc<HandlerFn>) {
        if let Ok(mut handlers) = self.handlers.write() {
            handlers.insert(name, handler);
        }
    }
}
