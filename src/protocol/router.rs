//! # Router
//!
//! Decides the next hop for messages whose destination is not the local node.
//!
//! ## Controller
//! The controller holds a directory of live host and control links:
//! 1. `broadcast` reaches every live link of the target kind except the origin (instance
//!    broadcasts go to every host, which fans them out to its instances); only events may be
//!    broadcast
//! 2. `host` is looked up by id
//! 3. `instance` is resolved to its assigned host through the [`InstanceDirectory`], then that
//!    host's link
//! 4. `control` is looked up by id
//! 5. a next hop equal to the origin is unroutable
//!
//! An unroutable request is answered with a `responseError` to the origin right away; other
//! unroutable traffic is logged and dropped.
//!
//! ## Host
//! Hosts relay between their local instance links and the controller link: local instances
//! directly, everything else through the controller.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

use crate::core::address::{Address, AddressKind};
use crate::core::message::{ApplicationData, MessageKind};
use crate::protocol::link::Link;
use crate::utils::metrics::global_metrics;
use crate::utils::rate_limiter::RateLimiter;

/// Why a message could not be routed; the text is what the requester sees
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouteError {
    #[error("host {0} is offline")]
    HostOffline(u32),

    #[error("instance {0} is not assigned to a host")]
    Unassigned(u32),

    #[error("host {host} of instance {instance} is offline")]
    InstanceHostOffline { instance: u32, host: u32 },

    #[error("instance {0} is offline")]
    InstanceOffline(u32),

    #[error("control connection {0} is offline")]
    ControlOffline(u32),

    #[error("controller is offline")]
    ControllerOffline,

    #[error("route to {0} loops back to its origin")]
    Loop(Address),

    #[error("only events may be broadcast, got {0}")]
    BroadcastNotEvent(MessageKind),

    #[error("{dst} is unreachable: {reason}")]
    Unreachable { dst: Address, reason: String },

    #[error("no route to {0}")]
    NoRoute(Address),
}

/// Next-hop resolution for messages a link received for someone else
pub trait Forwarder: Send + Sync + 'static {
    /// Deliver `message` onward; returns the number of copies sent.
    ///
    /// Unroutable requests are answered with a `responseError` on `origin` before returning.
    fn forward(
        &self,
        origin: &Link,
        kind: MessageKind,
        message: ApplicationData,
    ) -> Result<usize, RouteError>;
}

/// External registry of instance-to-host assignments
pub trait InstanceDirectory: Send + Sync + 'static {
    fn assigned_host(&self, instance: u32) -> Option<u32>;
}

/// In-memory [`InstanceDirectory`]
#[derive(Debug, Default)]
pub struct StaticInstanceDirectory {
    assignments: RwLock<HashMap<u32, u32>>,
}

impl StaticInstanceDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn assign(&self, instance: u32, host: u32) {
        self.assignments
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(instance, host);
    }

    pub fn unassign(&self, instance: u32) -> Option<u32> {
        self.assignments
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&instance)
    }
}

impl InstanceDirectory for StaticInstanceDirectory {
    fn assigned_host(&self, instance: u32) -> Option<u32> {
        self.assignments
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&instance)
            .copied()
    }
}

/// Send `message` to each target, or answer/drop it when there is none
fn deliver(
    origin: &Link,
    kind: MessageKind,
    message: &ApplicationData,
    resolved: Result<Vec<Link>, RouteError>,
) -> Result<usize, RouteError> {
    let targets = match resolved {
        Ok(targets) => targets,
        Err(e) => {
            reject(origin, kind, message, &e);
            return Err(e);
        }
    };

    let mut delivered = 0;
    let mut last_failure = None;
    for target in &targets {
        match target.forward_message(kind, message) {
            Ok(_) => delivered += 1,
            Err(e) => {
                debug!(next_hop = %target.peer(), error = %e, "Forwarding failed");
                last_failure = Some(e.to_string());
            }
        }
    }

    if delivered == 0 && !message.dst.is_broadcast() {
        let e = RouteError::Unreachable {
            dst: message.dst,
            reason: last_failure.unwrap_or_else(|| "no next hop".to_string()),
        };
        reject(origin, kind, message, &e);
        return Err(e);
    }

    global_metrics().message_forwarded(delivered as u64);
    trace!(
        name = %message.name,
        kind = %kind,
        src = %message.src,
        dst = %message.dst,
        copies = delivered,
        "Message forwarded"
    );
    Ok(delivered)
}

fn reject(origin: &Link, kind: MessageKind, message: &ApplicationData, error: &RouteError) {
    global_metrics().message_unroutable();
    if kind == MessageKind::Request {
        warn!(name = %message.name, src = %message.src, dst = %message.dst, reason = %error, "Unroutable request");
        if let Err(e) = origin.reply_error(message, error) {
            debug!(error = %e, "Could not answer unroutable request");
        }
    } else {
        warn!(name = %message.name, kind = %kind, dst = %message.dst, reason = %error, "Dropping unroutable message");
    }
}

fn check_loop(origin: &Link, dst: Address, next_hop: Link) -> Result<Vec<Link>, RouteError> {
    if next_hop.ptr_eq(origin) {
        return Err(RouteError::Loop(dst));
    }
    Ok(vec![next_hop])
}

#[derive(Default)]
struct Directory {
    hosts: HashMap<u32, Link>,
    controls: HashMap<u32, Link>,
}

/// Controller-resident router over the live host and control links
pub struct ControllerRouter {
    directory: RwLock<Directory>,
    instances: Arc<dyn InstanceDirectory>,
    on_change: Mutex<Option<RateLimiter>>,
}

impl ControllerRouter {
    pub fn new(instances: Arc<dyn InstanceDirectory>) -> Arc<Self> {
        Arc::new(Self {
            directory: RwLock::new(Directory::default()),
            instances,
            on_change: Mutex::new(None),
        })
    }

    /// Call `callback` after directory changes, at most `max_rate` times per second
    pub fn on_directory_change<F>(&self, max_rate: f64, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.on_change.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(RateLimiter::new(max_rate, callback));
    }

    /// Add a host or control link; returns the link it replaced.
    ///
    /// The link is removed again once its connector closes.
    pub fn register(self: &Arc<Self>, link: Link) -> Option<Link> {
        let peer = link.peer();
        let previous = {
            let mut directory = self.write();
            match peer.kind {
                AddressKind::Host => directory.hosts.insert(peer.id, link.clone()),
                AddressKind::Control => directory.controls.insert(peer.id, link.clone()),
                other => {
                    error!(peer = %peer, kind = %other, "Cannot register link of this kind");
                    return None;
                }
            }
        };
        info!(peer = %peer, replaced = previous.is_some(), "Link registered");
        self.notify();

        let router = Arc::downgrade(self);
        tokio::spawn(async move {
            link.closed().await;
            if let Some(router) = router.upgrade() {
                router.unregister(&link);
            }
        });
        previous
    }

    /// Remove `link` if it is still the registered link of its address
    pub fn unregister(&self, link: &Link) -> bool {
        let peer = link.peer();
        let removed = {
            let mut directory = self.write();
            let map = match peer.kind {
                AddressKind::Host => &mut directory.hosts,
                AddressKind::Control => &mut directory.controls,
                _ => return false,
            };
            if map.get(&peer.id).is_some_and(|current| current.ptr_eq(link)) {
                map.remove(&peer.id);
                true
            } else {
                false
            }
        };
        if removed {
            info!(peer = %peer, "Link unregistered");
            self.notify();
        }
        removed
    }

    pub fn host(&self, id: u32) -> Option<Link> {
        self.read().hosts.get(&id).cloned()
    }

    pub fn control(&self, id: u32) -> Option<Link> {
        self.read().controls.get(&id).cloned()
    }

    pub fn host_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.read().hosts.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn control_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.read().controls.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Every registered link
    pub fn links(&self) -> Vec<Link> {
        let directory = self.read();
        directory
            .hosts
            .values()
            .chain(directory.controls.values())
            .cloned()
            .collect()
    }

    /// Resolve the next hops of `dst` for traffic arriving on `origin`
    pub fn resolve(
        &self,
        origin: &Link,
        kind: MessageKind,
        dst: &Address,
    ) -> Result<Vec<Link>, RouteError> {
        let directory = self.read();
        if dst.is_broadcast() {
            if kind != MessageKind::Event {
                error!(kind = %kind, dst = %dst, "Non-event broadcast reached the router");
                return Err(RouteError::BroadcastNotEvent(kind));
            }
            let targets = match dst.broadcast_target() {
                Some(AddressKind::Host) | Some(AddressKind::Instance) => &directory.hosts,
                Some(AddressKind::Control) => &directory.controls,
                _ => return Err(RouteError::NoRoute(*dst)),
            };
            return Ok(targets
                .values()
                .filter(|link| !link.ptr_eq(origin))
                .cloned()
                .collect());
        }

        let next_hop = match dst.kind {
            AddressKind::Host => directory
                .hosts
                .get(&dst.id)
                .cloned()
                .ok_or(RouteError::HostOffline(dst.id))?,
            AddressKind::Instance => {
                let host = self
                    .instances
                    .assigned_host(dst.id)
                    .ok_or(RouteError::Unassigned(dst.id))?;
                directory
                    .hosts
                    .get(&host)
                    .cloned()
                    .ok_or(RouteError::InstanceHostOffline {
                        instance: dst.id,
                        host,
                    })?
            }
            AddressKind::Control => directory
                .controls
                .get(&dst.id)
                .cloned()
                .ok_or(RouteError::ControlOffline(dst.id))?,
            AddressKind::Controller | AddressKind::Broadcast => {
                return Err(RouteError::NoRoute(*dst))
            }
        };
        check_loop(origin, *dst, next_hop)
    }

    fn notify(&self) {
        if let Some(limiter) = self
            .on_change
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            limiter.activate();
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Directory> {
        self.directory.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Directory> {
        self.directory
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Forwarder for ControllerRouter {
    fn forward(
        &self,
        origin: &Link,
        kind: MessageKind,
        message: ApplicationData,
    ) -> Result<usize, RouteError> {
        let resolved = self.resolve(origin, kind, &message.dst);
        deliver(origin, kind, &message, resolved)
    }
}

/// Host-resident router relaying between local instances and the controller
pub struct HostRouter {
    controller: RwLock<Option<Link>>,
    instances: RwLock<HashMap<u32, Link>>,
}

impl HostRouter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            controller: RwLock::new(None),
            instances: RwLock::new(HashMap::new()),
        })
    }

    pub fn set_controller(&self, link: Link) {
        *self
            .controller
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(link);
    }

    /// Forget the controller link if it is still `link`
    pub fn clear_controller(&self, link: &Link) -> bool {
        let mut controller = self
            .controller
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if controller.as_ref().is_some_and(|current| current.ptr_eq(link)) {
            *controller = None;
            true
        } else {
            false
        }
    }

    pub fn controller(&self) -> Option<Link> {
        self.controller
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Add a local instance link; returns the link it replaced
    pub fn register_instance(self: &Arc<Self>, link: Link) -> Option<Link> {
        let peer = link.peer();
        if peer.kind != AddressKind::Instance {
            error!(peer = %peer, "Only instance links can be registered on a host");
            return None;
        }
        let previous = self
            .instances
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(peer.id, link.clone());
        info!(peer = %peer, replaced = previous.is_some(), "Instance link registered");

        let router = Arc::downgrade(self);
        tokio::spawn(async move {
            link.closed().await;
            if let Some(router) = router.upgrade() {
                router.unregister_instance(&link);
            }
        });
        previous
    }

    pub fn unregister_instance(&self, link: &Link) -> bool {
        let peer = link.peer();
        let mut instances = self
            .instances
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if instances
            .get(&peer.id)
            .is_some_and(|current| current.ptr_eq(link))
        {
            instances.remove(&peer.id);
            info!(peer = %peer, "Instance link unregistered");
            true
        } else {
            false
        }
    }

    pub fn instance(&self, id: u32) -> Option<Link> {
        self.instances
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    pub fn instance_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self
            .instances
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn resolve(
        &self,
        origin: &Link,
        kind: MessageKind,
        dst: &Address,
    ) -> Result<Vec<Link>, RouteError> {
        let controller = self.controller();
        let from_controller = controller
            .as_ref()
            .is_some_and(|link| link.ptr_eq(origin));

        if dst.is_broadcast() {
            if kind != MessageKind::Event {
                error!(kind = %kind, dst = %dst, "Non-event broadcast reached the router");
                return Err(RouteError::BroadcastNotEvent(kind));
            }
            let mut targets = Vec::new();
            if dst.broadcast_target() == Some(AddressKind::Instance) {
                targets.extend(
                    self.instances
                        .read()
                        .unwrap_or_else(PoisonError::into_inner)
                        .values()
                        .filter(|link| !link.ptr_eq(origin))
                        .cloned(),
                );
            }
            if !from_controller {
                targets.extend(controller);
            }
            return Ok(targets);
        }

        if dst.kind == AddressKind::Instance {
            if let Some(local) = self.instance(dst.id) {
                return check_loop(origin, *dst, local);
            }
            if from_controller {
                return Err(RouteError::InstanceOffline(dst.id));
            }
        }

        let controller = controller.ok_or(RouteError::ControllerOffline)?;
        check_loop(origin, *dst, controller)
    }
}

impl Forwarder for HostRouter {
    fn forward(
        &self,
        origin: &Link,
        kind: MessageKind,
        message: ApplicationData,
    ) -> Result<usize, RouteError> {
        let resolved = self.resolve(origin, kind, &message.dst);
        deliver(origin, kind, &message, resolved)
    }
}

/// Keep the same router alive while links only hold weak references to it
pub fn weak_forwarder<F: Forwarder>(router: &Arc<F>) -> Weak<dyn Forwarder> {
    let forwarder: Arc<dyn Forwarder> = router.clone();
    Arc::downgrade(&forwarder)
}
