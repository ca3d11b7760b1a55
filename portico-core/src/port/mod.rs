//! Ports: the typed endpoints through which components call each other.
//!
//! Every port belongs to exactly one component and exposes exactly one
//! interface. Three kinds exist:
//!
//! - [`OutboundPort`]: the required side. It initiates connections and
//!   issues calls.
//! - [`InboundPort`]: the offered side. It never initiates anything; its
//!   connectors attach clients to it and deliver calls to it.
//! - [`TwoWayPort`]: a symmetric peer. Either end may call the other once
//!   connected, and the initiator negotiates the connection on both ends.
//!
//! # Connection protocol
//!
//! A port must be published before it can be connected. `do_connection`
//! on the initiating side resolves the peer URI (locally first, then in the
//! distributed registry), lets the connector establish its channel and
//! records the connection. Connection setup is all-or-nothing: when any
//! step fails the port is left unconnected. Disconnection returns a port to
//! the published state.
use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
};

use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::{
    component::{Component, WeakComponent},
    connector::ConnectorSpec,
    context::RuntimeContext,
    executor::PoolRef,
    interface::{decode_reply, Call, InterfaceId},
    registry::Registry,
    Error, Result,
};

mod inbound;
mod outbound;
mod two_way;

pub use inbound::InboundPort;
pub use outbound::OutboundPort;
pub use two_way::{TwoWayPort, TwoWayRole};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortKind {
    Outbound,
    Inbound,
    TwoWay,
}

/// The face a port shows to connectors and registries.
///
/// Remote references implement it too, which is how a connection crosses a
/// host boundary without the port knowing.
pub trait PortEndpoint: Send + Sync {
    fn uri(&self) -> &str;
    fn interface(&self) -> &InterfaceId;
    fn kind(&self) -> PortKind;

    /// Whether calls on this endpoint leave the current host.
    fn is_remote(&self) -> bool {
        false
    }

    /// Serves a call on the owning component and returns its reply.
    fn deliver(&self, call: Call) -> Result<Value>;
    /// Serves a call on the owning component without waiting for it.
    fn deliver_async(&self, call: Call) -> Result<()>;

    /// Responding side of a symmetric connection initiated by `peer_uri`.
    fn obey_connection(&self, peer_uri: &str, connector: ConnectorSpec) -> Result<()>;
    /// Responding side of a symmetric disconnection.
    fn obey_disconnection(&self) -> Result<()>;

    fn attach_client(&self, client_uri: &str) -> Result<()>;
    fn detach_client(&self, client_uri: &str) -> Result<()>;
}

/// Publication and connection state shared by every port kind.
pub trait Port: Send + Sync {
    fn uri(&self) -> &str;
    fn interface(&self) -> &InterfaceId;
    fn kind(&self) -> PortKind;
    fn owner(&self) -> Result<Component>;
    fn owner_uri(&self) -> &str;
    fn is_published(&self) -> bool;
    fn is_distributedly_published(&self) -> bool;
    fn publish(&self) -> Result<()>;
    /// Fails while the port is connected.
    fn unpublish(&self) -> Result<()>;
    fn connected(&self) -> bool;
    fn is_remotely_connected(&self) -> bool;
    fn is_destroyed(&self) -> bool;
}

/// Ports that can initiate connections.
pub trait Connectable: Port {
    fn do_connection(&self, peer_uri: &str, connector: ConnectorSpec) -> Result<()>;
    fn do_disconnection(&self) -> Result<()>;
    fn server_port_uri(&self) -> Option<String>;
    fn client_port_uri(&self) -> Option<String>;
}

/// Ports that issue calls to their peer.
pub trait RequestRelay: Port {
    fn call(&self, call: Call) -> Result<Value>;
    fn call_async(&self, call: Call) -> Result<()>;

    /// Typed convenience over [`RequestRelay::call`].
    fn call_with<A, R>(&self, operation: &str, args: &A) -> Result<R>
    where
        Self: Sized,
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let call = Call::with_args(operation, args).map_err(Error::Execution)?;
        decode_reply(self.call(call)?)
    }
}

/// `<interface>-<random token>`, the URI given to ports created without one.
pub fn generate_port_uri(interface: &InterfaceId) -> String {
    format!("{interface}-{:016x}", rand::random::<u64>())
}

/// A port as stored by its owner.
#[derive(Clone)]
pub enum PortHandle {
    Outbound(Arc<OutboundPort>),
    Inbound(Arc<InboundPort>),
    TwoWay(Arc<TwoWayPort>),
}

impl PortHandle {
    pub fn port(&self) -> &dyn Port {
        match self {
            PortHandle::Outbound(p) => p.as_ref(),
            PortHandle::Inbound(p) => p.as_ref(),
            PortHandle::TwoWay(p) => p.as_ref(),
        }
    }

    /// `None` for inbound ports, which never initiate connections.
    pub fn connectable(&self) -> Option<&dyn Connectable> {
        match self {
            PortHandle::Outbound(p) => Some(p.as_ref()),
            PortHandle::Inbound(_) => None,
            PortHandle::TwoWay(p) => Some(p.as_ref()),
        }
    }

    pub fn as_outbound(&self) -> Option<&Arc<OutboundPort>> {
        match self {
            PortHandle::Outbound(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_inbound(&self) -> Option<&Arc<InboundPort>> {
        match self {
            PortHandle::Inbound(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_two_way(&self) -> Option<&Arc<TwoWayPort>> {
        match self {
            PortHandle::TwoWay(p) => Some(p),
            _ => None,
        }
    }

    fn core(&self) -> &PortCore {
        match self {
            PortHandle::Outbound(p) => &p.core,
            PortHandle::Inbound(p) => &p.core,
            PortHandle::TwoWay(p) => &p.core,
        }
    }

    /// Tears a port down unconditionally, used when its owner shuts down.
    pub(crate) fn dismantle(&self) {
        let port = self.port();
        let uri = port.uri();
        let disconnected = match self {
            PortHandle::Inbound(p) => {
                p.detach_all();
                Ok(())
            }
            _ if !port.connected() => Ok(()),
            _ => self
                .connectable()
                .map_or(Ok(()), |c| c.do_disconnection()),
        };
        if let Err(e) = disconnected {
            tracing::warn!("port {uri}: disconnection during teardown failed: {e}");
        }
        if port.is_published() {
            if let Err(e) = self.core().unpublish() {
                tracing::warn!("port {uri}: unpublication during teardown failed: {e}");
            }
        }
        self.core().destroy();
    }

    pub(crate) fn destroy(&self) {
        self.core().destroy();
    }
}

impl fmt::Debug for PortHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let port = self.port();
        f.debug_struct("Port")
            .field("uri", &port.uri())
            .field("interface", port.interface())
            .field("kind", &port.kind())
            .field("published", &port.is_published())
            .field("connected", &port.connected())
            .finish()
    }
}

#[derive(Default)]
struct Publication {
    local: bool,
    distributed: bool,
}

/// State and behaviour shared by the three port kinds.
pub(crate) struct PortCore {
    uri: String,
    interface: InterfaceId,
    kind: PortKind,
    owner: WeakComponent,
    owner_uri: String,
    context: Arc<RuntimeContext>,
    this: Weak<dyn PortEndpoint>,
    pool: PoolRef,
    publication: Mutex<Publication>,
    destroyed: AtomicBool,
}

impl PortCore {
    pub(crate) fn new(
        owner: &Component,
        uri: String,
        interface: InterfaceId,
        kind: PortKind,
        pool: PoolRef,
        this: Weak<dyn PortEndpoint>,
    ) -> Self {
        Self {
            uri,
            interface,
            kind,
            owner: owner.downgrade(),
            owner_uri: owner.uri().to_string(),
            context: owner.context().clone(),
            this,
            pool,
            publication: Mutex::new(Publication::default()),
            destroyed: AtomicBool::new(false),
        }
    }

    pub(crate) fn uri(&self) -> &str {
        &self.uri
    }

    pub(crate) fn interface(&self) -> &InterfaceId {
        &self.interface
    }

    pub(crate) fn kind(&self) -> PortKind {
        self.kind
    }

    pub(crate) fn owner_uri(&self) -> &str {
        &self.owner_uri
    }

    pub(crate) fn context(&self) -> &Arc<RuntimeContext> {
        &self.context
    }

    pub(crate) fn owner(&self) -> Result<Component> {
        self.owner
            .upgrade()
            .ok_or_else(|| contract_violation!("port {} outlived its owner", self.uri))
    }

    pub(crate) fn endpoint(&self) -> Result<Arc<dyn PortEndpoint>> {
        self.this
            .upgrade()
            .ok_or_else(|| contract_violation!("port {} is being dropped", self.uri))
    }

    pub(crate) fn ensure_alive(&self) -> Result<()> {
        ensure_contract!(!self.is_destroyed(), "port {} is destroyed", self.uri);
        Ok(())
    }

    pub(crate) fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    pub(crate) fn destroy(&self) {
        self.destroyed.store(true, Ordering::Release);
    }

    pub(crate) fn is_published(&self) -> bool {
        self.publication.lock().local
    }

    pub(crate) fn is_distributedly_published(&self) -> bool {
        self.publication.lock().distributed
    }

    pub(crate) fn ensure_published(&self) -> Result<()> {
        ensure_contract!(self.is_published(), "port {} is not published", self.uri);
        Ok(())
    }

    pub(crate) fn publish(&self) -> Result<()> {
        self.ensure_alive()?;
        let mut publication = self.publication.lock();
        ensure_contract!(!publication.local, "port {} is already published", self.uri);
        let endpoint = self.endpoint()?;
        let local = self.context.local_registry();
        local.publish(&self.uri, endpoint.clone())?;
        if let Some(registry) = self.context.distributed_registry() {
            if let Err(e) = registry.publish(&self.uri, endpoint) {
                let _ = local.unpublish(&self.uri);
                return Err(e);
            }
            publication.distributed = true;
        }
        publication.local = true;
        info!(
            "port {} published{}",
            self.uri,
            if publication.distributed {
                " (distributed)"
            } else {
                ""
            }
        );
        Ok(())
    }

    pub(crate) fn unpublish(&self) -> Result<()> {
        let mut publication = self.publication.lock();
        ensure_contract!(publication.local, "port {} is not published", self.uri);
        let was_distributed = publication.distributed;
        *publication = Publication::default();
        self.context.local_registry().unpublish(&self.uri)?;
        if was_distributed {
            if let Some(registry) = self.context.distributed_registry() {
                registry.unpublish(&self.uri)?;
            }
        }
        info!("port {} unpublished", self.uri);
        Ok(())
    }

    /// Serves a call arriving on this port on the owner's pool.
    pub(crate) fn serve(&self, call: Call) -> Result<Value> {
        self.ensure_alive()?;
        self.owner()?.serve_call(&self.pool, &self.interface, call)
    }

    pub(crate) fn serve_async(&self, call: Call) -> Result<()> {
        self.ensure_alive()?;
        self.owner()?
            .serve_call_async(&self.pool, &self.interface, call)
    }

    /// Checks that a resolved peer is usable for a connection from this port.
    pub(crate) fn check_peer(&self, peer: &dyn PortEndpoint, expected: PortKind) -> Result<()> {
        ensure_contract!(
            peer.kind() == expected,
            "port {} cannot connect to {}: expected a {:?} port, found {:?}",
            self.uri,
            peer.uri(),
            expected,
            peer.kind()
        );
        ensure_contract!(
            peer.interface() == &self.interface,
            "port {} ({}) cannot connect to {} ({})",
            self.uri,
            self.interface,
            peer.uri(),
            peer.interface()
        );
        Ok(())
    }
}

/// Expands to the [`Port`] methods every kind delegates to its [`PortCore`].
macro_rules! delegate_to_core {
    () => {
        fn uri(&self) -> &str {
            self.core.uri()
        }

        fn interface(&self) -> &$crate::interface::InterfaceId {
            self.core.interface()
        }

        fn kind(&self) -> $crate::port::PortKind {
            self.core.kind()
        }

        fn owner(&self) -> $crate::Result<$crate::component::Component> {
            self.core.owner()
        }

        fn owner_uri(&self) -> &str {
            self.core.owner_uri()
        }

        fn is_published(&self) -> bool {
            self.core.is_published()
        }

        fn is_distributedly_published(&self) -> bool {
            self.core.is_distributedly_published()
        }

        fn publish(&self) -> $crate::Result<()> {
            self.core.publish()
        }

        fn is_destroyed(&self) -> bool {
            self.core.is_destroyed()
        }
    };
}
pub(crate) use delegate_to_core;

/// Builds a port of any kind and registers it with its owner.
pub(crate) fn create<P, F>(
    owner: &Component,
    uri: Option<String>,
    interface: InterfaceId,
    kind: PortKind,
    pool: PoolRef,
    build: F,
    wrap: fn(Arc<P>) -> PortHandle,
) -> Result<Arc<P>>
where
    P: PortEndpoint + 'static,
    F: FnOnce(PortCore) -> P,
{
    owner.check_port_creation(&interface, kind, &pool)?;
    let uri = uri.unwrap_or_else(|| generate_port_uri(&interface));
    let port = Arc::new_cyclic(|weak: &Weak<P>| {
        let this: Weak<dyn PortEndpoint> = weak.clone();
        build(PortCore::new(owner, uri, interface, kind, pool, this))
    });
    owner.register_port(wrap(port.clone()))?;
    Ok(port)
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{mpsc, Barrier},
        thread,
        time::Duration,
    };

    use serde_json::json;

    use super::*;
    use crate::service::service_fn;

    const ECHO: &str = "demo.Echo";

    fn context() -> Arc<RuntimeContext> {
        RuntimeContext::builder().build().unwrap()
    }

    fn server(context: &Arc<RuntimeContext>, uri: &str) -> Component {
        let component = Component::builder(context)
            .uri(uri)
            .offers(
                ECHO,
                service_fn(|owner, call| {
                    Ok(json!({"by": owner.uri(), "op": call.operation, "args": call.args}))
                }),
            )
            .build()
            .unwrap();
        component.start().unwrap();
        component
    }

    fn client(context: &Arc<RuntimeContext>, uri: &str) -> Component {
        let component = Component::builder(context)
            .uri(uri)
            .requires(ECHO)
            .build()
            .unwrap();
        component.start().unwrap();
        component
    }

    #[test]
    fn test_one_way_connection_lifecycle() {
        let context = context();
        let server = server(&context, "server");
        let client = client(&context, "client");
        let inbound = InboundPort::create_with_uri(&server, "echo-in", ECHO).unwrap();
        let outbound = OutboundPort::create(&client, ECHO).unwrap();
        assert!(outbound.uri().starts_with("demo.Echo-"));
        inbound.publish().unwrap();
        outbound.publish().unwrap();

        outbound.do_connection("echo-in", "basic".into()).unwrap();
        assert!(outbound.connected());
        assert!(!outbound.is_remotely_connected());
        assert_eq!(Some("echo-in".to_string()), outbound.server_port_uri());
        assert_eq!(Some(outbound.uri().to_string()), outbound.client_port_uri());
        assert!(inbound.connected());
        assert_eq!(vec![outbound.uri().to_string()], inbound.client_uris());

        let reply = outbound
            .call(Call::with_args("ping", &[1, 2]).unwrap())
            .unwrap();
        assert_eq!(json!({"by": "server", "op": "ping", "args": [1, 2]}), reply);

        outbound.do_disconnection().unwrap();
        assert!(!outbound.connected());
        assert!(outbound.is_published());
        assert!(!inbound.connected());
        assert!(outbound
            .call(Call::new("ping"))
            .unwrap_err()
            .is_contract_violation());
    }

    #[test]
    fn test_connection_preconditions() {
        let context = context();
        let server = server(&context, "server");
        let client = client(&context, "client");
        let inbound = InboundPort::create_with_uri(&server, "echo-in", ECHO).unwrap();
        let outbound = OutboundPort::create(&client, ECHO).unwrap();

        // not published yet
        let err = outbound.do_connection("echo-in", "basic".into()).unwrap_err();
        assert!(err.is_contract_violation());
        outbound.publish().unwrap();
        assert!(outbound.publish().unwrap_err().is_contract_violation());

        // the server port is not published, hence unknown
        let err = outbound.do_connection("echo-in", "basic".into()).unwrap_err();
        assert!(matches!(err, Error::Unresolved(_)));
        assert!(!outbound.connected());

        inbound.publish().unwrap();
        let err = outbound
            .do_connection("echo-in", "two-way".into())
            .unwrap_err();
        assert!(err.is_contract_violation());
        assert!(!inbound.connected());

        outbound.do_connection("echo-in", "basic".into()).unwrap();
        let err = outbound.do_connection("echo-in", "basic".into()).unwrap_err();
        assert!(err.is_contract_violation());

        // connected ports stay published
        assert!(outbound.unpublish().unwrap_err().is_contract_violation());
        assert!(inbound.unpublish().unwrap_err().is_contract_violation());
        assert!(server
            .destroy_port("echo-in")
            .unwrap_err()
            .is_contract_violation());
        assert!(inbound
            .obey_connection(outbound.uri(), "basic".into())
            .unwrap_err()
            .is_contract_violation());

        outbound.do_disconnection().unwrap();
        assert!(outbound
            .do_disconnection()
            .unwrap_err()
            .is_contract_violation());
        inbound.unpublish().unwrap();
        server.destroy_port("echo-in").unwrap();
        assert!(inbound.is_destroyed());
        assert!(!server.is_port_existing("echo-in").unwrap());
    }

    #[test]
    fn test_interfaces_must_match() {
        let context = context();
        let server = server(&context, "server");
        let client = Component::builder(&context)
            .uri("client")
            .requires("demo.Other")
            .build()
            .unwrap();
        let inbound = InboundPort::create_with_uri(&server, "echo-in", ECHO).unwrap();
        let outbound = OutboundPort::create(&client, "demo.Other").unwrap();
        inbound.publish().unwrap();
        outbound.publish().unwrap();
        let err = outbound.do_connection("echo-in", "basic".into()).unwrap_err();
        assert!(err.is_contract_violation());
        assert!(!inbound.connected());

        // the interface has to be declared on the matching side
        assert!(InboundPort::create(&client, "demo.Other")
            .err()
            .unwrap()
            .is_contract_violation());
        assert!(OutboundPort::create(&server, ECHO)
            .err()
            .unwrap()
            .is_contract_violation());
    }

    #[test]
    fn test_two_way_roles_agree_and_calls_flow_both_ways() {
        let context = context();
        let left = server(&context, "left");
        let right = server(&context, "right");
        let a = TwoWayPort::create_with_uri(&left, "peer-a", ECHO).unwrap();
        let b = TwoWayPort::create_with_uri(&right, "peer-b", ECHO).unwrap();
        a.publish().unwrap();
        b.publish().unwrap();

        a.do_connection("peer-b", "two-way".into()).unwrap();
        assert!(a.connected() && b.connected());
        assert_eq!(Some(TwoWayRole::Client), a.role());
        assert_eq!(Some(TwoWayRole::Server), b.role());
        for port in [&a, &b] {
            assert_eq!(Some("peer-a".to_string()), port.client_port_uri());
            assert_eq!(Some("peer-b".to_string()), port.server_port_uri());
        }

        assert_eq!(json!("right"), a.call(Call::new("hello")).unwrap()["by"]);
        assert_eq!(json!("left"), b.call(Call::new("hello")).unwrap()["by"]);

        // the server end may tear the connection down as well
        b.do_disconnection().unwrap();
        assert!(!a.connected() && !b.connected());
        assert!(a.is_published() && b.is_published());
        assert!(a.call(Call::new("hello")).unwrap_err().is_contract_violation());

        b.do_connection("peer-a", "two-way".into()).unwrap();
        assert_eq!(Some(TwoWayRole::Server), a.role());
        assert_eq!(Some("peer-b".to_string()), a.client_port_uri());
        a.do_disconnection().unwrap();
        assert!(b.obey_disconnection().unwrap_err().is_contract_violation());
    }

    #[test]
    fn test_two_way_refuses_one_way_connector() {
        let context = context();
        let left = server(&context, "left");
        let right = server(&context, "right");
        let a = TwoWayPort::create(&left, ECHO).unwrap();
        let b = TwoWayPort::create(&right, ECHO).unwrap();
        a.publish().unwrap();
        b.publish().unwrap();
        let err = a.do_connection(b.uri(), "basic".into()).unwrap_err();
        assert!(err.is_contract_violation());
        assert!(!a.connected() && !b.connected());
    }

    #[test]
    fn test_crossed_two_way_connections_never_hang() {
        let context = context();
        let left = server(&context, "left");
        let right = server(&context, "right");
        for _ in 0..200 {
            let a = TwoWayPort::create(&left, ECHO).unwrap();
            let b = TwoWayPort::create(&right, ECHO).unwrap();
            a.publish().unwrap();
            b.publish().unwrap();

            let barrier = Arc::new(Barrier::new(2));
            let (tx, rx) = mpsc::channel();
            for (from, to) in [(a.clone(), b.clone()), (b.clone(), a.clone())] {
                let barrier = barrier.clone();
                let tx = tx.clone();
                thread::spawn(move || {
                    barrier.wait();
                    let outcome = from.do_connection(to.uri(), "two-way".into());
                    tx.send((from.uri().to_string(), outcome)).unwrap();
                });
            }
            let mut winners = Vec::new();
            for _ in 0..2 {
                let (uri, outcome) = rx
                    .recv_timeout(Duration::from_secs(5))
                    .expect("crossed connection attempts deadlocked");
                match outcome {
                    Ok(()) => winners.push(uri),
                    Err(e) => assert!(e.is_contract_violation()),
                }
            }

            assert!(winners.len() <= 1);
            assert_eq!(a.connected(), b.connected());
            if let Some(client) = winners.first() {
                let (client, server) = if client == a.uri() { (&a, &b) } else { (&b, &a) };
                assert_eq!(Some(TwoWayRole::Client), client.role());
                assert_eq!(Some(TwoWayRole::Server), server.role());
                client.do_disconnection().unwrap();
            }
            assert!(!a.connected() && !b.connected());
            a.unpublish().unwrap();
            b.unpublish().unwrap();
        }
    }
}
