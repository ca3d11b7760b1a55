//! Connectors bridge two connected ports and relay calls between them.
//!
//! A connector is instantiated per connection. One-way connectors
//! ([`BasicConnector`]) carry calls from an outbound port to an inbound port.
//! Two-way connectors ([`TwoWayConnector`]) carry calls in both directions
//! between two two-way ports, and take part in the symmetric connection
//! protocol through [`Connector::obey_connection`] and
//! [`Connector::obey_disconnection`].
use std::{fmt, sync::Arc};

use serde_json::Value;
use service_async::MakeService;

use crate::{interface::Call, port::PortEndpoint, AnyError, Result};

mod basic;
mod two_way;

pub use basic::BasicConnector;
pub use two_way::TwoWayConnector;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorKind {
    OneWay,
    TwoWay,
}

pub trait Connector: Send + Sync {
    /// Name under which the connector type is registered in a runtime context.
    fn type_name(&self) -> &str;
    fn kind(&self) -> ConnectorKind;

    /// Establishes the calling channel between the two endpoints.
    fn connect(&self, server: Arc<dyn PortEndpoint>, client: Arc<dyn PortEndpoint>) -> Result<()>;
    fn disconnect(&self) -> Result<()>;
    fn connected(&self) -> bool;
    fn server_port_uri(&self) -> Option<String>;
    fn client_port_uri(&self) -> Option<String>;

    /// Relays a call issued by the port `origin` to its peer and waits for the reply.
    fn relay(&self, origin: &str, call: Call) -> Result<Value>;
    /// Relays a call without waiting for its result.
    fn relay_async(&self, origin: &str, call: Call) -> Result<()>;

    /// Lets the server side of a symmetric connection complete its own setup.
    ///
    /// `this` is the shared handle on this very connector.
    fn obey_connection(&self, this: &Arc<dyn Connector>) -> Result<()> {
        let _ = this;
        Err(contract_violation!(
            "connector {} does not negotiate symmetric connections",
            self.type_name()
        ))
    }

    /// Asks the peer of `origin` to tear down its side of the connection.
    fn obey_disconnection(&self, origin: &str) -> Result<()> {
        Err(contract_violation!(
            "connector {} does not negotiate symmetric disconnections (origin {origin})",
            self.type_name()
        ))
    }
}

/// How a connection attempt obtains its connector.
#[derive(Clone)]
pub enum ConnectorSpec {
    Instance(Arc<dyn Connector>),
    /// A connector type registered in the runtime context, instantiated on demand.
    Named(String),
}

impl ConnectorSpec {
    pub fn named(type_name: impl Into<String>) -> Self {
        ConnectorSpec::Named(type_name.into())
    }

    pub fn type_name(&self) -> &str {
        match self {
            ConnectorSpec::Instance(connector) => connector.type_name(),
            ConnectorSpec::Named(name) => name,
        }
    }
}

impl From<&str> for ConnectorSpec {
    fn from(value: &str) -> Self {
        ConnectorSpec::named(value)
    }
}

impl From<Arc<dyn Connector>> for ConnectorSpec {
    fn from(value: Arc<dyn Connector>) -> Self {
        ConnectorSpec::Instance(value)
    }
}

impl fmt::Debug for ConnectorSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectorSpec::Instance(c) => write!(f, "Instance({})", c.type_name()),
            ConnectorSpec::Named(name) => write!(f, "Named({name})"),
        }
    }
}

/// Produces fresh connectors of one registered type.
pub type ConnectorFactory =
    Arc<dyn MakeService<Service = Arc<dyn Connector>, Error = AnyError> + Send + Sync>;

/// Adapts a constructor closure into a [`ConnectorFactory`].
pub struct ConnectorFn<F>(F);

impl<F> MakeService for ConnectorFn<F>
where
    F: Fn() -> Arc<dyn Connector>,
{
    type Service = Arc<dyn Connector>;
    type Error = AnyError;

    fn make_via_ref(&self, _old: Option<&Self::Service>) -> Result<Self::Service, Self::Error> {
        Ok((self.0)())
    }
}

pub fn connector_fn<F>(f: F) -> ConnectorFactory
where
    F: Fn() -> Arc<dyn Connector> + Send + Sync + 'static,
{
    Arc::new(ConnectorFn(f))
}
