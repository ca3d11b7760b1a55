use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tracing::debug;

use super::{Connector, ConnectorKind};
use crate::{
    interface::Call,
    port::{PortEndpoint, PortKind},
    Result,
};

struct Link {
    server: Arc<dyn PortEndpoint>,
    client_uri: String,
}

/// One-way connector: relays calls from an outbound port to an inbound port.
///
/// Connecting attaches the client to the inbound port, which is how the
/// inbound side learns it is connected.
#[derive(Default)]
pub struct BasicConnector {
    link: Mutex<Option<Link>>,
}

impl BasicConnector {
    pub const TYPE_NAME: &'static str = "basic";

    pub fn new() -> Self {
        Self::default()
    }

    fn server_for(&self, origin: &str) -> Result<Arc<dyn PortEndpoint>> {
        let link = self.link.lock();
        let Some(link) = link.as_ref() else {
            return Err(contract_violation!("basic connector used before connect"));
        };
        ensure_contract!(
            link.client_uri == origin,
            "port {origin} is not the client of this connector ({})",
            link.client_uri
        );
        Ok(link.server.clone())
    }
}

impl Connector for BasicConnector {
    fn type_name(&self) -> &str {
        Self::TYPE_NAME
    }

    fn kind(&self) -> ConnectorKind {
        ConnectorKind::OneWay
    }

    fn connect(&self, server: Arc<dyn PortEndpoint>, client: Arc<dyn PortEndpoint>) -> Result<()> {
        let mut link = self.link.lock();
        ensure_contract!(link.is_none(), "basic connector is already connected");
        ensure_contract!(
            server.kind() == PortKind::Inbound,
            "basic connector needs an inbound server port, {} is {:?}",
            server.uri(),
            server.kind()
        );
        ensure_contract!(
            client.kind() == PortKind::Outbound,
            "basic connector needs an outbound client port, {} is {:?}",
            client.uri(),
            client.kind()
        );
        server.attach_client(client.uri())?;
        debug!("basic connector: {} -> {}", client.uri(), server.uri());
        *link = Some(Link {
            server,
            client_uri: client.uri().to_string(),
        });
        Ok(())
    }

    fn disconnect(&self) -> Result<()> {
        let Some(link) = self.link.lock().take() else {
            return Err(contract_violation!("basic connector is not connected"));
        };
        link.server.detach_client(&link.client_uri)
    }

    fn connected(&self) -> bool {
        self.link.lock().is_some()
    }

    fn server_port_uri(&self) -> Option<String> {
        self.link.lock().as_ref().map(|l| l.server.uri().to_string())
    }

    fn client_port_uri(&self) -> Option<String> {
        self.link.lock().as_ref().map(|l| l.client_uri.clone())
    }

    fn relay(&self, origin: &str, call: Call) -> Result<Value> {
        self.server_for(origin)?.deliver(call)
    }

    fn relay_async(&self, origin: &str, call: Call) -> Result<()> {
        self.server_for(origin)?.deliver_async(call)
    }
}
