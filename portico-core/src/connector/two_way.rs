use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tracing::debug;

use super::{Connector, ConnectorKind, ConnectorSpec};
use crate::{
    interface::Call,
    port::{PortEndpoint, PortKind},
    Result,
};

struct Pair {
    server: Arc<dyn PortEndpoint>,
    client: Arc<dyn PortEndpoint>,
}

impl Pair {
    /// The endpoint on the other side of `origin`.
    fn peer_of(&self, origin: &str) -> Result<Arc<dyn PortEndpoint>> {
        if origin == self.client.uri() {
            Ok(self.server.clone())
        } else if origin == self.server.uri() {
            Ok(self.client.clone())
        } else {
            Err(contract_violation!(
                "port {origin} is not an end of the two-way connection {} <-> {}",
                self.client.uri(),
                self.server.uri()
            ))
        }
    }
}

/// Symmetric connector between two two-way ports.
///
/// The initiating port is the client, its peer the server. Calls flow in
/// both directions: each is relayed to the end that did not issue it.
#[derive(Default)]
pub struct TwoWayConnector {
    pair: Mutex<Option<Pair>>,
}

impl TwoWayConnector {
    pub const TYPE_NAME: &'static str = "two-way";

    pub fn new() -> Self {
        Self::default()
    }

    fn peer_of(&self, origin: &str) -> Result<Arc<dyn PortEndpoint>> {
        match self.pair.lock().as_ref() {
            Some(pair) => pair.peer_of(origin),
            None => Err(contract_violation!("two-way connector used before connect")),
        }
    }
}

impl Connector for TwoWayConnector {
    fn type_name(&self) -> &str {
        Self::TYPE_NAME
    }

    fn kind(&self) -> ConnectorKind {
        ConnectorKind::TwoWay
    }

    fn connect(&self, server: Arc<dyn PortEndpoint>, client: Arc<dyn PortEndpoint>) -> Result<()> {
        let mut pair = self.pair.lock();
        ensure_contract!(pair.is_none(), "two-way connector is already connected");
        for end in [&server, &client] {
            ensure_contract!(
                end.kind() == PortKind::TwoWay,
                "two-way connector needs two-way ports, {} is {:?}",
                end.uri(),
                end.kind()
            );
        }
        ensure_contract!(
            server.uri() != client.uri(),
            "port {} cannot be connected to itself",
            server.uri()
        );
        debug!("two-way connector: {} <-> {}", client.uri(), server.uri());
        *pair = Some(Pair { server, client });
        Ok(())
    }

    fn disconnect(&self) -> Result<()> {
        ensure_contract!(
            self.pair.lock().take().is_some(),
            "two-way connector is not connected"
        );
        Ok(())
    }

    fn connected(&self) -> bool {
        self.pair.lock().is_some()
    }

    fn server_port_uri(&self) -> Option<String> {
        self.pair.lock().as_ref().map(|p| p.server.uri().to_string())
    }

    fn client_port_uri(&self) -> Option<String> {
        self.pair.lock().as_ref().map(|p| p.client.uri().to_string())
    }

    fn relay(&self, origin: &str, call: Call) -> Result<Value> {
        self.peer_of(origin)?.deliver(call)
    }

    fn relay_async(&self, origin: &str, call: Call) -> Result<()> {
        self.peer_of(origin)?.deliver_async(call)
    }

    fn obey_connection(&self, this: &Arc<dyn Connector>) -> Result<()> {
        let (server, client_uri) = match self.pair.lock().as_ref() {
            Some(pair) => (pair.server.clone(), pair.client.uri().to_string()),
            None => return Err(contract_violation!("two-way connector used before connect")),
        };
        server.obey_connection(&client_uri, ConnectorSpec::Instance(this.clone()))
    }

    fn obey_disconnection(&self, origin: &str) -> Result<()> {
        self.peer_of(origin)?.obey_disconnection()
    }
}
