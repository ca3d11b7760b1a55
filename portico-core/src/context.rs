//! The runtime context every component and port is built against.
//!
//! A context stands for one host: it owns the host's local registry, the
//! optional distributed registry shared with other hosts, the connector
//! types that can be named in a connection, and the factory producing the
//! executor pools of its components.
use std::{collections::HashMap, fmt, sync::Arc};

use parking_lot::RwLock;
use tracing::debug;

use crate::{
    config::RuntimeConfig,
    connector::{
        connector_fn, BasicConnector, Connector, ConnectorFactory, ConnectorSpec, TwoWayConnector,
    },
    executor::{default_pool_factory, PoolFactory},
    port::PortEndpoint,
    registry::{LocalRegistry, Registry},
    Error, Result,
};

pub const DEFAULT_HOST: &str = "localhost";

pub struct RuntimeContext {
    host: String,
    config: RuntimeConfig,
    local: LocalRegistry,
    distributed: Option<Arc<dyn Registry>>,
    connectors: RwLock<HashMap<String, ConnectorFactory>>,
    pool_factory: Arc<dyn PoolFactory>,
}

/// A resolved peer and whether reaching it crosses a host boundary.
pub struct Resolved {
    pub endpoint: Arc<dyn PortEndpoint>,
    pub remote: bool,
}

impl RuntimeContext {
    pub fn builder() -> RuntimeContextBuilder {
        RuntimeContextBuilder::default()
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn is_distributed(&self) -> bool {
        self.distributed.is_some()
    }

    pub fn local_registry(&self) -> &LocalRegistry {
        &self.local
    }

    pub fn distributed_registry(&self) -> Option<&Arc<dyn Registry>> {
        self.distributed.as_ref()
    }

    pub fn pool_factory(&self) -> &Arc<dyn PoolFactory> {
        &self.pool_factory
    }

    /// Looks `uri` up locally first, then in the distributed registry.
    pub fn resolve(&self, uri: &str) -> Result<Resolved> {
        if let Some(endpoint) = self.local.resolve(uri) {
            return Ok(Resolved {
                endpoint,
                remote: false,
            });
        }
        if let Some(endpoint) = self.distributed.as_ref().and_then(|r| r.resolve(uri)) {
            debug!("host {}: {uri} resolved through the distributed registry", self.host);
            let remote = endpoint.is_remote();
            return Ok(Resolved { endpoint, remote });
        }
        Err(Error::Unresolved(uri.to_string()))
    }

    pub fn register_connector(&self, type_name: &str, factory: ConnectorFactory) -> Result<()> {
        let mut connectors = self.connectors.write();
        ensure_contract!(
            !connectors.contains_key(type_name),
            "connector type {type_name} is already registered"
        );
        connectors.insert(type_name.to_string(), factory);
        Ok(())
    }

    pub fn has_connector(&self, type_name: &str) -> bool {
        self.connectors.read().contains_key(type_name)
    }

    /// Produces the connector a connection attempt asked for.
    pub fn make_connector(&self, spec: &ConnectorSpec) -> Result<Arc<dyn Connector>> {
        match spec {
            ConnectorSpec::Instance(connector) => Ok(connector.clone()),
            ConnectorSpec::Named(type_name) => {
                let factory = self.connectors.read().get(type_name).cloned();
                let Some(factory) = factory else {
                    return Err(contract_violation!("unknown connector type {type_name}"));
                };
                factory.make_via_ref(None).map_err(Error::Execution)
            }
        }
    }
}

impl fmt::Debug for RuntimeContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeContext")
            .field("host", &self.host)
            .field("distributed", &self.is_distributed())
            .field("published", &self.local.len())
            .finish()
    }
}

#[derive(Default)]
pub struct RuntimeContextBuilder {
    host: Option<String>,
    config: RuntimeConfig,
    distributed: Option<Arc<dyn Registry>>,
    pool_factory: Option<Arc<dyn PoolFactory>>,
    connectors: Vec<(String, ConnectorFactory)>,
}

impl RuntimeContextBuilder {
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Switches the context to distributed mode.
    pub fn distributed(mut self, registry: Arc<dyn Registry>) -> Self {
        self.config.distributed = true;
        self.distributed = Some(registry);
        self
    }

    pub fn pool_factory(mut self, factory: Arc<dyn PoolFactory>) -> Self {
        self.pool_factory = Some(factory);
        self
    }

    pub fn connector(mut self, type_name: impl Into<String>, factory: ConnectorFactory) -> Self {
        self.connectors.push((type_name.into(), factory));
        self
    }

    pub fn build(self) -> Result<Arc<RuntimeContext>> {
        ensure_contract!(
            !self.config.distributed || self.distributed.is_some(),
            "distributed mode needs a distributed registry"
        );
        let pool_factory = self
            .pool_factory
            .unwrap_or_else(|| default_pool_factory(&self.config));
        let context = RuntimeContext {
            host: self.host.unwrap_or_else(|| DEFAULT_HOST.to_string()),
            config: self.config,
            local: LocalRegistry::new(),
            distributed: self.distributed,
            connectors: RwLock::new(HashMap::new()),
            pool_factory,
        };
        context.register_connector(
            BasicConnector::TYPE_NAME,
            connector_fn(|| Arc::new(BasicConnector::new()) as Arc<dyn Connector>),
        )?;
        context.register_connector(
            TwoWayConnector::TYPE_NAME,
            connector_fn(|| Arc::new(TwoWayConnector::new()) as Arc<dyn Connector>),
        )?;
        for (type_name, factory) in self.connectors {
            context.register_connector(&type_name, factory)?;
        }
        Ok(Arc::new(context))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::ConnectorKind;

    #[test]
    fn test_builtin_connectors_are_registered() {
        let context = RuntimeContext::builder().build().unwrap();
        assert_eq!(DEFAULT_HOST, context.host());
        assert!(!context.is_distributed());
        let basic = context.make_connector(&ConnectorSpec::named("basic")).unwrap();
        assert_eq!(ConnectorKind::OneWay, basic.kind());
        let two_way = context.make_connector(&"two-way".into()).unwrap();
        assert_eq!(ConnectorKind::TwoWay, two_way.kind());
        assert!(context
            .make_connector(&ConnectorSpec::named("carrier-pigeon"))
            .err()
            .unwrap()
            .is_contract_violation());
    }

    #[test]
    fn test_connector_types_are_unique_and_resolution_fails_cleanly() {
        let err = RuntimeContext::builder()
            .connector(
                "basic",
                connector_fn(|| Arc::new(BasicConnector::new()) as Arc<dyn Connector>),
            )
            .build()
            .unwrap_err();
        assert!(err.is_contract_violation());

        let context = RuntimeContext::builder().host("h1").build().unwrap();
        assert!(matches!(
            context.resolve("nowhere").err().unwrap(),
            Error::Unresolved(uri) if uri == "nowhere"
        ));

        let config = RuntimeConfig {
            distributed: true,
            ..Default::default()
        };
        assert!(RuntimeContext::builder().config(config).build().is_err());
    }
}
