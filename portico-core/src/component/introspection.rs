//! The self-description service every component offers.
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{Component, ComponentState};
use crate::{
    interface::{reply, Call},
    port::{PortHandle, PortKind},
    service::ServiceHandler,
    AnyResult, Result,
};

pub const INTROSPECTION_INTERFACE: &str = "portico.introspection";

pub fn introspection_port_uri(component_uri: &str) -> String {
    format!("{component_uri}-introspection")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortDescription {
    pub uri: String,
    pub interface: String,
    pub kind: PortKind,
    pub published: bool,
    pub distributed: bool,
    pub connected: bool,
}

impl From<&PortHandle> for PortDescription {
    fn from(handle: &PortHandle) -> Self {
        let port = handle.port();
        Self {
            uri: port.uri().to_string(),
            interface: port.interface().to_string(),
            kind: port.kind(),
            published: port.is_published(),
            distributed: port.is_distributedly_published(),
            connected: port.connected(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorDescription {
    pub uri: String,
    pub index: usize,
    pub threads: usize,
    pub schedulable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentDescription {
    pub uri: String,
    pub host: String,
    pub state: ComponentState,
    pub passive: bool,
    pub serialised: bool,
    pub required: Vec<String>,
    pub offered: Vec<String>,
    pub ports: Vec<PortDescription>,
    pub executors: Vec<ExecutorDescription>,
    pub plugins: Vec<String>,
}

impl Component {
    pub fn describe(&self) -> Result<ComponentDescription> {
        Ok(ComponentDescription {
            uri: self.uri().to_string(),
            host: self.context().host().to_string(),
            state: self.state(),
            passive: self.is_passive(),
            serialised: self.has_serialised_execution(),
            required: self
                .required_interfaces()?
                .iter()
                .map(ToString::to_string)
                .collect(),
            offered: self
                .offered_interfaces()?
                .iter()
                .map(ToString::to_string)
                .collect(),
            ports: self.describe_ports()?,
            executors: self.describe_executors(),
            plugins: self.plugin_uris(),
        })
    }

    fn describe_ports(&self) -> Result<Vec<PortDescription>> {
        Ok(self.ports()?.iter().map(PortDescription::from).collect())
    }

    fn describe_executors(&self) -> Vec<ExecutorDescription> {
        self.executor_services()
            .iter()
            .map(|m| ExecutorDescription {
                uri: m.uri().to_string(),
                index: m.index(),
                threads: m.threads(),
                schedulable: m.is_schedulable(),
            })
            .collect()
    }
}

pub(crate) struct IntrospectionService;

impl ServiceHandler for IntrospectionService {
    fn handle(&self, owner: &Component, call: Call) -> AnyResult<Value> {
        match call.operation.as_str() {
            "describe" => reply(&owner.describe()?),
            "state" => reply(&owner.state()),
            "ports" => reply(&owner.describe_ports()?),
            "executors" => reply(&owner.describe_executors()),
            other => anyhow::bail!("unknown introspection operation {other}"),
        }
    }
}
