//! Turns a [`DeploymentConfig`] into running components.
use std::{collections::BTreeMap, sync::Arc, time::Duration};

use anyhow::Context;
use portico_core::{
    executor::TaskHandle, factory::ComponentFactories, Component, ComponentState, RuntimeContext,
};
use portico_services::DistributedDirectory;
use tracing::{info, warn};

use crate::config::{ConnectionConfig, DeploymentConfig};

struct Connection {
    owner: Component,
    port: String,
}

pub struct Assembly {
    directory: Option<Arc<DistributedDirectory>>,
    hosts: BTreeMap<String, Arc<RuntimeContext>>,
    components: Vec<Component>,
    connections: Vec<Connection>,
}

impl Assembly {
    /// Creates one runtime context per host and every component on it.
    pub fn build(config: &DeploymentConfig, factories: &ComponentFactories) -> anyhow::Result<Self> {
        config.validate()?;
        let directory = config.is_distributed().then(DistributedDirectory::new);
        let mut hosts = BTreeMap::new();
        for host in &config.hosts {
            let mut builder = RuntimeContext::builder()
                .host(host)
                .config(config.runtime.clone());
            if let Some(directory) = &directory {
                builder = builder.distributed(directory.host(host));
            }
            hosts.insert(host.clone(), builder.build()?);
        }

        let mut assembly = Self {
            directory,
            hosts,
            components: Vec::new(),
            connections: Vec::new(),
        };
        for deployment in &config.components {
            let host = deployment
                .host
                .as_deref()
                .or_else(|| config.hosts.first().map(String::as_str))
                .context("no host to place a component on")?;
            let context = assembly
                .hosts
                .get(host)
                .with_context(|| format!("unknown host {host}"))?;
            let component = factories
                .create(&deployment.type_name, context, &deployment.config)
                .with_context(|| format!("creating a {} component", deployment.type_name))?;
            info!(
                "{} component {} placed on host {host}",
                deployment.type_name,
                component.uri()
            );
            assembly.components.push(component);
        }
        Ok(assembly)
    }

    pub fn components(&self) -> &[Component] {
        &self.components
    }

    pub fn host(&self, name: &str) -> Option<&Arc<RuntimeContext>> {
        self.hosts.get(name)
    }

    pub fn directory(&self) -> Option<&Arc<DistributedDirectory>> {
        self.directory.as_ref()
    }

    /// Starts every component, then wires the configured connections.
    pub fn start(&mut self, connections: &[ConnectionConfig]) -> anyhow::Result<()> {
        for component in &self.components {
            component.start()?;
        }
        for connection in connections {
            let owner = self
                .owner_of(&connection.port)?
                .with_context(|| format!("no component owns port {}", connection.port))?;
            owner
                .do_port_connection(&connection.port, &connection.peer, connection.connector.as_str())
                .with_context(|| {
                    format!("connecting {} to {}", connection.port, connection.peer)
                })?;
            self.connections.push(Connection {
                owner,
                port: connection.port.clone(),
            });
        }
        info!(
            "{} component(s) started, {} connection(s) established",
            self.components.len(),
            self.connections.len()
        );
        Ok(())
    }

    fn owner_of(&self, port: &str) -> anyhow::Result<Option<Component>> {
        for component in &self.components {
            if component.is_port_existing(port)? {
                return Ok(Some(component.clone()));
            }
        }
        Ok(None)
    }

    pub fn execute(&self) -> anyhow::Result<Vec<TaskHandle<()>>> {
        let mut handles = Vec::with_capacity(self.components.len());
        for component in &self.components {
            handles.push(component.execute()?);
        }
        Ok(handles)
    }

    /// Disconnects, finalises and shuts everything down; returns whether all terminated.
    pub fn stop(&mut self, timeout: Duration) -> bool {
        for connection in self.connections.drain(..) {
            if let Err(e) = connection.owner.do_port_disconnection(&connection.port) {
                warn!("unable to disconnect {}: {e}", connection.port);
            }
        }
        for component in &self.components {
            if component.state() == ComponentState::Started {
                if let Err(e) = component.finalise() {
                    warn!("component {} failed to finalise: {e}", component.uri());
                }
            }
        }
        for component in &self.components {
            if component.state() == ComponentState::Finalised {
                if let Err(e) = component.shutdown() {
                    warn!("component {} failed to shut down: {e}", component.uri());
                }
            }
        }
        let mut terminated = true;
        for component in &self.components {
            if !component.await_termination(timeout) {
                warn!("component {} did not terminate in time", component.uri());
                terminated = false;
            }
        }
        terminated
    }

    /// One line per component describing where it ended up.
    pub fn log_summary(&self) {
        for component in &self.components {
            match component.describe() {
                Ok(description) => info!(
                    "{} on {}: {}, {} port(s), {} pool(s), plug-ins {:?}",
                    description.uri,
                    description.host,
                    description.state,
                    description.ports.len(),
                    description.executors.len(),
                    description.plugins
                ),
                Err(e) => warn!("component {} cannot describe itself: {e}", component.uri()),
            }
        }
        if let Some(directory) = &self.directory {
            info!("{} frame(s) crossed host boundaries", directory.frames());
        }
    }
}

/// Waits for the execute tasks and reports their outcome.
pub fn collect(handles: Vec<TaskHandle<()>>, timeout: Duration) {
    for handle in handles {
        match handle.get_timeout(timeout) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("execute task failed: {e}"),
            Err(handle) => {
                handle.cancel();
                warn!("execute task still running, cancelled");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::parse_from_slice, demo};

    fn deploy(text: &str) -> (DeploymentConfig, Assembly) {
        let config = parse_from_slice::<DeploymentConfig>(text.as_bytes()).unwrap();
        let assembly = Assembly::build(&config, &demo::factories().unwrap()).unwrap();
        (config, assembly)
    }

    #[test]
    fn test_single_host_deployment_runs_to_termination() {
        let (config, mut assembly) = deploy(
            r#"
            [[components]]
            type = "calculator"
            uri = "calc"
            plain_threads = 1

            [[components]]
            type = "client"
            uri = "client"
            plain_threads = 1

            [[connections]]
            port = "client-calculator"
            peer = "calc-calculator"
            "#,
        );
        assert!(assembly.directory().is_none());
        assembly.start(&config.connections).unwrap();
        let handles = assembly.execute().unwrap();
        for handle in handles {
            handle.get().unwrap();
        }
        assert!(assembly.stop(Duration::from_secs(5)));
        assert!(assembly.components().iter().all(|c| c.is_terminated()));
    }

    #[test]
    fn test_two_host_deployment_crosses_the_directory() {
        let (config, mut assembly) = deploy(
            r#"
            hosts = ["east", "west"]

            [[components]]
            type = "calculator"
            host = "east"
            uri = "calc"
            plain_threads = 1
            schedulable_threads = 1

            [[components]]
            type = "client"
            host = "west"
            uri = "client"

            [[connections]]
            port = "client-calculator"
            peer = "calc-calculator"
            "#,
        );
        assembly.start(&config.connections).unwrap();
        assert_eq!("west", assembly.components()[1].context().host());
        assert!(assembly.components()[0].is_installed("heartbeat"));
        for handle in assembly.execute().unwrap() {
            handle.get().unwrap();
        }
        let directory = assembly.directory().unwrap().clone();
        // attach plus eleven calls
        assert!(directory.frames() >= 12);
        assembly.log_summary();
        assert!(assembly.stop(Duration::from_secs(5)));
    }

    #[test]
    fn test_connection_to_unknown_port_fails() {
        let (_, mut assembly) = deploy(
            r#"
            [[components]]
            type = "client"
            uri = "client"
            "#,
        );
        let wrong = [ConnectionConfig {
            port: "client-calculator".to_string(),
            peer: "nowhere".to_string(),
            connector: "basic".to_string(),
        }];
        assert!(assembly.start(&wrong).is_err());
        assert!(assembly.stop(Duration::from_secs(5)));
    }
}
