use std::{path::Path, time::Duration};

use portico_core::config::{ComponentConfig, RuntimeConfig};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

const DEFAULT_RUN_FOR_MS: u64 = 1000;

/// A whole deployment: hosts, the components placed on them and the
/// connections wired between their ports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentConfig {
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default = "default_hosts")]
    pub hosts: Vec<String>,
    #[serde(default)]
    pub components: Vec<ComponentDeployment>,
    #[serde(default)]
    pub connections: Vec<ConnectionConfig>,
    #[serde(default = "default_run_for_ms")]
    pub run_for_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentDeployment {
    #[serde(rename = "type")]
    pub type_name: String,
    /// Defaults to the first host.
    pub host: Option<String>,
    #[serde(flatten)]
    pub config: ComponentConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// The initiating port.
    pub port: String,
    pub peer: String,
    #[serde(default = "default_connector")]
    pub connector: String,
}

fn default_hosts() -> Vec<String> {
    vec![portico_core::context::DEFAULT_HOST.to_string()]
}

fn default_connector() -> String {
    "basic".to_string()
}

const fn default_run_for_ms() -> u64 {
    DEFAULT_RUN_FOR_MS
}

impl DeploymentConfig {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read(path)?;
        let config = parse_from_slice::<Self>(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn run_for(&self) -> Duration {
        Duration::from_millis(self.run_for_ms)
    }

    /// More than one host needs the distributed directory.
    pub fn is_distributed(&self) -> bool {
        self.runtime.distributed || self.hosts.len() > 1
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(!self.hosts.is_empty(), "a deployment needs at least one host");
        for (i, host) in self.hosts.iter().enumerate() {
            anyhow::ensure!(
                !self.hosts[..i].contains(host),
                "host {host} is declared twice"
            );
        }
        for component in &self.components {
            if let Some(host) = &component.host {
                anyhow::ensure!(
                    self.hosts.contains(host),
                    "component {} is placed on unknown host {host}",
                    component.type_name
                );
            }
        }
        Ok(())
    }
}

pub fn parse_from_slice<T: DeserializeOwned>(content: &[u8]) -> anyhow::Result<T> {
    // read first non-space u8
    let is_json = match content
        .iter()
        .find(|&&b| b != b' ' && b != b'\r' && b != b'\n' && b != b'\t')
    {
        Some(first) => *first == b'{',
        None => false,
    };
    match is_json {
        true => serde_json::from_slice::<T>(content).map_err(Into::into),
        false => toml::from_str::<T>(&String::from_utf8_lossy(content)).map_err(Into::into),
    }
}
