use serde::{Deserialize, Serialize};

// Default iouring/epoll entries: 1k
const DEFAULT_ENTRIES: u32 = 1024;

macro_rules! define_const {
    ($name: ident, $val: expr, $type: ty) => {
        const fn $name() -> $type {
            $val
        }
    };
}

/// Settings shared by every executor pool created inside one runtime context.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RuntimeConfig {
    #[serde(default = "default_entries")]
    pub entries: u32,
    #[serde(default)]
    pub runtime_type: RuntimeType,
    #[serde(default = "default_cpu_affinity")]
    pub cpu_affinity: bool,
    /// Whether published ports are also registered in the distributed registry.
    #[serde(default = "default_distributed")]
    pub distributed: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            entries: default_entries(),
            runtime_type: Default::default(),
            cpu_affinity: default_cpu_affinity(),
            distributed: default_distributed(),
        }
    }
}

define_const!(default_entries, DEFAULT_ENTRIES, u32);
define_const!(default_cpu_affinity, false, bool);
define_const!(default_distributed, false, bool);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeType {
    #[cfg(target_os = "linux")]
    IoUring,
    Legacy,
}

impl Default for RuntimeType {
    #[cfg(target_os = "linux")]
    fn default() -> Self {
        Self::IoUring
    }
    #[cfg(not(target_os = "linux"))]
    fn default() -> Self {
        Self::Legacy
    }
}

/// Declarative description of a component, evaluated once at construction.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ComponentConfig {
    pub uri: Option<String>,
    #[serde(default)]
    pub plain_threads: usize,
    #[serde(default)]
    pub schedulable_threads: usize,
    #[serde(default)]
    pub required: Vec<String>,
    #[serde(default)]
    pub offered: Vec<String>,
    #[serde(default)]
    pub pools: Vec<PoolConfig>,
}

impl ComponentConfig {
    pub fn with_threads(plain_threads: usize, schedulable_threads: usize) -> Self {
        Self {
            plain_threads,
            schedulable_threads,
            ..Default::default()
        }
    }

    pub fn is_passive(&self) -> bool {
        self.plain_threads == 0 && self.schedulable_threads == 0
    }
}

/// An extra, user-named executor pool created with the component.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PoolConfig {
    pub uri: String,
    #[serde(default = "default_pool_threads")]
    pub threads: usize,
    #[serde(default)]
    pub schedulable: bool,
}

define_const!(default_pool_threads, 1, usize);
