//! Registry of component constructors keyed by component type.
use std::{collections::BTreeMap, fmt, sync::Arc};

use tracing::debug;

use crate::{component::Component, config::ComponentConfig, context::RuntimeContext, Result};

pub type ComponentConstructor =
    Arc<dyn Fn(&Arc<RuntimeContext>, &ComponentConfig) -> Result<Component> + Send + Sync>;

/// Maps component type names to typed constructors.
#[derive(Clone, Default)]
pub struct ComponentFactories {
    constructors: BTreeMap<String, ComponentConstructor>,
}

impl ComponentFactories {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, type_name: impl Into<String>, constructor: F) -> Result<()>
    where
        F: Fn(&Arc<RuntimeContext>, &ComponentConfig) -> Result<Component> + Send + Sync + 'static,
    {
        let type_name = type_name.into();
        ensure_contract!(
            !self.constructors.contains_key(&type_name),
            "component type {type_name} is already registered"
        );
        self.constructors.insert(type_name, Arc::new(constructor));
        Ok(())
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.constructors.contains_key(type_name)
    }

    pub fn type_names(&self) -> impl Iterator<Item = &str> {
        self.constructors.keys().map(String::as_str)
    }

    pub fn create(
        &self,
        type_name: &str,
        context: &Arc<RuntimeContext>,
        config: &ComponentConfig,
    ) -> Result<Component> {
        let Some(constructor) = self.constructors.get(type_name) else {
            return Err(contract_violation!("unknown component type {type_name}"));
        };
        debug!("creating a {type_name} component on host {}", context.host());
        constructor(context, config)
    }
}

impl fmt::Debug for ComponentFactories {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.constructors.keys()).finish()
    }
}
