#[macro_use]
mod error;
pub use error::{AnyError, AnyResult, Error, Result};

pub mod component;
pub mod config;
pub mod connector;
pub mod context;
pub mod executor;
pub mod factory;
pub mod interface;
pub mod plugin;
pub mod port;
pub mod registry;
pub mod service;

pub use component::{Component, ComponentBuilder, ComponentState};
pub use context::RuntimeContext;
pub use interface::{Call, InterfaceId};
