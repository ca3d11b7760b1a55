//! Interface identifiers and the call envelope that travels through ports.
use std::{fmt, sync::Arc};

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

use crate::{AnyResult, Error, Result};

/// Capability tag naming a service interface, e.g. `"demo.Calculator"`.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InterfaceId(Arc<str>);

impl InterfaceId {
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for InterfaceId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for InterfaceId {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<&InterfaceId> for InterfaceId {
    fn from(value: &InterfaceId) -> Self {
        value.clone()
    }
}

impl fmt::Display for InterfaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for InterfaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InterfaceId({})", self.0)
    }
}

/// One operation invoked on an interface, with JSON encoded arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Call {
    pub operation: String,
    #[serde(default)]
    pub args: Value,
}

impl Call {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            args: Value::Null,
        }
    }

    pub fn with_args<A: Serialize + ?Sized>(
        operation: impl Into<String>,
        args: &A,
    ) -> AnyResult<Self> {
        Ok(Self {
            operation: operation.into(),
            args: serde_json::to_value(args)?,
        })
    }

    /// Decodes the arguments into the type the operation expects.
    pub fn args<A: DeserializeOwned>(&self) -> AnyResult<A> {
        A::deserialize(&self.args).map_err(|e| {
            anyhow::anyhow!("invalid arguments for operation {}: {e}", self.operation)
        })
    }
}

/// Encodes a handler's result.
pub fn reply<R: Serialize + ?Sized>(value: &R) -> AnyResult<Value> {
    Ok(serde_json::to_value(value)?)
}

/// Decodes a reply received through a port.
pub fn decode_reply<R: DeserializeOwned>(value: Value) -> Result<R> {
    serde_json::from_value(value).map_err(|e| Error::Execution(e.into()))
}
