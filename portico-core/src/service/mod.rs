//! Implementations of offered interfaces and the layers wrapped around them.
//!
//! A component serves every call arriving on one of its inbound or two-way
//! ports with the [`ServiceHandler`] registered for the port's interface.
//! The handler is composed once, when the interface is offered, with the
//! layers in [`layer`]: panics are turned into failures, then the
//! component's [`RequestHook`](layer::RequestHook)s run around the call.
use std::sync::Arc;

use serde_json::Value;
pub use service_async::{layer::FactoryLayer, stack::FactoryStack, MakeService, Param};

use crate::{component::Component, interface::Call, AnyResult};

pub mod layer;

pub use layer::{
    compose, CatchPanicHandler, HandlerParams, HookChain, InterceptedHandler, RequestHook,
    RequestInfo, RequestScope,
};

/// Serves the operations of one offered interface.
pub trait ServiceHandler: Send + Sync + 'static {
    fn handle(&self, owner: &Component, call: Call) -> AnyResult<Value>;
}

impl<H: ServiceHandler + ?Sized> ServiceHandler for Arc<H> {
    fn handle(&self, owner: &Component, call: Call) -> AnyResult<Value> {
        (**self).handle(owner, call)
    }
}

/// A [`ServiceHandler`] built from a closure, see [`service_fn`].
#[derive(Clone)]
pub struct ServiceFn<F> {
    f: F,
}

impl<F> ServiceHandler for ServiceFn<F>
where
    F: Fn(&Component, Call) -> AnyResult<Value> + Send + Sync + 'static,
{
    fn handle(&self, owner: &Component, call: Call) -> AnyResult<Value> {
        (self.f)(owner, call)
    }
}

pub fn service_fn<F>(f: F) -> ServiceFn<F>
where
    F: Fn(&Component, Call) -> AnyResult<Value> + Send + Sync + 'static,
{
    ServiceFn { f }
}

/// Factory handing out an already built handler, the innermost entry of a stack.
#[derive(Clone)]
pub struct HandlerFactory {
    handler: Arc<dyn ServiceHandler>,
}

impl HandlerFactory {
    pub fn new(handler: Arc<dyn ServiceHandler>) -> Self {
        Self { handler }
    }
}

impl MakeService for HandlerFactory {
    type Service = Arc<dyn ServiceHandler>;
    type Error = std::convert::Infallible;

    fn make_via_ref(&self, _old: Option<&Self::Service>) -> Result<Self::Service, Self::Error> {
        Ok(self.handler.clone())
    }
}
