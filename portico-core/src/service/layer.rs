use std::{
    fmt,
    sync::Arc,
    time::{Duration, Instant},
};

use serde_json::Value;
use service_async::{
    layer::{layer_fn, FactoryLayer},
    stack::FactoryStack,
    MakeService, Param,
};

use super::{HandlerFactory, ServiceHandler};
use crate::{
    component::Component,
    executor::run_guarded,
    interface::{Call, InterfaceId},
    AnyResult,
};

/// What a hook gets to see of a call.
#[derive(Debug, Clone, Copy)]
pub struct RequestInfo<'a> {
    pub component: &'a str,
    pub interface: &'a InterfaceId,
    pub operation: &'a str,
}

/// Code inserted before and after every call served by a component.
pub trait RequestHook: Send + Sync {
    /// Returning an error vetoes the call; the error becomes its outcome.
    fn before(&self, info: &RequestInfo<'_>) -> AnyResult<()> {
        let _ = info;
        Ok(())
    }

    fn after(&self, info: &RequestInfo<'_>, outcome: &AnyResult<Value>, elapsed: Duration) {
        let _ = (info, outcome, elapsed);
    }
}

/// Hooks in registration order.
#[derive(Clone, Default)]
pub struct HookChain {
    hooks: Vec<Arc<dyn RequestHook>>,
}

impl HookChain {
    pub fn push(&mut self, hook: Arc<dyn RequestHook>) {
        self.hooks.push(hook);
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }
}

impl fmt::Debug for HookChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookChain")
            .field("hooks", &self.hooks.len())
            .finish()
    }
}

/// Which component and interface a composed handler serves.
#[derive(Debug, Clone)]
pub struct RequestScope {
    pub component: Arc<str>,
    pub interface: InterfaceId,
}

/// Parameters a handler stack is built from.
#[derive(Debug, Clone)]
pub struct HandlerParams {
    pub scope: RequestScope,
    pub hooks: HookChain,
}

impl Param<RequestScope> for HandlerParams {
    fn param(&self) -> RequestScope {
        self.scope.clone()
    }
}

impl Param<HookChain> for HandlerParams {
    fn param(&self) -> HookChain {
        self.hooks.clone()
    }
}

/// Wraps `handler` with the panic guard and the hook chain.
pub fn compose(params: HandlerParams, handler: Arc<dyn ServiceHandler>) -> Arc<dyn ServiceHandler> {
    let stack = FactoryStack::new(params)
        .replace(HandlerFactory::new(handler))
        .push(CatchPanicHandler::layer())
        .push(InterceptedHandler::layer())
        .into_inner();
    match stack.make() {
        Ok(handler) => Arc::new(handler),
        Err(never) => match never {},
    }
}

/// Converts a panicking handler into a failed call.
pub struct CatchPanicHandler<H> {
    inner: H,
}

impl<F> CatchPanicHandler<F> {
    pub fn layer<C>() -> impl FactoryLayer<C, F, Factory = Self> {
        layer_fn(|_c: &C, inner| CatchPanicHandler { inner })
    }
}

impl<H: ServiceHandler> ServiceHandler for CatchPanicHandler<H> {
    fn handle(&self, owner: &Component, call: Call) -> AnyResult<Value> {
        run_guarded(|| self.inner.handle(owner, call))
    }
}

impl<F: MakeService> MakeService for CatchPanicHandler<F> {
    type Service = CatchPanicHandler<F::Service>;
    type Error = F::Error;

    fn make_via_ref(&self, old: Option<&Self::Service>) -> Result<Self::Service, Self::Error> {
        Ok(CatchPanicHandler {
            inner: self.inner.make_via_ref(old.map(|o| &o.inner))?,
        })
    }
}

/// Runs the hook chain around the inner handler.
///
/// `before` hooks run in registration order; the first failure stops the
/// call. `after` hooks then run in reverse order, but only for the hooks
/// whose `before` let the call through.
pub struct InterceptedHandler<H> {
    inner: H,
    scope: RequestScope,
    hooks: HookChain,
}

impl<F> InterceptedHandler<F> {
    pub fn layer<C>() -> impl FactoryLayer<C, F, Factory = Self>
    where
        C: Param<RequestScope> + Param<HookChain>,
    {
        layer_fn(|c: &C, inner| InterceptedHandler {
            inner,
            scope: <C as Param<RequestScope>>::param(c),
            hooks: <C as Param<HookChain>>::param(c),
        })
    }
}

impl<H: ServiceHandler> ServiceHandler for InterceptedHandler<H> {
    fn handle(&self, owner: &Component, call: Call) -> AnyResult<Value> {
        if self.hooks.is_empty() {
            return self.inner.handle(owner, call);
        }
        let operation = call.operation.clone();
        let info = RequestInfo {
            component: &self.scope.component,
            interface: &self.scope.interface,
            operation: &operation,
        };
        let started = Instant::now();
        let mut entered = 0;
        let mut vetoed = None;
        for hook in self.hooks.hooks.iter() {
            match hook.before(&info) {
                Ok(()) => entered += 1,
                Err(e) => {
                    vetoed = Some(e);
                    break;
                }
            }
        }
        let outcome = match vetoed {
            Some(e) => Err(e),
            None => self.inner.handle(owner, call),
        };
        let elapsed = started.elapsed();
        for hook in self.hooks.hooks[..entered].iter().rev() {
            hook.after(&info, &outcome, elapsed);
        }
        outcome
    }
}

impl<F: MakeService> MakeService for InterceptedHandler<F> {
    type Service = InterceptedHandler<F::Service>;
    type Error = F::Error;

    fn make_via_ref(&self, old: Option<&Self::Service>) -> Result<Self::Service, Self::Error> {
        Ok(InterceptedHandler {
            inner: self.inner.make_via_ref(old.map(|o| &o.inner))?,
            scope: self.scope.clone(),
            hooks: self.hooks.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;

    #[derive(Default)]
    struct Recorder {
        name: &'static str,
        veto: bool,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl RequestHook for Recorder {
        fn before(&self, info: &RequestInfo<'_>) -> AnyResult<()> {
            self.log
                .lock()
                .push(format!("{}:before:{}", self.name, info.operation));
            if self.veto {
                anyhow::bail!("{} refused {}", self.name, info.operation);
            }
            Ok(())
        }

        fn after(&self, _info: &RequestInfo<'_>, outcome: &AnyResult<Value>, _: Duration) {
            self.log
                .lock()
                .push(format!("{}:after:{}", self.name, outcome.is_ok()));
        }
    }

    fn params(hooks: Vec<Arc<dyn RequestHook>>) -> HandlerParams {
        let mut chain = HookChain::default();
        hooks.into_iter().for_each(|h| chain.push(h));
        HandlerParams {
            scope: RequestScope {
                component: Arc::from("c1"),
                interface: InterfaceId::from("demo.Echo"),
            },
            hooks: chain,
        }
    }

    fn passive() -> Component {
        let context = crate::RuntimeContext::builder().build().unwrap();
        Component::builder(&context).build().unwrap()
    }

    #[test]
    fn test_hooks_wrap_the_call_in_nested_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let hooks: Vec<Arc<dyn RequestHook>> = vec![
            Arc::new(Recorder {
                name: "outer",
                log: log.clone(),
                ..Default::default()
            }),
            Arc::new(Recorder {
                name: "inner",
                log: log.clone(),
                ..Default::default()
            }),
        ];
        let handler = compose(
            params(hooks),
            Arc::new(super::super::service_fn(|_, call| Ok(call.args))),
        );
        let reply = handler
            .handle(&passive(), Call::with_args("echo", "hi").unwrap())
            .unwrap();
        assert_eq!(Value::from("hi"), reply);
        assert_eq!(
            vec![
                "outer:before:echo",
                "inner:before:echo",
                "inner:after:true",
                "outer:after:true"
            ],
            *log.lock()
        );
    }

    #[test]
    fn test_veto_skips_the_handler_and_later_hooks() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let hooks: Vec<Arc<dyn RequestHook>> = vec![
            Arc::new(Recorder {
                name: "audit",
                log: log.clone(),
                ..Default::default()
            }),
            Arc::new(Recorder {
                name: "guard",
                veto: true,
                log: log.clone(),
            }),
        ];
        let handler = compose(
            params(hooks),
            Arc::new(super::super::service_fn(|_, _| panic!("must not run"))),
        );
        let err = handler.handle(&passive(), Call::new("wipe")).unwrap_err();
        assert_eq!("guard refused wipe", err.to_string());
        assert_eq!(
            vec!["audit:before:wipe", "guard:before:wipe", "audit:after:false"],
            *log.lock()
        );
    }

    #[test]
    fn test_panicking_handler_becomes_a_failure() {
        let handler = compose(
            params(Vec::new()),
            Arc::new(super::super::service_fn(|_, _| panic!("division by zero"))),
        );
        let err = handler.handle(&passive(), Call::new("div")).unwrap_err();
        assert_eq!("panicked: division by zero", err.to_string());
    }
}
