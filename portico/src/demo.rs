//! Component types the deployment binary knows how to build.
use std::time::Duration;

use anyhow::Context;
use portico_core::{
    factory::ComponentFactories,
    interface::Call,
    port::{InboundPort, OutboundPort, Port, RequestRelay},
    service::service_fn,
    AnyResult, Component, Result,
};
use portico_services::{CallStatistics, HeartbeatPlugin, TracingHook};
use serde_json::json;
use tracing::{info, warn};

pub const CALCULATOR: &str = "demo.Calculator";

const HEARTBEAT_PERIOD: Duration = Duration::from_millis(50);

pub fn calculator_port_uri(component_uri: &str) -> String {
    format!("{component_uri}-calculator")
}

pub fn factories() -> Result<ComponentFactories> {
    let mut factories = ComponentFactories::new();
    factories.register("calculator", |context, config| {
        let mut builder = Component::builder(context)
            .configure(config)
            .offers(CALCULATOR, service_fn(|_, call| calculate(call)))
            .hook(TracingHook)
            .hook(CallStatistics::new());
        if config.schedulable_threads > 0 {
            builder = builder.plugin(HeartbeatPlugin::new("heartbeat", HEARTBEAT_PERIOD));
        }
        let component = builder.build()?;
        let port =
            InboundPort::create_with_uri(&component, calculator_port_uri(component.uri()), CALCULATOR)?;
        port.publish()?;
        Ok(component)
    })?;
    factories.register("client", |context, config| {
        let component = Component::builder(context)
            .configure(config)
            .requires(CALCULATOR)
            .on_execute(exercise)
            .build()?;
        let port =
            OutboundPort::create_with_uri(&component, calculator_port_uri(component.uri()), CALCULATOR)?;
        port.publish()?;
        Ok(component)
    })?;
    Ok(factories)
}

fn calculate(call: Call) -> AnyResult<serde_json::Value> {
    let (a, b): (i64, i64) = call.args()?;
    let value = match call.operation.as_str() {
        "add" => a.checked_add(b),
        "sub" => a.checked_sub(b),
        "mul" => a.checked_mul(b),
        "div" => {
            anyhow::ensure!(b != 0, "division of {a} by zero");
            a.checked_div(b)
        }
        other => anyhow::bail!("unknown operation {other}"),
    };
    let value = value.with_context(|| format!("{} of {a} and {b} overflows", call.operation))?;
    Ok(json!(value))
}

/// Issues a handful of calls through the client's calculator port.
fn exercise(owner: &Component) -> AnyResult<()> {
    let handle = owner.port(&calculator_port_uri(owner.uri()))?;
    let port = handle
        .as_outbound()
        .context("calculator port is not outbound")?;
    anyhow::ensure!(port.connected(), "calculator port is not connected");
    for i in 1..=5i64 {
        let sum: i64 = port.call_with("add", &(i, i * 10))?;
        let product: i64 = port.call_with("mul", &(i, sum))?;
        info!("{}: {i} + {} = {sum}, {i} * {sum} = {product}", owner.uri(), i * 10);
    }
    match port.call_with::<_, i64>("div", &(1, 0)) {
        Ok(v) => warn!("{}: division by zero returned {v}", owner.uri()),
        Err(e) => info!("{}: division by zero refused: {e}", owner.uri()),
    }
    Ok(())
}
