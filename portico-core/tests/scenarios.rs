use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        mpsc, Arc,
    },
    thread,
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use portico_core::{
    executor::{PoolRef, WorkerPool, STANDARD_POOL_URI},
    interface::{Call, InterfaceId},
    plugin::Plugin,
    port::{Connectable, InboundPort, OutboundPort, Port, RequestRelay},
    service::{service_fn, RequestHook, RequestInfo},
    AnyResult, Component, ComponentState, Error, RuntimeContext,
};
use serde_json::{json, Value};

const CALCULATOR: &str = "demo.Calculator";

fn context() -> Arc<RuntimeContext> {
    RuntimeContext::builder().build().unwrap()
}

fn calculator(context: &Arc<RuntimeContext>, uri: &str) -> Component {
    Component::builder(context)
        .uri(uri)
        .offers(
            CALCULATOR,
            service_fn(|_, call| match call.operation.as_str() {
                "add" => {
                    let (a, b): (i64, i64) = call.args()?;
                    Ok(json!(a + b))
                }
                "thread" => Ok(json!(thread::current().name().unwrap_or_default())),
                other => anyhow::bail!("no operation {other}"),
            }),
        )
        .build()
        .unwrap()
}

fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    while std::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    cond()
}

fn stop(component: &Component) {
    if component.is_started() {
        component.finalise().unwrap();
    }
    component.shutdown().unwrap();
    assert!(component.await_termination(Duration::from_secs(5)));
}

#[test]
fn test_call_runs_on_the_callers_thread_when_server_is_passive() {
    let context = context();
    let server = calculator(&context, "c2");
    let client = Component::builder(&context)
        .uri("c1")
        .threads(1, 0)
        .requires(CALCULATOR)
        .build()
        .unwrap();
    assert!(server.is_passive());
    assert!(!client.is_passive());
    server.start().unwrap();
    client.start().unwrap();

    let inbound = InboundPort::create_with_uri(&server, "calc-in", CALCULATOR).unwrap();
    inbound.publish().unwrap();
    let outbound = OutboundPort::create(&client, CALCULATOR).unwrap();
    outbound.publish().unwrap();
    outbound.do_connection("calc-in", "basic".into()).unwrap();
    assert_eq!(Some("calc-in".to_string()), outbound.server_port_uri());

    let port = outbound.clone();
    let (sum, served_on, caller) = client
        .submit_request(move |_| {
            let sum: i64 = port.call_with("add", &(2, 3))?;
            let served_on: String = port.call_with("thread", &())?;
            let caller = thread::current().name().unwrap_or_default().to_string();
            Ok((sum, served_on, caller))
        })
        .unwrap()
        .get()
        .unwrap();
    assert_eq!(5, sum);
    assert!(served_on.starts_with(STANDARD_POOL_URI), "{served_on}");
    assert_eq!(caller, served_on);

    outbound.do_disconnection().unwrap();
    assert!(!outbound.connected());
    assert!(outbound.is_published());
    stop(&client);
    stop(&server);
}

#[test]
fn test_disconnecting_an_unconnected_port_is_rejected() {
    let context = context();
    let client = Component::builder(&context)
        .requires(CALCULATOR)
        .build()
        .unwrap();
    let outbound = OutboundPort::create(&client, CALCULATOR).unwrap();
    outbound.publish().unwrap();
    let err = outbound.do_disconnection().unwrap_err();
    assert!(err.is_contract_violation());
    let err = client.do_port_disconnection(outbound.uri()).unwrap_err();
    assert!(err.is_contract_violation());
}

#[test]
fn test_tasks_on_two_threads_all_complete() {
    let context = context();
    let component = Component::builder(&context).threads(2, 0).build().unwrap();
    component.start().unwrap();
    let counter = Arc::new(Mutex::new(0usize));
    let handles = (0..5)
        .map(|_| {
            let counter = counter.clone();
            component
                .run_task(move |_| {
                    *counter.lock() += 1;
                    Ok(())
                })
                .unwrap()
        })
        .collect::<Vec<_>>();
    assert!(wait_until(Duration::from_secs(5), || handles
        .iter()
        .all(|h| h.is_done())));
    assert_eq!(5, *counter.lock());
    stop(&component);
}

#[test]
fn test_shutdown_now_stops_scheduled_work() {
    let context = context();
    let component = Component::builder(&context).threads(0, 1).build().unwrap();
    component.start().unwrap();
    let runs = Arc::new(AtomicUsize::new(0));
    let counted = runs.clone();
    let periodic = component
        .schedule_task_at_fixed_rate(Duration::ZERO, Duration::from_millis(2), move |_| {
            counted.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();
    let delayed = component
        .schedule_task(Duration::from_secs(60), |_| Ok(()))
        .unwrap();
    assert!(wait_until(Duration::from_secs(5), || runs
        .load(Ordering::SeqCst)
        >= 3));

    component.finalise().unwrap();
    component.shutdown_now().unwrap();
    assert!(wait_until(Duration::from_secs(1), || component.is_shutdown()));
    thread::sleep(Duration::from_millis(10));
    let seen = runs.load(Ordering::SeqCst);
    thread::sleep(Duration::from_millis(50));
    assert_eq!(seen, runs.load(Ordering::SeqCst));
    assert!(component.await_termination(Duration::from_secs(5)));
    assert!(delayed.is_cancelled());
    assert!(periodic.is_done());
    assert_eq!(ComponentState::Terminated, component.state());
}

#[test]
fn test_fixed_rate_runs_never_overlap() {
    let context = context();
    let component = Component::builder(&context).threads(0, 1).build().unwrap();
    component.start().unwrap();
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let runs = Arc::new(AtomicUsize::new(0));
    let (r, p, n) = (running.clone(), peak.clone(), runs.clone());
    let handle = component
        .schedule_task_at_fixed_rate(Duration::ZERO, Duration::from_millis(1), move |_| {
            let now = r.fetch_add(1, Ordering::SeqCst) + 1;
            p.fetch_max(now, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(5));
            r.fetch_sub(1, Ordering::SeqCst);
            n.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();
    assert!(wait_until(Duration::from_secs(5), || runs
        .load(Ordering::SeqCst)
        >= 4));
    assert!(handle.cancel());
    assert_eq!(1, peak.load(Ordering::SeqCst));
    stop(&component);
}

#[test]
fn test_lifecycle_never_moves_backward() {
    let context = context();
    let component = Component::builder(&context).threads(1, 0).build().unwrap();
    assert_eq!(ComponentState::Initialised, component.state());
    assert!(component.finalise().unwrap_err().is_contract_violation());
    assert!(component.run_task(|_| Ok(())).unwrap_err().is_contract_violation());

    component.start().unwrap();
    assert!(component.start().unwrap_err().is_contract_violation());
    assert!(component.shutdown().unwrap_err().is_contract_violation());

    component.finalise().unwrap();
    assert_eq!(ComponentState::Finalised, component.state());
    assert!(component.start().unwrap_err().is_contract_violation());
    assert!(component.run_task(|_| Ok(())).unwrap_err().is_contract_violation());

    component.shutdown().unwrap();
    assert!(component.state() >= ComponentState::ShuttingDown);
    assert!(component.await_termination(Duration::from_secs(5)));
    assert!(component.is_terminated());
    assert!(component.start().unwrap_err().is_contract_violation());
    assert!(component.finalise().unwrap_err().is_contract_violation());
    assert!(component.shutdown_now().unwrap_err().is_contract_violation());
    assert!(component
        .create_new_executor_service("late", 1, false)
        .unwrap_err()
        .is_contract_violation());
}

#[test]
fn test_pool_indices_stay_stable() {
    let context = context();
    let component = Component::builder(&context).threads(1, 1).build().unwrap();
    let mut created = Vec::new();
    for (i, uri) in ["io", "batch", "timers"].into_iter().enumerate() {
        let index = component
            .create_new_executor_service(uri, 1, i % 2 == 0)
            .unwrap();
        created.push((uri, index));
    }
    assert!(component
        .create_new_executor_service("io", 2, false)
        .unwrap_err()
        .is_contract_violation());
    for (uri, index) in &created {
        assert_eq!(*index, component.executor_service_index(uri).unwrap());
        assert!(component.valid_executor_service_index(*index));
        assert_eq!(
            *uri,
            component.executor_service(PoolRef::Index(*index)).unwrap().uri()
        );
    }
    assert!(component.is_schedulable_executor_service("timers").unwrap());
    assert!(!component.is_schedulable_executor_service("batch").unwrap());
    assert!(!component.valid_executor_service_index(5));
    assert_eq!(5, component.total_threads());

    component.start().unwrap();
    assert!(component
        .schedule_task_on("batch", Duration::ZERO, |_| Ok(()))
        .unwrap_err()
        .is_contract_violation());
    assert!(component
        .run_task_on("missing", |_| Ok(()))
        .unwrap_err()
        .is_contract_violation());
    let value = component
        .handle_request_sync_on("timers", |owner| Ok(owner.uri().len()))
        .unwrap();
    assert_eq!(component.uri().len(), value);
    stop(&component);
}

#[test]
fn test_serialised_execution_needs_exactly_one_thread() {
    let context = context();
    let single = Component::builder(&context).threads(1, 0).build().unwrap();
    assert!(single.has_serialised_execution());
    let double = Component::builder(&context).threads(2, 0).build().unwrap();
    assert!(!double.has_serialised_execution());
    let mixed = Component::builder(&context).threads(1, 1).build().unwrap();
    assert!(!mixed.has_serialised_execution());
    let passive = Component::builder(&context).build().unwrap();
    assert!(!passive.has_serialised_execution());
    for component in [single, double, mixed] {
        component.start().unwrap();
        stop(&component);
    }
}

#[derive(Clone, Default)]
struct Audit {
    entries: Arc<Mutex<Vec<String>>>,
}

impl RequestHook for Audit {
    fn before(&self, info: &RequestInfo<'_>) -> AnyResult<()> {
        anyhow::ensure!(info.operation != "forbidden", "operation refused");
        self.entries.lock().push(format!("before {}", info.operation));
        Ok(())
    }

    fn after(&self, info: &RequestInfo<'_>, result: &AnyResult<Value>, _elapsed: Duration) {
        self.entries
            .lock()
            .push(format!("after {} ok={}", info.operation, result.is_ok()));
    }
}

#[test]
fn test_hooks_wrap_every_served_call() {
    let context = context();
    let audit = Audit::default();
    let server = Component::builder(&context)
        .uri("audited")
        .offers(
            CALCULATOR,
            service_fn(|_, call| {
                let (a, b): (i64, i64) = call.args()?;
                Ok(json!(a * b))
            }),
        )
        .hook(audit.clone())
        .build()
        .unwrap();
    let client = Component::builder(&context)
        .requires(CALCULATOR)
        .build()
        .unwrap();
    server.start().unwrap();
    client.start().unwrap();
    let inbound = InboundPort::create(&server, CALCULATOR).unwrap();
    inbound.publish().unwrap();
    let outbound = OutboundPort::create(&client, CALCULATOR).unwrap();
    outbound.publish().unwrap();
    client
        .do_port_connection(outbound.uri(), inbound.uri(), "basic")
        .unwrap();

    let product: i64 = outbound.call_with("mul", &(6, 7)).unwrap();
    assert_eq!(42, product);
    assert!(outbound.call(Call::new("forbidden")).is_err());
    assert!(outbound.call(Call::new("mul")).is_err());
    assert_eq!(
        vec!["before mul", "after mul ok=true", "before mul", "after mul ok=false"],
        *audit.entries.lock()
    );
}

struct Recorder {
    uri: &'static str,
    events: Arc<Mutex<Vec<String>>>,
}

impl Plugin for Recorder {
    fn uri(&self) -> &str {
        self.uri
    }

    fn install(&self, owner: &Component) -> AnyResult<()> {
        self.events
            .lock()
            .push(format!("install {} on {}", self.uri, owner.uri()));
        Ok(())
    }

    fn finalise(&self, _owner: &Component) -> AnyResult<()> {
        self.events.lock().push(format!("finalise {}", self.uri));
        Ok(())
    }

    fn uninstall(&self, _owner: &Component) -> AnyResult<()> {
        self.events.lock().push(format!("uninstall {}", self.uri));
        Ok(())
    }
}

#[test]
fn test_plugins_follow_the_lifecycle() {
    let context = context();
    let events = Arc::new(Mutex::new(Vec::new()));
    let component = Component::builder(&context)
        .uri("host")
        .plugin(Recorder {
            uri: "first",
            events: events.clone(),
        })
        .build()
        .unwrap();
    assert!(!component.is_installed("first"));
    let late = Arc::new(Recorder {
        uri: "second",
        events: events.clone(),
    });
    assert!(component
        .install_plugin(late.clone())
        .unwrap_err()
        .is_contract_violation());

    component.start().unwrap();
    assert!(component.is_installed("first"));
    component.install_plugin(late.clone()).unwrap();
    assert!(component
        .install_plugin(late)
        .unwrap_err()
        .is_contract_violation());
    assert_eq!(vec!["first", "second"], component.plugin_uris());

    component.finalise().unwrap();
    assert!(component.plugin_uris().is_empty());
    assert_eq!(
        vec![
            "install first on host",
            "install second on host",
            "finalise second",
            "uninstall second",
            "finalise first",
            "uninstall first",
        ],
        *events.lock()
    );
}

#[test]
fn test_components_describe_themselves() {
    let context = context();
    let server = calculator(&context, "described");
    server.create_new_executor_service("extra", 2, true).unwrap();
    server.start().unwrap();

    let probe = Component::builder(&context)
        .requires("portico.introspection")
        .build()
        .unwrap();
    probe.start().unwrap();
    let port = OutboundPort::create(&probe, "portico.introspection").unwrap();
    port.publish().unwrap();
    port.do_connection("described-introspection", "basic".into())
        .unwrap();

    let description = server.describe().unwrap();
    assert_eq!("described", description.uri);
    assert_eq!(ComponentState::Started, description.state);
    assert!(description.offered.contains(&CALCULATOR.to_string()));
    assert_eq!(1, description.executors.len());
    assert_eq!(2, description.executors[0].threads);
    assert_eq!(
        serde_json::to_value(&description).unwrap(),
        port.call(Call::new("describe")).unwrap()
    );
    let state: ComponentState = port.call_with("state", &()).unwrap();
    assert_eq!(ComponentState::Started, state);
    assert!(port.call(Call::new("reboot")).is_err());

    assert!(server
        .find_inbound_port_uris_from_interface(&InterfaceId::from("portico.introspection"))
        .unwrap()
        .contains(&"described-introspection".to_string()));
    stop(&server);
}

#[test]
fn test_subcomponents_follow_their_parent() {
    let context = context();
    let parent = Component::builder(&context).threads(1, 0).build().unwrap();
    let child = Component::builder(&context).threads(0, 1).build().unwrap();
    parent.add_subcomponent(child.clone()).unwrap();
    parent.start().unwrap();
    assert!(child.is_started());
    assert!(parent
        .add_subcomponent(Component::builder(&context).build().unwrap())
        .unwrap_err()
        .is_contract_violation());

    parent.finalise().unwrap();
    assert!(child.is_finalised());
    parent.shutdown().unwrap();
    assert!(parent.await_termination(Duration::from_secs(5)));
    assert!(child.is_terminated());
}

#[test]
fn test_subcomponent_cycles_are_rejected() {
    let context = context();
    let a = Component::builder(&context).uri("a").build().unwrap();
    let b = Component::builder(&context).uri("b").build().unwrap();
    let c = Component::builder(&context).uri("c").build().unwrap();
    a.add_subcomponent(b.clone()).unwrap();
    b.add_subcomponent(c.clone()).unwrap();

    assert!(a.add_subcomponent(a.clone()).unwrap_err().is_contract_violation());
    assert!(b.add_subcomponent(a.clone()).unwrap_err().is_contract_violation());
    assert!(c.add_subcomponent(a.clone()).unwrap_err().is_contract_violation());
    assert!(c.subcomponents().is_empty());

    a.start().unwrap();
    assert!(b.is_started() && c.is_started());
    stop(&a);
    assert!(c.is_terminated());
}

#[test]
fn test_failing_periodic_task_never_runs_again() {
    let context = context();
    let component = Component::builder(&context).threads(0, 1).build().unwrap();
    component.start().unwrap();

    let runs = Arc::new(AtomicUsize::new(0));
    let counted = runs.clone();
    let handle = component
        .schedule_task_at_fixed_rate(Duration::ZERO, Duration::from_millis(5), move |_| {
            if counted.fetch_add(1, Ordering::SeqCst) == 2 {
                anyhow::bail!("third run fails");
            }
            Ok(())
        })
        .unwrap();
    let err = handle.get_timeout(Duration::from_secs(5)).unwrap().unwrap_err();
    assert!(matches!(err, Error::Execution(_)));
    thread::sleep(Duration::from_millis(50));
    assert_eq!(3, runs.load(Ordering::SeqCst));

    let panics = Arc::new(AtomicUsize::new(0));
    let counted = panics.clone();
    let handle = component
        .schedule_task_with_fixed_delay(Duration::ZERO, Duration::from_millis(5), move |_| {
            counted.fetch_add(1, Ordering::SeqCst);
            panic!("periodic body panicked");
        })
        .unwrap();
    let err = handle.get_timeout(Duration::from_secs(5)).unwrap().unwrap_err();
    assert!(matches!(err, Error::Execution(_)));
    thread::sleep(Duration::from_millis(50));
    assert_eq!(1, panics.load(Ordering::SeqCst));
    stop(&component);
}

#[test]
fn test_fixed_delay_runs_wait_after_each_run() {
    let context = context();
    let component = Component::builder(&context).threads(0, 2).build().unwrap();
    component.start().unwrap();

    let runs = Arc::new(Mutex::new(Vec::new()));
    let recorded = runs.clone();
    let handle = component
        .schedule_task_with_fixed_delay(
            Duration::from_millis(10),
            Duration::from_millis(30),
            move |_| {
                let start = Instant::now();
                thread::sleep(Duration::from_millis(20));
                recorded.lock().push((start, Instant::now()));
                Ok(())
            },
        )
        .unwrap();
    assert!(wait_until(Duration::from_secs(5), || runs.lock().len() >= 4));
    assert!(handle.cancel());

    let runs = runs.lock().clone();
    for pair in runs.windows(2) {
        let (_, previous_end) = pair[0];
        let (next_start, _) = pair[1];
        assert!(next_start >= previous_end);
        assert!(next_start - previous_end >= Duration::from_millis(25));
    }
    stop(&component);
}

#[test]
fn test_scheduled_and_async_requests() {
    let context = context();
    let component = Component::builder(&context).threads(1, 1).build().unwrap();
    component.start().unwrap();

    let started = Instant::now();
    let answer: i64 = component
        .schedule_request_sync(Duration::from_millis(20), |_| Ok(41 + 1))
        .unwrap();
    assert_eq!(42, answer);
    assert!(started.elapsed() >= Duration::from_millis(20));

    let (tx, rx) = mpsc::channel();
    let scheduled = tx.clone();
    component
        .schedule_request_async(Duration::from_millis(10), move |_| {
            scheduled.send("scheduled").unwrap();
            Ok(1)
        })
        .unwrap();
    component
        .handle_request_async(move |_| {
            assert!(thread::current()
                .name()
                .unwrap_or_default()
                .starts_with(STANDARD_POOL_URI));
            tx.send("immediate").unwrap();
            Ok("ignored")
        })
        .unwrap();
    let mut seen = vec![
        rx.recv_timeout(Duration::from_secs(5)).unwrap(),
        rx.recv_timeout(Duration::from_secs(5)).unwrap(),
    ];
    seen.sort();
    assert_eq!(vec!["immediate", "scheduled"], seen);

    let err = component
        .handle_request_sync(|_| -> AnyResult<()> { anyhow::bail!("refused") })
        .unwrap_err();
    assert!(matches!(err, Error::Execution(_)));
    let err = component
        .schedule_request_sync_on(STANDARD_POOL_URI, Duration::from_millis(1), |_| Ok(()))
        .unwrap_err();
    assert!(err.is_contract_violation());
    stop(&component);
}

#[test]
fn test_shut_down_pool_rejects_instead_of_violating() {
    let context = context();
    let component = Component::builder(&context).threads(1, 0).build().unwrap();
    let batch = component
        .create_new_executor_service("batch", 1, true)
        .unwrap();
    component.start().unwrap();
    component.run_task_on("batch", |_| Ok(())).unwrap().get().unwrap();

    component.executor_service("batch").unwrap().pool().shutdown();
    for err in [
        component.run_task_on("batch", |_| Ok(())).unwrap_err(),
        component.run_task_on(batch, |_| Ok(())).unwrap_err(),
        component
            .schedule_task_on(batch, Duration::from_millis(1), |_| Ok(()))
            .unwrap_err(),
        component
            .handle_request_sync_on("batch", |_| Ok(()))
            .unwrap_err(),
    ] {
        assert!(err.is_rejected(), "{err}");
        assert!(!err.is_contract_violation());
    }

    // the other pools keep serving
    component.run_task(|_| Ok(())).unwrap().get().unwrap();
    stop(&component);
}
