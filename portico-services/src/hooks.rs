//! Standard request hooks.
use std::{collections::BTreeMap, sync::Arc, time::Duration};

use parking_lot::Mutex;
use portico_core::{
    service::{RequestHook, RequestInfo},
    AnyResult,
};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

/// Logs every served call and its outcome.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingHook;

impl RequestHook for TracingHook {
    fn before(&self, info: &RequestInfo<'_>) -> AnyResult<()> {
        debug!(
            "{} serving {}::{}",
            info.component, info.interface, info.operation
        );
        Ok(())
    }

    fn after(&self, info: &RequestInfo<'_>, outcome: &AnyResult<Value>, elapsed: Duration) {
        match outcome {
            Ok(_) => debug!(
                "{} served {}::{} in {elapsed:?}",
                info.component, info.interface, info.operation
            ),
            Err(e) => warn!(
                "{} failed {}::{} after {elapsed:?}: {e:#}",
                info.component, info.interface, info.operation
            ),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct OperationStats {
    pub calls: u64,
    pub failures: u64,
    pub total: Duration,
    pub max: Duration,
}

impl OperationStats {
    pub fn mean(&self) -> Duration {
        match u32::try_from(self.calls) {
            Ok(0) | Err(_) => Duration::ZERO,
            Ok(calls) => self.total / calls,
        }
    }
}

/// Counts calls, failures and latency per `interface::operation`.
///
/// Clones share their counters, so one clone can be given to a component
/// builder and another kept for reading.
#[derive(Debug, Default, Clone)]
pub struct CallStatistics {
    table: Arc<Mutex<BTreeMap<String, OperationStats>>>,
}

impl CallStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, interface: &str, operation: &str) -> Option<OperationStats> {
        self.table
            .lock()
            .get(&format!("{interface}::{operation}"))
            .copied()
    }

    pub fn snapshot(&self) -> BTreeMap<String, OperationStats> {
        self.table.lock().clone()
    }

    pub fn total_calls(&self) -> u64 {
        self.table.lock().values().map(|s| s.calls).sum()
    }
}

impl RequestHook for CallStatistics {
    fn after(&self, info: &RequestInfo<'_>, outcome: &AnyResult<Value>, elapsed: Duration) {
        let mut table = self.table.lock();
        let stats = table
            .entry(format!("{}::{}", info.interface, info.operation))
            .or_default();
        stats.calls += 1;
        if outcome.is_err() {
            stats.failures += 1;
        }
        stats.total += elapsed;
        stats.max = stats.max.max(elapsed);
    }
}
