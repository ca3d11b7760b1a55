use std::{collections::HashMap, sync::Arc};

use super::{PoolRef, WorkerPool};
use crate::Result;

/// A pool as seen by its owning component: URI, stable index and handle.
pub struct ExecutorServiceManager {
    uri: String,
    index: usize,
    pool: Arc<dyn WorkerPool>,
}

impl ExecutorServiceManager {
    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn threads(&self) -> usize {
        self.pool.threads()
    }

    pub fn is_schedulable(&self) -> bool {
        self.pool.is_schedulable()
    }

    pub fn pool(&self) -> &Arc<dyn WorkerPool> {
        &self.pool
    }
}

impl std::fmt::Debug for ExecutorServiceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorServiceManager")
            .field("uri", &self.uri)
            .field("index", &self.index)
            .field("threads", &self.pool.threads())
            .field("schedulable", &self.pool.is_schedulable())
            .finish()
    }
}

/// Append-only table of a component's pools.
///
/// Entries are never removed, so the index handed out for a URI stays valid
/// for the lifetime of the component.
#[derive(Default)]
pub(crate) struct ExecutorTable {
    managers: Vec<Arc<ExecutorServiceManager>>,
    by_uri: HashMap<String, usize>,
}

impl ExecutorTable {
    pub(crate) fn contains(&self, uri: &str) -> bool {
        self.by_uri.contains_key(uri)
    }

    pub(crate) fn insert(&mut self, pool: Arc<dyn WorkerPool>) -> Result<usize> {
        let uri = pool.uri().to_string();
        ensure_contract!(
            !self.by_uri.contains_key(&uri),
            "executor service {uri} already exists"
        );
        let index = self.managers.len();
        self.managers.push(Arc::new(ExecutorServiceManager {
            uri: uri.clone(),
            index,
            pool,
        }));
        self.by_uri.insert(uri, index);
        Ok(index)
    }

    pub(crate) fn index_of(&self, uri: &str) -> Option<usize> {
        self.by_uri.get(uri).copied()
    }

    pub(crate) fn get(&self, index: usize) -> Option<&Arc<ExecutorServiceManager>> {
        self.managers.get(index)
    }

    /// Resolves an explicit selector; `PoolRef::Default` is resolved by the component.
    pub(crate) fn lookup(&self, pool: &PoolRef) -> Option<&Arc<ExecutorServiceManager>> {
        match pool {
            PoolRef::Default => None,
            PoolRef::Uri(uri) => self.index_of(uri).and_then(|i| self.get(i)),
            PoolRef::Index(index) => self.get(*index),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.managers.len()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Arc<ExecutorServiceManager>> {
        self.managers.iter()
    }

    pub(crate) fn total_threads(&self) -> usize {
        self.managers.iter().map(|m| m.threads()).sum()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::executor::{Cadence, Job, RepeatingJob};

    struct NullPool(String, bool);

    impl WorkerPool for NullPool {
        fn uri(&self) -> &str {
            &self.0
        }
        fn threads(&self) -> usize {
            1
        }
        fn is_schedulable(&self) -> bool {
            self.1
        }
        fn execute(&self, _job: Job) -> Result<()> {
            Ok(())
        }
        fn schedule(&self, _job: Job, _delay: Duration) -> Result<()> {
            Ok(())
        }
        fn schedule_repeating(&self, _: RepeatingJob, _: Duration, _: Cadence) -> Result<()> {
            Ok(())
        }
        fn shutdown(&self) {}
        fn shutdown_now(&self) {}
        fn is_shutdown(&self) -> bool {
            false
        }
        fn is_terminated(&self) -> bool {
            false
        }
        fn await_termination(&self, _timeout: Duration) -> bool {
            false
        }
    }

    #[test]
    fn test_indices_are_stable_and_never_reused() {
        let mut table = ExecutorTable::default();
        let a = table
            .insert(Arc::new(NullPool("a".to_string(), false)))
            .unwrap();
        let b = table
            .insert(Arc::new(NullPool("b".to_string(), true)))
            .unwrap();
        assert_eq!((0, 1), (a, b));
        assert!(table
            .insert(Arc::new(NullPool("a".to_string(), true)))
            .unwrap_err()
            .is_contract_violation());
        assert_eq!(Some(0), table.index_of("a"));
        assert_eq!("b", table.lookup(&PoolRef::Index(1)).unwrap().uri());
        assert!(table.lookup(&PoolRef::from("b")).unwrap().is_schedulable());
        assert!(table.lookup(&PoolRef::Index(2)).is_none());
        assert_eq!(2, table.total_threads());
    }
}
