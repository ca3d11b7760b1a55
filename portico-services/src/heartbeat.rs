//! A plug-in beating at a fixed rate on its owner's schedulable pool.
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::Mutex;
use portico_core::{executor::TaskHandle, plugin::Plugin, AnyResult, Component};
use tracing::{debug, info};

struct Inner {
    uri: String,
    period: Duration,
    beats: AtomicU64,
    task: Mutex<Option<TaskHandle<()>>>,
}

/// Counts beats while installed; clones observe the same counter.
#[derive(Clone)]
pub struct HeartbeatPlugin {
    inner: Arc<Inner>,
}

impl HeartbeatPlugin {
    pub fn new(uri: impl Into<String>, period: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                uri: uri.into(),
                period,
                beats: AtomicU64::new(0),
                task: Mutex::new(None),
            }),
        }
    }

    pub fn period(&self) -> Duration {
        self.inner.period
    }

    pub fn beats(&self) -> u64 {
        self.inner.beats.load(Ordering::Relaxed)
    }

    pub fn is_beating(&self) -> bool {
        self.inner
            .task
            .lock()
            .as_ref()
            .is_some_and(|task| !task.is_done())
    }

    fn stop(&self) {
        if let Some(task) = self.inner.task.lock().take() {
            task.cancel();
            info!(
                "heartbeat {} stopped after {} beat(s)",
                self.inner.uri,
                self.beats()
            );
        }
    }
}

impl Plugin for HeartbeatPlugin {
    fn uri(&self) -> &str {
        &self.inner.uri
    }

    /// Needs a schedulable pool on the owner.
    fn install(&self, owner: &Component) -> AnyResult<()> {
        let inner = self.inner.clone();
        let task = owner.schedule_task_at_fixed_rate(
            Duration::ZERO,
            self.inner.period,
            move |owner| {
                let beat = inner.beats.fetch_add(1, Ordering::Relaxed) + 1;
                debug!("heartbeat {} of {}: beat {beat}", inner.uri, owner.uri());
                Ok(())
            },
        )?;
        *self.inner.task.lock() = Some(task);
        Ok(())
    }

    fn finalise(&self, _owner: &Component) -> AnyResult<()> {
        self.stop();
        Ok(())
    }

    fn uninstall(&self, _owner: &Component) -> AnyResult<()> {
        self.stop();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use portico_core::{Error, RuntimeContext};

    use super::*;

    #[test]
    fn test_beats_until_finalised() {
        let context = RuntimeContext::builder().build().unwrap();
        let heartbeat = HeartbeatPlugin::new("heartbeat", Duration::from_millis(2));
        let component = Component::builder(&context)
            .threads(0, 1)
            .plugin(heartbeat.clone())
            .build()
            .unwrap();
        component.start().unwrap();
        assert!(component.is_installed("heartbeat"));

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while heartbeat.beats() < 3 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(2));
        }
        assert!(heartbeat.beats() >= 3);
        assert!(heartbeat.is_beating());

        component.finalise().unwrap();
        assert!(!heartbeat.is_beating());
        let beats = heartbeat.beats();
        thread::sleep(Duration::from_millis(20));
        assert!(heartbeat.beats() <= beats + 1);
        component.shutdown().unwrap();
        assert!(component.await_termination(Duration::from_secs(5)));
    }

    #[test]
    fn test_needs_a_schedulable_pool() {
        let context = RuntimeContext::builder().build().unwrap();
        let component = Component::builder(&context).threads(1, 0).build().unwrap();
        component.start().unwrap();
        let err = component
            .install_plugin(Arc::new(HeartbeatPlugin::new("heartbeat", Duration::from_millis(5))))
            .unwrap_err();
        assert!(matches!(err, Error::Execution(_)), "{err}");
        assert!(!component.is_installed("heartbeat"));
    }
}
