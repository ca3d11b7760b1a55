//! Pluggable services built on `portico-core`: the distributed directory
//! shared by several hosts, standard request hooks and plug-ins.
pub mod distributed;
pub mod heartbeat;
pub mod hooks;

pub use distributed::{DistributedDirectory, HostRegistry, RemoteEndpoint};
pub use heartbeat::HeartbeatPlugin;
pub use hooks::{CallStatistics, OperationStats, TracingHook};
