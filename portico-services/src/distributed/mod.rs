//! A directory of ports shared by several hosts.
//!
//! Every host (one [`RuntimeContext`](portico_core::RuntimeContext)) gets
//! its own [`HostRegistry`] view of the same [`DistributedDirectory`].
//! Resolving a port owned by another host yields a [`RemoteEndpoint`]: each
//! operation on it is encoded into a [`Frame`], decoded on the owning host
//! and replayed on the real port, and the reply travels back the same way.
//! The bytes are handed over in-process; any transport able to carry them
//! can take that place.
use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
};

use parking_lot::RwLock;
use portico_core::{
    connector::ConnectorSpec,
    interface::InterfaceId,
    port::{PortEndpoint, PortKind},
    registry::Registry,
    Error, Result,
};
use tracing::{debug, info, warn};

mod remote;
mod wire;

pub use remote::RemoteEndpoint;
pub use wire::{Frame, Reply, WireError};

struct Entry {
    host: String,
    interface: InterfaceId,
    kind: PortKind,
    endpoint: Weak<dyn PortEndpoint>,
}

impl Entry {
    fn is_alive(&self) -> bool {
        self.endpoint.strong_count() > 0
    }
}

#[derive(Default)]
pub struct DistributedDirectory {
    entries: RwLock<HashMap<String, Entry>>,
    frames: AtomicU64,
}

impl DistributedDirectory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The registry a host publishes into and resolves through.
    pub fn host(self: &Arc<Self>, host: impl Into<String>) -> Arc<HostRegistry> {
        let host = host.into();
        info!("distributed directory: host {host} joined");
        Arc::new(HostRegistry {
            directory: self.clone(),
            host,
        })
    }

    /// The host a published port lives on.
    pub fn host_of(&self, uri: &str) -> Option<String> {
        self.entries
            .read()
            .get(uri)
            .filter(|e| e.is_alive())
            .map(|e| e.host.clone())
    }

    pub fn uris(&self) -> Vec<String> {
        let mut uris: Vec<String> = self
            .entries
            .read()
            .iter()
            .filter(|(_, e)| e.is_alive())
            .map(|(uri, _)| uri.clone())
            .collect();
        uris.sort();
        uris
    }

    /// Number of frames exchanged between hosts so far.
    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    /// Replays an encoded frame on the port it targets and encodes the reply.
    ///
    /// This is the receiving half of a remote hop; it never fails, decoding
    /// problems and unknown ports travel back as error replies.
    pub fn dispatch(&self, frame: &[u8]) -> Vec<u8> {
        self.frames.fetch_add(1, Ordering::Relaxed);
        let reply = Reply::from(self.replay(frame));
        wire::encode(&reply).unwrap_or_else(|e| {
            // The caller fails to decode an empty reply.
            warn!("distributed directory: reply dropped: {e}");
            Vec::new()
        })
    }

    fn replay(&self, bytes: &[u8]) -> Result<serde_json::Value> {
        let frame: Frame = wire::decode(bytes)?;
        let endpoint = self
            .entries
            .read()
            .get(frame.port())
            .and_then(|e| e.endpoint.upgrade())
            .ok_or_else(|| Error::Unresolved(frame.port().to_string()))?;
        debug!("distributed directory: replaying {frame:?}");
        let unit = serde_json::Value::Null;
        match frame {
            Frame::Deliver { call, .. } => endpoint.deliver(call),
            Frame::DeliverAsync { call, .. } => endpoint.deliver_async(call).map(|_| unit),
            Frame::ObeyConnection {
                peer, connector, ..
            } => endpoint
                .obey_connection(&peer, ConnectorSpec::named(connector))
                .map(|_| unit),
            Frame::ObeyDisconnection { .. } => endpoint.obey_disconnection().map(|_| unit),
            Frame::AttachClient { client, .. } => endpoint.attach_client(&client).map(|_| unit),
            Frame::DetachClient { client, .. } => endpoint.detach_client(&client).map(|_| unit),
        }
    }
}

impl fmt::Debug for DistributedDirectory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DistributedDirectory")
            .field("ports", &self.uris())
            .field("frames", &self.frames())
            .finish()
    }
}

/// One host's view of a [`DistributedDirectory`].
pub struct HostRegistry {
    directory: Arc<DistributedDirectory>,
    host: String,
}

impl HostRegistry {
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn directory(&self) -> &Arc<DistributedDirectory> {
        &self.directory
    }
}

impl Registry for HostRegistry {
    fn publish(&self, uri: &str, endpoint: Arc<dyn PortEndpoint>) -> Result<()> {
        let mut entries = self.directory.entries.write();
        if let Some(existing) = entries.get(uri) {
            if existing.is_alive() {
                return Err(Error::contract(format!(
                    "port uri {uri} is already published by host {}",
                    existing.host
                )));
            }
        }
        entries.insert(
            uri.to_string(),
            Entry {
                host: self.host.clone(),
                interface: endpoint.interface().clone(),
                kind: endpoint.kind(),
                endpoint: Arc::downgrade(&endpoint),
            },
        );
        debug!("host {}: {uri} published in the directory", self.host);
        Ok(())
    }

    fn unpublish(&self, uri: &str) -> Result<()> {
        let mut entries = self.directory.entries.write();
        match entries.get(uri) {
            Some(entry) if entry.host == self.host => {
                entries.remove(uri);
                debug!("host {}: {uri} withdrawn from the directory", self.host);
                Ok(())
            }
            Some(entry) => Err(Error::contract(format!(
                "host {} cannot unpublish {uri} owned by host {}",
                self.host, entry.host
            ))),
            None => Err(Error::contract(format!(
                "port uri {uri} is not in the directory"
            ))),
        }
    }

    fn resolve(&self, uri: &str) -> Option<Arc<dyn PortEndpoint>> {
        let entries = self.directory.entries.read();
        let entry = entries.get(uri)?;
        if entry.host == self.host {
            return entry.endpoint.upgrade();
        }
        if !entry.is_alive() {
            return None;
        }
        Some(Arc::new(RemoteEndpoint::new(
            uri.to_string(),
            entry.interface.clone(),
            entry.kind,
            entry.host.clone(),
            Arc::downgrade(&self.directory),
        )))
    }
}

impl fmt::Debug for HostRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostRegistry")
            .field("host", &self.host)
            .finish()
    }
}
