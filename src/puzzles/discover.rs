//! # Discovery registration puzzle.
//!
//! Announces the running service to a registry when the core starts and
//! withdraws it on shutdown. The registry itself stays behind the
//! [`ServiceRegistry`] trait: production deployments plug a real
//! discovery client in, tests and static topologies use
//! [`ManualRegistry`].

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::MountError;
use crate::options::Options;
use crate::puzzle::Puzzle;

/// A registered service instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceEntry {
    /// Service name.
    pub name: String,
    /// Advertised address.
    pub addr: SocketAddr,
    /// Service tags, in registration order.
    pub tags: Vec<String>,
}

/// A service discovery backend.
#[async_trait]
pub trait ServiceRegistry: Send + Sync {
    /// Announces an instance.
    async fn register(&self, entry: &ServiceEntry) -> Result<(), MountError>;

    /// Withdraws an instance. Must be idempotent.
    async fn deregister(&self, entry: &ServiceEntry) -> Result<(), MountError>;

    /// Instances currently registered under `name`.
    async fn discover(&self, name: &str) -> Result<Vec<ServiceEntry>, MountError>;
}

/// In-memory registry for tests and static topologies.
#[derive(Default)]
pub struct ManualRegistry {
    entries: Mutex<HashMap<String, Vec<ServiceEntry>>>,
}

impl ManualRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ServiceRegistry for ManualRegistry {
    async fn register(&self, entry: &ServiceEntry) -> Result<(), MountError> {
        let mut entries = self.entries.lock().expect("manual registry lock");
        let instances = entries.entry(entry.name.clone()).or_default();
        if !instances.iter().any(|existing| existing.addr == entry.addr) {
            instances.push(entry.clone());
        }
        Ok(())
    }

    async fn deregister(&self, entry: &ServiceEntry) -> Result<(), MountError> {
        let mut entries = self.entries.lock().expect("manual registry lock");
        if let Some(instances) = entries.get_mut(&entry.name) {
            instances.retain(|existing| existing.addr != entry.addr);
        }
        Ok(())
    }

    async fn discover(&self, name: &str) -> Result<Vec<ServiceEntry>, MountError> {
        let entries = self.entries.lock().expect("manual registry lock");
        Ok(entries.get(name).cloned().unwrap_or_default())
    }
}

/// Enables discovery registration against `registry`.
pub fn enable(opts: &mut Options, registry: Arc<dyn ServiceRegistry>) {
    opts.register_puzzle(Arc::new(DiscoverPuzzle::new(registry)));
}

/// The registration puzzle.
pub struct DiscoverPuzzle {
    registry: Arc<dyn ServiceRegistry>,
    registered: Mutex<Option<ServiceEntry>>,
}

impl DiscoverPuzzle {
    pub fn new(registry: Arc<dyn ServiceRegistry>) -> Self {
        Self {
            registry,
            registered: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Puzzle for DiscoverPuzzle {
    fn name(&self) -> &str {
        "discover-register"
    }

    async fn start(&self, _ctx: CancellationToken, opts: Arc<Options>) -> Result<(), MountError> {
        let addr = opts
            .listener_addr()
            .ok_or_else(|| MountError::failed("discovery registration requires a listener"))?;
        let entry = ServiceEntry {
            name: opts.service_name.clone(),
            addr,
            tags: opts.tags.clone(),
        };

        self.registry.register(&entry).await?;
        tracing::info!(service = %entry.name, %addr, "registered with discovery");
        *self.registered.lock().expect("discover puzzle lock") = Some(entry);
        Ok(())
    }

    async fn stop(&self) -> Result<(), MountError> {
        // take() keeps stop idempotent.
        let entry = self.registered.lock().expect("discover puzzle lock").take();
        if let Some(entry) = entry {
            self.registry.deregister(&entry).await?;
            tracing::info!(service = %entry.name, "deregistered from discovery");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(addr: &str) -> ServiceEntry {
        ServiceEntry {
            name: "svc".to_string(),
            addr: addr.parse().unwrap(),
            tags: vec!["grpc".to_string()],
        }
    }

    #[tokio::test]
    async fn manual_registry_round_trip() {
        let registry = ManualRegistry::new();
        let a = entry("127.0.0.1:7001");
        let b = entry("127.0.0.1:7002");

        registry.register(&a).await.unwrap();
        registry.register(&a).await.unwrap();
        registry.register(&b).await.unwrap();
        assert_eq!(registry.discover("svc").await.unwrap().len(), 2);

        registry.deregister(&a).await.unwrap();
        assert_eq!(registry.discover("svc").await.unwrap(), vec![b]);
    }

    #[tokio::test]
    async fn puzzle_registers_and_stop_is_idempotent() {
        let registry = Arc::new(ManualRegistry::new());
        let puzzle = DiscoverPuzzle::new(Arc::clone(&registry) as Arc<dyn ServiceRegistry>);

        let mut raw = Options::new("svc:grpc");
        raw.listener_addr = Some("127.0.0.1:7100".parse().unwrap());
        let opts = Arc::new(raw);

        puzzle
            .start(CancellationToken::new(), Arc::clone(&opts))
            .await
            .unwrap();
        assert_eq!(registry.discover("svc").await.unwrap().len(), 1);

        puzzle.stop().await.unwrap();
        puzzle.stop().await.unwrap();
        assert!(registry.discover("svc").await.unwrap().is_empty());
    }
}
