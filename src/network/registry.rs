//! Package registry shared by every connection handler
//!
//! Handlers read an immutable snapshot; a config reload swaps the whole
//! snapshot at once, so a handler never sees a half-updated table. Access to
//! one package's executable is serialized through a per-name lock.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use crate::config::ServerPackage;

/// Immutable view of the configured packages
#[derive(Debug, Clone, Default)]
pub struct PackageRegistry {
    packages: BTreeMap<String, ServerPackage>,
}

impl PackageRegistry {
    pub fn new(packages: BTreeMap<String, ServerPackage>) -> Self {
        Self { packages }
    }

    pub fn get(&self, name: &str) -> Option<&ServerPackage> {
        self.packages.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.packages.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.packages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }
}

/// A package descriptor held together with its exclusive lock
pub struct PackageLease {
    pub name: String,
    pub package: ServerPackage,
    _guard: OwnedMutexGuard<()>,
}

/// Cloneable handle to the current registry snapshot
#[derive(Debug, Clone, Default)]
pub struct RegistryHandle {
    current: Arc<RwLock<Arc<PackageRegistry>>>,
    locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl RegistryHandle {
    pub fn new(registry: PackageRegistry) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(registry))),
            locks: Arc::default(),
        }
    }

    /// Current snapshot
    pub async fn snapshot(&self) -> Arc<PackageRegistry> {
        self.current.read().await.clone()
    }

    /// Swap in a new snapshot; handlers already running keep the old one
    pub async fn replace(&self, registry: PackageRegistry) {
        let count = registry.len();
        *self.current.write().await = Arc::new(registry);
        tracing::info!("Package registry replaced ({} packages)", count);
    }

    /// Look up a package and take its lock. Returns `None` for unknown names.
    pub async fn checkout(&self, name: &str) -> Option<PackageLease> {
        let package = self.snapshot().await.get(name)?.clone();

        let lock = {
            let mut locks = self.locks.lock().await;
            locks.entry(name.to_string()).or_default().clone()
        };
        let guard = lock.lock_owned().await;

        Some(PackageLease {
            name: name.to_string(),
            package,
            _guard: guard,
        })
    }
}
