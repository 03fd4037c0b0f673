//! Registry of live sandboxes.
//!
//! The manager is an ordinary owned value: construct one per service and
//! share it (usually behind an `Arc`) with whatever serves requests. Each
//! sandbox sits behind its own async mutex, so commands for one id are
//! serialized while distinct ids proceed in parallel. Cleanup and reaping
//! take the same per-sandbox lock and therefore wait for an in-flight
//! command to finish.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::config::EngineConfig;
use crate::descriptor::StateDescriptor;
use crate::error::{Error, Result};
use crate::sandbox::{validate_id, Sandbox};

/// A registered sandbox, locked for exclusive use.
pub type SharedSandbox = Arc<Mutex<Sandbox>>;

struct Entry {
    sandbox: SharedSandbox,
    created_at: DateTime<Utc>,
}

#[derive(Default)]
struct Registry {
    live: HashMap<String, Entry>,
    /// Ids that were registered once. They can never be registered again.
    retired: HashSet<String>,
}

/// Owns every live sandbox.
pub struct SandboxManager {
    config: EngineConfig,
    registry: std::sync::Mutex<Registry>,
}

impl SandboxManager {
    /// Creates an empty manager.
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            registry: std::sync::Mutex::new(Registry::default()),
        }
    }

    /// Settings every sandbox is created with.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn registry(&self) -> std::sync::MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Creates, initializes and registers a sandbox with a fresh id.
    pub async fn create_sandbox(
        &self,
        descriptor: Option<&StateDescriptor>,
    ) -> Result<SharedSandbox> {
        self.create_sandbox_with_id(None, descriptor).await
    }

    /// Creates, initializes and registers a sandbox.
    ///
    /// An explicit `id` must be a single path component that has never been
    /// registered before. If initialization fails the id is retired and no
    /// directory is left behind.
    pub async fn create_sandbox_with_id(
        &self,
        id: Option<String>,
        descriptor: Option<&StateDescriptor>,
    ) -> Result<SharedSandbox> {
        if let Some(id) = &id {
            validate_id(id)?;
            self.ensure_unused(id)?;
        }

        let sandbox = Sandbox::with_config(id, &self.config)?;
        let id = sandbox.id().to_string();
        let created_at = sandbox.created_at();
        let shared: SharedSandbox = Arc::new(Mutex::new(sandbox));

        {
            let mut registry = self.registry();
            if registry.live.contains_key(&id) || registry.retired.contains(&id) {
                return Err(Error::IdReused(id));
            }
            registry.live.insert(
                id.clone(),
                Entry {
                    sandbox: Arc::clone(&shared),
                    created_at,
                },
            );
        }

        let mut guard = Arc::clone(&shared).lock_owned().await;
        let descriptor = descriptor.cloned();
        let initialized =
            tokio::task::spawn_blocking(move || guard.initialize(descriptor.as_ref()))
                .await
                .map_err(|e| Error::Io(std::io::Error::other(e.to_string())))
                .and_then(|r| r);

        if let Err(e) = initialized {
            tracing::warn!(sandbox_id = %id, error = %e, "sandbox initialization failed");
            let mut registry = self.registry();
            registry.live.remove(&id);
            registry.retired.insert(id);
            return Err(e);
        }

        tracing::info!(sandbox_id = %id, "registered sandbox");
        Ok(shared)
    }

    fn ensure_unused(&self, id: &str) -> Result<()> {
        let registry = self.registry();
        if registry.live.contains_key(id) || registry.retired.contains(id) {
            return Err(Error::IdReused(id.to_string()));
        }
        Ok(())
    }

    /// Returns the sandbox registered under `id`.
    pub fn get_sandbox(&self, id: &str) -> Option<SharedSandbox> {
        self.registry()
            .live
            .get(id)
            .map(|entry| Arc::clone(&entry.sandbox))
    }

    /// Like [`get_sandbox`](Self::get_sandbox) but fails with
    /// [`Error::NotFound`] for an unknown or expired id.
    pub fn require_sandbox(&self, id: &str) -> Result<SharedSandbox> {
        self.get_sandbox(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }

    /// Removes `id` from the registry and cleans it up.
    ///
    /// Returns false if no sandbox was registered under `id`.
    pub async fn cleanup_sandbox(&self, id: &str) -> Result<bool> {
        let entry = {
            let mut registry = self.registry();
            match registry.live.remove(id) {
                Some(entry) => {
                    registry.retired.insert(id.to_string());
                    entry
                }
                None => return Ok(false),
            }
        };

        let mut sandbox = entry.sandbox.lock().await;
        sandbox.cleanup()?;
        Ok(true)
    }

    /// Cleans up every registered sandbox and returns how many were removed.
    ///
    /// All sandboxes are attempted; the first failure is returned afterwards.
    pub async fn cleanup_all(&self) -> Result<usize> {
        let ids = self.ids();
        self.cleanup_many(ids).await
    }

    /// Cleans up sandboxes created more than `max_age` ago.
    pub async fn reap_older_than(&self, max_age: Duration) -> Result<usize> {
        let Some(cutoff) = chrono::Duration::from_std(max_age)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
        else {
            return Ok(0);
        };

        let expired: Vec<String> = self
            .registry()
            .live
            .iter()
            .filter(|(_, entry)| entry.created_at < cutoff)
            .map(|(id, _)| id.clone())
            .collect();

        let reaped = self.cleanup_many(expired).await?;
        if reaped > 0 {
            tracing::info!(count = reaped, max_age = ?max_age, "reaped expired sandboxes");
        }
        Ok(reaped)
    }

    async fn cleanup_many(&self, ids: Vec<String>) -> Result<usize> {
        let mut cleaned = 0;
        let mut first_error = None;

        for id in ids {
            match self.cleanup_sandbox(&id).await {
                Ok(true) => cleaned += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::error!(sandbox_id = %id, error = %e, "failed to clean up sandbox");
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(cleaned),
        }
    }

    /// Starts a background task that reaps sandboxes older than `max_age`
    /// every `interval`. The task stops once the manager is dropped.
    pub fn spawn_reaper(
        self: &Arc<Self>,
        interval: Duration,
        max_age: Duration,
    ) -> tokio::task::JoinHandle<()> {
        let manager = Arc::downgrade(self);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                if let Err(e) = manager.reap_older_than(max_age).await {
                    tracing::warn!(error = %e, "reaper sweep failed");
                }
            }
        })
    }

    /// Ids of all registered sandboxes.
    pub fn ids(&self) -> Vec<String> {
        self.registry().live.keys().cloned().collect()
    }

    /// Number of registered sandboxes.
    pub fn len(&self) -> usize {
        self.registry().live.len()
    }

    /// Returns true if no sandbox is registered.
    pub fn is_empty(&self) -> bool {
        self.registry().live.is_empty()
    }
}
