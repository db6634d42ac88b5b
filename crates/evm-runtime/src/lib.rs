#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **evm-runtime** – Wiring layer for the Event Virtual Machine.
//!
//! `evm-core` defines the pipeline; this crate assembles a running instance
//! of it. It selects a concrete [`evm_store::TransactionStore`] backend from
//! [`RuntimeConfig`], constructs the digest and (optionally) signer/verifier
//! pair, builds a [`evm_core::Vm`] over them, and exposes the result as
//! [`Runtime`] — the entry point an embedding server submits events through.
//!
//! Unlike the deterministic-kernel runtime this crate's layering is modeled
//! on, the VM commits each accepted event to the store synchronously as part
//! of its own write stage (`evm_core::vm::Vm::write_stage`), so there is no
//! separate background persistence task to drain a bus: durability is
//! already linearizable with respect to the call that produced it.

use std::sync::Arc;

use evm_auth::{Signer, Verifier};
use evm_core::{Copts, Opts, Vm, VmConfig, VmError};
use evm_core::compose::{EventBuilder, RoomContext};
use evm_store::TransactionStore;
use evm_store_memory::MemoryStore;
use evm_types::digest::Digest;
use evm_types::id::ServerName;
use evm_types::{Event, Fault};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

#[cfg(feature = "sled-storage")]
use evm_store_sled::SledBackend;

//─────────────────────────────
//  Configuration
//─────────────────────────────

/// Configuration for an [`evm-runtime`](crate) instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// The local server name, used as the default `origin` for locally
    /// composed events when no signer is configured.
    pub server_name: String,
    /// The pipeline's worker-pool and logging configuration (spec §6).
    pub vm: VmConfig,
    /// Storage backend selection.
    pub storage: StorageConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            server_name: "localhost".to_string(),
            vm: VmConfig::default(),
            storage: StorageConfig::Memory,
        }
    }
}

/// Storage backend configuration options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StorageConfig {
    /// In-memory storage (non-persistent, for tests and ephemeral runs).
    Memory,
    /// Sled-based persistent storage at the given path.
    #[cfg(feature = "sled-storage")]
    Sled {
        /// Database file path.
        path: String,
    },
}

/// Create a runtime configuration suitable for unit and integration tests:
/// in-memory storage and a small worker pool.
pub fn test_config() -> RuntimeConfig {
    RuntimeConfig {
        server_name: "example.org".to_string(),
        vm: VmConfig {
            pool_size: 4,
            ..VmConfig::default()
        },
        storage: StorageConfig::Memory,
    }
}

//─────────────────────────────
//  Runtime
//─────────────────────────────

/// A complete, running Event Virtual Machine: a [`Vm`] over a concrete
/// storage backend, plus the server identity events are composed under.
pub struct Runtime {
    vm: Arc<Vm>,
    store: Arc<dyn TransactionStore>,
    server_name: ServerName,
}

impl Runtime {
    /// Build a runtime from `config`, with no signature verification (the
    /// pipeline never sets `opts.verify` unless the caller asks for it).
    pub async fn new(config: RuntimeConfig) -> Result<Self, RuntimeError> {
        Self::build(config, Arc::new(evm_auth::Sha256Digest), None).await
    }

    /// Build a runtime with an attached signature verifier, required for
    /// any `receive` call whose [`Opts::verify`] is set.
    pub async fn with_verifier(
        config: RuntimeConfig,
        verifier: Arc<dyn Verifier>,
    ) -> Result<Self, RuntimeError> {
        Self::build(config, Arc::new(evm_auth::Sha256Digest), Some(verifier)).await
    }

    async fn build(
        config: RuntimeConfig,
        digest: Arc<dyn Digest>,
        verifier: Option<Arc<dyn Verifier>>,
    ) -> Result<Self, RuntimeError> {
        tracing::info!(storage = ?config.storage, "initializing evm runtime");

        let store = Self::create_storage_backend(&config.storage)?;
        tracing::debug!("storage backend ready");

        let mut vm = Vm::new(store.clone(), digest, config.vm)
            .await
            .map_err(|e| RuntimeError::Vm(e.to_string()))?;
        if let Some(verifier) = verifier {
            vm = vm.with_verifier(verifier);
        }

        tracing::info!("evm runtime initialized");

        Ok(Self {
            vm: Arc::new(vm),
            store,
            server_name: ServerName(config.server_name),
        })
    }

    fn create_storage_backend(config: &StorageConfig) -> Result<Arc<dyn TransactionStore>, RuntimeError> {
        match config {
            StorageConfig::Memory => {
                tracing::debug!("creating in-memory storage backend");
                Ok(Arc::new(MemoryStore::new()))
            }
            #[cfg(feature = "sled-storage")]
            StorageConfig::Sled { path } => {
                tracing::debug!(path, "creating sled storage backend");
                let backend = SledBackend::open(path).map_err(|e| RuntimeError::Storage(e.to_string()))?;
                Ok(Arc::new(backend))
            }
        }
    }

    /// Compose and run a locally issued event through the full pipeline
    /// under this runtime's server name.
    pub async fn issue(
        &self,
        builder: EventBuilder,
        copts: Copts,
        room: Option<&RoomContext<'_>>,
        signer: Option<&dyn Signer>,
    ) -> Result<Fault, VmError> {
        self.vm.issue(builder, copts, room, signer).await
    }

    /// Run an already-formed event (e.g. received via federation) through
    /// the pipeline.
    pub async fn receive(&self, event: Event, opts: Opts) -> Result<Fault, VmError> {
        self.vm.receive(event, opts).await
    }

    /// The current `(uncommitted, committed, retired)` sequence watermarks.
    pub async fn watermarks(&self) -> (u64, u64, u64) {
        self.vm.watermarks().await
    }

    /// Subscribe to the `vm.notify` broadcast stream: every event accepted
    /// through this runtime, in sequence order.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.vm.hooks.subscribe()
    }

    /// The underlying Vm, for registering hooks or other direct access.
    pub fn vm(&self) -> &Arc<Vm> {
        &self.vm
    }

    /// The underlying storage backend, for queries that bypass the pipeline.
    pub fn store(&self) -> &Arc<dyn TransactionStore> {
        &self.store
    }

    /// The local server name events are composed and signed under.
    pub fn server_name(&self) -> &ServerName {
        &self.server_name
    }
}

//─────────────────────────────
//  Error types
//─────────────────────────────

/// Errors raised while building or operating a [`Runtime`].
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// Storage backend construction failed.
    #[error("storage backend error: {0}")]
    Storage(String),
    /// VM construction failed (e.g. the store's `max_index` call failed).
    #[error("vm construction error: {0}")]
    Vm(String),
}
