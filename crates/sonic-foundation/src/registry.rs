//! Model registry
//!
//! One-time construction and process-wide residency of the model bundle.
//! The first caller of [`ModelRegistry::ensure_loaded`] runs the loader on a
//! blocking thread; concurrent callers wait for that same load. The outcome,
//! success or failure, is final for the life of the process.

use sonic_kernel::error::ModelLoadError;
use sonic_kernel::model::{ModelBundleHandle, ModelLoader};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;
use tokio::sync::OnceCell;
use tracing::{error, info};

/// Observable registry state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryState {
    /// No load has completed yet.
    Unloaded,
    Ready,
    /// A load failed; the bundle will not be retried.
    Unavailable,
}

pub struct ModelRegistry {
    loader: Arc<dyn ModelLoader>,
    bundle: OnceCell<Result<ModelBundleHandle, ModelLoadError>>,
    load_attempts: AtomicUsize,
}

impl ModelRegistry {
    pub fn new(loader: Arc<dyn ModelLoader>) -> Self {
        Self {
            loader,
            bundle: OnceCell::new(),
            load_attempts: AtomicUsize::new(0),
        }
    }

    /// Return the resident bundle, loading it on first use.
    pub async fn ensure_loaded(&self) -> Result<ModelBundleHandle, ModelLoadError> {
        self.bundle
            .get_or_init(|| self.load())
            .await
            .clone()
    }

    async fn load(&self) -> Result<ModelBundleHandle, ModelLoadError> {
        let attempt = self.load_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        let loader = Arc::clone(&self.loader);
        let name = loader.name().to_string();
        info!(loader = %name, attempt, "Loading model bundle");

        let start = Instant::now();
        let result = match tokio::task::spawn_blocking(move || loader.load()).await {
            Ok(result) => result.map(Arc::new),
            Err(e) => Err(ModelLoadError::Unavailable(format!("loader task failed: {e}"))),
        };

        let elapsed_ms = start.elapsed().as_millis() as u64;
        match &result {
            Ok(bundle) => info!(
                loader = %name,
                device = %bundle.device,
                elapsed_ms,
                "Model bundle resident"
            ),
            Err(e) => error!(
                loader = %name,
                elapsed_ms,
                error = %e,
                "Model bundle load failed; registry is now unavailable"
            ),
        }
        result
    }

    /// The bundle if it is already resident. Never triggers a load.
    pub fn get(&self) -> Option<ModelBundleHandle> {
        match self.bundle.get() {
            Some(Ok(bundle)) => Some(Arc::clone(bundle)),
            _ => None,
        }
    }

    pub fn state(&self) -> RegistryState {
        match self.bundle.get() {
            None => RegistryState::Unloaded,
            Some(Ok(_)) => RegistryState::Ready,
            Some(Err(_)) => RegistryState::Unavailable,
        }
    }

    /// Number of times the loader has been invoked.
    pub fn load_attempts(&self) -> usize {
        self.load_attempts.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for ModelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelRegistry")
            .field("loader", &self.loader.name())
            .field("state", &self.state())
            .finish()
    }
}
