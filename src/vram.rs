// Warden — exclusive-VRAM mutex.
// One GPU, two local models, one holder at a time. Waiters queue FIFO on the
// runtime's fair mutex; every transition out of IDLE lands back in IDLE or
// ERROR within its timeout. Release keeps the loaded model warm for reuse.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{Mutex, MutexGuard};

use crate::audit::AuditLog;
use crate::error::{CoreError, CoreResult};
use crate::kv::KvStore;

pub const KV_STATE_KEY: &str = "vram:state";
pub const KV_MODEL_KEY: &str = "vram:loaded_model";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelKind {
    Coder,
    Vision,
}

impl ModelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelKind::Coder => "coder",
            ModelKind::Vision => "vl",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VramState {
    Idle,
    LoadingCoder,
    LoadingVision,
    Unloading,
    Error,
}

impl VramState {
    pub fn as_str(&self) -> &'static str {
        match self {
            VramState::Idle => "IDLE",
            VramState::LoadingCoder => "LOADING_CODER",
            VramState::LoadingVision => "LOADING_VL",
            VramState::Unloading => "UNLOADING",
            VramState::Error => "ERROR",
        }
    }

    fn loading(kind: ModelKind) -> Self {
        match kind {
            ModelKind::Coder => VramState::LoadingCoder,
            ModelKind::Vision => VramState::LoadingVision,
        }
    }
}

/// The model-swap operations the mutex drives. Only the mutex is allowed to
/// warm or unload models — no other component touches the GPU.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    /// Pull the model hot into VRAM (no-op generation with a keep-alive hint).
    async fn warm(&self, kind: ModelKind) -> CoreResult<()>;
    /// Ask the inference server to release everything it has loaded.
    async fn unload_all(&self) -> CoreResult<()>;
    /// Last resort: terminate the inference server process (graceful signal,
    /// then kill). The supervisor is expected to bring it back.
    async fn kill_server(&self);
}

#[derive(Debug, Clone, Copy)]
pub struct VramTimeouts {
    pub acquire: Duration,
    pub load: Duration,
    pub unload: Duration,
    pub error_cooldown: Duration,
}

impl Default for VramTimeouts {
    fn default() -> Self {
        Self {
            acquire: Duration::from_secs(30),
            load: Duration::from_secs(30),
            unload: Duration::from_secs(30),
            error_cooldown: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Cell {
    state: VramState,
    loaded: Option<ModelKind>,
    error_until: Option<Instant>,
}

pub struct VramMutex {
    backend: Arc<dyn ModelBackend>,
    kv: Arc<KvStore>,
    audit: Arc<AuditLog>,
    // Fair (FIFO) queue of waiters; holding the guard is holding the GPU.
    gpu: Mutex<()>,
    cell: StdMutex<Cell>,
    timeouts: VramTimeouts,
}

impl VramMutex {
    pub fn new(backend: Arc<dyn ModelBackend>, kv: Arc<KvStore>, audit: Arc<AuditLog>) -> Self {
        Self::with_timeouts(backend, kv, audit, VramTimeouts::default())
    }

    #[doc(hidden)]
    pub fn with_timeouts(
        backend: Arc<dyn ModelBackend>,
        kv: Arc<KvStore>,
        audit: Arc<AuditLog>,
        timeouts: VramTimeouts,
    ) -> Self {
        Self {
            backend,
            kv,
            audit,
            gpu: Mutex::new(()),
            cell: StdMutex::new(Cell {
                state: VramState::Idle,
                loaded: None,
                error_until: None,
            }),
            timeouts,
        }
    }

    pub fn state(&self) -> VramState {
        self.cell.lock().unwrap_or_else(|e| e.into_inner()).state
    }

    pub fn loaded_model(&self) -> Option<ModelKind> {
        self.cell.lock().unwrap_or_else(|e| e.into_inner()).loaded
    }

    /// Clear the ERROR state without waiting out the cooldown.
    pub fn recover(&self) {
        let mut cell = self.cell.lock().unwrap_or_else(|e| e.into_inner());
        if cell.state == VramState::Error {
            tracing::warn!("vram: manual recovery from ERROR");
        }
        cell.state = VramState::Idle;
        cell.loaded = None;
        cell.error_until = None;
    }

    /// Exclusive access with the requested model warm. Blocks (FIFO) up to the
    /// acquire timeout; swaps out a different loaded model first.
    pub async fn acquire(&self, kind: ModelKind) -> CoreResult<VramGuard<'_>> {
        let permit = tokio::time::timeout(self.timeouts.acquire, self.gpu.lock())
            .await
            .map_err(|_| CoreError::VramBusy(self.timeouts.acquire))?;

        self.check_error_gate()?;

        let loaded = self.loaded_model();
        if loaded.is_some() && loaded != Some(kind) {
            self.unload_current().await;
        }

        if self.loaded_model() != Some(kind) {
            self.load(kind).await?;
        }

        Ok(VramGuard { _permit: permit, kind })
    }

    fn check_error_gate(&self) -> CoreResult<()> {
        let mut cell = self.cell.lock().unwrap_or_else(|e| e.into_inner());
        if cell.state != VramState::Error {
            return Ok(());
        }
        match cell.error_until {
            Some(until) if Instant::now() < until => Err(CoreError::Vram(format!(
                "in ERROR state, cooldown for {:?} more",
                until.saturating_duration_since(Instant::now())
            ))),
            _ => {
                tracing::warn!("vram: ERROR cooldown elapsed, resetting to IDLE");
                cell.state = VramState::Idle;
                cell.loaded = None;
                cell.error_until = None;
                Ok(())
            }
        }
    }

    async fn load(&self, kind: ModelKind) -> CoreResult<()> {
        self.set_state(VramState::loading(kind), None);
        tracing::info!("vram: loading {} model", kind.as_str());

        match tokio::time::timeout(self.timeouts.load, self.backend.warm(kind)).await {
            Ok(Ok(())) => {
                self.set_state(VramState::Idle, Some(kind));
                tracing::info!("vram: {} model loaded and ready", kind.as_str());
                Ok(())
            }
            Err(_) => {
                // Roll back through UNLOADING so a half-loaded model never
                // lingers in VRAM.
                self.set_state(VramState::Unloading, None);
                if let Ok(Err(e)) =
                    tokio::time::timeout(self.timeouts.unload, self.backend.unload_all()).await
                {
                    tracing::warn!("vram: rollback unload failed: {}", e);
                }
                self.set_state(VramState::Idle, None);
                Err(CoreError::LoadTimeout(self.timeouts.load))
            }
            Ok(Err(e)) => {
                self.enter_error(&e.to_string());
                Err(CoreError::Vram(e.to_string()))
            }
        }
    }

    async fn unload_current(&self) {
        self.set_state(VramState::Unloading, None);
        tracing::info!("vram: unloading current model");

        match tokio::time::timeout(self.timeouts.unload, self.backend.unload_all()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::error!("vram: unload failed ({}) — force-killing inference server", e);
                self.audit
                    .log_forced_termination("local-inference", &format!("unload failed: {e}"));
                self.backend.kill_server().await;
            }
            Err(_) => {
                tracing::error!(
                    "vram: unload hung past {:?} — force-killing inference server",
                    self.timeouts.unload
                );
                self.audit
                    .log_forced_termination("local-inference", "unload timed out");
                self.backend.kill_server().await;
            }
        }
        self.set_state(VramState::Idle, None);
    }

    fn enter_error(&self, reason: &str) {
        tracing::error!("vram: ERROR state — {}", reason);
        {
            let mut cell = self.cell.lock().unwrap_or_else(|e| e.into_inner());
            cell.state = VramState::Error;
            cell.loaded = None;
            cell.error_until = Some(Instant::now() + self.timeouts.error_cooldown);
        }
        self.mirror(VramState::Error, None);
    }

    fn set_state(&self, state: VramState, loaded: Option<ModelKind>) {
        {
            let mut cell = self.cell.lock().unwrap_or_else(|e| e.into_inner());
            cell.state = state;
            cell.loaded = loaded;
        }
        self.mirror(state, loaded);
    }

    // Authoritative state is in-process; the KV copy is observability only.
    // Mirrored fire-and-forget so a slow or dead store never blocks a
    // transition.
    fn mirror(&self, state: VramState, loaded: Option<ModelKind>) {
        let kv = Arc::clone(&self.kv);
        tokio::spawn(async move {
            if let Err(e) = kv.set(KV_STATE_KEY, state.as_str()).await {
                tracing::warn!("vram: failed to mirror state to kv: {}", e);
            }
            let tag = loaded.map(|m| m.as_str()).unwrap_or("none");
            if let Err(e) = kv.set(KV_MODEL_KEY, tag).await {
                tracing::warn!("vram: failed to mirror loaded model to kv: {}", e);
            }
        });
    }
}

/// Held for the duration of a generation call. Dropping it releases the GPU
/// without unloading — the model stays warm for the next holder.
pub struct VramGuard<'a> {
    _permit: MutexGuard<'a, ()>,
    kind: ModelKind,
}

impl VramGuard<'_> {
    pub fn model(&self) -> ModelKind {
        self.kind
    }
}
