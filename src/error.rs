// Warden — core error taxonomy.
//
// The request pipeline never throws these across the transport boundary;
// callers receive structured results and map kinds to user-visible codes.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    /// GPU arbitration: another holder kept the mutex past the acquire window.
    #[error("VRAM busy: acquire timed out after {0:?}")]
    VramBusy(Duration),

    /// Model warm-up did not finish inside its window.
    #[error("model load timed out after {0:?}")]
    LoadTimeout(Duration),

    /// The VRAM mutex is in its ERROR state (manual recovery or cooldown required).
    #[error("VRAM mutex unavailable: {0}")]
    Vram(String),

    /// Cloud breaker is OPEN — no outbound call was attempted.
    #[error("cloud circuit breaker is open")]
    CloudBreakerOpen,

    /// Daily cloud token budget is spent; resets at the next UTC day.
    #[error("daily cloud token budget exceeded ({used}/{budget})")]
    DailyBudgetExceeded { used: u64, budget: u64 },

    #[error("cloud call failed: {0}")]
    CloudCall(String),

    #[error("local inference server unavailable")]
    LocalUnavailable,

    /// On-disk skill bytes no longer match the recorded hash.
    #[error("skill {0}: code hash mismatch")]
    Tamper(String),

    #[error("sandbox execution timed out after {0:?}")]
    SandboxTimeout(Duration),

    #[error("sandbox execution failed: {0}")]
    Sandbox(String),

    /// A state-machine precondition was violated (e.g. promote outside
    /// awaiting_promotion).
    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("confirmation code absent, expired, or mismatched")]
    InvalidCode,

    #[error("skill not found: {0}")]
    NotFound(String),

    /// KV / vector store unreachable. Fatal at startup, degraded-continue at
    /// steady state — the caller decides.
    #[error("infrastructure unavailable: {0}")]
    Infra(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type CoreResult<T> = Result<T, CoreError>;
