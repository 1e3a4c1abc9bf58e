// Warden — security lockdown.
// A global kill-switch persisted under `security:lockdown`. While active, the
// orchestrator refuses every message; lifting it requires the minted unlock
// code. The full code is logged at CRITICAL only — the audit journal and all
// responses see at most a two-character prefix.

use std::sync::Arc;

use rand::Rng;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

use crate::audit::AuditLog;
use crate::error::{CoreError, CoreResult};
use crate::kv::KvStore;

pub const LOCKDOWN_KEY: &str = "security:lockdown";
const SECURITY_CHANNEL: &str = "security:events";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LockdownRecord {
    pub active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unlock_code: Option<String>,
}

pub struct Lockdown {
    kv: Arc<KvStore>,
    audit: Arc<AuditLog>,
}

impl Lockdown {
    pub fn new(kv: Arc<KvStore>, audit: Arc<AuditLog>) -> Self {
        Self { kv, audit }
    }

    /// Engage the lockdown: mint a fresh unlock code, persist the record,
    /// audit the prefix hint, and broadcast the event.
    pub async fn activate(&self, reason: &str) {
        let unlock_code = format!("{:04}", OsRng.gen_range(0..10_000u32));
        tracing::error!(
            "lockdown: ACTIVATED ({}) — unlock code: {}",
            reason,
            unlock_code
        );
        self.audit.log_lockdown(reason, &unlock_code);

        let record = LockdownRecord {
            active: true,
            reason: Some(reason.to_string()),
            unlock_code: Some(unlock_code),
        };
        if let Err(e) = self.kv.set_json(LOCKDOWN_KEY, &record).await {
            tracing::error!("lockdown: failed to persist record: {}", e);
        }
        if let Err(e) = self
            .kv
            .publish(SECURITY_CHANNEL, &format!("lockdown:{reason}"))
            .await
        {
            tracing::warn!("lockdown: event broadcast failed: {}", e);
        }
    }

    /// Degrades open: an unreachable KV store reads as not-locked (and is
    /// logged), so a store outage cannot freeze the whole runtime.
    pub async fn is_active(&self) -> bool {
        match self.kv.get_json::<LockdownRecord>(LOCKDOWN_KEY).await {
            Ok(Some(record)) => record.active,
            Ok(None) => false,
            Err(e) => {
                tracing::warn!("lockdown: state read failed: {}", e);
                false
            }
        }
    }

    /// Lift the lockdown if `submitted` matches the stored code.
    pub async fn unlock(&self, submitted: &str) -> CoreResult<()> {
        let record = self
            .kv
            .get_json::<LockdownRecord>(LOCKDOWN_KEY)
            .await?
            .unwrap_or_default();
        if !record.active {
            return Err(CoreError::InvalidState("lockdown is not active".into()));
        }
        let stored = record.unlock_code.as_deref().unwrap_or("");
        let matched: bool = stored.as_bytes().ct_eq(submitted.trim().as_bytes()).into();
        if !matched {
            tracing::warn!("lockdown: unlock attempt with wrong code");
            return Err(CoreError::InvalidCode);
        }

        self.kv
            .set_json(LOCKDOWN_KEY, &LockdownRecord { active: false, reason: None, unlock_code: None })
            .await?;
        self.audit.log_event(
            "LOCKDOWN_LIFTED",
            serde_json::json!({}),
            crate::audit::Severity::Warning,
            None,
        );
        tracing::info!("lockdown: lifted");
        Ok(())
    }
}
