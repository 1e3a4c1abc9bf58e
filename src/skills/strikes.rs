// Warden — three-strike system.
// Every execution failure of a promoted skill is a strike; the third strike
// auto-deprecates. Successes never clear strikes — only deprecation resets
// the counter.

use std::sync::Arc;

use crate::audit::AuditLog;
use crate::error::CoreResult;
use crate::kv::KvStore;

use super::QuarantineState;
use super::registry::SkillRegistry;

fn strike_key(skill_id: &str) -> String {
    format!("strikes:{skill_id}")
}

pub struct StrikeSystem {
    kv: Arc<KvStore>,
    registry: Arc<SkillRegistry>,
    audit: Arc<AuditLog>,
    threshold: u32,
}

impl StrikeSystem {
    pub fn new(
        kv: Arc<KvStore>,
        registry: Arc<SkillRegistry>,
        audit: Arc<AuditLog>,
        threshold: u32,
    ) -> Self {
        Self { kv, registry, audit, threshold }
    }

    /// Record an execution failure. Returns (strike_count, deprecated).
    ///
    /// The KV counter decides the threshold; metadata is the presentation
    /// copy. When KV is unreachable, the metadata count stands in for the
    /// decision so a store outage cannot grant a skill unlimited failures.
    pub async fn record_failure(&self, skill_id: &str) -> CoreResult<(u32, bool)> {
        let meta_count = self.registry.increment_strike(skill_id).await?;

        let count = match self.kv.incr_by(&strike_key(skill_id), 1).await {
            Ok(n) => n as u32,
            Err(e) => {
                tracing::warn!(
                    "strikes: kv counter for {} unavailable ({}), using metadata count {}",
                    skill_id,
                    e,
                    meta_count
                );
                meta_count
            }
        };

        tracing::warn!("strikes: skill {} — strike {}/{}", skill_id, count, self.threshold);

        if count < self.threshold {
            return Ok((count, false));
        }

        let meta = self.registry.load(skill_id).await?;
        if meta.quarantine_state == QuarantineState::Promoted {
            self.registry
                .update_state(skill_id, QuarantineState::Deprecated)
                .await?;
            self.audit.log_skill_deprecation(
                skill_id,
                &format!("{} execution failures", self.threshold),
            );
            tracing::warn!("strikes: skill {} deprecated after {} strikes", skill_id, count);
        }
        if let Err(e) = self.kv.set(&strike_key(skill_id), "0").await {
            tracing::warn!("strikes: failed to reset kv counter for {}: {}", skill_id, e);
        }
        Ok((count, true))
    }

    /// A successful run does not clear strikes.
    pub async fn record_success(&self, _skill_id: &str) {}

    pub async fn strike_count(&self, skill_id: &str) -> u32 {
        match self.kv.get(&strike_key(skill_id)).await {
            Ok(Some(raw)) => raw.parse().unwrap_or(0),
            _ => 0,
        }
    }

    pub async fn clear(&self, skill_id: &str) -> CoreResult<()> {
        self.kv.set(&strike_key(skill_id), "0").await
    }
}
