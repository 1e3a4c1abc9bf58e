// Warden — skill quarantine state machine.
//
//   pending ── run_test ──► executing ──► passed ──► awaiting_promotion ──► promoted
//                                 │                         │
//                                 └──► failed               └── reject ──► rejected
//   promoted ── 3 strikes / manual deprecate ──► deprecated
//
// Leaving quarantine requires three clean sandbox runs plus a short-lived
// confirmation code presented by a human.

use std::sync::Arc;
use std::time::Duration;

use crate::audit::AuditLog;
use crate::codes::PendingCodes;
use crate::error::{CoreError, CoreResult};

use super::registry::SkillRegistry;
use super::sandbox::{self, SandboxResult};
use super::{ExecutionTest, Language, QuarantineState, SkillMetadata, TestStatus, now_secs};

pub const MIN_SUCCESSFUL_RUNS: usize = 3;

/// States from which a sandbox run may start.
const RUNNABLE: [QuarantineState; 3] = [
    QuarantineState::Pending,
    QuarantineState::Passed,
    QuarantineState::Failed,
];

#[derive(Debug, Clone)]
pub struct TestRunReport {
    pub test_id: String,
    pub passed: bool,
    pub passed_count: usize,
    pub ready_for_promotion: bool,
    pub result: SandboxResult,
}

pub struct Quarantine {
    registry: Arc<SkillRegistry>,
    codes: Arc<PendingCodes>,
    audit: Arc<AuditLog>,
    sandbox_timeout: Duration,
}

impl Quarantine {
    pub fn new(
        registry: Arc<SkillRegistry>,
        codes: Arc<PendingCodes>,
        audit: Arc<AuditLog>,
        sandbox_timeout: Duration,
    ) -> Self {
        Self { registry, codes, audit, sandbox_timeout }
    }

    /// Register a new skill into quarantine.
    pub async fn submit(
        &self,
        skill_id: &str,
        code: &str,
        language: Language,
        source_type: &str,
        origin: &str,
    ) -> CoreResult<SkillMetadata> {
        self.registry
            .register_new(skill_id, code, language, source_type, origin)
            .await
    }

    /// Execute one sandbox run. Requires a runnable state and an untampered
    /// code file; on tamper the skill stays exactly where it was.
    pub async fn run_test(&self, skill_id: &str) -> CoreResult<TestRunReport> {
        let meta = self.registry.load(skill_id).await?;
        if !RUNNABLE.contains(&meta.quarantine_state) {
            return Err(CoreError::InvalidState(format!(
                "skill {skill_id} is {} — not runnable",
                meta.quarantine_state.as_str()
            )));
        }
        self.registry.verify_hash(&meta).await?;

        let code_file = self.registry.code_path(&meta);
        self.registry
            .update_state(skill_id, QuarantineState::Executing)
            .await?;

        let test_id = uuid::Uuid::new_v4().to_string();
        let result = match sandbox::execute(&code_file, meta.language, self.sandbox_timeout).await {
            Ok(result) => result,
            Err(e) => {
                // Sandbox errors are skill failures, never orchestrator ones.
                tracing::error!("quarantine: sandbox error for {}: {}", skill_id, e);
                SandboxResult {
                    exit_code: -1,
                    stdout_head: String::new(),
                    stderr_head: e.to_string(),
                    duration_ms: 0,
                    timed_out: matches!(e, CoreError::SandboxTimeout(_)),
                }
            }
        };

        let passed = !result.timed_out && result.exit_code == 0;
        let meta = self
            .registry
            .record_test_result(
                skill_id,
                ExecutionTest {
                    test_id: test_id.clone(),
                    status: if passed { TestStatus::Passed } else { TestStatus::Failed },
                    executed_at: now_secs(),
                    duration_ms: result.duration_ms,
                    exit_code: result.exit_code,
                    stdout_head: result.stdout_head.clone(),
                    stderr_head: result.stderr_head.clone(),
                },
            )
            .await?;

        let passed_count = meta.passed_test_count();
        let ready = passed && passed_count >= MIN_SUCCESSFUL_RUNS;
        let next_state = if ready {
            QuarantineState::AwaitingPromotion
        } else if passed {
            QuarantineState::Passed
        } else {
            QuarantineState::Failed
        };
        self.registry.update_state(skill_id, next_state).await?;

        if ready {
            tracing::info!(
                "quarantine: skill {} passed {} runs — awaiting promotion",
                skill_id,
                passed_count
            );
        }

        Ok(TestRunReport {
            test_id,
            passed,
            passed_count,
            ready_for_promotion: ready,
            result,
        })
    }

    /// Issue the confirmation code a human must echo back to promote.
    pub async fn request_promotion(&self, skill_id: &str) -> CoreResult<String> {
        let meta = self.registry.load(skill_id).await?;
        if meta.quarantine_state != QuarantineState::AwaitingPromotion {
            return Err(CoreError::InvalidState(format!(
                "skill {skill_id} is {} — not awaiting promotion",
                meta.quarantine_state.as_str()
            )));
        }
        Ok(self.codes.issue(skill_id).await)
    }

    /// Promote to active on a valid code. The directory move commits the
    /// transition; the code is consumed by this verification, so a replayed
    /// promote fails on the code before anything else.
    pub async fn promote(&self, skill_id: &str, code: &str, promoted_by: &str) -> CoreResult<()> {
        let meta = self.registry.load(skill_id).await?;
        if !self.codes.verify(skill_id, code).await {
            return Err(CoreError::InvalidCode);
        }
        if meta.quarantine_state != QuarantineState::AwaitingPromotion {
            return Err(CoreError::InvalidState(format!(
                "skill {skill_id} is {} — not awaiting promotion",
                meta.quarantine_state.as_str()
            )));
        }

        self.registry
            .update_state(skill_id, QuarantineState::Promoted)
            .await?;
        self.audit.log_skill_promotion(skill_id, promoted_by);
        tracing::info!("quarantine: skill {} promoted to active", skill_id);
        Ok(())
    }

    pub async fn reject(&self, skill_id: &str, reason: &str) -> CoreResult<()> {
        let meta = self.registry.load(skill_id).await?;
        if meta.quarantine_state != QuarantineState::AwaitingPromotion {
            return Err(CoreError::InvalidState(format!(
                "skill {skill_id} is {} — not awaiting promotion",
                meta.quarantine_state.as_str()
            )));
        }
        self.codes.invalidate(skill_id).await;
        self.registry
            .update_state(skill_id, QuarantineState::Rejected)
            .await?;
        self.audit.log_skill_rejection(skill_id, reason);
        tracing::info!("quarantine: skill {} rejected: {}", skill_id, reason);
        Ok(())
    }

    /// Manual deprecation of a promoted skill.
    pub async fn deprecate(&self, skill_id: &str, reason: &str) -> CoreResult<()> {
        let meta = self.registry.load(skill_id).await?;
        if meta.quarantine_state != QuarantineState::Promoted {
            return Err(CoreError::InvalidState(format!(
                "skill {skill_id} is {} — not promoted",
                meta.quarantine_state.as_str()
            )));
        }
        self.registry
            .update_state(skill_id, QuarantineState::Deprecated)
            .await?;
        self.audit.log_skill_deprecation(skill_id, reason);
        tracing::warn!("quarantine: skill {} deprecated: {}", skill_id, reason);
        Ok(())
    }
}
