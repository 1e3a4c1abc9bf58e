// Warden — skill subsystem.
// User-submitted executable units, policed through quarantine, sandboxed
// execution, human-confirmed promotion, and the three-strike lifecycle.

pub mod quarantine;
pub mod registry;
pub mod sandbox;
pub mod strikes;

use serde::{Deserialize, Serialize};

/// Lifecycle states. The on-disk bucket is derived from the state and the two
/// must agree after every completed transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuarantineState {
    Pending,
    Executing,
    Passed,
    Failed,
    AwaitingPromotion,
    Promoted,
    Rejected,
    Deprecated,
}

impl QuarantineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuarantineState::Pending => "pending",
            QuarantineState::Executing => "executing",
            QuarantineState::Passed => "passed",
            QuarantineState::Failed => "failed",
            QuarantineState::AwaitingPromotion => "awaiting_promotion",
            QuarantineState::Promoted => "promoted",
            QuarantineState::Rejected => "rejected",
            QuarantineState::Deprecated => "deprecated",
        }
    }

    /// The directory subtree that owns skills in this state.
    pub fn bucket(&self) -> &'static str {
        match self {
            QuarantineState::Pending
            | QuarantineState::Executing
            | QuarantineState::Passed
            | QuarantineState::Failed
            | QuarantineState::AwaitingPromotion => "quarantine",
            QuarantineState::Promoted => "active",
            QuarantineState::Rejected | QuarantineState::Deprecated => "deprecated",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    Javascript,
    Typescript,
}

impl Language {
    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Python => "python",
            Language::Javascript => "javascript",
            Language::Typescript => "typescript",
        }
    }

    /// Code files are named `skill.<language>`.
    pub fn code_file_name(&self) -> String {
        format!("skill.{}", self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillSource {
    #[serde(rename = "type")]
    pub source_type: String,
    pub origin: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeInfo {
    /// SHA-256 of the bytes on disk, hex-encoded.
    pub hash: String,
    pub size_bytes: u64,
    pub language: Language,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    Passed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionTest {
    pub test_id: String,
    pub status: TestStatus,
    pub executed_at: f64,
    pub duration_ms: u64,
    pub exit_code: i32,
    pub stdout_head: String,
    pub stderr_head: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillMetadata {
    pub skill_id: String,
    pub version: String,
    pub language: Language,
    pub quarantine_state: QuarantineState,
    pub created_at: f64,
    pub updated_at: f64,
    pub source: SkillSource,
    pub code: CodeInfo,
    /// Ordered, append-only test history.
    pub execution_tests: Vec<ExecutionTest>,
    pub strike_count: u32,
}

impl SkillMetadata {
    pub fn passed_test_count(&self) -> usize {
        self.execution_tests
            .iter()
            .filter(|t| t.status == TestStatus::Passed)
            .count()
    }
}

pub(crate) fn now_secs() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}
