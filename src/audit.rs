// Warden — security audit journal.
// Tier-1 is append-only JSON Lines with indefinite retention: security events,
// skill promotions, lockdowns. Tier-2 holds rotatable operational entries.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use serde_json::{Value, json};

/// Entry severity as recorded in the journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "INFO",
            Severity::Warning => "WARNING",
            Severity::High => "HIGH",
            Severity::Critical => "CRITICAL",
        }
    }
}

/// Append-only audit journal. Write failures are logged but never propagated
/// (audit must not break the main request flow).
pub struct AuditLog {
    tier1_file: PathBuf,
    tier2_file: PathBuf,
    // Serialises concurrent appenders so entries stay whole lines.
    write_lock: Mutex<()>,
}

impl AuditLog {
    pub fn new(log_dir: &Path) -> Self {
        Self {
            tier1_file: log_dir.join("tier1").join("audit.jsonl"),
            tier2_file: log_dir.join("tier2").join("ops.jsonl"),
            write_lock: Mutex::new(()),
        }
    }

    /// Record a tier-1 event. Returns the correlation id used for the entry.
    pub fn log_event(
        &self,
        event_type: &str,
        details: Value,
        severity: Severity,
        correlation_id: Option<&str>,
    ) -> String {
        let cid = correlation_id
            .map(|c| c.to_string())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let entry = json!({
            "timestamp": Utc::now().to_rfc3339(),
            "correlation_id": cid,
            "severity": severity.as_str(),
            "event_type": event_type,
            "details": details,
        });
        self.append(&self.tier1_file, &entry);
        cid
    }

    /// Record a tier-2 operational entry (rotatable).
    pub fn log_ops(&self, event_type: &str, details: Value) {
        let entry = json!({
            "timestamp": Utc::now().to_rfc3339(),
            "event_type": event_type,
            "details": details,
        });
        self.append(&self.tier2_file, &entry);
    }

    fn append(&self, file: &Path, entry: &Value) {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let result = (|| -> std::io::Result<()> {
            if let Some(parent) = file.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut f = OpenOptions::new().create(true).append(true).open(file)?;
            f.write_all(entry.to_string().as_bytes())?;
            f.write_all(b"\n")?;
            Ok(())
        })();
        if let Err(e) = result {
            tracing::error!("audit: write to {} failed: {}", file.display(), e);
        }
    }

    // ── Typed helpers ───────────────────────────────────────────────────

    /// Detection names and input length only — never the input itself.
    pub fn log_injection_attempt(&self, detections: &[String], input_len: usize, severity: Severity) -> String {
        self.log_event(
            "PROMPT_INJECTION_ATTEMPT",
            json!({ "detection_rules": detections, "input_length": input_len }),
            severity,
            None,
        )
    }

    /// The journal only ever sees a two-character prefix of the unlock code.
    pub fn log_lockdown(&self, reason: &str, unlock_code: &str) -> String {
        let hint: String = unlock_code.chars().take(2).collect();
        self.log_event(
            "SECURITY_LOCKDOWN",
            json!({ "reason": reason, "unlock_code_hint": format!("{hint}**") }),
            Severity::Critical,
            None,
        )
    }

    pub fn log_skill_promotion(&self, skill_id: &str, promoted_by: &str) -> String {
        self.log_event(
            "SKILL_PROMOTED",
            json!({ "skill_id": skill_id, "promoted_by": promoted_by }),
            Severity::Info,
            None,
        )
    }

    pub fn log_skill_rejection(&self, skill_id: &str, reason: &str) -> String {
        self.log_event(
            "SKILL_REJECTED",
            json!({ "skill_id": skill_id, "reason": reason }),
            Severity::Info,
            None,
        )
    }

    pub fn log_skill_deprecation(&self, skill_id: &str, reason: &str) -> String {
        self.log_event(
            "SKILL_DEPRECATED",
            json!({ "skill_id": skill_id, "reason": reason }),
            Severity::Warning,
            None,
        )
    }

    pub fn log_forced_termination(&self, target: &str, reason: &str) -> String {
        self.log_event(
            "FORCED_TERMINATION",
            json!({ "target": target, "reason": reason }),
            Severity::Critical,
            None,
        )
    }

    #[doc(hidden)]
    pub fn tier1_path(&self) -> &Path {
        &self.tier1_file
    }
}
