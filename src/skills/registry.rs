// Warden — skill registry.
// Metadata CRUD across the quarantine/active/deprecated buckets. The
// directory layout encodes authoritative state; a bucket move (rename) is the
// commit point of every state transition.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::error::{CoreError, CoreResult};

use super::{
    CodeInfo, ExecutionTest, Language, QuarantineState, SkillMetadata, SkillSource, now_secs,
};

/// Skill code cap: 1 MiB.
pub const SKILL_MAX_SIZE_BYTES: u64 = 1_048_576;

const BUCKETS: [&str; 3] = ["active", "quarantine", "deprecated"];

pub struct SkillRegistry {
    root: PathBuf,
}

impl SkillRegistry {
    pub fn new(root: &Path) -> Self {
        Self { root: root.to_path_buf() }
    }

    pub fn skill_dir(&self, skill_id: &str, bucket: &str) -> PathBuf {
        self.root.join(bucket).join(skill_id)
    }

    fn meta_path(&self, skill_id: &str, bucket: &str) -> PathBuf {
        self.skill_dir(skill_id, bucket).join("metadata.json")
    }

    /// Path of the code file for a skill in its current bucket.
    pub fn code_path(&self, meta: &SkillMetadata) -> PathBuf {
        self.skill_dir(&meta.skill_id, meta.quarantine_state.bucket())
            .join(meta.language.code_file_name())
    }

    /// Load metadata, searching every bucket.
    pub async fn load(&self, skill_id: &str) -> CoreResult<SkillMetadata> {
        for bucket in BUCKETS {
            if let Some(meta) = self.load_in(skill_id, bucket).await {
                return Ok(meta);
            }
        }
        Err(CoreError::NotFound(skill_id.to_string()))
    }

    pub async fn load_in(&self, skill_id: &str, bucket: &str) -> Option<SkillMetadata> {
        let path = self.meta_path(skill_id, bucket);
        let raw = tokio::fs::read_to_string(&path).await.ok()?;
        match serde_json::from_str(&raw) {
            Ok(meta) => Some(meta),
            Err(e) => {
                tracing::error!(
                    "registry: metadata for {}/{} unreadable: {}",
                    bucket,
                    skill_id,
                    e
                );
                None
            }
        }
    }

    pub async fn save(&self, meta: &SkillMetadata) -> CoreResult<()> {
        let path = self.meta_path(&meta.skill_id, meta.quarantine_state.bucket());
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, serde_json::to_vec_pretty(meta)?).await?;
        Ok(())
    }

    pub async fn list(&self, bucket: &str) -> Vec<SkillMetadata> {
        let bucket_dir = self.root.join(bucket);
        let Ok(mut entries) = tokio::fs::read_dir(&bucket_dir).await else {
            return Vec::new();
        };
        let mut skills = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            let id = entry.file_name().to_string_lossy().to_string();
            if let Some(meta) = self.load_in(&id, bucket).await {
                skills.push(meta);
            }
        }
        skills
    }

    /// Create (or re-submit) a skill in quarantine. A skill that already left
    /// quarantine cannot be silently replaced.
    pub async fn register_new(
        &self,
        skill_id: &str,
        code: &str,
        language: Language,
        source_type: &str,
        origin: &str,
    ) -> CoreResult<SkillMetadata> {
        let size_bytes = code.len() as u64;
        if size_bytes > SKILL_MAX_SIZE_BYTES {
            return Err(CoreError::InvalidState(format!(
                "skill code exceeds {SKILL_MAX_SIZE_BYTES} byte limit"
            )));
        }
        for bucket in ["active", "deprecated"] {
            if self.load_in(skill_id, bucket).await.is_some() {
                return Err(CoreError::InvalidState(format!(
                    "skill {skill_id} already exists in {bucket}"
                )));
            }
        }

        let now = now_secs();
        let meta = SkillMetadata {
            skill_id: skill_id.to_string(),
            version: "0.1.0".to_string(),
            language,
            quarantine_state: QuarantineState::Pending,
            created_at: now,
            updated_at: now,
            source: SkillSource {
                source_type: source_type.to_string(),
                origin: origin.to_string(),
            },
            code: CodeInfo {
                hash: sha256_hex(code.as_bytes()),
                size_bytes,
                language,
            },
            execution_tests: Vec::new(),
            strike_count: 0,
        };

        let dir = self.skill_dir(skill_id, "quarantine");
        tokio::fs::create_dir_all(&dir).await?;
        tokio::fs::write(dir.join(language.code_file_name()), code).await?;
        self.save(&meta).await?;
        tracing::info!("registry: skill {} registered in quarantine", skill_id);
        Ok(meta)
    }

    /// Move a skill to a new state. When the state changes bucket, the
    /// directory rename commits the transition — under concurrent transitions
    /// exactly one rename wins and the loser surfaces as INVALID_STATE.
    pub async fn update_state(
        &self,
        skill_id: &str,
        new_state: QuarantineState,
    ) -> CoreResult<SkillMetadata> {
        let mut meta = self.load(skill_id).await?;
        let old_bucket = meta.quarantine_state.bucket();
        let new_bucket = new_state.bucket();

        if old_bucket != new_bucket {
            let old_dir = self.skill_dir(skill_id, old_bucket);
            let new_dir = self.skill_dir(skill_id, new_bucket);
            if let Some(parent) = new_dir.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            if let Err(e) = tokio::fs::rename(&old_dir, &new_dir).await {
                return Err(CoreError::InvalidState(format!(
                    "skill {skill_id}: transition to {} lost ({e})",
                    new_state.as_str()
                )));
            }
        }

        meta.quarantine_state = new_state;
        meta.updated_at = now_secs();
        self.save(&meta).await?;
        Ok(meta)
    }

    /// Append a test-result record (the history is append-only).
    pub async fn record_test_result(
        &self,
        skill_id: &str,
        test: ExecutionTest,
    ) -> CoreResult<SkillMetadata> {
        let mut meta = self.load(skill_id).await?;
        meta.execution_tests.push(test);
        meta.updated_at = now_secs();
        self.save(&meta).await?;
        Ok(meta)
    }

    pub async fn increment_strike(&self, skill_id: &str) -> CoreResult<u32> {
        let mut meta = self.load(skill_id).await?;
        meta.strike_count += 1;
        meta.updated_at = now_secs();
        self.save(&meta).await?;
        Ok(meta.strike_count)
    }

    /// Recompute the on-disk hash and compare against the recorded one.
    /// Required at every entry to sandbox execution.
    pub async fn verify_hash(&self, meta: &SkillMetadata) -> CoreResult<()> {
        let path = self.code_path(meta);
        let bytes = tokio::fs::read(&path).await.map_err(|e| {
            CoreError::InvalidState(format!("skill code missing at {}: {e}", path.display()))
        })?;
        if sha256_hex(&bytes) != meta.code.hash {
            return Err(CoreError::Tamper(meta.skill_id.clone()));
        }
        Ok(())
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn identical_code_yields_identical_hash() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = SkillRegistry::new(tmp.path());
        let a = registry
            .register_new("hash-a", "print('ok')", Language::Python, "user_submitted", "test")
            .await
            .unwrap();
        let b = registry
            .register_new("hash-b", "print('ok')", Language::Python, "user_submitted", "test")
            .await
            .unwrap();
        assert_eq!(a.code.hash, b.code.hash);
    }

    #[tokio::test]
    async fn oversized_code_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = SkillRegistry::new(tmp.path());
        let big = "x".repeat(SKILL_MAX_SIZE_BYTES as usize + 1);
        let result = registry
            .register_new("too-big", &big, Language::Python, "user_submitted", "test")
            .await;
        assert!(matches!(result, Err(CoreError::InvalidState(_))));
    }
}
