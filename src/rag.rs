// Warden — retrieval-augmented context builder.
// Embed the query, gather neighbours from three collections, keep only
// confident matches, and rank by the retention blend:
//
//   retention_score = 0.3*recency + 0.3*frequency + 0.4*priority_weight

use std::sync::Arc;

use serde_json::{Value, json};

use crate::error::CoreResult;
use crate::local_llm::LocalClient;
use crate::vector::{self, VectorStore};

pub const SIMILARITY_THRESHOLD: f64 = 0.75;
pub const CONTEXT_TOP_N: usize = 10;
const RESULTS_PER_COLLECTION: usize = 5;

const VECTOR_HARD_CAP: u64 = 100_000;
// Soft ceiling: start pruning at 90% of the hard cap.
const PRUNE_THRESHOLD: u64 = VECTOR_HARD_CAP / 10 * 9;
const PRUNE_BATCH: usize = 1000;
const PRUNE_SCAN_LIMIT: usize = 5000;

const RETRIEVAL_COLLECTIONS: [&str; 3] = [
    vector::CONVERSATION_HISTORY,
    vector::KNOWLEDGE_BASE,
    vector::SKILL_MEMORY,
];

pub fn priority_weight(priority: &str) -> f64 {
    match priority {
        "critical" => 1.0,
        "high" => 0.8,
        "normal" => 0.5,
        "temporary" => 0.2,
        _ => 0.5,
    }
}

/// Rank a memory record by recency, access frequency, and priority.
pub fn retention_score(metadata: &Value, now_secs: f64) -> f64 {
    let created_at = metadata["created_at"].as_f64().unwrap_or(now_secs);
    let access_count = metadata["access_count"].as_f64().unwrap_or(1.0);
    let priority = metadata["priority"].as_str().unwrap_or("normal");

    let age_days = ((now_secs - created_at) / 86_400.0).max(0.01);
    let recency = 1.0 / (1.0 + age_days / 30.0);
    let frequency = (access_count / 10.0).min(1.0);

    0.3 * recency + 0.3 * frequency + 0.4 * priority_weight(priority)
}

#[derive(Debug, Clone)]
pub struct RetrievedMemory {
    pub document: String,
    pub collection: String,
    pub similarity: f64,
    pub score: f64,
}

pub struct RagPipeline {
    local: Arc<LocalClient>,
    vector: Arc<VectorStore>,
}

impl RagPipeline {
    pub fn new(local: Arc<LocalClient>, vector: Arc<VectorStore>) -> Self {
        Self { local, vector }
    }

    /// Top-ranked confident matches across the retrieval collections, sorted
    /// by retention score descending.
    pub async fn retrieve(&self, query_text: &str) -> CoreResult<Vec<RetrievedMemory>> {
        let embedding = self.local.embed(query_text).await?;
        let now = chrono::Utc::now().timestamp() as f64;

        let mut candidates: Vec<RetrievedMemory> = Vec::new();
        for collection in RETRIEVAL_COLLECTIONS {
            let hits = match self
                .vector
                .query(collection, &embedding, RESULTS_PER_COLLECTION)
                .await
            {
                Ok(hits) => hits,
                Err(e) => {
                    tracing::warn!("rag: retrieve error in {}: {}", collection, e);
                    continue;
                }
            };
            for hit in hits {
                let similarity = 1.0 - hit.distance;
                if similarity < SIMILARITY_THRESHOLD {
                    continue;
                }
                candidates.push(RetrievedMemory {
                    document: hit.document,
                    collection: collection.to_string(),
                    similarity,
                    score: retention_score(&hit.metadata, now),
                });
            }
        }

        candidates.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        candidates.truncate(CONTEXT_TOP_N);
        Ok(candidates)
    }

    /// Ceiling check, retrieval, and block assembly; an empty retrieval yields
    /// an empty block (no context injected).
    pub async fn retrieve_and_format(&self, query_text: &str) -> CoreResult<String> {
        self.enforce_vector_ceiling().await;
        let retrieved = self.retrieve(query_text).await?;
        Ok(build_context_block(&retrieved))
    }

    /// When the store nears its hard cap, drop the oldest `temporary` entries
    /// from every collection. Failures degrade to a warning — retrieval still
    /// runs.
    async fn enforce_vector_ceiling(&self) {
        let total = self.vector.total_count().await;
        if total < PRUNE_THRESHOLD {
            return;
        }
        tracing::warn!(
            "rag: vector count {} >= ceiling {}, pruning temporary entries",
            total,
            PRUNE_THRESHOLD
        );
        for collection in vector::COLLECTIONS {
            match self
                .vector
                .get_where(
                    collection,
                    &json!({ "priority": { "$eq": "temporary" } }),
                    PRUNE_SCAN_LIMIT,
                )
                .await
            {
                Ok(mut entries) => {
                    // Oldest first.
                    entries.sort_by(|a, b| {
                        let ka = a.1["created_at"].as_f64().unwrap_or(0.0);
                        let kb = b.1["created_at"].as_f64().unwrap_or(0.0);
                        ka.partial_cmp(&kb).unwrap_or(std::cmp::Ordering::Equal)
                    });
                    let ids: Vec<String> =
                        entries.into_iter().take(PRUNE_BATCH).map(|(id, _)| id).collect();
                    if ids.is_empty() {
                        continue;
                    }
                    match self.vector.delete_ids(collection, &ids).await {
                        Ok(()) => tracing::info!("rag: pruned {} vectors from {}", ids.len(), collection),
                        Err(e) => tracing::warn!("rag: prune delete in {} failed: {}", collection, e),
                    }
                }
                Err(e) => tracing::warn!("rag: prune scan in {} failed: {}", collection, e),
            }
        }
    }
}

pub fn build_context_block(retrieved: &[RetrievedMemory]) -> String {
    if retrieved.is_empty() {
        return String::new();
    }
    let mut parts = vec!["[MEMORY CONTEXT]".to_string()];
    for item in retrieved {
        parts.push(format!(
            "[{} | score={:.2}] {}",
            item.collection, item.score, item.document
        ));
    }
    parts.push("[END CONTEXT]".to_string());
    parts.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_critical_outranks_stale_temporary() {
        let now = 1_700_000_000.0;
        let fresh = json!({ "created_at": now, "access_count": 10, "priority": "critical" });
        let stale = json!({ "created_at": now - 90.0 * 86_400.0, "access_count": 1, "priority": "temporary" });
        assert!(retention_score(&fresh, now) > retention_score(&stale, now));
    }

    #[test]
    fn frequency_saturates_at_ten_accesses() {
        let now = 1_700_000_000.0;
        let ten = json!({ "created_at": now, "access_count": 10, "priority": "normal" });
        let thousand = json!({ "created_at": now, "access_count": 1000, "priority": "normal" });
        assert_eq!(retention_score(&ten, now), retention_score(&thousand, now));
    }

    #[test]
    fn empty_retrieval_yields_empty_block() {
        assert!(build_context_block(&[]).is_empty());
    }
}
