// Warden — vector store client.
// Long-term memory over a Chroma-style HTTP server: four cosine collections
// with priority/TTL metadata. The indexing algorithm is the server's concern;
// this client only speaks the wire contract.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::RwLock;

use crate::error::{CoreError, CoreResult};

pub const SKILL_MEMORY: &str = "skill_memory";
pub const CONVERSATION_HISTORY: &str = "conversation_history";
pub const KNOWLEDGE_BASE: &str = "knowledge_base";
pub const SKILL_REGISTRY: &str = "skill_registry";

pub const COLLECTIONS: [&str; 4] = [
    SKILL_MEMORY,
    CONVERSATION_HISTORY,
    KNOWLEDGE_BASE,
    SKILL_REGISTRY,
];

/// One retrieved neighbour. `distance` is cosine distance (1 − similarity).
#[derive(Debug, Clone)]
pub struct QueryHit {
    pub document: String,
    pub metadata: Value,
    pub distance: f64,
}

pub struct VectorStore {
    http: reqwest::Client,
    base_url: String,
    // collection name → server-side id, resolved once per process
    collection_ids: RwLock<HashMap<String, String>>,
}

impl VectorStore {
    pub fn new(http: reqwest::Client, base_url: &str) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            collection_ids: RwLock::new(HashMap::new()),
        }
    }

    pub async fn ping(&self) -> bool {
        self.http
            .get(format!("{}/api/v1/heartbeat", self.base_url))
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }

    pub async fn wait_until_ready(&self, retries: u32, delay: Duration) -> bool {
        for attempt in 1..=retries {
            if self.ping().await {
                tracing::info!("vector: connected (attempt {})", attempt);
                return true;
            }
            tracing::warn!("vector: not ready, attempt {}/{}", attempt, retries);
            tokio::time::sleep(delay).await;
        }
        false
    }

    /// Create (or fetch) every collection this runtime uses, cosine space.
    pub async fn ensure_collections(&self) -> CoreResult<()> {
        for name in COLLECTIONS {
            self.collection_id(name).await?;
            tracing::info!("vector: collection ready: {}", name);
        }
        Ok(())
    }

    async fn collection_id(&self, name: &str) -> CoreResult<String> {
        if let Some(id) = self.collection_ids.read().await.get(name) {
            return Ok(id.clone());
        }
        let body: Value = self
            .post_json(
                &format!("{}/api/v1/collections", self.base_url),
                &json!({
                    "name": name,
                    "metadata": { "hnsw:space": "cosine" },
                    "get_or_create": true,
                }),
            )
            .await?;
        let id = body["id"]
            .as_str()
            .ok_or_else(|| CoreError::Infra(format!("vector: no id for collection {name}")))?
            .to_string();
        self.collection_ids
            .write()
            .await
            .insert(name.to_string(), id.clone());
        Ok(id)
    }

    pub async fn add(
        &self,
        collection: &str,
        ids: &[String],
        documents: &[String],
        embeddings: &[Vec<f32>],
        metadatas: &[Value],
    ) -> CoreResult<()> {
        let cid = self.collection_id(collection).await?;
        self.post_json::<Value>(
            &format!("{}/api/v1/collections/{}/add", self.base_url, cid),
            &json!({
                "ids": ids,
                "documents": documents,
                "embeddings": embeddings,
                "metadatas": metadatas,
            }),
        )
        .await?;
        Ok(())
    }

    /// Nearest neighbours for one query embedding.
    pub async fn query(
        &self,
        collection: &str,
        embedding: &[f32],
        n_results: usize,
    ) -> CoreResult<Vec<QueryHit>> {
        let cid = self.collection_id(collection).await?;
        let body: Value = self
            .post_json(
                &format!("{}/api/v1/collections/{}/query", self.base_url, cid),
                &json!({
                    "query_embeddings": [embedding],
                    "n_results": n_results,
                    "include": ["documents", "metadatas", "distances"],
                }),
            )
            .await?;

        let docs = body["documents"][0].as_array().cloned().unwrap_or_default();
        let metas = body["metadatas"][0].as_array().cloned().unwrap_or_default();
        let dists = body["distances"][0].as_array().cloned().unwrap_or_default();

        let hits = docs
            .iter()
            .zip(metas.iter())
            .zip(dists.iter())
            .filter_map(|((doc, meta), dist)| {
                Some(QueryHit {
                    document: doc.as_str()?.to_string(),
                    metadata: meta.clone(),
                    distance: dist.as_f64()?,
                })
            })
            .collect();
        Ok(hits)
    }

    /// Entries matching a metadata filter (`$eq`, `$and`, `$lt`), capped at
    /// `limit`. Returns (id, metadata) pairs.
    pub async fn get_where(
        &self,
        collection: &str,
        filter: &Value,
        limit: usize,
    ) -> CoreResult<Vec<(String, Value)>> {
        let cid = self.collection_id(collection).await?;
        let body: Value = self
            .post_json(
                &format!("{}/api/v1/collections/{}/get", self.base_url, cid),
                &json!({
                    "where": filter,
                    "limit": limit,
                    "include": ["metadatas"],
                }),
            )
            .await?;
        let ids = body["ids"].as_array().cloned().unwrap_or_default();
        let metas = body["metadatas"].as_array().cloned().unwrap_or_default();
        let entries = ids
            .iter()
            .enumerate()
            .filter_map(|(i, id)| {
                Some((
                    id.as_str()?.to_string(),
                    metas.get(i).cloned().unwrap_or(Value::Null),
                ))
            })
            .collect();
        Ok(entries)
    }

    pub async fn delete_ids(&self, collection: &str, ids: &[String]) -> CoreResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let cid = self.collection_id(collection).await?;
        self.post_json::<Value>(
            &format!("{}/api/v1/collections/{}/delete", self.base_url, cid),
            &json!({ "ids": ids }),
        )
        .await?;
        Ok(())
    }

    pub async fn count(&self, collection: &str) -> CoreResult<u64> {
        let cid = self.collection_id(collection).await?;
        let resp = self
            .http
            .get(format!("{}/api/v1/collections/{}/count", self.base_url, cid))
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| CoreError::Infra(format!("vector count failed: {e}")))?;
        let count: u64 = resp
            .json()
            .await
            .map_err(|e| CoreError::Infra(format!("vector count parse failed: {e}")))?;
        Ok(count)
    }

    /// Sum of all collection counts. Collections that error count as zero so
    /// one bad collection cannot block ceiling enforcement.
    pub async fn total_count(&self) -> u64 {
        let mut total = 0;
        for name in COLLECTIONS {
            match self.count(name).await {
                Ok(c) => total += c,
                Err(e) => tracing::warn!("vector: count of {} failed: {}", name, e),
            }
        }
        total
    }

    async fn post_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        body: &Value,
    ) -> CoreResult<T> {
        let resp = self
            .http
            .post(url)
            .timeout(Duration::from_secs(30))
            .json(body)
            .send()
            .await
            .map_err(|e| CoreError::Infra(format!("vector request failed: {e}")))?;
        if !resp.status().is_success() {
            return Err(CoreError::Infra(format!(
                "vector store returned {} for {}",
                resp.status(),
                url
            )));
        }
        resp.json()
            .await
            .map_err(|e| CoreError::Infra(format!("vector response parse failed: {e}")))
    }
}
