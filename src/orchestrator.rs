// Warden — message orchestrator.
// The end-to-end pipeline: firewall → lockdown gate → context retrieval →
// prompt assembly → routing → response, with the conversation turn persisted
// in the background. Pipeline errors come back as structured outcomes, never
// as panics or transport-level throws.

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use serde_json::json;

use crate::audit::AuditLog;
use crate::firewall::{Firewall, ThreatLevel};
use crate::local_llm::LocalClient;
use crate::lockdown::Lockdown;
use crate::rag::RagPipeline;
use crate::router::ModelRouter;
use crate::vector::{self, VectorStore};

const LOCKDOWN_NOTICE: &str =
    "System is in lockdown mode. Please provide the unlock code to an administrator.";

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum MessageOutcome {
    Completed {
        correlation_id: String,
        session_id: String,
        response: String,
        duration_ms: u64,
        blocked: bool,
    },
    Blocked {
        correlation_id: String,
        blocked: bool,
        reason: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        detections: Option<Vec<String>>,
        #[serde(skip_serializing_if = "Option::is_none")]
        response: Option<String>,
    },
    Failed {
        correlation_id: String,
        error: String,
    },
}

impl MessageOutcome {
    pub fn is_blocked(&self) -> bool {
        matches!(self, MessageOutcome::Blocked { .. })
    }

    pub fn correlation_id(&self) -> &str {
        match self {
            MessageOutcome::Completed { correlation_id, .. }
            | MessageOutcome::Blocked { correlation_id, .. }
            | MessageOutcome::Failed { correlation_id, .. } => correlation_id,
        }
    }
}

pub struct Orchestrator {
    firewall: Arc<Firewall>,
    lockdown: Arc<Lockdown>,
    rag: Arc<RagPipeline>,
    router: Arc<ModelRouter>,
    local: Arc<LocalClient>,
    vector: Arc<VectorStore>,
    audit: Arc<AuditLog>,
}

impl Orchestrator {
    pub fn new(
        firewall: Arc<Firewall>,
        lockdown: Arc<Lockdown>,
        rag: Arc<RagPipeline>,
        router: Arc<ModelRouter>,
        local: Arc<LocalClient>,
        vector: Arc<VectorStore>,
        audit: Arc<AuditLog>,
    ) -> Self {
        Self { firewall, lockdown, rag, router, local, vector, audit }
    }

    pub async fn process_message(
        &self,
        user_input: &str,
        session_id: Option<&str>,
        images: Option<Vec<String>>,
        force_cloud: bool,
    ) -> MessageOutcome {
        let correlation_id = uuid::Uuid::new_v4().to_string();
        let session_id = session_id
            .map(str::to_string)
            .unwrap_or_else(|| correlation_id.clone());
        let start = Instant::now();

        tracing::info!(
            "[{}] processing message (len={})",
            correlation_id,
            user_input.len()
        );

        // Step 1: firewall. The firewall rejects before any model call.
        let verdict = self.firewall.scan(user_input);
        if verdict.threat_level == ThreatLevel::Critical {
            self.lockdown
                .activate(&verdict.detections.join(", "))
                .await;
        }
        if !verdict.allowed {
            tracing::warn!(
                "[{}] blocked by firewall: {:?}",
                correlation_id,
                verdict.detections
            );
            return MessageOutcome::Blocked {
                correlation_id,
                blocked: true,
                reason: "security_policy".into(),
                detections: Some(verdict.detections),
                response: None,
            };
        }

        // Step 2: lockdown gate.
        if self.lockdown.is_active().await {
            return MessageOutcome::Blocked {
                correlation_id,
                blocked: true,
                reason: "system_lockdown".into(),
                detections: None,
                response: Some(LOCKDOWN_NOTICE.into()),
            };
        }

        // Step 3: retrieval. Failures degrade to an uncontextualised prompt.
        let context_block = match self.rag.retrieve_and_format(user_input).await {
            Ok(block) => block,
            Err(e) => {
                tracing::warn!(
                    "[{}] retrieval failed (continuing without context): {}",
                    correlation_id,
                    e
                );
                String::new()
            }
        };

        // Step 4: prompt assembly.
        let prompt = if context_block.is_empty() {
            user_input.to_string()
        } else {
            format!("{context_block}\n\n{user_input}")
        };

        // Step 5: routing.
        let response = match self
            .router
            .route(&prompt, None, images.as_deref(), force_cloud)
            .await
        {
            Ok(response) => response,
            Err(e) => {
                tracing::error!("[{}] model routing failed: {}", correlation_id, e);
                return MessageOutcome::Failed {
                    correlation_id,
                    error: e.to_string(),
                };
            }
        };

        let duration_ms = start.elapsed().as_millis() as u64;
        tracing::info!("[{}] response generated in {}ms", correlation_id, duration_ms);
        self.audit.log_ops(
            "message_processed",
            json!({
                "correlation_id": correlation_id,
                "session_id": session_id,
                "input_length": user_input.len(),
                "duration_ms": duration_ms,
            }),
        );

        // Step 6: persist the turn in the background; its failures never
        // touch the response.
        self.spawn_store_turn(&session_id, &correlation_id, user_input, &response);

        MessageOutcome::Completed {
            correlation_id,
            session_id,
            response,
            duration_ms,
            blocked: false,
        }
    }

    fn spawn_store_turn(
        &self,
        session_id: &str,
        correlation_id: &str,
        user_input: &str,
        response: &str,
    ) {
        let local = Arc::clone(&self.local);
        let store = Arc::clone(&self.vector);
        let session_id = session_id.to_string();
        let correlation_id = correlation_id.to_string();
        let document = format!("User: {user_input}\nAssistant: {response}");

        tokio::spawn(async move {
            let embedding = match local.embed(&document).await {
                Ok(embedding) => embedding,
                Err(e) => {
                    tracing::warn!("store_turn: embedding failed: {}", e);
                    return;
                }
            };
            let now = chrono::Utc::now().timestamp_millis() as f64 / 1000.0;
            let result = store
                .add(
                    vector::CONVERSATION_HISTORY,
                    &[correlation_id],
                    &[document],
                    &[embedding],
                    &[json!({
                        "session_id": session_id,
                        "created_at": now,
                        "last_access": now,
                        "access_count": 1,
                        "priority": "normal",
                    })],
                )
                .await;
            if let Err(e) = result {
                tracing::warn!("store_turn: failed to store conversation turn: {}", e);
            }
        });
    }
}
