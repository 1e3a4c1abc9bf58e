// Warden — application state.
// Every long-lived singleton (VRAM mutex, breaker, token tracker, pending
// codes, scheduler, watchdog) is constructed exactly once here and passed by
// reference to collaborators. No hidden module-level mutation.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::audit::AuditLog;
use crate::cloud::CloudClient;
use crate::codes::PendingCodes;
use crate::config::Config;
use crate::dream::DreamCycle;
use crate::error::CoreResult;
use crate::firewall::Firewall;
use crate::kv::KvStore;
use crate::local_llm::LocalClient;
use crate::lockdown::Lockdown;
use crate::orchestrator::Orchestrator;
use crate::rag::RagPipeline;
use crate::router::ModelRouter;
use crate::skills::quarantine::Quarantine;
use crate::skills::registry::SkillRegistry;
use crate::skills::strikes::StrikeSystem;
use crate::vector::VectorStore;
use crate::vram::{ModelBackend, VramMutex};
use crate::watchdog::Watchdog;

/// Central application state. Clone-friendly — everything inside is Arc'd.
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub http: reqwest::Client,
    pub kv: Arc<KvStore>,
    pub vector: Arc<VectorStore>,
    pub audit: Arc<AuditLog>,
    pub codes: Arc<PendingCodes>,
    pub local: Arc<LocalClient>,
    pub cloud: Arc<CloudClient>,
    pub vram: Arc<VramMutex>,
    pub firewall: Arc<Firewall>,
    pub lockdown: Arc<Lockdown>,
    pub registry: Arc<SkillRegistry>,
    pub quarantine: Arc<Quarantine>,
    pub strikes: Arc<StrikeSystem>,
    pub rag: Arc<RagPipeline>,
    pub router: Arc<ModelRouter>,
    pub orchestrator: Arc<Orchestrator>,
    pub watchdog: Arc<Watchdog>,
    pub dream: Arc<DreamCycle>,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(config: Config) -> CoreResult<Self> {
        let http = reqwest::Client::builder()
            .pool_max_idle_per_host(10)
            .timeout(Duration::from_secs(120))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| crate::error::CoreError::Infra(format!("http client build failed: {e}")))?;

        let audit = Arc::new(AuditLog::new(&config.log_dir));
        let kv = Arc::new(KvStore::new(&config.redis_url)?);
        let vector = Arc::new(VectorStore::new(http.clone(), &config.vector_store_url));
        let codes = Arc::new(PendingCodes::new());

        let local = Arc::new(LocalClient::new(
            http.clone(),
            &config.local_llm_url,
            &config.coder_model,
            &config.vision_model,
            &config.embedding_model,
            &config.local_llm_process,
        ));
        let cloud = Arc::new(CloudClient::new(
            http.clone(),
            &config.cloud_api_url,
            &config.cloud_api_key,
            &config.cloud_model,
            &config.cloud_fallback_model,
            config.cloud_max_tokens,
            config.cloud_daily_token_budget,
        ));
        let vram = Arc::new(VramMutex::new(
            Arc::clone(&local) as Arc<dyn ModelBackend>,
            Arc::clone(&kv),
            Arc::clone(&audit),
        ));

        let firewall = Arc::new(Firewall::new(Arc::clone(&audit)));
        let lockdown = Arc::new(Lockdown::new(Arc::clone(&kv), Arc::clone(&audit)));

        let registry = Arc::new(SkillRegistry::new(&config.skills_dir));
        let quarantine = Arc::new(Quarantine::new(
            Arc::clone(&registry),
            Arc::clone(&codes),
            Arc::clone(&audit),
            Duration::from_secs(config.sandbox_timeout_secs),
        ));
        let strikes = Arc::new(StrikeSystem::new(
            Arc::clone(&kv),
            Arc::clone(&registry),
            Arc::clone(&audit),
            config.strike_threshold,
        ));

        let rag = Arc::new(RagPipeline::new(Arc::clone(&local), Arc::clone(&vector)));
        let router = Arc::new(ModelRouter::new(
            Arc::clone(&local),
            Arc::clone(&cloud),
            Arc::clone(&vram),
        ));
        let orchestrator = Arc::new(Orchestrator::new(
            Arc::clone(&firewall),
            Arc::clone(&lockdown),
            Arc::clone(&rag),
            Arc::clone(&router),
            Arc::clone(&local),
            Arc::clone(&vector),
            Arc::clone(&audit),
        ));

        let watchdog = Watchdog::new(Arc::clone(&audit));
        let dream = Arc::new(DreamCycle::new(
            Arc::clone(&kv),
            Arc::clone(&vector),
            Arc::clone(&local),
            Arc::clone(&cloud),
            Arc::clone(&registry),
            config.log_dir.clone(),
            config.dream_cycle_hour,
            config.dream_cycle_minute,
        ));

        tracing::info!(
            "AppState initialised — skills at {}, logs at {}",
            config.skills_dir.display(),
            config.log_dir.display()
        );

        Ok(Self {
            config,
            http,
            kv,
            vector,
            audit,
            codes,
            local,
            cloud,
            vram,
            firewall,
            lockdown,
            registry,
            quarantine,
            strikes,
            rag,
            router,
            orchestrator,
            watchdog,
            dream,
            start_time: Instant::now(),
        })
    }
}
