// Warden — dream cycle.
// One maintenance worker, once a day at the configured local time. Five
// phases, each inside its own error boundary, under a 30-minute wall-clock
// cap checked before every phase. Exactly one instance may run at a time;
// manual triggers go through the same gate.

use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::{Value, json};
use sysinfo::{ProcessStatus, System};
use tokio_util::sync::CancellationToken;

use crate::cloud::CloudClient;
use crate::error::{CoreError, CoreResult};
use crate::kv::KvStore;
use crate::local_llm::LocalClient;
use crate::skills::registry::SkillRegistry;
use crate::vector::{self, VectorStore};

pub const HEALTH_REPORT_KEY: &str = "health:last_report";
const HEALTH_REPORT_TTL_SECS: u64 = 2 * 86_400;
const MAINTENANCE_CHANNEL: &str = "maintenance:events";

const MAX_DURATION: Duration = Duration::from_secs(1800);
const PRUNE_AGE: Duration = Duration::from_secs(30 * 86_400);
const PRUNE_LIMIT_PER_COLLECTION: usize = 5000;
const COMPRESS_THRESHOLD_BYTES: u64 = 10 * 1024 * 1024;

pub struct DreamCycle {
    kv: Arc<KvStore>,
    vector: Arc<VectorStore>,
    local: Arc<LocalClient>,
    cloud: Arc<CloudClient>,
    registry: Arc<SkillRegistry>,
    log_dir: PathBuf,
    hour: u32,
    minute: u32,
    // max_instances = 1: whoever holds this is the cycle.
    running: tokio::sync::Mutex<()>,
}

impl DreamCycle {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        kv: Arc<KvStore>,
        vector: Arc<VectorStore>,
        local: Arc<LocalClient>,
        cloud: Arc<CloudClient>,
        registry: Arc<SkillRegistry>,
        log_dir: PathBuf,
        hour: u32,
        minute: u32,
    ) -> Self {
        Self {
            kv,
            vector,
            local,
            cloud,
            registry,
            log_dir,
            hour: hour % 24,
            minute: minute % 60,
            running: tokio::sync::Mutex::new(()),
        }
    }

    /// Spawn the daily scheduler. Fires at the configured local hour:minute
    /// until the token is cancelled.
    pub fn spawn(self: &Arc<Self>, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        let cycle = Arc::clone(self);
        tokio::spawn(async move {
            tracing::info!(
                "dream: scheduled daily at {:02}:{:02} local",
                cycle.hour,
                cycle.minute
            );
            loop {
                let wait = cycle.duration_until_next();
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::info!("dream: scheduler stopped");
                        return;
                    }
                    _ = tokio::time::sleep(wait) => {}
                }
                if let Err(e) = cycle.trigger_now().await {
                    tracing::warn!("dream: scheduled run refused: {}", e);
                }
            }
        })
    }

    fn duration_until_next(&self) -> Duration {
        let now = chrono::Local::now().naive_local();
        let today = now
            .date()
            .and_hms_opt(self.hour, self.minute, 0)
            .unwrap_or(now);
        let target = if today > now {
            today
        } else {
            today + chrono::Duration::days(1)
        };
        (target - now).to_std().unwrap_or(Duration::from_secs(60))
    }

    /// Run the cycle now. Refused while another run holds the singleton.
    pub async fn trigger_now(&self) -> CoreResult<Value> {
        let Ok(_guard) = self.running.try_lock() else {
            return Err(CoreError::InvalidState(
                "dream cycle already running".into(),
            ));
        };
        Ok(self.run().await)
    }

    async fn run(&self) -> Value {
        let start = Instant::now();
        tracing::info!("dream: cycle starting — {}", Utc::now().to_rfc3339());

        let mut phases = serde_json::Map::new();
        for name in [
            "kv_snapshot",
            "vector_prune",
            "log_compress",
            "zombie_scan",
            "health_report",
        ] {
            let elapsed = start.elapsed();
            if elapsed >= MAX_DURATION {
                tracing::warn!("dream: hit 30-minute hard cap — stopping before {}", name);
                break;
            }
            tracing::info!("dream: phase {} (elapsed={}s)", name, elapsed.as_secs());
            let phase_start = Instant::now();
            let outcome = match name {
                "kv_snapshot" => self.phase_kv_snapshot().await,
                "vector_prune" => self.phase_vector_prune().await,
                "log_compress" => self.phase_log_compress().await,
                "zombie_scan" => self.phase_zombie_scan().await,
                _ => self.phase_health_report().await,
            };
            let entry = match outcome {
                Ok(mut result) => {
                    result["status"] = json!("ok");
                    result["duration_s"] = json!(phase_start.elapsed().as_secs_f64().round());
                    tracing::info!(
                        "dream: phase {} complete in {:.1}s",
                        name,
                        phase_start.elapsed().as_secs_f64()
                    );
                    result
                }
                Err(e) => {
                    tracing::error!("dream: phase {} failed: {}", name, e);
                    json!({
                        "status": "error",
                        "error": e.to_string(),
                        "duration_s": phase_start.elapsed().as_secs_f64().round(),
                    })
                }
            };
            phases.insert(name.to_string(), entry);
        }

        let report = json!({
            "phases": phases,
            "completed": true,
            "total_duration_s": start.elapsed().as_secs_f64().round(),
            "finished_at": Utc::now().to_rfc3339(),
        });
        tracing::info!(
            "dream: cycle complete in {:.1}s",
            start.elapsed().as_secs_f64()
        );
        if let Err(e) = self.kv.publish(MAINTENANCE_CHANNEL, "dream_cycle:complete").await {
            tracing::warn!("dream: completion broadcast failed: {}", e);
        }
        report
    }

    // ── Phase 1: KV memory snapshot ─────────────────────────────────────

    async fn phase_kv_snapshot(&self) -> CoreResult<Value> {
        let used_mb = self.kv.info_memory_mb().await?;
        tracing::info!("dream: kv memory {}MB", used_mb);
        Ok(json!({ "kv_used_mb": used_mb }))
    }

    // ── Phase 2: prune stale temporary vectors ──────────────────────────

    async fn phase_vector_prune(&self) -> CoreResult<Value> {
        let cutoff = Utc::now().timestamp() as f64 - PRUNE_AGE.as_secs_f64();
        let filter = json!({
            "$and": [
                { "priority": { "$eq": "temporary" } },
                { "last_access": { "$lt": cutoff } },
            ]
        });

        let mut total_pruned = 0usize;
        for collection in vector::COLLECTIONS {
            match self
                .vector
                .get_where(collection, &filter, PRUNE_LIMIT_PER_COLLECTION)
                .await
            {
                Ok(entries) => {
                    let ids: Vec<String> = entries.into_iter().map(|(id, _)| id).collect();
                    if ids.is_empty() {
                        continue;
                    }
                    match self.vector.delete_ids(collection, &ids).await {
                        Ok(()) => {
                            total_pruned += ids.len();
                            tracing::info!(
                                "dream: pruned {} vectors from {}",
                                ids.len(),
                                collection
                            );
                        }
                        Err(e) => {
                            tracing::warn!("dream: prune delete in {} failed: {}", collection, e)
                        }
                    }
                }
                Err(e) => tracing::warn!("dream: prune scan in {} failed: {}", collection, e),
            }
        }
        Ok(json!({ "vectors_pruned": total_pruned }))
    }

    // ── Phase 3: gzip oversized log files ───────────────────────────────

    async fn phase_log_compress(&self) -> CoreResult<Value> {
        // Tier-1 is never rotated; only tier-2 is eligible.
        let pattern = self.log_dir.join("tier2").join("*.jsonl");
        let pattern = pattern.to_string_lossy().to_string();

        let compressed = tokio::task::spawn_blocking(move || {
            let mut compressed = 0u64;
            let paths = match glob::glob(&pattern) {
                Ok(paths) => paths,
                Err(e) => {
                    tracing::warn!("dream: log glob failed: {}", e);
                    return compressed;
                }
            };
            for path in paths.flatten() {
                let size = match std::fs::metadata(&path) {
                    Ok(m) => m.len(),
                    Err(_) => continue,
                };
                if size <= COMPRESS_THRESHOLD_BYTES {
                    continue;
                }
                match gzip_file(&path) {
                    Ok(()) => {
                        compressed += 1;
                        tracing::info!("dream: compressed {}", path.display());
                    }
                    Err(e) => tracing::warn!("dream: compress of {} failed: {}", path.display(), e),
                }
            }
            compressed
        })
        .await
        .map_err(|e| CoreError::Infra(format!("log compression task failed: {e}")))?;

        Ok(json!({ "files_compressed": compressed }))
    }

    // ── Phase 4: zombie scan (informational) ────────────────────────────

    async fn phase_zombie_scan(&self) -> CoreResult<Value> {
        let zombies = tokio::task::spawn_blocking(|| {
            let mut sys = System::new();
            sys.refresh_processes();
            sys.processes()
                .values()
                .filter(|p| matches!(p.status(), ProcessStatus::Zombie))
                .map(|p| {
                    tracing::warn!("dream: zombie process pid {} ({})", p.pid(), p.name());
                    p.pid().as_u32()
                })
                .count()
        })
        .await
        .map_err(|e| CoreError::Infra(format!("zombie scan task failed: {e}")))?;

        Ok(json!({ "zombies_found": zombies }))
    }

    // ── Phase 5: health report ──────────────────────────────────────────

    async fn phase_health_report(&self) -> CoreResult<Value> {
        let report =
            collect_health(&self.kv, &self.vector, &self.local, &self.cloud, &self.registry).await;
        self.kv
            .set_json_ex(HEALTH_REPORT_KEY, &report, HEALTH_REPORT_TTL_SECS)
            .await?;
        tracing::info!("dream: health report stored");
        Ok(json!({ "health": report["system"] }))
    }
}

fn gzip_file(path: &std::path::Path) -> std::io::Result<()> {
    let gz_path = path.with_extension("jsonl.gz");
    let mut input = std::fs::File::open(path)?;
    let output = std::fs::File::create(&gz_path)?;
    let mut encoder = flate2::write::GzEncoder::new(output, flate2::Compression::default());
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = input.read(&mut buf)?;
        if n == 0 {
            break;
        }
        encoder.write_all(&buf[..n])?;
    }
    encoder.finish()?;
    std::fs::remove_file(path)?;
    Ok(())
}

/// System + store + backend health snapshot. Sections degrade independently.
pub async fn collect_health(
    kv: &Arc<KvStore>,
    vector: &Arc<VectorStore>,
    local: &Arc<LocalClient>,
    cloud: &Arc<CloudClient>,
    registry: &Arc<SkillRegistry>,
) -> Value {
    let system = tokio::task::spawn_blocking(|| {
        let mut sys = System::new();
        sys.refresh_memory();
        sys.refresh_cpu();
        json!({
            "cpu_percent": sys.global_cpu_info().cpu_usage(),
            "mem_total_mb": sys.total_memory() / (1024 * 1024),
            "mem_used_mb": sys.used_memory() / (1024 * 1024),
        })
    })
    .await
    .unwrap_or_else(|_| json!({}));

    let kv_ok = kv.ping().await;
    let kv_used_mb = if kv_ok {
        kv.info_memory_mb().await.ok()
    } else {
        None
    };
    let vector_ok = vector.ping().await;
    let vector_count = if vector_ok {
        Some(vector.total_count().await)
    } else {
        None
    };

    json!({
        "system": system,
        "kv": { "ok": kv_ok, "used_mb": kv_used_mb },
        "vector": { "ok": vector_ok, "count": vector_count },
        "local": { "ok": local.is_available().await },
        "cloud": cloud.status(),
        "skills": {
            "active": registry.list("active").await.len(),
            "quarantine": registry.list("quarantine").await.len(),
            "deprecated": registry.list("deprecated").await.len(),
        },
    })
}
