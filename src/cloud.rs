// Warden — cloud escalation client.
// Protects the external LLM endpoint with a three-state circuit breaker and a
// daily token budget. The primary/fallback model pair is pure configuration;
// the fallback is tried exactly once, on rate-limit classification only.

use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

use chrono::{NaiveDate, Utc};
use serde_json::{Value, json};

use crate::error::{CoreError, CoreResult};

const FAILURE_THRESHOLD: u32 = 3;
const BREAKER_COOLDOWN: Duration = Duration::from_secs(3600);
const CLOUD_CALL_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }
}

/// How a cloud failure is classified (substring match on the error text).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    RateLimit,
    Safety,
    Other,
}

pub fn classify_failure(error_text: &str) -> FailureKind {
    if error_text.contains("429")
        || error_text.contains("RESOURCE_EXHAUSTED")
        || error_text.to_lowercase().contains("quota")
    {
        FailureKind::RateLimit
    } else if error_text.to_uppercase().contains("SAFETY")
        || error_text.to_uppercase().contains("BLOCKED")
    {
        FailureKind::Safety
    } else {
        FailureKind::Other
    }
}

struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    open_since: Option<Instant>,
    trial_in_flight: bool,
}

/// CLOSED → OPEN on 3 consecutive failures or one rate-limit/safety failure.
/// OPEN rejects everything for the cooldown, then HALF_OPEN admits exactly one
/// trial: success closes the circuit, failure re-opens it with the counter
/// restarted. Process-global; one internal critical section.
pub struct CircuitBreaker {
    inner: StdMutex<BreakerInner>,
    cooldown: Duration,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new()
    }
}

impl CircuitBreaker {
    pub fn new() -> Self {
        Self::with_cooldown(BREAKER_COOLDOWN)
    }

    #[doc(hidden)]
    pub fn with_cooldown(cooldown: Duration) -> Self {
        Self {
            inner: StdMutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                open_since: None,
                trial_in_flight: false,
            }),
            cooldown,
        }
    }

    /// Whether a call may go out right now. Transitions OPEN → HALF_OPEN when
    /// the cooldown has elapsed; the caller that gets `true` in HALF_OPEN owns
    /// the single trial.
    pub fn allow_request(&self) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                let elapsed = inner
                    .open_since
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::MAX);
                if elapsed >= self.cooldown {
                    inner.state = BreakerState::HalfOpen;
                    inner.trial_in_flight = true;
                    tracing::info!("cloud breaker: OPEN -> HALF_OPEN, admitting trial call");
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen => {
                if inner.trial_in_flight {
                    false
                } else {
                    inner.trial_in_flight = true;
                    true
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.state != BreakerState::Closed || inner.consecutive_failures > 0 {
            tracing::info!("cloud breaker: -> CLOSED");
        }
        inner.state = BreakerState::Closed;
        inner.consecutive_failures = 0;
        inner.open_since = None;
        inner.trial_in_flight = false;
    }

    pub fn record_failure(&self, kind: FailureKind) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.state == BreakerState::HalfOpen {
            inner.state = BreakerState::Open;
            inner.open_since = Some(Instant::now());
            inner.consecutive_failures = 0;
            inner.trial_in_flight = false;
            tracing::warn!("cloud breaker: trial failed, HALF_OPEN -> OPEN");
            return;
        }
        inner.consecutive_failures += 1;
        let trip = inner.consecutive_failures >= FAILURE_THRESHOLD || kind != FailureKind::Other;
        if trip && inner.state != BreakerState::Open {
            inner.state = BreakerState::Open;
            inner.open_since = Some(Instant::now());
            tracing::warn!(
                "cloud breaker: -> OPEN ({:?}, {} consecutive failures, cooldown {}s)",
                kind,
                inner.consecutive_failures,
                self.cooldown.as_secs()
            );
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).state
    }
}

struct TrackerInner {
    day: NaiveDate,
    used: u64,
}

/// Daily token counter; resets when the UTC calendar day changes.
pub struct TokenTracker {
    inner: StdMutex<TrackerInner>,
    budget: u64,
}

impl TokenTracker {
    pub fn new(budget: u64) -> Self {
        Self {
            inner: StdMutex::new(TrackerInner {
                day: Utc::now().date_naive(),
                used: 0,
            }),
            budget,
        }
    }

    fn roll_day(inner: &mut TrackerInner) {
        let today = Utc::now().date_naive();
        if inner.day != today {
            inner.day = today;
            inner.used = 0;
        }
    }

    pub fn add(&self, tokens: u64) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Self::roll_day(&mut inner);
        inner.used += tokens;
    }

    pub fn used(&self) -> u64 {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Self::roll_day(&mut inner);
        inner.used
    }

    pub fn remaining(&self) -> u64 {
        self.budget.saturating_sub(self.used())
    }

    pub fn check_budget(&self) -> CoreResult<()> {
        let used = self.used();
        if used >= self.budget {
            return Err(CoreError::DailyBudgetExceeded { used, budget: self.budget });
        }
        Ok(())
    }
}

pub struct CloudClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    primary_model: String,
    fallback_model: String,
    max_tokens: u32,
    pub breaker: CircuitBreaker,
    pub tokens: TokenTracker,
    last_used_model: StdMutex<String>,
}

impl CloudClient {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        http: reqwest::Client,
        base_url: &str,
        api_key: &str,
        primary_model: &str,
        fallback_model: &str,
        max_tokens: u32,
        daily_token_budget: u64,
    ) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            primary_model: primary_model.to_string(),
            fallback_model: fallback_model.to_string(),
            max_tokens,
            breaker: CircuitBreaker::new(),
            tokens: TokenTracker::new(daily_token_budget),
            last_used_model: StdMutex::new(primary_model.to_string()),
        }
    }

    pub async fn generate(&self, prompt: &str, system: Option<&str>) -> CoreResult<String> {
        if !self.breaker.allow_request() {
            return Err(CoreError::CloudBreakerOpen);
        }
        self.tokens.check_budget()?;

        match self.call_model(&self.primary_model, prompt, system).await {
            Ok((text, total_tokens)) => {
                self.tokens.add(total_tokens);
                self.breaker.record_success();
                self.set_last_model(&self.primary_model);
                Ok(text)
            }
            Err(primary_err) => {
                let kind = classify_failure(&primary_err);
                if kind == FailureKind::RateLimit {
                    tracing::warn!(
                        "cloud: primary {} rate limited, attempting fallback {}",
                        self.primary_model,
                        self.fallback_model
                    );
                    match self.call_model(&self.fallback_model, prompt, system).await {
                        Ok((text, total_tokens)) => {
                            self.tokens.add(total_tokens);
                            self.breaker.record_success();
                            self.set_last_model(&self.fallback_model);
                            return Ok(text);
                        }
                        Err(fallback_err) => {
                            tracing::error!(
                                "cloud: fallback {} also failed: {}",
                                self.fallback_model,
                                fallback_err
                            );
                            self.breaker.record_failure(kind);
                            return Err(CoreError::CloudCall(fallback_err));
                        }
                    }
                }
                self.breaker.record_failure(kind);
                Err(CoreError::CloudCall(primary_err))
            }
        }
    }

    /// One generateContent call. Errors keep the upstream status/body text so
    /// the substring classifier can see `429` / `RESOURCE_EXHAUSTED` /
    /// `SAFETY` markers.
    async fn call_model(
        &self,
        model: &str,
        prompt: &str,
        system: Option<&str>,
    ) -> Result<(String, u64), String> {
        if self.api_key.is_empty() {
            return Err("cloud api key is not configured".to_string());
        }

        let mut body = json!({
            "contents": [{ "role": "user", "parts": [{ "text": prompt }] }],
            "generationConfig": { "maxOutputTokens": self.max_tokens },
        });
        if let Some(system) = system {
            body["systemInstruction"] = json!({ "parts": [{ "text": system }] });
        }

        let url = format!(
            "{}/v1beta/models/{}:generateContent?key={}",
            self.base_url, model, self.api_key
        );
        let resp = self
            .http
            .post(&url)
            .timeout(CLOUD_CALL_TIMEOUT)
            .json(&body)
            .send()
            .await
            .map_err(|e| format!("request failed: {e}"))?;

        let status = resp.status();
        let payload: Value = resp
            .json()
            .await
            .map_err(|e| format!("response parse failed: {e}"))?;

        if !status.is_success() {
            return Err(format!("{status}: {payload}"));
        }
        if let Some(block_reason) = payload.pointer("/promptFeedback/blockReason") {
            return Err(format!("BLOCKED: {block_reason}"));
        }

        let text = payload
            .pointer("/candidates/0/content/parts/0/text")
            .and_then(|t| t.as_str())
            .ok_or_else(|| format!("no candidate text in response: {payload}"))?
            .to_string();
        let total_tokens = payload
            .pointer("/usageMetadata/totalTokenCount")
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        Ok((text, total_tokens))
    }

    fn set_last_model(&self, model: &str) {
        let mut last = self.last_used_model.lock().unwrap_or_else(|e| e.into_inner());
        *last = model.to_string();
    }

    /// Snapshot for the health report.
    pub fn status(&self) -> Value {
        let last = self
            .last_used_model
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        json!({
            "circuit_state": self.breaker.state().as_str(),
            "tokens_used_today": self.tokens.used(),
            "tokens_remaining": self.tokens.remaining(),
            "available": self.breaker.state() != BreakerState::Open
                && self.tokens.check_budget().is_ok(),
            "active_model": last,
            "primary_model": self.primary_model,
            "fallback_model": self.fallback_model,
        })
    }
}
