// Warden — short-lived confirmation codes.
// 4-digit decimal values gate skill promotion. Codes expire after 5 minutes
// on the monotonic clock and are consumed by the first successful verify.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use rand::Rng;
use rand::rngs::OsRng;
use subtle::ConstantTimeEq;
use tokio::sync::Mutex;

const CODE_TTL: Duration = Duration::from_secs(300);

pub struct PendingCodes {
    ttl: Duration,
    pending: Mutex<HashMap<String, (String, Instant)>>,
}

impl Default for PendingCodes {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingCodes {
    pub fn new() -> Self {
        Self { ttl: CODE_TTL, pending: Mutex::new(HashMap::new()) }
    }

    /// Test-only constructor with a shortened TTL.
    #[doc(hidden)]
    pub fn with_ttl(ttl: Duration) -> Self {
        Self { ttl, pending: Mutex::new(HashMap::new()) }
    }

    /// Mint a code for the given skill, replacing any previous one.
    pub async fn issue(&self, skill_id: &str) -> String {
        let code = format!("{:04}", OsRng.gen_range(0..10_000u32));
        let expires_at = Instant::now() + self.ttl;
        self.pending
            .lock()
            .await
            .insert(skill_id.to_string(), (code.clone(), expires_at));
        tracing::info!(
            "codes: issued for skill {} (expires in {}s)",
            skill_id,
            self.ttl.as_secs()
        );
        code
    }

    /// Constant-time verification. A mismatch leaves the stored code valid;
    /// expiry and success both evict it.
    pub async fn verify(&self, skill_id: &str, submitted: &str) -> bool {
        let mut pending = self.pending.lock().await;
        let Some((stored, expires_at)) = pending.get(skill_id) else {
            tracing::warn!("codes: no pending code for skill {}", skill_id);
            return false;
        };

        if Instant::now() > *expires_at {
            pending.remove(skill_id);
            tracing::warn!("codes: expired for skill {}", skill_id);
            return false;
        }

        let matched: bool = stored
            .as_bytes()
            .ct_eq(submitted.trim().as_bytes())
            .into();
        if matched {
            pending.remove(skill_id);
            tracing::info!("codes: verified for skill {}", skill_id);
        } else {
            tracing::warn!("codes: wrong code for skill {}", skill_id);
        }
        matched
    }

    pub async fn invalidate(&self, skill_id: &str) {
        self.pending.lock().await.remove(skill_id);
    }

    /// Drop expired entries; returns how many were evicted.
    pub async fn purge_expired(&self) -> usize {
        let mut pending = self.pending.lock().await;
        let now = Instant::now();
        let before = pending.len();
        pending.retain(|_, (_, expires_at)| now <= *expires_at);
        before - pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn issued_code_is_four_decimal_digits() {
        let codes = PendingCodes::new();
        let code = codes.issue("s1").await;
        assert_eq!(code.len(), 4);
        assert!(code.chars().all(|c| c.is_ascii_digit()));
    }

    #[tokio::test]
    async fn verify_consumes_on_success_only() {
        let codes = PendingCodes::new();
        let code = codes.issue("s1").await;
        assert!(!codes.verify("s1", "this-is-wrong").await);
        assert!(codes.verify("s1", &code).await);
        assert!(!codes.verify("s1", &code).await);
    }
}
