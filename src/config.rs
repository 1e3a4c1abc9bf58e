// Warden — runtime configuration.
//
// Everything is read from the environment once at startup. Numeric values are
// decimal strings, booleans are lowercase "true"/"false"; anything unparsable
// falls back to the default with a warning.

use std::path::PathBuf;

pub fn env_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

pub fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!("config: {} has unparsable value {:?}, using default", key, raw);
            default
        }),
        Err(_) => default,
    }
}

pub fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(raw) => raw.trim() == "true",
        Err(_) => default,
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    // Local inference
    pub local_llm_url: String,
    pub local_llm_process: String,
    pub coder_model: String,
    pub vision_model: String,
    pub embedding_model: String,

    // Cloud escalation
    pub cloud_api_url: String,
    pub cloud_api_key: String,
    pub cloud_model: String,
    pub cloud_fallback_model: String,
    pub cloud_max_tokens: u32,
    pub cloud_daily_token_budget: u64,

    // Stores
    pub redis_url: String,
    pub vector_store_url: String,

    // Filesystem roots
    pub skills_dir: PathBuf,
    pub log_dir: PathBuf,

    // Skill policy
    pub sandbox_timeout_secs: u64,
    pub strike_threshold: u32,

    // Maintenance
    pub dream_cycle_hour: u32,
    pub dream_cycle_minute: u32,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            local_llm_url: env_str("LOCAL_LLM_URL", "http://localhost:11434"),
            local_llm_process: env_str("LOCAL_LLM_PROCESS", "ollama"),
            coder_model: env_str("CODER_MODEL", "qwen2.5-coder:7b"),
            vision_model: env_str("VISION_MODEL", "qwen2.5vl:7b"),
            embedding_model: env_str("EMBEDDING_MODEL", "nomic-embed-text"),
            cloud_api_url: env_str("CLOUD_API_URL", "https://generativelanguage.googleapis.com"),
            cloud_api_key: env_str("CLOUD_API_KEY", ""),
            cloud_model: env_str("CLOUD_MODEL", "gemini-2.5-flash"),
            cloud_fallback_model: env_str("CLOUD_FALLBACK_MODEL", "gemini-3-flash"),
            cloud_max_tokens: env_parse("CLOUD_MAX_TOKENS", 8192),
            cloud_daily_token_budget: env_parse("CLOUD_MAX_TOKENS_PER_DAY", 50_000),
            redis_url: env_str("REDIS_URL", "redis://localhost:6379/0"),
            vector_store_url: env_str("VECTOR_STORE_URL", "http://localhost:8000"),
            skills_dir: PathBuf::from(env_str("WARDEN_SKILLS_DIR", "/warden/skills")),
            log_dir: PathBuf::from(env_str("WARDEN_LOG_DIR", "/warden/logs")),
            sandbox_timeout_secs: env_parse("SANDBOX_TIMEOUT", 60),
            strike_threshold: env_parse("STRIKE_THRESHOLD", 3),
            dream_cycle_hour: env_parse("DREAM_CYCLE_HOUR", 4),
            dream_cycle_minute: env_parse("DREAM_CYCLE_MINUTE", 0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_parse_falls_back_on_garbage() {
        unsafe { std::env::set_var("WARDEN_TEST_PARSE", "not-a-number") };
        assert_eq!(env_parse("WARDEN_TEST_PARSE", 7u32), 7);
        unsafe { std::env::remove_var("WARDEN_TEST_PARSE") };
    }

    #[test]
    fn env_bool_requires_lowercase_true() {
        unsafe { std::env::set_var("WARDEN_TEST_BOOL", "TRUE") };
        assert!(!env_bool("WARDEN_TEST_BOOL", false));
        unsafe { std::env::set_var("WARDEN_TEST_BOOL", "true") };
        assert!(env_bool("WARDEN_TEST_BOOL", false));
        unsafe { std::env::remove_var("WARDEN_TEST_BOOL") };
    }
}
