// Warden — prompt-injection firewall.
// Four layers, evaluated in order:
//   L4 length cap (10,000 chars, short-circuits)
//   L1 pattern table (severity-tagged regexes)
//   L2 base64 decode + L1 re-scan (detections prefixed BASE64_)
//   L3 non-alphanumeric character ratio (>30%)
// A CRITICAL verdict drives the lockdown protocol; HIGH or worse blocks the
// message. Detections are audited as rule names + input length only.

use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use regex::Regex;

use crate::audit::{AuditLog, Severity};

const PROMPT_MAX_CHARS: usize = 10_000;
const NON_ALPHANUM_RATIO_THRESHOLD: f64 = 0.30;

/// Ordered so `max` picks the worst layer result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ThreatLevel {
    None,
    Low,
    Medium,
    High,
    Critical,
}

impl ThreatLevel {
    fn audit_severity(self) -> Severity {
        match self {
            ThreatLevel::Critical => Severity::Critical,
            ThreatLevel::High => Severity::High,
            ThreatLevel::Medium => Severity::Warning,
            _ => Severity::Info,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FirewallVerdict {
    pub allowed: bool,
    pub threat_level: ThreatLevel,
    pub detections: Vec<String>,
}

pub struct Firewall {
    audit: Arc<AuditLog>,
    patterns: Vec<(&'static str, Regex, ThreatLevel)>,
    base64_run: Regex,
}

impl Firewall {
    pub fn new(audit: Arc<AuditLog>) -> Self {
        let table: &[(&str, &str, ThreatLevel)] = &[
            // Direct override attempts
            (
                "SYSTEM_OVERRIDE",
                r"(?i)ignore\s+(all\s+)?(previous|prior|above)\s+(instructions?|prompts?|rules?)",
                ThreatLevel::Critical,
            ),
            (
                "JAILBREAK_DAN",
                r"(?i)\bDAN\b.*\b(do|does|doing)\s+anything\s+now",
                ThreatLevel::Critical,
            ),
            (
                "ROLE_OVERRIDE",
                r"(?i)(you\s+are\s+now|act\s+as|pretend\s+(to\s+be|you\s+are))\s+(an?\s+)?ai\s+(without|with\s+no)\s+(restrictions?|limits?|filters?)",
                ThreatLevel::Critical,
            ),
            (
                "PROMPT_LEAK",
                r"(?i)(repeat|output|print|show|display)\s+(your\s+)?(system\s+prompt|initial\s+instructions?)",
                ThreatLevel::High,
            ),
            // Manipulation via role tags / template delimiters
            (
                "ROLE_TAG_INJECTION",
                r"(?i)<\s*(system|user|assistant)\s*>",
                ThreatLevel::High,
            ),
            (
                "DELIMITER_INJECTION",
                r"(?i)(\[INST\]|\[/INST\]|<\|im_start\|>|<\|im_end\|>|###\s*System:)",
                ThreatLevel::High,
            ),
            // Zero-width and bidi characters used to hide payloads
            (
                "UNICODE_OBFUSCATION",
                r"[\u{200b}-\u{200f}\u{202a}-\u{202e}\u{2060}-\u{2064}\u{feff}]",
                ThreatLevel::Medium,
            ),
        ];

        let patterns = table
            .iter()
            .map(|(name, pattern, level)| {
                let re = Regex::new(pattern).unwrap_or_else(|e| {
                    panic!("firewall: pattern {name} failed to compile: {e}")
                });
                (*name, re, *level)
            })
            .collect();

        Self {
            audit,
            patterns,
            base64_run: Regex::new(r"[A-Za-z0-9+/]{20,}={0,2}")
                .unwrap_or_else(|e| panic!("firewall: base64 pattern failed to compile: {e}")),
        }
    }

    /// Run all layers against the candidate text.
    pub fn scan(&self, text: &str) -> FirewallVerdict {
        let char_count = text.chars().count();

        // L4: length cap — no further layers.
        if char_count > PROMPT_MAX_CHARS {
            let detections = vec![format!("LENGTH_EXCEEDED:{char_count}")];
            self.audit
                .log_injection_attempt(&detections, char_count, Severity::High);
            return FirewallVerdict {
                allowed: false,
                threat_level: ThreatLevel::High,
                detections,
            };
        }

        let mut detections: Vec<String> = Vec::new();
        let mut max_threat = ThreatLevel::None;

        // L1: pattern table.
        for (name, re, level) in &self.patterns {
            if re.is_match(text) {
                detections.push((*name).to_string());
                max_threat = max_threat.max(*level);
            }
        }

        // L2: decode base64-looking runs and re-scan.
        for run in self.base64_run.find_iter(text) {
            let Ok(bytes) = BASE64.decode(run.as_str()) else { continue };
            let decoded = String::from_utf8_lossy(&bytes);
            if decoded.trim().is_empty() {
                continue;
            }
            for (name, re, level) in &self.patterns {
                if re.is_match(&decoded) {
                    detections.push(format!("BASE64_{name}"));
                    max_threat = max_threat.max(*level);
                }
            }
        }

        // L3: character ratio.
        let ratio = non_alphanum_ratio(text);
        if ratio > NON_ALPHANUM_RATIO_THRESHOLD {
            detections.push(format!("HIGH_NON_ALPHANUM:{ratio:.2}"));
            max_threat = max_threat.max(ThreatLevel::Medium);
        }

        if !detections.is_empty() {
            self.audit
                .log_injection_attempt(&detections, char_count, max_threat.audit_severity());
        }

        FirewallVerdict {
            allowed: max_threat < ThreatLevel::High,
            threat_level: max_threat,
            detections,
        }
    }
}

fn non_alphanum_ratio(text: &str) -> f64 {
    let total = text.chars().count();
    if total == 0 {
        return 0.0;
    }
    let non_alphanum = text
        .chars()
        .filter(|c| !c.is_alphanumeric() && !c.is_whitespace())
        .count();
    non_alphanum as f64 / total as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn firewall(dir: &std::path::Path) -> Firewall {
        Firewall::new(Arc::new(AuditLog::new(dir)))
    }

    #[test]
    fn clean_text_passes() {
        let tmp = tempfile::tempdir().unwrap();
        let verdict = firewall(tmp.path()).scan("what is the weather like today");
        assert!(verdict.allowed);
        assert_eq!(verdict.threat_level, ThreatLevel::None);
        assert!(verdict.detections.is_empty());
    }

    #[test]
    fn ratio_alone_is_medium_and_allowed() {
        let tmp = tempfile::tempdir().unwrap();
        let verdict = firewall(tmp.path()).scan("$$$ %%% ^^^ &&& *** ((( )))");
        assert!(verdict.allowed);
        assert_eq!(verdict.threat_level, ThreatLevel::Medium);
        assert!(verdict.detections.iter().any(|d| d.starts_with("HIGH_NON_ALPHANUM")));
    }
}
