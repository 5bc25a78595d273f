//! crates/cv_pipeline_core/src/config.rs
//!
//! Tunable policy for the pipeline. The character thresholds and retry counts
//! are hand-tuned values, so every one of them lives here with a default
//! instead of being hardcoded at the call site.

use std::time::Duration;

/// Quality bars and language hints for the OCR fallback chain.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectorConfig {
    /// Below this many characters the generic text-detection step runs,
    /// and so does the inline-bytes resubmission. Default: 50.
    pub weak_text_chars: usize,
    /// Below this many characters the combined multi-feature request runs. Default: 100.
    pub combined_retry_chars: usize,
    pub language_hints: Vec<String>,
    /// Broader hints for the generic text-detection step.
    pub fallback_language_hints: Vec<String>,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            weak_text_chars: 50,
            combined_retry_chars: 100,
            language_hints: vec!["es".to_string(), "en".to_string()],
            fallback_language_hints: ["es", "en", "pt", "fr", "it", "de"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

/// How the delay between page re-extraction attempts grows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Fixed,
    Linear,
    Exponential,
}

/// Page-level retry applied by the orchestrator when a page comes back weak.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts per page, including the first. Default: 3.
    pub max_attempts: u32,
    pub backoff: Backoff,
    pub base_delay: Duration,
    /// A page result with at least this many characters is accepted
    /// without further attempts. Default: 50.
    pub accept_chars: usize,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::Linear,
            base_delay: Duration::from_secs(1),
            accept_chars: 50,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn single_attempt() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Delay to wait before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let retry = retry.max(1);
        match self.backoff {
            Backoff::Fixed => self.base_delay,
            Backoff::Linear => self.base_delay.saturating_mul(retry),
            Backoff::Exponential => self
                .base_delay
                .saturating_mul(2u32.saturating_pow(retry - 1)),
        }
    }

    pub fn accepts(&self, text: &str) -> bool {
        text.chars().count() >= self.accept_chars
    }
}

/// Language-model call settings for the analysis stage.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisConfig {
    /// Upper bound on the reply; it must hold a whole multi-page CV record. Default: 4096.
    pub max_tokens: u32,
    /// Kept at zero so identical text yields the same structure. Default: 0.0.
    pub temperature: f32,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            max_tokens: 4096,
            temperature: 0.0,
        }
    }
}

/// Everything the orchestrator needs besides its collaborators.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PipelineConfig {
    pub selector: SelectorConfig,
    pub retry: RetryPolicy,
    pub analysis: AnalysisConfig,
    pub thresholds: TextThresholds,
    /// Wall-clock budget for one run. `None` disables the limit.
    pub run_timeout: Option<Duration>,
}

/// Minimum trimmed length of the aggregated text before analysis may run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextThresholds {
    pub min_text_chars: usize,
}

impl Default for TextThresholds {
    fn default() -> Self {
        Self { min_text_chars: 50 }
    }
}

/// Bounded status polling: a fixed interval and a maximum number of reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            max_attempts: 30,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_delays_grow_as_configured() {
        let mut policy = RetryPolicy {
            base_delay: Duration::from_millis(500),
            ..Default::default()
        };

        policy.backoff = Backoff::Fixed;
        assert_eq!(policy.delay_for(3), Duration::from_millis(500));

        policy.backoff = Backoff::Linear;
        assert_eq!(policy.delay_for(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for(3), Duration::from_millis(1500));

        policy.backoff = Backoff::Exponential;
        assert_eq!(policy.delay_for(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for(3), Duration::from_millis(2000));
    }

    #[test]
    fn acceptance_counts_characters_not_bytes() {
        let policy = RetryPolicy {
            accept_chars: 4,
            ..Default::default()
        };
        assert!(policy.accepts("ñañá"));
        assert!(!policy.accepts("ñañ"));
    }
}
