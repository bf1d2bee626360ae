use std::fmt;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Token counts for one event or an accumulated window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_creation_tokens: u64,
}

impl TokenUsage {
    /// Tokens that count against block and quota limits.
    pub fn counted_tokens(&self) -> u64 {
        self.input_tokens.saturating_add(self.output_tokens)
    }

    pub fn all_tokens(&self) -> u64 {
        self.input_tokens
            .saturating_add(self.output_tokens)
            .saturating_add(self.cache_read_tokens)
            .saturating_add(self.cache_creation_tokens)
    }

    pub fn is_empty(&self) -> bool {
        self.all_tokens() == 0
    }

    pub fn saturating_add(self, other: TokenUsage) -> TokenUsage {
        TokenUsage {
            input_tokens: self.input_tokens.saturating_add(other.input_tokens),
            output_tokens: self.output_tokens.saturating_add(other.output_tokens),
            cache_read_tokens: self.cache_read_tokens.saturating_add(other.cache_read_tokens),
            cache_creation_tokens: self
                .cache_creation_tokens
                .saturating_add(other.cache_creation_tokens),
        }
    }

    pub fn saturating_sub(self, other: TokenUsage) -> TokenUsage {
        TokenUsage {
            input_tokens: self.input_tokens.saturating_sub(other.input_tokens),
            output_tokens: self.output_tokens.saturating_sub(other.output_tokens),
            cache_read_tokens: self.cache_read_tokens.saturating_sub(other.cache_read_tokens),
            cache_creation_tokens: self
                .cache_creation_tokens
                .saturating_sub(other.cache_creation_tokens),
        }
    }

    /// Cache reads as a share of the prompt tokens that had to be processed.
    ///
    /// Raw ratio; may exceed 100 when reads dominate. Zero when nothing was processed.
    pub fn cache_efficiency_percent(&self) -> f64 {
        let denominator = self
            .input_tokens
            .saturating_add(self.cache_creation_tokens);
        if denominator == 0 {
            return 0.0;
        }
        (self.cache_read_tokens as f64 / denominator as f64) * 100.0
    }
}

/// Log dialect of a usage source, chosen from source metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceFormat {
    ClaudeJsonl,
    CodexJsonl,
}

impl SourceFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ClaudeJsonl => "claude_jsonl",
            Self::CodexJsonl => "codex_jsonl",
        }
    }
}

impl fmt::Display for SourceFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Format-specific identity carried by a parsed event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "format", rename_all = "snake_case")]
pub enum EventOrigin {
    Claude {
        message_id: Option<String>,
        request_id: Option<String>,
    },
    Codex {
        turn_id: Option<String>,
    },
}

impl EventOrigin {
    pub fn format(&self) -> SourceFormat {
        match self {
            Self::Claude { .. } => SourceFormat::ClaudeJsonl,
            Self::Codex { .. } => SourceFormat::CodexJsonl,
        }
    }
}

/// One quantum of consumption parsed from a source line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageEvent {
    pub id: String,
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    pub model: String,
    pub usage: TokenUsage,
    pub source: String,
    pub origin: EventOrigin,
}

/// Opaque read position in one source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceCursor {
    pub offset: u64,
    pub file_id: Option<u64>,
    /// Model hint seen before `offset`, for formats that announce the model once per session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_model: Option<String>,
    /// Latest cumulative session total seen before `offset`, for formats that report running totals.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_total: Option<TokenUsage>,
}

pub fn model_matches_pattern(model: &str, pattern: &str) -> bool {
    let model = model.to_ascii_lowercase();
    let pattern = pattern.to_ascii_lowercase();
    if pattern == "*" {
        return true;
    }
    if !pattern.contains('*') {
        return model == pattern;
    }
    let mut remainder = model.as_str();
    let mut first = true;
    for part in pattern.split('*') {
        if part.is_empty() {
            first = false;
            continue;
        }
        match remainder.find(part) {
            Some(index) if !(first && index != 0) => {
                remainder = &remainder[index + part.len()..];
                first = false;
            }
            _ => return false,
        }
    }
    pattern.ends_with('*') || remainder.is_empty()
}

pub fn session_id_from_source(source: &str) -> String {
    let stem = Path::new(source)
        .file_stem()
        .and_then(|value| value.to_str())
        .unwrap_or_default();
    if let Some(rest) = stem.strip_prefix("rollout-")
        && let Some(split_at) = rest.rfind('-')
    {
        let session_id = &rest[split_at + 1..];
        if !session_id.is_empty() {
            return session_id.to_string();
        }
    }
    if !stem.is_empty() {
        return stem.to_string();
    }
    source.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_efficiency_is_zero_without_prompt_tokens() {
        let usage = TokenUsage::default();
        let value = usage.cache_efficiency_percent();
        assert_eq!(value, 0.0);
        assert!(!value.is_nan());
    }

    #[test]
    fn cache_efficiency_uses_input_and_creation() {
        let usage = TokenUsage {
            input_tokens: 100,
            output_tokens: 999,
            cache_read_tokens: 300,
            cache_creation_tokens: 200,
        };
        assert!((usage.cache_efficiency_percent() - 100.0).abs() < 1e-9);
    }

    #[test]
    fn counted_tokens_exclude_cache() {
        let usage = TokenUsage {
            input_tokens: 150_000,
            output_tokens: 30_000,
            cache_read_tokens: 1_000_000,
            cache_creation_tokens: 5_000,
        };
        assert_eq!(usage.counted_tokens(), 180_000);
        assert_eq!(usage.all_tokens(), 1_185_000);
    }

    #[test]
    fn model_pattern_matching() {
        assert!(model_matches_pattern("claude-opus-4-1", "claude-opus-*"));
        assert!(model_matches_pattern("Claude-Opus-4", "*opus*"));
        assert!(!model_matches_pattern("claude-sonnet-4", "claude-opus-*"));
        assert!(model_matches_pattern("gpt-5", "gpt-5"));
        assert!(!model_matches_pattern("gpt-5-codex", "gpt-5"));
        assert!(model_matches_pattern("anything", "*"));
    }

    #[test]
    fn session_id_from_source_parses_rollout_name() {
        let source = "/tmp/rollout-2025-12-20T00-00-00Z-abc123.jsonl";
        assert_eq!(session_id_from_source(source), "abc123");
    }

    #[test]
    fn session_id_from_source_uses_file_stem() {
        let source = "/home/u/.claude/projects/app/5f1c2d.jsonl";
        assert_eq!(session_id_from_source(source), "5f1c2d");
    }

    #[test]
    fn origin_serializes_with_format_tag() {
        let origin = EventOrigin::Codex { turn_id: None };
        let json = serde_json::to_string(&origin).expect("serialize");
        assert!(json.contains("\"format\":\"codex\""));
        assert_eq!(origin.format(), SourceFormat::CodexJsonl);
    }
}
