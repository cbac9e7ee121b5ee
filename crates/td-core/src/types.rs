use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// ProviderKind
// ---------------------------------------------------------------------------

/// The vendor API family a backend is reached through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Anthropic,
    OpenAi,
    Google,
    /// OpenAI-compatible local inference server.
    Local,
    /// Scripted in-process provider used by tests.
    Mock,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Anthropic => "anthropic",
            Self::OpenAi => "open_ai",
            Self::Google => "google",
            Self::Local => "local",
            Self::Mock => "mock",
        }
    }

    /// Average characters per token for this vendor's tokenizer family.
    pub fn chars_per_token(&self) -> f64 {
        match self {
            Self::Anthropic => 3.5,
            _ => 4.0,
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// SpeedClass
// ---------------------------------------------------------------------------

/// Qualitative latency tier. Ordered fastest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpeedClass {
    Fast,
    Medium,
    Slow,
}

impl SpeedClass {
    /// Fixed overhead before the first output token, in milliseconds.
    pub fn base_latency_ms(&self) -> u64 {
        match self {
            Self::Fast => 500,
            Self::Medium => 800,
            Self::Slow => 1500,
        }
    }

    /// Approximate generation cost per output token, in milliseconds.
    pub fn ms_per_output_token(&self) -> u64 {
        match self {
            Self::Fast => 10,
            Self::Medium => 20,
            Self::Slow => 40,
        }
    }
}

// ---------------------------------------------------------------------------
// TaskCategory
// ---------------------------------------------------------------------------

/// Coarse task category used for routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskCategory {
    Technical,
    Strategic,
    Analytical,
    Creative,
    Classification,
    Summarization,
    Extraction,
    Mixed,
}

impl TaskCategory {
    pub const ALL: [TaskCategory; 8] = [
        Self::Technical,
        Self::Strategic,
        Self::Analytical,
        Self::Creative,
        Self::Classification,
        Self::Summarization,
        Self::Extraction,
        Self::Mixed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Technical => "technical",
            Self::Strategic => "strategic",
            Self::Analytical => "analytical",
            Self::Creative => "creative",
            Self::Classification => "classification",
            Self::Summarization => "summarization",
            Self::Extraction => "extraction",
            Self::Mixed => "mixed",
        }
    }
}

impl fmt::Display for TaskCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim().to_ascii_lowercase();
        Self::ALL
            .iter()
            .find(|c| c.as_str() == needle)
            .copied()
            .ok_or_else(|| format!("unknown task category '{s}'"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_category_parse_roundtrip() {
        for category in TaskCategory::ALL {
            let parsed: TaskCategory = category.as_str().parse().unwrap();
            assert_eq!(parsed, category);
        }
        assert!("poetry".parse::<TaskCategory>().is_err());
        assert_eq!(" Technical ".parse::<TaskCategory>().unwrap(), TaskCategory::Technical);
    }

    #[test]
    fn speed_class_orders_fastest_first() {
        assert!(SpeedClass::Fast < SpeedClass::Medium);
        assert!(SpeedClass::Medium < SpeedClass::Slow);
    }

    #[test]
    fn provider_kind_serializes_snake_case() {
        assert_eq!(serde_json::to_string(&ProviderKind::OpenAi).unwrap(), "\"open_ai\"");
        assert_eq!(ProviderKind::Google.to_string(), "google");
    }
}
