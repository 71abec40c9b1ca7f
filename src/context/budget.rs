//! Context budget parsing and the character-based size estimate.

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// How large an assembled context may be.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ContextBudget {
    /// Percentage of the downstream model window (e.g. 40%)
    Percentage(f64),
    /// Absolute character count
    Absolute(usize),
}

impl ContextBudget {
    /// The budget in characters for a model window of `model_window_chars`.
    pub fn effective_chars(&self, model_window_chars: usize) -> usize {
        match self {
            ContextBudget::Percentage(pct) => {
                ((model_window_chars as f64) * pct / 100.0).floor() as usize
            }
            ContextBudget::Absolute(chars) => *chars,
        }
    }

    pub fn is_percentage(&self) -> bool {
        matches!(self, ContextBudget::Percentage(_))
    }

    /// Parse `"40%"` or `"9000"`.
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();

        if s.is_empty() {
            anyhow::bail!("Context budget cannot be empty");
        }

        if let Some(num_str) = s.strip_suffix('%') {
            let pct: f64 = num_str
                .trim()
                .parse()
                .with_context(|| format!("Invalid percentage in context budget: {}", s))?;

            if pct <= 0.0 || pct > 100.0 {
                anyhow::bail!(
                    "Context budget percentage must be between 0 and 100, got {}",
                    pct
                );
            }
            Ok(ContextBudget::Percentage(pct))
        } else {
            let chars: usize = s
                .parse()
                .with_context(|| format!("Invalid absolute context budget: {}", s))?;

            if chars == 0 {
                anyhow::bail!("Context budget cannot be zero");
            }
            Ok(ContextBudget::Absolute(chars))
        }
    }
}

impl Default for ContextBudget {
    fn default() -> Self {
        ContextBudget::Percentage(40.0)
    }
}

impl std::fmt::Display for ContextBudget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContextBudget::Percentage(pct) => write!(f, "{}%", pct),
            ContextBudget::Absolute(chars) => write!(f, "{}", chars),
        }
    }
}

impl std::str::FromStr for ContextBudget {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for ContextBudget {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ContextBudget {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// Upper-bound token estimate: one token per four characters, rounded up.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}
