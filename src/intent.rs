//! Query intent detection.
//!
//! The only intent that changes retrieval is [`Intent::HowTo`]: an
//! instructional query ("how do I set up the repo?") widens the dense pool,
//! boosts code and list chunks, and changes the fallback ordering.

use regex::Regex;

use crate::error::{KbError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    HowTo,
    General,
}

impl Intent {
    pub fn is_howto(&self) -> bool {
        matches!(self, Intent::HowTo)
    }
}

/// Marker words and phrases, matched anywhere in the query, so
/// "installation" and "running" count too.
const HOWTO_MARKERS: &[&str] = &[
    "how to",
    "howto",
    "how do",
    "how can",
    "how should",
    "initialize",
    "init",
    "setup",
    "set up",
    "install",
    "configure",
    "create",
    "build",
    "compile",
    "sync",
    "run",
    "execute",
    "start",
    "begin",
    "get started",
    "tutorial",
    "guide",
    "steps",
    "procedure",
    "process",
    "command",
    "example",
    "demo",
];

const HOWTO_PATTERNS_RU: &[&str] = &[
    r"как\s+(сделать|создать|настроить|установить|запустить|начать)",
    r"инструкция",
    r"руководство",
    r"шаги",
    r"настроить",
    r"установить",
];

pub struct IntentDetector {
    markers: Regex,
    patterns: Vec<Regex>,
}

impl IntentDetector {
    pub fn new() -> Result<Self> {
        let alternation = HOWTO_MARKERS
            .iter()
            .map(|m| regex::escape(m).replace(' ', r"\s+"))
            .collect::<Vec<_>>()
            .join("|");
        let markers = Regex::new(&format!(r"(?i)(?:{})", alternation))
            .map_err(|e| KbError::Config(format!("intent markers: {}", e)))?;

        let patterns = HOWTO_PATTERNS_RU
            .iter()
            .map(|p| {
                Regex::new(&format!("(?i){}", p))
                    .map_err(|e| KbError::Config(format!("intent pattern '{}': {}", p, e)))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { markers, patterns })
    }

    pub fn detect(&self, query: &str) -> Intent {
        if self.markers.is_match(query) || self.patterns.iter().any(|p| p.is_match(query)) {
            Intent::HowTo
        } else {
            Intent::General
        }
    }
}
