//! Cache keys for previously answered questions.

use std::fmt;

/// Target verbosity of an answer. Unknown or missing levels fall back to
/// [`ExplainLevel::Intermediate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExplainLevel {
    Beginner,
    #[default]
    Intermediate,
    Expert,
}

impl ExplainLevel {
    pub fn parse(level: Option<&str>) -> Self {
        match level.map(|l| l.trim().to_lowercase()).as_deref() {
            Some("beginner") => ExplainLevel::Beginner,
            Some("expert") => ExplainLevel::Expert,
            _ => ExplainLevel::Intermediate,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExplainLevel::Beginner => "beginner",
            ExplainLevel::Intermediate => "intermediate",
            ExplainLevel::Expert => "expert",
        }
    }

    /// Style instruction appended to the answering prompt.
    pub fn guidance(&self) -> &'static str {
        match self {
            ExplainLevel::Beginner => {
                "Explain for a newcomer to this codebase: define terms and walk through the flow step by step."
            }
            ExplainLevel::Intermediate => {
                "Explain for a developer familiar with the language: be concise and name the relevant files and functions."
            }
            ExplainLevel::Expert => {
                "Answer tersely for an expert: focus on specifics, edge cases and trade-offs."
            }
        }
    }
}

impl fmt::Display for ExplainLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `lvl=<level>|<question>` with the question trimmed, lower-cased and its
/// whitespace runs collapsed to single spaces.
pub fn normalize(question: &str, level: Option<&str>) -> String {
    let question = question
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    format!("lvl={}|{}", ExplainLevel::parse(level), question)
}
