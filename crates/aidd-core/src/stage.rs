use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// Stage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    Idea,
    Research,
    Plan,
    ReviewSpec,
    SpecInterview,
    Tasklist,
    Implement,
    Review,
    Qa,
    Status,
    Preflight,
}

impl Stage {
    pub fn all() -> &'static [Stage] {
        &[
            Stage::Idea,
            Stage::Research,
            Stage::Plan,
            Stage::ReviewSpec,
            Stage::SpecInterview,
            Stage::Tasklist,
            Stage::Implement,
            Stage::Review,
            Stage::Qa,
            Stage::Status,
            Stage::Preflight,
        ]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Idea => "idea",
            Stage::Research => "research",
            Stage::Plan => "plan",
            Stage::ReviewSpec => "review-spec",
            Stage::SpecInterview => "spec-interview",
            Stage::Tasklist => "tasklist",
            Stage::Implement => "implement",
            Stage::Review => "review",
            Stage::Qa => "qa",
            Stage::Status => "status",
            Stage::Preflight => "preflight",
        }
    }

    /// Loop stages require an `iteration_id=` work item key.
    pub fn is_loop_stage(self) -> bool {
        matches!(self, Stage::Implement | Stage::Review)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalize a raw stage label, accepting legacy aliases.
pub fn resolve_stage_name(raw: &str) -> Option<Stage> {
    let value = raw.trim().to_ascii_lowercase();
    let canonical = match value.as_str() {
        "spec" => "spec-interview",
        "review_spec" => "review-spec",
        "tasks" => "tasklist",
        other => other,
    };
    Stage::all().iter().copied().find(|s| s.as_str() == canonical)
}

impl std::str::FromStr for Stage {
    type Err = crate::error::AiddError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        resolve_stage_name(s).ok_or_else(|| crate::error::AiddError::InvalidStage(s.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_roundtrip() {
        for stage in Stage::all() {
            assert_eq!(resolve_stage_name(stage.as_str()), Some(*stage));
        }
    }

    #[test]
    fn stage_aliases() {
        assert_eq!(resolve_stage_name("spec"), Some(Stage::SpecInterview));
        assert_eq!(resolve_stage_name("review_spec"), Some(Stage::ReviewSpec));
        assert_eq!(resolve_stage_name("tasks"), Some(Stage::Tasklist));
        assert_eq!(resolve_stage_name(" Implement "), Some(Stage::Implement));
        assert_eq!(resolve_stage_name("bogus"), None);
    }

    #[test]
    fn loop_stages() {
        assert!(Stage::Implement.is_loop_stage());
        assert!(Stage::Review.is_loop_stage());
        assert!(!Stage::Qa.is_loop_stage());
        assert!(!Stage::Research.is_loop_stage());
    }
}
