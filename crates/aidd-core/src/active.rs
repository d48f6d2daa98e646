//! Active-state store: `docs/.active.json`.
//!
//! Single source of truth for the feature currently being worked on. Reads
//! return empty defaults; writes merge only the provided fields and replace
//! the file atomically.

use crate::error::{AiddError, Result};
use crate::io;
use crate::paths;
use crate::stage::resolve_stage_name;
use serde::{Deserialize, Serialize};
use std::path::Path;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveState {
    #[serde(default)]
    pub ticket: String,
    #[serde(default)]
    pub slug_hint: String,
    #[serde(default)]
    pub stage: String,
    #[serde(default)]
    pub work_item_key: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub mode: String,
}

/// Partial update; `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct ActiveUpdate {
    pub ticket: Option<String>,
    pub slug_hint: Option<String>,
    pub stage: Option<String>,
    pub work_item_key: Option<String>,
    pub mode: Option<String>,
}

impl ActiveState {
    pub fn require_ticket(&self) -> Result<&str> {
        let ticket = self.ticket.trim();
        if ticket.is_empty() {
            return Err(AiddError::ActiveTicketMissing);
        }
        Ok(ticket)
    }
}

// ---------------------------------------------------------------------------
// Load / store
// ---------------------------------------------------------------------------

/// Read the active state. A missing or unreadable file yields the defaults;
/// a half-written neighbor gets one retry inside `read_json_retry`.
pub fn load_active(root: &Path) -> ActiveState {
    let path = paths::active_state_path(root);
    if !path.exists() {
        return ActiveState::default();
    }
    match io::read_json_retry(&path) {
        Ok(value) => serde_json::from_value(value).unwrap_or_default(),
        Err(_) => ActiveState::default(),
    }
}

/// Merge `update` into the stored state and write it back atomically.
/// Stage labels are normalized through the alias table before persisting.
pub fn update_active(root: &Path, update: &ActiveUpdate) -> Result<ActiveState> {
    let mut state = load_active(root);
    if let Some(ticket) = &update.ticket {
        let ticket = ticket.trim();
        paths::validate_ticket(ticket)?;
        state.ticket = ticket.to_string();
    }
    if let Some(slug_hint) = &update.slug_hint {
        state.slug_hint = slug_hint.trim().to_string();
    }
    if let Some(stage) = &update.stage {
        let raw = stage.trim();
        if raw.is_empty() {
            state.stage = String::new();
        } else {
            let resolved = resolve_stage_name(raw)
                .ok_or_else(|| AiddError::InvalidStage(raw.to_string()))?;
            state.stage = resolved.as_str().to_string();
        }
    }
    if let Some(key) = &update.work_item_key {
        state.work_item_key = key.trim().to_string();
    }
    if let Some(mode) = &update.mode {
        state.mode = mode.trim().to_string();
    }
    let path = paths::active_state_path(root);
    io::write_json(&path, &state)?;
    Ok(state)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn project_root() -> TempDir {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("docs")).unwrap();
        dir
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = project_root();
        let state = load_active(dir.path());
        assert_eq!(state, ActiveState::default());
        assert!(matches!(
            state.require_ticket(),
            Err(AiddError::ActiveTicketMissing)
        ));
    }

    #[test]
    fn update_merges_only_provided_fields() {
        let dir = project_root();
        update_active(
            dir.path(),
            &ActiveUpdate {
                ticket: Some("DEMO".into()),
                slug_hint: Some("loop-engine".into()),
                ..Default::default()
            },
        )
        .unwrap();
        let state = update_active(
            dir.path(),
            &ActiveUpdate {
                stage: Some("implement".into()),
                work_item_key: Some("iteration_id=I1".into()),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(state.ticket, "DEMO");
        assert_eq!(state.slug_hint, "loop-engine");
        assert_eq!(state.stage, "implement");
        assert_eq!(state.work_item_key, "iteration_id=I1");
    }

    #[test]
    fn stage_aliases_normalized_on_write() {
        let dir = project_root();
        let state = update_active(
            dir.path(),
            &ActiveUpdate {
                ticket: Some("DEMO".into()),
                stage: Some("tasks".into()),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(state.stage, "tasklist");
        let err = update_active(
            dir.path(),
            &ActiveUpdate {
                stage: Some("bogus".into()),
                ..Default::default()
            },
        );
        assert!(matches!(err, Err(AiddError::InvalidStage(_))));
    }

    #[test]
    fn invalid_ticket_rejected() {
        let dir = project_root();
        let err = update_active(
            dir.path(),
            &ActiveUpdate {
                ticket: Some("a/b".into()),
                ..Default::default()
            },
        );
        assert!(matches!(err, Err(AiddError::InvalidTicket(_))));
    }

    #[test]
    fn roundtrip_persists() {
        let dir = project_root();
        update_active(
            dir.path(),
            &ActiveUpdate {
                ticket: Some("DEMO".into()),
                stage: Some("review".into()),
                ..Default::default()
            },
        )
        .unwrap();
        let state = load_active(dir.path());
        assert_eq!(state.ticket, "DEMO");
        assert_eq!(state.stage, "review");
    }
}
