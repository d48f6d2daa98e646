//! Workspace and artifact path resolution.
//!
//! The workspace root is the first ancestor containing `.git/` or `.claude/`.
//! The project root is `<workspace>/aidd/`; everything the engine owns lives
//! under it. Relative paths rendered for artifacts are POSIX-style and carry
//! the `aidd/` prefix when rooted at the project root.

use crate::error::{AiddError, Result};
use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// Directory constants
// ---------------------------------------------------------------------------

pub const PROJECT_SUBDIR: &str = "aidd";

pub const ACTIVE_FILE: &str = "docs/.active.json";
pub const GATES_FILE: &str = "config/gates.json";

pub const REPORTS_DIR: &str = "reports";
pub const ALWAYS_ALLOW_REPORTS: [&str; 2] = ["aidd/reports/**", "aidd/reports/actions/**"];

// ---------------------------------------------------------------------------
// Root discovery
// ---------------------------------------------------------------------------

/// Walk upward from `start` to the first directory containing `.git/` or
/// `.claude/`. Falls back to `start` itself.
pub fn workspace_root(start: &Path) -> PathBuf {
    let mut dir = start.to_path_buf();
    loop {
        if dir.join(".git").is_dir() || dir.join(".claude").is_dir() {
            return dir;
        }
        match dir.parent() {
            Some(p) => dir = p.to_path_buf(),
            None => break,
        }
    }
    start.to_path_buf()
}

/// Resolve `(workspace_root, project_root)` where the project root is
/// `<workspace>/aidd/`. Errors when the workflow was never initialized.
pub fn require_workflow_root(start: &Path) -> Result<(PathBuf, PathBuf)> {
    let ws = workspace_root(start);
    let project = ws.join(PROJECT_SUBDIR);
    if !project.join("docs").exists() {
        return Err(AiddError::NotInitialized);
    }
    Ok((ws, project))
}

/// Plugin install root from the `CLAUDE_PLUGIN_ROOT` sentinel variable.
/// Absence is a hard error (`plugin_root_missing`).
pub fn require_plugin_root() -> Result<PathBuf> {
    match std::env::var("CLAUDE_PLUGIN_ROOT") {
        Ok(raw) if !raw.trim().is_empty() => Ok(PathBuf::from(raw.trim())),
        _ => Err(AiddError::PluginRootMissing),
    }
}

// ---------------------------------------------------------------------------
// Path normalization
// ---------------------------------------------------------------------------

/// Resolve a possibly-relative artifact path against the project root.
/// A leading `./` is stripped; a leading `aidd/` is stripped when the target
/// itself is the `aidd/` directory, so both spellings address the same file.
pub fn resolve_path_for_target(path: &Path, target: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    let mut parts: Vec<&std::ffi::OsStr> = path.iter().collect();
    if parts.first().map(|p| *p == ".").unwrap_or(false) {
        parts.remove(0);
    }
    if parts.first().map(|p| *p == PROJECT_SUBDIR).unwrap_or(false)
        && target.file_name().map(|n| n == PROJECT_SUBDIR).unwrap_or(false)
    {
        parts.remove(0);
    }
    let mut out = target.to_path_buf();
    for part in parts {
        out.push(part);
    }
    out
}

/// POSIX-style path relative to `root`, prefixed with `aidd/` when `root`
/// is the project root. Paths outside `root` are rendered as-is.
pub fn rel_path(path: &Path, root: &Path) -> String {
    let rel = match path.strip_prefix(root) {
        Ok(rel) => rel,
        Err(_) => return to_posix(path),
    };
    let rendered = to_posix(rel);
    if root.file_name().map(|n| n == PROJECT_SUBDIR).unwrap_or(false) {
        format!("{PROJECT_SUBDIR}/{rendered}")
    } else {
        rendered
    }
}

fn to_posix(path: &Path) -> String {
    use std::path::Component;
    let mut rendered = String::new();
    for component in path.components() {
        match component {
            Component::RootDir => {
                if rendered.is_empty() {
                    rendered.push('/');
                }
            }
            other => {
                if !rendered.is_empty() && !rendered.ends_with('/') {
                    rendered.push('/');
                }
                rendered.push_str(&other.as_os_str().to_string_lossy());
            }
        }
    }
    rendered
}

pub fn is_relative_to(path: &Path, ancestor: &Path) -> bool {
    path.strip_prefix(ancestor).is_ok()
}

// ---------------------------------------------------------------------------
// Canonical artifact slots
// ---------------------------------------------------------------------------

pub fn active_state_path(root: &Path) -> PathBuf {
    root.join(ACTIVE_FILE)
}

pub fn gates_config_path(root: &Path) -> PathBuf {
    root.join(GATES_FILE)
}

pub fn events_path(root: &Path, ticket: &str) -> PathBuf {
    root.join("reports/events").join(format!("{ticket}.jsonl"))
}

pub fn context_quality_path(root: &Path, ticket: &str) -> PathBuf {
    root.join("reports/observability")
        .join(format!("{ticket}.context-quality.json"))
}

pub fn loops_scope_dir(root: &Path, ticket: &str, scope_key: &str) -> PathBuf {
    root.join("reports/loops").join(ticket).join(scope_key)
}

pub fn stage_result_path(root: &Path, ticket: &str, scope_key: &str, stage: &str) -> PathBuf {
    loops_scope_dir(root, ticket, scope_key).join(format!("stage.{stage}.result.json"))
}

pub fn output_contract_path(root: &Path, ticket: &str, scope_key: &str) -> PathBuf {
    loops_scope_dir(root, ticket, scope_key).join("output.contract.json")
}

pub fn loop_pack_path(root: &Path, ticket: &str, scope_key: &str) -> PathBuf {
    root.join("reports/loops")
        .join(ticket)
        .join(format!("{scope_key}.loop.pack.md"))
}

pub fn review_pack_path(root: &Path, ticket: &str, scope_key: &str) -> PathBuf {
    loops_scope_dir(root, ticket, scope_key).join("review.latest.pack.md")
}

pub fn scope_lock_path(root: &Path, ticket: &str, scope_key: &str) -> PathBuf {
    loops_scope_dir(root, ticket, scope_key).join(".lock")
}

pub fn actions_dir(root: &Path, ticket: &str, scope_key: &str) -> PathBuf {
    root.join("reports/actions").join(ticket).join(scope_key)
}

pub fn actions_template_path(root: &Path, ticket: &str, scope_key: &str, stage: &str) -> PathBuf {
    actions_dir(root, ticket, scope_key).join(format!("{stage}.actions.template.json"))
}

pub fn actions_path(root: &Path, ticket: &str, scope_key: &str, stage: &str) -> PathBuf {
    actions_dir(root, ticket, scope_key).join(format!("{stage}.actions.json"))
}

pub fn actions_apply_log_path(root: &Path, ticket: &str, scope_key: &str, stage: &str) -> PathBuf {
    actions_dir(root, ticket, scope_key).join(format!("{stage}.apply.jsonl"))
}

pub fn context_dir(root: &Path, ticket: &str) -> PathBuf {
    root.join("reports/context").join(ticket)
}

pub fn readmap_json_path(root: &Path, ticket: &str, scope_key: &str) -> PathBuf {
    context_dir(root, ticket).join(format!("{scope_key}.readmap.json"))
}

pub fn readmap_md_path(root: &Path, ticket: &str, scope_key: &str) -> PathBuf {
    context_dir(root, ticket).join(format!("{scope_key}.readmap.md"))
}

pub fn writemap_json_path(root: &Path, ticket: &str, scope_key: &str) -> PathBuf {
    context_dir(root, ticket).join(format!("{scope_key}.writemap.json"))
}

pub fn writemap_md_path(root: &Path, ticket: &str, scope_key: &str) -> PathBuf {
    context_dir(root, ticket).join(format!("{scope_key}.writemap.md"))
}

pub fn tasklist_path(root: &Path, ticket: &str) -> PathBuf {
    root.join("docs/tasklist").join(format!("{ticket}.md"))
}

pub fn context_pack_doc_path(root: &Path, ticket: &str) -> PathBuf {
    root.join("docs/loops").join(format!("{ticket}.context-pack.md"))
}

// ---------------------------------------------------------------------------
// Ticket validation
// ---------------------------------------------------------------------------

/// Tickets are path components; reject anything that could traverse.
pub fn validate_ticket(ticket: &str) -> Result<()> {
    if ticket.is_empty()
        || ticket.len() > 64
        || ticket.contains('/')
        || ticket.contains('\\')
        || ticket.contains("..")
        || ticket.contains('\0')
        || !ticket.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(AiddError::InvalidTicket(ticket.to_string()));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn workspace_root_finds_git() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join(".git")).unwrap();
        let deep = dir.path().join("src/nested");
        std::fs::create_dir_all(&deep).unwrap();
        assert_eq!(workspace_root(&deep), dir.path());
    }

    #[test]
    fn workspace_root_finds_claude_dir() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join(".claude")).unwrap();
        assert_eq!(workspace_root(dir.path()), dir.path());
    }

    #[test]
    fn require_workflow_root_needs_docs() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join(".git")).unwrap();
        assert!(matches!(
            require_workflow_root(dir.path()),
            Err(AiddError::NotInitialized)
        ));
        std::fs::create_dir_all(dir.path().join("aidd/docs")).unwrap();
        let (ws, project) = require_workflow_root(dir.path()).unwrap();
        assert_eq!(ws, dir.path());
        assert_eq!(project, dir.path().join("aidd"));
    }

    #[test]
    fn resolve_strips_dot_and_project_prefix() {
        let target = Path::new("/ws/aidd");
        assert_eq!(
            resolve_path_for_target(Path::new("./reports/x.json"), target),
            PathBuf::from("/ws/aidd/reports/x.json")
        );
        assert_eq!(
            resolve_path_for_target(Path::new("aidd/reports/x.json"), target),
            PathBuf::from("/ws/aidd/reports/x.json")
        );
        // Prefix only stripped when target itself is aidd/
        assert_eq!(
            resolve_path_for_target(Path::new("aidd/reports/x.json"), Path::new("/ws")),
            PathBuf::from("/ws/aidd/reports/x.json")
        );
    }

    #[test]
    fn rel_path_prefixes_project_root() {
        let root = Path::new("/ws/aidd");
        assert_eq!(
            rel_path(Path::new("/ws/aidd/reports/events/T.jsonl"), root),
            "aidd/reports/events/T.jsonl"
        );
        assert_eq!(rel_path(Path::new("/ws/other.txt"), root), "/ws/other.txt");
    }

    #[test]
    fn to_posix_keeps_single_leading_slash() {
        assert_eq!(to_posix(Path::new("/ws/aidd/docs/x.md")), "/ws/aidd/docs/x.md");
        assert_eq!(to_posix(Path::new("docs/x.md")), "docs/x.md");
        assert_eq!(to_posix(Path::new("/")), "/");
    }

    #[test]
    fn canonical_slots() {
        let root = Path::new("/ws/aidd");
        assert_eq!(
            stage_result_path(root, "T1", "iteration_id_I1", "implement"),
            PathBuf::from("/ws/aidd/reports/loops/T1/iteration_id_I1/stage.implement.result.json")
        );
        assert_eq!(
            actions_template_path(root, "T1", "iteration_id_I1", "review"),
            PathBuf::from("/ws/aidd/reports/actions/T1/iteration_id_I1/review.actions.template.json")
        );
        assert_eq!(
            loop_pack_path(root, "T1", "iteration_id_I1"),
            PathBuf::from("/ws/aidd/reports/loops/T1/iteration_id_I1.loop.pack.md")
        );
    }

    #[test]
    fn ticket_validation() {
        validate_ticket("DEMO-123").unwrap();
        validate_ticket("feature_x.2").unwrap();
        for bad in ["", "a/b", "..", "a b", "x\0"] {
            assert!(validate_ticket(bad).is_err(), "expected invalid: {bad:?}");
        }
    }

    #[test]
    fn plugin_root_missing_is_hard_error() {
        std::env::remove_var("CLAUDE_PLUGIN_ROOT");
        assert!(matches!(
            require_plugin_root(),
            Err(AiddError::PluginRootMissing)
        ));
    }
}
