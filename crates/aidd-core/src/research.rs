//! Researcher scope builder: derive search targets from conventions config
//! plus ticket tokens, then scan the workspace for keyword matches and
//! persist both as JSON under `reports/research/`.

use crate::error::Result;
use crate::io;
use crate::paths;
use crate::scope::dedupe_preserve_order;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};

pub const IGNORE_DIRS: [&str; 7] =
    [".git", "node_modules", "build", "dist", "target", ".venv", "__pycache__"];

pub const ALLOWED_SUFFIXES: [&str; 12] = [
    "rs", "py", "ts", "js", "go", "java", "kt", "md", "toml", "yaml", "yml", "json",
];

pub const MAX_FILE_BYTES: u64 = 200 * 1024;
pub const MAX_MATCHES: usize = 400;

pub fn targets_path(root: &Path, ticket: &str) -> PathBuf {
    root.join("reports/research").join(format!("{ticket}-targets.json"))
}

pub fn context_path(root: &Path, ticket: &str) -> PathBuf {
    root.join("reports/research").join(format!("{ticket}-context.json"))
}

// ---------------------------------------------------------------------------
// Scope
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct ResearchScope {
    pub ticket: String,
    pub slug: String,
    pub tags: Vec<String>,
    pub paths: Vec<String>,
    pub docs: Vec<String>,
    pub keywords: Vec<String>,
}

fn slug_tokens(slug: &str) -> Vec<String> {
    let mut tokens = vec![slug.to_string()];
    tokens.extend(
        slug.replace(['-', '_', '/', ' '], " ")
            .split_whitespace()
            .map(|t| t.trim().to_ascii_lowercase())
            .filter(|t| !t.is_empty()),
    );
    dedupe_preserve_order(tokens)
}

fn load_researcher_settings(root: &Path) -> Value {
    let path = root.join("config/conventions.json");
    std::fs::read_to_string(&path)
        .ok()
        .and_then(|text| serde_json::from_str::<Value>(&text).ok())
        .and_then(|raw| raw.get("researcher").cloned())
        .unwrap_or(Value::Null)
}

fn str_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(|s| s.trim().trim_start_matches("./").to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

/// Build the scope for a ticket from the `researcher` section of
/// `config/conventions.json` (defaults plus per-tag extensions) and the
/// ticket/slug tokens themselves.
pub fn build_scope(root: &Path, ticket: &str, slug_hint: &str) -> ResearchScope {
    let settings = load_researcher_settings(root);
    let defaults = settings.get("defaults").unwrap_or(&Value::Null);
    let mut paths = str_list(defaults.get("paths"));
    if paths.is_empty() {
        paths.push("src".to_string());
    }
    let mut docs = str_list(defaults.get("docs"));
    if docs.is_empty() {
        docs.push("docs".to_string());
    }
    let mut keywords = str_list(defaults.get("keywords"));

    let slug = if slug_hint.is_empty() { ticket } else { slug_hint };
    let tokens = slug_tokens(slug);
    let mut tags = str_list(settings.get("features").and_then(|f| f.get(ticket)));
    if tags.is_empty() {
        if let Some(available) = settings.get("tags").and_then(Value::as_object) {
            tags = tokens.iter().filter(|t| available.contains_key(*t)).cloned().collect();
        }
    }
    for tag in &tags {
        let info = settings.get("tags").and_then(|t| t.get(tag)).cloned().unwrap_or(Value::Null);
        paths.extend(str_list(info.get("paths")));
        docs.extend(str_list(info.get("docs")));
        keywords.extend(str_list(info.get("keywords")));
    }
    keywords.extend(tokens);

    ResearchScope {
        ticket: ticket.to_string(),
        slug: slug.to_string(),
        tags: dedupe_preserve_order(tags),
        paths: dedupe_preserve_order(paths),
        docs: dedupe_preserve_order(docs),
        keywords: dedupe_preserve_order(keywords),
    }
}

/// Fold operator-supplied extras into the scope.
pub fn extend_scope(scope: &mut ResearchScope, extra_paths: &[String], extra_keywords: &[String]) {
    let mut paths = scope.paths.clone();
    paths.extend(extra_paths.iter().map(|p| p.trim().trim_start_matches("./").to_string()));
    scope.paths = dedupe_preserve_order(paths);
    let mut keywords = scope.keywords.clone();
    keywords.extend(extra_keywords.iter().map(|k| k.trim().to_ascii_lowercase()));
    scope.keywords = dedupe_preserve_order(keywords);
}

/// Persist the scope as `reports/research/<ticket>-targets.json`.
pub fn write_targets(root: &Path, scope: &ResearchScope) -> Result<PathBuf> {
    let path = targets_path(root, &scope.ticket);
    io::write_json(
        &path,
        &json!({
            "ticket": scope.ticket,
            "slug": scope.slug,
            "generated_at": io::utc_timestamp(),
            "tags": scope.tags,
            "paths": scope.paths,
            "docs": scope.docs,
            "keywords": scope.keywords,
        }),
    )?;
    Ok(path)
}

// ---------------------------------------------------------------------------
// Scanning
// ---------------------------------------------------------------------------

fn ignored_dir(name: &str) -> bool {
    IGNORE_DIRS.contains(&name.to_ascii_lowercase().as_str())
}

fn allowed_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| ALLOWED_SUFFIXES.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

fn walk_files(base: &Path, out: &mut Vec<PathBuf>) {
    let Ok(entries) = std::fs::read_dir(base) else {
        return;
    };
    let mut entries: Vec<_> = entries.flatten().collect();
    entries.sort_by_key(|e| e.file_name());
    for entry in entries {
        let path = entry.path();
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        if file_type.is_symlink() {
            continue;
        }
        if file_type.is_dir() {
            let name = entry.file_name().to_string_lossy().to_string();
            if !ignored_dir(&name) {
                walk_files(&path, out);
            }
        } else if allowed_file(&path) {
            out.push(path);
        }
    }
}

fn rel_to(path: &Path, base: &Path) -> String {
    path.strip_prefix(base).unwrap_or(path).display().to_string().replace('\\', "/")
}

fn describe_path(workspace: &Path, rel: &str) -> (Value, Option<PathBuf>) {
    let abs = workspace.join(rel);
    let kind = if abs.is_dir() {
        "directory"
    } else if abs.is_file() {
        "file"
    } else {
        "missing"
    };
    let info = json!({ "path": rel, "exists": abs.exists(), "type": kind });
    let search_root = abs.exists().then_some(abs);
    (info, search_root)
}

/// Scan the scope's roots for keyword matches: first hit per
/// `(file, token)`, capped by the per-file byte budget and the total match
/// budget.
pub fn collect_context(workspace: &Path, scope: &ResearchScope, limit: usize) -> Value {
    let mut path_infos = Vec::new();
    let mut roots = Vec::new();
    for rel in scope.paths.iter().chain(scope.docs.iter()) {
        let (info, root) = describe_path(workspace, rel);
        path_infos.push(info);
        if let Some(root) = root {
            roots.push(root);
        }
    }

    let tokens: Vec<String> = scope
        .keywords
        .iter()
        .map(|k| k.trim().to_ascii_lowercase())
        .filter(|k| !k.is_empty())
        .collect();
    let limit = limit.min(MAX_MATCHES).max(1);
    let mut matches = Vec::new();
    'outer: for root in &roots {
        let mut files = Vec::new();
        if root.is_file() {
            files.push(root.clone());
        } else {
            walk_files(root, &mut files);
        }
        for file in files {
            let too_big = std::fs::metadata(&file)
                .map(|meta| meta.len() > MAX_FILE_BYTES)
                .unwrap_or(true);
            if too_big {
                continue;
            }
            let Ok(data) = std::fs::read_to_string(&file) else {
                continue;
            };
            let lowered = data.to_ascii_lowercase();
            let lines: Vec<&str> = data.lines().collect();
            let rel = rel_to(&file, workspace);
            for token in &tokens {
                let Some(offset) = lowered.find(token.as_str()) else {
                    continue;
                };
                let line_num = lowered[..offset].matches('\n').count();
                let start = line_num.saturating_sub(1);
                let end = (line_num + 2).min(lines.len());
                matches.push(json!({
                    "token": token,
                    "file": rel,
                    "line": line_num + 1,
                    "snippet": lines[start..end].join("\n"),
                }));
                if matches.len() >= limit {
                    break 'outer;
                }
            }
        }
    }

    json!({
        "ticket": scope.ticket,
        "slug": scope.slug,
        "generated_at": io::utc_timestamp(),
        "tags": scope.tags,
        "keywords": scope.keywords,
        "paths": path_infos,
        "matches": matches,
    })
}

/// Persist the collected context as `reports/research/<ticket>-context.json`.
pub fn write_context(root: &Path, ticket: &str, context: &Value) -> Result<PathBuf> {
    let path = context_path(root, ticket);
    io::write_json(&path, context)?;
    Ok(path)
}

#[derive(Debug)]
pub struct ResearchOutcome {
    pub targets_path: PathBuf,
    pub context_path: PathBuf,
    pub match_count: usize,
}

/// Build the scope, scan, and write both artifacts.
pub fn run_research(
    root: &Path,
    workspace: &Path,
    ticket: &str,
    slug_hint: &str,
    extra_paths: &[String],
    extra_keywords: &[String],
    limit: usize,
) -> Result<ResearchOutcome> {
    paths::validate_ticket(ticket)?;
    let mut scope = build_scope(root, ticket, slug_hint);
    extend_scope(&mut scope, extra_paths, extra_keywords);
    let targets = write_targets(root, &scope)?;
    let context = collect_context(workspace, &scope, limit);
    let match_count = context["matches"].as_array().map(Vec::len).unwrap_or(0);
    let context_file = write_context(root, ticket, &context)?;
    Ok(ResearchOutcome { targets_path: targets, context_path: context_file, match_count })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn seed_workspace(workspace: &Path) {
        std::fs::create_dir_all(workspace.join("src")).unwrap();
        std::fs::create_dir_all(workspace.join("src/node_modules")).unwrap();
        std::fs::write(workspace.join("src/gateway.rs"), "fn gateway_auth() {}\n").unwrap();
        std::fs::write(workspace.join("src/readme.bin"), "gateway binary\n").unwrap();
        std::fs::write(workspace.join("src/node_modules/ignored.js"), "gateway\n").unwrap();
    }

    #[test]
    fn scope_includes_slug_tokens_and_defaults() {
        let dir = TempDir::new().unwrap();
        let scope = build_scope(dir.path(), "RES-1", "gateway-auth");
        assert_eq!(scope.paths, vec!["src"]);
        assert_eq!(scope.docs, vec!["docs"]);
        assert!(scope.keywords.contains(&"gateway".to_string()));
        assert!(scope.keywords.contains(&"auth".to_string()));
    }

    #[test]
    fn config_tags_extend_the_scope() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        io::write_json(
            &root.join("config/conventions.json"),
            &json!({
                "researcher": {
                    "defaults": { "paths": ["src"], "keywords": ["session"] },
                    "tags": { "auth": { "paths": ["src/auth"], "keywords": ["token"] } },
                }
            }),
        )
        .unwrap();
        let scope = build_scope(root, "RES-2", "auth-refresh");
        assert_eq!(scope.tags, vec!["auth"]);
        assert!(scope.paths.contains(&"src/auth".to_string()));
        assert!(scope.keywords.contains(&"token".to_string()));
        assert!(scope.keywords.contains(&"session".to_string()));
    }

    #[test]
    fn scan_skips_ignored_dirs_and_foreign_suffixes() {
        let dir = TempDir::new().unwrap();
        let workspace = dir.path();
        seed_workspace(workspace);
        let root = workspace.join("aidd");
        std::fs::create_dir_all(&root).unwrap();
        let outcome = run_research(&root, workspace, "RES-3", "gateway", &[], &[], 50).unwrap();
        assert!(outcome.targets_path.exists());
        let context: Value = io::read_json(&outcome.context_path).unwrap();
        let matches = context["matches"].as_array().unwrap();
        assert!(matches.iter().any(|m| m["file"] == "src/gateway.rs"));
        assert!(!matches.iter().any(|m| m["file"].as_str().unwrap().contains("node_modules")));
        assert!(!matches.iter().any(|m| m["file"].as_str().unwrap().ends_with(".bin")));
    }

    #[test]
    fn match_cap_is_enforced() {
        let dir = TempDir::new().unwrap();
        let workspace = dir.path();
        std::fs::create_dir_all(workspace.join("src")).unwrap();
        for i in 0..30 {
            std::fs::write(
                workspace.join(format!("src/mod{i:02}.rs")),
                "fn gateway() {}\n",
            )
            .unwrap();
        }
        let scope = ResearchScope {
            ticket: "RES-4".into(),
            slug: "gateway".into(),
            paths: vec!["src".into()],
            keywords: vec!["gateway".into()],
            ..Default::default()
        };
        let context = collect_context(workspace, &scope, 10);
        assert_eq!(context["matches"].as_array().unwrap().len(), 10);
    }
}
