//! Per-skill CONTRACT files: the declarative I/O contract a stage grants
//! its runner. Loaded from `skills/<stage>/CONTRACT.yaml` under the plugin
//! root, validated, and template-expanded against the stage context.

use crate::error::{AiddError, Result};
use serde::Deserialize;
use std::path::Path;

// ---------------------------------------------------------------------------
// Contract shape
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SkillContract {
    #[serde(default)]
    pub schema: String,
    #[serde(default)]
    pub stage: String,
    #[serde(default)]
    pub reads: ContractReads,
    #[serde(default)]
    pub writes: ContractWrites,
    #[serde(default)]
    pub actions: ContractActions,
    #[serde(default)]
    pub outputs: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ContractReads {
    #[serde(default)]
    pub required: Vec<ReadRef>,
    #[serde(default)]
    pub optional: Vec<ReadRef>,
}

/// A read reference: plain string, or `{ref, reason}` mapping.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ReadRef {
    Plain(String),
    Annotated {
        #[serde(rename = "ref")]
        reference: String,
        #[serde(default)]
        reason: String,
    },
}

impl ReadRef {
    pub fn reference(&self) -> &str {
        match self {
            ReadRef::Plain(s) => s,
            ReadRef::Annotated { reference, .. } => reference,
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            ReadRef::Plain(_) => None,
            ReadRef::Annotated { reason, .. } => {
                let trimmed = reason.trim();
                (!trimmed.is_empty()).then_some(trimmed)
            }
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ContractWrites {
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub patterns: Vec<String>,
    #[serde(default)]
    pub blocks: Vec<String>,
    #[serde(default)]
    pub via: ContractWritesVia,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ContractWritesVia {
    #[serde(default)]
    pub docops_only: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ContractActions {
    #[serde(default)]
    pub allowed_types: Vec<String>,
}

// ---------------------------------------------------------------------------
// Loading & validation
// ---------------------------------------------------------------------------

pub fn contract_path(plugin_root: &Path, stage: &str) -> std::path::PathBuf {
    plugin_root.join("skills").join(stage).join("CONTRACT.yaml")
}

pub fn load_contract(path: &Path) -> Result<SkillContract> {
    if !path.exists() {
        return Err(AiddError::ContractMissing(path.display().to_string()));
    }
    let text = std::fs::read_to_string(path)?;
    let contract: SkillContract = serde_yaml::from_str(&text)?;
    Ok(contract)
}

/// Structural errors in a parsed contract; returns an empty list when valid.
pub fn validate_contract_data(contract: &SkillContract) -> Vec<String> {
    let mut errors = Vec::new();
    if !contract.schema.is_empty() && contract.schema != crate::schema::SKILL_CONTRACT_V1 {
        errors.push(format!(
            "schema: expected {}, got {}",
            crate::schema::SKILL_CONTRACT_V1,
            contract.schema
        ));
    }
    for (label, refs) in [
        ("reads.required", &contract.reads.required),
        ("reads.optional", &contract.reads.optional),
    ] {
        for (i, entry) in refs.iter().enumerate() {
            if entry.reference().trim().is_empty() {
                errors.push(format!("{label}[{i}]: empty ref"));
            }
        }
    }
    for action_type in &contract.actions.allowed_types {
        if !crate::actions::SUPPORTED_ACTION_TYPES.contains(&action_type.as_str()) {
            errors.push(format!("actions.allowed_types: unsupported type '{action_type}'"));
        }
    }
    errors
}

// ---------------------------------------------------------------------------
// Templating
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct TemplateContext {
    pub ticket: String,
    pub scope_key: String,
    pub work_item_key: String,
    pub stage: String,
}

impl TemplateContext {
    fn lookup(&self, key: &str) -> Option<&str> {
        match key {
            "ticket" => Some(&self.ticket),
            "scope_key" => Some(&self.scope_key),
            "work_item_key" => Some(&self.work_item_key),
            "stage" => Some(&self.stage),
            _ => None,
        }
    }
}

/// Expand `{ticket}`, `{scope_key}`, `{work_item_key}`, `{stage}` in a
/// contract entry. Unknown placeholders are an error, not a passthrough.
pub fn render_template(template: &str, ctx: &TemplateContext) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.char_indices().peekable();
    while let Some((_, c)) = chars.next() {
        if c != '{' {
            out.push(c);
            continue;
        }
        let mut key = String::new();
        let mut closed = false;
        for (_, inner) in chars.by_ref() {
            if inner == '}' {
                closed = true;
                break;
            }
            key.push(inner);
        }
        if !closed {
            return Err(AiddError::UnknownPlaceholder {
                placeholder: format!("{{{key}"),
                template: template.to_string(),
            });
        }
        match ctx.lookup(&key) {
            Some(value) => out.push_str(value),
            None => {
                return Err(AiddError::UnknownPlaceholder {
                    placeholder: format!("{{{key}}}"),
                    template: template.to_string(),
                })
            }
        }
    }
    Ok(out)
}

pub fn render_items(items: &[String], ctx: &TemplateContext) -> Result<Vec<String>> {
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        let rendered = render_template(item, ctx)?;
        let trimmed = rendered.trim();
        if !trimmed.is_empty() {
            out.push(trimmed.to_string());
        }
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn ctx() -> TemplateContext {
        TemplateContext {
            ticket: "DEMO".into(),
            scope_key: "iteration_id_I1".into(),
            work_item_key: "iteration_id=I1".into(),
            stage: "implement".into(),
        }
    }

    #[test]
    fn render_expands_known_placeholders() {
        let rendered =
            render_template("aidd/reports/loops/{ticket}/{scope_key}.loop.pack.md", &ctx())
                .unwrap();
        assert_eq!(rendered, "aidd/reports/loops/DEMO/iteration_id_I1.loop.pack.md");
    }

    #[test]
    fn render_rejects_unknown_placeholder() {
        let err = render_template("docs/{slug}/x.md", &ctx()).unwrap_err();
        assert!(matches!(err, AiddError::UnknownPlaceholder { .. }));
        assert!(render_template("broken/{ticket", &ctx()).is_err());
    }

    #[test]
    fn load_and_validate_contract() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("CONTRACT.yaml");
        std::fs::write(
            &path,
            "\
schema: aidd.skill_contract.v1
stage: implement
reads:
  required:
    - aidd/docs/tasklist/{ticket}.md
    - ref: aidd/docs/plan/{ticket}.md#AIDD:ITERATIONS
      reason: iteration goals
  optional:
    - aidd/reports/context/{ticket}/{scope_key}.readmap.md
writes:
  files:
    - aidd/docs/tasklist/{ticket}.md
  via:
    docops_only:
      - aidd/docs/tasklist/{ticket}.md
actions:
  allowed_types:
    - tasklist_ops.set_iteration_done
    - tasklist_ops.next3_recompute
outputs:
  - aidd/reports/loops/{ticket}/{scope_key}/stage.{stage}.result.json
",
        )
        .unwrap();
        let contract = load_contract(&path).unwrap();
        assert!(validate_contract_data(&contract).is_empty());
        assert_eq!(contract.reads.required.len(), 2);
        assert_eq!(contract.reads.required[1].reason(), Some("iteration goals"));
        assert_eq!(contract.writes.via.docops_only.len(), 1);
    }

    #[test]
    fn unsupported_action_type_flagged() {
        let contract = SkillContract {
            actions: ContractActions { allowed_types: vec!["tasklist_ops.explode".into()] },
            ..Default::default()
        };
        let errors = validate_contract_data(&contract);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("tasklist_ops.explode"));
    }

    #[test]
    fn missing_contract_is_typed_error() {
        let err = load_contract(Path::new("/nonexistent/CONTRACT.yaml")).unwrap_err();
        assert!(matches!(err, AiddError::ContractMissing(_)));
    }
}
