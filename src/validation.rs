//! Input validation for ids, slugs, and element fields.
//!
//! Every public service validates at entry and rejects with a
//! structured error; nothing downstream re-checks.

use crate::{models::Element, models::ElementKind, FoundryError, Result};
use regex::Regex;
use std::sync::OnceLock;

/// Top-level element ids: `el-` + lowercase alphanumeric slug, with
/// optional dot-delimited numeric child segments (`el-abc.3.1`).
fn element_id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^el-[a-z0-9][a-z0-9-]*(\.[0-9]+)*$").unwrap())
}

/// Entity and team name slugs: letters, digits, hyphens, underscores.
fn name_slug_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9_-]+$").unwrap())
}

pub fn validate_element_id(id: &str) -> Result<()> {
    if element_id_pattern().is_match(id) {
        Ok(())
    } else {
        Err(FoundryError::InvalidId(id.to_string()))
    }
}

pub fn validate_name_slug(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(FoundryError::MissingRequiredField("name".to_string()));
    }
    if name_slug_pattern().is_match(name) {
        Ok(())
    } else {
        Err(FoundryError::Validation(format!(
            "name '{name}' must contain only letters, digits, hyphens, underscores"
        )))
    }
}

fn validate_scale(field: &str, value: u8) -> Result<()> {
    if (1..=5).contains(&value) {
        Ok(())
    } else {
        Err(FoundryError::Validation(format!(
            "{field} must be between 1 and 5, got {value}"
        )))
    }
}

/// Validate an element's kind-specific fields before it is written.
pub fn validate_element(element: &Element) -> Result<()> {
    validate_element_id(&element.id)?;

    match &element.kind {
        ElementKind::Task(task) => {
            if task.title.trim().is_empty() {
                return Err(FoundryError::MissingRequiredField("title".to_string()));
            }
            validate_scale("priority", task.priority)?;
            validate_scale("complexity", task.complexity)?;
        }
        ElementKind::Workflow(workflow) => {
            if workflow.title.trim().is_empty() {
                return Err(FoundryError::MissingRequiredField("title".to_string()));
            }
        }
        ElementKind::Plan(plan) => {
            if plan.title.trim().is_empty() {
                return Err(FoundryError::MissingRequiredField("title".to_string()));
            }
        }
        ElementKind::Entity(entity) => {
            validate_name_slug(&entity.name)?;
        }
        ElementKind::Team(team) => {
            validate_name_slug(&team.name)?;
        }
        ElementKind::Document(document) => {
            if document.category.trim().is_empty() {
                return Err(FoundryError::MissingRequiredField("category".to_string()));
            }
        }
        ElementKind::Playbook(playbook) => {
            if playbook.name.trim().is_empty() {
                return Err(FoundryError::MissingRequiredField("name".to_string()));
            }
            let mut seen = std::collections::HashSet::new();
            for step in &playbook.steps {
                if !seen.insert(step.name.as_str()) {
                    return Err(FoundryError::Validation(format!(
                        "duplicate step name '{}'",
                        step.name
                    )));
                }
            }
        }
        _ => {}
    }

    for key in element.metadata.keys() {
        if key.trim().is_empty() || key.chars().any(|c| c.is_whitespace()) {
            return Err(FoundryError::Validation(format!(
                "metadata key '{key}' must be a non-empty token"
            )));
        }
    }

    Ok(())
}
