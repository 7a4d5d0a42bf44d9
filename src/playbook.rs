//! Workflow instantiation from playbook templates.
//!
//! A playbook is a stored element describing steps, variables, and
//! inheritance. Instantiation resolves the `extends` chain (deeper
//! field wins), merges variable defaults with provided values, filters
//! conditional steps, and materializes the workflow with its child
//! tasks and dependency wiring inside a single transaction.

use chrono::Utc;
use regex::Regex;
use rusqlite::TransactionBehavior;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;
use tracing::{debug, info};

use crate::models::{
    Dependency, DependencyType, Element, ElementKind, EventType, PlaybookData,
    StepKind, StepSpec, TaskData, TaskType, VariableSpec, WorkflowData,
};
use crate::storage::{rows, ElementStore};
use crate::{FoundryError, Result};

fn placeholder_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\{\{\s*([A-Za-z0-9_]+)\s*\}\}").unwrap())
}

/// A function step: allocated an id and fully substituted, but not
/// persisted — execution is external.
#[derive(Debug, Clone)]
pub struct FunctionStep {
    pub id: String,
    pub name: String,
    pub title: String,
    pub description: Option<String>,
    pub command: Option<String>,
    pub code: Option<String>,
}

#[derive(Debug, Clone)]
pub struct InstantiationResult {
    pub workflow: Element,
    pub tasks: Vec<Element>,
    pub function_steps: Vec<FunctionStep>,
    /// All included steps, post-merge, in playbook order.
    pub steps: Vec<StepSpec>,
    pub blocks_dependencies: Vec<Dependency>,
    pub parent_child_dependencies: Vec<Dependency>,
    pub resolved_variables: Map<String, Value>,
    /// Step names dropped by their conditions.
    pub skipped_steps: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct InstantiateOptions {
    /// Workflow title; defaults to the playbook name, substituted.
    pub title: Option<String>,
    /// Overrides the playbook's ephemeral default.
    pub ephemeral: Option<bool>,
}

#[derive(Clone)]
pub struct WorkflowInstantiator {
    store: ElementStore,
}

impl WorkflowInstantiator {
    pub fn new(store: ElementStore) -> Self {
        Self { store }
    }

    pub async fn instantiate(
        &self,
        playbook_id: &str,
        variables: Map<String, Value>,
        options: InstantiateOptions,
        actor: &str,
    ) -> Result<InstantiationResult> {
        let playbook = self.resolve_playbook(playbook_id).await?;
        let resolved_variables = resolve_variables(&playbook.variables, variables)?;

        // Filter steps on their conditions before anything is written.
        let mut included = Vec::new();
        let mut skipped_steps = Vec::new();
        for step in &playbook.steps {
            let keep = match &step.condition {
                Some(condition) => eval_condition(condition, &resolved_variables)?,
                None => true,
            };
            if keep {
                included.push(step.clone());
            } else {
                debug!(step = %step.name, "step skipped by condition");
                skipped_steps.push(step.name.clone());
            }
        }
        let included_names: HashSet<String> =
            included.iter().map(|s| s.name.clone()).collect();

        let title = options
            .title
            .unwrap_or_else(|| playbook.name.clone());
        let title = substitute(&title, &resolved_variables);
        let ephemeral = options.ephemeral.unwrap_or(playbook.ephemeral);

        let mut workflow_data = WorkflowData::new(title);
        workflow_data.ephemeral = ephemeral;
        workflow_data.variables = resolved_variables.clone();
        workflow_data.playbook_id = Some(playbook_id.to_string());
        let workflow = Element::new(ElementKind::Workflow(workflow_data), actor);

        let vars = resolved_variables.clone();
        let actor_owned = actor.to_string();
        let included_clone = included.clone();
        let result = self
            .store
            .database()
            .execute_mut(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

                create_in_tx(&tx, &workflow)?;

                // Steps in order; child ids come from the workflow's
                // counter so they read workflow.1, workflow.2, ...
                let mut tasks = Vec::new();
                let mut function_steps = Vec::new();
                let mut step_ids: HashMap<String, (String, StepKind)> = HashMap::new();

                for step in &included_clone {
                    let n = rows::next_child_number(&tx, &workflow.id)?;
                    let child_id = format!("{}.{n}", workflow.id);
                    step_ids.insert(step.name.clone(), (child_id.clone(), step.kind));

                    match step.kind {
                        StepKind::Task => {
                            let mut task = TaskData::new(substitute(&step.title, &vars));
                            task.task_type = step.task_type.unwrap_or(TaskType::Task);
                            task.priority = step.priority.unwrap_or(3);
                            task.complexity = step.complexity.unwrap_or(3);
                            task.assignee = step
                                .assignee
                                .as_ref()
                                .map(|a| substitute(a, &vars));
                            let element = Element::with_id(
                                child_id,
                                ElementKind::Task(task),
                                &actor_owned,
                            );
                            create_in_tx(&tx, &element)?;
                            tasks.push(element);
                        }
                        StepKind::Function => {
                            function_steps.push(FunctionStep {
                                id: child_id,
                                name: step.name.clone(),
                                title: substitute(&step.title, &vars),
                                description: step
                                    .description
                                    .as_ref()
                                    .map(|d| substitute(d, &vars)),
                                command: step
                                    .command
                                    .as_ref()
                                    .map(|c| substitute(c, &vars)),
                                code: step.code.as_ref().map(|c| substitute(c, &vars)),
                            });
                        }
                    }
                }

                // depends_on → blocks edges between persisted task
                // steps; edges touching a skipped or function endpoint
                // are dropped.
                let mut blocks_dependencies = Vec::new();
                for step in &included_clone {
                    let (step_id, step_kind) = &step_ids[&step.name];
                    if *step_kind != StepKind::Task {
                        continue;
                    }
                    for upstream in &step.depends_on {
                        if !included_names.contains(upstream) {
                            continue;
                        }
                        let (upstream_id, upstream_kind) = match step_ids.get(upstream) {
                            Some(found) => found,
                            None => continue,
                        };
                        if *upstream_kind != StepKind::Task {
                            continue;
                        }
                        let dep = Dependency {
                            blocked_id: step_id.clone(),
                            blocker_id: upstream_id.clone(),
                            dep_type: DependencyType::Blocks,
                            created_at: Utc::now(),
                            created_by: actor_owned.clone(),
                            metadata: Map::new(),
                        };
                        rows::insert_dependency(&tx, &dep)?;
                        rows::append_event(
                            &tx,
                            &dep.blocked_id,
                            EventType::DependencyAdded,
                            &actor_owned,
                            None,
                            Some(&serde_json::to_value(&dep)?),
                        )?;
                        blocks_dependencies.push(dep);
                    }
                }

                // Ownership edges: each task blocked by the workflow.
                let mut parent_child_dependencies = Vec::new();
                for task in &tasks {
                    let dep = Dependency {
                        blocked_id: task.id.clone(),
                        blocker_id: workflow.id.clone(),
                        dep_type: DependencyType::ParentChild,
                        created_at: Utc::now(),
                        created_by: actor_owned.clone(),
                        metadata: Map::new(),
                    };
                    rows::insert_dependency(&tx, &dep)?;
                    parent_child_dependencies.push(dep);
                }

                tx.commit()?;
                Ok(InstantiationResult {
                    workflow,
                    tasks,
                    function_steps,
                    steps: included_clone,
                    blocks_dependencies,
                    parent_child_dependencies,
                    resolved_variables: vars,
                    skipped_steps,
                })
            })
            .await?;

        info!(
            workflow = %result.workflow.id,
            playbook = %playbook_id,
            tasks = result.tasks.len(),
            skipped = result.skipped_steps.len(),
            "workflow instantiated"
        );
        Ok(result)
    }

    /// Load a playbook and fold its `extends` chain, child fields
    /// winning.
    async fn resolve_playbook(&self, playbook_id: &str) -> Result<PlaybookData> {
        let mut chain = Vec::new();
        let mut visited = HashSet::new();
        let mut cursor = Some(playbook_id.to_string());

        while let Some(id) = cursor {
            if !visited.insert(id.clone()) {
                return Err(FoundryError::Validation(format!(
                    "playbook inheritance cycle at {id}"
                )));
            }
            let element = self
                .store
                .get(&id)
                .await?
                .ok_or_else(|| FoundryError::NotFound(id.clone()))?;
            let playbook = element
                .as_playbook()
                .ok_or_else(|| {
                    FoundryError::InvalidInput(format!("{id} is not a playbook"))
                })?
                .clone();
            cursor = playbook.extends.clone();
            chain.push(playbook);
        }

        // Root first, requested playbook last.
        chain.reverse();
        let mut merged = chain.remove(0);
        for child in chain {
            merged = merge_playbooks(merged, child);
        }
        Ok(merged)
    }
}

fn create_in_tx(tx: &rusqlite::Connection, element: &Element) -> Result<()> {
    crate::validation::validate_element(element)?;
    rows::insert_element(tx, element)?;
    rows::mark_dirty(tx, &element.id)?;
    rows::append_event(
        tx,
        &element.id,
        EventType::Created,
        &element.created_by,
        None,
        Some(&serde_json::to_value(element)?),
    )?;
    Ok(())
}

/// Parent-then-child merge: child replaces same-named variables and
/// steps in place, appends new ones, and overrides scalar fields.
fn merge_playbooks(parent: PlaybookData, child: PlaybookData) -> PlaybookData {
    let mut variables = parent.variables;
    for child_var in child.variables {
        match variables.iter_mut().find(|v| v.name == child_var.name) {
            Some(slot) => *slot = child_var,
            None => variables.push(child_var),
        }
    }

    let mut steps = parent.steps;
    for child_step in child.steps {
        match steps.iter_mut().find(|s| s.name == child_step.name) {
            Some(slot) => *slot = child_step,
            None => steps.push(child_step),
        }
    }

    PlaybookData {
        name: child.name,
        description: child.description.or(parent.description),
        extends: None,
        variables,
        steps,
        ephemeral: child.ephemeral,
    }
}

fn resolve_variables(
    specs: &[VariableSpec],
    provided: Map<String, Value>,
) -> Result<Map<String, Value>> {
    let mut resolved = Map::new();
    for spec in specs {
        if let Some(default) = &spec.default {
            resolved.insert(spec.name.clone(), default.clone());
        }
    }
    for (name, value) in provided {
        resolved.insert(name, value);
    }
    for spec in specs {
        if spec.required && !resolved.contains_key(&spec.name) {
            return Err(FoundryError::MissingRequiredField(format!(
                "variable '{}'",
                spec.name
            )));
        }
    }
    Ok(resolved)
}

/// Replace `{{name}}` placeholders with the variable's display value.
/// Unknown placeholders are left as-is.
pub fn substitute(template: &str, variables: &Map<String, Value>) -> String {
    placeholder_pattern()
        .replace_all(template, |caps: &regex::Captures<'_>| {
            match variables.get(&caps[1]) {
                Some(value) => display_value(value),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Condition grammar over variables: `name`, `!name`,
/// `name == "literal"`, `name != "literal"`. Bare names test
/// truthiness; missing variables are false.
pub fn eval_condition(expr: &str, variables: &Map<String, Value>) -> Result<bool> {
    let expr = expr.trim();
    if expr.is_empty() {
        return Ok(true);
    }

    if let Some((lhs, rhs, negated)) = split_comparison(expr) {
        let actual = variables
            .get(lhs)
            .map(display_value)
            .unwrap_or_default();
        let equal = actual == rhs;
        return Ok(if negated { !equal } else { equal });
    }

    if let Some(name) = expr.strip_prefix('!') {
        let name = name.trim();
        validate_condition_name(name, expr)?;
        return Ok(!truthy(variables.get(name)));
    }

    validate_condition_name(expr, expr)?;
    Ok(truthy(variables.get(expr)))
}

fn split_comparison(expr: &str) -> Option<(&str, String, bool)> {
    let (lhs, rhs, negated) = if let Some((lhs, rhs)) = expr.split_once("==") {
        (lhs, rhs, false)
    } else if let Some((lhs, rhs)) = expr.split_once("!=") {
        (lhs, rhs, true)
    } else {
        return None;
    };
    let rhs = rhs.trim().trim_matches('"').trim_matches('\'').to_string();
    Some((lhs.trim(), rhs, negated))
}

fn validate_condition_name(name: &str, expr: &str) -> Result<()> {
    if name.is_empty()
        || !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Err(FoundryError::Validation(format!(
            "unsupported condition expression '{expr}'"
        )));
    }
    Ok(())
}

fn truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => !s.is_empty() && s != "false",
        Some(Value::Number(n)) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Some(Value::Array(a)) => !a.is_empty(),
        Some(Value::Object(o)) => !o.is_empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ElementFilter;
    use crate::storage::Database;
    use serde_json::json;

    async fn fixtures() -> (ElementStore, WorkflowInstantiator) {
        let db = Database::open_in_memory().unwrap();
        db.run_migrations().await.unwrap();
        let store = ElementStore::new(db);
        (store.clone(), WorkflowInstantiator::new(store))
    }

    fn task_step(name: &str, title: &str) -> StepSpec {
        StepSpec {
            name: name.to_string(),
            kind: StepKind::Task,
            title: title.to_string(),
            description: None,
            assignee: None,
            command: None,
            code: None,
            condition: None,
            depends_on: Vec::new(),
            task_type: None,
            priority: None,
            complexity: None,
        }
    }

    async fn create_playbook(store: &ElementStore, data: PlaybookData) -> String {
        store
            .create(Element::new(ElementKind::Playbook(data), "el-sys"))
            .await
            .unwrap()
            .id
    }

    fn release_playbook() -> PlaybookData {
        PlaybookData {
            name: "release {{version}}".to_string(),
            description: None,
            extends: None,
            variables: vec![
                VariableSpec {
                    name: "version".to_string(),
                    required: true,
                    default: None,
                },
                VariableSpec {
                    name: "notify".to_string(),
                    required: false,
                    default: Some(json!(false)),
                },
            ],
            steps: vec![
                task_step("build", "Build {{version}}"),
                {
                    let mut step = task_step("test", "Test {{version}}");
                    step.depends_on = vec!["build".to_string()];
                    step
                },
                {
                    let mut step = task_step("announce", "Announce {{version}}");
                    step.condition = Some("notify".to_string());
                    step.depends_on = vec!["test".to_string()];
                    step
                },
                StepSpec {
                    name: "tag".to_string(),
                    kind: StepKind::Function,
                    title: "Tag {{version}}".to_string(),
                    description: None,
                    assignee: None,
                    command: Some("git tag v{{version}}".to_string()),
                    code: None,
                    condition: None,
                    depends_on: vec!["test".to_string()],
                    task_type: None,
                    priority: None,
                    complexity: None,
                },
            ],
            ephemeral: true,
        }
    }

    #[tokio::test]
    async fn instantiation_wires_tasks_and_dependencies() {
        let (store, instantiator) = fixtures().await;
        let playbook_id = create_playbook(&store, release_playbook()).await;

        let mut vars = Map::new();
        vars.insert("version".to_string(), json!("1.2.0"));
        let result = instantiator
            .instantiate(playbook_id.as_str(), vars, InstantiateOptions::default(), "el-sys")
            .await
            .unwrap();

        let workflow = result.workflow.as_workflow().unwrap();
        assert_eq!(workflow.title, "release 1.2.0");
        assert!(workflow.ephemeral);
        assert_eq!(workflow.playbook_id.as_deref(), Some(playbook_id.as_str()));

        // notify defaulted false: announce skipped; function step not
        // persisted.
        assert_eq!(result.skipped_steps, vec!["announce".to_string()]);
        assert_eq!(result.tasks.len(), 2);
        assert_eq!(result.function_steps.len(), 1);
        assert_eq!(result.function_steps[0].command.as_deref(), Some("git tag v1.2.0"));

        // Child ids are sequential under the workflow.
        assert_eq!(result.tasks[0].id, format!("{}.1", result.workflow.id));
        assert_eq!(result.tasks[1].id, format!("{}.2", result.workflow.id));
        assert_eq!(result.tasks[0].as_task().unwrap().title, "Build 1.2.0");

        // One blocks edge (test waits build); announce edges skipped
        // with the step, tag is a function step.
        assert_eq!(result.blocks_dependencies.len(), 1);
        assert_eq!(result.blocks_dependencies[0].blocked_id, result.tasks[1].id);
        assert_eq!(result.blocks_dependencies[0].blocker_id, result.tasks[0].id);

        // Ownership edges for both persisted tasks.
        assert_eq!(result.parent_child_dependencies.len(), 2);
        for dep in &result.parent_child_dependencies {
            assert_eq!(dep.blocker_id, result.workflow.id);
            assert_eq!(dep.dep_type, DependencyType::ParentChild);
        }

        // Everything landed in the store.
        let stored_tasks = store
            .list(ElementFilter::of_type(crate::models::ElementType::Task))
            .await
            .unwrap();
        assert_eq!(stored_tasks.len(), 2);
    }

    #[tokio::test]
    async fn missing_required_variable_fails_validation() {
        let (store, instantiator) = fixtures().await;
        let playbook_id = create_playbook(&store, release_playbook()).await;

        let err = instantiator
            .instantiate(&playbook_id, Map::new(), InstantiateOptions::default(), "el-sys")
            .await
            .unwrap_err();
        assert!(matches!(err, FoundryError::MissingRequiredField(_)));

        // Nothing was written.
        let workflows = store
            .list(ElementFilter::of_type(crate::models::ElementType::Workflow))
            .await
            .unwrap();
        assert!(workflows.is_empty());
    }

    #[tokio::test]
    async fn extends_chain_merges_with_child_winning() {
        let (store, instantiator) = fixtures().await;

        let base_id = create_playbook(
            &store,
            PlaybookData {
                name: "base".to_string(),
                description: Some("base flow".to_string()),
                extends: None,
                variables: vec![VariableSpec {
                    name: "env".to_string(),
                    required: false,
                    default: Some(json!("staging")),
                }],
                steps: vec![
                    task_step("prepare", "Prepare {{env}}"),
                    task_step("deploy", "Deploy to {{env}}"),
                ],
                ephemeral: false,
            },
        )
        .await;

        let child_id = create_playbook(
            &store,
            PlaybookData {
                name: "prod-deploy".to_string(),
                description: None,
                extends: Some(base_id),
                variables: vec![VariableSpec {
                    name: "env".to_string(),
                    required: false,
                    default: Some(json!("production")),
                }],
                steps: vec![task_step("deploy", "Carefully deploy to {{env}}")],
                ephemeral: true,
            },
        )
        .await;

        let result = instantiator
            .instantiate(&child_id, Map::new(), InstantiateOptions::default(), "el-sys")
            .await
            .unwrap();

        assert_eq!(result.resolved_variables["env"], json!("production"));
        assert_eq!(result.tasks.len(), 2);
        // Parent order preserved, child's replacement applied in place.
        assert_eq!(result.tasks[0].as_task().unwrap().title, "Prepare production");
        assert_eq!(
            result.tasks[1].as_task().unwrap().title,
            "Carefully deploy to production"
        );
        assert!(result.workflow.as_workflow().unwrap().ephemeral);
    }

    #[tokio::test]
    async fn inheritance_cycle_is_rejected() {
        let (store, instantiator) = fixtures().await;

        let mut first = release_playbook();
        first.name = "a".to_string();
        let first_id = create_playbook(&store, first).await;

        let second_id = create_playbook(
            &store,
            PlaybookData {
                name: "b".to_string(),
                description: None,
                extends: Some(first_id.clone()),
                variables: Vec::new(),
                steps: Vec::new(),
                ephemeral: false,
            },
        )
        .await;

        // Close the loop a -> b.
        store
            .update(&first_id, "el-sys", move |element| {
                if let ElementKind::Playbook(p) = &mut element.kind {
                    p.extends = Some(second_id.clone());
                }
                Ok(())
            })
            .await
            .unwrap();

        let err = instantiator
            .instantiate(&first_id, Map::new(), InstantiateOptions::default(), "el-sys")
            .await
            .unwrap_err();
        assert!(matches!(err, FoundryError::Validation(_)));
    }

    #[test]
    fn condition_grammar() {
        let mut vars = Map::new();
        vars.insert("enabled".to_string(), json!(true));
        vars.insert("env".to_string(), json!("prod"));
        vars.insert("count".to_string(), json!(0));

        assert!(eval_condition("enabled", &vars).unwrap());
        assert!(!eval_condition("!enabled", &vars).unwrap());
        assert!(!eval_condition("count", &vars).unwrap());
        assert!(!eval_condition("missing", &vars).unwrap());
        assert!(eval_condition("!missing", &vars).unwrap());
        assert!(eval_condition("env == \"prod\"", &vars).unwrap());
        assert!(eval_condition("env != 'staging'", &vars).unwrap());
        assert!(!eval_condition("env == staging", &vars).unwrap());
        assert!(eval_condition("", &vars).unwrap());
        assert!(eval_condition("bad name!", &vars).is_err());
    }

    #[test]
    fn substitution_and_unknown_placeholders() {
        let mut vars = Map::new();
        vars.insert("who".to_string(), json!("world"));
        vars.insert("n".to_string(), json!(3));
        assert_eq!(substitute("hello {{who}} x{{n}}", &vars), "hello world x3");
        assert_eq!(substitute("keep {{unknown}}", &vars), "keep {{unknown}}");
    }
}
