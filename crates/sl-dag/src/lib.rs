//! Workflow definitions for Sluice
//!
//! Provides the immutable, validated [`Flow`] the runtime consumes:
//! - Ordered steps with dense indexes
//! - Dependency resolution and cycle detection
//! - Per-step metadata (kind, fan-out, retries, timeout)
//! - Slug-to-handler resolution

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, instrument};

mod builder;
mod handler;

pub use builder::{FlowBuilder, StepOptions};
pub use handler::{FnHandler, StepHandler};

/// Flow authoring and validation errors
#[derive(Debug, Error)]
pub enum FlowError {
    #[error("cycle detected in workflow DAG: {0}")]
    CycleDetected(String),

    #[error("missing dependency: step '{step}' depends on '{dependency}' which does not exist")]
    MissingDependency { step: String, dependency: String },

    #[error("duplicate step: '{0}' is declared twice")]
    DuplicateStep(String),

    #[error("invalid slug '{slug}': {reason}")]
    InvalidSlug { slug: String, reason: String },

    #[error("map step '{step}' declares {count} dependencies; at most one is allowed")]
    MapStepDependencies { step: String, count: usize },

    #[error("map step '{0}' has no dependency and no initial_tasks; fan-out cannot be inferred")]
    UnsizedMapStep(String),

    #[error("step not found: {0}")]
    StepNotFound(String),
}

/// How a step expands into tasks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    /// Exactly one task.
    Single,
    /// `initial_tasks` parallel tasks, each fed one element of the parent's
    /// list output.
    Map,
}

impl std::fmt::Display for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepKind::Single => write!(f, "single"),
            StepKind::Map => write!(f, "map"),
        }
    }
}

/// Per-step configuration as declared. Unset fields fall back to flow-level
/// defaults when metadata is resolved.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepConfig {
    #[serde(default)]
    pub initial_tasks: Option<i32>,
    #[serde(default)]
    pub max_attempts: Option<i32>,
    #[serde(default)]
    pub timeout_seconds: Option<i32>,
}

/// Step definition within a flow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDef {
    pub slug: String,
    pub kind: StepKind,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub config: StepConfig,
}

/// Resolved per-step metadata the runtime consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepMeta {
    pub kind: StepKind,
    /// `None` for map steps whose fan-out is sized from the parent's list
    /// output when the step becomes ready.
    pub initial_tasks: Option<i32>,
    pub max_attempts: i32,
    pub timeout_seconds: i32,
}

pub(crate) const DEFAULT_MAX_ATTEMPTS: i32 = 3;
pub(crate) const DEFAULT_TIMEOUT_SECONDS: i32 = 60;

/// An immutable, validated workflow definition.
///
/// Topological validity is established here, at authoring time; the runtime
/// assumes it.
#[derive(Clone)]
pub struct Flow {
    slug: String,
    /// Steps in declaration order; position is the dense `step_index`.
    steps: Vec<StepDef>,
    /// Adjacency list: step slug -> steps that depend on it (children)
    children: HashMap<String, Vec<String>>,
    /// Reverse adjacency: step slug -> steps it depends on (parents)
    parents: HashMap<String, Vec<String>>,
    /// Steps with no dependencies (entry points)
    entry_points: Vec<String>,
    /// Topologically sorted order
    topological_order: Vec<String>,
    /// Flow-level defaults applied where a step leaves config unset
    default_max_attempts: i32,
    default_timeout_seconds: i32,
    /// Slug-to-handler registry, populated at startup
    handlers: HashMap<String, Arc<dyn StepHandler>>,
}

impl std::fmt::Debug for Flow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Flow")
            .field("slug", &self.slug)
            .field("steps", &self.steps.len())
            .field("entry_points", &self.entry_points)
            .finish()
    }
}

impl Flow {
    /// Validate step definitions and build the flow graph.
    #[instrument(skip(steps, handlers, defaults), fields(flow = %slug))]
    pub(crate) fn build(
        slug: String,
        steps: Vec<StepDef>,
        handlers: HashMap<String, Arc<dyn StepHandler>>,
        defaults: (i32, i32),
    ) -> Result<Self, FlowError> {
        sl_core::slug::validate_slug(&slug, "workflow_slug").map_err(|e| {
            FlowError::InvalidSlug {
                slug: slug.clone(),
                reason: e.to_string(),
            }
        })?;

        let mut seen: HashSet<&str> = HashSet::new();
        let mut children: HashMap<String, Vec<String>> = HashMap::new();
        let mut parents: HashMap<String, Vec<String>> = HashMap::new();

        for step in &steps {
            sl_core::slug::validate_slug(&step.slug, "step_slug").map_err(|e| {
                FlowError::InvalidSlug {
                    slug: step.slug.clone(),
                    reason: e.to_string(),
                }
            })?;
            if !seen.insert(step.slug.as_str()) {
                return Err(FlowError::DuplicateStep(step.slug.clone()));
            }
            if step.kind == StepKind::Map {
                if step.depends_on.len() > 1 {
                    return Err(FlowError::MapStepDependencies {
                        step: step.slug.clone(),
                        count: step.depends_on.len(),
                    });
                }
                if step.depends_on.is_empty() && step.config.initial_tasks.is_none() {
                    return Err(FlowError::UnsizedMapStep(step.slug.clone()));
                }
            }
            children.insert(step.slug.clone(), Vec::new());
            parents.insert(step.slug.clone(), step.depends_on.clone());
        }

        // Validate dependencies and build adjacency lists
        for step in &steps {
            for dep in &step.depends_on {
                if !seen.contains(dep.as_str()) {
                    return Err(FlowError::MissingDependency {
                        step: step.slug.clone(),
                        dependency: dep.clone(),
                    });
                }
                children
                    .get_mut(dep)
                    .expect("dep was indexed above")
                    .push(step.slug.clone());
            }
        }

        let topological_order = Self::topological_sort(&steps, &children)?;

        let entry_points: Vec<String> = steps
            .iter()
            .filter(|s| s.depends_on.is_empty())
            .map(|s| s.slug.clone())
            .collect();

        debug!(
            steps = steps.len(),
            entry_points = entry_points.len(),
            "Built flow DAG"
        );

        Ok(Self {
            slug,
            steps,
            children,
            parents,
            entry_points,
            topological_order,
            default_max_attempts: defaults.0,
            default_timeout_seconds: defaults.1,
            handlers,
        })
    }

    /// Topological sort using Kahn's algorithm
    fn topological_sort(
        steps: &[StepDef],
        children: &HashMap<String, Vec<String>>,
    ) -> Result<Vec<String>, FlowError> {
        let mut in_degree: HashMap<&str, usize> = HashMap::new();
        let mut queue: VecDeque<&str> = VecDeque::new();
        let mut order: Vec<String> = Vec::new();

        for step in steps {
            in_degree.insert(step.slug.as_str(), step.depends_on.len());
            if step.depends_on.is_empty() {
                queue.push_back(step.slug.as_str());
            }
        }

        while let Some(slug) = queue.pop_front() {
            order.push(slug.to_string());

            if let Some(kids) = children.get(slug) {
                for child in kids {
                    if let Some(deg) = in_degree.get_mut(child.as_str()) {
                        *deg -= 1;
                        if *deg == 0 {
                            queue.push_back(child.as_str());
                        }
                    }
                }
            }
        }

        if order.len() != steps.len() {
            let in_order: HashSet<_> = order.iter().map(String::as_str).collect();
            let cycle_steps: Vec<_> = steps
                .iter()
                .map(|s| s.slug.as_str())
                .filter(|s| !in_order.contains(s))
                .collect();
            return Err(FlowError::CycleDetected(cycle_steps.join(", ")));
        }

        Ok(order)
    }

    pub fn slug(&self) -> &str {
        &self.slug
    }

    /// Steps in declaration order; position is the dense `step_index`.
    pub fn steps(&self) -> &[StepDef] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn get_step(&self, slug: &str) -> Option<&StepDef> {
        self.steps.iter().find(|s| s.slug == slug)
    }

    /// Workflow-local ordinal of a step.
    pub fn step_index(&self, slug: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.slug == slug)
    }

    /// Steps with no dependencies.
    pub fn entry_points(&self) -> &[String] {
        &self.entry_points
    }

    pub fn topological_order(&self) -> &[String] {
        &self.topological_order
    }

    /// Steps that depend on `slug`.
    pub fn children(&self, slug: &str) -> &[String] {
        self.children.get(slug).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// Steps `slug` depends on, in declaration order.
    pub fn parents(&self, slug: &str) -> &[String] {
        self.parents.get(slug).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// Count of incoming edges for a step.
    pub fn dependency_count(&self, slug: &str) -> usize {
        self.parents(slug).len()
    }

    /// Steps with no outgoing edges. Their outputs form the run output.
    pub fn leaves(&self) -> Vec<&str> {
        self.steps
            .iter()
            .map(|s| s.slug.as_str())
            .filter(|s| self.children(s).is_empty())
            .collect()
    }

    /// Resolved metadata for a step, with flow-level defaults applied.
    pub fn meta(&self, slug: &str) -> Result<StepMeta, FlowError> {
        let step = self
            .get_step(slug)
            .ok_or_else(|| FlowError::StepNotFound(slug.to_string()))?;
        let initial_tasks = match step.kind {
            StepKind::Single => Some(1),
            StepKind::Map => step.config.initial_tasks,
        };
        Ok(StepMeta {
            kind: step.kind,
            initial_tasks,
            max_attempts: step.config.max_attempts.unwrap_or(self.default_max_attempts),
            timeout_seconds: step
                .config
                .timeout_seconds
                .unwrap_or(self.default_timeout_seconds),
        })
    }

    /// Resolve a step slug to its registered handler.
    pub fn resolve(&self, slug: &str) -> Result<Arc<dyn StepHandler>, FlowError> {
        self.handlers
            .get(slug)
            .cloned()
            .ok_or_else(|| FlowError::StepNotFound(slug.to_string()))
    }

    pub fn default_max_attempts(&self) -> i32 {
        self.default_max_attempts
    }

    pub fn default_timeout_seconds(&self) -> i32 {
        self.default_timeout_seconds
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn noop(slug: &str) -> Arc<dyn StepHandler> {
        Arc::new(FnHandler::new(slug, |input| async move { Ok(input) }))
    }

    fn build_flow(steps: Vec<(&str, StepKind, Vec<&str>)>) -> Result<Flow, FlowError> {
        let mut builder = FlowBuilder::new("test_flow");
        for (slug, kind, deps) in steps {
            builder = match kind {
                StepKind::Single => builder.step(slug, &deps, noop(slug)),
                StepKind::Map => builder.map_step(slug, deps.first().copied(), noop(slug)),
            };
        }
        builder.build()
    }

    #[test]
    fn simple_dag_orders_steps() {
        let flow = build_flow(vec![
            ("a", StepKind::Single, vec![]),
            ("b", StepKind::Single, vec!["a"]),
            ("c", StepKind::Single, vec!["a"]),
            ("d", StepKind::Single, vec!["b", "c"]),
        ])
        .unwrap();

        assert_eq!(flow.entry_points(), &["a"]);
        assert_eq!(flow.len(), 4);

        let order = flow.topological_order();
        let pos = |s: &str| order.iter().position(|x| x == s).unwrap();
        assert!(pos("a") < pos("b"));
        assert!(pos("a") < pos("c"));
        assert!(pos("b") < pos("d"));
        assert!(pos("c") < pos("d"));
    }

    #[test]
    fn step_index_is_declaration_order() {
        let flow = build_flow(vec![
            ("first", StepKind::Single, vec![]),
            ("second", StepKind::Single, vec!["first"]),
        ])
        .unwrap();
        assert_eq!(flow.step_index("first"), Some(0));
        assert_eq!(flow.step_index("second"), Some(1));
    }

    #[test]
    fn cycle_is_detected() {
        let result = build_flow(vec![
            ("a", StepKind::Single, vec!["c"]),
            ("b", StepKind::Single, vec!["a"]),
            ("c", StepKind::Single, vec!["b"]),
        ]);
        assert!(matches!(result, Err(FlowError::CycleDetected(_))));
    }

    #[test]
    fn missing_dependency_is_rejected() {
        let result = build_flow(vec![("a", StepKind::Single, vec!["nonexistent"])]);
        assert!(matches!(result, Err(FlowError::MissingDependency { .. })));
    }

    #[test]
    fn duplicate_step_is_rejected() {
        let result = build_flow(vec![
            ("a", StepKind::Single, vec![]),
            ("a", StepKind::Single, vec![]),
        ]);
        assert!(matches!(result, Err(FlowError::DuplicateStep(_))));
    }

    #[test]
    fn reserved_slug_is_rejected() {
        let result = build_flow(vec![("run", StepKind::Single, vec![])]);
        assert!(matches!(result, Err(FlowError::InvalidSlug { .. })));
    }

    #[test]
    fn map_step_with_two_parents_is_rejected() {
        let result = FlowBuilder::new("test_flow")
            .step("a", &[], noop("a"))
            .step("b", &[], noop("b"))
            .map_step_with(
                "m",
                Some("a"),
                StepOptions::default(),
                noop("m"),
            )
            .add_dependency("m", "b")
            .build();
        assert!(matches!(result, Err(FlowError::MapStepDependencies { .. })));
    }

    #[test]
    fn root_map_step_requires_initial_tasks() {
        let result = build_flow(vec![("m", StepKind::Map, vec![])]);
        assert!(matches!(result, Err(FlowError::UnsizedMapStep(_))));

        let sized = FlowBuilder::new("test_flow")
            .map_step_with(
                "m",
                None,
                StepOptions::default().initial_tasks(4),
                noop("m"),
            )
            .build()
            .unwrap();
        assert_eq!(sized.meta("m").unwrap().initial_tasks, Some(4));
    }

    #[test]
    fn leaves_are_steps_without_children() {
        let flow = build_flow(vec![
            ("root", StepKind::Single, vec![]),
            ("l", StepKind::Single, vec!["root"]),
            ("r", StepKind::Single, vec!["root"]),
            ("merge", StepKind::Single, vec!["l", "r"]),
        ])
        .unwrap();
        assert_eq!(flow.leaves(), vec!["merge"]);
        assert_eq!(flow.dependency_count("merge"), 2);
        assert_eq!(flow.dependency_count("root"), 0);
    }

    #[test]
    fn meta_applies_flow_defaults() {
        let flow = FlowBuilder::new("test_flow")
            .max_attempts(5)
            .timeout_seconds(120)
            .step("plain", &[], noop("plain"))
            .step_with(
                "tuned",
                &["plain"],
                StepOptions::default().max_attempts(1).timeout_seconds(10),
                noop("tuned"),
            )
            .build()
            .unwrap();

        let plain = flow.meta("plain").unwrap();
        assert_eq!(plain.kind, StepKind::Single);
        assert_eq!(plain.initial_tasks, Some(1));
        assert_eq!(plain.max_attempts, 5);
        assert_eq!(plain.timeout_seconds, 120);

        let tuned = flow.meta("tuned").unwrap();
        assert_eq!(tuned.max_attempts, 1);
        assert_eq!(tuned.timeout_seconds, 10);
    }

    #[tokio::test]
    async fn resolve_dispatches_to_handler() {
        let flow = FlowBuilder::new("test_flow")
            .step(
                "s",
                &[],
                Arc::new(FnHandler::new("s", |input| async move {
                    let mut out = input;
                    out["r"] = json!("done");
                    Ok(out)
                })),
            )
            .build()
            .unwrap();

        let handler = flow.resolve("s").unwrap();
        let out = handler.run(json!({"test": "data"})).await.unwrap();
        assert_eq!(out, json!({"test": "data", "r": "done"}));

        assert!(matches!(
            flow.resolve("missing"),
            Err(FlowError::StepNotFound(_))
        ));
    }
}
