//! Flow builder
//!
//! Collects step declarations and handlers, then validates the whole graph in
//! [`FlowBuilder::build`]. Steps keep their declaration order; that order is
//! the dense step index and the tie-break for input merging.

use crate::{Flow, FlowError, StepConfig, StepDef, StepHandler, StepKind};
use crate::{DEFAULT_MAX_ATTEMPTS, DEFAULT_TIMEOUT_SECONDS};
use std::collections::HashMap;
use std::sync::Arc;

/// Optional per-step tuning.
#[derive(Debug, Clone, Copy, Default)]
pub struct StepOptions {
    initial_tasks: Option<i32>,
    max_attempts: Option<i32>,
    timeout_seconds: Option<i32>,
}

impl StepOptions {
    pub fn initial_tasks(mut self, n: i32) -> Self {
        self.initial_tasks = Some(n);
        self
    }

    pub fn max_attempts(mut self, n: i32) -> Self {
        self.max_attempts = Some(n);
        self
    }

    pub fn timeout_seconds(mut self, n: i32) -> Self {
        self.timeout_seconds = Some(n);
        self
    }

    fn into_config(self) -> StepConfig {
        StepConfig {
            initial_tasks: self.initial_tasks,
            max_attempts: self.max_attempts,
            timeout_seconds: self.timeout_seconds,
        }
    }
}

/// Builder for [`Flow`]. All validation happens in [`FlowBuilder::build`].
pub struct FlowBuilder {
    slug: String,
    steps: Vec<StepDef>,
    handlers: HashMap<String, Arc<dyn StepHandler>>,
    default_max_attempts: i32,
    default_timeout_seconds: i32,
}

impl FlowBuilder {
    pub fn new(slug: impl Into<String>) -> Self {
        Self {
            slug: slug.into(),
            steps: Vec::new(),
            handlers: HashMap::new(),
            default_max_attempts: DEFAULT_MAX_ATTEMPTS,
            default_timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
        }
    }

    /// Flow-level retry budget applied to steps that do not override it.
    pub fn max_attempts(mut self, n: i32) -> Self {
        self.default_max_attempts = n;
        self
    }

    /// Flow-level task timeout applied to steps that do not override it.
    pub fn timeout_seconds(mut self, n: i32) -> Self {
        self.default_timeout_seconds = n;
        self
    }

    /// Declare a `single` step.
    pub fn step(self, slug: &str, depends_on: &[&str], handler: Arc<dyn StepHandler>) -> Self {
        self.step_with(slug, depends_on, StepOptions::default(), handler)
    }

    /// Declare a `single` step with per-step tuning.
    pub fn step_with(
        mut self,
        slug: &str,
        depends_on: &[&str],
        options: StepOptions,
        handler: Arc<dyn StepHandler>,
    ) -> Self {
        self.steps.push(StepDef {
            slug: slug.to_string(),
            kind: StepKind::Single,
            depends_on: depends_on.iter().map(|s| s.to_string()).collect(),
            config: options.into_config(),
        });
        self.handlers.insert(slug.to_string(), handler);
        self
    }

    /// Declare a `map` step fanning out over `parent`'s list output.
    pub fn map_step(
        self,
        slug: &str,
        parent: Option<&str>,
        handler: Arc<dyn StepHandler>,
    ) -> Self {
        self.map_step_with(slug, parent, StepOptions::default(), handler)
    }

    /// Declare a `map` step with per-step tuning. A root map step (no parent)
    /// must size its fan-out through [`StepOptions::initial_tasks`].
    pub fn map_step_with(
        mut self,
        slug: &str,
        parent: Option<&str>,
        options: StepOptions,
        handler: Arc<dyn StepHandler>,
    ) -> Self {
        self.steps.push(StepDef {
            slug: slug.to_string(),
            kind: StepKind::Map,
            depends_on: parent.map(|p| vec![p.to_string()]).unwrap_or_default(),
            config: options.into_config(),
        });
        self.handlers.insert(slug.to_string(), handler);
        self
    }

    /// Add one more dependency edge to an already-declared step.
    pub fn add_dependency(mut self, step: &str, dependency: &str) -> Self {
        if let Some(def) = self.steps.iter_mut().find(|s| s.slug == step) {
            def.depends_on.push(dependency.to_string());
        }
        self
    }

    /// Validate and freeze the flow.
    pub fn build(self) -> Result<Flow, FlowError> {
        Flow::build(
            self.slug,
            self.steps,
            self.handlers,
            (self.default_max_attempts, self.default_timeout_seconds),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FnHandler;

    fn noop(slug: &str) -> Arc<dyn StepHandler> {
        Arc::new(FnHandler::new(slug, |input| async move { Ok(input) }))
    }

    #[test]
    fn declaration_order_is_preserved() {
        let flow = FlowBuilder::new("ordered")
            .step("z_last_alphabetically", &[], noop("z_last_alphabetically"))
            .step("a_first", &["z_last_alphabetically"], noop("a_first"))
            .build()
            .unwrap();
        assert_eq!(flow.steps()[0].slug, "z_last_alphabetically");
        assert_eq!(flow.steps()[1].slug, "a_first");
    }

    #[test]
    fn map_step_fan_out_defers_to_parent() {
        let flow = FlowBuilder::new("fanout")
            .step("fetch", &[], noop("fetch"))
            .map_step("process", Some("fetch"), noop("process"))
            .build()
            .unwrap();
        // Unsized until the parent's list output is known.
        assert_eq!(flow.meta("process").unwrap().initial_tasks, None);
    }

    #[test]
    fn zero_initial_tasks_is_legal_for_map_steps() {
        let flow = FlowBuilder::new("empty_fanout")
            .map_step_with("m", None, StepOptions::default().initial_tasks(0), noop("m"))
            .build()
            .unwrap();
        assert_eq!(flow.meta("m").unwrap().initial_tasks, Some(0));
    }
}
