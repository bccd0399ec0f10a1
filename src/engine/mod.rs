pub mod conditions;
mod for_each;
mod step_exec;

use crate::exec::secrets::SecretsVault;
use crate::provider::ProviderRegistry;
use crate::shared::cancel::CancelToken;
use crate::shared::logging::RunLogger;
use crate::state::{RunDocument, RunStatus, StateError, StateStore, StepEntry, StepRecord};
use crate::vars::Scope;
use crate::workflow::{Step, StepKind, Workflow};
use crate::workspace::Workspace;
use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    State(#[from] StateError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnErrorMode {
    Stop,
    Continue,
}

impl OnErrorMode {
    pub fn parse(raw: &str) -> Result<Self, String> {
        match raw {
            "stop" => Ok(Self::Stop),
            "continue" => Ok(Self::Continue),
            _ => Err("--on-error must be `stop` or `continue`".to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecutionOptions {
    pub on_error: OnErrorMode,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub debug: bool,
    pub resume: bool,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self {
            on_error: OnErrorMode::Stop,
            max_retries: 0,
            retry_delay_ms: 1000,
            debug: false,
            resume: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum FlowDirective {
    Next,
    Jump(usize),
    End,
    Stop,
}

/// Single-threaded control-flow interpreter. Owns the run document handle for
/// the duration of a run; every step result is persisted through the state
/// store before the interpreter consults it for branching or variable
/// resolution.
pub struct Interpreter<'a> {
    workflow: &'a Workflow,
    workspace: &'a Workspace,
    store: &'a StateStore,
    logger: &'a RunLogger,
    registry: ProviderRegistry,
    secrets: SecretsVault,
    cancel: CancelToken,
    options: ExecutionOptions,
}

impl<'a> Interpreter<'a> {
    pub fn new(
        workflow: &'a Workflow,
        workspace: &'a Workspace,
        store: &'a StateStore,
        logger: &'a RunLogger,
        cancel: CancelToken,
        options: ExecutionOptions,
    ) -> Self {
        let mut registry = ProviderRegistry::with_builtins();
        registry.register_workflow_templates(&workflow.providers);
        Self {
            workflow,
            workspace,
            store,
            logger,
            registry,
            secrets: SecretsVault::new(),
            cancel,
            options,
        }
    }

    pub fn execute(&mut self, document: &mut RunDocument) -> Result<RunStatus, EngineError> {
        let workflow = self.workflow;
        let mut pc = 0usize;

        while pc < workflow.steps.len() {
            if self.cancel.is_cancelled() {
                self.logger.warn("run.cancelled", "cancellation requested; flushing state");
                self.store.update_status(document, RunStatus::Failed)?;
                return Ok(RunStatus::Failed);
            }

            let step = &workflow.steps[pc];

            if self.options.resume && self.already_settled(document, step) {
                self.logger
                    .info("step.resumed", &format!("step `{}` already settled", step.name));
                pc += 1;
                continue;
            }

            if let Some(when) = &step.when {
                let scope = self.base_scope(document);
                match conditions::evaluate(when, &scope, self.workspace) {
                    Ok(true) => {}
                    Ok(false) => {
                        self.logger
                            .info("step.skipped", &format!("condition false for `{}`", step.name));
                        self.store
                            .update_step(document, &step.name, StepRecord::skipped())?;
                        pc += 1;
                        continue;
                    }
                    Err(message) => {
                        let record = StepRecord::failed(
                            2,
                            crate::state::ErrorRecord::new(format!(
                                "condition evaluation failed: {message}"
                            )),
                        );
                        self.store.update_step(document, &step.name, record)?;
                        pc += 1;
                        continue;
                    }
                }
            }

            self.store.backup_before_step(&step.name)?;
            self.logger
                .info("step.started", &format!("executing `{}`", step.name));

            let directive = match step.kind() {
                Ok(StepKind::ForEach(spec)) => {
                    match self.execute_for_each(document, step, spec)? {
                        for_each::LoopResult::Completed => FlowDirective::Next,
                        for_each::LoopResult::Escaped(target) => self.resolve_goto(&target),
                        for_each::LoopResult::Failed(record) => {
                            self.store
                                .update_step(document, &step.name, record.clone())?;
                            self.apply_control_flow(step, &record)
                        }
                    }
                }
                Ok(kind) => {
                    let scope = self.base_scope(document);
                    let record = self.execute_step(step, kind, &scope);
                    self.logger.info(
                        "step.finished",
                        &format!(
                            "step `{}` status={} exit_code={}",
                            step.name,
                            status_label(&record),
                            record.exit_code()
                        ),
                    );
                    self.store
                        .update_step(document, &step.name, record.clone())?;
                    self.apply_control_flow(step, &record)
                }
                Err(message) => {
                    let record =
                        StepRecord::failed(2, crate::state::ErrorRecord::new(message));
                    self.store
                        .update_step(document, &step.name, record.clone())?;
                    self.apply_control_flow(step, &record)
                }
            };

            match directive {
                FlowDirective::Next => pc += 1,
                FlowDirective::Jump(index) => pc = index,
                FlowDirective::End => {
                    self.store.update_status(document, RunStatus::Completed)?;
                    self.logger.info("run.completed", "reached `_end`");
                    return Ok(RunStatus::Completed);
                }
                FlowDirective::Stop => {
                    self.store.update_status(document, RunStatus::Failed)?;
                    self.logger.error("run.failed", "halted by strict flow");
                    return Ok(RunStatus::Failed);
                }
            }
        }

        self.store.update_status(document, RunStatus::Completed)?;
        self.logger.info("run.completed", "all steps finished");
        Ok(RunStatus::Completed)
    }

    /// Resume replays settled steps as no-ops; failed steps run again. Loops
    /// are re-entered so the for-each engine can skip completed iterations.
    fn already_settled(&self, document: &RunDocument, step: &Step) -> bool {
        match document.steps.get(&step.name) {
            Some(StepEntry::Single(record)) => record.status.is_settled(),
            Some(StepEntry::Loop(_)) | None => false,
        }
    }

    fn base_scope(&self, document: &RunDocument) -> Scope {
        Scope::new()
            .with_run(&document.run_id, &document.run_root, &document.started_at)
            .with_context(document.context.clone())
            .with_steps(document.steps_value())
    }

    /// Branching precedence: `on.success` on success, `on.failure` on
    /// failure, then `on.always` overrides either. With no handler, failures
    /// fall through to strict-flow / on-error policy.
    fn apply_control_flow(&self, step: &Step, record: &StepRecord) -> FlowDirective {
        if record.skipped {
            return FlowDirective::Next;
        }
        let exit_code = record.exit_code();

        let mut target: Option<&str> = None;
        if let Some(handlers) = &step.on {
            if exit_code == 0 {
                target = handlers.success.as_ref().map(|spec| spec.goto.as_str());
            } else {
                target = handlers.failure.as_ref().map(|spec| spec.goto.as_str());
            }
            if let Some(always) = &handlers.always {
                target = Some(always.goto.as_str());
            }
        }
        if let Some(target) = target {
            return self.resolve_goto(target);
        }

        if exit_code != 0 {
            if self.workflow.strict_flow && self.options.on_error == OnErrorMode::Stop {
                return FlowDirective::Stop;
            }
            self.logger.warn(
                "step.failed",
                &format!(
                    "step `{}` exited {exit_code}; continuing per flow policy",
                    step.name
                ),
            );
        }
        FlowDirective::Next
    }

    fn resolve_goto(&self, target: &str) -> FlowDirective {
        if target == "_end" {
            return FlowDirective::End;
        }
        match self.workflow.step_index(target) {
            Some(index) => FlowDirective::Jump(index),
            None => {
                // Validation guarantees targets; treat a miss as plain advance.
                self.logger
                    .warn("flow.goto", &format!("goto target `{target}` not found"));
                FlowDirective::Next
            }
        }
    }
}

fn status_label(record: &StepRecord) -> &'static str {
    match record.status {
        crate::state::StepStatus::Pending => "pending",
        crate::state::StepStatus::Running => "running",
        crate::state::StepStatus::Completed => "completed",
        crate::state::StepStatus::Failed => "failed",
        crate::state::StepStatus::Skipped => "skipped",
    }
}

pub(crate) fn value_to_map(value: Value) -> serde_json::Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => serde_json::Map::new(),
    }
}
