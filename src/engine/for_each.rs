use super::{conditions, EngineError, Interpreter};
use crate::state::{
    ErrorRecord, ForEachState, LifecycleRecord, RunDocument, StepRecord,
};
use crate::vars::{substitute_required, Scope};
use crate::workflow::pointers::ItemsPointer;
use crate::workflow::{ForEachSpec, LifecycleAction, Step, StepKind, WorkflowVersion};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

pub(crate) enum LoopResult {
    Completed,
    /// A child `goto` left the loop; the target is an outer step or `_end`.
    Escaped(String),
    Failed(StepRecord),
}

impl Interpreter<'_> {
    pub(crate) fn execute_for_each(
        &mut self,
        document: &mut RunDocument,
        step: &Step,
        spec: &ForEachSpec,
    ) -> Result<LoopResult, EngineError> {
        let items = match self.resolve_items(document, spec) {
            Ok(items) => items,
            Err(record) => return Ok(LoopResult::Failed(*record)),
        };
        let total = items.len();
        let alias = spec.alias();
        let sibling_names: Vec<&str> = spec.steps.iter().map(|s| s.name.as_str()).collect();

        let mut loop_state = document
            .for_each
            .get(&step.name)
            .cloned()
            .filter(|state| self.options.resume && state.items == items)
            .unwrap_or_else(|| ForEachState {
                items: items.clone(),
                ..ForEachState::default()
            });

        let mut escape: Option<String> = None;

        for (index, item) in items.iter().enumerate() {
            if loop_state.completed_indices.contains(&index) {
                self.logger.info(
                    "loop.resumed",
                    &format!("loop `{}` iteration {index} already complete", step.name),
                );
                continue;
            }

            loop_state.current_index = Some(index);
            self.store
                .update_for_each(document, &step.name, loop_state.clone())?;

            let mut iteration: BTreeMap<String, StepRecord> = BTreeMap::new();
            let mut unrecovered_failure = false;
            let mut inner_pc = 0usize;

            while inner_pc < spec.steps.len() {
                if self.cancel.is_cancelled() {
                    unrecovered_failure = true;
                    break;
                }
                let child = &spec.steps[inner_pc];
                let scope = self.loop_scope(document, &iteration, alias, item, index, total);

                if let Some(when) = &child.when {
                    match conditions::evaluate(when, &scope, self.workspace) {
                        Ok(true) => {}
                        Ok(false) => {
                            iteration.insert(child.name.clone(), StepRecord::skipped());
                            self.store.update_loop_iteration(
                                document,
                                &step.name,
                                index,
                                iteration.clone(),
                            )?;
                            inner_pc += 1;
                            continue;
                        }
                        Err(message) => {
                            iteration.insert(
                                child.name.clone(),
                                StepRecord::failed(
                                    2,
                                    ErrorRecord::new(format!(
                                        "condition evaluation failed: {message}"
                                    )),
                                ),
                            );
                            self.store.update_loop_iteration(
                                document,
                                &step.name,
                                index,
                                iteration.clone(),
                            )?;
                            unrecovered_failure = true;
                            inner_pc += 1;
                            continue;
                        }
                    }
                }

                self.store
                    .backup_before_step(&format!("{}_{index}_{}", step.name, child.name))?;

                let record = match child.kind() {
                    Ok(StepKind::ForEach(_)) | Err(_) => StepRecord::failed(
                        2,
                        ErrorRecord::new("unsupported step kind inside for_each"),
                    ),
                    Ok(kind) => self.execute_step(child, kind, &scope),
                };
                iteration.insert(child.name.clone(), record.clone());
                self.store
                    .update_loop_iteration(document, &step.name, index, iteration.clone())?;

                if record.skipped {
                    inner_pc += 1;
                    continue;
                }

                // Child branching: sibling targets jump within the
                // iteration; anything else leaves the loop as an escape.
                let mut target: Option<&str> = None;
                if let Some(handlers) = &child.on {
                    if record.exit_code() == 0 {
                        target = handlers.success.as_ref().map(|spec| spec.goto.as_str());
                    } else {
                        target = handlers.failure.as_ref().map(|spec| spec.goto.as_str());
                    }
                    if let Some(always) = &handlers.always {
                        target = Some(always.goto.as_str());
                    }
                }
                if let Some(goto_target) = target {
                    if let Some(position) =
                        sibling_names.iter().position(|name| *name == goto_target)
                    {
                        inner_pc = position;
                        continue;
                    }
                    escape = Some(goto_target.to_string());
                    break;
                }

                if record.exit_code() != 0 {
                    unrecovered_failure = true;
                    if self.workflow.strict_flow {
                        break;
                    }
                }
                inner_pc += 1;
            }

            let escaped = escape.is_some();
            let iteration_succeeded = !escaped && !unrecovered_failure;

            if self.workflow.version >= WorkflowVersion::V1_2 {
                if let Some(lifecycle) = &spec.on_item_complete {
                    let action = if iteration_succeeded {
                        lifecycle.success.as_ref()
                    } else {
                        lifecycle.failure.as_ref()
                    };
                    if let Some(action) = action {
                        let record = self.apply_lifecycle_action(
                            &loop_state,
                            document,
                            &iteration,
                            alias,
                            item,
                            index,
                            total,
                            action,
                        );
                        loop_state.lifecycle.push(record);
                    }
                }
            }

            loop_state.completed_indices.push(index);
            loop_state.current_index = None;
            self.store
                .update_for_each(document, &step.name, loop_state.clone())?;

            if escaped {
                break;
            }
        }

        match escape {
            Some(target) => Ok(LoopResult::Escaped(target)),
            None => Ok(LoopResult::Completed),
        }
    }

    fn resolve_items(
        &self,
        document: &RunDocument,
        spec: &ForEachSpec,
    ) -> Result<Vec<Value>, Box<StepRecord>> {
        if let Some(items) = &spec.items {
            return Ok(items.clone());
        }
        let Some(pointer_raw) = &spec.items_from else {
            return Err(Box::new(StepRecord::failed(
                2,
                ErrorRecord::new("for_each requires `items` or `items_from`"),
            )));
        };
        let pointer = ItemsPointer::parse(pointer_raw).map_err(|err| {
            Box::new(StepRecord::failed(
                2,
                ErrorRecord::new(format!("invalid items_from pointer: {err}"))
                    .with_context("invalid_reference", Value::String(pointer_raw.clone())),
            ))
        })?;
        pointer.resolve(&document.steps_value()).map_err(|err| {
            Box::new(StepRecord::failed(
                2,
                ErrorRecord::new(format!("failed to resolve items_from: {err}"))
                    .with_context("invalid_reference", Value::String(pointer_raw.clone())),
            ))
        })
    }

    /// Child scope: the parent scope extended with the loop namespace, the
    /// item alias, and a `steps` view restricted to this iteration.
    fn loop_scope(
        &self,
        document: &RunDocument,
        iteration: &BTreeMap<String, StepRecord>,
        alias: &str,
        item: &Value,
        index: usize,
        total: usize,
    ) -> Scope {
        let iteration_steps =
            serde_json::to_value(iteration).unwrap_or(Value::Object(Map::new()));
        let mut scope = Scope::new()
            .with_run(&document.run_id, &document.run_root, &document.started_at)
            .with_context(document.context.clone())
            .with_steps(iteration_steps)
            .with_loop(index, total)
            .with_alias("item", item.clone());
        if alias != "item" {
            scope = scope.with_alias(alias, item.clone());
        }
        scope
    }

    /// v1.2 per-item lifecycle: relocate the originating task file. Missing
    /// sources record an error without changing the iteration outcome;
    /// already-applied actions are never repeated on resume.
    #[allow(clippy::too_many_arguments)]
    fn apply_lifecycle_action(
        &mut self,
        loop_state: &ForEachState,
        document: &RunDocument,
        iteration: &BTreeMap<String, StepRecord>,
        alias: &str,
        item: &Value,
        index: usize,
        total: usize,
        action: &LifecycleAction,
    ) -> LifecycleRecord {
        if loop_state.lifecycle_applied(index) {
            return LifecycleRecord {
                index,
                action_applied: true,
                ..LifecycleRecord::default()
            };
        }

        let mut record = LifecycleRecord {
            index,
            action_applied: false,
            ..LifecycleRecord::default()
        };

        let Value::String(source_rel) = item else {
            record.error = Some("lifecycle item is not a file path".to_string());
            return record;
        };
        record.from = Some(source_rel.clone());

        let scope = self.loop_scope(document, iteration, alias, item, index, total);
        let destination_dir = match substitute_required(&action.move_to, &scope) {
            Ok(dir) => dir,
            Err(keys) => {
                record.error = Some(format!(
                    "undefined variables in move_to: {}",
                    keys.join(", ")
                ));
                return record;
            }
        };

        let source_abs = match self.workspace.resolve(source_rel) {
            Ok(path) => path,
            Err(err) => {
                record.error = Some(format!("unsafe lifecycle source: {err}"));
                return record;
            }
        };
        let dest_dir_abs = match self.workspace.resolve(&destination_dir) {
            Ok(path) => path,
            Err(err) => {
                record.error = Some(format!("unsafe move_to destination: {err}"));
                return record;
            }
        };

        if !source_abs.is_file() {
            record.error = Some(format!("lifecycle source not found: {source_rel}"));
            return record;
        }
        let Some(file_name) = source_abs.file_name() else {
            record.error = Some(format!("lifecycle source has no file name: {source_rel}"));
            return record;
        };

        if let Err(err) = std::fs::create_dir_all(&dest_dir_abs) {
            record.error = Some(format!("failed to create {destination_dir}: {err}"));
            return record;
        }
        let dest_abs = dest_dir_abs.join(file_name);
        match std::fs::rename(&source_abs, &dest_abs) {
            Ok(()) => {
                record.action_applied = true;
                record.to = Some(self.workspace.relative_display(&dest_abs));
                self.logger.info(
                    "loop.lifecycle",
                    &format!("moved {source_rel} to {destination_dir}"),
                );
            }
            Err(err) => {
                record.error = Some(format!("failed to move {source_rel}: {err}"));
            }
        }
        record
    }
}

