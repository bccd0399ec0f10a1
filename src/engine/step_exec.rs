use super::{value_to_map, Interpreter};
use crate::deps::{injector, resolver};
use crate::exec::capture::{capture, tail_lines, CaptureRequest};
use crate::exec::retry::RetryPolicy;
use crate::exec::runner::{run_child, split_command_line, RawExecution, SpawnSpec};
use crate::exec::wait;
use crate::provider::{build_invocation, merge_params, InvocationError};
use crate::shared::ids::now_utc_rfc3339;
use crate::state::{ErrorRecord, StepRecord, StepStatus};
use crate::vars::{substitute_required, substitute_value, Scope};
use crate::workflow::{CommandSpec, Step, StepKind, WaitForSpec};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

impl Interpreter<'_> {
    pub(crate) fn execute_step(
        &mut self,
        step: &Step,
        kind: StepKind<'_>,
        scope: &Scope,
    ) -> StepRecord {
        let started_at = now_utc_rfc3339();
        let mut record = match kind {
            StepKind::Command(command) => self.run_command_step(step, command, scope),
            StepKind::Provider(provider) => self.run_provider_step(step, provider, scope),
            StepKind::Wait(wait_spec) => self.run_wait_step(step, wait_spec, scope),
            StepKind::ForEach(_) => StepRecord::failed(
                2,
                ErrorRecord::new("for_each steps are dispatched by the loop engine"),
            ),
        };
        record.started_at = Some(started_at);
        record.completed_at = Some(now_utc_rfc3339());
        record
    }

    fn run_command_step(
        &mut self,
        step: &Step,
        command: &CommandSpec,
        scope: &Scope,
    ) -> StepRecord {
        if let Some(record) = self.validate_dependencies(step, scope) {
            return record;
        }

        let argv = match substitute_command(command, scope) {
            Ok(argv) => argv,
            Err(record) => return *record,
        };

        let overlay = match self.resolve_step_env(step) {
            Ok(overlay) => overlay,
            Err(record) => return *record,
        };

        let output_file = match self.resolve_output_file(step, scope) {
            Ok(path) => path,
            Err(record) => return *record,
        };
        let stdin = self.read_input_file(step, scope);

        let policy = RetryPolicy::for_command(step.retries.as_ref());
        self.attempt_loop(step, argv, overlay, stdin, output_file, policy, None)
    }

    fn run_provider_step(
        &mut self,
        step: &Step,
        provider_name: &str,
        scope: &Scope,
    ) -> StepRecord {
        let Some(template) = self.registry.get(provider_name).cloned() else {
            return StepRecord::failed(
                2,
                ErrorRecord::new(format!("provider `{provider_name}` is not defined"))
                    .with_context("provider", Value::String(provider_name.to_string())),
            );
        };

        let resolution = match &step.depends_on {
            None => None,
            Some(depends_on) => match resolver::resolve(self.workspace, depends_on, scope) {
                Ok(resolution) => {
                    if !resolution.is_satisfied() {
                        return failed_deps_record(&resolution.missing_required);
                    }
                    Some(resolution)
                }
                Err(err) => return resolve_error_record(err),
            },
        };

        // input_file contents are read byte for byte; variables inside the
        // file are never substituted.
        let mut prompt = String::new();
        if let Some(input_file) = &step.input_file {
            match self.read_workspace_text(input_file, scope) {
                Ok(Some(contents)) => prompt = contents,
                Ok(None) => {}
                Err(record) => return *record,
            }
        }

        let mut debug = Map::new();
        if let (Some(depends_on), Some(resolution)) = (&step.depends_on, &resolution) {
            if let Some(inject) = &depends_on.inject {
                if inject.is_active() {
                    let outcome = injector::compose(
                        self.workspace,
                        &prompt,
                        &resolution.required,
                        &resolution.optional,
                        &inject.config(),
                    );
                    prompt = outcome.prompt;
                    if let Some(details) = outcome.truncation {
                        debug.insert(
                            "injection".to_string(),
                            json!({
                                "truncation_details": serde_json::to_value(details)
                                    .unwrap_or(Value::Null)
                            }),
                        );
                    }
                }
            }
        }

        let overlay = match self.resolve_step_env(step) {
            Ok(overlay) => overlay,
            Err(record) => return *record,
        };

        if self.options.debug && !prompt.is_empty() {
            self.write_prompt_audit(&step.name, &prompt);
        }

        let merged = merge_params(&template, step.provider_params.as_ref());
        let (params_value, unresolved) =
            substitute_value(&Value::Object(merged), scope);
        if !unresolved.is_empty() {
            let mut keys = unresolved;
            keys.sort();
            keys.dedup();
            return StepRecord::failed(
                2,
                ErrorRecord::new(format!(
                    "undefined variables in provider_params: {}",
                    keys.join(", ")
                ))
                .with_context("undefined_vars", Value::from(keys)),
            );
        }
        let params = value_to_map(params_value);

        let invocation = match build_invocation(&template, &params, scope, &prompt) {
            Ok(invocation) => invocation,
            Err(InvocationError::MissingPlaceholders { keys }) => {
                return StepRecord::failed(
                    2,
                    ErrorRecord::new(format!(
                        "unresolved placeholders in provider template: {}",
                        keys.join(", ")
                    ))
                    .with_context("missing_placeholders", Value::from(keys)),
                )
            }
            Err(InvocationError::PromptInStdinTemplate) => {
                return StepRecord::failed(
                    2,
                    ErrorRecord::new("${PROMPT} is not allowed in a stdin-mode provider template")
                        .with_context("invalid_prompt_placeholder", Value::Bool(true)),
                )
            }
        };

        let output_file = match self.resolve_output_file(step, scope) {
            Ok(path) => path,
            Err(record) => return *record,
        };

        let policy = RetryPolicy::for_provider_step(
            step.retries.as_ref(),
            self.options.max_retries,
            self.options.retry_delay_ms,
        );
        let stdin = invocation
            .stdin_prompt
            .as_ref()
            .map(|prompt| prompt.clone().into_bytes());
        let debug = (!debug.is_empty()).then_some(debug);
        self.attempt_loop(step, invocation.argv, overlay, stdin, output_file, policy, debug)
    }

    fn run_wait_step(&mut self, step: &Step, spec: &WaitForSpec, scope: &Scope) -> StepRecord {
        let pattern = match substitute_required(&spec.glob, scope) {
            Ok(pattern) => pattern,
            Err(keys) => return undefined_vars_record("wait_for.glob", keys),
        };
        let outcome = wait::wait_for_matches(
            self.workspace,
            &pattern,
            Duration::from_secs(spec.timeout_sec),
            Duration::from_millis(spec.poll_ms),
            spec.min_count,
            &self.cancel,
        );
        StepRecord {
            status: if outcome.exit_code == 0 {
                StepStatus::Completed
            } else {
                StepStatus::Failed
            },
            exit_code: Some(outcome.exit_code),
            duration_ms: Some(outcome.wait_duration_ms),
            files: Some(outcome.files),
            wait_duration_ms: Some(outcome.wait_duration_ms),
            poll_count: Some(outcome.poll_count),
            timed_out: Some(outcome.timed_out),
            error: outcome.error,
            ..StepRecord::default()
        }
    }

    /// Serial attempt loop shared by command and provider steps. Each attempt
    /// spawns one child, captures its streams, and either returns the built
    /// record or sleeps and retries per policy.
    #[allow(clippy::too_many_arguments)]
    fn attempt_loop(
        &mut self,
        step: &Step,
        argv: Vec<String>,
        overlay: BTreeMap<String, String>,
        stdin: Option<Vec<u8>>,
        output_file: Option<PathBuf>,
        policy: RetryPolicy,
        base_debug: Option<Map<String, Value>>,
    ) -> StepRecord {
        let mut attempts: Vec<Value> = Vec::new();
        let mut attempt = 0u32;

        loop {
            let spec = SpawnSpec {
                argv: argv.clone(),
                cwd: self.workspace.root().to_path_buf(),
                env_overlay: overlay.clone(),
                stdin: stdin.clone(),
                timeout: step.timeout_sec.map(Duration::from_secs),
            };
            let raw = match run_child(&spec, &self.cancel) {
                Ok(raw) => raw,
                Err(err) => {
                    return StepRecord::failed(
                        1,
                        ErrorRecord::new(err.to_string())
                            .with_context("kind", Value::String("execution".to_string())),
                    )
                }
            };

            let request = CaptureRequest {
                step_name: &step.name,
                mode: step.output_capture,
                output_file: output_file.as_deref(),
                allow_parse_error: step.allow_parse_error,
                logs_dir: self.store.logs_dir(),
                output_schema: step.output_schema.as_ref(),
                output_require: step.output_require.as_deref(),
            };
            let captured = match capture(&request, &raw.stdout, &raw.stderr) {
                Ok(captured) => captured,
                Err(err) => {
                    return StepRecord::failed(
                        1,
                        ErrorRecord::new(format!("output capture failed: {err}")),
                    )
                }
            };

            let exit_code = captured.exit_code_override.unwrap_or(raw.exit_code);
            attempts.push(json!({
                "exit_code": exit_code,
                "duration_ms": raw.duration_ms,
            }));

            if policy.should_retry(exit_code, attempt) && !raw.cancelled {
                self.logger.warn(
                    "step.retry",
                    &format!(
                        "step `{}` attempt {} exited {exit_code}; retrying",
                        step.name,
                        attempt + 1
                    ),
                );
                if !policy.wait(&self.cancel) {
                    // Cancellation during the retry sleep ends the step.
                    return self.build_record(
                        step,
                        raw,
                        captured,
                        124,
                        attempts,
                        base_debug,
                        true,
                    );
                }
                attempt += 1;
                continue;
            }

            let cancelled = raw.cancelled;
            return self.build_record(
                step,
                raw,
                captured,
                exit_code,
                attempts,
                base_debug,
                cancelled,
            );
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn build_record(
        &mut self,
        step: &Step,
        raw: RawExecution,
        captured: crate::exec::capture::Captured,
        exit_code: i32,
        attempts: Vec<Value>,
        base_debug: Option<Map<String, Value>>,
        cancelled: bool,
    ) -> StepRecord {
        // A step is successful iff it exited 0 and was not cancelled.
        let succeeded = exit_code == 0 && !cancelled;

        let mut error = captured.error.clone();
        if error.is_none() && !succeeded {
            let message = if raw.timed_out {
                format!(
                    "timed out after {} second(s)",
                    step.timeout_sec.unwrap_or_default()
                )
            } else if cancelled {
                "cancelled by operator".to_string()
            } else {
                format!("exited with code {exit_code}")
            };
            let mut record = ErrorRecord::new(message);
            if raw.timed_out {
                record = record.with_context("timed_out", Value::Bool(true));
            }
            error = Some(record);
        }
        if let Some(error) = error.as_mut() {
            error.stdout_tail = tail_lines(&raw.stdout)
                .map(|lines| self.secrets.mask_lines(&lines));
            error.stderr_tail = tail_lines(&raw.stderr)
                .map(|lines| self.secrets.mask_lines(&lines));
            error.message = self.secrets.mask_text(&error.message);
        }

        let mut debug = base_debug.unwrap_or_default();
        if let Some(captured_debug) = captured.debug {
            debug.extend(captured_debug);
        }
        if attempts.len() > 1 {
            debug.insert("attempts".to_string(), Value::Array(attempts));
        }

        StepRecord {
            status: if succeeded {
                StepStatus::Completed
            } else {
                StepStatus::Failed
            },
            exit_code: Some(exit_code),
            duration_ms: Some(raw.duration_ms),
            output: captured
                .output
                .map(|output| self.secrets.mask_text(&output)),
            lines: captured.lines.map(|lines| self.secrets.mask_lines(&lines)),
            json: captured.json.map(|json| self.secrets.mask_value(&json)),
            truncated: captured.truncated,
            error,
            debug: (!debug.is_empty()).then_some(debug),
            ..StepRecord::default()
        }
    }

    fn validate_dependencies(&mut self, step: &Step, scope: &Scope) -> Option<StepRecord> {
        let depends_on = step.depends_on.as_ref()?;
        match resolver::resolve(self.workspace, depends_on, scope) {
            Ok(resolution) if resolution.is_satisfied() => None,
            Ok(resolution) => Some(failed_deps_record(&resolution.missing_required)),
            Err(err) => Some(resolve_error_record(err)),
        }
    }

    /// Child environment: inherited orchestrator env, overlaid with declared
    /// secret values, overlaid with step `env` (step wins).
    fn resolve_step_env(
        &mut self,
        step: &Step,
    ) -> Result<BTreeMap<String, String>, Box<StepRecord>> {
        let mut declared = self.workflow.secrets.clone();
        declared.extend(step.secrets.iter().cloned());
        let context = self.secrets.resolve(&declared, &step.env);
        if context.missing.is_empty() {
            return Ok(context.overlay);
        }
        Err(Box::new(StepRecord::failed(
            2,
            ErrorRecord::new(format!(
                "missing required secrets: {}",
                context.missing.join(", ")
            ))
            .with_context("missing_secrets", Value::from(context.missing)),
        )))
    }

    fn resolve_output_file(
        &mut self,
        step: &Step,
        scope: &Scope,
    ) -> Result<Option<PathBuf>, Box<StepRecord>> {
        let Some(output_file) = &step.output_file else {
            return Ok(None);
        };
        let substituted = substitute_required(output_file, scope)
            .map_err(|keys| Box::new(undefined_vars_record("output_file", keys)))?;
        let absolute = self.workspace.resolve(&substituted).map_err(|err| {
            Box::new(StepRecord::failed(
                2,
                ErrorRecord::new(format!("unsafe output_file: {err}"))
                    .with_context("output_file", Value::String(substituted.clone())),
            ))
        })?;
        Ok(Some(absolute))
    }

    fn read_input_file(&mut self, step: &Step, scope: &Scope) -> Option<Vec<u8>> {
        let input_file = step.input_file.as_ref()?;
        let substituted = substitute_required(input_file, scope).ok()?;
        let absolute = self.workspace.resolve(&substituted).ok()?;
        std::fs::read(absolute).ok()
    }

    fn read_workspace_text(
        &mut self,
        raw_path: &str,
        scope: &Scope,
    ) -> Result<Option<String>, Box<StepRecord>> {
        let substituted = substitute_required(raw_path, scope)
            .map_err(|keys| Box::new(undefined_vars_record("input_file", keys)))?;
        let absolute = self.workspace.resolve(&substituted).map_err(|err| {
            Box::new(StepRecord::failed(
                2,
                ErrorRecord::new(format!("unsafe input_file: {err}"))
                    .with_context("input_file", Value::String(substituted.clone())),
            ))
        })?;
        if !absolute.is_file() {
            return Ok(None);
        }
        match std::fs::read_to_string(&absolute) {
            Ok(contents) => Ok(Some(contents)),
            Err(err) => Err(Box::new(StepRecord::failed(
                1,
                ErrorRecord::new(format!("failed to read input_file: {err}")),
            ))),
        }
    }

    /// Debug-mode audit of the composed prompt, with known secret values
    /// masked before anything touches disk.
    fn write_prompt_audit(&self, step_name: &str, prompt: &str) {
        let masked = self.secrets.mask_text(prompt);
        let path = self.store.logs_dir().join(format!("{step_name}.prompt.txt"));
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let _ = std::fs::write(path, masked);
    }
}

fn substitute_command(
    command: &CommandSpec,
    scope: &Scope,
) -> Result<Vec<String>, Box<StepRecord>> {
    match command {
        CommandSpec::Line(line) => {
            let substituted = substitute_required(line, scope)
                .map_err(|keys| Box::new(undefined_vars_record("command", keys)))?;
            split_command_line(&substituted).map_err(|err| {
                Box::new(StepRecord::failed(
                    2,
                    ErrorRecord::new(format!("invalid command line: {err}")),
                ))
            })
        }
        CommandSpec::Argv(tokens) => {
            let mut argv = Vec::with_capacity(tokens.len());
            let mut missing = Vec::new();
            for token in tokens {
                match substitute_required(token, scope) {
                    Ok(substituted) => argv.push(substituted),
                    Err(keys) => missing.extend(keys),
                }
            }
            if !missing.is_empty() {
                missing.sort();
                missing.dedup();
                return Err(Box::new(undefined_vars_record("command", missing)));
            }
            if argv.is_empty() {
                return Err(Box::new(StepRecord::failed(
                    2,
                    ErrorRecord::new("command is empty"),
                )));
            }
            Ok(argv)
        }
    }
}

fn undefined_vars_record(field: &str, keys: Vec<String>) -> StepRecord {
    StepRecord::failed(
        2,
        ErrorRecord::new(format!(
            "undefined variables in {field}: {}",
            keys.join(", ")
        ))
        .with_context("undefined_vars", Value::from(keys)),
    )
}

fn failed_deps_record(missing: &[String]) -> StepRecord {
    StepRecord::failed(
        2,
        ErrorRecord::new(format!(
            "required dependencies matched nothing: {}",
            missing.join(", ")
        ))
        .with_context("failed_deps", Value::from(missing.to_vec())),
    )
}

fn resolve_error_record(err: resolver::ResolveError) -> StepRecord {
    let record = ErrorRecord::new(err.to_string());
    let record = match &err {
        resolver::ResolveError::UndefinedVars { vars, .. } => {
            record.with_context("undefined_vars", Value::from(vars.clone()))
        }
        resolver::ResolveError::Unsafe { pattern, .. }
        | resolver::ResolveError::Pattern { pattern, .. } => {
            record.with_context("pattern", Value::String(pattern.clone()))
        }
    };
    StepRecord::failed(2, record)
}

