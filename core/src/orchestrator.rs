use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::{Config, ToolConfig};
use crate::environment::{Environment, SystemEnvironment, DEVELOPER_DIR_VAR};
use crate::event::{BuildEvent, EventKind, Sequence};
use crate::launcher::{self, LaunchOptions};
use crate::parser::{Grammar, GrammarError};
use crate::reporter::{Reporter, ReporterMultiplexer};
use crate::result::LaunchResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Launching,
    Running,
    Finished,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunState::Idle => "idle",
            RunState::Launching => "launching",
            RunState::Running => "running",
            RunState::Finished => "finished",
        };
        f.write_str(name)
    }
}

/// One invocation of the build tool, bracketed by synthetic begin-run and
/// end-run events.
///
/// A `BuildRun` owns its reporters and is consumed by [`BuildRun::run`];
/// concurrent runs need separate instances.
pub struct BuildRun {
    environment: Arc<dyn Environment>,
    reporters: ReporterMultiplexer,
    tool: ToolConfig,
    grammar: Grammar,
    diagnostic_tail: usize,
    working_dir: Option<PathBuf>,
    sequence: Sequence,
    state: RunState,
}

impl BuildRun {
    pub fn new(environment: Arc<dyn Environment>, reporters: Vec<Box<dyn Reporter>>) -> Self {
        Self {
            environment,
            reporters: ReporterMultiplexer::new(reporters),
            tool: ToolConfig::default(),
            grammar: Grammar::default(),
            diagnostic_tail: LaunchOptions::default().diagnostic_tail,
            working_dir: None,
            sequence: Sequence::new(),
            state: RunState::Idle,
        }
    }

    pub fn from_config(
        config: &Config,
        environment: Arc<dyn Environment>,
        reporters: Vec<Box<dyn Reporter>>,
    ) -> Result<Self, GrammarError> {
        let grammar = Grammar::from_config(&config.parser)?;
        Ok(Self::new(environment, reporters)
            .with_tool(config.tool.clone())
            .with_grammar(grammar)
            .with_diagnostic_tail(config.parser.diagnostic_tail))
    }

    pub fn with_tool(mut self, tool: ToolConfig) -> Self {
        self.tool = tool;
        self
    }

    pub fn with_grammar(mut self, grammar: Grammar) -> Self {
        self.grammar = grammar;
        self
    }

    pub fn with_diagnostic_tail(mut self, lines: usize) -> Self {
        self.diagnostic_tail = lines;
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    fn transition(&mut self, next: RunState) {
        tracing::debug!(from = %self.state, to = %next, "build run state change");
        self.state = next;
    }

    pub async fn run(mut self, arguments: &[String], command: &str, title: &str) -> LaunchResult {
        let mut full_args = self.tool.arguments.clone();
        full_args.extend(arguments.iter().cloned());
        if !command.is_empty() {
            full_args.push(command.to_string());
        }

        let executable = resolve_executable(
            self.environment.as_ref(),
            &self.tool.executable,
            self.working_dir.as_deref(),
        );
        let environment = child_environment(self.environment.as_ref(), &self.tool.env);

        self.transition(RunState::Launching);
        tracing::debug!(
            executable = %executable.display(),
            reporters = ?self.reporters.reporter_names(),
            "starting build run"
        );
        let begin = BuildEvent::new(EventKind::BeginRun, self.sequence.next())
            .with("command", command)
            .with("title", title)
            .with("executable", executable.display().to_string())
            .with("arguments", full_args.join(" "))
            .with_opt(
                "working_dir",
                self.working_dir.as_ref().map(|d| d.display().to_string()),
            );
        self.reporters.deliver(&begin);

        self.transition(RunState::Running);
        let options = LaunchOptions {
            grammar: self.grammar.clone(),
            sequence: self.sequence.clone(),
            diagnostic_tail: self.diagnostic_tail,
            working_dir: self.working_dir.clone(),
        };
        let result = launcher::launch_and_feed(
            &executable,
            &full_args,
            &environment,
            &mut self.reporters,
            options,
        )
        .await;

        let end = end_run_event(self.sequence.next(), &result, self.reporters.faults().len());
        self.reporters.deliver(&end);

        let result = result.with_reporter_faults(self.reporters.faults());
        self.reporters.finish(&result);
        self.transition(RunState::Finished);

        let result = result.with_reporter_faults(self.reporters.faults());
        if !result.success {
            tracing::info!(
                title,
                code = ?result.error_code,
                exit_code = ?result.exit_code,
                "build run failed"
            );
        }
        result
    }
}

fn end_run_event(seq: u64, result: &LaunchResult, faults: usize) -> BuildEvent {
    BuildEvent::new(EventKind::EndRun, seq)
        .with("success", result.success)
        .with_opt("exit_code", result.exit_code)
        .with_opt("signal", result.signal)
        .with_opt("error_message", result.error_message.clone())
        .with_opt("error_code", result.error_code.map(|c| c.to_string()))
        .with("duration", result.duration)
        .with("reporter_faults", faults as i64)
}

/// Runs the configured default tool (`xcodebuild`) against the host
/// environment.
pub async fn run_build(
    arguments: &[String],
    command: &str,
    title: &str,
    reporters: Vec<Box<dyn Reporter>>,
) -> LaunchResult {
    BuildRun::new(Arc::new(SystemEnvironment::new()), reporters)
        .run(arguments, command, title)
        .await
}

/// Resolves a tool name to the path that will be spawned.
///
/// Paths are used as given (relative ones against `working_dir`); bare names
/// are looked up in the toolchain's `usr/bin`, then in the environment's
/// search path.
pub fn resolve_executable(
    environment: &dyn Environment,
    name: &str,
    working_dir: Option<&Path>,
) -> PathBuf {
    let as_path = Path::new(name);
    if as_path.components().count() > 1 || as_path.is_absolute() {
        return match working_dir {
            Some(dir) if as_path.is_relative() => dir.join(as_path),
            _ => as_path.to_path_buf(),
        };
    }

    if let Ok(root) = environment.toolchain_root() {
        let candidate = root.join("usr/bin").join(name);
        if candidate.is_file() {
            return candidate;
        }
    }

    for dir in environment.search_path() {
        let candidate = dir.join(name);
        if candidate.is_file() {
            return candidate;
        }
    }

    tracing::warn!(tool = name, "tool not found in toolchain or PATH");
    as_path.to_path_buf()
}

/// The environment's base variables, plus `DEVELOPER_DIR` when the toolchain
/// is known, plus configured overrides.
pub fn child_environment(
    environment: &dyn Environment,
    overrides: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut vars = environment.base_environment();

    if !vars.contains_key(DEVELOPER_DIR_VAR) {
        if let Ok(root) = environment.toolchain_root() {
            vars.insert(DEVELOPER_DIR_VAR.to_string(), root.display().to_string());
        }
    }

    for (key, value) in overrides {
        vars.insert(key.clone(), value.clone());
    }
    vars
}
