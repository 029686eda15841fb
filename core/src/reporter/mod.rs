pub mod console;
pub mod history;
pub mod json;
pub mod multiplexer;
pub mod output;
pub mod summary;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::config::Config;
use crate::event::BuildEvent;
use crate::result::LaunchResult;

pub use console::ConsoleReporter;
pub use history::HistoryReporter;
pub use json::JsonReporter;
pub use multiplexer::ReporterMultiplexer;
pub use output::ReporterOutput;
pub use summary::SummaryReporter;

#[derive(Debug, thiserror::Error)]
pub enum ReporterError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

/// A consumer of build events.
///
/// Calls arrive in event order on a single context. Errors are isolated by
/// [`ReporterMultiplexer`] and never change a run's outcome.
pub trait Reporter: Send {
    fn name(&self) -> &str;

    fn on_event(&mut self, event: &BuildEvent) -> Result<(), ReporterError>;

    fn on_finish(&mut self, result: &LaunchResult) -> Result<(), ReporterError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FaultPhase {
    Event,
    Finish,
}

/// First fault a reporter raised during one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReporterFault {
    pub reporter: String,
    pub phase: FaultPhase,
    /// Sequence number of the event being delivered, for event-phase faults.
    pub sequence: Option<u64>,
    pub message: String,
    /// Further faults from the same reporter that were not recorded.
    pub suppressed: usize,
}

impl fmt::Display for ReporterFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.phase, self.sequence) {
            (FaultPhase::Event, Some(seq)) => write!(
                f,
                "reporter '{}' failed on event #{}: {}",
                self.reporter, seq, self.message
            ),
            _ => write!(f, "reporter '{}' failed: {}", self.reporter, self.message),
        }?;
        if self.suppressed > 0 {
            write!(f, " ({} more suppressed)", self.suppressed)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReporterKind {
    Console,
    Json,
    Summary,
    History,
}

impl ReporterKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReporterKind::Console => "console",
            ReporterKind::Json => "json",
            ReporterKind::Summary => "summary",
            ReporterKind::History => "history",
        }
    }
}

/// `kind[:output]`, as given on the command line or in `[[reporters]]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReporterSpec {
    pub kind: ReporterKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

impl FromStr for ReporterSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, output) = match s.split_once(':') {
            Some((kind, output)) => (kind, Some(output.to_string())),
            None => (s, None),
        };
        let kind = match kind {
            "console" | "pretty" | "plain" => ReporterKind::Console,
            "json" | "json-stream" => ReporterKind::Json,
            "summary" => ReporterKind::Summary,
            "history" => ReporterKind::History,
            other => return Err(format!("Unknown reporter: {}", other)),
        };
        Ok(Self { kind, output })
    }
}

impl fmt::Display for ReporterSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.output {
            Some(output) => write!(f, "{}:{}", self.kind.as_str(), output),
            None => f.write_str(self.kind.as_str()),
        }
    }
}

pub fn build_reporter(spec: &ReporterSpec, config: &Config) -> anyhow::Result<Box<dyn Reporter>> {
    let output = || -> anyhow::Result<ReporterOutput> {
        let out = ReporterOutput::open(spec.output.as_deref())?;
        tracing::debug!(reporter = spec.kind.as_str(), output = out.label(), "opened reporter output");
        Ok(out)
    };

    let reporter: Box<dyn Reporter> = match spec.kind {
        ReporterKind::Console => Box::new(ConsoleReporter::new(
            output()?,
            config.display.use_colors(spec.output.as_deref()),
            config.display.show_timestamps,
        )),
        ReporterKind::Json => Box::new(JsonReporter::new(output()?)),
        ReporterKind::Summary => Box::new(SummaryReporter::new(
            output()?,
            config.display.use_colors(spec.output.as_deref()),
        )),
        ReporterKind::History => {
            let path = match &spec.output {
                Some(path) => Config::expand_path(path),
                None => config.storage_path(),
            };
            Box::new(HistoryReporter::new(path, config.history.max_runs))
        }
    };

    Ok(reporter)
}

pub fn build_reporters(
    specs: &[ReporterSpec],
    config: &Config,
) -> anyhow::Result<Vec<Box<dyn Reporter>>> {
    specs.iter().map(|spec| build_reporter(spec, config)).collect()
}
