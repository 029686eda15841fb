use std::path::{Path, PathBuf};

use crate::event::{BuildEvent, EventKind, Value};
use crate::history::{RunHistory, RunRecord, StepRecord};
use crate::result::LaunchResult;

use super::{Reporter, ReporterError};

/// Appends a record of each run to the history file when the run finishes.
pub struct HistoryReporter {
    storage_path: PathBuf,
    max_runs: usize,
    record: Option<RunRecord>,
}

impl HistoryReporter {
    pub fn new(storage_path: PathBuf, max_runs: usize) -> Self {
        Self {
            storage_path,
            max_runs,
            record: None,
        }
    }
}

impl Reporter for HistoryReporter {
    fn name(&self) -> &str {
        "history"
    }

    fn on_event(&mut self, event: &BuildEvent) -> Result<(), ReporterError> {
        match event.kind {
            EventKind::BeginRun => {
                let title = event.str_field("title").unwrap_or("build").to_string();
                let command = event.str_field("command").unwrap_or_default().to_string();
                let working_dir = event.str_field("working_dir").map(Path::new);
                self.record = Some(RunRecord::new(title, command).with_git_info(working_dir));
            }
            EventKind::EndStep => {
                let step = StepRecord {
                    name: event.str_field("name").unwrap_or("unnamed step").to_string(),
                    duration: event.get("duration").and_then(Value::as_f64),
                    succeeded: event.get("succeeded").and_then(Value::as_bool).unwrap_or(true),
                    status: event.str_field("status").map(str::to_string),
                };
                if let Some(record) = self.record.as_mut() {
                    record.add_step(step);
                }
            }
            EventKind::Message => {
                if let Some(record) = self.record.as_mut() {
                    match event.str_field("level") {
                        Some("error") => record.error_count += 1,
                        Some("warning") => record.warning_count += 1,
                        _ => {}
                    }
                }
            }
            EventKind::BeginStep | EventKind::EndRun | EventKind::Raw => {}
        }
        Ok(())
    }

    fn on_finish(&mut self, result: &LaunchResult) -> Result<(), ReporterError> {
        let Some(mut record) = self.record.take() else {
            tracing::warn!("run finished without a begin-run event, not recording it");
            return Ok(());
        };
        record.duration = result.duration;
        record.success = result.success;
        record.exit_code = result.exit_code;
        record.error_code = result.error_code.map(|c| c.to_string());
        record.reporter_faults = result.reporter_faults.len();

        let mut history = RunHistory::new(self.storage_path.clone(), self.max_runs)
            .map_err(|e| ReporterError::Other(format!("{:#}", e)))?;
        history
            .add_entry(record)
            .map_err(|e| ReporterError::Other(format!("{:#}", e)))?;
        Ok(())
    }
}
