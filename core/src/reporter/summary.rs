use std::io::Write;

use crate::event::{BuildEvent, EventKind, Value};
use crate::result::LaunchResult;

use super::{Reporter, ReporterError, ReporterOutput};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunTally {
    pub steps_started: usize,
    pub steps_finished: usize,
    pub failed_steps: Vec<String>,
    pub errors: usize,
    pub warnings: usize,
    pub messages: usize,
    pub step_seconds: f64,
}

impl RunTally {
    pub fn record(&mut self, event: &BuildEvent) {
        match event.kind {
            EventKind::BeginStep => self.steps_started += 1,
            EventKind::EndStep => {
                self.steps_finished += 1;
                if let Some(d) = event.get("duration").and_then(Value::as_f64) {
                    self.step_seconds += d;
                }
                let succeeded = event.get("succeeded").and_then(Value::as_bool).unwrap_or(true);
                if !succeeded {
                    let name = event.str_field("name").unwrap_or("unnamed step");
                    self.failed_steps.push(name.to_string());
                }
            }
            EventKind::Message => {
                self.messages += 1;
                match event.str_field("level") {
                    Some("error") => self.errors += 1,
                    Some("warning") => self.warnings += 1,
                    _ => {}
                }
            }
            EventKind::BeginRun | EventKind::EndRun | EventKind::Raw => {}
        }
    }
}

/// Prints one verdict block once the run is over.
pub struct SummaryReporter {
    out: ReporterOutput,
    use_colors: bool,
    title: Option<String>,
    tally: RunTally,
}

impl SummaryReporter {
    pub fn new(out: ReporterOutput, use_colors: bool) -> Self {
        Self {
            out,
            use_colors,
            title: None,
            tally: RunTally::default(),
        }
    }

    fn verdict(&self, result: &LaunchResult) -> String {
        let (color, text) = if result.success {
            ("\x1b[32;1m", "** BUILD SUCCEEDED **")
        } else {
            ("\x1b[31;1m", "** BUILD FAILED **")
        };
        if self.use_colors {
            format!("{}{}\x1b[0m", color, text)
        } else {
            text.to_string()
        }
    }
}

impl Reporter for SummaryReporter {
    fn name(&self) -> &str {
        "summary"
    }

    fn on_event(&mut self, event: &BuildEvent) -> Result<(), ReporterError> {
        if event.kind == EventKind::BeginRun {
            self.title = event.str_field("title").map(str::to_string);
        }
        self.tally.record(event);
        Ok(())
    }

    fn on_finish(&mut self, result: &LaunchResult) -> Result<(), ReporterError> {
        let verdict = self.verdict(result);
        let tally = &self.tally;
        let title = self.title.as_deref().unwrap_or("build");

        writeln!(self.out)?;
        writeln!(
            self.out,
            "{} {} ({:.2}s)",
            verdict,
            title,
            result.duration
        )?;
        writeln!(
            self.out,
            "  {} steps ({:.2}s), {} failed, {} errors, {} warnings, {} lines",
            tally.steps_finished,
            tally.step_seconds,
            tally.failed_steps.len(),
            tally.errors,
            tally.warnings,
            tally.messages
        )?;
        for step in &tally.failed_steps {
            writeln!(self.out, "  failed: {}", step)?;
        }
        if let Some(code) = result.exit_code.filter(|c| *c != 0) {
            writeln!(self.out, "  exit code: {}", code)?;
        }
        if let (false, Some(message)) = (result.success, result.error_message.as_deref()) {
            for line in message.lines() {
                writeln!(self.out, "  {}", line)?;
            }
        }
        self.out.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reporter::output::SharedBuffer;

    #[test]
    fn test_tally_counts() {
        let mut tally = RunTally::default();
        tally.record(&BuildEvent::new(EventKind::BeginStep, 0).with("name", "A"));
        tally.record(
            &BuildEvent::new(EventKind::EndStep, 1)
                .with("name", "A")
                .with("succeeded", false)
                .with("duration", 1.5),
        );
        tally.record(&BuildEvent::new(EventKind::Message, 2).with("level", "warning"));
        tally.record(&BuildEvent::new(EventKind::Message, 3).with("level", "error"));
        tally.record(&BuildEvent::new(EventKind::Message, 4).with("text", "plain"));

        assert_eq!(tally.steps_started, 1);
        assert_eq!(tally.failed_steps, vec!["A".to_string()]);
        assert_eq!(tally.errors, 1);
        assert_eq!(tally.warnings, 1);
        assert_eq!(tally.messages, 3);
        assert_eq!(tally.step_seconds, 1.5);
    }

    #[test]
    fn test_summary_output() {
        let buffer = SharedBuffer::new();
        let mut reporter = SummaryReporter::new(ReporterOutput::from_writer(buffer.clone(), "memory"), false);

        reporter
            .on_event(&BuildEvent::new(EventKind::BeginRun, 0).with("title", "App"))
            .unwrap();
        reporter
            .on_finish(&LaunchResult::runtime_failure(Some(65), None, "xcodebuild exited with code 65", 2.0))
            .unwrap();

        let contents = buffer.contents();
        assert!(contents.contains("** BUILD FAILED ** App (2.00s)"));
        assert!(contents.contains("0 steps (0.00s), 0 failed, 0 errors, 0 warnings, 0 lines"));
        assert!(contents.contains("exit code: 65"));
        assert!(contents.contains("xcodebuild exited with code 65"));
    }
}
