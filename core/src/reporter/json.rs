use serde::Serialize;
use std::io::Write;

use crate::event::BuildEvent;
use crate::result::LaunchResult;

use super::{Reporter, ReporterError, ReporterOutput};

/// One JSON object per line, suitable for feeding back into the structured
/// event recognizer or for CI log processing.
pub struct JsonReporter {
    out: ReporterOutput,
}

#[derive(Serialize)]
struct FinishRecord<'a> {
    event: &'static str,
    #[serde(flatten)]
    result: &'a LaunchResult,
}

impl JsonReporter {
    pub fn new(out: ReporterOutput) -> Self {
        Self { out }
    }

    fn write_line<T: Serialize>(&mut self, value: &T) -> Result<(), ReporterError> {
        serde_json::to_writer(&mut self.out, value)?;
        self.out.write_all(b"\n")?;
        Ok(())
    }
}

impl Reporter for JsonReporter {
    fn name(&self) -> &str {
        "json"
    }

    fn on_event(&mut self, event: &BuildEvent) -> Result<(), ReporterError> {
        self.write_line(event)?;
        if self.out.is_stdout() {
            self.out.flush()?;
        }
        Ok(())
    }

    fn on_finish(&mut self, result: &LaunchResult) -> Result<(), ReporterError> {
        self.write_line(&FinishRecord {
            event: "finish",
            result,
        })?;
        self.out.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventKind;
    use crate::reporter::output::SharedBuffer;

    #[test]
    fn test_writes_json_lines() {
        let buffer = SharedBuffer::new();
        let mut reporter = JsonReporter::new(ReporterOutput::from_writer(buffer.clone(), "memory"));

        reporter
            .on_event(&BuildEvent::new(EventKind::BeginStep, 1).with("name", "Compile"))
            .unwrap();
        reporter
            .on_finish(&LaunchResult::runtime_failure(Some(1), None, "failed", 0.25))
            .unwrap();

        let contents = buffer.contents();
        let lines: Vec<serde_json::Value> = contents
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();

        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["event"], "begin-step");
        assert_eq!(lines[0]["name"], "Compile");
        assert_eq!(lines[1]["event"], "finish");
        assert_eq!(lines[1]["success"], false);
        assert_eq!(lines[1]["exit_code"], 1);
        assert_eq!(lines[1]["error_code"], "runtime-failure");
    }
}
