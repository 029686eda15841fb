use std::io::Write;

use crate::event::{BuildEvent, EventKind, Value};
use crate::result::LaunchResult;

use super::{Reporter, ReporterError, ReporterOutput};

const RESET: &str = "\x1b[0m";
const DIM: &str = "\x1b[90m";
const PLAIN: &str = "\x1b[37m";
const YELLOW: &str = "\x1b[33m";
const RED: &str = "\x1b[31m";
const BOLD_RED: &str = "\x1b[31;1m";
const GREEN: &str = "\x1b[32m";
const CYAN: &str = "\x1b[36m";

/// Human-readable live output.
pub struct ConsoleReporter {
    out: ReporterOutput,
    use_colors: bool,
    show_timestamps: bool,
}

impl ConsoleReporter {
    pub fn new(out: ReporterOutput, use_colors: bool, show_timestamps: bool) -> Self {
        Self {
            out,
            use_colors,
            show_timestamps,
        }
    }

    fn paint(&self, color: &str, text: &str) -> String {
        if self.use_colors {
            format!("{}{}{}", color, text, RESET)
        } else {
            text.to_string()
        }
    }

    fn prefix(&self, event: &BuildEvent) -> String {
        if !self.show_timestamps {
            return String::new();
        }
        let stamp = format!("[{}]", event.timestamp.format("%H:%M:%S"));
        format!("{} ", self.paint(DIM, &stamp))
    }

    fn render(&self, event: &BuildEvent) -> Option<String> {
        let name = event.str_field("name").unwrap_or("step");

        let line = match event.kind {
            EventKind::BeginRun => {
                let title = event.str_field("title").unwrap_or("build");
                let header = match event.str_field("command").filter(|c| !c.is_empty()) {
                    Some(command) => format!("=== {} {} ===", title, command),
                    None => format!("=== {} ===", title),
                };
                self.paint(CYAN, &header)
            }
            EventKind::EndRun => {
                let success = event.get("success").and_then(Value::as_bool).unwrap_or(false);
                if success {
                    self.paint(GREEN, "** RUN SUCCEEDED **")
                } else {
                    let reason = event.str_field("error_message").unwrap_or("unknown error");
                    let first = reason.lines().next().unwrap_or(reason);
                    self.paint(BOLD_RED, &format!("** RUN FAILED ** {}", first))
                }
            }
            EventKind::BeginStep => format!("{} {}", self.paint(CYAN, "▶"), name),
            EventKind::EndStep => {
                let succeeded = event.get("succeeded").and_then(Value::as_bool).unwrap_or(true);
                let duration = event
                    .get("duration")
                    .and_then(Value::as_f64)
                    .map(|d| format!(" ({:.2}s)", d))
                    .unwrap_or_default();
                if succeeded {
                    format!("{} {}{}", self.paint(GREEN, "✓"), name, duration)
                } else {
                    let status = event.str_field("status").unwrap_or("failed");
                    format!("{} {} {}{}", self.paint(RED, "✗"), name, status, duration)
                }
            }
            EventKind::Message => {
                let text = event.str_field("text").unwrap_or_default();
                let color = match event.str_field("level") {
                    Some("error") => RED,
                    Some("warning") => YELLOW,
                    Some("note") => DIM,
                    _ => PLAIN,
                };
                match location(event) {
                    Some(loc) if self.use_colors => {
                        format!("{} {}", self.paint(color, text), self.paint(CYAN, &loc))
                    }
                    _ => self.paint(color, text),
                }
            }
            EventKind::Raw => return None,
        };

        Some(format!("{}{}", self.prefix(event), line))
    }
}

fn location(event: &BuildEvent) -> Option<String> {
    let file = event.str_field("file")?;
    let mut loc = file.to_string();
    if let Some(line) = event.get("line").and_then(Value::as_i64) {
        loc.push(':');
        loc.push_str(&line.to_string());
        if let Some(col) = event.get("column").and_then(Value::as_i64) {
            loc.push(':');
            loc.push_str(&col.to_string());
        }
    }
    Some(loc)
}

impl Reporter for ConsoleReporter {
    fn name(&self) -> &str {
        "console"
    }

    fn on_event(&mut self, event: &BuildEvent) -> Result<(), ReporterError> {
        if let Some(line) = self.render(event) {
            writeln!(self.out, "{}", line)?;
            self.out.flush()?;
        }
        Ok(())
    }

    fn on_finish(&mut self, result: &LaunchResult) -> Result<(), ReporterError> {
        for fault in &result.reporter_faults {
            writeln!(self.out, "{}", self.paint(YELLOW, &format!("warning: {}", fault)))?;
        }
        self.out.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reporter::output::SharedBuffer;

    fn reporter() -> (ConsoleReporter, SharedBuffer) {
        let buffer = SharedBuffer::new();
        let out = ReporterOutput::from_writer(buffer.clone(), "memory");
        (ConsoleReporter::new(out, false, false), buffer)
    }

    #[test]
    fn test_plain_rendering() {
        let (mut console, buffer) = reporter();

        console
            .on_event(&BuildEvent::new(EventKind::BeginStep, 1).with("name", "Compile"))
            .unwrap();
        console
            .on_event(
                &BuildEvent::new(EventKind::EndStep, 2)
                    .with("name", "Compile")
                    .with("succeeded", false)
                    .with("status", "FAILED")
                    .with("duration", 0.5),
            )
            .unwrap();
        console
            .on_event(&BuildEvent::new(EventKind::Message, 3).with("text", "hello"))
            .unwrap();
        console
            .on_event(&BuildEvent::new(EventKind::Raw, 4).with("event", "x"))
            .unwrap();

        assert_eq!(
            buffer.contents(),
            "▶ Compile\n✗ Compile FAILED (0.50s)\nhello\n"
        );
    }

    #[test]
    fn test_failed_run_shows_first_error_line() {
        let (mut console, buffer) = reporter();
        console
            .on_event(
                &BuildEvent::new(EventKind::EndRun, 9)
                    .with("success", false)
                    .with("error_message", "tool exited with code 1:\nmore"),
            )
            .unwrap();

        assert_eq!(buffer.contents(), "** RUN FAILED ** tool exited with code 1:\n");
    }

    #[test]
    fn test_location() {
        let event = BuildEvent::new(EventKind::Message, 0)
            .with("file", "a.m")
            .with("line", 3i64)
            .with("column", 7i64);
        assert_eq!(location(&event).as_deref(), Some("a.m:3:7"));
    }
}
