use std::fmt;

use crate::event::{BuildEvent, EventKind, Sequence, Value};

use super::diagnostics;
use super::grammar::Grammar;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamSource {
    Stdout,
    Stderr,
}

impl StreamSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamSource::Stdout => "stdout",
            StreamSource::Stderr => "stderr",
        }
    }

    fn index(&self) -> usize {
        match self {
            StreamSource::Stdout => 0,
            StreamSource::Stderr => 1,
        }
    }
}

impl fmt::Display for StreamSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Incremental parser turning raw tool output into build events.
///
/// Each stream keeps its own partial-line buffer, so chunk boundaries never
/// change what gets recognized. Nothing is emitted for a line until its
/// terminator has been seen, it grows past [`MAX_LINE_BYTES`], or
/// [`EventParser::finish`] is called. Message events carry the stripped
/// `text` and the decoded `raw` line.
pub struct EventParser {
    grammar: Grammar,
    sequence: Sequence,
    pending: [LineBuffer; 2],
    max_line: usize,
    finished: bool,
}

/// Longest partial line held before it is emitted without a terminator.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Unterminated bytes of one stream. `scanned` bytes are known to hold no
/// newline.
#[derive(Default)]
struct LineBuffer {
    bytes: Vec<u8>,
    scanned: usize,
}

impl LineBuffer {
    /// Appends `chunk` and splits off every complete line, cutting lines
    /// longer than `max_line` into `max_line`-sized pieces.
    fn push(&mut self, chunk: &[u8], max_line: usize) -> Vec<String> {
        self.bytes.extend_from_slice(chunk);

        let mut lines = Vec::new();
        let mut start = 0;
        loop {
            let from = start.max(self.scanned);
            match self.bytes[from..].iter().position(|&b| b == b'\n') {
                Some(offset) => {
                    let end = from + offset;
                    while end - start > max_line {
                        lines.push(decode_line(&self.bytes[start..start + max_line]));
                        start += max_line;
                    }
                    lines.push(decode_line(&self.bytes[start..end]));
                    start = end + 1;
                }
                None => {
                    while self.bytes.len() - start > max_line {
                        lines.push(decode_line(&self.bytes[start..start + max_line]));
                        start += max_line;
                    }
                    break;
                }
            }
        }

        if start > 0 {
            self.bytes.drain(..start);
        }
        self.scanned = self.bytes.len();
        lines
    }

    fn take(&mut self) -> Vec<u8> {
        self.scanned = 0;
        std::mem::take(&mut self.bytes)
    }
}

impl EventParser {
    pub fn new(grammar: Grammar) -> Self {
        Self::with_sequence(grammar, Sequence::new())
    }

    pub fn with_sequence(grammar: Grammar, sequence: Sequence) -> Self {
        Self {
            grammar,
            sequence,
            pending: [LineBuffer::default(), LineBuffer::default()],
            max_line: MAX_LINE_BYTES,
            finished: false,
        }
    }

    pub fn sequence(&self) -> &Sequence {
        &self.sequence
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn feed(&mut self, source: StreamSource, chunk: &[u8]) -> Vec<BuildEvent> {
        if self.finished {
            tracing::warn!(
                stream = source.as_str(),
                bytes = chunk.len(),
                "ignoring output fed after end of stream"
            );
            return Vec::new();
        }

        let lines = self.pending[source.index()].push(chunk, self.max_line);
        lines
            .iter()
            .map(|line| self.recognize(source, line))
            .collect()
    }

    pub fn feed_str(&mut self, source: StreamSource, text: &str) -> Vec<BuildEvent> {
        self.feed(source, text.as_bytes())
    }

    /// Flushes unterminated trailing content and marks the stream terminal.
    pub fn finish(&mut self) -> Vec<BuildEvent> {
        if self.finished {
            return Vec::new();
        }

        let mut events = Vec::new();
        for source in [StreamSource::Stdout, StreamSource::Stderr] {
            let rest = self.pending[source.index()].take();
            if !rest.is_empty() {
                let line = decode_line(&rest);
                events.push(self.recognize(source, &line));
            }
        }
        self.finished = true;
        events
    }

    fn recognize(&self, source: StreamSource, line: &str) -> BuildEvent {
        let stripped = diagnostics::strip_ansi(line);

        if self.grammar.structured_events() {
            if let Some(event) = self.recognize_structured(&stripped) {
                return event;
            }
        }

        if let Some(name) = self.grammar.match_step_start(&stripped) {
            return BuildEvent::new(EventKind::BeginStep, self.sequence.next()).with("name", name);
        }

        if let Some(end) = self.grammar.match_step_end(&stripped) {
            return BuildEvent::new(EventKind::EndStep, self.sequence.next())
                .with("name", end.name)
                .with_opt("status", end.status)
                .with("succeeded", end.succeeded)
                .with_opt("duration", end.duration);
        }

        let message = BuildEvent::new(EventKind::Message, self.sequence.next())
            .with("text", stripped.as_str())
            .with("raw", line)
            .with("stream", source.as_str());

        match diagnostics::classify(&stripped) {
            Some(diagnostic) => diagnostics::annotate(message, &diagnostic),
            None => message,
        }
    }

    fn recognize_structured(&self, line: &str) -> Option<BuildEvent> {
        let trimmed = line.trim();
        if !trimmed.starts_with('{') {
            return None;
        }

        let object = match serde_json::from_str::<serde_json::Value>(trimmed) {
            Ok(serde_json::Value::Object(object)) => object,
            _ => return None,
        };
        let name = object.get("event")?.as_str()?;

        let kind = match name {
            "begin-step" => EventKind::BeginStep,
            "end-step" => EventKind::EndStep,
            "message" => EventKind::Message,
            _ => EventKind::Raw,
        };

        let mut event = BuildEvent::new(kind, self.sequence.next());
        for (key, value) in &object {
            if key == "seq" || key == "timestamp" {
                continue;
            }
            if key == "event" && kind != EventKind::Raw {
                continue;
            }
            event.payload.insert(key.clone(), Value::from_json(value));
        }

        if kind == EventKind::EndStep && !event.payload.contains_key("succeeded") {
            let succeeded = self.grammar.is_success_status(event.str_field("status"));
            event = event.with("succeeded", succeeded);
        }

        Some(event)
    }
}

fn decode_line(bytes: &[u8]) -> String {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}
