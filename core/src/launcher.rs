use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::mpsc;

use crate::event::{BuildEvent, EventKind, Sequence};
use crate::parser::{EventParser, Grammar, StreamSource};
use crate::reporter::ReporterMultiplexer;
use crate::result::LaunchResult;

const READ_BUFFER_SIZE: usize = 8 * 1024;
const CHANNEL_CAPACITY: usize = 16;

#[derive(Debug, Clone)]
pub struct LaunchOptions {
    pub grammar: Grammar,
    pub sequence: Sequence,
    /// Number of trailing output lines kept for the failure message.
    pub diagnostic_tail: usize,
    pub working_dir: Option<PathBuf>,
}

impl Default for LaunchOptions {
    fn default() -> Self {
        Self {
            grammar: Grammar::default(),
            sequence: Sequence::new(),
            diagnostic_tail: 20,
            working_dir: None,
        }
    }
}

struct Chunk {
    source: StreamSource,
    bytes: Vec<u8>,
}

/// Runs `executable` to completion, delivering every event recognized in its
/// output to `reporters` as soon as it is recognized.
///
/// The child gets exactly `environment`, nothing inherited. Returns once the
/// process has exited and both pipes have been drained. Reporters are not
/// finished here.
pub async fn launch_and_feed(
    executable: &Path,
    arguments: &[String],
    environment: &BTreeMap<String, String>,
    reporters: &mut ReporterMultiplexer,
    options: LaunchOptions,
) -> LaunchResult {
    let start = Instant::now();
    let tool = tool_name(executable);

    let mut command = Command::new(executable);
    command
        .args(arguments)
        .env_clear()
        .envs(environment)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = &options.working_dir {
        command.current_dir(dir);
    }

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(err) => {
            tracing::error!(executable = %executable.display(), error = %err, "failed to spawn build tool");
            return LaunchResult::launch_failure(format!(
                "Failed to launch {}: {}",
                executable.display(),
                err
            ));
        }
    };
    tracing::debug!(pid = child.id(), tool = %tool, args = ?arguments, "spawned build tool");

    let (tx, mut rx) = mpsc::channel::<Chunk>(CHANNEL_CAPACITY);
    let mut readers = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        readers.push(tokio::spawn(pump(StreamSource::Stdout, stdout, tx.clone())));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(tokio::spawn(pump(StreamSource::Stderr, stderr, tx.clone())));
    }
    drop(tx);

    let mut parser = EventParser::with_sequence(options.grammar, options.sequence);
    let mut tail = DiagnosticTail::new(options.diagnostic_tail);

    while let Some(chunk) = rx.recv().await {
        for event in parser.feed(chunk.source, &chunk.bytes) {
            tail.observe(&event);
            reporters.deliver(&event);
        }
    }
    for event in parser.finish() {
        tail.observe(&event);
        reporters.deliver(&event);
    }

    for reader in readers {
        if let Err(err) = reader.await {
            tracing::warn!(error = %err, "output reader task failed");
        }
    }

    let status = child.wait().await;
    let duration = start.elapsed().as_secs_f64();

    match status {
        Ok(status) => outcome(&tool, status, &tail, duration),
        Err(err) => LaunchResult::runtime_failure(
            None,
            None,
            format!("Failed to wait for {}: {}", tool, err),
            duration,
        ),
    }
}

async fn pump<R>(source: StreamSource, mut reader: R, tx: mpsc::Sender<Chunk>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let chunk = Chunk {
                    source,
                    bytes: buf[..n].to_vec(),
                };
                if tx.send(chunk).await.is_err() {
                    break;
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => {
                tracing::warn!(stream = source.as_str(), error = %err, "failed reading tool output");
                break;
            }
        }
    }
}

fn outcome(tool: &str, status: ExitStatus, tail: &DiagnosticTail, duration: f64) -> LaunchResult {
    if status.success() {
        tracing::debug!(tool, duration, "build tool exited successfully");
        return LaunchResult::succeeded(duration);
    }

    if let Some(code) = status.code() {
        tracing::debug!(tool, code, "build tool exited with failure");
        let header = format!("{} exited with code {}", tool, code);
        return LaunchResult::runtime_failure(Some(code), None, tail.message(header), duration);
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;

        if let Some(signal) = status.signal() {
            let name = nix::sys::signal::Signal::try_from(signal)
                .map(|s| s.as_str())
                .unwrap_or("unknown signal");
            let header = format!("{} was terminated by signal {} ({})", tool, signal, name);
            return LaunchResult::runtime_failure(None, Some(signal), tail.message(header), duration);
        }
    }

    LaunchResult::runtime_failure(
        None,
        None,
        tail.message(format!("{} terminated abnormally", tool)),
        duration,
    )
}

fn tool_name(executable: &Path) -> String {
    executable
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| executable.display().to_string())
}

/// Last few non-blank output lines, used to explain a failure.
struct DiagnosticTail {
    lines: VecDeque<(bool, String)>,
    capacity: usize,
}

impl DiagnosticTail {
    fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn observe(&mut self, event: &BuildEvent) {
        if self.capacity == 0 || event.kind != EventKind::Message {
            return;
        }
        let Some(text) = event.str_field("text") else {
            return;
        };
        if text.trim().is_empty() {
            return;
        }
        if self.lines.len() >= self.capacity {
            self.lines.pop_front();
        }
        let is_error = event.str_field("level") == Some("error");
        self.lines.push_back((is_error, text.to_string()));
    }

    fn message(&self, header: String) -> String {
        let errors: Vec<&str> = self
            .lines
            .iter()
            .filter(|(is_error, _)| *is_error)
            .map(|(_, text)| text.as_str())
            .collect();
        let lines: Vec<&str> = if errors.is_empty() {
            self.lines.iter().map(|(_, text)| text.as_str()).collect()
        } else {
            errors
        };

        if lines.is_empty() {
            header
        } else {
            format!("{}:\n{}", header, lines.join("\n"))
        }
    }
}
