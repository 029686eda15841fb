use anyhow::Context;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::sync::{Arc, Mutex};

use crate::config::Config;

/// Destination a reporter writes to: stdout (`-` or no output given) or a file.
pub struct ReporterOutput {
    writer: Box<dyn Write + Send>,
    label: String,
}

impl ReporterOutput {
    pub fn open(output: Option<&str>) -> anyhow::Result<Self> {
        match output {
            None | Some("-") => Ok(Self::stdout()),
            Some(path) => {
                let path = Config::expand_path(path);
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    fs::create_dir_all(parent).with_context(|| {
                        format!("Failed to create reporter directory: {}", parent.display())
                    })?;
                }
                let file = File::create(&path)
                    .with_context(|| format!("Failed to open reporter output: {}", path.display()))?;
                Ok(Self {
                    writer: Box::new(BufWriter::new(file)),
                    label: path.display().to_string(),
                })
            }
        }
    }

    pub fn stdout() -> Self {
        Self {
            writer: Box::new(io::stdout()),
            label: "-".to_string(),
        }
    }

    pub fn from_writer(writer: impl Write + Send + 'static, label: impl Into<String>) -> Self {
        Self {
            writer: Box::new(writer),
            label: label.into(),
        }
    }

    pub fn is_stdout(&self) -> bool {
        self.label == "-"
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

impl Write for ReporterOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.writer.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

/// In-memory writer whose contents stay readable after being handed to a
/// reporter.
#[derive(Debug, Clone, Default)]
pub struct SharedBuffer {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl SharedBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> String {
        match self.inner.lock() {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(poisoned) => String::from_utf8_lossy(&poisoned.into_inner()).into_owned(),
        }
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut bytes = self
            .inner
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "buffer lock poisoned"))?;
        bytes.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
