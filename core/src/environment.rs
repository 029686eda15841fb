use once_cell::sync::{Lazy, OnceCell};
use regex::Regex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

/// SDK canonical name (e.g. `iphoneos17.0`) to the aliases that resolve to it.
pub type SdkMap = BTreeMap<String, Vec<String>>;

pub const TEST_MODE_VAR: &str = "KILN_TEST_MODE";
pub const BINARIES_PATH_VAR: &str = "KILN_BINARIES_PATH";
pub const DEVELOPER_DIR_VAR: &str = "DEVELOPER_DIR";

const STATIC_SEARCH_PATH: [&str; 2] = ["/usr/bin", "/bin"];

static SDK_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"-sdk\s+(?P<name>(?P<family>[A-Za-z]+?)(?P<version>\d+(?:\.\d+)*))\s*$").unwrap()
});

#[derive(Debug, thiserror::Error)]
pub enum EnvironmentError {
    #[error("{0} could not be determined")]
    NotFound(String),

    #[error("`{command}` failed: {message}")]
    Command { command: String, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Facts about the host needed to build tool invocations.
pub trait Environment: Send + Sync {
    /// Root of the developer toolchain (what `DEVELOPER_DIR` points at).
    fn toolchain_root(&self) -> Result<PathBuf, EnvironmentError>;

    /// Directory holding this program's helper binaries.
    fn binaries_path(&self) -> Result<PathBuf, EnvironmentError>;

    /// Creates an empty, uniquely named file and returns its path. The file
    /// is not removed automatically.
    fn allocate_temp_file(&self, prefix: &str) -> std::io::Result<PathBuf>;

    fn available_sdks(&self) -> Result<SdkMap, EnvironmentError>;

    fn is_test_mode(&self) -> bool;

    /// Directories searched for bare tool names, in order.
    fn search_path(&self) -> Vec<PathBuf>;

    /// Variables every launched tool starts from.
    fn base_environment(&self) -> BTreeMap<String, String>;
}

#[derive(Debug, Default)]
pub struct SystemEnvironment {
    toolchain_root: OnceCell<PathBuf>,
    sdks: OnceCell<SdkMap>,
}

impl SystemEnvironment {
    pub fn new() -> Self {
        Self::default()
    }

    fn tool_path(&self, name: &str) -> PathBuf {
        match self.toolchain_root() {
            Ok(root) => {
                let candidate = root.join("usr/bin").join(name);
                if candidate.exists() {
                    return candidate;
                }
                PathBuf::from(name)
            }
            Err(_) => PathBuf::from(name),
        }
    }
}

impl Environment for SystemEnvironment {
    fn toolchain_root(&self) -> Result<PathBuf, EnvironmentError> {
        self.toolchain_root
            .get_or_try_init(|| {
                if let Some(dir) = std::env::var_os(DEVELOPER_DIR_VAR).filter(|d| !d.is_empty()) {
                    return Ok(PathBuf::from(dir));
                }
                let output = run_capture("xcode-select", &["--print-path"])?;
                let path = output.trim();
                if path.is_empty() {
                    return Err(EnvironmentError::NotFound("developer directory".to_string()));
                }
                Ok(PathBuf::from(path))
            })
            .cloned()
    }

    fn binaries_path(&self) -> Result<PathBuf, EnvironmentError> {
        if let Some(dir) = std::env::var_os(BINARIES_PATH_VAR).filter(|d| !d.is_empty()) {
            return Ok(PathBuf::from(dir));
        }

        let exe = std::env::current_exe()?;
        let exe = exe.canonicalize().unwrap_or(exe);
        let dir = exe
            .parent()
            .ok_or_else(|| EnvironmentError::NotFound("executable directory".to_string()))?;

        let libexec = dir.join("../libexec/kiln");
        if libexec.is_dir() {
            return Ok(libexec.canonicalize()?);
        }
        Ok(dir.to_path_buf())
    }

    fn allocate_temp_file(&self, prefix: &str) -> std::io::Result<PathBuf> {
        allocate_temp_file_in(&std::env::temp_dir(), prefix)
    }

    fn available_sdks(&self) -> Result<SdkMap, EnvironmentError> {
        self.sdks
            .get_or_try_init(|| {
                let xcodebuild = self.tool_path("xcodebuild");
                let output = run_capture(&xcodebuild.to_string_lossy(), &["-showsdks"])?;
                Ok(parse_sdk_listing(&output))
            })
            .cloned()
    }

    fn is_test_mode(&self) -> bool {
        std::env::var(TEST_MODE_VAR)
            .map(|v| !v.is_empty() && v != "0")
            .unwrap_or(false)
    }

    fn search_path(&self) -> Vec<PathBuf> {
        std::env::var_os("PATH")
            .map(|paths| std::env::split_paths(&paths).collect())
            .unwrap_or_default()
    }

    fn base_environment(&self) -> BTreeMap<String, String> {
        std::env::vars().collect()
    }
}

/// Fixed answers for tests and for hosts without a toolchain.
#[derive(Debug, Clone)]
pub struct StaticEnvironment {
    pub toolchain_root: Option<PathBuf>,
    pub binaries_path: PathBuf,
    pub temp_dir: PathBuf,
    pub sdks: SdkMap,
    pub test_mode: bool,
    pub search_path: Vec<PathBuf>,
    pub env: BTreeMap<String, String>,
}

impl StaticEnvironment {
    pub fn new(temp_dir: impl Into<PathBuf>) -> Self {
        let temp_dir = temp_dir.into();
        Self {
            toolchain_root: None,
            binaries_path: temp_dir.clone(),
            temp_dir,
            sdks: SdkMap::new(),
            test_mode: true,
            search_path: STATIC_SEARCH_PATH.iter().map(PathBuf::from).collect(),
            env: BTreeMap::from([("PATH".to_string(), STATIC_SEARCH_PATH.join(":"))]),
        }
    }

    pub fn with_toolchain_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.toolchain_root = Some(root.into());
        self
    }

    pub fn with_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

impl Environment for StaticEnvironment {
    fn toolchain_root(&self) -> Result<PathBuf, EnvironmentError> {
        self.toolchain_root
            .clone()
            .ok_or_else(|| EnvironmentError::NotFound("developer directory".to_string()))
    }

    fn binaries_path(&self) -> Result<PathBuf, EnvironmentError> {
        Ok(self.binaries_path.clone())
    }

    fn allocate_temp_file(&self, prefix: &str) -> std::io::Result<PathBuf> {
        allocate_temp_file_in(&self.temp_dir, prefix)
    }

    fn available_sdks(&self) -> Result<SdkMap, EnvironmentError> {
        Ok(self.sdks.clone())
    }

    fn is_test_mode(&self) -> bool {
        self.test_mode
    }

    fn search_path(&self) -> Vec<PathBuf> {
        self.search_path.clone()
    }

    fn base_environment(&self) -> BTreeMap<String, String> {
        self.env.clone()
    }
}

pub fn allocate_temp_file_in(dir: &Path, prefix: &str) -> std::io::Result<PathBuf> {
    let file = tempfile::Builder::new().prefix(prefix).tempfile_in(dir)?;
    let (_file, path) = file.keep().map_err(|e| e.error)?;
    Ok(path)
}

/// Parses `xcodebuild -showsdks` output. The bare family name (`iphoneos`)
/// is an alias for the newest version of that family.
pub fn parse_sdk_listing(output: &str) -> SdkMap {
    let mut sdks = SdkMap::new();
    let mut newest: BTreeMap<String, (Vec<u32>, String)> = BTreeMap::new();

    for line in output.lines() {
        let Some(caps) = SDK_LINE.captures(line.trim_end()) else {
            continue;
        };
        let name = caps["name"].to_string();
        let family = caps["family"].to_string();
        let version: Vec<u32> = caps["version"]
            .split('.')
            .filter_map(|part| part.parse().ok())
            .collect();

        sdks.entry(name.clone()).or_insert_with(Vec::new);

        let replace = newest
            .get(&family)
            .map_or(true, |(best, _)| version > *best);
        if replace {
            newest.insert(family, (version, name));
        }
    }

    for (family, (_, name)) in newest {
        if let Some(aliases) = sdks.get_mut(&name) {
            aliases.push(family);
        }
    }

    sdks
}

fn run_capture(program: &str, args: &[&str]) -> Result<String, EnvironmentError> {
    let command = format!("{} {}", program, args.join(" "));
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .map_err(|e| EnvironmentError::Command {
            command: command.clone(),
            message: e.to_string(),
        })?;

    if !output.status.success() {
        return Err(EnvironmentError::Command {
            command,
            message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}
