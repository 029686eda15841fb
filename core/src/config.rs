use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::parser::grammar::{DEFAULT_STEP_END, DEFAULT_STEP_START};
use crate::reporter::{ReporterKind, ReporterSpec};

pub const CONFIG_FILE_NAME: &str = "kiln.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub tool: ToolConfig,
    #[serde(default)]
    pub parser: ParserConfig,
    #[serde(default)]
    pub reporters: Vec<ReporterSpec>,
    #[serde(default)]
    pub display: DisplayConfig,
    #[serde(default)]
    pub history: HistoryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolConfig {
    #[serde(default = "default_executable")]
    pub executable: String,
    #[serde(default)]
    pub arguments: Vec<String>,
    #[serde(default = "default_settings_argument")]
    pub settings_argument: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParserConfig {
    #[serde(default = "default_step_start")]
    pub step_start: Vec<String>,
    #[serde(default = "default_step_end")]
    pub step_end: Vec<String>,
    #[serde(default = "default_success_statuses")]
    pub success_statuses: Vec<String>,
    #[serde(default = "default_true")]
    pub structured_events: bool,
    #[serde(default = "default_diagnostic_tail")]
    pub diagnostic_tail: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColorMode {
    Auto,
    Always,
    Never,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisplayConfig {
    #[serde(default = "default_colors")]
    pub colors: ColorMode,
    #[serde(default)]
    pub show_timestamps: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    #[serde(default = "default_max_runs")]
    pub max_runs: usize,
    #[serde(default = "default_storage_path")]
    pub storage_path: String,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            executable: default_executable(),
            arguments: Vec::new(),
            settings_argument: default_settings_argument(),
            env: BTreeMap::new(),
        }
    }
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            step_start: default_step_start(),
            step_end: default_step_end(),
            success_statuses: default_success_statuses(),
            structured_events: true,
            diagnostic_tail: default_diagnostic_tail(),
        }
    }
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            colors: default_colors(),
            show_timestamps: false,
        }
    }
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            max_runs: default_max_runs(),
            storage_path: default_storage_path(),
        }
    }
}

impl DisplayConfig {
    /// Colors apply only to terminal output, never to files.
    pub fn use_colors(&self, output: Option<&str>) -> bool {
        let to_stdout = matches!(output, None | Some("-"));
        match self.colors {
            ColorMode::Always => to_stdout,
            ColorMode::Never => false,
            ColorMode::Auto => to_stdout && atty::is(atty::Stream::Stdout),
        }
    }
}

fn default_executable() -> String {
    "xcodebuild".to_string()
}

fn default_settings_argument() -> String {
    "-showBuildSettings".to_string()
}

fn default_step_start() -> Vec<String> {
    vec![DEFAULT_STEP_START.to_string()]
}

fn default_step_end() -> Vec<String> {
    vec![DEFAULT_STEP_END.to_string()]
}

fn default_success_statuses() -> Vec<String> {
    ["OK", "SUCCEEDED", "PASSED", "SUCCESS"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_true() -> bool {
    true
}

fn default_diagnostic_tail() -> usize {
    20
}

fn default_colors() -> ColorMode {
    ColorMode::Auto
}

fn default_max_runs() -> usize {
    50
}

fn default_storage_path() -> String {
    "~/.cache/kiln/run_history.json".to_string()
}

impl Config {
    /// Loads `kiln.toml` from `source_dir` (or `explicit`), layered over the
    /// global config.
    pub fn load(source_dir: &Path, explicit: Option<&Path>) -> anyhow::Result<Self> {
        let project_path = match explicit {
            Some(path) => {
                let expanded = Self::expand_path(&path.to_string_lossy());
                if !expanded.exists() {
                    anyhow::bail!("Config file not found: {}", expanded.display());
                }
                expanded
            }
            None => source_dir.join(CONFIG_FILE_NAME),
        };

        let config = Self::load_layered(&Self::global_path(), &project_path)?;
        tracing::debug!(path = %project_path.display(), "loaded configuration");
        Ok(config)
    }

    /// Merges `project` over `global` table by table: nested tables merge
    /// key by key, any other value in `project` replaces the global one.
    pub fn load_layered(global: &Path, project: &Path) -> anyhow::Result<Self> {
        let mut merged = read_table(global)
            .context("Failed to load global config")?
            .unwrap_or_default();
        if let Some(table) = read_table(project)? {
            merge_tables(&mut merged, table);
        }

        toml::Value::Table(merged)
            .try_into()
            .context("Failed to combine global and project config")
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        match read_table(path.as_ref())? {
            Some(table) => Ok(toml::Value::Table(table).try_into()?),
            None => Ok(Self::default()),
        }
    }

    pub fn global_path() -> PathBuf {
        Self::expand_path("~/.config/kiln/kiln.toml")
    }

    pub fn expand_path(path: &str) -> PathBuf {
        let expanded = shellexpand::tilde(path);
        PathBuf::from(expanded.as_ref())
    }

    pub fn storage_path(&self) -> PathBuf {
        Self::expand_path(&self.history.storage_path)
    }

    /// Reporters to use when none are given on the command line.
    pub fn effective_reporters(&self) -> Vec<ReporterSpec> {
        if self.reporters.is_empty() {
            vec![ReporterSpec {
                kind: ReporterKind::Console,
                output: None,
            }]
        } else {
            self.reporters.clone()
        }
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize config to TOML")?;

        std::fs::write(path.as_ref(), content)
            .with_context(|| format!("Failed to write config file: {}", path.as_ref().display()))?;

        Ok(())
    }
}

/// Reads a config file as a raw table, checking it deserializes on its own
/// so errors name the file. A missing file is `None`.
fn read_table(path: &Path) -> anyhow::Result<Option<toml::Table>> {
    let path = Config::expand_path(&path.to_string_lossy());
    if !path.exists() {
        return Ok(None);
    }

    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    let table: toml::Table = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
    toml::Value::Table(table.clone())
        .try_into::<Config>()
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    Ok(Some(table))
}

fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_from_file(dir.path().join(CONFIG_FILE_NAME)).unwrap();

        assert_eq!(config.tool.executable, "xcodebuild");
        assert_eq!(config.parser.diagnostic_tail, 20);
        assert!(config.parser.structured_events);
        assert_eq!(config.history.max_runs, 50);
    }

    #[test]
    fn test_parse_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(
            &path,
            r#"
[tool]
executable = "/usr/bin/make"
arguments = ["-j8"]
env = { CI = "1" }

[parser]
success_statuses = ["DONE"]

[[reporters]]
kind = "json"
output = "build/events.json"

[display]
colors = "never"
"#,
        )
        .unwrap();

        let config = Config::load_from_file(&path).unwrap();
        assert_eq!(config.tool.executable, "/usr/bin/make");
        assert_eq!(config.tool.arguments, vec!["-j8"]);
        assert_eq!(config.tool.env.get("CI").map(String::as_str), Some("1"));
        assert_eq!(config.tool.settings_argument, "-showBuildSettings");
        assert_eq!(config.parser.success_statuses, vec!["DONE"]);
        assert_eq!(config.parser.step_start, vec![DEFAULT_STEP_START.to_string()]);
        assert_eq!(config.reporters.len(), 1);
        assert_eq!(config.reporters[0].kind, ReporterKind::Json);
        assert_eq!(config.display.colors, ColorMode::Never);
        assert!(!config.display.use_colors(None));
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, "[tool\nexecutable = 1").unwrap();

        assert!(Config::load_from_file(&path).is_err());
    }

    #[test]
    fn test_merge_prefers_project_values() {
        let dir = tempfile::tempdir().unwrap();
        let global = dir.path().join("global.toml");
        let project = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(
            &global,
            r#"
[tool]
env = { A = "global", B = "global" }

[[reporters]]
kind = "summary"
"#,
        )
        .unwrap();
        std::fs::write(&project, "[tool]\nenv = { A = \"project\" }\n").unwrap();

        let merged = Config::load_layered(&global, &project).unwrap();
        assert_eq!(merged.tool.env["A"], "project");
        assert_eq!(merged.tool.env["B"], "global");
        assert_eq!(merged.reporters.len(), 1);
    }

    #[test]
    fn test_global_sections_apply_without_project_file() {
        let dir = tempfile::tempdir().unwrap();
        let global = dir.path().join("global.toml");
        std::fs::write(
            &global,
            r#"
[tool]
executable = "/opt/xcode/xcodebuild"

[history]
max_runs = 7
"#,
        )
        .unwrap();

        let config = Config::load_layered(&global, &dir.path().join(CONFIG_FILE_NAME)).unwrap();
        assert_eq!(config.tool.executable, "/opt/xcode/xcodebuild");
        assert_eq!(config.history.max_runs, 7);
        assert_eq!(config.history.storage_path, default_storage_path());
    }

    #[test]
    fn test_project_overrides_single_global_keys() {
        let dir = tempfile::tempdir().unwrap();
        let global = dir.path().join("global.toml");
        let project = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(
            &global,
            "[tool]\nexecutable = \"/opt/tool\"\narguments = [\"-quiet\"]\n\n[display]\ncolors = \"never\"\n",
        )
        .unwrap();
        std::fs::write(&project, "[tool]\narguments = [\"-json\"]\n").unwrap();

        let config = Config::load_layered(&global, &project).unwrap();
        assert_eq!(config.tool.executable, "/opt/tool");
        assert_eq!(config.tool.arguments, vec!["-json"]);
        assert_eq!(config.display.colors, ColorMode::Never);
    }

    #[test]
    fn test_invalid_global_file_names_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let global = dir.path().join("global.toml");
        std::fs::write(&global, "[history]\nmax_runs = \"many\"\n").unwrap();

        let err = Config::load_layered(&global, &dir.path().join(CONFIG_FILE_NAME)).unwrap_err();
        assert!(format!("{:#}", err).contains("global.toml"));
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        let mut config = Config::default();
        config.reporters.push("summary".parse().unwrap());
        config.save_to_file(&path).unwrap();

        let reloaded = Config::load_from_file(&path).unwrap();
        assert_eq!(reloaded.reporters, config.reporters);
        assert_eq!(reloaded.parser.step_end, config.parser.step_end);
    }

    #[test]
    fn test_effective_reporters_default_to_console() {
        let config = Config::default();
        assert_eq!(config.effective_reporters()[0].kind, ReporterKind::Console);
    }

    #[test]
    fn test_colors_never_go_to_files() {
        let display = DisplayConfig {
            colors: ColorMode::Always,
            show_timestamps: false,
        };
        assert!(display.use_colors(Some("-")));
        assert!(!display.use_colors(Some("out.txt")));
    }
}
