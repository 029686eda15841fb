use anyhow::Context;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;
use std::process::Stdio;
use tokio::process::Command;

use crate::config::ToolConfig;
use crate::environment::Environment;
use crate::orchestrator::{child_environment, resolve_executable};

/// Resolved build configuration, setting name to value.
pub type BuildSettings = BTreeMap<String, String>;

/// Settings per target, for dumps that cover several targets.
pub type TargetBuildSettings = BTreeMap<String, BuildSettings>;

static TARGET_HEADER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^Build settings for action (?P<action>\S+) and target (?P<target>.+?):\s*$")
        .unwrap()
});

/// Parses `KEY = value` lines. Later duplicates win, lines that are not
/// assignments are skipped.
pub fn parse_build_settings(text: &str) -> BuildSettings {
    let mut settings = BuildSettings::new();
    for line in text.lines() {
        if let Some((key, value)) = parse_assignment(line) {
            settings.insert(key.to_string(), value.to_string());
        }
    }
    settings
}

/// Splits a dump on its `Build settings for action ... and target ...:`
/// headers. Assignments before the first header go under the empty target
/// name.
pub fn parse_target_build_settings(text: &str) -> TargetBuildSettings {
    let mut targets = TargetBuildSettings::new();
    let mut current = String::new();

    for line in text.lines() {
        if let Some(caps) = TARGET_HEADER.captures(line.trim()) {
            current = caps["target"].to_string();
            targets.entry(current.clone()).or_default();
            continue;
        }
        if let Some((key, value)) = parse_assignment(line) {
            targets
                .entry(current.clone())
                .or_default()
                .insert(key.to_string(), value.to_string());
        }
    }
    targets
}

fn parse_assignment(line: &str) -> Option<(&str, &str)> {
    let (key, value) = line.split_once('=')?;
    let key = key.trim();
    if key.is_empty() || key.contains(char::is_whitespace) {
        return None;
    }
    Some((key, value.trim()))
}

/// Runs `<tool> <arguments> -showBuildSettings` once and parses the dump.
///
/// Output is captured through a temp file allocated by `environment`, which
/// is removed afterwards.
pub async fn extract_build_settings(
    environment: &dyn Environment,
    tool: &ToolConfig,
    arguments: &[String],
) -> anyhow::Result<TargetBuildSettings> {
    let executable = resolve_executable(environment, &tool.executable, None);
    let vars = child_environment(environment, &tool.env);

    let dump_path = environment
        .allocate_temp_file("kiln-settings-")
        .context("Failed to allocate temp file for build settings")?;
    let dump = std::fs::File::create(&dump_path)
        .with_context(|| format!("Failed to open {}", dump_path.display()))?;

    tracing::debug!(executable = %executable.display(), dump = %dump_path.display(), "extracting build settings");
    let output = Command::new(&executable)
        .args(&tool.arguments)
        .args(arguments)
        .arg(&tool.settings_argument)
        .env_clear()
        .envs(&vars)
        .stdin(Stdio::null())
        .stdout(Stdio::from(dump))
        .stderr(Stdio::piped())
        .output()
        .await;

    let text = std::fs::read_to_string(&dump_path);
    if let Err(err) = std::fs::remove_file(&dump_path) {
        tracing::warn!(path = %dump_path.display(), error = %err, "failed to remove settings dump");
    }

    let output =
        output.with_context(|| format!("Failed to launch {}", executable.display()))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!(
            "{} {} failed ({}): {}",
            executable.display(),
            tool.settings_argument,
            output.status,
            stderr.trim()
        );
    }

    let text = text.context("Failed to read build settings dump")?;
    Ok(parse_target_build_settings(&text))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::StaticEnvironment;

    #[test]
    fn test_last_duplicate_wins() {
        let settings = parse_build_settings("FOO = bar\nBAZ=qux\nFOO = baz\n");

        assert_eq!(settings.len(), 2);
        assert_eq!(settings["FOO"], "baz");
        assert_eq!(settings["BAZ"], "qux");
    }

    #[test]
    fn test_malformed_lines_are_skipped() {
        let settings = parse_build_settings(
            "Build settings for action build and target App:\n\
             \n\
             no equals here\n\
             = orphan\n\
             two words = x\n    ARCHS = arm64\n\
             EMPTY =\n\
             URL = a=b\n",
        );

        assert_eq!(settings.len(), 3);
        assert_eq!(settings["ARCHS"], "arm64");
        assert_eq!(settings["EMPTY"], "");
        assert_eq!(settings["URL"], "a=b");
    }

    #[test]
    fn test_targets_are_separated() {
        let dump = "Command line invocation:\n\
            \t/usr/bin/xcodebuild -showBuildSettings\n\
            \n\
            Build settings for action build and target App:\n\
            \x20   PRODUCT_NAME = App\n\
            \x20   SDKROOT = iphoneos\n\
            \n\
            Build settings for action build and target AppTests:\n\
            \x20   PRODUCT_NAME = AppTests\n";

        let targets = parse_target_build_settings(dump);
        assert_eq!(targets.len(), 2);
        assert_eq!(targets["App"]["PRODUCT_NAME"], "App");
        assert_eq!(targets["App"]["SDKROOT"], "iphoneos");
        assert_eq!(targets["AppTests"]["PRODUCT_NAME"], "AppTests");
    }

    #[test]
    fn test_headerless_dump_uses_empty_target() {
        let targets = parse_target_build_settings("A = 1\n");
        assert_eq!(targets[""]["A"], "1");
    }

    #[tokio::test]
    async fn test_extract_runs_tool_once() {
        let dir = tempfile::tempdir().unwrap();
        let env = StaticEnvironment::new(dir.path());
        let tool = ToolConfig {
            executable: "/bin/sh".to_string(),
            arguments: vec!["-c".to_string()],
            settings_argument: "kiln-settings".to_string(),
            ..ToolConfig::default()
        };
        let script = vec![
            "echo 'Build settings for action build and target App:'; echo \"    MODE = $0\"".to_string(),
        ];

        let targets = extract_build_settings(&env, &tool, &script).await.unwrap();
        assert_eq!(targets["App"]["MODE"], "kiln-settings");
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_extract_reports_tool_failure() {
        let dir = tempfile::tempdir().unwrap();
        let env = StaticEnvironment::new(dir.path());
        let tool = ToolConfig {
            executable: "/bin/sh".to_string(),
            arguments: vec!["-c".to_string()],
            ..ToolConfig::default()
        };
        let script = vec!["echo 'no scheme' >&2; exit 66".to_string()];

        let err = extract_build_settings(&env, &tool, &script).await.unwrap_err();
        assert!(format!("{:#}", err).contains("no scheme"));
    }
}
