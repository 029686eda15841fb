use regex::Regex;

use crate::config::ParserConfig;

pub const DEFAULT_STEP_START: &str = r"^Step started:\s*(?P<name>.+?)\s*$";
pub const DEFAULT_STEP_END: &str =
    r"^Step finished:\s*(?P<name>.+?)(?:\s+\((?P<duration>\d*\.?\d+)s\))?(?:\s+(?P<status>[A-Z][A-Z_]*))?\s*$";

#[derive(Debug, thiserror::Error)]
pub enum GrammarError {
    #[error("Invalid {role} pattern '{pattern}': {source}")]
    InvalidPattern {
        role: &'static str,
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("{role} pattern '{pattern}' has no (?P<name>...) capture group")]
    MissingNameGroup { role: &'static str, pattern: String },
}

/// Recognition rules for step markers in tool output.
#[derive(Debug, Clone)]
pub struct Grammar {
    step_start: Vec<Regex>,
    step_end: Vec<Regex>,
    success_statuses: Vec<String>,
    structured_events: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StepEnd {
    pub name: String,
    pub status: Option<String>,
    pub succeeded: bool,
    pub duration: Option<f64>,
}

impl Grammar {
    pub fn new<S: AsRef<str>>(
        step_start: &[S],
        step_end: &[S],
        success_statuses: &[S],
        structured_events: bool,
    ) -> Result<Self, GrammarError> {
        Ok(Self {
            step_start: compile_all("step_start", step_start)?,
            step_end: compile_all("step_end", step_end)?,
            success_statuses: success_statuses
                .iter()
                .map(|s| s.as_ref().to_uppercase())
                .collect(),
            structured_events,
        })
    }

    pub fn from_config(config: &ParserConfig) -> Result<Self, GrammarError> {
        Self::new(
            &config.step_start,
            &config.step_end,
            &config.success_statuses,
            config.structured_events,
        )
    }

    pub fn structured_events(&self) -> bool {
        self.structured_events
    }

    pub fn match_step_start(&self, line: &str) -> Option<String> {
        self.step_start
            .iter()
            .find_map(|re| re.captures(line))
            .and_then(|caps| caps.name("name").map(|m| m.as_str().to_string()))
    }

    pub fn match_step_end(&self, line: &str) -> Option<StepEnd> {
        let caps = self.step_end.iter().find_map(|re| re.captures(line))?;
        let name = caps.name("name")?.as_str().to_string();
        let status = caps.name("status").map(|m| m.as_str().to_string());
        let duration = caps.name("duration").and_then(|m| m.as_str().parse().ok());

        Some(StepEnd {
            succeeded: self.is_success_status(status.as_deref()),
            name,
            status,
            duration,
        })
    }

    pub fn is_success_status(&self, status: Option<&str>) -> bool {
        match status {
            None => true,
            Some(status) => self
                .success_statuses
                .iter()
                .any(|s| s.eq_ignore_ascii_case(status)),
        }
    }
}

impl Default for Grammar {
    fn default() -> Self {
        Self::from_config(&ParserConfig::default())
            .expect("built-in step patterns are valid")
    }
}

fn compile_all<S: AsRef<str>>(role: &'static str, patterns: &[S]) -> Result<Vec<Regex>, GrammarError> {
    patterns
        .iter()
        .map(|pattern| {
            let pattern = pattern.as_ref();
            let re = Regex::new(pattern).map_err(|source| GrammarError::InvalidPattern {
                role,
                pattern: pattern.to_string(),
                source,
            })?;
            if !re.capture_names().any(|n| n == Some("name")) {
                return Err(GrammarError::MissingNameGroup {
                    role,
                    pattern: pattern.to_string(),
                });
            }
            Ok(re)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_step_start() {
        let grammar = Grammar::default();
        assert_eq!(
            grammar.match_step_start("Step started: Compile"),
            Some("Compile".to_string())
        );
        assert_eq!(grammar.match_step_start("Compile started"), None);
    }

    #[test]
    fn test_default_step_end_with_duration() {
        let grammar = Grammar::default();
        let end = grammar
            .match_step_end("Step finished: Compile Sources (1.25s) FAILED")
            .unwrap();

        assert_eq!(end.name, "Compile Sources");
        assert_eq!(end.status.as_deref(), Some("FAILED"));
        assert_eq!(end.duration, Some(1.25));
        assert!(!end.succeeded);
    }

    #[test]
    fn test_default_step_end_without_duration() {
        let grammar = Grammar::default();
        let end = grammar.match_step_end("Step finished: Link OK").unwrap();

        assert_eq!(end.name, "Link");
        assert_eq!(end.duration, None);
        assert!(end.succeeded);
    }

    #[test]
    fn test_multi_word_name_is_not_a_status() {
        let grammar = Grammar::default();
        let end = grammar.match_step_end("Step finished: Link Binary").unwrap();

        assert_eq!(end.name, "Link Binary");
        assert_eq!(end.status, None);
        assert!(end.succeeded);

        let end = grammar
            .match_step_end("Step finished: Copy Swift Headers (0.2s) BUILD_FAILED")
            .unwrap();
        assert_eq!(end.name, "Copy Swift Headers");
        assert_eq!(end.status.as_deref(), Some("BUILD_FAILED"));
        assert!(!end.succeeded);
    }

    #[test]
    fn test_rejects_pattern_without_name() {
        let err = Grammar::new(&["^start (.+)$"], &[DEFAULT_STEP_END], &["OK"], false).unwrap_err();
        assert!(matches!(err, GrammarError::MissingNameGroup { .. }));

        let err = Grammar::new(&["(?P<name>"], &[DEFAULT_STEP_END], &["OK"], false).unwrap_err();
        assert!(matches!(err, GrammarError::InvalidPattern { .. }));
    }

    #[test]
    fn test_custom_grammar() {
        let grammar = Grammar::new(
            &[r"^=== BUILD TARGET (?P<name>\S+)"],
            &[r"^=== DONE (?P<name>\S+) (?P<status>\w+)"],
            &["GOOD"],
            false,
        )
        .unwrap();

        assert_eq!(
            grammar.match_step_start("=== BUILD TARGET App OF PROJECT App"),
            Some("App".to_string())
        );
        let end = grammar.match_step_end("=== DONE App good").unwrap();
        assert!(end.succeeded);
    }
}
