use once_cell::sync::Lazy;
use regex::Regex;

use crate::event::BuildEvent;

static COMPILER_DIAGNOSTIC: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?P<file>[^:]+):(?P<line>\d+):(?P<column>\d+): (?P<level>fatal error|error|warning|note): (?P<message>.+)$")
        .unwrap()
});
static FILELESS_ERROR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?:xcodebuild|ld|clang|swift-frontend): error: ").unwrap());
static LINKER_ERROR_UNDEF: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"undefined reference to|Undefined symbols? for architecture").unwrap());
static LINKER_ERROR_MULTI: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"multiple definition of|duplicate symbols? for architecture").unwrap());
static BUILD_FAILED: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\*\* \w+ FAILED \*\*").unwrap());
static ANSI_ESCAPE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\x1b\[[0-9;]*m").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Note,
    Warning,
    Error,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Note => "note",
            Severity::Warning => "warning",
            Severity::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "note" => Some(Severity::Note),
            "warning" => Some(Severity::Warning),
            "error" | "fatal error" => Some(Severity::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub severity: Severity,
    pub file: Option<String>,
    pub line: Option<usize>,
    pub column: Option<usize>,
}

/// Classifies a single already-stripped line of tool output.
pub fn classify(line: &str) -> Option<Diagnostic> {
    if let Some(caps) = COMPILER_DIAGNOSTIC.captures(line) {
        return Some(Diagnostic {
            severity: Severity::parse(&caps["level"])?,
            file: Some(caps["file"].to_string()),
            line: caps["line"].parse().ok(),
            column: caps["column"].parse().ok(),
        });
    }

    if FILELESS_ERROR.is_match(line)
        || LINKER_ERROR_UNDEF.is_match(line)
        || LINKER_ERROR_MULTI.is_match(line)
        || BUILD_FAILED.is_match(line)
    {
        return Some(Diagnostic {
            severity: Severity::Error,
            file: None,
            line: None,
            column: None,
        });
    }

    None
}

pub fn annotate(event: BuildEvent, diagnostic: &Diagnostic) -> BuildEvent {
    event
        .with("level", diagnostic.severity.as_str())
        .with_opt("file", diagnostic.file.clone())
        .with_opt("line", diagnostic.line.map(|l| l as i64))
        .with_opt("column", diagnostic.column.map(|c| c as i64))
}

pub fn strip_ansi(s: &str) -> String {
    ANSI_ESCAPE.replace_all(s, "").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clang_error_parsing() {
        let diag = classify("Sources/App.m:42:10: error: use of undeclared identifier 'foo'").unwrap();

        assert_eq!(diag.severity, Severity::Error);
        assert_eq!(diag.file.as_deref(), Some("Sources/App.m"));
        assert_eq!(diag.line, Some(42));
        assert_eq!(diag.column, Some(10));
    }

    #[test]
    fn test_warning_and_note() {
        let warning = classify("a.c:1:2: warning: unused variable 'x'").unwrap();
        assert_eq!(warning.severity, Severity::Warning);

        let note = classify("a.c:3:4: note: previous definition is here").unwrap();
        assert_eq!(note.severity, Severity::Note);
    }

    #[test]
    fn test_linker_and_build_failures() {
        assert_eq!(
            classify("Undefined symbols for architecture arm64:").map(|d| d.severity),
            Some(Severity::Error)
        );
        assert_eq!(
            classify("** BUILD FAILED **").map(|d| d.severity),
            Some(Severity::Error)
        );
        assert!(classify("CompileC build/App.o App.m").is_none());
    }

    #[test]
    fn test_ansi_stripping() {
        let ansi_str = "\x1b[31mError:\x1b[0m Something went wrong";
        assert_eq!(strip_ansi(ansi_str), "Error: Something went wrong");
    }
}
