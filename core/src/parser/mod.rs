pub mod diagnostics;
pub mod grammar;
pub mod stream;

pub use diagnostics::{Diagnostic, Severity};
pub use grammar::{Grammar, GrammarError, StepEnd};
pub use stream::{EventParser, StreamSource};
