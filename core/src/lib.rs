pub mod cli;
pub mod config;
pub mod environment;
pub mod event;
pub mod history;
pub mod launcher;
pub mod orchestrator;
pub mod parser;
pub mod reporter;
pub mod result;
pub mod settings;

pub use cli::{Cli, Commands, HistoryCommands};
pub use config::Config;
pub use environment::{Environment, EnvironmentError, SdkMap, StaticEnvironment, SystemEnvironment};
pub use event::{BuildEvent, EventKind, Payload, Sequence, Value};
pub use history::{RunHistory, RunRecord, StepRecord};
pub use launcher::{launch_and_feed, LaunchOptions};
pub use orchestrator::{run_build, BuildRun, RunState};
pub use parser::{EventParser, Grammar, StreamSource};
pub use reporter::{
    Reporter, ReporterError, ReporterFault, ReporterKind, ReporterMultiplexer, ReporterSpec,
};
pub use result::{ErrorCode, LaunchResult};
pub use settings::{
    extract_build_settings, parse_build_settings, parse_target_build_settings, BuildSettings,
    TargetBuildSettings,
};
