use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::reporter::ReporterSpec;

#[derive(Parser, Debug)]
#[command(name = "kiln")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[arg(
        short = 'C',
        long = "directory",
        value_name = "DIR",
        global = true,
        help = "Source directory"
    )]
    pub source_dir: Option<PathBuf>,

    #[arg(long, global = true, help = "Configuration file path")]
    pub config: Option<PathBuf>,

    #[arg(
        short = 'r',
        long = "reporter",
        value_name = "KIND[:OUTPUT]",
        global = true,
        help = "Reporter to attach (console, json, summary, history); repeatable"
    )]
    pub reporters: Vec<ReporterSpec>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum HistoryCommands {
    #[command(about = "Show recorded runs")]
    Show {
        #[arg(short, long, help = "Number of entries to show")]
        count: Option<usize>,
    },

    #[command(about = "Clear recorded runs")]
    Clear,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    #[command(about = "Run the build tool and report its events")]
    Run {
        #[arg(long, default_value = "build", help = "Title shown by reporters")]
        title: String,

        #[arg(long, default_value = "", help = "Action appended to the arguments (build, test, ...)")]
        command: String,

        #[arg(last = true, help = "Arguments passed to the build tool")]
        args: Vec<String>,
    },

    #[command(about = "Print resolved build settings")]
    Settings {
        #[arg(long, help = "Print as JSON")]
        json: bool,

        #[arg(long, help = "Only show settings for this target")]
        target: Option<String>,

        #[arg(last = true, help = "Arguments passed to the build tool")]
        args: Vec<String>,
    },

    #[command(about = "List available SDKs")]
    Sdks,

    #[command(about = "Show resolved toolchain environment")]
    Env,

    #[command(about = "Manage run history")]
    History {
        #[command(subcommand)]
        command: HistoryCommands,
    },

    #[command(about = "Initialize a new kiln.toml configuration")]
    Init,
}

impl Cli {
    pub fn source_directory(&self) -> std::io::Result<PathBuf> {
        match &self.source_dir {
            Some(dir) => Ok(dir.clone()),
            None => std::env::current_dir(),
        }
    }
}
