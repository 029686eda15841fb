use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use kiln_core::config::CONFIG_FILE_NAME;
use kiln_core::reporter::build_reporters;
use kiln_core::{
    extract_build_settings, BuildRun, Cli, Commands, Config, Environment, HistoryCommands,
    LaunchResult, RunHistory, SystemEnvironment,
};

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("KILN_LOG").unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn load_config(cli: &Cli) -> Result<Config> {
    let source_dir = cli
        .source_directory()
        .context("Failed to determine source directory")?;
    Config::load(&source_dir, cli.config.as_deref())
}

async fn run(
    cli: &Cli,
    config: &Config,
    environment: Arc<dyn Environment>,
    title: &str,
    command: &str,
    args: &[String],
) -> Result<LaunchResult> {
    let specs = if cli.reporters.is_empty() {
        config.effective_reporters()
    } else {
        cli.reporters.clone()
    };

    let reporters = match build_reporters(&specs, config) {
        Ok(reporters) => reporters,
        Err(err) => {
            tracing::error!(error = %format!("{:#}", err), "failed to set up reporters");
            return Ok(LaunchResult::reporter_failure(format!("{:#}", err)));
        }
    };

    let mut build = BuildRun::from_config(config, environment, reporters)
        .context("Invalid [parser] configuration")?;
    if let Some(dir) = &cli.source_dir {
        build = build.with_working_dir(dir);
    }

    Ok(build.run(args, command, title).await)
}

async fn print_settings(
    config: &Config,
    environment: &dyn Environment,
    json: bool,
    target: Option<&str>,
    args: &[String],
) -> Result<()> {
    let mut targets = extract_build_settings(environment, &config.tool, args).await?;

    if let Some(name) = target {
        let settings = targets
            .remove(name)
            .with_context(|| format!("No build settings for target {}", name))?;
        targets.clear();
        targets.insert(name.to_string(), settings);
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&targets)?);
        return Ok(());
    }

    for (name, settings) in &targets {
        if !name.is_empty() {
            println!("{}:", name);
        }
        for (key, value) in settings {
            println!("    {} = {}", key, value);
        }
    }
    Ok(())
}

fn list_sdks(environment: &dyn Environment) -> Result<()> {
    let sdks = environment
        .available_sdks()
        .context("Failed to list SDKs")?;

    if sdks.is_empty() {
        println!("No SDKs found.");
        return Ok(());
    }

    for (name, aliases) in sdks {
        if aliases.is_empty() {
            println!("  {}", name);
        } else {
            println!("  {} ({})", name, aliases.join(", "));
        }
    }
    Ok(())
}

fn show_environment(environment: &dyn Environment) {
    let describe = |value: Result<std::path::PathBuf, kiln_core::EnvironmentError>| match value {
        Ok(path) => path.display().to_string(),
        Err(err) => format!("<{}>", err),
    };

    println!("toolchain root: {}", describe(environment.toolchain_root()));
    println!("binaries path:  {}", describe(environment.binaries_path()));
    println!("test mode:      {}", environment.is_test_mode());
}

fn show_history(config: &Config, count: Option<usize>) -> Result<()> {
    let history = RunHistory::new(config.storage_path(), config.history.max_runs)
        .context("Failed to load history")?;

    let entries = history.entries();
    if entries.is_empty() {
        println!("No run history found.");
        return Ok(());
    }

    let count = count.unwrap_or(10).min(entries.len());
    println!("Run History (last {} entries):", count);
    println!();

    for entry in entries.iter().rev().take(count) {
        let status = if entry.success { "✓" } else { "✗" };
        let command = if entry.command.is_empty() {
            String::new()
        } else {
            format!(" {}", entry.command)
        };
        println!(
            "{} {} | {}{} | {:.1}s | {} errors, {} warnings",
            status,
            entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
            entry.title,
            command,
            entry.duration,
            entry.error_count,
            entry.warning_count
        );
        for step in entry.failed_steps() {
            println!("    failed: {}", step.name);
        }
    }

    Ok(())
}

fn clear_history(config: &Config) -> Result<()> {
    let mut history = RunHistory::new(config.storage_path(), config.history.max_runs)
        .context("Failed to load history")?;
    history.clear()?;
    println!("Run history cleared.");
    Ok(())
}

fn init_config(cli: &Cli) -> Result<()> {
    let target_dir = cli
        .source_directory()
        .context("Failed to determine source directory")?;
    let config_path = target_dir.join(CONFIG_FILE_NAME);

    if config_path.exists() {
        anyhow::bail!(
            "{} already exists at {}. Remove it first if you want to reinitialize.",
            CONFIG_FILE_NAME,
            config_path.display()
        );
    }

    Config::default()
        .save_to_file(&config_path)
        .with_context(|| format!("Failed to save {}", CONFIG_FILE_NAME))?;

    println!("Created {} at {}", CONFIG_FILE_NAME, config_path.display());
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();

    if let Commands::Init = cli.command {
        return init_config(&cli);
    }

    let config = load_config(&cli)?;
    let environment: Arc<dyn Environment> = Arc::new(SystemEnvironment::new());

    match &cli.command {
        Commands::Run {
            title,
            command,
            args,
        } => {
            let result = run(&cli, &config, environment, title, command, args).await?;
            std::process::exit(result.process_exit_code());
        }
        Commands::Settings { json, target, args } => {
            print_settings(&config, environment.as_ref(), *json, target.as_deref(), args).await?;
        }
        Commands::Sdks => list_sdks(environment.as_ref())?,
        Commands::Env => show_environment(environment.as_ref()),
        Commands::History { command } => match command {
            HistoryCommands::Show { count } => show_history(&config, *count)?,
            HistoryCommands::Clear => clear_history(&config)?,
        },
        Commands::Init => {}
    }

    Ok(())
}
