use anyhow::Context;
use clap::Parser;
use colored::*;

mod cli;
mod commands;
mod ui;

use cli::{Cli, Command};
use commands::patch::ProcessOptions;

fn init_tracing(debug: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    let config = commands::load_config(cli.config.as_deref()).context("failed to load configuration")?;

    let success = match cli.command {
        Command::Serve { socket } => {
            commands::serve(config, socket).await.context("hub server failed")?;
            true
        }
        Command::Process {
            file,
            dry_run,
            working_dir,
            event_log,
        } => {
            let options = ProcessOptions {
                dry_run,
                working_dir,
                event_log,
            };
            commands::process_file(config, &file, options)
                .await
                .with_context(|| format!("failed to process {}", file.display()))?
        }
        Command::Validate { file } => commands::validate_file(&config, &file)
            .with_context(|| format!("failed to validate {}", file.display()))?,
        Command::Normalize { file } => {
            commands::normalize_file(&file)
                .with_context(|| format!("failed to normalize {}", file.display()))?;
            true
        }
    };

    if !success {
        eprintln!("{} see the report above", "[X]".red());
        std::process::exit(1);
    }

    Ok(())
}
