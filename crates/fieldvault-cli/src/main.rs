mod cli;
mod config;
mod storage;
mod users;

use crate::cli::{Command, ConfigCommand};
use clap::Parser;
use color_eyre::Result;
use fieldvault_manager::ConnectionManager;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    init_tracing();

    let cli = cli::Cli::parse();
    let config = config::load()?;
    match cli.command {
        Command::Version => print_version(),
        Command::Health => run_health_check(&config).await?,
        Command::Config(ConfigCommand::Init) => init_config(&config)?,
        Command::Config(ConfigCommand::Show) => show_config(&config)?,
        Command::User(cmd) => {
            let manager = storage::manager_from_config(&config)?;
            let result = users::handle(cmd, manager.clone()).await;
            manager.close().await;
            result?
        }
    }

    Ok(())
}

fn init_tracing() {
    // Respect user-provided filters, default to info to avoid noisy stdout.
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(false);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}

fn print_version() {
    println!("fieldvault {}", env!("CARGO_PKG_VERSION"));
}

/// Initializes the manager and pings the store through an encrypted client.
async fn run_health_check(config: &config::Config) -> Result<()> {
    let manager = storage::manager_from_config(config)?;
    let result = check(&manager).await;
    manager.close().await;
    result?;
    println!("Database: ok");
    Ok(())
}

async fn check(manager: &ConnectionManager) -> Result<()> {
    fieldvault_repo::health::check_database(manager)
        .await
        .map_err(|e| color_eyre::eyre::eyre!("{e:#}"))
}

fn init_config(config: &config::Config) -> Result<()> {
    let path = config::write_default_if_missing(config)?;
    println!("Config initialized at {}", path.display());
    Ok(())
}

fn show_config(config: &config::Config) -> Result<()> {
    let settings = storage::settings_from_config(config)?;
    print!("{}", toml::to_string_pretty(&settings)?);
    Ok(())
}
