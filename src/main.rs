use std::fs;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;

use telegramus::app;
use telegramus::config::{Config, SharedConfig};

#[derive(Debug, Parser)]
#[command(version, about = "A Telegram bot for several AI backends")]
struct Args {
    /// Path to the JSON settings file.
    #[arg(short, long, default_value = "settings.json")]
    settings: PathBuf,
}

fn read_config(args: &Args) -> Result<Config, anyhow::Error> {
    let raw = fs::read_to_string(&args.settings)
        .with_context(|| format!("Failed to read {}", args.settings.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse {}", args.settings.display()))
}

#[tokio::main]
async fn main() {
    pretty_env_logger::formatted_timed_builder()
        .filter_level(log::LevelFilter::Info)
        .init();

    let args = Args::parse();
    let config = match read_config(&args) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(1);
        }
    };

    if let Err(err) = app::run(SharedConfig::new(config)).await {
        log::error!("{:#}", err);
        std::process::exit(1);
    }
}
