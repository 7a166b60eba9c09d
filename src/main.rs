#![allow(clippy::multiple_crate_versions)]

use clap::{Arg, ArgAction, ArgMatches, Command};
use sft_core::config::{LogFormat, LoggingConfig};
use sft_core::Config;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn cli() -> Command {
    Command::new("sftd")
        .version(VERSION)
        .about("Site functional test daemon")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .global(true)
                .help("Path to the TOML configuration file"),
        )
        .subcommand_required(true)
        .subcommand(Command::new("start").about("Run the daemon in the foreground"))
        .subcommand(Command::new("stop").about("Signal a running daemon to stop"))
        .subcommand(Command::new("restart").about("Stop the running daemon and start a new one"))
        .subcommand(
            Command::new("load")
                .about("Load cluster, VO, user, test and SFT definitions into the store")
                .arg(
                    Arg::new("file")
                        .value_name("DEFINITIONS")
                        .required(true)
                        .help("TOML definitions file"),
                )
                .arg(
                    Arg::new("replace-downtime")
                        .long("replace-downtime")
                        .action(ArgAction::SetTrue)
                        .help("Clear scheduled downtime before adding the file's windows"),
                ),
        )
        .subcommand(
            Command::new("jobs")
                .about("List recorded test jobs, newest first")
                .arg(
                    Arg::new("sft")
                        .long("sft")
                        .value_name("NAME")
                        .help("Only show jobs of this SFT"),
                )
                .arg(
                    Arg::new("limit")
                        .short('n')
                        .long("limit")
                        .value_name("N")
                        .value_parser(clap::value_parser!(usize))
                        .default_value("50")
                        .help("Maximum number of rows"),
                ),
        )
        .subcommand(
            Command::new("check")
                .about("Validate every SFT definition and report those the daemon would drop"),
        )
}

fn load_config(matches: &ArgMatches) -> anyhow::Result<Config> {
    let mut config = match matches.get_one::<String>("config") {
        Some(path) => Config::from_file(PathBuf::from(path))?,
        None => Config::default(),
    };
    config.apply_env_overrides();
    config.validate()?;
    Ok(config)
}

/// `RUST_LOG` wins over the configured level.
fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.pretty().init(),
        LogFormat::Compact => builder.compact().init(),
    }
}

async fn dispatch(matches: &ArgMatches) -> anyhow::Result<()> {
    let config = load_config(matches)?;
    init_tracing(&config.logging);

    match matches.subcommand() {
        Some(("start", _)) => commands::daemon::start(&config).await,
        Some(("stop", _)) => commands::daemon::stop(&config).map(|_| ()),
        Some(("restart", _)) => commands::daemon::restart(&config).await,
        Some(("load", sub)) => commands::load::run(&config, sub).await,
        Some(("jobs", sub)) => commands::jobs::run(&config, sub).await,
        Some(("check", _)) => commands::check::run(&config).await,
        _ => {
            println!("sftd v{}", VERSION);
            println!("Use --help for available commands");
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() {
    let matches = cli().get_matches();
    if let Err(e) = dispatch(&matches).await {
        eprintln!("✗ {:#}", e);
        std::process::exit(1);
    }
}
