//! CLI binary entry point for data-modelling-sink

use clap::Parser;
use data_modelling_sink::cli::commands::run::{RunArgs, handle_run, load_config};
use data_modelling_sink::config::sample_config;
use data_modelling_sink::logging::{LogLevel, init_logging};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "data-modelling-sink")]
#[command(about = "Load newline-delimited JSON streams from stdin into ClickHouse")]
#[command(version)]
struct Cli {
    /// Configuration file (TOML, or JSON with a .json extension)
    #[arg(short, long, env = "SINK_CONFIG")]
    config: Option<PathBuf>,

    /// Write into an in-memory store instead of ClickHouse
    #[arg(long)]
    dry_run: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<LogLevel>,

    /// Print a sample configuration file and exit
    #[arg(long)]
    sample_config: bool,
}

fn main() {
    let cli = Cli::parse();

    if cli.sample_config {
        print!("{}", sample_config());
        return;
    }

    let args = RunArgs {
        config: cli.config,
        dry_run: cli.dry_run,
        log_level: cli.log_level,
    };

    let result = load_config(&args).and_then(|config| {
        if let Err(e) = init_logging(&config.logging) {
            eprintln!("Warning: {}", e);
        }
        handle_run(&args, config)
    });

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
