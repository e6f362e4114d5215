//! The `run` command: read protocol lines, write STATE values

use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{info, warn};

use crate::cli::error::CliError;
use crate::config::SinkConfig;
use crate::logging::LogLevel;
use crate::orchestrator::{Sink, SinkReport};
use crate::protocol::parse_line;
use crate::store::{ClickHouseStore, MemoryStore, StoreClient};

/// Arguments of a sink run
#[derive(Debug, Clone, Default)]
pub struct RunArgs {
    /// Configuration file; defaults plus environment overrides when absent
    pub config: Option<PathBuf>,
    /// Write into an in-memory store instead of ClickHouse
    pub dry_run: bool,
    /// Overrides the configured log level
    pub log_level: Option<LogLevel>,
}

/// Resolve the effective configuration for `args`
pub fn load_config(args: &RunArgs) -> Result<SinkConfig, CliError> {
    let mut config = match &args.config {
        Some(path) => SinkConfig::load(path)?,
        None => {
            let mut config = SinkConfig::default();
            config.apply_env_overrides();
            config.validate()?;
            config
        }
    };
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    Ok(config)
}

/// Run the sink over stdin and stdout
pub fn handle_run(args: &RunArgs, config: SinkConfig) -> Result<SinkReport, CliError> {
    let rt = tokio::runtime::Runtime::new()
        .map_err(|e| CliError::IoError(format!("Failed to create runtime: {}", e)))?;

    let store: Arc<dyn StoreClient> = if args.dry_run {
        info!("Dry run: writing to an in-memory store");
        Arc::new(MemoryStore::new())
    } else {
        let store = ClickHouseStore::new(&config.clickhouse)?;
        info!(url = %store.url_masked(), database = %config.clickhouse.database, "Connecting to ClickHouse");
        Arc::new(store)
    };

    rt.block_on(async {
        let sink = Sink::new(store, config.ingest.clone());
        let input = BufReader::new(tokio::io::stdin());
        let mut output = tokio::io::stdout();
        run_sink(sink, input, &mut output).await
    })
}

/// Feed every line of `input` to `sink`, writing echoed STATE values to
/// `output`.
///
/// Processing stops at the first fatal error. Surviving streams are then
/// still finalized, except staged clean-first loads, which are discarded.
pub async fn run_sink<S, R, W>(
    mut sink: Sink<S>,
    input: R,
    output: &mut W,
) -> Result<SinkReport, CliError>
where
    S: StoreClient + ?Sized,
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = input.lines();
    let mut line_no = 0;
    let mut fatal: Option<CliError> = None;

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                fatal = Some(CliError::IoError(e.to_string()));
                break;
            }
        };
        line_no += 1;

        let message = match parse_line(&line, line_no) {
            Ok(Some(message)) => message,
            Ok(None) => continue,
            Err(e) => {
                fatal = Some(e.into());
                break;
            }
        };

        match sink.handle(message).await {
            Ok(Some(state)) => {
                if let Err(e) = write_state(output, &state).await {
                    fatal = Some(e);
                    break;
                }
            }
            Ok(None) => {}
            Err(e) => {
                fatal = Some(e.into());
                break;
            }
        }
    }

    let report = if fatal.is_some() {
        sink.finish_interrupted().await
    } else {
        sink.finish().await
    };
    if let Some(e) = fatal {
        warn!(line = line_no, "Stopped reading input: {}", e);
        return Err(e);
    }
    if !report.is_success() {
        return Err(CliError::StreamsFailed(
            report.failures.keys().cloned().collect(),
        ));
    }
    Ok(report)
}

async fn write_state<W: AsyncWrite + Unpin>(output: &mut W, state: &Value) -> Result<(), CliError> {
    let mut line = serde_json::to_string(state).map_err(|e| CliError::IoError(e.to_string()))?;
    line.push('\n');
    output
        .write_all(line.as_bytes())
        .await
        .map_err(|e| CliError::IoError(e.to_string()))?;
    output
        .flush()
        .await
        .map_err(|e| CliError::IoError(e.to_string()))
}
