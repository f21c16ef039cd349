use std::fs::OpenOptions;
use std::path::Path;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use args::Args;
use backon::BlockingRetryable;
use backon::ConstantBuilder;
use bridge::Bridge;
use clap::Parser as _;
use forwarder::Forwarder;
use log::LevelFilter;
use serialport::SerialPort;
use shutdown::{Shutdown, wait_for_signal};
use simplelog::{ColorChoice, CombinedLogger, ConfigBuilder, TermLogger, TerminalMode, WriteLogger};

mod args;
mod bridge;
mod forwarder;
mod frame;
mod reading;
mod shutdown;
#[cfg(test)]
mod testing;

const OPEN_RETRY_DELAY: Duration = Duration::from_secs(2);
const OPEN_MAX_RETRIES: usize = 2;

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    if let Err(e) = init_logger(&args.log_file) {
        eprintln!("{e:#}");
        return ExitCode::FAILURE;
    }

    if let Err(e) = run(args).await {
        log::error!("{e:#}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

fn init_logger(log_file: &Path) -> Result<(), anyhow::Error> {
    let config = ConfigBuilder::new()
        .set_time_format_rfc3339()
        .set_time_offset_to_local()
        .map_err(|_| anyhow::anyhow!("Failed to set time offset to local"))?
        .build();

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_file)
        .with_context(|| format!("Failed to open log file {}", log_file.display()))?;

    CombinedLogger::init(vec![
        TermLogger::new(
            LevelFilter::Info,
            config.clone(),
            TerminalMode::Mixed,
            ColorChoice::Auto,
        ),
        WriteLogger::new(LevelFilter::Info, config, file),
    ])
    .context("Failed to initialize logger")?;

    Ok(())
}

async fn run(args: Args) -> Result<(), anyhow::Error> {
    args.validate().context("Invalid configuration")?;

    let forwarder =
        Forwarder::new(&args.forwarder_config()).context("Failed to initialize forwarder")?;
    let port = open_port(&args)?;

    log::info!(
        "Listening on {} at {} baud, forwarding to {}",
        args.port,
        args.baud_rate,
        forwarder.url()
    );

    let shutdown = Shutdown::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        match wait_for_signal().await {
            Ok(()) => {
                log::info!("Termination signal received");
                trigger.request();
            }
            Err(e) => log::error!("{e:#}"),
        }
    });

    Bridge::new(port, forwarder)
        .run(&shutdown)
        .await
        .context("Serial bridge failed")?;

    Ok(())
}

fn open_port(args: &Args) -> Result<Box<dyn SerialPort>, anyhow::Error> {
    let retry_builder = ConstantBuilder::default()
        .with_delay(OPEN_RETRY_DELAY)
        .with_max_times(OPEN_MAX_RETRIES);

    (|| {
        serialport::new(&args.port, args.baud_rate)
            .timeout(args.read_timeout())
            .open()
    })
    .retry(retry_builder)
    .notify(|e, dur| {
        log::error!("{e}");
        log::info!("Retrying in {:?}", dur);
    })
    .call()
    .with_context(|| format!("Failed to open serial port {}", args.port))
}
