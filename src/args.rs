use std::path::PathBuf;
use std::time::Duration;

use anyhow::ensure;
use clap::Parser;

use crate::forwarder::ForwarderConfig;

/// Forwards sensor frames read from a serial device to an HTTP ingestion endpoint.
#[derive(Debug, Parser)]
pub struct Args {
    /// Serial device path, e.g. /dev/ttyACM0
    #[arg(long, env = "SERIAL_PORT")]
    pub port: String,

    #[arg(long, env = "BAUD_RATE", default_value_t = 115_200)]
    pub baud_rate: u32,

    /// Upper bound of a single serial read, which is also how long a
    /// shutdown request may go unnoticed.
    #[arg(long, env = "SERIAL_READ_TIMEOUT_MS", default_value_t = 1000)]
    pub read_timeout_ms: u64,

    #[arg(long, env = "INGEST_URL", default_value = "http://localhost:8000/api/readings")]
    pub ingest_url: String,

    #[arg(long, env = "REQUEST_TIMEOUT_MS", default_value_t = 5000)]
    pub request_timeout_ms: u64,

    /// Total POST attempts per reading.
    #[arg(long, env = "MAX_ATTEMPTS", default_value_t = 3)]
    pub max_attempts: u32,

    #[arg(long, env = "RETRY_DELAY_MS", default_value_t = 1000)]
    pub retry_delay_ms: u64,

    #[arg(long, env = "LOG_FILE", default_value = "./serial-bridge.log")]
    pub log_file: PathBuf,
}

impl Args {
    /// Rejects values that would make the bridge spin or never deliver.
    pub fn validate(&self) -> Result<(), anyhow::Error> {
        ensure!(self.read_timeout_ms > 0, "Serial read timeout must be positive");
        ensure!(self.request_timeout_ms > 0, "Request timeout must be positive");
        ensure!(self.max_attempts >= 1, "Max attempts must be at least 1");
        Ok(())
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn forwarder_config(&self) -> ForwarderConfig {
        ForwarderConfig {
            url: self.ingest_url.clone(),
            timeout: Duration::from_millis(self.request_timeout_ms),
            max_attempts: self.max_attempts,
            retry_delay: Duration::from_millis(self.retry_delay_ms),
        }
    }
}
