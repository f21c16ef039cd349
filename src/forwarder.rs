use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use anyhow::{Context as _, ensure};
use backon::{ConstantBuilder, Retryable};
use log::{debug, error, info, warn};
use reqwest::{Client, StatusCode, Url};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::reading::Reading;
use crate::shutdown::Shutdown;

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// JSON body accepted by the ingestion endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestBody {
    pub timestamp: String,
    pub co2: f64,
    pub temperature: f64,
    pub humidity: f64,
    pub vocs: f64,
    pub pm25: f64,
    pub pm10: f64,
}

impl From<&Reading> for IngestBody {
    fn from(reading: &Reading) -> IngestBody {
        IngestBody {
            timestamp: reading.timestamp.format(TIMESTAMP_FORMAT).to_string(),
            co2: reading.co2,
            temperature: reading.temperature,
            humidity: reading.humidity,
            vocs: reading.vocs,
            pm25: reading.pm25,
            pm10: reading.pm10,
        }
    }
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("Endpoint responded with {0}")]
    Status(StatusCode),
}

#[derive(Debug)]
pub enum Outcome {
    Delivered(StatusCode),
    /// Retries exhausted (or shutdown requested); carries the last error.
    Dropped(DeliveryError),
}

#[derive(Debug)]
pub struct Delivery {
    pub attempts: u32,
    pub outcome: Outcome,
}

#[derive(Debug, Clone)]
pub struct ForwarderConfig {
    pub url: String,
    pub timeout: Duration,
    pub max_attempts: u32,
    pub retry_delay: Duration,
}

/// Posts readings to the ingestion endpoint with bounded retry.
#[derive(Debug)]
pub struct Forwarder {
    client: Client,
    url: Url,
    max_attempts: u32,
    retry_delay: Duration,
}

impl Forwarder {
    pub fn new(config: &ForwarderConfig) -> Result<Forwarder, anyhow::Error> {
        ensure!(config.max_attempts >= 1, "Max attempts must be at least 1");
        ensure!(!config.timeout.is_zero(), "Request timeout must be positive");

        let url = Url::parse(&config.url)
            .with_context(|| format!("Invalid ingestion URL: {}", config.url))?;
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Forwarder {
            client,
            url,
            max_attempts: config.max_attempts,
            retry_delay: config.retry_delay,
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Delivers one reading. Failures are logged and reported in the
    /// returned [`Delivery`], never raised.
    ///
    /// No further attempt is started once `shutdown` has been requested.
    pub async fn deliver(&self, reading: &Reading, shutdown: &Shutdown) -> Delivery {
        let body = IngestBody::from(reading);
        let attempts = AtomicU32::new(0);
        let retry = ConstantBuilder::default()
            .with_delay(self.retry_delay)
            .with_max_times((self.max_attempts - 1) as usize);

        let (body_ref, attempts_ref) = (&body, &attempts);
        let result = (move || async move {
            let attempt = attempts_ref.fetch_add(1, Ordering::Relaxed) + 1;
            self.post(body_ref).await.inspect_err(|e| {
                warn!(
                    "Delivery attempt {attempt}/{} failed for {reading}: {e}",
                    self.max_attempts
                )
            })
        })
        .retry(retry)
        .sleep(tokio::time::sleep)
        .when(|_| !shutdown.is_requested())
        .notify(|_, dur| debug!("Retrying delivery in {dur:?}"))
        .await;

        let attempts = attempts.load(Ordering::Relaxed);
        match result {
            Ok(status) => {
                info!("Delivered {reading} ({status}, attempt {attempts})");
                Delivery {
                    attempts,
                    outcome: Outcome::Delivered(status),
                }
            }
            Err(e) => {
                error!("Dropping {reading} after {attempts} attempt(s): {e}");
                Delivery {
                    attempts,
                    outcome: Outcome::Dropped(e),
                }
            }
        }
    }

    async fn post(&self, body: &IngestBody) -> Result<StatusCode, DeliveryError> {
        let response = self.client.post(self.url.clone()).json(body).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(DeliveryError::Status(status));
        }

        Ok(status)
    }
}
