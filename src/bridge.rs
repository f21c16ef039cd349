use std::io::Read;

use anyhow::Context as _;
use log::{debug, info, warn};

use crate::forwarder::{Forwarder, Outcome};
use crate::frame::{FrameReader, ReadOutcome, extract_payloads};
use crate::reading::parse_payload;
use crate::shutdown::Shutdown;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Stats {
    pub frames: u64,
    pub readings: u64,
    pub rejected: u64,
    pub delivered: u64,
    pub dropped: u64,
    /// POST attempts across all readings, retries included.
    pub attempts: u64,
    /// Status of the most recent accepted reading.
    pub last_status: Option<u16>,
    /// Reason the most recently dropped reading was given up on.
    pub last_error: Option<String>,
}

/// Owns the serial connection and the HTTP client for the lifetime of a run.
#[derive(Debug)]
pub struct Bridge<R> {
    frames: FrameReader<R>,
    forwarder: Forwarder,
}

impl<R: Read + Send + 'static> Bridge<R> {
    pub fn new(source: R, forwarder: Forwarder) -> Bridge<R> {
        Bridge {
            frames: FrameReader::new(source),
            forwarder,
        }
    }

    /// Reads, parses and forwards frames until `shutdown` is requested.
    ///
    /// The serial connection is released on every return path. Device
    /// failures end the run with an error; parse rejections and dropped
    /// deliveries do not.
    pub async fn run(self, shutdown: &Shutdown) -> Result<Stats, anyhow::Error> {
        let Bridge {
            mut frames,
            forwarder,
        } = self;
        let mut stats = Stats::default();

        loop {
            if shutdown.is_requested() {
                info!("Shutdown requested, stopping bridge");
                break;
            }

            let (returned, outcome) = tokio::task::spawn_blocking(move || {
                let outcome = frames.next_line();
                (frames, outcome)
            })
            .await
            .context("Serial read task failed")?;
            frames = returned;

            let line = match outcome? {
                ReadOutcome::Line(line) => line,
                ReadOutcome::Pending => continue,
            };

            let payloads = extract_payloads(&line);
            if payloads.is_empty() {
                debug!("Ignoring line without frame: {line:?}");
                continue;
            }

            for payload in payloads {
                stats.frames += 1;
                info!("Received frame: {payload:?}");

                for result in parse_payload(payload) {
                    let reading = match result {
                        Ok(reading) => reading,
                        Err(e) => {
                            stats.rejected += 1;
                            warn!("Rejected payload {payload:?}: {e}");
                            continue;
                        }
                    };

                    stats.readings += 1;
                    let delivery = forwarder.deliver(&reading, shutdown).await;
                    stats.attempts += u64::from(delivery.attempts);
                    match delivery.outcome {
                        Outcome::Delivered(status) => {
                            stats.delivered += 1;
                            stats.last_status = Some(status.as_u16());
                        }
                        Outcome::Dropped(e) => {
                            stats.dropped += 1;
                            stats.last_error = Some(e.to_string());
                        }
                    }
                }
            }
        }

        drop(frames);
        info!("Serial connection closed");
        info!("Bridge stopped: {stats:?}");

        Ok(stats)
    }
}
