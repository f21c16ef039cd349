use std::fmt;

use chrono::{DateTime, Local};
use thiserror::Error;

pub const FIELD_COUNT: usize = 6;
pub const FIELD_NAMES: [&str; FIELD_COUNT] =
    ["co2", "temperature", "humidity", "vocs", "pm25", "pm10"];

const ENTRY_SEPARATOR: char = ';';
const FIELD_SEPARATOR: char = ',';

/// One set of environmental measurements captured from the device.
///
/// Units: co2 ppm, temperature °C, humidity %, vocs ppb, pm25/pm10 μg/m³.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub timestamp: DateTime<Local>,
    pub co2: f64,
    pub temperature: f64,
    pub humidity: f64,
    pub vocs: f64,
    pub pm25: f64,
    pub pm10: f64,
}

#[derive(Debug, Error, PartialEq)]
pub enum ParseError {
    #[error("Empty payload")]
    Empty,
    #[error("Expected 6 fields, got {0}")]
    FieldCount(usize),
    #[error("Invalid {field} value: {token:?}")]
    InvalidNumber { field: &'static str, token: String },
}

impl Reading {
    /// Parses a single `co2,temperature,humidity,vocs,pm25,pm10` entry and
    /// stamps it with the current local time.
    pub fn parse(entry: &str) -> Result<Reading, ParseError> {
        if entry.trim().is_empty() {
            return Err(ParseError::Empty);
        }

        let tokens: Vec<&str> = entry.split(FIELD_SEPARATOR).collect();
        if tokens.len() != FIELD_COUNT {
            return Err(ParseError::FieldCount(tokens.len()));
        }

        let mut values = [0.0; FIELD_COUNT];
        for (i, token) in tokens.iter().enumerate() {
            values[i] = token
                .trim()
                .parse::<f64>()
                .map_err(|_| ParseError::InvalidNumber {
                    field: FIELD_NAMES[i],
                    token: token.to_string(),
                })?;
        }

        let [co2, temperature, humidity, vocs, pm25, pm10] = values;
        Ok(Reading {
            timestamp: Local::now(),
            co2,
            temperature,
            humidity,
            vocs,
            pm25,
            pm10,
        })
    }
}

impl fmt::Display for Reading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] co2={} ppm, temperature={} °C, humidity={} %, vocs={} ppb, pm25={} μg/m³, pm10={} μg/m³",
            self.timestamp.to_rfc3339(),
            self.co2,
            self.temperature,
            self.humidity,
            self.vocs,
            self.pm25,
            self.pm10
        )
    }
}

/// Parses a frame payload, which holds one entry or several separated by `;`.
///
/// Entries are independent: a malformed one is reported without affecting
/// the others. A payload without any non-blank entry yields a single
/// [`ParseError::Empty`].
pub fn parse_payload(payload: &str) -> Vec<Result<Reading, ParseError>> {
    let results: Vec<_> = payload
        .split(ENTRY_SEPARATOR)
        .filter(|entry| !entry.trim().is_empty())
        .map(Reading::parse)
        .collect();

    if results.is_empty() {
        return vec![Err(ParseError::Empty)];
    }

    results
}
