use std::io::{ErrorKind, Read};

use anyhow::{Context as _, bail};
use log::{debug, warn};

pub const START_TAG: &str = "<DATA>";
pub const END_TAG: &str = "</DATA>";

/// Longest unterminated line kept in the buffer before it is discarded.
pub const MAX_LINE_LENGTH: usize = 4096;

const READ_CHUNK_SIZE: usize = 1024;
const LINE_TERMINATOR: u8 = b'\n';

#[derive(Debug, PartialEq)]
pub enum ReadOutcome {
    /// A complete, cleaned line.
    Line(String),
    /// No complete line yet: the read timed out or only part of a line arrived.
    Pending,
}

/// Splits the byte stream of a serial device into lines.
#[derive(Debug)]
pub struct FrameReader<R> {
    source: R,
    buffer: Vec<u8>,
}

impl<R: Read> FrameReader<R> {
    pub fn new(source: R) -> FrameReader<R> {
        FrameReader {
            source,
            buffer: Vec::with_capacity(READ_CHUNK_SIZE),
        }
    }

    /// Returns the next buffered line, or performs one bounded read.
    ///
    /// A read timeout is reported as [`ReadOutcome::Pending`]. End of stream
    /// and any other I/O error mean the device is gone.
    pub fn next_line(&mut self) -> Result<ReadOutcome, anyhow::Error> {
        if let Some(line) = self.take_line() {
            return Ok(ReadOutcome::Line(line));
        }

        let mut chunk = [0u8; READ_CHUNK_SIZE];
        let n = match self.source.read(&mut chunk) {
            Ok(0) => bail!("Serial device closed the connection"),
            Ok(n) => n,
            Err(e)
                if matches!(
                    e.kind(),
                    ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
                ) =>
            {
                return Ok(ReadOutcome::Pending);
            }
            Err(e) => return Err(e).context("Failed to read from serial device"),
        };
        self.buffer.extend_from_slice(&chunk[..n]);

        if let Some(line) = self.take_line() {
            return Ok(ReadOutcome::Line(line));
        }

        if self.buffer.len() > MAX_LINE_LENGTH {
            warn!(
                "Discarding {} buffered bytes without a line terminator",
                self.buffer.len()
            );
            self.buffer.clear();
        }

        Ok(ReadOutcome::Pending)
    }

    fn take_line(&mut self) -> Option<String> {
        let pos = self.buffer.iter().position(|&b| b == LINE_TERMINATOR)?;
        let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
        let line = clean_line(&String::from_utf8_lossy(&raw));
        debug!("Line: {line:?}");
        Some(line)
    }
}

/// Strips ANSI escape sequences and control characters (except tab) and
/// trims surrounding whitespace.
pub fn clean_line(raw: &str) -> String {
    let mut cleaned = String::with_capacity(raw.len());
    let mut chars = raw.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '\x1b' && chars.peek() == Some(&'[') {
            chars.next();
            while chars
                .peek()
                .is_some_and(|c| c.is_ascii_digit() || *c == ';')
            {
                chars.next();
            }
            if matches!(chars.peek(), Some('m' | 'K')) {
                chars.next();
            }
            continue;
        }

        if c.is_control() && c != '\t' {
            continue;
        }

        cleaned.push(c);
    }

    cleaned.trim().to_string()
}

/// Returns every payload enclosed in `<DATA>`/`</DATA>` on the line, in order.
pub fn extract_payloads(line: &str) -> Vec<&str> {
    let mut payloads = Vec::new();
    let mut rest = line;

    while let Some(start) = rest.find(START_TAG) {
        let after_start = &rest[start + START_TAG.len()..];
        let Some(end) = after_start.find(END_TAG) else {
            break;
        };
        payloads.push(&after_start[..end]);
        rest = &after_start[end + END_TAG.len()..];
    }

    payloads
}
