//! Test doubles for the serial device and the ingestion endpoint.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{MethodRouter, post};
use axum::{Json, Router};
use log::{Level, LevelFilter, Log, Metadata, Record};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::shutdown::Shutdown;

/// Serial stand-in replaying scripted chunks and errors.
///
/// Once the script is exhausted it reports end of stream, or, when built
/// with [`ScriptedSource::then_shutdown`], requests shutdown and times out
/// as a port would when a signal arrives mid-read.
#[derive(Debug)]
pub struct ScriptedSource {
    steps: VecDeque<io::Result<Vec<u8>>>,
    shutdown: Option<Shutdown>,
    reads: Arc<AtomicUsize>,
    closed: Arc<AtomicBool>,
}

impl ScriptedSource {
    pub fn new(steps: Vec<io::Result<Vec<u8>>>) -> ScriptedSource {
        ScriptedSource {
            steps: steps.into(),
            shutdown: None,
            reads: Arc::new(AtomicUsize::new(0)),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn then_shutdown(mut self, shutdown: &Shutdown) -> ScriptedSource {
        self.shutdown = Some(shutdown.clone());
        self
    }

    pub fn reads(&self) -> Arc<AtomicUsize> {
        self.reads.clone()
    }

    pub fn closed(&self) -> Arc<AtomicBool> {
        self.closed.clone()
    }
}

impl Read for ScriptedSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        match self.steps.pop_front() {
            None => match &self.shutdown {
                Some(shutdown) => {
                    shutdown.request();
                    Err(io::ErrorKind::TimedOut.into())
                }
                None => Ok(0),
            },
            Some(Err(e)) => Err(e),
            Some(Ok(mut bytes)) => {
                let n = bytes.len().min(buf.len());
                buf[..n].copy_from_slice(&bytes[..n]);
                if n < bytes.len() {
                    self.steps.push_front(Ok(bytes.split_off(n)));
                }
                Ok(n)
            }
        }
    }
}

impl Drop for ScriptedSource {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// In-process ingestion endpoint answering with scripted status codes.
pub struct StubEndpoint {
    pub url: String,
    state: StubState,
    task: JoinHandle<()>,
}

#[derive(Debug, Clone, Default)]
struct StubState {
    statuses: Arc<Mutex<VecDeque<u16>>>,
    bodies: Arc<Mutex<Vec<String>>>,
}

impl StubEndpoint {
    /// Answers the n-th request with `statuses[n]`, and 200 once exhausted.
    pub async fn spawn(statuses: Vec<u16>) -> StubEndpoint {
        StubEndpoint::serve(post(ingest), statuses).await
    }

    /// Accepts requests but never answers.
    pub async fn spawn_hanging() -> StubEndpoint {
        StubEndpoint::serve(post(hang), vec![]).await
    }

    async fn serve(handler: MethodRouter<StubState>, statuses: Vec<u16>) -> StubEndpoint {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/api/readings", listener.local_addr().unwrap());
        let state = StubState {
            statuses: Arc::new(Mutex::new(statuses.into())),
            ..StubState::default()
        };

        let app = Router::new()
            .route("/api/readings", handler)
            .with_state(state.clone());
        let task = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        StubEndpoint { url, state, task }
    }

    pub fn bodies(&self) -> Vec<String> {
        self.state.bodies.lock().unwrap().clone()
    }

    pub fn request_count(&self) -> usize {
        self.state.bodies.lock().unwrap().len()
    }
}

impl Drop for StubEndpoint {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn ingest(State(state): State<StubState>, body: String) -> (StatusCode, Json<Value>) {
    state.bodies.lock().unwrap().push(body);
    let code = state.statuses.lock().unwrap().pop_front().unwrap_or(200);

    let status = StatusCode::from_u16(code).unwrap();
    let reply = if status.is_success() { "success" } else { "error" };
    (status, Json(json!({ "status": reply })))
}

async fn hang(State(state): State<StubState>, body: String) -> StatusCode {
    state.bodies.lock().unwrap().push(body);
    std::future::pending::<()>().await;
    StatusCode::OK
}

thread_local! {
    static CAPTURED: RefCell<Vec<(Level, String)>> = const { RefCell::new(Vec::new()) };
}

/// Logger recording into a per-thread buffer, so concurrently running tests
/// only see records emitted on their own thread.
struct CapturingLogger;

impl Log for CapturingLogger {
    fn enabled(&self, _: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        CAPTURED.with(|captured| {
            captured
                .borrow_mut()
                .push((record.level(), record.args().to_string()))
        });
    }

    fn flush(&self) {}
}

static LOGGER: CapturingLogger = CapturingLogger;

/// Installs the capturing logger and clears this thread's buffer.
pub fn capture_logs() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        log::set_logger(&LOGGER).unwrap();
        log::set_max_level(LevelFilter::Trace);
    });
    CAPTURED.with(|captured| captured.borrow_mut().clear());
}

/// Messages logged on this thread at `level` that start with `prefix`.
pub fn captured_logs(level: Level, prefix: &str) -> Vec<String> {
    CAPTURED.with(|captured| {
        captured
            .borrow()
            .iter()
            .filter(|(l, message)| *l == level && message.starts_with(prefix))
            .map(|(_, message)| message.clone())
            .collect()
    })
}
