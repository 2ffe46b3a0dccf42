//! Protocol engine.
//!
//! Drives the strictly synchronous request/response conversation with the
//! kernel. Responses are matched to requests by FIFO order on the pipe, so
//! every public entry point serializes through one `tokio::sync::Mutex`;
//! the critical section spans from the request write to its terminal
//! response, including all nested callbacks.
//!
//! A `callback` response is not terminal: the handler runs on the task that
//! holds the lock and may issue further kernel requests through its
//! [`KernelSession`] before the engine sends the matching `complete` and
//! resumes reading replies for the original request.

use crate::config::KernelConfig;
use crate::error::{JsiiError, Result};
use crate::process::{KernelProcess, KernelSpec};
use crate::registry::ObjectRegistry;
use crate::wire::{self, Callback, Request, Response, WireObjRef};
use futures::FutureExt;
use regex::Regex;
use serde_json::Value as JsonValue;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::sync::Mutex;
use tracing::{debug, warn};

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Handles callback descriptors on behalf of the engine.
///
/// `Ok(Some(v))` completes the callback with a result, `Ok(None)` completes
/// it as void, `Err(message)` reports a host-side failure. The session gives
/// the handler reentrant access to the kernel while the engine lock is held;
/// a panicking handler is captured and reported as an error completion.
#[async_trait::async_trait]
pub trait CallbackHandler: Send + Sync {
    async fn handle(
        &self,
        callback: &Callback,
        kernel: &mut KernelSession<'_>,
    ) -> std::result::Result<Option<JsonValue>, String>;
}

struct Connection {
    reader: BufReader<BoxedReader>,
    writer: BoxedWriter,
    process: Option<KernelProcess>,
    depth: usize,
}

enum StartMode {
    Spawn(KernelSpec),
    Attached(Connection),
}

enum EngineState {
    Idle(StartMode),
    Ready(Connection),
    Poisoned(String),
}

struct EngineShared {
    state: Mutex<EngineState>,
    handler: RwLock<Option<Arc<dyn CallbackHandler>>>,
    registry: Arc<ObjectRegistry>,
    expected_version: String,
}

/// The serialized request/response engine.
pub struct Engine {
    shared: Arc<EngineShared>,
}

impl Engine {
    /// Engine that spawns the kernel lazily on first use.
    pub fn new(spec: KernelSpec, registry: Arc<ObjectRegistry>) -> Self {
        let expected_version = spec.expected_version().to_string();
        Self {
            shared: Arc::new(EngineShared {
                state: Mutex::new(EngineState::Idle(StartMode::Spawn(spec))),
                handler: RwLock::new(None),
                registry,
                expected_version,
            }),
        }
    }

    /// Engine wired to an already-connected transport instead of a spawned
    /// process. The handshake still runs on first use.
    pub fn from_transport<R, W>(
        reader: R,
        writer: W,
        expected_version: impl Into<String>,
        registry: Arc<ObjectRegistry>,
    ) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let connection = Connection {
            reader: BufReader::new(Box::new(reader)),
            writer: Box::new(writer),
            process: None,
            depth: 0,
        };
        Self {
            shared: Arc::new(EngineShared {
                state: Mutex::new(EngineState::Idle(StartMode::Attached(connection))),
                handler: RwLock::new(None),
                registry,
                expected_version: expected_version.into(),
            }),
        }
    }

    /// Installs the handler invoked for callback responses.
    pub fn set_callback_handler(&self, handler: Arc<dyn CallbackHandler>) {
        if let Ok(mut slot) = self.shared.handler.write() {
            *slot = Some(handler);
        }
    }

    /// Starts the kernel and performs the handshake. Idempotent: a running
    /// kernel is left alone.
    pub async fn start(&self) -> Result<()> {
        let mut state = self.shared.state.lock().await;
        self.ensure_started(&mut state).await
    }

    /// Whether an unrecoverable failure has retired this engine.
    pub async fn is_poisoned(&self) -> bool {
        matches!(&*self.shared.state.lock().await, EngineState::Poisoned(_))
    }

    /// Sends one request and returns the value of its `ok` response.
    ///
    /// Queued proxy deletions drain first, so `del` traffic never interleaves
    /// with an in-flight request. A fatal failure poisons the engine and
    /// terminates the kernel.
    pub async fn request(&self, request: Request) -> Result<JsonValue> {
        let mut state = self.shared.state.lock().await;
        self.ensure_started(&mut state).await?;

        let pending = self.shared.registry.take_pending();
        let outcome = {
            let conn = match &mut *state {
                EngineState::Ready(conn) => conn,
                EngineState::Poisoned(reason) => {
                    return Err(JsiiError::Poisoned {
                        reason: reason.clone(),
                    })
                }
                EngineState::Idle(_) => {
                    return Err(JsiiError::protocol("engine failed to start"))
                }
            };

            let mut fatal = None;
            for handle in pending {
                let del = Request::Del {
                    objref: WireObjRef::bare(&handle),
                };
                match round_trip(&self.shared, conn, del).await {
                    Ok(_) => debug!("released {}", handle),
                    Err(e) if e.is_fatal() => {
                        fatal = Some(e);
                        break;
                    }
                    Err(e) => warn!("queued deletion of {} failed: {}", handle, e),
                }
            }

            match fatal {
                Some(e) => Err(e),
                None => round_trip(&self.shared, conn, request).await,
            }
        };

        match outcome {
            Err(e) if e.is_fatal() => Err(poison(&mut state, e).await),
            other => other,
        }
    }

    /// Shuts the kernel down: closes its stdin, waits out the grace period,
    /// then kills it. The engine is retired either way.
    pub async fn stop(&self) -> Result<()> {
        let mut state = self.shared.state.lock().await;
        let previous = std::mem::replace(
            &mut *state,
            EngineState::Poisoned("client shut down".to_string()),
        );
        match previous {
            EngineState::Ready(connection) => {
                let Connection {
                    writer, process, ..
                } = connection;
                drop(writer);
                if let Some(mut process) = process {
                    process.stop(KernelConfig::SHUTDOWN_GRACE).await?;
                }
                Ok(())
            }
            // Poisoning already terminated the kernel; keep the original
            // reason for later callers.
            EngineState::Poisoned(reason) => {
                *state = EngineState::Poisoned(reason);
                Ok(())
            }
            EngineState::Idle(_) => Ok(()),
        }
    }

    async fn ensure_started(&self, state: &mut EngineState) -> Result<()> {
        let previous = std::mem::replace(
            &mut *state,
            EngineState::Poisoned("engine start was interrupted".to_string()),
        );
        let mode = match previous {
            EngineState::Ready(connection) => {
                *state = EngineState::Ready(connection);
                return Ok(());
            }
            EngineState::Poisoned(reason) => {
                let error = JsiiError::Poisoned {
                    reason: reason.clone(),
                };
                *state = EngineState::Poisoned(reason);
                return Err(error);
            }
            EngineState::Idle(mode) => mode,
        };

        let connection = match mode {
            StartMode::Attached(connection) => connection,
            StartMode::Spawn(spec) => match KernelProcess::spawn(&spec) {
                Ok((process, stdin, stdout)) => Connection {
                    reader: BufReader::new(Box::new(stdout)),
                    writer: Box::new(stdin),
                    process: Some(process),
                    depth: 0,
                },
                Err(e) => {
                    // Nothing was launched; the environment can be fixed and
                    // a later call may succeed.
                    *state = EngineState::Idle(StartMode::Spawn(spec));
                    return Err(e);
                }
            },
        };

        let mut connection = connection;
        match handshake(&mut connection, &self.shared.expected_version).await {
            Ok(version) => {
                debug!("kernel handshake complete (version {})", version);
                *state = EngineState::Ready(connection);
                Ok(())
            }
            Err(e) => {
                if let Some(mut process) = connection.process {
                    drop(connection.writer);
                    process.kill().await;
                }
                *state = EngineState::Poisoned(e.to_string());
                Err(e)
            }
        }
    }
}

/// Reentrant access to the kernel from inside a callback.
///
/// Borrows the engine's connection, so nested requests run on the caller's
/// task under the already-held engine lock and keep the FIFO order intact.
pub struct KernelSession<'a> {
    shared: &'a EngineShared,
    conn: &'a mut Connection,
}

impl KernelSession<'_> {
    /// Sends a nested request and returns the value of its `ok` response.
    pub async fn request(&mut self, request: Request) -> Result<JsonValue> {
        round_trip(self.shared, self.conn, request).await
    }

    /// Current callback nesting depth (1 for a top-level callback).
    pub fn depth(&self) -> usize {
        self.conn.depth
    }
}

async fn poison(state: &mut EngineState, error: JsiiError) -> JsiiError {
    warn!("engine poisoned: {}", error);
    let previous = std::mem::replace(&mut *state, EngineState::Poisoned(error.to_string()));
    if let EngineState::Ready(connection) = previous {
        drop(connection.writer);
        if let Some(mut process) = connection.process {
            process.kill().await;
        }
    }
    error
}

async fn handshake(conn: &mut Connection, expected: &str) -> Result<String> {
    match read_one(conn).await? {
        Response::Hello { version } => {
            assert_version_compatible(expected, &version)?;
            Ok(version)
        }
        _ => Err(JsiiError::protocol(
            "expected a 'hello' message from the kernel",
        )),
    }
}

/// Exact version equality, ignoring a trailing `+build` suffix on either
/// side.
fn assert_version_compatible(expected: &str, actual: &str) -> Result<()> {
    let build_suffix = Regex::new(r"\+[a-z0-9]+$").expect("hardcoded pattern");
    let short_expected = build_suffix.replace(expected, "");
    let short_actual = build_suffix.replace(actual, "");
    if short_expected != short_actual {
        return Err(JsiiError::IncompatibleRuntime {
            expected: short_expected.into_owned(),
            actual: short_actual.into_owned(),
        });
    }
    Ok(())
}

async fn read_one(conn: &mut Connection) -> Result<Response> {
    match wire::read_response(&mut conn.reader).await? {
        Some(response) => Ok(response),
        None => Err(exit_error(conn).await),
    }
}

/// Explains an EOF on the kernel's stdout.
async fn exit_error(conn: &mut Connection) -> JsiiError {
    match conn.process.as_mut() {
        Some(process) => {
            let status = process
                .wait_exit(KernelConfig::KILL_WAIT)
                .await
                .unwrap_or_else(|| "stdout closed".to_string());
            let tail = process.stderr_tail();
            let message = if tail.is_empty() {
                status
            } else {
                format!("{}\n{}", status, tail)
            };
            JsiiError::KernelTerminated { message }
        }
        None => JsiiError::protocol("kernel stream closed mid-conversation"),
    }
}

/// One request and everything until its terminal response.
///
/// Boxed because callback handlers recurse into it through their session.
fn round_trip<'a>(
    shared: &'a EngineShared,
    conn: &'a mut Connection,
    request: Request,
) -> Pin<Box<dyn Future<Output = Result<JsonValue>> + Send + 'a>> {
    Box::pin(async move {
        wire::write_request(&mut conn.writer, &request).await?;
        loop {
            match read_one(conn).await? {
                Response::Ok(value) => return Ok(value),
                Response::Error { message, stack } => {
                    return Err(JsiiError::Kernel { message, stack })
                }
                Response::Callback(callback) => {
                    let (result, err) = run_callback(shared, conn, &callback).await;
                    let complete = Request::Complete {
                        cbid: callback.cbid.clone(),
                        result,
                        err,
                    };
                    wire::write_request(&mut conn.writer, &complete).await?;
                    // The next response belongs to the original request, or
                    // is another callback interrupting it.
                }
                Response::Hello { .. } => {
                    return Err(JsiiError::protocol(
                        "unexpected 'hello' after the handshake",
                    ))
                }
            }
        }
    })
}

/// Runs the callback handler and folds its outcome into `complete` fields.
/// Host-side failures, including panics, become the `err` field and never
/// escalate into protocol failures.
async fn run_callback(
    shared: &EngineShared,
    conn: &mut Connection,
    callback: &Callback,
) -> (Option<JsonValue>, Option<String>) {
    let handler = shared
        .handler
        .read()
        .ok()
        .and_then(|slot| slot.clone());

    conn.depth += 1;
    debug!("callback {} (depth {})", callback.cbid, conn.depth);

    let outcome = match handler {
        None => Err("no callback handler is registered".to_string()),
        Some(handler) => {
            let mut session = KernelSession {
                shared,
                conn: &mut *conn,
            };
            match AssertUnwindSafe(handler.handle(callback, &mut session))
                .catch_unwind()
                .await
            {
                Ok(outcome) => outcome,
                Err(panic) => Err(panic_message(panic)),
            }
        }
    };
    conn.depth -= 1;

    match outcome {
        Ok(result) => (result, None),
        Err(message) => (None, Some(message)),
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "callback handler panicked".to_string()
    }
}
