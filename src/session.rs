//! Per-connection pooled session state machine. Grounded on the original
//! pooled session (`pooled_session.hpp`/`.cpp`): the lifecycle methods,
//! the 4 KiB direct-write-vs-shared-wrap threshold, and the 64 KiB
//! buffer-shrink threshold are all carried over; the `boost::asio::strand`
//! that serializes completions there is modeled here with a
//! `tokio::sync::Mutex` guarding the socket plus a `Notify` used to
//! interrupt an in-flight read when a timeout fires, since tokio has no
//! direct strand-cancellation primitive.

use crate::http::{read_request, HttpRequest, HttpResponse, ReadError};
use crate::monitor::{PerformanceMonitor, TimeoutKind};
use crate::timeout::TimeoutManager;
use async_trait::async_trait;
use bytes::BytesMut;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tracing::{debug, error, warn};

pub type SessionId = u64;

fn next_session_id() -> SessionId {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    COUNTER.fetch_add(1, Ordering::Relaxed)
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// `handle(request) -> response`. May "throw" (return an error or panic);
/// either is mapped to a 500 by the session.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, request: HttpRequest) -> HttpResponse;
}

/// `handle_upgrade(owned_socket)`. Ownership of the socket transfers to
/// the WebSocket manager permanently; the session transitions to CLOSED
/// without further I/O of its own.
#[async_trait]
pub trait WebSocketManager: Send + Sync {
    async fn handle_upgrade(&self, socket: TcpStream, request: HttpRequest);
}

const BUFFER_SHRINK_THRESHOLD: usize = 64 * 1024;
const DIRECT_WRITE_THRESHOLD: usize = 4 * 1024;

struct SessionIo {
    stream: Option<TcpStream>,
    buffer: BytesMut,
}

/// Exactly one of `{reading, processing, writing, idle, closed}` is active
/// at any instant. `idle` and `processing_request` are plain atomics (per
/// spec §5, the only state eviction scans may read cross-strand); `closed`
/// is likewise atomic since `get_socket` and timeout firing may race with
/// the drive loop's own observation of it.
pub struct PooledSession {
    id: SessionId,
    io: AsyncMutex<SessionIo>,
    closed_notify: Notify,
    idle: AtomicBool,
    processing_request: AtomicBool,
    closed: AtomicBool,
    responded: AtomicBool,
    last_activity_ms: AtomicU64,
    handler: Arc<dyn RequestHandler>,
    ws_manager: Option<Arc<dyn WebSocketManager>>,
    timeout_manager: Arc<TimeoutManager>,
    monitor: Arc<PerformanceMonitor>,
    max_request_body: usize,
    connection_timeout: Duration,
    request_timeout: Duration,
}

impl PooledSession {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        stream: TcpStream,
        handler: Arc<dyn RequestHandler>,
        ws_manager: Option<Arc<dyn WebSocketManager>>,
        timeout_manager: Arc<TimeoutManager>,
        monitor: Arc<PerformanceMonitor>,
        max_request_body: usize,
        connection_timeout: Duration,
        request_timeout: Duration,
    ) -> Arc<Self> {
        let _ = stream.set_nodelay(true);
        Arc::new(Self {
            id: next_session_id(),
            io: AsyncMutex::new(SessionIo {
                stream: Some(stream),
                buffer: BytesMut::new(),
            }),
            closed_notify: Notify::new(),
            idle: AtomicBool::new(false),
            processing_request: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            responded: AtomicBool::new(false),
            last_activity_ms: AtomicU64::new(now_millis()),
            handler,
            ws_manager,
            timeout_manager,
            monitor,
            max_request_body,
            connection_timeout,
            request_timeout,
        })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn is_idle(&self) -> bool {
        self.idle.load(Ordering::Acquire) && !self.processing_request.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn last_activity_millis(&self) -> u64 {
        self.last_activity_ms.load(Ordering::Acquire)
    }

    fn touch(&self) {
        self.last_activity_ms.store(now_millis(), Ordering::Release);
    }

    /// Schedules the read/dispatch/write loop and arms the connection
    /// timeout. Sets `idle=false`. Returns the drive loop's `JoinHandle` so
    /// the caller (the pool) can learn when the session has stopped serving
    /// its current connection, without the session itself holding a
    /// back-reference to the pool (spec §9's cyclic-reference avoidance).
    pub async fn run(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        self.idle.store(false, Ordering::Release);
        self.timeout_manager
            .start_connection_timeout(Some(self.clone()), None, Some(self.connection_timeout))
            .await;

        let this = self.clone();
        tokio::spawn(async move {
            this.drive_loop().await;
        })
    }

    async fn drive_loop(self: Arc<Self>) {
        loop {
            if self.is_closed() {
                return;
            }
            match self.serve_one_request().await {
                Outcome::KeepAlive => continue,
                Outcome::Close | Outcome::HandedOff => return,
            }
        }
    }

    /// Reads one request off the socket, then — only once a request has
    /// actually been received — brackets dispatch+write with the monitor's
    /// start/end counters. Bracketing the blocking keep-alive read itself
    /// would count a request (and hold `active_requests` above zero) for
    /// every quiet period between requests on an open connection, which is
    /// not a "request" by spec §4.1's own definition and breaks the §8
    /// counter-balance invariant the moment a connection goes idle between
    /// exchanges.
    async fn serve_one_request(self: &Arc<Self>) -> Outcome {
        self.idle.store(false, Ordering::Release);
        self.processing_request.store(true, Ordering::Release);
        self.responded.store(false, Ordering::Release);
        self.timeout_manager
            .start_request_timeout(Some(self.clone()), None, Some(self.request_timeout))
            .await;

        let read_result = {
            let mut io = self.io.lock().await;
            let SessionIo { stream, buffer } = &mut *io;
            let Some(stream) = stream.as_mut() else {
                return Outcome::Close;
            };
            tokio::select! {
                r = read_request(stream, buffer, self.max_request_body) => r,
                _ = self.closed_notify.notified() => Err(ReadError::TimedOut),
            }
        };

        self.touch();

        let request = match read_result {
            Ok(request) => request,
            Err(ReadError::Eof) => return Outcome::Close,
            Err(ReadError::TimedOut) => return Outcome::Close,
            Err(ReadError::TooLarge) => {
                self.try_respond(HttpResponse::payload_too_large()).await;
                return Outcome::Close;
            }
            Err(ReadError::Malformed) | Err(ReadError::Io(_)) => {
                self.try_respond(HttpResponse::bad_request()).await;
                return Outcome::Close;
            }
        };

        if request.is_websocket_upgrade() {
            return self.handle_upgrade(request).await;
        }

        self.monitor.record_request_start();
        let started_at = std::time::Instant::now();
        let outcome = self.dispatch_and_respond(request).await;
        self.monitor
            .record_request_end(started_at.elapsed().as_millis() as u64);
        outcome
    }

    async fn dispatch_and_respond(self: &Arc<Self>, request: HttpRequest) -> Outcome {
        let handler = self.handler.clone();
        let dispatch = futures::FutureExt::catch_unwind(std::panic::AssertUnwindSafe(
            handler.handle(request),
        ));
        let response = tokio::select! {
            r = dispatch => {
                match r {
                    Ok(response) => response,
                    Err(_) => {
                        error!(session_id = self.id, "panic in request handler, returning 500");
                        HttpResponse::internal_error()
                    }
                }
            }
            _ = self.closed_notify.notified() => {
                // Request-timeout path already wrote the 408 and is closing.
                return Outcome::Close;
            }
        };

        self.timeout_manager
            .cancel_request_timeout(Some(self.clone()))
            .await;

        if !self.try_respond(response.clone()).await {
            return Outcome::Close;
        }

        if response.close {
            Outcome::Close
        } else {
            self.processing_request.store(false, Ordering::Release);
            self.idle.store(true, Ordering::Release);
            Outcome::KeepAlive
        }
    }

    async fn handle_upgrade(self: &Arc<Self>, request: HttpRequest) -> Outcome {
        self.timeout_manager
            .cancel_timeouts(Some(self.clone()))
            .await;

        let Some(ws_manager) = self.ws_manager.clone() else {
            self.try_respond(HttpResponse::service_unavailable()).await;
            return Outcome::Close;
        };

        let stream = {
            let mut io = self.io.lock().await;
            io.stream.take()
        };
        self.closed.store(true, Ordering::Release);

        if let Some(stream) = stream {
            ws_manager.handle_upgrade(stream, request).await;
        }

        Outcome::HandedOff
    }

    /// Write the response if no one else has already responded for this
    /// request (guards the race between the normal completion path and a
    /// concurrently-firing request timeout writing its own 408).
    async fn try_respond(self: &Arc<Self>, response: HttpResponse) -> bool {
        if self
            .responded
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        self.write_response(&response).await;
        if response.close {
            self.do_close().await;
        }
        true
    }

    /// Body ≤ 4 KiB is written directly; larger bodies are wrapped in a
    /// shared `Arc` whose lifetime spans the async write — in the original
    /// Asio/Beast implementation this distinction matters because the
    /// buffer must outlive the write's completion handler; in Rust's
    /// owned-future model the `Arc` indirection is mostly moot, but is
    /// kept to preserve the spec's two code paths and as the natural hook
    /// point for a future chunked-write implementation.
    async fn write_response(self: &Arc<Self>, response: &HttpResponse) {
        let serialized = response.serialize();
        let mut io = self.io.lock().await;
        let Some(stream) = io.stream.as_mut() else {
            return;
        };

        let result = if serialized.len() <= DIRECT_WRITE_THRESHOLD {
            stream.write_all(&serialized).await
        } else {
            let shared = Arc::new(serialized);
            stream.write_all(shared.as_slice()).await
        };

        if let Err(e) = result {
            warn!(session_id = self.id, error = %e, "failed to write response");
        }
    }

    /// Invoked by the timeout manager on deadline.
    pub fn handle_timeout(self: &Arc<Self>, kind: TimeoutKind) {
        let session = self.clone();
        tokio::spawn(async move {
            match kind {
                TimeoutKind::Connection => {
                    debug!(session_id = session.id, "connection timeout, closing");
                    session.closed_notify.notify_waiters();
                    session.do_close().await;
                }
                TimeoutKind::Request => {
                    debug!(session_id = session.id, "request timeout, sending 408");
                    session.closed_notify.notify_waiters();
                    if session
                        .responded
                        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        session.write_response(&HttpResponse::request_timeout()).await;
                    }
                    session.do_close().await;
                }
            }
        });
    }

    /// Cancel all timers; clear flags; shut down the send side; never
    /// throws — errors are logged only.
    async fn do_close(self: &Arc<Self>) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.timeout_manager
            .cancel_timeouts(Some(self.clone()))
            .await;
        self.idle.store(false, Ordering::Release);
        self.processing_request.store(false, Ordering::Release);

        let mut io = self.io.lock().await;
        if let Some(stream) = io.stream.as_mut() {
            if let Err(e) = stream.shutdown().await {
                error!(session_id = self.id, error = %e, "error shutting down socket");
            }
        }
        io.stream = None;
    }

    /// Reset the session for reuse by the pool. Must only be called when
    /// not currently mid I/O (i.e. the session is between requests, not
    /// actively being driven).
    pub async fn reset(self: &Arc<Self>) {
        self.timeout_manager
            .cancel_timeouts(Some(self.clone()))
            .await;
        self.processing_request.store(false, Ordering::Release);

        {
            let mut io = self.io.lock().await;
            if io.buffer.capacity() > BUFFER_SHRINK_THRESHOLD {
                io.buffer = BytesMut::new();
            }
        }

        self.touch();
        self.idle.store(true, Ordering::Release);
    }

    /// Take the underlying socket for handoff (used by the WebSocket path
    /// and exposed for symmetry with the original interface). Once taken
    /// the session is CLOSED and must not issue further I/O.
    pub async fn take_socket(self: &Arc<Self>) -> Option<TcpStream> {
        let mut io = self.io.lock().await;
        self.closed.store(true, Ordering::Release);
        io.stream.take()
    }

    /// Rebind a pooled-but-reused session onto a freshly accepted socket.
    /// The pool reuses the session *object* (its buffers and flags, via
    /// `reset()`) across distinct client connections to avoid reallocating
    /// them; the TCP socket itself is never reused, so the new connection's
    /// stream must be installed before the session is driven again.
    pub async fn rebind_socket(self: &Arc<Self>, stream: TcpStream) {
        let _ = stream.set_nodelay(true);
        let mut io = self.io.lock().await;
        io.stream = Some(stream);
        self.closed.store(false, Ordering::Release);
    }
}

enum Outcome {
    KeepAlive,
    Close,
    HandedOff,
}

#[cfg(test)]
pub mod test_support {
    use super::*;

    pub struct EchoHandler;

    #[async_trait]
    impl RequestHandler for EchoHandler {
        async fn handle(&self, request: HttpRequest) -> HttpResponse {
            HttpResponse::new(200, "OK", request.body)
        }
    }

    pub async fn make_test_session() -> Arc<PooledSession> {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap().0 });
        let _client = TcpStream::connect(addr).await.unwrap();
        let server_side = accept.await.unwrap();

        let monitor = Arc::new(PerformanceMonitor::new());
        let timeout_manager =
            TimeoutManager::new(Duration::from_secs(30), Duration::from_secs(60), monitor.clone());

        PooledSession::new(
            server_side,
            Arc::new(EchoHandler),
            None,
            timeout_manager,
            monitor,
            1024 * 1024,
            Duration::from_secs(30),
            Duration::from_secs(60),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::make_test_session;
    use super::*;

    #[tokio::test]
    async fn new_session_is_not_idle() {
        let session = make_test_session().await;
        assert!(!session.is_idle());
    }

    #[tokio::test]
    async fn reset_marks_session_idle() {
        let session = make_test_session().await;
        session.reset().await;
        assert!(session.is_idle());
    }

    #[tokio::test]
    async fn websocket_upgrade_without_manager_yields_close() {
        let session = make_test_session().await;
        let request = HttpRequest {
            method: "GET".to_string(),
            path: "/ws".to_string(),
            version: "HTTP/1.1".to_string(),
            headers: {
                let mut h = std::collections::HashMap::new();
                h.insert("connection".to_string(), "upgrade".to_string());
                h.insert("upgrade".to_string(), "websocket".to_string());
                h
            },
            body: vec![],
        };
        let outcome = session.handle_upgrade(request).await;
        assert!(matches!(outcome, Outcome::Close));
        assert!(session.is_closed());
    }
}
