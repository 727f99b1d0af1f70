/// End-to-end tests driving the pool/session/timeout/monitor stack through
/// real loopback TCP sockets and raw HTTP/1.1 text, exercising the
/// scenarios named in the spec's testable-properties section: keep-alive
/// reuse over one connection, and the request-timeout-then-408-then-close
/// path.
use httpcore::http::{HttpRequest, HttpResponse};
use httpcore::monitor::PerformanceMonitor;
use httpcore::pool::{ConnectionPool, PoolConfig};
use httpcore::session::RequestHandler;
use httpcore::timeout::TimeoutManager;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

struct EchoHandler;

#[async_trait::async_trait]
impl RequestHandler for EchoHandler {
    async fn handle(&self, request: HttpRequest) -> HttpResponse {
        HttpResponse::new(200, "OK", request.body)
    }
}

struct SlowHandler {
    delay: Duration,
}

#[async_trait::async_trait]
impl RequestHandler for SlowHandler {
    async fn handle(&self, request: HttpRequest) -> HttpResponse {
        tokio::time::sleep(self.delay).await;
        HttpResponse::new(200, "OK", request.body)
    }
}

async fn spawn_server(
    handler: Arc<dyn RequestHandler>,
    request_timeout: Duration,
) -> (std::net::SocketAddr, Arc<ConnectionPool>, Arc<PerformanceMonitor>) {
    let monitor = Arc::new(PerformanceMonitor::new());
    let timeout_manager =
        TimeoutManager::new(Duration::from_secs(30), request_timeout, monitor.clone());
    let pool = ConnectionPool::new(
        PoolConfig {
            min_connections: 1,
            max_connections: 10,
            idle_timeout: Duration::from_secs(300),
            connection_timeout: Duration::from_secs(30),
            request_timeout,
            max_request_body: 1024 * 1024,
            max_queue_size: 10,
            max_queue_wait: Duration::from_secs(1),
        },
        handler,
        None,
        timeout_manager,
        monitor.clone(),
    )
    .unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accept_pool = pool.clone();
    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(pair) => pair,
                Err(_) => return,
            };
            let pool = accept_pool.clone();
            tokio::spawn(async move {
                let _ = pool.serve(socket).await;
            });
        }
    });

    (addr, pool, monitor)
}

async fn send_request(stream: &mut TcpStream, body: &str) -> String {
    let request = format!(
        "POST /echo HTTP/1.1\r\nContent-Length: {}\r\n\r\n{}",
        body.len(),
        body
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut buf = vec![0u8; 4096];
    let n = stream.read(&mut buf).await.unwrap();
    String::from_utf8_lossy(&buf[..n]).to_string()
}

#[tokio::test]
async fn keep_alive_serves_multiple_requests_on_one_connection() {
    let (addr, _pool, _monitor) = spawn_server(Arc::new(EchoHandler), Duration::from_secs(5)).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    let first = send_request(&mut stream, "hello").await;
    assert!(first.starts_with("HTTP/1.1 200 OK"));
    assert!(first.ends_with("hello"));

    let second = send_request(&mut stream, "world").await;
    assert!(second.starts_with("HTTP/1.1 200 OK"));
    assert!(second.ends_with("world"));
}

#[tokio::test]
async fn slow_handler_triggers_request_timeout_and_408() {
    let (addr, _pool, monitor) =
        spawn_server(Arc::new(SlowHandler { delay: Duration::from_millis(500) }), Duration::from_millis(100))
            .await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    let response = send_request(&mut stream, "x").await;
    assert!(response.starts_with("HTTP/1.1 408"), "expected 408, got: {response}");

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(monitor.snapshot().request_timeouts, 1);
}

#[tokio::test]
async fn websocket_upgrade_without_manager_returns_503() {
    let (addr, _pool, _monitor) = spawn_server(Arc::new(EchoHandler), Duration::from_secs(5)).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    let request =
        "GET /ws HTTP/1.1\r\nConnection: Upgrade\r\nUpgrade: websocket\r\nContent-Length: 0\r\n\r\n";
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut buf = vec![0u8; 4096];
    let n = stream.read(&mut buf).await.unwrap();
    let response = String::from_utf8_lossy(&buf[..n]);
    assert!(response.starts_with("HTTP/1.1 503"), "expected 503, got: {response}");
}

#[tokio::test]
async fn request_counters_balance_after_each_exchange() {
    let (addr, _pool, monitor) = spawn_server(Arc::new(EchoHandler), Duration::from_secs(5)).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    send_request(&mut stream, "one").await;
    send_request(&mut stream, "two").await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    let snapshot = monitor.snapshot();
    assert_eq!(snapshot.total_requests, 2);
    assert_eq!(snapshot.active_requests, 0);
}

#[tokio::test]
async fn connection_reuse_is_reflected_in_monitor() {
    let (addr, pool, monitor) = spawn_server(Arc::new(EchoHandler), Duration::from_secs(5)).await;
    let stream = TcpStream::connect(addr).await.unwrap();
    drop(stream);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(monitor.snapshot().total_connections, 1);
    assert_eq!(pool.total_created(), 1);
}
