//! Minimal HTTP/1.1 request/response types and framing, enough to satisfy
//! the session state machine's read/dispatch/write contract without
//! building a general-purpose HTTP library — the request handler and
//! WebSocket manager are external collaborators (spec §1), so this module
//! only needs to produce/consume the data they see at the boundary.

use bytes::BytesMut;
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: String,
    pub path: String,
    pub version: String,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl HttpRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(|v| v.as_str())
    }

    /// The upgrade-request predicate the spec names: `Connection: Upgrade`
    /// plus `Upgrade: websocket`, matched case-insensitively.
    pub fn is_websocket_upgrade(&self) -> bool {
        let connection_upgrades = self
            .header("connection")
            .map(|v| v.to_ascii_lowercase().contains("upgrade"))
            .unwrap_or(false);
        let upgrade_is_websocket = self
            .header("upgrade")
            .map(|v| v.eq_ignore_ascii_case("websocket"))
            .unwrap_or(false);
        connection_upgrades && upgrade_is_websocket
    }
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub reason: &'static str,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
    /// Whether the connection should close after this response is sent.
    pub close: bool,
}

impl HttpResponse {
    pub fn new(status: u16, reason: &'static str, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            reason,
            headers: HashMap::new(),
            body: body.into(),
            close: false,
        }
    }

    pub fn json(status: u16, reason: &'static str, body: impl Into<Vec<u8>>) -> Self {
        let mut response = Self::new(status, reason, body);
        response
            .headers
            .insert("Content-Type".to_string(), "application/json".to_string());
        response
    }

    pub fn closing(mut self) -> Self {
        self.close = true;
        self
    }

    pub fn request_timeout() -> Self {
        Self::json(408, "Request Timeout", br#"{"error":"request timeout"}"#.to_vec()).closing()
    }

    pub fn internal_error() -> Self {
        Self::json(500, "Internal Server Error", br#"{"error":"internal server error"}"#.to_vec())
            .closing()
    }

    pub fn service_unavailable() -> Self {
        Self::json(
            503,
            "Service Unavailable",
            br#"{"error":"websocket manager unavailable"}"#.to_vec(),
        )
        .closing()
    }

    pub fn payload_too_large() -> Self {
        Self::json(413, "Payload Too Large", br#"{"error":"payload too large"}"#.to_vec())
            .closing()
    }

    pub fn bad_request() -> Self {
        Self::json(400, "Bad Request", br#"{"error":"malformed request"}"#.to_vec()).closing()
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(128 + self.body.len());
        out.extend_from_slice(format!("HTTP/1.1 {} {}\r\n", self.status, self.reason).as_bytes());
        for (name, value) in &self.headers {
            out.extend_from_slice(format!("{}: {}\r\n", name, value).as_bytes());
        }
        out.extend_from_slice(format!("Content-Length: {}\r\n", self.body.len()).as_bytes());
        out.extend_from_slice(
            format!("Connection: {}\r\n", if self.close { "close" } else { "keep-alive" })
                .as_bytes(),
        );
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);
        out
    }
}

#[derive(Debug)]
pub enum ReadError {
    /// The peer closed the connection before a full request arrived.
    Eof,
    /// The in-flight read was interrupted by a connection/request timeout.
    TimedOut,
    /// `Content-Length` exceeds the configured body limit.
    TooLarge,
    /// The request line or headers could not be parsed.
    Malformed,
    Io(std::io::Error),
}

impl From<std::io::Error> for ReadError {
    fn from(e: std::io::Error) -> Self {
        ReadError::Io(e)
    }
}

/// Parse one HTTP/1.1 request out of `buffer`, reading more bytes from
/// `reader` as needed. On success, the consumed bytes are drained from the
/// front of `buffer`, leaving any pipelined bytes behind for the next call.
pub async fn read_request<R>(
    reader: &mut R,
    buffer: &mut BytesMut,
    max_body: usize,
) -> Result<HttpRequest, ReadError>
where
    R: tokio::io::AsyncRead + Unpin,
{
    use tokio::io::AsyncReadExt;

    let header_end = loop {
        if let Some(pos) = find_header_terminator(buffer) {
            break pos;
        }
        if buffer.len() > 64 * 1024 {
            return Err(ReadError::Malformed);
        }
        let n = reader.read_buf(buffer).await?;
        if n == 0 {
            if buffer.is_empty() {
                return Err(ReadError::Eof);
            }
            return Err(ReadError::Malformed);
        }
    };

    let head = buffer.split_to(header_end + 4);
    let head_str = std::str::from_utf8(&head).map_err(|_| ReadError::Malformed)?;
    let mut lines = head_str.split("\r\n");
    let request_line = lines.next().ok_or(ReadError::Malformed)?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or(ReadError::Malformed)?.to_string();
    let path = parts.next().ok_or(ReadError::Malformed)?.to_string();
    let version = parts.next().unwrap_or("HTTP/1.1").to_string();

    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }

    let content_length: usize = headers
        .get("content-length")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);

    if content_length > max_body {
        return Err(ReadError::TooLarge);
    }

    while buffer.len() < content_length {
        let n = reader.read_buf(buffer).await?;
        if n == 0 {
            return Err(ReadError::Eof);
        }
    }

    let body = buffer.split_to(content_length).to_vec();

    Ok(HttpRequest {
        method,
        path,
        version,
        headers,
        body,
    })
}

fn find_header_terminator(buffer: &BytesMut) -> Option<usize> {
    buffer.windows(4).position(|w| w == b"\r\n\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn websocket_upgrade_is_detected_case_insensitively() {
        let mut headers = HashMap::new();
        headers.insert("connection".to_string(), "Upgrade".to_string());
        headers.insert("upgrade".to_string(), "WebSocket".to_string());
        let req = HttpRequest {
            method: "GET".to_string(),
            path: "/ws".to_string(),
            version: "HTTP/1.1".to_string(),
            headers,
            body: vec![],
        };
        assert!(req.is_websocket_upgrade());
    }

    #[test]
    fn plain_request_is_not_an_upgrade() {
        let req = HttpRequest {
            method: "GET".to_string(),
            path: "/".to_string(),
            version: "HTTP/1.1".to_string(),
            headers: HashMap::new(),
            body: vec![],
        };
        assert!(!req.is_websocket_upgrade());
    }

    #[tokio::test]
    async fn reads_a_simple_request_with_body() {
        let raw = b"POST /echo HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello" as &[u8];
        let mut cursor = std::io::Cursor::new(raw.to_vec());
        let mut buffer = BytesMut::new();
        let request = read_request(&mut cursor, &mut buffer, 1024).await.unwrap();
        assert_eq!(request.method, "POST");
        assert_eq!(request.path, "/echo");
        assert_eq!(request.body, b"hello");
    }

    #[tokio::test]
    async fn rejects_body_over_the_limit() {
        let raw = b"POST /echo HTTP/1.1\r\nContent-Length: 100\r\n\r\n" as &[u8];
        let mut cursor = std::io::Cursor::new(raw.to_vec());
        let mut buffer = BytesMut::new();
        let result = read_request(&mut cursor, &mut buffer, 10).await;
        assert!(matches!(result, Err(ReadError::TooLarge)));
    }

    #[tokio::test]
    async fn leaves_pipelined_bytes_in_the_buffer() {
        let raw = b"GET /a HTTP/1.1\r\n\r\nGET /b HTTP/1.1\r\n\r\n" as &[u8];
        let mut cursor = std::io::Cursor::new(raw.to_vec());
        let mut buffer = BytesMut::new();
        let first = read_request(&mut cursor, &mut buffer, 1024).await.unwrap();
        assert_eq!(first.path, "/a");
        let second = read_request(&mut cursor, &mut buffer, 1024).await.unwrap();
        assert_eq!(second.path, "/b");
    }
}
