//! HTTP/1.1 client for the VMM API socket.
//!
//! Requests are `PUT` or `GET` against `http://localhost/api/v1/<endpoint>`.
//! Each transaction uses a fresh connection and holds the client lock, so
//! at most one request per monitor is in flight.

use crate::error::{Error, Result};
use parking_lot::Mutex;
use serde_json::Value;
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Path prefix of every endpoint.
pub const URL_ROOT: &str = "/api/v1";

/// HTTP method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// Query.
    Get,
    /// Command.
    Put,
}

impl Method {
    fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Put => "PUT",
        }
    }
}

/// A raw API response.
#[derive(Debug, Clone)]
pub struct Response {
    /// HTTP status code.
    pub status: u16,
    /// Decoded JSON body, if any.
    pub body: Option<Value>,
}

impl Response {
    /// 200 and 204 are the only success codes.
    pub fn is_success(&self) -> bool {
        matches!(self.status, 200 | 204)
    }
}

/// Client bound to one API socket.
pub struct ApiClient {
    socket: PathBuf,
    lock: Mutex<()>,
    timeout: Duration,
}

impl ApiClient {
    /// Create a client for `socket`.
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        Self {
            socket: socket.into(),
            lock: Mutex::new(()),
            timeout: Duration::from_secs(30),
        }
    }

    /// Socket path.
    pub fn socket(&self) -> &Path {
        &self.socket
    }

    /// Perform one transaction.
    pub fn request(&self, method: Method, endpoint: &str, body: Option<&Value>) -> Result<Response> {
        let _guard = self.lock.lock();

        let mut stream = UnixStream::connect(&self.socket)
            .map_err(|e| Error::connection(&self.socket, e))?;
        stream.set_read_timeout(Some(self.timeout)).ok();
        stream.set_write_timeout(Some(self.timeout)).ok();

        let payload = body.map(serde_json::to_vec).transpose()?;
        let head = request_head(method, endpoint, payload.as_deref());
        tracing::trace!(endpoint, method = method.as_str(), "api request");

        stream
            .write_all(head.as_bytes())
            .and_then(|_| match &payload {
                Some(p) => stream.write_all(p),
                None => Ok(()),
            })
            .and_then(|_| stream.flush())
            .map_err(|e| Error::connection(&self.socket, format!("write failed: {}", e)))?;

        let response = read_response(&mut BufReader::new(stream))
            .map_err(|e| Error::connection(&self.socket, e))?;
        tracing::trace!(endpoint, status = response.status, "api response");
        Ok(response)
    }

    /// `PUT` expecting success; the body, if any, is returned.
    pub fn put(&self, endpoint: &str, body: Option<&Value>) -> Result<Option<Value>> {
        let response = self.request(Method::Put, endpoint, body)?;
        check(endpoint, response)
    }

    /// `GET` expecting a JSON body.
    pub fn get(&self, endpoint: &str) -> Result<Value> {
        let response = self.request(Method::Get, endpoint, None)?;
        check(endpoint, response)?
            .ok_or_else(|| Error::internal(format!("empty response from {}", endpoint)))
    }
}

fn check(endpoint: &str, response: Response) -> Result<Option<Value>> {
    if response.is_success() {
        Ok(response.body)
    } else {
        Err(Error::Api {
            endpoint: endpoint.to_string(),
            status: response.status,
        })
    }
}

fn request_head(method: Method, endpoint: &str, payload: Option<&[u8]>) -> String {
    let mut head = format!(
        "{} {}/{} HTTP/1.1\r\nHost: localhost\r\n",
        method.as_str(),
        URL_ROOT,
        endpoint
    );
    match payload {
        Some(p) => {
            head.push_str("Accept: application/json\r\n");
            head.push_str("Content-Type: application/json\r\n");
            head.push_str(&format!("Content-Length: {}\r\n", p.len()));
        }
        None if method == Method::Put => head.push_str("Content-Length: 0\r\n"),
        None => head.push_str("Accept: application/json\r\n"),
    }
    head.push_str("\r\n");
    head
}

fn read_response<R: BufRead>(reader: &mut R) -> std::result::Result<Response, String> {
    let mut line = String::new();
    reader
        .read_line(&mut line)
        .map_err(|e| format!("read failed: {}", e))?;
    if line.is_empty() {
        return Err("connection closed before response".into());
    }

    // e.g. HTTP/1.1 204 No Content
    let status = line
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or_else(|| format!("bad status line '{}'", line.trim_end()))?;

    let mut content_length: Option<usize> = None;
    let mut chunked = false;
    loop {
        line.clear();
        reader
            .read_line(&mut line)
            .map_err(|e| format!("read failed: {}", e))?;
        let header = line.trim_end();
        if header.is_empty() {
            break;
        }
        if let Some((name, value)) = header.split_once(':') {
            let value = value.trim();
            if name.eq_ignore_ascii_case("content-length") {
                content_length = value.parse().ok();
            } else if name.eq_ignore_ascii_case("transfer-encoding") {
                chunked = value.eq_ignore_ascii_case("chunked");
            }
        }
    }

    let raw = if chunked {
        read_chunked(reader)?
    } else {
        match content_length {
            Some(0) | None => Vec::new(),
            Some(len) => {
                let mut buf = vec![0u8; len];
                reader
                    .read_exact(&mut buf)
                    .map_err(|e| format!("short body: {}", e))?;
                buf
            }
        }
    };

    let body = if raw.iter().all(u8::is_ascii_whitespace) {
        None
    } else {
        Some(serde_json::from_slice(&raw).map_err(|e| format!("malformed json body: {}", e))?)
    };

    Ok(Response { status, body })
}

fn read_chunked<R: BufRead>(reader: &mut R) -> std::result::Result<Vec<u8>, String> {
    let mut out = Vec::new();
    let mut line = String::new();
    loop {
        line.clear();
        reader
            .read_line(&mut line)
            .map_err(|e| format!("read failed: {}", e))?;
        let size_field = line.trim().split(';').next().unwrap_or("");
        let size = usize::from_str_radix(size_field, 16)
            .map_err(|_| format!("bad chunk size '{}'", line.trim()))?;
        if size == 0 {
            // trailing CRLF
            line.clear();
            let _ = reader.read_line(&mut line);
            return Ok(out);
        }
        let start = out.len();
        out.resize(start + size, 0);
        reader
            .read_exact(&mut out[start..])
            .map_err(|e| format!("short chunk: {}", e))?;
        let mut crlf = [0u8; 2];
        reader
            .read_exact(&mut crlf)
            .map_err(|e| format!("short chunk: {}", e))?;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::{Cursor, Read};
    use std::os::unix::net::UnixListener;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    /// A request seen by [`FakeApi`].
    #[derive(Debug, Clone)]
    pub(crate) struct Seen {
        pub method: String,
        pub path: String,
        pub headers: Vec<String>,
        pub body: String,
    }

    /// Scripted VMM API server on a UNIX socket.
    pub(crate) struct FakeApi {
        pub socket: PathBuf,
        pub seen: Arc<parking_lot::Mutex<Vec<Seen>>>,
        replies: Arc<parking_lot::Mutex<HashMap<String, (u16, String)>>>,
        stop: Arc<AtomicBool>,
        handle: Option<std::thread::JoinHandle<()>>,
    }

    impl FakeApi {
        pub(crate) fn start(socket: &Path) -> Self {
            let listener = UnixListener::bind(socket).unwrap();
            let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
            let replies: Arc<parking_lot::Mutex<HashMap<String, (u16, String)>>> =
                Arc::new(parking_lot::Mutex::new(HashMap::new()));
            let stop = Arc::new(AtomicBool::new(false));

            let handle = {
                let seen = Arc::clone(&seen);
                let replies = Arc::clone(&replies);
                let stop = Arc::clone(&stop);
                std::thread::spawn(move || {
                    for conn in listener.incoming() {
                        if stop.load(Ordering::SeqCst) {
                            break;
                        }
                        let Ok(conn) = conn else { continue };
                        serve_one(conn, &seen, &replies);
                    }
                })
            };

            Self {
                socket: socket.to_path_buf(),
                seen,
                replies,
                stop,
                handle: Some(handle),
            }
        }

        /// Reply to `endpoint` with `status` and `body`.
        pub(crate) fn reply(&self, endpoint: &str, status: u16, body: &str) {
            self.replies
                .lock()
                .insert(format!("{}/{}", URL_ROOT, endpoint), (status, body.to_string()));
        }

        pub(crate) fn paths(&self) -> Vec<String> {
            self.seen.lock().iter().map(|s| s.path.clone()).collect()
        }
    }

    impl Drop for FakeApi {
        fn drop(&mut self) {
            self.stop.store(true, Ordering::SeqCst);
            // The socket may already be gone (Monitor::close removes it);
            // only join when the wake-up connect reached the accept loop.
            let woke = UnixStream::connect(&self.socket).is_ok();
            if let Some(handle) = self.handle.take() {
                if woke {
                    let _ = handle.join();
                }
            }
        }
    }

    fn serve_one(
        conn: UnixStream,
        seen: &parking_lot::Mutex<Vec<Seen>>,
        replies: &parking_lot::Mutex<HashMap<String, (u16, String)>>,
    ) {
        let mut reader = BufReader::new(conn.try_clone().unwrap());
        let mut line = String::new();
        if reader.read_line(&mut line).unwrap_or(0) == 0 {
            return;
        }
        let mut parts = line.split_whitespace();
        let method = parts.next().unwrap_or("").to_string();
        let path = parts.next().unwrap_or("").to_string();

        let mut headers = Vec::new();
        let mut len = 0usize;
        loop {
            line.clear();
            reader.read_line(&mut line).unwrap();
            let h = line.trim_end().to_string();
            if h.is_empty() {
                break;
            }
            if let Some(v) = h.strip_prefix("Content-Length: ") {
                len = v.parse().unwrap();
            }
            headers.push(h);
        }
        let mut body = vec![0u8; len];
        reader.read_exact(&mut body).unwrap();

        let (status, reply) = replies
            .lock()
            .get(&path)
            .cloned()
            .unwrap_or((204, String::new()));
        seen.lock().push(Seen {
            method,
            path,
            headers,
            body: String::from_utf8_lossy(&body).into_owned(),
        });

        let mut conn = conn;
        let _ = write!(
            conn,
            "HTTP/1.1 {} X\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
            status,
            reply.len(),
            reply
        );
    }

    #[test]
    fn test_put_with_body_sends_json_headers() {
        let dir = tempfile::tempdir().unwrap();
        let api = FakeApi::start(&dir.path().join("api.sock"));
        let client = ApiClient::new(&api.socket);

        let body = serde_json::json!({ "desired_vcpus": 3 });
        client.put("vm.resize", Some(&body)).unwrap();

        let seen = api.seen.lock();
        assert_eq!(seen[0].method, "PUT");
        assert_eq!(seen[0].path, "/api/v1/vm.resize");
        assert!(seen[0].headers.iter().any(|h| h == "Content-Type: application/json"));
        assert!(seen[0].headers.iter().any(|h| h == "Accept: application/json"));
        assert_eq!(seen[0].body, r#"{"desired_vcpus":3}"#);
    }

    #[test]
    fn test_empty_put_sends_no_expect_or_chunking() {
        let dir = tempfile::tempdir().unwrap();
        let api = FakeApi::start(&dir.path().join("api.sock"));
        let client = ApiClient::new(&api.socket);

        client.put("vm.boot", None).unwrap();

        let seen = api.seen.lock();
        assert!(seen[0].body.is_empty());
        assert!(!seen[0].headers.iter().any(|h| h.starts_with("Expect")));
        assert!(!seen[0].headers.iter().any(|h| h.starts_with("Transfer-Encoding")));
    }

    #[test]
    fn test_get_decodes_body() {
        let dir = tempfile::tempdir().unwrap();
        let api = FakeApi::start(&dir.path().join("api.sock"));
        api.reply("vm.info", 200, r#"{"state":"Running"}"#);
        let client = ApiClient::new(&api.socket);

        let info = client.get("vm.info").unwrap();
        assert_eq!(info["state"], "Running");
    }

    #[test]
    fn test_non_success_status_is_api_error() {
        let dir = tempfile::tempdir().unwrap();
        let api = FakeApi::start(&dir.path().join("api.sock"));
        api.reply("vm.pause", 500, "");
        let client = ApiClient::new(&api.socket);

        let err = client.put("vm.pause", None).unwrap_err();
        assert!(matches!(err, Error::Api { status: 500, .. }));
        assert!(err.to_string().contains("vm.pause"));
    }

    #[test]
    fn test_missing_socket_is_connection_error() {
        let dir = tempfile::tempdir().unwrap();
        let client = ApiClient::new(dir.path().join("nope.sock"));
        let err = client.put("vmm.ping", None).unwrap_err();
        assert!(matches!(err, Error::Connection { .. }));
    }

    #[test]
    fn test_read_chunked_response() {
        let raw = "HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n\
                   7\r\n{\"a\":1}\r\n0\r\n\r\n";
        let resp = read_response(&mut Cursor::new(raw.as_bytes())).unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.body.unwrap()["a"], 1);
    }

    #[test]
    fn test_malformed_json_rejected() {
        let raw = "HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\n{oops";
        let err = read_response(&mut Cursor::new(raw.as_bytes())).unwrap_err();
        assert!(err.contains("malformed json"));
    }

    #[test]
    fn test_bad_status_line() {
        let err = read_response(&mut Cursor::new(b"garbage\r\n\r\n".as_slice())).unwrap_err();
        assert!(err.contains("bad status line"));
    }
}
