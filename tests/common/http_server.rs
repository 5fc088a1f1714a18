//! Minimal HTTP/1.1 server for integration tests.
//!
//! Serves one body per path. Supports HEAD, Range GET, forced status codes,
//! throttled or truncated bodies, servers that lie about ranges, and per-path
//! request logs. Every response closes the connection.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Route {
    pub body: Vec<u8>,
    /// If false, GET ignores Range and always returns 200 with the full body.
    pub support_ranges: bool,
    /// HEAD advertises `Accept-Ranges: bytes`, but GET still answers 200
    /// with the full body.
    pub ignores_ranges: bool,
    /// Answer every request on this path with this status and no body.
    pub status: Option<u16>,
    /// The next `fail_gets` GETs get `fail_status` and no body.
    pub fail_gets: usize,
    pub fail_status: u16,
    /// Every GET body stops after this many bytes and the connection closes,
    /// while the headers still announce the full length.
    pub cut_after: Option<usize>,
    /// Body is written in `chunk` sized pieces with `delay` between them.
    pub chunk: usize,
    pub delay: Duration,
}

impl Route {
    pub fn new(body: Vec<u8>) -> Self {
        Self {
            body,
            support_ranges: true,
            ignores_ranges: false,
            status: None,
            fail_gets: 0,
            fail_status: 503,
            cut_after: None,
            chunk: 16 * 1024,
            delay: Duration::ZERO,
        }
    }

    pub fn without_ranges(mut self) -> Self {
        self.support_ranges = false;
        self
    }

    pub fn ignoring_ranges(mut self) -> Self {
        self.ignores_ranges = true;
        self
    }

    pub fn failing_first_gets(mut self, count: usize, status: u16) -> Self {
        self.fail_gets = count;
        self.fail_status = status;
        self
    }

    pub fn cut_after(mut self, bytes: usize) -> Self {
        self.cut_after = Some(bytes);
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn throttled(mut self, chunk: usize, delay: Duration) -> Self {
        self.chunk = chunk.max(1);
        self.delay = delay;
        self
    }
}

/// One request as the server saw it.
#[derive(Debug, Clone)]
pub struct Hit {
    pub method: String,
    pub range: Option<(u64, u64)>,
}

#[derive(Default)]
struct Shared {
    routes: HashMap<String, Route>,
    hits: HashMap<String, Vec<Hit>>,
}

#[derive(Clone)]
pub struct TestServer {
    base: String,
    shared: Arc<Mutex<Shared>>,
}

impl TestServer {
    /// Starts a server in a background thread. It runs until the process exits.
    pub fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().unwrap().port();
        let shared = Arc::new(Mutex::new(Shared::default()));
        let accept_shared = Arc::clone(&shared);
        thread::spawn(move || {
            for stream in listener.incoming().flatten() {
                let shared = Arc::clone(&accept_shared);
                thread::spawn(move || handle(stream, &shared));
            }
        });
        Self {
            base: format!("http://127.0.0.1:{}", port),
            shared,
        }
    }

    /// Registers (or replaces) the route at `path` and returns its URL.
    pub fn route(&self, path: &str, route: Route) -> String {
        self.shared
            .lock()
            .unwrap()
            .routes
            .insert(path.to_string(), route);
        self.url(path)
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    /// Changes a registered route in place.
    pub fn update(&self, path: &str, change: impl FnOnce(&mut Route)) {
        let mut shared = self.shared.lock().unwrap();
        if let Some(route) = shared.routes.get_mut(path) {
            change(route);
        }
    }

    pub fn hits(&self, path: &str) -> Vec<Hit> {
        self.shared
            .lock()
            .unwrap()
            .hits
            .get(path)
            .cloned()
            .unwrap_or_default()
    }
}

fn handle(mut stream: TcpStream, shared: &Mutex<Shared>) {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(2)));
    let _ = stream.set_write_timeout(Some(Duration::from_secs(5)));
    let mut buf = [0u8; 8192];
    let n = match stream.read(&mut buf) {
        Ok(0) | Err(_) => return,
        Ok(n) => n,
    };
    let Ok(request) = std::str::from_utf8(&buf[..n]) else {
        return;
    };
    let (method, path, range) = parse_request(request);

    let is_get = method.eq_ignore_ascii_case("GET");
    let (route, failure) = {
        let mut shared = shared.lock().unwrap();
        shared.hits.entry(path.to_string()).or_default().push(Hit {
            method: method.to_string(),
            range,
        });
        match shared.routes.get_mut(path) {
            Some(route) => {
                let failure = (is_get && route.fail_gets > 0).then(|| {
                    route.fail_gets -= 1;
                    route.fail_status
                });
                (Some(route.clone()), failure)
            }
            None => (None, None),
        }
    };
    let Some(route) = route else {
        let _ = stream.write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n");
        return;
    };
    if let Some(status) = route.status.or(failure) {
        let response = format!(
            "HTTP/1.1 {} Forced\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
            status
        );
        let _ = stream.write_all(response.as_bytes());
        return;
    }

    let body = &route.body;
    let total = body.len() as u64;
    let accept_ranges = if route.support_ranges || route.ignores_ranges {
        "Accept-Ranges: bytes\r\n"
    } else {
        ""
    };

    if method.eq_ignore_ascii_case("HEAD") {
        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n{}Connection: close\r\n\r\n",
            total, accept_ranges
        );
        let _ = stream.write_all(response.as_bytes());
        return;
    }
    if !is_get {
        let _ = stream.write_all(b"HTTP/1.1 405 Method Not Allowed\r\nConnection: close\r\n\r\n");
        return;
    }

    let honor_range = route.support_ranges && !route.ignores_ranges;
    let (status, content_range, slice) = match range.filter(|_| honor_range) {
        Some((start, end_incl)) => {
            let end_incl = end_incl.min(total.saturating_sub(1));
            if start > end_incl || start >= total {
                (
                    "416 Range Not Satisfiable",
                    Some(format!("bytes */{}", total)),
                    &body[0..0],
                )
            } else {
                (
                    "206 Partial Content",
                    Some(format!("bytes {}-{}/{}", start, end_incl, total)),
                    &body[start as usize..=end_incl as usize],
                )
            }
        }
        None => ("200 OK", None, &body[..]),
    };
    let content_range = content_range
        .map(|v| format!("Content-Range: {}\r\n", v))
        .unwrap_or_default();
    let response = format!(
        "HTTP/1.1 {}\r\nContent-Length: {}\r\n{}{}Connection: close\r\n\r\n",
        status,
        slice.len(),
        content_range,
        accept_ranges
    );
    if stream.write_all(response.as_bytes()).is_err() {
        return;
    }
    let sent = route.cut_after.map_or(slice.len(), |cut| cut.min(slice.len()));
    for piece in slice[..sent].chunks(route.chunk) {
        if stream.write_all(piece).is_err() || stream.flush().is_err() {
            return;
        }
        if !route.delay.is_zero() {
            thread::sleep(route.delay);
        }
    }
}

/// Returns (method, path, optional (start, end_inclusive) for `Range: bytes=X-Y`).
fn parse_request(request: &str) -> (&str, &str, Option<(u64, u64)>) {
    let mut lines = request.lines();
    let mut first = lines.next().unwrap_or("").split_whitespace();
    let method = first.next().unwrap_or("");
    let path = first.next().unwrap_or("/");
    let mut range = None;
    for line in lines {
        let line = line.trim();
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("range") {
                let value = value.trim();
                if let Some(ranges) = value.strip_prefix("bytes=") {
                    if let Some((a, b)) = ranges.split_once('-') {
                        let start = a.trim().parse::<u64>().unwrap_or(0);
                        let end = b.trim();
                        let end_incl = if end.is_empty() {
                            u64::MAX
                        } else {
                            end.parse::<u64>().unwrap_or(0)
                        };
                        range = Some((start, end_incl));
                    }
                }
            }
        }
    }
    (method, path, range)
}
