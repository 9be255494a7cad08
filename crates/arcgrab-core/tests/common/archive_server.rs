//! Minimal HTTP/1.1 archive fake for integration tests.
//!
//! Serves `/metadata/<id>` manifest documents and `/download/<id>/<name>`
//! file bodies with Range support, plus switchable faults: ignore ranges,
//! throttle the first N requests with 429, or truncate bodies mid-stream.

use md5::{Digest, Md5};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::TcpListener;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

/// One file served by the fake archive.
#[derive(Clone)]
pub struct ServedFile {
    pub name: String,
    pub body: Vec<u8>,
    /// Publish the size in the manifest (false = size unknown to clients).
    pub publish_size: bool,
    /// Publish the body's MD5 in the manifest.
    pub publish_md5: bool,
    /// Publish this digest instead of the real one (integrity faults).
    pub md5_override: Option<String>,
}

impl ServedFile {
    pub fn new(name: &str, body: Vec<u8>) -> Self {
        Self {
            name: name.to_string(),
            body,
            publish_size: true,
            publish_md5: true,
            md5_override: None,
        }
    }
}

#[derive(Clone, Copy, Default)]
pub struct ServerOptions {
    /// Answer ranged GETs with 200 and the full body.
    pub ignore_range: bool,
    /// Respond 429 to the first N download GETs.
    pub throttle_first: u32,
    /// Send only half the advertised body for the first N download GETs,
    /// then close the connection (premature EOF).
    pub truncate_first: u32,
}

pub struct ArchiveServer {
    url: String,
    state: Arc<State>,
}

struct State {
    items: HashMap<String, Vec<ServedFile>>,
    opts: ServerOptions,
    throttle_left: AtomicU32,
    truncate_left: AtomicU32,
    download_hits: AtomicUsize,
    bytes_served: AtomicU64,
    /// Range start per download GET; None for plain requests.
    ranges: Mutex<Vec<Option<u64>>>,
}

impl ArchiveServer {
    /// Base URL, e.g. `http://127.0.0.1:12345`.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Number of download GETs seen (metadata requests not counted).
    pub fn download_hits(&self) -> usize {
        self.state.download_hits.load(Ordering::SeqCst)
    }

    /// Body bytes actually written to clients.
    pub fn bytes_served(&self) -> u64 {
        self.state.bytes_served.load(Ordering::SeqCst)
    }

    /// Range start offsets of download GETs, in arrival order.
    pub fn ranges(&self) -> Vec<Option<u64>> {
        self.state.ranges.lock().unwrap().clone()
    }
}

/// Start the fake archive in background threads. Runs until process exit.
pub fn start(items: Vec<(&str, Vec<ServedFile>)>, opts: ServerOptions) -> ArchiveServer {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().unwrap().port();
    let state = Arc::new(State {
        items: items
            .into_iter()
            .map(|(id, files)| (id.to_string(), files))
            .collect(),
        opts,
        throttle_left: AtomicU32::new(opts.throttle_first),
        truncate_left: AtomicU32::new(opts.truncate_first),
        download_hits: AtomicUsize::new(0),
        bytes_served: AtomicU64::new(0),
        ranges: Mutex::new(Vec::new()),
    });
    let accept_state = Arc::clone(&state);
    thread::spawn(move || {
        for stream in listener.incoming().flatten() {
            let state = Arc::clone(&accept_state);
            thread::spawn(move || handle(stream, &state));
        }
    });
    ArchiveServer {
        url: format!("http://127.0.0.1:{}", port),
        state,
    }
}

fn handle(mut stream: std::net::TcpStream, state: &State) {
    let _ = stream.set_read_timeout(Some(std::time::Duration::from_secs(2)));
    let _ = stream.set_write_timeout(Some(std::time::Duration::from_secs(5)));
    let mut buf = [0u8; 8192];
    let n = match stream.read(&mut buf) {
        Ok(0) | Err(_) => return,
        Ok(n) => n,
    };
    let Ok(request) = std::str::from_utf8(&buf[..n]) else {
        return;
    };
    let (method, path, range) = parse_request(request);
    if !method.eq_ignore_ascii_case("GET") {
        let _ = stream.write_all(b"HTTP/1.1 405 Method Not Allowed\r\nConnection: close\r\n\r\n");
        return;
    }

    if let Some(identifier) = path.strip_prefix("/metadata/") {
        serve_metadata(&mut stream, state, identifier);
        return;
    }
    if let Some(rest) = path.strip_prefix("/download/") {
        serve_download(&mut stream, state, rest, range);
        return;
    }
    let _ = stream.write_all(b"HTTP/1.1 404 Not Found\r\nConnection: close\r\n\r\n");
}

fn serve_metadata(stream: &mut std::net::TcpStream, state: &State, identifier: &str) {
    let Some(files) = state.items.get(identifier) else {
        // The real archive answers 200 with an empty document for unknown ids.
        respond(stream, "200 OK", &[], b"{}");
        return;
    };
    let entries: Vec<serde_json::Value> = files
        .iter()
        .map(|f| {
            let mut entry = serde_json::json!({ "name": f.name });
            if f.publish_size {
                // The archive serializes sizes as decimal strings.
                entry["size"] = serde_json::Value::String(f.body.len().to_string());
            }
            if let Some(fake) = &f.md5_override {
                entry["md5"] = serde_json::Value::String(fake.clone());
            } else if f.publish_md5 {
                entry["md5"] =
                    serde_json::Value::String(hex::encode(Md5::digest(&f.body)));
            }
            entry
        })
        .collect();
    let body = serde_json::json!({ "files": entries }).to_string();
    respond(stream, "200 OK", &[], body.as_bytes());
}

fn serve_download(
    stream: &mut std::net::TcpStream,
    state: &State,
    rest: &str,
    range: Option<u64>,
) {
    state.download_hits.fetch_add(1, Ordering::SeqCst);
    state.ranges.lock().unwrap().push(range);

    let Some((identifier, name)) = rest.split_once('/') else {
        respond(stream, "404 Not Found", &[], b"");
        return;
    };
    let file = state
        .items
        .get(identifier)
        .and_then(|files| files.iter().find(|f| f.name == name));
    let Some(file) = file else {
        respond(stream, "404 Not Found", &[], b"");
        return;
    };

    if state.throttle_left.load(Ordering::SeqCst) > 0 {
        state.throttle_left.fetch_sub(1, Ordering::SeqCst);
        respond(stream, "429 Too Many Requests", &[], b"slow down");
        return;
    }

    let total = file.body.len() as u64;
    let range = if state.opts.ignore_range { None } else { range };
    let (status, slice, content_range) = match range {
        Some(start) if start >= total => {
            let header = format!("Content-Range: bytes */{}", total);
            respond(stream, "416 Range Not Satisfiable", &[&header], b"");
            return;
        }
        Some(start) => {
            let slice = &file.body[start as usize..];
            let header = format!(
                "Content-Range: bytes {}-{}/{}",
                start,
                total - 1,
                total
            );
            ("206 Partial Content", slice, Some(header))
        }
        None => ("200 OK", &file.body[..], None),
    };

    let truncate = state.truncate_left.load(Ordering::SeqCst) > 0;
    if truncate {
        state.truncate_left.fetch_sub(1, Ordering::SeqCst);
    }
    let advertised = slice.len();
    let written = if truncate { slice.len() / 2 } else { slice.len() };

    let mut headers = vec!["Accept-Ranges: bytes".to_string()];
    if let Some(h) = content_range {
        headers.push(h);
    }
    let header_refs: Vec<&str> = headers.iter().map(|s| s.as_str()).collect();
    respond_sized(stream, status, &header_refs, &slice[..written], advertised);
    state.bytes_served.fetch_add(written as u64, Ordering::SeqCst);
}

fn respond(stream: &mut std::net::TcpStream, status: &str, headers: &[&str], body: &[u8]) {
    respond_sized(stream, status, headers, body, body.len());
}

/// Write a response advertising `content_length` but sending only `body`
/// (the two differ when simulating premature EOF).
fn respond_sized(
    stream: &mut std::net::TcpStream,
    status: &str,
    headers: &[&str],
    body: &[u8],
    content_length: usize,
) {
    let mut response = format!(
        "HTTP/1.1 {}\r\nContent-Length: {}\r\nConnection: close\r\n",
        status, content_length
    );
    for header in headers {
        response.push_str(header);
        response.push_str("\r\n");
    }
    response.push_str("\r\n");
    let _ = stream.write_all(response.as_bytes());
    let _ = stream.write_all(body);
}

/// Returns (method, path, range start for `Range: bytes=X-`).
fn parse_request(request: &str) -> (&str, &str, Option<u64>) {
    let mut lines = request.lines();
    let request_line = lines.next().unwrap_or("");
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or("");
    let path = parts.next().unwrap_or("");

    let mut range = None;
    for line in lines {
        let line = line.trim();
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("range") {
                let value = value.trim().to_ascii_lowercase();
                if let Some(spec) = value.strip_prefix("bytes=") {
                    if let Some((start, _)) = spec.split_once('-') {
                        range = start.trim().parse::<u64>().ok();
                    }
                }
            }
        }
    }
    (method, path, range)
}
