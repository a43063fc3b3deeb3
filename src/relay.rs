//! Minimal HTTP relay for the current frame.
//!
//! - `GET /`       re-streams the current-frame slot as `multipart/x-mixed-replace`
//! - `GET /health` reports stream health as JSON (200 when connected, 503 otherwise)
//!
//! Anything else is 404; non-GET methods are 405. Each streaming client gets
//! its own thread and ends when the client disconnects or the relay stops.

use anyhow::{anyhow, Result};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::frame::Frame;
use crate::ingest::encode_jpeg;
use crate::intercom::HealthReport;

const MAX_REQUEST_BYTES: usize = 8192;
/// Open connections of any kind, streaming clients included.
const MAX_CONNECTIONS: usize = 64;
const BOUNDARY: &str = "frame";
const FALLBACK_JPEG_QUALITY: u8 = 80;

/// What the relay serves.
pub trait FrameFeed: Send + Sync {
    fn latest_frame(&self) -> Option<Arc<Frame>>;
    fn health(&self) -> HealthReport;
}

#[derive(Clone, Debug)]
pub struct RelayConfig {
    pub addr: String,
    /// How often a streaming client checks for a newer frame.
    pub frame_interval: Duration,
    pub max_clients: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:8080".to_string(),
            frame_interval: Duration::from_millis(50),
            max_clients: 8,
        }
    }
}

#[derive(Debug)]
pub struct RelayHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl RelayHandle {
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("relay server thread panicked"))?;
        }
        Ok(())
    }
}

pub struct RelayServer {
    cfg: RelayConfig,
    feed: Arc<dyn FrameFeed>,
}

impl RelayServer {
    pub fn new(cfg: RelayConfig, feed: Arc<dyn FrameFeed>) -> Self {
        Self { cfg, feed }
    }

    pub fn spawn(self) -> Result<RelayHandle> {
        let configured_addr: SocketAddr = self.cfg.addr.parse()?;
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;
        log::info!("frame relay listening on {}", addr);

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let join = std::thread::Builder::new()
            .name("frame-relay".to_string())
            .spawn(move || {
                if let Err(err) = run_relay(listener, self.cfg, self.feed, shutdown_thread) {
                    log::error!("frame relay stopped: {}", err);
                }
            })?;

        Ok(RelayHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_relay(
    listener: TcpListener,
    cfg: RelayConfig,
    feed: Arc<dyn FrameFeed>,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    let clients = Arc::new(AtomicUsize::new(0));
    let mut connections: Vec<JoinHandle<()>> = Vec::new();
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        connections.retain(|handle| !handle.is_finished());
        match listener.accept() {
            Ok((stream, peer)) => {
                if connections.len() >= MAX_CONNECTIONS {
                    log::warn!("relay connection limit reached; dropping {}", peer);
                    continue;
                }
                // The request is read on the connection thread, never here.
                let conn_cfg = cfg.clone();
                let conn_feed = feed.clone();
                let client_count = clients.clone();
                let conn_shutdown = shutdown.clone();
                let spawned = std::thread::Builder::new()
                    .name("relay-conn".to_string())
                    .spawn(move || {
                        if let Err(err) = handle_connection(
                            stream,
                            &conn_cfg,
                            conn_feed.as_ref(),
                            &client_count,
                            &conn_shutdown,
                        ) {
                            log::debug!("relay connection from {} ended: {:#}", peer, err);
                        }
                    });
                match spawned {
                    Ok(handle) => connections.push(handle),
                    Err(err) => log::warn!("spawn relay connection thread: {}", err),
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    for handle in connections {
        let _ = handle.join();
    }
    Ok(())
}

/// Serve one connection. `/` keeps streaming until the client leaves or the relay stops.
fn handle_connection(
    mut stream: TcpStream,
    cfg: &RelayConfig,
    feed: &dyn FrameFeed,
    clients: &AtomicUsize,
    shutdown: &AtomicBool,
) -> Result<()> {
    stream.set_nonblocking(false)?;
    let request = read_request(&mut stream)?;
    if request.method != "GET" {
        return write_json_response(&mut stream, 405, r#"{"error":"method_not_allowed"}"#);
    }
    match request.path.as_str() {
        "/health" => {
            let report = feed.health();
            let status = if report.is_healthy() { 200 } else { 503 };
            let body = serde_json::to_vec(&report)?;
            write_response(&mut stream, status, "application/json", &body)
        }
        "/" => {
            if clients.fetch_add(1, Ordering::SeqCst) >= cfg.max_clients {
                clients.fetch_sub(1, Ordering::SeqCst);
                return write_json_response(&mut stream, 503, r#"{"error":"too_many_clients"}"#);
            }
            let result = stream_frames(stream, feed, cfg.frame_interval, shutdown);
            clients.fetch_sub(1, Ordering::SeqCst);
            result
        }
        _ => write_json_response(&mut stream, 404, r#"{"error":"not_found"}"#),
    }
}

fn stream_frames(
    mut stream: TcpStream,
    feed: &dyn FrameFeed,
    interval: Duration,
    shutdown: &AtomicBool,
) -> Result<()> {
    stream.set_write_timeout(Some(Duration::from_secs(5)))?;
    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: multipart/x-mixed-replace; boundary={}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
        BOUNDARY
    );
    stream.write_all(header.as_bytes())?;

    let mut last_sent = None;
    while !shutdown.load(Ordering::SeqCst) {
        if let Some(frame) = feed.latest_frame() {
            if last_sent != Some(frame.sequence) {
                let jpeg = frame_jpeg(&frame)?;
                let part = format!(
                    "--{}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
                    BOUNDARY,
                    jpeg.len()
                );
                stream.write_all(part.as_bytes())?;
                stream.write_all(&jpeg)?;
                stream.write_all(b"\r\n")?;
                stream.flush()?;
                last_sent = Some(frame.sequence);
            }
        }
        std::thread::sleep(interval);
    }
    Ok(())
}

fn frame_jpeg(frame: &Frame) -> Result<Vec<u8>> {
    if !frame.jpeg().is_empty() {
        return Ok(frame.jpeg().to_vec());
    }
    encode_jpeg(frame.pixels(), frame.width, frame.height, FALLBACK_JPEG_QUALITY)
}

fn read_request(stream: &mut TcpStream) -> Result<HttpRequest> {
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;
    let mut buf = [0u8; 1024];
    let mut data = Vec::new();
    loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            break;
        }
        data.extend_from_slice(&buf[..n]);
        if data.len() > MAX_REQUEST_BYTES {
            return Err(anyhow!("request too large"));
        }
        if data.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }
    let text = String::from_utf8_lossy(&data);
    let request_line = text
        .split("\r\n")
        .next()
        .ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let path = raw_path.split('?').next().unwrap_or(raw_path).to_string();
    Ok(HttpRequest {
        method: method.to_string(),
        path,
    })
}

fn write_json_response(stream: &mut TcpStream, status: u16, body: &str) -> Result<()> {
    write_response(stream, status, "application/json", body.as_bytes())
}

fn write_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> Result<()> {
    let status_line = match status {
        200 => "HTTP/1.1 200 OK",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        503 => "HTTP/1.1 503 Service Unavailable",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
        status_line = status_line,
        content_type = content_type,
        len = body.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(body)?;
    Ok(())
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct FakeFeed {
        frame: Mutex<Option<Arc<Frame>>>,
        connected: bool,
    }

    impl FrameFeed for FakeFeed {
        fn latest_frame(&self) -> Option<Arc<Frame>> {
            self.frame.lock().unwrap().clone()
        }

        fn health(&self) -> HealthReport {
            HealthReport {
                status: if self.connected { "ok" } else { "degraded" },
                connected: self.connected,
                frames: 3,
                last_frame_age_ms: Some(12),
                identities: 2,
            }
        }
    }

    fn spawn_relay(feed: FakeFeed) -> RelayHandle {
        let cfg = RelayConfig {
            addr: "127.0.0.1:0".to_string(),
            frame_interval: Duration::from_millis(10),
            max_clients: 2,
        };
        RelayServer::new(cfg, Arc::new(feed)).spawn().unwrap()
    }

    fn request(addr: SocketAddr, raw: &str) -> String {
        let mut stream = TcpStream::connect(addr).unwrap();
        stream.write_all(raw.as_bytes()).unwrap();
        let mut out = String::new();
        stream.read_to_string(&mut out).unwrap();
        out
    }

    #[test]
    fn health_reports_ok_when_connected() {
        let handle = spawn_relay(FakeFeed {
            frame: Mutex::new(None),
            connected: true,
        });
        let response = request(handle.addr, "GET /health HTTP/1.1\r\nHost: x\r\n\r\n");
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.contains(r#""status":"ok""#));
        assert!(response.contains(r#""identities":2"#));
        handle.stop().unwrap();
    }

    #[test]
    fn health_is_503_when_disconnected() {
        let handle = spawn_relay(FakeFeed {
            frame: Mutex::new(None),
            connected: false,
        });
        let response = request(handle.addr, "GET /health HTTP/1.1\r\n\r\n");
        assert!(response.starts_with("HTTP/1.1 503"));
        assert!(response.contains(r#""status":"degraded""#));
        handle.stop().unwrap();
    }

    #[test]
    fn unknown_path_and_method_are_rejected() {
        let handle = spawn_relay(FakeFeed {
            frame: Mutex::new(None),
            connected: true,
        });
        assert!(request(handle.addr, "GET /nope HTTP/1.1\r\n\r\n").starts_with("HTTP/1.1 404"));
        assert!(request(handle.addr, "POST / HTTP/1.1\r\n\r\n").starts_with("HTTP/1.1 405"));
        handle.stop().unwrap();
    }

    #[test]
    fn silent_client_does_not_block_other_requests() {
        let handle = spawn_relay(FakeFeed {
            frame: Mutex::new(None),
            connected: true,
        });
        // Connects but never sends a request line.
        let idle = TcpStream::connect(handle.addr).unwrap();
        std::thread::sleep(Duration::from_millis(100));

        let started = std::time::Instant::now();
        let response = request(handle.addr, "GET /health HTTP/1.1\r\n\r\n");
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(started.elapsed() < Duration::from_secs(1));

        drop(idle);
        handle.stop().unwrap();
    }

    #[test]
    fn streaming_clients_are_capped() {
        let handle = spawn_relay(FakeFeed {
            frame: Mutex::new(None),
            connected: true,
        });
        let mut open = Vec::new();
        for _ in 0..2 {
            let mut stream = TcpStream::connect(handle.addr).unwrap();
            stream.write_all(b"GET / HTTP/1.1\r\n\r\n").unwrap();
            stream
                .set_read_timeout(Some(Duration::from_secs(5)))
                .unwrap();
            let mut buf = [0u8; 256];
            let n = stream.read(&mut buf).unwrap();
            assert!(String::from_utf8_lossy(&buf[..n]).starts_with("HTTP/1.1 200 OK"));
            open.push(stream);
        }

        let response = request(handle.addr, "GET / HTTP/1.1\r\n\r\n");
        assert!(response.starts_with("HTTP/1.1 503"));
        assert!(response.contains("too_many_clients"));

        drop(open);
        handle.stop().unwrap();
    }

    #[test]
    fn root_streams_current_frame_jpeg() {
        let jpeg = encode_jpeg(&vec![90u8; 8 * 8 * 3], 8, 8, 80).unwrap();
        let frame = Frame::new(vec![90u8; 8 * 8 * 3], 8, 8, 1).with_jpeg(jpeg.clone());
        let handle = spawn_relay(FakeFeed {
            frame: Mutex::new(Some(Arc::new(frame))),
            connected: true,
        });

        let mut stream = TcpStream::connect(handle.addr).unwrap();
        stream.write_all(b"GET / HTTP/1.1\r\n\r\n").unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();

        let mut received = Vec::new();
        let mut buf = [0u8; 4096];
        while !received.windows(2).any(|w| w == [0xFF, 0xD9]) {
            let n = stream.read(&mut buf).unwrap();
            assert!(n > 0, "relay closed early");
            received.extend_from_slice(&buf[..n]);
        }
        let text = String::from_utf8_lossy(&received);
        assert!(text.contains("multipart/x-mixed-replace; boundary=frame"));
        assert!(text.contains("--frame\r\nContent-Type: image/jpeg"));
        let start = received
            .windows(2)
            .position(|w| w == [0xFF, 0xD8])
            .unwrap();
        assert_eq!(&received[start..start + jpeg.len()], jpeg.as_slice());

        drop(stream);
        handle.stop().unwrap();
    }
}
