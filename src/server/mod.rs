//! HTTP surface for the annotated stream.
//!
//! - `GET /` or `GET /stream`: `multipart/x-mixed-replace` MJPEG stream
//! - `GET /snapshot.jpg`: latest frame as a single JPEG
//! - `GET /health`: pipeline counters as JSON
//!
//! The accept loop runs on its own thread; each streaming client gets a
//! thread that waits on the `StreamHub` for newer parts.

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::pipeline::{PipelineStats, StatsSnapshot};
use crate::stream::{HubEvent, StreamHub, BOUNDARY};

const MAX_REQUEST_BYTES: usize = 8192;
const CLIENT_WAIT: Duration = Duration::from_millis(500);
/// A client that stops reading is dropped after this long.
const CLIENT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:5000".to_string(),
        }
    }
}

#[derive(Debug)]
pub struct ServerHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    hub: Arc<StreamHub>,
    join: Option<JoinHandle<()>>,
}

impl ServerHandle {
    /// Stop accepting, disconnect stream clients and join the server thread.
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        self.hub.close()?;
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("stream server thread panicked"))?;
        }
        Ok(())
    }
}

pub struct StreamServer {
    cfg: ServerConfig,
    hub: Arc<StreamHub>,
    stats: Arc<PipelineStats>,
}

#[derive(Serialize)]
struct HealthBody<'a> {
    status: &'a str,
    frames_published: u64,
    pipeline: StatsSnapshot,
}

impl StreamServer {
    pub fn new(cfg: ServerConfig, hub: Arc<StreamHub>, stats: Arc<PipelineStats>) -> Self {
        Self { cfg, hub, stats }
    }

    pub fn spawn(self) -> Result<ServerHandle> {
        let listener = TcpListener::bind(self.cfg.addr.as_str())
            .with_context(|| format!("bind stream server on {}", self.cfg.addr))?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let hub = self.hub.clone();
        let join = std::thread::Builder::new()
            .name("stream-server".to_string())
            .spawn(move || {
                if let Err(err) = run_server(listener, &self, shutdown_thread) {
                    log::error!("stream server stopped: {}", err);
                }
            })?;

        Ok(ServerHandle {
            addr,
            shutdown,
            hub,
            join: Some(join),
        })
    }
}

fn run_server(
    listener: TcpListener,
    server: &StreamServer,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    let mut clients: Vec<JoinHandle<()>> = Vec::new();
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        clients.retain(|client| !client.is_finished());
        match listener.accept() {
            Ok((stream, peer)) => {
                let hub = server.hub.clone();
                let stats = server.stats.clone();
                let shutdown = shutdown.clone();
                let client = std::thread::spawn(move || {
                    if let Err(err) = handle_connection(stream, &hub, &stats, &shutdown) {
                        log::debug!("stream client {} disconnected: {}", peer, err);
                    }
                });
                clients.push(client);
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    for client in clients {
        let _ = client.join();
    }
    Ok(())
}

fn handle_connection(
    mut stream: TcpStream,
    hub: &StreamHub,
    stats: &PipelineStats,
    shutdown: &AtomicBool,
) -> Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_write_timeout(Some(CLIENT_WRITE_TIMEOUT))?;
    let request = read_request(&mut stream)?;
    if request.method != "GET" {
        write_json_response(&mut stream, 405, r#"{"error":"method_not_allowed"}"#)?;
        return Ok(());
    }
    match request.path.as_str() {
        "/" | "/stream" => stream_frames(stream, hub, shutdown),
        "/snapshot.jpg" => match hub.latest()? {
            Some(chunk) => write_response(&mut stream, 200, "image/jpeg", chunk.jpeg()),
            None => write_json_response(&mut stream, 503, r#"{"error":"no_frame"}"#),
        },
        "/health" => {
            let body = HealthBody {
                status: "ok",
                frames_published: hub.generation()?,
                pipeline: stats.snapshot(),
            };
            let payload = serde_json::to_vec(&body)?;
            write_response(&mut stream, 200, "application/json", &payload)
        }
        _ => write_json_response(&mut stream, 404, r#"{"error":"not_found"}"#),
    }
}

fn stream_frames(mut stream: TcpStream, hub: &StreamHub, shutdown: &AtomicBool) -> Result<()> {
    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: multipart/x-mixed-replace; boundary={}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
        BOUNDARY
    );
    stream.write_all(header.as_bytes())?;
    let peer = stream.peer_addr()?;
    log::info!("stream client {} connected", peer);

    let mut seen = 0;
    while !shutdown.load(Ordering::SeqCst) {
        match hub.wait_newer(seen, CLIENT_WAIT)? {
            HubEvent::Chunk(generation, chunk) => {
                seen = generation;
                stream.write_all(chunk.as_bytes())?;
                stream.flush()?;
            }
            HubEvent::Timeout => {}
            HubEvent::Closed => break,
        }
    }
    log::info!("stream client {} closed", peer);
    Ok(())
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
