//! Throttled HTTP/1.1 server for integration tests
//!
//! Serves one static body for every path. Honors `Range: bytes=N-` with a
//! 206 unless ranges are switched off, and writes the body in small
//! chunks with a delay so transfers can be paused mid-stream.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

struct State {
    body: Vec<u8>,
    chunk_size: usize,
    chunk_delay: Duration,
    ranges: AtomicBool,
    /// `Range` header of every request, in arrival order
    seen: Mutex<Vec<Option<String>>>,
}

pub struct RangeServer {
    addr: SocketAddr,
    state: Arc<State>,
}

impl RangeServer {
    pub async fn start(body: Vec<u8>, chunk_size: usize, chunk_delay: Duration) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let state = Arc::new(State {
            body,
            chunk_size,
            chunk_delay,
            ranges: AtomicBool::new(true),
            seen: Mutex::new(Vec::new()),
        });

        let shared = state.clone();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let state = shared.clone();
                tokio::spawn(async move {
                    let _ = serve(socket, state).await;
                });
            }
        });

        Self { addr, state }
    }

    pub fn url(&self, name: &str) -> String {
        format!("http://{}/{}", self.addr, name)
    }

    pub fn set_ranges(&self, enabled: bool) {
        self.state.ranges.store(enabled, Ordering::SeqCst);
    }

    pub fn range_headers(&self) -> Vec<Option<String>> {
        self.state.seen.lock().unwrap().clone()
    }
}

/// Answer every request with the same raw bytes, then close the connection
pub async fn serve_raw(response: Vec<u8>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let response = Arc::new(response);

    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            let response = response.clone();
            tokio::spawn(async move {
                let (reader, mut writer) = socket.into_split();
                let mut reader = BufReader::new(reader);
                let mut line = String::new();
                while reader.read_line(&mut line).await.unwrap_or(0) > 0 {
                    if line.trim_end().is_empty() {
                        break;
                    }
                    line.clear();
                }
                let _ = writer.write_all(&response).await;
                let _ = writer.shutdown().await;
            });
        }
    });

    format!("http://{}/raw.bin", addr)
}

/// Deterministic, non-repeating-looking test payload
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

async fn serve(socket: TcpStream, state: Arc<State>) -> std::io::Result<()> {
    let (reader, mut writer) = socket.into_split();
    let mut reader = BufReader::new(reader);

    let mut range = None;
    let mut first = true;
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(());
        }
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        if first {
            first = false;
            continue;
        }
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("range") {
                range = Some(value.trim().to_string());
            }
        }
    }
    state.seen.lock().unwrap().push(range.clone());

    let total = state.body.len() as u64;
    let start = range
        .as_deref()
        .filter(|_| state.ranges.load(Ordering::SeqCst))
        .and_then(|r| r.strip_prefix("bytes="))
        .and_then(|r| r.trim_end_matches('-').parse::<u64>().ok())
        .filter(|start| *start < total);

    let (head, from) = match start {
        Some(start) => (
            format!(
                "HTTP/1.1 206 Partial Content\r\nContent-Length: {}\r\nContent-Range: bytes {}-{}/{}\r\nAccept-Ranges: bytes\r\nConnection: close\r\n\r\n",
                total - start,
                start,
                total - 1,
                total
            ),
            start as usize,
        ),
        None => (
            format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                total
            ),
            0,
        ),
    };

    writer.write_all(head.as_bytes()).await?;
    for chunk in state.body[from..].chunks(state.chunk_size) {
        tokio::time::sleep(state.chunk_delay).await;
        writer.write_all(chunk).await?;
        writer.flush().await?;
    }
    writer.shutdown().await
}
