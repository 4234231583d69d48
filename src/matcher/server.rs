//! Inbound notification endpoint. Participants point the matcher at swaps
//! with small JSON notifications over HTTP; the payloads are hints only,
//! everything actionable is re-verified against the ledgers before the
//! matcher acts. The server is a deliberately small HTTP/1.1 listener: one
//! route, POST only, bounded bodies.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::ledger::{Address, ContractId};
use crate::Error;

/// Largest accepted request body.
const MAX_BODY: usize = 64 * 1024;

/// A request from a participant asking the matcher to work a swap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op")]
pub enum Notification {
    /// A buyer hands over their secret: once the seller accepts the buyer's
    /// escrow, finalize the offer on the buyer's behalf.
    #[serde(rename = "trackBuyer", rename_all = "camelCase")]
    TrackBuyer {
        offer_id: ContractId,
        password: String,
        from: Address,
    },
    /// A seller asks the matcher to track an offer it delegates: accept the
    /// first funded escrow and claim the payment once the secret is revealed.
    #[serde(rename = "trackSeller", rename_all = "camelCase")]
    TrackSeller { offer_id: ContractId },
}

/// Outcome of parsing one request body, mapped onto HTTP status codes the
/// way participants expect: an unknown operation is a missing route (404), a
/// known operation with a bad payload is a client error (400).
pub(crate) fn parse_notification(body: &[u8]) -> Result<Notification, (u16, &'static str)> {
    let value: serde_json::Value =
        serde_json::from_slice(body).map_err(|_| (400, "Bad Request"))?;
    let op = value
        .get("op")
        .and_then(|op| op.as_str())
        .ok_or((400, "Bad Request"))?;
    match op {
        "trackBuyer" | "trackSeller" => {
            serde_json::from_value(value).map_err(|_| (400, "Bad Request"))
        }
        _ => Err((404, "Not Found")),
    }
}

/// Single-threaded notification listener. Connections are handled inline on
/// the accept loop; accepted notifications are pushed into `sink`, which in
/// the matcher forwards onto the event bus.
pub struct NotificationServer {
    listener: TcpListener,
}

impl NotificationServer {
    pub fn bind(addr: impl ToSocketAddrs) -> io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        // non-blocking so the accept loop can observe shutdown
        listener.set_nonblocking(true)?;
        Ok(NotificationServer { listener })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve until `shutdown` is raised. Connection-level failures are
    /// logged and dropped, only sink failures abort the server.
    pub fn run<F>(&self, shutdown: &AtomicBool, mut sink: F) -> Result<(), Error>
    where
        F: FnMut(Notification) -> Result<(), Error>,
    {
        while !shutdown.load(Ordering::Relaxed) {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    debug!("notification connection from {}", peer);
                    if let Err(e) = handle_connection(stream, &mut sink) {
                        warn!("notification connection from {} failed: {}", peer, e);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(50));
                }
                Err(e) => {
                    warn!("accept failed: {}", e);
                }
            }
        }
        Ok(())
    }
}

fn handle_connection<F>(mut stream: TcpStream, sink: &mut F) -> Result<(), Error>
where
    F: FnMut(Notification) -> Result<(), Error>,
{
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .map_err(crate::ledger::LedgerError::new)?;
    stream
        .set_nonblocking(false)
        .map_err(crate::ledger::LedgerError::new)?;

    let request = match read_request(&mut stream) {
        Ok(request) => request,
        Err(_) => {
            respond(&mut stream, 400, "Bad Request");
            return Ok(());
        }
    };

    if request.method != "POST" {
        respond(&mut stream, 404, "Not Found");
        return Ok(());
    }
    match parse_notification(&request.body) {
        Ok(notification) => {
            sink(notification)?;
            respond(&mut stream, 200, "OK");
        }
        Err((status, reason)) => respond(&mut stream, status, reason),
    }
    Ok(())
}

struct Request {
    method: String,
    body: Vec<u8>,
}

fn read_request(stream: &mut TcpStream) -> io::Result<Request> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    let header_end = loop {
        let n = stream.read(&mut chunk)?;
        if n == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = find_header_end(&buf) {
            break pos;
        }
        if buf.len() > MAX_BODY {
            return Err(io::ErrorKind::InvalidData.into());
        }
    };

    let head = std::str::from_utf8(&buf[..header_end])
        .map_err(|_| io::Error::from(io::ErrorKind::InvalidData))?;
    let mut lines = head.split("\r\n");
    let request_line = lines.next().unwrap_or("");
    let method = request_line
        .split_whitespace()
        .next()
        .unwrap_or("")
        .to_string();

    let mut content_length = 0usize;
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            if name.eq_ignore_ascii_case("content-length") {
                content_length = value
                    .trim()
                    .parse()
                    .map_err(|_| io::Error::from(io::ErrorKind::InvalidData))?;
            }
        }
    }
    if content_length > MAX_BODY {
        return Err(io::ErrorKind::InvalidData.into());
    }

    let mut body = buf[header_end + 4..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut chunk)?;
        if n == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        body.extend_from_slice(&chunk[..n]);
    }
    body.truncate(content_length);
    Ok(Request { method, body })
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn respond(stream: &mut TcpStream, status: u16, reason: &str) {
    let body = reason.as_bytes();
    let head = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        status,
        reason,
        body.len()
    );
    // best effort, the peer may already be gone
    let _ = stream.write_all(head.as_bytes());
    let _ = stream.write_all(body);
    let _ = stream.flush();
}
