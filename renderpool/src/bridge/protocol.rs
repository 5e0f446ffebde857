//! Readiness handshake and render request addressing.
//!
//! The worker announces itself with exactly one `host:port` line on stdout before
//! serving anything. Every render call afterwards is a single HTTP POST to that
//! address, with the route as the request path and the JSON payload as the body.

use std::net::SocketAddr;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReadyLineError {
    #[error("empty readiness line")]
    Empty,
    #[error("not a host:port address: {0}")]
    InvalidAddress(String),
    #[error("address {0} is not on a loopback interface")]
    NotLoopback(SocketAddr),
    #[error("address {0} has no port")]
    NoPort(SocketAddr),
}

/// Parse the one-line address announcement a worker writes when it is ready.
pub fn parse_ready_line(line: &str) -> Result<SocketAddr, ReadyLineError> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Err(ReadyLineError::Empty);
    }

    let addr: SocketAddr = trimmed
        .parse()
        .map_err(|e: std::net::AddrParseError| ReadyLineError::InvalidAddress(e.to_string()))?;

    if !addr.ip().is_loopback() {
        return Err(ReadyLineError::NotLoopback(addr));
    }
    if addr.port() == 0 {
        return Err(ReadyLineError::NoPort(addr));
    }

    Ok(addr)
}

/// Build the URL a render call is sent to. Routes without a leading slash get one.
pub fn render_url(addr: SocketAddr, route: &str) -> String {
    if route.starts_with('/') {
        format!("http://{addr}{route}")
    } else {
        format!("http://{addr}/{route}")
    }
}
