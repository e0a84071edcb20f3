//! UDP socket construction

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::net::UdpSocket;
use tracing::{debug, warn};

fn default_buffer_size() -> usize {
    4 * 1024 * 1024
}

/// Kernel buffer sizes requested for every socket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SocketConfig {
    #[serde(default = "default_buffer_size")]
    pub send_buffer: usize,
    #[serde(default = "default_buffer_size")]
    pub recv_buffer: usize,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            send_buffer: default_buffer_size(),
            recv_buffer: default_buffer_size(),
        }
    }
}

/// Bind a non-blocking UDP socket with address reuse and large buffers
///
/// Buffer sizes the kernel refuses are logged and skipped.
pub fn bind_udp(addr: SocketAddr, config: &SocketConfig) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))
        .context("Failed to create UDP socket")?;
    socket.set_reuse_address(true)?;
    if let Err(err) = socket.set_send_buffer_size(config.send_buffer) {
        warn!(%err, size = config.send_buffer, "Failed to set send buffer size");
    }
    if let Err(err) = socket.set_recv_buffer_size(config.recv_buffer) {
        warn!(%err, size = config.recv_buffer, "Failed to set receive buffer size");
    }
    socket.set_nonblocking(true)?;
    socket
        .bind(&addr.into())
        .with_context(|| format!("Failed to bind UDP socket to {}", addr))?;

    debug!(
        %addr,
        send_buffer = socket.send_buffer_size().unwrap_or(0),
        recv_buffer = socket.recv_buffer_size().unwrap_or(0),
        "UDP socket bound"
    );

    let std_socket: std::net::UdpSocket = socket.into();
    Ok(UdpSocket::from_std(std_socket)?)
}

/// Ephemeral local address of the same family as `remote`
pub fn unspecified_for(remote: &SocketAddr) -> SocketAddr {
    let ip = match remote.ip() {
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    };
    SocketAddr::new(ip, 0)
}
