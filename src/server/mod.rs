//! Hello protocol servers.
//!
//! Both engines bind one UDP socket and answer every datagram with
//! [`protocol::reply`](crate::protocol::reply), computed on a bounded
//! [`WorkerPool`](crate::pool::WorkerPool):
//! - `blocking`: a receive thread hands datagrams to the pool, workers send
//!   replies directly on the shared socket
//! - `reactor`: a mio event loop receives datagrams, workers queue replies
//!   and wake the loop, which is the only writer

mod blocking;
mod reactor;

pub use blocking::BlockingServer;
pub use reactor::ReactorServer;

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tracing::debug;

use crate::error::{HelloError, Result};
use crate::protocol;

/// How long `close` waits for in-flight replies.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Default bound of the reactor's pending-reply queue.
const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Parameters of a server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Port to bind; 0 picks an ephemeral port.
    pub port: u16,
    /// Reply workers.
    pub workers: usize,
    /// Pending replies the reactor buffers before workers block.
    pub queue_capacity: usize,
}

impl ServerConfig {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            workers: 1,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(HelloError::InvalidConfig("workers must be at least 1".into()));
        }
        if self.queue_capacity == 0 {
            return Err(HelloError::InvalidConfig(
                "queue capacity must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// A bound server socket and the datagram size to allocate for it.
struct Bound {
    socket: Socket,
    local_addr: SocketAddr,
    datagram_size: usize,
}

/// Bind a UDP socket on every local address.
///
/// Tries a dual-stack IPv6 socket first so that both `127.0.0.1` and `::1`
/// clients reach it, then falls back to IPv4 only.
fn bind(port: u16) -> Result<Bound> {
    let socket = match bind_dual_stack(port) {
        Ok(socket) => socket,
        Err(e) => {
            debug!(port, error = %e, "Dual-stack bind failed, falling back to IPv4");
            let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
            let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
                .map_err(|e| HelloError::socket("cannot create socket", e))?;
            socket
                .bind(&addr.into())
                .map_err(|e| HelloError::socket(format!("cannot bind {addr}"), e))?;
            socket
        }
    };

    let local_addr = socket
        .local_addr()
        .and_then(|addr| {
            addr.as_socket()
                .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "not an inet address"))
        })
        .map_err(|e| HelloError::socket("cannot get local address", e))?;
    let size = socket
        .recv_buffer_size()
        .map_err(|e| HelloError::socket("cannot get receive buffer size", e))?;

    Ok(Bound {
        socket,
        local_addr,
        datagram_size: protocol::datagram_capacity(size),
    })
}

fn bind_dual_stack(port: u16) -> io::Result<Socket> {
    let socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_only_v6(false)?;
    socket.bind(&SockAddr::from(SocketAddr::from((Ipv6Addr::UNSPECIFIED, port))))?;
    Ok(socket)
}
