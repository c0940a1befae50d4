//! Hello protocol clients.
//!
//! Both engines drive every lane through `requests` request/response cycles
//! and return once all lanes completed or the global deadline abandoned
//! them:
//! - `blocking`: one pooled thread per lane, blocking socket with a receive
//!   timeout, resends on every timeout or mismatch
//! - `reactor`: one mio event loop over a non-blocking socket per lane,
//!   resends only when a whole poll cycle produced no readiness

mod blocking;
mod reactor;

pub use blocking::BlockingClient;
pub use reactor::ReactorClient;

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};
use std::time::Duration;

use crate::error::{HelloError, Result};

/// Receive timeout of a blocking lane socket.
pub const RECEIVE_TIMEOUT: Duration = Duration::from_millis(100);

/// Poll timeout of the reactor loop; an empty poll re-arms every lane.
pub const SELECT_TIMEOUT: Duration = Duration::from_millis(20);

/// Deadline allowance per request when no explicit deadline is configured.
const DEADLINE_PER_REQUEST: Duration = Duration::from_secs(1);

/// Parameters of a client run.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    pub prefix: String,
    pub lanes: usize,
    pub requests: usize,
    /// Global deadline; `None` means `lanes * requests` seconds.
    pub deadline: Option<Duration>,
    pub receive_timeout: Duration,
    pub select_timeout: Duration,
}

impl ClientConfig {
    pub fn new(host: impl Into<String>, port: u16, prefix: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            prefix: prefix.into(),
            lanes: 1,
            requests: 1,
            deadline: None,
            receive_timeout: RECEIVE_TIMEOUT,
            select_timeout: SELECT_TIMEOUT,
        }
    }

    pub fn with_lanes(mut self, lanes: usize) -> Self {
        self.lanes = lanes;
        self
    }

    pub fn with_requests(mut self, requests: usize) -> Self {
        self.requests = requests;
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.lanes == 0 {
            return Err(HelloError::InvalidConfig("lanes must be at least 1".into()));
        }
        if self.requests == 0 {
            return Err(HelloError::InvalidConfig(
                "requests per lane must be at least 1".into(),
            ));
        }
        if self.receive_timeout.is_zero() || self.select_timeout.is_zero() {
            return Err(HelloError::InvalidConfig("timeouts must be non-zero".into()));
        }
        Ok(())
    }

    /// Deadline after which unfinished lanes are abandoned.
    pub fn effective_deadline(&self) -> Duration {
        self.deadline.unwrap_or_else(|| {
            let requests = self.lanes.saturating_mul(self.requests).max(1);
            DEADLINE_PER_REQUEST.saturating_mul(u32::try_from(requests).unwrap_or(u32::MAX))
        })
    }

    /// Resolve `host:port` to the first matching socket address.
    pub fn server_addr(&self) -> Result<SocketAddr> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()
            .and_then(|mut addrs| {
                addrs.next().ok_or_else(|| {
                    io::Error::new(io::ErrorKind::NotFound, "no addresses for host")
                })
            })
            .map_err(|source| HelloError::Resolve {
                host: self.host.clone(),
                source,
            })
    }
}

/// Progress of a single lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaneReport {
    pub lane: usize,
    /// Datagrams sent, retries included.
    pub sent: usize,
    /// Replies accepted; equals the next sequence number.
    pub accepted: usize,
    /// Whether every request of the lane was acknowledged.
    pub completed: bool,
}

/// Outcome of a client run, one entry per lane in lane order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientReport {
    pub lanes: Vec<LaneReport>,
}

impl ClientReport {
    pub fn is_complete(&self) -> bool {
        self.lanes.iter().all(|lane| lane.completed)
    }

    /// Lanes that were abandoned before acknowledging every request.
    pub fn abandoned(&self) -> impl Iterator<Item = &LaneReport> {
        self.lanes.iter().filter(|lane| !lane.completed)
    }

    pub fn total_sent(&self) -> usize {
        self.lanes.iter().map(|lane| lane.sent).sum()
    }
}

/// Open an unconnected UDP socket on the wildcard address of `server`'s
/// address family.
fn lane_socket(server: SocketAddr) -> io::Result<Socket> {
    let (domain, local): (Domain, SocketAddr) = match server {
        SocketAddr::V4(_) => (Domain::IPV4, (Ipv4Addr::UNSPECIFIED, 0).into()),
        SocketAddr::V6(_) => (Domain::IPV6, (Ipv6Addr::UNSPECIFIED, 0).into()),
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.bind(&SockAddr::from(local))?;
    Ok(socket)
}
