//! Blocking server engine.
//!
//! A dedicated receive thread blocks on the socket and submits every
//! datagram to the worker pool. Workers compute the reply and send it back
//! on the same socket, so replies leave in completion order, not arrival
//! order.

use bytes::Bytes;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

use super::{bind, ServerConfig, SHUTDOWN_TIMEOUT};
use crate::error::{HelloError, Result};
use crate::pool::WorkerPool;
use crate::protocol;
use crate::HelloServer;

/// Receive timeout of the server socket; bounds how long `close` waits for
/// the receive loop to notice.
const RECEIVE_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Receive thread plus reply worker pool over one blocking socket.
pub struct BlockingServer {
    local_addr: SocketAddr,
    running: Arc<AtomicBool>,
    receiver: Option<JoinHandle<()>>,
    pool: Arc<WorkerPool>,
}

impl HelloServer for BlockingServer {
    fn start(config: &ServerConfig) -> Result<Self> {
        config.validate()?;
        let bound = bind(config.port)?;
        bound
            .socket
            .set_read_timeout(Some(RECEIVE_POLL_INTERVAL))
            .map_err(|e| HelloError::socket("cannot set receive timeout", e))?;

        let socket: Arc<UdpSocket> = Arc::new(bound.socket.into());
        let pool = Arc::new(WorkerPool::new("hello-reply", config.workers)?);
        let running = Arc::new(AtomicBool::new(true));

        let receiver = {
            let socket = Arc::clone(&socket);
            let pool = Arc::clone(&pool);
            let running = Arc::clone(&running);
            let datagram_size = bound.datagram_size;
            thread::Builder::new()
                .name("hello-receiver".to_string())
                .spawn(move || receive_loop(socket, pool, running, datagram_size))
                .map_err(HelloError::Spawn)?
        };

        info!(
            addr = %bound.local_addr,
            workers = config.workers,
            datagram_size = bound.datagram_size,
            "Blocking server started"
        );

        Ok(BlockingServer {
            local_addr: bound.local_addr,
            running,
            receiver: Some(receiver),
            pool,
        })
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn close(mut self) {
        self.shutdown();
    }
}

impl BlockingServer {
    fn shutdown(&mut self) {
        let Some(receiver) = self.receiver.take() else {
            return;
        };

        self.running.store(false, Ordering::Release);
        let _ = receiver.join();

        let outcome = self.pool.shutdown_and_await(SHUTDOWN_TIMEOUT);
        if outcome.was_forced() {
            warn!(outcome = ?outcome, "Reply workers forced to stop");
        }
        info!(addr = %self.local_addr, "Blocking server stopped");
    }
}

impl Drop for BlockingServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn receive_loop(
    socket: Arc<UdpSocket>,
    pool: Arc<WorkerPool>,
    running: Arc<AtomicBool>,
    datagram_size: usize,
) {
    let mut buf = vec![0u8; datagram_size];

    while running.load(Ordering::Acquire) {
        match socket.recv_from(&mut buf) {
            Ok((n, peer)) => {
                let request = Bytes::copy_from_slice(&buf[..n]);
                let socket = Arc::clone(&socket);
                if !pool.submit(move || respond(&socket, &request, peer)) {
                    debug!(peer = %peer, "Dropping request received during shutdown");
                }
            }
            Err(ref e)
                if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {}
            Err(e) => {
                if running.load(Ordering::Acquire) {
                    warn!(error = %e, "Cannot receive packet");
                }
            }
        }
    }

    debug!("Receive loop exited");
}

fn respond(socket: &UdpSocket, request: &[u8], peer: SocketAddr) {
    let reply = protocol::reply(&protocol::decode(request));
    match socket.send_to(reply.as_bytes(), peer) {
        Ok(_) => trace!(peer = %peer, reply = %reply, "Sent response"),
        Err(e) => warn!(peer = %peer, error = %e, "Cannot send response"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn client_socket() -> UdpSocket {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        socket
    }

    fn loopback(server: &BlockingServer) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], server.local_addr().port()))
    }

    #[test]
    fn test_replies_with_greeting() {
        let server = BlockingServer::start(&ServerConfig::new(0)).unwrap();
        let socket = client_socket();

        socket.send_to(b"p0_0", loopback(&server)).unwrap();
        let mut buf = [0u8; 128];
        let (n, _) = socket.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"Hello, p0_0");

        server.close();
    }

    #[test]
    fn test_every_datagram_gets_one_reply() {
        let server = BlockingServer::start(&ServerConfig::new(0).with_workers(4)).unwrap();
        let socket = client_socket();
        let target = loopback(&server);

        for i in 0..50 {
            socket.send_to(format!("req{i}").as_bytes(), target).unwrap();
        }

        let mut replies = Vec::new();
        let mut buf = [0u8; 128];
        for _ in 0..50 {
            let (n, _) = socket.recv_from(&mut buf).unwrap();
            replies.push(String::from_utf8(buf[..n].to_vec()).unwrap());
        }
        replies.sort();
        let mut expected: Vec<String> = (0..50).map(|i| format!("Hello, req{i}")).collect();
        expected.sort();
        assert_eq!(replies, expected);

        server.close();
    }

    #[test]
    fn test_close_is_prompt() {
        let server = BlockingServer::start(&ServerConfig::new(0).with_workers(2)).unwrap();
        let start = Instant::now();
        server.close();
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_port_is_released_after_close() {
        let server = BlockingServer::start(&ServerConfig::new(0)).unwrap();
        let port = server.local_addr().port();
        server.close();

        let again = BlockingServer::start(&ServerConfig::new(port)).unwrap();
        assert_eq!(again.local_addr().port(), port);
    }

    #[test]
    fn test_port_in_use_does_not_start() {
        let server = BlockingServer::start(&ServerConfig::new(0)).unwrap();
        let port = server.local_addr().port();
        assert!(BlockingServer::start(&ServerConfig::new(port)).is_err());
        server.close();
    }
}
