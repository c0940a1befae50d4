//! Reactor server engine.
//!
//! Readiness-based model: a single event-loop thread owns the non-blocking
//! socket and is its only writer. Read readiness drains every queued
//! datagram into the worker pool. Workers push `(peer, reply)` onto a
//! bounded lock-free queue and wake the loop through a mio `Waker`; the loop
//! then adds write interest and flushes the queue on write readiness.
//!
//! Write interest is only present while replies are pending, read interest
//! is always present.

use bytes::Bytes;
use crossbeam_queue::ArrayQueue;
use mio::net::UdpSocket;
use mio::{Events, Interest, Poll, Token, Waker};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

use super::{bind, ServerConfig, SHUTDOWN_TIMEOUT};
use crate::error::{HelloError, Result};
use crate::pool::WorkerPool;
use crate::protocol;
use crate::HelloServer;

const SOCKET_TOKEN: Token = Token(0);
const WAKER_TOKEN: Token = Token(1);

/// Pause between attempts of a worker to enqueue into a full reply queue.
const QUEUE_FULL_BACKOFF: Duration = Duration::from_millis(1);

/// A computed reply waiting for the socket to become writable.
#[derive(Debug)]
struct PendingReply {
    peer: SocketAddr,
    payload: Bytes,
}

/// State shared between the event loop and the reply workers.
struct Shared {
    pending: ArrayQueue<PendingReply>,
    waker: Waker,
    closed: AtomicBool,
}

impl Shared {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Hand a reply over to the event loop, waiting while the queue is full.
    fn enqueue(&self, mut reply: PendingReply) {
        loop {
            match self.pending.push(reply) {
                Ok(()) => break,
                Err(rejected) => {
                    if self.is_closed() {
                        debug!(peer = %rejected.peer, "Dropping reply after close");
                        return;
                    }
                    reply = rejected;
                    let _ = self.waker.wake();
                    thread::sleep(QUEUE_FULL_BACKOFF);
                }
            }
        }
        if let Err(e) = self.waker.wake() {
            warn!(error = %e, "Cannot wake event loop");
        }
    }
}

/// Single event loop plus reply worker pool over one non-blocking socket.
pub struct ReactorServer {
    local_addr: SocketAddr,
    shared: Arc<Shared>,
    event_loop: Option<JoinHandle<()>>,
    pool: Arc<WorkerPool>,
}

impl HelloServer for ReactorServer {
    fn start(config: &ServerConfig) -> Result<Self> {
        config.validate()?;

        let poll = Poll::new().map_err(|e| HelloError::poll("cannot open selector", e))?;
        let bound = bind(config.port)?;
        bound
            .socket
            .set_nonblocking(true)
            .map_err(|e| HelloError::socket("cannot configure blocking of channel", e))?;

        let mut socket = UdpSocket::from_std(bound.socket.into());
        poll.registry()
            .register(&mut socket, SOCKET_TOKEN, Interest::READABLE)
            .map_err(|e| HelloError::poll("cannot register socket in the selector", e))?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)
            .map_err(|e| HelloError::poll("cannot create waker", e))?;

        let shared = Arc::new(Shared {
            pending: ArrayQueue::new(config.queue_capacity),
            waker,
            closed: AtomicBool::new(false),
        });
        let pool = Arc::new(WorkerPool::new("hello-reply", config.workers)?);

        let event_loop = EventLoop {
            poll,
            socket,
            buf: vec![0u8; bound.datagram_size],
            deferred: None,
            shared: Arc::clone(&shared),
            pool: Arc::clone(&pool),
        };
        let handle = thread::Builder::new()
            .name("hello-reactor".to_string())
            .spawn(move || event_loop.run())
            .map_err(HelloError::Spawn)?;

        info!(
            addr = %bound.local_addr,
            workers = config.workers,
            queue_capacity = config.queue_capacity,
            "Reactor server started"
        );

        Ok(ReactorServer {
            local_addr: bound.local_addr,
            shared,
            event_loop: Some(handle),
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

impl ReactorServer {
    fn shutdown(&mut self) {
        let Some(handle) = self.event_loop.take() else {
            return;
        };

        self.shared.closed.store(true, Ordering::Release);
        if let Err(e) = self.shared.waker.wake() {
            error!(error = %e, "Cannot wake event loop for shutdown");
        }
        // The loop drops the socket and the poll instance on exit.
        let _ = handle.join();

        let outcome = self.pool.shutdown_and_await(SHUTDOWN_TIMEOUT);
        if outcome.was_forced() {
            warn!(outcome = ?outcome, "Reply workers forced to stop");
        }
        info!(addr = %self.local_addr, "Reactor server stopped");
    }
}

impl Drop for ReactorServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct EventLoop {
    poll: Poll,
    socket: UdpSocket,
    buf: Vec<u8>,
    /// Reply popped from the queue whose send would have blocked.
    deferred: Option<PendingReply>,
    shared: Arc<Shared>,
    pool: Arc<WorkerPool>,
}

impl EventLoop {
    fn run(mut self) {
        let mut events = Events::with_capacity(64);

        while !self.shared.is_closed() {
            if let Err(e) = self.poll.poll(&mut events, None) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!(error = %e, "Cannot select keys");
                break;
            }

            for event in events.iter() {
                match event.token() {
                    WAKER_TOKEN => {
                        if self.has_pending() {
                            self.set_interest(Interest::READABLE | Interest::WRITABLE);
                        }
                    }
                    SOCKET_TOKEN => {
                        if event.is_readable() {
                            self.receive_all();
                        }
                        if event.is_writable() {
                            self.send_pending();
                        }
                    }
                    _ => {}
                }
            }
        }

        debug!(pending = self.shared.pending.len(), "Event loop exited");
    }

    fn has_pending(&self) -> bool {
        self.deferred.is_some() || !self.shared.pending.is_empty()
    }

    fn set_interest(&mut self, interest: Interest) {
        if let Err(e) = self
            .poll
            .registry()
            .reregister(&mut self.socket, SOCKET_TOKEN, interest)
        {
            warn!(error = %e, "Cannot change socket interest");
        }
    }

    /// Drain every queued datagram; edge-triggered readiness will not fire
    /// again for datagrams left behind.
    fn receive_all(&mut self) {
        loop {
            match self.socket.recv_from(&mut self.buf) {
                Ok((n, peer)) => {
                    let request = Bytes::copy_from_slice(&self.buf[..n]);
                    let shared = Arc::clone(&self.shared);
                    let submitted = self.pool.submit(move || {
                        let reply = protocol::reply(&protocol::decode(&request));
                        shared.enqueue(PendingReply {
                            peer,
                            payload: protocol::encode(&reply),
                        });
                    });
                    if !submitted {
                        debug!(peer = %peer, "Dropping request received during shutdown");
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!(error = %e, "Cannot receive data");
                    break;
                }
            }
        }
    }

    fn send_pending(&mut self) {
        while let Some(reply) = self.deferred.take().or_else(|| self.shared.pending.pop()) {
            match self.socket.send_to(&reply.payload, reply.peer) {
                Ok(_) => trace!(peer = %reply.peer, "Sent response"),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    // Keep write interest; readiness fires once there is room.
                    self.deferred = Some(reply);
                    return;
                }
                Err(e) => warn!(peer = %reply.peer, error = %e, "Cannot send response"),
            }
        }
        self.set_interest(Interest::READABLE);
    }
}
