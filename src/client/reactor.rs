//! Reactor client engine.
//!
//! Readiness-based model: one mio `Poll` multiplexes a connected,
//! non-blocking UDP socket per lane. Each lane's interest toggles between
//! writable (send the current request) and readable (await its reply).
//!
//! ## Retry trigger
//!
//! A lane never resends because of a mismatched reply; it stays readable.
//! Resends only happen when a whole poll cycle reports no readiness at all,
//! at which point every remaining lane is re-armed for writing. This is a
//! deliberate difference from the blocking client, which resends on every
//! timeout or mismatch.

use mio::net::UdpSocket;
use mio::{Events, Interest, Poll, Registry, Token};
use slab::Slab;
use std::io;
use std::net::SocketAddr;
use std::time::Instant;
use tracing::{debug, info, trace, warn};

use super::{lane_socket, ClientConfig, ClientReport, LaneReport};
use crate::error::{HelloError, Result};
use crate::pool::Cancellation;
use crate::protocol;
use crate::HelloClient;

/// Single-threaded event-loop client.
#[derive(Debug, Default)]
pub struct ReactorClient {
    cancellation: Cancellation,
}

impl ReactorClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token that ends the event loop of a running `run` call.
    pub fn cancellation(&self) -> Cancellation {
        self.cancellation.clone()
    }
}

impl HelloClient for ReactorClient {
    fn run(&self, config: &ClientConfig) -> Result<ClientReport> {
        config.validate()?;
        let server = config.server_addr()?;

        info!(
            server = %server,
            lanes = config.lanes,
            requests = config.requests,
            "Starting reactor client"
        );

        let mut event_loop = EventLoop::open(config, server)?;
        event_loop.run(config, &self.cancellation)?;
        Ok(event_loop.into_report())
    }
}

/// Per-lane state attached to a registered socket.
struct Lane {
    index: usize,
    socket: UdpSocket,
    /// Sequence number of the in-flight request.
    seq: usize,
    /// Text of the in-flight request; sent as-is and expected in the reply.
    pending: String,
    last_sent_at: Option<Instant>,
    sent: usize,
    buf: Vec<u8>,
}

/// What a readable event did to a lane.
enum Received {
    Advanced,
    Waiting,
}

impl Lane {
    fn send(&mut self) -> io::Result<()> {
        self.socket.send(self.pending.as_bytes())?;
        self.sent += 1;
        self.last_sent_at = Some(Instant::now());
        trace!(lane = self.index, request = %self.pending, "Sent request");
        Ok(())
    }

    fn receive(&mut self, prefix: &str) -> io::Result<Received> {
        // Edge-triggered: drain until a match or until the socket is empty.
        loop {
            let n = match self.socket.recv(&mut self.buf) {
                Ok(n) => n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(Received::Waiting)
                }
                Err(e) => return Err(e),
            };

            let reply = protocol::decode(&self.buf[..n]);
            if protocol::is_reply_to(&reply, &self.pending) {
                trace!(
                    lane = self.index,
                    seq = self.seq,
                    rtt_us = self.last_sent_at.map(|t| t.elapsed().as_micros() as u64),
                    "Accepted reply"
                );
                self.seq += 1;
                self.pending = protocol::request(prefix, self.index, self.seq);
                return Ok(Received::Advanced);
            }
            trace!(lane = self.index, seq = self.seq, reply = %reply, "Ignoring reply");
        }
    }

    fn report(&self, completed: bool) -> LaneReport {
        LaneReport {
            lane: self.index,
            sent: self.sent,
            accepted: self.seq,
            completed,
        }
    }
}

struct EventLoop {
    poll: Poll,
    lanes: Slab<Lane>,
    reports: Vec<LaneReport>,
    prefix: String,
    requests: usize,
    server: SocketAddr,
}

impl EventLoop {
    fn open(config: &ClientConfig, server: SocketAddr) -> Result<Self> {
        let poll = Poll::new()
            .map_err(|e| HelloError::poll(format!("{server}: cannot open selector"), e))?;

        let mut event_loop = EventLoop {
            poll,
            lanes: Slab::with_capacity(config.lanes),
            reports: Vec::with_capacity(config.lanes),
            prefix: config.prefix.clone(),
            requests: config.requests,
            server,
        };

        // Sockets opened so far are dropped with `event_loop` on error.
        for index in 0..config.lanes {
            event_loop.open_lane(index)?;
            event_loop.reports.push(LaneReport {
                lane: index,
                sent: 0,
                accepted: 0,
                completed: false,
            });
        }

        Ok(event_loop)
    }

    fn open_lane(&mut self, index: usize) -> Result<()> {
        let server = self.server;
        let wrap = |what: &str| format!("{server} (lane {index}): {what}");

        let socket = lane_socket(server)
            .map_err(|e| HelloError::socket(wrap("cannot open datagram channel"), e))?;
        socket
            .set_nonblocking(true)
            .map_err(|e| HelloError::socket(wrap("cannot configure blocking"), e))?;
        socket
            .connect(&server.into())
            .map_err(|e| HelloError::socket(wrap("cannot connect"), e))?;
        let size = socket
            .recv_buffer_size()
            .map_err(|e| HelloError::socket(wrap("cannot get receive buffer size"), e))?;

        let entry = self.lanes.vacant_entry();
        let token = Token(entry.key());
        let mut socket = UdpSocket::from_std(socket.into());
        self.poll
            .registry()
            .register(&mut socket, token, Interest::WRITABLE)
            .map_err(|e| HelloError::poll(wrap("cannot register channel"), e))?;

        entry.insert(Lane {
            index,
            socket,
            seq: 0,
            pending: protocol::request(&self.prefix, index, 0),
            last_sent_at: None,
            sent: 0,
            buf: vec![0u8; protocol::datagram_capacity(size)],
        });
        Ok(())
    }

    fn run(&mut self, config: &ClientConfig, cancellation: &Cancellation) -> Result<()> {
        let mut events = Events::with_capacity(config.lanes.max(16));
        let deadline = Instant::now() + config.effective_deadline();

        while !self.lanes.is_empty() {
            if cancellation.is_cancelled() {
                debug!(remaining = self.lanes.len(), "Event loop cancelled");
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                warn!(
                    remaining = self.lanes.len(),
                    "Deadline elapsed, unfinished lanes abandoned"
                );
                break;
            }

            let timeout = config.select_timeout.min(deadline - now);
            if let Err(e) = self.poll.poll(&mut events, Some(timeout)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(HelloError::poll(
                    format!("{}: cannot do selection keys", self.server),
                    e,
                ));
            }

            if events.is_empty() {
                self.rearm_all();
                continue;
            }

            for event in events.iter() {
                self.process(event);
            }
        }

        Ok(())
    }

    /// Nothing became ready: assume requests or replies were lost and make
    /// every lane send again.
    fn rearm_all(&mut self) {
        let registry = self.poll.registry();
        for (key, lane) in self.lanes.iter_mut() {
            if let Err(e) = registry.reregister(&mut lane.socket, Token(key), Interest::WRITABLE) {
                warn!(lane = lane.index, error = %e, "Cannot re-arm lane");
            }
        }
    }

    fn process(&mut self, event: &mio::event::Event) {
        let key = event.token().0;
        let registry = self.poll.registry();
        let Some(lane) = self.lanes.get_mut(key) else {
            return;
        };

        if event.is_readable() {
            match lane.receive(&self.prefix) {
                Ok(Received::Advanced) if lane.seq >= self.requests => {
                    self.retire(key);
                }
                Ok(Received::Advanced) => {
                    set_interest(registry, lane, key, Interest::WRITABLE);
                }
                Ok(Received::Waiting) => {}
                Err(e) => debug!(lane = lane.index, error = %e, "Cannot receive response"),
            }
        } else if event.is_writable() {
            match lane.send() {
                Ok(()) => set_interest(registry, lane, key, Interest::READABLE),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    // Wait for the next empty poll cycle to retry.
                    debug!(lane = lane.index, error = %e, "Cannot send request");
                    set_interest(registry, lane, key, Interest::READABLE);
                }
            }
        }
    }

    fn retire(&mut self, key: usize) {
        let mut lane = self.lanes.remove(key);
        let _ = self.poll.registry().deregister(&mut lane.socket);
        self.reports[lane.index] = lane.report(true);
        debug!(lane = lane.index, sent = lane.sent, "Lane finished");
    }

    fn into_report(mut self) -> ClientReport {
        for mut lane in self.lanes.drain() {
            let _ = self.poll.registry().deregister(&mut lane.socket);
            self.reports[lane.index] = lane.report(false);
        }
        ClientReport {
            lanes: self.reports,
        }
    }
}

fn set_interest(registry: &Registry, lane: &mut Lane, key: usize, interest: Interest) {
    if let Err(e) = registry.reregister(&mut lane.socket, Token(key), interest) {
        warn!(lane = lane.index, error = %e, "Cannot change interest");
    }
}
