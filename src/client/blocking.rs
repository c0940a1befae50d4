//! Blocking client engine.
//!
//! Every lane runs on its own pool thread with its own UDP socket. A lane
//! sends the current request, waits up to the receive timeout for an answer
//! and resends the same request on timeout, error or mismatch. The sequence
//! number only advances on a matching reply.

use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

use super::{lane_socket, ClientConfig, ClientReport, LaneReport};
use crate::error::{HelloError, Result};
use crate::pool::{Cancellation, WorkerPool};
use crate::protocol;
use crate::HelloClient;

/// Thread-per-lane client over blocking sockets.
#[derive(Debug, Default)]
pub struct BlockingClient {
    cancellation: Cancellation,
}

impl BlockingClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token that stops every lane of a running `run` call.
    pub fn cancellation(&self) -> Cancellation {
        self.cancellation.clone()
    }
}

impl HelloClient for BlockingClient {
    fn run(&self, config: &ClientConfig) -> Result<ClientReport> {
        config.validate()?;
        let server = config.server_addr()?;
        let deadline = config.effective_deadline();

        info!(
            server = %server,
            lanes = config.lanes,
            requests = config.requests,
            deadline_ms = deadline.as_millis() as u64,
            "Starting blocking client"
        );

        let progress: Vec<Arc<LaneProgress>> = (0..config.lanes)
            .map(|_| Arc::new(LaneProgress::default()))
            .collect();

        let pool = WorkerPool::new("hello-lane", config.lanes)?;
        let stop = StopSignal {
            pool: pool.cancellation(),
            client: self.cancellation.clone(),
        };

        for (lane, progress) in progress.iter().enumerate() {
            let progress = Arc::clone(progress);
            let stop = stop.clone();
            let prefix = config.prefix.clone();
            let requests = config.requests;
            let receive_timeout = config.receive_timeout;

            pool.submit(move || match Lane::open(lane, server, receive_timeout) {
                Ok(mut lane) => lane.run(&prefix, requests, &progress, &stop),
                Err(e) => warn!(lane, error = %e, "Cannot make requests"),
            });
        }

        let outcome = pool.shutdown_and_await(deadline);
        let report = ClientReport {
            lanes: progress
                .iter()
                .enumerate()
                .map(|(lane, progress)| progress.report(lane))
                .collect(),
        };

        if outcome.was_forced() {
            warn!(
                abandoned = report.abandoned().count(),
                "Deadline elapsed, unfinished lanes abandoned"
            );
        } else {
            debug!(sent = report.total_sent(), "All lanes finished");
        }
        Ok(report)
    }
}

/// Either a forced pool shutdown or the caller's cancellation stops a lane.
#[derive(Clone)]
struct StopSignal {
    pool: Cancellation,
    client: Cancellation,
}

impl StopSignal {
    fn is_stopped(&self) -> bool {
        self.pool.is_cancelled() || self.client.is_cancelled()
    }
}

/// Counters a lane publishes while it runs, readable after abandonment.
#[derive(Debug, Default)]
struct LaneProgress {
    sent: AtomicUsize,
    accepted: AtomicUsize,
    completed: AtomicBool,
}

impl LaneProgress {
    fn report(&self, lane: usize) -> LaneReport {
        LaneReport {
            lane,
            sent: self.sent.load(Ordering::Acquire),
            accepted: self.accepted.load(Ordering::Acquire),
            completed: self.completed.load(Ordering::Acquire),
        }
    }
}

/// Outcome of one send/receive attempt.
#[derive(Debug, PartialEq, Eq)]
enum Attempt {
    Accepted,
    Mismatched,
    TimedOut,
    Failed,
}

struct Lane {
    index: usize,
    socket: UdpSocket,
    server: SocketAddr,
    buf: Vec<u8>,
}

impl Lane {
    fn open(index: usize, server: SocketAddr, receive_timeout: Duration) -> Result<Self> {
        let wrap = |what: &str| format!("{server} (lane {index}): {what}");

        let socket = lane_socket(server)
            .map_err(|e| HelloError::socket(wrap("cannot open socket"), e))?;
        socket
            .set_read_timeout(Some(receive_timeout))
            .map_err(|e| HelloError::socket(wrap("cannot set receive timeout"), e))?;
        let size = socket
            .send_buffer_size()
            .map_err(|e| HelloError::socket(wrap("cannot get send buffer size"), e))?;

        Ok(Lane {
            index,
            socket: socket.into(),
            server,
            buf: vec![0u8; protocol::datagram_capacity(size)],
        })
    }

    fn run(&mut self, prefix: &str, requests: usize, progress: &LaneProgress, stop: &StopSignal) {
        let mut seq = 0;
        while seq < requests {
            if stop.is_stopped() {
                debug!(lane = self.index, seq, "Lane abandoned");
                return;
            }

            let request = protocol::request(prefix, self.index, seq);
            match self.attempt(&request, progress) {
                Attempt::Accepted => {
                    seq += 1;
                    progress.accepted.store(seq, Ordering::Release);
                }
                other => trace!(lane = self.index, seq, attempt = ?other, "Retrying request"),
            }
        }

        progress.completed.store(true, Ordering::Release);
        debug!(lane = self.index, requests, "Lane finished");
    }

    fn attempt(&mut self, request: &str, progress: &LaneProgress) -> Attempt {
        if let Err(e) = self.socket.send_to(request.as_bytes(), self.server) {
            warn!(lane = self.index, error = %e, "Cannot send request");
            return Attempt::Failed;
        }
        progress.sent.fetch_add(1, Ordering::AcqRel);
        trace!(lane = self.index, request, "Sent request");

        match self.socket.recv_from(&mut self.buf) {
            Ok((n, _)) => {
                let reply = protocol::decode(&self.buf[..n]);
                if protocol::is_reply_to(&reply, request) {
                    Attempt::Accepted
                } else {
                    Attempt::Mismatched
                }
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                Attempt::TimedOut
            }
            Err(e) => {
                debug!(lane = self.index, error = %e, "Cannot receive response");
                Attempt::Failed
            }
        }
    }
}
