//! hello-udp: retry-until-ack request/response over UDP.
//!
//! Clients send numbered text requests (`<prefix><lane>_<seq>`) and resend
//! until a reply containing the request text arrives; servers answer every
//! datagram with `Hello, <request>`.
//!
//! Two concurrency models speak the same wire protocol:
//! - Blocking: pooled threads over blocking sockets with receive timeouts
//! - Reactor: a single mio event loop over non-blocking sockets
//!
//! Any client works against any server.

pub mod client;
pub mod config;
pub mod error;
pub mod pool;
pub mod protocol;
pub mod server;

#[cfg(test)]
mod testing;

use std::net::SocketAddr;

pub use client::{BlockingClient, ClientConfig, ClientReport, LaneReport, ReactorClient};
pub use error::{HelloError, Result};
pub use server::{BlockingServer, ReactorServer, ServerConfig};

/// A client engine.
pub trait HelloClient {
    /// Drive every lane through its requests. Returns once all lanes
    /// finished or the global deadline abandoned the rest.
    fn run(&self, config: &ClientConfig) -> Result<ClientReport>;
}

/// A server engine running in the background until closed.
pub trait HelloServer: Sized {
    /// Bind and start serving. Returns immediately.
    fn start(config: &ServerConfig) -> Result<Self>;

    /// Address the server socket is bound to.
    fn local_addr(&self) -> SocketAddr;

    /// Stop receiving, drain in-flight replies and release the socket.
    fn close(self);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::{Duration, Instant};

    fn client_config(server: &impl HelloServer, lanes: usize, requests: usize) -> ClientConfig {
        ClientConfig::new("127.0.0.1", server.local_addr().port(), "hello ")
            .with_lanes(lanes)
            .with_requests(requests)
            .with_deadline(Duration::from_secs(20))
    }

    fn exchange<S: HelloServer, C: HelloClient>(client: C, lanes: usize, requests: usize) {
        let server = S::start(&ServerConfig::new(0).with_workers(4)).unwrap();
        let report = client
            .run(&client_config(&server, lanes, requests))
            .unwrap();
        server.close();

        assert!(report.is_complete(), "{report:?}");
        assert_eq!(report.lanes.len(), lanes);
        for lane in &report.lanes {
            assert_eq!(lane.accepted, requests);
            assert!(lane.sent >= requests);
        }
    }

    #[test]
    fn test_blocking_client_blocking_server() {
        exchange::<BlockingServer, _>(BlockingClient::new(), 4, 10);
    }

    #[test]
    fn test_blocking_client_reactor_server() {
        exchange::<ReactorServer, _>(BlockingClient::new(), 4, 10);
    }

    #[test]
    fn test_reactor_client_blocking_server() {
        exchange::<BlockingServer, _>(ReactorClient::new(), 4, 10);
    }

    #[test]
    fn test_reactor_client_reactor_server() {
        exchange::<ReactorServer, _>(ReactorClient::new(), 4, 10);
    }

    #[test]
    fn test_many_lanes_against_single_worker() {
        let server = ReactorServer::start(&ServerConfig::new(0)).unwrap();
        let report = ReactorClient::new()
            .run(&client_config(&server, 16, 5))
            .unwrap();
        server.close();
        assert!(report.is_complete());
    }

    fn server_closed_mid_run<S: HelloServer, C: HelloClient + Send + 'static>(client: C) {
        let server = S::start(&ServerConfig::new(0).with_workers(2)).unwrap();
        let config = client_config(&server, 2, 1_000_000).with_deadline(Duration::from_millis(800));

        let start = Instant::now();
        let run = thread::spawn(move || client.run(&config));
        thread::sleep(Duration::from_millis(100));
        server.close();

        let report = run.join().unwrap().unwrap();
        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(report.abandoned().count(), 2);
        for lane in &report.lanes {
            assert!(lane.accepted > 0, "{lane:?}");
            assert!(lane.accepted < 1_000_000);
        }
    }

    #[test]
    fn test_blocking_client_survives_server_close() {
        server_closed_mid_run::<BlockingServer, _>(BlockingClient::new());
    }

    #[test]
    fn test_reactor_client_survives_server_close() {
        server_closed_mid_run::<ReactorServer, _>(ReactorClient::new());
    }
}
