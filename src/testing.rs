//! Scripted UDP peers for engine tests.

use std::collections::HashSet;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::protocol;

/// How a [`ScriptedPeer`] answers requests.
#[derive(Debug, Clone, Copy)]
pub(crate) enum PeerBehavior {
    /// Answer every request with the regular greeting.
    Echo,
    /// Answer the first copy of each request with an unrelated text, later
    /// copies correctly.
    MismatchFirst,
    /// Answer every request twice.
    Duplicate,
    /// Ignore the first copy of each request, answer later copies.
    DropFirst,
    /// Never answer.
    Silent,
}

/// A single-threaded UDP responder that records what it receives.
pub(crate) struct ScriptedPeer {
    addr: SocketAddr,
    log: Arc<Mutex<Vec<(String, Instant)>>>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ScriptedPeer {
    pub(crate) fn spawn(behavior: PeerBehavior) -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket
            .set_read_timeout(Some(Duration::from_millis(10)))
            .unwrap();
        let addr = socket.local_addr().unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let stop = Arc::new(AtomicBool::new(false));

        let handle = {
            let log = Arc::clone(&log);
            let stop = Arc::clone(&stop);
            thread::spawn(move || serve(socket, behavior, log, stop))
        };

        ScriptedPeer {
            addr,
            log,
            stop,
            handle: Some(handle),
        }
    }

    pub(crate) fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Request texts in arrival order.
    pub(crate) fn received(&self) -> Vec<String> {
        self.log
            .lock()
            .unwrap()
            .iter()
            .map(|(text, _)| text.clone())
            .collect()
    }

    /// Request texts with their arrival time.
    pub(crate) fn received_at(&self) -> Vec<(String, Instant)> {
        self.log.lock().unwrap().clone()
    }
}

impl Drop for ScriptedPeer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn serve(
    socket: UdpSocket,
    behavior: PeerBehavior,
    log: Arc<Mutex<Vec<(String, Instant)>>>,
    stop: Arc<AtomicBool>,
) {
    let mut buf = vec![0u8; protocol::MAX_DATAGRAM_SIZE];
    let mut seen = HashSet::new();

    while !stop.load(Ordering::Acquire) {
        let (n, peer) = match socket.recv_from(&mut buf) {
            Ok(received) => received,
            Err(_) => continue,
        };
        let request = protocol::decode(&buf[..n]).into_owned();
        log.lock().unwrap().push((request.clone(), Instant::now()));
        let first = seen.insert(request.clone());
        let reply = protocol::reply(&request);

        match behavior {
            PeerBehavior::Echo => {
                let _ = socket.send_to(reply.as_bytes(), peer);
            }
            PeerBehavior::MismatchFirst => {
                let text = if first { "Hello, nobody" } else { reply.as_str() };
                let _ = socket.send_to(text.as_bytes(), peer);
            }
            PeerBehavior::Duplicate => {
                let _ = socket.send_to(reply.as_bytes(), peer);
                let _ = socket.send_to(reply.as_bytes(), peer);
            }
            PeerBehavior::DropFirst => {
                if !first {
                    let _ = socket.send_to(reply.as_bytes(), peer);
                }
            }
            PeerBehavior::Silent => {}
        }
    }
}
