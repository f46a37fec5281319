//! UDP ingestion workers
//!
//! A pool of threads shares one bound socket. Each datagram is a group of
//! protocol lines; a bad line is logged and dropped without affecting the
//! rest of the group or other workers. Workers are stopped by dropping the
//! stop channel and joined.

use crate::protocol::ingest;
use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError};
use ridgeline_core::storage::Database;
use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};
use std::sync::{Arc, Barrier};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Largest datagram payload
const MAX_DATAGRAM: usize = 65_507;

/// How often an idle worker checks for shutdown
const POLL_INTERVAL: Duration = Duration::from_millis(100);

pub struct UdpServer {
    addr: SocketAddr,
    stop: Option<Sender<()>>,
    workers: Vec<JoinHandle<()>>,
}

impl UdpServer {
    /// Bind `addr` and start `workers` threads. Returns once every worker
    /// is running.
    pub fn start(addr: SocketAddr, workers: usize, db: Arc<Database>) -> std::io::Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_read_timeout(Some(POLL_INTERVAL))?;
        let addr = socket.local_addr()?;

        let workers = workers.max(1);
        let (stop_tx, stop_rx) = bounded::<()>(0);
        let barrier = Arc::new(Barrier::new(workers + 1));

        let mut handles = Vec::with_capacity(workers);
        for id in 0..workers {
            let socket = socket.try_clone()?;
            let db = db.clone();
            let stop = stop_rx.clone();
            let barrier = barrier.clone();
            let handle = thread::Builder::new()
                .name(format!("ridgeline-udp-{}", id))
                .spawn(move || {
                    barrier.wait();
                    worker_loop(id, socket, db, stop);
                })?;
            handles.push(handle);
        }
        barrier.wait();

        info!("UDP listener on {} with {} workers", addr, workers);
        Ok(Self {
            addr,
            stop: Some(stop_tx),
            workers: handles,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop all workers and wait for them
    pub fn stop(&mut self) {
        if self.stop.take().is_none() {
            return;
        }
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                error!("UDP worker panicked");
            }
        }
        info!("UDP listener stopped");
    }
}

impl Drop for UdpServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(id: usize, socket: UdpSocket, db: Arc<Database>, stop: Receiver<()>) {
    let mut dispatcher = db.create_session();
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        match stop.try_recv() {
            Err(TryRecvError::Empty) => {}
            _ => break,
        }
        let (len, peer) = match socket.recv_from(&mut buf) {
            Ok(received) => received,
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => continue,
            Err(e) => {
                warn!(worker = id, "UDP receive failed: {}", e);
                continue;
            }
        };

        let outcome = ingest(&mut dispatcher, &buf[..len]);
        if !outcome.is_ok() {
            warn!(
                worker = id,
                %peer,
                "Dropped {} of {} lines: {}",
                outcome.errors.len(),
                outcome.errors.len() as u64 + outcome.written,
                outcome.errors.join("; ")
            );
            if outcome.backpressure {
                db.request_checkpoint();
            }
        }
    }
    debug!(worker = id, "UDP worker stopped");
}
