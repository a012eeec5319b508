// src/server.rs
use std::thread;

use tracing::{error, info, warn};

use crate::error::{Error, Result};
use crate::reactor::{Reactor, StopHandle};
use crate::syscalls;

/// Ceiling on connection slots per reactor; also the default when the
/// descriptor limit is higher than anyone needs here.
const DEFAULT_MAX_CONNECTIONS: usize = 1024;

/// Descriptors reserved for the process itself (listeners, epoll instances,
/// wake pipes, stdio) when asking for a higher RLIMIT_NOFILE.
const FD_HEADROOM: u64 = 100;

/// One reactor per core, every one bound to the same port through
/// SO_REUSEPORT so the kernel spreads incoming connections across them.
/// There is no shared mutable state between workers beyond the stop flags.
pub struct Server {
    host_port: String,
    workers: usize,
    max_connections: usize,
}

impl Server {
    pub fn bind(host_port: &str) -> Self {
        Self {
            host_port: host_port.to_string(),
            workers: num_cpus::get().max(1),
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Per-reactor connection ceiling. The effective table size is also
    /// capped by the process descriptor limit.
    pub fn max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections.max(1);
        self
    }

    /// Create every reactor, spawn one pinned thread per reactor, and block
    /// until all of them have shut down. Creation is all-or-nothing: if any
    /// reactor fails to come up, the ones already built are torn down and
    /// the error is returned before a single thread starts.
    pub fn serve(self) -> Result<()> {
        let addr: std::net::SocketAddr = self
            .host_port
            .parse()
            .map_err(|_| Error::InvalidAddress(self.host_port.clone()))?;

        // Size every table from the descriptor ceiling actually in force.
        let want = (self.workers as u64) * (self.max_connections as u64) + FD_HEADROOM;
        let limit = syscalls::raise_nofile_limit(want);
        let capacity = self.max_connections.min(limit as usize);

        let mut reactors = Vec::with_capacity(self.workers);
        for _ in 0..self.workers {
            reactors.push(Reactor::new(addr, capacity)?);
        }

        let stops: Vec<StopHandle> = reactors.iter().map(|r| r.stop_handle()).collect();

        let signal_stops = stops.clone();
        if let Err(e) = ctrlc::set_handler(move || {
            info!("received interrupt, shutting workers down");
            for stop in &signal_stops {
                stop.stop();
            }
        }) {
            // A second server in the same process cannot install another
            // handler; it can still be stopped through its stop handles.
            warn!(error = %e, "could not install interrupt handler");
        }

        info!(
            addr = %self.host_port,
            workers = self.workers,
            max_connections = capacity,
            "starting workers"
        );

        let core_ids = core_affinity::get_core_ids().unwrap_or_default();
        let mut handles = Vec::with_capacity(self.workers);

        for (i, mut reactor) in reactors.into_iter().enumerate() {
            let core_id = if core_ids.is_empty() {
                None
            } else {
                core_ids.get(i % core_ids.len()).copied()
            };

            let spawned = thread::Builder::new()
                .name(format!("arclight-worker-{}", i))
                .spawn(move || {
                    match core_id {
                        Some(id) => {
                            // Pinning failure costs locality, not correctness.
                            if core_affinity::set_for_current(id) {
                                info!(worker = i, cpu = id.id, "worker pinned");
                            } else {
                                warn!(worker = i, cpu = id.id, "failed to pin worker");
                            }
                        }
                        None => info!(worker = i, "worker started without pinning"),
                    }
                    reactor.run();
                });

            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    error!(worker = i, error = %e, "failed to spawn worker thread");
                    for stop in &stops {
                        stop.stop();
                    }
                    for handle in handles {
                        let _ = handle.join();
                    }
                    return Err(Error::WorkerSpawn(e.to_string()));
                }
            }
        }

        for (i, handle) in handles.into_iter().enumerate() {
            if handle.join().is_err() {
                error!(worker = i, "worker thread panicked");
            }
        }

        info!("all workers finished");
        Ok(())
    }
}
