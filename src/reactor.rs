// src/reactor.rs
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::conn::{ConnState, READ_BUF_SIZE};
use crate::error::Result;
use crate::response;
use crate::syscalls::{
    self, epoll_event, Epoll, ListenSocket, WakeHandle, WakePipe, EPOLLERR, EPOLLHUP, EPOLLIN,
    EPOLLOUT, EPOLLRDHUP,
};
use crate::table::ConnTable;

/// Upper bound on readiness events handled per loop iteration.
const MAX_EVENTS: usize = 64;

/// The wait blocks until something is ready; the wake pipe covers shutdown.
const WAIT_TIMEOUT_MS: i32 = -1;

/// Signals a running reactor to stop and wakes it out of its readiness wait.
/// Safe to invoke from any thread, including a signal handler thread.
#[derive(Clone)]
pub struct StopHandle {
    flag: Arc<AtomicBool>,
    wake: WakeHandle,
}

impl StopHandle {
    pub fn stop(&self) {
        self.flag.store(true, Ordering::Release);
        self.wake.wake();
    }
}

/// Single-threaded event loop: one listening socket, one epoll instance, one
/// connection table, owned exclusively. Descriptors accepted here are never
/// touched by any other reactor.
pub struct Reactor {
    listener: ListenSocket,
    epoll: Epoll,
    wake: WakePipe,
    wake_tx: WakeHandle,
    table: ConnTable,
    shutdown: Arc<AtomicBool>,
}

impl Reactor {
    /// Build a fully wired reactor or nothing at all: every acquired
    /// resource is released (in reverse order, via Drop) if any later step
    /// fails.
    pub fn new(addr: SocketAddr, capacity: usize) -> Result<Self> {
        let listener = ListenSocket::bind(addr)?;
        let epoll = Epoll::new()?;
        let (wake, wake_tx) = syscalls::wake_pipe()?;
        let table = ConnTable::new(capacity)?;

        epoll.add(listener.fd(), EPOLLIN)?;
        epoll.add(wake.fd(), EPOLLIN)?;

        Ok(Self {
            listener,
            epoll,
            wake,
            wake_tx,
            table,
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    /// The bound address; reactors created on port 0 report the port the
    /// kernel picked.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            flag: self.shutdown.clone(),
            wake: self.wake_tx.clone(),
        }
    }

    pub fn stop(&self) {
        self.stop_handle().stop();
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.table.capacity()
    }

    #[inline]
    pub fn active_connections(&self) -> usize {
        self.table.active()
    }

    /// Blocking event loop. Returns once a stop request is observed; the
    /// wake pipe guarantees that happens promptly even with no connection
    /// activity.
    pub fn run(&mut self) {
        let mut events = vec![epoll_event { events: 0, u64: 0 }; MAX_EVENTS];

        while !self.shutdown.load(Ordering::Acquire) {
            let n = match self.epoll.wait(&mut events, WAIT_TIMEOUT_MS) {
                Ok(n) => n,
                Err(e) => {
                    error!(error = %e, "epoll wait failed, stopping reactor");
                    break;
                }
            };

            for i in 0..n {
                let fd = events[i].u64 as i32;
                let mask = events[i].events;

                if fd == self.wake.fd() {
                    self.wake.drain();
                    continue;
                }
                if fd == self.listener.fd() {
                    self.accept_ready();
                    continue;
                }
                // Never read or write a descriptor the kernel already
                // flagged as hung up or failed.
                if mask & (EPOLLERR | EPOLLHUP | EPOLLRDHUP) as u32 != 0 {
                    self.teardown(fd);
                    continue;
                }
                if mask & EPOLLIN as u32 != 0 {
                    self.on_readable(fd);
                    continue;
                }
                if mask & EPOLLOUT as u32 != 0 {
                    self.on_writable(fd);
                }
            }
        }

        info!(active = self.table.active(), "reactor loop exited");
    }

    /// Drain the accept queue. Each accepted descriptor is made nonblocking
    /// by accept4, bounds-checked against the table, registered for
    /// readable+hangup events and only then handed a slot.
    fn accept_ready(&mut self) {
        loop {
            let (fd, peer) = match self.listener.accept() {
                Ok(Some(pair)) => pair,
                Ok(None) => break,
                Err(e) => {
                    error!(error = %e, "accept failed");
                    break;
                }
            };

            if fd as usize >= self.table.capacity() {
                warn!(fd, capacity = self.table.capacity(), "descriptor exceeds connection table, rejecting");
                let _ = syscalls::send_nonblocking(fd, response::REJECT_PAYLOAD);
                syscalls::close_fd(fd);
                continue;
            }

            if let Err(e) = self.epoll.add(fd, EPOLLIN | EPOLLRDHUP) {
                error!(fd, error = %e, "failed to register accepted socket");
                syscalls::close_fd(fd);
                continue;
            }

            if self.table.claim(fd, peer).is_none() {
                // The slot still holds a previous occupant; the table never
                // reuses it until released, so refuse the descriptor.
                error!(fd, "slot for accepted descriptor is not free");
                self.epoll.delete(fd).ok();
                syscalls::close_fd(fd);
                continue;
            }

            debug!(fd, %peer, "connection accepted");
        }
    }

    /// Append newly received bytes at the read cursor and look for the
    /// header terminator in everything accumulated so far.
    fn on_readable(&mut self, fd: i32) {
        let mut close = false;
        {
            let conn = match self.table.get_mut(fd) {
                Some(conn) if !conn.is_free() => conn,
                _ => return,
            };

            if conn.read_pos >= READ_BUF_SIZE {
                // Buffer exhausted without an end of headers: drop the
                // connection without any response.
                warn!(fd, "request exceeded the read buffer before end of headers");
                close = true;
            } else {
                match syscalls::recv_nonblocking(fd, &mut conn.read_buf[conn.read_pos..]) {
                    Ok(Some(0)) => {
                        debug!(fd, "peer closed the connection");
                        close = true;
                    }
                    Ok(Some(n)) => {
                        conn.read_pos += n;
                        conn.touch();

                        if conn.state == ConnState::ReadingRequest
                            && response::headers_complete(&conn.read_buf[..conn.read_pos])
                        {
                            let buf = response::render();
                            conn.write_pos = 0;
                            conn.write_buf = Some(buf);
                            conn.state = ConnState::WritingResponse;
                        }

                        // Interest flips to writable after every successful
                        // read, terminator or not; writable events on a slot
                        // with no pending response retry the read until the
                        // request completes.
                        if let Err(e) = self.epoll.modify(fd, EPOLLOUT | EPOLLRDHUP) {
                            error!(fd, error = %e, "failed to update interest after read");
                            close = true;
                        }
                    }
                    Ok(None) => {
                        // Nothing to read right now.
                    }
                    Err(e) => {
                        error!(fd, error = %e, "recv failed");
                        close = true;
                    }
                }
            }
        }
        if close {
            self.teardown(fd);
        }
    }

    /// Push response bytes from the write cursor. Once the cursor reaches
    /// the total length the connection is torn down: respond once, then
    /// close.
    fn on_writable(&mut self, fd: i32) {
        enum Outcome {
            Nothing,
            RetryRead,
            Close,
        }

        let mut outcome = Outcome::Nothing;
        {
            let conn = match self.table.get_mut(fd) {
                Some(conn) if !conn.is_free() => conn,
                _ => return,
            };

            let sent = match &conn.write_buf {
                None => {
                    // Writable but no response assembled yet: the request is
                    // still incomplete, so use the event to poll the read
                    // side again.
                    outcome = Outcome::RetryRead;
                    None
                }
                Some(buf) => match syscalls::send_nonblocking(fd, &buf[conn.write_pos..]) {
                    Ok(Some(n)) if n > 0 => Some(n),
                    Ok(_) => None,
                    Err(e) => {
                        error!(fd, error = %e, "send failed");
                        outcome = Outcome::Close;
                        None
                    }
                },
            };

            if let Some(n) = sent {
                conn.write_pos += n;
                conn.touch();
                let total = conn.write_buf.as_ref().map_or(0, |b| b.len());
                if conn.write_pos >= total {
                    debug!(fd, bytes = total, "response flushed");
                    outcome = Outcome::Close;
                }
            }
        }

        match outcome {
            Outcome::Nothing => {}
            Outcome::RetryRead => self.on_readable(fd),
            Outcome::Close => self.teardown(fd),
        }
    }

    /// The single teardown path for every exit from a connection's lifetime:
    /// deregister, close, reset the slot. Idempotent for already-free
    /// descriptors.
    fn teardown(&mut self, fd: i32) {
        let occupied = self.table.get(fd).map_or(false, |c| !c.is_free());
        if !occupied {
            return;
        }
        self.epoll.delete(fd).ok();
        syscalls::close_fd(fd);
        self.table.release(fd);
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        // Close every live connection before the epoll/listener/pipe close
        // themselves.
        for fd in self.table.live_fds() {
            self.epoll.delete(fd).ok();
            syscalls::close_fd(fd);
            self.table.release(fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_reactor_is_fully_wired() {
        let reactor = Reactor::new("127.0.0.1:0".parse().unwrap(), 128).unwrap();
        assert_eq!(reactor.capacity(), 128);
        assert_eq!(reactor.active_connections(), 0);
        assert!(reactor.local_addr().unwrap().port() != 0);
    }

    #[test]
    fn stop_is_observed_without_any_io() {
        let mut reactor = Reactor::new("127.0.0.1:0".parse().unwrap(), 128).unwrap();
        let stop = reactor.stop_handle();

        let handle = std::thread::spawn(move || reactor.run());
        std::thread::sleep(std::time::Duration::from_millis(50));
        stop.stop();
        handle.join().unwrap();
    }
}
