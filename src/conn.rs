// src/conn.rs
use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Fixed capacity of the per-connection read buffer. A request whose headers
/// do not fit here is dropped without a response.
pub const READ_BUF_SIZE: usize = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum ConnState {
    #[default]
    Closed = 0,
    ReadingRequest = 1,
    /// Reserved for handler dispatch between read and write; nothing enters
    /// this state yet.
    Processing = 2,
    WritingResponse = 3,
    /// Reserved for deferred teardown; nothing enters this state yet.
    Closing = 4,
}

/// One connection slot: buffers, cursors and lifecycle state for a single
/// socket. Slots live in a fixed table and are recycled in place, never
/// moved or shared across threads.
pub struct Conn {
    pub fd: i32,
    pub state: ConnState,
    /// Bumped every time the slot is handed to a new descriptor, so a reused
    /// fd value is observably a different connection.
    pub generation: u32,
    pub peer: Option<SocketAddr>,
    pub read_buf: [u8; READ_BUF_SIZE],
    /// Bytes of `read_buf` that hold received data.
    pub read_pos: usize,
    /// Allocated once per response, sized to the full response length.
    /// Invariant: `Some` only while `state == WritingResponse`.
    pub write_buf: Option<Vec<u8>>,
    /// Bytes of the response already handed to the kernel.
    pub write_pos: usize,
    /// Unix seconds of the last successful read or write.
    pub last_activity: u64,
}

impl Conn {
    pub fn empty() -> Self {
        Self {
            fd: -1,
            state: ConnState::Closed,
            generation: 0,
            peer: None,
            read_buf: [0; READ_BUF_SIZE],
            read_pos: 0,
            write_buf: None,
            write_pos: 0,
            last_activity: 0,
        }
    }

    /// The single cleanup path: used when the table is built and again on
    /// every teardown, so no slot carries stale data into its next occupant.
    pub fn reset(&mut self) {
        self.write_buf = None;
        self.fd = -1;
        self.state = ConnState::Closed;
        self.peer = None;
        self.read_pos = 0;
        self.write_pos = 0;
        self.last_activity = 0;
    }

    /// Hand the slot to a freshly accepted descriptor. Callers must only
    /// invoke this on a slot in `Closed` state; the write buffer is not
    /// allocated here.
    pub fn init(&mut self, fd: i32, peer: SocketAddr) {
        self.fd = fd;
        self.state = ConnState::ReadingRequest;
        self.generation = self.generation.wrapping_add(1);
        self.peer = Some(peer);
        self.read_pos = 0;
        self.write_buf = None;
        self.write_pos = 0;
        self.last_activity = unix_now();
    }

    pub fn touch(&mut self) {
        self.last_activity = unix_now();
    }

    #[inline]
    pub fn is_free(&self) -> bool {
        self.fd == -1
    }
}

impl Default for Conn {
    fn default() -> Self {
        Self::empty()
    }
}

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    #[test]
    fn reset_clears_everything_transient() {
        let mut conn = Conn::empty();
        conn.init(9, peer());
        conn.read_buf[..4].copy_from_slice(b"GET ");
        conn.read_pos = 4;
        conn.write_buf = Some(vec![1, 2, 3]);
        conn.write_pos = 2;
        conn.state = ConnState::WritingResponse;

        conn.reset();

        assert_eq!(conn.fd, -1);
        assert_eq!(conn.state, ConnState::Closed);
        assert!(conn.write_buf.is_none());
        assert_eq!(conn.read_pos, 0);
        assert_eq!(conn.write_pos, 0);
        assert!(conn.peer.is_none());
        assert_eq!(conn.last_activity, 0);
    }

    #[test]
    fn init_bumps_generation() {
        let mut conn = Conn::empty();
        conn.init(5, peer());
        let first = conn.generation;
        conn.reset();
        conn.init(5, peer());
        assert_eq!(conn.generation, first + 1);
        assert_eq!(conn.state, ConnState::ReadingRequest);
        assert!(conn.write_buf.is_none());
        assert!(conn.last_activity > 0);
    }
}
