// src/table.rs
use std::net::SocketAddr;

use crate::conn::{Conn, ConnState};
use crate::error::{Error, Result};

/// Fixed array of connection slots, indexed directly by descriptor value.
///
/// Each reactor owns exactly one table and only ever indexes it with
/// descriptors it accepted itself, so a descriptor is unique within a table
/// while its slot is occupied. Invariant: `active() + free slots == capacity`
/// at every instant.
pub struct ConnTable {
    slots: Box<[Conn]>,
    active: usize,
}

impl ConnTable {
    /// Allocate `capacity` slots, all reset to `Closed`. Fails instead of
    /// aborting if the allocation cannot be satisfied, so the caller can
    /// refuse to listen.
    pub fn new(capacity: usize) -> Result<Self> {
        let mut slots = Vec::new();
        slots
            .try_reserve_exact(capacity)
            .map_err(|_| Error::TableAlloc(capacity))?;
        for _ in 0..capacity {
            let mut conn = Conn::empty();
            conn.reset();
            slots.push(conn);
        }
        Ok(Self {
            slots: slots.into_boxed_slice(),
            active: 0,
        })
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn active(&self) -> usize {
        self.active
    }

    /// Hand the slot for `fd` to a new connection. Returns `None` when the
    /// descriptor is out of range or the slot is not free; the descriptor is
    /// never used as an index in either case.
    pub fn claim(&mut self, fd: i32, peer: SocketAddr) -> Option<&mut Conn> {
        if fd < 0 || fd as usize >= self.slots.len() {
            return None;
        }
        let conn = &mut self.slots[fd as usize];
        if conn.state != ConnState::Closed {
            return None;
        }
        conn.init(fd, peer);
        self.active += 1;
        Some(conn)
    }

    /// Reset the slot for `fd`. Idempotent: releasing a free or out-of-range
    /// descriptor is a no-op.
    pub fn release(&mut self, fd: i32) -> bool {
        if fd < 0 || fd as usize >= self.slots.len() {
            return false;
        }
        let conn = &mut self.slots[fd as usize];
        if conn.is_free() {
            return false;
        }
        conn.reset();
        self.active -= 1;
        true
    }

    #[inline]
    pub fn get(&self, fd: i32) -> Option<&Conn> {
        if fd < 0 {
            return None;
        }
        self.slots.get(fd as usize)
    }

    #[inline]
    pub fn get_mut(&mut self, fd: i32) -> Option<&mut Conn> {
        if fd < 0 {
            return None;
        }
        self.slots.get_mut(fd as usize)
    }

    /// Descriptors of every occupied slot; used to close live connections at
    /// reactor shutdown.
    pub fn live_fds(&self) -> Vec<i32> {
        self.slots
            .iter()
            .filter(|c| !c.is_free())
            .map(|c| c.fd)
            .collect()
    }
}
