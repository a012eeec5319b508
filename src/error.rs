// src/error.rs
use std::io;

/// Central error type for the arclight engine.
///
/// Only setup-time failures travel through this type; anything that goes
/// wrong on a single connection is handled inside the reactor loop and never
/// propagates past it.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Underlying I/O error from the OS or network.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The listen address could not be parsed.
    #[error("invalid listen address: {0}")]
    InvalidAddress(String),

    /// The connection table could not be allocated.
    #[error("connection table allocation failed for {0} slots")]
    TableAlloc(usize),

    /// A worker thread could not be spawned.
    #[error("failed to spawn worker thread: {0}")]
    WorkerSpawn(String),
}

pub type Result<T> = std::result::Result<T, Error>;
