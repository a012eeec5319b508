// src/lib.rs
pub mod conn;
pub mod error;
pub mod logging;
pub mod reactor;
pub mod response;
pub mod server;
pub mod syscalls;
pub mod table;

// Re-exports for users
pub use error::{Error, Result};
pub use reactor::{Reactor, StopHandle};
pub use server::Server;
