//! Framed TCP transport for the synchronization protocol.
//!
//! [`RemoteDestination`] implements [`crate::SyncDestination`] against a peer
//! running [`serve`], so servers in separate processes synchronize the same
//! way in-process ones do.

mod client;
mod message;
pub mod protocol;
mod serve;

pub use client::{Connect, RemoteDestination, TcpConnector, TcpResolver, WireResolver};
pub use message::{Request, Response, ServerStatus};
pub use serve::{handle_connection, listen, serve};
