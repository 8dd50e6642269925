//! `arena_server`
//!
//! Server-side systems:
//! - Non-blocking TCP connection multiplexer
//! - Fixed-interval simulation driver
//! - Decodes `ClientCommand`s into the world
//! - Broadcasts one encoded `FullUpdate` per tick
//!
//! Everything runs on a single thread; the world is never shared.

pub mod conn;
pub mod server;

pub use server::{GameServer, ShutdownFlag};
