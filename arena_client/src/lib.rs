//! `arena_client`
//!
//! Client-side systems:
//! - Network link on its own thread, reached only through bounded queues
//! - World view rebuilt from full updates, with a clamped camera
//! - Input sampling and the client-side shoot cooldown
//!
//! Rendering and raw key capture are left to the front end.

pub mod client;
pub mod input;
pub mod view;

pub use client::ClientLink;
