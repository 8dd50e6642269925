//! `arena_shared`
//!
//! Libraries used by both the arena server and client.
//!
//! Design goals:
//! - One authoritative simulation, driven explicitly through [`world::World`].
//! - Fixed-capacity entity storage with cheap per-tick history.
//! - A small explicit wire format decoded into typed messages at the edge.
//! - No `unsafe`.

pub mod collision;
pub mod config;
pub mod console;
pub mod ecs;
pub mod error;
pub mod math;
pub mod names;
pub mod net;
pub mod roster;
pub mod world;

pub mod prelude {
    //! Commonly used exports.

    pub use crate::config::*;
    pub use crate::ecs::{EntityId, EntityRecord, EntityStore, Kind};
    pub use crate::error::*;
    pub use crate::math::*;
    pub use crate::net::{ClientCommand, Envelope, Event, FrameDecoder, FullUpdate, ServerMessage};
    pub use crate::world::World;
}
