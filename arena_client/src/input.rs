//! Input handling.
//!
//! Raw key capture belongs to whatever front end drives the client. This
//! module turns one sampled frame of WASD + fire into the commands to send,
//! and owns the client-side shoot cooldown.

use arena_shared::{math::Vec2, net::ClientCommand};

/// Seconds between shots.
pub const SHOOT_COOLDOWN: f32 = 1.0;

/// Per-axis factor while both axes are held.
const DIAGONAL_FACTOR: f32 = 0.7;

/// Keys held during one frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InputState {
    pub up: bool,
    pub left: bool,
    pub down: bool,
    pub right: bool,
    pub fire: bool,
}

impl InputState {
    /// Direction from the held keys, y pointing up. Opposite keys cancel.
    pub fn direction(self) -> Vec2 {
        let axis = |pos: bool, neg: bool| f32::from(u8::from(pos)) - f32::from(u8::from(neg));
        let x = axis(self.right, self.left);
        let y = axis(self.up, self.down);
        if x != 0.0 && y != 0.0 {
            Vec2::new(x * DIAGONAL_FACTOR, y * DIAGONAL_FACTOR)
        } else {
            Vec2::new(x, y)
        }
    }
}

/// Builds the commands for each sampled frame.
#[derive(Debug, Default)]
pub struct InputSampler {
    cooldown: f32,
}

impl InputSampler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seconds until the next shot is allowed.
    pub fn cooldown(&self) -> f32 {
        self.cooldown
    }

    /// Every frame steers, so releasing all keys stops the player. A shot
    /// goes out along the same direction when fire is held, the cooldown has
    /// run out and the direction is not zero.
    pub fn sample(&mut self, input: InputState, dt: f32) -> Vec<ClientCommand> {
        self.cooldown = (self.cooldown - dt).max(0.0);
        let dir = input.direction();
        let mut out = vec![ClientCommand::Steer(dir)];
        if input.fire && self.cooldown == 0.0 && dir != Vec2::ZERO {
            self.cooldown = SHOOT_COOLDOWN;
            out.push(ClientCommand::Shoot(dir));
        }
        out
    }
}
