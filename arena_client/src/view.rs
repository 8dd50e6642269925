//! Client-side copy of the world.
//!
//! A `WorldView` is rebuilt from every full update; nothing is predicted or
//! interpolated. It only exists on the game side and is fed from the link's
//! inbound queue.

use arena_shared::{
    collision::Bounds,
    ecs::{EntityId, EntityRecord, Kind},
    math::Vec2,
    net::{FullUpdate, LeaderboardRow, ServerMessage},
};

/// Where the client stands with the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinState {
    Pending,
    Joined(EntityId),
    Rejected(String),
}

pub struct WorldView {
    join: JoinState,
    bounds: Bounds,
    /// Visible area, in world units.
    viewport: Vec2,
    last: FullUpdate,
    updates: u64,
}

impl WorldView {
    pub fn new(bounds: Bounds, viewport: Vec2) -> Self {
        Self {
            join: JoinState::Pending,
            bounds,
            viewport,
            last: FullUpdate::default(),
            updates: 0,
        }
    }

    pub fn apply(&mut self, msg: ServerMessage) {
        match msg {
            ServerMessage::JoinAcknowledge { player } => self.join = JoinState::Joined(player),
            ServerMessage::JoinReject { reason } => self.join = JoinState::Rejected(reason),
            ServerMessage::FullUpdate(update) => {
                self.last = update;
                self.updates += 1;
            }
        }
    }

    pub fn join_state(&self) -> &JoinState {
        &self.join
    }

    pub fn local_player(&self) -> Option<EntityId> {
        match self.join {
            JoinState::Joined(id) => Some(id),
            _ => None,
        }
    }

    /// Number of full updates applied.
    pub fn updates(&self) -> u64 {
        self.updates
    }

    pub fn leaderboard(&self) -> &[LeaderboardRow] {
        &self.last.leaderboard
    }

    pub fn remaining_secs(&self) -> f32 {
        self.last.remaining_secs
    }

    pub fn entities(&self) -> &[EntityRecord] {
        &self.last.entities
    }

    /// Live records with their ids.
    pub fn live(&self) -> impl Iterator<Item = (EntityId, &EntityRecord)> {
        self.last
            .entities
            .iter()
            .enumerate()
            .filter(|(_, r)| r.in_use)
            .map(|(i, r)| (EntityId(i as u32), r))
    }

    /// The local player's record, once joined and present in a snapshot.
    pub fn local_record(&self) -> Option<&EntityRecord> {
        let id = self.local_player()?;
        self.last.entities.get(id.index()).filter(|r| r.in_use && r.kind == Kind::Player)
    }

    pub fn local_score(&self) -> Option<u32> {
        let id = self.local_player()?;
        self.last.leaderboard.iter().find(|r| r.player == id).map(|r| r.score)
    }

    /// Centre of the visible area: the local player, kept far enough from
    /// the edges that the viewport never leaves the world. The origin until
    /// the player is known.
    pub fn camera(&self) -> Vec2 {
        let Some(rec) = self.local_record() else {
            return Vec2::ZERO;
        };
        let inner = Bounds::new(
            (self.bounds.half.x - self.viewport.x * 0.5).max(0.0),
            (self.bounds.half.y - self.viewport.y * 0.5).max(0.0),
        );
        inner.clamp_point(rec.position)
    }

    /// Nearest live entity of `kind` to the local player.
    pub fn nearest(&self, kind: Kind) -> Option<(EntityId, &EntityRecord)> {
        let me = self.local_record()?.position;
        self.live()
            .filter(|(_, r)| r.kind == kind)
            .min_by(|(_, a), (_, b)| {
                (a.position - me)
                    .len_sq()
                    .total_cmp(&(b.position - me).len_sq())
            })
    }
}
