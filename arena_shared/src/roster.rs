//! Session roster and leaderboard.
//!
//! One entry per connected player. Entries are kept sorted by score
//! (highest first); ties keep their previous relative order.

use serde::{Deserialize, Serialize};

use crate::{ecs::EntityId, error::SimError};

/// Per-player session state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEntry {
    pub username: String,
    pub player: EntityId,
    pub score: u32,
    /// Seconds until the next drain while touching a trap.
    pub drain_timeout: f32,
    /// Seconds until the server accepts another shot.
    pub shoot_cooldown: f32,
}

impl SessionEntry {
    pub fn new(username: impl Into<String>, player: EntityId) -> Self {
        Self {
            username: username.into(),
            player,
            score: 0,
            drain_timeout: 0.0,
            shoot_cooldown: 0.0,
        }
    }
}

/// Ordered roster of sessions.
#[derive(Debug, Clone, Default)]
pub struct Roster {
    entries: Vec<SessionEntry>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Adds a session at the bottom of the board.
    pub fn insert(&mut self, entry: SessionEntry) {
        self.entries.push(entry);
    }

    pub fn remove(&mut self, player: EntityId) -> Result<SessionEntry, SimError> {
        let idx = self
            .position(player)
            .ok_or(SimError::UnknownPlayer(player))?;
        Ok(self.entries.remove(idx))
    }

    fn position(&self, player: EntityId) -> Option<usize> {
        self.entries.iter().position(|e| e.player == player)
    }

    pub fn get(&self, player: EntityId) -> Option<&SessionEntry> {
        self.entries.iter().find(|e| e.player == player)
    }

    pub fn get_mut(&mut self, player: EntityId) -> Option<&mut SessionEntry> {
        self.entries.iter_mut().find(|e| e.player == player)
    }

    /// Entries in leaderboard order.
    pub fn entries(&self) -> &[SessionEntry] {
        &self.entries
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut SessionEntry> {
        self.entries.iter_mut()
    }

    /// Highest score first; stable for ties.
    pub fn sort(&mut self) {
        self.entries.sort_by(|a, b| b.score.cmp(&a.score));
    }

    pub fn leader(&self) -> Option<&SessionEntry> {
        self.entries.first()
    }

    /// Zeroes every score, e.g. when a round ends.
    pub fn reset_scores(&mut self) {
        for entry in &mut self.entries {
            entry.score = 0;
            entry.drain_timeout = 0.0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roster_with(scores: &[u32]) -> Roster {
        let mut roster = Roster::new();
        for (i, &score) in scores.iter().enumerate() {
            let mut e = SessionEntry::new(format!("p{i}"), EntityId(i as u32));
            e.score = score;
            roster.insert(e);
        }
        roster
    }

    #[test]
    fn sort_is_descending_and_stable() {
        let mut roster = roster_with(&[10, 30, 10, 20]);
        roster.sort();
        let order: Vec<u32> = roster.entries().iter().map(|e| e.player.0).collect();
        assert_eq!(order, vec![1, 3, 0, 2]);
        assert_eq!(roster.leader().map(|e| e.score), Some(30));
    }

    #[test]
    fn remove_unknown_player_is_reported() {
        let mut roster = roster_with(&[1]);
        assert_eq!(
            roster.remove(EntityId(7)),
            Err(SimError::UnknownPlayer(EntityId(7)))
        );
        assert_eq!(roster.remove(EntityId(0)).map(|e| e.score), Ok(1));
        assert!(roster.is_empty());
    }

    #[test]
    fn reset_zeroes_all_scores() {
        let mut roster = roster_with(&[5, 9]);
        roster.reset_scores();
        assert!(roster.entries().iter().all(|e| e.score == 0));
    }
}
