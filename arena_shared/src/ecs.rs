//! Entity store (fixed-capacity table with rewind history).
//!
//! Entities are dense fixed-width records indexed by a stable slot id. The
//! table is replicated over `depth` frame slabs laid out back to back in one
//! contiguous buffer; a rotating `head` index selects which slab is frame 0.
//!
//! Frame layout:
//! - frame 0 is the working copy the simulation mutates ("now").
//! - frame k is the table as archived k ticks ago. Right after
//!   [`EntityStore::archive_frame`] frame 1 is an identical archived copy of
//!   frame 0.
//!
//! Archiving rotates `head` and copies one slab, so the cost per tick is
//! O(capacity) regardless of history depth.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{
    error::{CapacityExceeded, DecodeError},
    math::{Rgb, Vec2},
};

/// Number of `f32`s one record occupies on the wire.
pub const RECORD_WIDTH: usize = 15;

/// Stable entity slot id.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct EntityId(pub u32);

impl EntityId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Entity category. A zeroed slot reads as `Player`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum Kind {
    #[default]
    Player = 0,
    Trap = 1,
    Bullet = 2,
    Star = 3,
}

impl Kind {
    pub fn as_f32(self) -> f32 {
        self as u8 as f32
    }

    pub fn from_f32(v: f32) -> Result<Self, DecodeError> {
        match v.round() as i32 {
            0 => Ok(Kind::Player),
            1 => Ok(Kind::Trap),
            2 => Ok(Kind::Bullet),
            3 => Ok(Kind::Star),
            _ => Err(DecodeError::UnknownKind(v)),
        }
    }
}

/// One entity slot.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct EntityRecord {
    pub position: Vec2,
    /// World units per second.
    pub velocity: Vec2,
    pub color: Rgb,
    /// Bounding box; the collision circle uses the larger side as diameter.
    pub dimension: Vec2,
    pub in_use: bool,
    /// Seconds of local rewind left; > 0 replaces integration with rewind.
    pub reversed_remaining: f32,
    pub collision_enabled: bool,
    pub kind: Kind,
    /// Render hint, passed through untouched.
    pub tex_index: u16,
    /// Seconds until automatic removal; 0 means unlimited.
    pub lifetime: f32,
}

impl EntityRecord {
    pub fn radius(&self) -> f32 {
        0.5 * self.dimension.max_element()
    }

    pub fn is_reversed(&self) -> bool {
        self.reversed_remaining > 0.0
    }

    /// Appends the wire representation (`RECORD_WIDTH` floats).
    pub fn write_floats(&self, out: &mut Vec<f32>) {
        out.extend_from_slice(&[
            self.position.x,
            self.position.y,
            self.velocity.x,
            self.velocity.y,
            self.color.r,
            self.color.g,
            self.color.b,
            self.dimension.x,
            self.dimension.y,
            flag(self.in_use),
            self.reversed_remaining,
            flag(self.collision_enabled),
            self.kind.as_f32(),
            f32::from(self.tex_index),
            self.lifetime,
        ]);
    }

    /// Parses one record from exactly `RECORD_WIDTH` floats.
    pub fn from_floats(f: &[f32]) -> Result<Self, DecodeError> {
        if f.len() != RECORD_WIDTH {
            return Err(DecodeError::PayloadLength {
                event: "entity record",
                expected: RECORD_WIDTH,
                got: f.len(),
            });
        }
        Ok(Self {
            position: Vec2::new(f[0], f[1]),
            velocity: Vec2::new(f[2], f[3]),
            color: Rgb::new(f[4], f[5], f[6]),
            dimension: Vec2::new(f[7], f[8]),
            in_use: f[9] != 0.0,
            reversed_remaining: f[10],
            collision_enabled: f[11] != 0.0,
            kind: Kind::from_f32(f[12])?,
            tex_index: f[13].round().clamp(0.0, f32::from(u16::MAX)) as u16,
            lifetime: f[14],
        })
    }
}

fn flag(b: bool) -> f32 {
    if b {
        1.0
    } else {
        0.0
    }
}

/// Fixed-capacity entity table plus its archived history.
pub struct EntityStore {
    capacity: usize,
    depth: usize,
    slabs: Vec<EntityRecord>,
    head: usize,
    /// Frames `1..=history_len` hold archived data.
    history_len: usize,
}

impl EntityStore {
    /// Creates an empty store.
    ///
    /// # Panics
    /// If `capacity` is zero or `depth < 3` (one working frame, the archived
    /// copy of it, and at least one older frame).
    pub fn new(capacity: usize, depth: usize) -> Self {
        assert!(capacity > 0, "entity capacity must be positive");
        assert!(depth >= 3, "history depth must be at least 3, got {depth}");
        Self {
            capacity,
            depth,
            slabs: vec![EntityRecord::default(); capacity * depth],
            head: 0,
            history_len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn history_depth(&self) -> usize {
        self.depth
    }

    /// Number of archived frames behind frame 0.
    pub fn history_len(&self) -> usize {
        self.history_len
    }

    /// How many ticks [`EntityStore::rewind_global`] can still go back.
    pub fn rewindable_frames(&self) -> usize {
        self.history_len.saturating_sub(1)
    }

    fn slab_start(&self, k: usize) -> usize {
        ((self.head + k) % self.depth) * self.capacity
    }

    fn frame(&self, k: usize) -> &[EntityRecord] {
        let start = self.slab_start(k);
        &self.slabs[start..start + self.capacity]
    }

    fn frame_mut(&mut self, k: usize) -> &mut [EntityRecord] {
        let start = self.slab_start(k);
        &mut self.slabs[start..start + self.capacity]
    }

    /// Copies the whole of frame `src` over frame `dst`.
    fn copy_frame(&mut self, src: usize, dst: usize) {
        let from = self.slab_start(src);
        let to = self.slab_start(dst);
        self.slabs.copy_within(from..from + self.capacity, to);
    }

    /// The working frame.
    pub fn current(&self) -> &[EntityRecord] {
        self.frame(0)
    }

    /// Frame `k` ticks back, if it has been archived.
    pub fn past(&self, k: usize) -> Option<&[EntityRecord]> {
        (k <= self.history_len).then(|| self.frame(k))
    }

    /// Claims the first free slot, zeroes it and marks it in use.
    pub fn add_entity(&mut self) -> Result<EntityId, CapacityExceeded> {
        let capacity = self.capacity;
        let frame = self.frame_mut(0);
        let idx = frame
            .iter()
            .position(|rec| !rec.in_use)
            .ok_or(CapacityExceeded { capacity })?;
        frame[idx] = EntityRecord {
            in_use: true,
            ..EntityRecord::default()
        };
        Ok(EntityId(idx as u32))
    }

    /// Frees a slot. Other fields are left stale until the slot is reused.
    pub fn remove_entity(&mut self, id: EntityId) {
        self.get_mut(id).in_use = false;
    }

    /// # Panics
    /// If `id` is outside the table.
    pub fn get(&self, id: EntityId) -> &EntityRecord {
        self.check(id);
        &self.frame(0)[id.index()]
    }

    /// # Panics
    /// If `id` is outside the table.
    pub fn get_mut(&mut self, id: EntityId) -> &mut EntityRecord {
        self.check(id);
        &mut self.frame_mut(0)[id.index()]
    }

    /// Non-panicking lookup for ids of untrusted origin.
    pub fn try_get(&self, id: EntityId) -> Option<&EntityRecord> {
        self.frame(0).get(id.index())
    }

    fn check(&self, id: EntityId) {
        assert!(
            id.index() < self.capacity,
            "entity {id} out of range (capacity {})",
            self.capacity
        );
    }

    pub fn is_live(&self, id: EntityId) -> bool {
        self.try_get(id).is_some_and(|rec| rec.in_use)
    }

    /// In-use entities in id order.
    pub fn iter_live(&self) -> impl Iterator<Item = (EntityId, &EntityRecord)> {
        self.frame(0)
            .iter()
            .enumerate()
            .filter(|(_, rec)| rec.in_use)
            .map(|(i, rec)| (EntityId(i as u32), rec))
    }

    pub fn count_live(&self, kind: Kind) -> usize {
        self.iter_live().filter(|(_, rec)| rec.kind == kind).count()
    }

    /// Whether a circle at `center` would touch any collidable entity.
    pub fn is_occupied(&self, center: Vec2, radius: f32) -> bool {
        self.iter_live().any(|(_, rec)| {
            rec.collision_enabled && {
                let reach = rec.radius() + radius;
                (rec.position - center).len_sq() <= reach * reach
            }
        })
    }

    /// Pushes the working frame onto history, evicting the oldest frame when
    /// full. Frame 0 stays a working copy of what was just archived.
    pub fn archive_frame(&mut self) {
        self.head = (self.head + self.depth - 1) % self.depth;
        self.copy_frame(1, 0);
        self.history_len = (self.history_len + 1).min(self.depth - 1);
    }

    /// Steps the whole world one tick back. Returns `false` when no archived
    /// frame is left to go back to.
    pub fn rewind_global(&mut self) -> bool {
        if self.rewindable_frames() == 0 {
            return false;
        }
        self.head = (self.head + 1) % self.depth;
        self.history_len -= 1;
        self.copy_frame(1, 0);
        true
    }

    /// Pulls one entity a tick back through its own history while the rest of
    /// the world is untouched, decrementing its countdown by `dt`.
    ///
    /// Ends the rewind early (countdown zeroed) when the slot was not in use
    /// one tick back or history does not reach that far.
    pub fn rewind_local(&mut self, id: EntityId, dt: f32) {
        let remaining = self.get(id).reversed_remaining;
        if remaining <= 0.0 {
            return;
        }
        let idx = id.index();
        if self.history_len < 2 || !self.frame(2)[idx].in_use {
            self.get_mut(id).reversed_remaining = 0.0;
            return;
        }
        // Drop the working record and its archived twin: the column shifts
        // up two frames, frame 0 receives the state one tick back.
        for k in 0..=self.history_len - 2 {
            let older = self.frame(k + 2)[idx];
            self.frame_mut(k)[idx] = older;
        }
        self.get_mut(id).reversed_remaining = (remaining - dt).max(0.0);
    }

    /// Flattens the working frame into the wire layout.
    pub fn snapshot_into(&self, out: &mut Vec<f32>) {
        out.reserve(self.capacity * RECORD_WIDTH);
        for rec in self.frame(0) {
            rec.write_floats(out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn spawn_at(store: &mut EntityStore, x: f32, vx: f32) -> EntityId {
        let id = store.add_entity().unwrap();
        let rec = store.get_mut(id);
        rec.position = Vec2::new(x, 0.0);
        rec.velocity = Vec2::new(vx, 0.0);
        rec.dimension = Vec2::new(2.0, 2.0);
        id
    }

    /// Moves every live entity by its velocity, then archives.
    fn advance(store: &mut EntityStore) {
        let ids: Vec<EntityId> = store.iter_live().map(|(id, _)| id).collect();
        for id in ids {
            let rec = store.get_mut(id);
            if !rec.is_reversed() {
                let v = rec.velocity;
                rec.position += v;
            }
        }
        store.archive_frame();
    }

    #[test]
    fn add_takes_first_free_slot() {
        let mut store = EntityStore::new(4, 3);
        let a = store.add_entity().unwrap();
        let b = store.add_entity().unwrap();
        assert_eq!((a, b), (EntityId(0), EntityId(1)));
        store.remove_entity(a);
        assert_eq!(store.add_entity().unwrap(), a);
    }

    #[test]
    fn full_table_reports_capacity() {
        let mut store = EntityStore::new(2, 3);
        store.add_entity().unwrap();
        store.add_entity().unwrap();
        assert_eq!(store.add_entity(), Err(CapacityExceeded { capacity: 2 }));
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn out_of_range_id_fails_fast() {
        let store = EntityStore::new(2, 3);
        store.get(EntityId(2));
    }

    #[test]
    fn history_is_bounded_by_depth() {
        let mut store = EntityStore::new(2, 4);
        for _ in 0..10 {
            store.archive_frame();
        }
        assert_eq!(store.history_len(), 3);
        assert_eq!(store.rewindable_frames(), 2);
    }

    #[test]
    fn global_rewind_walks_back_one_tick_each() {
        let mut store = EntityStore::new(4, 8);
        let id = spawn_at(&mut store, 0.0, 1.0);
        store.archive_frame();
        for _ in 0..3 {
            advance(&mut store);
        }
        assert_eq!(store.get(id).position.x, 3.0);
        assert!(store.rewind_global());
        assert_eq!(store.get(id).position.x, 2.0);
        assert!(store.rewind_global());
        assert!(store.rewind_global());
        assert_eq!(store.get(id).position.x, 0.0);
        assert!(!store.rewind_global());
    }

    #[test]
    fn local_rewind_moves_only_its_entity() {
        let mut store = EntityStore::new(4, 16);
        let a = spawn_at(&mut store, 0.0, 1.0);
        let b = spawn_at(&mut store, 100.0, -1.0);
        store.archive_frame();
        for _ in 0..5 {
            advance(&mut store);
        }
        store.get_mut(a).reversed_remaining = 1.0;
        let before_b = *store.get(b);

        store.rewind_local(a, 0.25);

        assert_eq!(store.get(a).position.x, 4.0);
        assert_eq!(store.get(a).reversed_remaining, 0.75);
        assert_eq!(*store.get(b), before_b);
    }

    #[test]
    fn local_rewind_keeps_walking_back_across_ticks() {
        let mut store = EntityStore::new(2, 16);
        let a = spawn_at(&mut store, 0.0, 1.0);
        store.archive_frame();
        for _ in 0..6 {
            advance(&mut store);
        }
        store.get_mut(a).reversed_remaining = 10.0;
        let mut seen = Vec::new();
        for _ in 0..3 {
            store.rewind_local(a, 0.1);
            seen.push(store.get(a).position.x);
            store.archive_frame();
        }
        assert_eq!(seen, vec![5.0, 4.0, 3.0]);
    }

    #[test]
    fn local_rewind_ends_early_without_history() {
        let mut store = EntityStore::new(2, 8);
        let a = spawn_at(&mut store, 0.0, 1.0);
        store.archive_frame();
        store.get_mut(a).reversed_remaining = 2.0;
        store.rewind_local(a, 0.1);
        assert_eq!(store.get(a).reversed_remaining, 0.0);
        assert_eq!(store.get(a).position.x, 0.0);
    }

    #[test]
    fn local_rewind_ends_early_when_slot_was_free() {
        let mut store = EntityStore::new(2, 8);
        store.archive_frame();
        store.archive_frame();
        let a = spawn_at(&mut store, 5.0, 1.0);
        store.archive_frame();
        store.get_mut(a).reversed_remaining = 2.0;
        store.rewind_local(a, 0.1);
        assert!(store.get(a).in_use);
        assert_eq!(store.get(a).reversed_remaining, 0.0);
        assert_eq!(store.get(a).position.x, 5.0);
    }

    #[test]
    fn record_wire_layout_roundtrips() {
        let rec = EntityRecord {
            position: Vec2::new(1.0, 2.0),
            velocity: Vec2::new(3.0, 4.0),
            color: Rgb::new(0.5, 0.25, 0.125),
            dimension: Vec2::new(10.0, 12.0),
            in_use: true,
            reversed_remaining: 0.3,
            collision_enabled: true,
            kind: Kind::Star,
            tex_index: 3,
            lifetime: 8.0,
        };
        let mut floats = Vec::new();
        rec.write_floats(&mut floats);
        assert_eq!(floats.len(), RECORD_WIDTH);
        assert_eq!(EntityRecord::from_floats(&floats).unwrap(), rec);
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let mut floats = vec![0.0; RECORD_WIDTH];
        floats[12] = 9.0;
        assert_eq!(
            EntityRecord::from_floats(&floats),
            Err(DecodeError::UnknownKind(9.0))
        );
    }

    proptest! {
        #[test]
        fn reused_slot_reads_zeroed(ops in proptest::collection::vec(any::<bool>(), 1..64)) {
            let mut store = EntityStore::new(8, 3);
            let mut live: Vec<EntityId> = Vec::new();
            for add in ops {
                if add || live.is_empty() {
                    let expected = (0..8u32).map(EntityId).find(|id| !live.contains(id));
                    match store.add_entity() {
                        Ok(id) => {
                            prop_assert_eq!(Some(id), expected);
                            prop_assert_eq!(*store.get(id), EntityRecord { in_use: true, ..EntityRecord::default() });
                            let rec = store.get_mut(id);
                            rec.position = Vec2::new(7.0, 7.0);
                            rec.lifetime = 3.0;
                            rec.kind = Kind::Bullet;
                            live.push(id);
                        }
                        Err(_) => prop_assert!(expected.is_none()),
                    }
                } else {
                    let id = live.remove(0);
                    store.remove_entity(id);
                    prop_assert!(!store.get(id).in_use);
                }
            }
        }
    }
}
