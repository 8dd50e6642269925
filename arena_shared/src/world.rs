//! Authoritative simulation.
//!
//! `World` owns the entity store, the session roster and the RNG; nothing is
//! process-global. The server calls [`World::apply`] for every decoded client
//! command between ticks and [`World::step`] once per update interval.
//!
//! One forward step runs, in order:
//! 1. integrate positions of entities not under local rewind
//! 2. local rewind of entities with a running countdown
//! 3. pairwise collisions and edge bounces
//! 4. star population top-up
//! 5. score drain for players touching traps
//! 6. lifetime expiry
//! 7. leaderboard sort and round timer
//! 8. archive the frame
//!
//! While global rewind is on, a step only walks the whole world one archived
//! frame back.

use std::f32::consts::PI;

use rand::{rngs::StdRng, Rng, SeedableRng};
use tracing::{debug, info, warn};

use crate::{
    collision::{circles_overlap, Bounds},
    config::SimConfig,
    ecs::{EntityId, EntityRecord, EntityStore, Kind},
    error::{CapacityExceeded, SimError},
    math::{Rgb, Vec2},
    names::generate_name,
    net::{ClientCommand, FullUpdate, LeaderboardRow},
    roster::{Roster, SessionEntry},
};

const MAX_SPAWN_ATTEMPTS: usize = 64;
const STAR_MAX_DIAMETER: f32 = 10.0;
const TRAP_TEXTURE: u16 = 3;
const BULLET_COLOR: Rgb = Rgb::new(178.0 / 255.0, 123.0 / 255.0, 13.0 / 255.0);

/// What happened during one [`World::step`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepReport {
    pub tick: u64,
    /// The step was a global rewind instead of a forward step.
    pub rewound: bool,
    pub collisions: usize,
    pub bullets_removed: usize,
    pub stars_collected: usize,
    pub stars_spawned: usize,
    pub drains: Vec<Drain>,
    pub expired: usize,
    pub round_over: Option<RoundResult>,
}

/// One drain event: `amount` points left `player`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Drain {
    pub player: EntityId,
    pub amount: u32,
    /// The star carrying the drained area, if it was big enough to spawn.
    pub star: Option<EntityId>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RoundResult {
    pub winner: Option<String>,
    pub score: u32,
}

/// Result of applying one client command.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CommandOutcome {
    Steered,
    Shot(EntityId),
    /// The player is under local rewind; input is ignored.
    Frozen,
    /// Server-side shoot cooldown still running.
    CoolingDown,
    /// Non-finite or zero direction.
    InvalidDirection,
    /// No slot free for the bullet.
    Dropped,
}

/// Points removed by one drain: at least one, never more than `score`.
pub fn drain_amount(score: u32, factor: f32) -> u32 {
    if score == 0 {
        return 0;
    }
    let fraction = (f64::from(score) * f64::from(factor)).floor() as u32;
    fraction.max(1).min(score)
}

/// Diameter of the star whose collected area equals `area`.
pub fn star_diameter_for_area(area: u32) -> f32 {
    2.0 * (area as f32 / PI).sqrt()
}

/// Score a player gets for collecting a star of `radius`.
pub fn star_value(radius: f32) -> u32 {
    (PI * radius * radius).floor() as u32
}

pub struct World {
    store: EntityStore,
    roster: Roster,
    cfg: SimConfig,
    bounds: Bounds,
    rng: StdRng,
    time_reverse: bool,
    round_remaining: f32,
    next_player_texture: u16,
    tick: u64,
}

impl World {
    pub fn new(cfg: SimConfig) -> Self {
        let rng = match cfg.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            store: EntityStore::new(cfg.entity_capacity, cfg.history_depth),
            roster: Roster::new(),
            bounds: Bounds::new(cfg.half_width, cfg.half_height),
            round_remaining: cfg.round_secs,
            cfg,
            rng,
            time_reverse: false,
            next_player_texture: 0,
            tick: 0,
        }
    }

    pub fn store(&self) -> &EntityStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut EntityStore {
        &mut self.store
    }

    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    pub fn roster_mut(&mut self) -> &mut Roster {
        &mut self.roster
    }

    pub fn config(&self) -> &SimConfig {
        &self.cfg
    }

    pub fn set_shoot_cooldown(&mut self, secs: f32) {
        self.cfg.shoot_cooldown_secs = secs.max(0.0);
    }

    pub fn tick(&self) -> u64 {
        self.tick
    }

    pub fn bounds(&self) -> Bounds {
        self.bounds
    }

    /// Seconds left in the current round (0 when rounds are disabled).
    pub fn round_remaining(&self) -> f32 {
        self.round_remaining
    }

    pub fn is_time_reversed(&self) -> bool {
        self.time_reverse
    }

    /// Turns global rewind on or off. Turning it on only sticks while there
    /// is history to rewind into. Returns the resulting state.
    pub fn set_time_reverse(&mut self, on: bool) -> bool {
        self.time_reverse = on && self.store.rewindable_frames() > 0;
        self.time_reverse
    }

    pub fn random_name(&mut self) -> String {
        generate_name(&mut self.rng)
    }

    /// Spawns traps and the initial stars, then archives the first frame.
    pub fn populate(&mut self) {
        for _ in 0..self.cfg.trap_count {
            match self.spawn_free(
                Kind::Trap,
                self.cfg.trap_diameter,
                self.cfg.trap_speed,
                TRAP_TEXTURE,
            ) {
                Ok(id) => debug!(trap = %id, "spawned trap"),
                Err(e) => {
                    warn!(error = %e, "no room for trap");
                    break;
                }
            }
        }
        let spawned = self.top_up_stars();
        self.store.archive_frame();
        info!(
            traps = self.store.count_live(Kind::Trap),
            stars = spawned,
            "world populated"
        );
    }

    /// Creates a player entity plus its session entry.
    pub fn add_player(&mut self, username: impl Into<String>) -> Result<EntityId, CapacityExceeded> {
        let texture = self.next_player_texture % 2 + 1;
        let id = self.spawn_free(Kind::Player, self.cfg.player_diameter, 0.0, texture)?;
        self.next_player_texture = self.next_player_texture.wrapping_add(1);
        self.store.get_mut(id).color = Rgb::WHITE;

        let mut entry = SessionEntry::new(username, id);
        entry.drain_timeout = self.cfg.drain_interval;
        info!(player = %id, name = %entry.username, "player joined");
        self.roster.insert(entry);
        Ok(id)
    }

    /// Removes a player's entity and session entry.
    pub fn remove_player(&mut self, player: EntityId) -> Result<SessionEntry, SimError> {
        let entry = self.roster.remove(player)?;
        self.store.remove_entity(player);
        info!(player = %player, name = %entry.username, score = entry.score, "player left");
        Ok(entry)
    }

    /// Applies one client command to `player`.
    pub fn apply(&mut self, player: EntityId, cmd: ClientCommand) -> Result<CommandOutcome, SimError> {
        let Some(entry) = self.roster.get(player) else {
            return Err(SimError::UnknownPlayer(player));
        };
        if !self.store.is_live(player) {
            return Err(SimError::UnknownPlayer(player));
        }
        if self.store.get(player).is_reversed() {
            return Ok(CommandOutcome::Frozen);
        }
        let ready = entry.shoot_cooldown <= 0.0;

        match cmd {
            ClientCommand::Steer(dir) => {
                let Some(dir) = clamp_direction(dir) else {
                    return Ok(CommandOutcome::InvalidDirection);
                };
                self.store.get_mut(player).velocity = dir * self.cfg.player_speed;
                Ok(CommandOutcome::Steered)
            }
            ClientCommand::Shoot(dir) => {
                let Some(dir) = clamp_direction(dir) else {
                    return Ok(CommandOutcome::InvalidDirection);
                };
                if dir == Vec2::ZERO {
                    return Ok(CommandOutcome::InvalidDirection);
                }
                if !ready {
                    return Ok(CommandOutcome::CoolingDown);
                }
                match self.spawn_bullet(player, dir) {
                    Ok(bullet) => {
                        if let Some(entry) = self.roster.get_mut(player) {
                            entry.shoot_cooldown = self.cfg.shoot_cooldown_secs;
                        }
                        Ok(CommandOutcome::Shot(bullet))
                    }
                    Err(e) => {
                        debug!(player = %player, error = %e, "bullet dropped");
                        Ok(CommandOutcome::Dropped)
                    }
                }
            }
        }
    }

    fn spawn_bullet(&mut self, player: EntityId, dir: Vec2) -> Result<EntityId, CapacityExceeded> {
        let shooter = *self.store.get(player);
        let d = self.cfg.bullet_diameter;
        let offset = Vec2::new(
            dir.x * 0.5 * (shooter.dimension.x + d),
            dir.y * 0.5 * (shooter.dimension.y + d),
        );
        let id = self.store.add_entity()?;
        let rec = self.store.get_mut(id);
        rec.kind = Kind::Bullet;
        rec.collision_enabled = true;
        rec.dimension = Vec2::new(d, d);
        rec.position = shooter.position + offset;
        rec.velocity = dir * self.cfg.bullet_speed;
        rec.lifetime = self.cfg.bullet_lifetime;
        rec.color = BULLET_COLOR;
        Ok(id)
    }

    /// Advances the world by `dt` seconds.
    pub fn step(&mut self, dt: f32) -> StepReport {
        self.tick += 1;
        let mut report = StepReport {
            tick: self.tick,
            ..StepReport::default()
        };

        if self.time_reverse {
            self.store.rewind_global();
            if self.store.rewindable_frames() == 0 {
                info!(tick = self.tick, "global rewind exhausted");
                self.time_reverse = false;
            }
            report.rewound = true;
            return report;
        }

        self.integrate(dt);
        self.rewind_reversed(dt);
        let touching_traps = self.detect_collisions(&mut report);
        self.confine_to_bounds();
        report.stars_spawned += self.top_up_stars();
        self.drain_players(&touching_traps, dt, &mut report);
        report.expired = self.expire(dt);
        self.tick_cooldowns(dt);
        self.roster.sort();
        report.round_over = self.advance_round(dt);
        self.store.archive_frame();
        report
    }

    fn live_ids(&self) -> Vec<EntityId> {
        self.store.iter_live().map(|(id, _)| id).collect()
    }

    fn integrate(&mut self, dt: f32) {
        for id in self.live_ids() {
            let bounds = self.bounds;
            let rec = self.store.get_mut(id);
            if rec.is_reversed() {
                continue;
            }
            rec.position = bounds.clamp_point(rec.position + rec.velocity * dt);
        }
    }

    fn rewind_reversed(&mut self, dt: f32) {
        for id in self.live_ids() {
            if self.store.get(id).is_reversed() {
                self.store.rewind_local(id, dt);
            }
        }
    }

    /// Resolves every touching pair. Returns the players touching a trap.
    fn detect_collisions(&mut self, report: &mut StepReport) -> Vec<EntityId> {
        let mut touching_traps = Vec::new();
        let cap = self.store.capacity();
        for i in 0..cap {
            let a = EntityId(i as u32);
            for j in i + 1..cap {
                let ra = *self.store.get(a);
                if !collidable(&ra) {
                    break;
                }
                let b = EntityId(j as u32);
                let rb = *self.store.get(b);
                if !collidable(&rb)
                    || !circles_overlap(ra.position, ra.radius(), rb.position, rb.radius())
                {
                    continue;
                }
                report.collisions += 1;
                self.resolve(a, &ra, b, &rb, report, &mut touching_traps);
            }
        }
        touching_traps
    }

    fn resolve(
        &mut self,
        a: EntityId,
        ra: &EntityRecord,
        b: EntityId,
        rb: &EntityRecord,
        report: &mut StepReport,
        touching_traps: &mut Vec<EntityId>,
    ) {
        use Kind::*;
        match (ra.kind, rb.kind) {
            (Bullet, Bullet) => {
                self.store.remove_entity(a);
                self.store.remove_entity(b);
                report.bullets_removed += 2;
            }
            (Bullet, Player) | (Player, Bullet) => {
                let (bullet, player) = if ra.kind == Bullet { (a, b) } else { (b, a) };
                self.store.remove_entity(bullet);
                self.store.get_mut(player).reversed_remaining = self.cfg.bullet_hit_rewind;
                report.bullets_removed += 1;
                debug!(player = %player, bullet = %bullet, "player hit");
            }
            (Bullet, _) | (_, Bullet) => {}
            (Player, Player) => {
                let rewind = self.cfg.player_bump_rewind;
                self.store.get_mut(a).reversed_remaining = rewind;
                self.store.get_mut(b).reversed_remaining = rewind;
            }
            (Player, Star) | (Star, Player) => {
                let (player, star, star_rec) = if ra.kind == Star { (b, a, ra) } else { (a, b, rb) };
                self.store.remove_entity(star);
                let value = star_value(star_rec.radius());
                if let Some(entry) = self.roster.get_mut(player) {
                    entry.score = entry.score.saturating_add(value);
                }
                report.stars_collected += 1;
            }
            (Player, Trap) | (Trap, Player) => {
                touching_traps.push(if ra.kind == Player { a } else { b });
            }
            (Trap, Trap) => self.bounce_traps(a, ra, b, rb),
            (Star, Star) | (Star, Trap) | (Trap, Star) => {}
        }
    }

    /// Reflects the approaching traps' velocities about the line joining
    /// their previous-frame centres. A pair with a trap under local rewind is
    /// left alone for the tick.
    fn bounce_traps(&mut self, a: EntityId, ra: &EntityRecord, b: EntityId, rb: &EntityRecord) {
        if ra.is_reversed() || rb.is_reversed() {
            return;
        }
        let (pa, pb) = match self.store.past(1) {
            Some(prev) => (prev[a.index()].position, prev[b.index()].position),
            None => (ra.position, rb.position),
        };
        let Some(n) = (pb - pa).try_normalize() else {
            return;
        };
        if (rb.velocity - ra.velocity).dot(n) >= 0.0 {
            return;
        }
        if ra.velocity.dot(n) > 0.0 {
            self.store.get_mut(a).velocity = ra.velocity.reflect(n);
        }
        if rb.velocity.dot(n) < 0.0 {
            self.store.get_mut(b).velocity = rb.velocity.reflect(n);
        }
    }

    fn confine_to_bounds(&mut self) {
        for id in self.live_ids() {
            let bounds = self.bounds;
            let rec = self.store.get_mut(id);
            let hit = bounds.confine(&mut rec.position, rec.dimension);
            if hit.x {
                rec.velocity.x = -rec.velocity.x;
            }
            if hit.y {
                rec.velocity.y = -rec.velocity.y;
            }
        }
    }

    /// Spawns stars until `min_stars` are live. Returns how many spawned.
    fn top_up_stars(&mut self) -> usize {
        let live = self.store.count_live(Kind::Star);
        let mut spawned = 0;
        for _ in live..self.cfg.min_stars {
            match self.spawn_star() {
                Ok(_) => spawned += 1,
                Err(e) => {
                    debug!(error = %e, "star spawn skipped");
                    break;
                }
            }
        }
        spawned
    }

    fn spawn_star(&mut self) -> Result<EntityId, CapacityExceeded> {
        let diameter = STAR_MAX_DIAMETER * (self.rng.gen::<f32>() + 0.2).min(1.0);
        let half = self.bounds.half;
        let position = Vec2::new(
            self.rng.gen_range(-half.x..=half.x),
            self.rng.gen_range(-half.y..=half.y),
        );
        let color = self.star_color();
        let id = self.store.add_entity()?;
        let rec = self.store.get_mut(id);
        rec.kind = Kind::Star;
        rec.collision_enabled = true;
        rec.dimension = Vec2::new(diameter, diameter);
        rec.position = position;
        rec.color = color;
        Ok(id)
    }

    /// White shifted slightly towards red or blue.
    fn star_color(&mut self) -> Rgb {
        let tint = self.rng.gen_range(-1.0f32..1.0) * 0.25;
        if tint > 0.0 {
            Rgb::new(1.0, 1.0 - tint, 1.0 - tint)
        } else {
            Rgb::new(1.0 + tint, 1.0 + tint, 1.0)
        }
    }

    fn drain_players(&mut self, touching: &[EntityId], dt: f32, report: &mut StepReport) {
        for &player in touching {
            if !self.store.is_live(player) {
                continue;
            }
            let Some(entry) = self.roster.get_mut(player) else {
                continue;
            };
            entry.drain_timeout -= dt;
            if entry.drain_timeout > 0.0 {
                continue;
            }
            entry.drain_timeout = self.cfg.drain_interval;
            let amount = drain_amount(entry.score, self.cfg.drain_factor);
            if amount == 0 {
                continue;
            }
            entry.score -= amount;

            let diameter = star_diameter_for_area(amount);
            let star = if diameter > self.cfg.min_drain_star_diameter {
                match self.spawn_drained_star(player, diameter) {
                    Ok(id) => {
                        report.stars_spawned += 1;
                        Some(id)
                    }
                    Err(e) => {
                        debug!(player = %player, error = %e, "drained star skipped");
                        None
                    }
                }
            } else {
                None
            };
            report.drains.push(Drain {
                player,
                amount,
                star,
            });
        }
    }

    fn spawn_drained_star(&mut self, player: EntityId, diameter: f32) -> Result<EntityId, CapacityExceeded> {
        let dir = self.random_direction();
        let owner = *self.store.get(player);
        let offset = Vec2::new(
            dir.x * 0.5 * (owner.dimension.x + diameter),
            dir.y * 0.5 * (owner.dimension.y + diameter),
        );
        let color = self.star_color();
        let id = self.store.add_entity()?;
        let rec = self.store.get_mut(id);
        rec.kind = Kind::Star;
        rec.collision_enabled = true;
        rec.dimension = Vec2::new(diameter, diameter);
        rec.position = owner.position + offset;
        rec.velocity = dir * self.cfg.drained_star_speed;
        rec.lifetime = self.cfg.drained_star_lifetime;
        rec.color = color;
        Ok(id)
    }

    fn expire(&mut self, dt: f32) -> usize {
        let mut expired = 0;
        for id in self.live_ids() {
            let rec = self.store.get_mut(id);
            if rec.lifetime > 0.0 {
                rec.lifetime -= dt;
                if rec.lifetime <= 0.0 {
                    rec.in_use = false;
                    expired += 1;
                }
            }
        }
        expired
    }

    fn tick_cooldowns(&mut self, dt: f32) {
        for entry in self.roster.iter_mut() {
            entry.shoot_cooldown = (entry.shoot_cooldown - dt).max(0.0);
        }
    }

    fn advance_round(&mut self, dt: f32) -> Option<RoundResult> {
        if self.cfg.round_secs <= 0.0 {
            return None;
        }
        self.round_remaining -= dt;
        if self.round_remaining > 0.0 {
            return None;
        }
        let result = RoundResult {
            winner: self.roster.leader().map(|e| e.username.clone()),
            score: self.roster.leader().map_or(0, |e| e.score),
        };
        info!(winner = ?result.winner, score = result.score, "round over");
        self.roster.reset_scores();
        self.round_remaining = self.cfg.round_secs;
        Some(result)
    }

    /// Random unit vector.
    fn random_direction(&mut self) -> Vec2 {
        loop {
            let v = Vec2::new(self.rng.gen_range(-1.0..1.0), self.rng.gen_range(-1.0..1.0));
            if let Some(n) = v.try_normalize() {
                return n;
            }
        }
    }

    /// Claims a slot and places a circle of `diameter` where it touches
    /// nothing collidable, trying a bounded number of random points.
    fn spawn_free(
        &mut self,
        kind: Kind,
        diameter: f32,
        speed: f32,
        texture: u16,
    ) -> Result<EntityId, CapacityExceeded> {
        let id = self.store.add_entity()?;
        let radius = 0.5 * diameter;
        let reach = Vec2::new(
            (self.bounds.half.x - radius).max(0.0),
            (self.bounds.half.y - radius).max(0.0),
        );
        let mut position = Vec2::ZERO;
        for attempt in 0..MAX_SPAWN_ATTEMPTS {
            position = Vec2::new(
                self.rng.gen_range(-reach.x..=reach.x),
                self.rng.gen_range(-reach.y..=reach.y),
            );
            if !self.store.is_occupied(position, radius) {
                break;
            }
            if attempt + 1 == MAX_SPAWN_ATTEMPTS {
                debug!(?kind, "no free spawn point found, placing anyway");
            }
        }
        let velocity = if speed > 0.0 {
            self.random_direction() * speed
        } else {
            Vec2::ZERO
        };
        let rec = self.store.get_mut(id);
        rec.kind = kind;
        rec.dimension = Vec2::new(diameter, diameter);
        rec.position = position;
        rec.velocity = velocity;
        rec.tex_index = texture;
        rec.collision_enabled = true;
        Ok(id)
    }

    /// Snapshot of the current frame with the leaderboard.
    pub fn full_update(&self) -> FullUpdate {
        FullUpdate {
            leaderboard: self
                .roster
                .entries()
                .iter()
                .map(|e| LeaderboardRow {
                    username: e.username.clone(),
                    score: e.score,
                    player: e.player,
                })
                .collect(),
            remaining_secs: self.round_remaining.max(0.0),
            entities: self.store.current().to_vec(),
        }
    }
}

fn collidable(rec: &EntityRecord) -> bool {
    rec.in_use && rec.collision_enabled
}

/// Rejects non-finite directions and shortens anything longer than unit.
fn clamp_direction(dir: Vec2) -> Option<Vec2> {
    if !dir.is_finite() {
        return None;
    }
    if dir.len_sq() > 1.0 {
        dir.try_normalize()
    } else {
        Some(dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const DT: f32 = 0.03;

    fn quiet_config() -> SimConfig {
        SimConfig {
            entity_capacity: 64,
            history_depth: 64,
            min_stars: 0,
            trap_count: 0,
            round_secs: 0.0,
            seed: Some(42),
            ..SimConfig::default()
        }
    }

    fn place(world: &mut World, kind: Kind, pos: Vec2, diameter: f32) -> EntityId {
        let id = world.store_mut().add_entity().unwrap();
        let rec = world.store_mut().get_mut(id);
        rec.kind = kind;
        rec.position = pos;
        rec.dimension = Vec2::new(diameter, diameter);
        rec.collision_enabled = true;
        id
    }

    fn player_at(world: &mut World, pos: Vec2) -> EntityId {
        let id = world.add_player("tester").unwrap();
        world.store_mut().get_mut(id).position = pos;
        id
    }

    #[test]
    fn bullets_destroy_each_other() {
        let mut world = World::new(quiet_config());
        let a = place(&mut world, Kind::Bullet, Vec2::new(0.0, 0.0), 10.0);
        let b = place(&mut world, Kind::Bullet, Vec2::new(4.0, 0.0), 10.0);
        let report = world.step(DT);
        assert!(!world.store().get(a).in_use);
        assert!(!world.store().get(b).in_use);
        assert_eq!(report.bullets_removed, 2);
    }

    #[test]
    fn bullet_hit_reverses_player() {
        let mut world = World::new(quiet_config());
        let p = player_at(&mut world, Vec2::new(0.0, 0.0));
        let b = place(&mut world, Kind::Bullet, Vec2::new(30.0, 0.0), 10.0);
        world.step(DT);
        assert!(!world.store().get(b).in_use);
        // The hit tick sets the countdown; rewinding starts next tick.
        assert_eq!(world.store().get(p).reversed_remaining, 2.0);
    }

    #[test]
    fn bumping_players_both_rewind() {
        let mut world = World::new(quiet_config());
        let a = player_at(&mut world, Vec2::new(0.0, 0.0));
        let b = player_at(&mut world, Vec2::new(60.0, 0.0));
        world.step(DT);
        assert_eq!(world.store().get(a).reversed_remaining, 0.3);
        assert_eq!(world.store().get(b).reversed_remaining, 0.3);
    }

    #[test]
    fn collecting_star_scores_its_area() {
        let mut world = World::new(quiet_config());
        let p = player_at(&mut world, Vec2::ZERO);
        let s = place(&mut world, Kind::Star, Vec2::new(36.0, 0.0), 10.0);
        world.step(DT);
        assert!(!world.store().get(s).in_use);
        assert_eq!(world.roster().get(p).unwrap().score, star_value(5.0));
    }

    #[test]
    fn player_on_trap_is_drained() {
        let mut world = World::new(quiet_config());
        let p = player_at(&mut world, Vec2::ZERO);
        place(&mut world, Kind::Trap, Vec2::ZERO, 150.0);
        world.roster_mut().get_mut(p).unwrap().score = 100;
        let timer_before = world.roster().get(p).unwrap().drain_timeout;

        let first = world.step(DT);
        assert!(first.drains.is_empty());
        assert!(world.roster().get(p).unwrap().drain_timeout < timer_before);

        let mut drained = None;
        for _ in 0..10 {
            let report = world.step(DT);
            if let Some(d) = report.drains.first() {
                drained = Some(*d);
                break;
            }
        }
        let drain = drained.expect("timer should elapse within a few ticks");
        assert_eq!(drain.amount, 10);
        assert_eq!(world.roster().get(p).unwrap().score, 90);
        let star = world.store().get(drain.star.unwrap());
        assert!(star.in_use);
        assert_eq!(star.kind, Kind::Star);
        assert!(star.lifetime > 0.0);
    }

    #[test]
    fn tiny_drain_spawns_no_star() {
        let mut world = World::new(SimConfig {
            drain_interval: 0.01,
            ..quiet_config()
        });
        let p = player_at(&mut world, Vec2::ZERO);
        place(&mut world, Kind::Trap, Vec2::ZERO, 150.0);
        world.roster_mut().get_mut(p).unwrap().score = 3;
        let report = world.step(DT);
        assert_eq!(report.drains.len(), 1);
        assert_eq!(report.drains[0].amount, 1);
        assert_eq!(report.drains[0].star, None);
        assert_eq!(world.roster().get(p).unwrap().score, 2);
    }

    #[test]
    fn edge_bounce_flips_velocity_axis() {
        let mut world = World::new(quiet_config());
        let t = place(&mut world, Kind::Trap, Vec2::new(790.0, 0.0), 20.0);
        world.store_mut().get_mut(t).velocity = Vec2::new(50.0, 10.0);
        world.step(DT);
        let rec = world.store().get(t);
        assert_eq!(rec.position.x, 790.0);
        assert_eq!(rec.velocity, Vec2::new(-50.0, 10.0));
    }

    #[test]
    fn approaching_traps_bounce_apart() {
        let mut world = World::new(quiet_config());
        let a = place(&mut world, Kind::Trap, Vec2::new(-10.0, 0.0), 20.0);
        let b = place(&mut world, Kind::Trap, Vec2::new(10.0, 0.0), 20.0);
        world.store_mut().get_mut(a).velocity = Vec2::new(100.0, 0.0);
        world.store_mut().get_mut(b).velocity = Vec2::new(-100.0, 0.0);
        world.store_mut().archive_frame();
        world.step(DT);
        assert_eq!(world.store().get(a).velocity, Vec2::new(-100.0, 0.0));
        assert_eq!(world.store().get(b).velocity, Vec2::new(100.0, 0.0));
    }

    #[test]
    fn reversed_trap_pair_is_left_alone() {
        let mut world = World::new(quiet_config());
        let a = place(&mut world, Kind::Trap, Vec2::new(-5.0, 0.0), 20.0);
        let b = place(&mut world, Kind::Trap, Vec2::new(5.0, 0.0), 20.0);
        world.store_mut().get_mut(b).velocity = Vec2::new(-100.0, 0.0);
        for _ in 0..3 {
            world.store_mut().archive_frame();
        }
        world.store_mut().get_mut(a).reversed_remaining = 1.0;
        world.step(DT);
        assert!(world.store().get(a).is_reversed());
        assert_eq!(world.store().get(b).velocity, Vec2::new(-100.0, 0.0));
    }

    #[test]
    fn lifetime_expires_entities() {
        let mut world = World::new(quiet_config());
        let b = place(&mut world, Kind::Bullet, Vec2::ZERO, 10.0);
        world.store_mut().get_mut(b).lifetime = 0.05;
        world.step(DT);
        assert!(world.store().get(b).in_use);
        let report = world.step(DT);
        assert!(!world.store().get(b).in_use);
        assert_eq!(report.expired, 1);
    }

    #[test]
    fn frozen_player_ignores_commands() {
        let mut world = World::new(quiet_config());
        let p = player_at(&mut world, Vec2::ZERO);
        world.store_mut().get_mut(p).reversed_remaining = 1.0;
        let out = world.apply(p, ClientCommand::Steer(Vec2::new(1.0, 0.0))).unwrap();
        assert_eq!(out, CommandOutcome::Frozen);
        assert_eq!(world.store().get(p).velocity, Vec2::ZERO);
    }

    #[test]
    fn steer_normalizes_and_rejects_nan() {
        let mut world = World::new(quiet_config());
        let p = player_at(&mut world, Vec2::ZERO);
        world.apply(p, ClientCommand::Steer(Vec2::new(3.0, 4.0))).unwrap();
        let v = world.store().get(p).velocity;
        assert!((v.len() - 100.0).abs() < 1e-3);
        assert_eq!(
            world.apply(p, ClientCommand::Steer(Vec2::new(f32::NAN, 0.0))).unwrap(),
            CommandOutcome::InvalidDirection
        );
    }

    #[test]
    fn shoot_spawns_bullet_clear_of_shooter() {
        let mut world = World::new(quiet_config());
        let p = player_at(&mut world, Vec2::ZERO);
        let CommandOutcome::Shot(b) = world.apply(p, ClientCommand::Shoot(Vec2::new(1.0, 0.0))).unwrap()
        else {
            panic!("expected a bullet");
        };
        let bullet = world.store().get(b);
        assert_eq!(bullet.kind, Kind::Bullet);
        assert_eq!(bullet.position, Vec2::new(40.0, 0.0));
        assert_eq!(bullet.velocity, Vec2::new(300.0, 0.0));
        assert_eq!(bullet.lifetime, 2.0);
    }

    #[test]
    fn server_cooldown_limits_shots() {
        let mut world = World::new(SimConfig {
            shoot_cooldown_secs: 1.0,
            ..quiet_config()
        });
        let p = player_at(&mut world, Vec2::ZERO);
        let dir = Vec2::new(0.0, 1.0);
        assert!(matches!(world.apply(p, ClientCommand::Shoot(dir)), Ok(CommandOutcome::Shot(_))));
        assert_eq!(world.apply(p, ClientCommand::Shoot(dir)), Ok(CommandOutcome::CoolingDown));
    }

    #[test]
    fn unknown_player_command_is_an_error() {
        let mut world = World::new(quiet_config());
        assert_eq!(
            world.apply(EntityId(3), ClientCommand::Steer(Vec2::ZERO)),
            Err(SimError::UnknownPlayer(EntityId(3)))
        );
    }

    #[test]
    fn remove_player_frees_slot_and_session() {
        let mut world = World::new(quiet_config());
        let p = world.add_player("gone").unwrap();
        world.remove_player(p).unwrap();
        assert!(!world.store().is_live(p));
        assert!(world.roster().is_empty());
    }

    #[test]
    fn populate_spawns_traps_and_stars() {
        let mut world = World::new(SimConfig {
            entity_capacity: 128,
            trap_count: 4,
            min_stars: 20,
            seed: Some(1),
            ..SimConfig::default()
        });
        world.populate();
        assert_eq!(world.store().count_live(Kind::Trap), 4);
        assert_eq!(world.store().count_live(Kind::Star), 20);
        let traps: Vec<_> = world
            .store()
            .iter_live()
            .filter(|(_, r)| r.kind == Kind::Trap)
            .map(|(_, r)| *r)
            .collect();
        for (i, a) in traps.iter().enumerate() {
            for b in &traps[i + 1..] {
                assert!(!circles_overlap(a.position, a.radius(), b.position, b.radius()));
            }
        }
    }

    #[test]
    fn star_population_survives_full_table() {
        let mut world = World::new(SimConfig {
            entity_capacity: 4,
            min_stars: 10,
            ..quiet_config()
        });
        let report = world.step(DT);
        assert_eq!(report.stars_spawned, 4);
        assert_eq!(world.store().count_live(Kind::Star), 4);
    }

    #[test]
    fn global_rewind_turns_itself_off() {
        let mut world = World::new(quiet_config());
        assert!(!world.set_time_reverse(true));
        world.store_mut().archive_frame();
        world.step(DT);
        world.step(DT);
        assert!(world.set_time_reverse(true));
        assert!(world.step(DT).rewound);
        assert!(world.step(DT).rewound);
        assert!(!world.is_time_reversed());
        assert!(!world.step(DT).rewound);
    }

    #[test]
    fn round_end_resets_scores() {
        let mut world = World::new(SimConfig {
            round_secs: 0.05,
            ..quiet_config()
        });
        let p = player_at(&mut world, Vec2::ZERO);
        world.roster_mut().get_mut(p).unwrap().score = 7;
        assert_eq!(world.step(DT).round_over, None);
        let over = world.step(DT).round_over.unwrap();
        assert_eq!(over.winner.as_deref(), Some("tester"));
        assert_eq!(over.score, 7);
        assert_eq!(world.roster().get(p).unwrap().score, 0);
        assert!((world.round_remaining() - 0.05).abs() < 1e-6);
    }

    #[test]
    fn full_update_lists_leaderboard_in_order() {
        let mut world = World::new(quiet_config());
        let a = world.add_player("a").unwrap();
        let b = world.add_player("b").unwrap();
        world.roster_mut().get_mut(b).unwrap().score = 5;
        world.step(DT);
        let update = world.full_update();
        let order: Vec<_> = update.leaderboard.iter().map(|r| r.player).collect();
        assert_eq!(order, vec![b, a]);
        assert_eq!(update.entities.len(), 64);
    }

    proptest! {
        #[test]
        fn drain_never_overdraws(score in 0u32..1_000_000, factor in 0.0f32..=1.0) {
            let amount = drain_amount(score, factor);
            prop_assert!(amount <= score);
            if score > 0 {
                prop_assert!(amount >= 1);
            }
        }

        #[test]
        fn drained_area_comes_back_within_rounding(area in 1u32..100_000) {
            let radius = 0.5 * star_diameter_for_area(area);
            let back = star_value(radius);
            prop_assert!(back <= area + 1);
            prop_assert!(back + 1 >= area);
        }

        #[test]
        fn step_counts_a_star_pair_exactly_when_circles_touch(
            ax in -100.0f32..100.0, ay in -100.0f32..100.0,
            bx in -100.0f32..100.0, by in -100.0f32..100.0,
            da in 1.0f32..50.0, db in 1.0f32..50.0,
        ) {
            let dx = f64::from(ax) - f64::from(bx);
            let dy = f64::from(ay) - f64::from(by);
            let dist = (dx * dx + dy * dy).sqrt();
            let reach = f64::from(0.5 * da) + f64::from(0.5 * db);
            prop_assume!((dist - reach).abs() > 1e-2);

            let mut world = World::new(quiet_config());
            let a = place(&mut world, Kind::Star, Vec2::new(ax, ay), da);
            let b = place(&mut world, Kind::Star, Vec2::new(bx, by), db);
            let report = world.step(DT);

            prop_assert_eq!(report.collisions, usize::from(dist <= reach));
            // Stars pass through each other untouched.
            prop_assert_eq!(world.store().get(a).position, Vec2::new(ax, ay));
            prop_assert_eq!(world.store().get(b).position, Vec2::new(bx, by));
        }

        #[test]
        fn global_rewind_then_forward_is_exact(n in 1usize..20, seed in any::<u64>()) {
            let mut world = World::new(SimConfig {
                entity_capacity: 32,
                history_depth: 64,
                trap_count: 6,
                min_stars: 0,
                round_secs: 0.0,
                seed: Some(seed),
                ..SimConfig::default()
            });
            world.populate();
            for _ in 0..n {
                world.step(DT);
            }
            let before = world.store().current().to_vec();

            prop_assert!(world.set_time_reverse(true));
            for _ in 0..n {
                prop_assert!(world.step(DT).rewound);
            }
            prop_assert!(!world.is_time_reversed());
            for _ in 0..n {
                world.step(DT);
            }
            prop_assert_eq!(world.store().current(), &before[..]);
        }
    }
}
