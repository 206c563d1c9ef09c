//! Combat system - projectiles, wall bounces, hit detection, damage

use serde::{Deserialize, Serialize};

use crate::ws::protocol::{AudioCue, ServerMsg};

use super::geometry::{heading_vector, Point};
use super::maze::Maze;
use super::physics::{PhysicsSystem, Ultimate, VehicleStats, WallContact};
use super::session::Vehicle;

/// Projectile speed in pixels per tick
pub const BULLET_SPEED: f64 = 3.0;

/// Projectile lifetime in milliseconds
pub const BULLET_TTL_MS: u64 = 10_000;

/// Ticks before a fresh projectile can hit anything
pub const ACTIVATION_TICKS: u32 = 3;

/// Fire-rate multiplier while a barrage ultimate is active
pub const BARRAGE_FIRE_MULTIPLIER: u64 = 3;

/// Live projectile
#[derive(Debug, Clone)]
pub struct Projectile {
    pub id: String,
    pub owner: String,
    pub position: Point,
    pub velocity: Point,
    /// Ticks left before the projectile can register a hit
    pub activation: u32,
    /// Unix millis at creation
    pub created_at: u64,
    pub demolition: bool,
}

impl Projectile {
    pub fn new(
        id: String,
        owner: String,
        position: Point,
        heading: f64,
        demolition: bool,
        now: u64,
    ) -> Self {
        Self {
            id,
            owner,
            position,
            velocity: heading_vector(heading, BULLET_SPEED),
            activation: ACTIVATION_TICKS,
            created_at: now,
            demolition,
        }
    }

    pub fn is_expired(&self, now: u64) -> bool {
        now.saturating_sub(self.created_at) > BULLET_TTL_MS
    }

    pub fn is_active(&self) -> bool {
        self.activation == 0
    }

    pub fn reflect(&mut self, flip_x: bool, flip_y: bool) {
        if flip_x {
            self.velocity.x = -self.velocity.x;
        }
        if flip_y {
            self.velocity.y = -self.velocity.y;
        }
    }

    /// Move one tick and count down activation
    pub fn advance(&mut self) {
        self.position = self.position + self.velocity;
        self.activation = self.activation.saturating_sub(1);
    }

    /// Current heading in degrees, 0..360, in the clockwise screen convention
    pub fn heading(&self) -> f64 {
        (-self.velocity.arg().to_degrees()).rem_euclid(360.0)
    }

    pub fn snapshot(&self) -> BulletSnapshot {
        BulletSnapshot {
            id: self.id.clone(),
            position: self.position,
            heading: self.heading(),
            demolition: self.demolition,
        }
    }
}

/// Projectile state in a game update
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulletSnapshot {
    pub id: String,
    pub position: Point,
    pub heading: f64,
    pub demolition: bool,
}

/// Hit result from combat resolution
#[derive(Debug, Clone, PartialEq)]
pub struct HitResult {
    pub projectile_id: String,
    pub shooter: String,
    pub target: String,
    /// Damage was absorbed by an ultimate
    pub shielded: bool,
    pub target_destroyed: bool,
}

/// Combat system for managing projectiles and damage
pub struct CombatSystem;

impl CombatSystem {
    /// Check if a vehicle may fire again
    pub fn can_fire(
        last_fired_at: Option<u64>,
        now: u64,
        stats: &VehicleStats,
        ultimate_active: bool,
    ) -> bool {
        let interval = if ultimate_active && stats.ultimate == Ultimate::Barrage {
            stats.fire_interval_ms() / BARRAGE_FIRE_MULTIPLIER
        } else {
            stats.fire_interval_ms()
        };
        match last_fired_at {
            Some(last) => now.saturating_sub(last) >= interval,
            None => true,
        }
    }

    /// Whether an active ultimate makes the vehicle immune to hits
    pub fn is_shielded(stats: &VehicleStats, ultimate_active: bool) -> bool {
        ultimate_active && stats.ultimate == Ultimate::Shield
    }

    /// Whether a shot fired now should break walls
    pub fn fires_demolition(stats: &VehicleStats, ultimate_active: bool, requested: bool) -> bool {
        requested || (ultimate_active && stats.ultimate == Ultimate::Demolition)
    }

    /// Apply one hit of damage, returns (new_health, is_dead)
    pub fn apply_damage(current_health: u32) -> (u32, bool) {
        let new_health = current_health.saturating_sub(1);
        (new_health, new_health == 0)
    }

    /// Advance every projectile one tick against the maze and the roster.
    ///
    /// Returns the outbound notifications produced (audio cues, wall
    /// removals) and the hits registered, in order.
    pub fn resolve_tick(
        maze: &mut Maze,
        projectiles: &mut Vec<Projectile>,
        vehicles: &mut [Vehicle],
        now: u64,
    ) -> (Vec<ServerMsg>, Vec<HitResult>) {
        let mut events = Vec::new();
        let mut hits = Vec::new();

        projectiles.retain_mut(|projectile| {
            if projectile.is_expired(now) {
                return false;
            }

            match PhysicsSystem::wall_contact(
                maze,
                projectile.position,
                projectile.velocity,
                projectile.demolition,
            ) {
                WallContact::Clear => {}
                WallContact::Bounce { flip_x, flip_y } => {
                    projectile.reflect(flip_x, flip_y);
                    events.push(ServerMsg::Audio { cue: AudioCue::Bounce });
                }
                WallContact::Demolish { column, row, side } => {
                    if maze.remove_wall(column, row, side) {
                        events.push(ServerMsg::WallDestroyed { column, row, side });
                        events.push(ServerMsg::Audio { cue: AudioCue::WallDestroyed });
                    }
                    return false;
                }
                WallContact::OutOfBounds => return false,
            }

            projectile.advance();
            if !projectile.is_active() {
                return true;
            }

            for vehicle in vehicles.iter_mut().filter(|v| v.alive) {
                let stats = VehicleStats::for_type(vehicle.vehicle_type);
                if !PhysicsSystem::point_hits_vehicle(
                    &stats,
                    vehicle.position,
                    vehicle.heading,
                    projectile.position,
                ) {
                    continue;
                }

                let shielded = Self::is_shielded(&stats, vehicle.ultimate_active);
                let mut target_destroyed = false;
                if !shielded {
                    let (health, dead) = Self::apply_damage(vehicle.health);
                    vehicle.health = health;
                    if dead {
                        vehicle.alive = false;
                        target_destroyed = true;
                    }
                    let cue = if dead { AudioCue::Destroyed } else { AudioCue::Hit };
                    events.push(ServerMsg::Audio { cue });
                }

                hits.push(HitResult {
                    projectile_id: projectile.id.clone(),
                    shooter: projectile.owner.clone(),
                    target: vehicle.gamer_name.clone(),
                    shielded,
                    target_destroyed,
                });
                return false;
            }

            true
        });

        (events, hits)
    }
}
