//! Vehicle archetype stats, hitboxes, and projectile/wall bounce physics

use serde::Serialize;

use crate::ws::protocol::VehicleType;

use super::geometry::{heading_radians, polygon_contains, rotate_point, Point, Segment};
use super::maze::{Maze, Side};

/// Ratio between the rendered vehicle and its hitbox
pub const HITBOX_SCALE: f64 = 0.75;

/// Ultimate ability granted by an archetype
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Ultimate {
    /// Faster movement (client-side only)
    Overdrive,
    /// Rapid fire (client-side only)
    Barrage,
    /// Immune to hits while active
    Shield,
    /// Shots destroy the first wall they meet
    Demolition,
}

/// Static per-archetype stats
#[derive(Debug, Clone, Copy, Serialize)]
pub struct VehicleStats {
    pub vehicle_type: VehicleType,
    pub max_health: u32,
    /// Movement speed, pixels per tick
    pub move_speed: f64,
    /// Turn speed, degrees per tick
    pub turn_speed: f64,
    /// Shots per second
    pub fire_rate: f64,
    pub turret_length: f64,
    /// Coarse pre-filter radius for hit tests
    pub length: f64,
    pub ultimate: Ultimate,
    /// Convex hull in the local frame, nose toward -y
    pub hitbox: &'static [Point],
    /// Local-frame point that maps onto the vehicle's world position
    pub center: Point,
}

const STANDARD_HULL: [Point; 4] = [
    Point::new(-18.0, -24.0),
    Point::new(18.0, -24.0),
    Point::new(18.0, 24.0),
    Point::new(-18.0, 24.0),
];

const SCOUT_HULL: [Point; 5] = [
    Point::new(0.0, -26.0),
    Point::new(16.0, -4.0),
    Point::new(14.0, 22.0),
    Point::new(-14.0, 22.0),
    Point::new(-16.0, -4.0),
];

const BULWARK_HULL: [Point; 8] = [
    Point::new(-14.0, -30.0),
    Point::new(14.0, -30.0),
    Point::new(24.0, -18.0),
    Point::new(24.0, 22.0),
    Point::new(14.0, 30.0),
    Point::new(-14.0, 30.0),
    Point::new(-24.0, 22.0),
    Point::new(-24.0, -18.0),
];

const SAPPER_HULL: [Point; 6] = [
    Point::new(0.0, -28.0),
    Point::new(20.0, -14.0),
    Point::new(20.0, 18.0),
    Point::new(0.0, 28.0),
    Point::new(-20.0, 18.0),
    Point::new(-20.0, -14.0),
];

impl VehicleStats {
    pub fn for_type(vehicle_type: VehicleType) -> Self {
        match vehicle_type {
            VehicleType::Standard => Self {
                vehicle_type,
                max_health: 3,
                move_speed: 2.0,
                turn_speed: 3.0,
                fire_rate: 2.0,
                turret_length: 28.0,
                length: 40.0,
                ultimate: Ultimate::Overdrive,
                hitbox: &STANDARD_HULL,
                center: Point::ZERO,
            },
            VehicleType::Scout => Self {
                vehicle_type,
                max_health: 2,
                move_speed: 2.6,
                turn_speed: 4.0,
                fire_rate: 3.0,
                turret_length: 22.0,
                length: 36.0,
                ultimate: Ultimate::Barrage,
                hitbox: &SCOUT_HULL,
                center: Point::ZERO,
            },
            VehicleType::Bulwark => Self {
                vehicle_type,
                max_health: 5,
                move_speed: 1.4,
                turn_speed: 2.0,
                fire_rate: 1.2,
                turret_length: 34.0,
                length: 48.0,
                ultimate: Ultimate::Shield,
                hitbox: &BULWARK_HULL,
                center: Point::ZERO,
            },
            VehicleType::Sapper => Self {
                vehicle_type,
                max_health: 3,
                move_speed: 1.8,
                turn_speed: 2.6,
                fire_rate: 1.5,
                turret_length: 30.0,
                length: 42.0,
                ultimate: Ultimate::Demolition,
                hitbox: &SAPPER_HULL,
                center: Point::ZERO,
            },
        }
    }

    /// Minimum time between two shots, in milliseconds
    pub fn fire_interval_ms(&self) -> u64 {
        (1000.0 / self.fire_rate) as u64
    }
}

fn closed_ring(vertices: &[Point]) -> Vec<Segment> {
    let n = vertices.len();
    (0..n)
        .map(|i| Segment::new(vertices[i], vertices[(i + 1) % n]))
        .collect()
}

/// Result of a wall test for one projectile step
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WallContact {
    /// Nothing in the way
    Clear,
    /// Reflect the listed axes
    Bounce { flip_x: bool, flip_y: bool },
    /// Demolition shot meets an interior wall
    Demolish { column: usize, row: usize, side: Side },
    /// Projectile has left the grid
    OutOfBounds,
}

/// Physics helpers for hitboxes and wall contact
pub struct PhysicsSystem;

impl PhysicsSystem {
    /// Hull edges placed in the world: rotated by `heading - 90` about the
    /// archetype center, scaled to hitbox size, and moved to `position`
    pub fn world_hitbox(stats: &VehicleStats, position: Point, heading: f64) -> Vec<Segment> {
        let theta = heading_radians(heading - 90.0);
        let placed: Vec<Point> = stats
            .hitbox
            .iter()
            .map(|v| {
                let rotated = rotate_point(*v, stats.center, theta);
                (rotated - stats.center).scale(HITBOX_SCALE) + position
            })
            .collect();
        closed_ring(&placed)
    }

    /// Precise hit test with a distance pre-filter
    pub fn point_hits_vehicle(
        stats: &VehicleStats,
        position: Point,
        heading: f64,
        point: Point,
    ) -> bool {
        if point.distance(position) >= stats.length {
            return false;
        }
        polygon_contains(&Self::world_hitbox(stats, position, heading), point)
    }

    /// Check whether a projectile at `position` moving by `velocity` this tick
    /// touches a wall of the room it is in.
    ///
    /// Face walls are tested per axis first; only when neither axis bounces
    /// are the diagonal corners considered. Both corner walls present flips
    /// both axes, a single one flips the axis it blocks.
    pub fn wall_contact(maze: &Maze, position: Point, velocity: Point, demolition: bool) -> WallContact {
        let Some((column, row)) = maze.locate(position.x, position.y) else {
            return WallContact::OutOfBounds;
        };
        let Some(room) = maze.room(column, row) else {
            return WallContact::OutOfBounds;
        };

        let step = f64::from(maze.step);
        let left = column as f64 * step;
        let right = left + step;
        let top = row as f64 * step;
        let bottom = top + step;
        let next = position + velocity;

        let x_side = if velocity.x > 0.0 && next.x >= right {
            Some(Side::PlusX)
        } else if velocity.x < 0.0 && next.x <= left {
            Some(Side::MinusX)
        } else {
            None
        };
        let y_side = if velocity.y > 0.0 && next.y >= bottom {
            Some(Side::PlusY)
        } else if velocity.y < 0.0 && next.y <= top {
            Some(Side::MinusY)
        } else {
            None
        };

        let hit_x = x_side.filter(|side| room.has_wall(*side));
        let hit_y = y_side.filter(|side| room.has_wall(*side));

        for side in [hit_x, hit_y].into_iter().flatten() {
            if demolition && maze.neighbor(column, row, side).is_some() {
                return WallContact::Demolish { column, row, side };
            }
        }

        if hit_x.is_some() || hit_y.is_some() {
            return WallContact::Bounce {
                flip_x: hit_x.is_some(),
                flip_y: hit_y.is_some(),
            };
        }

        // Corner: both boundaries crossed through open sides. The step then
        // runs along one of the diagonal room's corner walls.
        if let (Some(sx), Some(sy)) = (x_side, y_side) {
            let diagonal = maze
                .neighbor(column, row, sx)
                .and_then(|(c, r)| maze.neighbor(c, r, sy))
                .and_then(|(c, r)| maze.room(c, r).map(|room| (c, r, room)));
            if let Some((diagonal_column, diagonal_row, diagonal)) = diagonal {
                let wall_x = diagonal.has_wall(sx.opposite());
                let wall_y = diagonal.has_wall(sy.opposite());
                if wall_x && wall_y {
                    return WallContact::Bounce { flip_x: true, flip_y: true };
                }

                // Fraction of the step at which each boundary is crossed.
                // Crossing x first means the y crossing happens beside the
                // diagonal room, along its y-facing wall, and vice versa.
                let boundary_x = if sx == Side::PlusX { right } else { left };
                let boundary_y = if sy == Side::PlusY { bottom } else { top };
                let t_x = (boundary_x - position.x) / velocity.x;
                let t_y = (boundary_y - position.y) / velocity.y;

                let blocking = if wall_y && t_x <= t_y {
                    Some(sy.opposite())
                } else if wall_x && t_y <= t_x {
                    Some(sx.opposite())
                } else {
                    None
                };
                if let Some(side) = blocking {
                    if demolition
                        && maze.neighbor(diagonal_column, diagonal_row, side).is_some()
                    {
                        return WallContact::Demolish {
                            column: diagonal_column,
                            row: diagonal_row,
                            side,
                        };
                    }
                    let flip_x = side == sx.opposite();
                    return WallContact::Bounce { flip_x, flip_y: !flip_x };
                }
            }
        }

        WallContact::Clear
    }
}
