//! Snapshot building for network transmission

use crate::ws::protocol::ServerMsg;

use super::combat::Projectile;
use super::maze::Maze;
use super::session::Vehicle;

/// Builds full-state snapshots. Rosters are small (at most four vehicles),
/// so every update carries the whole roster rather than deltas.
pub struct SnapshotBuilder;

impl SnapshotBuilder {
    /// Roster in join order
    pub fn roster(vehicles: &[Vehicle]) -> ServerMsg {
        ServerMsg::Roster {
            vehicles: vehicles.to_vec(),
        }
    }

    pub fn maze(maze: &Maze) -> ServerMsg {
        ServerMsg::Maze { maze: maze.clone() }
    }

    /// Per-tick update: roster plus every live projectile
    pub fn game_update(tick: u64, vehicles: &[Vehicle], projectiles: &[Projectile]) -> ServerMsg {
        ServerMsg::GameUpdate {
            tick,
            vehicles: vehicles.to_vec(),
            bullets: projectiles.iter().map(Projectile::snapshot).collect(),
        }
    }
}
