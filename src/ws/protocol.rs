//! WebSocket protocol message definitions
//! These are the wire types for client-server communication

use serde::{Deserialize, Serialize};

use crate::game::combat::BulletSnapshot;
use crate::game::geometry::Point;
use crate::game::maze::{Maze, Side};
use crate::game::session::{RoundState, Vehicle};

/// Vehicle archetypes available in the game, numbered as the clients number them
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum VehicleType {
    /// Balanced stats
    Standard = 1,
    /// Fast but fragile
    Scout = 2,
    /// Slow, heavily armoured, shield ultimate
    Bulwark = 3,
    /// Wall-breaking ultimate
    Sapper = 4,
}

impl VehicleType {
    pub const ALL: [VehicleType; 4] = [
        VehicleType::Standard,
        VehicleType::Scout,
        VehicleType::Bulwark,
        VehicleType::Sapper,
    ];
}

impl TryFrom<u8> for VehicleType {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Standard),
            2 => Ok(Self::Scout),
            3 => Ok(Self::Bulwark),
            4 => Ok(Self::Sapper),
            other => Err(format!("unknown vehicle type {other}")),
        }
    }
}

impl From<VehicleType> for u8 {
    fn from(value: VehicleType) -> Self {
        value as u8
    }
}

/// Sound cues relayed to the presentation layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioCue {
    Fire,
    Bounce,
    Hit,
    Destroyed,
    WallDestroyed,
    Ultimate,
}

/// Messages sent from client to server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMsg {
    /// Bind this connection to a roster entry. Must be the first message.
    Introduce { gamer_name: String },

    /// Live transform of the sender's vehicle
    VehicleUpdate {
        position: Point,
        /// Hull heading in degrees
        heading: f64,
        /// Turret heading in degrees
        turret_heading: f64,
        ultimate_active: bool,
    },

    /// A shot fired by the sender
    FireBullet {
        id: String,
        /// Spawn point; defaults to the turret tip
        #[serde(default)]
        position: Option<Point>,
        heading: f64,
        #[serde(default)]
        demolition: bool,
    },

    /// Client-side expiry of a shot it fired
    ExpireBullet { id: String },

    /// Waiting-room vehicle selection
    LobbyUpdate { vehicle_type: VehicleType },

    Chat { text: String },

    PlayAudio { cue: AudioCue },

    /// Admin request to begin a round
    StartRound,
}

/// Messages sent from server to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMsg {
    /// Full roster snapshot
    Roster { vehicles: Vec<Vehicle> },

    /// Full maze snapshot
    Maze { maze: Maze },

    /// Per-tick state while a round is running
    GameUpdate {
        tick: u64,
        vehicles: Vec<Vehicle>,
        bullets: Vec<BulletSnapshot>,
    },

    /// Round state transition
    RoundState { state: RoundState },

    /// A demolition shot removed a wall
    WallDestroyed { column: usize, row: usize, side: Side },

    Audio { cue: AudioCue },

    Chat { gamer_name: String, text: String },

    /// Error message
    Error { code: String, message: String },
}
