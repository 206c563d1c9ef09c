//! Session state machine and authoritative round loop

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, MutexGuard};
use tokio::time::{interval, sleep, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::GameSettings;
use crate::util::time::unix_millis;
use crate::ws::protocol::{AudioCue, ServerMsg, VehicleType};

use super::combat::{CombatSystem, Projectile};
use super::geometry::{heading_vector, Point};
use super::maze::{Maze, MazeError};
use super::physics::VehicleStats;
use super::snapshot::SnapshotBuilder;

/// Roster capacity of a session
pub const MAX_VEHICLES: usize = 4;

/// Error code broadcast when a session is torn down
pub const SESSION_CLOSED: &str = "session_closed";

/// Round state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundState {
    /// Roster assembly
    Waiting,
    /// Maze and start positions sent, play about to begin
    Countdown,
    /// Live simulation
    Running,
}

/// Per-player vehicle (authoritative roster entry)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vehicle {
    pub gamer_name: String,
    pub vehicle_type: VehicleType,
    pub admin: bool,
    pub alive: bool,
    pub health: u32,
    pub position: Point,
    /// Hull heading in degrees
    pub heading: f64,
    /// Turret heading in degrees
    pub turret_heading: f64,
    pub ultimate_active: bool,
    /// Color slot, 1..=4
    pub color: u8,
    /// Rounds won
    pub score: u32,
}

impl Vehicle {
    pub fn new(gamer_name: String, vehicle_type: VehicleType, color: u8) -> Self {
        Self {
            gamer_name,
            vehicle_type,
            admin: false,
            alive: false,
            health: VehicleStats::for_type(vehicle_type).max_health,
            position: Point::ZERO,
            heading: 0.0,
            turret_heading: 0.0,
            ultimate_active: false,
            color,
            score: 0,
        }
    }

    pub fn stats(&self) -> VehicleStats {
        VehicleStats::for_type(self.vehicle_type)
    }
}

/// Client-submitted transform for a vehicle
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VehicleIntent {
    pub position: Point,
    pub heading: f64,
    pub turret_heading: f64,
    pub ultimate_active: bool,
}

/// A fire event from a client
#[derive(Debug, Clone, PartialEq)]
pub struct FireRequest {
    pub id: String,
    /// Spawn point; the turret tip when absent
    pub position: Option<Point>,
    pub heading: f64,
    pub demolition: bool,
}

/// Decides whether a client-submitted transform is applied
pub trait IntentPolicy: Send + Sync {
    fn accept(&self, maze: &Maze, vehicle: &Vehicle, intent: &VehicleIntent) -> bool;
}

/// Applies every submitted transform as given
#[derive(Debug, Default, Clone, Copy)]
pub struct TrustClient;

impl IntentPolicy for TrustClient {
    fn accept(&self, _maze: &Maze, _vehicle: &Vehicle, _intent: &VehicleIntent) -> bool {
        true
    }
}

/// Rejects transforms that are non-finite or leave the arena
#[derive(Debug, Default, Clone, Copy)]
pub struct BoundedIntent;

impl IntentPolicy for BoundedIntent {
    fn accept(&self, maze: &Maze, _vehicle: &Vehicle, intent: &VehicleIntent) -> bool {
        let p = intent.position;
        p.x.is_finite()
            && p.y.is_finite()
            && intent.heading.is_finite()
            && intent.turret_heading.is_finite()
            && (0.0..=f64::from(maze.width)).contains(&p.x)
            && (0.0..=f64::from(maze.height)).contains(&p.y)
    }
}

/// Session-level failures
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SessionError {
    #[error("That gamer name is already taken.")]
    NameTaken,

    #[error("This game already has 4 players.")]
    RosterFull,

    #[error("A round is already in progress.")]
    RoundInProgress,

    #[error("Unknown vehicle type {0}.")]
    UnknownVehicle(u8),

    #[error("No player named {0} in this game.")]
    UnknownGamer(String),

    #[error("That player is already connected.")]
    AlreadyConnected,

    #[error("Only the game admin can start a round.")]
    NotAdmin,

    #[error("Maze generation failed: {0}")]
    Maze(#[from] MazeError),
}

impl SessionError {
    /// Whether the error is a server fault rather than bad input
    pub fn is_internal(&self) -> bool {
        matches!(self, SessionError::Maze(_))
    }

    /// Short machine-readable code for error notices
    pub fn code(&self) -> &'static str {
        match self {
            SessionError::NameTaken => "name_taken",
            SessionError::RosterFull => "roster_full",
            SessionError::RoundInProgress => "round_in_progress",
            SessionError::UnknownVehicle(_) => "unknown_vehicle",
            SessionError::UnknownGamer(_) => "unknown_gamer",
            SessionError::AlreadyConnected => "already_connected",
            SessionError::NotAdmin => "not_admin",
            SessionError::Maze(_) => "internal",
        }
    }
}

/// Session state (guarded by the session lock)
pub struct Session {
    code: String,
    settings: GameSettings,
    /// Join order, never re-sorted
    roster: Vec<Vehicle>,
    /// Bound websocket connections -> gamer name
    connections: HashMap<Uuid, String>,
    /// Joined vehicles that have not bound a connection yet
    unbound: HashMap<String, Instant>,
    /// Occupied color slots, index 0 is color 1
    colors: [bool; MAX_VEHICLES],
    round_state: RoundState,
    maze: Maze,
    projectiles: Vec<Projectile>,
    last_shot: HashMap<String, u64>,
    tick: u64,
    rng: ChaCha8Rng,
    policy: Arc<dyn IntentPolicy>,
    outbound: broadcast::Sender<ServerMsg>,
    vehicle_count: Arc<AtomicUsize>,
    closed: bool,
}

impl Session {
    pub fn new(
        code: String,
        settings: GameSettings,
        policy: Arc<dyn IntentPolicy>,
        seed: u64,
        outbound: broadcast::Sender<ServerMsg>,
    ) -> Result<Self, SessionError> {
        let maze = Maze::open(settings.maze_width, settings.maze_height, settings.maze_step)?;
        Ok(Self {
            code,
            settings,
            roster: Vec::new(),
            connections: HashMap::new(),
            unbound: HashMap::new(),
            colors: [false; MAX_VEHICLES],
            round_state: RoundState::Waiting,
            maze,
            projectiles: Vec::new(),
            last_shot: HashMap::new(),
            tick: 0,
            rng: ChaCha8Rng::seed_from_u64(seed),
            policy,
            outbound,
            vehicle_count: Arc::new(AtomicUsize::new(0)),
            closed: false,
        })
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn round_state(&self) -> RoundState {
        self.round_state
    }

    pub fn roster(&self) -> &[Vehicle] {
        &self.roster
    }

    pub fn maze(&self) -> &Maze {
        &self.maze
    }

    pub fn projectiles(&self) -> &[Projectile] {
        &self.projectiles
    }

    pub fn vehicle(&self, gamer_name: &str) -> Option<&Vehicle> {
        self.roster.iter().find(|v| v.gamer_name == gamer_name)
    }

    fn vehicle_mut(&mut self, gamer_name: &str) -> Option<&mut Vehicle> {
        self.roster.iter_mut().find(|v| v.gamer_name == gamer_name)
    }

    pub fn is_empty(&self) -> bool {
        self.roster.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn is_admin(&self, gamer_name: &str) -> bool {
        self.vehicle(gamer_name).is_some_and(|v| v.admin)
    }

    pub fn alive_count(&self) -> usize {
        self.roster.iter().filter(|v| v.alive).count()
    }

    /// Send to every subscriber; a session with no listeners drops the message
    fn broadcast(&self, msg: ServerMsg) {
        let _ = self.outbound.send(msg);
    }

    fn broadcast_roster(&self) {
        self.broadcast(SnapshotBuilder::roster(&self.roster));
    }

    /// Add a vehicle to the roster
    pub fn add_vehicle(
        &mut self,
        gamer_name: &str,
        vehicle_type: VehicleType,
    ) -> Result<(), SessionError> {
        if self.vehicle(gamer_name).is_some() {
            return Err(SessionError::NameTaken);
        }
        if self.roster.len() >= MAX_VEHICLES {
            return Err(SessionError::RosterFull);
        }
        if self.round_state != RoundState::Waiting {
            return Err(SessionError::RoundInProgress);
        }
        let Some(slot) = self.colors.iter().position(|taken| !taken) else {
            return Err(SessionError::RosterFull);
        };

        self.colors[slot] = true;
        let mut vehicle = Vehicle::new(gamer_name.to_string(), vehicle_type, slot as u8 + 1);
        vehicle.admin = self.roster.is_empty();
        self.roster.push(vehicle);
        self.unbound.insert(gamer_name.to_string(), Instant::now());
        self.vehicle_count.store(self.roster.len(), Ordering::Relaxed);

        info!(
            code = %self.code,
            gamer_name = %gamer_name,
            color = slot + 1,
            roster_size = self.roster.len(),
            "Vehicle joined session"
        );

        self.broadcast_roster();
        Ok(())
    }

    /// Remove a vehicle, freeing its color and handing admin to the oldest
    /// remaining vehicle
    pub fn remove_vehicle(&mut self, gamer_name: &str) -> Option<Vehicle> {
        let index = self.roster.iter().position(|v| v.gamer_name == gamer_name)?;
        let vehicle = self.roster.remove(index);

        if let Some(slot) = self.colors.get_mut(usize::from(vehicle.color).wrapping_sub(1)) {
            *slot = false;
        }
        self.connections.retain(|_, name| name != gamer_name);
        self.unbound.remove(gamer_name);
        self.last_shot.remove(gamer_name);
        self.vehicle_count.store(self.roster.len(), Ordering::Relaxed);

        if vehicle.admin {
            if let Some(next) = self.roster.first_mut() {
                next.admin = true;
                info!(code = %self.code, gamer_name = %next.gamer_name, "Admin promoted");
            }
        }

        info!(
            code = %self.code,
            gamer_name = %gamer_name,
            roster_size = self.roster.len(),
            "Vehicle left session"
        );

        if self.round_state == RoundState::Waiting {
            self.broadcast_roster();
        }
        Some(vehicle)
    }

    /// Bind a connection to a roster entry
    pub fn attach(&mut self, gamer_name: &str) -> Result<Uuid, SessionError> {
        if self.vehicle(gamer_name).is_none() {
            return Err(SessionError::UnknownGamer(gamer_name.to_string()));
        }
        if self.connections.values().any(|name| name == gamer_name) {
            return Err(SessionError::AlreadyConnected);
        }

        let connection_id = Uuid::new_v4();
        self.connections.insert(connection_id, gamer_name.to_string());
        self.unbound.remove(gamer_name);
        debug!(code = %self.code, gamer_name = %gamer_name, %connection_id, "Connection bound");

        self.broadcast_roster();
        Ok(connection_id)
    }

    /// Remove vehicles that joined at least `timeout` ago and never bound a
    /// connection
    pub fn drop_unbound(&mut self, timeout: Duration) -> Vec<String> {
        let stale: Vec<String> = self
            .unbound
            .iter()
            .filter(|(_, joined_at)| joined_at.elapsed() >= timeout)
            .map(|(name, _)| name.clone())
            .collect();
        for name in &stale {
            warn!(code = %self.code, gamer_name = %name, "Join expired without a connection");
            self.remove_vehicle(name);
        }
        stale
    }

    /// Unbind a connection, returning the gamer it belonged to
    pub fn detach(&mut self, connection_id: &Uuid) -> Option<String> {
        self.connections.remove(connection_id)
    }

    /// Waiting -> Countdown: new maze, distinct start cells, fresh vehicles
    pub fn begin_round(&mut self) -> Result<(), SessionError> {
        if self.round_state != RoundState::Waiting {
            return Err(SessionError::RoundInProgress);
        }

        let maze = Maze::generate(
            self.settings.maze_width,
            self.settings.maze_height,
            self.settings.maze_step,
            &mut self.rng,
        )?;
        if maze.room_count() < self.roster.len() {
            return Err(MazeError::TooFewRooms {
                rooms: maze.room_count(),
                vehicles: self.roster.len(),
            }
            .into());
        }

        let mut chosen = HashSet::new();
        let mut placements = Vec::with_capacity(self.roster.len());
        for _ in 0..self.roster.len() {
            let cell = loop {
                let cell = (
                    self.rng.gen_range(0..maze.rooms_wide),
                    self.rng.gen_range(0..maze.rooms_high),
                );
                if chosen.insert(cell) {
                    break cell;
                }
            };
            let heading = f64::from(self.rng.gen_range(0..360u16));
            placements.push((cell, heading));
        }

        for (vehicle, ((column, row), heading)) in self.roster.iter_mut().zip(placements) {
            let (x, y) = maze.room_center(column, row);
            vehicle.position = Point::new(x, y);
            vehicle.heading = heading;
            vehicle.turret_heading = heading;
            vehicle.alive = true;
            vehicle.health = vehicle.stats().max_health;
            vehicle.ultimate_active = false;
        }

        self.maze = maze;
        self.projectiles.clear();
        self.last_shot.clear();
        self.tick = 0;
        self.round_state = RoundState::Countdown;

        info!(
            code = %self.code,
            vehicles = self.roster.len(),
            walls = self.maze.interior_wall_count(),
            "Round countdown"
        );

        self.broadcast(SnapshotBuilder::maze(&self.maze));
        self.broadcast_roster();
        self.broadcast(ServerMsg::RoundState {
            state: RoundState::Countdown,
        });
        Ok(())
    }

    /// Countdown -> Running. Returns false if the session was not counting down.
    pub fn start_running(&mut self) -> bool {
        if self.round_state != RoundState::Countdown {
            return false;
        }
        self.round_state = RoundState::Running;
        info!(code = %self.code, "Round running");
        self.broadcast(ServerMsg::RoundState {
            state: RoundState::Running,
        });
        true
    }

    /// One simulation tick; returns the number of vehicles still alive
    pub fn step(&mut self, now: u64) -> usize {
        if self.round_state != RoundState::Running {
            return self.alive_count();
        }
        self.tick += 1;

        let (events, hits) =
            CombatSystem::resolve_tick(&mut self.maze, &mut self.projectiles, &mut self.roster, now);
        for hit in &hits {
            if hit.target_destroyed {
                info!(code = %self.code, target = %hit.target, shooter = %hit.shooter, "Vehicle destroyed");
            } else {
                debug!(
                    code = %self.code,
                    projectile = %hit.projectile_id,
                    target = %hit.target,
                    shielded = hit.shielded,
                    "Vehicle hit"
                );
            }
        }
        for event in events {
            self.broadcast(event);
        }
        self.broadcast(SnapshotBuilder::game_update(
            self.tick,
            &self.roster,
            &self.projectiles,
        ));

        self.alive_count()
    }

    /// Running -> Waiting: every survivor scores
    pub fn finish_round(&mut self) {
        for vehicle in self.roster.iter_mut().filter(|v| v.alive) {
            vehicle.score += 1;
        }
        self.projectiles.clear();
        self.round_state = RoundState::Waiting;

        info!(
            code = %self.code,
            ticks = self.tick,
            survivors = self.alive_count(),
            "Round finished"
        );

        self.broadcast_roster();
        self.broadcast(ServerMsg::RoundState {
            state: RoundState::Waiting,
        });
    }

    /// Replace a live vehicle's transform with the client's, if the policy allows
    pub fn apply_intent(&mut self, gamer_name: &str, intent: VehicleIntent) -> bool {
        if self.round_state != RoundState::Running {
            return false;
        }
        let policy = self.policy.clone();
        let Some(index) = self.roster.iter().position(|v| v.gamer_name == gamer_name) else {
            return false;
        };
        let vehicle = &self.roster[index];
        if !vehicle.alive || !policy.accept(&self.maze, vehicle, &intent) {
            return false;
        }

        let vehicle = &mut self.roster[index];
        vehicle.position = intent.position;
        vehicle.heading = intent.heading;
        vehicle.turret_heading = intent.turret_heading;
        vehicle.ultimate_active = intent.ultimate_active;
        true
    }

    /// Spawn a projectile for a live vehicle
    pub fn fire(&mut self, gamer_name: &str, request: FireRequest, now: u64) -> bool {
        if self.round_state != RoundState::Running {
            return false;
        }
        if self.projectiles.iter().any(|p| p.id == request.id) {
            return false;
        }
        let Some(vehicle) = self.vehicle(gamer_name).filter(|v| v.alive) else {
            return false;
        };

        let stats = vehicle.stats();
        if !CombatSystem::can_fire(
            self.last_shot.get(gamer_name).copied(),
            now,
            &stats,
            vehicle.ultimate_active,
        ) {
            debug!(code = %self.code, gamer_name = %gamer_name, "Shot dropped by fire rate");
            return false;
        }

        let position = request.position.unwrap_or_else(|| {
            vehicle.position + heading_vector(vehicle.turret_heading, stats.turret_length)
        });
        let demolition =
            CombatSystem::fires_demolition(&stats, vehicle.ultimate_active, request.demolition);

        self.projectiles.push(Projectile::new(
            request.id,
            gamer_name.to_string(),
            position,
            request.heading,
            demolition,
            now,
        ));
        self.last_shot.insert(gamer_name.to_string(), now);
        true
    }

    /// Let a shooter retire one of its own projectiles early
    pub fn expire_projectile(&mut self, gamer_name: &str, id: &str) -> bool {
        let before = self.projectiles.len();
        self.projectiles
            .retain(|p| p.id != id || p.owner != gamer_name);
        before != self.projectiles.len()
    }

    /// Waiting-room vehicle selection
    pub fn change_vehicle(
        &mut self,
        gamer_name: &str,
        vehicle_type: VehicleType,
    ) -> Result<(), SessionError> {
        if self.round_state != RoundState::Waiting {
            return Err(SessionError::RoundInProgress);
        }
        let vehicle = self
            .vehicle_mut(gamer_name)
            .ok_or_else(|| SessionError::UnknownGamer(gamer_name.to_string()))?;
        vehicle.vehicle_type = vehicle_type;
        vehicle.health = VehicleStats::for_type(vehicle_type).max_health;
        self.broadcast_roster();
        Ok(())
    }

    pub fn chat(&self, gamer_name: &str, text: String) {
        self.broadcast(ServerMsg::Chat {
            gamer_name: gamer_name.to_string(),
            text,
        });
    }

    pub fn relay_audio(&self, cue: AudioCue) {
        self.broadcast(ServerMsg::Audio { cue });
    }

    /// Messages a newly bound connection needs to catch up
    pub fn catch_up(&self) -> Vec<ServerMsg> {
        let mut msgs = vec![SnapshotBuilder::roster(&self.roster)];
        if self.round_state != RoundState::Waiting {
            msgs.push(SnapshotBuilder::maze(&self.maze));
        }
        msgs.push(ServerMsg::RoundState {
            state: self.round_state,
        });
        msgs
    }

    /// Mark the session dead, optionally telling every client why
    pub fn close(&mut self, notice: Option<&str>) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Some(message) = notice {
            self.broadcast(ServerMsg::Error {
                code: SESSION_CLOSED.to_string(),
                message: message.to_string(),
            });
        }
        info!(code = %self.code, "Session closed");
    }
}

/// Shared handle to a live session
pub struct SessionHandle {
    pub code: String,
    state: Mutex<Session>,
    outbound: broadcast::Sender<ServerMsg>,
    vehicle_count: Arc<AtomicUsize>,
}

impl SessionHandle {
    pub fn new(session: Session) -> Self {
        Self {
            code: session.code.clone(),
            outbound: session.outbound.clone(),
            vehicle_count: session.vehicle_count.clone(),
            state: Mutex::new(session),
        }
    }

    /// Acquire the session lock
    pub async fn lock(&self) -> MutexGuard<'_, Session> {
        self.state.lock().await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerMsg> {
        self.outbound.subscribe()
    }

    pub fn vehicle_count(&self) -> usize {
        self.vehicle_count.load(Ordering::Relaxed)
    }

    /// Drive Countdown -> Running -> Waiting. The caller has already moved
    /// the session into Countdown.
    pub async fn run_round(self: Arc<Self>, countdown: Duration, tick_period: Duration) {
        sleep(countdown).await;

        {
            let mut session = self.lock().await;
            if session.is_closed() || !session.start_running() {
                warn!(code = %self.code, "Round abandoned before start");
                return;
            }
        }

        let mut ticker = interval(tick_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;

            let mut session = self.lock().await;
            if session.is_closed() {
                info!(code = %self.code, "Session torn down mid-round");
                break;
            }
            if session.step(unix_millis()) <= 1 {
                session.finish_round();
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> GameSettings {
        GameSettings {
            countdown: Duration::from_millis(20),
            tick: Duration::from_millis(2),
            ..GameSettings::default()
        }
    }

    fn session_with(names: &[&str]) -> (Session, broadcast::Receiver<ServerMsg>) {
        let (tx, rx) = broadcast::channel(1024);
        let mut session =
            Session::new("123456".into(), settings(), Arc::new(TrustClient), 42, tx).unwrap();
        for name in names {
            session.add_vehicle(name, VehicleType::Standard).unwrap();
        }
        (session, rx)
    }

    fn drain(rx: &mut broadcast::Receiver<ServerMsg>) -> Vec<ServerMsg> {
        let mut msgs = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            msgs.push(msg);
        }
        msgs
    }

    #[test]
    fn test_join_assigns_admin_and_colors_in_order() {
        let (session, _rx) = session_with(&["Alice", "Bob", "Carol"]);
        let roster = session.roster();
        assert_eq!(
            roster.iter().map(|v| v.gamer_name.as_str()).collect::<Vec<_>>(),
            ["Alice", "Bob", "Carol"]
        );
        assert_eq!(roster.iter().map(|v| v.color).collect::<Vec<_>>(), [1, 2, 3]);
        assert_eq!(roster.iter().filter(|v| v.admin).count(), 1);
        assert!(roster[0].admin);
    }

    #[test]
    fn test_join_validation() {
        let (mut session, _rx) = session_with(&["Alice", "Bob", "Carol", "Dave"]);
        assert_eq!(
            session.add_vehicle("Alice", VehicleType::Scout),
            Err(SessionError::NameTaken)
        );
        assert_eq!(
            session.add_vehicle("Eve", VehicleType::Scout),
            Err(SessionError::RosterFull)
        );
        // Names are case-sensitive
        session.remove_vehicle("Dave");
        assert!(session.add_vehicle("alice", VehicleType::Scout).is_ok());
    }

    #[test]
    fn test_join_rejected_during_round() {
        let (mut session, _rx) = session_with(&["Alice", "Bob"]);
        session.begin_round().unwrap();
        assert_eq!(
            session.add_vehicle("Carol", VehicleType::Standard),
            Err(SessionError::RoundInProgress)
        );
    }

    #[test]
    fn test_drop_unbound_keeps_connected_vehicles() {
        let (mut session, _rx) = session_with(&["Alice", "Bob"]);
        assert!(session.drop_unbound(Duration::from_secs(60)).is_empty());

        session.attach("Alice").unwrap();
        assert_eq!(session.drop_unbound(Duration::ZERO), ["Bob"]);
        assert_eq!(session.roster().len(), 1);
        assert!(session.is_admin("Alice"));
        assert!(session.drop_unbound(Duration::ZERO).is_empty());
    }

    #[test]
    fn test_freed_color_is_reused() {
        let (mut session, _rx) = session_with(&["Alice", "Bob", "Carol"]);
        session.remove_vehicle("Bob");
        session.add_vehicle("Dave", VehicleType::Scout).unwrap();
        let dave = session.vehicle("Dave").unwrap();
        assert_eq!(dave.color, 2);
        // Join order is kept, not re-sorted by color
        assert_eq!(session.roster().last().unwrap().gamer_name, "Dave");
    }

    #[test]
    fn test_admin_promotion_on_leave() {
        let (mut session, _rx) = session_with(&["Alice", "Bob", "Carol"]);
        let removed = session.remove_vehicle("Alice").unwrap();
        assert!(removed.admin);
        let admins: Vec<_> = session.roster().iter().filter(|v| v.admin).collect();
        assert_eq!(admins.len(), 1);
        assert_eq!(admins[0].gamer_name, "Bob");

        session.remove_vehicle("Carol");
        assert!(session.is_admin("Bob"));
        session.remove_vehicle("Bob");
        assert!(session.is_empty());
    }

    #[test]
    fn test_begin_round_places_vehicles_in_distinct_cells() {
        for count in 1..=MAX_VEHICLES {
            let names: Vec<String> = (0..count).map(|i| format!("p{i}")).collect();
            let refs: Vec<&str> = names.iter().map(String::as_str).collect();
            for _ in 0..25 {
                let (mut session, _rx) = session_with(&refs);
                session.begin_round().unwrap();

                let cells: HashSet<_> = session
                    .roster()
                    .iter()
                    .map(|v| session.maze().locate(v.position.x, v.position.y).unwrap())
                    .collect();
                assert_eq!(cells.len(), count);
                assert!(session.maze().is_connected());
                for v in session.roster() {
                    assert!(v.alive);
                    assert_eq!(v.health, v.stats().max_health);
                    assert_eq!(v.heading, v.turret_heading);
                    assert!((0.0..360.0).contains(&v.heading));
                }
            }
        }
    }

    #[test]
    fn test_begin_round_broadcasts_maze_roster_state() {
        let (mut session, mut rx) = session_with(&["Alice"]);
        drain(&mut rx);
        session.begin_round().unwrap();
        let msgs = drain(&mut rx);
        assert!(matches!(msgs[0], ServerMsg::Maze { .. }));
        assert!(matches!(msgs[1], ServerMsg::Roster { .. }));
        assert_eq!(msgs[2], ServerMsg::RoundState { state: RoundState::Countdown });
        assert_eq!(session.begin_round(), Err(SessionError::RoundInProgress));
    }

    #[test]
    fn test_begin_round_needs_enough_rooms() {
        let (tx, _rx) = broadcast::channel(16);
        let tiny = GameSettings {
            maze_width: 100,
            maze_height: 100,
            maze_step: 100,
            ..settings()
        };
        let mut session = Session::new("111111".into(), tiny, Arc::new(TrustClient), 1, tx).unwrap();
        session.add_vehicle("Alice", VehicleType::Standard).unwrap();
        session.add_vehicle("Bob", VehicleType::Standard).unwrap();
        let err = session.begin_round().unwrap_err();
        assert!(err.is_internal());
        // Nothing was committed
        assert_eq!(session.round_state(), RoundState::Waiting);
        assert!(!session.roster()[0].alive);
    }

    #[test]
    fn test_intent_only_applies_while_running() {
        let (mut session, _rx) = session_with(&["Alice", "Bob"]);
        let intent = VehicleIntent {
            position: Point::new(10.0, 20.0),
            heading: 45.0,
            turret_heading: 90.0,
            ultimate_active: true,
        };
        assert!(!session.apply_intent("Alice", intent));
        session.begin_round().unwrap();
        assert!(!session.apply_intent("Alice", intent));
        session.start_running();
        assert!(session.apply_intent("Alice", intent));
        let alice = session.vehicle("Alice").unwrap();
        assert_eq!(alice.position, Point::new(10.0, 20.0));
        assert_eq!(alice.turret_heading, 90.0);
        assert!(alice.ultimate_active);
    }

    #[test]
    fn test_bounded_policy_rejects_out_of_arena() {
        let (tx, _rx) = broadcast::channel(16);
        let mut session =
            Session::new("222222".into(), settings(), Arc::new(BoundedIntent), 5, tx).unwrap();
        session.add_vehicle("Alice", VehicleType::Standard).unwrap();
        session.add_vehicle("Bob", VehicleType::Standard).unwrap();
        session.begin_round().unwrap();
        session.start_running();
        let mut intent = VehicleIntent {
            position: Point::new(-50.0, 20.0),
            heading: 0.0,
            turret_heading: 0.0,
            ultimate_active: false,
        };
        assert!(!session.apply_intent("Alice", intent));
        intent.position = Point::new(50.0, 20.0);
        assert!(session.apply_intent("Alice", intent));
    }

    #[test]
    fn test_fire_respects_rate_and_duplicates() {
        let (mut session, _rx) = session_with(&["Alice", "Bob"]);
        session.begin_round().unwrap();
        session.start_running();
        let shot = |id: &str| FireRequest {
            id: id.to_string(),
            position: None,
            heading: 0.0,
            demolition: false,
        };
        assert!(session.fire("Alice", shot("a1"), 1_000));
        assert!(!session.fire("Alice", shot("a2"), 1_100));
        assert!(!session.fire("Bob", shot("a1"), 1_100));
        assert!(session.fire("Alice", shot("a3"), 1_600));
        assert_eq!(session.projectiles().len(), 2);

        // Spawned at the turret tip
        let alice = session.vehicle("Alice").unwrap().clone();
        let tip = alice.position + heading_vector(alice.turret_heading, alice.stats().turret_length);
        assert_eq!(session.projectiles()[0].position, tip);

        // Only the shooter can retire a shot
        assert!(!session.expire_projectile("Bob", "a1"));
        assert_eq!(session.projectiles().len(), 2);
        assert!(session.expire_projectile("Alice", "a1"));
        assert!(!session.expire_projectile("Alice", "a1"));
        assert_eq!(session.projectiles().len(), 1);
    }

    #[test]
    fn test_scout_barrage_fires_faster() {
        let (tx, _rx) = broadcast::channel(64);
        let mut session =
            Session::new("444444".into(), settings(), Arc::new(TrustClient), 11, tx).unwrap();
        session.add_vehicle("Sky", VehicleType::Scout).unwrap();
        session.add_vehicle("Bob", VehicleType::Standard).unwrap();
        session.begin_round().unwrap();
        session.start_running();
        let shot = |id: usize| FireRequest {
            id: format!("s{id}"),
            position: None,
            heading: 0.0,
            demolition: false,
        };

        let fire_for_a_second = |session: &mut Session, offset: usize| {
            let start = 10_000 * offset as u64;
            (0..10)
                .filter(|i| session.fire("Sky", shot(offset + i), start + *i as u64 * 100))
                .count()
        };
        assert_eq!(fire_for_a_second(&mut session, 0), 3);

        let sky = session.vehicle("Sky").unwrap().clone();
        session.apply_intent(
            "Sky",
            VehicleIntent {
                position: sky.position,
                heading: sky.heading,
                turret_heading: sky.turret_heading,
                ultimate_active: true,
            },
        );
        assert_eq!(fire_for_a_second(&mut session, 10), 5);
    }

    #[test]
    fn test_sapper_ultimate_fires_demolition() {
        let (tx, _rx) = broadcast::channel(64);
        let mut session =
            Session::new("333333".into(), settings(), Arc::new(TrustClient), 9, tx).unwrap();
        session.add_vehicle("Sam", VehicleType::Sapper).unwrap();
        session.add_vehicle("Bob", VehicleType::Standard).unwrap();
        session.begin_round().unwrap();
        session.start_running();
        let sam = session.vehicle("Sam").unwrap().clone();
        session.apply_intent(
            "Sam",
            VehicleIntent {
                position: sam.position,
                heading: sam.heading,
                turret_heading: sam.turret_heading,
                ultimate_active: true,
            },
        );
        let request = FireRequest {
            id: "s1".into(),
            position: None,
            heading: 0.0,
            demolition: false,
        };
        assert!(session.fire("Sam", request, 0));
        assert!(session.projectiles()[0].demolition);
    }

    #[test]
    fn test_finish_round_scores_survivors() {
        let (mut session, _rx) = session_with(&["Alice", "Bob", "Carol"]);
        session.begin_round().unwrap();
        session.start_running();
        session.vehicle_mut("Bob").unwrap().alive = false;
        session.vehicle_mut("Carol").unwrap().alive = false;
        assert_eq!(session.step(0), 1);
        session.finish_round();
        let scores: Vec<u32> = session.roster().iter().map(|v| v.score).collect();
        assert_eq!(scores, [1, 0, 0]);
        assert_eq!(session.round_state(), RoundState::Waiting);
    }

    #[test]
    fn test_step_kills_vehicle_with_projectile() {
        let (mut session, mut rx) = session_with(&["Alice", "Bob"]);
        session.begin_round().unwrap();
        session.start_running();
        let bob = session.vehicle("Bob").unwrap().clone();
        session.vehicle_mut("Bob").unwrap().health = 1;
        // Fired from Bob's own center: harmless until it activates
        let request = FireRequest {
            id: "x".into(),
            position: Some(bob.position),
            heading: bob.heading,
            demolition: false,
        };
        assert!(session.fire("Alice", request, 0));
        let mut alive = 2;
        for _ in 0..5 {
            alive = session.step(0);
        }
        assert_eq!(alive, 1);
        assert!(!session.vehicle("Bob").unwrap().alive);
        drain(&mut rx);
    }

    #[test]
    fn test_attach_binds_once() {
        let (mut session, _rx) = session_with(&["Alice"]);
        let id = session.attach("Alice").unwrap();
        assert_eq!(session.attach("Alice"), Err(SessionError::AlreadyConnected));
        assert_eq!(
            session.attach("Nobody"),
            Err(SessionError::UnknownGamer("Nobody".into()))
        );
        assert_eq!(session.detach(&id), Some("Alice".to_string()));
        assert!(session.detach(&id).is_none());
    }

    #[test]
    fn test_change_vehicle_only_in_lobby() {
        let (mut session, _rx) = session_with(&["Alice", "Bob"]);
        session.change_vehicle("Alice", VehicleType::Bulwark).unwrap();
        assert_eq!(session.vehicle("Alice").unwrap().health, 5);
        session.begin_round().unwrap();
        assert_eq!(
            session.change_vehicle("Alice", VehicleType::Scout),
            Err(SessionError::RoundInProgress)
        );
    }

    #[tokio::test]
    async fn test_round_loop_runs_to_completion() {
        let (session, _) = session_with(&["Alice", "Bob"]);
        let handle = Arc::new(SessionHandle::new(session));
        let mut rx = handle.subscribe();
        handle.lock().await.begin_round().unwrap();

        let task = tokio::spawn(
            handle
                .clone()
                .run_round(Duration::from_millis(20), Duration::from_millis(2)),
        );

        // Wait for Running, then knock Bob out
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .unwrap()
                .unwrap();
            if msg == (ServerMsg::RoundState { state: RoundState::Running }) {
                break;
            }
        }
        handle.lock().await.vehicle_mut("Bob").unwrap().alive = false;

        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
        let session = handle.lock().await;
        assert_eq!(session.round_state(), RoundState::Waiting);
        assert_eq!(session.vehicle("Alice").unwrap().score, 1);
        assert_eq!(session.vehicle("Bob").unwrap().score, 0);
    }
}
