//! Session directory - live sessions keyed by their 6-digit code

use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::sleep;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::GameSettings;
use crate::ws::protocol::VehicleType;

use super::session::{IntentPolicy, Session, SessionError, SessionHandle, TrustClient};

/// Smallest session code
pub const CODE_MIN: u32 = 100_000;
/// Largest session code
pub const CODE_MAX: u32 = 999_999;

/// Outbound buffer per session; a lagging client skips ahead
const BROADCAST_CAPACITY: usize = 256;

/// Broadcast to every client when a session event fails internally
pub const INTERNAL_ERROR_NOTICE: &str = "Tank Tango hit a server error. Please try again later.";

/// Directory-level failures
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DirectoryError {
    #[error("Tank Tango is currently at max capacity. Please try again later.")]
    AtCapacity,

    #[error("Invalid game code.")]
    InvalidCode,

    #[error(transparent)]
    Session(#[from] SessionError),
}

impl DirectoryError {
    pub fn is_internal(&self) -> bool {
        matches!(self, DirectoryError::Session(e) if e.is_internal())
    }

    /// Short machine-readable code for error notices
    pub fn code(&self) -> &'static str {
        match self {
            DirectoryError::AtCapacity => "at_capacity",
            DirectoryError::InvalidCode => "invalid_code",
            DirectoryError::Session(e) => e.code(),
        }
    }
}

/// Live sessions keyed by code, shared with join deadline tasks
#[derive(Default)]
struct Registry {
    sessions: DashMap<String, Arc<SessionHandle>>,
    /// Serializes capacity checks, code generation, insertion and removal
    lock: Mutex<()>,
}

impl Registry {
    /// Close and unregister a session whose lock the caller holds
    fn retire(&self, session: &mut Session) {
        session.close(None);
        let _guard = self.lock.lock();
        self.sessions.remove(session.code());
        info!(code = %session.code(), "Session torn down");
    }
}

/// Registry of live sessions
pub struct SessionDirectory {
    registry: Arc<Registry>,
    settings: GameSettings,
    policy: Arc<dyn IntentPolicy>,
}

impl SessionDirectory {
    pub fn new(settings: GameSettings) -> Self {
        Self::with_policy(settings, Arc::new(TrustClient))
    }

    pub fn with_policy(settings: GameSettings, policy: Arc<dyn IntentPolicy>) -> Self {
        Self {
            registry: Arc::new(Registry::default()),
            settings,
            policy,
        }
    }

    pub fn get(&self, code: &str) -> Option<Arc<SessionHandle>> {
        self.registry.sessions.get(code).map(|s| s.value().clone())
    }

    pub fn active_sessions(&self) -> usize {
        self.registry.sessions.len()
    }

    pub fn total_vehicles(&self) -> usize {
        self.registry
            .sessions
            .iter()
            .map(|s| s.value().vehicle_count())
            .sum()
    }

    /// Create a session with its first (admin) vehicle and return its code
    pub fn create_session(
        &self,
        gamer_name: &str,
        vehicle_type: VehicleType,
    ) -> Result<String, DirectoryError> {
        let _guard = self.registry.lock.lock();

        if self.registry.sessions.len() >= self.settings.max_sessions {
            warn!(sessions = self.registry.sessions.len(), "Session directory at capacity");
            return Err(DirectoryError::AtCapacity);
        }

        let mut rng = rand::thread_rng();
        let code = loop {
            let candidate = rng.gen_range(CODE_MIN..=CODE_MAX).to_string();
            if !self.registry.sessions.contains_key(&candidate) {
                break candidate;
            }
        };

        let (outbound, _) = broadcast::channel(BROADCAST_CAPACITY);
        let mut session = Session::new(
            code.clone(),
            self.settings.clone(),
            self.policy.clone(),
            rng.gen(),
            outbound,
        )?;
        session.add_vehicle(gamer_name, vehicle_type)?;

        let handle = Arc::new(SessionHandle::new(session));
        self.registry.sessions.insert(code.clone(), handle.clone());
        self.schedule_join_deadline(handle);

        info!(code = %code, gamer_name = %gamer_name, "Session created");
        Ok(code)
    }

    /// Add a vehicle to an existing session
    pub async fn join_session(
        &self,
        code: &str,
        gamer_name: &str,
        vehicle_type: VehicleType,
    ) -> Result<(), DirectoryError> {
        let handle = self.get(code).ok_or(DirectoryError::InvalidCode)?;
        let mut session = handle.lock().await;
        if session.is_closed() {
            return Err(DirectoryError::InvalidCode);
        }
        session.add_vehicle(gamer_name, vehicle_type)?;
        drop(session);
        self.schedule_join_deadline(handle);
        Ok(())
    }

    /// Move a session into Countdown and spawn its round loop
    pub async fn start_round(&self, code: &str) -> Result<(), DirectoryError> {
        let handle = self.get(code).ok_or(DirectoryError::InvalidCode)?;
        {
            let mut session = handle.lock().await;
            if session.is_closed() {
                return Err(DirectoryError::InvalidCode);
            }
            session.begin_round()?;
        }

        tokio::spawn(
            handle
                .clone()
                .run_round(self.settings.countdown, self.settings.tick),
        );
        Ok(())
    }

    /// Remove a vehicle; the session is torn down once its roster is empty
    pub async fn leave(&self, code: &str, gamer_name: &str) {
        let Some(handle) = self.get(code) else {
            return;
        };
        let mut session = handle.lock().await;
        session.remove_vehicle(gamer_name);
        if session.is_empty() {
            self.registry.retire(&mut session);
        }
    }

    /// Connection-close path: unbind the connection and remove its vehicle
    pub async fn disconnect(&self, code: &str, connection_id: &Uuid) {
        let Some(handle) = self.get(code) else {
            return;
        };
        let mut session = handle.lock().await;
        let Some(gamer_name) = session.detach(connection_id) else {
            return;
        };
        info!(code = %code, gamer_name = %gamer_name, "Connection closed");
        session.remove_vehicle(&gamer_name);
        if session.is_empty() {
            self.registry.retire(&mut session);
        }
    }

    /// Drop the vehicle again if no connection binds to it before the join
    /// timeout runs out
    fn schedule_join_deadline(&self, handle: Arc<SessionHandle>) {
        let registry = self.registry.clone();
        let timeout = self.settings.join_timeout;
        tokio::spawn(async move {
            sleep(timeout).await;
            let mut session = handle.lock().await;
            if session.is_closed() {
                return;
            }
            if !session.drop_unbound(timeout).is_empty() && session.is_empty() {
                registry.retire(&mut session);
            }
        });
    }

    /// Unrecoverable session failure: notify and tear down every live session
    pub async fn fail_all(&self, err: &DirectoryError) {
        error!(error = %err, "Session event failed internally");
        self.teardown_all(INTERNAL_ERROR_NOTICE).await;
    }

    /// Tear every live session down, notifying its clients
    pub async fn teardown_all(&self, reason: &str) {
        let drained: Vec<Arc<SessionHandle>> = {
            let _guard = self.registry.lock.lock();
            let sessions = &self.registry.sessions;
            let handles = sessions.iter().map(|s| s.value().clone()).collect();
            sessions.clear();
            handles
        };

        error!(sessions = drained.len(), reason = %reason, "Tearing down all sessions");
        for handle in drained {
            handle.lock().await.close(Some(reason));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::session::{RoundState, MAX_VEHICLES, SESSION_CLOSED};
    use crate::ws::protocol::ServerMsg;
    use std::collections::HashSet;
    use std::time::Duration;
    use tokio_test::{assert_err, assert_ok};

    fn fast_settings() -> GameSettings {
        GameSettings {
            countdown: Duration::from_millis(20),
            tick: Duration::from_millis(2),
            ..GameSettings::default()
        }
    }

    async fn wait_for(
        rx: &mut broadcast::Receiver<ServerMsg>,
        wanted: ServerMsg,
    ) -> Result<(), tokio::time::error::Elapsed> {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match rx.recv().await {
                    Ok(msg) if msg == wanted => return,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => panic!("session channel closed"),
                }
            }
        })
        .await
    }

    #[tokio::test]
    async fn test_full_session_scenario() {
        let directory = SessionDirectory::new(fast_settings());

        let code = assert_ok!(directory.create_session("Alice", VehicleType::Standard));
        assert_eq!(code.len(), 6);
        assert!(code.chars().all(|c| c.is_ascii_digit()));

        assert_ok!(directory.join_session(&code, "Bob", VehicleType::Standard).await);
        {
            let handle = directory.get(&code).unwrap();
            let session = handle.lock().await;
            assert_eq!(session.roster().len(), 2);
            assert_eq!(session.roster()[1].color, 2);
        }

        assert_ok!(directory.join_session(&code, "Carol", VehicleType::Scout).await);
        assert_ok!(directory.join_session(&code, "Dave", VehicleType::Bulwark).await);
        assert_eq!(
            directory.join_session(&code, "Eve", VehicleType::Sapper).await,
            Err(DirectoryError::Session(SessionError::RosterFull))
        );
        assert_eq!(directory.total_vehicles(), MAX_VEHICLES);

        let handle = directory.get(&code).unwrap();
        let mut rx = handle.subscribe();
        assert_ok!(directory.start_round(&code).await);
        {
            let session = handle.lock().await;
            assert_eq!(session.round_state(), RoundState::Countdown);
            assert!(session.maze().is_connected());
            let colors: Vec<u8> = session.roster().iter().map(|v| v.color).collect();
            assert_eq!(colors, [1, 2, 3, 4]);
            let cells: HashSet<_> = session
                .roster()
                .iter()
                .map(|v| session.maze().locate(v.position.x, v.position.y))
                .collect();
            assert_eq!(cells.len(), 4);
            for v in session.roster() {
                assert!(v.alive);
                assert_eq!(v.health, v.stats().max_health);
            }
        }

        assert_ok!(
            wait_for(&mut rx, ServerMsg::RoundState { state: RoundState::Running }).await
        );
        {
            let mut session = handle.lock().await;
            assert_eq!(session.round_state(), RoundState::Running);
            for name in ["Bob", "Carol", "Dave"] {
                session.remove_vehicle(name);
            }
        }
        assert_ok!(
            wait_for(&mut rx, ServerMsg::RoundState { state: RoundState::Waiting }).await
        );

        let session = handle.lock().await;
        assert_eq!(session.round_state(), RoundState::Waiting);
        assert_eq!(session.vehicle("Alice").unwrap().score, 1);
    }

    #[tokio::test]
    async fn test_invalid_code() {
        let directory = SessionDirectory::new(fast_settings());
        assert_eq!(
            directory.join_session("000000", "Bob", VehicleType::Standard).await,
            Err(DirectoryError::InvalidCode)
        );
        assert_eq!(
            directory.start_round("000000").await,
            Err(DirectoryError::InvalidCode)
        );
    }

    #[tokio::test]
    async fn test_capacity_is_enforced() {
        let settings = GameSettings {
            max_sessions: 3,
            ..fast_settings()
        };
        let directory = SessionDirectory::new(settings);
        let codes: HashSet<String> = (0..3)
            .map(|i| directory.create_session(&format!("p{i}"), VehicleType::Standard).unwrap())
            .collect();
        assert_eq!(codes.len(), 3);

        let err = assert_err!(directory.create_session("late", VehicleType::Standard));
        assert_eq!(err, DirectoryError::AtCapacity);
        assert!(!err.is_internal());

        let first = codes.iter().next().unwrap().clone();
        directory.leave(&first, "p0").await;
        directory.leave(&first, "p1").await;
        directory.leave(&first, "p2").await;
        assert_eq!(directory.active_sessions(), 2);
        assert_ok!(directory.create_session("late", VehicleType::Standard));
    }

    #[tokio::test]
    async fn test_last_leave_frees_code() {
        let directory = SessionDirectory::new(fast_settings());
        let code = directory.create_session("Alice", VehicleType::Standard).unwrap();
        assert_ok!(directory.join_session(&code, "Bob", VehicleType::Scout).await);

        let handle = directory.get(&code).unwrap();
        let alice = handle.lock().await.attach("Alice").unwrap();
        directory.disconnect(&code, &alice).await;
        {
            let session = handle.lock().await;
            assert!(session.is_admin("Bob"));
            assert_eq!(session.roster().len(), 1);
        }

        directory.leave(&code, "Bob").await;
        assert!(directory.get(&code).is_none());
        assert!(handle.lock().await.is_closed());
        assert_eq!(
            directory.join_session(&code, "Carol", VehicleType::Standard).await,
            Err(DirectoryError::InvalidCode)
        );
    }

    #[tokio::test]
    async fn test_start_rejected_while_round_active() {
        let settings = GameSettings {
            countdown: Duration::from_secs(60),
            ..fast_settings()
        };
        let directory = SessionDirectory::new(settings);
        let code = directory.create_session("Alice", VehicleType::Standard).unwrap();
        assert_ok!(directory.start_round(&code).await);
        assert_eq!(
            directory.start_round(&code).await,
            Err(DirectoryError::Session(SessionError::RoundInProgress))
        );
        assert_eq!(
            directory.join_session(&code, "Bob", VehicleType::Standard).await,
            Err(DirectoryError::Session(SessionError::RoundInProgress))
        );
    }

    #[tokio::test]
    async fn test_teardown_all_notifies_and_clears() {
        let directory = SessionDirectory::new(fast_settings());
        let a = directory.create_session("Alice", VehicleType::Standard).unwrap();
        let b = directory.create_session("Bob", VehicleType::Standard).unwrap();
        let mut rx_a = directory.get(&a).unwrap().subscribe();
        let handle_b = directory.get(&b).unwrap();

        directory.teardown_all("Server error, please try again later.").await;

        assert_eq!(directory.active_sessions(), 0);
        assert!(handle_b.lock().await.is_closed());
        match rx_a.recv().await.unwrap() {
            ServerMsg::Error { code, .. } => assert_eq!(code, SESSION_CLOSED),
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_sessions_are_isolated() {
        let directory = SessionDirectory::new(fast_settings());
        let a = directory.create_session("Alice", VehicleType::Standard).unwrap();
        let b = directory.create_session("Alice", VehicleType::Standard).unwrap();
        assert_ne!(a, b);
        assert_ok!(directory.join_session(&a, "Bob", VehicleType::Standard).await);
        assert_eq!(directory.get(&b).unwrap().vehicle_count(), 1);
        assert_eq!(directory.total_vehicles(), 3);
    }

    #[tokio::test]
    async fn test_unconnected_joins_expire_and_free_capacity() {
        let settings = GameSettings {
            max_sessions: 2,
            join_timeout: Duration::from_millis(50),
            ..fast_settings()
        };
        let directory = SessionDirectory::new(settings);
        let idle = directory.create_session("Alice", VehicleType::Standard).unwrap();
        let live = directory.create_session("Carol", VehicleType::Standard).unwrap();
        assert_ok!(directory.join_session(&live, "Dave", VehicleType::Scout).await);
        assert_eq!(
            directory.create_session("Eve", VehicleType::Standard),
            Err(DirectoryError::AtCapacity)
        );

        let live_handle = directory.get(&live).unwrap();
        live_handle.lock().await.attach("Carol").unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;

        // The idle session is gone and its slot is free again
        assert!(directory.get(&idle).is_none());
        assert_eq!(
            directory.join_session(&idle, "Bob", VehicleType::Standard).await,
            Err(DirectoryError::InvalidCode)
        );
        assert_ok!(directory.create_session("Eve", VehicleType::Standard));

        // Only the connected vehicle stays in the live session
        let session = live_handle.lock().await;
        assert!(!session.is_closed());
        assert_eq!(
            session.roster().iter().map(|v| v.gamer_name.as_str()).collect::<Vec<_>>(),
            ["Carol"]
        );
        assert!(session.is_admin("Carol"));
    }
}
