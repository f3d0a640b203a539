use crate::config::SessionConfig;
use crate::connection::PlayerConnection;
use crate::error::ServerError;
use crate::game::GameState;
use log::{debug, info, warn};
use shared::{encode, Direction, Packet, Player, Snapshot};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::time::{sleep_until, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Created, nobody has joined yet.
    Empty,
    /// At least one player is alive.
    Active,
    /// The last player left; closes on the next empty tick.
    Draining,
    /// Tick loop finished. Never reopens.
    Closed,
}

struct SessionState {
    game: GameState,
    connections: Vec<PlayerConnection>,
    phase: SessionPhase,
}

struct SessionInner {
    id: u32,
    config: Arc<SessionConfig>,
    state: Mutex<SessionState>,
}

/// One running game: its players, their connections and the tick loop that
/// drives them.
///
/// All mutation goes through a single lock. Connections take it briefly to
/// record intent; a tick holds it for the whole move/collide/broadcast pass,
/// so intent that arrives mid-tick lands in the next one.
#[derive(Clone)]
pub struct GameSession {
    inner: Arc<SessionInner>,
}

impl GameSession {
    pub fn new(id: u32, config: Arc<SessionConfig>) -> Self {
        let game = GameState::new(&config);
        Self::with_game(id, config, game)
    }

    /// Builds a session around a prepared game, e.g. one with a seeded RNG.
    pub fn with_game(id: u32, config: Arc<SessionConfig>, game: GameState) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                id,
                config,
                state: Mutex::new(SessionState {
                    game,
                    connections: Vec::new(),
                    phase: SessionPhase::Empty,
                }),
            }),
        }
    }

    pub fn id(&self) -> u32 {
        self.inner.id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub async fn phase(&self) -> SessionPhase {
        self.inner.state.lock().await.phase
    }

    pub async fn player_count(&self) -> usize {
        self.inner.state.lock().await.game.player_count()
    }

    pub async fn is_full(&self) -> bool {
        self.player_count().await >= self.inner.config.max_players
    }

    pub async fn snapshot(&self) -> Snapshot {
        self.inner.state.lock().await.game.snapshot()
    }

    /// Places a new snake for `player` and starts broadcasting to `connection`.
    ///
    /// Fails with `SessionClosed` once the session is draining, `Capacity`
    /// when it is full and `NoSpace` when no spawn row is free.
    pub async fn add_player(
        &self,
        player: Player,
        connection: PlayerConnection,
    ) -> Result<(), ServerError> {
        let mut state = self.inner.state.lock().await;

        if matches!(state.phase, SessionPhase::Draining | SessionPhase::Closed) {
            return Err(ServerError::SessionClosed(self.inner.id));
        }
        if state.game.player_count() >= self.inner.config.max_players {
            return Err(ServerError::Capacity {
                session_id: self.inner.id,
                capacity: self.inner.config.max_players,
            });
        }

        let player_id = player.id;
        state.game.add_player(player)?;
        state.connections.push(connection);

        if state.phase == SessionPhase::Empty {
            state.phase = SessionPhase::Active;
        }
        info!(
            "Player {} joined session {} ({}/{})",
            player_id,
            self.inner.id,
            state.game.player_count(),
            self.inner.config.max_players
        );
        Ok(())
    }

    pub async fn set_nickname(&self, player_id: u32, name: String) -> bool {
        let mut state = self.inner.state.lock().await;
        let changed = state.game.set_nickname(player_id, name);
        if changed {
            debug!("Player {} in session {} renamed", player_id, self.inner.id);
        }
        changed
    }

    /// Records a turn for the next tick. Returns false if it was rejected.
    pub async fn set_direction(&self, player_id: u32, direction: Direction) -> bool {
        self.inner
            .state
            .lock()
            .await
            .game
            .set_direction(player_id, direction)
    }

    /// Runs one tick and returns the phase the session is in afterwards.
    pub async fn step(&self) -> SessionPhase {
        let mut guard = self.inner.state.lock().await;
        let state = &mut *guard;

        if state.phase == SessionPhase::Closed {
            return SessionPhase::Closed;
        }

        // Evict players whose socket died since the last tick.
        let (dead, alive): (Vec<_>, Vec<_>) = state
            .connections
            .drain(..)
            .partition(PlayerConnection::is_dead);
        state.connections = alive;
        for connection in dead {
            let score = state
                .game
                .remove_player(connection.player_id())
                .map_or(0, |player| player.score);
            info!(
                "Evicting offline player {} from session {}",
                connection.player_id(),
                self.inner.id
            );
            connection.kill(score);
        }

        if state.game.player_count() == 0 {
            state.phase = match state.phase {
                SessionPhase::Empty | SessionPhase::Active => {
                    info!("Session {} is empty, draining", self.inner.id);
                    SessionPhase::Draining
                }
                SessionPhase::Draining | SessionPhase::Closed => {
                    info!("Session {} closed", self.inner.id);
                    SessionPhase::Closed
                }
            };
            return state.phase;
        }

        let outcome = state.game.tick();

        for death in outcome.deaths {
            debug!(
                "Player {} died in session {}: {:?}",
                death.player.id, self.inner.id, death.cause
            );
            if let Some(index) = state
                .connections
                .iter()
                .position(|c| c.player_id() == death.player.id)
            {
                state.connections.remove(index).kill(death.player.score);
            }
        }

        match encode(&Packet::Snapshot(state.game.snapshot())) {
            Ok(frame) => {
                let frame = Arc::new(frame);
                for connection in &state.connections {
                    connection.send(Arc::clone(&frame));
                }
            }
            Err(e) => warn!("Session {} failed to encode snapshot: {}", self.inner.id, e),
        }

        if state.game.tick % 300 == 0 {
            debug!(
                "Session {} tick {}: {} players, {} apples",
                self.inner.id,
                state.game.tick,
                state.game.player_count(),
                state.game.apples().len()
            );
        }

        state.phase
    }

    /// Drives the session at the configured tick rate until it closes or
    /// `shutdown` flips to true. A tick that overruns its budget delays the
    /// next one; missed ticks are not replayed.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let budget = self.inner.config.tick_duration();
        info!(
            "Session {} started at {} ticks/s",
            self.inner.id, self.inner.config.tick_rate
        );

        let mut deadline = Instant::now() + budget;
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = sleep_until(deadline) => {}
                _ = shutdown.changed() => break,
            }

            let started = Instant::now();
            if self.step().await == SessionPhase::Closed {
                break;
            }

            let elapsed = started.elapsed();
            if elapsed > budget {
                warn!(
                    "Session {} tick overran its budget by {:?}",
                    self.inner.id,
                    elapsed - budget
                );
            }
            deadline = started + budget;
        }

        self.close().await;
    }

    /// Kills every remaining connection and marks the session closed.
    pub async fn close(&self) {
        let mut guard = self.inner.state.lock().await;
        let state = &mut *guard;

        for connection in state.connections.drain(..) {
            let score = state
                .game
                .remove_player(connection.player_id())
                .map_or(0, |player| player.score);
            connection.kill(score);
        }
        if state.phase != SessionPhase::Closed {
            info!("Session {} closed", self.inner.id);
        }
        state.phase = SessionPhase::Closed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionState;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use shared::{Event, FrameDecoder};
    use std::net::SocketAddr;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, DuplexStream, ReadHalf};
    use tokio::task::JoinSet;
    use tokio::time::{sleep, timeout};
    use tokio_test::{assert_err, assert_ok};

    fn small_config() -> Arc<SessionConfig> {
        Arc::new(SessionConfig {
            width: 6,
            height: 8,
            starting_segments: 3,
            max_players: 2,
            apple_count: 0,
            tick_rate: 50,
            ..Default::default()
        })
    }

    fn test_session(config: Arc<SessionConfig>) -> GameSession {
        let game = GameState::with_rng(&config, StdRng::seed_from_u64(11));
        GameSession::with_game(1, config, game)
    }

    fn test_connection(
        player_id: u32,
        tasks: &mut JoinSet<()>,
    ) -> (PlayerConnection, ReadHalf<DuplexStream>, DuplexStream) {
        let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let (client, server_side) = tokio::io::duplex(1 << 16);
        let (connection, reader) = PlayerConnection::new(server_side, addr, player_id, tasks);
        (connection, reader, client)
    }

    /// Reads until at least one complete packet is available.
    async fn next_packets(client: &mut DuplexStream, decoder: &mut FrameDecoder) -> Vec<Packet> {
        let mut buffer = [0u8; 4096];
        loop {
            let n = timeout(Duration::from_secs(2), client.read(&mut buffer))
                .await
                .expect("no packet arrived")
                .unwrap();
            assert!(n > 0, "stream closed");
            let packets: Vec<Packet> = decoder
                .decode(&buffer[..n])
                .into_iter()
                .map(|r| r.unwrap())
                .collect();
            if !packets.is_empty() {
                return packets;
            }
        }
    }

    #[tokio::test]
    async fn test_first_player_activates_session() {
        let mut tasks = JoinSet::new();
        let session = test_session(small_config());
        let (connection, _reader, _client) = test_connection(1, &mut tasks);

        assert_eq!(session.phase().await, SessionPhase::Empty);
        assert_ok!(session.add_player(Player::new(1), connection).await);
        assert_eq!(session.phase().await, SessionPhase::Active);
        assert_eq!(session.player_count().await, 1);
    }

    #[tokio::test]
    async fn test_capacity_is_enforced() {
        let mut tasks = JoinSet::new();
        let session = test_session(small_config());
        let mut clients = Vec::new();

        for id in 1..=2 {
            let (connection, _reader, client) = test_connection(id, &mut tasks);
            clients.push(client);
            assert_ok!(session.add_player(Player::new(id), connection).await);
        }
        assert!(session.is_full().await);

        let (connection, _reader, _client) = test_connection(3, &mut tasks);
        let error = assert_err!(session.add_player(Player::new(3), connection).await);
        assert!(matches!(
            error,
            ServerError::Capacity {
                session_id: 1,
                capacity: 2
            }
        ));
        assert_eq!(session.player_count().await, 2);
    }

    #[tokio::test]
    async fn test_step_broadcasts_snapshot() {
        let mut tasks = JoinSet::new();
        let session = test_session(small_config());
        let (connection, _reader, mut client) = test_connection(1, &mut tasks);
        session.add_player(Player::new(1), connection).await.unwrap();

        assert_eq!(session.step().await, SessionPhase::Active);

        let mut decoder = FrameDecoder::new();
        let packets = next_packets(&mut client, &mut decoder).await;
        match &packets[0] {
            Packet::Snapshot(snapshot) => {
                assert_eq!(snapshot.players.len(), 1);
                assert_eq!(snapshot.meta.width, 6);
                assert_eq!(snapshot.segments_of(1).count(), 3);
            }
            other => panic!("expected a snapshot, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_wall_death_drains_then_closes() {
        let mut tasks = JoinSet::new();
        let session = test_session(small_config());
        let (connection, _reader, mut client) = test_connection(1, &mut tasks);
        session.add_player(Player::new(1), connection.clone()).await.unwrap();

        // Head spawns at x = 3 moving right; x = 5 is the wall.
        assert_eq!(session.step().await, SessionPhase::Active);
        assert_eq!(session.step().await, SessionPhase::Active);
        assert_eq!(session.player_count().await, 0);
        assert_ne!(connection.state(), ConnectionState::Active);

        let mut decoder = FrameDecoder::new();
        let mut seen = Vec::new();
        while !seen.contains(&Packet::Event(Event::Dead(0))) {
            seen.extend(next_packets(&mut client, &mut decoder).await);
        }

        assert_eq!(session.step().await, SessionPhase::Draining);

        let (late, _reader, _late_client) = test_connection(2, &mut tasks);
        let error = assert_err!(session.add_player(Player::new(2), late).await);
        assert!(matches!(error, ServerError::SessionClosed(1)));

        assert_eq!(session.step().await, SessionPhase::Closed);
        assert_eq!(session.step().await, SessionPhase::Closed);
    }

    #[tokio::test]
    async fn test_dead_connection_is_evicted() {
        let mut tasks = JoinSet::new();
        let config = Arc::new(SessionConfig {
            apple_count: 0,
            ..Default::default()
        });
        let session = test_session(config);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let (stays, stays_reader, _stays_client) = test_connection(1, &mut tasks);
        let (leaves, leaves_reader, leaves_client) = test_connection(2, &mut tasks);
        session.add_player(Player::new(1), stays.clone()).await.unwrap();
        session.add_player(Player::new(2), leaves.clone()).await.unwrap();
        stays.start(stays_reader, session.clone(), shutdown_rx.clone(), &mut tasks);
        leaves.start(leaves_reader, session.clone(), shutdown_rx, &mut tasks);

        drop(leaves_client);
        for _ in 0..200 {
            if leaves.is_dead() {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        assert!(leaves.is_dead());

        session.step().await;
        assert_eq!(session.player_count().await, 1);
        assert!(session.snapshot().await.player(2).is_none());
        assert!(matches!(
            leaves.state(),
            ConnectionState::Closing | ConnectionState::Closed
        ));
        assert_eq!(stays.state(), ConnectionState::Active);

        shutdown_tx.send(true).unwrap();
    }

    #[tokio::test]
    async fn test_failed_write_is_evicted_on_next_step() {
        let mut tasks = JoinSet::new();
        let session = test_session(Arc::new(SessionConfig {
            apple_count: 0,
            ..Default::default()
        }));
        let (connection, _reader, client) = test_connection(1, &mut tasks);
        session.add_player(Player::new(1), connection.clone()).await.unwrap();
        drop(client);

        // The snapshot broadcast by this step is the write that fails.
        assert_eq!(session.step().await, SessionPhase::Active);
        for _ in 0..200 {
            if connection.is_dead() {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        assert!(connection.is_dead());
        assert_eq!(session.player_count().await, 1);

        session.step().await;
        assert_eq!(session.player_count().await, 0);
        assert!(matches!(
            connection.state(),
            ConnectionState::Closing | ConnectionState::Closed
        ));
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let mut tasks = JoinSet::new();
        let session = test_session(Arc::new(SessionConfig::default()));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (connection, _reader, mut client) = test_connection(1, &mut tasks);
        session.add_player(Player::new(1), connection).await.unwrap();

        let handle = tokio::spawn(session.clone().run(shutdown_rx));
        sleep(Duration::from_millis(150)).await;
        shutdown_tx.send(true).unwrap();

        assert_ok!(timeout(Duration::from_secs(2), handle).await);
        assert_eq!(session.phase().await, SessionPhase::Closed);
        assert_eq!(session.player_count().await, 0);

        let mut decoder = FrameDecoder::new();
        let mut seen = Vec::new();
        while !seen.iter().any(|p| matches!(p, Packet::Event(Event::Dead(_)))) {
            seen.extend(next_packets(&mut client, &mut decoder).await);
        }
        assert!(seen.iter().any(|p| matches!(p, Packet::Snapshot(_))));
    }

    #[tokio::test]
    async fn test_run_exits_after_session_empties() {
        let mut tasks = JoinSet::new();
        let session = test_session(small_config());
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let (connection, _reader, _client) = test_connection(1, &mut tasks);
        session.add_player(Player::new(1), connection).await.unwrap();

        let handle = tokio::spawn(session.clone().run(shutdown_rx));

        assert_ok!(timeout(Duration::from_secs(2), handle).await);
        assert_eq!(session.phase().await, SessionPhase::Closed);
    }
}
