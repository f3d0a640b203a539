use crate::config::SessionConfig;
use crate::connection::PlayerConnection;
use crate::error::ServerError;
use crate::session::{GameSession, SessionPhase};
use log::{debug, info, warn};
use shared::Player;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tokio::task::JoinSet;

/// Where a newly accepted player ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    pub player_id: u32,
    pub session_id: u32,
}

/// Routes every new connection into the first session with room, opening a
/// new one when all are full or draining. Owns every spawned task so shutdown
/// can wait for them.
pub struct MatchMaker {
    config: Arc<SessionConfig>,
    sessions: Vec<GameSession>,
    next_player_id: u32,
    next_session_id: u32,
    shutdown: watch::Receiver<bool>,
    tasks: JoinSet<()>,
}

impl MatchMaker {
    /// Fails with `Config` if sessions could not be built from `config`.
    pub fn new(
        config: Arc<SessionConfig>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self, ServerError> {
        config.validate()?;
        Ok(Self {
            config,
            sessions: Vec::new(),
            next_player_id: 1,
            next_session_id: 1,
            shutdown,
            tasks: JoinSet::new(),
        })
    }

    /// Sessions still tracked, in creation order.
    pub fn sessions(&self) -> &[GameSession] {
        &self.sessions
    }

    /// Wraps the stream in a connection, seats the player and starts reading.
    pub async fn on_connect<S>(&mut self, stream: S, addr: SocketAddr) -> Result<Placement, ServerError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        self.prune().await;

        let player_id = self.next_player_id;
        self.next_player_id = self.next_player_id.wrapping_add(1).max(1);
        info!("New client connected from {} as player {}", addr, player_id);

        let (connection, reader) = PlayerConnection::new(stream, addr, player_id, &mut self.tasks);

        let session = match self.place(Player::new(player_id), &connection).await {
            Ok(session) => session,
            Err(e) => {
                connection.kill(0);
                return Err(e);
            }
        };

        connection.start(reader, session.clone(), self.shutdown.clone(), &mut self.tasks);
        Ok(Placement {
            player_id,
            session_id: session.id(),
        })
    }

    async fn place(
        &mut self,
        player: Player,
        connection: &PlayerConnection,
    ) -> Result<GameSession, ServerError> {
        for session in &self.sessions {
            match session.add_player(player.clone(), connection.clone()).await {
                Ok(()) => return Ok(session.clone()),
                Err(e) if e.is_routing() || matches!(e, ServerError::NoSpace { .. }) => {
                    debug!("Skipping session {}: {}", session.id(), e);
                }
                Err(e) => return Err(e),
            }
        }

        let session_id = self.next_session_id;
        self.next_session_id += 1;

        let session = GameSession::new(session_id, Arc::clone(&self.config));
        session.add_player(player, connection.clone()).await?;
        self.tasks.spawn(session.clone().run(self.shutdown.clone()));
        self.sessions.push(session.clone());

        info!("Opened session {} ({} open)", session_id, self.sessions.len());
        Ok(session)
    }

    /// Forgets closed sessions and reaps finished tasks.
    pub async fn prune(&mut self) {
        let mut open = Vec::with_capacity(self.sessions.len());
        for session in self.sessions.drain(..) {
            if session.phase().await == SessionPhase::Closed {
                debug!("Dropping closed session {}", session.id());
            } else {
                open.push(session);
            }
        }
        self.sessions = open;

        while let Some(result) = self.tasks.try_join_next() {
            if let Err(e) = result {
                warn!("Task ended abnormally: {}", e);
            }
        }
    }

    /// Waits for every session, reader and writer task to finish. The
    /// shutdown signal must already have been sent.
    pub async fn shutdown(&mut self) {
        info!("Waiting for {} tasks to finish", self.tasks.len());
        while let Some(result) = self.tasks.join_next().await {
            if let Err(e) = result {
                warn!("Task ended abnormally: {}", e);
            }
        }
        self.sessions.clear();
        info!("All sessions stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::DuplexStream;
    use tokio::time::timeout;
    use tokio_test::assert_ok;

    fn test_config(max_players: usize) -> Arc<SessionConfig> {
        Arc::new(SessionConfig {
            max_players,
            apple_count: 0,
            ..Default::default()
        })
    }

    fn test_addr() -> SocketAddr {
        "127.0.0.1:7000".parse().unwrap()
    }

    #[tokio::test]
    async fn test_overflow_opens_new_session() {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut matchmaker = MatchMaker::new(test_config(2), shutdown_rx).unwrap();
        let mut clients: Vec<DuplexStream> = Vec::new();
        let mut placements = Vec::new();

        for _ in 0..3 {
            let (client, server_side) = tokio::io::duplex(1 << 16);
            clients.push(client);
            placements.push(assert_ok!(matchmaker.on_connect(server_side, test_addr()).await));
        }

        let ids: Vec<u32> = placements.iter().map(|p| p.player_id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        let sessions: Vec<u32> = placements.iter().map(|p| p.session_id).collect();
        assert_eq!(sessions, vec![1, 1, 2]);

        assert_eq!(matchmaker.sessions().len(), 2);
        assert_eq!(matchmaker.sessions()[0].player_count().await, 2);
        assert_eq!(matchmaker.sessions()[1].player_count().await, 1);

        shutdown_tx.send(true).unwrap();
        assert_ok!(timeout(Duration::from_secs(5), matchmaker.shutdown()).await);
        assert!(matchmaker.sessions().is_empty());
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        for config in [
            SessionConfig {
                width: 2,
                ..Default::default()
            },
            SessionConfig {
                max_players: 0,
                ..Default::default()
            },
        ] {
            let result = MatchMaker::new(Arc::new(config), shutdown_rx.clone());
            assert!(matches!(result, Err(ServerError::Config(_))));
        }
    }

    #[tokio::test]
    async fn test_closed_sessions_are_pruned() {
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut matchmaker = MatchMaker::new(test_config(5), shutdown_rx).unwrap();

        let (client, server_side) = tokio::io::duplex(1 << 16);
        let first = matchmaker.on_connect(server_side, test_addr()).await.unwrap();
        matchmaker.sessions()[0].close().await;
        drop(client);

        matchmaker.prune().await;
        assert!(matchmaker.sessions().is_empty());

        let (_client, server_side) = tokio::io::duplex(1 << 16);
        let second = matchmaker.on_connect(server_side, test_addr()).await.unwrap();
        assert_ne!(first.session_id, second.session_id);
        assert_eq!(second.player_id, 2);
    }
}
