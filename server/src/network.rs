//! Server network layer: accepts TCP connections and hands them to the matchmaker

use crate::config::SessionConfig;
use crate::error::ServerError;
use crate::matchmaker::MatchMaker;
use log::{debug, error, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::time::timeout;

/// How long `accept` may block before the loop does housekeeping.
pub const ACCEPT_TIMEOUT: Duration = Duration::from_secs(1);

/// Cloneable trigger that stops the accept loop and every session.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    sender: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_shutdown(&self) -> bool {
        *self.sender.borrow()
    }
}

/// Main server coordinating the listener and the matchmaker
pub struct Server {
    listener: TcpListener,
    matchmaker: MatchMaker,
    shutdown: ShutdownHandle,
    shutdown_rx: watch::Receiver<bool>,
}

impl Server {
    pub async fn bind(addr: &str, config: SessionConfig) -> Result<Self, ServerError> {
        config.validate()?;

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: addr.to_string(),
                source,
            })?;
        info!("Server listening on {}", listener.local_addr()?);

        let (sender, shutdown_rx) = watch::channel(false);
        let matchmaker = MatchMaker::new(Arc::new(config), shutdown_rx.clone())?;
        Ok(Server {
            listener,
            matchmaker,
            shutdown: ShutdownHandle {
                sender: Arc::new(sender),
            },
            shutdown_rx,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Accepts clients until shut down, then waits for every session to stop.
    pub async fn run(&mut self) -> Result<(), ServerError> {
        let mut shutdown = self.shutdown_rx.clone();
        info!("Server started successfully");

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                _ = shutdown.changed() => break,

                accepted = timeout(ACCEPT_TIMEOUT, self.listener.accept()) => match accepted {
                    // Idle: nobody connected within the window.
                    Err(_) => self.matchmaker.prune().await,
                    Ok(Ok((stream, addr))) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!("Could not disable Nagle for {}: {}", addr, e);
                        }
                        match self.matchmaker.on_connect(stream, addr).await {
                            Ok(placement) => debug!(
                                "Player {} placed in session {}",
                                placement.player_id, placement.session_id
                            ),
                            Err(e) => warn!("Could not place client {}: {}", addr, e),
                        }
                    }
                    Ok(Err(e)) => {
                        error!("Error accepting connection: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                },
            }
        }

        info!("Server shutting down");
        self.matchmaker.shutdown().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::assert_ok;

    #[tokio::test]
    async fn test_bind_ephemeral_port() {
        let server = assert_ok!(Server::bind("127.0.0.1:0", SessionConfig::default()).await);
        let addr = server.local_addr().unwrap();
        assert_ne!(addr.port(), 0);
    }

    #[tokio::test]
    async fn test_bind_rejects_invalid_config() {
        let config = SessionConfig {
            tick_rate: 0,
            ..Default::default()
        };
        let result = Server::bind("127.0.0.1:0", config).await;
        assert!(matches!(result, Err(ServerError::Config(_))));
    }

    #[tokio::test]
    async fn test_bind_conflict_is_reported() {
        let first = Server::bind("127.0.0.1:0", SessionConfig::default()).await.unwrap();
        let taken = first.local_addr().unwrap().to_string();

        match Server::bind(&taken, SessionConfig::default()).await {
            Err(ServerError::Bind { addr, .. }) => assert_eq!(addr, taken),
            Err(e) => panic!("unexpected error: {}", e),
            Ok(_) => panic!("second bind on {} succeeded", taken),
        }
    }

    #[tokio::test]
    async fn test_shutdown_handle_stops_run() {
        let mut server = Server::bind("127.0.0.1:0", SessionConfig::default()).await.unwrap();
        let handle = server.shutdown_handle();
        assert!(!handle.is_shutdown());

        let running = tokio::spawn(async move { server.run().await });
        handle.shutdown();
        assert!(handle.is_shutdown());

        let result = timeout(Duration::from_secs(3), running).await;
        assert!(matches!(result, Ok(Ok(Ok(())))));
    }

    #[tokio::test]
    async fn test_bind_rejects_unparsable_address() {
        for addr in ["127.0.0.1:99999", "not-an-address"] {
            match Server::bind(addr, SessionConfig::default()).await {
                Err(ServerError::Bind { addr: reported, .. }) => assert_eq!(reported, addr),
                Err(e) => panic!("unexpected error for {}: {}", addr, e),
                Ok(_) => panic!("bind on {} succeeded", addr),
            }
        }
    }
}
