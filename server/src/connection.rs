//! Per-socket player connection.
//!
//! Every accepted socket is split in two. A writer task drains an unbounded
//! outbound queue onto the socket, so the tick loop never waits on a slow
//! client. A receive loop decodes inbound frames and forwards the player's
//! intent to the owning session.

use crate::session::GameSession;
use log::{debug, info, trace, warn};
use shared::{encode, Event, FrameDecoder, Packet, ProtocolError};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::timeout;

/// How long a read may block before the loop re-checks its stop flags.
pub const READ_TIMEOUT: Duration = Duration::from_millis(500);

/// A client that cannot take a frame within this window is treated as gone.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

const READ_BUFFER_SIZE: usize = 4096;

/// An encoded frame, shared between every connection it is broadcast to.
pub type Frame = Arc<Vec<u8>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Socket accepted, not yet attached to a session.
    Connected,
    /// Attached to a session and receiving intent.
    Active,
    /// Killed; the death notice and close are queued.
    Closing,
    /// Socket shut down.
    Closed,
}

enum Outbound {
    Frame(Frame),
    Close,
}

/// Bookkeeping shared with the writer task. Kept apart from the outbound
/// sender so the writer does not keep its own queue alive.
#[derive(Debug)]
struct ConnectionStatus {
    state: Mutex<ConnectionState>,
    dead: AtomicBool,
    killed: AtomicBool,
}

impl ConnectionStatus {
    fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, next: ConnectionState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = next;
    }
}

struct ConnectionInner {
    player_id: u32,
    addr: SocketAddr,
    status: Arc<ConnectionStatus>,
    outbound: mpsc::UnboundedSender<Outbound>,
    stop: watch::Sender<bool>,
}

/// Handle to one player's socket. Cheap to clone; all clones refer to the
/// same connection.
#[derive(Clone)]
pub struct PlayerConnection {
    inner: Arc<ConnectionInner>,
}

impl std::fmt::Debug for PlayerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlayerConnection")
            .field("player_id", &self.inner.player_id)
            .field("addr", &self.inner.addr)
            .field("state", &self.state())
            .finish()
    }
}

impl PlayerConnection {
    /// Wraps an accepted stream and spawns its writer task. The returned read
    /// half is handed back to [`PlayerConnection::start`] once the player has
    /// a session.
    pub fn new<S>(
        stream: S,
        addr: SocketAddr,
        player_id: u32,
        tasks: &mut JoinSet<()>,
    ) -> (Self, ReadHalf<S>)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (stop, _) = watch::channel(false);

        let status = Arc::new(ConnectionStatus {
            state: Mutex::new(ConnectionState::Connected),
            dead: AtomicBool::new(false),
            killed: AtomicBool::new(false),
        });

        tasks.spawn(write_loop(writer, outbound_rx, Arc::clone(&status), player_id));

        let connection = Self {
            inner: Arc::new(ConnectionInner {
                player_id,
                addr,
                status,
                outbound: outbound_tx,
                stop,
            }),
        };

        (connection, reader)
    }

    pub fn player_id(&self) -> u32 {
        self.inner.player_id
    }

    pub fn addr(&self) -> SocketAddr {
        self.inner.addr
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.status.state()
    }

    /// True once the socket failed or the peer went away. The owning session
    /// evicts dead connections on its next tick.
    pub fn is_dead(&self) -> bool {
        self.inner.status.dead.load(Ordering::SeqCst)
    }

    fn mark_dead(&self) {
        if !self.inner.status.dead.swap(true, Ordering::SeqCst) {
            debug!("Player {} connection marked dead", self.inner.player_id);
        }
    }

    /// Moves the connection to `Active` and spawns its receive loop.
    pub fn start<R>(
        &self,
        reader: R,
        session: GameSession,
        shutdown: watch::Receiver<bool>,
        tasks: &mut JoinSet<()>,
    ) where
        R: AsyncRead + Unpin + Send + 'static,
    {
        if self.state() == ConnectionState::Connected {
            self.inner.status.set_state(ConnectionState::Active);
        }
        tasks.spawn(self.clone().receive_loop(reader, session, shutdown));
    }

    async fn receive_loop<R>(self, mut reader: R, session: GameSession, mut shutdown: watch::Receiver<bool>)
    where
        R: AsyncRead + Unpin,
    {
        let player_id = self.inner.player_id;
        let mut stop = self.inner.stop.subscribe();
        let mut decoder = FrameDecoder::new();
        let mut buffer = [0u8; READ_BUFFER_SIZE];

        loop {
            if *stop.borrow() || *shutdown.borrow() {
                break;
            }

            tokio::select! {
                _ = stop.changed() => break,
                _ = shutdown.changed() => break,
                read = timeout(READ_TIMEOUT, reader.read(&mut buffer)) => match read {
                    Err(_) => trace!("Player {} idle", player_id),
                    Ok(Ok(0)) => {
                        info!("Player {} disconnected", player_id);
                        self.mark_dead();
                        break;
                    }
                    Ok(Ok(n)) => {
                        if let Err(e) = self.dispatch(&session, decoder.decode(&buffer[..n])).await {
                            warn!("Dropping connection of player {}: {}", player_id, e);
                            self.mark_dead();
                            break;
                        }
                    }
                    Ok(Err(e)) => {
                        info!("Connection error for player {}: {}", player_id, e);
                        self.mark_dead();
                        break;
                    }
                },
            }
        }

        debug!("Receive loop for player {} stopped", player_id);
    }

    /// Applies decoded frames in order. Only a fatal codec error is returned.
    async fn dispatch(
        &self,
        session: &GameSession,
        frames: Vec<Result<Packet, ProtocolError>>,
    ) -> Result<(), ProtocolError> {
        for frame in frames {
            match frame {
                Ok(Packet::Event(event)) => self.handle(session, event).await,
                Ok(Packet::Snapshot(_)) => {
                    warn!("Unexpected snapshot from player {}", self.inner.player_id)
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => warn!("Dropping frame from player {}: {}", self.inner.player_id, e),
            }
        }
        Ok(())
    }

    /// Applies one client event to the player's session.
    pub async fn handle(&self, session: &GameSession, event: Event) {
        let player_id = self.inner.player_id;
        match event {
            Event::Nick(name) => {
                session.set_nickname(player_id, name).await;
            }
            Event::Dir(direction) => {
                if !direction.is_valid() {
                    warn!("Player {} sent invalid direction {:?}", player_id, direction);
                } else if !session.set_direction(player_id, direction).await {
                    debug!("Player {} direction {:?} ignored", player_id, direction);
                }
            }
            Event::Dead(_) => warn!("Player {} sent a server-only event", player_id),
        }
    }

    /// Queues an already encoded frame. Never blocks and never fails; a
    /// connection that can no longer take frames is marked dead instead.
    pub fn send(&self, frame: Frame) {
        if self.inner.status.killed.load(Ordering::SeqCst) || self.is_dead() {
            return;
        }
        if self.inner.outbound.send(Outbound::Frame(frame)).is_err() {
            self.mark_dead();
        }
    }

    pub fn send_packet(&self, packet: &Packet) -> Result<(), ProtocolError> {
        self.send(Arc::new(encode(packet)?));
        Ok(())
    }

    /// Sends the death notice, closes the socket and stops the receive loop.
    /// Calling it again has no effect.
    pub fn kill(&self, final_score: u32) {
        let status = &self.inner.status;
        if status.killed.swap(true, Ordering::SeqCst) {
            return;
        }
        status.set_state(ConnectionState::Closing);
        info!(
            "Closing connection of player {} with final score {}",
            self.inner.player_id, final_score
        );

        match encode(&Packet::Event(Event::Dead(final_score))) {
            Ok(frame) => {
                let _ = self.inner.outbound.send(Outbound::Frame(Arc::new(frame)));
            }
            Err(e) => warn!("Failed to encode death notice: {}", e),
        }
        if self.inner.outbound.send(Outbound::Close).is_err() {
            // Writer is already gone.
            status.set_state(ConnectionState::Closed);
        }

        self.inner.stop.send_replace(true);
    }
}

async fn write_loop<W>(
    mut writer: W,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    status: Arc<ConnectionStatus>,
    player_id: u32,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = outbound.recv().await {
        match message {
            Outbound::Frame(frame) => match timeout(WRITE_TIMEOUT, writer.write_all(&frame)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    debug!("Write to player {} failed: {}", player_id, e);
                    status.dead.store(true, Ordering::SeqCst);
                    break;
                }
                Err(_) => {
                    warn!("Write to player {} timed out", player_id);
                    status.dead.store(true, Ordering::SeqCst);
                    break;
                }
            },
            Outbound::Close => break,
        }
    }

    if let Err(e) = writer.shutdown().await {
        trace!("Shutdown of player {} socket failed: {}", player_id, e);
    }

    // Drop the queue before checking `killed` so a concurrent kill either
    // sees the send fail or is observed here.
    drop(outbound);
    if status.killed.load(Ordering::SeqCst) {
        status.set_state(ConnectionState::Closed);
    }
    debug!("Writer for player {} stopped", player_id);
}
