//! # Snake Server Library
//!
//! Authoritative server for a multiplayer snake game played over TCP. The
//! server owns every game state, applies player intent once per tick and
//! pushes a full snapshot of the field to each player after every tick.
//!
//! ## Core Responsibilities
//!
//! ### Authoritative Simulation
//! Snakes move one cell per tick. Walls, other snakes and a snake's own body
//! are lethal. Eating an apple scores a point and grows the snake by one
//! segment. Clients only ever send a nickname and a heading; everything else
//! is decided here.
//!
//! ### Matchmaking
//! Every accepted socket is seated in the first session with room. When all
//! sessions are full or winding down a new one is opened, so any number of
//! games can run side by side.
//!
//! ### State Broadcasting
//! After each tick the session encodes one snapshot frame and queues the same
//! bytes to every connection. Dead players receive a final `Dead(score)`
//! frame before their socket is closed.
//!
//! ## Architecture Design
//!
//! ### Task Layout
//! - **Listener**: accepts sockets and hands them to the matchmaker
//! - **Session tick loop**: one task per session, fixed rate
//! - **Connection reader**: decodes inbound frames, records intent
//! - **Connection writer**: drains the outbound queue onto the socket
//!
//! ### Locking
//! Each session guards its state with one async mutex. Readers take it only
//! long enough to record a nickname or a turn; the tick holds it for the
//! whole simulate-and-broadcast pass. Writers never touch it.
//!
//! ### Wire Format
//! Frames are a 4-byte big-endian length followed by a bincode payload. See
//! [`shared::codec`].
//!
//! ## Module Organization
//!
//! - `config`: session parameters and their validation
//! - `connection`: per-socket reader/writer tasks and the kill path
//! - `error`: the server-wide error type
//! - `game`: grid simulation, collisions, apples
//! - `matchmaker`: session routing and task ownership
//! - `network`: TCP listener, accept loop, shutdown handle
//! - `session`: tick loop and session lifecycle
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::config::SessionConfig;
//! use server::network::Server;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut server = Server::bind("127.0.0.1:65444", SessionConfig::default()).await?;
//!
//!     let shutdown = server.shutdown_handle();
//!     tokio::spawn(async move {
//!         let _ = tokio::signal::ctrl_c().await;
//!         shutdown.shutdown();
//!     });
//!
//!     // Accepts clients until shut down, then waits for every session.
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod game;
pub mod matchmaker;
pub mod network;
pub mod session;

pub use config::SessionConfig;
pub use error::ServerError;
pub use network::{Server, ShutdownHandle};
