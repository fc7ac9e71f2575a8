//! # Tic-Tac-Toe Game Server
//!
//! Real-time two-player tic-tac-toe over authenticated WebSockets.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   TIC-TAC-TOE SERVER                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  game/           - Rules (pure, no I/O)                      │
//! │  ├── board.rs    - Cells, symbols, win lines                 │
//! │  └── state.rs    - Game state, create/join/move              │
//! │                                                              │
//! │  network/        - Transport and shared state                │
//! │  ├── auth.rs     - Bearer JWT validation                     │
//! │  ├── protocol.rs - Wire messages and error codes             │
//! │  ├── registry.rs - Connections and games under locks         │
//! │  ├── router.rs   - Per-game broadcast fan-out                │
//! │  └── server.rs   - WebSocket server                          │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Consistency
//!
//! Every mutation of a game and the broadcast of its resulting snapshot
//! happen under that game's lock, so all participants observe snapshots
//! in the order the mutations were applied.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod game;
pub mod network;

// Re-export commonly used types
pub use game::board::{Board, Cell, Symbol};
pub use game::state::{GameError, GameId, GameState, PlayerId};
pub use network::protocol::{ClientMessage, ServerMessage};
pub use network::registry::SessionRegistry;
pub use network::server::{GameServer, ServerConfig};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
