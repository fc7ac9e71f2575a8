//! Game Logic Module
//!
//! Pure tic-tac-toe rules. No I/O, no locking.
//!
//! ## Module Structure
//!
//! - `board`: Cells, symbols, win lines
//! - `state`: Game state and its create/join/move transitions

pub mod board;
pub mod state;

// Re-export key types
pub use board::{Board, Cell, Symbol, BOARD_CELLS, WIN_LINES};
pub use state::{
    create_game, join_game, make_move, GameError, GameId, GamePhase, GameState, MoveOutcome,
    PlayerId, MAX_PLAYERS,
};
