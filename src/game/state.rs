//! Game State Definitions
//!
//! State of one tic-tac-toe game and its transition rules.
//! No I/O and no locking: the registry owns every `GameState`
//! and calls in here while holding the game's lock.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::game::board::{Board, Symbol, BOARD_CELLS};

/// Caller-chosen game identifier.
pub type GameId = String;

/// Maximum participants in one game.
pub const MAX_PLAYERS: usize = 2;

// =============================================================================
// PLAYER ID
// =============================================================================

/// Participant identifier (the authenticated username).
///
/// Implements Ord so `players` iterates in a stable order.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlayerId(String);

impl PlayerId {
    /// Create from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow as `&str`.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PlayerId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for PlayerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// =============================================================================
// ERRORS
// =============================================================================

/// Game rule violations.
///
/// Display strings are the human-readable messages sent to clients.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GameError {
    /// No game under that id.
    #[error("Game not found")]
    GameNotFound,

    /// Both seats are taken.
    #[error("Game is already full")]
    GameFull,

    /// Second player has not joined yet.
    #[error("Game is not ready to start")]
    GameNotReady,

    /// Game has been won or drawn.
    #[error("Game is already over")]
    GameOver,

    /// Mover is not the player whose turn it is.
    #[error("Not your turn")]
    NotPlayersTurn,

    /// Position outside 0..=8.
    #[error("Invalid position")]
    InvalidMove,

    /// Target cell already holds a symbol.
    #[error("Position already occupied")]
    PositionOccupied,
}

// =============================================================================
// PHASE
// =============================================================================

/// Per-game state machine, derived from the state fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GamePhase {
    /// Only the creator has entered.
    WaitingForSecondPlayer,
    /// Both players present, no move yet.
    Ready,
    /// At least one move played.
    InProgress,
    /// Terminal. `None` winner means a draw.
    Over {
        /// Winning participant, if any.
        winner: Option<PlayerId>,
    },
}

/// Result of an accepted move.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MoveOutcome {
    /// Game continues with `next_turn` to play.
    Continue {
        /// Participant to move next.
        next_turn: PlayerId,
    },
    /// Mover completed a line.
    Won {
        /// The mover.
        winner: PlayerId,
    },
    /// Board filled without a line.
    Draw,
}

// =============================================================================
// GAME STATE
// =============================================================================

/// Complete state of one game.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GameState {
    /// Game identifier.
    pub id: GameId,
    /// The grid.
    pub board: Board,
    /// Participant -> symbol. Never more than two entries.
    pub players: BTreeMap<PlayerId, Symbol>,
    /// Participant whose turn it is. Always a key of `players`.
    pub turn: PlayerId,
    /// Set only once `over` is true.
    pub winner: Option<PlayerId>,
    /// True once two participants have joined.
    pub ready: bool,
    /// True once won or drawn. The board is frozen afterwards.
    pub over: bool,
}

impl GameState {
    /// Fresh game with `creator` seated as `X` and on turn.
    pub fn new(id: impl Into<GameId>, creator: PlayerId) -> Self {
        let mut players = BTreeMap::new();
        players.insert(creator.clone(), Symbol::X);
        Self {
            id: id.into(),
            board: Board::new(),
            players,
            turn: creator,
            winner: None,
            ready: false,
            over: false,
        }
    }

    /// Current phase of the game.
    pub fn phase(&self) -> GamePhase {
        if self.over {
            GamePhase::Over {
                winner: self.winner.clone(),
            }
        } else if !self.ready {
            GamePhase::WaitingForSecondPlayer
        } else if self.board.occupied() == 0 {
            GamePhase::Ready
        } else {
            GamePhase::InProgress
        }
    }

    /// Symbol assigned to `player`, if seated.
    pub fn symbol_of(&self, player: &PlayerId) -> Option<Symbol> {
        self.players.get(player).copied()
    }

    /// Seat `player` as `O`.
    ///
    /// A participant already seated in a non-full game keeps their seat
    /// and gets their existing symbol back.
    pub fn join(&mut self, player: &PlayerId) -> Result<Symbol, GameError> {
        if self.players.len() >= MAX_PLAYERS {
            return Err(GameError::GameFull);
        }
        if let Some(symbol) = self.symbol_of(player) {
            return Ok(symbol);
        }

        self.players.insert(player.clone(), Symbol::O);
        self.ready = true;
        Ok(Symbol::O)
    }

    /// Play `player`'s symbol at `position`.
    ///
    /// Checks run in a fixed order: ready, not over, turn, range, emptiness.
    /// On error nothing is modified.
    pub fn apply_move(
        &mut self,
        player: &PlayerId,
        position: i64,
    ) -> Result<MoveOutcome, GameError> {
        if !self.ready {
            return Err(GameError::GameNotReady);
        }
        if self.over {
            return Err(GameError::GameOver);
        }
        if &self.turn != player {
            return Err(GameError::NotPlayersTurn);
        }

        let position = usize::try_from(position)
            .ok()
            .filter(|p| *p < BOARD_CELLS)
            .ok_or(GameError::InvalidMove)?;

        if !self.board.get(position).is_some_and(|c| c.is_empty()) {
            return Err(GameError::PositionOccupied);
        }

        // `turn` is always seated
        let symbol = self.symbol_of(player).ok_or(GameError::NotPlayersTurn)?;
        self.board.place(position, symbol);

        if self.board.winning_symbol().is_some() {
            self.winner = Some(player.clone());
            self.over = true;
            return Ok(MoveOutcome::Won {
                winner: player.clone(),
            });
        }

        if self.board.is_full() {
            self.over = true;
            return Ok(MoveOutcome::Draw);
        }

        if let Some(next) = self.players.keys().find(|id| *id != player) {
            self.turn = next.clone();
        }
        Ok(MoveOutcome::Continue {
            next_turn: self.turn.clone(),
        })
    }
}

// =============================================================================
// ENGINE OPERATIONS
// =============================================================================

/// Create a game. Always succeeds.
pub fn create_game(id: impl Into<GameId>, creator: PlayerId) -> GameState {
    GameState::new(id, creator)
}

/// Join a game that may not exist.
pub fn join_game(game: Option<&mut GameState>, player: &PlayerId) -> Result<Symbol, GameError> {
    game.ok_or(GameError::GameNotFound)?.join(player)
}

/// Move in a game that may not exist.
pub fn make_move(
    game: Option<&mut GameState>,
    player: &PlayerId,
    position: i64,
) -> Result<MoveOutcome, GameError> {
    game.ok_or(GameError::GameNotFound)?.apply_move(player, position)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::board::Cell;
    use proptest::prelude::*;

    fn alice() -> PlayerId {
        PlayerId::from("alice")
    }

    fn bob() -> PlayerId {
        PlayerId::from("bob")
    }

    fn ready_game() -> GameState {
        let mut game = create_game("g1", alice());
        game.join(&bob()).unwrap();
        game
    }

    #[test]
    fn test_create_game() {
        let game = create_game("g1", alice());
        assert_eq!(game.players.len(), 1);
        assert_eq!(game.symbol_of(&alice()), Some(Symbol::X));
        assert_eq!(game.turn, alice());
        assert!(!game.ready);
        assert!(!game.over);
        assert_eq!(game.phase(), GamePhase::WaitingForSecondPlayer);
    }

    #[test]
    fn test_join_game() {
        let game = ready_game();
        assert_eq!(game.symbol_of(&bob()), Some(Symbol::O));
        assert!(game.ready);
        assert_eq!(game.turn, alice());
        assert_eq!(game.phase(), GamePhase::Ready);
    }

    #[test]
    fn test_join_missing_game() {
        let result = join_game(None, &bob());
        assert_eq!(result, Err(GameError::GameNotFound));
    }

    #[test]
    fn test_join_full_game() {
        let mut game = ready_game();
        let before = game.players.clone();
        assert_eq!(game.join(&PlayerId::from("carol")), Err(GameError::GameFull));
        assert_eq!(game.join(&alice()), Err(GameError::GameFull));
        assert_eq!(game.players, before);
    }

    #[test]
    fn test_creator_rejoin_keeps_seat() {
        let mut game = create_game("g1", alice());
        assert_eq!(game.join(&alice()), Ok(Symbol::X));
        assert_eq!(game.players.len(), 1);
        assert!(!game.ready);
    }

    #[test]
    fn test_move_validation_order() {
        // Missing game first
        assert_eq!(make_move(None, &alice(), 0), Err(GameError::GameNotFound));

        // Not ready beats everything else
        let mut game = create_game("g1", alice());
        assert_eq!(game.apply_move(&bob(), 42), Err(GameError::GameNotReady));

        // Turn checked before range
        let mut game = ready_game();
        assert_eq!(game.apply_move(&bob(), 42), Err(GameError::NotPlayersTurn));

        // Range checked before occupancy
        assert_eq!(game.apply_move(&alice(), 9), Err(GameError::InvalidMove));
        assert_eq!(game.apply_move(&alice(), -1), Err(GameError::InvalidMove));
    }

    #[test]
    fn test_occupied_position_rejected() {
        let mut game = ready_game();
        game.apply_move(&alice(), 0).unwrap();
        assert_eq!(game.board.get(0), Some(Cell::X));
        assert_eq!(game.turn, bob());

        let before = game.clone();
        assert_eq!(game.apply_move(&bob(), 0), Err(GameError::PositionOccupied));
        assert_eq!(game, before);
        assert_eq!(game.phase(), GamePhase::InProgress);
    }

    #[test]
    fn test_top_row_win() {
        let mut game = ready_game();
        game.apply_move(&alice(), 0).unwrap();
        game.apply_move(&bob(), 3).unwrap();
        game.apply_move(&alice(), 1).unwrap();
        game.apply_move(&bob(), 4).unwrap();
        let outcome = game.apply_move(&alice(), 2).unwrap();

        assert_eq!(outcome, MoveOutcome::Won { winner: alice() });
        assert!(game.over);
        assert_eq!(game.winner, Some(alice()));
        assert_eq!(game.phase(), GamePhase::Over { winner: Some(alice()) });
    }

    #[test]
    fn test_moves_rejected_after_over() {
        let mut game = ready_game();
        for (player, pos) in [(alice(), 0), (bob(), 3), (alice(), 1), (bob(), 4), (alice(), 2)] {
            game.apply_move(&player, pos).unwrap();
        }
        let before = game.clone();
        assert_eq!(game.apply_move(&bob(), 5), Err(GameError::GameOver));
        assert_eq!(game.apply_move(&alice(), 8), Err(GameError::GameOver));
        assert_eq!(game, before);
    }

    #[test]
    fn test_draw() {
        // X O X
        // X O O
        // O X X
        let mut game = ready_game();
        let moves = [
            (alice(), 0),
            (bob(), 1),
            (alice(), 2),
            (bob(), 4),
            (alice(), 3),
            (bob(), 5),
            (alice(), 7),
            (bob(), 6),
        ];
        for (player, pos) in moves {
            assert!(matches!(
                game.apply_move(&player, pos).unwrap(),
                MoveOutcome::Continue { .. }
            ));
        }
        assert_eq!(game.apply_move(&alice(), 8).unwrap(), MoveOutcome::Draw);
        assert!(game.over);
        assert_eq!(game.winner, None);
        assert_eq!(game.phase(), GamePhase::Over { winner: None });
    }

    #[test]
    fn test_player_id_serializes_as_string() {
        let json = serde_json::to_string(&alice()).unwrap();
        assert_eq!(json, "\"alice\"");
    }

    #[test]
    fn test_random_playouts_terminate() {
        use rand::seq::SliceRandom;
        use rand::{rngs::StdRng, SeedableRng};

        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..200 {
            let mut game = ready_game();
            let mut order: Vec<i64> = (0..9).collect();
            order.shuffle(&mut rng);

            let mut moves = 0;
            for pos in order {
                let mover = game.turn.clone();
                match game.apply_move(&mover, pos).unwrap() {
                    MoveOutcome::Continue { .. } => moves += 1,
                    MoveOutcome::Won { winner } => {
                        assert_eq!(winner, mover);
                        break;
                    }
                    MoveOutcome::Draw => {
                        assert_eq!(moves, 8);
                        break;
                    }
                }
            }
            assert!(game.over);
        }
    }

    proptest! {
        #[test]
        fn prop_move_sequences_hold_invariants(
            moves in proptest::collection::vec((0usize..3, -2i64..11), 0..40)
        ) {
            let players = [alice(), bob(), PlayerId::from("mallory")];
            let mut game = ready_game();

            for (who, pos) in moves {
                let mover = &players[who];
                let before = game.clone();
                match game.apply_move(mover, pos) {
                    Ok(outcome) => {
                        let p = pos as usize;
                        // Exactly one cell went from empty to occupied
                        prop_assert!(before.board.get(p).unwrap().is_empty());
                        prop_assert_eq!(game.board.occupied(), before.board.occupied() + 1);
                        prop_assert_eq!(game.board.get(p).unwrap().symbol(), before.symbol_of(mover));

                        let has_line = game.board.winning_symbol().is_some();
                        match outcome {
                            MoveOutcome::Won { winner } => {
                                prop_assert!(has_line);
                                prop_assert_eq!(&winner, mover);
                                prop_assert_eq!(game.winner.as_ref(), Some(mover));
                            }
                            MoveOutcome::Draw => {
                                prop_assert!(!has_line);
                                prop_assert!(game.board.is_full());
                                prop_assert!(game.winner.is_none());
                            }
                            MoveOutcome::Continue { next_turn } => {
                                prop_assert!(!has_line);
                                prop_assert_ne!(&next_turn, mover);
                                prop_assert!(game.players.contains_key(&next_turn));
                            }
                        }
                    }
                    Err(_) => prop_assert_eq!(&game, &before),
                }

                // Occupied cells never change
                for (i, cell) in before.board.cells().iter().enumerate() {
                    if !cell.is_empty() {
                        prop_assert_eq!(game.board.get(i), Some(*cell));
                    }
                }
                prop_assert!(game.players.len() <= MAX_PLAYERS);
                prop_assert!(game.winner.is_none() || game.over);
            }
        }
    }
}
