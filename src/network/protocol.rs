//! Protocol Messages
//!
//! Wire format for client-server communication over WebSocket.
//! Every frame is a JSON object with a `type` tag and a `gameId`.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::game::board::{Board, Symbol};
use crate::game::state::{GameError, GameId, GameState, PlayerId};

// =============================================================================
// CLIENT -> SERVER MESSAGES
// =============================================================================

/// Messages sent from client to server.
///
/// Decoding goes through [`ClientMessage::from_json`], which maps bad
/// payload shapes to wire error codes instead of failing the frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Create (or replace) a game and take the `X` seat.
    CreateGame {
        /// Target game.
        #[serde(rename = "gameId")]
        game_id: GameId,
    },

    /// Take the `O` seat of an existing game.
    JoinGame {
        /// Target game.
        #[serde(rename = "gameId")]
        game_id: GameId,
    },

    /// Play a symbol.
    MakeMove {
        /// Target game.
        #[serde(rename = "gameId")]
        game_id: GameId,
        /// Move payload.
        data: MoveData,
    },
}

/// Payload of `make_move`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MoveData {
    /// Board index. Range is checked by the game rules, not the decoder.
    pub position: i64,
}

impl ClientMessage {
    /// Tag of this message, as on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::CreateGame { .. } => "create_game",
            ClientMessage::JoinGame { .. } => "join_game",
            ClientMessage::MakeMove { .. } => "make_move",
        }
    }

    /// Game this message targets.
    pub fn game_id(&self) -> &str {
        match self {
            ClientMessage::CreateGame { game_id }
            | ClientMessage::JoinGame { game_id }
            | ClientMessage::MakeMove { game_id, .. } => game_id,
        }
    }
}

/// Untyped envelope, only used while decoding.
///
/// Missing and `null` string fields both decode as empty.
#[derive(Debug, Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(rename = "gameId", default)]
    game_id: Option<GameId>,
    #[serde(default)]
    data: Option<Value>,
}

/// Inbound decoding failures.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// Frame is not a JSON envelope. Fatal to the connection.
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    /// Envelope is fine but the content is rejected. Reported to the client.
    #[error("rejected message: {error}")]
    Rejected {
        /// Game id echoed back in the error reply.
        game_id: GameId,
        /// Code and message for the reply.
        error: ServerError,
    },
}

impl DecodeError {
    /// The error reply for a rejected message, if this is one.
    pub fn reply(&self) -> Option<ServerMessage> {
        match self {
            DecodeError::Malformed(_) => None,
            DecodeError::Rejected { game_id, error } => Some(ServerMessage::Error {
                game_id: game_id.clone(),
                error: error.clone(),
            }),
        }
    }
}

/// Extract `data.position`, truncating fractional numbers.
fn parse_position(data: Option<&Value>) -> Result<i64, ErrorCode> {
    let data = data
        .and_then(Value::as_object)
        .ok_or(ErrorCode::InvalidMoveFormat)?;
    let position = data.get("position").ok_or(ErrorCode::InvalidPositionFormat)?;

    position
        .as_i64()
        .or_else(|| position.as_f64().map(|p| p.trunc() as i64))
        .ok_or(ErrorCode::InvalidPositionFormat)
}

// =============================================================================
// SERVER -> CLIENT MESSAGES
// =============================================================================

/// Messages sent from server to client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Current state of a game, pushed after every accepted mutation.
    GameState {
        /// Game the snapshot belongs to.
        #[serde(rename = "gameId")]
        game_id: GameId,
        /// The snapshot.
        data: GameSnapshot,
    },

    /// Request was rejected. Sent only to the requester.
    Error {
        /// Game named in the request (empty for unknown types).
        #[serde(rename = "gameId")]
        game_id: GameId,
        /// Code and message.
        error: ServerError,
    },
}

impl ServerMessage {
    /// Build a `game_state` message from a game.
    pub fn game_state(game: &GameState) -> Self {
        ServerMessage::GameState {
            game_id: game.id.clone(),
            data: GameSnapshot::from(game),
        }
    }

    /// Build an `error` reply for a game rule violation.
    pub fn game_error(game_id: impl Into<GameId>, err: &GameError) -> Self {
        ServerMessage::Error {
            game_id: game_id.into(),
            error: ServerError::from(err),
        }
    }
}

/// Snapshot of a game as sent to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameSnapshot {
    /// Nine cells, `""`, `"X"` or `"O"`.
    pub board: Board,
    /// Participant -> symbol.
    pub players: BTreeMap<PlayerId, Symbol>,
    /// Participant to move.
    pub turn: PlayerId,
    /// Winner, null until someone wins.
    pub winner: Option<PlayerId>,
    /// Won or drawn.
    pub game_over: bool,
    /// Both seats filled.
    pub game_ready: bool,
}

impl From<&GameState> for GameSnapshot {
    fn from(game: &GameState) -> Self {
        Self {
            board: game.board,
            players: game.players.clone(),
            turn: game.turn.clone(),
            winner: game.winner.clone(),
            game_over: game.over,
            game_ready: game.ready,
        }
    }
}

/// Server error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerError {
    /// Error code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
}

impl ServerError {
    /// Create an error with the code's standard message.
    pub fn new(code: ErrorCode) -> Self {
        Self {
            code,
            message: code.default_message().to_string(),
        }
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl From<&GameError> for ServerError {
    fn from(err: &GameError) -> Self {
        Self {
            code: ErrorCode::from(err),
            message: err.to_string(),
        }
    }
}

/// Error codes. Stable wire values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// No such game.
    GameNotFound,
    /// Both seats taken.
    GameFull,
    /// Position out of range.
    InvalidMove,
    /// Out of turn.
    NotPlayersTurn,
    /// Game not started, or already over.
    GameNotReady,
    /// Cell taken.
    PositionOccupied,
    /// `position` missing or not a number.
    InvalidPositionFormat,
    /// `data` missing or not an object.
    InvalidMoveFormat,
    /// Unrecognized `type` tag.
    UnknownMessageType,
}

impl ErrorCode {
    /// Wire value of the code.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::GameNotFound => "GAME_NOT_FOUND",
            ErrorCode::GameFull => "GAME_FULL",
            ErrorCode::InvalidMove => "INVALID_MOVE",
            ErrorCode::NotPlayersTurn => "NOT_PLAYERS_TURN",
            ErrorCode::GameNotReady => "GAME_NOT_READY",
            ErrorCode::PositionOccupied => "POSITION_OCCUPIED",
            ErrorCode::InvalidPositionFormat => "INVALID_POSITION_FORMAT",
            ErrorCode::InvalidMoveFormat => "INVALID_MOVE_FORMAT",
            ErrorCode::UnknownMessageType => "UNKNOWN_MESSAGE_TYPE",
        }
    }

    /// Message used when the code is raised outside the game rules.
    pub fn default_message(self) -> &'static str {
        match self {
            ErrorCode::GameNotFound => "Game not found",
            ErrorCode::GameFull => "Game is already full",
            ErrorCode::InvalidMove => "Invalid position",
            ErrorCode::NotPlayersTurn => "Not your turn",
            ErrorCode::GameNotReady => "Game is not ready to start",
            ErrorCode::PositionOccupied => "Position already occupied",
            ErrorCode::InvalidPositionFormat => "Position must be a number",
            ErrorCode::InvalidMoveFormat => "Invalid move data format",
            ErrorCode::UnknownMessageType => "Unknown message type",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&GameError> for ErrorCode {
    fn from(err: &GameError) -> Self {
        match err {
            GameError::GameNotFound => ErrorCode::GameNotFound,
            GameError::GameFull => ErrorCode::GameFull,
            GameError::GameNotReady | GameError::GameOver => ErrorCode::GameNotReady,
            GameError::NotPlayersTurn => ErrorCode::NotPlayersTurn,
            GameError::InvalidMove => ErrorCode::InvalidMove,
            GameError::PositionOccupied => ErrorCode::PositionOccupied,
        }
    }
}

// =============================================================================
// SERIALIZATION HELPERS
// =============================================================================

impl ClientMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Decode an inbound frame.
    pub fn from_json(s: &str) -> Result<Self, DecodeError> {
        let raw: RawEnvelope = serde_json::from_str(s)?;
        let game_id = raw.game_id.unwrap_or_default();

        match raw.kind.as_deref().unwrap_or_default() {
            "create_game" => Ok(ClientMessage::CreateGame { game_id }),
            "join_game" => Ok(ClientMessage::JoinGame { game_id }),
            "make_move" => match parse_position(raw.data.as_ref()) {
                Ok(position) => Ok(ClientMessage::MakeMove {
                    game_id,
                    data: MoveData { position },
                }),
                Err(code) => Err(DecodeError::Rejected {
                    game_id,
                    error: ServerError::new(code),
                }),
            },
            _ => Err(DecodeError::Rejected {
                game_id: GameId::new(),
                error: ServerError::new(ErrorCode::UnknownMessageType),
            }),
        }
    }
}

impl ServerMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}
