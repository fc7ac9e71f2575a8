//! Network Layer
//!
//! WebSocket transport, authentication, and the shared session registry.
//! Game rules live in `game/`; nothing here decides a move.

pub mod auth;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod server;

pub use auth::{authenticate_user, validate_token, AuthConfig, AuthError, Principal, TokenClaims};
pub use protocol::{ClientMessage, DecodeError, ErrorCode, GameSnapshot, ServerError, ServerMessage};
pub use registry::{Connection, ConnectionId, EvictionPolicy, SessionRegistry};
pub use router::{deliver, DeliveryReport};
pub use server::{GameServer, GameServerError, ServerConfig};
