//! Broadcast Router
//!
//! Fans a message out to every connection associated with a game.
//! Enqueueing never blocks: a recipient whose queue is full or closed
//! is reported back for unregistration and skipped.

use std::collections::BTreeMap;

use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use crate::game::state::PlayerId;
use crate::network::protocol::ServerMessage;
use crate::network::registry::{Connection, ConnectionId};

/// Outcome of one fan-out.
#[derive(Debug, Default)]
pub struct DeliveryReport {
    /// Recipients the message was queued for.
    pub delivered: usize,
    /// Recipients that could not take the message.
    pub failed: Vec<(PlayerId, ConnectionId)>,
}

/// Queue `message` on every connection whose game is `game_id`.
///
/// Callers hold a read view of the connection set for the duration.
pub fn deliver(
    connections: &BTreeMap<PlayerId, Connection>,
    game_id: &str,
    message: &ServerMessage,
) -> DeliveryReport {
    let mut report = DeliveryReport::default();

    for conn in connections.values() {
        if conn.game_id.as_deref() != Some(game_id) {
            continue;
        }

        match conn.try_send(message.clone()) {
            Ok(()) => report.delivered += 1,
            Err(e) => {
                let reason = match e {
                    TrySendError::Full(_) => "outbound queue full",
                    TrySendError::Closed(_) => "connection closed",
                };
                warn!(
                    player_id = %conn.player_id,
                    conn_id = %conn.id,
                    game_id,
                    reason,
                    "Broadcast delivery failed"
                );
                report.failed.push((conn.player_id.clone(), conn.id));
            }
        }
    }

    debug!(game_id, delivered = report.delivered, failed = report.failed.len(), "Broadcast done");
    report
}
