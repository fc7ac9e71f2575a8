//! Session Registry
//!
//! Owns every live connection and every game. All shared mutable state
//! lives here and is only reached through this API.
//!
//! ## Locking
//!
//! - `games`: map of per-game mutexes; distinct games mutate in parallel
//! - `connections`: participant id -> connection
//!
//! Locks are always taken in the order game -> connections. A broadcast
//! holds the game lock and a read view of the connections while it
//! enqueues, so deliveries for one game follow mutation order and no
//! connection is removed mid-iteration.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex, Notify, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::game::board::Symbol;
use crate::game::state::{self, GameError, GameId, GameState, MoveOutcome, PlayerId};
use crate::network::protocol::{GameSnapshot, ServerMessage};
use crate::network::router;

/// Identifies one registration of a participant.
pub type ConnectionId = Uuid;

// =============================================================================
// CONNECTION
// =============================================================================

/// A live, authenticated connection.
#[derive(Debug)]
pub struct Connection {
    /// Unique per registration.
    pub id: ConnectionId,
    /// Authenticated participant.
    pub player_id: PlayerId,
    /// Game this connection receives broadcasts for.
    pub game_id: Option<GameId>,
    /// Symbol held in that game.
    pub symbol: Option<Symbol>,
    /// Wall-clock connect time.
    pub connected_at: DateTime<Utc>,
    /// Outbound queue, drained by the connection's writer task.
    sender: mpsc::Sender<ServerMessage>,
    /// Fired when the registry drops this connection.
    closed: Arc<Notify>,
}

impl Connection {
    /// Create a connection feeding `sender`.
    pub fn new(player_id: PlayerId, sender: mpsc::Sender<ServerMessage>) -> Self {
        Self {
            id: Uuid::new_v4(),
            player_id,
            game_id: None,
            symbol: None,
            connected_at: Utc::now(),
            sender,
            closed: Arc::new(Notify::new()),
        }
    }

    /// Signal that fires once the registry has dropped this connection.
    pub fn closed_signal(&self) -> Arc<Notify> {
        self.closed.clone()
    }

    /// Enqueue without waiting.
    pub(crate) fn try_send(&self, message: ServerMessage) -> Result<(), TrySendError<ServerMessage>> {
        self.sender.try_send(message)
    }

    fn close(&self) {
        self.closed.notify_one();
    }
}

// =============================================================================
// GAME ENTRY
// =============================================================================

/// Game state plus bookkeeping for eviction.
#[derive(Debug)]
struct GameEntry {
    state: GameState,
    last_activity: Instant,
    finished_at: Option<Instant>,
}

impl GameEntry {
    fn new(state: GameState) -> Self {
        Self {
            state,
            last_activity: Instant::now(),
            finished_at: None,
        }
    }

    fn touch(&mut self) {
        let now = Instant::now();
        self.last_activity = now;
        if self.state.over && self.finished_at.is_none() {
            self.finished_at = Some(now);
        }
    }

    fn is_stale(&self, now: Instant, associated: bool, policy: &EvictionPolicy) -> bool {
        if let Some(finished_at) = self.finished_at {
            if now.saturating_duration_since(finished_at) >= policy.finished_game_ttl {
                return true;
            }
        }
        !associated && now.saturating_duration_since(self.last_activity) >= policy.abandoned_game_ttl
    }
}

/// When games are dropped from memory.
#[derive(Debug, Clone)]
pub struct EvictionPolicy {
    /// Time a finished game is kept.
    pub finished_game_ttl: Duration,
    /// Time a game nobody is connected to is kept after its last change.
    pub abandoned_game_ttl: Duration,
}

impl Default for EvictionPolicy {
    fn default() -> Self {
        Self {
            finished_game_ttl: Duration::from_secs(60),
            abandoned_game_ttl: Duration::from_secs(600),
        }
    }
}

// =============================================================================
// SESSION REGISTRY
// =============================================================================

/// Live connections and games.
pub struct SessionRegistry {
    /// Active games.
    games: RwLock<BTreeMap<GameId, Arc<Mutex<GameEntry>>>>,
    /// Live connections by participant.
    connections: RwLock<BTreeMap<PlayerId, Connection>>,
}

impl SessionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            games: RwLock::new(BTreeMap::new()),
            connections: RwLock::new(BTreeMap::new()),
        }
    }

    /// Add a connection.
    ///
    /// A participant has at most one live connection: an existing one is
    /// evicted, closed, and returned.
    pub async fn register_connection(&self, conn: Connection) -> Option<Connection> {
        let player_id = conn.player_id.clone();
        let conn_id = conn.id;

        let mut connections = self.connections.write().await;
        let evicted = connections.insert(player_id.clone(), conn);

        if let Some(old) = &evicted {
            old.close();
            warn!(
                player_id = %player_id,
                old_conn_id = %old.id,
                conn_id = %conn_id,
                "Evicted previous connection for participant"
            );
        }

        info!(
            player_id = %player_id,
            conn_id = %conn_id,
            total_connections = connections.len(),
            "Connection registered"
        );
        evicted
    }

    /// Remove a connection if `conn_id` is still the live registration.
    ///
    /// Returns false when the participant is gone or has been replaced.
    pub async fn unregister_connection(&self, player_id: &PlayerId, conn_id: ConnectionId) -> bool {
        let mut connections = self.connections.write().await;
        if connections.get(player_id).map(|c| c.id) != Some(conn_id) {
            debug!(player_id = %player_id, conn_id = %conn_id, "Stale unregister ignored");
            return false;
        }

        if let Some(conn) = connections.remove(player_id) {
            conn.close();
            info!(
                player_id = %player_id,
                conn_id = %conn_id,
                game_id = conn.game_id.as_deref().unwrap_or(""),
                remaining_connections = connections.len(),
                "Connection unregistered"
            );
        }
        true
    }

    /// Record the game a connection plays in after a create or join.
    pub async fn associate_game(
        &self,
        player_id: &PlayerId,
        conn_id: ConnectionId,
        game_id: &str,
        symbol: Symbol,
    ) -> bool {
        let mut connections = self.connections.write().await;
        match connections.get_mut(player_id) {
            Some(conn) if conn.id == conn_id => {
                conn.game_id = Some(game_id.to_string());
                conn.symbol = Some(symbol);
                true
            }
            _ => false,
        }
    }

    /// Create a game with `player` as `X`, replacing any game with that id.
    pub async fn create_game(&self, game_id: &str, player: &PlayerId) -> Symbol {
        let entry = GameEntry::new(state::create_game(game_id, player.clone()));

        let mut games = self.games.write().await;
        if games.insert(game_id.to_string(), Arc::new(Mutex::new(entry))).is_some() {
            warn!(game_id, player_id = %player, "Existing game replaced");
        }

        info!(game_id, player_id = %player, total_games = games.len(), "Game created");
        Symbol::X
    }

    /// Seat `player` in an existing game.
    pub async fn join_game(&self, game_id: &str, player: &PlayerId) -> Result<Symbol, GameError> {
        let result = self
            .with_game(game_id, |mut entry| {
                let result = state::join_game(entry.as_deref_mut().map(|e| &mut e.state), player);
                if let (Ok(_), Some(entry)) = (&result, entry) {
                    entry.touch();
                }
                result
            })
            .await;

        match &result {
            Ok(symbol) => info!(game_id, player_id = %player, ?symbol, "Player joined game"),
            Err(e) => warn!(game_id, player_id = %player, error = %e, "Join rejected"),
        }
        result
    }

    /// Play a move for `player`.
    pub async fn make_move(
        &self,
        game_id: &str,
        player: &PlayerId,
        position: i64,
    ) -> Result<MoveOutcome, GameError> {
        let result = self
            .with_game(game_id, |mut entry| {
                let result =
                    state::make_move(entry.as_deref_mut().map(|e| &mut e.state), player, position);
                if let (Ok(_), Some(entry)) = (&result, entry) {
                    entry.touch();
                }
                result
            })
            .await;

        match &result {
            Ok(MoveOutcome::Won { winner }) => {
                info!(game_id, winner = %winner, position, "Game won")
            }
            Ok(MoveOutcome::Draw) => info!(game_id, position, "Game ended in draw"),
            Ok(MoveOutcome::Continue { next_turn }) => {
                debug!(game_id, player_id = %player, position, next_turn = %next_turn, "Move completed")
            }
            Err(e) => warn!(game_id, player_id = %player, position, error = %e, "Move rejected"),
        }
        result
    }

    /// Push the current state of `game_id` to every associated connection.
    ///
    /// Recipients that cannot take the message are unregistered. Returns
    /// the number of connections the state was queued for.
    pub async fn broadcast_game_state(&self, game_id: &str) -> usize {
        let handle = self.games.read().await.get(game_id).cloned();
        let Some(handle) = handle else {
            warn!(game_id, "Attempted to broadcast state for non-existent game");
            return 0;
        };

        let report = {
            let entry = handle.lock().await;
            let message = ServerMessage::game_state(&entry.state);
            let connections = self.connections.read().await;
            router::deliver(&connections, game_id, &message)
        };

        for (player_id, conn_id) in &report.failed {
            self.unregister_connection(player_id, *conn_id).await;
        }
        report.delivered
    }

    /// Drop games that finished or were abandoned long enough ago.
    ///
    /// Games currently locked are skipped until the next pass.
    pub async fn evict_stale_games(&self, now: Instant, policy: &EvictionPolicy) -> usize {
        let associated: BTreeSet<GameId> = {
            let connections = self.connections.read().await;
            connections.values().filter_map(|c| c.game_id.clone()).collect()
        };

        let mut games = self.games.write().await;
        let before = games.len();
        games.retain(|game_id, handle| match handle.try_lock() {
            Ok(entry) => !entry.is_stale(now, associated.contains(game_id), policy),
            Err(_) => true,
        });

        let evicted = before - games.len();
        if evicted > 0 {
            info!(evicted, remaining_games = games.len(), "Evicted stale games");
        }
        evicted
    }

    /// Snapshot of a game, if it exists.
    pub async fn game_snapshot(&self, game_id: &str) -> Option<GameSnapshot> {
        let handle = self.games.read().await.get(game_id).cloned()?;
        let entry = handle.lock().await;
        Some(GameSnapshot::from(&entry.state))
    }

    /// Game a participant's live connection is associated with.
    pub async fn connection_game(&self, player_id: &PlayerId) -> Option<GameId> {
        let connections = self.connections.read().await;
        connections.get(player_id).and_then(|c| c.game_id.clone())
    }

    /// Id of a participant's live connection.
    pub async fn connection_id(&self, player_id: &PlayerId) -> Option<ConnectionId> {
        self.connections.read().await.get(player_id).map(|c| c.id)
    }

    /// Number of live connections.
    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Number of games in memory.
    pub async fn game_count(&self) -> usize {
        self.games.read().await.len()
    }

    /// Run `f` on the game under its lock, or on `None` if it does not exist.
    async fn with_game<T>(&self, game_id: &str, f: impl FnOnce(Option<&mut GameEntry>) -> T) -> T {
        let handle = self.games.read().await.get(game_id).cloned();
        match handle {
            Some(handle) => {
                let mut entry = handle.lock().await;
                f(Some(&mut entry))
            }
            None => f(None),
        }
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::board::Cell;
    use crate::network::protocol::ErrorCode;

    struct TestClient {
        player_id: PlayerId,
        conn_id: ConnectionId,
        rx: mpsc::Receiver<ServerMessage>,
    }

    impl TestClient {
        fn states(&mut self) -> Vec<GameSnapshot> {
            let mut out = Vec::new();
            while let Ok(msg) = self.rx.try_recv() {
                if let ServerMessage::GameState { data, .. } = msg {
                    out.push(data);
                }
            }
            out
        }
    }

    async fn connect(registry: &SessionRegistry, name: &str) -> TestClient {
        let (tx, rx) = mpsc::channel(16);
        let conn = Connection::new(PlayerId::from(name), tx);
        let conn_id = conn.id;
        registry.register_connection(conn).await;
        TestClient {
            player_id: PlayerId::from(name),
            conn_id,
            rx,
        }
    }

    async fn create(registry: &SessionRegistry, client: &TestClient, game_id: &str) {
        let symbol = registry.create_game(game_id, &client.player_id).await;
        registry
            .associate_game(&client.player_id, client.conn_id, game_id, symbol)
            .await;
    }

    async fn join(registry: &SessionRegistry, client: &TestClient, game_id: &str) -> Result<(), GameError> {
        let symbol = registry.join_game(game_id, &client.player_id).await?;
        registry
            .associate_game(&client.player_id, client.conn_id, game_id, symbol)
            .await;
        Ok(())
    }

    #[tokio::test]
    async fn test_register_unregister() {
        let registry = SessionRegistry::new();
        let alice = connect(&registry, "alice").await;
        assert_eq!(registry.connection_count().await, 1);

        assert!(registry.unregister_connection(&alice.player_id, alice.conn_id).await);
        assert_eq!(registry.connection_count().await, 0);
        assert!(!registry.unregister_connection(&alice.player_id, alice.conn_id).await);
    }

    #[tokio::test]
    async fn test_reregistration_evicts_previous() {
        let registry = SessionRegistry::new();

        let (tx1, _rx1) = mpsc::channel(4);
        let first = Connection::new(PlayerId::from("alice"), tx1);
        let first_id = first.id;
        let first_closed = first.closed_signal();
        assert!(registry.register_connection(first).await.is_none());

        let second = connect(&registry, "alice").await;
        assert_eq!(registry.connection_count().await, 1);
        assert_eq!(registry.connection_id(&second.player_id).await, Some(second.conn_id));

        // The old connection was told to close
        tokio::time::timeout(Duration::from_secs(1), first_closed.notified())
            .await
            .expect("evicted connection signalled");

        // Its late unregister leaves the new one alone
        assert!(!registry.unregister_connection(&second.player_id, first_id).await);
        assert_eq!(registry.connection_id(&second.player_id).await, Some(second.conn_id));
    }

    #[tokio::test]
    async fn test_create_join_scenario() {
        let registry = SessionRegistry::new();
        let alice = connect(&registry, "alice").await;
        let bob = connect(&registry, "bob").await;

        create(&registry, &alice, "g1").await;
        let snapshot = registry.game_snapshot("g1").await.unwrap();
        assert_eq!(snapshot.players.get(&alice.player_id), Some(&Symbol::X));
        assert_eq!(snapshot.turn, alice.player_id);
        assert!(!snapshot.game_ready);

        join(&registry, &bob, "g1").await.unwrap();
        let snapshot = registry.game_snapshot("g1").await.unwrap();
        assert_eq!(snapshot.players.len(), 2);
        assert_eq!(snapshot.players.get(&bob.player_id), Some(&Symbol::O));
        assert!(snapshot.game_ready);
        assert_eq!(snapshot.turn, alice.player_id);
        assert_eq!(registry.connection_game(&bob.player_id).await.as_deref(), Some("g1"));
    }

    #[tokio::test]
    async fn test_join_errors() {
        let registry = SessionRegistry::new();
        let alice = connect(&registry, "alice").await;
        let bob = connect(&registry, "bob").await;
        let carol = connect(&registry, "carol").await;

        assert_eq!(join(&registry, &bob, "nope").await, Err(GameError::GameNotFound));

        create(&registry, &alice, "g1").await;
        join(&registry, &bob, "g1").await.unwrap();
        assert_eq!(join(&registry, &carol, "g1").await, Err(GameError::GameFull));
        assert_eq!(registry.connection_game(&carol.player_id).await, None);
    }

    #[tokio::test]
    async fn test_move_scenario() {
        let registry = SessionRegistry::new();
        let alice = connect(&registry, "alice").await;
        let bob = connect(&registry, "bob").await;
        create(&registry, &alice, "g1").await;
        join(&registry, &bob, "g1").await.unwrap();

        registry.make_move("g1", &alice.player_id, 0).await.unwrap();
        let snapshot = registry.game_snapshot("g1").await.unwrap();
        assert_eq!(snapshot.board.get(0), Some(Cell::X));
        assert_eq!(snapshot.turn, bob.player_id);

        let err = registry.make_move("g1", &bob.player_id, 0).await.unwrap_err();
        assert_eq!(ErrorCode::from(&err), ErrorCode::PositionOccupied);
        assert_eq!(registry.game_snapshot("g1").await.unwrap(), snapshot);

        assert_eq!(
            registry.make_move("missing", &bob.player_id, 1).await,
            Err(GameError::GameNotFound)
        );
    }

    #[tokio::test]
    async fn test_broadcast_reaches_only_game_members() {
        let registry = SessionRegistry::new();
        let mut alice = connect(&registry, "alice").await;
        let mut bob = connect(&registry, "bob").await;
        let mut carol = connect(&registry, "carol").await;

        create(&registry, &alice, "g1").await;
        join(&registry, &bob, "g1").await.unwrap();
        create(&registry, &carol, "g2").await;

        registry.make_move("g1", &alice.player_id, 4).await.unwrap();
        assert_eq!(registry.broadcast_game_state("g1").await, 2);

        let alice_states = alice.states();
        let bob_states = bob.states();
        assert_eq!(alice_states.len(), 1);
        assert_eq!(bob_states.len(), 1);
        assert_eq!(alice_states[0].board.get(4), Some(Cell::X));
        assert_eq!(alice_states[0], bob_states[0]);
        assert!(carol.states().is_empty());
    }

    #[tokio::test]
    async fn test_broadcast_unregisters_failed_recipient() {
        let registry = SessionRegistry::new();
        let alice = connect(&registry, "alice").await;
        let mut bob = connect(&registry, "bob").await;
        create(&registry, &alice, "g1").await;
        join(&registry, &bob, "g1").await.unwrap();

        let TestClient { player_id: alice_id, rx: alice_rx, .. } = alice;
        drop(alice_rx);

        assert_eq!(registry.broadcast_game_state("g1").await, 1);
        assert_eq!(bob.states().len(), 1);
        assert_eq!(registry.connection_id(&alice_id).await, None);
        assert_eq!(registry.connection_count().await, 1);
    }

    #[tokio::test]
    async fn test_broadcast_missing_game() {
        let registry = SessionRegistry::new();
        assert_eq!(registry.broadcast_game_state("nope").await, 0);
    }

    #[tokio::test]
    async fn test_create_replaces_existing_game() {
        let registry = SessionRegistry::new();
        let alice = connect(&registry, "alice").await;
        let bob = connect(&registry, "bob").await;
        create(&registry, &alice, "g1").await;
        join(&registry, &bob, "g1").await.unwrap();

        create(&registry, &bob, "g1").await;
        let snapshot = registry.game_snapshot("g1").await.unwrap();
        assert_eq!(snapshot.players.len(), 1);
        assert_eq!(snapshot.players.get(&bob.player_id), Some(&Symbol::X));
        assert_eq!(registry.game_count().await, 1);
    }

    #[tokio::test]
    async fn test_concurrent_moves_serialize() {
        let registry = Arc::new(SessionRegistry::new());
        let alice = connect(&registry, "alice").await;
        let bob = connect(&registry, "bob").await;
        create(&registry, &alice, "g1").await;
        join(&registry, &bob, "g1").await.unwrap();

        let mut tasks = Vec::new();
        for (player, pos) in [(alice.player_id.clone(), 4), (bob.player_id.clone(), 4)] {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move { registry.make_move("g1", &player, pos).await }));
        }
        let mut accepted = 0;
        for task in tasks {
            if task.await.unwrap().is_ok() {
                accepted += 1;
            }
        }

        // Either alice lands first and bob hits an occupied cell,
        // or bob is rejected out of turn and alice lands after.
        assert_eq!(accepted, 1);
        let snapshot = registry.game_snapshot("g1").await.unwrap();
        assert_eq!(snapshot.board.occupied(), 1);
        assert_eq!(snapshot.board.get(4), Some(Cell::X));
    }

    #[tokio::test]
    async fn test_evicts_finished_games() {
        let registry = SessionRegistry::new();
        let alice = connect(&registry, "alice").await;
        let bob = connect(&registry, "bob").await;
        create(&registry, &alice, "done").await;
        join(&registry, &bob, "done").await.unwrap();
        create(&registry, &alice, "live").await;
        join(&registry, &bob, "live").await.unwrap();

        for (player, pos) in [(&alice, 0), (&bob, 3), (&alice, 1), (&bob, 4), (&alice, 2)] {
            registry.make_move("done", &player.player_id, pos).await.unwrap();
        }

        let policy = EvictionPolicy {
            finished_game_ttl: Duration::from_secs(10),
            abandoned_game_ttl: Duration::from_secs(3600),
        };

        assert_eq!(registry.evict_stale_games(Instant::now(), &policy).await, 0);

        let later = Instant::now() + Duration::from_secs(11);
        assert_eq!(registry.evict_stale_games(later, &policy).await, 1);
        assert!(registry.game_snapshot("done").await.is_none());
        assert!(registry.game_snapshot("live").await.is_some());
    }

    #[tokio::test]
    async fn test_evicts_abandoned_games() {
        let registry = SessionRegistry::new();
        let alice = connect(&registry, "alice").await;
        create(&registry, &alice, "g1").await;

        let policy = EvictionPolicy {
            finished_game_ttl: Duration::from_secs(10),
            abandoned_game_ttl: Duration::from_secs(30),
        };
        let later = Instant::now() + Duration::from_secs(31);

        // Still associated with a live connection
        assert_eq!(registry.evict_stale_games(later, &policy).await, 0);

        registry.unregister_connection(&alice.player_id, alice.conn_id).await;
        assert_eq!(registry.evict_stale_games(later, &policy).await, 1);
        assert_eq!(registry.game_count().await, 0);
    }
}
