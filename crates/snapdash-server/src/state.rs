//! Room state store.
//!
//! Sole owner of everything a room knows: the roster, connection mappings,
//! deck, round pointers, penalties, and the pending arbitration window.
//! Pure data plus predicates — no I/O and no timers live here; services
//! mutate the store and the broadcast layer reads it.

use std::collections::{HashMap, HashSet};

use snapdash_core::cards::{Card, CardId, SymbolId};
use snapdash_core::config::{GameConfig, MAX_PLAYERS, MIN_PLAYERS};
use snapdash_core::protocol::{GameEndReason, Phase, PlayerCards, PlayerId, PlayerStatus};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Transport session identifier. A transport artifact only: it is replaced
/// on reconnect and never appears in game logic decisions or client
/// payloads.
pub type ConnectionId = u64;

/// A player as the room owns it. The wire projection lives in the
/// broadcast layer.
#[derive(Debug)]
pub struct Player {
    pub id: PlayerId,
    /// Current transport session; `None` while disconnected.
    pub connection_id: Option<ConnectionId>,
    pub name: String,
    pub status: PlayerStatus,
    /// Ordered card IDs; index 0 is the top of the stack.
    pub card_stack: Vec<CardId>,
    pub is_host: bool,
    pub joined_at: Instant,
    pub last_seen: Instant,
}

/// Grace-period bookkeeping for a disconnected player. The player object
/// itself stays in `players` until the grace timer removes it.
#[derive(Debug, Clone, Copy)]
pub struct DisconnectedInfo {
    pub disconnected_at: Instant,
}

/// One match claim collected during the arbitration window.
#[derive(Debug, Clone)]
pub struct MatchAttempt {
    pub player_id: PlayerId,
    pub symbol_id: SymbolId,
    /// Echoed for diagnostics; never used for ordering.
    pub client_timestamp: u64,
    /// Server arrival time — the only ordering authority.
    pub server_timestamp: Instant,
}

/// Open arbitration window. Exists only between the first valid match of a
/// round and the window expiry ~100 ms later.
#[derive(Debug)]
pub struct PendingArbitration {
    pub round_number: u32,
    pub window_start: Instant,
    pub attempts: Vec<MatchAttempt>,
    pub timer: Option<JoinHandle<()>>,
}

/// Per-connection match-attempt counter for the current one-second window.
#[derive(Debug, Clone, Copy)]
pub struct RateWindow {
    pub window_start: Instant,
    pub count: u32,
}

/// Outcome of the previous game, kept for late snapshots.
#[derive(Debug, Clone)]
pub struct LastGameRecord {
    pub reason: GameEndReason,
    pub winner_id: Option<PlayerId>,
    pub winner_name: Option<String>,
}

/// All durable room data. See the module docs: services mutate this, the
/// broadcast layer projects it, nothing else holds references into it.
pub struct RoomState {
    pub phase: Phase,
    pub host_id: Option<PlayerId>,
    pub config: GameConfig,
    pub room_expires_at: Option<Instant>,
    pub round_number: u32,
    pub center_card: Option<CardId>,
    /// Every card of the running game, retained for ID-based lookup.
    pub full_deck: Vec<Card>,
    pub round_winner_id: Option<PlayerId>,
    pub round_matched_symbol_id: Option<SymbolId>,
    pub last_game: Option<LastGameRecord>,
    pub rejoin_window_ends_at: Option<Instant>,
    pub players: HashMap<PlayerId, Player>,
    /// Insertion order; drives host reassignment and dealing order.
    pub join_order: Vec<PlayerId>,
    pub connection_to_player: HashMap<ConnectionId, PlayerId>,
    pub disconnected_players: HashMap<PlayerId, DisconnectedInfo>,
    pub players_want_rematch: HashSet<PlayerId>,
    /// Penalty expiry per player; an entry in the past is simply stale.
    pub penalties: HashMap<PlayerId, Instant>,
    pub match_attempt_counts: HashMap<ConnectionId, RateWindow>,
    pub pending_arbitration: Option<PendingArbitration>,
}

impl RoomState {
    pub fn new() -> Self {
        Self {
            phase: Phase::Waiting,
            host_id: None,
            config: GameConfig::default(),
            room_expires_at: None,
            round_number: 0,
            center_card: None,
            full_deck: Vec::new(),
            round_winner_id: None,
            round_matched_symbol_id: None,
            last_game: None,
            rejoin_window_ends_at: None,
            players: HashMap::new(),
            join_order: Vec::new(),
            connection_to_player: HashMap::new(),
            disconnected_players: HashMap::new(),
            players_want_rematch: HashSet::new(),
            penalties: HashMap::new(),
            match_attempt_counts: HashMap::new(),
            pending_arbitration: None,
        }
    }

    // ── Predicates ───────────────────────────────────────────────────────

    pub fn connected_count(&self) -> usize {
        self.players
            .values()
            .filter(|p| p.status == PlayerStatus::Connected)
            .count()
    }

    pub fn is_room_full(&self) -> bool {
        self.players.len() >= MAX_PLAYERS
    }

    pub fn has_enough_players(&self) -> bool {
        self.connected_count() >= MIN_PLAYERS
    }

    pub fn is_name_taken(&self, name: &str) -> bool {
        self.players.values().any(|p| p.name == name)
    }

    /// Resolve a collision by suffixing ` <n>`, starting at 2.
    pub fn unique_name(&self, base: String) -> String {
        if !self.is_name_taken(&base) {
            return base;
        }
        let mut n = 2;
        loop {
            let candidate = format!("{base} <{n}>");
            if !self.is_name_taken(&candidate) {
                return candidate;
            }
            n += 1;
        }
    }

    pub fn get_card_by_id(&self, id: CardId) -> Option<&Card> {
        self.full_deck.iter().find(|c| c.id == id)
    }

    /// The current centre card, resolved through the deck.
    pub fn center(&self) -> Option<&Card> {
        self.center_card.and_then(|id| self.get_card_by_id(id))
    }

    /// The top card of a player's stack.
    pub fn top_card_of(&self, player_id: &PlayerId) -> Option<&Card> {
        let top = *self.players.get(player_id)?.card_stack.first()?;
        self.get_card_by_id(top)
    }

    /// Remaining-card counts for every player, in join order.
    pub fn all_players_remaining(&self) -> Vec<PlayerCards> {
        self.join_order
            .iter()
            .filter_map(|id| self.players.get(id))
            .map(|p| PlayerCards {
                player_id: p.id.clone(),
                cards_remaining: p.card_stack.len(),
            })
            .collect()
    }

    pub fn player_id_by_connection(&self, connection: ConnectionId) -> Option<PlayerId> {
        self.connection_to_player.get(&connection).cloned()
    }

    pub fn is_rejoin_window_active(&self, now: Instant) -> bool {
        self.rejoin_window_ends_at.is_some_and(|ends| now < ends)
    }

    pub fn penalty_remaining_ms(&self, player_id: &PlayerId, now: Instant) -> u64 {
        self.penalties
            .get(player_id)
            .map(|until| until.saturating_duration_since(now).as_millis() as u64)
            .unwrap_or(0)
    }

    // ── Resets ───────────────────────────────────────────────────────────

    /// Back to a fresh Waiting room, keeping the roster and config.
    ///
    /// Clears the deck, centre card, round pointers, penalties, rate
    /// counters, the rematch set, and any open arbitration window.
    pub fn reset_game_state(&mut self) {
        self.phase = Phase::Waiting;
        self.round_number = 0;
        self.center_card = None;
        self.full_deck.clear();
        self.round_winner_id = None;
        self.round_matched_symbol_id = None;
        self.last_game = None;
        self.rejoin_window_ends_at = None;
        self.players_want_rematch.clear();
        self.penalties.clear();
        self.match_attempt_counts.clear();
        if let Some(pending) = self.pending_arbitration.take()
            && let Some(timer) = pending.timer
        {
            timer.abort();
        }
        for player in self.players.values_mut() {
            player.card_stack.clear();
        }
    }

    /// Full wipe: game state, roster, and config.
    pub fn reset_all(&mut self) {
        self.reset_game_state();
        self.players.clear();
        self.join_order.clear();
        self.connection_to_player.clear();
        self.disconnected_players.clear();
        self.host_id = None;
        self.config = GameConfig::default();
        self.room_expires_at = None;
    }
}

impl Default for RoomState {
    fn default() -> Self {
        Self::new()
    }
}
