//! Wire protocol between Snapdash clients and the room server.
//!
//! Every frame is a JSON object `{ "type": ..., "payload": ... }`; type
//! names are `snake_case`, payload fields `camelCase`. Messages whose
//! payload depends on the recipient (`room_state`, `player_joined`,
//! `round_start`) are rendered per recipient by the broadcast layer —
//! nothing in here carries another player's hand.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::cards::{Card, SymbolId};
use crate::config::GameConfig;

/// Stable player identity, generated server-side on first join.
///
/// Survives reconnects and doubles as the reconnection credential, so it is
/// an unguessable random token rather than a sequential number.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlayerId(pub String);

impl fmt::Display for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Room lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Waiting,
    Countdown,
    Playing,
    RoundEnd,
    GameOver,
}

/// Connection status of a player as other clients see it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlayerStatus {
    Connected,
    Disconnected,
}

/// Why the last game ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GameEndReason {
    StackEmptied,
    LastPlayerStanding,
}

/// Machine-readable error codes carried by `error` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    RoomFull,
    RoomNotFound,
    GameInProgress,
    PlayerNotFound,
    NotHost,
    InvalidState,
    InvalidMatch,
    InPenalty,
    NameTaken,
}

/// A player as projected to clients.
///
/// The full card stack never leaves the server; only the count does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerView {
    pub id: PlayerId,
    pub name: String,
    pub status: PlayerStatus,
    pub cards_remaining: usize,
    pub is_host: bool,
    pub is_you: bool,
}

/// Per-player remaining-card count, broadcast with each round start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerCards {
    pub player_id: PlayerId,
    pub cards_remaining: usize,
}

/// One row of the end-of-game scoreboard (0 cards = winner).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalStanding {
    pub player_id: PlayerId,
    pub name: String,
    pub cards_remaining: usize,
}

/// Outcome of the previous game, kept for late snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastGame {
    pub reason: GameEndReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub winner_id: Option<PlayerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub winner_name: Option<String>,
}

/// Full personalised room snapshot, sent on join, reconnect, and reset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSnapshot {
    pub phase: Phase,
    pub players: Vec<PlayerView>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_id: Option<PlayerId>,
    pub config: GameConfig,
    pub round_number: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub center_card: Option<Card>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub your_card: Option<Card>,
    pub your_cards_remaining: usize,
    /// `max(0, penaltyUntil − now)` rendered at send time.
    pub penalty_remaining_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub round_winner_id: Option<PlayerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_game: Option<LastGame>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejoin_window_remaining_ms: Option<u64>,
}

/// Messages sent from client to server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "payload",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum ClientMessage {
    /// Join the room with a display name.
    Join { player_name: String },

    /// Resume a previous identity after a connection drop.
    Reconnect { player_id: PlayerId },

    /// Host-only: replace the room configuration (Waiting / GameOver).
    SetConfig { config: GameConfig },

    /// Host-only: begin the start countdown, optionally locking in a
    /// final configuration in the same message.
    StartGame {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        config: Option<GameConfig>,
    },

    /// Claim that `symbolId` is on both the top hand card and the centre
    /// card. `clientTimestamp` is echoed for diagnostics only — the server
    /// never trusts it for ordering.
    MatchAttempt {
        symbol_id: i64,
        client_timestamp: u64,
    },

    /// Leave the room immediately (no grace period).
    Leave {},

    /// Host-only: remove another player from the room.
    KickPlayer { player_id: PlayerId },

    /// Liveness probe; answered with `pong`.
    Ping { timestamp: u64 },

    /// Opt in to a rematch while the room is in GameOver.
    PlayAgain {},
}

/// Messages sent from server to client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "payload",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum ServerMessage {
    /// Personalised snapshot of the whole room.
    RoomState(RoomSnapshot),

    /// A player joined; `player.isYou` is rendered per recipient.
    PlayerJoined { player: PlayerView },

    /// A player was removed from the room.
    PlayerLeft { player_id: PlayerId },

    /// A player's connection dropped; they may still reconnect.
    PlayerDisconnected { player_id: PlayerId },

    /// A disconnected player came back within the grace period.
    PlayerReconnected { player_id: PlayerId },

    /// The host changed the room configuration.
    ConfigUpdated { config: GameConfig },

    /// Start-countdown tick. `seconds` counts down to 0; −1 means the
    /// countdown was cancelled.
    Countdown { seconds: i32 },

    /// A round began; `yourCard` and `yourCardsRemaining` are per player.
    RoundStart {
        center_card: Card,
        your_card: Card,
        your_cards_remaining: usize,
        all_players_remaining: Vec<PlayerCards>,
        round_number: u32,
    },

    /// Somebody matched first (after arbitration).
    RoundWinner {
        winner_id: PlayerId,
        winner_name: String,
        matched_symbol_id: SymbolId,
        winner_cards_remaining: usize,
    },

    /// The game finished.
    GameOver {
        winner_id: PlayerId,
        winner_name: String,
        final_standings: Vec<FinalStanding>,
        reason: GameEndReason,
        rejoin_window_ms: u64,
    },

    /// An invalid match attempt drew a penalty. Clients compute their own
    /// local expiry from `durationMs` to stay clock-skew safe.
    Penalty {
        server_timestamp: u64,
        duration_ms: u64,
        reason: String,
    },

    /// Terminal: the room is going away; the connection closes next.
    RoomExpired { reason: String },

    /// Host role moved to another player.
    HostChanged { player_id: PlayerId },

    /// Request-level failure, unicast to the offending sender.
    Error { code: ErrorCode, message: String },

    /// Reply to `ping`.
    Pong {
        server_timestamp: u64,
        client_timestamp: u64,
    },

    /// Unicast to the player who just became host.
    YouAreHost {},

    /// A player opted in to a rematch.
    PlayAgainAck { player_id: PlayerId },

    /// Sole rematch opt-in: nobody else stayed, the room is closing.
    SoloRejoinBoot { message: String },

    /// The room was reset for a rematch; a fresh snapshot follows.
    RoomReset {},
}

// ---------------------------------------------------------------------------
// Room codes and player names
// ---------------------------------------------------------------------------

/// Validate a room code.
///
/// Codes must be non-empty, alphanumeric, and fewer than 20 characters.
pub fn validate_room_code(code: &str) -> Result<(), String> {
    if code.is_empty() {
        return Err("Room code cannot be empty".to_string());
    }
    if code.len() >= 20 {
        return Err("Room code must be fewer than 20 characters".to_string());
    }
    if !code.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err("Room code must be alphanumeric".to_string());
    }
    Ok(())
}

/// Sanitise a raw player name: trim, strip angle brackets, clamp length.
///
/// An empty result falls back to `"Player"`. Uniquing against the roster
/// happens room-side, where the roster lives.
pub fn sanitize_player_name(raw: &str) -> String {
    let cleaned: String = raw
        .trim()
        .chars()
        .filter(|c| *c != '<' && *c != '>')
        .take(crate::config::MAX_NAME_LENGTH)
        .collect();
    let cleaned = cleaned.trim().to_string();
    if cleaned.is_empty() {
        "Player".to_string()
    } else {
        cleaned
    }
}
