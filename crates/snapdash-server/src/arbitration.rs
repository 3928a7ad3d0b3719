//! Match arbitration: rate limiting, symbol validation, penalties, and the
//! simultaneous-match resolution window.
//!
//! The first valid match of a round opens a short window; further valid
//! matches land in the same window and the earliest *server* arrival wins
//! when it closes. Client timestamps are untrusted (clients lie and
//! drift), so ties are broken uniformly at random instead.

use std::time::Duration;

use rand::RngExt;
use snapdash_core::cards::{SymbolId, TOTAL_SYMBOLS};
use snapdash_core::protocol::{Phase, PlayerId};
use tokio::time::Instant;

use crate::state::{ConnectionId, MatchAttempt, PendingArbitration, RateWindow, RoomState};
use crate::timers::MAX_MATCH_ATTEMPTS_PER_SECOND;

/// Validate a raw wire symbol id. `None` means malformed input, which is
/// dropped silently upstream.
pub fn parse_symbol(raw: i64) -> Option<SymbolId> {
    (0..TOTAL_SYMBOLS as i64)
        .contains(&raw)
        .then_some(raw as SymbolId)
}

/// Per-connection counter resetting each second. `false` = over budget;
/// the attempt is dropped without a reply (no timing feedback for abusive
/// clients).
pub fn allow_attempt(state: &mut RoomState, connection: ConnectionId, now: Instant) -> bool {
    let window = state
        .match_attempt_counts
        .entry(connection)
        .or_insert(RateWindow {
            window_start: now,
            count: 0,
        });
    if now.duration_since(window.window_start) >= Duration::from_secs(1) {
        window.window_start = now;
        window.count = 0;
    }
    window.count += 1;
    window.count <= MAX_MATCH_ATTEMPTS_PER_SECOND
}

pub fn is_penalised(state: &RoomState, player_id: &PlayerId, now: Instant) -> bool {
    state
        .penalties
        .get(player_id)
        .is_some_and(|until| now < *until)
}

/// Start (or restart) a penalty. Repeat attempts while penalised do not
/// come back through here, so the penalty never extends itself.
pub fn apply_penalty(
    state: &mut RoomState,
    player_id: &PlayerId,
    now: Instant,
    duration: Duration,
) {
    state.penalties.insert(player_id.clone(), now + duration);
}

/// What happened to a valid match claim.
#[derive(Debug, PartialEq, Eq)]
pub enum Submission {
    /// First valid match of the round — the caller arms the window timer.
    OpenedWindow,
    /// Landed inside an already-open window.
    Joined,
    /// Belonged to a different round; discarded.
    Dropped,
}

/// Feed a valid match into the arbitration window.
pub fn submit(
    state: &mut RoomState,
    player_id: PlayerId,
    symbol_id: SymbolId,
    client_timestamp: u64,
    now: Instant,
) -> Submission {
    let attempt = MatchAttempt {
        player_id,
        symbol_id,
        client_timestamp,
        server_timestamp: now,
    };
    match &mut state.pending_arbitration {
        None => {
            state.pending_arbitration = Some(PendingArbitration {
                round_number: state.round_number,
                window_start: now,
                attempts: vec![attempt],
                timer: None,
            });
            Submission::OpenedWindow
        }
        Some(pending) => {
            if pending.round_number != state.round_number {
                return Submission::Dropped;
            }
            // A player's first claim stands; repeats add nothing.
            if pending
                .attempts
                .iter()
                .any(|a| a.player_id == attempt.player_id)
            {
                return Submission::Joined;
            }
            pending.attempts.push(attempt);
            Submission::Joined
        }
    }
}

/// Close the window and pick the winner: earliest server arrival, ties
/// uniform random. Returns `None` if the window no longer applies (phase
/// or round moved on before the timer reached the lock).
pub fn resolve(state: &mut RoomState) -> Option<(PlayerId, SymbolId)> {
    let pending = state.pending_arbitration.take()?;
    if state.phase != Phase::Playing || pending.round_number != state.round_number {
        return None;
    }
    let earliest = pending
        .attempts
        .iter()
        .map(|a| a.server_timestamp)
        .min()?;
    let tied: Vec<&MatchAttempt> = pending
        .attempts
        .iter()
        .filter(|a| a.server_timestamp == earliest)
        .collect();
    let pick = if tied.len() == 1 {
        tied[0]
    } else {
        tied[rand::rng().random_range(0..tied.len())]
    };
    Some((pick.player_id.clone(), pick.symbol_id))
}

/// Game end: abort any open window and wipe all penalties.
pub fn clear(state: &mut RoomState) {
    if let Some(pending) = state.pending_arbitration.take()
        && let Some(timer) = pending.timer
    {
        timer.abort();
    }
    state.penalties.clear();
}
