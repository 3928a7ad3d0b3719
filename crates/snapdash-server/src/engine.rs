//! Game engine: the room's phase machine.
//!
//! Drives Waiting → Countdown → Playing ⇄ RoundEnd → GameOver, deals the
//! deck, routes match attempts into arbitration, and runs the rematch
//! flow. Every function here executes under the room lock; anything
//! deferred is a spawned sleep that re-locks and re-checks the phase
//! before touching state.

use std::collections::HashSet;
use std::sync::Arc;

use rand::seq::SliceRandom;
use snapdash_core::cards::{self, DECK_ORDER, SymbolId};
use snapdash_core::config::{GameConfig, MIN_PLAYERS};
use snapdash_core::protocol::{
    ErrorCode, FinalStanding, GameEndReason, Phase, PlayerId, PlayerStatus, ServerMessage,
};
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::arbitration::{self, Submission};
use crate::broadcast;
use crate::room::{Outbound, Room};
use crate::state::{ConnectionId, LastGameRecord};
use crate::timers::unix_millis;

// ── Configuration ────────────────────────────────────────────────────────

/// `set_config`: host-only, and only while no game is running.
pub fn handle_set_config(room: &mut Room, connection: ConnectionId, config: GameConfig) {
    let Some(player_id) = room.state.player_id_by_connection(connection) else {
        broadcast::send_error(
            &room.senders,
            connection,
            ErrorCode::PlayerNotFound,
            "join the room first",
        );
        return;
    };
    if room.state.host_id.as_ref() != Some(&player_id) {
        broadcast::send_error(
            &room.senders,
            connection,
            ErrorCode::NotHost,
            "only the host can change the configuration",
        );
        return;
    }
    if !matches!(room.state.phase, Phase::Waiting | Phase::GameOver) {
        broadcast::send_error(
            &room.senders,
            connection,
            ErrorCode::InvalidState,
            "configuration is locked while a game is running",
        );
        return;
    }
    if let Err(e) = config.validate() {
        broadcast::send_error(
            &room.senders,
            connection,
            ErrorCode::InvalidState,
            &e.to_string(),
        );
        return;
    }
    room.state.config = config.clone();
    tracing::info!(room = %room.code, "Config updated");
    broadcast::broadcast_to_all(
        &room.state,
        &room.senders,
        ServerMessage::ConfigUpdated { config },
    );
}

/// `start_game`: host-only, needs two connected players, Waiting only.
pub fn handle_start_game(
    room: &mut Room,
    room_arc: &Arc<Mutex<Room>>,
    connection: ConnectionId,
    config: Option<GameConfig>,
) {
    let Some(player_id) = room.state.player_id_by_connection(connection) else {
        broadcast::send_error(
            &room.senders,
            connection,
            ErrorCode::PlayerNotFound,
            "join the room first",
        );
        return;
    };
    if room.state.host_id.as_ref() != Some(&player_id) {
        broadcast::send_error(
            &room.senders,
            connection,
            ErrorCode::NotHost,
            "only the host can start the game",
        );
        return;
    }
    if room.state.phase != Phase::Waiting {
        broadcast::send_error(
            &room.senders,
            connection,
            ErrorCode::InvalidState,
            "the game can only start from the lobby",
        );
        return;
    }
    if !room.state.has_enough_players() {
        broadcast::send_error(
            &room.senders,
            connection,
            ErrorCode::InvalidState,
            "need at least 2 connected players",
        );
        return;
    }
    if let Some(config) = config {
        if let Err(e) = config.validate() {
            broadcast::send_error(
                &room.senders,
                connection,
                ErrorCode::InvalidState,
                &e.to_string(),
            );
            return;
        }
        room.state.config = config.clone();
        broadcast::broadcast_to_all(
            &room.state,
            &room.senders,
            ServerMessage::ConfigUpdated { config },
        );
    }
    start_countdown(room, room_arc);
}

// ── Countdown ────────────────────────────────────────────────────────────

fn start_countdown(room: &mut Room, room_arc: &Arc<Mutex<Room>>) {
    room.state.phase = Phase::Countdown;
    room.timers.cancel_room_timeout();
    tracing::info!(room = %room.code, "Countdown started");

    let step = room.timings.countdown_step;
    let start = room.timings.countdown_seconds as i32;
    let handle = tokio::spawn({
        let room_arc = Arc::clone(room_arc);
        async move {
            let mut seconds = start;
            loop {
                {
                    let mut room = room_arc.lock().await;
                    if room.state.phase != Phase::Countdown {
                        return;
                    }
                    broadcast::broadcast_to_all(
                        &room.state,
                        &room.senders,
                        ServerMessage::Countdown { seconds },
                    );
                    if seconds == 0 {
                        finish_countdown(&mut room, &room_arc);
                        return;
                    }
                }
                tokio::time::sleep(step).await;
                seconds -= 1;
            }
        }
    });
    room.timers.set_countdown(handle);
}

/// The 0-tick: re-check the roster, then either deal or fall back to the
/// lobby (a player may have vanished mid-countdown).
fn finish_countdown(room: &mut Room, room_arc: &Arc<Mutex<Room>>) {
    if room.state.phase != Phase::Countdown {
        return;
    }
    if room.state.has_enough_players() && begin_game(room) {
        return;
    }
    tracing::info!(room = %room.code, "Countdown aborted, back to lobby");
    room.state.phase = Phase::Waiting;
    broadcast::broadcast_to_all(
        &room.state,
        &room.senders,
        ServerMessage::Countdown { seconds: -1 },
    );
    arm_room_timeout(room, room_arc);
}

/// Countdown lost a player: cancel, announce with `seconds: -1`, re-arm
/// the lobby timer.
fn cancel_countdown_to_waiting(room: &mut Room, room_arc: &Arc<Mutex<Room>>) {
    room.timers.cancel_countdown();
    room.state.phase = Phase::Waiting;
    tracing::info!(room = %room.code, "Countdown cancelled");
    broadcast::broadcast_to_all(
        &room.state,
        &room.senders,
        ServerMessage::Countdown { seconds: -1 },
    );
    arm_room_timeout(room, room_arc);
}

// ── Dealing ──────────────────────────────────────────────────────────────

/// Resolve symbols, generate, truncate, shuffle, deal. Returns `false` if
/// the configuration cannot produce a playable deck.
fn begin_game(room: &mut Room) -> bool {
    let symbols = match room.state.config.resolve_symbols() {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(room = %room.code, error = %e, "Cannot resolve symbol set");
            return false;
        }
    };
    let mut deck = match cards::generate(DECK_ORDER, &symbols) {
        Ok(d) => d,
        Err(e) => {
            tracing::warn!(room = %room.code, error = %e, "Deck generation failed");
            return false;
        }
    };
    let keep = (room.state.config.game_duration as usize).min(deck.len());
    deck.truncate(keep);
    deck.shuffle(&mut rand::rng());

    let player_count = room.state.players.len();
    if player_count == 0 {
        return false;
    }
    let per_player = deck.len().saturating_sub(1) / player_count;
    if per_player == 0 {
        tracing::warn!(room = %room.code, "Deck too small for the roster");
        return false;
    }

    // First card to the centre, then equal stacks off the top; the
    // remainder never enters play.
    let center = deck[0].id;
    let mut next = 1;
    for player_id in room.state.join_order.clone() {
        let stack: Vec<_> = deck[next..next + per_player].iter().map(|c| c.id).collect();
        next += per_player;
        if let Some(player) = room.state.players.get_mut(&player_id) {
            player.card_stack = stack;
        }
    }

    room.state.full_deck = deck;
    room.state.center_card = Some(center);
    room.state.phase = Phase::Playing;
    room.state.round_number = 1;
    room.state.round_winner_id = None;
    room.state.round_matched_symbol_id = None;
    room.state.penalties.clear();

    tracing::info!(
        room = %room.code,
        players = player_count,
        cards_each = per_player,
        "Game started"
    );
    send_round_start(room);
    true
}

/// Per-player `round_start` fan-out.
fn send_round_start(room: &Room) {
    for (connection, player_id) in &room.state.connection_to_player {
        if let Some(msg) = broadcast::round_start_for(&room.state, player_id) {
            broadcast::send_to_connection(&room.senders, *connection, msg);
        }
    }
}

// ── Match attempts ───────────────────────────────────────────────────────

pub fn handle_match_attempt(
    room: &mut Room,
    room_arc: &Arc<Mutex<Room>>,
    connection: ConnectionId,
    raw_symbol: i64,
    client_timestamp: u64,
) {
    let now = Instant::now();
    let Some(player_id) = room.state.player_id_by_connection(connection) else {
        tracing::debug!(room = %room.code, "Match attempt from unjoined connection");
        return;
    };
    let Some(symbol) = arbitration::parse_symbol(raw_symbol) else {
        tracing::debug!(room = %room.code, symbol = raw_symbol, "Bad symbol id, dropping");
        return;
    };
    if !arbitration::allow_attempt(&mut room.state, connection, now) {
        tracing::debug!(room = %room.code, player = %player_id, "Rate limited");
        return;
    }
    // Clicks that land between rounds are not errors, just late.
    if room.state.phase != Phase::Playing {
        return;
    }
    if room.state.top_card_of(&player_id).is_none() {
        return;
    }
    if arbitration::is_penalised(&room.state, &player_id, now) {
        broadcast::send_error(
            &room.senders,
            connection,
            ErrorCode::InPenalty,
            "wait out your penalty",
        );
        return;
    }

    let valid = match (room.state.top_card_of(&player_id), room.state.center()) {
        (Some(top), Some(center)) => top.has_symbol(symbol) && center.has_symbol(symbol),
        _ => return,
    };
    if !valid {
        arbitration::apply_penalty(&mut room.state, &player_id, now, room.timings.penalty);
        tracing::debug!(room = %room.code, player = %player_id, symbol, "Invalid match, penalty");
        broadcast::send_to_connection(
            &room.senders,
            connection,
            ServerMessage::Penalty {
                server_timestamp: unix_millis(),
                duration_ms: room.timings.penalty.as_millis() as u64,
                reason: "invalid_match".to_string(),
            },
        );
        return;
    }

    match arbitration::submit(&mut room.state, player_id, symbol, client_timestamp, now) {
        Submission::OpenedWindow => {
            let window = room.timings.arbitration_window;
            let handle = tokio::spawn({
                let room_arc = Arc::clone(room_arc);
                async move {
                    tokio::time::sleep(window).await;
                    let mut room = room_arc.lock().await;
                    resolve_arbitration(&mut room, &room_arc);
                }
            });
            if let Some(pending) = room.state.pending_arbitration.as_mut() {
                pending.timer = Some(handle);
            }
        }
        Submission::Joined | Submission::Dropped => {}
    }
}

fn resolve_arbitration(room: &mut Room, room_arc: &Arc<Mutex<Room>>) {
    if let Some((winner, symbol)) = arbitration::resolve(&mut room.state) {
        process_round_win(room, room_arc, winner, symbol);
    }
}

/// Arbitration picked a winner: pop their top card to the centre and
/// either finish the game or schedule the next round.
fn process_round_win(
    room: &mut Room,
    room_arc: &Arc<Mutex<Room>>,
    winner: PlayerId,
    symbol: SymbolId,
) {
    if room.state.phase != Phase::Playing {
        return;
    }
    let Some(player) = room.state.players.get_mut(&winner) else {
        return;
    };
    if player.card_stack.is_empty() {
        return;
    }
    let new_center = player.card_stack.remove(0);
    let remaining = player.card_stack.len();
    let winner_name = player.name.clone();

    room.state.phase = Phase::RoundEnd;
    room.state.round_winner_id = Some(winner.clone());
    room.state.round_matched_symbol_id = Some(symbol);
    room.state.center_card = Some(new_center);

    tracing::info!(
        room = %room.code,
        winner = %winner,
        symbol,
        remaining,
        round = room.state.round_number,
        "Round won"
    );
    broadcast::broadcast_to_all(
        &room.state,
        &room.senders,
        ServerMessage::RoundWinner {
            winner_id: winner.clone(),
            winner_name,
            matched_symbol_id: symbol,
            winner_cards_remaining: remaining,
        },
    );

    if remaining == 0 {
        end_game(room, room_arc, GameEndReason::StackEmptied, Some(winner));
        return;
    }

    let delay = room.timings.round_transition_delay;
    let handle = tokio::spawn({
        let room_arc = Arc::clone(room_arc);
        async move {
            tokio::time::sleep(delay).await;
            let mut room = room_arc.lock().await;
            advance_round(&mut room);
        }
    });
    room.timers.set_round_end(handle);
}

/// Round-end timer callback. The phase check guards against a game that
/// ended while the timer was in flight.
fn advance_round(room: &mut Room) {
    if room.state.phase != Phase::RoundEnd {
        return;
    }
    room.state.round_number += 1;
    room.state.round_winner_id = None;
    room.state.round_matched_symbol_id = None;
    room.state.phase = Phase::Playing;
    tracing::debug!(room = %room.code, round = room.state.round_number, "Round started");
    send_round_start(room);
}

// ── Roster changes ───────────────────────────────────────────────────────

/// Player service callback after any removal. Decides whether the phase
/// can survive the new headcount.
pub fn on_player_count_changed(room: &mut Room, room_arc: &Arc<Mutex<Room>>) {
    if room.state.players.is_empty() {
        // Nobody left at all; wind the room down quietly.
        room.timers.clear_all();
        room.state.reset_all();
        return;
    }
    match room.state.phase {
        Phase::Countdown if !room.state.has_enough_players() => {
            cancel_countdown_to_waiting(room, room_arc);
        }
        Phase::Playing | Phase::RoundEnd if !room.state.has_enough_players() => {
            // Sole survivor wins; their stack empties to reflect it.
            let survivor = room
                .state
                .join_order
                .iter()
                .filter_map(|id| room.state.players.get(id))
                .find(|p| p.status == PlayerStatus::Connected)
                .map(|p| p.id.clone())
                .or_else(|| room.state.join_order.first().cloned());
            if let Some(survivor) = survivor {
                if let Some(player) = room.state.players.get_mut(&survivor) {
                    player.card_stack.clear();
                }
                end_game(
                    room,
                    room_arc,
                    GameEndReason::LastPlayerStanding,
                    Some(survivor),
                );
            }
        }
        _ => {}
    }
}

// ── End of game ──────────────────────────────────────────────────────────

fn end_game(
    room: &mut Room,
    room_arc: &Arc<Mutex<Room>>,
    reason: GameEndReason,
    explicit_winner: Option<PlayerId>,
) {
    room.timers.cancel_round_end();
    arbitration::clear(&mut room.state);
    room.state.phase = Phase::GameOver;
    room.state.round_winner_id = None;
    room.state.round_matched_symbol_id = None;

    let mut standings: Vec<FinalStanding> = room
        .state
        .join_order
        .iter()
        .filter_map(|id| room.state.players.get(id))
        .map(|p| FinalStanding {
            player_id: p.id.clone(),
            name: p.name.clone(),
            cards_remaining: p.card_stack.len(),
        })
        .collect();
    // Stable sort: ties stay in join order.
    standings.sort_by_key(|s| s.cards_remaining);

    let Some(winner_id) =
        explicit_winner.or_else(|| standings.first().map(|s| s.player_id.clone()))
    else {
        return;
    };
    let winner_name = room
        .state
        .players
        .get(&winner_id)
        .map(|p| p.name.clone())
        .unwrap_or_default();

    room.state.last_game = Some(LastGameRecord {
        reason,
        winner_id: Some(winner_id.clone()),
        winner_name: Some(winner_name.clone()),
    });

    let window = room.timings.rejoin_window;
    room.state.rejoin_window_ends_at = Some(Instant::now() + window);
    let handle = tokio::spawn({
        let room_arc = Arc::clone(room_arc);
        async move {
            tokio::time::sleep(window).await;
            let mut room = room_arc.lock().await;
            rejoin_window_expired(&mut room, &room_arc);
        }
    });
    room.timers.set_rejoin_window(handle);

    tracing::info!(room = %room.code, winner = %winner_id, ?reason, "Game over");
    broadcast::broadcast_to_all(
        &room.state,
        &room.senders,
        ServerMessage::GameOver {
            winner_id,
            winner_name,
            final_standings: standings,
            reason,
            rejoin_window_ms: window.as_millis() as u64,
        },
    );
}

// ── Rematch ──────────────────────────────────────────────────────────────

pub fn handle_play_again(room: &mut Room, room_arc: &Arc<Mutex<Room>>, connection: ConnectionId) {
    let Some(player_id) = room.state.player_id_by_connection(connection) else {
        broadcast::send_error(
            &room.senders,
            connection,
            ErrorCode::PlayerNotFound,
            "join the room first",
        );
        return;
    };
    if room.state.phase != Phase::GameOver
        || !room.state.is_rejoin_window_active(Instant::now())
    {
        broadcast::send_error(
            &room.senders,
            connection,
            ErrorCode::InvalidState,
            "no rematch to join right now",
        );
        return;
    }
    room.state.players_want_rematch.insert(player_id.clone());
    broadcast::broadcast_to_all(
        &room.state,
        &room.senders,
        ServerMessage::PlayAgainAck { player_id },
    );

    let opted_connected = rematch_roster(room).len();
    if opted_connected >= MIN_PLAYERS {
        // Enough takers — no point waiting out the window.
        room.timers.cancel_rejoin_window();
        resolve_rejoin_window(room, room_arc);
    }
}

/// Connected players who opted in, in join order.
fn rematch_roster(room: &Room) -> Vec<PlayerId> {
    room.state
        .join_order
        .iter()
        .filter_map(|id| room.state.players.get(id))
        .filter(|p| {
            p.status == PlayerStatus::Connected && room.state.players_want_rematch.contains(&p.id)
        })
        .map(|p| p.id.clone())
        .collect()
}

fn rejoin_window_expired(room: &mut Room, room_arc: &Arc<Mutex<Room>>) {
    if room.state.phase != Phase::GameOver {
        return;
    }
    resolve_rejoin_window(room, room_arc);
}

/// Decide the room's future at the end (or early close) of the rejoin
/// window: expire, boot a lone rematcher, or reset for the keepers.
fn resolve_rejoin_window(room: &mut Room, room_arc: &Arc<Mutex<Room>>) {
    let keep = rematch_roster(room);
    match keep.len() {
        0 => {
            tracing::info!(room = %room.code, "No rematch takers, room expiring");
            expire_room(room, "rejoin_window_expired");
        }
        1 => {
            let lonely = keep[0].clone();
            tracing::info!(room = %room.code, player = %lonely, "Solo rematch opt-in, booting");
            broadcast::send_to_player(
                &room.state,
                &room.senders,
                &lonely,
                ServerMessage::SoloRejoinBoot {
                    message: "Nobody else stayed for a rematch".to_string(),
                },
            );
            let delay = room.timings.solo_boot_delay;
            let handle = tokio::spawn({
                let room_arc = Arc::clone(room_arc);
                async move {
                    tokio::time::sleep(delay).await;
                    let mut room = room_arc.lock().await;
                    boot_solo(&mut room);
                }
            });
            // The rejoin slot is free again; reuse it for the boot delay.
            room.timers.set_rejoin_window(handle);
        }
        _ => {
            let keep_set: HashSet<PlayerId> = keep.iter().cloned().collect();
            for player_id in room.state.join_order.clone() {
                if keep_set.contains(&player_id) {
                    continue;
                }
                room.timers.cancel_grace(&player_id);
                room.state.disconnected_players.remove(&player_id);
                room.state.join_order.retain(|p| p != &player_id);
                if let Some(player) = room.state.players.remove(&player_id)
                    && let Some(connection) = player.connection_id
                {
                    room.state.connection_to_player.remove(&connection);
                    broadcast::close_connection(&room.senders, connection);
                }
            }
            room.state.reset_game_state();

            // Host may have been among the dropped.
            let host_kept = room
                .state
                .host_id
                .as_ref()
                .is_some_and(|h| room.state.players.contains_key(h));
            if !host_kept {
                if let Some(new_host) = room.state.join_order.first().cloned() {
                    if let Some(player) = room.state.players.get_mut(&new_host) {
                        player.is_host = true;
                    }
                    room.state.host_id = Some(new_host.clone());
                    broadcast::send_to_player(
                        &room.state,
                        &room.senders,
                        &new_host,
                        ServerMessage::YouAreHost {},
                    );
                    broadcast::broadcast_to_all(
                        &room.state,
                        &room.senders,
                        ServerMessage::HostChanged {
                            player_id: new_host,
                        },
                    );
                }
            }

            tracing::info!(room = %room.code, keepers = keep.len(), "Room reset for rematch");
            broadcast::broadcast_to_all(&room.state, &room.senders, ServerMessage::RoomReset {});
            broadcast::broadcast_personalised(&room.state, &room.senders, |state, recipient| {
                broadcast::snapshot_for(state, &recipient.id, Instant::now())
            });
            arm_room_timeout(room, room_arc);
        }
    }
}

/// Delayed close of the lone rematcher's connection, then a full reset.
fn boot_solo(room: &mut Room) {
    let connections: Vec<ConnectionId> =
        room.state.connection_to_player.keys().copied().collect();
    for connection in connections {
        broadcast::close_connection(&room.senders, connection);
    }
    room.timers.clear_all();
    room.state.reset_all();
}

// ── Room lifetime ────────────────────────────────────────────────────────

/// Arm (or re-arm) the lobby timer; fires only if still Waiting.
pub fn arm_room_timeout(room: &mut Room, room_arc: &Arc<Mutex<Room>>) {
    let timeout = room.timings.room_timeout;
    room.state.room_expires_at = Some(Instant::now() + timeout);
    let handle = tokio::spawn({
        let room_arc = Arc::clone(room_arc);
        async move {
            tokio::time::sleep(timeout).await;
            let mut room = room_arc.lock().await;
            lobby_expired(&mut room);
        }
    });
    room.timers.set_room_timeout(handle);
}

fn lobby_expired(room: &mut Room) {
    if room.state.phase != Phase::Waiting {
        return;
    }
    tracing::info!(room = %room.code, "Lobby timed out");
    expire_room(room, "lobby_timeout");
}

/// Terminal: tell every connection (joined or not) the room is gone,
/// close them all, and wipe the state.
fn expire_room(room: &mut Room, reason: &str) {
    let msg = ServerMessage::RoomExpired {
        reason: reason.to_string(),
    };
    for tx in room.senders.values() {
        let _ = tx.send(Outbound::Message(msg.clone()));
        let _ = tx.send(Outbound::Close);
    }
    room.timers.clear_all();
    room.state.reset_all();
}

/// A join arrived in GameOver after the rejoin window closed (or with no
/// roster left): recycle the room for a fresh game before admitting them.
pub fn full_reset_for_new_game(room: &mut Room) {
    tracing::info!(room = %room.code, "Recycling room for a new game");
    let connections: Vec<ConnectionId> =
        room.state.connection_to_player.keys().copied().collect();
    for connection in connections {
        broadcast::close_connection(&room.senders, connection);
    }
    room.timers.clear_all();
    room.state.reset_all();
}
