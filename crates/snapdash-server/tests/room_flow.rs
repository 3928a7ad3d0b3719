//! End-to-end room scenarios, driven through the real message handlers
//! with fake connections (unbounded channels) and a paused Tokio clock.
//!
//! Sleeping in a paused test advances virtual time deterministically, so
//! grace periods, the arbitration window, and round transitions all fire
//! exactly on schedule.

use std::sync::Arc;
use std::time::Duration;

use snapdash_core::cards::Card;
use snapdash_core::config::GameConfig;
use snapdash_core::protocol::{
    ErrorCode, GameEndReason, Phase, PlayerId, ServerMessage,
};
use snapdash_server::room::{Outbound, OutboundRx, Room};
use snapdash_server::state::ConnectionId;
use snapdash_server::timers::Timings;
use snapdash_server::{engine, players};
use tokio::sync::{Mutex, mpsc};
use tokio::time::sleep;

/// Real-sized timings except the rejoin window, which is shrunk so the
/// rematch tests don't advance the clock by half an hour.
fn test_timings() -> Timings {
    Timings {
        rejoin_window: Duration::from_millis(30_000),
        ..Timings::default()
    }
}

struct TestClient {
    connection: ConnectionId,
    rx: OutboundRx,
    id: PlayerId,
}

struct Harness {
    room: Arc<Mutex<Room>>,
    next_connection: ConnectionId,
}

impl Harness {
    fn new() -> Self {
        Self {
            room: Arc::new(Mutex::new(Room::new("test1".to_string(), test_timings()))),
            next_connection: 1,
        }
    }

    /// Open a bare connection (pre-join).
    async fn connect(&mut self) -> (ConnectionId, OutboundRx) {
        let connection = self.next_connection;
        self.next_connection += 1;
        let (tx, rx) = mpsc::unbounded_channel();
        self.room.lock().await.senders.insert(connection, tx);
        (connection, rx)
    }

    async fn join(&mut self, name: &str) -> TestClient {
        let (connection, rx) = self.connect().await;
        let id = {
            let mut room = self.room.lock().await;
            players::handle_join(&mut room, &self.room, connection, name);
            room.state
                .player_id_by_connection(connection)
                .expect("join should succeed")
        };
        TestClient { connection, rx, id }
    }

    /// Simulate the transport noticing a dropped socket.
    async fn close_socket(&self, client: &TestClient) {
        let mut room = self.room.lock().await;
        players::handle_socket_closed(&mut room, &self.room, client.connection);
    }

    /// Open a new connection and reconnect an existing identity over it.
    async fn reconnect(&mut self, id: &PlayerId) -> (ConnectionId, OutboundRx) {
        let (connection, rx) = self.connect().await;
        let mut room = self.room.lock().await;
        players::handle_reconnect(&mut room, connection, id.clone());
        (connection, rx)
    }

    async fn set_config(&self, client: &TestClient, config: GameConfig) {
        let mut room = self.room.lock().await;
        engine::handle_set_config(&mut room, client.connection, config);
    }

    async fn start_game(&self, client: &TestClient) {
        let mut room = self.room.lock().await;
        engine::handle_start_game(&mut room, &self.room, client.connection, None);
    }

    async fn match_attempt(&self, connection: ConnectionId, symbol: i64) {
        let mut room = self.room.lock().await;
        engine::handle_match_attempt(&mut room, &self.room, connection, symbol, 0);
    }

    async fn play_again(&self, connection: ConnectionId) {
        let mut room = self.room.lock().await;
        engine::handle_play_again(&mut room, &self.room, connection);
    }

    async fn phase(&self) -> Phase {
        self.room.lock().await.state.phase
    }
}

/// Drain everything queued for a client; `true` in the second slot means a
/// close was requested.
fn drain(rx: &mut OutboundRx) -> (Vec<ServerMessage>, bool) {
    let mut msgs = Vec::new();
    let mut closed = false;
    while let Ok(item) = rx.try_recv() {
        match item {
            Outbound::Message(msg) => msgs.push(msg),
            Outbound::Close => closed = true,
        }
    }
    (msgs, closed)
}

fn drain_msgs(client: &mut TestClient) -> Vec<ServerMessage> {
    drain(&mut client.rx).0
}

/// Pull the per-player view of the latest `round_start` out of a drained
/// message list: (centre, own top card, round number).
fn last_round_start(msgs: &[ServerMessage]) -> Option<(Card, Card, u32)> {
    msgs.iter().rev().find_map(|m| match m {
        ServerMessage::RoundStart {
            center_card,
            your_card,
            round_number,
            ..
        } => Some((center_card.clone(), your_card.clone(), *round_number)),
        _ => None,
    })
}

/// A symbol on the player's top card that is NOT on the centre card, i.e.
/// a guaranteed-invalid claim.
fn bogus_symbol(center: &Card, yours: &Card) -> i64 {
    yours
        .symbols
        .iter()
        .copied()
        .find(|s| !center.has_symbol(*s))
        .expect("top card always has non-shared symbols") as i64
}

/// Drive a short game (duration 10) to the Playing phase.
async fn start_short_game(harness: &Harness, host: &TestClient) {
    harness
        .set_config(
            host,
            GameConfig {
                game_duration: 10,
                ..GameConfig::default()
            },
        )
        .await;
    harness.start_game(host).await;
    // 5-second countdown, one tick per second.
    sleep(Duration::from_millis(5_100)).await;
    assert_eq!(harness.phase().await, Phase::Playing);
}

// ── Scenario 1: auto-host and lobby handover ────────────────────────────

#[tokio::test(start_paused = true)]
async fn auto_host_then_fresh_host_after_grace() {
    let mut harness = Harness::new();

    let mut a = harness.join("Ada").await;
    let a_msgs = drain_msgs(&mut a);
    assert!(
        a_msgs
            .iter()
            .any(|m| matches!(m, ServerMessage::YouAreHost {})),
        "first joiner becomes host"
    );
    let ServerMessage::RoomState(snapshot) = a_msgs
        .iter()
        .find(|m| matches!(m, ServerMessage::RoomState(_)))
        .expect("joiner gets a snapshot")
    else {
        unreachable!()
    };
    assert_eq!(snapshot.host_id.as_ref(), Some(&a.id));
    assert!(snapshot.players[0].is_you && snapshot.players[0].is_host);

    // Host drops; the (host) grace period runs out; the room empties.
    harness.close_socket(&a).await;
    sleep(Duration::from_millis(300_100)).await;
    assert!(harness.room.lock().await.state.players.is_empty());

    // A newcomer starts fresh and becomes host — no handover broadcast,
    // because there was nobody to hand over between.
    let mut b = harness.join("Bea").await;
    let b_msgs = drain_msgs(&mut b);
    assert!(
        b_msgs
            .iter()
            .any(|m| matches!(m, ServerMessage::YouAreHost {}))
    );
    assert!(
        b_msgs
            .iter()
            .all(|m| !matches!(m, ServerMessage::HostChanged { .. }))
    );
}

// ── Scenario 2: simultaneous match arbitration ──────────────────────────

#[tokio::test(start_paused = true)]
async fn first_server_arrival_wins_simultaneous_match() {
    let mut harness = Harness::new();
    let mut a = harness.join("Ada").await;
    let mut b = harness.join("Bea").await;

    start_short_game(&harness, &a).await;

    let (center, a_card, _) = last_round_start(&drain_msgs(&mut a)).expect("round start");
    let (_, b_card, _) = last_round_start(&drain_msgs(&mut b)).expect("round start");
    let a_symbol = a_card.shared_symbol(&center).expect("dobble invariant") as i64;
    let b_symbol = b_card.shared_symbol(&center).expect("dobble invariant") as i64;

    // A reaches the server first; B lands 30 ms later, inside the window.
    harness.match_attempt(a.connection, a_symbol).await;
    sleep(Duration::from_millis(30)).await;
    harness.match_attempt(b.connection, b_symbol).await;

    // Window closes 100 ms after A's claim.
    sleep(Duration::from_millis(100)).await;

    let a_id = a.id.clone();
    for client in [&mut a, &mut b] {
        let msgs = drain_msgs(client);
        let winners: Vec<_> = msgs
            .iter()
            .filter_map(|m| match m {
                ServerMessage::RoundWinner { winner_id, .. } => Some(winner_id.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(winners.len(), 1, "exactly one round_winner per client");
        assert_eq!(winners[0], a_id);
    }
}

// ── Scenario 3: penalty, lockout, recovery ──────────────────────────────

#[tokio::test(start_paused = true)]
async fn penalty_blocks_then_expires() {
    let mut harness = Harness::new();
    let mut a = harness.join("Ada").await;
    let mut b = harness.join("Bea").await;

    start_short_game(&harness, &a).await;
    let (center, a_card, _) = last_round_start(&drain_msgs(&mut a)).expect("round start");
    drain_msgs(&mut b);

    // Wrong symbol: penalty with the full duration attached.
    harness
        .match_attempt(a.connection, bogus_symbol(&center, &a_card))
        .await;
    let msgs = drain_msgs(&mut a);
    assert!(msgs.iter().any(|m| matches!(
        m,
        ServerMessage::Penalty { duration_ms: 3_000, .. }
    )));

    // Inside the penalty, even a correct claim bounces.
    sleep(Duration::from_millis(1_000)).await;
    let good = a_card.shared_symbol(&center).expect("dobble invariant") as i64;
    harness.match_attempt(a.connection, good).await;
    let msgs = drain_msgs(&mut a);
    assert!(msgs.iter().any(|m| matches!(
        m,
        ServerMessage::Error { code: ErrorCode::InPenalty, .. }
    )));

    // Past the penalty the same claim wins the round.
    sleep(Duration::from_millis(2_100)).await;
    harness.match_attempt(a.connection, good).await;
    sleep(Duration::from_millis(150)).await;
    let msgs = drain_msgs(&mut a);
    assert!(
        msgs.iter()
            .any(|m| matches!(m, ServerMessage::RoundWinner { winner_id, .. } if *winner_id == a.id))
    );
}

// ── Scenario 4: disconnect during play ends the game ────────────────────

#[tokio::test(start_paused = true)]
async fn grace_expiry_mid_game_leaves_last_player_standing() {
    let mut harness = Harness::new();
    let mut a = harness.join("Ada").await;
    let b = harness.join("Bea").await;

    start_short_game(&harness, &a).await;
    drain_msgs(&mut a);

    harness.close_socket(&b).await;
    // 5-second mid-game grace, then removal.
    sleep(Duration::from_millis(5_100)).await;

    let msgs = drain_msgs(&mut a);
    assert!(
        msgs.iter()
            .any(|m| matches!(m, ServerMessage::PlayerDisconnected { player_id } if *player_id == b.id))
    );
    assert!(
        msgs.iter()
            .any(|m| matches!(m, ServerMessage::PlayerLeft { player_id } if *player_id == b.id))
    );
    let game_over = msgs
        .iter()
        .find_map(|m| match m {
            ServerMessage::GameOver {
                winner_id,
                final_standings,
                reason,
                rejoin_window_ms,
                ..
            } => Some((winner_id, final_standings, *reason, *rejoin_window_ms)),
            _ => None,
        })
        .expect("game ends when the roster collapses");
    assert_eq!(game_over.0, &a.id);
    assert_eq!(game_over.2, GameEndReason::LastPlayerStanding);
    assert_eq!(game_over.3, 30_000);
    // The survivor's stack is emptied to mark the win.
    assert_eq!(game_over.1[0].player_id, a.id);
    assert_eq!(game_over.1[0].cards_remaining, 0);
    assert_eq!(harness.phase().await, Phase::GameOver);
}

// ── Scenario 5: reconnect during play ───────────────────────────────────

#[tokio::test(start_paused = true)]
async fn reconnect_within_grace_restores_the_hand() {
    let mut harness = Harness::new();
    let mut a = harness.join("Ada").await;
    let mut b = harness.join("Bea").await;
    let mut c = harness.join("Cyd").await;

    start_short_game(&harness, &a).await;
    let (center, c_card, round) = last_round_start(&drain_msgs(&mut c)).expect("round start");
    drain_msgs(&mut a);
    drain_msgs(&mut b);

    harness.close_socket(&c).await;
    sleep(Duration::from_millis(1_000)).await;
    let (_, mut c_rx) = harness.reconnect(&c.id).await;

    // Everyone saw the drop and the return, and no phantom join.
    let a_msgs = drain_msgs(&mut a);
    assert!(
        a_msgs
            .iter()
            .any(|m| matches!(m, ServerMessage::PlayerDisconnected { player_id } if *player_id == c.id))
    );
    assert!(
        a_msgs
            .iter()
            .any(|m| matches!(m, ServerMessage::PlayerReconnected { player_id } if *player_id == c.id))
    );
    assert!(
        a_msgs
            .iter()
            .all(|m| !matches!(m, ServerMessage::PlayerJoined { .. }))
    );

    // C's fresh snapshot carries the live game, with the hand preserved.
    let (c_msgs, _) = drain(&mut c_rx);
    let ServerMessage::RoomState(snapshot) = c_msgs
        .iter()
        .rev()
        .find(|m| matches!(m, ServerMessage::RoomState(_)))
        .expect("reconnect snapshot")
    else {
        unreachable!()
    };
    assert_eq!(snapshot.phase, Phase::Playing);
    assert_eq!(snapshot.round_number, round);
    assert_eq!(snapshot.center_card.as_ref().map(|card| card.id), Some(center.id));
    assert_eq!(snapshot.your_card.as_ref().map(|card| card.id), Some(c_card.id));
    assert!(harness.room.lock().await.state.disconnected_players.is_empty());
}

// ── Scenario 6: rematch resets the room for the takers ──────────────────

/// Let one player win rounds until their stack empties.
async fn play_until_stack_empty(
    harness: &Harness,
    winner: &mut TestClient,
    others: &mut [&mut TestClient],
) {
    loop {
        let msgs = drain_msgs(winner);
        for other in others.iter_mut() {
            drain_msgs(other);
        }
        let (center, card, _) = last_round_start(&msgs).expect("round start");
        let symbol = card.shared_symbol(&center).expect("dobble invariant") as i64;
        harness.match_attempt(winner.connection, symbol).await;
        // Arbitration window, then either game over or the next round.
        sleep(Duration::from_millis(150)).await;
        if harness.phase().await == Phase::GameOver {
            return;
        }
        sleep(Duration::from_millis(3_500)).await;
    }
}

#[tokio::test(start_paused = true)]
async fn rematch_keeps_optins_and_drops_the_rest() {
    let mut harness = Harness::new();
    let mut a = harness.join("Ada").await;
    let mut b = harness.join("Bea").await;
    let mut c = harness.join("Cyd").await;

    start_short_game(&harness, &a).await;
    play_until_stack_empty(&harness, &mut a, &mut [&mut b, &mut c]).await;

    let a_over = drain_msgs(&mut a);
    assert!(a_over.iter().any(|m| matches!(
        m,
        ServerMessage::GameOver { reason: GameEndReason::StackEmptied, winner_id, .. }
            if *winner_id == a.id
    )));

    harness.play_again(a.connection).await;
    sleep(Duration::from_millis(10_000)).await;
    assert!(
        drain_msgs(&mut b)
            .iter()
            .any(|m| matches!(m, ServerMessage::PlayAgainAck { player_id } if *player_id == a.id))
    );

    // Second opt-in crosses the threshold: immediate reset.
    harness.play_again(b.connection).await;

    let (c_msgs, c_closed) = drain(&mut c.rx);
    assert!(c_closed, "non-rematcher is disconnected");
    assert!(
        c_msgs
            .iter()
            .all(|m| !matches!(m, ServerMessage::RoomReset {})),
        "the dropped player is not part of the reset"
    );

    let a_msgs = drain_msgs(&mut a);
    assert!(a_msgs.iter().any(|m| matches!(m, ServerMessage::RoomReset {})));
    let ServerMessage::RoomState(snapshot) = a_msgs
        .iter()
        .rev()
        .find(|m| matches!(m, ServerMessage::RoomState(_)))
        .expect("post-reset snapshot")
    else {
        unreachable!()
    };
    assert_eq!(snapshot.phase, Phase::Waiting);
    assert_eq!(snapshot.players.len(), 2);
    assert!(snapshot.players.iter().all(|p| p.cards_remaining == 0));
    // A was host before and still is.
    assert_eq!(snapshot.host_id.as_ref(), Some(&a.id));

    let room = harness.room.lock().await;
    assert_eq!(room.state.phase, Phase::Waiting);
    assert!(room.state.room_expires_at.is_some(), "lobby timer re-armed");
    assert!(!room.state.players.contains_key(&c.id));
}

// ── Boundary behaviours ─────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn ninth_join_is_refused() {
    let mut harness = Harness::new();
    for i in 0..8 {
        harness.join(&format!("p{i}")).await;
    }
    let (connection, mut rx) = harness.connect().await;
    {
        let mut room = harness.room.lock().await;
        players::handle_join(&mut room, &harness.room, connection, "late");
    }
    let (msgs, _) = drain(&mut rx);
    assert!(msgs.iter().any(|m| matches!(
        m,
        ServerMessage::Error { code: ErrorCode::RoomFull, .. }
    )));
    assert_eq!(harness.room.lock().await.state.players.len(), 8);
}

#[tokio::test(start_paused = true)]
async fn start_needs_two_connected_not_just_two_listed() {
    let mut harness = Harness::new();
    let mut a = harness.join("Ada").await;
    let b = harness.join("Bea").await;

    harness.close_socket(&b).await;
    drain_msgs(&mut a);

    harness.start_game(&a).await;
    let msgs = drain_msgs(&mut a);
    assert!(msgs.iter().any(|m| matches!(
        m,
        ServerMessage::Error { code: ErrorCode::InvalidState, .. }
    )));
    assert_eq!(harness.phase().await, Phase::Waiting);
}

#[tokio::test(start_paused = true)]
async fn short_deck_two_players_deals_four_each() {
    let mut harness = Harness::new();
    let a = harness.join("Ada").await;
    let b = harness.join("Bea").await;

    start_short_game(&harness, &a).await;

    let room = harness.room.lock().await;
    assert_eq!(room.state.full_deck.len(), 10);
    assert!(room.state.center_card.is_some());
    for id in [&a.id, &b.id] {
        assert_eq!(room.state.players.get(id).unwrap().card_stack.len(), 4);
    }
    // 1 centre + 2×4 dealt = 9; one card of the ten never enters play.
}

#[tokio::test(start_paused = true)]
async fn join_is_idempotent_per_connection() {
    let mut harness = Harness::new();
    let mut a = harness.join("Ada").await;
    drain_msgs(&mut a);

    {
        let mut room = harness.room.lock().await;
        players::handle_join(&mut room, &harness.room, a.connection, "Ada again");
    }
    let msgs = drain_msgs(&mut a);
    assert_eq!(msgs.len(), 1, "only a snapshot refresh");
    assert!(matches!(msgs[0], ServerMessage::RoomState(_)));
    assert_eq!(harness.room.lock().await.state.players.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn join_during_playing_is_rejected() {
    let mut harness = Harness::new();
    let a = harness.join("Ada").await;
    harness.join("Bea").await;
    start_short_game(&harness, &a).await;

    let (connection, mut rx) = harness.connect().await;
    {
        let mut room = harness.room.lock().await;
        players::handle_join(&mut room, &harness.room, connection, "late");
    }
    let (msgs, _) = drain(&mut rx);
    assert!(msgs.iter().any(|m| matches!(
        m,
        ServerMessage::Error { code: ErrorCode::GameInProgress, .. }
    )));
}

#[tokio::test(start_paused = true)]
async fn countdown_cancels_when_a_player_leaves() {
    let mut harness = Harness::new();
    let mut a = harness.join("Ada").await;
    let b = harness.join("Bea").await;

    harness.start_game(&a).await;
    sleep(Duration::from_millis(2_000)).await;
    assert_eq!(harness.phase().await, Phase::Countdown);

    {
        let mut room = harness.room.lock().await;
        players::handle_leave(&mut room, &harness.room, b.connection);
    }

    let msgs = drain_msgs(&mut a);
    assert!(
        msgs.iter()
            .any(|m| matches!(m, ServerMessage::Countdown { seconds: -1 })),
        "cancellation is announced with -1"
    );
    assert_eq!(harness.phase().await, Phase::Waiting);

    // No stray tick arrives afterwards.
    sleep(Duration::from_millis(5_000)).await;
    let msgs = drain_msgs(&mut a);
    assert!(
        msgs.iter()
            .all(|m| !matches!(m, ServerMessage::Countdown { .. }))
    );
}

#[tokio::test(start_paused = true)]
async fn unknown_reconnect_id_leaves_the_connection_usable() {
    let mut harness = Harness::new();
    harness.join("Ada").await;

    let (connection, mut rx) = {
        let (connection, rx) = harness.connect().await;
        let mut room = harness.room.lock().await;
        players::handle_reconnect(&mut room, connection, PlayerId("nope".to_string()));
        (connection, rx)
    };
    let (msgs, closed) = drain(&mut rx);
    assert!(msgs.iter().any(|m| matches!(
        m,
        ServerMessage::Error { code: ErrorCode::PlayerNotFound, .. }
    )));
    assert!(!closed, "connection stays open for a fresh join");

    // The same connection can still join normally.
    {
        let mut room = harness.room.lock().await;
        players::handle_join(&mut room, &harness.room, connection, "Dan");
    }
    let (msgs, _) = drain(&mut rx);
    assert!(msgs.iter().any(|m| matches!(m, ServerMessage::RoomState(_))));
}
