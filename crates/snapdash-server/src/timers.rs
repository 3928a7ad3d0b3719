//! Timer service: every deferred action a room owns, by named handle.
//!
//! Arming a timer replaces (aborts) any previous handle of the same name,
//! so a phase transition that re-arms can never orphan a task. Callbacks
//! run against the room lock and must re-check phase/state first — a fired
//! timer races against state changes right up to the lock boundary.
//!
//! There is no wall-clock recovery: if the process restarts, all timers are
//! gone. Rooms are ephemeral, so that is acceptable.

use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use snapdash_core::protocol::PlayerId;
use tokio::task::JoinHandle;

// ── Authoritative timing constants ──────────────────────────────────────

pub const PENALTY_DURATION_MS: u64 = 3_000;
pub const ARBITRATION_WINDOW_MS: u64 = 100;
pub const RECONNECT_GRACE_PERIOD_MS: u64 = 5_000;
pub const HOST_RECONNECT_GRACE_PERIOD_MS: u64 = 300_000;
pub const WAITING_GRACE_PERIOD_MS: u64 = 300_000;
pub const ROOM_TIMEOUT_MS: u64 = 1_800_000;
pub const REJOIN_WINDOW_MS: u64 = 1_800_000;
pub const MAX_MATCH_ATTEMPTS_PER_SECOND: u32 = 10;
pub const COUNTDOWN_SECONDS: u32 = 5;
pub const ROUND_TRANSITION_DELAY_MS: u64 = 3_500;
pub const SOLO_BOOT_DELAY_MS: u64 = 100;

/// All durations a room schedules with. Defaults are the authoritative
/// constants; tests shrink them so scenarios run under a paused clock.
#[derive(Debug, Clone)]
pub struct Timings {
    pub penalty: Duration,
    pub arbitration_window: Duration,
    pub reconnect_grace: Duration,
    pub host_reconnect_grace: Duration,
    pub waiting_grace: Duration,
    pub room_timeout: Duration,
    pub rejoin_window: Duration,
    pub countdown_seconds: u32,
    /// Interval between countdown ticks.
    pub countdown_step: Duration,
    pub round_transition_delay: Duration,
    pub solo_boot_delay: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            penalty: Duration::from_millis(PENALTY_DURATION_MS),
            arbitration_window: Duration::from_millis(ARBITRATION_WINDOW_MS),
            reconnect_grace: Duration::from_millis(RECONNECT_GRACE_PERIOD_MS),
            host_reconnect_grace: Duration::from_millis(HOST_RECONNECT_GRACE_PERIOD_MS),
            waiting_grace: Duration::from_millis(WAITING_GRACE_PERIOD_MS),
            room_timeout: Duration::from_millis(ROOM_TIMEOUT_MS),
            rejoin_window: Duration::from_millis(REJOIN_WINDOW_MS),
            countdown_seconds: COUNTDOWN_SECONDS,
            countdown_step: Duration::from_secs(1),
            round_transition_delay: Duration::from_millis(ROUND_TRANSITION_DELAY_MS),
            solo_boot_delay: Duration::from_millis(SOLO_BOOT_DELAY_MS),
        }
    }
}

/// Milliseconds since the Unix epoch, for wire timestamps.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Holder of every live timer handle of one room.
///
/// The arbitration window's handle lives inside `PendingArbitration`
/// (it is part of that window's identity); everything else is here.
#[derive(Default)]
pub struct TimerService {
    room_timeout: Option<JoinHandle<()>>,
    countdown: Option<JoinHandle<()>>,
    round_end: Option<JoinHandle<()>>,
    rejoin_window: Option<JoinHandle<()>>,
    grace: HashMap<PlayerId, JoinHandle<()>>,
}

fn replace(slot: &mut Option<JoinHandle<()>>, handle: JoinHandle<()>) {
    if let Some(old) = slot.replace(handle) {
        old.abort();
    }
}

fn cancel(slot: &mut Option<JoinHandle<()>>) {
    if let Some(old) = slot.take() {
        old.abort();
    }
}

impl TimerService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_room_timeout(&mut self, handle: JoinHandle<()>) {
        replace(&mut self.room_timeout, handle);
    }

    pub fn cancel_room_timeout(&mut self) {
        cancel(&mut self.room_timeout);
    }

    pub fn set_countdown(&mut self, handle: JoinHandle<()>) {
        replace(&mut self.countdown, handle);
    }

    pub fn cancel_countdown(&mut self) {
        cancel(&mut self.countdown);
    }

    pub fn is_countdown_active(&self) -> bool {
        self.countdown.as_ref().is_some_and(|h| !h.is_finished())
    }

    pub fn set_round_end(&mut self, handle: JoinHandle<()>) {
        replace(&mut self.round_end, handle);
    }

    pub fn cancel_round_end(&mut self) {
        cancel(&mut self.round_end);
    }

    pub fn set_rejoin_window(&mut self, handle: JoinHandle<()>) {
        replace(&mut self.rejoin_window, handle);
    }

    pub fn cancel_rejoin_window(&mut self) {
        cancel(&mut self.rejoin_window);
    }

    pub fn set_grace(&mut self, player_id: PlayerId, handle: JoinHandle<()>) {
        if let Some(old) = self.grace.insert(player_id, handle) {
            old.abort();
        }
    }

    pub fn cancel_grace(&mut self, player_id: &PlayerId) {
        if let Some(old) = self.grace.remove(player_id) {
            old.abort();
        }
    }

    /// Teardown: abort everything. Used when a room is destroyed.
    pub fn clear_all(&mut self) {
        self.cancel_room_timeout();
        self.cancel_countdown();
        self.cancel_round_end();
        self.cancel_rejoin_window();
        for (_, handle) in self.grace.drain() {
            handle.abort();
        }
    }
}

impl Drop for TimerService {
    fn drop(&mut self) {
        self.clear_all();
    }
}
