//! Authoritative room server for the Snapdash picture-matching game.
//!
//! Each room is an isolated unit of state behind an `Arc<Mutex<Room>>`:
//! inbound messages and timer callbacks lock the room for the whole
//! mutation-plus-fan-out, so everything a room does is serialised and every
//! personalised broadcast is atomic. The modules mirror the room's
//! services: state store, player lifecycle, timers, match arbitration,
//! game engine, and outbound broadcast.

pub mod arbitration;
pub mod broadcast;
pub mod engine;
pub mod players;
pub mod room;
pub mod state;
pub mod timers;
pub mod ws_handler;
