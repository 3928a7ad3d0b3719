//! Room configuration and player limits.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cards::{self, TOTAL_SYMBOLS};

/// Hard cap on players per room.
pub const MAX_PLAYERS: usize = 8;
/// Minimum connected players needed to start (and keep) a game.
pub const MIN_PLAYERS: usize = 2;
/// Longest accepted player name after trimming.
pub const MAX_NAME_LENGTH: usize = 50;

/// Deck sizes selectable as game length: short, medium, long.
pub const GAME_DURATIONS: [u16; 3] = [10, 25, 50];

/// How symbols are arranged when the client renders a card.
///
/// Server-side this is pass-through config; only clients interpret it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CardLayout {
    Orderly,
    Chaotic,
}

/// Per-room game configuration, set by the host before a game starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameConfig {
    pub card_layout: CardLayout,
    pub card_set_id: String,
    /// Maximum number of cards kept after deck generation (10 / 25 / 50).
    pub game_duration: u16,
    /// Custom symbol list; when present it replaces the card set and must
    /// contain exactly [`TOTAL_SYMBOLS`] entries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_symbols: Option<Vec<String>>,
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            card_layout: CardLayout::Orderly,
            card_set_id: cards::DEFAULT_CARD_SET.to_string(),
            game_duration: GAME_DURATIONS[1],
            custom_symbols: None,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("gameDuration must be one of {GAME_DURATIONS:?}, got {0}")]
    BadDuration(u16),
    #[error("unknown card set '{0}'")]
    UnknownCardSet(String),
    #[error("custom symbol list needs exactly {TOTAL_SYMBOLS} entries, got {0}")]
    BadSymbolCount(usize),
}

impl GameConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !GAME_DURATIONS.contains(&self.game_duration) {
            return Err(ConfigError::BadDuration(self.game_duration));
        }
        if let Some(symbols) = &self.custom_symbols {
            if symbols.len() != TOTAL_SYMBOLS {
                return Err(ConfigError::BadSymbolCount(symbols.len()));
            }
        } else if cards::card_set_symbols(&self.card_set_id).is_none() {
            return Err(ConfigError::UnknownCardSet(self.card_set_id.clone()));
        }
        Ok(())
    }

    /// The symbol list this configuration plays with: the custom list when
    /// present (and correctly sized), otherwise the configured card set.
    pub fn resolve_symbols(&self) -> Result<Vec<String>, ConfigError> {
        if let Some(symbols) = &self.custom_symbols {
            if symbols.len() != TOTAL_SYMBOLS {
                return Err(ConfigError::BadSymbolCount(symbols.len()));
            }
            return Ok(symbols.clone());
        }
        cards::card_set_symbols(&self.card_set_id)
            .ok_or_else(|| ConfigError::UnknownCardSet(self.card_set_id.clone()))
    }
}
