//! Cards, symbols, and deck generation.
//!
//! A deck is a finite projective plane of order `n` rendered as cards: one
//! card per line, one symbol per point. The defining property — any two
//! cards share exactly one symbol — is what the whole game rides on.
//! For the standard order-7 deck that means 57 cards, 57 symbols, and
//! 8 symbols per card.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Projective-plane order of the standard deck.
pub const DECK_ORDER: u8 = 7;
/// Symbols printed on each card of the standard deck (`order + 1`).
pub const SYMBOLS_PER_CARD: usize = 8;
/// Distinct symbols (and cards) in the standard deck (`order² + order + 1`).
pub const TOTAL_SYMBOLS: usize = 57;

/// Index into the symbol list of the active card set.
pub type SymbolId = u8;
/// Stable card identifier, assigned at generation and never reused.
pub type CardId = u16;

/// A single game card.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Card {
    pub id: CardId,
    pub symbols: Vec<SymbolId>,
}

impl Card {
    pub fn has_symbol(&self, symbol: SymbolId) -> bool {
        self.symbols.contains(&symbol)
    }

    /// The one symbol this card shares with `other`, if the pair came from
    /// the same deck.
    pub fn shared_symbol(&self, other: &Card) -> Option<SymbolId> {
        self.symbols
            .iter()
            .copied()
            .find(|s| other.symbols.contains(s))
    }
}

impl fmt::Display for Card {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}[", self.id)?;
        for (i, s) in self.symbols.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{s}")?;
        }
        f.write_str("]")
    }
}

/// Errors from [`generate`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DeckError {
    #[error("deck order {0} is not a supported prime")]
    UnsupportedOrder(u8),
    #[error("deck of order {order} needs {want} symbols, got {got}")]
    WrongSymbolCount { order: u8, want: usize, got: usize },
}

/// Orders for which the affine construction below is valid.
const SUPPORTED_ORDERS: [u8; 5] = [2, 3, 5, 7, 11];

/// Generate the full deck for a projective plane of order `order`.
///
/// `symbols` is the symbol list of the active card set; its length must be
/// exactly `order² + order + 1`, and symbol `i` of the result indexes into
/// it. Deterministic: the same `(order, symbols)` always yields the same
/// cards in the same sequence, so shuffling is the caller's only source of
/// entropy.
pub fn generate(order: u8, symbols: &[String]) -> Result<Vec<Card>, DeckError> {
    if !SUPPORTED_ORDERS.contains(&order) {
        return Err(DeckError::UnsupportedOrder(order));
    }
    let n = order as usize;
    let want = n * n + n + 1;
    if symbols.len() != want {
        return Err(DeckError::WrongSymbolCount {
            order,
            want,
            got: symbols.len(),
        });
    }

    // Points are numbered: (x, y) -> x*n + y, slope point a -> n² + a,
    // and the vertical-direction point -> n² + n. Lines become cards.
    let mut deck = Vec::with_capacity(want);
    let mut next_id: CardId = 0;
    let mut push = |deck: &mut Vec<Card>, symbols: Vec<SymbolId>| {
        deck.push(Card {
            id: next_id,
            symbols,
        });
        next_id += 1;
    };

    // Lines of slope a: y = a*x + b, closed off by the slope point.
    for a in 0..n {
        for b in 0..n {
            let mut card: Vec<SymbolId> = (0..n)
                .map(|x| (x * n + (a * x + b) % n) as SymbolId)
                .collect();
            card.push((n * n + a) as SymbolId);
            push(&mut deck, card);
        }
    }

    // Vertical lines x = c, closed off by the vertical-direction point.
    for c in 0..n {
        let mut card: Vec<SymbolId> = (0..n).map(|y| (c * n + y) as SymbolId).collect();
        card.push((n * n + n) as SymbolId);
        push(&mut deck, card);
    }

    // The line at infinity: all direction points.
    let infinity: Vec<SymbolId> = (0..=n).map(|a| (n * n + a) as SymbolId).collect();
    push(&mut deck, infinity);

    Ok(deck)
}

// ---------------------------------------------------------------------------
// Card sets
// ---------------------------------------------------------------------------

/// Card set used when a room is created with no explicit configuration.
pub const DEFAULT_CARD_SET: &str = "classic";

/// Built-in card set IDs accepted by the `cardSetId` config field.
pub fn card_set_ids() -> &'static [&'static str] {
    &["classic", "animals"]
}

/// Resolve a built-in card set to its symbol list.
///
/// Returns `None` for unknown IDs; the caller decides whether that is a
/// config error or a fall-back to [`DEFAULT_CARD_SET`].
pub fn card_set_symbols(card_set_id: &str) -> Option<Vec<String>> {
    let names: &[&str; TOTAL_SYMBOLS] = match card_set_id {
        "classic" => &CLASSIC_SYMBOLS,
        "animals" => &ANIMAL_SYMBOLS,
        _ => return None,
    };
    Some(names.iter().map(|s| s.to_string()).collect())
}

const CLASSIC_SYMBOLS: [&str; TOTAL_SYMBOLS] = [
    "anchor", "apple", "bird", "bomb", "cactus", "candle", "carrot", "cheese",
    "clock", "clover", "clown", "crescent-moon", "daisy", "dinosaur", "dog", "dolphin",
    "dragon", "droplet", "exclamation", "eye", "fire", "ghost", "gift", "hammer",
    "heart", "ice-cube", "igloo", "key", "ladybird", "leaf", "light-bulb", "lightning",
    "lips", "lock", "mushroom", "musical-note", "pencil", "question-mark", "rainbow", "scissors",
    "skull", "snowflake", "snowman", "spider", "splash", "star", "sun", "sunglasses",
    "target", "taxi", "tortoise", "treble-clef", "tree", "umbrella", "web", "yin-yang",
    "zebra",
];

const ANIMAL_SYMBOLS: [&str; TOTAL_SYMBOLS] = [
    "ant", "badger", "bat", "bear", "bee", "beetle", "bison", "butterfly",
    "camel", "cat", "chicken", "cobra", "crab", "crow", "deer", "dingo",
    "donkey", "duck", "eagle", "elephant", "ferret", "flamingo", "fox", "frog",
    "gecko", "giraffe", "goat", "goose", "hedgehog", "heron", "horse", "hyena",
    "ibis", "jaguar", "koala", "lemur", "lion", "llama", "lobster", "magpie",
    "meerkat", "mole", "moose", "newt", "octopus", "otter", "owl", "panda",
    "penguin", "rabbit", "raccoon", "seal", "shark", "sloth", "swan", "walrus",
    "wombat",
];
