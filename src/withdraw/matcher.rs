//! Finds which registered card produced a tap.
//!
//! The tap payload does not identify its card, so every known card's keys
//! are tried in registry order and the first successful authentication wins.
//! Two cards whose keys both authenticate one payload are indistinguishable
//! here; the first in registry order is selected without further checks.

use anyhow::Result;
use tracing::{debug, trace};

use super::CardRegistry;
use crate::crypto::{self, TapInfo};
use crate::db::models::BoltCard;

/// Returns the first card whose keys authenticate the payload, or `None`
/// when no registered card matches.
///
/// Starts from the registry's in-memory snapshot; right after process launch
/// that snapshot may not be populated yet, so an empty snapshot falls back
/// to a direct storage read before concluding the card is unknown.
pub async fn find_matching_card<R: CardRegistry + ?Sized>(
    registry: &R,
    payload: &[u8],
    cmac: &[u8],
) -> Result<Option<(BoltCard, TapInfo)>> {
    let mut cards = registry.cards_snapshot().await;
    if cards.is_empty() {
        cards = registry.list_cards().await?;
    }

    debug!(count = cards.len(), "matching tap against registered cards");

    for card in cards {
        if card.is_archived {
            continue;
        }

        match crypto::extract_tap_info(&card.keys, payload, cmac) {
            Ok(info) => {
                debug!(card_id = card.card_id, counter = %info.counter, "tag authenticated");
                return Ok(Some((card, info)));
            }
            Err(err) => {
                trace!(card_id = card.card_id, "no match: {err}");
            }
        }
    }

    Ok(None)
}
