use anyhow::{Result, anyhow};

use crate::crypto::{AesKey, CardUid, KeySet, TapInfo};
use crate::currency::{Currency, CurrencyAmount};

/// A locally registered bolt card.
///
/// Mutated only through the registry's save operations. Archived cards are
/// excluded from tap matching but kept forever, since historical payments
/// reference them.
#[derive(Debug, Clone, PartialEq)]
pub struct BoltCard {
    pub card_id: i64,
    pub card_name: String,
    /// Physical tag identifier, learned from the first authenticated tap.
    pub uid: Option<CardUid>,
    pub keys: KeySet,
    /// Highest tap counter seen so far; taps must exceed this to be accepted.
    pub last_counter: u32,
    pub is_active: bool,
    pub is_archived: bool,
    pub daily_limit: Option<CurrencyAmount>,
    pub monthly_limit: Option<CurrencyAmount>,
}

impl BoltCard {
    /// Copy of this card with the counter advanced to the tap's value and
    /// the UID learned if it wasn't known yet.
    pub fn with_tap_info(&self, info: &TapInfo) -> BoltCard {
        let mut card = self.clone();
        card.last_counter = card.last_counter.max(info.counter.value());
        if card.uid.is_none() {
            card.uid = Some(info.uid.clone());
        }
        card
    }
}

/// Raw `cards` row; converted to [`BoltCard`] after parsing keys and limits.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CardRow {
    pub card_id: i64,
    pub card_name: String,
    pub uid: String,
    pub k1_decrypt_key: String,
    pub k2_cmac_key: String,
    pub last_counter: i64,
    pub is_active: bool,
    pub is_archived: bool,
    pub daily_limit_amount: Option<f64>,
    pub daily_limit_currency: Option<String>,
    pub monthly_limit_amount: Option<f64>,
    pub monthly_limit_currency: Option<String>,
}

fn limit_from_columns(amount: Option<f64>, currency: Option<&str>) -> Option<CurrencyAmount> {
    match (amount, currency) {
        (Some(amount), Some(code)) => {
            Some(CurrencyAmount { currency: Currency::from_code(code), amount })
        }
        _ => None,
    }
}

impl TryFrom<CardRow> for BoltCard {
    type Error = anyhow::Error;

    fn try_from(row: CardRow) -> Result<Self> {
        let uid = if row.uid.is_empty() { None } else { Some(CardUid::from_hex(&row.uid)?) };
        let keys = KeySet {
            decrypt_key: AesKey::from_hex(&row.k1_decrypt_key)?,
            cmac_key: AesKey::from_hex(&row.k2_cmac_key)?,
        };
        let last_counter = u32::try_from(row.last_counter)
            .map_err(|_| anyhow!("invalid counter value {}", row.last_counter))?;

        Ok(BoltCard {
            card_id: row.card_id,
            card_name: row.card_name,
            uid,
            keys,
            last_counter,
            is_active: row.is_active,
            is_archived: row.is_archived,
            daily_limit: limit_from_columns(
                row.daily_limit_amount,
                row.daily_limit_currency.as_deref(),
            ),
            monthly_limit: limit_from_columns(
                row.monthly_limit_amount,
                row.monthly_limit_currency.as_deref(),
            ),
        })
    }
}

/// One settled card payment; the raw material of the spending windows.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CardPayment {
    pub payment_id: i64,
    pub card_id: i64,
    pub amount_msat: i64,
    /// Epoch millis at settlement time.
    pub settled_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{self, Counter};

    fn sample_row() -> CardRow {
        let keys = KeySet::generate();
        CardRow {
            card_id: 7,
            card_name: "groceries".into(),
            uid: String::new(),
            k1_decrypt_key: keys.decrypt_key.to_string(),
            k2_cmac_key: keys.cmac_key.to_string(),
            last_counter: 5,
            is_active: true,
            is_archived: false,
            daily_limit_amount: Some(120_000.0),
            daily_limit_currency: Some("sat".into()),
            monthly_limit_amount: None,
            monthly_limit_currency: None,
        }
    }

    #[test]
    fn row_conversion() {
        let card = BoltCard::try_from(sample_row()).unwrap();
        assert_eq!(card.uid, None);
        assert_eq!(card.last_counter, 5);
        assert_eq!(card.daily_limit, Some(CurrencyAmount::bitcoin_sat(120_000.0)));
        assert_eq!(card.monthly_limit, None);
    }

    #[test]
    fn limit_needs_both_columns() {
        let mut row = sample_row();
        row.daily_limit_currency = None;
        let card = BoltCard::try_from(row).unwrap();
        assert_eq!(card.daily_limit, None);
    }

    #[test]
    fn tap_info_advances_counter_and_learns_uid() {
        let card = BoltCard::try_from(sample_row()).unwrap();
        let info = TapInfo {
            uid: crypto::testutil::test_uid(),
            counter: Counter::new(9),
        };

        let updated = card.with_tap_info(&info);
        assert_eq!(updated.last_counter, 9);
        assert_eq!(updated.uid, Some(crypto::testutil::test_uid()));

        // A stale tap never regresses the stored counter.
        let stale = updated.with_tap_info(&TapInfo {
            uid: crypto::testutil::test_uid(),
            counter: Counter::new(3),
        });
        assert_eq!(stale.last_counter, 9);
    }
}
