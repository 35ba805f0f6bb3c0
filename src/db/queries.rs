use anyhow::Result;
use chrono::Utc;
use sqlx::{Pool, Sqlite};

use crate::db::models::{BoltCard, CardPayment, CardRow};

const CARD_COLUMNS: &str = "card_id, card_name, uid, k1_decrypt_key, k2_cmac_key, \
     last_counter, is_active, is_archived, \
     daily_limit_amount, daily_limit_currency, monthly_limit_amount, monthly_limit_currency";

/// All non-archived cards, in registry (insertion) order.
pub async fn list_cards(pool: &Pool<Sqlite>) -> Result<Vec<BoltCard>> {
    let rows = sqlx::query_as::<_, CardRow>(&format!(
        "SELECT {CARD_COLUMNS} FROM cards WHERE is_archived = 0 ORDER BY card_id"
    ))
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(BoltCard::try_from).collect()
}

pub async fn get_card(pool: &Pool<Sqlite>, card_id: i64) -> Result<Option<BoltCard>> {
    let row = sqlx::query_as::<_, CardRow>(&format!(
        "SELECT {CARD_COLUMNS} FROM cards WHERE card_id = ?"
    ))
    .bind(card_id)
    .fetch_optional(pool)
    .await?;

    row.map(BoltCard::try_from).transpose()
}

pub async fn insert_card(pool: &Pool<Sqlite>, card: &BoltCard) -> Result<i64> {
    let result = sqlx::query(
        "INSERT INTO cards (card_name, uid, k1_decrypt_key, k2_cmac_key,
         last_counter, is_active, is_archived,
         daily_limit_amount, daily_limit_currency,
         monthly_limit_amount, monthly_limit_currency)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&card.card_name)
    .bind(card.uid.as_ref().map(|u| u.to_string()).unwrap_or_default())
    .bind(card.keys.decrypt_key.to_string())
    .bind(card.keys.cmac_key.to_string())
    .bind(card.last_counter as i64)
    .bind(card.is_active)
    .bind(card.is_archived)
    .bind(card.daily_limit.as_ref().map(|l| l.amount))
    .bind(card.daily_limit.as_ref().map(|l| l.currency.code().to_string()))
    .bind(card.monthly_limit.as_ref().map(|l| l.amount))
    .bind(card.monthly_limit.as_ref().map(|l| l.currency.code().to_string()))
    .execute(pool)
    .await?;

    Ok(result.last_insert_rowid())
}

/// Writes back a card's mutable fields.
///
/// The counter column only ever moves forward: concurrent writers each
/// advance it based on a greater observed counter, so `MAX` makes the races
/// degrade to redundant writes.
pub async fn save_card(pool: &Pool<Sqlite>, card: &BoltCard) -> Result<()> {
    sqlx::query(
        "UPDATE cards SET
         card_name = ?, uid = ?, last_counter = MAX(last_counter, ?),
         is_active = ?, is_archived = ?,
         daily_limit_amount = ?, daily_limit_currency = ?,
         monthly_limit_amount = ?, monthly_limit_currency = ?
         WHERE card_id = ?",
    )
    .bind(&card.card_name)
    .bind(card.uid.as_ref().map(|u| u.to_string()).unwrap_or_default())
    .bind(card.last_counter as i64)
    .bind(card.is_active)
    .bind(card.is_archived)
    .bind(card.daily_limit.as_ref().map(|l| l.amount))
    .bind(card.daily_limit.as_ref().map(|l| l.currency.code().to_string()))
    .bind(card.monthly_limit.as_ref().map(|l| l.amount))
    .bind(card.monthly_limit.as_ref().map(|l| l.currency.code().to_string()))
    .bind(card.card_id)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn record_payment(
    pool: &Pool<Sqlite>,
    card_id: i64,
    amount_msat: i64,
    settled_at: i64,
) -> Result<i64> {
    let result = sqlx::query(
        "INSERT INTO card_payments (card_id, amount_msat, settled_at) VALUES (?, ?, ?)",
    )
    .bind(card_id)
    .bind(amount_msat)
    .bind(settled_at)
    .execute(pool)
    .await?;

    Ok(result.last_insert_rowid())
}

/// Settled payments for one card since `min_settled_at` (epoch millis).
pub async fn list_card_payments_since(
    pool: &Pool<Sqlite>,
    card_id: i64,
    min_settled_at: i64,
) -> Result<Vec<CardPayment>> {
    let payments = sqlx::query_as::<_, CardPayment>(
        "SELECT payment_id, card_id, amount_msat, settled_at FROM card_payments
         WHERE card_id = ? AND settled_at >= ? ORDER BY settled_at",
    )
    .bind(card_id)
    .bind(min_settled_at)
    .fetch_all(pool)
    .await?;

    Ok(payments)
}

/// Reads a value and its version token from the shared key/value store.
pub async fn kv_get(pool: &Pool<Sqlite>, key: &str) -> Result<Option<(Vec<u8>, i64)>> {
    let row: Option<(Vec<u8>, i64)> =
        sqlx::query_as("SELECT value, updated_at FROM key_value_store WHERE key = ?")
            .bind(key)
            .fetch_optional(pool)
            .await?;

    Ok(row)
}

/// Conditional write: succeeds only if the row's version token still equals
/// `last_updated` (or the row is still absent when `last_updated` is None).
///
/// Returns the new token on success, or `None` when another writer got there
/// first. The new token is strictly greater than the old one even if two
/// writes land within the same millisecond.
pub async fn kv_set_if_unchanged(
    pool: &Pool<Sqlite>,
    key: &str,
    value: &[u8],
    last_updated: Option<i64>,
) -> Result<Option<i64>> {
    let now = Utc::now().timestamp_millis();

    let new_token: Option<i64> = match last_updated {
        None => {
            sqlx::query_scalar(
                "INSERT INTO key_value_store (key, value, updated_at) VALUES (?, ?, ?)
                 ON CONFLICT(key) DO NOTHING
                 RETURNING updated_at",
            )
            .bind(key)
            .bind(value)
            .bind(now)
            .fetch_optional(pool)
            .await?
        }
        Some(token) => {
            sqlx::query_scalar(
                "UPDATE key_value_store SET value = ?, updated_at = MAX(?, updated_at + 1)
                 WHERE key = ? AND updated_at = ?
                 RETURNING updated_at",
            )
            .bind(value)
            .bind(now)
            .bind(key)
            .bind(token)
            .fetch_optional(pool)
            .await?
        }
    };

    Ok(new_token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeySet;
    use crate::currency::CurrencyAmount;
    use crate::db::test_pool;

    fn new_card(name: &str) -> BoltCard {
        BoltCard {
            card_id: 0,
            card_name: name.into(),
            uid: None,
            keys: KeySet::generate(),
            last_counter: 0,
            is_active: true,
            is_archived: false,
            daily_limit: Some(CurrencyAmount::bitcoin_sat(100_000.0)),
            monthly_limit: None,
        }
    }

    #[tokio::test]
    async fn card_roundtrip() {
        let pool = test_pool().await;

        let mut card = new_card("lunch");
        card.card_id = insert_card(&pool, &card).await.unwrap();

        let loaded = get_card(&pool, card.card_id).await.unwrap().unwrap();
        assert_eq!(loaded, card);

        let listed = list_cards(&pool).await.unwrap();
        assert_eq!(listed.len(), 1);
    }

    #[tokio::test]
    async fn archived_cards_are_not_listed() {
        let pool = test_pool().await;

        let mut card = new_card("retired");
        card.is_archived = true;
        insert_card(&pool, &card).await.unwrap();

        assert!(list_cards(&pool).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn counter_never_regresses() {
        let pool = test_pool().await;

        let mut card = new_card("lunch");
        card.card_id = insert_card(&pool, &card).await.unwrap();

        card.last_counter = 9;
        save_card(&pool, &card).await.unwrap();

        // A stale writer with a lower counter loses quietly.
        card.last_counter = 4;
        save_card(&pool, &card).await.unwrap();

        let loaded = get_card(&pool, card.card_id).await.unwrap().unwrap();
        assert_eq!(loaded.last_counter, 9);
    }

    #[tokio::test]
    async fn payments_window_query() {
        let pool = test_pool().await;

        let mut card = new_card("lunch");
        card.card_id = insert_card(&pool, &card).await.unwrap();

        record_payment(&pool, card.card_id, 1_000, 100).await.unwrap();
        record_payment(&pool, card.card_id, 2_000, 200).await.unwrap();
        record_payment(&pool, card.card_id, 4_000, 300).await.unwrap();

        let recent = list_card_payments_since(&pool, card.card_id, 200).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent.iter().map(|p| p.amount_msat).sum::<i64>(), 6_000);
    }

    #[tokio::test]
    async fn kv_conditional_write() {
        let pool = test_pool().await;

        assert_eq!(kv_get(&pool, "k").await.unwrap(), None);

        // First insert expects absence.
        let t1 = kv_set_if_unchanged(&pool, "k", b"one", None).await.unwrap().unwrap();
        // A second blind insert loses.
        assert_eq!(kv_set_if_unchanged(&pool, "k", b"two", None).await.unwrap(), None);

        let (value, token) = kv_get(&pool, "k").await.unwrap().unwrap();
        assert_eq!(value, b"one");
        assert_eq!(token, t1);

        // Conditional update with the current token wins and bumps the token.
        let t2 = kv_set_if_unchanged(&pool, "k", b"three", Some(t1)).await.unwrap().unwrap();
        assert!(t2 > t1);

        // A writer holding the stale token loses.
        assert_eq!(kv_set_if_unchanged(&pool, "k", b"four", Some(t1)).await.unwrap(), None);

        let (value, _) = kv_get(&pool, "k").await.unwrap().unwrap();
        assert_eq!(value, b"three");
    }
}
