//! Sqlite-backed implementations of the pipeline's collaborator traits.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::{Pool, Sqlite};
use tokio::sync::RwLock;

use crate::crypto::KeySet;
use crate::currency::CurrencyAmount;
use crate::db::models::BoltCard;
use crate::db::queries;
use crate::withdraw::CardRegistry;
use crate::withdraw::claims::VersionedStore;
use crate::withdraw::limits::CardSpend;

/// Card registry over the local sqlite database.
///
/// Keeps an in-memory snapshot of the card list, refreshed on every storage
/// read or write. A freshly constructed registry has an empty snapshot; the
/// matcher's cold-start fallback covers that window.
pub struct SqliteCardRegistry {
    pool: Pool<Sqlite>,
    cache: RwLock<Vec<BoltCard>>,
}

impl SqliteCardRegistry {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool, cache: RwLock::new(Vec::new()) }
    }

    /// Provisions a new card with freshly generated key material.
    pub async fn create_card(
        &self,
        card_name: &str,
        daily_limit: Option<CurrencyAmount>,
        monthly_limit: Option<CurrencyAmount>,
    ) -> Result<BoltCard> {
        let mut card = BoltCard {
            card_id: 0,
            card_name: card_name.to_string(),
            uid: None,
            keys: KeySet::generate(),
            last_counter: 0,
            is_active: true,
            is_archived: false,
            daily_limit,
            monthly_limit,
        };
        card.card_id = queries::insert_card(&self.pool, &card).await?;
        self.refresh().await?;
        Ok(card)
    }

    /// Records a settled card payment for the spending windows.
    pub async fn record_payment(
        &self,
        card_id: i64,
        amount_msat: i64,
        settled_at: DateTime<Utc>,
    ) -> Result<()> {
        queries::record_payment(&self.pool, card_id, amount_msat, settled_at.timestamp_millis())
            .await?;
        Ok(())
    }

    pub async fn get_card(&self, card_id: i64) -> Result<Option<BoltCard>> {
        queries::get_card(&self.pool, card_id).await
    }

    async fn refresh(&self) -> Result<Vec<BoltCard>> {
        let cards = queries::list_cards(&self.pool).await?;
        *self.cache.write().await = cards.clone();
        Ok(cards)
    }
}

#[async_trait]
impl CardRegistry for SqliteCardRegistry {
    async fn cards_snapshot(&self) -> Vec<BoltCard> {
        self.cache.read().await.clone()
    }

    async fn list_cards(&self) -> Result<Vec<BoltCard>> {
        self.refresh().await
    }

    async fn save_card(&self, card: &BoltCard) -> Result<()> {
        queries::save_card(&self.pool, card).await?;
        self.refresh().await?;
        Ok(())
    }

    async fn card_spend(&self, card_id: i64, now: DateTime<Utc>) -> Result<CardSpend> {
        let monthly_cutoff = now - Duration::days(30);
        let daily_cutoff = now - Duration::hours(24);

        let payments = queries::list_card_payments_since(
            &self.pool,
            card_id,
            monthly_cutoff.timestamp_millis(),
        )
        .await?;

        let mut spend = CardSpend::default();
        for payment in payments {
            let amount = payment.amount_msat.max(0) as u64;
            spend.monthly_msat += amount;
            if payment.settled_at >= daily_cutoff.timestamp_millis() {
                spend.daily_msat += amount;
            }
        }
        Ok(spend)
    }
}

/// The shared versioned key/value store both processes coordinate through.
pub struct SqliteKvStore {
    pool: Pool<Sqlite>,
}

impl SqliteKvStore {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl VersionedStore for SqliteKvStore {
    async fn get(&self, key: &str) -> Result<Option<(Vec<u8>, i64)>> {
        queries::kv_get(&self.pool, key).await
    }

    async fn set_if_unchanged(
        &self,
        key: &str,
        value: &[u8],
        token: Option<i64>,
    ) -> Result<Option<i64>> {
        queries::kv_set_if_unchanged(&self.pool, key, value, token).await
    }
}
