//! Cross-process claim ledger for withdrawal requests.
//!
//! Both the foreground app and the background notification handler may
//! receive the same physical tap. Before paying, each runs [`ClaimStore::try_claim`];
//! the store's conditional-write primitive guarantees exactly one of them
//! becomes the owner. No lock is held across the read/modify/write — a lost
//! race is detected by the stale version token and simply retried.

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::ProcessId;

/// The single shared key all claim records live under.
pub const CLAIM_STORE_KEY: &str = "withdraw_claims";

/// Claims older than this are pruned on write. Replay protection does not
/// depend on this window; the card counter covers taps forever.
const CLAIM_RETENTION_DAYS: i64 = 7;

/// Contention between two processes racing on one tap resolves in a single
/// retry, so this bound exists only to turn a store outage into an error
/// instead of a tight loop.
const MAX_CAS_ATTEMPTS: u32 = 64;

/// A versioned key/value store shared between processes.
///
/// `set_if_unchanged` must reject the write when the key's version token
/// changed since the caller's `get` (compare-and-swap). A `token` of `None`
/// means the caller expects the key to be absent.
#[async_trait]
pub trait VersionedStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<(Vec<u8>, i64)>>;

    /// Returns the new version token on success, `None` on version mismatch.
    async fn set_if_unchanged(
        &self,
        key: &str,
        value: &[u8],
        token: Option<i64>,
    ) -> Result<Option<i64>>;
}

#[async_trait]
impl<S: VersionedStore> VersionedStore for std::sync::Arc<S> {
    async fn get(&self, key: &str) -> Result<Option<(Vec<u8>, i64)>> {
        (**self).get(key).await
    }

    async fn set_if_unchanged(
        &self,
        key: &str,
        value: &[u8],
        token: Option<i64>,
    ) -> Result<Option<i64>> {
        (**self).set_if_unchanged(key, value, token).await
    }
}

/// One processed withdrawal request, as serialized into the shared store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimRecord {
    #[serde(rename = "withdrawHash")]
    pub withdraw_hash: String,
    pub process: ProcessId,
    #[serde(rename = "date")]
    pub claimed_at: DateTime<Utc>,
}

pub struct ClaimStore<S> {
    store: S,
}

impl<S: VersionedStore> ClaimStore<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Atomically claims `withdraw_hash` for `process`.
    ///
    /// Returns `true` if this call took ownership, `false` if the hash was
    /// already claimed (by this or another process). Errors only on store
    /// failures or exhausted contention retries.
    pub async fn try_claim(&self, withdraw_hash: &str, process: ProcessId) -> Result<bool> {
        for attempt in 1..=MAX_CAS_ATTEMPTS {
            let existing = self.store.get(CLAIM_STORE_KEY).await?;

            let (mut records, token) = match existing {
                Some((bytes, token)) => {
                    let records: Vec<ClaimRecord> = serde_json::from_slice(&bytes)
                        .context("corrupt claim store contents")?;
                    (records, Some(token))
                }
                None => (Vec::new(), None),
            };

            // The already-claimed check must come before pruning: a claim
            // inside the retention window always keeps its decision.
            if records.iter().any(|r| r.withdraw_hash == withdraw_hash) {
                debug!(withdraw_hash, "withdrawal already claimed");
                return Ok(false);
            }

            let cutoff = Utc::now() - Duration::days(CLAIM_RETENTION_DAYS);
            records.retain(|r| r.claimed_at >= cutoff);

            records.push(ClaimRecord {
                withdraw_hash: withdraw_hash.to_string(),
                process,
                claimed_at: Utc::now(),
            });

            let bytes = serde_json::to_vec(&records)?;
            if let Some(_new_token) =
                self.store.set_if_unchanged(CLAIM_STORE_KEY, &bytes, token).await?
            {
                return Ok(true);
            }

            // Another writer won the race; re-read and re-evaluate. If it
            // claimed this very hash, the next iteration exits via the
            // already-claimed check.
            debug!(attempt, withdraw_hash, "claim write lost the race, retrying");
        }

        bail!("claim store write not resolved after {MAX_CAS_ATTEMPTS} attempts");
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;

    /// In-memory [`VersionedStore`] with real compare-and-swap semantics.
    #[derive(Default)]
    pub struct MemStore {
        inner: Mutex<HashMap<String, (Vec<u8>, i64)>>,
    }

    #[async_trait]
    impl VersionedStore for MemStore {
        async fn get(&self, key: &str) -> Result<Option<(Vec<u8>, i64)>> {
            Ok(self.inner.lock().unwrap().get(key).cloned())
        }

        async fn set_if_unchanged(
            &self,
            key: &str,
            value: &[u8],
            token: Option<i64>,
        ) -> Result<Option<i64>> {
            let mut inner = self.inner.lock().unwrap();
            let current = inner.get(key).map(|(_, t)| *t);
            if current != token {
                return Ok(None);
            }
            let new_token = current.map_or(1, |t| t + 1);
            inner.insert(key.to_string(), (value.to_vec(), new_token));
            Ok(Some(new_token))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::testutil::MemStore;
    use super::*;

    #[tokio::test]
    async fn first_claim_wins_second_loses() {
        let claims = ClaimStore::new(MemStore::default());

        assert!(claims.try_claim("hash-a", ProcessId::Foreground).await.unwrap());
        assert!(!claims.try_claim("hash-a", ProcessId::Background).await.unwrap());
        // Same process asking again also loses: the claim is per-hash.
        assert!(!claims.try_claim("hash-a", ProcessId::Foreground).await.unwrap());
        // An unrelated hash is unaffected.
        assert!(claims.try_claim("hash-b", ProcessId::Background).await.unwrap());
    }

    #[tokio::test]
    async fn concurrent_claims_yield_exactly_one_owner() {
        let store = Arc::new(MemStore::default());
        let a = ClaimStore::new(store.clone());
        let b = ClaimStore::new(store);

        let (ra, rb) = tokio::join!(
            a.try_claim("hash-a", ProcessId::Foreground),
            b.try_claim("hash-a", ProcessId::Background),
        );
        let (ra, rb) = (ra.unwrap(), rb.unwrap());
        assert!(ra ^ rb, "exactly one process must own the claim");
    }

    /// A store whose first conditional write is beaten by a rival writer,
    /// forcing the claimant through the retry path.
    struct ContendedStore {
        inner: Arc<MemStore>,
        rival_hash: String,
        rival_fired: AtomicBool,
    }

    #[async_trait]
    impl VersionedStore for ContendedStore {
        async fn get(&self, key: &str) -> Result<Option<(Vec<u8>, i64)>> {
            self.inner.get(key).await
        }

        async fn set_if_unchanged(
            &self,
            key: &str,
            value: &[u8],
            token: Option<i64>,
        ) -> Result<Option<i64>> {
            if !self.rival_fired.swap(true, Ordering::SeqCst) {
                let rival = ClaimStore::new(self.inner.clone());
                assert!(rival.try_claim(&self.rival_hash, ProcessId::Background).await?);
            }
            self.inner.set_if_unchanged(key, value, token).await
        }
    }

    #[tokio::test]
    async fn lost_race_against_other_hash_retries_and_wins() {
        let claims = ClaimStore::new(ContendedStore {
            inner: Arc::new(MemStore::default()),
            rival_hash: "hash-other".into(),
            rival_fired: AtomicBool::new(false),
        });

        // The rival claims a *different* hash mid-write; our claim must
        // retry once and then succeed.
        assert!(claims.try_claim("hash-a", ProcessId::Foreground).await.unwrap());
    }

    #[tokio::test]
    async fn lost_race_against_same_hash_retries_and_aborts() {
        let claims = ClaimStore::new(ContendedStore {
            inner: Arc::new(MemStore::default()),
            rival_hash: "hash-a".into(),
            rival_fired: AtomicBool::new(false),
        });

        // The rival claims the *same* hash mid-write; the retry observes it
        // and reports the claim as already taken.
        assert!(!claims.try_claim("hash-a", ProcessId::Foreground).await.unwrap());
    }

    #[tokio::test]
    async fn old_claims_are_pruned_on_write() {
        let store = MemStore::default();

        let stale = vec![ClaimRecord {
            withdraw_hash: "hash-old".into(),
            process: ProcessId::Foreground,
            claimed_at: Utc::now() - Duration::days(8),
        }];
        store
            .set_if_unchanged(CLAIM_STORE_KEY, &serde_json::to_vec(&stale).unwrap(), None)
            .await
            .unwrap()
            .unwrap();

        let claims = ClaimStore::new(store);
        assert!(claims.try_claim("hash-new", ProcessId::Background).await.unwrap());

        let (bytes, _) = claims.store.get(CLAIM_STORE_KEY).await.unwrap().unwrap();
        let records: Vec<ClaimRecord> = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].withdraw_hash, "hash-new");
    }

    #[tokio::test]
    async fn claims_inside_retention_keep_their_decision() {
        let store = MemStore::default();

        let recent = vec![ClaimRecord {
            withdraw_hash: "hash-a".into(),
            process: ProcessId::Foreground,
            claimed_at: Utc::now() - Duration::days(6),
        }];
        store
            .set_if_unchanged(CLAIM_STORE_KEY, &serde_json::to_vec(&recent).unwrap(), None)
            .await
            .unwrap()
            .unwrap();

        let claims = ClaimStore::new(store);
        assert!(!claims.try_claim("hash-a", ProcessId::Background).await.unwrap());
    }

    /// A store where every conditional write reports a lost race.
    struct AlwaysStale(MemStore);

    #[async_trait]
    impl VersionedStore for AlwaysStale {
        async fn get(&self, key: &str) -> Result<Option<(Vec<u8>, i64)>> {
            self.0.get(key).await
        }

        async fn set_if_unchanged(&self, _: &str, _: &[u8], _: Option<i64>) -> Result<Option<i64>> {
            Ok(None)
        }
    }

    #[tokio::test]
    async fn exhausted_retries_become_an_error() {
        let claims = ClaimStore::new(AlwaysStale(MemStore::default()));
        assert!(claims.try_claim("hash-a", ProcessId::Foreground).await.is_err());
    }

    #[test]
    fn claim_record_wire_format() {
        let record = ClaimRecord {
            withdraw_hash: "abc".into(),
            process: ProcessId::Background,
            claimed_at: "2026-08-06T12:00:00Z".parse().unwrap(),
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["withdrawHash"], "abc");
        assert_eq!(json["process"], "background");
        assert!(json["date"].as_str().unwrap().starts_with("2026-08-06T12:00:00"));
    }
}
