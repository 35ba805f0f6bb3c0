//! The withdrawal-authorization pipeline.
//!
//! One [`WithdrawalTap`] comes in per physical NFC interaction; the pipeline
//! matches it to a registered card, enforces the anti-replay counter, checks
//! card state, invoice validity and spending limits, waits for the channel
//! layer, and finally claims the withdrawal in the cross-process
//! [`claims::ClaimStore`]. Both the foreground app and the background
//! notification handler run this same pipeline; the claim step decides which
//! of them pays.

pub mod claims;
pub mod limits;
pub mod matcher;
pub mod notify;
pub mod readiness;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::currency::{CurrencyAmount, ExchangeRates};
use crate::db::models::BoltCard;
use crate::lightning::{Invoice, InvoiceGate, InvoiceRejection};
use claims::{ClaimStore, VersionedStore};
use limits::CardSpend;
use notify::{SettlementNotifier, SettlementReport};
use readiness::ReadinessGate;

/// Which OS process this pipeline instance runs in.
///
/// The foreground app and the background push-notification handler share
/// nothing in memory; this identity is recorded in claim records so the
/// settlement trail shows who paid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ProcessId {
    Foreground,
    Background,
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessId::Foreground => write!(f, "foreground"),
            ProcessId::Background => write!(f, "background"),
        }
    }
}

/// Everything extracted from one physical tap, plus the derived hash that
/// correlates this attempt across processes and with the settlement service.
#[derive(Debug, Clone)]
pub struct WithdrawalTap {
    pub node_id: String,
    pub payload: Vec<u8>,
    pub cmac: Vec<u8>,
    pub invoice: String,
    pub timestamp: DateTime<Utc>,
    withdraw_hash: String,
}

impl WithdrawalTap {
    pub fn new(
        node_id: String,
        payload: Vec<u8>,
        cmac: Vec<u8>,
        invoice: String,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let withdraw_hash = calculate_withdraw_hash(&node_id, &payload, &cmac, &invoice);
        Self { node_id, payload, cmac, invoice, timestamp, withdraw_hash }
    }

    pub fn withdraw_hash(&self) -> &str {
        &self.withdraw_hash
    }
}

/// SHA-256 over (lowercased node id, hex payload, hex cmac, invoice).
///
/// The settlement service computes the same hash on its side; changing any
/// part of this recipe breaks cross-system correlation.
fn calculate_withdraw_hash(node_id: &str, payload: &[u8], cmac: &[u8], invoice: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(node_id.to_lowercase().as_bytes());
    hasher.update(hex::encode(payload).as_bytes());
    hasher.update(hex::encode(cmac).as_bytes());
    hasher.update(invoice.as_bytes());
    hex::encode(hasher.finalize())
}

/// Terminal outcome of an authorized pipeline run.
#[derive(Debug)]
pub enum WithdrawDecision {
    /// This process owns the withdrawal and must dispatch the payment.
    ContinueAndSendPayment { card: BoltCard, invoice: Invoice, amount_msat: u64 },
    /// The other process already claimed this tap; do NOT pay.
    AbortHandledElsewhere { card: BoltCard },
}

/// Why a withdrawal was refused. All variants are rejections returned to the
/// caller, never crashes.
#[derive(Debug, Error)]
pub enum WithdrawError {
    #[error("unknown card")]
    UnknownCard,
    #[error("replay detected")]
    ReplayDetected { card: BoltCard },
    #[error("frozen card")]
    FrozenCard { card: BoltCard },
    #[error("daily limit exceeded")]
    DailyLimitExceeded { card: BoltCard, amount: CurrencyAmount },
    #[error("monthly limit exceeded")]
    MonthlyLimitExceeded { card: BoltCard, amount: CurrencyAmount },
    #[error("bad invoice: {details}")]
    BadInvoice { card: BoltCard, details: String },
    #[error("already paid invoice")]
    AlreadyPaidInvoice { card: BoltCard },
    #[error("payment pending")]
    PaymentPending { card: BoltCard },
    #[error("internal error: {details}")]
    InternalError { card: Option<BoltCard>, details: String },
}

impl WithdrawError {
    /// The matched card, when the failure happened after matching.
    pub fn card(&self) -> Option<&BoltCard> {
        match self {
            WithdrawError::UnknownCard => None,
            WithdrawError::ReplayDetected { card }
            | WithdrawError::FrozenCard { card }
            | WithdrawError::DailyLimitExceeded { card, .. }
            | WithdrawError::MonthlyLimitExceeded { card, .. }
            | WithdrawError::BadInvoice { card, .. }
            | WithdrawError::AlreadyPaidInvoice { card }
            | WithdrawError::PaymentPending { card } => Some(card),
            WithdrawError::InternalError { card, .. } => card.as_ref(),
        }
    }
}

/// The local card registry, as consumed by the pipeline.
#[async_trait]
pub trait CardRegistry: Send + Sync {
    /// Cards already loaded in memory; may be empty right after launch.
    async fn cards_snapshot(&self) -> Vec<BoltCard>;

    /// Direct read from persistent storage (cold-start fallback).
    async fn list_cards(&self) -> Result<Vec<BoltCard>>;

    async fn save_card(&self, card: &BoltCard) -> Result<()>;

    /// Prior settled spend for the trailing daily/monthly windows.
    async fn card_spend(&self, card_id: i64, now: DateTime<Utc>) -> Result<CardSpend>;
}

#[async_trait]
impl<R: CardRegistry> CardRegistry for Arc<R> {
    async fn cards_snapshot(&self) -> Vec<BoltCard> {
        (**self).cards_snapshot().await
    }

    async fn list_cards(&self) -> Result<Vec<BoltCard>> {
        (**self).list_cards().await
    }

    async fn save_card(&self, card: &BoltCard) -> Result<()> {
        (**self).save_card(card).await
    }

    async fn card_spend(&self, card_id: i64, now: DateTime<Utc>) -> Result<CardSpend> {
        (**self).card_spend(card_id, now).await
    }
}

/// Composes the full decision pipeline for one process.
pub struct WithdrawalPipeline<R, G, S> {
    process: ProcessId,
    registry: R,
    invoice_gate: G,
    claims: ClaimStore<S>,
    readiness: ReadinessGate,
    rates: ExchangeRates,
    notifier: Option<Arc<dyn SettlementNotifier>>,
}

impl<R, G, S> WithdrawalPipeline<R, G, S>
where
    R: CardRegistry,
    G: InvoiceGate,
    S: VersionedStore,
{
    pub fn new(
        process: ProcessId,
        registry: R,
        invoice_gate: G,
        claims: ClaimStore<S>,
        readiness: ReadinessGate,
        rates: ExchangeRates,
        notifier: Option<Arc<dyn SettlementNotifier>>,
    ) -> Self {
        Self { process, registry, invoice_gate, claims, readiness, rates, notifier }
    }

    /// Runs the full authorization pipeline for one tap and best-effort
    /// reports the outcome to the settlement service.
    ///
    /// On `Ok(ContinueAndSendPayment)` the caller must dispatch the payment;
    /// on `Ok(AbortHandledElsewhere)` it must NOT pay.
    pub async fn authorize(
        &self,
        tap: &WithdrawalTap,
    ) -> Result<WithdrawDecision, WithdrawError> {
        let result = self.evaluate(tap).await;

        // Best-effort outcome report. Failures are logged and swallowed;
        // the decision already made never changes here.
        if let Some(notifier) = &self.notifier {
            let report = SettlementReport {
                node_id: tap.node_id.clone(),
                withdraw_hash: tap.withdraw_hash.clone(),
                err_message: result.as_ref().err().map(|e| e.to_string()),
            };
            if let Err(err) = notifier.notify(&report).await {
                warn!("settlement notification failed: {err:#}");
            }
        }

        result
    }

    async fn evaluate(&self, tap: &WithdrawalTap) -> Result<WithdrawDecision, WithdrawError> {
        // Match the tap against every known card's keys.
        let matched = matcher::find_matching_card(&self.registry, &tap.payload, &tap.cmac)
            .await
            .map_err(|err| {
                error!("card registry unavailable: {err:#}");
                WithdrawError::InternalError {
                    card: None,
                    details: "card registry unavailable".into(),
                }
            })?;

        let Some((card, info)) = matched else {
            return Err(WithdrawError::UnknownCard);
        };

        // Anti-replay check. This must precede everything else: it is the
        // sole defense against an attacker replaying an intercepted tap.
        if info.counter.value() <= card.last_counter {
            debug!(
                card_id = card.card_id,
                tap_counter = info.counter.value(),
                last_counter = card.last_counter,
                "replay detected"
            );
            return Err(WithdrawError::ReplayDetected { card });
        }

        let result = self.decide(tap, &card).await;

        // Counter finalizer: whatever the decision, the stored counter must
        // advance to the observed value so the tap can never be replayed.
        // The one exception is a claim lost to the other process — that
        // process performs the update itself.
        let claimed_elsewhere =
            matches!(&result, Ok(WithdrawDecision::AbortHandledElsewhere { .. }));
        if !claimed_elsewhere {
            let updated = card.with_tap_info(&info);
            if let Err(err) = self.registry.save_card(&updated).await {
                error!(card_id = card.card_id, "failed to persist tap counter: {err:#}");
            }
        }

        result
    }

    async fn decide(
        &self,
        tap: &WithdrawalTap,
        card: &BoltCard,
    ) -> Result<WithdrawDecision, WithdrawError> {
        if !card.is_active {
            debug!(card_id = card.card_id, "card is frozen");
            return Err(WithdrawError::FrozenCard { card: card.clone() });
        }

        // Structural invoice checks happen here; everything semantic is the
        // payment engine's call.
        let invoice = Invoice::from_str(&tap.invoice).map_err(|_| WithdrawError::BadInvoice {
            card: card.clone(),
            details: "not a bolt11 invoice".into(),
        })?;
        let amount_msat = invoice.amount_msat().ok_or_else(|| WithdrawError::BadInvoice {
            card: card.clone(),
            details: "amountless invoice".into(),
        })?;

        match self.invoice_gate.check_invoice(&invoice).await {
            Ok(None) => {}
            Ok(Some(rejection)) => return Err(rejection_error(card, rejection)),
            Err(err) => {
                error!("invoice validation failed: {err:#}");
                return Err(WithdrawError::InternalError {
                    card: Some(card.clone()),
                    details: "invoice validation failed".into(),
                });
            }
        }

        if card.daily_limit.is_some() || card.monthly_limit.is_some() {
            let spend = self
                .registry
                .card_spend(card.card_id, Utc::now())
                .await
                .map_err(|err| {
                    error!("failed to fetch card payments: {err:#}");
                    WithdrawError::InternalError {
                        card: Some(card.clone()),
                        details: "checking spending limits".into(),
                    }
                })?;
            limits::check_spending_limits(card, &spend, amount_msat, &self.rates)?;
        }

        // Only one process at a time can hold the peer connection, so the
        // readiness wait must come before the claim: claiming first could
        // park the claim on a process that never becomes able to pay.
        self.readiness.wait_until_ready().await.map_err(|err| {
            error!("readiness gate failed: {err:#}");
            WithdrawError::InternalError {
                card: Some(card.clone()),
                details: "channel engine unavailable".into(),
            }
        })?;

        // Exactly-once: whichever process's conditional write lands first
        // owns the payment; the loser aborts cleanly.
        let claimed = self
            .claims
            .try_claim(&tap.withdraw_hash, self.process)
            .await
            .map_err(|err| {
                error!("claim store failure: {err:#}");
                WithdrawError::InternalError {
                    card: Some(card.clone()),
                    details: "claim store failure".into(),
                }
            })?;

        if claimed {
            debug!(card_id = card.card_id, process = %self.process, "withdrawal claimed");
            Ok(WithdrawDecision::ContinueAndSendPayment { card: card.clone(), invoice, amount_msat })
        } else {
            debug!(card_id = card.card_id, "withdrawal already handled elsewhere");
            Ok(WithdrawDecision::AbortHandledElsewhere { card: card.clone() })
        }
    }
}

fn rejection_error(card: &BoltCard, rejection: InvoiceRejection) -> WithdrawError {
    match rejection {
        InvoiceRejection::AlreadyPaid => WithdrawError::AlreadyPaidInvoice { card: card.clone() },
        InvoiceRejection::PaymentPending => WithdrawError::PaymentPending { card: card.clone() },
        InvoiceRejection::Expired => {
            WithdrawError::BadInvoice { card: card.clone(), details: "expired".into() }
        }
        InvoiceRejection::ChainMismatch => {
            WithdrawError::BadInvoice { card: card.clone(), details: "chain mismatch".into() }
        }
        InvoiceRejection::Other(details) => {
            WithdrawError::InternalError { card: Some(card.clone()), details }
        }
    }
}
