//! Wallet-side authorization pipeline for bolt card (NFC) Lightning
//! withdrawals.
//!
//! A physical tap may be delivered to two independent OS processes at once —
//! the foreground app and a background push-notification handler. Each runs
//! the pipeline in [`withdraw`]; a shared optimistic-concurrency claim store
//! guarantees the payment is dispatched at most once, whichever process gets
//! there first.

pub mod config;
pub mod crypto;
pub mod currency;
pub mod db;
pub mod lightning;
pub mod withdraw;

pub use withdraw::{
    ProcessId, WithdrawDecision, WithdrawError, WithdrawalPipeline, WithdrawalTap,
};
