use anyhow::{Result, anyhow};
use clap::{Parser, Subcommand};

use crate::currency::{CurrencyAmount, ExchangeRate, ExchangeRates, FiatCode};
use crate::withdraw::ProcessId;

#[derive(Parser, Debug, Clone)]
#[command(name = "boltcard-withdraw")]
#[command(about = "Bolt card withdrawal authorization pipeline")]
#[command(version)]
pub struct Config {
    /// SQLite database URL shared by both processes
    #[arg(long, env = "DATABASE_URL", default_value = "sqlite://boltcard.db")]
    pub database_url: String,

    /// This wallet's node id, used in the withdraw hash and outcome reports
    #[arg(long, env = "NODE_ID", default_value = "")]
    pub node_id: String,

    /// Which process identity to claim withdrawals under
    #[arg(long, env = "PROCESS_ID", value_enum, default_value_t = ProcessId::Foreground)]
    pub process: ProcessId,

    /// Settlement endpoint for best-effort outcome reports
    #[arg(long, env = "SETTLEMENT_URL")]
    pub settlement_url: Option<String>,

    /// Exchange rate as "FIAT=PRICE" (BTC price), repeatable
    #[arg(long = "rate", value_name = "FIAT=PRICE")]
    pub rates: Vec<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Provision a new card with freshly generated keys
    CreateCard {
        #[arg(long)]
        name: String,
        /// e.g. "120000 sat" or "250 EUR"
        #[arg(long)]
        daily_limit: Option<CurrencyAmount>,
        #[arg(long)]
        monthly_limit: Option<CurrencyAmount>,
    },
    /// List registered cards
    ListCards,
    /// Freeze or unfreeze a card
    SetActive {
        #[arg(long)]
        card_id: i64,
        #[arg(long)]
        active: bool,
    },
    /// Record a settled payment against a card's spending windows
    RecordPayment {
        #[arg(long)]
        card_id: i64,
        #[arg(long)]
        amount_msat: i64,
    },
    /// Run the authorization pipeline for one tap
    Withdraw {
        /// Encrypted PICC payload, hex
        #[arg(long)]
        p: String,
        /// Tap CMAC, hex
        #[arg(long)]
        c: String,
        /// BOLT 11 invoice to pay
        #[arg(long)]
        invoice: String,
    },
}

impl Config {
    pub fn exchange_rates(&self) -> Result<ExchangeRates> {
        let rates = self
            .rates
            .iter()
            .map(|entry| {
                let (fiat, price) = entry
                    .split_once('=')
                    .ok_or_else(|| anyhow!("expected FIAT=PRICE, got {entry:?}"))?;
                Ok(ExchangeRate { fiat: FiatCode::new(fiat.trim()), price: price.trim().parse()? })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(ExchangeRates::new(rates))
    }
}
