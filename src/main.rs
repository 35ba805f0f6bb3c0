use std::sync::Arc;

use chrono::Utc;
use clap::Parser;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use boltcard_withdraw::config::{Command, Config};
use boltcard_withdraw::db::{self, repository::{SqliteCardRegistry, SqliteKvStore}};
use boltcard_withdraw::lightning::BasicInvoiceGate;
use boltcard_withdraw::withdraw::claims::ClaimStore;
use boltcard_withdraw::withdraw::notify::{HttpSettlementNotifier, SettlementNotifier};
use boltcard_withdraw::withdraw::readiness::{ChannelState, PeerConnection, ReadinessGate};
use boltcard_withdraw::withdraw::{WithdrawDecision, WithdrawalPipeline, WithdrawalTap};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "boltcard_withdraw=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Parse configuration
    let config = Config::parse();

    // Initialize database
    let pool = db::init_pool(&config.database_url).await?;
    let registry = SqliteCardRegistry::new(pool.clone());

    match config.command.clone() {
        Command::CreateCard { name, daily_limit, monthly_limit } => {
            let card = registry.create_card(&name, daily_limit, monthly_limit).await?;
            println!("card_id: {}", card.card_id);
            // Printed once for NFC programming; the keys never leave the
            // database again.
            println!("k1_decrypt_key: {}", card.keys.decrypt_key);
            println!("k2_cmac_key: {}", card.keys.cmac_key);
        }

        Command::ListCards => {
            use boltcard_withdraw::withdraw::CardRegistry;
            for card in registry.list_cards().await? {
                println!(
                    "[{}] {} counter={} active={} daily={} monthly={}",
                    card.card_id,
                    card.card_name,
                    card.last_counter,
                    card.is_active,
                    card.daily_limit.map_or("none".into(), |l| l.to_string()),
                    card.monthly_limit.map_or("none".into(), |l| l.to_string()),
                );
            }
        }

        Command::SetActive { card_id, active } => {
            use boltcard_withdraw::withdraw::CardRegistry;
            let mut card = registry
                .get_card(card_id)
                .await?
                .ok_or_else(|| anyhow::anyhow!("no card with id {card_id}"))?;
            card.is_active = active;
            registry.save_card(&card).await?;
            println!("card {card_id} active={active}");
        }

        Command::RecordPayment { card_id, amount_msat } => {
            registry.record_payment(card_id, amount_msat, Utc::now()).await?;
            println!("recorded {amount_msat} msat against card {card_id}");
        }

        Command::Withdraw { p, c, invoice } => {
            let payload = hex::decode(&p)?;
            let cmac = hex::decode(&c)?;

            // The driver runs without a channel engine attached, so the
            // readiness streams are pinned to an already-ready state.
            let (_conn_tx, conn_rx) = watch::channel(PeerConnection::Established);
            let (_chan_tx, chan_rx) = watch::channel(Vec::<ChannelState>::new());

            let notifier = match &config.settlement_url {
                Some(url) => {
                    Some(Arc::new(HttpSettlementNotifier::new(url)?) as Arc<dyn SettlementNotifier>)
                }
                None => None,
            };

            let pipeline = WithdrawalPipeline::new(
                config.process,
                registry,
                BasicInvoiceGate::new(lightning_invoice::Currency::Bitcoin),
                ClaimStore::new(SqliteKvStore::new(pool.clone())),
                ReadinessGate::new(conn_rx, chan_rx),
                config.exchange_rates()?,
                notifier,
            );

            let tap =
                WithdrawalTap::new(config.node_id.clone(), payload, cmac, invoice, Utc::now());
            tracing::info!(withdraw_hash = tap.withdraw_hash(), "processing tap");

            match pipeline.authorize(&tap).await {
                Ok(WithdrawDecision::ContinueAndSendPayment { card, amount_msat, .. }) => {
                    println!(
                        "AUTHORIZED: pay {amount_msat} msat with card {} ({})",
                        card.card_id, card.card_name
                    );
                }
                Ok(WithdrawDecision::AbortHandledElsewhere { card }) => {
                    println!(
                        "ABORT: card {} tap already handled by the other process",
                        card.card_id
                    );
                }
                Err(err) => {
                    println!("REJECTED: {err}");
                }
            }
        }
    }

    Ok(())
}
