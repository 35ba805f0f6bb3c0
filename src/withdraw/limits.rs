//! Daily/monthly spending-limit checks against a card's payment history.

use tracing::debug;

use super::WithdrawError;
use crate::currency::{Currency, CurrencyAmount, ExchangeRates, msat_to_fiat, msat_to_sat, sat_to_msat};
use crate::db::models::BoltCard;

/// Prior settled spend for one card over the trailing windows, in msat.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CardSpend {
    pub daily_msat: u64,
    pub monthly_msat: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Window {
    Daily,
    Monthly,
}

/// Checks the candidate payment against whichever limits the card defines.
///
/// Spend exactly equal to a limit is allowed; only strictly exceeding it is
/// rejected. The returned error carries the invoice amount converted to the
/// limit's currency, for user-facing display.
pub fn check_spending_limits(
    card: &BoltCard,
    spend: &CardSpend,
    invoice_msat: u64,
    rates: &ExchangeRates,
) -> Result<(), WithdrawError> {
    if let Some(limit) = &card.daily_limit {
        check_limit(card, limit, spend.daily_msat, invoice_msat, rates, Window::Daily)?;
    }
    if let Some(limit) = &card.monthly_limit {
        check_limit(card, limit, spend.monthly_msat, invoice_msat, rates, Window::Monthly)?;
    }
    Ok(())
}

fn check_limit(
    card: &BoltCard,
    limit: &CurrencyAmount,
    prior_msat: u64,
    invoice_msat: u64,
    rates: &ExchangeRates,
    window: Window,
) -> Result<(), WithdrawError> {
    match &limit.currency {
        Currency::Bitcoin => {
            let limit_msat = sat_to_msat(limit.amount);
            let new_spend_msat = prior_msat + invoice_msat;

            debug!(
                ?window,
                prior_msat, invoice_msat, new_spend_msat, limit_msat, "checking bitcoin limit"
            );

            if new_spend_msat > limit_msat {
                let amount = CurrencyAmount::bitcoin_sat(msat_to_sat(invoice_msat));
                return Err(over_limit(card, amount, window));
            }
        }
        Currency::Fiat(fiat) => {
            let Some(rate) = rates.rate(fiat) else {
                return Err(WithdrawError::InternalError {
                    card: Some(card.clone()),
                    details: "missing exchange rate".into(),
                });
            };
            let invoice_fiat = msat_to_fiat(invoice_msat, rate);
            let prior_fiat = msat_to_fiat(prior_msat, rate);
            let new_spend_fiat = prior_fiat + invoice_fiat;

            debug!(
                ?window,
                prior_fiat, invoice_fiat, new_spend_fiat, limit.amount, "checking fiat limit"
            );

            if new_spend_fiat > limit.amount {
                let amount = CurrencyAmount::fiat(fiat.clone(), invoice_fiat);
                return Err(over_limit(card, amount, window));
            }
        }
    }
    Ok(())
}

fn over_limit(card: &BoltCard, amount: CurrencyAmount, window: Window) -> WithdrawError {
    match window {
        Window::Daily => WithdrawError::DailyLimitExceeded { card: card.clone(), amount },
        Window::Monthly => WithdrawError::MonthlyLimitExceeded { card: card.clone(), amount },
    }
}
