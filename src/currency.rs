use std::fmt;
use std::str::FromStr;

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};

/// Millisatoshis in one whole bitcoin.
pub const MSAT_PER_BTC: u64 = 100_000_000_000;

/// Millisatoshis in one satoshi.
pub const MSAT_PER_SAT: u64 = 1_000;

/// An ISO-4217 style fiat currency code, stored uppercase.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FiatCode(String);

impl FiatCode {
    pub fn new(code: &str) -> Self {
        Self(code.to_ascii_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FiatCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The denomination a spending limit (or user-facing amount) is expressed in.
///
/// Bitcoin amounts are denominated in satoshis; fiat amounts in whole units
/// of the tagged currency.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Currency {
    Bitcoin,
    Fiat(FiatCode),
}

impl Currency {
    pub fn code(&self) -> &str {
        match self {
            Currency::Bitcoin => "sat",
            Currency::Fiat(code) => code.as_str(),
        }
    }

    pub fn from_code(code: &str) -> Self {
        if code.eq_ignore_ascii_case("sat") {
            Currency::Bitcoin
        } else {
            Currency::Fiat(FiatCode::new(code))
        }
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// A currency-tagged amount, e.g. a spending limit or an over-limit value.
#[derive(Debug, Clone, PartialEq)]
pub struct CurrencyAmount {
    pub currency: Currency,
    pub amount: f64,
}

impl CurrencyAmount {
    pub fn bitcoin_sat(sat: f64) -> Self {
        Self { currency: Currency::Bitcoin, amount: sat }
    }

    pub fn fiat(code: FiatCode, amount: f64) -> Self {
        Self { currency: Currency::Fiat(code), amount }
    }
}

impl fmt::Display for CurrencyAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.amount, self.currency)
    }
}

impl FromStr for CurrencyAmount {
    type Err = anyhow::Error;

    /// Parses `"<amount> <code>"`, e.g. `"120000 sat"` or `"250 EUR"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (amount, code) = s
            .trim()
            .split_once(' ')
            .ok_or_else(|| anyhow!("expected '<amount> <code>', got {s:?}"))?;
        let amount: f64 = amount.parse()?;
        if !amount.is_finite() || amount < 0.0 {
            return Err(anyhow!("amount must be a non-negative number"));
        }
        Ok(Self { currency: Currency::from_code(code.trim()), amount })
    }
}

/// One fiat's current price for a whole bitcoin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeRate {
    pub fiat: FiatCode,
    pub price: f64,
}

/// A point-in-time snapshot of bitcoin prices, one entry per fiat currency.
#[derive(Debug, Clone, Default)]
pub struct ExchangeRates(Vec<ExchangeRate>);

impl ExchangeRates {
    pub fn new(rates: Vec<ExchangeRate>) -> Self {
        Self(rates)
    }

    /// The current BTC price in the given fiat, if the snapshot has one.
    pub fn rate(&self, fiat: &FiatCode) -> Option<f64> {
        self.0.iter().find(|r| &r.fiat == fiat).map(|r| r.price)
    }
}

/// Converts a millisatoshi amount to fiat using a BTC price.
pub fn msat_to_fiat(msat: u64, btc_price: f64) -> f64 {
    (msat as f64 / MSAT_PER_BTC as f64) * btc_price
}

/// Converts a millisatoshi amount to (fractional) satoshis for display.
pub fn msat_to_sat(msat: u64) -> f64 {
    msat as f64 / MSAT_PER_SAT as f64
}

/// Converts a satoshi-denominated limit to millisatoshis for comparison.
pub fn sat_to_msat(sat: f64) -> u64 {
    (sat * MSAT_PER_SAT as f64).round() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn currency_code_roundtrip() {
        assert_eq!(Currency::from_code("sat"), Currency::Bitcoin);
        assert_eq!(Currency::from_code("SAT"), Currency::Bitcoin);
        assert_eq!(
            Currency::from_code("eur"),
            Currency::Fiat(FiatCode::new("EUR"))
        );
        assert_eq!(Currency::Bitcoin.code(), "sat");
        assert_eq!(Currency::from_code("usd").code(), "USD");
    }

    #[test]
    fn parse_currency_amount() {
        let limit: CurrencyAmount = "120000 sat".parse().unwrap();
        assert_eq!(limit, CurrencyAmount::bitcoin_sat(120_000.0));

        let limit: CurrencyAmount = "250.50 eur".parse().unwrap();
        assert_eq!(limit, CurrencyAmount::fiat(FiatCode::new("EUR"), 250.50));

        assert!("250".parse::<CurrencyAmount>().is_err());
        assert!("-1 EUR".parse::<CurrencyAmount>().is_err());
    }

    #[test]
    fn msat_fiat_conversion() {
        // 0.1 BTC at 60_000 per BTC is 6_000 in fiat.
        let msat = MSAT_PER_BTC / 10;
        assert!((msat_to_fiat(msat, 60_000.0) - 6_000.0).abs() < 1e-9);
    }

    #[test]
    fn rate_lookup() {
        let rates = ExchangeRates::new(vec![
            ExchangeRate { fiat: FiatCode::new("USD"), price: 100_000.0 },
            ExchangeRate { fiat: FiatCode::new("EUR"), price: 94_738.0 },
        ]);
        assert_eq!(rates.rate(&FiatCode::new("eur")), Some(94_738.0));
        assert_eq!(rates.rate(&FiatCode::new("CHF")), None);
    }
}
