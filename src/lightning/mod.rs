use std::fmt;
use std::str::FromStr;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use lightning_invoice::{Bolt11Invoice, Bolt11InvoiceDescriptionRef, Currency};

/// Newtype wrapper around Bolt11Invoice for convenience methods
#[derive(Debug, Clone)]
pub struct Invoice(Bolt11Invoice);

impl FromStr for Invoice {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Bolt11Invoice::from_str(s)
            .map(Self)
            .map_err(|e| anyhow!("Invalid invoice: {}", e))
    }
}

impl Invoice {
    /// The invoice amount, if it carries one. Amountless invoices are not
    /// acceptable for card withdrawals.
    pub fn amount_msat(&self) -> Option<u64> {
        self.0.amount_milli_satoshis()
    }

    pub fn description(&self) -> Option<String> {
        match self.0.description() {
            Bolt11InvoiceDescriptionRef::Direct(desc) => Some(desc.to_string()),
            Bolt11InvoiceDescriptionRef::Hash(_) => None,
        }
    }

    pub fn payment_hash(&self) -> String {
        hex::encode(self.0.payment_hash().as_ref() as &[u8])
    }

    /// The chain this invoice pays on, from its human-readable prefix.
    pub fn chain(&self) -> Currency {
        self.0.currency()
    }

    pub fn is_expired(&self) -> bool {
        self.0.is_expired()
    }

    pub fn inner(&self) -> &Bolt11Invoice {
        &self.0
    }
}

impl fmt::Display for Invoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Why the payment engine refuses to pay a structurally valid invoice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvoiceRejection {
    AlreadyPaid,
    PaymentPending,
    Expired,
    ChainMismatch,
    Other(String),
}

/// Semantic invoice validation, performed by the payment engine.
///
/// The pipeline has already checked structure and amount presence by the
/// time this runs; implementations decide whether the payment should be
/// refused for reasons only the engine can see (payment history, pending
/// payments, chain, expiry).
#[async_trait]
pub trait InvoiceGate: Send + Sync {
    /// `Ok(None)` means the invoice is payable.
    async fn check_invoice(&self, invoice: &Invoice) -> Result<Option<InvoiceRejection>>;
}

/// Gate for contexts without a payment engine attached: checks expiry and
/// chain only, and cannot detect duplicate or pending payments.
pub struct BasicInvoiceGate {
    expected_chain: Currency,
}

impl BasicInvoiceGate {
    pub fn new(expected_chain: Currency) -> Self {
        Self { expected_chain }
    }
}

#[async_trait]
impl InvoiceGate for BasicInvoiceGate {
    async fn check_invoice(&self, invoice: &Invoice) -> Result<Option<InvoiceRejection>> {
        if invoice.chain() != self.expected_chain {
            return Ok(Some(InvoiceRejection::ChainMismatch));
        }
        if invoice.is_expired() {
            return Ok(Some(InvoiceRejection::Expired));
        }
        Ok(None)
    }
}
