//! Best-effort result notification to the remote settlement service.
//!
//! The remote side correlates attempts by `withdraw_hash`, so delivery
//! failures only cost it visibility; the authorization decision already made
//! locally is never revisited. Callers log errors from [`SettlementNotifier::notify`]
//! and move on.

use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::Full;
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use serde::Serialize;
use tracing::debug;

const NOTIFY_TIMEOUT: Duration = Duration::from_secs(10);

/// Outcome report for one withdrawal attempt.
#[derive(Debug, Clone, Serialize)]
pub struct SettlementReport {
    pub node_id: String,
    pub withdraw_hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub err_message: Option<String>,
}

#[async_trait]
pub trait SettlementNotifier: Send + Sync {
    async fn notify(&self, report: &SettlementReport) -> Result<()>;
}

/// Posts reports as JSON to a fixed endpoint. A 2xx response is the only
/// success signal.
pub struct HttpSettlementNotifier {
    endpoint: http::Uri,
    client: Client<HttpsConnector<HttpConnector>, Full<Bytes>>,
}

impl HttpSettlementNotifier {
    pub fn new(endpoint: &str) -> Result<Self> {
        let endpoint: http::Uri = endpoint.parse().context("invalid settlement endpoint")?;

        let https = HttpsConnectorBuilder::new()
            .with_webpki_roots()
            .https_or_http()
            .enable_http1()
            .build();
        let client = Client::builder(TokioExecutor::new()).build(https);

        Ok(Self { endpoint, client })
    }
}

#[async_trait]
impl SettlementNotifier for HttpSettlementNotifier {
    async fn notify(&self, report: &SettlementReport) -> Result<()> {
        let body = serde_json::to_vec(report)?;

        let request = http::Request::builder()
            .method("POST")
            .uri(self.endpoint.clone())
            .header("Content-Type", "application/json")
            .body(Full::new(Bytes::from(body)))
            .context("failed to build settlement request")?;

        debug!(withdraw_hash = %report.withdraw_hash, "posting settlement report");

        let response = tokio::time::timeout(NOTIFY_TIMEOUT, self.client.request(request))
            .await
            .map_err(|_| anyhow!("settlement request timed out"))?
            .context("settlement request failed")?;

        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!("settlement endpoint returned {status}"));
        }

        debug!(withdraw_hash = %report.withdraw_hash, "settlement report delivered");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_wire_format() {
        let report = SettlementReport {
            node_id: "02abc".into(),
            withdraw_hash: "deadbeef".into(),
            err_message: None,
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["node_id"], "02abc");
        assert_eq!(json["withdraw_hash"], "deadbeef");
        // Successful withdrawals omit the error field entirely.
        assert!(json.get("err_message").is_none());

        let report = SettlementReport { err_message: Some("replay detected".into()), ..report };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["err_message"], "replay detected");
    }

    #[test]
    fn rejects_malformed_endpoint() {
        assert!(HttpSettlementNotifier::new("not a url").is_err());
    }
}
