//! Gate that holds the pipeline until the payment-channel layer is usable.
//!
//! Paying through a half-open channel set is either impossible or unsafe, so
//! the claim step must not run before (a) the peer connection is established
//! and (b) every known channel settles into an acceptable state, in that
//! order. The wait is unbounded; callers impose a timeout if they need one.

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnection {
    Closed,
    Establishing,
    Established,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Funding negotiation in flight.
    Opening,
    /// Funded, waiting for confirmations. Acceptable: the channel cannot be
    /// used yet but will not interfere with payments on other channels.
    WaitForChannelReady,
    Usable,
    /// Mutual close in progress; still exchanging messages.
    ShuttingDown,
    Closing,
    Closed,
}

impl ChannelState {
    pub fn is_ready(&self) -> bool {
        matches!(
            self,
            ChannelState::WaitForChannelReady
                | ChannelState::Usable
                | ChannelState::Closing
                | ChannelState::Closed
        )
    }
}

pub struct ReadinessGate {
    connection: watch::Receiver<PeerConnection>,
    channels: watch::Receiver<Vec<ChannelState>>,
}

impl ReadinessGate {
    pub fn new(
        connection: watch::Receiver<PeerConnection>,
        channels: watch::Receiver<Vec<ChannelState>>,
    ) -> Self {
        Self { connection, channels }
    }

    /// Resolves once the peer is connected and all channels are ready.
    ///
    /// Errors only if one of the underlying streams closes first, which
    /// means the channel engine went away entirely.
    pub async fn wait_until_ready(&self) -> Result<()> {
        let mut connection = self.connection.clone();
        connection
            .wait_for(|c| *c == PeerConnection::Established)
            .await
            .context("peer connection stream closed")?;
        debug!("connected to peer");

        let mut channels = self.channels.clone();
        channels
            .wait_for(|list| list.iter().all(ChannelState::is_ready))
            .await
            .context("channel state stream closed")?;
        debug!("all channels ready");

        Ok(())
    }
}
