//! Fan-out of one frame to many connections.
//!
//! The frame is encoded once and written to every recipient of a registry
//! snapshot concurrently. A failed write to one connection is counted and
//! logged; it never stops delivery to the rest.

use std::sync::Arc;

use futures_util::future::join_all;
use tracing::{debug, instrument, warn};

use super::connection::{Connection, ConnectionId};
use super::registry::ConnectionRegistry;
use crate::protocol::{encode, FrameError, Opcode};

/// Outcome of a broadcast
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Connections the frame was written to
    pub delivered: usize,
    /// Connections whose write failed or that closed mid-broadcast
    pub failed: usize,
}

/// Sends frames to registered connections
#[derive(Debug, Clone)]
pub struct Broadcaster {
    registry: Arc<ConnectionRegistry>,
}

impl Broadcaster {
    /// Creates a new broadcaster.
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    /// Broadcasts to every open connection.
    pub async fn broadcast(
        &self,
        opcode: Opcode,
        payload: &[u8],
    ) -> Result<BroadcastReport, FrameError> {
        self.broadcast_filtered(opcode, payload, |_| true).await
    }

    pub async fn broadcast_text(&self, text: &str) -> Result<BroadcastReport, FrameError> {
        self.broadcast(Opcode::Text, text.as_bytes()).await
    }

    pub async fn broadcast_binary(&self, data: &[u8]) -> Result<BroadcastReport, FrameError> {
        self.broadcast(Opcode::Binary, data).await
    }

    /// Broadcasts to connections accepted through the given service pattern.
    pub async fn broadcast_to_service(
        &self,
        service: &str,
        opcode: Opcode,
        payload: &[u8],
    ) -> Result<BroadcastReport, FrameError> {
        self.broadcast_filtered(opcode, payload, |c| c.service() == service)
            .await
    }

    /// Broadcasts to every open connection except one.
    pub async fn broadcast_except(
        &self,
        excluded: ConnectionId,
        opcode: Opcode,
        payload: &[u8],
    ) -> Result<BroadcastReport, FrameError> {
        self.broadcast_filtered(opcode, payload, |c| c.id() != excluded)
            .await
    }

    /// Broadcasts to open connections accepted by `filter`.
    #[instrument(skip(self, payload, filter), fields(len = payload.len()))]
    pub async fn broadcast_filtered<F>(
        &self,
        opcode: Opcode,
        payload: &[u8],
        filter: F,
    ) -> Result<BroadcastReport, FrameError>
    where
        F: Fn(&Connection) -> bool + Send,
    {
        let frame = encode(opcode, payload)?;
        let recipients: Vec<Arc<Connection>> = self
            .registry
            .snapshot()
            .await
            .into_iter()
            .filter(|c| c.is_open() && filter(c))
            .collect();

        let results = join_all(recipients.iter().map(|c| c.send_encoded(&frame))).await;

        let mut report = BroadcastReport::default();
        for (connection, result) in recipients.iter().zip(results) {
            match result {
                Ok(true) => report.delivered += 1,
                Ok(false) => {
                    report.failed += 1;
                }
                Err(e) => {
                    report.failed += 1;
                    warn!(conn_id = %connection.id(), error = %e, "broadcast skipped connection");
                }
            }
        }

        debug!(
            delivered = report.delivered,
            failed = report.failed,
            "broadcast complete"
        );
        Ok(report)
    }

    /// Returns the number of registered connections.
    pub async fn connection_count(&self) -> usize {
        self.registry.len().await
    }
}
