use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use ulid::Ulid;

use crate::model::Booking;
use crate::tenant::TenantId;

const CHANNEL_CAPACITY: usize = 256;

/// What downstream collaborators hear about, after the fact. Only ids:
/// consumers read the booking itself back through the tenant's scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BookingNotice {
    Committed { tenant_id: TenantId, booking_id: Ulid },
    Cancelled { tenant_id: TenantId, booking_id: Ulid },
}

impl BookingNotice {
    pub fn committed(booking: &Booking) -> Self {
        BookingNotice::Committed {
            tenant_id: booking.tenant_id.clone(),
            booking_id: booking.id,
        }
    }

    pub fn cancelled(booking: &Booking) -> Self {
        BookingNotice::Cancelled {
            tenant_id: booking.tenant_id.clone(),
            booking_id: booking.id,
        }
    }

    pub fn booking_id(&self) -> Ulid {
        match self {
            BookingNotice::Committed { booking_id, .. } | BookingNotice::Cancelled { booking_id, .. } => *booking_id,
        }
    }

    pub fn tenant_id(&self) -> &TenantId {
        match self {
            BookingNotice::Committed { tenant_id, .. } | BookingNotice::Cancelled { tenant_id, .. } => tenant_id,
        }
    }
}

#[derive(Debug, Error)]
#[error("{0}")]
pub struct SinkError(pub String);

/// A downstream consumer of booking notices (confirmation mail, invoicing...).
#[async_trait]
pub trait BookingSink: Send + Sync {
    fn name(&self) -> &'static str;

    async fn deliver(&self, notice: &BookingNotice) -> Result<(), SinkError>;
}

/// Logs each notice as one JSON line.
#[derive(Debug, Default)]
pub struct TracingSink;

#[async_trait]
impl BookingSink for TracingSink {
    fn name(&self) -> &'static str {
        "tracing"
    }

    async fn deliver(&self, notice: &BookingNotice) -> Result<(), SinkError> {
        let json = serde_json::to_string(notice).map_err(|e| SinkError(e.to_string()))?;
        info!(target: "rental_engine::notice", "{json}");
        Ok(())
    }
}

/// Post-commit fan-out. Delivery is fire-and-forget: each sink runs on its
/// own task and nothing it does reaches the booking caller.
pub struct NotifyHub {
    sinks: Vec<Arc<dyn BookingSink>>,
    tx: broadcast::Sender<BookingNotice>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            sinks: Vec::new(),
            tx: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn BookingSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// In-process feed of every notice published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<BookingNotice> {
        self.tx.subscribe()
    }

    pub fn publish(&self, notice: BookingNotice) {
        // No receivers is fine.
        let _ = self.tx.send(notice.clone());
        for sink in &self.sinks {
            let sink = sink.clone();
            let notice = notice.clone();
            tokio::spawn(async move {
                match sink.deliver(&notice).await {
                    Ok(()) => debug!(sink = sink.name(), tenant = %notice.tenant_id(), booking = %notice.booking_id(), "notice delivered"),
                    Err(e) => {
                        warn!(sink = sink.name(), tenant = %notice.tenant_id(), booking = %notice.booking_id(), "notice delivery failed: {e}");
                        metrics::counter!(crate::observability::NOTIFY_FAILURES_TOTAL, "sink" => sink.name())
                            .increment(1);
                    }
                }
            });
        }
    }
}
