//! Fire-and-forget audit events for ticket status changes.
//!
//! Persistence of the audit trail belongs to an external collaborator; the
//! engine only emits. A sink must never propagate failures back into the
//! transition that produced the event.

use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::Serialize;
use uuid::Uuid;

use crate::shared::models::{Operator, QueueTicket, TicketStatus};

#[derive(Debug, Clone, Serialize)]
pub struct OperatorSnapshot {
    pub id: Uuid,
    pub display_name: String,
    pub email: String,
}

impl From<&Operator> for OperatorSnapshot {
    fn from(operator: &Operator) -> Self {
        Self {
            id: operator.id,
            display_name: operator.display_name.clone(),
            email: operator.email.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TicketEvent {
    pub ticket_id: i64,
    pub number: String,
    pub previous_status: String,
    pub new_status: String,
    pub operator: Option<OperatorSnapshot>,
    pub occurred_at: DateTime<Utc>,
}

impl TicketEvent {
    pub fn new(
        ticket: &QueueTicket,
        previous: TicketStatus,
        new: TicketStatus,
        operator: Option<OperatorSnapshot>,
    ) -> Self {
        Self {
            ticket_id: ticket.id,
            number: ticket.number.clone(),
            previous_status: previous.as_str().to_string(),
            new_status: new.as_str().to_string(),
            operator,
            occurred_at: Utc::now(),
        }
    }
}

pub trait AuditSink: Send + Sync {
    fn record(&self, event: &TicketEvent);
}

/// Default sink: one structured log line per status change.
pub struct LogAuditSink;

impl AuditSink for LogAuditSink {
    fn record(&self, event: &TicketEvent) {
        match serde_json::to_string(event) {
            Ok(payload) => info!("ticket event: {}", payload),
            Err(e) => warn!(
                "Failed to serialize ticket event for {}: {}",
                event.ticket_id, e
            ),
        }
    }
}
