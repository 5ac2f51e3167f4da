//! Dispatch coordination: atomically hand the next waiting ticket to a
//! requesting operator.
//!
//! Competing pulls never double-assign. Same-operator pulls serialize on the
//! operator row lock; cross-operator races are resolved by loading waiting
//! tickets with `FOR UPDATE SKIP LOCKED`, so the loser of a race simply sees
//! the next candidate instead of blocking or erroring.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use log::debug;
use uuid::Uuid;

use crate::queue::audit::{AuditSink, OperatorSnapshot, TicketEvent};
use crate::queue::error::QueueError;
use crate::queue::selection::{self, Candidate};
use crate::shared::models::schema::{operator_services, operators, queue_tickets};
use crate::shared::models::{Operator, QueueTicket, TicketStatus};

#[derive(Debug)]
pub enum DispatchOutcome {
    Assigned(QueueTicket),
    /// Nothing is waiting in any eligible service. A legitimate outcome,
    /// distinct from every error kind.
    Empty,
}

/// Pull the next ticket for `operator_id`, optionally restricted to one
/// service first. Runs as a single transaction.
pub fn assign(
    conn: &mut PgConnection,
    audit: &dyn AuditSink,
    operator_id: Uuid,
    wanted_service: Option<Uuid>,
    window: i32,
) -> Result<DispatchOutcome, QueueError> {
    let (outcome, event) = conn.transaction::<_, QueueError, _>(|conn| {
        let operator = lock_operator(conn, operator_id)?;

        if let Some(active) = active_ticket(conn, operator_id)? {
            // Re-pull of a ticket already called by this operator is
            // idempotent; a ticket under attention is not.
            return if active.status == TicketStatus::Called.as_str() {
                debug!(
                    "Operator {} re-pulled already called ticket {}",
                    operator_id, active.number
                );
                Ok((DispatchOutcome::Assigned(active), None))
            } else {
                Err(QueueError::AlreadyBusy(format!(
                    "operator {} is attending ticket {}",
                    operator_id, active.number
                )))
            };
        }

        let assigned = eligible_services(conn, operator_id)?;
        let (primary, fallback) = match wanted_service {
            Some(service_id) => {
                if !assigned.contains(&service_id) {
                    return Err(QueueError::NotEligible(format!(
                        "operator {} is not assigned to service {}",
                        operator_id, service_id
                    )));
                }
                let rest: Vec<Uuid> =
                    assigned.into_iter().filter(|s| *s != service_id).collect();
                (vec![service_id], rest)
            }
            None => {
                if assigned.is_empty() {
                    return Err(QueueError::NotEligible(format!(
                        "operator {} has no active service assignments",
                        operator_id
                    )));
                }
                (assigned, Vec::new())
            }
        };

        // A requested-but-empty service falls back to the operator's other
        // queues before giving up.
        let mut winner = pick_from(conn, &primary, window)?;
        if winner.is_none() && !fallback.is_empty() {
            winner = pick_from(conn, &fallback, window)?;
        }

        match winner {
            None => Ok((DispatchOutcome::Empty, None)),
            Some(ticket) => {
                let called = mark_called(conn, &ticket, operator.id)?;
                let event = TicketEvent::new(
                    &called,
                    TicketStatus::Waiting,
                    TicketStatus::Called,
                    Some(OperatorSnapshot::from(&operator)),
                );
                Ok((DispatchOutcome::Assigned(called), Some(event)))
            }
        }
    })?;

    if let Some(event) = event {
        audit.record(&event);
    }
    Ok(outcome)
}

/// Lock the operator row for the duration of the transaction. Serializes
/// concurrent pull attempts by the same operator.
pub(crate) fn lock_operator(
    conn: &mut PgConnection,
    operator_id: Uuid,
) -> Result<Operator, QueueError> {
    let operator: Option<Operator> = operators::table
        .find(operator_id)
        .for_update()
        .first(conn)
        .optional()?;

    let operator = operator.ok_or_else(|| {
        QueueError::InvalidOperator(format!("operator {} does not exist", operator_id))
    })?;
    if !operator.is_active {
        return Err(QueueError::InvalidOperator(format!(
            "operator {} is inactive",
            operator_id
        )));
    }
    Ok(operator)
}

/// The operator's current CALLED or IN_PROGRESS ticket, if any. There can
/// be at most one by invariant.
pub(crate) fn active_ticket(
    conn: &mut PgConnection,
    operator_id: Uuid,
) -> Result<Option<QueueTicket>, QueueError> {
    let active: Option<QueueTicket> = queue_tickets::table
        .filter(queue_tickets::operator_id.eq(operator_id))
        .filter(queue_tickets::status.eq_any(vec![
            TicketStatus::Called.as_str(),
            TicketStatus::InProgress.as_str(),
        ]))
        .first(conn)
        .optional()?;
    Ok(active)
}

fn eligible_services(
    conn: &mut PgConnection,
    operator_id: Uuid,
) -> Result<Vec<Uuid>, QueueError> {
    let services: Vec<Uuid> = operator_services::table
        .filter(operator_services::operator_id.eq(operator_id))
        .filter(operator_services::is_active.eq(true))
        .select(operator_services::service_id)
        .load(conn)?;
    Ok(services)
}

/// Load the waiting pool for a set of services with `FOR UPDATE SKIP LOCKED`
/// and run the selection policy over it. Rows locked by a competing pull are
/// invisible here, which is what makes concurrent dispatch race-free.
pub(crate) fn pick_from(
    conn: &mut PgConnection,
    services: &[Uuid],
    window: i32,
) -> Result<Option<QueueTicket>, QueueError> {
    if services.is_empty() {
        return Ok(None);
    }

    let waiting: Vec<QueueTicket> = queue_tickets::table
        .filter(queue_tickets::service_id.eq_any(services))
        .filter(queue_tickets::status.eq(TicketStatus::Waiting.as_str()))
        .for_update()
        .skip_locked()
        .load(conn)?;

    let pool: Vec<Candidate> = waiting.iter().map(Candidate::from_ticket).collect();
    let winner = selection::select_next(&pool, window);
    Ok(winner.and_then(|id| waiting.into_iter().find(|t| t.id == id)))
}

/// Transition a ticket to CALLED for `operator`. The caller owns the row
/// lock (either via skip-locked selection or a direct `FOR UPDATE` load).
pub(crate) fn mark_called(
    conn: &mut PgConnection,
    ticket: &QueueTicket,
    operator: Uuid,
) -> Result<QueueTicket, QueueError> {
    let now = Utc::now();
    let waited = (now - ticket.created_at).num_seconds().max(0) as i32;

    diesel::update(queue_tickets::table.find(ticket.id))
        .set((
            queue_tickets::status.eq(TicketStatus::Called.as_str()),
            queue_tickets::operator_id.eq(Some(operator)),
            queue_tickets::called_at.eq(Some(now)),
            queue_tickets::requeued_at.eq(None::<DateTime<Utc>>),
            queue_tickets::started_at.eq(None::<DateTime<Utc>>),
            queue_tickets::completed_at.eq(None::<DateTime<Utc>>),
            queue_tickets::attention_seconds.eq(None::<i32>),
            queue_tickets::actual_wait_seconds.eq(Some(waited)),
        ))
        .execute(conn)?;

    let called: QueueTicket = queue_tickets::table.find(ticket.id).first(conn)?;
    Ok(called)
}
