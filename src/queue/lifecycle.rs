//! Ticket lifecycle state machine.
//!
//! Every mutating operation here runs in its own transaction and takes a
//! `FOR UPDATE` lock on the ticket row before validating, so two operators
//! racing the same ticket through different endpoints cannot interleave
//! (e.g. one completing while the other marks absent).
//!
//! Legal transitions:
//! WAITING -> CALLED          dispatch or direct call-by-id (front of queue)
//! ABSENT  -> CALLED          re-call by id (out of strict order)
//! CALLED  -> IN_PROGRESS     start attention
//! IN_PROGRESS -> COMPLETED   complete
//! CALLED | IN_PROGRESS -> ABSENT
//! ABSENT  -> WAITING         reintegrate (back of the fairness window)
//! any non-terminal -> CANCELLED

use chrono::Utc;
use diesel::prelude::*;
use uuid::Uuid;

use crate::queue::audit::{AuditSink, OperatorSnapshot, TicketEvent};
use crate::queue::dispatch;
use crate::queue::error::QueueError;
use crate::shared::models::schema::{operators, queue_tickets};
use crate::shared::models::{Operator, QueueTicket, TicketStatus};

pub fn transition_allowed(from: TicketStatus, to: TicketStatus) -> bool {
    use TicketStatus::*;
    match (from, to) {
        (Waiting, Called) => true,
        (Absent, Called) => true,
        (Called, InProgress) => true,
        (InProgress, Completed) => true,
        (Called, Absent) | (InProgress, Absent) => true,
        (Absent, Waiting) => true,
        (from, Cancelled) => !from.is_terminal(),
        _ => false,
    }
}

/// Call a specific ticket by id for an operator.
///
/// A WAITING ticket must still be the legitimate next pick of its service
/// queue; an ABSENT ticket is recoverable out of strict order. Repeating the
/// call on a ticket this operator already holds is idempotent.
pub fn call_by_id(
    conn: &mut PgConnection,
    audit: &dyn AuditSink,
    ticket_id: i64,
    operator_id: Uuid,
    window: i32,
) -> Result<QueueTicket, QueueError> {
    let (ticket, event) = conn.transaction::<_, QueueError, _>(|conn| {
        let ticket = lock_ticket(conn, ticket_id)?;
        let status = parse_status(&ticket)?;

        match status {
            TicketStatus::Called => {
                if ticket.operator_id == Some(operator_id) {
                    return Ok((ticket, None));
                }
                Err(QueueError::Conflict(format!(
                    "ticket {} is already called by another operator",
                    ticket.number
                )))
            }
            TicketStatus::Waiting => {
                let operator = require_free_operator(conn, operator_id)?;
                // Direct calls cannot jump the queue: the requested ticket
                // has to be what the selection policy would pick anyway.
                let next = dispatch::pick_from(conn, &[ticket.service_id], window)?;
                match next {
                    Some(front) if front.id == ticket.id => {}
                    _ => {
                        return Err(QueueError::Conflict(format!(
                            "ticket {} is not the next in its queue",
                            ticket.number
                        )))
                    }
                }
                let called = dispatch::mark_called(conn, &ticket, operator.id)?;
                let event = TicketEvent::new(
                    &called,
                    TicketStatus::Waiting,
                    TicketStatus::Called,
                    Some(OperatorSnapshot::from(&operator)),
                );
                Ok((called, Some(event)))
            }
            TicketStatus::Absent => {
                let operator = require_free_operator(conn, operator_id)?;
                let called = dispatch::mark_called(conn, &ticket, operator.id)?;
                let event = TicketEvent::new(
                    &called,
                    TicketStatus::Absent,
                    TicketStatus::Called,
                    Some(OperatorSnapshot::from(&operator)),
                );
                Ok((called, Some(event)))
            }
            other => Err(QueueError::InvalidTransition(format!(
                "cannot call ticket {} from {}",
                ticket.number,
                other.as_str()
            ))),
        }
    })?;

    if let Some(event) = event {
        audit.record(&event);
    }
    Ok(ticket)
}

/// CALLED -> IN_PROGRESS.
pub fn start_attention(
    conn: &mut PgConnection,
    audit: &dyn AuditSink,
    ticket_id: i64,
    operator_id: Uuid,
) -> Result<QueueTicket, QueueError> {
    let (ticket, event) = conn.transaction::<_, QueueError, _>(|conn| {
        let ticket = lock_ticket(conn, ticket_id)?;
        let status = parse_status(&ticket)?;
        ensure_transition(&ticket, status, TicketStatus::InProgress)?;
        if ticket.operator_id != Some(operator_id) {
            return Err(QueueError::Conflict(format!(
                "ticket {} is assigned to a different operator",
                ticket.number
            )));
        }

        let now = Utc::now();
        diesel::update(queue_tickets::table.find(ticket.id))
            .set((
                queue_tickets::status.eq(TicketStatus::InProgress.as_str()),
                queue_tickets::started_at.eq(Some(now)),
                queue_tickets::attention_seconds.eq(None::<i32>),
            ))
            .execute(conn)?;

        let updated: QueueTicket = queue_tickets::table.find(ticket.id).first(conn)?;
        let event = TicketEvent::new(
            &updated,
            status,
            TicketStatus::InProgress,
            operator_snapshot(conn, updated.operator_id),
        );
        Ok((updated, event))
    })?;

    audit.record(&event);
    Ok(ticket)
}

/// IN_PROGRESS -> COMPLETED. Computes the attention duration and backfills
/// the actual wait when the ticket was called without one.
pub fn complete(
    conn: &mut PgConnection,
    audit: &dyn AuditSink,
    ticket_id: i64,
) -> Result<QueueTicket, QueueError> {
    let (ticket, event) = conn.transaction::<_, QueueError, _>(|conn| {
        let ticket = lock_ticket(conn, ticket_id)?;
        let status = parse_status(&ticket)?;
        ensure_transition(&ticket, status, TicketStatus::Completed)?;

        let now = Utc::now();
        let attention = ticket
            .started_at
            .map(|s| (now - s).num_seconds().max(0) as i32);
        let waited = ticket.actual_wait_seconds.or_else(|| {
            ticket
                .called_at
                .map(|c| (c - ticket.created_at).num_seconds().max(0) as i32)
        });

        diesel::update(queue_tickets::table.find(ticket.id))
            .set((
                queue_tickets::status.eq(TicketStatus::Completed.as_str()),
                queue_tickets::completed_at.eq(Some(now)),
                queue_tickets::attention_seconds.eq(attention),
                queue_tickets::actual_wait_seconds.eq(waited),
            ))
            .execute(conn)?;

        let updated: QueueTicket = queue_tickets::table.find(ticket.id).first(conn)?;
        let event = TicketEvent::new(
            &updated,
            status,
            TicketStatus::Completed,
            operator_snapshot(conn, updated.operator_id),
        );
        Ok((updated, event))
    })?;

    audit.record(&event);
    Ok(ticket)
}

/// CALLED | IN_PROGRESS -> ABSENT. The operator snapshot is captured before
/// the assignment is cleared so the audit trail keeps who lost the client.
pub fn mark_absent(
    conn: &mut PgConnection,
    audit: &dyn AuditSink,
    ticket_id: i64,
) -> Result<QueueTicket, QueueError> {
    let (ticket, event) = conn.transaction::<_, QueueError, _>(|conn| {
        let ticket = lock_ticket(conn, ticket_id)?;
        let status = parse_status(&ticket)?;
        ensure_transition(&ticket, status, TicketStatus::Absent)?;

        let snapshot = operator_snapshot(conn, ticket.operator_id);
        let now = Utc::now();
        diesel::update(queue_tickets::table.find(ticket.id))
            .set((
                queue_tickets::status.eq(TicketStatus::Absent.as_str()),
                queue_tickets::operator_id.eq(None::<Uuid>),
                queue_tickets::absent_at.eq(Some(now)),
            ))
            .execute(conn)?;

        let updated: QueueTicket = queue_tickets::table.find(ticket.id).first(conn)?;
        let event = TicketEvent::new(&updated, status, TicketStatus::Absent, snapshot);
        Ok((updated, event))
    })?;

    audit.record(&event);
    Ok(ticket)
}

/// ABSENT -> WAITING. The fresh `requeued_at` is what sends the ticket to
/// the back of the fairness window.
pub fn reintegrate(
    conn: &mut PgConnection,
    audit: &dyn AuditSink,
    ticket_id: i64,
) -> Result<QueueTicket, QueueError> {
    let (ticket, event) = conn.transaction::<_, QueueError, _>(|conn| {
        let ticket = lock_ticket(conn, ticket_id)?;
        let status = parse_status(&ticket)?;
        ensure_transition(&ticket, status, TicketStatus::Waiting)?;

        let now = Utc::now();
        diesel::update(queue_tickets::table.find(ticket.id))
            .set((
                queue_tickets::status.eq(TicketStatus::Waiting.as_str()),
                queue_tickets::operator_id.eq(None::<Uuid>),
                queue_tickets::requeued_at.eq(Some(now)),
            ))
            .execute(conn)?;

        let updated: QueueTicket = queue_tickets::table.find(ticket.id).first(conn)?;
        let event = TicketEvent::new(&updated, status, TicketStatus::Waiting, None);
        Ok((updated, event))
    })?;

    audit.record(&event);
    Ok(ticket)
}

/// Any non-terminal state -> CANCELLED.
pub fn cancel(
    conn: &mut PgConnection,
    audit: &dyn AuditSink,
    ticket_id: i64,
) -> Result<QueueTicket, QueueError> {
    let (ticket, event) = conn.transaction::<_, QueueError, _>(|conn| {
        let ticket = lock_ticket(conn, ticket_id)?;
        let status = parse_status(&ticket)?;
        ensure_transition(&ticket, status, TicketStatus::Cancelled)?;

        let snapshot = operator_snapshot(conn, ticket.operator_id);
        diesel::update(queue_tickets::table.find(ticket.id))
            .set((
                queue_tickets::status.eq(TicketStatus::Cancelled.as_str()),
                queue_tickets::operator_id.eq(None::<Uuid>),
            ))
            .execute(conn)?;

        let updated: QueueTicket = queue_tickets::table.find(ticket.id).first(conn)?;
        let event = TicketEvent::new(&updated, status, TicketStatus::Cancelled, snapshot);
        Ok((updated, event))
    })?;

    audit.record(&event);
    Ok(ticket)
}

fn lock_ticket(conn: &mut PgConnection, ticket_id: i64) -> Result<QueueTicket, QueueError> {
    let ticket: Option<QueueTicket> = queue_tickets::table
        .find(ticket_id)
        .for_update()
        .first(conn)
        .optional()?;
    ticket.ok_or_else(|| QueueError::NotFound(format!("ticket {} does not exist", ticket_id)))
}

fn parse_status(ticket: &QueueTicket) -> Result<TicketStatus, QueueError> {
    TicketStatus::from_str(&ticket.status).ok_or_else(|| {
        QueueError::Database(format!(
            "ticket {} has corrupt status {:?}",
            ticket.id, ticket.status
        ))
    })
}

fn ensure_transition(
    ticket: &QueueTicket,
    from: TicketStatus,
    to: TicketStatus,
) -> Result<(), QueueError> {
    if transition_allowed(from, to) {
        Ok(())
    } else {
        Err(QueueError::InvalidTransition(format!(
            "ticket {} cannot move {} -> {}",
            ticket.number,
            from.as_str(),
            to.as_str()
        )))
    }
}

/// Operator checks shared with dispatch: exists, active, and not holding an
/// active ticket.
fn require_free_operator(
    conn: &mut PgConnection,
    operator_id: Uuid,
) -> Result<Operator, QueueError> {
    let operator = dispatch::lock_operator(conn, operator_id)?;
    if let Some(active) = dispatch::active_ticket(conn, operator_id)? {
        return Err(QueueError::AlreadyBusy(format!(
            "operator {} already holds ticket {}",
            operator_id, active.number
        )));
    }
    Ok(operator)
}

fn operator_snapshot(conn: &mut PgConnection, operator_id: Option<Uuid>) -> Option<OperatorSnapshot> {
    let id = operator_id?;
    let operator: Option<Operator> = operators::table.find(id).first(conn).ok();
    operator.as_ref().map(OperatorSnapshot::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use TicketStatus::*;

    #[test]
    fn test_happy_path_transitions() {
        assert!(transition_allowed(Waiting, Called));
        assert!(transition_allowed(Called, InProgress));
        assert!(transition_allowed(InProgress, Completed));
    }

    #[test]
    fn test_absence_branch() {
        assert!(transition_allowed(Called, Absent));
        assert!(transition_allowed(InProgress, Absent));
        assert!(transition_allowed(Absent, Waiting));
        assert!(transition_allowed(Absent, Called));
        assert!(!transition_allowed(Waiting, Absent));
    }

    #[test]
    fn test_cancel_from_non_terminal_only() {
        assert!(transition_allowed(Waiting, Cancelled));
        assert!(transition_allowed(Called, Cancelled));
        assert!(transition_allowed(InProgress, Cancelled));
        assert!(transition_allowed(Absent, Cancelled));
        assert!(!transition_allowed(Completed, Cancelled));
        assert!(!transition_allowed(Cancelled, Cancelled));
    }

    #[test]
    fn test_terminal_states_are_final() {
        for to in [Waiting, Called, InProgress, Completed, Absent] {
            assert!(!transition_allowed(Completed, to));
            assert!(!transition_allowed(Cancelled, to));
        }
    }

    #[test]
    fn test_no_skipping_states() {
        assert!(!transition_allowed(Waiting, InProgress));
        assert!(!transition_allowed(Waiting, Completed));
        assert!(!transition_allowed(Called, Completed));
        assert!(!transition_allowed(Completed, Waiting));
    }
}
