pub mod audit;
pub mod counter;
pub mod dispatch;
pub mod error;
pub mod lifecycle;
pub mod selection;

use axum::{
    extract::{Path, State},
    routing::{get, post, put},
    Json, Router,
};
use chrono::Utc;
use diesel::prelude::*;
use log::info;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::shared::config::DEFAULT_ALTERNATION_WINDOW;
use crate::shared::models::schema::{queue_services, queue_tickets};
use crate::shared::models::{NewQueueTicket, QueueService, QueueTicket, TicketStatus};
use crate::shared::state::AppState;
use self::dispatch::DispatchOutcome;
use self::error::QueueError;

#[derive(Debug, Deserialize)]
pub struct CreateTicketRequest {
    pub service_id: Uuid,
    pub client_id: Option<Uuid>,
    pub mobile_phone: Option<String>,
    pub priority_level: Option<i32>,
}

#[derive(Debug, Deserialize)]
pub struct PullNextRequest {
    pub operator_id: Uuid,
    pub service_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct OperatorActionRequest {
    pub operator_id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct DispatchResponse {
    pub queue_empty: bool,
    pub ticket: Option<QueueTicket>,
}

#[derive(Debug, Serialize)]
pub struct WaitingSnapshot {
    pub service: QueueService,
    pub waiting: Vec<QueueTicket>,
}

#[derive(Debug, Serialize)]
pub struct QueueStats {
    pub waiting: i64,
    pub called: i64,
    pub in_progress: i64,
    pub completed: i64,
    pub absent: i64,
    pub cancelled: i64,
}

fn alternation_window(state: &AppState) -> i32 {
    state
        .config
        .as_ref()
        .map(|c| c.queue.alternation_window)
        .unwrap_or(DEFAULT_ALTERNATION_WINDOW)
}

/// Run an engine closure on the blocking pool with a pooled connection.
async fn run_blocking<T, F>(state: &Arc<AppState>, job: F) -> Result<T, QueueError>
where
    T: Send + 'static,
    F: FnOnce(&mut PgConnection) -> Result<T, QueueError> + Send + 'static,
{
    let pool = state.conn.clone();
    tokio::task::spawn_blocking(move || {
        let mut conn = pool
            .get()
            .map_err(|e| QueueError::Database(format!("Failed to get database connection: {e}")))?;
        job(&mut conn)
    })
    .await
    .map_err(|e| QueueError::Database(format!("Blocking task failed: {e}")))?
}

/// Create a WAITING ticket: reserve the next number for the service and
/// insert the row in one transaction.
fn insert_ticket(
    conn: &mut PgConnection,
    req: &CreateTicketRequest,
) -> Result<QueueTicket, QueueError> {
    if let Some(priority) = req.priority_level {
        if !(1..=6).contains(&priority) {
            return Err(QueueError::Validation(format!(
                "priority_level must be between 1 and 6, got {priority}"
            )));
        }
    }

    conn.transaction::<_, QueueError, _>(|conn| {
        let service: Option<QueueService> = queue_services::table
            .find(req.service_id)
            .for_update()
            .first(conn)
            .optional()?;
        let service = service.ok_or_else(|| {
            QueueError::NotFound(format!("service {} does not exist", req.service_id))
        })?;
        if !service.is_active {
            return Err(QueueError::Validation(format!(
                "service {} is not accepting tickets",
                service.name
            )));
        }

        let (sequence, issued_on) = counter::reserve(conn, &service)?;
        let number = counter::format_number(&counter::ticket_prefix(&service), sequence);

        let waiting_ahead: i64 = queue_tickets::table
            .filter(queue_tickets::service_id.eq(service.id))
            .filter(queue_tickets::status.eq(TicketStatus::Waiting.as_str()))
            .count()
            .get_result(conn)?;
        let estimated_wait = (waiting_ahead as i32) * service.estimated_minutes;

        let row = NewQueueTicket {
            service_id: service.id,
            operator_id: None,
            client_id: req.client_id,
            mobile_phone: req.mobile_phone.clone(),
            number,
            sequence,
            issued_on,
            status: TicketStatus::Waiting.as_str().to_string(),
            priority_level: req.priority_level.unwrap_or(service.priority_level),
            created_at: Utc::now(),
            estimated_wait_minutes: Some(estimated_wait),
        };

        let ticket: QueueTicket = diesel::insert_into(queue_tickets::table)
            .values(&row)
            .get_result(conn)?;

        info!(
            "Issued ticket {} for service {} (priority {})",
            ticket.number, service.name, ticket.priority_level
        );
        Ok(ticket)
    })
}

pub async fn create_ticket(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateTicketRequest>,
) -> Result<Json<QueueTicket>, QueueError> {
    let ticket = run_blocking(&state, move |conn| insert_ticket(conn, &req)).await?;
    Ok(Json(ticket))
}

pub async fn pull_next(
    State(state): State<Arc<AppState>>,
    Json(req): Json<PullNextRequest>,
) -> Result<Json<DispatchResponse>, QueueError> {
    let audit = state.audit.clone();
    let window = alternation_window(&state);

    let outcome = run_blocking(&state, move |conn| {
        dispatch::assign(conn, audit.as_ref(), req.operator_id, req.service_id, window)
    })
    .await?;

    let response = match outcome {
        DispatchOutcome::Assigned(ticket) => DispatchResponse {
            queue_empty: false,
            ticket: Some(ticket),
        },
        DispatchOutcome::Empty => DispatchResponse {
            queue_empty: true,
            ticket: None,
        },
    };
    Ok(Json(response))
}

pub async fn call_ticket(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(req): Json<OperatorActionRequest>,
) -> Result<Json<QueueTicket>, QueueError> {
    let audit = state.audit.clone();
    let window = alternation_window(&state);
    let ticket = run_blocking(&state, move |conn| {
        lifecycle::call_by_id(conn, audit.as_ref(), id, req.operator_id, window)
    })
    .await?;
    Ok(Json(ticket))
}

pub async fn start_attention(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(req): Json<OperatorActionRequest>,
) -> Result<Json<QueueTicket>, QueueError> {
    let audit = state.audit.clone();
    let ticket = run_blocking(&state, move |conn| {
        lifecycle::start_attention(conn, audit.as_ref(), id, req.operator_id)
    })
    .await?;
    Ok(Json(ticket))
}

pub async fn complete_ticket(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<QueueTicket>, QueueError> {
    let audit = state.audit.clone();
    let ticket =
        run_blocking(&state, move |conn| lifecycle::complete(conn, audit.as_ref(), id)).await?;
    Ok(Json(ticket))
}

pub async fn mark_absent(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<QueueTicket>, QueueError> {
    let audit = state.audit.clone();
    let ticket =
        run_blocking(&state, move |conn| lifecycle::mark_absent(conn, audit.as_ref(), id)).await?;
    Ok(Json(ticket))
}

pub async fn reintegrate_ticket(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<QueueTicket>, QueueError> {
    let audit = state.audit.clone();
    let ticket =
        run_blocking(&state, move |conn| lifecycle::reintegrate(conn, audit.as_ref(), id)).await?;
    Ok(Json(ticket))
}

pub async fn cancel_ticket(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<QueueTicket>, QueueError> {
    let audit = state.audit.clone();
    let ticket =
        run_blocking(&state, move |conn| lifecycle::cancel(conn, audit.as_ref(), id)).await?;
    Ok(Json(ticket))
}

pub async fn get_ticket(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<QueueTicket>, QueueError> {
    let ticket = run_blocking(&state, move |conn| {
        let ticket: Option<QueueTicket> = queue_tickets::table
            .find(id)
            .first(conn)
            .optional()?;
        ticket.ok_or_else(|| QueueError::NotFound(format!("ticket {} does not exist", id)))
    })
    .await?;
    Ok(Json(ticket))
}

pub async fn list_services(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<QueueService>>, QueueError> {
    let services = run_blocking(&state, move |conn| {
        let services: Vec<QueueService> = queue_services::table
            .filter(queue_services::is_active.eq(true))
            .order(queue_services::name.asc())
            .load(conn)?;
        Ok(services)
    })
    .await?;
    Ok(Json(services))
}

/// Display board snapshot: waiting tickets in selection order. Unlocked
/// read, allowed to be slightly stale; authoritative ordering is re-derived
/// under lock at dispatch time.
pub async fn waiting_snapshot(
    State(state): State<Arc<AppState>>,
    Path(service_id): Path<Uuid>,
) -> Result<Json<WaitingSnapshot>, QueueError> {
    let snapshot = run_blocking(&state, move |conn| {
        let service: Option<QueueService> = queue_services::table
            .find(service_id)
            .first(conn)
            .optional()?;
        let service = service.ok_or_else(|| {
            QueueError::NotFound(format!("service {} does not exist", service_id))
        })?;

        let mut waiting: Vec<QueueTicket> = queue_tickets::table
            .filter(queue_tickets::service_id.eq(service_id))
            .filter(queue_tickets::status.eq(TicketStatus::Waiting.as_str()))
            .load(conn)?;
        waiting.sort_by(|a, b| a.effective_at().cmp(&b.effective_at()).then(a.id.cmp(&b.id)));

        Ok(WaitingSnapshot { service, waiting })
    })
    .await?;
    Ok(Json(snapshot))
}

pub async fn queue_stats(
    State(state): State<Arc<AppState>>,
) -> Result<Json<QueueStats>, QueueError> {
    let stats = run_blocking(&state, move |conn| {
        let today = Utc::now().date_naive();
        Ok(QueueStats {
            waiting: count_today(conn, today, TicketStatus::Waiting)?,
            called: count_today(conn, today, TicketStatus::Called)?,
            in_progress: count_today(conn, today, TicketStatus::InProgress)?,
            completed: count_today(conn, today, TicketStatus::Completed)?,
            absent: count_today(conn, today, TicketStatus::Absent)?,
            cancelled: count_today(conn, today, TicketStatus::Cancelled)?,
        })
    })
    .await?;
    Ok(Json(stats))
}

fn count_today(
    conn: &mut PgConnection,
    today: chrono::NaiveDate,
    status: TicketStatus,
) -> Result<i64, QueueError> {
    let count: i64 = queue_tickets::table
        .filter(queue_tickets::issued_on.eq(today))
        .filter(queue_tickets::status.eq(status.as_str()))
        .count()
        .get_result(conn)?;
    Ok(count)
}

pub fn configure_queue_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/queue/tickets", post(create_ticket))
        .route("/api/queue/next", post(pull_next))
        .route("/api/queue/stats", get(queue_stats))
        .route("/api/queue/tickets/:id", get(get_ticket))
        .route("/api/queue/tickets/:id/call", post(call_ticket))
        .route("/api/queue/tickets/:id/start", put(start_attention))
        .route("/api/queue/tickets/:id/complete", put(complete_ticket))
        .route("/api/queue/tickets/:id/absent", put(mark_absent))
        .route("/api/queue/tickets/:id/reintegrate", put(reintegrate_ticket))
        .route("/api/queue/tickets/:id/cancel", put(cancel_ticket))
        .route("/api/queue/services", get(list_services))
        .route("/api/queue/services/:id/waiting", get(waiting_snapshot))
}
