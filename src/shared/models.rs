use chrono::{DateTime, NaiveDate, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Ticket lifecycle states. Stored as text in `queue_tickets.status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TicketStatus {
    Waiting,
    Called,
    InProgress,
    Completed,
    Absent,
    Cancelled,
}

impl TicketStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "WAITING",
            Self::Called => "CALLED",
            Self::InProgress => "IN_PROGRESS",
            Self::Completed => "COMPLETED",
            Self::Absent => "ABSENT",
            Self::Cancelled => "CANCELLED",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "WAITING" => Some(Self::Waiting),
            "CALLED" => Some(Self::Called),
            "IN_PROGRESS" => Some(Self::InProgress),
            "COMPLETED" => Some(Self::Completed),
            "ABSENT" => Some(Self::Absent),
            "CANCELLED" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Identifiable, Insertable, AsChangeset)]
#[diesel(table_name = queue_services)]
pub struct QueueService {
    pub id: Uuid,
    pub name: String,
    pub prefix: String,
    pub priority_level: i32,
    pub estimated_minutes: i32,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Identifiable)]
#[diesel(table_name = queue_tickets)]
pub struct QueueTicket {
    pub id: i64,
    pub service_id: Uuid,
    pub operator_id: Option<Uuid>,
    pub client_id: Option<Uuid>,
    pub mobile_phone: Option<String>,
    pub number: String,
    pub sequence: i32,
    pub issued_on: NaiveDate,
    pub status: String,
    pub priority_level: i32,
    pub created_at: DateTime<Utc>,
    pub called_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub absent_at: Option<DateTime<Utc>>,
    pub requeued_at: Option<DateTime<Utc>>,
    pub attention_seconds: Option<i32>,
    pub estimated_wait_minutes: Option<i32>,
    pub actual_wait_seconds: Option<i32>,
}

impl QueueTicket {
    /// The timestamp the selection policy orders by: a reintegrated ticket
    /// re-enters the queue at its `requeued_at`, not its original creation.
    pub fn effective_at(&self) -> DateTime<Utc> {
        self.requeued_at.unwrap_or(self.created_at)
    }
}

/// Insert row for `queue_tickets`; the id comes from the BIGSERIAL.
#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = queue_tickets)]
pub struct NewQueueTicket {
    pub service_id: Uuid,
    pub operator_id: Option<Uuid>,
    pub client_id: Option<Uuid>,
    pub mobile_phone: Option<String>,
    pub number: String,
    pub sequence: i32,
    pub issued_on: NaiveDate,
    pub status: String,
    pub priority_level: i32,
    pub created_at: DateTime<Utc>,
    pub estimated_wait_minutes: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Insertable)]
#[diesel(table_name = service_counters)]
pub struct ServiceCounter {
    pub service_id: Uuid,
    pub counter_date: NaiveDate,
    pub last_sequence: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Insertable)]
#[diesel(table_name = counter_archive)]
pub struct CounterArchive {
    pub id: Uuid,
    pub service_id: Uuid,
    pub counter_date: NaiveDate,
    pub final_sequence: i32,
    pub archived_at: DateTime<Utc>,
}

/// Read-only projection of the identity provider. The engine row-locks
/// operators to serialize pulls but never mutates them.
#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Identifiable)]
#[diesel(table_name = operators)]
pub struct Operator {
    pub id: Uuid,
    pub display_name: String,
    pub email: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Identifiable, Insertable)]
#[diesel(table_name = operator_services)]
pub struct OperatorService {
    pub id: Uuid,
    pub operator_id: Uuid,
    pub service_id: Uuid,
    pub weight: i32,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

pub mod schema {
    diesel::table! {
        queue_services (id) {
            id -> Uuid,
            name -> Text,
            prefix -> Text,
            priority_level -> Int4,
            estimated_minutes -> Int4,
            is_active -> Bool,
            created_at -> Timestamptz,
            updated_at -> Timestamptz,
        }
    }

    diesel::table! {
        queue_tickets (id) {
            id -> Int8,
            service_id -> Uuid,
            operator_id -> Nullable<Uuid>,
            client_id -> Nullable<Uuid>,
            mobile_phone -> Nullable<Text>,
            number -> Text,
            sequence -> Int4,
            issued_on -> Date,
            status -> Text,
            priority_level -> Int4,
            created_at -> Timestamptz,
            called_at -> Nullable<Timestamptz>,
            started_at -> Nullable<Timestamptz>,
            completed_at -> Nullable<Timestamptz>,
            absent_at -> Nullable<Timestamptz>,
            requeued_at -> Nullable<Timestamptz>,
            attention_seconds -> Nullable<Int4>,
            estimated_wait_minutes -> Nullable<Int4>,
            actual_wait_seconds -> Nullable<Int4>,
        }
    }

    diesel::table! {
        service_counters (service_id) {
            service_id -> Uuid,
            counter_date -> Date,
            last_sequence -> Int4,
        }
    }

    diesel::table! {
        counter_archive (id) {
            id -> Uuid,
            service_id -> Uuid,
            counter_date -> Date,
            final_sequence -> Int4,
            archived_at -> Timestamptz,
        }
    }

    diesel::table! {
        operators (id) {
            id -> Uuid,
            display_name -> Text,
            email -> Text,
            is_active -> Bool,
            created_at -> Timestamptz,
        }
    }

    diesel::table! {
        operator_services (id) {
            id -> Uuid,
            operator_id -> Uuid,
            service_id -> Uuid,
            weight -> Int4,
            is_active -> Bool,
            created_at -> Timestamptz,
        }
    }
}

pub use schema::*;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for status in [
            TicketStatus::Waiting,
            TicketStatus::Called,
            TicketStatus::InProgress,
            TicketStatus::Completed,
            TicketStatus::Absent,
            TicketStatus::Cancelled,
        ] {
            assert_eq!(TicketStatus::from_str(status.as_str()), Some(status));
        }
        assert_eq!(TicketStatus::from_str("PAUSED"), None);
    }

    #[test]
    fn test_terminal_states() {
        assert!(TicketStatus::Completed.is_terminal());
        assert!(TicketStatus::Cancelled.is_terminal());
        assert!(!TicketStatus::Absent.is_terminal());
        assert!(!TicketStatus::Waiting.is_terminal());
    }
}
