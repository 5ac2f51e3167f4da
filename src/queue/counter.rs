//! Per-service daily ticket numbering.
//!
//! Each service owns one `service_counters` row. The row is only ever read
//! and written under a `FOR UPDATE` lock, inside the same transaction that
//! inserts the ticket, which is what keeps sequences gap-free under
//! concurrent enqueues.

use chrono::{NaiveDate, Utc};
use diesel::prelude::*;
use log::warn;
use uuid::Uuid;

use crate::queue::error::QueueError;
use crate::shared::models::schema::{counter_archive, service_counters};
use crate::shared::models::{CounterArchive, QueueService, ServiceCounter};

/// Reserve the next sequence number for `service`.
///
/// Must run inside the transaction that creates the ticket row. Callers hold
/// the service row lock already, which also serializes first-of-day counter
/// creation (there is no counter row to lock yet at that point).
pub fn reserve(
    conn: &mut PgConnection,
    service: &QueueService,
) -> Result<(i32, NaiveDate), QueueError> {
    let today = store_today(conn)?;

    let counter: Option<ServiceCounter> = service_counters::table
        .find(service.id)
        .for_update()
        .first(conn)
        .optional()?;

    let last_sequence = match counter {
        None => {
            let fresh = ServiceCounter {
                service_id: service.id,
                counter_date: today,
                last_sequence: 0,
            };
            diesel::insert_into(service_counters::table)
                .values(&fresh)
                .execute(conn)?;
            0
        }
        Some(row) if row.counter_date != today => {
            archive_final_count(conn, &row);
            diesel::update(service_counters::table.find(service.id))
                .set((
                    service_counters::counter_date.eq(today),
                    service_counters::last_sequence.eq(0),
                ))
                .execute(conn)?;
            0
        }
        Some(row) => row.last_sequence,
    };

    let next = last_sequence + 1;
    diesel::update(service_counters::table.find(service.id))
        .set(service_counters::last_sequence.eq(next))
        .execute(conn)?;

    Ok((next, today))
}

/// "Today" according to the database, not the caller. Multiple instances of
/// the server may disagree on local time; the store may not.
fn store_today(conn: &mut PgConnection) -> Result<NaiveDate, QueueError> {
    use diesel::dsl::sql;
    use diesel::sql_types::Date;

    let today: NaiveDate = diesel::select(sql::<Date>("CURRENT_DATE")).get_result(conn)?;
    Ok(today)
}

// Archival is advisory. The insert runs in a savepoint so that a failure
// cannot poison the surrounding reservation transaction.
fn archive_final_count(conn: &mut PgConnection, counter: &ServiceCounter) {
    let record = CounterArchive {
        id: Uuid::new_v4(),
        service_id: counter.service_id,
        counter_date: counter.counter_date,
        final_sequence: counter.last_sequence,
        archived_at: Utc::now(),
    };

    let result = conn.transaction::<_, diesel::result::Error, _>(|conn| {
        diesel::insert_into(counter_archive::table)
            .values(&record)
            .execute(conn)?;
        Ok(())
    });

    if let Err(e) = result {
        warn!(
            "Failed to archive counter for service {} ({}): {}",
            counter.service_id, counter.counter_date, e
        );
    }
}

/// Display prefix for a service's tickets. Blank prefixes fall back to the
/// first letters of the service name, then to the service id, so a ticket
/// number is always well-formed.
pub fn ticket_prefix(service: &QueueService) -> String {
    let configured = service.prefix.trim();
    if !configured.is_empty() {
        return configured.to_uppercase();
    }

    let from_name: String = service
        .name
        .chars()
        .filter(|c| c.is_ascii_alphabetic())
        .take(2)
        .collect::<String>()
        .to_uppercase();
    if !from_name.is_empty() {
        return from_name;
    }

    let hex = service.id.simple().to_string();
    format!("S{}", hex[..2].to_uppercase())
}

pub fn format_number(prefix: &str, sequence: i32) -> String {
    format!("{}{:03}", prefix, sequence)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(name: &str, prefix: &str) -> QueueService {
        let now = Utc::now();
        QueueService {
            id: Uuid::new_v4(),
            name: name.to_string(),
            prefix: prefix.to_string(),
            priority_level: 1,
            estimated_minutes: 10,
            is_active: true,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_configured_prefix_wins() {
        assert_eq!(ticket_prefix(&service("Cashier", "cx")), "CX");
    }

    #[test]
    fn test_blank_prefix_derives_from_name() {
        assert_eq!(ticket_prefix(&service("Cashier", "")), "CA");
        assert_eq!(ticket_prefix(&service("  support desk", "  ")), "SU");
    }

    #[test]
    fn test_nameless_service_falls_back_to_id() {
        let fallback = ticket_prefix(&service("42", ""));
        assert!(fallback.starts_with('S'));
        assert_eq!(fallback.len(), 3);
    }

    #[test]
    fn test_number_formatting_pads_to_three() {
        assert_eq!(format_number("A", 7), "A007");
        assert_eq!(format_number("CX", 42), "CX042");
        assert_eq!(format_number("A", 1234), "A1234");
    }
}
