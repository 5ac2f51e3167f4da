//! Queue selection policy.
//!
//! Pure decision logic: given the pool of waiting tickets visible to a pull
//! (one service or the union of an operator's eligible services), pick the
//! single ticket to offer next. Priority 6 always preempts; priorities 1-5
//! compete inside an alternation window of the N longest-waiting tickets so
//! that urgency cannot starve old tickets indefinitely.

use chrono::{DateTime, Utc};
use std::cmp::Ordering;

use crate::shared::models::QueueTicket;

/// Tickets at this level bypass the alternation window entirely.
pub const URGENT_PRIORITY: i32 = 6;

#[derive(Debug, Clone)]
pub struct Candidate {
    pub id: i64,
    pub priority_level: i32,
    pub created_at: DateTime<Utc>,
    pub requeued_at: Option<DateTime<Utc>>,
}

impl Candidate {
    pub fn from_ticket(ticket: &QueueTicket) -> Self {
        Self {
            id: ticket.id,
            priority_level: ticket.priority_level,
            created_at: ticket.created_at,
            requeued_at: ticket.requeued_at,
        }
    }

    /// Reintegrated tickets queue behind everyone already waiting: their
    /// position is keyed on `requeued_at`, not the original `created_at`.
    pub fn effective_at(&self) -> DateTime<Utc> {
        self.requeued_at.unwrap_or(self.created_at)
    }
}

// Oldest first; ticket id disambiguates identical timestamps.
fn by_age(a: &Candidate, b: &Candidate) -> Ordering {
    a.effective_at()
        .cmp(&b.effective_at())
        .then(a.id.cmp(&b.id))
}

// Most urgent first, then oldest, then lowest id.
fn by_priority(a: &Candidate, b: &Candidate) -> Ordering {
    b.priority_level.cmp(&a.priority_level).then(by_age(a, b))
}

/// Returns the id of the ticket to call next, or `None` for an empty pool.
pub fn select_next(pool: &[Candidate], window: i32) -> Option<i64> {
    let urgent = pool
        .iter()
        .filter(|c| c.priority_level >= URGENT_PRIORITY)
        .min_by(|a, b| by_age(a, b));
    if let Some(winner) = urgent {
        return Some(winner.id);
    }

    let mut rest: Vec<&Candidate> = pool
        .iter()
        .filter(|c| c.priority_level < URGENT_PRIORITY)
        .collect();
    if rest.is_empty() {
        return None;
    }

    if window <= 1 {
        return rest
            .iter()
            .min_by(|a, b| by_priority(a, b))
            .map(|c| c.id);
    }

    let highest = rest
        .iter()
        .copied()
        .min_by(|a, b| by_priority(a, b))?;

    rest.sort_by(|a, b| by_age(a, b));
    let in_window = &rest[..rest.len().min(window as usize)];

    if in_window.iter().any(|c| c.id == highest.id) {
        // The most urgent ticket is already among the oldest N: let priority
        // decide inside the window.
        in_window
            .iter()
            .min_by(|a, b| by_priority(a, b))
            .map(|c| c.id)
    } else {
        // The global maximum is newer than the whole window; it still wins.
        Some(highest.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 10, 9, minute, 0).unwrap()
    }

    fn ticket(id: i64, priority: i32, minute: u32) -> Candidate {
        Candidate {
            id,
            priority_level: priority,
            created_at: at(minute),
            requeued_at: None,
        }
    }

    #[test]
    fn test_empty_pool() {
        assert_eq!(select_next(&[], 3), None);
    }

    #[test]
    fn test_urgent_always_preempts() {
        let pool = vec![ticket(1, 5, 0), ticket(2, 6, 30), ticket(3, 1, 5)];
        assert_eq!(select_next(&pool, 3), Some(2));
        // Window size is irrelevant for priority 6.
        assert_eq!(select_next(&pool, 1), Some(2));
    }

    #[test]
    fn test_oldest_urgent_wins_among_urgents() {
        let pool = vec![ticket(1, 6, 10), ticket(2, 6, 5), ticket(3, 6, 20)];
        assert_eq!(select_next(&pool, 3), Some(2));
    }

    #[test]
    fn test_no_alternation_picks_highest_priority() {
        let pool = vec![ticket(1, 2, 0), ticket(2, 4, 10), ticket(3, 4, 20)];
        // Window <= 1: priority first, age breaks the tie.
        assert_eq!(select_next(&pool, 1), Some(2));
        assert_eq!(select_next(&pool, 0), Some(2));
    }

    #[test]
    fn test_alternation_window_scenario() {
        // A(prio3), B(prio3), C(prio5), D(prio3) arrive in order, window 3.
        let a = ticket(1, 3, 0);
        let b = ticket(2, 3, 1);
        let c = ticket(3, 5, 2);
        let d = ticket(4, 3, 3);
        let pool = vec![a.clone(), b.clone(), c, d.clone()];
        // Oldest three are {A,B,C}; C has the highest priority inside.
        assert_eq!(select_next(&pool, 3), Some(3));
        // C served; {A,B,D} tie on priority, earliest (A) wins.
        let pool = vec![a, b, d];
        assert_eq!(select_next(&pool, 3), Some(1));
    }

    #[test]
    fn test_highest_outside_window_still_wins() {
        // Window of 2 holds only the two oldest prio-3 tickets; the newer
        // prio-5 ticket is the global maximum and is returned directly.
        let pool = vec![ticket(1, 3, 0), ticket(2, 3, 1), ticket(3, 5, 30)];
        assert_eq!(select_next(&pool, 2), Some(3));
    }

    #[test]
    fn test_equal_priority_falls_back_to_fifo() {
        let pool = vec![ticket(5, 2, 10), ticket(6, 2, 0), ticket(7, 2, 20)];
        assert_eq!(select_next(&pool, 3), Some(6));
    }

    #[test]
    fn test_id_breaks_exact_timestamp_tie() {
        let pool = vec![ticket(9, 2, 0), ticket(4, 2, 0)];
        assert_eq!(select_next(&pool, 3), Some(4));
    }

    #[test]
    fn test_reintegrated_ticket_sorts_by_requeue_time() {
        // Created 09:00, reintegrated 09:30; two tickets waiting since
        // 09:10 and 09:15 stay ahead of it.
        let mut returned = ticket(1, 3, 0);
        returned.requeued_at = Some(at(30));
        let pool = vec![returned, ticket(2, 3, 10), ticket(3, 3, 15)];
        assert_eq!(select_next(&pool, 5), Some(2));
    }

    #[test]
    fn test_bounded_overtaking() {
        // An old low-priority ticket inside the window is only overtaken by
        // higher-priority tickets that also fall inside the window.
        let old_low = ticket(1, 1, 0);
        let newer_high: Vec<Candidate> =
            (0..4i64).map(|i| ticket(10 + i, 4, 1 + i as u32)).collect();
        let mut pool = vec![old_low];
        pool.extend(newer_high);
        // Window 2: {old_low, first high}; the high one inside wins.
        assert_eq!(select_next(&pool, 2), Some(10));
        // Once the high-priority arrivals drain, the old ticket surfaces.
        let pool = vec![ticket(1, 1, 0), ticket(20, 1, 4)];
        assert_eq!(select_next(&pool, 2), Some(1));
    }
}
