//! Pure decision predicates for the follow-up lifecycle. No I/O here; the
//! store's due-email scan mirrors `follow_up_due` in SQL.

use chrono::{DateTime, Duration, Utc};

use super::types::{Email, EmailStatus};

/// Default elapsed time after sending before a follow-up becomes due.
pub const DEFAULT_THRESHOLD_DAYS: i64 = 6;

/// An email is due for a follow-up iff it was sent, the threshold has fully
/// elapsed since `sent_at`, and no follow-up for it is PENDING or SENT.
///
/// The boundary is inclusive: exactly `threshold_days` elapsed is due.
pub fn follow_up_due(
    email: &Email,
    has_active_follow_up: bool,
    now: DateTime<Utc>,
    threshold_days: i64,
) -> bool {
    if email.status != EmailStatus::Sent || has_active_follow_up {
        return false;
    }
    match email.sent_at {
        Some(sent_at) => now - sent_at >= Duration::days(threshold_days),
        None => false,
    }
}

/// When the next follow-up for a contact becomes due, counted from the
/// moment of contact.
pub fn next_follow_up_after(contacted_at: DateTime<Utc>, threshold_days: i64) -> DateTime<Utc> {
    contacted_at + Duration::days(threshold_days)
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use uuid::Uuid;

    use super::*;
    use crate::engine::types::Email;

    fn sent_email(sent_ago: Duration, now: DateTime<Utc>) -> Email {
        Email {
            id: Uuid::new_v4(),
            client_id: None,
            recipient: "lead@acme.test".to_string(),
            subject: "Proposal".to_string(),
            body: "Hello".to_string(),
            status: EmailStatus::Sent,
            thread_id: None,
            sent_at: Some(now - sent_ago),
            created_at: now - sent_ago,
        }
    }

    #[test]
    fn due_exactly_at_threshold() {
        let now = Utc::now();
        let email = sent_email(Duration::days(6), now);
        assert!(follow_up_due(&email, false, now, 6));
    }

    #[test]
    fn not_due_one_hour_before_threshold() {
        let now = Utc::now();
        let email = sent_email(Duration::days(6) - Duration::hours(1), now);
        assert!(!follow_up_due(&email, false, now, 6));
    }

    #[test]
    fn active_follow_up_suppresses_due() {
        let now = Utc::now();
        let email = sent_email(Duration::days(10), now);
        assert!(!follow_up_due(&email, true, now, 6));
    }

    #[test]
    fn non_sent_statuses_are_never_due() {
        let now = Utc::now();
        for status in [EmailStatus::Draft, EmailStatus::Replied, EmailStatus::Failed] {
            let mut email = sent_email(Duration::days(10), now);
            email.status = status;
            assert!(!follow_up_due(&email, false, now, 6), "{status} was due");
        }
    }

    #[test]
    fn unsent_timestamp_is_never_due() {
        let now = Utc::now();
        let mut email = sent_email(Duration::days(10), now);
        email.sent_at = None;
        assert!(!follow_up_due(&email, false, now, 6));
    }
}
