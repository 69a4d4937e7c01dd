//! The per-email follow-up state machine. All transitions go through the
//! store, which owns the one-pending-per-email invariant; this layer decides
//! what should happen and treats lost races as success.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::crm_store::{SqliteCrmStore, StoreError};
use crate::task_queue::JobKind;

use super::adapters::{original_from_email, ContentGenerator, MailTransport};
use super::rules;
use super::types::{EngineError, FollowUp, FollowUpStatus};

/// Outcome of a scheduling attempt. `AlreadyScheduled` is the benign-race
/// result and callers must treat it as success, not an error.
#[derive(Debug, Clone)]
pub enum ScheduleOutcome {
    Created(FollowUp),
    AlreadyScheduled(FollowUp),
    NotDue,
}

pub struct FollowUpEngine<G, M> {
    store: Arc<SqliteCrmStore>,
    generator: G,
    mailer: M,
    threshold_days: i64,
}

impl<G: ContentGenerator, M: MailTransport> FollowUpEngine<G, M> {
    pub fn new(store: Arc<SqliteCrmStore>, generator: G, mailer: M, threshold_days: i64) -> Self {
        Self {
            store,
            generator,
            mailer,
            threshold_days,
        }
    }

    pub fn threshold_days(&self) -> i64 {
        self.threshold_days
    }

    /// Create a PENDING follow-up for a due email. Safe to call repeatedly
    /// and concurrently for the same email.
    pub fn schedule_follow_up(&self, email_id: Uuid) -> Result<ScheduleOutcome, EngineError> {
        let email = self
            .store
            .get_email(email_id)?
            .ok_or(EngineError::EmailNotFound(email_id))?;
        let has_active = self.store.email_has_active_follow_up(email.id)?;
        let now = Utc::now();

        if !rules::follow_up_due(&email, has_active, now, self.threshold_days) {
            if let Some(existing) = self.store.get_pending_follow_up(email.id)? {
                return Ok(ScheduleOutcome::AlreadyScheduled(existing));
            }
            return Ok(ScheduleOutcome::NotDue);
        }

        let follow_up = FollowUp {
            id: Uuid::new_v4(),
            email_id: email.id,
            client_id: email.client_id,
            content: None,
            status: FollowUpStatus::Pending,
            scheduled_at: now,
            created_at: now,
        };
        match self.store.create_follow_up(&follow_up) {
            Ok(()) => {
                info!("scheduled follow-up {} for email {}", follow_up.id, email.id);
                Ok(ScheduleOutcome::Created(follow_up))
            }
            Err(StoreError::Conflict) => {
                // A concurrent scheduler won the race; adopt its row.
                match self.store.get_pending_follow_up(email.id)? {
                    Some(existing) => Ok(ScheduleOutcome::AlreadyScheduled(existing)),
                    None => Ok(ScheduleOutcome::NotDue),
                }
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Generate (or regenerate) the draft for a pending follow-up. On
    /// generator failure the follow-up keeps its empty content and stays
    /// PENDING, so a retry is always safe.
    pub fn draft_content(&self, follow_up_id: Uuid) -> Result<FollowUp, EngineError> {
        let follow_up = self
            .store
            .get_follow_up(follow_up_id)?
            .ok_or(EngineError::FollowUpNotFound(follow_up_id))?;
        if follow_up.status != FollowUpStatus::Pending {
            return Err(EngineError::NotPending(follow_up_id));
        }
        let email = self
            .store
            .get_email(follow_up.email_id)?
            .ok_or(EngineError::EmailNotFound(follow_up.email_id))?;

        let draft = self
            .generator
            .draft_follow_up(&original_from_email(&email))?;
        self.store.update_follow_up_content(follow_up_id, &draft)?;
        debug!("drafted content for follow-up {follow_up_id}");
        Ok(FollowUp {
            content: Some(draft),
            ..follow_up
        })
    }

    /// Dispatch a drafted follow-up as `Re: <original subject>`. Transport
    /// failure leaves the follow-up PENDING for a later retry.
    pub fn send_follow_up(&self, follow_up_id: Uuid) -> Result<FollowUp, EngineError> {
        let follow_up = self
            .store
            .get_follow_up(follow_up_id)?
            .ok_or(EngineError::FollowUpNotFound(follow_up_id))?;
        if follow_up.status != FollowUpStatus::Pending {
            return Err(EngineError::NotPending(follow_up_id));
        }
        if !follow_up.has_content() {
            return Err(EngineError::EmptyContent(follow_up_id));
        }
        let email = self
            .store
            .get_email(follow_up.email_id)?
            .ok_or(EngineError::EmailNotFound(follow_up.email_id))?;

        let subject = format!("Re: {}", email.subject);
        let content = follow_up.content.as_deref().unwrap_or_default();
        let outcome = self.mailer.send(&email.recipient, &subject, content)?;
        info!(
            "sent follow-up {} for email {} as message {}",
            follow_up.id, email.id, outcome.message_id
        );

        if !self
            .store
            .update_follow_up_status(follow_up_id, FollowUpStatus::Sent)?
        {
            // Cancelled between send and record; the message is out either way.
            warn!("follow-up {follow_up_id} left PENDING state during send");
        }
        Ok(FollowUp {
            status: FollowUpStatus::Sent,
            ..follow_up
        })
    }

    /// Execute one queue job: confirm or create the schedule, then draft.
    /// Every non-error path is idempotent with respect to re-delivery.
    pub fn process_job(&self, job: &JobKind) -> Result<(), EngineError> {
        match job {
            JobKind::FollowUp { email_id } => {
                let follow_up = match self.schedule_follow_up(*email_id)? {
                    ScheduleOutcome::Created(follow_up) => follow_up,
                    ScheduleOutcome::AlreadyScheduled(follow_up) => {
                        debug!("follow-up already scheduled for email {email_id}");
                        follow_up
                    }
                    ScheduleOutcome::NotDue => {
                        debug!("email {email_id} no longer due; dropping job");
                        return Ok(());
                    }
                };
                if !follow_up.has_content() {
                    self.draft_content(follow_up.id)?;
                }
                Ok(())
            }
        }
    }

    /// Reply-detection polling: inspect the threads of emails still waiting
    /// on an answer and fold any unread reply into the lifecycle. Metadata
    /// polling carries no body, so this marks REPLIED and cancels pending
    /// follow-ups without drafting a chain reply; the ingestion endpoint
    /// handles full reconciliation when reply content is delivered.
    pub fn poll_replies(&self, limit: usize) -> Result<usize, EngineError> {
        let awaiting = self.store.find_emails_awaiting_reply(limit)?;
        let mut reconciled = 0;
        for email in awaiting {
            let Some(thread_id) = email.thread_id.as_deref() else {
                continue;
            };
            let unread = match self.mailer.list_unread_in_thread(thread_id) {
                Ok(unread) => unread,
                Err(err) => {
                    warn!("thread {thread_id} inspection failed: {err}");
                    continue;
                }
            };
            if unread.is_empty() {
                continue;
            }
            let application = self
                .store
                .apply_reply(email.id, Utc::now())?
                .ok_or(EngineError::EmailNotFound(email.id))?;
            if application.newly_replied {
                info!(
                    "detected reply on thread {thread_id}: email {} replied, {} follow-up(s) cancelled",
                    email.id, application.cancelled
                );
                reconciled += 1;
            }
        }
        Ok(reconciled)
    }

    pub(crate) fn store(&self) -> &SqliteCrmStore {
        &self.store
    }

    pub(crate) fn generator(&self) -> &G {
        &self.generator
    }
}
