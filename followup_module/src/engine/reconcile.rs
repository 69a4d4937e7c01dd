//! Reply reconciliation: fold an inbound reply back into the lifecycle.
//!
//! Cancelling and status flipping happen in one store transaction; chain
//! replies are keyed off the SENT -> REPLIED transition so a re-delivered
//! webhook cannot create a second draft.

use ai_module::ReplyAnalysis;
use chrono::Utc;
use serde::Deserialize;
use tracing::{debug, info};
use uuid::Uuid;

use crate::crm_store::StoreError;

use super::adapters::{original_from_email, ContentGenerator, MailTransport};
use super::core::FollowUpEngine;
use super::rules;
use super::types::{Email, EmailStatus, EngineError, FollowUp, FollowUpStatus};

/// An inbound reply as delivered by the ingestion endpoint or poller.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyEvent {
    pub thread_id: String,
    pub message_id: Option<String>,
    pub content: String,
    pub subject: String,
}

#[derive(Debug, Clone)]
pub struct ReconcileOutcome {
    pub email: Email,
    pub analysis: ReplyAnalysis,
    pub cancelled_follow_ups: usize,
    pub chain_reply: Option<Email>,
    pub chain_follow_up: Option<FollowUp>,
}

impl<G: ContentGenerator, M: MailTransport> FollowUpEngine<G, M> {
    pub fn reconcile_reply(&self, event: &ReplyEvent) -> Result<ReconcileOutcome, EngineError> {
        let original = self
            .store()
            .find_email_by_thread(&event.thread_id)?
            .ok_or_else(|| EngineError::ThreadNotFound(event.thread_id.clone()))?;
        let context = original_from_email(&original);
        let analysis = self.generator().analyze_reply(&context, &event.content)?;

        let now = Utc::now();
        let application = self
            .store()
            .apply_reply(original.id, now)?
            .ok_or(EngineError::EmailNotFound(original.id))?;
        info!(
            "reconciled reply on thread {}: email {} replied, {} follow-up(s) cancelled",
            event.thread_id, original.id, application.cancelled
        );

        let mut chain_reply = None;
        let mut chain_follow_up = None;
        if application.newly_replied && analysis.needs_response {
            let draft =
                self.generator()
                    .draft_chain_reply(&context, &event.content, &analysis)?;
            let scheduled_at = rules::next_follow_up_after(now, self.threshold_days());

            let email = Email {
                id: Uuid::new_v4(),
                client_id: original.client_id,
                recipient: original.recipient.clone(),
                subject: format!("Re: {}", event.subject),
                body: draft.clone(),
                status: EmailStatus::Draft,
                thread_id: original.thread_id.clone(),
                sent_at: None,
                created_at: now,
            };
            self.store().insert_email(&email)?;

            let follow_up = FollowUp {
                id: Uuid::new_v4(),
                email_id: email.id,
                client_id: original.client_id,
                content: Some(draft),
                status: FollowUpStatus::Pending,
                scheduled_at,
                created_at: now,
            };
            match self.store().create_follow_up(&follow_up) {
                Ok(()) => chain_follow_up = Some(follow_up),
                Err(StoreError::Conflict) => {
                    debug!("chain follow-up already present for email {}", email.id);
                }
                Err(err) => return Err(err.into()),
            }

            if let Some(client_id) = original.client_id {
                self.store()
                    .record_client_contact(client_id, now, Some(scheduled_at))?;
            }
            chain_reply = Some(email);
        }

        let email = self
            .store()
            .get_email(original.id)?
            .ok_or(EngineError::EmailNotFound(original.id))?;
        Ok(ReconcileOutcome {
            email,
            analysis,
            cancelled_follow_ups: application.cancelled,
            chain_reply,
            chain_follow_up,
        })
    }
}
