//! Capability seams for the two external collaborators. The engine is
//! generic over these traits so tests substitute fakes; the real
//! implementations delegate to the sibling modules.

use std::sync::Arc;

use ai_module::{GenerationClient, GenerationError, OriginalEmail, ReplyAnalysis};
use mail_module::{MailClient, MailError, SendOutcome, ThreadMessage};

use super::types::Email;

pub trait ContentGenerator: Send + Sync {
    fn draft_follow_up(&self, original: &OriginalEmail) -> Result<String, GenerationError>;
    fn analyze_reply(
        &self,
        original: &OriginalEmail,
        reply: &str,
    ) -> Result<ReplyAnalysis, GenerationError>;
    fn draft_chain_reply(
        &self,
        original: &OriginalEmail,
        reply: &str,
        analysis: &ReplyAnalysis,
    ) -> Result<String, GenerationError>;
}

pub trait MailTransport: Send + Sync {
    fn send(&self, to: &str, subject: &str, body: &str) -> Result<SendOutcome, MailError>;
    fn list_unread_in_thread(&self, thread_id: &str) -> Result<Vec<ThreadMessage>, MailError>;
}

impl ContentGenerator for GenerationClient {
    fn draft_follow_up(&self, original: &OriginalEmail) -> Result<String, GenerationError> {
        GenerationClient::draft_follow_up(self, original)
    }

    fn analyze_reply(
        &self,
        original: &OriginalEmail,
        reply: &str,
    ) -> Result<ReplyAnalysis, GenerationError> {
        GenerationClient::analyze_reply(self, original, reply)
    }

    fn draft_chain_reply(
        &self,
        original: &OriginalEmail,
        reply: &str,
        analysis: &ReplyAnalysis,
    ) -> Result<String, GenerationError> {
        GenerationClient::draft_chain_reply(self, original, reply, analysis)
    }
}

impl MailTransport for MailClient {
    fn send(&self, to: &str, subject: &str, body: &str) -> Result<SendOutcome, MailError> {
        MailClient::send(self, to, subject, body)
    }

    fn list_unread_in_thread(&self, thread_id: &str) -> Result<Vec<ThreadMessage>, MailError> {
        MailClient::list_unread_in_thread(self, thread_id)
    }
}

impl<T: ContentGenerator> ContentGenerator for Arc<T> {
    fn draft_follow_up(&self, original: &OriginalEmail) -> Result<String, GenerationError> {
        self.as_ref().draft_follow_up(original)
    }

    fn analyze_reply(
        &self,
        original: &OriginalEmail,
        reply: &str,
    ) -> Result<ReplyAnalysis, GenerationError> {
        self.as_ref().analyze_reply(original, reply)
    }

    fn draft_chain_reply(
        &self,
        original: &OriginalEmail,
        reply: &str,
        analysis: &ReplyAnalysis,
    ) -> Result<String, GenerationError> {
        self.as_ref().draft_chain_reply(original, reply, analysis)
    }
}

impl<T: MailTransport> MailTransport for Arc<T> {
    fn send(&self, to: &str, subject: &str, body: &str) -> Result<SendOutcome, MailError> {
        self.as_ref().send(to, subject, body)
    }

    fn list_unread_in_thread(&self, thread_id: &str) -> Result<Vec<ThreadMessage>, MailError> {
        self.as_ref().list_unread_in_thread(thread_id)
    }
}

pub(crate) fn original_from_email(email: &Email) -> OriginalEmail {
    OriginalEmail {
        subject: email.subject.clone(),
        body: email.body.clone(),
        recipient: email.recipient.clone(),
    }
}
