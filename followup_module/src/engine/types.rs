use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::crm_store::StoreError;

/// Pipeline stage of a CRM client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientStatus {
    New,
    Contacted,
    ProposalSent,
    Negotiating,
    Closed,
    Lost,
}

impl ClientStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ClientStatus::New => "NEW",
            ClientStatus::Contacted => "CONTACTED",
            ClientStatus::ProposalSent => "PROPOSAL_SENT",
            ClientStatus::Negotiating => "NEGOTIATING",
            ClientStatus::Closed => "CLOSED",
            ClientStatus::Lost => "LOST",
        }
    }
}

impl fmt::Display for ClientStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ClientStatus {
    type Err = StatusParseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "NEW" => Ok(ClientStatus::New),
            "CONTACTED" => Ok(ClientStatus::Contacted),
            "PROPOSAL_SENT" => Ok(ClientStatus::ProposalSent),
            "NEGOTIATING" => Ok(ClientStatus::Negotiating),
            "CLOSED" => Ok(ClientStatus::Closed),
            "LOST" => Ok(ClientStatus::Lost),
            other => Err(StatusParseError::new("client status", other)),
        }
    }
}

/// Lifecycle state of an outbound email.
///
/// Transitions are monotonic along `DRAFT -> SENT -> {REPLIED | FAILED}`;
/// the store refuses anything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EmailStatus {
    Draft,
    Sent,
    Replied,
    Failed,
}

impl EmailStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            EmailStatus::Draft => "DRAFT",
            EmailStatus::Sent => "SENT",
            EmailStatus::Replied => "REPLIED",
            EmailStatus::Failed => "FAILED",
        }
    }

    pub fn can_become(self, next: EmailStatus) -> bool {
        matches!(
            (self, next),
            (EmailStatus::Draft, EmailStatus::Sent)
                | (EmailStatus::Sent, EmailStatus::Replied)
                | (EmailStatus::Sent, EmailStatus::Failed)
        )
    }
}

impl fmt::Display for EmailStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EmailStatus {
    type Err = StatusParseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "DRAFT" => Ok(EmailStatus::Draft),
            "SENT" => Ok(EmailStatus::Sent),
            "REPLIED" => Ok(EmailStatus::Replied),
            "FAILED" => Ok(EmailStatus::Failed),
            other => Err(StatusParseError::new("email status", other)),
        }
    }
}

/// State of a single follow-up attempt. SENT and CANCELLED are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FollowUpStatus {
    Pending,
    Sent,
    Cancelled,
}

impl FollowUpStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            FollowUpStatus::Pending => "PENDING",
            FollowUpStatus::Sent => "SENT",
            FollowUpStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, FollowUpStatus::Sent | FollowUpStatus::Cancelled)
    }
}

impl fmt::Display for FollowUpStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FollowUpStatus {
    type Err = StatusParseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "PENDING" => Ok(FollowUpStatus::Pending),
            "SENT" => Ok(FollowUpStatus::Sent),
            "CANCELLED" => Ok(FollowUpStatus::Cancelled),
            other => Err(StatusParseError::new("follow-up status", other)),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown {kind}: {value}")]
pub struct StatusParseError {
    kind: &'static str,
    value: String,
}

impl StatusParseError {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

/// A CRM contact. Deletion is administrative; the engine never removes one.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Client {
    pub id: Uuid,
    pub company_name: String,
    pub lead_name: String,
    pub email: String,
    pub status: ClientStatus,
    pub last_contact_date: DateTime<Utc>,
    /// When set, must be >= `last_contact_date`.
    pub next_follow_up: Option<DateTime<Utc>>,
    pub pipedrive_org_id: Option<i64>,
    pub pipedrive_person_id: Option<i64>,
    pub pipedrive_deal_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One outbound message. Retained indefinitely as the audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Email {
    pub id: Uuid,
    /// Weak reference: the client may predate or outlive any email, and
    /// follow-up scheduling works without one.
    pub client_id: Option<Uuid>,
    pub recipient: String,
    pub subject: String,
    pub body: String,
    pub status: EmailStatus,
    pub thread_id: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// A scheduled or drafted follow-up attempt for exactly one email.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FollowUp {
    pub id: Uuid,
    pub email_id: Uuid,
    pub client_id: Option<Uuid>,
    /// Empty until drafted; regeneration replaces it.
    pub content: Option<String>,
    pub status: FollowUpStatus,
    pub scheduled_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl FollowUp {
    pub fn has_content(&self) -> bool {
        self.content
            .as_deref()
            .map(|content| !content.trim().is_empty())
            .unwrap_or(false)
    }
}

/// Follow-up joined with its email and (when linked) client, as served by
/// the collection endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FollowUpDetails {
    #[serde(flatten)]
    pub follow_up: FollowUp,
    pub email: Email,
    pub client: Option<Client>,
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("generation error: {0}")]
    Generation(#[from] ai_module::GenerationError),
    #[error("mail transport error: {0}")]
    Transport(#[from] mail_module::MailError),
    #[error("email {0} not found")]
    EmailNotFound(Uuid),
    #[error("follow-up {0} not found")]
    FollowUpNotFound(Uuid),
    #[error("no email found for thread {0}")]
    ThreadNotFound(String),
    #[error("follow-up {0} is not pending")]
    NotPending(Uuid),
    #[error("follow-up {0} has no drafted content")]
    EmptyContent(Uuid),
}
