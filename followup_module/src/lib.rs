pub mod crm_store;
pub mod service;
pub mod task_queue;

mod engine;

pub use engine::adapters::{ContentGenerator, MailTransport};
pub use engine::core::{FollowUpEngine, ScheduleOutcome};
pub use engine::reconcile::{ReconcileOutcome, ReplyEvent};
pub use engine::rules;
pub use engine::types::{
    Client, ClientStatus, Email, EmailStatus, EngineError, FollowUp, FollowUpDetails,
    FollowUpStatus, StatusParseError,
};
