use std::sync::Arc;

use ai_module::GenerationClient;
use mail_module::MailClient;

use crate::crm_store::SqliteCrmStore;
use crate::engine::core::FollowUpEngine;
use crate::task_queue::SqliteTaskQueue;

use super::config::ServiceConfig;

/// The engine as wired in production: real generator, real transport.
pub type ServiceEngine = FollowUpEngine<Arc<GenerationClient>, Arc<MailClient>>;

#[derive(Clone)]
pub(super) struct AppState {
    pub(super) config: Arc<ServiceConfig>,
    pub(super) store: Arc<SqliteCrmStore>,
    pub(super) queue: Arc<SqliteTaskQueue>,
    pub(super) engine: Arc<ServiceEngine>,
    pub(super) mailer: Arc<MailClient>,
}
