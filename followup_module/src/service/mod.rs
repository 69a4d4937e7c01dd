mod analytics;
mod clients;
mod config;
mod cron;
mod emails;
mod error;
mod follow_ups;
mod replies;
mod scheduler;
mod server;
mod state;

pub(crate) type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub use config::ServiceConfig;
pub use scheduler::{drain_queue, run_scan_cycle, DrainSummary, ScanSummary};
pub use server::run_server;
pub use state::ServiceEngine;
