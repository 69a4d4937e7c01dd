//! The periodic drivers: scan-and-enqueue, drain-and-execute, and
//! reply-detection polling. They run on independent threads with a shared
//! stop flag so a slow or failing cycle on one side never blocks the
//! others. The cron endpoint reuses `run_scan_cycle` and `drain_queue` for
//! its one-shot pass.

use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info};

use crate::crm_store::{SqliteCrmStore, StoreError};
use crate::engine::adapters::{ContentGenerator, MailTransport};
use crate::engine::core::FollowUpEngine;
use crate::task_queue::{JobKind, TaskQueue};

use super::config::ServiceConfig;

pub(super) struct SchedulerControl {
    stop: Arc<AtomicBool>,
    handles: Vec<thread::JoinHandle<()>>,
}

impl SchedulerControl {
    pub(super) fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    pub(super) fn stop_and_join(&mut self) {
        self.stop();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanSummary {
    pub due: usize,
    pub enqueued: usize,
    pub escalated_clients: usize,
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DrainSummary {
    pub processed: usize,
    pub failed: usize,
}

pub(super) fn start_scheduler_threads<G, M>(
    config: Arc<ServiceConfig>,
    store: Arc<SqliteCrmStore>,
    queue: Arc<crate::task_queue::SqliteTaskQueue>,
    engine: Arc<FollowUpEngine<G, M>>,
) -> SchedulerControl
where
    G: ContentGenerator + 'static,
    M: MailTransport + 'static,
{
    let stop = Arc::new(AtomicBool::new(false));
    let mut handles = Vec::with_capacity(3);

    {
        let config = config.clone();
        let store = store.clone();
        let queue = queue.clone();
        let stop = stop.clone();
        let handle = thread::spawn(move || {
            let mut next_scan = match next_run_after(&config.scan_cron, Utc::now()) {
                Ok(at) => at,
                Err(err) => {
                    error!("scan schedule unusable ({}): {err}", config.scan_cron);
                    return;
                }
            };
            info!("first follow-up scan at {next_scan}");
            while !stop.load(Ordering::Relaxed) {
                let now = Utc::now();
                if now >= next_scan {
                    match run_scan_cycle(
                        &store,
                        &*queue,
                        config.follow_up_threshold_days,
                        config.scan_batch_limit,
                    ) {
                        Ok(summary) => info!(
                            "scan cycle: {} due, {} enqueued, {} client(s) escalated",
                            summary.due, summary.enqueued, summary.escalated_clients
                        ),
                        Err(err) => error!("scan cycle failed: {err}"),
                    }
                    next_scan = match next_run_after(&config.scan_cron, Utc::now()) {
                        Ok(at) => at,
                        Err(err) => {
                            error!("scan schedule exhausted: {err}");
                            break;
                        }
                    };
                }
                if stop_flag_wait(&stop, config.scheduler_poll_interval) {
                    break;
                }
            }
        });
        handles.push(handle);
    }

    {
        let config = config.clone();
        let engine = engine.clone();
        let stop = stop.clone();
        let handle = thread::spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                let summary = drain_queue(&*queue, &engine, config.drain_batch_limit);
                if summary.processed > 0 || summary.failed > 0 {
                    info!(
                        "drain cycle: {} processed, {} failed",
                        summary.processed, summary.failed
                    );
                }
                if stop_flag_wait(&stop, config.drain_poll_interval) {
                    break;
                }
            }
        });
        handles.push(handle);
    }

    {
        let stop = stop.clone();
        let handle = thread::spawn(move || {
            while !stop_flag_wait(&stop, config.reply_poll_interval) {
                match engine.poll_replies(config.scan_batch_limit) {
                    Ok(0) => {}
                    Ok(reconciled) => info!("reply poll: {reconciled} email(s) replied"),
                    Err(err) => error!("reply poll failed: {err}"),
                }
            }
        });
        handles.push(handle);
    }

    SchedulerControl { stop, handles }
}

/// Sleep in small slices so shutdown is not held up by a long poll
/// interval. Returns true once the stop flag is set.
fn stop_flag_wait(stop: &AtomicBool, interval: std::time::Duration) -> bool {
    let slice = std::time::Duration::from_secs(1);
    let mut waited = std::time::Duration::ZERO;
    while waited < interval {
        if stop.load(Ordering::Relaxed) {
            return true;
        }
        let step = slice.min(interval - waited);
        thread::sleep(step);
        waited += step;
    }
    stop.load(Ordering::Relaxed)
}

/// One scan-and-enqueue pass. Safe to run concurrently with itself: job
/// execution is idempotent and the queue dedupes by email.
pub fn run_scan_cycle(
    store: &SqliteCrmStore,
    queue: &dyn TaskQueue,
    threshold_days: i64,
    limit: usize,
) -> Result<ScanSummary, StoreError> {
    let now = Utc::now();
    let escalated_clients = match store.escalate_due_clients(now) {
        Ok(count) => count,
        Err(err) => {
            error!("client escalation failed: {err}");
            0
        }
    };

    let due = store.find_emails_due_for_follow_up(threshold_days, now, limit)?;
    let mut enqueued = 0;
    for email in &due {
        let job = JobKind::FollowUp { email_id: email.id };
        match queue.enqueue(&job) {
            Ok(result) if result.inserted => enqueued += 1,
            Ok(_) => debug!("follow-up job for email {} already queued", email.id),
            Err(err) => error!("failed to enqueue follow-up for email {}: {err}", email.id),
        }
    }

    Ok(ScanSummary {
        due: due.len(),
        enqueued,
        escalated_clients,
    })
}

/// Pop-until-empty-or-budget execution. A failing job is recorded against
/// the queue's retry budget and never stops the pass.
pub fn drain_queue<G, M>(
    queue: &dyn TaskQueue,
    engine: &FollowUpEngine<G, M>,
    budget: usize,
) -> DrainSummary
where
    G: ContentGenerator,
    M: MailTransport,
{
    let mut processed = 0;
    let mut failed = 0;
    for _ in 0..budget {
        let claimed = match queue.claim_next() {
            Ok(Some(claimed)) => claimed,
            Ok(None) => break,
            Err(err) => {
                error!("queue claim failed: {err}");
                break;
            }
        };

        match engine.process_job(&claimed.job) {
            Ok(()) => {
                if let Err(err) = queue.mark_done(claimed.id) {
                    error!("failed to ack job {}: {err}", claimed.id);
                }
                processed += 1;
            }
            Err(err) => {
                error!(
                    "job {} ({}) failed on attempt {}: {err}",
                    claimed.id,
                    claimed.job.label(),
                    claimed.attempts
                );
                if let Err(err) = queue.mark_failed(claimed.id, &err.to_string()) {
                    error!("failed to record job failure {}: {err}", claimed.id);
                }
                failed += 1;
            }
        }
    }
    DrainSummary { processed, failed }
}

fn next_run_after(expression: &str, after: DateTime<Utc>) -> Result<DateTime<Utc>, super::BoxError> {
    let schedule = cron::Schedule::from_str(expression)?;
    schedule
        .after(&after)
        .next()
        .ok_or_else(|| "no next run available for cron expression".into())
}
