use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use ai_module::{GenerationError, OriginalEmail, Priority, ReplyAnalysis, Sentiment};
use chrono::{Duration, Utc};
use mail_module::{MailError, SendOutcome, ThreadMessage};
use tempfile::TempDir;
use uuid::Uuid;

use crate::crm_store::SqliteCrmStore;
use crate::task_queue::JobKind;

use super::adapters::{ContentGenerator, MailTransport};
use super::core::{FollowUpEngine, ScheduleOutcome};
use super::reconcile::ReplyEvent;
use super::types::{Client, ClientStatus, Email, EmailStatus, EngineError, FollowUpStatus};

#[derive(Default)]
struct FakeGenerator {
    fail_drafts: AtomicBool,
    needs_response: AtomicBool,
    draft_calls: AtomicUsize,
    chain_calls: AtomicUsize,
}

impl ContentGenerator for FakeGenerator {
    fn draft_follow_up(&self, original: &OriginalEmail) -> Result<String, GenerationError> {
        if self.fail_drafts.load(Ordering::SeqCst) {
            return Err(GenerationError::GenerationFailed(
                "generator offline".to_string(),
            ));
        }
        self.draft_calls.fetch_add(1, Ordering::SeqCst);
        Ok(format!("Following up on \"{}\".", original.subject))
    }

    fn analyze_reply(
        &self,
        _original: &OriginalEmail,
        _reply: &str,
    ) -> Result<ReplyAnalysis, GenerationError> {
        Ok(ReplyAnalysis {
            sentiment: Sentiment::Neutral,
            key_points: vec!["asked about pricing".to_string()],
            action_items: Vec::new(),
            needs_response: self.needs_response.load(Ordering::SeqCst),
            priority: Priority::Medium,
        })
    }

    fn draft_chain_reply(
        &self,
        original: &OriginalEmail,
        _reply: &str,
        _analysis: &ReplyAnalysis,
    ) -> Result<String, GenerationError> {
        self.chain_calls.fetch_add(1, Ordering::SeqCst);
        Ok(format!("Continuing the thread about {}.", original.subject))
    }
}

#[derive(Default)]
struct FakeMailer {
    fail_sends: AtomicBool,
    sent: Mutex<Vec<(String, String, String)>>,
    unread: Mutex<Vec<ThreadMessage>>,
}

impl MailTransport for FakeMailer {
    fn send(&self, to: &str, subject: &str, body: &str) -> Result<SendOutcome, MailError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(MailError::Api {
                status: 503,
                body: "transport down".to_string(),
            });
        }
        self.sent
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .push((to.to_string(), subject.to_string(), body.to_string()));
        Ok(SendOutcome {
            message_id: format!("msg-{}", Uuid::new_v4()),
            thread_id: Some("thread-1".to_string()),
        })
    }

    fn list_unread_in_thread(&self, _thread_id: &str) -> Result<Vec<ThreadMessage>, MailError> {
        Ok(self
            .unread
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .clone())
    }
}

type TestEngine = FollowUpEngine<Arc<FakeGenerator>, Arc<FakeMailer>>;

struct Harness {
    _temp: TempDir,
    store: Arc<SqliteCrmStore>,
    generator: Arc<FakeGenerator>,
    mailer: Arc<FakeMailer>,
    engine: Arc<TestEngine>,
}

fn harness() -> Harness {
    let temp = TempDir::new().expect("tempdir");
    let store = Arc::new(SqliteCrmStore::new(temp.path().join("crm.db")).expect("store"));
    let generator = Arc::new(FakeGenerator::default());
    let mailer = Arc::new(FakeMailer::default());
    let engine = Arc::new(FollowUpEngine::new(
        store.clone(),
        generator.clone(),
        mailer.clone(),
        6,
    ));
    Harness {
        _temp: temp,
        store,
        generator,
        mailer,
        engine,
    }
}

fn insert_sent_email(store: &SqliteCrmStore, days_ago: i64) -> Email {
    let sent_at = Utc::now() - Duration::days(days_ago);
    let email = Email {
        id: Uuid::new_v4(),
        client_id: None,
        recipient: "lead@acme.test".to_string(),
        subject: "Proposal".to_string(),
        body: "Here is our proposal.".to_string(),
        status: EmailStatus::Sent,
        thread_id: Some(format!("thread-{}", Uuid::new_v4())),
        sent_at: Some(sent_at),
        created_at: sent_at,
    };
    store.insert_email(&email).expect("insert email");
    email
}

fn insert_client(store: &SqliteCrmStore) -> Client {
    let now = Utc::now() - Duration::days(10);
    let client = Client {
        id: Uuid::new_v4(),
        company_name: "Acme".to_string(),
        lead_name: "Jordan Reyes".to_string(),
        email: "jordan@acme.test".to_string(),
        status: ClientStatus::Contacted,
        last_contact_date: now,
        next_follow_up: None,
        pipedrive_org_id: None,
        pipedrive_person_id: None,
        pipedrive_deal_id: None,
        created_at: now,
        updated_at: now,
    };
    store.insert_client(&client).expect("insert client");
    client
}

#[test]
fn scheduling_twice_yields_one_pending_follow_up() {
    let h = harness();
    let email = insert_sent_email(&h.store, 7);

    let first = h.engine.schedule_follow_up(email.id).expect("first");
    assert!(matches!(first, ScheduleOutcome::Created(_)));

    let second = h.engine.schedule_follow_up(email.id).expect("second");
    match second {
        ScheduleOutcome::AlreadyScheduled(follow_up) => {
            assert_eq!(follow_up.email_id, email.id);
        }
        other => panic!("expected already-scheduled, got {other:?}"),
    }

    let pending = h
        .store
        .list_follow_ups(Some(FollowUpStatus::Pending))
        .expect("list");
    assert_eq!(pending.len(), 1);
}

#[test]
fn concurrent_scheduling_creates_exactly_one_follow_up() {
    let h = harness();
    let email = insert_sent_email(&h.store, 7);

    let created = Arc::new(AtomicUsize::new(0));
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let engine = h.engine.clone();
            let created = created.clone();
            thread::spawn(move || {
                match engine.schedule_follow_up(email.id).expect("schedule") {
                    ScheduleOutcome::Created(_) => {
                        created.fetch_add(1, Ordering::SeqCst);
                    }
                    ScheduleOutcome::AlreadyScheduled(_) | ScheduleOutcome::NotDue => {}
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("thread join");
    }

    assert_eq!(created.load(Ordering::SeqCst), 1);
    let pending = h
        .store
        .list_follow_ups(Some(FollowUpStatus::Pending))
        .expect("list");
    assert_eq!(pending.len(), 1);
}

#[test]
fn fresh_or_unsent_emails_are_not_due() {
    let h = harness();
    let fresh = insert_sent_email(&h.store, 2);
    assert!(matches!(
        h.engine.schedule_follow_up(fresh.id).expect("fresh"),
        ScheduleOutcome::NotDue
    ));

    let mut draft = insert_sent_email(&h.store, 9);
    draft.status = EmailStatus::Draft;
    draft.id = Uuid::new_v4();
    draft.thread_id = None;
    h.store.insert_email(&draft).expect("draft email");
    assert!(matches!(
        h.engine.schedule_follow_up(draft.id).expect("draft"),
        ScheduleOutcome::NotDue
    ));
}

#[test]
fn draft_failure_keeps_follow_up_pending_and_retryable() {
    let h = harness();
    let email = insert_sent_email(&h.store, 7);
    let follow_up = match h.engine.schedule_follow_up(email.id).expect("schedule") {
        ScheduleOutcome::Created(follow_up) => follow_up,
        other => panic!("expected created, got {other:?}"),
    };

    h.generator.fail_drafts.store(true, Ordering::SeqCst);
    let err = h.engine.draft_content(follow_up.id).expect_err("fails");
    assert!(matches!(err, EngineError::Generation(_)));

    let stored = h
        .store
        .get_follow_up(follow_up.id)
        .expect("get")
        .expect("exists");
    assert_eq!(stored.status, FollowUpStatus::Pending);
    assert!(!stored.has_content());

    h.generator.fail_drafts.store(false, Ordering::SeqCst);
    let drafted = h.engine.draft_content(follow_up.id).expect("retry");
    assert!(drafted.has_content());
}

#[test]
fn process_job_is_idempotent_across_redelivery() {
    let h = harness();
    let email = insert_sent_email(&h.store, 7);
    let job = JobKind::FollowUp { email_id: email.id };

    h.engine.process_job(&job).expect("first delivery");
    h.engine.process_job(&job).expect("second delivery");

    let pending = h
        .store
        .list_follow_ups(Some(FollowUpStatus::Pending))
        .expect("list");
    assert_eq!(pending.len(), 1);
    assert!(pending[0].follow_up.has_content());
    // Redelivery found content in place and skipped regeneration.
    assert_eq!(h.generator.draft_calls.load(Ordering::SeqCst), 1);
}

#[test]
fn send_follow_up_transitions_and_uses_reply_subject() {
    let h = harness();
    let email = insert_sent_email(&h.store, 7);
    let follow_up = match h.engine.schedule_follow_up(email.id).expect("schedule") {
        ScheduleOutcome::Created(follow_up) => follow_up,
        other => panic!("expected created, got {other:?}"),
    };
    h.engine.draft_content(follow_up.id).expect("draft");

    let sent = h.engine.send_follow_up(follow_up.id).expect("send");
    assert_eq!(sent.status, FollowUpStatus::Sent);

    let deliveries = h
        .mailer
        .sent
        .lock()
        .unwrap_or_else(|poison| poison.into_inner())
        .clone();
    assert_eq!(deliveries.len(), 1);
    assert_eq!(deliveries[0].0, "lead@acme.test");
    assert_eq!(deliveries[0].1, "Re: Proposal");

    let err = h.engine.send_follow_up(follow_up.id).expect_err("terminal");
    assert!(matches!(err, EngineError::NotPending(_)));
}

#[test]
fn transport_failure_leaves_follow_up_pending() {
    let h = harness();
    let email = insert_sent_email(&h.store, 7);
    let follow_up = match h.engine.schedule_follow_up(email.id).expect("schedule") {
        ScheduleOutcome::Created(follow_up) => follow_up,
        other => panic!("expected created, got {other:?}"),
    };
    h.engine.draft_content(follow_up.id).expect("draft");

    h.mailer.fail_sends.store(true, Ordering::SeqCst);
    let err = h.engine.send_follow_up(follow_up.id).expect_err("transport");
    assert!(matches!(err, EngineError::Transport(_)));

    let stored = h
        .store
        .get_follow_up(follow_up.id)
        .expect("get")
        .expect("exists");
    assert_eq!(stored.status, FollowUpStatus::Pending);

    h.mailer.fail_sends.store(false, Ordering::SeqCst);
    h.engine.send_follow_up(follow_up.id).expect("retry sends");
}

#[test]
fn send_requires_drafted_content() {
    let h = harness();
    let email = insert_sent_email(&h.store, 7);
    let follow_up = match h.engine.schedule_follow_up(email.id).expect("schedule") {
        ScheduleOutcome::Created(follow_up) => follow_up,
        other => panic!("expected created, got {other:?}"),
    };

    let err = h.engine.send_follow_up(follow_up.id).expect_err("no content");
    assert!(matches!(err, EngineError::EmptyContent(_)));
}

fn reply_event(email: &Email) -> ReplyEvent {
    ReplyEvent {
        thread_id: email.thread_id.clone().expect("thread id"),
        message_id: Some("reply-msg-1".to_string()),
        content: "Thanks, tell me more about pricing.".to_string(),
        subject: email.subject.clone(),
    }
}

#[test]
fn reply_cancels_pending_without_chain_when_no_response_needed() {
    let h = harness();
    let email = insert_sent_email(&h.store, 7);
    h.engine.schedule_follow_up(email.id).expect("schedule");
    h.generator.needs_response.store(false, Ordering::SeqCst);

    let outcome = h
        .engine
        .reconcile_reply(&reply_event(&email))
        .expect("reconcile");

    assert_eq!(outcome.email.status, EmailStatus::Replied);
    assert_eq!(outcome.cancelled_follow_ups, 1);
    assert!(outcome.chain_reply.is_none());
    assert!(outcome.chain_follow_up.is_none());
    assert!(h
        .store
        .list_follow_ups(Some(FollowUpStatus::Pending))
        .expect("list")
        .is_empty());
}

#[test]
fn reply_needing_response_continues_the_chain() {
    let h = harness();
    let client = insert_client(&h.store);
    let mut email = insert_sent_email(&h.store, 7);
    email.client_id = Some(client.id);
    email.id = Uuid::new_v4();
    email.thread_id = Some("thread-chain".to_string());
    h.store.insert_email(&email).expect("email with client");
    h.engine.schedule_follow_up(email.id).expect("schedule");
    h.generator.needs_response.store(true, Ordering::SeqCst);

    let before = Utc::now();
    let outcome = h
        .engine
        .reconcile_reply(&reply_event(&email))
        .expect("reconcile");

    let chain = outcome.chain_reply.expect("chain reply");
    assert_eq!(chain.status, EmailStatus::Draft);
    assert_eq!(chain.thread_id, email.thread_id);
    assert_eq!(chain.recipient, email.recipient);

    let follow_up = outcome.chain_follow_up.expect("chain follow-up");
    assert_eq!(follow_up.email_id, chain.id);
    assert_eq!(follow_up.status, FollowUpStatus::Pending);
    let lower = before + Duration::days(6) - Duration::minutes(1);
    let upper = Utc::now() + Duration::days(6) + Duration::minutes(1);
    assert!(follow_up.scheduled_at >= lower && follow_up.scheduled_at <= upper);

    let stored_client = h
        .store
        .get_client(client.id)
        .expect("get client")
        .expect("exists");
    let next = stored_client.next_follow_up.expect("next follow-up set");
    assert!((next - follow_up.scheduled_at).num_milliseconds().abs() < 10);
    assert!(next >= stored_client.last_contact_date);
}

#[test]
fn reply_after_sent_follow_up_still_marks_replied() {
    let h = harness();
    let email = insert_sent_email(&h.store, 7);
    let follow_up = match h.engine.schedule_follow_up(email.id).expect("schedule") {
        ScheduleOutcome::Created(follow_up) => follow_up,
        other => panic!("expected created, got {other:?}"),
    };
    h.engine.draft_content(follow_up.id).expect("draft");
    h.engine.send_follow_up(follow_up.id).expect("send");
    h.generator.needs_response.store(false, Ordering::SeqCst);

    let outcome = h
        .engine
        .reconcile_reply(&reply_event(&email))
        .expect("reconcile");

    assert_eq!(outcome.email.status, EmailStatus::Replied);
    assert_eq!(outcome.cancelled_follow_ups, 0);
    let stored = h
        .store
        .get_follow_up(follow_up.id)
        .expect("get")
        .expect("exists");
    assert_eq!(stored.status, FollowUpStatus::Sent);
}

#[test]
fn redelivered_reply_does_not_duplicate_the_chain() {
    let h = harness();
    let email = insert_sent_email(&h.store, 7);
    h.generator.needs_response.store(true, Ordering::SeqCst);

    let first = h
        .engine
        .reconcile_reply(&reply_event(&email))
        .expect("first delivery");
    assert!(first.chain_reply.is_some());

    let second = h
        .engine
        .reconcile_reply(&reply_event(&email))
        .expect("second delivery");
    assert!(second.chain_reply.is_none());
    assert!(second.chain_follow_up.is_none());

    assert_eq!(h.generator.chain_calls.load(Ordering::SeqCst), 1);
    let pending = h
        .store
        .list_follow_ups(Some(FollowUpStatus::Pending))
        .expect("list");
    assert_eq!(pending.len(), 1);
}

#[test]
fn reply_poll_marks_replied_and_cancels_pending() {
    let h = harness();
    let email = insert_sent_email(&h.store, 7);
    h.engine.schedule_follow_up(email.id).expect("schedule");

    assert_eq!(h.engine.poll_replies(50).expect("quiet poll"), 0);

    *h.mailer
        .unread
        .lock()
        .unwrap_or_else(|poison| poison.into_inner()) = vec![ThreadMessage {
        message_id: "reply-1".to_string(),
        from: Some("lead@acme.test".to_string()),
        subject: Some("Re: Proposal".to_string()),
        internal_date: None,
    }];

    assert_eq!(h.engine.poll_replies(50).expect("poll"), 1);
    let stored = h.store.get_email(email.id).expect("get").expect("exists");
    assert_eq!(stored.status, EmailStatus::Replied);
    assert!(h
        .store
        .list_follow_ups(Some(FollowUpStatus::Pending))
        .expect("pending")
        .is_empty());

    // The thread is settled; the next poll has nothing to inspect.
    assert_eq!(h.engine.poll_replies(50).expect("final poll"), 0);
}

#[test]
fn reconcile_unknown_thread_is_an_error() {
    let h = harness();
    let event = ReplyEvent {
        thread_id: "no-such-thread".to_string(),
        message_id: None,
        content: "hello".to_string(),
        subject: "hello".to_string(),
    };
    let err = h.engine.reconcile_reply(&event).expect_err("unknown thread");
    assert!(matches!(err, EngineError::ThreadNotFound(_)));
}
