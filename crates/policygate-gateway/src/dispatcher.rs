//! Orchestration dispatcher
//!
//! Side effects are queued on an outbox channel and executed by a background
//! worker, so the HTTP response never waits for them:
//! - Jobs run concurrently up to a configured limit; effects within a job run in order
//! - Each effect of a job runs independently; one failure does not stop the rest
//! - Failed effects are retried with backoff, then logged and counted
//! - Completed `(idempotency key, effect)` pairs are remembered and skipped on
//!   redelivery

use policygate_core::{DecisionRequest, Event};
use policygate_policy::RetryPolicy;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex, Semaphore};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::config::OrchestrationSettings;
use crate::effects::{Decision, EffectContext, EffectError, SideEffect};

/// Ordered effect lists for each decision
#[derive(Clone, Default)]
pub struct EffectPlan {
    /// Run, in order, after an allowed source-control event
    pub on_allowed: Vec<Arc<dyn SideEffect>>,

    /// Run, in order, after any denial
    pub on_denied: Vec<Arc<dyn SideEffect>>,
}

/// Worker tuning
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub queue_capacity: usize,
    pub effect_timeout: Duration,
    pub retry: RetryPolicy,
    pub dedupe_window: usize,
    pub max_concurrency: usize,
}

impl From<&OrchestrationSettings> for DispatchSettings {
    fn from(settings: &OrchestrationSettings) -> Self {
        Self {
            queue_capacity: settings.queue_capacity.max(1),
            effect_timeout: Duration::from_millis(settings.effect_timeout_ms),
            retry: RetryPolicy::new(
                settings.max_attempts,
                Duration::from_millis(settings.retry_backoff_ms),
            ),
            dedupe_window: settings.dedupe_window,
            max_concurrency: settings.max_concurrent_jobs.max(1),
        }
    }
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self::from(&OrchestrationSettings::default())
    }
}

/// Commands sent to the background worker
enum DispatchCommand {
    /// Run a job's effects
    Run(Box<DispatchJob>),

    /// Reply once everything queued before it has been processed
    Flush(oneshot::Sender<()>),

    /// Stop the worker
    Shutdown,
}

struct DispatchJob {
    context: EffectContext,
    effects: Vec<Arc<dyn SideEffect>>,
}

/// Queues side effects for the background worker
pub struct Dispatcher {
    sender: mpsc::Sender<DispatchCommand>,
    plan: EffectPlan,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    /// Start the background worker; must be called inside a tokio runtime
    pub fn spawn(plan: EffectPlan, settings: DispatchSettings) -> Self {
        let (sender, receiver) = mpsc::channel(settings.queue_capacity.max(1));
        let worker = tokio::spawn(run_worker(receiver, settings));

        Self {
            sender,
            plan,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Queue the allow-path notifications; registrations have none
    ///
    /// Returns the names of the effects queued.
    pub fn on_allowed(&self, event: &Event, request: &DecisionRequest, key: &str) -> Vec<String> {
        if !event.is_source_control() {
            return Vec::new();
        }

        let context = EffectContext {
            idempotency_key: key.to_string(),
            event_kind: event.kind(),
            decision: Decision::Allowed,
            request: request.clone(),
            reasons: Vec::new(),
        };
        self.enqueue(context, &self.plan.on_allowed)
    }

    /// Queue remediation for a denial
    ///
    /// Returns the names of the effects queued.
    pub fn on_denied(
        &self,
        event: &Event,
        request: &DecisionRequest,
        reasons: &[String],
        key: &str,
    ) -> Vec<String> {
        let context = EffectContext {
            idempotency_key: key.to_string(),
            event_kind: event.kind(),
            decision: Decision::Denied,
            request: request.clone(),
            reasons: reasons.to_vec(),
        };
        self.enqueue(context, &self.plan.on_denied)
    }

    fn enqueue(&self, context: EffectContext, candidates: &[Arc<dyn SideEffect>]) -> Vec<String> {
        let effects: Vec<Arc<dyn SideEffect>> = candidates
            .iter()
            .filter(|effect| effect.applies_to(&context))
            .cloned()
            .collect();

        if effects.is_empty() {
            return Vec::new();
        }

        let names: Vec<String> = effects.iter().map(|e| e.name().to_string()).collect();
        let key = context.idempotency_key.clone();
        let job = DispatchJob { context, effects };

        match self.sender.try_send(DispatchCommand::Run(Box::new(job))) {
            Ok(()) => {
                debug!(key = %key, effects = ?names, "Side effects queued");
                names
            }
            Err(e) => {
                error!(key = %key, effects = ?names, error = %e, "Failed to queue side effects");
                metrics::counter!("policygate_side_effects_total", "effect" => "all", "status" => "dropped")
                    .increment(names.len() as u64);
                Vec::new()
            }
        }
    }

    /// Wait until every job queued so far has finished
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.sender.send(DispatchCommand::Flush(tx)).await.is_err() {
            warn!("Dispatcher worker is gone, nothing to flush");
            return;
        }
        let _ = rx.await;
    }

    /// Drain queued jobs and stop the worker
    pub async fn shutdown(&self) {
        let _ = self.sender.send(DispatchCommand::Shutdown).await;
        if let Some(worker) = self.worker.lock().await.take() {
            if let Err(e) = worker.await {
                error!("Dispatcher worker failed: {}", e);
            }
        }
    }
}

/// Key shared by every effect of one inbound call
///
/// The sender's delivery id when present, so redeliveries collapse onto the
/// same key. Otherwise the call's own request id: separate calls are separate
/// events even when their payloads are identical.
pub fn idempotency_key(event: &Event, request_id: &Uuid) -> String {
    match event.delivery_id().filter(|d| !d.is_empty()) {
        Some(delivery) => delivery.to_string(),
        None => format!("request:{}", request_id),
    }
}

type EffectSlot = (String, &'static str);

/// Bounded memory of completed effects, plus those currently running
struct CompletedEffects {
    seen: HashSet<EffectSlot>,
    order: VecDeque<EffectSlot>,
    running: HashSet<EffectSlot>,
    capacity: usize,
}

impl CompletedEffects {
    fn new(capacity: usize) -> Self {
        Self {
            seen: HashSet::new(),
            order: VecDeque::new(),
            running: HashSet::new(),
            capacity,
        }
    }

    /// Reserve an effect for this key; false when it completed or is running
    fn claim(&mut self, key: &str, effect: &'static str) -> bool {
        let slot = (key.to_string(), effect);
        if self.seen.contains(&slot) || self.running.contains(&slot) {
            return false;
        }
        self.running.insert(slot);
        true
    }

    /// Give a claim back after a failure so a redelivery can try again
    fn release(&mut self, key: &str, effect: &'static str) {
        self.running.remove(&(key.to_string(), effect));
    }

    fn complete(&mut self, key: &str, effect: &'static str) {
        let slot = (key.to_string(), effect);
        self.running.remove(&slot);

        if self.capacity == 0 {
            return;
        }

        if self.seen.insert(slot.clone()) {
            self.order.push_back(slot);
        }

        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
    }
}

/// State owned by the background worker task
struct Worker {
    settings: Arc<DispatchSettings>,
    completed: Arc<Mutex<CompletedEffects>>,
    permits: Arc<Semaphore>,
    jobs: JoinSet<()>,
}

impl Worker {
    fn new(settings: DispatchSettings) -> Self {
        Self {
            completed: Arc::new(Mutex::new(CompletedEffects::new(settings.dedupe_window))),
            permits: Arc::new(Semaphore::new(settings.max_concurrency.max(1))),
            settings: Arc::new(settings),
            jobs: JoinSet::new(),
        }
    }

    /// Start a job once a concurrency slot is free
    async fn start(&mut self, job: DispatchJob) {
        while let Some(result) = self.jobs.try_join_next() {
            log_job_result(result);
        }

        let Ok(permit) = self.permits.clone().acquire_owned().await else {
            error!(key = %job.context.idempotency_key, "Dispatcher is closed, dropping job");
            return;
        };

        let settings = self.settings.clone();
        let completed = self.completed.clone();
        self.jobs.spawn(async move {
            run_job(job, &settings, &completed).await;
            drop(permit);
        });
    }

    /// Wait for every running job
    async fn drain(&mut self) {
        while let Some(result) = self.jobs.join_next().await {
            log_job_result(result);
        }
    }

    async fn handle(&mut self, command: DispatchCommand) {
        match command {
            DispatchCommand::Run(job) => self.start(*job).await,
            DispatchCommand::Flush(reply) => {
                self.drain().await;
                let _ = reply.send(());
            }
            DispatchCommand::Shutdown => {}
        }
    }
}

fn log_job_result(result: Result<(), JoinError>) {
    if let Err(e) = result {
        error!("Side-effect job panicked: {}", e);
    }
}

/// Background worker task
async fn run_worker(mut receiver: mpsc::Receiver<DispatchCommand>, settings: DispatchSettings) {
    let mut worker = Worker::new(settings);

    while let Some(command) = receiver.recv().await {
        if let DispatchCommand::Shutdown = command {
            debug!("Dispatcher worker shutting down");
            // Jobs queued behind the shutdown command still run
            receiver.close();
            while let Some(command) = receiver.recv().await {
                worker.handle(command).await;
            }
            break;
        }
        worker.handle(command).await;
    }

    worker.drain().await;
}

async fn run_job(job: DispatchJob, settings: &DispatchSettings, completed: &Mutex<CompletedEffects>) {
    let key = job.context.idempotency_key.as_str();

    for effect in &job.effects {
        let name = effect.name();

        let claimed = completed.lock().await.claim(key, name);
        if !claimed {
            debug!(key = %key, effect = name, "Effect already completed or running, skipping");
            metrics::counter!("policygate_side_effects_total", "effect" => name, "status" => "skipped")
                .increment(1);
            continue;
        }

        match run_with_retry(effect.as_ref(), &job.context, settings).await {
            Ok(()) => {
                completed.lock().await.complete(key, name);
                metrics::counter!("policygate_side_effects_total", "effect" => name, "status" => "ok")
                    .increment(1);
            }
            Err(e) => {
                completed.lock().await.release(key, name);
                error!(
                    key = %key,
                    effect = name,
                    action = %job.context.request.action,
                    actor = %job.context.request.actor,
                    resource = %job.context.request.resource_id(),
                    error = %e,
                    "Side effect failed"
                );
                metrics::counter!("policygate_side_effects_total", "effect" => name, "status" => "failed")
                    .increment(1);
            }
        }
    }
}

async fn run_with_retry(
    effect: &dyn SideEffect,
    context: &EffectContext,
    settings: &DispatchSettings,
) -> Result<(), EffectError> {
    let mut attempt = 1;

    loop {
        let result = match tokio::time::timeout(settings.effect_timeout, effect.run(context)).await {
            Ok(result) => result,
            Err(_) => Err(EffectError::Timeout),
        };

        match result {
            Ok(()) => return Ok(()),
            Err(e) if settings.retry.should_retry(attempt) => {
                let delay = settings.retry.backoff(attempt);
                warn!(
                    effect = effect.name(),
                    attempt,
                    error = %e,
                    delay_ms = delay.as_millis() as u64,
                    "Side effect failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use policygate_core::types::{WebhookPayload, WebhookRepository, WebhookSender};
    use policygate_core::{build, RegistrationEvent, SourceControlEvent};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    struct Counting {
        name: &'static str,
        runs: AtomicUsize,
        failures_left: AtomicUsize,
    }

    impl Counting {
        fn new(name: &'static str, failures: usize) -> Arc<Self> {
            Arc::new(Self {
                name,
                runs: AtomicUsize::new(0),
                failures_left: AtomicUsize::new(failures),
            })
        }

        fn runs(&self) -> usize {
            self.runs.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SideEffect for Counting {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn run(&self, _ctx: &EffectContext) -> Result<(), EffectError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(EffectError::Status(502));
            }
            Ok(())
        }
    }

    /// Waits for a release signal, only for one key
    struct Blocking {
        key: &'static str,
        release: Arc<Notify>,
    }

    #[async_trait]
    impl SideEffect for Blocking {
        fn name(&self) -> &'static str {
            "pr_comment"
        }

        fn applies_to(&self, ctx: &EffectContext) -> bool {
            ctx.idempotency_key == self.key
        }

        async fn run(&self, _ctx: &EffectContext) -> Result<(), EffectError> {
            self.release.notified().await;
            Ok(())
        }
    }

    fn effect(counting: &Arc<Counting>) -> Arc<dyn SideEffect> {
        counting.clone()
    }

    fn settings(max_attempts: u32) -> DispatchSettings {
        DispatchSettings {
            queue_capacity: 16,
            effect_timeout: Duration::from_secs(1),
            retry: RetryPolicy::new(max_attempts, Duration::from_millis(1)),
            dedupe_window: 64,
            max_concurrency: 4,
        }
    }

    fn push_event(delivery: Option<&str>) -> Event {
        Event::SourceControl(SourceControlEvent::new(
            Some("push".to_string()),
            delivery.map(str::to_string),
            WebhookPayload {
                action: None,
                sender: Some(WebhookSender {
                    login: Some("octocat".to_string()),
                }),
                repository: Some(WebhookRepository {
                    full_name: Some("org/repo".to_string()),
                }),
                pull_request: None,
            },
        ))
    }

    #[tokio::test]
    async fn test_allowed_runs_plan_in_order_once() {
        let index = Counting::new("index_refresh", 0);
        let notify = Counting::new("agent_notify", 0);
        let plan = EffectPlan {
            on_allowed: vec![effect(&index), effect(&notify)],
            on_denied: Vec::new(),
        };
        let dispatcher = Dispatcher::spawn(plan, settings(1));

        let event = push_event(Some("d-1"));
        let request = build(&event).unwrap();
        let queued = dispatcher.on_allowed(&event, &request, "d-1");
        dispatcher.flush().await;

        assert_eq!(queued, vec!["index_refresh", "agent_notify"]);
        assert_eq!(index.runs(), 1);
        assert_eq!(notify.runs(), 1);
    }

    #[tokio::test]
    async fn test_registration_allow_is_noop() {
        let index = Counting::new("index_refresh", 0);
        let plan = EffectPlan {
            on_allowed: vec![effect(&index)],
            on_denied: Vec::new(),
        };
        let dispatcher = Dispatcher::spawn(plan, settings(1));

        let event = Event::Registration(RegistrationEvent::new("alice", "t1"));
        let request = build(&event).unwrap();
        assert!(dispatcher.on_allowed(&event, &request, "request:1").is_empty());
        dispatcher.flush().await;
        assert_eq!(index.runs(), 0);
    }

    #[tokio::test]
    async fn test_failing_effect_does_not_stop_the_next() {
        let comment = Counting::new("pr_comment", usize::MAX);
        let audit = Counting::new("audit_record", 0);
        let plan = EffectPlan {
            on_allowed: Vec::new(),
            on_denied: vec![effect(&comment), effect(&audit)],
        };
        let dispatcher = Dispatcher::spawn(plan, settings(2));

        let event = push_event(Some("d-2"));
        let request = build(&event).unwrap();
        let queued = dispatcher.on_denied(&event, &request, &["no".to_string()], "d-2");
        dispatcher.flush().await;

        assert_eq!(queued, vec!["pr_comment", "audit_record"]);
        assert_eq!(comment.runs(), 2);
        assert_eq!(audit.runs(), 1);
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let audit = Counting::new("audit_record", 1);
        let plan = EffectPlan {
            on_allowed: Vec::new(),
            on_denied: vec![effect(&audit)],
        };
        let dispatcher = Dispatcher::spawn(plan, settings(3));

        let event = push_event(None);
        let request = build(&event).unwrap();
        dispatcher.on_denied(&event, &request, &[], "request:1");
        dispatcher.flush().await;

        assert_eq!(audit.runs(), 2);
    }

    #[tokio::test]
    async fn test_redelivery_is_deduplicated() {
        let index = Counting::new("index_refresh", 0);
        let plan = EffectPlan {
            on_allowed: vec![effect(&index)],
            on_denied: Vec::new(),
        };
        let dispatcher = Dispatcher::spawn(plan, settings(1));

        let event = push_event(Some("d-3"));
        let request = build(&event).unwrap();
        dispatcher.on_allowed(&event, &request, "d-3");
        dispatcher.on_allowed(&event, &request, "d-3");
        dispatcher.flush().await;

        assert_eq!(index.runs(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_drains_queue() {
        let audit = Counting::new("audit_record", 0);
        let plan = EffectPlan {
            on_allowed: Vec::new(),
            on_denied: vec![effect(&audit)],
        };
        let dispatcher = Dispatcher::spawn(plan, settings(1));

        for i in 0..5 {
            let delivery = format!("d-{}", i);
            let event = push_event(Some(&delivery));
            let request = build(&event).unwrap();
            dispatcher.on_denied(&event, &request, &[], &delivery);
        }
        dispatcher.shutdown().await;

        assert_eq!(audit.runs(), 5);
    }

    #[tokio::test]
    async fn test_slow_job_does_not_hold_back_others() {
        let release = Arc::new(Notify::new());
        let blocker: Arc<dyn SideEffect> = Arc::new(Blocking {
            key: "slow",
            release: release.clone(),
        });
        let audit = Counting::new("audit_record", 0);
        let plan = EffectPlan {
            on_allowed: Vec::new(),
            on_denied: vec![blocker, effect(&audit)],
        };
        let dispatcher = Dispatcher::spawn(plan, settings(1));

        let event = push_event(None);
        let request = build(&event).unwrap();
        dispatcher.on_denied(&event, &request, &[], "slow");
        dispatcher.on_denied(&event, &request, &[], "fast");

        tokio::time::timeout(Duration::from_millis(500), async {
            while audit.runs() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("second job should run while the first is blocked");
        assert_eq!(audit.runs(), 1);

        release.notify_one();
        dispatcher.flush().await;
        assert_eq!(audit.runs(), 2);
    }

    #[tokio::test]
    async fn test_repeated_calls_without_delivery_all_run() {
        let audit = Counting::new("audit_record", 0);
        let plan = EffectPlan {
            on_allowed: Vec::new(),
            on_denied: vec![effect(&audit)],
        };
        let dispatcher = Dispatcher::spawn(plan, settings(1));

        let event = Event::Registration(RegistrationEvent::new("alice", "t1"));
        let request = build(&event).unwrap();
        for _ in 0..3 {
            let key = idempotency_key(&event, &Uuid::new_v4());
            dispatcher.on_denied(&event, &request, &["quota exceeded".to_string()], &key);
        }
        dispatcher.flush().await;

        assert_eq!(audit.runs(), 3);
    }

    #[test]
    fn test_idempotency_key() {
        let request_id = Uuid::new_v4();

        let with_delivery = push_event(Some("abc-123"));
        assert_eq!(idempotency_key(&with_delivery, &request_id), "abc-123");

        let without = push_event(None);
        assert_eq!(
            idempotency_key(&without, &request_id),
            format!("request:{}", request_id)
        );
        assert_ne!(
            idempotency_key(&without, &request_id),
            idempotency_key(&without, &Uuid::new_v4())
        );
    }

    #[test]
    fn test_completed_effects_window() {
        let mut completed = CompletedEffects::new(2);
        for key in ["a", "b", "c"] {
            assert!(completed.claim(key, "audit_record"));
            completed.complete(key, "audit_record");
        }

        assert!(completed.claim("a", "audit_record"));
        assert!(!completed.claim("b", "audit_record"));
        assert!(!completed.claim("c", "audit_record"));
    }

    #[test]
    fn test_claim_blocks_running_until_released() {
        let mut completed = CompletedEffects::new(8);

        assert!(completed.claim("d-1", "pr_comment"));
        assert!(!completed.claim("d-1", "pr_comment"));

        completed.release("d-1", "pr_comment");
        assert!(completed.claim("d-1", "pr_comment"));
    }
}
