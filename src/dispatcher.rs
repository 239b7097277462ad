//! Poll loop: fetch, schedule, execute, acknowledge.
//!
//! Every command that is executed or rejected yields exactly one ack. Commands
//! whose `execute_at` lies in the future wait in a local queue; a re-delivered
//! command that already ran gets its cached ack again instead of a second run.

use crate::actions::{Action, ValidationError, validate};
use crate::config::{DispatchConfig, NmsConfig};
use crate::context::AgentContext;
use crate::executor::Executor;
use crate::nms::{AckResult, Command, NmsApi};
use crate::process::{Slot, StopOutcome, StopRequest};
use chrono::{DateTime, Local};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Grace for slots stopped after a handler timeout.
const TIMEOUT_STOP_GRACE: Duration = Duration::from_secs(1);

/// Bounded id -> ack map, oldest evicted first.
#[derive(Debug)]
struct CompletedCache {
    order: VecDeque<String>,
    acks: HashMap<String, AckResult>,
    capacity: usize,
}

impl CompletedCache {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            acks: HashMap::new(),
            capacity: capacity.max(1),
        }
    }

    fn get(&self, id: &str) -> Option<&AckResult> {
        self.acks.get(id)
    }

    fn insert(&mut self, ack: AckResult) {
        let id = ack.command_id.clone();
        if self.acks.insert(id.clone(), ack).is_none() {
            self.order.push_back(id);
        }
        while self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.acks.remove(&old);
            }
        }
    }
}

/// What one [`Dispatcher::tick_at`] did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub poll_ok: bool,
    /// New commands accepted into the queue.
    pub accepted: usize,
    /// Handlers run (including rejected commands acked without running).
    pub executed: usize,
    /// Cached acks re-sent for re-delivered commands.
    pub resent: usize,
    /// Commands still waiting for their `execute_at`.
    pub deferred: usize,
}

/// Sequential command dispatcher for one device.
pub struct Dispatcher {
    nms: Arc<dyn NmsApi>,
    executor: Executor,
    device_id: String,
    nms_config: NmsConfig,
    config: DispatchConfig,
    pending: VecDeque<Command>,
    pending_ids: HashSet<String>,
    completed: CompletedCache,
    consecutive_failures: u32,
    cancel: CancellationToken,
}

impl Dispatcher {
    #[must_use]
    pub fn new(ctx: Arc<AgentContext>, nms: Arc<dyn NmsApi>, device_id: impl Into<String>) -> Self {
        let device_id = device_id.into();
        let nms_config = ctx.config.nms.clone();
        let config = ctx.config.dispatch.clone();
        let cancel = ctx.shutdown.clone();
        Self {
            executor: Executor::new(ctx, Arc::clone(&nms), device_id.clone()),
            completed: CompletedCache::new(config.completed_cache_size),
            nms,
            device_id,
            nms_config,
            config,
            pending: VecDeque::new(),
            pending_ids: HashSet::new(),
            consecutive_failures: 0,
            cancel,
        }
    }

    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Poll and dispatch until the context's shutdown token fires.
    pub async fn run(mut self) {
        tracing::info!(
            device_id = %self.device_id,
            nms = %self.nms_config.base(),
            poll_interval_sec = self.config.poll_interval_sec,
            "dispatcher started"
        );
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            let summary = self.tick().await;
            if summary.executed + summary.resent > 0 {
                tracing::debug!(?summary, "tick");
            }
            let sleep = self.next_sleep();
            tokio::select! {
                () = self.cancel.cancelled() => break,
                () = tokio::time::sleep(sleep) => {}
            }
        }
        tracing::info!(pending = self.pending.len(), "dispatcher stopped");
    }

    /// One pass at the current local time.
    pub async fn tick(&mut self) -> TickSummary {
        self.tick_at(Local::now()).await
    }

    /// One pass: poll, merge, then run every due command in queue order.
    pub async fn tick_at(&mut self, now: DateTime<Local>) -> TickSummary {
        let mut summary = TickSummary::default();

        // 1. Poll. A failure still lets already-queued due commands run.
        match self.nms.poll(&self.device_id, self.nms_config.poll_limit).await {
            Ok(commands) => {
                if self.consecutive_failures > 0 {
                    tracing::info!(failures = self.consecutive_failures, "NMS poll recovered");
                }
                self.consecutive_failures = 0;
                summary.poll_ok = true;
                for cmd in commands {
                    self.merge(cmd, &mut summary).await;
                }
            }
            Err(e) => {
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                tracing::warn!(failures = self.consecutive_failures, error = %e, "NMS poll failed");
            }
        }

        // 2. Drain due commands in order.
        let mut waiting = VecDeque::with_capacity(self.pending.len());
        while let Some(cmd) = self.pending.pop_front() {
            if self.cancel.is_cancelled() {
                waiting.push_back(cmd);
                continue;
            }
            let ack = match is_due(&cmd, now) {
                Ok(false) => {
                    waiting.push_back(cmd);
                    continue;
                }
                Ok(true) => self.dispatch(&cmd).await,
                Err(e) => {
                    tracing::warn!(cmd_id = %cmd.id, action = %cmd.action, error = %e, "command rejected");
                    AckResult::error(&cmd.id, e.to_string())
                }
            };
            summary.executed += 1;
            self.pending_ids.remove(&cmd.id);
            self.deliver(&ack).await;
            self.completed.insert(ack);
        }
        summary.deferred = waiting.len();
        self.pending = waiting;
        summary
    }

    async fn merge(&mut self, cmd: Command, summary: &mut TickSummary) {
        if let Some(ack) = self.completed.get(&cmd.id).cloned() {
            tracing::info!(cmd_id = %cmd.id, action = %cmd.action, "re-delivered command; re-sending ack");
            self.deliver(&ack).await;
            summary.resent += 1;
            return;
        }
        if !self.pending_ids.insert(cmd.id.clone()) {
            return;
        }
        tracing::debug!(cmd_id = %cmd.id, action = %cmd.action, execute_at = ?cmd.execute_at, "queued");
        summary.accepted += 1;
        self.pending.push_back(cmd);
    }

    /// Validate and run one command under its deadline.
    async fn dispatch(&self, cmd: &Command) -> AckResult {
        let request = match validate(cmd) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!(cmd_id = %cmd.id, action = %cmd.action, error = %e, "command rejected");
                return AckResult::error(&cmd.id, e.to_string());
            }
        };
        let action = request.action();
        let limit = Duration::from_secs(if action == Action::BundleApply {
            self.config.bundle_timeout_sec
        } else {
            self.config.command_timeout_sec
        });

        tracing::info!(cmd_id = %cmd.id, action = %action, "EXEC");
        let started = Instant::now();
        let ack = match tokio::time::timeout(limit, self.executor.execute(request)).await {
            Ok(Ok(detail)) => AckResult::ok(&cmd.id, detail),
            Ok(Err(e)) => AckResult::error(&cmd.id, e.to_string()),
            Err(_) => {
                if action == Action::BundleApply {
                    tracing::warn!(cmd_id = %cmd.id, "bundle deadline passed; deployment continues and will report");
                }
                self.stop_owned(action).await;
                AckResult::error(&cmd.id, format!("timeout after {}s", limit.as_secs()))
            }
        };
        tracing::info!(
            cmd_id = %cmd.id,
            action = %action,
            status = ack.status.as_str(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            detail = %ack.detail,
            "RESULT"
        );
        ack
    }

    /// Best-effort stop of the slots a timed-out handler may have left running.
    async fn stop_owned(&self, action: Action) {
        let tracker = &self.executor.context().tracker;
        for &slot in action.owned_slots() {
            match tracker.stop(slot, StopRequest::term(TIMEOUT_STOP_GRACE)).await {
                Ok(StopOutcome::NothingToStop) => {}
                Ok(outcome) => tracing::warn!(action = %action, "{}", outcome.detail(slot)),
                Err(e) => tracing::warn!(action = %action, slot = %slot, error = %e, "cannot stop after timeout"),
            }
        }
    }

    /// Deliver with bounded retries. Never blocks later commands for longer
    /// than the retry schedule.
    async fn deliver(&self, ack: &AckResult) -> bool {
        let attempts = self.nms_config.ack_attempts.max(1);
        for attempt in 1..=attempts {
            match self.nms.ack(&self.device_id, ack).await {
                Ok(()) => return true,
                Err(e) => {
                    tracing::warn!(cmd_id = %ack.command_id, attempt, attempts, error = %e, "ack failed");
                    if attempt < attempts {
                        let delay = self.nms_config.ack_retry_delay_ms.saturating_mul(u64::from(attempt));
                        tokio::time::sleep(Duration::from_millis(delay)).await;
                    }
                }
            }
        }
        tracing::error!(cmd_id = %ack.command_id, status = ack.status.as_str(), "ack undelivered");
        false
    }

    /// Sleep before the next poll: the fixed interval, doubled per failure once
    /// `backoff_after_failures` consecutive polls have failed.
    #[must_use]
    pub fn next_sleep(&self) -> Duration {
        let base = self.config.poll_interval_sec;
        let after = self.config.backoff_after_failures;
        if after == 0 || self.consecutive_failures < after {
            return Duration::from_secs(base);
        }
        let exp = (self.consecutive_failures - after + 1).min(16);
        let secs = base
            .saturating_mul(1u64 << exp)
            .min(self.config.max_backoff_sec.max(base));
        Duration::from_secs(secs)
    }
}

/// Empty `execute_at` is due now.
fn is_due(cmd: &Command, now: DateTime<Local>) -> Result<bool, ValidationError> {
    let Some(raw) = cmd.execute_at.as_deref().filter(|s| !s.trim().is_empty()) else {
        return Ok(true);
    };
    let at = crate::timefmt::parse(raw).ok_or_else(|| ValidationError::MalformedExecuteAt(raw.to_owned()))?;
    Ok(at <= now)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::config::AgentConfig;
    use crate::error::{AgentError, Result};
    use crate::nms::BundleReport;
    use crate::services::ServiceManager;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeServices {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ServiceManager for FakeServices {
        async fn start(&self, unit: &str) -> Result<String> {
            self.calls.lock().unwrap().push(format!("start {unit}"));
            Ok(format!("started {unit}"))
        }
        async fn stop(&self, unit: &str) -> Result<String> {
            self.calls.lock().unwrap().push(format!("stop {unit}"));
            Ok(format!("stopped {unit}"))
        }
        async fn restart(&self, unit: &str) -> Result<String> {
            Ok(format!("restarted {unit}"))
        }
        async fn is_active(&self, _unit: &str) -> Result<bool> {
            Ok(false)
        }
    }

    /// Scripted NMS: each poll pops one batch; acks are recorded.
    #[derive(Default)]
    struct FakeNms {
        batches: Mutex<VecDeque<Result<Vec<Command>>>>,
        acks: Mutex<Vec<AckResult>>,
        failing_acks: Mutex<u32>,
    }

    impl FakeNms {
        fn push(&self, batch: Vec<Command>) {
            self.batches.lock().unwrap().push_back(Ok(batch));
        }
        fn push_err(&self) {
            self.batches
                .lock()
                .unwrap()
                .push_back(Err(AgentError::Nms("connection refused".to_owned())));
        }
        fn acks(&self) -> Vec<AckResult> {
            self.acks.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl NmsApi for FakeNms {
        async fn poll(&self, _device_id: &str, _limit: u32) -> Result<Vec<Command>> {
            self.batches.lock().unwrap().pop_front().unwrap_or_else(|| Ok(Vec::new()))
        }
        async fn ack(&self, _device_id: &str, ack: &AckResult) -> Result<()> {
            let mut failing = self.failing_acks.lock().unwrap();
            if *failing > 0 {
                *failing -= 1;
                return Err(AgentError::Nms("ack http=503".to_owned()));
            }
            self.acks.lock().unwrap().push(ack.clone());
            Ok(())
        }
        async fn report_bundle(&self, _device_id: &str, _report: &BundleReport) -> Result<()> {
            Ok(())
        }
    }

    struct Harness {
        dispatcher: Dispatcher,
        nms: Arc<FakeNms>,
        services: Arc<FakeServices>,
        _dir: tempfile::TempDir,
    }

    fn harness(tweak: impl FnOnce(&mut AgentConfig)) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AgentConfig::default();
        config.paths.base_dir = dir.path().to_path_buf();
        config.nms.ack_retry_delay_ms = 1;
        tweak(&mut config);
        let services = Arc::new(FakeServices::default());
        let ctx = Arc::new(AgentContext::with_services(config, services.clone()).unwrap());
        let nms = Arc::new(FakeNms::default());
        Harness {
            dispatcher: Dispatcher::new(ctx, nms.clone(), "scanner01"),
            nms,
            services,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn unknown_action_is_acked_error_without_side_effect() {
        let mut h = harness(|_| {});
        h.nms.push(vec![Command::new("c1", "fly.away", json!({}))]);
        let summary = h.dispatcher.tick().await;
        assert_eq!(summary.executed, 1);

        let acks = h.nms.acks();
        assert_eq!(acks.len(), 1);
        assert!(!acks[0].is_ok());
        assert_eq!(acks[0].detail, "unknown action=fly.away");
        assert!(h.services.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn commands_run_in_poll_order() {
        let mut h = harness(|_| {});
        h.nms.push(vec![
            Command::new("c1", "scan.start", json!({})),
            Command::new("c2", "scan.stop", json!({})),
        ]);
        h.dispatcher.tick().await;
        let ids: Vec<_> = h.nms.acks().into_iter().map(|a| a.command_id).collect();
        assert_eq!(ids, ["c1", "c2"]);
        assert_eq!(
            h.services.calls.lock().unwrap().clone(),
            ["start scanner-poller.service", "stop scanner-poller.service"]
        );
    }

    #[tokio::test]
    async fn future_command_waits_until_due() {
        let mut h = harness(|_| {});
        let now = Local::now();
        let at = crate::timefmt::format(&(now + chrono::Duration::minutes(5)));
        h.nms.push(vec![Command::new("c1", "scan.start", json!({})).with_execute_at(at)]);

        let summary = h.dispatcher.tick_at(now).await;
        assert_eq!(summary.deferred, 1);
        assert!(h.nms.acks().is_empty());

        // Still held across an empty poll.
        h.dispatcher.tick_at(now + chrono::Duration::minutes(1)).await;
        assert_eq!(h.dispatcher.pending_len(), 1);
        assert!(h.nms.acks().is_empty());

        let summary = h.dispatcher.tick_at(now + chrono::Duration::minutes(6)).await;
        assert_eq!(summary.executed, 1);
        assert_eq!(h.dispatcher.pending_len(), 0);
        assert!(h.nms.acks()[0].is_ok());
    }

    #[tokio::test]
    async fn pending_command_is_not_duplicated_by_repoll() {
        let mut h = harness(|_| {});
        let now = Local::now();
        let at = crate::timefmt::format(&(now + chrono::Duration::minutes(5)));
        let cmd = Command::new("c1", "scan.start", json!({})).with_execute_at(at);
        h.nms.push(vec![cmd.clone()]);
        h.nms.push(vec![cmd]);
        h.dispatcher.tick_at(now).await;
        h.dispatcher.tick_at(now).await;
        assert_eq!(h.dispatcher.pending_len(), 1);
    }

    #[tokio::test]
    async fn redelivered_command_resends_cached_ack() {
        let mut h = harness(|_| {});
        h.nms.push(vec![Command::new("c1", "scan.start", json!({}))]);
        h.nms.push(vec![Command::new("c1", "scan.start", json!({}))]);
        h.dispatcher.tick().await;
        let summary = h.dispatcher.tick().await;
        assert_eq!(summary.resent, 1);
        assert_eq!(summary.executed, 0);

        let acks = h.nms.acks();
        assert_eq!(acks.len(), 2);
        assert_eq!(acks[0], acks[1]);
        assert_eq!(h.services.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn malformed_execute_at_is_rejected() {
        let mut h = harness(|_| {});
        h.nms
            .push(vec![Command::new("c1", "scan.start", json!({})).with_execute_at("next tuesday")]);
        h.dispatcher.tick().await;
        let acks = h.nms.acks();
        assert!(!acks[0].is_ok());
        assert!(acks[0].detail.contains("malformed execute_at"));
        assert!(h.services.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn lost_ack_does_not_block_next_command() {
        let mut h = harness(|config| config.nms.ack_attempts = 2);
        *h.nms.failing_acks.lock().unwrap() = 2;
        h.nms.push(vec![
            Command::new("c1", "scan.start", json!({})),
            Command::new("c2", "scan.stop", json!({})),
        ]);
        h.dispatcher.tick().await;
        let acks = h.nms.acks();
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].command_id, "c2");
    }

    #[tokio::test]
    async fn ack_is_retried_until_delivered() {
        let mut h = harness(|config| config.nms.ack_attempts = 3);
        *h.nms.failing_acks.lock().unwrap() = 2;
        h.nms.push(vec![Command::new("c1", "scan.start", json!({}))]);
        h.dispatcher.tick().await;
        assert_eq!(h.nms.acks().len(), 1);
    }

    #[tokio::test]
    async fn handler_timeout_acks_error_and_stops_child() {
        let mut h = harness(|config| {
            config.dispatch.command_timeout_sec = 1;
            config.scan.shell = std::path::PathBuf::from("/bin/sh");
        });
        let base = h.dispatcher.executor.context().config.paths.base_dir.clone();
        std::fs::write(base.join("scan_wifi.sh"), "sleep 30\n").unwrap();

        h.nms.push(vec![Command::new("c1", "scan.once", json!({}))]);
        h.dispatcher.tick().await;
        let acks = h.nms.acks();
        assert!(!acks[0].is_ok());
        assert!(acks[0].detail.contains("timeout"), "{}", acks[0].detail);
        let tracker = &h.dispatcher.executor.context().tracker;
        assert!(tracker.active(Slot::Scan).unwrap().is_none());
    }

    #[tokio::test]
    async fn poll_failures_back_off_and_recover() {
        let mut h = harness(|config| {
            config.dispatch.poll_interval_sec = 5;
            config.dispatch.backoff_after_failures = 2;
            config.dispatch.max_backoff_sec = 30;
        });
        for _ in 0..5 {
            h.nms.push_err();
        }
        let mut sleeps = Vec::new();
        for _ in 0..5 {
            assert!(!h.dispatcher.tick().await.poll_ok);
            sleeps.push(h.dispatcher.next_sleep().as_secs());
        }
        assert_eq!(sleeps, [5, 10, 20, 30, 30]);

        assert!(h.dispatcher.tick().await.poll_ok);
        assert_eq!(h.dispatcher.next_sleep(), Duration::from_secs(5));
    }

    #[test]
    fn completed_cache_evicts_oldest() {
        let mut cache = CompletedCache::new(2);
        for id in ["a", "b", "c"] {
            cache.insert(AckResult::ok(id, "done"));
        }
        assert!(cache.get("a").is_none());
        assert!(cache.get("b").is_some());
        assert!(cache.get("c").is_some());
    }
}
