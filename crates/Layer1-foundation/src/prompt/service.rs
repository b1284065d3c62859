//! Prompt Service - 프롬프트 중재
//!
//! `PromptBroker` is the long-lived owner of the pending queue. A
//! `PromptSession` wraps it for one connection attempt and applies policy,
//! dedupe and recording before anything reaches the user.

use super::parse::parse_host_key_details;
use super::types::{
    PromptEvent, PromptKind, PromptPolicy, PromptRecord, PromptRequest, PromptResolution,
    ResolutionReason, REDACTED,
};
use crate::storage::KeyedLock;
use crate::{Error, Result};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, info, warn};

const EVENT_CHANNEL_CAPACITY: usize = 256;

// ============================================================================
// PromptBroker
// ============================================================================

struct PendingPrompt {
    request: PromptRequest,
    reply: oneshot::Sender<PromptResolution>,
}

#[derive(Default)]
struct BrokerState {
    pending: VecDeque<PendingPrompt>,
    disposed: bool,
}

/// FIFO queue of unanswered prompts shared by every session
pub struct PromptBroker {
    state: Mutex<BrokerState>,
    events: broadcast::Sender<PromptEvent>,
}

impl Default for PromptBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl PromptBroker {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            state: Mutex::new(BrokerState::default()),
            events,
        }
    }

    /// Receive `Added` / `Removed` events. Call `pending()` first to catch up.
    pub fn subscribe(&self) -> broadcast::Receiver<PromptEvent> {
        self.events.subscribe()
    }

    /// Snapshot of the queue, oldest first
    pub fn pending(&self) -> Vec<PromptRequest> {
        self.state
            .lock()
            .pending
            .iter()
            .map(|p| p.request.clone())
            .collect()
    }

    fn emit(&self, event: PromptEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    /// Queue a request and wait for its answer.
    ///
    /// Unanswered requests resolve empty with `Timeout` once `timeout`
    /// elapses. Dropping the returned future removes the request.
    pub async fn ask(&self, request: PromptRequest, timeout: Duration) -> PromptResolution {
        let request_id = request.request_id.clone();
        let (tx, rx) = oneshot::channel();

        {
            let mut state = self.state.lock();
            if state.disposed {
                debug!(request_id = %request_id, "broker disposed, refusing prompt");
                return PromptResolution::empty(ResolutionReason::PolicyDenied);
            }
            state.pending.push_back(PendingPrompt {
                request: request.clone(),
                reply: tx,
            });
        }
        info!(request_id = %request_id, kind = %request.kind, "prompt queued");
        self.emit(PromptEvent::Added(request));

        let mut guard = QueuedGuard {
            broker: self,
            request_id: &request_id,
            armed: true,
        };

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(resolution)) => {
                guard.armed = false;
                resolution
            }
            // sender dropped by cancel_session / dispose
            Ok(Err(_)) => {
                guard.armed = false;
                PromptResolution::empty(ResolutionReason::Timeout)
            }
            Err(_) => {
                guard.armed = false;
                warn!(request_id = %request_id, "prompt timed out");
                self.remove(&request_id, ResolutionReason::Timeout);
                PromptResolution::empty(ResolutionReason::Timeout)
            }
        }
    }

    fn remove(&self, request_id: &str, reason: ResolutionReason) -> Option<PendingPrompt> {
        let removed = {
            let mut state = self.state.lock();
            let index = state
                .pending
                .iter()
                .position(|p| p.request.request_id == request_id)?;
            state.pending.remove(index)
        };
        if removed.is_some() {
            self.emit(PromptEvent::Removed {
                request_id: request_id.to_string(),
                reason,
            });
        }
        removed
    }

    /// Answer a queued prompt. Unknown ids are `NotFound`.
    pub fn respond(&self, request_id: &str, response: impl Into<String>) -> Result<()> {
        let pending = self
            .remove(request_id, ResolutionReason::UserResponse)
            .ok_or_else(|| Error::NotFound(format!("prompt {}", request_id)))?;

        debug!(request_id, "prompt answered");
        // the asker may already be gone (aborted); that's not the responder's problem
        let _ = pending.reply.send(PromptResolution::new(
            response,
            ResolutionReason::UserResponse,
        ));
        Ok(())
    }

    /// Drop every prompt belonging to a session; their askers resolve empty
    pub fn cancel_session(&self, session_id: &str) -> usize {
        let cancelled: Vec<PendingPrompt> = {
            let mut state = self.state.lock();
            let (gone, kept): (VecDeque<_>, VecDeque<_>) = std::mem::take(&mut state.pending)
                .into_iter()
                .partition(|p| p.request.session_id == session_id);
            state.pending = kept;
            gone.into_iter().collect()
        };

        for p in &cancelled {
            self.emit(PromptEvent::Removed {
                request_id: p.request.request_id.clone(),
                reason: ResolutionReason::Timeout,
            });
        }
        if !cancelled.is_empty() {
            info!(session_id, count = cancelled.len(), "cancelled session prompts");
        }
        cancelled.len()
    }

    /// Refuse new prompts and release every waiter
    pub fn dispose(&self) {
        let drained: Vec<PendingPrompt> = {
            let mut state = self.state.lock();
            state.disposed = true;
            state.pending.drain(..).collect()
        };
        for p in drained {
            self.emit(PromptEvent::Removed {
                request_id: p.request.request_id.clone(),
                reason: ResolutionReason::Timeout,
            });
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.state.lock().disposed
    }
}

/// Removes an abandoned request when `ask` is dropped mid-wait
struct QueuedGuard<'a> {
    broker: &'a PromptBroker,
    request_id: &'a str,
    armed: bool,
}

impl Drop for QueuedGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.broker
                .remove(self.request_id, ResolutionReason::Timeout);
        }
    }
}

// ============================================================================
// PromptSession
// ============================================================================

/// Raw prompt coming from a blocked subprocess
#[derive(Debug, Clone, Default)]
pub struct PromptInput {
    pub prompt: String,
    /// stderr captured from the connection attempt so far
    pub stderr_context: String,
    /// Identity used to skip repeat host-key prompts (e.g. `host:port`)
    pub dedupe_key: Option<String>,
}

impl PromptInput {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Self::default()
        }
    }

    pub fn with_stderr_context(mut self, context: impl Into<String>) -> Self {
        self.stderr_context = context.into();
        self
    }

    pub fn with_dedupe_key(mut self, key: impl Into<String>) -> Self {
        self.dedupe_key = Some(key.into());
        self
    }
}

/// Called before a prompt is surfaced to the user
pub type PromptStartedHook = Arc<dyn Fn(&PromptRequest) + Send + Sync>;

/// Per-connection view over the broker
pub struct PromptSession {
    session_id: String,
    broker: Arc<PromptBroker>,
    policy: PromptPolicy,
    on_prompt_started: Option<PromptStartedHook>,
    accepted: Mutex<HashMap<String, String>>,
    dedupe_locks: KeyedLock,
    records: Mutex<Vec<PromptRecord>>,
}

impl PromptSession {
    pub fn new(broker: Arc<PromptBroker>, policy: PromptPolicy) -> Self {
        Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            broker,
            policy,
            on_prompt_started: None,
            accepted: Mutex::new(HashMap::new()),
            dedupe_locks: KeyedLock::new(),
            records: Mutex::new(Vec::new()),
        }
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = session_id.into();
        self
    }

    pub fn on_prompt_started(mut self, hook: PromptStartedHook) -> Self {
        self.on_prompt_started = Some(hook);
        self
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn policy(&self) -> &PromptPolicy {
        &self.policy
    }

    pub fn records(&self) -> Vec<PromptRecord> {
        self.records.lock().clone()
    }

    fn record(&self, kind: PromptKind, resolution: &PromptResolution, secret: bool) {
        let response = if secret && !resolution.response.is_empty() {
            REDACTED.to_string()
        } else {
            resolution.response.clone()
        };
        self.records.lock().push(PromptRecord {
            kind,
            reason: resolution.reason,
            response,
        });
    }

    /// Resolve one prompt. Never fails: denial and timeout are empty answers.
    pub async fn mediate(&self, input: PromptInput) -> PromptResolution {
        let kind = PromptKind::classify(&input.prompt);

        if !self.policy.allows(kind) {
            info!(session_id = %self.session_id, %kind, "prompt denied by policy");
            let resolution = PromptResolution::empty(ResolutionReason::PolicyDenied);
            self.record(kind, &resolution, false);
            return resolution;
        }

        match kind {
            PromptKind::HostKey => self.mediate_host_key(input).await,
            PromptKind::Credential => {
                let request = PromptRequest::new(&self.session_id, kind, input.prompt);
                self.surface(request).await
            }
        }
    }

    async fn mediate_host_key(&self, input: PromptInput) -> PromptResolution {
        // concurrent prompts for the same identity wait for the first answer
        let _guard = match &input.dedupe_key {
            Some(key) => Some(self.dedupe_locks.lock(key).await),
            None => None,
        };

        if let Some(key) = &input.dedupe_key {
            let cached = self.accepted.lock().get(key).cloned();
            if let Some(response) = cached {
                debug!(session_id = %self.session_id, dedupe_key = %key, "host key already accepted");
                let resolution = PromptResolution::new(response, ResolutionReason::Deduped);
                self.record(PromptKind::HostKey, &resolution, false);
                return resolution;
            }
        }

        let context = if input.stderr_context.is_empty() {
            input.prompt.clone()
        } else {
            format!("{}\n{}", input.stderr_context, input.prompt)
        };
        let request = PromptRequest::new(&self.session_id, PromptKind::HostKey, input.prompt)
            .with_host_key(parse_host_key_details(&context));

        let resolution = self.surface(request).await;

        if let Some(key) = input.dedupe_key {
            if resolution.reason == ResolutionReason::UserResponse
                && is_host_key_acceptance(&resolution.response)
            {
                self.accepted.lock().insert(key, resolution.response.clone());
            }
        }
        resolution
    }

    async fn surface(&self, request: PromptRequest) -> PromptResolution {
        if let Some(hook) = &self.on_prompt_started {
            hook(&request);
        }
        let kind = request.kind;
        let secret = request.secret;
        let resolution = self
            .broker
            .ask(request, self.policy.response_timeout)
            .await;
        self.record(kind, &resolution, secret);
        resolution
    }

    /// Cancel this session's queued prompts
    pub fn cancel(&self) -> usize {
        self.broker.cancel_session(&self.session_id)
    }
}

impl Drop for PromptSession {
    fn drop(&mut self) {
        self.broker.cancel_session(&self.session_id);
    }
}

/// "yes" or a pasted fingerprint accepts a host key
fn is_host_key_acceptance(response: &str) -> bool {
    let trimmed = response.trim();
    trimmed.eq_ignore_ascii_case("yes") || trimmed.starts_with("SHA256:") || trimmed.starts_with("MD5:")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const HOST_KEY_PROMPT: &str =
        "Are you sure you want to continue connecting (yes/no/[fingerprint])? ";

    /// Answers every added prompt with `answer`, counting how many it saw
    fn spawn_responder(
        broker: Arc<PromptBroker>,
        answer: &'static str,
    ) -> (Arc<AtomicUsize>, tokio::task::JoinHandle<()>) {
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let mut rx = broker.subscribe();
        let handle = tokio::spawn(async move {
            while let Ok(event) = rx.recv().await {
                if let PromptEvent::Added(req) = event {
                    counter.fetch_add(1, Ordering::SeqCst);
                    let _ = broker.respond(&req.request_id, answer);
                }
            }
        });
        (seen, handle)
    }

    #[tokio::test]
    async fn test_respond_resolves_waiter() {
        let broker = Arc::new(PromptBroker::new());
        let (seen, handle) = spawn_responder(Arc::clone(&broker), "hunter2");

        let session = PromptSession::new(Arc::clone(&broker), PromptPolicy::default());
        let resolution = session.mediate(PromptInput::new("Password:")).await;

        assert_eq!(resolution.response, "hunter2");
        assert_eq!(resolution.reason, ResolutionReason::UserResponse);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert!(broker.pending().is_empty());

        // credential answers are not kept in the audit trail
        let records = session.records();
        assert_eq!(records[0].response, REDACTED);
        handle.abort();
    }

    #[tokio::test]
    async fn test_policy_denied_never_queues() {
        let broker = Arc::new(PromptBroker::new());
        let mut rx = broker.subscribe();
        let session = PromptSession::new(Arc::clone(&broker), PromptPolicy::deny_all());

        let resolution = session.mediate(PromptInput::new(HOST_KEY_PROMPT)).await;
        assert_eq!(resolution, PromptResolution::empty(ResolutionReason::PolicyDenied));
        assert!(rx.try_recv().is_err());
        assert_eq!(session.records()[0].kind, PromptKind::HostKey);
    }

    #[tokio::test]
    async fn test_host_key_dedupe_after_yes() {
        let broker = Arc::new(PromptBroker::new());
        let (seen, handle) = spawn_responder(Arc::clone(&broker), "yes");
        let session = PromptSession::new(Arc::clone(&broker), PromptPolicy::default());

        let first = session
            .mediate(PromptInput::new(HOST_KEY_PROMPT).with_dedupe_key("build.local:22"))
            .await;
        let second = session
            .mediate(PromptInput::new(HOST_KEY_PROMPT).with_dedupe_key("build.local:22"))
            .await;

        assert_eq!(first.reason, ResolutionReason::UserResponse);
        assert_eq!(second.reason, ResolutionReason::Deduped);
        assert_eq!(second.response, "yes");
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        handle.abort();
    }

    #[tokio::test]
    async fn test_rejected_host_key_is_asked_again() {
        let broker = Arc::new(PromptBroker::new());
        let (seen, handle) = spawn_responder(Arc::clone(&broker), "no");
        let session = PromptSession::new(Arc::clone(&broker), PromptPolicy::default());

        for _ in 0..2 {
            let r = session
                .mediate(PromptInput::new(HOST_KEY_PROMPT).with_dedupe_key("h:22"))
                .await;
            assert_eq!(r.response, "no");
        }
        assert_eq!(seen.load(Ordering::SeqCst), 2);
        handle.abort();
    }

    #[tokio::test]
    async fn test_host_key_details_from_stderr() {
        let broker = Arc::new(PromptBroker::new());
        let mut rx = broker.subscribe();
        let session = PromptSession::new(Arc::clone(&broker), PromptPolicy::default());

        let input = PromptInput::new(HOST_KEY_PROMPT).with_stderr_context(
            "The authenticity of host 'build.local (10.0.0.5)' can't be established.\n\
             ED25519 key fingerprint is SHA256:abc123.",
        );
        let b = Arc::clone(&broker);
        let answer = tokio::spawn(async move {
            if let Ok(PromptEvent::Added(req)) = rx.recv().await {
                assert_eq!(req.host.as_deref(), Some("build.local"));
                assert_eq!(req.key_type.as_deref(), Some("ED25519"));
                assert_eq!(req.fingerprint.as_deref(), Some("SHA256:abc123"));
                b.respond(&req.request_id, "yes").unwrap();
            }
        });

        let r = session.mediate(input).await;
        answer.await.unwrap();
        assert_eq!(r.response, "yes");
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_resolves_empty_and_dequeues() {
        let broker = Arc::new(PromptBroker::new());
        let policy = PromptPolicy::default().with_response_timeout(Duration::from_secs(5));
        let session = PromptSession::new(Arc::clone(&broker), policy);

        let r = session.mediate(PromptInput::new("Password:")).await;
        assert_eq!(r, PromptResolution::empty(ResolutionReason::Timeout));
        assert!(broker.pending().is_empty());
    }

    #[tokio::test]
    async fn test_prompt_started_hook_fires() {
        let broker = Arc::new(PromptBroker::new());
        let (_seen, handle) = spawn_responder(Arc::clone(&broker), "");
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let session = PromptSession::new(Arc::clone(&broker), PromptPolicy::default())
            .on_prompt_started(Arc::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }));

        session.mediate(PromptInput::new(HOST_KEY_PROMPT)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        handle.abort();
    }

    #[test]
    fn test_respond_unknown_is_not_found() {
        let broker = PromptBroker::new();
        assert!(broker.respond("nope", "yes").unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_cancel_session_releases_waiters() {
        let broker = Arc::new(PromptBroker::new());
        let mut rx = broker.subscribe();
        let session = Arc::new(
            PromptSession::new(Arc::clone(&broker), PromptPolicy::default())
                .with_session_id("s-1"),
        );

        let s = Arc::clone(&session);
        let waiter = tokio::spawn(async move { s.mediate(PromptInput::new("Password:")).await });
        assert!(matches!(rx.recv().await, Ok(PromptEvent::Added(_))));

        assert_eq!(broker.cancel_session("s-1"), 1);
        let r = waiter.await.unwrap();
        assert!(r.response.is_empty());
        assert!(broker.pending().is_empty());
    }

    #[tokio::test]
    async fn test_disposed_broker_refuses() {
        let broker = Arc::new(PromptBroker::new());
        broker.dispose();
        let session = PromptSession::new(Arc::clone(&broker), PromptPolicy::default());
        let r = session.mediate(PromptInput::new("Password:")).await;
        assert_eq!(r.reason, ResolutionReason::PolicyDenied);
    }

    #[tokio::test]
    async fn test_dropped_ask_leaves_no_pending() {
        let broker = Arc::new(PromptBroker::new());
        let request = PromptRequest::new("s", PromptKind::Credential, "Password:");
        let fut = broker.ask(request, Duration::from_secs(60));
        let _ = tokio::time::timeout(Duration::from_millis(10), fut).await;
        assert!(broker.pending().is_empty());
    }
}
