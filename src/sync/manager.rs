//! Push/pull/poll protocol against the remote state endpoint.
//!
//! One manager per client instance. Local edits arrive as debounced pushes
//! carrying the last synced version as an optimistic precondition; a 409
//! answer means someone else pushed first, so the manager pulls, lets the
//! reconciliation in [`Session`] absorb the remote document, and retries a
//! bounded number of times. A poll timer pulls on a fixed cadence, skipping
//! snapshots the client has already seen. Without a credential the manager
//! is inert and every operation reports itself skipped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::{sleep, sleep_until, Duration, Instant};

use super::client::{RemoteClient, SyncError};
use super::config::{
    PullOptions, PullOutcome, PushOptions, SyncConfig, SyncState, SyncStatus, KEEPALIVE_NUDGE_SECS,
};
use crate::session::Session;
use crate::state::normalize;

/// Messages to the debounce task
#[derive(Debug)]
enum DebounceMessage {
    /// (Re)arm the quiet-period timer
    Schedule,
    /// Disarm without pushing
    Cancel,
    /// Session ending
    Shutdown,
}

/// Messages to the poll task
#[derive(Debug)]
enum PollMessage {
    Shutdown,
}

/// Messages to the keep-alive task
#[derive(Debug)]
enum KeepaliveMessage {
    /// A transient failure suggests the remote may be cold; probe soon
    Nudge,
    Shutdown,
}

#[derive(Default)]
struct TimerChannels {
    debounce: Option<mpsc::Sender<DebounceMessage>>,
    poll: Option<mpsc::Sender<PollMessage>>,
    keepalive: Option<mpsc::Sender<KeepaliveMessage>>,
}

type UnauthorizedCallback = Arc<dyn Fn() + Send + Sync>;
type StatusCallback = Arc<dyn Fn(SyncStatus) + Send + Sync>;

pub struct SyncManager {
    session: Arc<Session>,
    client: Option<RemoteClient>,
    config: SyncConfig,
    last_synced: Mutex<Option<u64>>,
    is_pulling: AtomicBool,
    is_pushing: AtomicBool,
    status: Mutex<SyncStatus>,
    timers: Mutex<TimerChannels>,
    on_unauthorized: Mutex<Option<UnauthorizedCallback>>,
    on_status: Mutex<Option<StatusCallback>>,
}

impl SyncManager {
    /// Create a manager for a session. Without a token (or with an empty
    /// server URL) the manager is permanently disabled: local edits keep
    /// working, push/pull become no-ops.
    pub fn new(session: Arc<Session>, config: SyncConfig, token: Option<&str>) -> Arc<Self> {
        let client = match token {
            Some(token) if !config.server_url.is_empty() => {
                match RemoteClient::new(&config, token) {
                    Ok(client) => Some(client),
                    Err(e) => {
                        log::warn!("Failed to build sync client, running local-only: {}", e);
                        None
                    }
                }
            }
            _ => None,
        };
        let mut status = SyncStatus::default();
        if client.is_some() {
            status.state = SyncState::Idle;
        }
        Arc::new(Self {
            session,
            client,
            config,
            last_synced: Mutex::new(None),
            is_pulling: AtomicBool::new(false),
            is_pushing: AtomicBool::new(false),
            status: Mutex::new(status),
            timers: Mutex::new(TimerChannels::default()),
            on_unauthorized: Mutex::new(None),
            on_status: Mutex::new(None),
        })
    }

    /// Whether this manager can reach a remote at all.
    pub fn enabled(&self) -> bool {
        self.client.is_some()
    }

    pub fn status(&self) -> SyncStatus {
        self.status.lock().unwrap().clone()
    }

    pub fn last_synced_version(&self) -> Option<u64> {
        *self.last_synced.lock().unwrap()
    }

    /// Restore the synced-version tracker from a host-persisted value, so a
    /// freshly constructed manager continues optimistic pushes instead of
    /// seeding unconditionally.
    pub fn resume_from(&self, version: u64) {
        self.record_synced(version);
    }

    pub fn is_pulling(&self) -> bool {
        self.is_pulling.load(Ordering::SeqCst)
    }

    pub fn is_pushing(&self) -> bool {
        self.is_pushing.load(Ordering::SeqCst)
    }

    /// Called on any 401; the host clears credentials and re-prompts.
    pub fn on_unauthorized<F>(&self, f: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.on_unauthorized.lock().unwrap() = Some(Arc::new(f));
    }

    /// Called after every status change with a snapshot of the new status.
    pub fn on_status_change<F>(&self, f: F)
    where
        F: Fn(SyncStatus) + Send + Sync + 'static,
    {
        *self.on_status.lock().unwrap() = Some(Arc::new(f));
    }

    // ===== Pull =====

    /// Fetch the remote document and reconcile it into local state.
    ///
    /// Never returns an error to the caller; failures come back inside the
    /// outcome. A stale remote (version below the last synced one) is
    /// discarded so local state cannot regress.
    pub async fn pull_latest(self: &Arc<Self>, opts: PullOptions) -> PullOutcome {
        let Some(client) = &self.client else {
            return PullOutcome::skipped();
        };
        if self.is_pushing.load(Ordering::SeqCst) {
            log::debug!("Pull skipped: push in flight");
            return PullOutcome::skipped();
        }
        if self.is_pulling.swap(true, Ordering::SeqCst) {
            log::debug!("Pull skipped: pull already in flight");
            return PullOutcome::skipped();
        }
        self.set_state(SyncState::Pulling);

        let outcome = match client.fetch_state().await {
            Ok(value) => {
                let remote = normalize(&value);
                let remote_version = remote.meta.version;
                let last_synced = self.last_synced_version();
                if last_synced.is_some_and(|synced| remote_version < synced) {
                    log::warn!(
                        "Discarding stale remote state v{} (last synced v{})",
                        remote_version,
                        last_synced.unwrap_or(0)
                    );
                    self.set_state(SyncState::Idle);
                    PullOutcome::skipped()
                } else if opts.skip_if_unchanged && last_synced == Some(remote_version) {
                    log::debug!("Remote unchanged at v{}", remote_version);
                    self.set_state(SyncState::Idle);
                    PullOutcome::skipped()
                } else {
                    self.session.apply_remote(remote);
                    self.record_synced(remote_version);
                    log::info!("Pulled state v{} from remote", remote_version);
                    self.set_success();
                    PullOutcome::applied()
                }
            }
            Err(SyncError::NotFound) => {
                log::debug!("Remote has no state yet");
                self.set_state(SyncState::Idle);
                PullOutcome::not_found()
            }
            Err(SyncError::Unauthorized) => {
                self.handle_unauthorized();
                PullOutcome::error("unauthorized")
            }
            Err(e) => {
                log::warn!("Pull failed: {}", e);
                self.set_failure(&e);
                self.nudge_keepalive();
                PullOutcome::error(e.to_string())
            }
        };
        self.is_pulling.store(false, Ordering::SeqCst);
        outcome
    }

    // ===== Push =====

    /// Push the current document. Returns true when the server confirmed
    /// the write. A version conflict triggers pull-then-retry, bounded by
    /// the configured retry limit with a fixed backoff between attempts.
    pub async fn push_state(self: &Arc<Self>, opts: PushOptions) -> bool {
        let Some(client) = &self.client else {
            return false;
        };
        let mut force = opts.force;
        let mut attempt = opts.retry_count;
        loop {
            let last_synced = self.last_synced_version();
            if !force && Some(self.session.version()) == last_synced {
                log::debug!("Nothing to push (v{} already synced)", last_synced.unwrap_or(0));
                return false;
            }
            if self.is_pulling.load(Ordering::SeqCst) {
                log::debug!("Push skipped: pull in flight");
                return false;
            }
            if self.is_pushing.swap(true, Ordering::SeqCst) {
                log::debug!("Push skipped: push already in flight");
                return false;
            }
            self.set_state(SyncState::Pushing);

            let snapshot = self.session.snapshot();
            let result = client.put_state(&snapshot, last_synced).await;
            self.is_pushing.store(false, Ordering::SeqCst);

            match result {
                Ok(resp) => {
                    let confirmed = resp.meta.version;
                    self.session.adopt_version(snapshot.meta.version, confirmed);
                    self.record_synced(confirmed);
                    self.set_success();
                    log::info!(
                        "Pushed state v{} (server confirmed v{})",
                        snapshot.meta.version, confirmed
                    );
                    return true;
                }
                Err(SyncError::Conflict) => {
                    attempt += 1;
                    if attempt > self.config.conflict_retry_limit {
                        log::warn!(
                            "Giving up push after {} conflict retries; next sync will reconcile",
                            attempt - 1
                        );
                        self.set_state(SyncState::Idle);
                        return false;
                    }
                    log::info!(
                        "Push conflict at expected v{}; pulling before retry {}/{}",
                        last_synced.unwrap_or(0),
                        attempt,
                        self.config.conflict_retry_limit
                    );
                    sleep(self.config.conflict_backoff()).await;
                    let pulled = self.pull_latest(PullOptions::default()).await;
                    if !pulled.applied {
                        log::warn!("Conflict recovery pull did not apply; deferring push");
                        self.set_state(SyncState::Idle);
                        return false;
                    }
                    force = true;
                }
                Err(SyncError::Unauthorized) => {
                    self.handle_unauthorized();
                    return false;
                }
                Err(e) => {
                    log::warn!("Push failed: {}", e);
                    self.set_failure(&e);
                    self.nudge_keepalive();
                    return false;
                }
            }
        }
    }

    // ===== Timers =====

    /// Arm (or re-arm) the debounced push: bursts of local edits collapse
    /// into one push after a quiet period.
    pub fn schedule_push(self: &Arc<Self>) {
        if !self.enabled() {
            return;
        }
        let sender = {
            let mut timers = self.timers.lock().unwrap();
            if timers.debounce.is_none() {
                let (tx, rx) = mpsc::channel(32);
                let manager = Arc::clone(self);
                tokio::spawn(async move {
                    debounce_loop(manager, rx).await;
                });
                timers.debounce = Some(tx);
            }
            timers.debounce.clone()
        };
        if let Some(tx) = sender {
            let _ = tx.try_send(DebounceMessage::Schedule);
        }
    }

    /// Disarm a pending debounced push without sending anything.
    pub fn cancel_pending_push(&self) {
        let sender = self.timers.lock().unwrap().debounce.clone();
        if let Some(tx) = sender {
            let _ = tx.try_send(DebounceMessage::Cancel);
        }
    }

    /// Cancel any pending debounce and push immediately.
    pub async fn force_push(self: &Arc<Self>) -> bool {
        self.cancel_pending_push();
        self.push_state(PushOptions {
            force: true,
            retry_count: 0,
        })
        .await
    }

    /// Start the poll timer (and the keep-alive timer when configured).
    /// Idempotent; a second call while polling is a no-op so timers are
    /// never stacked.
    pub fn start_polling(self: &Arc<Self>) {
        if !self.enabled() {
            log::debug!("Polling not started: sync disabled");
            return;
        }
        let mut timers = self.timers.lock().unwrap();
        if timers.poll.is_some() {
            return;
        }
        let (tx, rx) = mpsc::channel(8);
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            poll_loop(manager, rx).await;
        });
        timers.poll = Some(tx);

        self.arm_keepalive(&mut timers);
        log::info!(
            "Polling started (every {}ms)",
            self.config.poll_interval().as_millis()
        );
    }

    /// Stop the poll and keep-alive timers and disarm any pending debounce.
    /// No timer survives a session boundary.
    pub fn stop_polling(&self) {
        let (poll, keepalive, debounce) = {
            let mut timers = self.timers.lock().unwrap();
            (
                timers.poll.take(),
                timers.keepalive.take(),
                timers.debounce.clone(),
            )
        };
        if let Some(tx) = poll {
            let _ = tx.try_send(PollMessage::Shutdown);
        }
        if let Some(tx) = keepalive {
            let _ = tx.try_send(KeepaliveMessage::Shutdown);
        }
        if let Some(tx) = debounce {
            let _ = tx.try_send(DebounceMessage::Cancel);
        }
    }

    /// Full teardown: stop polling and end the debounce task.
    pub fn shutdown(&self) {
        self.stop_polling();
        let debounce = self.timers.lock().unwrap().debounce.take();
        if let Some(tx) = debounce {
            let _ = tx.try_send(DebounceMessage::Shutdown);
        }
    }

    // ===== Internal =====

    fn record_synced(&self, version: u64) {
        *self.last_synced.lock().unwrap() = Some(version);
        self.update_status(|status| status.last_synced_version = Some(version));
    }

    fn handle_unauthorized(&self) {
        log::warn!("Remote rejected credentials (401)");
        self.update_status(|status| {
            status.state = SyncState::Error;
            status.last_error = Some("unauthorized".to_string());
        });
        let callback = self.on_unauthorized.lock().unwrap();
        if let Some(f) = callback.as_ref() {
            f();
        }
    }

    /// Spawn the keep-alive task if it is configured and not yet running.
    fn arm_keepalive(self: &Arc<Self>, timers: &mut TimerChannels) {
        if timers.keepalive.is_some() {
            return;
        }
        let Some(interval) = self.config.keepalive() else {
            return;
        };
        let (tx, rx) = mpsc::channel(8);
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            keepalive_loop(manager, interval, rx).await;
        });
        timers.keepalive = Some(tx);
    }

    /// After a transient failure the remote may be cold-starting; make sure
    /// the keep-alive probe is armed and pull its next ping closer.
    fn nudge_keepalive(self: &Arc<Self>) {
        let sender = {
            let mut timers = self.timers.lock().unwrap();
            self.arm_keepalive(&mut timers);
            timers.keepalive.clone()
        };
        if let Some(tx) = sender {
            let _ = tx.try_send(KeepaliveMessage::Nudge);
        }
    }

    fn set_state(&self, state: SyncState) {
        self.update_status(|status| {
            status.state = state;
            if state != SyncState::Error && state != SyncState::Offline {
                status.last_error = None;
            }
        });
    }

    fn set_success(&self) {
        self.update_status(|status| {
            status.state = SyncState::Idle;
            status.last_error = None;
            status.last_success = Some(Utc::now());
        });
    }

    fn set_failure(&self, error: &SyncError) {
        let state = if error.is_connectivity() {
            SyncState::Offline
        } else {
            SyncState::Error
        };
        let message = error.to_string();
        self.update_status(|status| {
            status.state = state;
            status.last_error = Some(message);
        });
    }

    fn set_pending_push(&self, pending: bool) {
        self.update_status(|status| status.pending_push = pending);
    }

    fn update_status<F>(&self, f: F)
    where
        F: FnOnce(&mut SyncStatus),
    {
        let snapshot = {
            let mut status = self.status.lock().unwrap();
            f(&mut status);
            status.clone()
        };
        let callback = self.on_status.lock().unwrap();
        if let Some(cb) = callback.as_ref() {
            cb(snapshot);
        }
    }
}

/// Trailing-edge debounce: every Schedule resets the deadline; the push
/// fires only after a full quiet period.
async fn debounce_loop(manager: Arc<SyncManager>, mut receiver: mpsc::Receiver<DebounceMessage>) {
    let mut deadline: Option<Instant> = None;
    loop {
        let wait = async {
            match deadline {
                Some(at) => sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            _ = wait => {
                deadline = None;
                manager.set_pending_push(false);
                manager.push_state(PushOptions::default()).await;
            }
            msg = receiver.recv() => match msg {
                Some(DebounceMessage::Schedule) => {
                    deadline = Some(Instant::now() + manager.config.debounce());
                    manager.set_pending_push(true);
                }
                Some(DebounceMessage::Cancel) => {
                    deadline = None;
                    manager.set_pending_push(false);
                }
                Some(DebounceMessage::Shutdown) | None => {
                    manager.set_pending_push(false);
                    break;
                }
            }
        }
    }
    log::debug!("Debounce task ended");
}

/// Fixed-cadence pull with skip-if-unchanged. Overlap with an in-flight
/// push/pull is handled by the guards (the tick is simply skipped).
async fn poll_loop(manager: Arc<SyncManager>, mut receiver: mpsc::Receiver<PollMessage>) {
    let interval = manager.config.poll_interval();
    loop {
        tokio::select! {
            _ = sleep(interval) => {
                manager
                    .pull_latest(PullOptions { skip_if_unchanged: true })
                    .await;
            }
            msg = receiver.recv() => match msg {
                Some(PollMessage::Shutdown) | None => break,
            }
        }
    }
    log::info!("Polling stopped");
}

/// Low-frequency health ping to keep a cold-starting backend warm. A Nudge
/// pulls the next ping closer after a transient failure.
async fn keepalive_loop(
    manager: Arc<SyncManager>,
    interval: Duration,
    mut receiver: mpsc::Receiver<KeepaliveMessage>,
) {
    let mut deadline = Instant::now() + interval;
    loop {
        tokio::select! {
            _ = sleep_until(deadline) => {
                deadline = Instant::now() + interval;
                if let Some(client) = &manager.client {
                    match client.ping().await {
                        Ok(()) => log::debug!("Keep-alive ping ok"),
                        Err(e) => log::debug!("Keep-alive ping failed: {}", e),
                    }
                }
            }
            msg = receiver.recv() => match msg {
                Some(KeepaliveMessage::Nudge) => {
                    let soon = Instant::now() + Duration::from_secs(KEEPALIVE_NUDGE_SECS);
                    if soon < deadline {
                        deadline = soon;
                    }
                }
                Some(KeepaliveMessage::Shutdown) | None => break,
            }
        }
    }
    log::debug!("Keep-alive task ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use axum::extract::Request;
    use axum::http::StatusCode;
    use axum::middleware::Next;
    use axum::routing::get;
    use axum::Json;
    use serde_json::json;

    use crate::server::store::{MemoryAuthStore, MemoryStateStore, StateStore};
    use crate::server::{build_router, AppState, AuthService};
    use crate::state::StateDocument;
    use crate::store::MemoryKeyValueStore;

    const TEST_EMAIL: &str = "user@example.com";

    struct TestServer {
        base_url: String,
        token: String,
        store: Arc<MemoryStateStore>,
        puts: Arc<AtomicUsize>,
    }

    async fn spawn_server() -> TestServer {
        spawn_server_with_put_delay(Duration::ZERO).await
    }

    /// Like [`spawn_server`], but every PUT is held for `put_delay` before
    /// it reaches the store, widening the in-flight window.
    async fn spawn_server_with_put_delay(put_delay: Duration) -> TestServer {
        let store = Arc::new(MemoryStateStore::new());
        let auth = AuthService::new(Arc::new(MemoryAuthStore::new()));
        let token = auth.register(TEST_EMAIL, "hunter2").await.unwrap();
        let app_state = Arc::new(AppState::new(store.clone(), auth));

        let puts = Arc::new(AtomicUsize::new(0));
        let counter = puts.clone();
        let router = build_router(app_state).layer(axum::middleware::from_fn(
            move |req: Request, next: Next| {
                let counter = counter.clone();
                async move {
                    if req.method() == axum::http::Method::PUT {
                        counter.fetch_add(1, Ordering::SeqCst);
                        if !put_delay.is_zero() {
                            sleep(put_delay).await;
                        }
                    }
                    next.run(req).await
                }
            },
        ));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        TestServer {
            base_url: format!("http://{}", addr),
            token,
            store,
            puts,
        }
    }

    fn make_session() -> Arc<Session> {
        Arc::new(Session::open(Arc::new(MemoryKeyValueStore::new()), "test"))
    }

    fn make_manager(server: &TestServer, session: Arc<Session>) -> Arc<SyncManager> {
        let config = SyncConfig {
            server_url: server.base_url.clone(),
            poll_interval_ms: 500,
            debounce_ms: 80,
            keepalive_secs: None,
            ..SyncConfig::default()
        };
        SyncManager::new(session, config, Some(&server.token))
    }

    #[tokio::test]
    async fn test_fresh_user_seeds_then_pulls_back() {
        let server = spawn_server().await;
        let session = make_session();
        let manager = make_manager(&server, session.clone());

        let outcome = manager.pull_latest(PullOptions::default()).await;
        assert!(outcome.not_found);

        assert!(manager.force_push().await);
        assert_eq!(manager.last_synced_version(), Some(0));

        // A second device sees the seeded document unchanged.
        let other_session = make_session();
        let other = make_manager(&server, other_session.clone());
        let outcome = other.pull_latest(PullOptions::default()).await;
        assert!(outcome.applied);
        assert_eq!(other_session.version(), 0);
        assert!(other_session.snapshot().tasks.is_empty());
    }

    #[tokio::test]
    async fn test_push_then_pull_roundtrip() {
        let server = spawn_server().await;
        let session = make_session();
        let manager = make_manager(&server, session.clone());

        session.add_task("buy milk", None);
        assert!(manager.push_state(PushOptions::default()).await);

        let other_session = make_session();
        let other = make_manager(&server, other_session.clone());
        assert!(other.pull_latest(PullOptions::default()).await.applied);
        assert_eq!(other_session.snapshot().tasks[0].text, "buy milk");
    }

    #[tokio::test]
    async fn test_push_noop_when_already_synced() {
        let server = spawn_server().await;
        let session = make_session();
        let manager = make_manager(&server, session.clone());

        session.add_task("one", None);
        assert!(manager.push_state(PushOptions::default()).await);
        let puts_before = server.puts.load(Ordering::SeqCst);

        assert!(!manager.push_state(PushOptions::default()).await);
        assert_eq!(server.puts.load(Ordering::SeqCst), puts_before);
    }

    #[tokio::test]
    async fn test_pull_discards_stale_remote() {
        let server = spawn_server().await;
        let session = make_session();
        let manager = make_manager(&server, session.clone());

        let mut doc = StateDocument::default_state();
        doc.meta.version = 2;
        server.store.save(TEST_EMAIL, doc, None).await.unwrap();

        // This client has already seen v5; the stored v2 must not regress it.
        manager.record_synced(5);
        let local_before = session.snapshot();
        let outcome = manager.pull_latest(PullOptions::default()).await;
        assert!(outcome.skipped);
        assert_eq!(session.snapshot(), local_before);
        assert_eq!(manager.last_synced_version(), Some(5));
    }

    #[tokio::test]
    async fn test_skip_if_unchanged_suppresses_reapply() {
        let server = spawn_server().await;
        let session = make_session();
        let manager = make_manager(&server, session.clone());

        session.add_task("one", None);
        assert!(manager.push_state(PushOptions::default()).await);

        let outcome = manager
            .pull_latest(PullOptions {
                skip_if_unchanged: true,
            })
            .await;
        assert!(outcome.skipped);
    }

    /// Two devices, one conflict: A pushes first, B's push is rejected,
    /// B pulls and retries. Whole-document semantics mean B's concurrent
    /// edit is superseded by A's snapshot (last pull wins), and both
    /// devices converge on the server's final version.
    #[tokio::test]
    async fn test_two_device_conflict_convergence() {
        let server = spawn_server().await;
        let session_a = make_session();
        let manager_a = make_manager(&server, session_a.clone());
        let session_b = make_session();
        let manager_b = make_manager(&server, session_b.clone());

        // Both devices start synced at v1.
        session_a.add_task("first", None);
        assert!(manager_a.force_push().await);
        assert!(manager_b.pull_latest(PullOptions::default()).await.applied);
        assert_eq!(manager_a.last_synced_version(), Some(1));
        assert_eq!(manager_b.last_synced_version(), Some(1));

        // A wins the race.
        session_a.add_task("second", None);
        assert!(manager_a.push_state(PushOptions::default()).await);
        assert_eq!(manager_a.last_synced_version(), Some(2));

        // B edits against the stale ancestor; its push conflicts, pulls,
        // and retries.
        session_b.add_task("rival", None);
        assert!(manager_b.push_state(PushOptions::default()).await);
        assert_eq!(manager_b.last_synced_version(), Some(3));
        assert_eq!(session_b.version(), 3);

        let stored = server.store.load(TEST_EMAIL).await.unwrap().unwrap();
        assert_eq!(stored.meta.version, 3);
        assert_eq!(stored.tasks.len(), 2);

        // A converges on the next pull.
        assert!(manager_a.pull_latest(PullOptions::default()).await.applied);
        assert_eq!(session_a.version(), 3);
        assert_eq!(manager_a.last_synced_version(), Some(3));
    }

    /// An edit that lands while a push is in flight must survive the
    /// server's confirmation: the newer version keeps counting as unsynced
    /// and the follow-up push delivers it.
    #[tokio::test]
    async fn test_edit_during_push_flight_still_syncs() {
        let server = spawn_server_with_put_delay(Duration::from_millis(300)).await;
        let session = make_session();
        let manager = make_manager(&server, session.clone());

        session.add_task("first", None);
        session.add_task("second", None);
        assert_eq!(session.version(), 2);

        let pusher = manager.clone();
        let inflight =
            tokio::spawn(async move { pusher.push_state(PushOptions::default()).await });
        sleep(Duration::from_millis(100)).await;
        session.add_task("third", None);
        assert!(inflight.await.unwrap());

        // The mid-flight edit kept its own version, so it still counts as
        // ahead of the synced ancestor.
        assert_eq!(session.version(), 3);
        assert_eq!(manager.last_synced_version(), Some(2));

        assert!(manager.push_state(PushOptions::default()).await);
        let stored = server.store.load(TEST_EMAIL).await.unwrap().unwrap();
        assert_eq!(stored.meta.version, 3);
        assert_eq!(stored.tasks.len(), 3);
    }

    /// A server that answers every PUT with 409 must exhaust the retry
    /// budget: one initial attempt plus `conflict_retry_limit` retries,
    /// then the push gives up without surfacing an error.
    #[tokio::test]
    async fn test_conflict_retries_exhaust_and_give_up() {
        let puts = Arc::new(AtomicUsize::new(0));
        let counter = puts.clone();
        let router = axum::Router::new().route(
            "/state",
            get(|| async { Json(json!({ "meta": { "version": 99 } })) }).put(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    (
                        StatusCode::CONFLICT,
                        Json(json!({
                            "error": "VERSION_CONFLICT",
                            "details": { "currentVersion": 99 }
                        })),
                    )
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        let session = make_session();
        let config = SyncConfig {
            server_url: base_url,
            keepalive_secs: None,
            ..SyncConfig::default()
        };
        let manager = SyncManager::new(session.clone(), config, Some("token"));
        let limit = manager.config.conflict_retry_limit as usize;

        session.add_task("contested", None);
        assert!(!manager.push_state(PushOptions::default()).await);

        assert_eq!(puts.load(Ordering::SeqCst), 1 + limit);
        // Each recovery pull applied the remote snapshot before the retry.
        assert_eq!(manager.last_synced_version(), Some(99));
        // Giving up is quiet: back to idle, nothing surfaced.
        assert_eq!(manager.status().state, SyncState::Idle);
        assert!(manager.status().last_error.is_none());
    }

    #[tokio::test]
    async fn test_debounce_coalesces_rapid_schedules() {
        let server = spawn_server().await;
        let session = make_session();
        let manager = make_manager(&server, session.clone());

        for i in 0..5 {
            session.add_task(&format!("task {}", i), None);
            manager.schedule_push();
        }
        sleep(Duration::from_millis(300)).await;

        assert_eq!(server.puts.load(Ordering::SeqCst), 1);
        assert_eq!(manager.last_synced_version(), Some(5));
    }

    #[tokio::test]
    async fn test_force_push_cancels_pending_debounce() {
        let server = spawn_server().await;
        let session = make_session();
        let manager = make_manager(&server, session.clone());

        session.add_task("one", None);
        manager.schedule_push();
        assert!(manager.force_push().await);
        sleep(Duration::from_millis(300)).await;

        // Only the forced push went out; the debounced one was disarmed.
        assert_eq!(server.puts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_push_rejected_while_pulling() {
        let server = spawn_server().await;
        let session = make_session();
        let manager = make_manager(&server, session.clone());
        session.add_task("one", None);

        manager.is_pulling.store(true, Ordering::SeqCst);
        assert!(!manager.push_state(PushOptions::default()).await);
        assert_eq!(server.puts.load(Ordering::SeqCst), 0);
        manager.is_pulling.store(false, Ordering::SeqCst);
    }

    #[tokio::test]
    async fn test_pull_rejected_while_pushing() {
        let server = spawn_server().await;
        let session = make_session();
        let manager = make_manager(&server, session.clone());

        manager.is_pushing.store(true, Ordering::SeqCst);
        let outcome = manager.pull_latest(PullOptions::default()).await;
        assert!(outcome.skipped);
        manager.is_pushing.store(false, Ordering::SeqCst);
    }

    #[tokio::test]
    async fn test_disabled_manager_is_inert() {
        let session = make_session();
        let manager = SyncManager::new(session.clone(), SyncConfig::default(), None);

        assert!(!manager.enabled());
        assert_eq!(manager.status().state, SyncState::Disabled);
        assert!(manager.pull_latest(PullOptions::default()).await.skipped);
        assert!(!manager.push_state(PushOptions { force: true, retry_count: 0 }).await);
        manager.schedule_push();
        manager.start_polling();
        manager.stop_polling();
        // Local editing keeps working regardless.
        session.add_task("offline edit", None);
        assert_eq!(session.version(), 1);
    }

    #[tokio::test]
    async fn test_polling_applies_remote_changes() {
        let server = spawn_server().await;
        let session_a = make_session();
        let manager_a = make_manager(&server, session_a.clone());
        session_a.add_task("from device a", None);
        assert!(manager_a.force_push().await);

        let session_b = make_session();
        let manager_b = make_manager(&server, session_b.clone());
        manager_b.start_polling();
        sleep(Duration::from_millis(1_200)).await;
        manager_b.stop_polling();

        assert_eq!(session_b.snapshot().tasks.len(), 1);
        assert_eq!(manager_b.last_synced_version(), Some(1));
    }

    #[tokio::test]
    async fn test_unauthorized_fires_callback() {
        let server = spawn_server().await;
        let session = make_session();
        let config = SyncConfig {
            server_url: server.base_url.clone(),
            keepalive_secs: None,
            ..SyncConfig::default()
        };
        let manager = SyncManager::new(session, config, Some("bogus-token"));

        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        manager.on_unauthorized(move || {
            flag.store(true, Ordering::SeqCst);
        });

        let outcome = manager.pull_latest(PullOptions::default()).await;
        assert_eq!(outcome.error.as_deref(), Some("unauthorized"));
        assert!(fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_transient_error_goes_offline_and_arms_keepalive() {
        let session = make_session();
        // Nothing listens here; the connect attempt is refused immediately.
        let config = SyncConfig {
            server_url: "http://127.0.0.1:9".to_string(),
            keepalive_secs: Some(300),
            ..SyncConfig::default()
        };
        let manager = SyncManager::new(session, config, Some("token"));

        let outcome = manager.pull_latest(PullOptions::default()).await;
        assert!(outcome.error.is_some());
        assert_eq!(manager.status().state, SyncState::Offline);
        assert!(manager.timers.lock().unwrap().keepalive.is_some());
        manager.shutdown();
    }

    #[tokio::test]
    async fn test_status_callback_reports_transitions() {
        let server = spawn_server().await;
        let session = make_session();
        let manager = make_manager(&server, session.clone());

        let saw_pushing = Arc::new(AtomicBool::new(false));
        let flag = saw_pushing.clone();
        manager.on_status_change(move |status| {
            if status.state == SyncState::Pushing {
                flag.store(true, Ordering::SeqCst);
            }
        });

        session.add_task("one", None);
        assert!(manager.push_state(PushOptions::default()).await);
        assert!(saw_pushing.load(Ordering::SeqCst));
        assert_eq!(manager.status().state, SyncState::Idle);
        assert_eq!(manager.status().last_synced_version, Some(1));
    }
}
