//! Session lifecycle state machine and its supervision timers.
//!
//! One controller owns the single automation-client handle for the process.
//! Authentication completes asynchronously: `initialize()` starts the
//! client and arms the auth-timeout timer, then the event pump moves the
//! state machine as the client reports QR payloads, authentication and
//! disconnects.

pub mod blob;

pub use blob::BlobStore;

use crate::client::{AutomationClient, ClientEvent, ClientFactory};
use crate::config::SessionConfig;
use crate::error::Error;
use crate::retry::RetryPolicy;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Where the session currently is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Initializing,
    QrPending,
    Authenticated,
    Disconnected,
    AuthError,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Initializing => write!(f, "initializing"),
            Self::QrPending => write!(f, "qr_pending"),
            Self::Authenticated => write!(f, "authenticated"),
            Self::Disconnected => write!(f, "disconnected"),
            Self::AuthError => write!(f, "auth_error"),
        }
    }
}

/// Read-only view of the session, servable in any state.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub id: String,
    pub state: SessionState,
    pub qr_payload: Option<String>,
    pub last_auth_error: Option<String>,
    pub authenticated_at: Option<DateTime<Utc>>,
}

struct Inner {
    state: SessionState,
    qr_payload: Option<String>,
    last_auth_error: Option<String>,
    authenticated_at: Option<DateTime<Utc>>,
    client: Option<Arc<dyn AutomationClient>>,
    auth_timer: Option<JoinHandle<()>>,
    idle_timer: Option<JoinHandle<()>>,
    event_pump: Option<JoinHandle<()>>,
}

pub struct SessionController {
    weak: Weak<SessionController>,
    config: SessionConfig,
    factory: Arc<dyn ClientFactory>,
    blobs: Arc<BlobStore>,
    inner: Mutex<Inner>,
    /// Serializes `initialize()` so concurrent callers cannot race the
    /// single client handle.
    init_gate: tokio::sync::Mutex<()>,
    /// Bumped on every initialize/close. A fired timer whose generation no
    /// longer matches belongs to a superseded lifecycle and must no-op.
    generation: AtomicU64,
}

impl SessionController {
    pub fn new(
        config: SessionConfig,
        factory: Arc<dyn ClientFactory>,
        blobs: Arc<BlobStore>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            config,
            factory,
            blobs,
            inner: Mutex::new(Inner {
                state: SessionState::Idle,
                qr_payload: None,
                last_auth_error: None,
                authenticated_at: None,
                client: None,
                auth_timer: None,
                idle_timer: None,
                event_pump: None,
            }),
            init_gate: tokio::sync::Mutex::new(()),
            generation: AtomicU64::new(0),
        })
    }

    // ── Pure reads ──────────────────────────────────────────────

    pub fn session_id(&self) -> &str {
        &self.config.id
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    pub fn is_authenticated(&self) -> bool {
        self.state() == SessionState::Authenticated
    }

    pub fn qr_code(&self) -> Option<String> {
        self.inner.lock().qr_payload.clone()
    }

    pub fn auth_error(&self) -> Option<String> {
        self.inner.lock().last_auth_error.clone()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let inner = self.inner.lock();
        SessionSnapshot {
            id: self.config.id.clone(),
            state: inner.state,
            qr_payload: inner.qr_payload.clone(),
            last_auth_error: inner.last_auth_error.clone(),
            authenticated_at: inner.authenticated_at,
        }
    }

    /// The live client handle, if any. Scans borrow it through here so the
    /// controller stays the only owner.
    pub fn client(&self) -> Option<Arc<dyn AutomationClient>> {
        self.inner.lock().client.clone()
    }

    // ── Lifecycle ───────────────────────────────────────────────

    /// Start the automation client and arm authentication supervision.
    ///
    /// Idempotent: a session that is already starting or authenticated is
    /// left alone. Client startup is retried with linearly growing delay;
    /// every failed attempt tears its handle down completely before the
    /// next one.
    pub async fn initialize(&self) -> Result<(), Error> {
        let _gate = self.init_gate.lock().await;

        {
            let inner = self.inner.lock();
            if matches!(
                inner.state,
                SessionState::Initializing | SessionState::QrPending | SessionState::Authenticated
            ) {
                tracing::debug!(state = %inner.state, "initialize is a no-op in this state");
                return Ok(());
            }
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        {
            let mut inner = self.inner.lock();
            inner.state = SessionState::Initializing;
            inner.qr_payload = None;
            inner.last_auth_error = None;
        }
        self.arm_auth_timer(generation);

        let restored = match self.blobs.extract(&self.config.id).await {
            Ok(blob) => blob,
            Err(e) => {
                tracing::warn!(session = %self.config.id, "session restore failed, starting fresh: {e}");
                None
            }
        };
        if let Some(blob) = &restored {
            tracing::info!(session = %self.config.id, bytes = blob.len(), "restoring persisted session artifact");
        }

        let policy = RetryPolicy::linear(self.config.max_retries, self.config.retry_delay());
        let startup = policy
            .run("automation client startup", || {
                let factory = Arc::clone(&self.factory);
                let restored = restored.clone();
                async move {
                    let client = factory.create()?;
                    match client.initialize(restored.as_deref()).await {
                        Ok(()) => Ok(client),
                        Err(e) => {
                            if let Err(teardown) = client.destroy().await {
                                tracing::debug!("failed attempt teardown: {teardown}");
                            }
                            Err(e)
                        }
                    }
                }
            })
            .await;

        match startup {
            Ok(client) => {
                let events = client.subscribe();
                self.inner.lock().client = Some(client);
                self.spawn_event_pump(generation, events);
                Ok(())
            }
            Err(cause) => {
                let attempts = self.config.max_retries.max(1);
                let mut inner = self.inner.lock();
                if let Some(timer) = inner.auth_timer.take() {
                    timer.abort();
                }
                inner.state = SessionState::AuthError;
                inner.last_auth_error = Some(cause.to_string());
                tracing::error!(session = %self.config.id, "initialization failed: {cause:#}");
                Err(Error::Initialization { attempts, cause })
            }
        }
    }

    /// Tear everything down and return to IDLE. With `preserve_session`
    /// false the persisted artifact is removed as well.
    pub async fn close(&self, preserve_session: bool) {
        self.generation.fetch_add(1, Ordering::SeqCst);

        let client = {
            let mut inner = self.inner.lock();
            for task in [
                inner.auth_timer.take(),
                inner.idle_timer.take(),
                inner.event_pump.take(),
            ]
            .into_iter()
            .flatten()
            {
                task.abort();
            }
            inner.state = SessionState::Idle;
            inner.qr_payload = None;
            inner.last_auth_error = None;
            inner.authenticated_at = None;
            inner.client.take()
        };

        if let Some(client) = client {
            if let Err(e) = client.destroy().await {
                tracing::warn!("automation client teardown failed: {e}");
            }
        }

        if !preserve_session {
            if let Err(e) = self.blobs.delete(&self.config.id).await {
                tracing::warn!(session = %self.config.id, "persisted artifact delete failed: {e}");
            }
        }

        tracing::info!(session = %self.config.id, preserve_session, "session closed");
    }

    /// Invalidate the session on the remote platform, then close without
    /// preserving the artifact.
    pub async fn logout(&self) {
        let client = self.client();
        if let Some(client) = client {
            if let Err(e) = client.logout().await {
                tracing::warn!("remote logout failed: {e}");
            }
        }
        self.close(false).await;
    }

    // ── Activity tracking (idle auto-close) ─────────────────────

    /// A unit of work is starting: any pending idle close is cancelled.
    pub fn begin_activity(&self) {
        if let Some(timer) = self.inner.lock().idle_timer.take() {
            timer.abort();
        }
    }

    /// A unit of work finished: arm the idle auto-close, replacing any
    /// previously armed one.
    pub fn end_activity(&self) {
        if !self.config.idle_close_enabled || !self.is_authenticated() {
            return;
        }
        let generation = self.generation.load(Ordering::SeqCst);
        let window = self.config.idle_close_window();
        let weak = self.weak.clone();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(window).await;
            let Some(controller) = weak.upgrade() else {
                return;
            };
            if controller.generation.load(Ordering::SeqCst) != generation {
                return;
            }
            if !controller.is_authenticated() {
                return;
            }
            // Detach our own handle so close() cannot cancel this task
            // mid-teardown.
            drop(controller.inner.lock().idle_timer.take());
            tracing::info!(
                idle_secs = window.as_secs(),
                "session idle, closing and preserving the artifact"
            );
            controller.close(true).await;
        });

        if let Some(old) = self.inner.lock().idle_timer.replace(handle) {
            old.abort();
        }
    }

    // ── Supervision internals ───────────────────────────────────

    fn arm_auth_timer(&self, generation: u64) {
        let window = self.config.auth_timeout();
        let weak = self.weak.clone();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(window).await;
            let Some(controller) = weak.upgrade() else {
                return;
            };
            if controller.generation.load(Ordering::SeqCst) != generation {
                return;
            }
            if controller.is_authenticated() {
                return;
            }
            // Detach our own handle so close() cannot cancel this task
            // mid-teardown.
            drop(controller.inner.lock().auth_timer.take());
            tracing::warn!(
                window_secs = window.as_secs(),
                "no authentication within the configured window, forcing close"
            );
            controller.close(true).await;
            let mut inner = controller.inner.lock();
            inner.state = SessionState::AuthError;
            inner.last_auth_error = Some(Error::AuthTimeout { window }.to_string());
        });

        if let Some(old) = self.inner.lock().auth_timer.replace(handle) {
            old.abort();
        }
    }

    fn spawn_event_pump(&self, generation: u64, mut events: broadcast::Receiver<ClientEvent>) {
        let weak = self.weak.clone();

        let handle = tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "client event stream lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let Some(controller) = weak.upgrade() else {
                    break;
                };
                if controller.generation.load(Ordering::SeqCst) != generation {
                    break;
                }
                controller.handle_client_event(event).await;
            }
        });

        if let Some(old) = self.inner.lock().event_pump.replace(handle) {
            old.abort();
        }
    }

    async fn handle_client_event(&self, event: ClientEvent) {
        match event {
            ClientEvent::Qr(payload) => {
                let mut inner = self.inner.lock();
                if matches!(
                    inner.state,
                    SessionState::Initializing | SessionState::QrPending
                ) {
                    inner.state = SessionState::QrPending;
                    inner.qr_payload = Some(payload);
                    tracing::info!("pairing QR received, waiting for scan");
                }
            }
            ClientEvent::Authenticated | ClientEvent::Ready => {
                let newly_authenticated = {
                    let mut inner = self.inner.lock();
                    let first = inner.state != SessionState::Authenticated;
                    inner.state = SessionState::Authenticated;
                    inner.qr_payload = None;
                    if first {
                        inner.authenticated_at = Some(Utc::now());
                    }
                    first
                };
                if newly_authenticated {
                    if let Some(timer) = self.inner.lock().auth_timer.take() {
                        timer.abort();
                    }
                    tracing::info!(session = %self.config.id, "session authenticated");
                    self.persist_artifact().await;
                }
            }
            ClientEvent::AuthFailure(reason) => {
                // Recorded but not fatal: the caller decides whether to
                // retry or reset.
                tracing::warn!(session = %self.config.id, "authentication failure: {reason}");
                self.inner.lock().last_auth_error = Some(reason);
            }
            ClientEvent::Disconnected(reason) => {
                tracing::warn!(session = %self.config.id, "client disconnected: {reason}");
                self.inner.lock().state = SessionState::Disconnected;
                let weak = self.weak.clone();
                tokio::spawn(async move {
                    let Some(controller) = weak.upgrade() else {
                        return;
                    };
                    controller.close(true).await;
                    if let Err(e) = controller.initialize().await {
                        tracing::error!("automatic reconnect failed: {e}");
                    }
                });
            }
        }
    }

    /// Export the client's session artifact and persist it. Best-effort:
    /// a persistence failure degrades resume, not the live session.
    async fn persist_artifact(&self) {
        let Some(client) = self.client() else {
            return;
        };
        match client.export_session().await {
            Ok(Some(blob)) => {
                if let Err(e) = self.blobs.save(&self.config.id, &blob).await {
                    tracing::warn!(session = %self.config.id, "artifact persistence failed: {e}");
                }
            }
            Ok(None) => {
                tracing::debug!(session = %self.config.id, "client has no session artifact to export");
            }
            Err(e) => {
                tracing::warn!(session = %self.config.id, "artifact export failed: {e}");
            }
        }
    }
}
