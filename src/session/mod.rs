//! Wallet session lifecycle.
//!
//! ```text
//!   Disconnected ──connect──▶ Connecting ──ok──▶ Connected
//!        ▲   │                    │                  │
//!        │   └──hydrate──▶ Hydrating ──restored──────┘
//!        │                    │   │
//!        └────err / none──────┴───┘◀──── disconnect (from any state)
//! ```
//!
//! The lifecycle observes the external wallet capability and never edits
//! its session. Every connect, hydrate and disconnect starts a new epoch;
//! a capability call that resolves after its epoch has passed is dropped,
//! so a late "connected" cannot resurrect a session the user already left.
//!
//! Transitions reach observers in the order they happen, and `Connected`
//! carries the session, so no observer can see it without an identity.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::token::Identity;

pub const LANDING_PATH: &str = "/";
pub const DASHBOARD_PATH: &str = "/dashboard";

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct WalletSession {
    pub identity: Identity,
    pub display_name: Option<String>,
}

impl WalletSession {
    pub fn new(identity: impl Into<Identity>) -> Self {
        Self {
            identity: identity.into(),
            display_name: None,
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum FeeMode {
    /// Fees sponsored by the relayer.
    #[default]
    Paymaster,
    User,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ConnectOptions {
    pub fee_mode: FeeMode,
}

#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Disconnected,
    Connecting,
    /// Session exists but its identity is not known yet.
    Hydrating,
    Connected(WalletSession),
}

impl SessionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, SessionState::Connected(_))
    }

    pub fn session(&self) -> Option<&WalletSession> {
        match self {
            SessionState::Connected(session) => Some(session),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Hydrating => "hydrating",
            SessionState::Connected(_) => "connected",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transition {
    pub from: SessionState,
    pub to: SessionState,
    pub epoch: u64,
}

impl Transition {
    /// The identity of a session that just became active, if this is a
    /// connect edge.
    pub fn connected_edge(&self) -> Option<&WalletSession> {
        if self.from.is_connected() {
            return None;
        }
        self.to.session()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("passkey prompt cancelled")]
    Cancelled,
    #[error("wallet rejected connection: {0}")]
    Rejected(String),
    #[error("wallet service unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("another session operation is in progress")]
    Busy,
    #[error("session changed while the wallet was responding")]
    Stale,
    #[error(transparent)]
    Connect(#[from] ConnectError),
}

/// The external wallet-connection capability.
#[async_trait]
pub trait WalletConnector: Send + Sync {
    async fn connect(&self, options: &ConnectOptions) -> Result<WalletSession, ConnectError>;

    async fn disconnect(&self) -> Result<(), ConnectError>;

    /// Session left over from an earlier page load or auth redirect.
    async fn restore(&self) -> Result<Option<WalletSession>, ConnectError> {
        Ok(None)
    }
}

pub trait Navigator: Send + Sync {
    fn navigate(&self, path: &str);
}

pub trait SessionObserver: Send + Sync {
    fn on_transition(&self, transition: &Transition);
}

struct Inner {
    state: SessionState,
    epoch: u64,
}

pub struct SessionLifecycle {
    connector: Arc<dyn WalletConnector>,
    inner: Mutex<Inner>,
    // held while a transition is applied and delivered
    delivery: Mutex<()>,
    observers: Mutex<Vec<Arc<dyn SessionObserver>>>,
}

impl SessionLifecycle {
    pub fn new(connector: Arc<dyn WalletConnector>) -> Self {
        Self {
            connector,
            inner: Mutex::new(Inner {
                state: SessionState::Disconnected,
                epoch: 0,
            }),
            delivery: Mutex::new(()),
            observers: Mutex::new(Vec::new()),
        }
    }

    /// Observers run inside transition delivery and must not call back into
    /// `connect`, `hydrate` or `disconnect`.
    pub fn subscribe(&self, observer: Arc<dyn SessionObserver>) {
        self.observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(observer);
    }

    pub fn state(&self) -> SessionState {
        self.inner().state.clone()
    }

    pub fn epoch(&self) -> u64 {
        self.inner().epoch
    }

    pub fn current_session(&self) -> Option<WalletSession> {
        self.inner().state.session().cloned()
    }

    /// Connected session together with the epoch it belongs to, read under
    /// one lock.
    pub fn active_session(&self) -> Option<(u64, WalletSession)> {
        let inner = self.inner();
        inner.state.session().map(|s| (inner.epoch, s.clone()))
    }

    pub async fn connect(&self, options: &ConnectOptions) -> Result<WalletSession, SessionError> {
        let epoch = match self.begin(SessionState::Connecting)? {
            Begin::Started(epoch) => epoch,
            Begin::AlreadyConnected(session) => return Ok(session),
        };
        info!(fee_mode = ?options.fee_mode, "connecting wallet");
        match self.connector.connect(options).await {
            Ok(session) => {
                self.settle(epoch, SessionState::Connected(session.clone()))?;
                Ok(session)
            }
            Err(error) => {
                warn!(%error, "wallet connection failed");
                // a stale failure leaves the newer state alone
                let _ = self.settle(epoch, SessionState::Disconnected);
                Err(error.into())
            }
        }
    }

    /// Picks up a session that survived a reload or the passkey portal
    /// redirect. Hydration is never reported as `Disconnected` until the
    /// capability says there is nothing to restore.
    pub async fn hydrate(&self) -> Result<Option<WalletSession>, SessionError> {
        let epoch = match self.begin(SessionState::Hydrating)? {
            Begin::Started(epoch) => epoch,
            Begin::AlreadyConnected(session) => return Ok(Some(session)),
        };
        match self.connector.restore().await {
            Ok(Some(session)) => {
                self.settle(epoch, SessionState::Connected(session.clone()))?;
                Ok(Some(session))
            }
            Ok(None) => {
                self.settle(epoch, SessionState::Disconnected)?;
                Ok(None)
            }
            Err(error) => {
                warn!(%error, "wallet session restore failed");
                let _ = self.settle(epoch, SessionState::Disconnected);
                Err(error.into())
            }
        }
    }

    /// Always ends in `Disconnected`; a failing teardown is only logged.
    pub async fn disconnect(&self) {
        {
            let _delivery = self.delivery();
            let transition = {
                let mut inner = self.inner();
                inner.epoch += 1;
                let from = std::mem::replace(&mut inner.state, SessionState::Disconnected);
                Transition {
                    from,
                    to: SessionState::Disconnected,
                    epoch: inner.epoch,
                }
            };
            self.deliver(&transition);
        }
        if let Err(error) = self.connector.disconnect().await {
            warn!(%error, "wallet teardown failed, session dropped locally");
        }
    }

    fn begin(&self, pending: SessionState) -> Result<Begin, SessionError> {
        let _delivery = self.delivery();
        let transition = {
            let mut inner = self.inner();
            match &inner.state {
                SessionState::Connected(session) => {
                    return Ok(Begin::AlreadyConnected(session.clone()))
                }
                SessionState::Connecting | SessionState::Hydrating => {
                    debug!(state = inner.state.name(), "session operation already running");
                    return Err(SessionError::Busy);
                }
                SessionState::Disconnected => {}
            }
            inner.epoch += 1;
            let from = std::mem::replace(&mut inner.state, pending.clone());
            Transition {
                from,
                to: pending,
                epoch: inner.epoch,
            }
        };
        self.deliver(&transition);
        Ok(Begin::Started(transition.epoch))
    }

    fn settle(&self, epoch: u64, to: SessionState) -> Result<(), SessionError> {
        let _delivery = self.delivery();
        let transition = {
            let mut inner = self.inner();
            if inner.epoch != epoch {
                debug!(
                    expected = epoch,
                    current = inner.epoch,
                    "dropping stale wallet response"
                );
                return Err(SessionError::Stale);
            }
            let from = std::mem::replace(&mut inner.state, to.clone());
            Transition { from, to, epoch }
        };
        self.deliver(&transition);
        Ok(())
    }

    fn deliver(&self, transition: &Transition) {
        if transition.from == transition.to {
            return;
        }
        debug!(
            from = transition.from.name(),
            to = transition.to.name(),
            epoch = transition.epoch,
            "session transition"
        );
        let observers = self
            .observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for observer in observers {
            observer.on_transition(transition);
        }
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn delivery(&self) -> MutexGuard<'_, ()> {
        self.delivery.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

enum Begin {
    Started(u64),
    AlreadyConnected(WalletSession),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RouteDecision {
    Render,
    Redirect(&'static str),
    /// Identity still hydrating; hold the current view.
    Wait,
}

pub fn is_protected(path: &str) -> bool {
    path == DASHBOARD_PATH || path.starts_with("/dashboard/")
}

pub fn guard_route(state: &SessionState, path: &str) -> RouteDecision {
    if !is_protected(path) {
        return RouteDecision::Render;
    }
    match state {
        SessionState::Connected(_) => RouteDecision::Render,
        SessionState::Hydrating => RouteDecision::Wait,
        SessionState::Disconnected | SessionState::Connecting => {
            RouteDecision::Redirect(LANDING_PATH)
        }
    }
}

/// Sends the user back to the landing page when an active session ends.
pub struct RouteGuard {
    navigator: Arc<dyn Navigator>,
}

impl RouteGuard {
    pub fn new(navigator: Arc<dyn Navigator>) -> Self {
        Self { navigator }
    }
}

impl SessionObserver for RouteGuard {
    fn on_transition(&self, transition: &Transition) {
        if transition.from.is_connected() && !transition.to.is_connected() {
            info!(path = LANDING_PATH, "session ended, leaving protected view");
            self.navigator.navigate(LANDING_PATH);
        }
    }
}

/// Navigator that keeps every visited path.
#[derive(Debug, Default)]
pub struct HistoryNavigator {
    visited: Mutex<Vec<String>>,
}

impl HistoryNavigator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn visited(&self) -> Vec<String> {
        self.visited
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn current(&self) -> String {
        self.visited()
            .last()
            .cloned()
            .unwrap_or_else(|| LANDING_PATH.to_string())
    }
}

impl Navigator for HistoryNavigator {
    fn navigate(&self, path: &str) {
        debug!(path, "navigate");
        self.visited
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(path.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::Notify;

    #[derive(Default)]
    struct ScriptedConnector {
        fail_connect: AtomicBool,
        fail_disconnect: AtomicBool,
        restored: Mutex<Option<WalletSession>>,
        gate: Option<Arc<Notify>>,
    }

    #[async_trait]
    impl WalletConnector for ScriptedConnector {
        async fn connect(&self, _options: &ConnectOptions) -> Result<WalletSession, ConnectError> {
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            if self.fail_connect.load(Ordering::SeqCst) {
                return Err(ConnectError::Cancelled);
            }
            Ok(WalletSession::new("wallet-y").with_display_name("Yara"))
        }

        async fn disconnect(&self) -> Result<(), ConnectError> {
            if self.fail_disconnect.load(Ordering::SeqCst) {
                return Err(ConnectError::Unavailable("portal offline".into()));
            }
            Ok(())
        }

        async fn restore(&self) -> Result<Option<WalletSession>, ConnectError> {
            Ok(self.restored.lock().unwrap().clone())
        }
    }

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(&'static str, &'static str)>>,
    }

    impl SessionObserver for Recorder {
        fn on_transition(&self, transition: &Transition) {
            if let SessionState::Connected(session) = &transition.to {
                assert!(!session.identity.is_empty());
            }
            self.seen
                .lock()
                .unwrap()
                .push((transition.from.name(), transition.to.name()));
        }
    }

    fn harness(connector: ScriptedConnector) -> (Arc<SessionLifecycle>, Arc<Recorder>) {
        let lifecycle = Arc::new(SessionLifecycle::new(Arc::new(connector)));
        let recorder = Arc::new(Recorder::default());
        lifecycle.subscribe(recorder.clone());
        (lifecycle, recorder)
    }

    #[tokio::test]
    async fn connect_delivers_transitions_in_order() {
        let (lifecycle, recorder) = harness(ScriptedConnector::default());
        let session = lifecycle.connect(&ConnectOptions::default()).await.unwrap();
        assert_eq!(session.identity, "wallet-y");
        assert!(lifecycle.state().is_connected());
        assert_eq!(
            *recorder.seen.lock().unwrap(),
            vec![
                ("disconnected", "connecting"),
                ("connecting", "connected")
            ]
        );
    }

    #[tokio::test]
    async fn connect_while_connected_returns_current_session() {
        let (lifecycle, recorder) = harness(ScriptedConnector::default());
        lifecycle.connect(&ConnectOptions::default()).await.unwrap();
        let again = lifecycle.connect(&ConnectOptions::default()).await.unwrap();
        assert_eq!(again.identity, "wallet-y");
        assert_eq!(recorder.seen.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn failed_connect_returns_to_disconnected() {
        let connector = ScriptedConnector::default();
        connector.fail_connect.store(true, Ordering::SeqCst);
        let (lifecycle, recorder) = harness(connector);
        let err = lifecycle
            .connect(&ConnectOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Connect(ConnectError::Cancelled)));
        assert_eq!(lifecycle.state(), SessionState::Disconnected);
        assert_eq!(
            recorder.seen.lock().unwrap().last(),
            Some(&("connecting", "disconnected"))
        );
    }

    #[tokio::test]
    async fn disconnect_is_fail_open() {
        let connector = ScriptedConnector::default();
        connector.fail_disconnect.store(true, Ordering::SeqCst);
        let (lifecycle, _) = harness(connector);
        lifecycle.connect(&ConnectOptions::default()).await.unwrap();
        lifecycle.disconnect().await;
        assert_eq!(lifecycle.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn late_connect_after_disconnect_is_dropped() {
        let gate = Arc::new(Notify::new());
        let connector = ScriptedConnector {
            gate: Some(gate.clone()),
            ..Default::default()
        };
        let (lifecycle, recorder) = harness(connector);
        let options = ConnectOptions::default();
        let pending = lifecycle.connect(&options);
        let user_leaves = async {
            tokio::task::yield_now().await;
            lifecycle.disconnect().await;
            gate.notify_one();
        };
        let (result, ()) = tokio::join!(pending, user_leaves);
        assert!(matches!(result, Err(SessionError::Stale)));
        assert_eq!(lifecycle.state(), SessionState::Disconnected);
        assert!(!recorder
            .seen
            .lock()
            .unwrap()
            .iter()
            .any(|(_, to)| *to == "connected"));
    }

    #[tokio::test]
    async fn second_connect_while_connecting_is_busy() {
        let gate = Arc::new(Notify::new());
        let connector = ScriptedConnector {
            gate: Some(gate.clone()),
            ..Default::default()
        };
        let (lifecycle, _) = harness(connector);
        let options = ConnectOptions::default();
        let first = lifecycle.connect(&options);
        let second = async {
            tokio::task::yield_now().await;
            let result = lifecycle.connect(&options).await;
            gate.notify_one();
            result
        };
        let (first, second) = tokio::join!(first, second);
        assert!(first.is_ok());
        assert!(matches!(second, Err(SessionError::Busy)));
    }

    #[tokio::test]
    async fn hydrate_restores_or_falls_back() {
        let connector = ScriptedConnector::default();
        *connector.restored.lock().unwrap() = Some(WalletSession::new("wallet-r"));
        let (lifecycle, recorder) = harness(connector);
        let restored = lifecycle.hydrate().await.unwrap();
        assert_eq!(restored.map(|s| s.identity).as_deref(), Some("wallet-r"));
        assert_eq!(
            *recorder.seen.lock().unwrap(),
            vec![("disconnected", "hydrating"), ("hydrating", "connected")]
        );

        let (empty, _) = harness(ScriptedConnector::default());
        assert_eq!(empty.hydrate().await.unwrap(), None);
        assert_eq!(empty.state(), SessionState::Disconnected);
    }

    #[test]
    fn hydration_never_redirects() {
        assert_eq!(
            guard_route(&SessionState::Hydrating, DASHBOARD_PATH),
            RouteDecision::Wait
        );
        assert_eq!(
            guard_route(&SessionState::Disconnected, DASHBOARD_PATH),
            RouteDecision::Redirect(LANDING_PATH)
        );
        assert_eq!(
            guard_route(
                &SessionState::Connected(WalletSession::new("w")),
                DASHBOARD_PATH
            ),
            RouteDecision::Render
        );
        assert_eq!(
            guard_route(&SessionState::Disconnected, "/ref/ref_alice"),
            RouteDecision::Render
        );
    }

    #[tokio::test]
    async fn route_guard_sends_user_home_on_logout() {
        let (lifecycle, _) = harness(ScriptedConnector::default());
        let navigator = Arc::new(HistoryNavigator::new());
        lifecycle.subscribe(Arc::new(RouteGuard::new(navigator.clone())));
        lifecycle.connect(&ConnectOptions::default()).await.unwrap();
        assert!(navigator.visited().is_empty());
        lifecycle.disconnect().await;
        assert_eq!(navigator.visited(), vec![LANDING_PATH.to_string()]);
    }
}
