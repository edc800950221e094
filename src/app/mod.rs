//! Wires the referral components around one wallet capability.

use std::sync::Arc;

use crate::attribution::AttributionEngine;
use crate::capture::ReferralCapture;
use crate::claim::{ClaimGate, MessageSigner};
use crate::dashboard::DashboardView;
use crate::session::{Navigator, RouteGuard, SessionLifecycle, WalletConnector};
use crate::storage::KeyValueStore;
use crate::store::ReferralStore;

pub struct ReferralApp {
    pub store: Arc<ReferralStore>,
    pub capture: Arc<ReferralCapture>,
    pub lifecycle: Arc<SessionLifecycle>,
    pub attribution: Arc<AttributionEngine>,
    pub claim: ClaimGate,
    origin: String,
}

impl ReferralApp {
    pub fn new(
        durable: Arc<dyn KeyValueStore>,
        tab: Arc<dyn KeyValueStore>,
        connector: Arc<dyn WalletConnector>,
        signer: Arc<dyn MessageSigner>,
        navigator: Arc<dyn Navigator>,
        origin: impl Into<String>,
    ) -> Self {
        let store = Arc::new(ReferralStore::open(durable));
        let capture = Arc::new(ReferralCapture::new(tab));
        let lifecycle = Arc::new(SessionLifecycle::new(connector));
        let attribution = Arc::new(AttributionEngine::new(
            store.clone(),
            capture.clone(),
            navigator.clone(),
        ));
        lifecycle.subscribe(attribution.clone());
        lifecycle.subscribe(Arc::new(RouteGuard::new(navigator)));
        let claim = ClaimGate::new(lifecycle.clone(), signer);
        Self {
            store,
            capture,
            lifecycle,
            attribution,
            claim,
            origin: origin.into(),
        }
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// `None` unless a session is connected.
    pub fn dashboard(&self) -> Option<DashboardView> {
        let session = self.lifecycle.current_session()?;
        Some(DashboardView::build(
            &session,
            &self.store,
            self.claim.status(),
            &self.origin,
        ))
    }
}
