//! Referral attribution.
//!
//! Runs once per connect edge: consumes the tab's pending token, credits the
//! referrer, then hands the user to the dashboard. The identity always comes
//! from the transition being handled.

use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, info};

use crate::capture::ReferralCapture;
use crate::session::{Navigator, SessionObserver, SessionState, Transition, DASHBOARD_PATH};
use crate::store::ReferralStore;
use crate::token::Identity;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Attribution {
    /// The referrer was credited with this signup.
    Credited { referrer: Identity },
    /// A token was consumed but the store kept its earlier state
    /// (self-referral or user already attributed).
    Ignored { referrer: Identity },
    /// No pending token.
    Organic,
}

pub struct AttributionEngine {
    store: Arc<ReferralStore>,
    capture: Arc<ReferralCapture>,
    navigator: Arc<dyn Navigator>,
    // identity handled for the current connected stretch
    latched: Mutex<Option<Identity>>,
}

impl AttributionEngine {
    pub fn new(
        store: Arc<ReferralStore>,
        capture: Arc<ReferralCapture>,
        navigator: Arc<dyn Navigator>,
    ) -> Self {
        Self {
            store,
            capture,
            navigator,
            latched: Mutex::new(None),
        }
    }

    /// Handles a session that has just become active. Returns `None` when
    /// this connected stretch was already handled.
    pub fn on_connected(&self, identity: &str) -> Option<Attribution> {
        {
            let mut latched = self.latched.lock().unwrap_or_else(PoisonError::into_inner);
            if latched.is_some() {
                debug!(identity, "already attributed for this session");
                return None;
            }
            *latched = Some(identity.to_string());
        }
        let outcome = self.reconcile(identity);
        self.navigator.navigate(DASHBOARD_PATH);
        Some(outcome)
    }

    pub fn on_disconnected(&self) {
        self.latched
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    fn reconcile(&self, identity: &str) -> Attribution {
        let Some(token) = self.capture.take_pending() else {
            debug!(identity, "organic signup");
            return Attribution::Organic;
        };
        let referrer = token.referrer_identity().to_string();
        if self.store.record_referral(&referrer, identity) {
            info!(%referrer, referred = identity, "signup attributed");
            Attribution::Credited { referrer }
        } else {
            debug!(%referrer, referred = identity, "referral token consumed without credit");
            Attribution::Ignored { referrer }
        }
    }
}

impl SessionObserver for AttributionEngine {
    fn on_transition(&self, transition: &Transition) {
        if let Some(session) = transition.connected_edge() {
            self.on_connected(&session.identity);
        } else if transition.to == SessionState::Disconnected {
            self.on_disconnected();
        }
    }
}
