use std::{
    sync::{Arc, Mutex, PoisonError},
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::storage::KeyValueStore;
use crate::token::{token_from_link, ReferralToken};

/// Tab-scoped key holding the pending capture.
pub const PENDING_KEY: &str = "pending_referral";

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PendingCapture {
    pub token: ReferralToken,
    pub captured_at_ms: u64,
}

/// Holds at most one referral token per tab until a session becomes active.
pub struct ReferralCapture {
    tab: Arc<dyn KeyValueStore>,
    // serializes read-then-clear in take_pending
    slot: Mutex<()>,
}

impl ReferralCapture {
    pub fn new(tab: Arc<dyn KeyValueStore>) -> Self {
        Self {
            tab,
            slot: Mutex::new(()),
        }
    }

    /// Stores a recognized token, replacing any earlier one. Returns whether
    /// the token was kept.
    pub fn capture(&self, raw: &str) -> bool {
        let Some(token) = ReferralToken::parse(raw) else {
            debug!(raw, "ignoring unrecognized referral token");
            return false;
        };
        let pending = PendingCapture {
            token,
            captured_at_ms: now_unix_ms(),
        };
        let encoded = match serde_json::to_string(&pending) {
            Ok(encoded) => encoded,
            Err(error) => {
                warn!(%error, "pending capture encode failed");
                return false;
            }
        };
        let _slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        match self.tab.write(PENDING_KEY, &encoded) {
            Ok(()) => {
                debug!(token = %pending.token, "referral token captured");
                true
            }
            Err(error) => {
                warn!(%error, "pending capture write failed");
                false
            }
        }
    }

    pub fn capture_link(&self, url: &str) -> bool {
        match token_from_link(url) {
            Some(token) => self.capture(token.as_str()),
            None => {
                debug!(url, "link carries no referral token");
                false
            }
        }
    }

    /// Destructive read: the slot is cleared before the token is returned,
    /// so a second call yields `None`.
    pub fn take_pending(&self) -> Option<ReferralToken> {
        let _slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        let raw = match self.tab.read(PENDING_KEY) {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(error) => {
                warn!(%error, "pending capture unreadable");
                return None;
            }
        };
        if let Err(error) = self.tab.remove(PENDING_KEY) {
            // a token that cannot be cleared could be credited twice
            warn!(%error, "pending capture could not be cleared, discarding it");
            return None;
        }
        decode_pending(&raw).map(|pending| pending.token)
    }

    pub fn peek_pending(&self) -> Option<PendingCapture> {
        let _slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        match self.tab.read(PENDING_KEY) {
            Ok(Some(raw)) => decode_pending(&raw),
            Ok(None) => None,
            Err(error) => {
                warn!(%error, "pending capture unreadable");
                None
            }
        }
    }
}

fn decode_pending(raw: &str) -> Option<PendingCapture> {
    if let Ok(pending) = serde_json::from_str::<PendingCapture>(raw) {
        return ReferralToken::parse(pending.token.as_str()).map(|_| pending);
    }
    // older clients stored the bare token string
    match ReferralToken::parse(raw.trim()) {
        Some(token) => Some(PendingCapture {
            token,
            captured_at_ms: 0,
        }),
        None => {
            warn!("pending capture corrupt, dropped");
            None
        }
    }
}

pub(crate) fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
