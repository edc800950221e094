//! Gasless welcome-badge claim.
//!
//! `claim` signs a fresh message through the wallet's signing capability;
//! the relayer sponsoring the fee is behind [`MessageSigner`].

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::capture::now_unix_ms;
use crate::session::SessionLifecycle;
use crate::token::Identity;

pub const CLAIM_MESSAGE_PREFIX: &str = "Claim referral badge for wallet: ";

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ClaimStatus {
    #[default]
    Unclaimed,
    Claiming,
    Claimed,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SignedMessage {
    pub signature: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClaimReceipt {
    pub identity: Identity,
    pub message: String,
    pub signature: String,
    /// sha256 of `message`, hex.
    pub digest: String,
}

#[derive(Debug, thiserror::Error)]
pub enum SignError {
    #[error("passkey prompt cancelled")]
    Cancelled,
    #[error("relayer rejected the request: {0}")]
    Rejected(String),
    #[error("signing service unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ClaimError {
    #[error("no connected wallet session")]
    NotConnected,
    #[error("session changed before the signature arrived")]
    Stale,
    #[error("signing failed: {0}")]
    Sign(#[from] SignError),
}

#[async_trait]
pub trait MessageSigner: Send + Sync {
    async fn sign_message(&self, message: &str) -> Result<SignedMessage, SignError>;
}

/// Binds the claim to the wallet and to a moment, so an old signed payload
/// cannot be replayed as a new claim.
pub fn claim_message(identity: &str, issued_at_ms: u64, nonce: &[u8; 16]) -> String {
    format!(
        "{CLAIM_MESSAGE_PREFIX}{identity}\nissued_at: {issued_at_ms}\nnonce: {}",
        hex::encode(nonce)
    )
}

pub fn message_digest(message: &str) -> [u8; 32] {
    Sha256::digest(message.as_bytes()).into()
}

struct ClaimSlot {
    epoch: u64,
    status: ClaimStatus,
}

pub struct ClaimGate {
    lifecycle: Arc<SessionLifecycle>,
    signer: Arc<dyn MessageSigner>,
    slot: Mutex<ClaimSlot>,
}

impl ClaimGate {
    pub fn new(lifecycle: Arc<SessionLifecycle>, signer: Arc<dyn MessageSigner>) -> Self {
        Self {
            lifecycle,
            signer,
            slot: Mutex::new(ClaimSlot {
                epoch: 0,
                status: ClaimStatus::Unclaimed,
            }),
        }
    }

    /// Status for the current session; a new session starts unclaimed.
    pub fn status(&self) -> ClaimStatus {
        let epoch = self.lifecycle.epoch();
        let slot = self.slot();
        if slot.epoch == epoch {
            slot.status
        } else {
            ClaimStatus::Unclaimed
        }
    }

    /// `Ok(None)` means a claim is already running or done for this session.
    pub async fn claim(&self) -> Result<Option<ClaimReceipt>, ClaimError> {
        let Some((epoch, session)) = self.lifecycle.active_session() else {
            return Err(ClaimError::NotConnected);
        };
        {
            let mut slot = self.slot();
            if slot.epoch != epoch {
                slot.epoch = epoch;
                slot.status = ClaimStatus::Unclaimed;
            }
            if slot.status != ClaimStatus::Unclaimed {
                debug!(status = ?slot.status, "claim already submitted");
                return Ok(None);
            }
            slot.status = ClaimStatus::Claiming;
        }

        let mut nonce = [0u8; 16];
        OsRng.fill_bytes(&mut nonce);
        let message = claim_message(&session.identity, now_unix_ms(), &nonce);
        let result = self.signer.sign_message(&message).await;

        let mut slot = self.slot();
        if slot.epoch != epoch || self.lifecycle.epoch() != epoch {
            debug!("discarding claim result from an earlier session");
            return Err(ClaimError::Stale);
        }
        match result {
            Ok(signed) => {
                slot.status = ClaimStatus::Claimed;
                let digest = hex::encode(message_digest(&message));
                info!(identity = %session.identity, %digest, "welcome badge claimed");
                Ok(Some(ClaimReceipt {
                    identity: session.identity,
                    message,
                    signature: signed.signature,
                    digest,
                }))
            }
            Err(error) => {
                slot.status = ClaimStatus::Unclaimed;
                warn!(%error, "badge claim failed");
                Err(error.into())
            }
        }
    }

    fn slot(&self) -> MutexGuard<'_, ClaimSlot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
