//! Local passkey-wallet stand-in.
//!
//! Implements the wallet-connection and signing capabilities with an
//! Ed25519 key held in memory, so the referral flow can run without the
//! hosted passkey portal or a relayer.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use tracing::debug;

use crate::claim::{message_digest, ClaimReceipt, MessageSigner, SignError, SignedMessage};
use crate::session::{ConnectError, ConnectOptions, WalletConnector, WalletSession};
use crate::token::Identity;

#[derive(Debug, thiserror::Error)]
pub enum WalletError {
    #[error("invalid secret key: {0}")]
    InvalidSecret(String),
    #[error("identity is not a wallet public key")]
    InvalidIdentity,
    #[error("malformed signature")]
    MalformedSignature,
    #[error("signature does not match the claim")]
    InvalidSignature,
    #[error("claim digest does not match its message")]
    DigestMismatch,
}

pub struct DevWallet {
    signing_key: SigningKey,
    display_name: Option<String>,
    connected: AtomicBool,
    fail_connect: AtomicBool,
    fail_sign: AtomicBool,
}

impl DevWallet {
    pub fn new(signing_key: SigningKey) -> Self {
        Self {
            signing_key,
            display_name: None,
            connected: AtomicBool::new(false),
            fail_connect: AtomicBool::new(false),
            fail_sign: AtomicBool::new(false),
        }
    }

    pub fn generate() -> Self {
        Self::new(SigningKey::generate(&mut OsRng))
    }

    pub fn from_secret_hex(sk_hex: &str) -> Result<Self, WalletError> {
        Ok(Self::new(parse_secret_hex(sk_hex)?))
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    /// Marks the wallet as already authenticated, as after returning from
    /// the passkey portal; `restore` will hand the session back.
    pub fn resumed(self) -> Self {
        self.connected.store(true, Ordering::SeqCst);
        self
    }

    pub fn set_fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_sign(&self, fail: bool) {
        self.fail_sign.store(fail, Ordering::SeqCst);
    }

    pub fn identity(&self) -> Identity {
        hex::encode(self.signing_key.verifying_key().as_bytes())
    }

    pub fn secret_hex(&self) -> String {
        hex::encode(self.signing_key.to_bytes())
    }

    fn session(&self) -> WalletSession {
        WalletSession {
            identity: self.identity(),
            display_name: self.display_name.clone(),
        }
    }
}

#[async_trait]
impl WalletConnector for DevWallet {
    async fn connect(&self, options: &ConnectOptions) -> Result<WalletSession, ConnectError> {
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(ConnectError::Cancelled);
        }
        debug!(fee_mode = ?options.fee_mode, identity = %self.identity(), "dev wallet connected");
        self.connected.store(true, Ordering::SeqCst);
        Ok(self.session())
    }

    async fn disconnect(&self) -> Result<(), ConnectError> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn restore(&self) -> Result<Option<WalletSession>, ConnectError> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(Some(self.session()))
        } else {
            Ok(None)
        }
    }
}

#[async_trait]
impl MessageSigner for DevWallet {
    async fn sign_message(&self, message: &str) -> Result<SignedMessage, SignError> {
        if self.fail_sign.load(Ordering::SeqCst) {
            return Err(SignError::Cancelled);
        }
        if !self.connected.load(Ordering::SeqCst) {
            return Err(SignError::Rejected("wallet not connected".into()));
        }
        let signature = self.signing_key.sign(message.as_bytes());
        Ok(SignedMessage {
            signature: general_purpose::STANDARD.encode(signature.to_bytes()),
        })
    }
}

pub fn parse_secret_hex(sk_hex: &str) -> Result<SigningKey, WalletError> {
    let bytes =
        hex::decode(sk_hex.trim()).map_err(|e| WalletError::InvalidSecret(e.to_string()))?;
    let arr: [u8; 32] = bytes
        .try_into()
        .map_err(|_| WalletError::InvalidSecret("expected 32 bytes (64 hex chars)".into()))?;
    Ok(SigningKey::from_bytes(&arr))
}

/// Checks a claim receipt against the wallet key its identity names.
pub fn verify_claim(receipt: &ClaimReceipt) -> Result<(), WalletError> {
    if hex::encode(message_digest(&receipt.message)) != receipt.digest {
        return Err(WalletError::DigestMismatch);
    }
    let key_bytes: [u8; 32] = hex::decode(&receipt.identity)
        .ok()
        .and_then(|b| b.try_into().ok())
        .ok_or(WalletError::InvalidIdentity)?;
    let key = VerifyingKey::from_bytes(&key_bytes).map_err(|_| WalletError::InvalidIdentity)?;
    let sig_bytes = general_purpose::STANDARD
        .decode(&receipt.signature)
        .map_err(|_| WalletError::MalformedSignature)?;
    let signature =
        Signature::from_slice(&sig_bytes).map_err(|_| WalletError::MalformedSignature)?;
    key.verify_strict(receipt.message.as_bytes(), &signature)
        .map_err(|_| WalletError::InvalidSignature)
}
