//! Referral capture and attribution for passkey wallets.
//!
//! A visitor arrives on `origin/ref/ref_<identity>`; the token is parked in
//! tab-scoped storage ([`capture`]) while the passkey login runs. When the
//! wallet session first becomes active ([`session`]), the attribution
//! engine ([`attribution`]) consumes the token and credits the referrer in
//! the device-local referral graph ([`store`]). The connected user can then
//! claim a welcome badge by signing a fee-sponsored message ([`claim`]).
//!
//! The wallet service, relayer and router are consumed through traits;
//! [`wallet`] provides a local Ed25519 stand-in for demos and tests.

pub mod app;
pub mod attribution;
pub mod capture;
pub mod claim;
pub mod config;
pub mod dashboard;
pub mod session;
pub mod storage;
pub mod store;
pub mod token;
pub mod wallet;

pub use app::ReferralApp;
pub use attribution::{Attribution, AttributionEngine};
pub use capture::{PendingCapture, ReferralCapture};
pub use claim::{ClaimError, ClaimGate, ClaimReceipt, ClaimStatus, MessageSigner, SignError};
pub use config::Config;
pub use session::{
    ConnectError, ConnectOptions, Navigator, SessionError, SessionLifecycle, SessionState,
    WalletConnector, WalletSession,
};
pub use storage::{FileStore, KeyValueStore, MemoryStore, StorageError};
pub use store::{ReferralGraph, ReferralStore};
pub use token::{referral_link, token_from_link, ReferralToken};
