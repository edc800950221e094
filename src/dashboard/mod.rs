use serde::Serialize;

use crate::claim::ClaimStatus;
use crate::session::WalletSession;
use crate::store::ReferralStore;
use crate::token::{referral_link, Identity, ReferralToken};

pub const BADGE_POINTS: u32 = 100;
pub const INVITE_GOAL: usize = 3;

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct Task {
    pub id: u8,
    pub title: &'static str,
    pub completed: bool,
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct DashboardView {
    pub display_name: String,
    pub identity: Identity,
    pub short_identity: String,
    pub referral_link: String,
    pub referral_count: usize,
    pub referred: Vec<Identity>,
    pub referred_by: Option<Identity>,
    pub claim_status: ClaimStatus,
    pub tasks: Vec<Task>,
    pub points: u32,
}

impl DashboardView {
    pub fn build(
        session: &WalletSession,
        store: &ReferralStore,
        claim_status: ClaimStatus,
        origin: &str,
    ) -> Self {
        let identity = &session.identity;
        let referred = store.referred_by(identity);
        let badge_claimed = claim_status == ClaimStatus::Claimed;
        let tasks = vec![
            Task {
                id: 1,
                title: "Connect with Passkey",
                completed: true,
            },
            Task {
                id: 2,
                title: "Generate Referral Link",
                completed: true,
            },
            Task {
                id: 3,
                title: "Claim Welcome Badge",
                completed: badge_claimed,
            },
            Task {
                id: 4,
                title: "Invite 3 Friends",
                completed: referred.len() >= INVITE_GOAL,
            },
            Task {
                id: 5,
                title: "Complete First Quest",
                completed: false,
            },
        ];
        Self {
            display_name: session
                .display_name
                .clone()
                .filter(|n| !n.trim().is_empty())
                .unwrap_or_else(|| "User".to_string()),
            identity: identity.clone(),
            short_identity: short_identity(identity),
            referral_link: referral_link(origin, &ReferralToken::for_identity(identity)),
            referral_count: referred.len(),
            referred_by: store.referrer_of(identity),
            referred,
            claim_status,
            tasks,
            points: if badge_claimed { BADGE_POINTS } else { 0 },
        }
    }
}

/// `first6...last4`, or the identity itself when it is too short to elide.
pub fn short_identity(identity: &str) -> String {
    let chars: Vec<char> = identity.chars().collect();
    if chars.len() <= 10 {
        return identity.to_string();
    }
    let head: String = chars[..6].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}...{tail}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::storage::MemoryStore;

    #[test]
    fn view_reflects_graph_and_claim() {
        let store = ReferralStore::open(Arc::new(MemoryStore::new()));
        let me = "9xQeWvG816bUx9EPjHmaT23yvVM2ZWbrrpZb9PusVFin";
        store.record_referral("mentor", me);
        for friend in ["f1", "f2", "f3"] {
            store.record_referral(me, friend);
        }
        let session = WalletSession::new(me).with_display_name("Ada");
        let view = DashboardView::build(
            &session,
            &store,
            ClaimStatus::Claimed,
            "https://app.example",
        );
        assert_eq!(view.display_name, "Ada");
        assert_eq!(view.short_identity, "9xQeWv...VFin");
        assert_eq!(
            view.referral_link,
            format!("https://app.example/ref/ref_{me}")
        );
        assert_eq!(view.referral_count, 3);
        assert_eq!(view.referred_by.as_deref(), Some("mentor"));
        assert!(view.tasks.iter().all(|t| t.completed || t.id == 5));
        assert_eq!(view.points, BADGE_POINTS);
    }

    #[test]
    fn fresh_user_defaults() {
        let store = ReferralStore::open(Arc::new(MemoryStore::new()));
        let view = DashboardView::build(
            &WalletSession::new("abc"),
            &store,
            ClaimStatus::Unclaimed,
            "http://localhost:5173/",
        );
        assert_eq!(view.display_name, "User");
        assert_eq!(view.short_identity, "abc");
        assert_eq!(view.referral_link, "http://localhost:5173/ref/ref_abc");
        assert_eq!(view.points, 0);
        assert!(!view.tasks[2].completed);
        assert!(!view.tasks[3].completed);
    }
}
